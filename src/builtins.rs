//! Builtin binder: registers the native class hierarchy, the exception
//! taxonomy, and the builtin functions, then runs a small prelude written in
//! the Language itself to define the iterator classes, `range`, `slice`, and
//! the collection helpers on top of the native surface.

use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, ExceptionKind, Raised};
use crate::runtime::object::{ObjId, Payload, display_type_name};

pub(crate) mod classes;
pub(crate) mod exceptions;
pub(crate) mod mapping;
pub(crate) mod modules;
pub(crate) mod number;
pub(crate) mod sequence;

/// Language-level tail of the builtin library. Runs in module
/// `__builtins__` after native registration; everything it defines becomes a
/// builtin global. Iteration uses `__next__` raising StopIteration.
const PRELUDE: &str = r#"
class __SeqIter:
    def __init__(self, seq):
        self._seq = seq
        self._i = 0
    def __iter__(self):
        return self
    def __next__(self):
        if self._i >= len(self._seq):
            raise StopIteration()
        value = self._seq[self._i]
        self._i = self._i + 1
        return value

class __RangeIter:
    def __init__(self, current, stop, step):
        self._current = current
        self._stop = stop
        self._step = step
    def __iter__(self):
        return self
    def __next__(self):
        current = self._current
        if self._step >= 0:
            if current >= self._stop:
                raise StopIteration()
        elif current <= self._stop:
            raise StopIteration()
        self._current = current + self._step
        return current

class range:
    def __init__(self, start, stop=None, step=None):
        if stop is None:
            self.start = 0
            self.stop = start
            self.step = 1
        elif step is None:
            self.start = start
            self.stop = stop
            self.step = 1
        else:
            self.start = start
            self.stop = stop
            self.step = step
    def __iter__(self):
        return __RangeIter(self.start, self.stop, self.step)
    def __contains__(self, value):
        for candidate in self:
            if candidate == value:
                return True
        return False

class slice:
    def __init__(self, start, stop, step):
        self.start = start
        self.stop = stop
        self.step = step

set_class_attr(list, "__iter__", lambda self: __SeqIter(self))
set_class_attr(tuple, "__iter__", lambda self: __SeqIter(self))
set_class_attr(str, "__iter__", lambda self: __SeqIter(self))
set_class_attr(dict, "__iter__", lambda self: __SeqIter(self.keys()))
set_class_attr(set, "__iter__", lambda self: __SeqIter(list(self)))

def sum(values, start=0):
    total = start
    for value in values:
        total = total + value
    return total

def enumerate(values, start=0):
    result = []
    index = start
    for value in values:
        result.append((index, value))
        index = index + 1
    return result

def zip(left, right):
    result = []
    left_iter = left.__iter__()
    right_iter = right.__iter__()
    while True:
        try:
            first = left_iter.__next__()
            second = right_iter.__next__()
        except StopIteration:
            break
        result.append((first, second))
    return result

def map(function, values):
    return [function(value) for value in values]

def filter(function, values):
    result = []
    for value in values:
        if function(value):
            result.append(value)
    return result

def reversed(values):
    result = []
    index = len(values) - 1
    while index >= 0:
        result.append(values[index])
        index = index - 1
    return result

def sorted(values, reverse=False):
    result = list(values)
    index = 1
    while index < len(result):
        position = index
        while position > 0 and result[position] < result[position - 1]:
            swapped = result[position]
            result[position] = result[position - 1]
            result[position - 1] = swapped
            position = position - 1
        index = index + 1
    if reverse:
        result = reversed(result)
    return result
"#;

/// Registers the native classes and the isinstance primitive on a fresh
/// context. The `__builtins__` module loader publishes everything as globals
/// and runs the prelude.
pub(crate) fn register(ctx: &mut Context) {
    // Bootstrap allocates builtin structure in a fixed order; keep the
    // collector out until the roots are in place, and exempt the builtin
    // structure itself from the host allocation cap.
    ctx.lock_gc = true;
    ctx.alloc_cap_exempt = true;

    let none_tag = ctx.tags.null.clone();
    ctx.builtins.none = ctx
        .alloc(none_tag, Payload::Null)
        .expect("bootstrap allocation is cap-exempt");

    classes::register(ctx);
    number::register(ctx);
    sequence::register(ctx);
    mapping::register(ctx);
    exceptions::register(ctx);

    ctx.builtins.isinstance_fn = ctx
        .new_function(isinstance_native, "isinstance")
        .expect("bootstrap allocation is cap-exempt");

    ctx.alloc_cap_exempt = false;
    ctx.lock_gc = false;
}

/// Loader for the `__builtins__` module: publishes the native surface as
/// module globals and executes the prelude.
pub(crate) fn load_builtins_module(ctx: &mut Context) -> Exec<()> {
    let class_globals = [
        ("object", ctx.builtins.object_class),
        ("NoneType", ctx.builtins.none_class),
        ("bool", ctx.builtins.bool_class),
        ("int", ctx.builtins.int_class),
        ("float", ctx.builtins.float_class),
        ("str", ctx.builtins.str_class),
        ("tuple", ctx.builtins.tuple_class),
        ("list", ctx.builtins.list_class),
        ("dict", ctx.builtins.dict_class),
        ("set", ctx.builtins.set_class),
        ("function", ctx.builtins.func_class),
    ];
    for (name, class) in class_globals {
        ctx.set_global(name, class);
    }

    for kind in ExceptionKind::ALL {
        let class = ctx.builtins.exception_class(kind);
        ctx.set_global(kind.name(), class);
    }

    let isinstance_fn = ctx.builtins.isinstance_fn;
    ctx.set_global("isinstance", isinstance_fn);

    let functions: [(&str, crate::runtime::object::NativeFn); 13] = [
        ("print", print_native),
        ("len", len_native),
        ("repr", repr_native),
        ("hasattr", hasattr_native),
        ("getattr", getattr_native),
        ("setattr", setattr_native),
        ("abs", abs_native),
        ("min", min_native),
        ("max", max_native),
        ("ord", ord_native),
        ("chr", chr_native),
        ("id", id_native),
        ("set_class_attr", set_class_attr_native),
    ];
    for (name, fptr) in functions {
        let function = ctx.new_function(fptr, name)?;
        ctx.set_global(name, function);
    }

    let prelude = ctx.compile_in_module(PRELUDE, "__builtins__", "<builtins>", false)?;
    ctx.protect(prelude);
    let result = ctx.call(prelude, &[], None);
    ctx.unprotect(prelude);
    result?;

    if let Some(slice_class) = ctx.builtin_global("slice") {
        ctx.builtins.slice_class = slice_class;
    }
    Ok(())
}

// ----- shared helpers -----

pub(crate) fn expect_arity(ctx: &mut Context, args: &[ObjId], expected: usize) -> Exec<()> {
    if args.len() != expected {
        ctx.raise_argument_count_error(args.len(), Some(expected));
        return Err(Raised);
    }
    Ok(())
}

pub(crate) fn expect_arity_range(
    ctx: &mut Context,
    args: &[ObjId],
    min: usize,
    max: usize,
) -> Exec<()> {
    if args.len() < min || args.len() > max {
        ctx.raise_argument_count_error(args.len(), Some(min));
        return Err(Raised);
    }
    Ok(())
}

/// Structural value equality: numbers compare across int/float/bool, strings
/// and nested sequences compare element-wise, instances fall back to their
/// `__eq__`, everything else compares by identity.
pub(crate) fn values_equal(ctx: &mut Context, left: ObjId, right: ObjId) -> Exec<bool> {
    if left == right {
        return Ok(true);
    }

    enum Shape {
        Num(f64),
        Str,
        Seq(Vec<ObjId>, Vec<ObjId>),
        Instance,
        Other,
    }

    let shape = match (&ctx.obj(left).payload, &ctx.obj(right).payload) {
        (Payload::Null, Payload::Null) => return Ok(true),
        (
            Payload::Int(_) | Payload::Float(_) | Payload::Bool(_),
            Payload::Int(_) | Payload::Float(_) | Payload::Bool(_),
        ) => Shape::Num(number::numeric_value(ctx, left).unwrap_or(f64::NAN)),
        (Payload::Str(a), Payload::Str(b)) => {
            if a == b {
                return Ok(true);
            }
            Shape::Str
        }
        (Payload::Tuple(a), Payload::Tuple(b)) | (Payload::List(a), Payload::List(b)) => {
            Shape::Seq(a.clone(), b.clone())
        }
        (Payload::Instance, _) => Shape::Instance,
        _ => Shape::Other,
    };

    match shape {
        Shape::Num(a) => {
            let b = number::numeric_value(ctx, right).unwrap_or(f64::NAN);
            Ok(a == b)
        }
        Shape::Str => Ok(false),
        Shape::Seq(a, b) => {
            if a.len() != b.len() {
                return Ok(false);
            }
            for (x, y) in a.into_iter().zip(b) {
                if !values_equal(ctx, x, y)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Shape::Instance => {
            let Some(eq) = ctx.has_attribute(left, "__eq__")? else {
                return Ok(false);
            };
            let result = ctx.call(eq, &[right], None)?;
            match ctx.obj(result).payload {
                Payload::Bool(value) => Ok(value),
                _ => Ok(false),
            }
        }
        Shape::Other => Ok(false),
    }
}

// ----- builtin functions -----

fn print_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let kwargs = ctx.kwargs()?;
    let parsed = ctx.parse_kwargs(kwargs, &["sep", "end"])?;
    let sep = match parsed[0] {
        Some(sep) => ctx.str_of(sep)?,
        None => " ".to_string(),
    };
    let end = match parsed[1] {
        Some(end) => ctx.str_of(end)?,
        None => "\n".to_string(),
    };

    let mut rendered = Vec::with_capacity(args.len());
    for &arg in args {
        rendered.push(ctx.str_of(arg)?);
    }
    let text = format!("{}{}", rendered.join(&sep), end);
    ctx.print_out(&text);
    Ok(ctx.new_none())
}

fn len_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let result = ctx.call_method(args[0], "__len__", &[])?;
    if !ctx.is_int(result) {
        ctx.raise_exception(
            ExceptionKind::TypeError,
            "__len__() returned a non int type",
        );
        return Err(Raised);
    }
    Ok(result)
}

fn repr_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let rendered = ctx.repr_of(args[0])?;
    ctx.new_string(&rendered)
}

fn isinstance_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let classes: Vec<ObjId> = match &ctx.obj(args[1]).payload {
        Payload::Tuple(items) => items.clone(),
        Payload::Class(_) => vec![args[1]],
        _ => {
            ctx.raise_exception(
                ExceptionKind::TypeError,
                "isinstance() arg 2 must be a type or tuple of types",
            );
            return Err(Raised);
        }
    };
    for &class in &classes {
        if !ctx.is_class(class) {
            ctx.raise_exception(
                ExceptionKind::TypeError,
                "isinstance() arg 2 must be a type or tuple of types",
            );
            return Err(Raised);
        }
    }
    let matched = ctx.is_instance(args[0], &classes).is_some();
    Ok(ctx.new_bool(matched))
}

fn hasattr_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let name = string_argument(ctx, args, 1)?;
    let found = ctx.has_attribute(args[0], &name)?.is_some();
    Ok(ctx.new_bool(found))
}

fn getattr_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity_range(ctx, args, 2, 3)?;
    let name = string_argument(ctx, args, 1)?;
    match ctx.has_attribute(args[0], &name)? {
        Some(value) => Ok(value),
        None => match args.get(2) {
            Some(&default) => Ok(default),
            None => {
                ctx.raise_attribute_error(args[0], &name);
                Err(Raised)
            }
        },
    }
}

fn setattr_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 3)?;
    let name = string_argument(ctx, args, 1)?;
    ctx.set_attribute(args[0], &name, args[2]);
    Ok(ctx.new_none())
}

fn abs_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    match ctx.obj(args[0]).payload {
        Payload::Int(value) => match value.checked_abs() {
            Some(value) => ctx.new_int(value),
            None => {
                ctx.raise_exception(ExceptionKind::OverflowError, "int absolute value overflow");
                Err(Raised)
            }
        },
        Payload::Float(value) => ctx.new_float(value.abs()),
        Payload::Bool(value) => ctx.new_int(i64::from(value)),
        _ => {
            ctx.raise_argument_type_error(0, "int or float");
            Err(Raised)
        }
    }
}

fn min_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    extremum(ctx, args, false)
}

fn max_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    extremum(ctx, args, true)
}

fn extremum(ctx: &mut Context, args: &[ObjId], largest: bool) -> Exec<ObjId> {
    let items = match args.len() {
        0 => {
            ctx.raise_argument_count_error(0, Some(1));
            return Err(Raised);
        }
        1 => ctx.iterate_collect(args[0])?,
        _ => args.to_vec(),
    };
    let Some(&first) = items.first() else {
        ctx.raise_exception(ExceptionKind::ValueError, "arg is an empty sequence");
        return Err(Raised);
    };

    // Comparison methods may allocate; the candidates live only in this
    // buffer.
    for &item in &items {
        ctx.protect(item);
    }
    let result = (|| -> Exec<ObjId> {
        let mut best = first;
        for &item in &items[1..] {
            let (lhs, rhs) = if largest { (best, item) } else { (item, best) };
            let less = ctx.call_method(lhs, "__lt__", &[rhs])?;
            if ctx.truthify(less)? {
                best = item;
            }
        }
        Ok(best)
    })();
    for &item in &items {
        ctx.unprotect(item);
    }
    result
}

fn ord_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let text = string_argument(ctx, args, 0)?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => ctx.new_int(c as i64),
        _ => {
            ctx.raise_exception(
                ExceptionKind::TypeError,
                "ord() expected a character string of length 1",
            );
            Err(Raised)
        }
    }
}

fn chr_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let Payload::Int(value) = ctx.obj(args[0]).payload else {
        ctx.raise_argument_type_error(0, "int");
        return Err(Raised);
    };
    let c = u32::try_from(value).ok().and_then(char::from_u32);
    match c {
        Some(c) => ctx.new_string(&c.to_string()),
        None => {
            ctx.raise_exception(ExceptionKind::ValueError, "chr() arg not in range");
            Err(Raised)
        }
    }
}

fn id_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    ctx.new_int(args[0].index() as i64)
}

/// Prelude hook attaching Language-level methods to native classes
/// (iterator entry points in particular).
fn set_class_attr_native(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 3)?;
    if !ctx.is_class(args[0]) {
        ctx.raise_argument_type_error(0, "class");
        return Err(Raised);
    }
    let name = string_argument(ctx, args, 1)?;
    if let Payload::Func(func) = &mut ctx.obj_mut(args[2]).payload {
        func.is_method = true;
    }
    ctx.add_attribute_to_class(args[0], &name, args[2]);
    Ok(ctx.new_none())
}

pub(crate) fn string_argument(ctx: &mut Context, args: &[ObjId], index: usize) -> Exec<String> {
    match &ctx.obj(args[index]).payload {
        Payload::Str(value) => Ok(value.clone()),
        _ => {
            ctx.raise_argument_type_error(index, "str");
            Err(Raised)
        }
    }
}

pub(crate) fn type_name_of(ctx: &Context, id: ObjId) -> String {
    display_type_name(&ctx.obj(id).type_name).to_string()
}
