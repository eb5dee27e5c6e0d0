//! Sequence classes: `str`, `tuple`, and `list`, plus the index and slice
//! arithmetic they share. Slices arrive as instances of the prelude-defined
//! `slice` class carrying `start`/`stop`/`step` attributes.

use crate::builtins::{expect_arity, expect_arity_range, string_argument, values_equal};
use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, ExceptionKind, Raised};
use crate::runtime::object::{ObjId, Payload};

pub(crate) fn register(ctx: &mut Context) {
    let str_class = ctx.new_class("str", &[]).expect("str class allocation");
    ctx.builtins.str_class = str_class;
    ctx.set_class_ctor(str_class, str_ctor);
    ctx.bind_method(str_class, "__len__", seq_len);
    ctx.bind_method(str_class, "__getitem__", str_getitem);
    ctx.bind_method(str_class, "__add__", str_add);
    ctx.bind_method(str_class, "__mul__", str_mul);
    ctx.bind_method(str_class, "__contains__", str_contains);
    ctx.bind_method(str_class, "__eq__", str_eq);
    ctx.bind_method(str_class, "__ne__", str_ne);
    ctx.bind_method(str_class, "__lt__", str_lt);
    ctx.bind_method(str_class, "__le__", str_le);
    ctx.bind_method(str_class, "__gt__", str_gt);
    ctx.bind_method(str_class, "__ge__", str_ge);
    ctx.bind_method(str_class, "upper", str_upper);
    ctx.bind_method(str_class, "lower", str_lower);
    ctx.bind_method(str_class, "strip", str_strip);
    ctx.bind_method(str_class, "split", str_split);
    ctx.bind_method(str_class, "join", str_join);
    ctx.bind_method(str_class, "startswith", str_startswith);
    ctx.bind_method(str_class, "endswith", str_endswith);
    ctx.bind_method(str_class, "find", str_find);
    ctx.bind_method(str_class, "replace", str_replace);

    let tuple_class = ctx.new_class("tuple", &[]).expect("tuple class allocation");
    ctx.builtins.tuple_class = tuple_class;
    ctx.set_class_ctor(tuple_class, tuple_ctor);
    ctx.bind_method(tuple_class, "__len__", seq_len);
    ctx.bind_method(tuple_class, "__getitem__", tuple_getitem);
    ctx.bind_method(tuple_class, "__add__", tuple_add);
    ctx.bind_method(tuple_class, "__eq__", seq_eq);
    ctx.bind_method(tuple_class, "__ne__", seq_ne);
    ctx.bind_method(tuple_class, "__contains__", seq_contains);

    let list_class = ctx.new_class("list", &[]).expect("list class allocation");
    ctx.builtins.list_class = list_class;
    ctx.set_class_ctor(list_class, list_ctor);
    ctx.bind_method(list_class, "__len__", seq_len);
    ctx.bind_method(list_class, "__getitem__", list_getitem);
    ctx.bind_method(list_class, "__setitem__", list_setitem);
    ctx.bind_method(list_class, "__add__", list_add);
    ctx.bind_method(list_class, "__mul__", list_mul);
    ctx.bind_method(list_class, "__eq__", seq_eq);
    ctx.bind_method(list_class, "__ne__", seq_ne);
    ctx.bind_method(list_class, "__contains__", seq_contains);
    ctx.bind_method(list_class, "append", list_append);
    ctx.bind_method(list_class, "extend", list_extend);
    ctx.bind_method(list_class, "insert", list_insert);
    ctx.bind_method(list_class, "pop", list_pop);
    ctx.bind_method(list_class, "remove", list_remove);
    ctx.bind_method(list_class, "index", list_index);
    ctx.bind_method(list_class, "count", list_count);
    ctx.bind_method(list_class, "reverse", list_reverse);
}

// ----- index and slice helpers -----

/// Resolves a (possibly negative) index against a sequence length.
pub(crate) fn normalize_index(ctx: &mut Context, index: i64, len: usize) -> Exec<usize> {
    let len = len as i64;
    let resolved = if index < 0 { index + len } else { index };
    if resolved < 0 || resolved >= len {
        ctx.raise_index_error();
        return Err(Raised);
    }
    Ok(resolved as usize)
}

/// Reads the bounds off a slice instance; `None` when the argument is not a
/// slice.
pub(crate) fn as_slice_bounds(
    ctx: &mut Context,
    id: ObjId,
) -> Exec<Option<(Option<i64>, Option<i64>, Option<i64>)>> {
    let slice_class = ctx.builtins.slice_class;
    if !ctx.is_class(slice_class) || ctx.is_instance(id, &[slice_class]).is_none() {
        return Ok(None);
    }
    let mut bounds = [None, None, None];
    for (slot, name) in bounds.iter_mut().zip(["start", "stop", "step"]) {
        let Some(value) = ctx.obj(id).attributes.get(name) else {
            continue;
        };
        match ctx.obj(value).payload {
            Payload::Null => {}
            Payload::Int(value) => *slot = Some(value),
            _ => {
                ctx.raise_exception(
                    ExceptionKind::TypeError,
                    "slice indices must be integers or None",
                );
                return Err(Raised);
            }
        }
    }
    let [start, stop, step] = bounds;
    Ok(Some((start, stop, step)))
}

/// Expands slice bounds into the element indices it selects, with Python's
/// clamping rules.
pub(crate) fn slice_index_list(
    ctx: &mut Context,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
    len: usize,
) -> Exec<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        ctx.raise_exception(ExceptionKind::ValueError, "slice step cannot be zero");
        return Err(Raised);
    }

    let len = len as i64;
    let mut indices = Vec::new();
    if step > 0 {
        let clamp = |value: i64| {
            if value < 0 {
                (value + len).max(0)
            } else {
                value.min(len)
            }
        };
        let mut index = clamp(start.unwrap_or(0));
        let stop = clamp(stop.unwrap_or(len));
        while index < stop {
            indices.push(index as usize);
            index += step;
        }
    } else {
        let clamp = |value: i64| {
            if value < 0 {
                (value + len).max(-1)
            } else {
                value.min(len - 1)
            }
        };
        let mut index = clamp(start.unwrap_or(len - 1));
        let stop = match stop {
            Some(stop) => clamp(stop),
            None => -1,
        };
        while index > stop {
            indices.push(index as usize);
            index += step;
        }
    }
    Ok(indices)
}

fn index_argument(ctx: &mut Context, args: &[ObjId], position: usize) -> Exec<i64> {
    match ctx.obj(args[position]).payload {
        Payload::Int(value) => Ok(value),
        Payload::Bool(value) => Ok(i64::from(value)),
        _ => {
            ctx.raise_argument_type_error(position, "int");
            Err(Raised)
        }
    }
}

fn list_items(ctx: &mut Context, id: ObjId, position: usize) -> Exec<Vec<ObjId>> {
    match &ctx.obj(id).payload {
        Payload::List(items) => Ok(items.clone()),
        _ => {
            ctx.raise_argument_type_error(position, "list");
            Err(Raised)
        }
    }
}

fn str_value(ctx: &mut Context, args: &[ObjId], position: usize) -> Exec<String> {
    string_argument(ctx, args, position)
}

// ----- str -----

fn str_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        return ctx.new_string("");
    }
    expect_arity(ctx, args, 1)?;
    let rendered = ctx.str_of(args[0])?;
    ctx.new_string(&rendered)
}

/// Shared `__len__` for every builtin container; strings count characters.
pub(crate) fn seq_len(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let len = match &ctx.obj(args[0]).payload {
        Payload::Str(value) => value.chars().count(),
        Payload::Tuple(items) | Payload::List(items) => items.len(),
        Payload::Dict(entries) => entries.len(),
        Payload::Set(entries) => entries.len(),
        _ => {
            ctx.raise_argument_type_error(0, "sized collection");
            return Err(Raised);
        }
    };
    ctx.new_int(len as i64)
}

fn str_getitem(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let text: Vec<char> = str_value(ctx, args, 0)?.chars().collect();

    if let Some((start, stop, step)) = as_slice_bounds(ctx, args[1])? {
        let indices = slice_index_list(ctx, start, stop, step, text.len())?;
        let selected: String = indices.into_iter().map(|index| text[index]).collect();
        return ctx.new_string(&selected);
    }

    let index = index_argument(ctx, args, 1)?;
    let index = normalize_index(ctx, index, text.len())?;
    ctx.new_string(&text[index].to_string())
}

fn str_add(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let left = str_value(ctx, args, 0)?;
    let right = str_value(ctx, args, 1)?;
    let joined = format!("{left}{right}");
    ctx.check_collection_size(joined.len())?;
    ctx.new_string(&joined)
}

fn str_mul(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let text = str_value(ctx, args, 0)?;
    let count = index_argument(ctx, args, 1)?.max(0) as usize;
    ctx.check_collection_size(text.len().saturating_mul(count))?;
    ctx.new_string(&text.repeat(count))
}

fn str_contains(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let haystack = str_value(ctx, args, 0)?;
    let needle = str_value(ctx, args, 1)?;
    Ok(ctx.new_bool(haystack.contains(&needle)))
}

fn str_compare(
    ctx: &mut Context,
    args: &[ObjId],
    accept: fn(std::cmp::Ordering) -> bool,
) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let left = str_value(ctx, args, 0)?;
    let right = str_value(ctx, args, 1)?;
    Ok(ctx.new_bool(accept(left.cmp(&right))))
}

fn str_eq(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let left = str_value(ctx, args, 0)?;
    let equal = matches!(&ctx.obj(args[1]).payload, Payload::Str(right) if *right == left);
    Ok(ctx.new_bool(equal))
}

fn str_ne(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let equal = str_eq(ctx, args)?;
    let value = ctx.get_bool(equal);
    Ok(ctx.new_bool(!value))
}

fn str_lt(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    str_compare(ctx, args, |ordering| ordering == std::cmp::Ordering::Less)
}

fn str_le(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    str_compare(ctx, args, |ordering| ordering != std::cmp::Ordering::Greater)
}

fn str_gt(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    str_compare(ctx, args, |ordering| ordering == std::cmp::Ordering::Greater)
}

fn str_ge(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    str_compare(ctx, args, |ordering| ordering != std::cmp::Ordering::Less)
}

fn str_upper(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let text = str_value(ctx, args, 0)?.to_uppercase();
    ctx.new_string(&text)
}

fn str_lower(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let text = str_value(ctx, args, 0)?.to_lowercase();
    ctx.new_string(&text)
}

fn str_strip(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let text = str_value(ctx, args, 0)?;
    ctx.new_string(text.trim())
}

fn str_split(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity_range(ctx, args, 1, 2)?;
    let text = str_value(ctx, args, 0)?;
    let parts: Vec<String> = match args.get(1) {
        Some(_) => {
            let separator = str_value(ctx, args, 1)?;
            if separator.is_empty() {
                ctx.raise_exception(ExceptionKind::ValueError, "empty separator");
                return Err(Raised);
            }
            text.split(&separator).map(str::to_string).collect()
        }
        None => text.split_whitespace().map(str::to_string).collect(),
    };
    let mut items = Vec::with_capacity(parts.len());
    for part in &parts {
        let item = ctx.new_string(part)?;
        ctx.protect(item);
        items.push(item);
    }
    let list = ctx.new_list(&items);
    for &item in &items {
        ctx.unprotect(item);
    }
    list
}

fn str_join(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let separator = str_value(ctx, args, 0)?;
    let items = ctx.iterate_collect(args[1])?;
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        match &ctx.obj(item).payload {
            Payload::Str(value) => parts.push(value.clone()),
            _ => {
                ctx.raise_exception(
                    ExceptionKind::TypeError,
                    "join() requires string elements",
                );
                return Err(Raised);
            }
        }
    }
    ctx.new_string(&parts.join(&separator))
}

fn str_startswith(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let text = str_value(ctx, args, 0)?;
    let prefix = str_value(ctx, args, 1)?;
    Ok(ctx.new_bool(text.starts_with(&prefix)))
}

fn str_endswith(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let text = str_value(ctx, args, 0)?;
    let suffix = str_value(ctx, args, 1)?;
    Ok(ctx.new_bool(text.ends_with(&suffix)))
}

fn str_find(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let text = str_value(ctx, args, 0)?;
    let needle = str_value(ctx, args, 1)?;
    let position = match text.find(&needle) {
        Some(byte_position) => text[..byte_position].chars().count() as i64,
        None => -1,
    };
    ctx.new_int(position)
}

fn str_replace(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 3)?;
    let text = str_value(ctx, args, 0)?;
    let from = str_value(ctx, args, 1)?;
    let to = str_value(ctx, args, 2)?;
    ctx.new_string(&text.replace(&from, &to))
}

// ----- tuple -----

fn tuple_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        return ctx.new_tuple(&[]);
    }
    expect_arity(ctx, args, 1)?;
    let items = collection_items(ctx, args[0])?;
    ctx.new_tuple(&items)
}

fn tuple_getitem(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let items = match &ctx.obj(args[0]).payload {
        Payload::Tuple(items) => items.clone(),
        _ => {
            ctx.raise_argument_type_error(0, "tuple");
            return Err(Raised);
        }
    };
    if let Some((start, stop, step)) = as_slice_bounds(ctx, args[1])? {
        let indices = slice_index_list(ctx, start, stop, step, items.len())?;
        let selected: Vec<ObjId> = indices.into_iter().map(|index| items[index]).collect();
        return ctx.new_tuple(&selected);
    }
    let index = index_argument(ctx, args, 1)?;
    let index = normalize_index(ctx, index, items.len())?;
    Ok(items[index])
}

fn tuple_add(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let (left, right) = match (&ctx.obj(args[0]).payload, &ctx.obj(args[1]).payload) {
        (Payload::Tuple(a), Payload::Tuple(b)) => (a.clone(), b.clone()),
        _ => {
            ctx.raise_argument_type_error(1, "tuple");
            return Err(Raised);
        }
    };
    let mut joined = left;
    joined.extend(right);
    ctx.new_tuple(&joined)
}

// ----- list -----

fn list_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        return ctx.new_list(&[]);
    }
    expect_arity(ctx, args, 1)?;
    let items = collection_items(ctx, args[0])?;
    ctx.new_list(&items)
}

/// Elements of any builtin collection, falling back to the iterator protocol
/// for everything else. Dictionaries yield their keys.
fn collection_items(ctx: &mut Context, id: ObjId) -> Exec<Vec<ObjId>> {
    match &ctx.obj(id).payload {
        Payload::Tuple(items) | Payload::List(items) => Ok(items.clone()),
        Payload::Dict(entries) => Ok(entries.values().map(|(key, _)| *key).collect()),
        Payload::Set(entries) => Ok(entries.values().copied().collect()),
        Payload::Str(value) => {
            let chars: Vec<String> = value.chars().map(|c| c.to_string()).collect();
            let mut items = Vec::with_capacity(chars.len());
            for c in &chars {
                let item = ctx.new_string(c)?;
                ctx.protect(item);
                items.push(item);
            }
            for &item in &items {
                ctx.unprotect(item);
            }
            Ok(items)
        }
        _ => ctx.iterate_collect(id),
    }
}

fn list_getitem(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let items = list_items(ctx, args[0], 0)?;
    if let Some((start, stop, step)) = as_slice_bounds(ctx, args[1])? {
        let indices = slice_index_list(ctx, start, stop, step, items.len())?;
        let selected: Vec<ObjId> = indices.into_iter().map(|index| items[index]).collect();
        return ctx.new_list(&selected);
    }
    let index = index_argument(ctx, args, 1)?;
    let index = normalize_index(ctx, index, items.len())?;
    Ok(items[index])
}

fn list_setitem(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 3)?;
    let len = list_items(ctx, args[0], 0)?.len();
    let index = index_argument(ctx, args, 1)?;
    let index = normalize_index(ctx, index, len)?;
    if let Payload::List(items) = &mut ctx.obj_mut(args[0]).payload {
        items[index] = args[2];
    }
    Ok(ctx.new_none())
}

fn list_add(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let left = list_items(ctx, args[0], 0)?;
    let right = list_items(ctx, args[1], 1)?;
    let mut joined = left;
    joined.extend(right);
    ctx.new_list(&joined)
}

fn list_mul(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let items = list_items(ctx, args[0], 0)?;
    let count = index_argument(ctx, args, 1)?.max(0) as usize;
    ctx.check_collection_size(items.len().saturating_mul(count))?;
    let mut repeated = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        repeated.extend(items.iter().copied());
    }
    ctx.new_list(&repeated)
}

fn seq_eq(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let equal = values_equal(ctx, args[0], args[1])?;
    Ok(ctx.new_bool(equal))
}

fn seq_ne(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let equal = values_equal(ctx, args[0], args[1])?;
    Ok(ctx.new_bool(!equal))
}

fn seq_contains(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let items = match &ctx.obj(args[0]).payload {
        Payload::Tuple(items) | Payload::List(items) => items.clone(),
        _ => {
            ctx.raise_argument_type_error(0, "sequence");
            return Err(Raised);
        }
    };
    for item in items {
        if values_equal(ctx, item, args[1])? {
            return Ok(ctx.new_bool(true));
        }
    }
    Ok(ctx.new_bool(false))
}

fn list_append(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let len = list_items(ctx, args[0], 0)?.len();
    ctx.check_collection_size(len + 1)?;
    if let Payload::List(items) = &mut ctx.obj_mut(args[0]).payload {
        items.push(args[1]);
    }
    Ok(ctx.new_none())
}

fn list_extend(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let len = list_items(ctx, args[0], 0)?.len();
    let extra = collection_items(ctx, args[1])?;
    ctx.check_collection_size(len + extra.len())?;
    if let Payload::List(items) = &mut ctx.obj_mut(args[0]).payload {
        items.extend(extra);
    }
    Ok(ctx.new_none())
}

fn list_insert(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 3)?;
    let len = list_items(ctx, args[0], 0)?.len() as i64;
    let index = index_argument(ctx, args, 1)?;
    let resolved = if index < 0 {
        (index + len).max(0)
    } else {
        index.min(len)
    } as usize;
    ctx.check_collection_size(len as usize + 1)?;
    if let Payload::List(items) = &mut ctx.obj_mut(args[0]).payload {
        items.insert(resolved, args[2]);
    }
    Ok(ctx.new_none())
}

fn list_pop(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity_range(ctx, args, 1, 2)?;
    let len = list_items(ctx, args[0], 0)?.len();
    let index = match args.get(1) {
        Some(_) => index_argument(ctx, args, 1)?,
        None => -1,
    };
    let index = normalize_index(ctx, index, len)?;
    let removed = match &mut ctx.obj_mut(args[0]).payload {
        Payload::List(items) => items.remove(index),
        _ => unreachable!("validated above"),
    };
    Ok(removed)
}

fn list_remove(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let items = list_items(ctx, args[0], 0)?;
    for (index, item) in items.into_iter().enumerate() {
        if values_equal(ctx, item, args[1])? {
            if let Payload::List(items) = &mut ctx.obj_mut(args[0]).payload {
                items.remove(index);
            }
            return Ok(ctx.new_none());
        }
    }
    ctx.raise_exception(ExceptionKind::ValueError, "list.remove(x): x not in list");
    Err(Raised)
}

fn list_index(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let items = list_items(ctx, args[0], 0)?;
    for (index, item) in items.into_iter().enumerate() {
        if values_equal(ctx, item, args[1])? {
            return ctx.new_int(index as i64);
        }
    }
    ctx.raise_exception(ExceptionKind::ValueError, "value is not in list");
    Err(Raised)
}

fn list_count(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let items = list_items(ctx, args[0], 0)?;
    let mut count = 0;
    for item in items {
        if values_equal(ctx, item, args[1])? {
            count += 1;
        }
    }
    ctx.new_int(count)
}

fn list_reverse(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    if let Payload::List(items) = &mut ctx.obj_mut(args[0]).payload {
        items.reverse();
    }
    Ok(ctx.new_none())
}
