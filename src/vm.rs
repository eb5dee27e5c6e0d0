//! Bytecode interpreter: a stack machine with an argument-frame discipline
//! for calls, an exception-aware try-frame stack, and a queued-jump register
//! that threads break/continue/return through enclosing finally blocks.
//!
//! Frames live on the context so the garbage collector can treat value
//! stacks, locals cells, and in-flight argument frames as roots.

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::{AssignSpec, FunctionCode, Literal, Op, PackSpec};
use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, ExceptionKind, Raised, TraceFrame};
use crate::runtime::object::{
    CellRef, FuncKind, FuncPayload, NativeFn, ObjId, Payload, display_type_name, new_cell,
};

/// Marker on the value stack delimiting the arguments accumulated for the
/// next call or container constructor.
#[derive(Debug)]
pub(crate) struct ArgFrame {
    base: usize,
    kwargs: Vec<(ObjId, ObjId)>,
}

/// Runtime record for an entered `try` region.
#[derive(Debug)]
struct TryFrame {
    except_offset: usize,
    finally_offset: usize,
    stack_depth: usize,
    arg_frame_depth: usize,
    /// Set once the exception dispatch has landed in the except section; a
    /// second raise then routes to the finally instead.
    handling: bool,
}

/// Deferred control transfer waiting for finally blocks to complete.
#[derive(Debug)]
enum Pending {
    Jump { target: usize, remaining: usize },
    Return { value: ObjId, remaining: usize },
}

#[derive(Debug)]
pub(crate) struct Frame {
    func: ObjId,
    code: Rc<FunctionCode>,
    module: String,
    stack: Vec<ObjId>,
    locals: HashMap<String, CellRef>,
    captures: HashMap<String, CellRef>,
    arg_frames: Vec<ArgFrame>,
    try_frames: Vec<TryFrame>,
    pending: Option<Pending>,
    ip: usize,
}

impl Frame {
    pub(crate) fn gather_roots(&self, pending: &mut Vec<ObjId>) {
        pending.push(self.func);
        pending.extend(self.stack.iter().copied());
        for cell in self.locals.values().chain(self.captures.values()) {
            if let Some(id) = *cell.borrow() {
                pending.push(id);
            }
        }
        for frame in &self.arg_frames {
            for (key, value) in &frame.kwargs {
                pending.push(*key);
                pending.push(*value);
            }
        }
        if let Some(Pending::Return { value, .. }) = &self.pending {
            pending.push(*value);
        }
    }
}

/// Calls any callable object: script functions, native functions, classes
/// (construction), or objects providing `__call__`.
pub(crate) fn call_object(
    ctx: &mut Context,
    callable: ObjId,
    args: &[ObjId],
    kwargs: Option<ObjId>,
) -> Exec<ObjId> {
    if let Some(kwargs) = kwargs {
        validate_kwargs_dict(ctx, kwargs)?;
    }

    ctx.protect(callable);
    let result = dispatch_call(ctx, callable, args, kwargs);
    ctx.unprotect(callable);
    result
}

fn dispatch_call(
    ctx: &mut Context,
    callable: ObjId,
    args: &[ObjId],
    kwargs: Option<ObjId>,
) -> Exec<ObjId> {
    enum Callee {
        Function {
            self_obj: Option<ObjId>,
            kind: FuncKind,
            module: String,
            pretty_name: String,
            userdata: Option<ObjId>,
        },
        Class {
            ctor: NativeFn,
            module: String,
            userdata: Option<ObjId>,
        },
        Other,
    }

    let callee = match &ctx.obj(callable).payload {
        Payload::Func(func) => Callee::Function {
            self_obj: func.self_obj,
            kind: func.kind.clone(),
            module: func.module.clone(),
            pretty_name: func.pretty_name.clone(),
            userdata: func.userdata,
        },
        Payload::Class(class) => Callee::Class {
            ctor: class.ctor,
            module: class.module.clone(),
            userdata: class.userdata,
        },
        _ => Callee::Other,
    };

    match callee {
        Callee::Function {
            self_obj,
            kind,
            module,
            pretty_name,
            userdata,
        } => {
            let mut args_with_self: Vec<ObjId> = Vec::with_capacity(args.len() + 1);
            if let Some(self_obj) = self_obj {
                args_with_self.push(self_obj);
            }
            args_with_self.extend_from_slice(args);
            for &arg in &args_with_self {
                ctx.protect(arg);
            }

            ctx.current_trace.push(TraceFrame {
                module: module.clone(),
                func_name: pretty_name,
                src_pos: None,
            });
            ctx.module_stack.push(module);
            ctx.userdata_stack.push(userdata);
            ctx.kwargs_stack.push(kwargs);

            let result = match kind {
                FuncKind::Native(fptr) => fptr(ctx, &args_with_self),
                FuncKind::Script(code) => run_function(ctx, callable, code, &args_with_self, kwargs),
            };

            ctx.kwargs_stack.pop();
            ctx.userdata_stack.pop();
            ctx.module_stack.pop();
            ctx.current_trace.pop();
            for &arg in &args_with_self {
                ctx.unprotect(arg);
            }
            result
        }
        Callee::Class {
            ctor,
            module,
            userdata,
        } => {
            for &arg in args {
                ctx.protect(arg);
            }
            ctx.module_stack.push(module);
            ctx.userdata_stack.push(userdata);
            ctx.kwargs_stack.push(kwargs);

            let result = ctor(ctx, args);

            ctx.kwargs_stack.pop();
            ctx.userdata_stack.pop();
            ctx.module_stack.pop();
            for &arg in args {
                ctx.unprotect(arg);
            }
            result
        }
        Callee::Other => ctx.call_method(callable, "__call__", args),
    }
}

fn validate_kwargs_dict(ctx: &mut Context, kwargs: ObjId) -> Exec<()> {
    let keys: Vec<ObjId> = match &ctx.obj(kwargs).payload {
        Payload::Dict(entries) => entries.values().map(|(key, _)| *key).collect(),
        _ => {
            ctx.raise_exception(
                ExceptionKind::TypeError,
                "Keyword arguments must be a dictionary",
            );
            return Err(Raised);
        }
    };
    for key in keys {
        if !ctx.is_string(key) {
            ctx.raise_exception(
                ExceptionKind::TypeError,
                "Keyword arguments dictionary must only contain string keys",
            );
            return Err(Raised);
        }
    }
    Ok(())
}

/// Runs one compiled function body in a fresh frame.
fn run_function(
    ctx: &mut Context,
    func: ObjId,
    code: Rc<FunctionCode>,
    args: &[ObjId],
    kwargs: Option<ObjId>,
) -> Exec<ObjId> {
    if ctx.frames.len() >= ctx.config.max_recursion {
        ctx.raise_exception(
            ExceptionKind::RecursionError,
            "Maximum recursion depth exceeded",
        );
        return Err(Raised);
    }

    let module = match &ctx.obj(func).payload {
        Payload::Func(payload) => payload.module.clone(),
        _ => unreachable!("run_function on a non-function object"),
    };

    let mut frame = Frame {
        func,
        code: Rc::clone(&code),
        module,
        stack: Vec::new(),
        locals: HashMap::new(),
        captures: HashMap::new(),
        arg_frames: Vec::new(),
        try_frames: Vec::new(),
        pending: None,
        ip: 0,
    };

    if !code.module_scope {
        if let Payload::Func(payload) = &ctx.obj(func).payload {
            frame.captures = payload.captures.clone();
        }
        bind_parameters(ctx, &mut frame, &code, args, kwargs)?;
        for name in &code.variables {
            frame
                .locals
                .entry(name.clone())
                .or_insert_with(new_cell);
        }
    } else if !args.is_empty() {
        ctx.raise_argument_count_error(args.len(), Some(0));
        return Err(Raised);
    }

    ctx.frames.push(frame);
    let result = execute_frame(ctx);
    ctx.frames.pop();
    result
}

/// Matches positional arguments, defaults, `*args`, keyword arguments, and
/// `**kwargs` against the parameter spec.
fn bind_parameters(
    ctx: &mut Context,
    frame: &mut Frame,
    code: &FunctionCode,
    args: &[ObjId],
    kwargs: Option<ObjId>,
) -> Exec<()> {
    let param_count = code.parameters.len();
    let required = param_count - code.default_count;
    let mut bound: Vec<Option<ObjId>> = vec![None; param_count];

    for (slot, &arg) in bound.iter_mut().zip(args.iter()) {
        *slot = Some(arg);
    }

    let extra_positional = &args[args.len().min(param_count)..];
    if !extra_positional.is_empty() && code.list_args.is_none() {
        ctx.raise_argument_count_error(args.len(), Some(param_count));
        return Err(Raised);
    }

    let mut leftover_kwargs: Vec<(ObjId, ObjId)> = Vec::new();
    if let Some(kwargs) = kwargs {
        let entries: Vec<(ObjId, ObjId)> = match &ctx.obj(kwargs).payload {
            Payload::Dict(entries) => entries.values().copied().collect(),
            _ => Vec::new(),
        };
        for (key_obj, value) in entries {
            let key = ctx.get_string(key_obj).to_string();
            match code.parameters.iter().position(|name| *name == key) {
                Some(index) => {
                    if bound[index].is_some() {
                        let message =
                            format!("Got multiple values for argument '{key}'");
                        ctx.raise_exception(ExceptionKind::TypeError, &message);
                        return Err(Raised);
                    }
                    bound[index] = Some(value);
                }
                None => {
                    if code.kwargs.is_none() {
                        let message = format!("Unexpected keyword argument '{key}'");
                        ctx.raise_exception(ExceptionKind::TypeError, &message);
                        return Err(Raised);
                    }
                    leftover_kwargs.push((key_obj, value));
                }
            }
        }
    }

    let defaults: Vec<ObjId> = match &ctx.obj(frame.func).payload {
        Payload::Func(payload) => payload.defaults.clone(),
        _ => Vec::new(),
    };
    for index in required..param_count {
        if bound[index].is_none() {
            bound[index] = defaults.get(index - required).copied();
        }
    }

    if let Some(missing) = bound.iter().position(Option::is_none) {
        let _ = missing;
        ctx.raise_argument_count_error(args.len(), Some(required));
        return Err(Raised);
    }

    for (name, value) in code.parameters.iter().zip(bound) {
        let cell = new_cell();
        *cell.borrow_mut() = value;
        frame.locals.insert(name.clone(), cell);
    }

    if let Some(list_args) = &code.list_args {
        let rest = ctx.new_tuple(extra_positional)?;
        let cell = new_cell();
        *cell.borrow_mut() = Some(rest);
        frame.locals.insert(list_args.clone(), cell);
    }
    if let Some(kwargs_name) = &code.kwargs {
        let rest = ctx.new_dict(&leftover_kwargs)?;
        let cell = new_cell();
        *cell.borrow_mut() = Some(rest);
        frame.locals.insert(kwargs_name.clone(), cell);
    }

    Ok(())
}

// Frame accessors; the current frame always exists while execute_frame runs.

fn frame(ctx: &mut Context) -> &mut Frame {
    ctx.frames.last_mut().expect("executing without a frame")
}

fn push(ctx: &mut Context, id: ObjId) {
    frame(ctx).stack.push(id);
}

fn pop(ctx: &mut Context) -> ObjId {
    frame(ctx)
        .stack
        .pop()
        .expect("value stack underflow; compiler and vm disagree")
}

fn execute_frame(ctx: &mut Context) -> Exec<ObjId> {
    let code = Rc::clone(&frame(ctx).code);
    let module_scope = code.module_scope;

    loop {
        let ip = frame(ctx).ip;
        let instruction = &code.instructions[ip];
        let span = instruction.span;
        if let Some(trace) = ctx.current_trace.last_mut() {
            trace.src_pos = Some(span);
        }
        frame(ctx).ip = ip + 1;

        let step = execute_op(ctx, &instruction.op, module_scope);
        match step {
            Ok(Flow::Continue) => {}
            Ok(Flow::Return(value)) => return Ok(value),
            Err(Raised) => {
                if !unwind_into_handler(ctx) {
                    return Err(Raised);
                }
            }
        }
    }
}

enum Flow {
    Continue,
    Return(ObjId),
}

/// Unwinds to the innermost try frame able to take the current exception.
/// Returns false when the frame has no handler left and the exception
/// propagates to the caller.
fn unwind_into_handler(ctx: &mut Context) -> bool {
    let frame = frame(ctx);
    while let Some(try_frame) = frame.try_frames.last_mut() {
        frame.pending = None;
        if !try_frame.handling {
            try_frame.handling = true;
            let target = try_frame.except_offset;
            let stack_depth = try_frame.stack_depth;
            let arg_frame_depth = try_frame.arg_frame_depth;
            frame.stack.truncate(stack_depth);
            frame.arg_frames.truncate(arg_frame_depth);
            frame.ip = target;
            return true;
        }
        // A raise while already handling routes through the finally; PopTry
        // there removes the frame and EndFinally re-raises.
        let target = try_frame.finally_offset;
        let stack_depth = try_frame.stack_depth;
        let arg_frame_depth = try_frame.arg_frame_depth;
        frame.stack.truncate(stack_depth);
        frame.arg_frames.truncate(arg_frame_depth);
        frame.ip = target;
        return true;
    }
    false
}

fn execute_op(ctx: &mut Context, op: &Op, module_scope: bool) -> Exec<Flow> {
    match op {
        Op::Literal(literal) => {
            let id = match literal {
                Literal::Null => ctx.new_none(),
                Literal::Bool(value) => ctx.new_bool(*value),
                Literal::Int(value) => ctx.new_int(*value)?,
                Literal::Float(value) => ctx.new_float(*value)?,
                Literal::Str(value) => ctx.new_string(value)?,
            };
            push(ctx, id);
        }
        Op::Variable(name) => {
            let value = resolve_variable(ctx, name, module_scope);
            match value {
                Some(id) => push(ctx, id),
                None => {
                    ctx.raise_name_error(name);
                    return Err(Raised);
                }
            }
        }
        Op::Dot(name) => {
            let obj = pop(ctx);
            let member = ctx.get_attribute(obj, name)?;
            push(ctx, member);
        }
        Op::DotInPlace { in_place, fallback } => {
            let obj = pop(ctx);
            let member = match ctx.has_attribute(obj, in_place)? {
                Some(member) => member,
                None => ctx.get_attribute(obj, fallback)?,
            };
            push(ctx, member);
        }
        Op::Pop => {
            pop(ctx);
        }
        Op::PushArgFrame => {
            let frame = frame(ctx);
            let base = frame.stack.len();
            frame.arg_frames.push(ArgFrame {
                base,
                kwargs: Vec::new(),
            });
        }
        Op::Call => {
            let frame = frame(ctx);
            let arg_frame = frame
                .arg_frames
                .pop()
                .expect("Call without a matching PushArgFrame");
            let mut items = frame.stack.split_off(arg_frame.base);
            let callable = items.remove(0);

            let kwargs = if arg_frame.kwargs.is_empty() {
                None
            } else {
                Some(ctx.new_dict(&arg_frame.kwargs)?)
            };
            let result = call_object(ctx, callable, &items, kwargs)?;
            push(ctx, result);
        }
        Op::PushKwarg => {
            let value = pop(ctx);
            let key = pop(ctx);
            frame(ctx)
                .arg_frames
                .last_mut()
                .expect("PushKwarg outside an arg frame")
                .kwargs
                .push((key, value));
        }
        Op::Unpack => {
            let iterable = pop(ctx);
            let items = ctx.iterate_collect(iterable)?;
            frame(ctx).stack.extend(items);
        }
        Op::UnpackMapForCall => {
            let mapping = pop(ctx);
            let entries = dict_entries(ctx, mapping)?;
            frame(ctx)
                .arg_frames
                .last_mut()
                .expect("UnpackMapForCall outside an arg frame")
                .kwargs
                .extend(entries);
        }
        Op::UnpackMapForMapCreation => {
            let mapping = pop(ctx);
            let entries = dict_entries(ctx, mapping)?;
            let frame = frame(ctx);
            for (key, value) in entries {
                frame.stack.push(key);
                frame.stack.push(value);
            }
        }
        Op::Tuple => {
            let items = collect_arg_frame(ctx);
            let id = ctx.new_tuple(&items)?;
            push(ctx, id);
        }
        Op::List => {
            let items = collect_arg_frame(ctx);
            let id = ctx.new_list(&items)?;
            push(ctx, id);
        }
        Op::Set => {
            let items = collect_arg_frame(ctx);
            let id = ctx.new_set(&items)?;
            push(ctx, id);
        }
        Op::Map => {
            let items = collect_arg_frame(ctx);
            debug_assert!(items.len() % 2 == 0, "map literal requires key/value pairs");
            let pairs: Vec<(ObjId, ObjId)> = items
                .chunks_exact(2)
                .map(|chunk| (chunk[0], chunk[1]))
                .collect();
            let id = ctx.new_dict(&pairs)?;
            push(ctx, id);
        }
        Op::Slice => {
            let step = pop(ctx);
            let stop = pop(ctx);
            let start = pop(ctx);
            let slice_fn = ctx.builtin_global("slice").ok_or_else(|| {
                ctx.raise_name_error("slice");
                Raised
            })?;
            let id = call_object(ctx, slice_fn, &[start, stop, step], None)?;
            push(ctx, id);
        }
        Op::Not => {
            let value = pop(ctx);
            let truthy = ctx.truthify(value)?;
            let id = ctx.new_bool(!truthy);
            push(ctx, id);
        }
        Op::Is => {
            let right = pop(ctx);
            let left = pop(ctx);
            let id = ctx.new_bool(left == right);
            push(ctx, id);
        }
        Op::Jump { target } => {
            frame(ctx).ip = *target;
        }
        Op::JumpIfFalse { target } => {
            let value = *frame(ctx).stack.last().expect("jump without operand");
            if ctx.truthify(value)? {
                pop(ctx);
            } else {
                frame(ctx).ip = *target;
            }
        }
        Op::JumpIfTrue { target } => {
            let value = *frame(ctx).stack.last().expect("jump without operand");
            if ctx.truthify(value)? {
                frame(ctx).ip = *target;
            } else {
                pop(ctx);
            }
        }
        Op::JumpIfFalsePop { target } => {
            let value = pop(ctx);
            if !ctx.truthify(value)? {
                frame(ctx).ip = *target;
            }
        }
        Op::QueueJump {
            target,
            finally_count,
        } => {
            // A jump queued inside a finally supersedes a propagating
            // exception.
            ctx.clear_current_exception();
            let frame = frame(ctx);
            if *finally_count == 0 {
                frame.ip = *target;
            } else {
                frame.pending = Some(Pending::Jump {
                    target: *target,
                    remaining: *finally_count,
                });
                frame.ip = frame
                    .try_frames
                    .last()
                    .expect("queued jump with finally count but no try frame")
                    .finally_offset;
            }
        }
        Op::Return { finally_count } => {
            let value = pop(ctx);
            ctx.clear_current_exception();
            let frame = frame(ctx);
            if *finally_count == 0 {
                return Ok(Flow::Return(value));
            }
            frame.pending = Some(Pending::Return {
                value,
                remaining: *finally_count,
            });
            frame.ip = frame
                .try_frames
                .last()
                .expect("return with finally count but no try frame")
                .finally_offset;
        }
        Op::PushTry {
            except_offset,
            finally_offset,
        } => {
            let frame = frame(ctx);
            let stack_depth = frame.stack.len();
            let arg_frame_depth = frame.arg_frames.len();
            frame.try_frames.push(TryFrame {
                except_offset: *except_offset,
                finally_offset: *finally_offset,
                stack_depth,
                arg_frame_depth,
                handling: false,
            });
        }
        Op::PopTry => {
            frame(ctx)
                .try_frames
                .pop()
                .expect("PopTry without a try frame");
        }
        Op::EndFinally => {
            if ctx.current_exception.is_some() {
                // Re-raise: unwind into the next enclosing handler.
                return Err(Raised);
            }
            let frame = frame(ctx);
            match frame.pending.take() {
                None => {}
                Some(Pending::Jump { target, remaining }) => {
                    let remaining = remaining - 1;
                    if remaining == 0 {
                        frame.ip = target;
                    } else {
                        frame.pending = Some(Pending::Jump { target, remaining });
                        frame.ip = frame
                            .try_frames
                            .last()
                            .expect("queued jump outlived the try stack")
                            .finally_offset;
                    }
                }
                Some(Pending::Return { value, remaining }) => {
                    let remaining = remaining - 1;
                    if remaining == 0 {
                        return Ok(Flow::Return(value));
                    }
                    frame.pending = Some(Pending::Return { value, remaining });
                    frame.ip = frame
                        .try_frames
                        .last()
                        .expect("queued return outlived the try stack")
                        .finally_offset;
                }
            }
        }
        Op::Raise => {
            let value = pop(ctx);
            let exception = if ctx.is_class(value) {
                call_object(ctx, value, &[], None)?
            } else {
                value
            };
            ctx.raise_exception_object(exception);
            return Err(Raised);
        }
        Op::CurrentException => match ctx.current_exception {
            Some(exception) => push(ctx, exception),
            None => {
                ctx.raise_exception(
                    ExceptionKind::RuntimeError,
                    "No active exception to reraise",
                );
                return Err(Raised);
            }
        },
        Op::ClearException => {
            ctx.clear_current_exception();
        }
        Op::IsInstance => {
            let id = ctx.builtins.isinstance_fn;
            push(ctx, id);
        }
        Op::Import { module, alias } => {
            ctx.import_module(module, alias.as_deref())?;
        }
        Op::ImportFrom {
            module,
            names,
            star,
        } => {
            if *star {
                ctx.import_all_from_module(module)?;
            } else {
                for (name, alias) in names {
                    ctx.import_from_module(module, name, alias.as_deref())?;
                }
            }
        }
        Op::DirectAssign { target } => {
            let value = *frame(ctx)
                .stack
                .last()
                .expect("assignment without a value");
            match target {
                AssignSpec::Direct(name) => assign_name(ctx, name, value, module_scope),
                AssignSpec::Pack(specs) => bind_pack(ctx, specs, value, module_scope)?,
            }
        }
        Op::MemberAssign { name } => {
            let value = pop(ctx);
            let obj = pop(ctx);
            ctx.set_attribute(obj, name, value);
            push(ctx, value);
        }
        Op::Def(code) => {
            let defaults = {
                let frame = frame(ctx);
                let split = frame.stack.len() - code.default_count;
                frame.stack.split_off(split)
            };
            // Defaults were pushed last-parameter-first; popping restores
            // declaration order. They are only reachable through this
            // buffer until the function object exists, so collection is
            // held off.
            let defaults: Vec<ObjId> = defaults.into_iter().rev().collect();
            let was_locked = std::mem::replace(&mut ctx.lock_gc, true);
            let function = materialize_function(ctx, code, defaults);
            ctx.lock_gc = was_locked;
            push(ctx, function?);
        }
        Op::Class {
            method_names,
            pretty_name,
        } => {
            let (bases, methods) = {
                let frame = frame(ctx);
                let arg_frame = frame
                    .arg_frames
                    .pop()
                    .expect("Class without a matching PushArgFrame");
                let bases = frame.stack.split_off(arg_frame.base);
                let split = frame.stack.len() - method_names.len();
                let methods = frame.stack.split_off(split);
                (bases, methods)
            };

            for &base in &bases {
                if !ctx.is_class(base) {
                    ctx.raise_exception(ExceptionKind::TypeError, "Base must be a class");
                    return Err(Raised);
                }
            }

            // Bases and methods live only in these buffers until they hang
            // off the class object.
            let was_locked = std::mem::replace(&mut ctx.lock_gc, true);
            let class = ctx.new_class(pretty_name, &bases);
            if let Ok(class) = class {
                for (name, method) in method_names.iter().zip(methods) {
                    ctx.add_attribute_to_class(class, name, method);
                }
            }
            ctx.lock_gc = was_locked;
            push(ctx, class?);
        }
    }
    Ok(Flow::Continue)
}

fn resolve_variable(ctx: &mut Context, name: &str, module_scope: bool) -> Option<ObjId> {
    if !module_scope {
        let frame = frame(ctx);
        if let Some(cell) = frame.locals.get(name) {
            if let Some(id) = *cell.borrow() {
                return Some(id);
            }
            // An unassigned local shadows outer scopes.
            return None;
        }
        if let Some(cell) = frame.captures.get(name) {
            return *cell.borrow();
        }
    }
    let module = frame(ctx).module.clone();
    let value = ctx
        .globals
        .get(&module)
        .and_then(|globals| globals.get(name))
        .and_then(|cell| *cell.borrow());
    value
}

fn assign_name(ctx: &mut Context, name: &str, value: ObjId, module_scope: bool) {
    if !module_scope {
        let frame = frame(ctx);
        if let Some(cell) = frame.locals.get(name) {
            *cell.borrow_mut() = Some(value);
            return;
        }
        if let Some(cell) = frame.captures.get(name) {
            *cell.borrow_mut() = Some(value);
            return;
        }
    }
    let module = frame(ctx).module.clone();
    let cell = ctx.global_cell(&module, name);
    *cell.borrow_mut() = Some(value);
}

fn bind_pack(
    ctx: &mut Context,
    specs: &[PackSpec],
    value: ObjId,
    module_scope: bool,
) -> Exec<()> {
    let items = ctx.iterate_collect(value)?;
    let star_position = specs
        .iter()
        .position(|spec| matches!(spec, PackSpec::Starred(_)));

    match star_position {
        None => {
            if items.len() != specs.len() {
                let message = if items.len() > specs.len() {
                    "Too many values to unpack"
                } else {
                    "Not enough values to unpack"
                };
                ctx.raise_exception(ExceptionKind::ValueError, message);
                return Err(Raised);
            }
            for (spec, item) in specs.iter().zip(items) {
                bind_pack_slot(ctx, spec, item, module_scope)?;
            }
        }
        Some(star) => {
            let fixed = specs.len() - 1;
            if items.len() < fixed {
                ctx.raise_exception(ExceptionKind::ValueError, "Not enough values to unpack");
                return Err(Raised);
            }
            let tail_start = items.len() - (fixed - star);
            for (spec, item) in specs[..star].iter().zip(&items[..star]) {
                bind_pack_slot(ctx, spec, *item, module_scope)?;
            }
            let middle = ctx.new_list(&items[star..tail_start])?;
            let PackSpec::Starred(name) = &specs[star] else {
                unreachable!("star position points at a starred spec");
            };
            assign_name(ctx, name, middle, module_scope);
            for (spec, item) in specs[star + 1..].iter().zip(&items[tail_start..]) {
                bind_pack_slot(ctx, spec, *item, module_scope)?;
            }
        }
    }
    Ok(())
}

fn bind_pack_slot(
    ctx: &mut Context,
    spec: &PackSpec,
    item: ObjId,
    module_scope: bool,
) -> Exec<()> {
    match spec {
        PackSpec::Name(name) | PackSpec::Starred(name) => {
            assign_name(ctx, name, item, module_scope);
            Ok(())
        }
        PackSpec::Nested(inner) => bind_pack(ctx, inner, item, module_scope),
    }
}

fn collect_arg_frame(ctx: &mut Context) -> Vec<ObjId> {
    let frame = frame(ctx);
    let arg_frame = frame
        .arg_frames
        .pop()
        .expect("container constructor without a matching PushArgFrame");
    frame.stack.split_off(arg_frame.base)
}

fn dict_entries(ctx: &mut Context, mapping: ObjId) -> Exec<Vec<(ObjId, ObjId)>> {
    match &ctx.obj(mapping).payload {
        Payload::Dict(entries) => Ok(entries.values().copied().collect()),
        _ => {
            let type_name = display_type_name(&ctx.obj(mapping).type_name).to_string();
            let message = format!("Argument unpacking requires a dict, got {type_name}");
            ctx.raise_exception(ExceptionKind::TypeError, &message);
            Err(Raised)
        }
    }
}

/// Builds the function object for a `Def`, resolving captured cells in the
/// defining frame and global captures against the owning module.
fn materialize_function(
    ctx: &mut Context,
    code: &Rc<FunctionCode>,
    defaults: Vec<ObjId>,
) -> Exec<ObjId> {
    let mut captures: HashMap<String, CellRef> = HashMap::new();
    {
        let frame = frame(ctx);
        for name in &code.local_captures {
            let cell = frame
                .locals
                .get(name)
                .or_else(|| frame.captures.get(name))
                .cloned()
                .expect("scope analysis produced an unresolvable capture");
            captures.insert(name.clone(), cell);
        }
    }
    let module = frame(ctx).module.clone();
    for name in &code.global_captures {
        let cell = ctx.global_cell(&module, name);
        captures.insert(name.clone(), cell);
    }

    let tag = ctx.tags.func.clone();
    let payload = Payload::Func(FuncPayload {
        self_obj: None,
        kind: FuncKind::Script(Rc::clone(code)),
        is_method: code.is_method,
        module,
        pretty_name: code.pretty_name.clone(),
        captures,
        defaults,
        userdata: None,
    });
    let id = ctx.alloc(tag, payload)?;

    let parent = match &ctx.obj(ctx.builtins.func_class).payload {
        Payload::Class(class) => Some(class.instance_attributes.clone()),
        _ => None,
    };
    if let Some(parent) = parent {
        ctx.obj_mut(id).attributes.add_parent(&parent);
    }
    Ok(id)
}
