//! Exception class hierarchy rooted at BaseException.
//!
//! Classes are registered parents-first so each subclass can name its base;
//! `__init__` and `__str__` live on BaseException and are inherited through
//! the attribute-table parent chain.

use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, ExceptionKind, Raised};
use crate::runtime::object::{ObjId, Payload};

pub(crate) fn register(ctx: &mut Context) {
    for kind in ExceptionKind::ALL {
        let bases: Vec<ObjId> = match kind.parent() {
            Some(parent) => vec![ctx.builtins.exception_class(parent)],
            None => Vec::new(),
        };
        let class = ctx
            .new_class(kind.name(), &bases)
            .expect("exception class allocation");
        ctx.builtins.exceptions.insert(kind, class);
    }

    let base = ctx.builtins.exception_class(ExceptionKind::BaseException);
    ctx.bind_method(base, "__init__", exception_init);
    ctx.bind_method(base, "__str__", exception_str);
    ctx.bind_method(base, "__repr__", exception_repr);
}

fn exception_init(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        ctx.raise_argument_count_error(0, Some(1));
        return Err(Raised);
    }
    let instance = args[0];
    let message = match args.len() {
        1 => ctx.new_string("")?,
        2 => args[1],
        _ => ctx.new_tuple(&args[1..])?,
    };
    ctx.set_attribute(instance, "message", message);
    Ok(ctx.new_none())
}

fn exception_str(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        ctx.raise_argument_count_error(0, Some(1));
        return Err(Raised);
    }
    let message = ctx.obj(args[0]).attributes.get("message");
    match message {
        Some(message) => {
            if matches!(ctx.obj(message).payload, Payload::Str(_)) {
                Ok(message)
            } else {
                let rendered = ctx.str_of(message)?;
                ctx.new_string(&rendered)
            }
        }
        None => ctx.new_string(""),
    }
}

fn exception_repr(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        ctx.raise_argument_count_error(0, Some(1));
        return Err(Raised);
    }
    let type_name = crate::builtins::type_name_of(ctx, args[0]);
    let message = ctx.obj(args[0]).attributes.get("message");
    let rendered = match message {
        Some(message) => {
            let text = ctx.str_of(message)?;
            if text.is_empty() {
                format!("{type_name}()")
            } else {
                format!("{type_name}({text:?})")
            }
        }
        None => format!("{type_name}()"),
    };
    ctx.new_string(&rendered)
}
