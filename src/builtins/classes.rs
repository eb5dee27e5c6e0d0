//! The primordial `object` class, `NoneType`, and the function class.

use crate::builtins::{expect_arity, type_name_of};
use crate::runtime::context::Context;
use crate::runtime::exception::Exec;
use crate::runtime::object::{ObjId, Payload};

pub(crate) fn register(ctx: &mut Context) {
    let object_class = ctx
        .new_class("object", &[])
        .expect("object class allocation");
    ctx.builtins.object_class = object_class;
    ctx.bind_method(object_class, "__init__", object_init);
    ctx.bind_method(object_class, "__eq__", object_eq);
    ctx.bind_method(object_class, "__ne__", object_ne);
    ctx.bind_method(object_class, "__str__", object_str);
    ctx.bind_method(object_class, "__repr__", object_str);
    ctx.bind_method(object_class, "__nonzero__", object_nonzero);

    let none_class = ctx
        .new_class("NoneType", &[])
        .expect("NoneType class allocation");
    ctx.builtins.none_class = none_class;
    ctx.set_class_ctor(none_class, none_ctor);
    ctx.bind_method(none_class, "__eq__", none_eq);
    ctx.bind_method(none_class, "__ne__", none_ne);

    // The singleton was allocated before its class existed; wire its
    // attribute chain up now.
    let none = ctx.builtins.none;
    if let Payload::Class(payload) = &ctx.obj(none_class).payload {
        let parent = payload.instance_attributes.clone();
        ctx.obj(none).attributes.add_parent(&parent);
    }

    let func_class = ctx
        .new_class("function", &[])
        .expect("function class allocation");
    ctx.builtins.func_class = func_class;
}

fn object_init(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    Ok(ctx.new_none())
}

fn object_eq(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    Ok(ctx.new_bool(args[0] == args[1]))
}

fn object_ne(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    Ok(ctx.new_bool(args[0] != args[1]))
}

fn object_str(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    let rendered = format!("<{} object>", type_name_of(ctx, args[0]));
    ctx.new_string(&rendered)
}

fn object_nonzero(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    Ok(ctx.new_bool(true))
}

fn none_ctor(ctx: &mut Context, _args: &[ObjId]) -> Exec<ObjId> {
    Ok(ctx.new_none())
}

fn none_eq(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let equal = ctx.is_none(args[1]);
    Ok(ctx.new_bool(equal))
}

fn none_ne(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let equal = ctx.is_none(args[1]);
    Ok(ctx.new_bool(!equal))
}
