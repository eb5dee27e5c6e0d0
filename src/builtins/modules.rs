//! Native module loaders registered with the context's module registry:
//! `math`, `sys`, and (behind `enable_os_access`) `os`.

use crate::builtins::{expect_arity, expect_arity_range};
use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, ExceptionKind, Raised};
use crate::runtime::object::{NativeFn, ObjId};

pub(crate) fn load_math_module(ctx: &mut Context) -> Exec<()> {
    let pi = ctx.new_float(std::f64::consts::PI)?;
    ctx.set_global("pi", pi);
    let e = ctx.new_float(std::f64::consts::E)?;
    ctx.set_global("e", e);
    let inf = ctx.new_float(f64::INFINITY)?;
    ctx.set_global("inf", inf);
    let nan = ctx.new_float(f64::NAN)?;
    ctx.set_global("nan", nan);

    let functions: [(&str, NativeFn); 5] = [
        ("sqrt", math_sqrt),
        ("floor", math_floor),
        ("ceil", math_ceil),
        ("fabs", math_fabs),
        ("log", math_log),
    ];
    for (name, fptr) in functions {
        let function = ctx.new_function(fptr, name)?;
        ctx.set_global(name, function);
    }
    Ok(())
}

pub(crate) fn load_sys_module(ctx: &mut Context) -> Exec<()> {
    let argv = match ctx.argv_obj {
        Some(argv) => argv,
        None => ctx.new_list(&[])?,
    };
    ctx.set_global("argv", argv);
    let version = ctx.new_string(env!("CARGO_PKG_VERSION"))?;
    ctx.set_global("version", version);

    let stdin = ctx.alloc(
        std::rc::Rc::from("stdin"),
        crate::runtime::object::Payload::Instance,
    )?;
    ctx.protect(stdin);
    let isatty = ctx.new_function(sys_isatty, "isatty");
    ctx.unprotect(stdin);
    ctx.set_attribute(stdin, "isatty", isatty?);
    ctx.set_global("stdin", stdin);
    Ok(())
}

fn sys_isatty(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 0)?;
    Ok(ctx.new_bool(ctx.config.isatty))
}

pub(crate) fn load_os_module(ctx: &mut Context) -> Exec<()> {
    let getcwd = ctx.new_function(os_getcwd, "getcwd")?;
    ctx.set_global("getcwd", getcwd);
    let sep = ctx.new_string(std::path::MAIN_SEPARATOR_STR)?;
    ctx.set_global("sep", sep);
    Ok(())
}

fn float_argument(ctx: &mut Context, args: &[ObjId]) -> Exec<f64> {
    expect_arity(ctx, args, 1)?;
    match crate::builtins::number::numeric_value(ctx, args[0]) {
        Some(value) => Ok(value),
        None => {
            ctx.raise_argument_type_error(0, "int or float");
            Err(Raised)
        }
    }
}

fn math_sqrt(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let value = float_argument(ctx, args)?;
    if value < 0.0 {
        ctx.raise_exception(ExceptionKind::ValueError, "math domain error");
        return Err(Raised);
    }
    ctx.new_float(value.sqrt())
}

fn math_floor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let value = float_argument(ctx, args)?;
    ctx.new_int(value.floor() as i64)
}

fn math_ceil(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let value = float_argument(ctx, args)?;
    ctx.new_int(value.ceil() as i64)
}

fn math_fabs(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let value = float_argument(ctx, args)?;
    ctx.new_float(value.abs())
}

fn math_log(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity_range(ctx, args, 1, 2)?;
    let value = match crate::builtins::number::numeric_value(ctx, args[0]) {
        Some(value) => value,
        None => {
            ctx.raise_argument_type_error(0, "int or float");
            return Err(Raised);
        }
    };
    if value <= 0.0 {
        ctx.raise_exception(ExceptionKind::ValueError, "math domain error");
        return Err(Raised);
    }
    let result = match args.get(1) {
        Some(&base) => {
            let base = match crate::builtins::number::numeric_value(ctx, base) {
                Some(base) => base,
                None => {
                    ctx.raise_argument_type_error(1, "int or float");
                    return Err(Raised);
                }
            };
            value.log(base)
        }
        None => value.ln(),
    };
    ctx.new_float(result)
}

fn os_getcwd(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 0)?;
    match std::env::current_dir() {
        Ok(path) => ctx.new_string(&path.to_string_lossy()),
        Err(error) => {
            ctx.raise_exception(ExceptionKind::OsError, &error.to_string());
            Err(Raised)
        }
    }
}
