//! Numeric classes: `int`, `float`, and `bool` (a subclass of int).
//!
//! The arithmetic natives inspect payloads rather than the receiver's class,
//! so one set of functions serves all three types with int/float coercion:
//! an operation stays integral unless either operand is a float.

use crate::builtins::expect_arity;
use crate::runtime::context::Context;
use crate::runtime::exception::{Exec, ExceptionKind, Raised};
use crate::runtime::object::{ObjId, Payload};

pub(crate) fn register(ctx: &mut Context) {
    let int_class = ctx.new_class("int", &[]).expect("int class allocation");
    ctx.builtins.int_class = int_class;
    ctx.set_class_ctor(int_class, int_ctor);

    let float_class = ctx.new_class("float", &[]).expect("float class allocation");
    ctx.builtins.float_class = float_class;
    ctx.set_class_ctor(float_class, float_ctor);

    let bool_class = ctx
        .new_class("bool", &[int_class])
        .expect("bool class allocation");
    ctx.builtins.bool_class = bool_class;
    ctx.set_class_ctor(bool_class, bool_ctor);

    for class in [int_class, float_class] {
        ctx.bind_method(class, "__add__", num_add);
        ctx.bind_method(class, "__sub__", num_sub);
        ctx.bind_method(class, "__mul__", num_mul);
        ctx.bind_method(class, "__truediv__", num_truediv);
        ctx.bind_method(class, "__floordiv__", num_floordiv);
        ctx.bind_method(class, "__mod__", num_mod);
        ctx.bind_method(class, "__pow__", num_pow);
        ctx.bind_method(class, "__neg__", num_neg);
        ctx.bind_method(class, "__pos__", num_pos);
        ctx.bind_method(class, "__eq__", num_eq);
        ctx.bind_method(class, "__ne__", num_ne);
        ctx.bind_method(class, "__lt__", num_lt);
        ctx.bind_method(class, "__le__", num_le);
        ctx.bind_method(class, "__gt__", num_gt);
        ctx.bind_method(class, "__ge__", num_ge);
    }

    // Bitwise and shift operators exist on integers only; bool inherits
    // everything through its int base.
    ctx.bind_method(int_class, "__and__", int_and);
    ctx.bind_method(int_class, "__or__", int_or);
    ctx.bind_method(int_class, "__xor__", int_xor);
    ctx.bind_method(int_class, "__invert__", int_invert);
    ctx.bind_method(int_class, "__lshift__", int_lshift);
    ctx.bind_method(int_class, "__rshift__", int_rshift);

    let true_tag = ctx.tags.bool_.clone();
    let bool_true = ctx
        .alloc(true_tag, Payload::Bool(true))
        .expect("bool singleton allocation");
    let false_tag = ctx.tags.bool_.clone();
    let bool_false = ctx
        .alloc(false_tag, Payload::Bool(false))
        .expect("bool singleton allocation");
    if let Payload::Class(payload) = &ctx.obj(bool_class).payload {
        let parent = payload.instance_attributes.clone();
        ctx.obj(bool_true).attributes.add_parent(&parent);
        ctx.obj(bool_false).attributes.add_parent(&parent);
    }
    ctx.builtins.bool_true = bool_true;
    ctx.builtins.bool_false = bool_false;
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

pub(crate) fn as_num(ctx: &Context, id: ObjId) -> Option<Num> {
    match ctx.obj(id).payload {
        Payload::Int(value) => Some(Num::Int(value)),
        Payload::Bool(value) => Some(Num::Int(i64::from(value))),
        Payload::Float(value) => Some(Num::Float(value)),
        _ => None,
    }
}

pub(crate) fn numeric_value(ctx: &Context, id: ObjId) -> Option<f64> {
    match as_num(ctx, id)? {
        Num::Int(value) => Some(value as f64),
        Num::Float(value) => Some(value),
    }
}

fn operands(ctx: &mut Context, args: &[ObjId]) -> Exec<(Num, Num)> {
    expect_arity(ctx, args, 2)?;
    let Some(left) = as_num(ctx, args[0]) else {
        ctx.raise_argument_type_error(0, "int or float");
        return Err(Raised);
    };
    let Some(right) = as_num(ctx, args[1]) else {
        ctx.raise_argument_type_error(1, "int or float");
        return Err(Raised);
    };
    Ok((left, right))
}

fn overflow(ctx: &mut Context) -> Raised {
    ctx.raise_exception(ExceptionKind::OverflowError, "integer overflow");
    Raised
}

fn num_add(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    match operands(ctx, args)? {
        (Num::Int(a), Num::Int(b)) => {
            let value = a.checked_add(b).ok_or_else(|| overflow(ctx))?;
            ctx.new_int(value)
        }
        (a, b) => {
            let value = to_f64(a) + to_f64(b);
            ctx.new_float(value)
        }
    }
}

fn num_sub(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    match operands(ctx, args)? {
        (Num::Int(a), Num::Int(b)) => {
            let value = a.checked_sub(b).ok_or_else(|| overflow(ctx))?;
            ctx.new_int(value)
        }
        (a, b) => {
            let value = to_f64(a) - to_f64(b);
            ctx.new_float(value)
        }
    }
}

fn num_mul(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    match operands(ctx, args)? {
        (Num::Int(a), Num::Int(b)) => {
            let value = a.checked_mul(b).ok_or_else(|| overflow(ctx))?;
            ctx.new_int(value)
        }
        (a, b) => {
            let value = to_f64(a) * to_f64(b);
            ctx.new_float(value)
        }
    }
}

fn num_truediv(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let (left, right) = operands(ctx, args)?;
    if is_zero(right) {
        ctx.raise_zero_division_error();
        return Err(Raised);
    }
    ctx.new_float(to_f64(left) / to_f64(right))
}

fn num_floordiv(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let (left, right) = operands(ctx, args)?;
    if is_zero(right) {
        ctx.raise_zero_division_error();
        return Err(Raised);
    }
    match (left, right) {
        (Num::Int(a), Num::Int(b)) => ctx.new_int(floor_div(a, b)),
        (a, b) => ctx.new_float((to_f64(a) / to_f64(b)).floor()),
    }
}

fn num_mod(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let (left, right) = operands(ctx, args)?;
    if is_zero(right) {
        ctx.raise_zero_division_error();
        return Err(Raised);
    }
    match (left, right) {
        (Num::Int(a), Num::Int(b)) => ctx.new_int(floor_mod(a, b)),
        (a, b) => {
            let (a, b) = (to_f64(a), to_f64(b));
            ctx.new_float(a - b * (a / b).floor())
        }
    }
}

fn num_pow(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    match operands(ctx, args)? {
        (Num::Int(a), Num::Int(b)) if b >= 0 => {
            let exponent = u32::try_from(b).map_err(|_| overflow(ctx))?;
            let value = a.checked_pow(exponent).ok_or_else(|| overflow(ctx))?;
            ctx.new_int(value)
        }
        (a, b) => ctx.new_float(to_f64(a).powf(to_f64(b))),
    }
}

fn num_neg(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    match as_num(ctx, args[0]) {
        Some(Num::Int(value)) => {
            let value = value.checked_neg().ok_or_else(|| overflow(ctx))?;
            ctx.new_int(value)
        }
        Some(Num::Float(value)) => ctx.new_float(-value),
        None => {
            ctx.raise_argument_type_error(0, "int or float");
            Err(Raised)
        }
    }
}

fn num_pos(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    match as_num(ctx, args[0]) {
        Some(Num::Int(value)) => ctx.new_int(value),
        Some(Num::Float(value)) => ctx.new_float(value),
        None => {
            ctx.raise_argument_type_error(0, "int or float");
            Err(Raised)
        }
    }
}

fn num_eq(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 2)?;
    let equal = match (as_num(ctx, args[0]), as_num(ctx, args[1])) {
        (Some(a), Some(b)) => numbers_equal(a, b),
        _ => false,
    };
    Ok(ctx.new_bool(equal))
}

fn num_ne(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let equal = num_eq(ctx, args)?;
    let value = ctx.get_bool(equal);
    Ok(ctx.new_bool(!value))
}

fn num_lt(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    ordered(ctx, args, |ordering| ordering == std::cmp::Ordering::Less)
}

fn num_le(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    ordered(ctx, args, |ordering| ordering != std::cmp::Ordering::Greater)
}

fn num_gt(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    ordered(ctx, args, |ordering| ordering == std::cmp::Ordering::Greater)
}

fn num_ge(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    ordered(ctx, args, |ordering| ordering != std::cmp::Ordering::Less)
}

fn ordered(
    ctx: &mut Context,
    args: &[ObjId],
    accept: fn(std::cmp::Ordering) -> bool,
) -> Exec<ObjId> {
    let (left, right) = operands(ctx, args)?;
    let ordering = match (left, right) {
        (Num::Int(a), Num::Int(b)) => a.cmp(&b),
        (a, b) => to_f64(a)
            .partial_cmp(&to_f64(b))
            .unwrap_or(std::cmp::Ordering::Greater),
    };
    Ok(ctx.new_bool(accept(ordering)))
}

fn int_operands(ctx: &mut Context, args: &[ObjId]) -> Exec<(i64, i64)> {
    expect_arity(ctx, args, 2)?;
    match (as_num(ctx, args[0]), as_num(ctx, args[1])) {
        (Some(Num::Int(a)), Some(Num::Int(b))) => Ok((a, b)),
        _ => {
            ctx.raise_argument_type_error(1, "int");
            Err(Raised)
        }
    }
}

fn int_and(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let (a, b) = int_operands(ctx, args)?;
    ctx.new_int(a & b)
}

fn int_or(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let (a, b) = int_operands(ctx, args)?;
    ctx.new_int(a | b)
}

fn int_xor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let (a, b) = int_operands(ctx, args)?;
    ctx.new_int(a ^ b)
}

fn int_invert(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    expect_arity(ctx, args, 1)?;
    match as_num(ctx, args[0]) {
        Some(Num::Int(value)) => ctx.new_int(!value),
        _ => {
            ctx.raise_argument_type_error(0, "int");
            Err(Raised)
        }
    }
}

fn shift_amount(ctx: &mut Context, amount: i64) -> Exec<Option<u32>> {
    if amount < 0 {
        ctx.raise_exception(ExceptionKind::ValueError, "negative shift count");
        return Err(Raised);
    }
    // Shifts past the integer width saturate rather than wrap.
    if amount >= 64 {
        return Ok(None);
    }
    Ok(Some(amount as u32))
}

fn int_lshift(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let (a, b) = int_operands(ctx, args)?;
    let value = match shift_amount(ctx, b)? {
        Some(amount) => a.wrapping_shl(amount),
        None => 0,
    };
    ctx.new_int(value)
}

fn int_rshift(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    let (a, b) = int_operands(ctx, args)?;
    let value = match shift_amount(ctx, b)? {
        Some(amount) => a >> amount,
        None => {
            if a < 0 {
                -1
            } else {
                0
            }
        }
    };
    ctx.new_int(value)
}

fn int_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        return ctx.new_int(0);
    }
    expect_arity(ctx, args, 1)?;
    match &ctx.obj(args[0]).payload {
        Payload::Int(_) => Ok(args[0]),
        Payload::Bool(value) => {
            let value = i64::from(*value);
            ctx.new_int(value)
        }
        Payload::Float(value) => {
            let value = *value;
            if value.is_finite() && value.abs() < i64::MAX as f64 {
                ctx.new_int(value.trunc() as i64)
            } else {
                Err(overflow(ctx))
            }
        }
        Payload::Str(text) => match text.trim().parse::<i64>() {
            Ok(value) => ctx.new_int(value),
            Err(_) => {
                let message = format!("invalid literal for int(): '{text}'");
                ctx.raise_exception(ExceptionKind::ValueError, &message);
                Err(Raised)
            }
        },
        _ => {
            ctx.raise_argument_type_error(0, "int, float, or str");
            Err(Raised)
        }
    }
}

fn float_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        return ctx.new_float(0.0);
    }
    expect_arity(ctx, args, 1)?;
    match &ctx.obj(args[0]).payload {
        Payload::Float(_) => Ok(args[0]),
        Payload::Int(value) => {
            let value = *value as f64;
            ctx.new_float(value)
        }
        Payload::Bool(value) => {
            let value = f64::from(u8::from(*value));
            ctx.new_float(value)
        }
        Payload::Str(text) => match text.trim().parse::<f64>() {
            Ok(value) => ctx.new_float(value),
            Err(_) => {
                let message = format!("could not convert string to float: '{text}'");
                ctx.raise_exception(ExceptionKind::ValueError, &message);
                Err(Raised)
            }
        },
        _ => {
            ctx.raise_argument_type_error(0, "int, float, or str");
            Err(Raised)
        }
    }
}

fn bool_ctor(ctx: &mut Context, args: &[ObjId]) -> Exec<ObjId> {
    if args.is_empty() {
        return Ok(ctx.new_bool(false));
    }
    expect_arity(ctx, args, 1)?;
    let truthy = ctx.truthify(args[0])?;
    Ok(ctx.new_bool(truthy))
}

fn to_f64(value: Num) -> f64 {
    match value {
        Num::Int(value) => value as f64,
        Num::Float(value) => value,
    }
}

fn is_zero(value: Num) -> bool {
    match value {
        Num::Int(value) => value == 0,
        Num::Float(value) => value == 0.0,
    }
}

fn numbers_equal(a: Num, b: Num) -> bool {
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => a == b,
        (a, b) => to_f64(a) == to_f64(b),
    }
}

fn floor_div(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        quotient - 1
    } else {
        quotient
    }
}

fn floor_mod(a: i64, b: i64) -> i64 {
    let remainder = a % b;
    if remainder != 0 && ((remainder < 0) != (b < 0)) {
        remainder + b
    } else {
        remainder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_division_rounds_toward_negative_infinity() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-7, -2), 3);
    }

    #[test]
    fn modulo_follows_divisor_sign() {
        assert_eq!(floor_mod(7, 3), 1);
        assert_eq!(floor_mod(-7, 3), 2);
        assert_eq!(floor_mod(7, -3), -2);
        assert_eq!(floor_mod(-7, -3), -1);
    }
}
