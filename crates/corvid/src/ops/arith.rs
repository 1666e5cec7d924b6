//! Arithmetic, bitwise and unary operators.
//!
//! Binary operators are resolved into a [`BinaryPlan`]: an ordered list of attempts derived
//! from the operand classes alone. A call site caches the plan under a guard on both
//! classes and their versions; an uncached evaluation builds the same plan and runs it, so
//! cached and uncached dispatch cannot disagree.

use std::sync::Arc;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use smallvec::{SmallVec, smallvec};

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    expressions::{Operator, UnaryOp},
    interp::ExecCtx,
    ops::{attr::user_class_method, call::call_method, compare::truthy, format::percent_format},
    types::{CallArgs, PyDict, PySet, PyType, TypeKind, type_of},
    value::Value,
};

/// One attempt at evaluating a binary operator.
#[derive(Debug, Clone)]
pub enum Step {
    /// Builtin operand types: evaluated natively.
    Native,
    /// A user-defined special method. `reflected` calls it on the right operand.
    Call { method: Value, reflected: bool },
}

impl Step {
    fn run(&self, ctx: &mut ExecCtx, op: Operator, left: &Value, right: &Value, inplace: bool) -> RunResult<Option<Value>> {
        match self {
            Self::Native if inplace => native_inplace(ctx, op, left, right),
            Self::Native => native_binary(ctx, op, left, right),
            Self::Call { method, reflected } => {
                let (receiver, arg) = if *reflected { (right, left) } else { (left, right) };
                let result = call_method(ctx, method, receiver, CallArgs::positional([arg.clone()]))?;
                Ok((!matches!(result, Value::NotImplemented)).then_some(result))
            }
        }
    }
}

/// The resolved dispatch order for `left op right`.
#[derive(Debug, Clone)]
pub struct BinaryPlan {
    steps: SmallVec<[Step; 2]>,
}

impl BinaryPlan {
    pub fn run(&self, ctx: &mut ExecCtx, op: Operator, left: &Value, right: &Value) -> RunResult<Value> {
        for step in &self.steps {
            if let Some(result) = step.run(ctx, op, left, right, false)? {
                return Ok(result);
            }
        }
        Err(unsupported(op, left, right))
    }
}

fn is_native(ty: &PyType) -> bool {
    matches!(ty.kind, TypeKind::Builtin(_))
}

/// Builds the dispatch order for two operand classes.
#[must_use]
pub fn plan_binary(op: Operator, left: &Arc<PyType>, right: &Arc<PyType>) -> BinaryPlan {
    if is_native(left) && is_native(right) {
        return BinaryPlan { steps: smallvec![Step::Native] };
    }
    let forward = user_class_method(left, op.dunder()).map(|method| Step::Call { method, reflected: false });
    let reflected = if Arc::ptr_eq(left, right) {
        None
    } else {
        user_class_method(right, op.reflected_dunder()).map(|method| Step::Call { method, reflected: true })
    };
    let mut steps = SmallVec::new();
    let right_first = reflected.is_some() && right.is_subclass(left);
    if right_first {
        steps.extend(reflected.clone());
    }
    steps.extend(forward);
    if !right_first {
        steps.extend(reflected);
    }
    BinaryPlan { steps }
}

/// `left op right` without a call site.
pub fn binary(ctx: &mut ExecCtx, op: Operator, left: &Value, right: &Value) -> RunResult<Value> {
    plan_binary(op, &type_of(left), &type_of(right)).run(ctx, op, left, right)
}

/// The resolved dispatch order for `left op= right`.
#[derive(Debug, Clone)]
pub struct InplacePlan {
    inplace: Option<Step>,
    fallback: BinaryPlan,
}

impl InplacePlan {
    pub fn run(&self, ctx: &mut ExecCtx, op: Operator, left: &Value, right: &Value) -> RunResult<Value> {
        if let Some(step) = &self.inplace
            && let Some(result) = step.run(ctx, op, left, right, true)?
        {
            return Ok(result);
        }
        self.fallback.run(ctx, op, left, right)
    }
}

#[must_use]
pub fn plan_inplace(op: Operator, left: &Arc<PyType>, right: &Arc<PyType>) -> InplacePlan {
    let inplace = if is_native(left) {
        Some(Step::Native)
    } else {
        user_class_method(left, op.inplace_dunder()).map(|method| Step::Call { method, reflected: false })
    };
    InplacePlan {
        inplace,
        fallback: plan_binary(op, left, right),
    }
}

fn unsupported(op: Operator, left: &Value, right: &Value) -> RunError {
    if op == Operator::Add && matches!(left, Value::Str(_) | Value::List(_) | Value::Tuple(_)) {
        let kind = left.type_name();
        return RunError::type_error(format!(
            "can only concatenate {kind} (not \"{}\") to {kind}",
            right.type_name()
        ));
    }
    RunError::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        left.type_name(),
        right.type_name()
    ))
}

/// Converts a number to `f64`.
pub fn to_f64(value: &Value) -> RunResult<f64> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        Value::BigInt(b) => b
            .to_f64()
            .filter(|f| f.is_finite())
            .ok_or_else(|| RunError::new(ExcType::OverflowError, "int too large to convert to float")),
        other => Err(RunError::type_error(format!(
            "must be real number, not {}",
            other.type_name()
        ))),
    }
}

/// Integer conversion used by `%d` and `int()` on numbers.
pub fn to_int(ctx: &mut ExecCtx, value: &Value) -> RunResult<Value> {
    match value {
        Value::Int(_) | Value::BigInt(_) => Ok(value.clone()),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => float_to_int(*f),
        Value::Instance(_) => {
            for dunder in ["__int__", "__index__"] {
                if let Some(method) = crate::ops::attr::user_special(value, dunder) {
                    let result = call_method(ctx, &method, value, CallArgs::new())?;
                    if result.is_int_like() {
                        return Ok(result);
                    }
                    return Err(RunError::type_error(format!(
                        "{dunder} returned non-int (type {})",
                        result.type_name()
                    )));
                }
            }
            Err(RunError::type_error(format!(
                "int() argument must be a string, a bytes-like object or a real number, not '{}'",
                value.type_name()
            )))
        }
        other => Err(RunError::type_error(format!(
            "int() argument must be a string, a bytes-like object or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

/// Truncates a float toward zero.
pub fn float_to_int(f: f64) -> RunResult<Value> {
    if f.is_nan() {
        return Err(RunError::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(RunError::new(ExcType::OverflowError, "cannot convert float infinity to integer"));
    }
    let truncated = f.trunc();
    match truncated.to_i64() {
        Some(i) => Ok(Value::Int(i)),
        None => Ok(Value::from_bigint(
            num_traits::FromPrimitive::from_f64(truncated).unwrap_or_default(),
        )),
    }
}

fn is_number(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Int(_) | Value::BigInt(_) | Value::Float(_))
}

/// Evaluates `left op right` for builtin operand types. `None` means unsupported.
pub fn native_binary(ctx: &mut ExecCtx, op: Operator, left: &Value, right: &Value) -> RunResult<Option<Value>> {
    if let (Value::Bool(a), Value::Bool(b)) = (left, right) {
        match op {
            Operator::BitAnd => return Ok(Some(Value::Bool(*a & *b))),
            Operator::BitOr => return Ok(Some(Value::Bool(*a | *b))),
            Operator::BitXor => return Ok(Some(Value::Bool(*a ^ *b))),
            _ => {}
        }
    }
    if left.is_int_like() && right.is_int_like() {
        return int_op(op, left, right);
    }
    if is_number(left) && is_number(right) {
        return float_op(op, to_f64(left)?, to_f64(right)?);
    }
    Ok(match (op, left, right) {
        (Operator::Add, Value::Str(a), Value::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Some(Value::from(s))
        }
        (Operator::Mod, Value::Str(format), args) => Some(Value::from(percent_format(ctx, format, args)?)),
        (Operator::Add, Value::Bytes(a), Value::Bytes(b)) => Some(Value::Bytes([&a[..], &b[..]].concat().into())),
        (Operator::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.to_vec();
            items.extend(b.snapshot().iter().cloned());
            Some(Value::list(items))
        }
        (Operator::Add, Value::Tuple(a), Value::Tuple(b)) => Some(Value::Tuple([&a[..], &b[..]].concat().into())),
        (Operator::Mult, seq, count) | (Operator::Mult, count, seq) if count.is_int_like() => repeat(seq, count)?,
        (Operator::BitOr | Operator::BitAnd | Operator::Sub | Operator::BitXor, Value::Set(a) | Value::FrozenSet(a), Value::Set(b) | Value::FrozenSet(b)) => {
            let result = set_op(op, a, b)?;
            Some(if matches!(left, Value::FrozenSet(_)) {
                Value::FrozenSet(Arc::new(result))
            } else {
                Value::Set(Arc::new(result))
            })
        }
        (Operator::BitOr, Value::Dict(a), Value::Dict(b)) => {
            let merged = a.copy();
            merged.update(b);
            Some(Value::Dict(Arc::new(merged)))
        }
        _ => None,
    })
}

/// In-place forms that mutate the left operand. Everything else falls back to [`native_binary`].
fn native_inplace(ctx: &mut ExecCtx, op: Operator, left: &Value, right: &Value) -> RunResult<Option<Value>> {
    match (op, left) {
        (Operator::Add, Value::List(list)) => {
            let items = match right {
                Value::List(other) => other.to_vec(),
                other => crate::ops::iter::collect(ctx, other)?,
            };
            list.extend(items);
            Ok(Some(left.clone()))
        }
        (Operator::Mult, Value::List(list)) if right.is_int_like() => {
            let count = repeat_count(right)?;
            list.with_mut(|items| {
                let original = std::mem::take(items);
                for _ in 0..count {
                    items.extend(original.iter().cloned());
                }
            });
            Ok(Some(left.clone()))
        }
        (Operator::BitOr | Operator::BitAnd | Operator::Sub | Operator::BitXor, Value::Set(set)) => {
            let other = match right {
                Value::Set(other) | Value::FrozenSet(other) => other,
                _ => return Ok(None),
            };
            let result = set_op(op, set, other)?;
            set.clear();
            for value in result.values() {
                set.add(value)?;
            }
            Ok(Some(left.clone()))
        }
        (Operator::BitOr, Value::Dict(dict)) => match right {
            Value::Dict(other) => {
                dict.update(other);
                Ok(Some(left.clone()))
            }
            _ => Ok(None),
        },
        _ => native_binary(ctx, op, left, right),
    }
}

fn repeat_count(count: &Value) -> RunResult<usize> {
    match count.as_i64() {
        Some(n) => Ok(usize::try_from(n).unwrap_or(0)),
        None => Err(RunError::new(ExcType::OverflowError, "cannot fit 'int' into an index-sized integer")),
    }
}

fn repeat(seq: &Value, count: &Value) -> RunResult<Option<Value>> {
    let n = match seq {
        Value::Str(_) | Value::Bytes(_) | Value::List(_) | Value::Tuple(_) => repeat_count(count)?,
        _ => return Ok(None),
    };
    Ok(Some(match seq {
        Value::Str(s) => Value::from(s.repeat(n)),
        Value::Bytes(b) => Value::Bytes(b.repeat(n).into()),
        Value::List(list) => Value::list(repeat_values(&list.snapshot(), n)),
        Value::Tuple(items) => Value::Tuple(repeat_values(items, n).into()),
        _ => return Ok(None),
    }))
}

fn repeat_values(items: &[Value], n: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len().saturating_mul(n));
    for _ in 0..n {
        out.extend_from_slice(items);
    }
    out
}

fn set_op(op: Operator, a: &PySet, b: &PySet) -> RunResult<PySet> {
    let result = PySet::new();
    match op {
        Operator::BitOr => {
            for value in a.values().into_iter().chain(b.values()) {
                result.add(value)?;
            }
        }
        Operator::BitAnd => {
            for value in a.values() {
                if b.contains(&value)? {
                    result.add(value)?;
                }
            }
        }
        Operator::Sub => {
            for value in a.values() {
                if !b.contains(&value)? {
                    result.add(value)?;
                }
            }
        }
        _ => {
            for value in a.values() {
                if !b.contains(&value)? {
                    result.add(value)?;
                }
            }
            for value in b.values() {
                if !a.contains(&value)? {
                    result.add(value)?;
                }
            }
        }
    }
    Ok(result)
}

fn int_op(op: Operator, left: &Value, right: &Value) -> RunResult<Option<Value>> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let small = match op {
            Operator::Add => a.checked_add(b),
            Operator::Sub => a.checked_sub(b),
            Operator::Mult => a.checked_mul(b),
            Operator::Div => {
                if b == 0 {
                    return Err(RunError::zero_division("division by zero"));
                }
                return Ok(Some(Value::Float(a as f64 / b as f64)));
            }
            Operator::FloorDiv => {
                if b == 0 {
                    return Err(RunError::zero_division("integer division or modulo by zero"));
                }
                (b != -1 || a != i64::MIN).then(|| Integer::div_floor(&a, &b))
            }
            Operator::Mod => {
                if b == 0 {
                    return Err(RunError::zero_division("integer division or modulo by zero"));
                }
                Some(if b == -1 { 0 } else { a.mod_floor(&b) })
            }
            Operator::Pow => {
                if b < 0 {
                    if a == 0 {
                        return Err(RunError::zero_division("0.0 cannot be raised to a negative power"));
                    }
                    return Ok(Some(Value::Float((a as f64).powf(b as f64))));
                }
                u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp))
            }
            Operator::LShift => {
                if b < 0 {
                    return Err(RunError::value_error("negative shift count"));
                }
                if b < 63 {
                    let shifted = a << b;
                    (shifted >> b == a).then_some(shifted)
                } else {
                    (a == 0).then_some(0)
                }
            }
            Operator::RShift => {
                if b < 0 {
                    return Err(RunError::value_error("negative shift count"));
                }
                Some(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b })
            }
            Operator::BitAnd => Some(a & b),
            Operator::BitOr => Some(a | b),
            Operator::BitXor => Some(a ^ b),
            Operator::MatMult => return Ok(None),
        };
        if let Some(result) = small {
            return Ok(Some(Value::Int(result)));
        }
    }
    let (Some(a), Some(b)) = (left.as_bigint(), right.as_bigint()) else {
        return Ok(None);
    };
    big_op(op, &a, &b).map(Some)
}

fn big_op(op: Operator, a: &BigInt, b: &BigInt) -> RunResult<Value> {
    Ok(match op {
        Operator::Add => Value::from_bigint(a + b),
        Operator::Sub => Value::from_bigint(a - b),
        Operator::Mult => Value::from_bigint(a * b),
        Operator::Div => {
            if b.is_zero() {
                return Err(RunError::zero_division("division by zero"));
            }
            let (Some(x), Some(y)) = (a.to_f64(), b.to_f64()) else {
                return Err(RunError::new(
                    ExcType::OverflowError,
                    "integer division result too large for a float",
                ));
            };
            Value::Float(x / y)
        }
        Operator::FloorDiv => {
            if b.is_zero() {
                return Err(RunError::zero_division("integer division or modulo by zero"));
            }
            Value::from_bigint(a.div_floor(b))
        }
        Operator::Mod => {
            if b.is_zero() {
                return Err(RunError::zero_division("integer division or modulo by zero"));
            }
            Value::from_bigint(a.mod_floor(b))
        }
        Operator::Pow => {
            if b.is_negative() {
                return float_op(op, big_to_f64(a)?, big_to_f64(b)?)?.ok_or_else(|| RunError::type_error("pow"));
            }
            match b.to_usize() {
                Some(exp) => Value::from_bigint(num_traits::pow(a.clone(), exp)),
                None if a.is_zero() || *a == BigInt::from(1) => Value::from_bigint(a.clone()),
                None if *a == BigInt::from(-1) => Value::Int(if b.is_even() { 1 } else { -1 }),
                None => return Err(RunError::new(ExcType::OverflowError, "exponent too large")),
            }
        }
        Operator::LShift | Operator::RShift => {
            if b.is_negative() {
                return Err(RunError::value_error("negative shift count"));
            }
            let Some(shift) = b.to_usize() else {
                return Err(RunError::new(ExcType::OverflowError, "shift count too large"));
            };
            if op == Operator::LShift {
                Value::from_bigint(a << shift)
            } else {
                Value::from_bigint(a >> shift)
            }
        }
        Operator::BitAnd => Value::from_bigint(a & b),
        Operator::BitOr => Value::from_bigint(a | b),
        Operator::BitXor => Value::from_bigint(a ^ b),
        Operator::MatMult => return Err(RunError::type_error("unsupported operand type(s) for @: 'int' and 'int'")),
    })
}

fn big_to_f64(value: &BigInt) -> RunResult<f64> {
    value
        .to_f64()
        .filter(|f| f.is_finite())
        .ok_or_else(|| RunError::new(ExcType::OverflowError, "int too large to convert to float"))
}

fn float_op(op: Operator, a: f64, b: f64) -> RunResult<Option<Value>> {
    Ok(Some(Value::Float(match op {
        Operator::Add => a + b,
        Operator::Sub => a - b,
        Operator::Mult => a * b,
        Operator::Div => {
            if b == 0.0 {
                return Err(RunError::zero_division("float division by zero"));
            }
            a / b
        }
        Operator::FloorDiv => {
            if b == 0.0 {
                return Err(RunError::zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        Operator::Mod => {
            if b == 0.0 {
                return Err(RunError::zero_division("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
        }
        Operator::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(RunError::zero_division("0.0 cannot be raised to a negative power"));
            }
            if a < 0.0 && b.fract() != 0.0 {
                return Err(RunError::value_error("negative number cannot be raised to a fractional power"));
            }
            a.powf(b)
        }
        _ => return Ok(None),
    })))
}

/// Unary `-`, `+`, `~` and `not`.
pub fn unary(ctx: &mut ExecCtx, op: UnaryOp, value: &Value) -> RunResult<Value> {
    if op == UnaryOp::Not {
        return Ok(Value::Bool(!truthy(ctx, value)?));
    }
    let native = match (op, value) {
        (UnaryOp::Neg, Value::Int(i)) => Some(i.checked_neg().map_or_else(|| Value::from_bigint(-BigInt::from(*i)), Value::Int)),
        (UnaryOp::Neg, Value::Bool(b)) => Some(Value::Int(-i64::from(*b))),
        (UnaryOp::Neg, Value::BigInt(b)) => Some(Value::from_bigint(-(**b).clone())),
        (UnaryOp::Neg, Value::Float(f)) => Some(Value::Float(-f)),
        (UnaryOp::Pos, Value::Int(_) | Value::BigInt(_) | Value::Float(_)) => Some(value.clone()),
        (UnaryOp::Pos, Value::Bool(b)) => Some(Value::Int(i64::from(*b))),
        (UnaryOp::Invert, Value::Int(i)) => Some(Value::Int(!i)),
        (UnaryOp::Invert, Value::Bool(b)) => Some(Value::Int(!i64::from(*b))),
        (UnaryOp::Invert, Value::BigInt(b)) => Some(Value::from_bigint(-(**b).clone() - 1)),
        _ => None,
    };
    if let Some(result) = native {
        return Ok(result);
    }
    if let Some(method) = crate::ops::attr::user_special(value, op.dunder()) {
        return call_method(ctx, &method, value, CallArgs::new());
    }
    Err(RunError::type_error(format!(
        "bad operand type for unary {op}: '{}'",
        value.type_name()
    )))
}

/// Merges a mapping into a dict, as `{**m}` and `f(**m)` do.
pub fn merge_mapping(ctx: &mut ExecCtx, target: &PyDict, mapping: &Value) -> RunResult<()> {
    match mapping {
        Value::Dict(source) => {
            target.update(source);
            Ok(())
        }
        other => {
            let keys_method = crate::ops::attr::get_attr(ctx, other, "keys").map_err(|_| {
                RunError::type_error(format!("'{}' object is not a mapping", other.type_name()))
            })?;
            let keys = crate::ops::call::call(ctx, &keys_method, CallArgs::new())?;
            for key in crate::ops::iter::collect(ctx, &keys)? {
                let value = crate::ops::item::get_item(ctx, other, &key)?;
                target.set(key, value)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: &Value) -> i64 {
        v.as_i64().unwrap()
    }

    #[test]
    fn small_ints_promote_on_overflow() {
        let result = int_op(Operator::Mult, &Value::Int(i64::MAX), &Value::Int(2)).unwrap().unwrap();
        assert!(matches!(result, Value::BigInt(_)));
        let back = int_op(Operator::Sub, &result, &Value::Int(i64::MAX)).unwrap().unwrap();
        assert_eq!(int(&back), i64::MAX);
    }

    #[test]
    fn floor_division_rounds_down() {
        assert_eq!(int(&int_op(Operator::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap().unwrap()), -4);
        assert_eq!(int(&int_op(Operator::Mod, &Value::Int(-7), &Value::Int(2)).unwrap().unwrap()), 1);
        assert_eq!(int(&int_op(Operator::Mod, &Value::Int(7), &Value::Int(-2)).unwrap().unwrap()), -1);
        let err = int_op(Operator::FloorDiv, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(err.matches(ExcType::ZeroDivisionError));
        let promoted = int_op(Operator::FloorDiv, &Value::Int(i64::MIN), &Value::Int(-1)).unwrap().unwrap();
        assert_eq!(crate::ops::format::plain_repr(&promoted), "9223372036854775808");
    }

    #[test]
    fn float_modulo_takes_divisor_sign() {
        let Some(Value::Float(r)) = float_op(Operator::Mod, -1.0, 3.0).unwrap() else {
            panic!("expected float");
        };
        assert!((r - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn shifts_and_powers() {
        let big = int_op(Operator::LShift, &Value::Int(1), &Value::Int(100)).unwrap().unwrap();
        assert_eq!(crate::ops::format::plain_repr(&big), "1267650600228229401496703205376");
        let pow = int_op(Operator::Pow, &Value::Int(2), &Value::Int(-1)).unwrap().unwrap();
        assert!(matches!(pow, Value::Float(f) if (f - 0.5).abs() < f64::EPSILON));
        assert_eq!(int(&int_op(Operator::RShift, &Value::Int(-1), &Value::Int(80)).unwrap().unwrap()), -1);
    }
}
