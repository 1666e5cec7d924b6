//! Comparisons, truth testing, membership and hashing.

use std::{cmp::Ordering, sync::Arc};

use num_bigint::BigInt;
use num_traits::FromPrimitive;
use smallvec::SmallVec;

use crate::{
    exception_private::{RunError, RunResult},
    expressions::CmpOp,
    interp::ExecCtx,
    ops::{
        attr::{user_class_method, user_special},
        call::call_method,
    },
    types::{CallArgs, DictKey, PyType, TypeKind, type_of},
    value::Value,
};

/// One attempt at a rich comparison.
#[derive(Debug, Clone)]
pub enum CmpStep {
    Native,
    /// A user special method. `negate` inverts a borrowed `__eq__` for `!=`.
    Call {
        method: Value,
        reflected: bool,
        negate: bool,
    },
}

/// The resolved dispatch order for a rich comparison between two classes.
#[derive(Debug, Clone)]
pub struct ComparePlan {
    steps: SmallVec<[CmpStep; 3]>,
}

impl ComparePlan {
    pub fn run(&self, ctx: &mut ExecCtx, op: CmpOp, left: &Value, right: &Value) -> RunResult<Value> {
        for step in &self.steps {
            match step {
                CmpStep::Native => {
                    if let Some(result) = native_compare(ctx, op, left, right)? {
                        return Ok(Value::Bool(result));
                    }
                }
                CmpStep::Call {
                    method,
                    reflected,
                    negate,
                } => {
                    let (receiver, arg) = if *reflected { (right, left) } else { (left, right) };
                    let result = call_method(ctx, method, receiver, CallArgs::positional([arg.clone()]))?;
                    if matches!(result, Value::NotImplemented) {
                        continue;
                    }
                    if *negate {
                        return Ok(Value::Bool(!truthy(ctx, &result)?));
                    }
                    return Ok(result);
                }
            }
        }
        match op {
            CmpOp::Eq => Ok(Value::Bool(left.is(right))),
            CmpOp::NotEq => Ok(Value::Bool(!left.is(right))),
            _ => Err(RunError::type_error(format!(
                "'{op}' not supported between instances of '{}' and '{}'",
                left.type_name(),
                right.type_name()
            ))),
        }
    }
}

fn user_compare_method(class: &Arc<PyType>, op: CmpOp, reflected: bool) -> Option<CmpStep> {
    let dunder = op.dunder()?;
    if let Some(method) = user_class_method(class, dunder) {
        return Some(CmpStep::Call {
            method,
            reflected,
            negate: false,
        });
    }
    if op == CmpOp::NotEq {
        return user_class_method(class, "__eq__").map(|method| CmpStep::Call {
            method,
            reflected,
            negate: true,
        });
    }
    None
}

/// Builds the dispatch order for a rich comparison. Identity and membership never get here.
#[must_use]
pub fn plan_compare(op: CmpOp, left: &Arc<PyType>, right: &Arc<PyType>) -> ComparePlan {
    let mut steps = SmallVec::new();
    let left_builtin = left.kind != TypeKind::User;
    let right_builtin = right.kind != TypeKind::User;
    let forward = user_compare_method(left, op, false);
    let reflected = if Arc::ptr_eq(left, right) {
        None
    } else {
        user_compare_method(right, op.swapped(), true)
    };
    let right_first = reflected.is_some() && right.is_subclass(left) && !Arc::ptr_eq(left, right);
    if right_first {
        steps.extend(reflected.clone());
    }
    steps.extend(forward);
    if !right_first {
        steps.extend(reflected);
    }
    if left_builtin && right_builtin {
        steps.push(CmpStep::Native);
    }
    ComparePlan { steps }
}

/// Evaluates one comparison operator.
pub fn compare(ctx: &mut ExecCtx, op: CmpOp, left: &Value, right: &Value) -> RunResult<Value> {
    match op {
        CmpOp::Is => Ok(Value::Bool(left.is(right))),
        CmpOp::IsNot => Ok(Value::Bool(!left.is(right))),
        CmpOp::In => Ok(Value::Bool(contains(ctx, right, left)?)),
        CmpOp::NotIn => Ok(Value::Bool(!contains(ctx, right, left)?)),
        _ => plan_compare(op, &type_of(left), &type_of(right)).run(ctx, op, left, right),
    }
}

/// `left == right` as a boolean.
pub fn eq(ctx: &mut ExecCtx, left: &Value, right: &Value) -> RunResult<bool> {
    if let Some(result) = native_compare(ctx, CmpOp::Eq, left, right)? {
        return Ok(result);
    }
    let result = compare(ctx, CmpOp::Eq, left, right)?;
    truthy(ctx, &result)
}

/// Element equality inside containers, where identity implies equality.
fn element_eq(ctx: &mut ExecCtx, left: &Value, right: &Value) -> RunResult<bool> {
    if left.is(right) {
        return Ok(true);
    }
    eq(ctx, left, right)
}

/// `left < right` as a boolean, used by sorting and `min`/`max`.
pub fn less_than(ctx: &mut ExecCtx, left: &Value, right: &Value) -> RunResult<bool> {
    let result = compare(ctx, CmpOp::Lt, left, right)?;
    truthy(ctx, &result)
}

fn numeric_cmp(left: &Value, right: &Value) -> Option<Option<Ordering>> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(Some(a.cmp(b))),
        (Value::Float(a), Value::Float(b)) => Some(a.partial_cmp(b)),
        (Value::Float(f), other) if other.is_int_like() => Some(float_int_cmp(*f, &other.as_bigint()?)),
        (other, Value::Float(f)) if other.is_int_like() => {
            Some(float_int_cmp(*f, &other.as_bigint()?).map(Ordering::reverse))
        }
        (a, b) if a.is_int_like() && b.is_int_like() => Some(Some(a.as_bigint()?.cmp(&b.as_bigint()?))),
        _ => None,
    }
}

/// Exact comparison of a float with an integer.
fn float_int_cmp(f: f64, i: &BigInt) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f.is_infinite() {
        return Some(if f > 0.0 { Ordering::Greater } else { Ordering::Less });
    }
    let floor = BigInt::from_f64(f.floor())?;
    Some(match floor.cmp(i) {
        Ordering::Equal if f.fract() != 0.0 => Ordering::Greater,
        other => other,
    })
}

fn apply(op: CmpOp, ordering: Option<Ordering>) -> bool {
    match ordering {
        None => op == CmpOp::NotEq,
        Some(ord) => match op {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::NotEq => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::LtE => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::GtE => ord != Ordering::Less,
            _ => false,
        },
    }
}

/// Comparison of builtin values. `None` means the types do not support `op` natively.
pub fn native_compare(ctx: &mut ExecCtx, op: CmpOp, left: &Value, right: &Value) -> RunResult<Option<bool>> {
    if let Some(ordering) = numeric_cmp(left, right) {
        return Ok(Some(apply(op, ordering)));
    }
    let equality = matches!(op, CmpOp::Eq | CmpOp::NotEq);
    Ok(match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(apply(op, Some(a.cmp(b)))),
        (Value::Bytes(a), Value::Bytes(b)) => Some(apply(op, Some(a.cmp(b)))),
        (Value::Tuple(a), Value::Tuple(b)) => Some(sequence_compare(ctx, op, a, b)?),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.snapshot(), b.snapshot());
            Some(sequence_compare(ctx, op, &a, &b)?)
        }
        (Value::Set(a) | Value::FrozenSet(a), Value::Set(b) | Value::FrozenSet(b)) => {
            let ordering = if a.same_elements(b) {
                Some(Ordering::Equal)
            } else if a.is_subset(b) {
                Some(Ordering::Less)
            } else if b.is_subset(a) {
                Some(Ordering::Greater)
            } else {
                None
            };
            Some(match (op, ordering) {
                (CmpOp::NotEq, ordering) => ordering != Some(Ordering::Equal),
                (_, None) => false,
                (op, ordering) => apply(op, ordering),
            })
        }
        (Value::Dict(a), Value::Dict(b)) if equality => {
            let equal = dicts_equal(ctx, a, b)?;
            Some(equal == (op == CmpOp::Eq))
        }
        (Value::Range(a), Value::Range(b)) if equality => {
            let equal = a.len() == b.len() && (a.is_empty() || (a.start == b.start && (a.len() == 1 || a.step == b.step)));
            Some(equal == (op == CmpOp::Eq))
        }
        (Value::Slice(a), Value::Slice(b)) if equality => {
            let equal = eq(ctx, &a.start, &b.start)? && eq(ctx, &a.stop, &b.stop)? && eq(ctx, &a.step, &b.step)?;
            Some(equal == (op == CmpOp::Eq))
        }
        (Value::Instance(_), _) | (_, Value::Instance(_)) => None,
        _ if equality => Some(left.is(right) == (op == CmpOp::Eq)),
        _ => None,
    })
}

fn dicts_equal(ctx: &mut ExecCtx, a: &crate::types::PyDict, b: &crate::types::PyDict) -> RunResult<bool> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (key, value) in a.items() {
        match b.get(&key)? {
            Some(other) if element_eq(ctx, &value, &other)? => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

fn sequence_compare(ctx: &mut ExecCtx, op: CmpOp, a: &[Value], b: &[Value]) -> RunResult<bool> {
    if matches!(op, CmpOp::Eq | CmpOp::NotEq) && a.len() != b.len() {
        return Ok(op == CmpOp::NotEq);
    }
    for (x, y) in a.iter().zip(b) {
        if !element_eq(ctx, x, y)? {
            return match op {
                CmpOp::Eq => Ok(false),
                CmpOp::NotEq => Ok(true),
                _ => {
                    let result = compare(ctx, op, x, y)?;
                    truthy(ctx, &result)
                }
            };
        }
    }
    Ok(apply(op, Some(a.len().cmp(&b.len()))))
}

/// Truth value, calling `__bool__` or `__len__` on instances.
pub fn truthy(ctx: &mut ExecCtx, value: &Value) -> RunResult<bool> {
    if let Some(truth) = value.native_truth() {
        return Ok(truth);
    }
    if let Some(method) = user_special(value, "__bool__") {
        return match call_method(ctx, &method, value, CallArgs::new())? {
            Value::Bool(b) => Ok(b),
            other => Err(RunError::type_error(format!(
                "__bool__ should return bool, returned {}",
                other.type_name()
            ))),
        };
    }
    if let Some(method) = user_special(value, "__len__") {
        let len = call_method(ctx, &method, value, CallArgs::new())?;
        return match len.as_i64() {
            Some(n) if n >= 0 => Ok(n != 0),
            Some(_) => Err(RunError::value_error("__len__() should return >= 0")),
            None => Err(RunError::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                len.type_name()
            ))),
        };
    }
    Ok(true)
}

/// `item in container`.
pub fn contains(ctx: &mut ExecCtx, container: &Value, item: &Value) -> RunResult<bool> {
    match container {
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.contains(&**needle)),
            other => Err(RunError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Bytes(bytes) => match item {
            Value::Bytes(needle) => Ok(needle.is_empty() || bytes.windows(needle.len()).any(|w| w == &needle[..])),
            Value::Int(byte) => Ok(u8::try_from(*byte).is_ok_and(|b| bytes.contains(&b))),
            other => Err(RunError::type_error(format!(
                "a bytes-like object is required, not '{}'",
                other.type_name()
            ))),
        },
        Value::Tuple(items) => contains_in(ctx, items, item),
        Value::List(list) => contains_in(ctx, &list.snapshot(), item),
        Value::Dict(dict) => dict.contains(item),
        Value::Set(set) | Value::FrozenSet(set) => set.contains(item),
        Value::Range(range) => Ok(match item {
            Value::Int(i) => range.contains(*i),
            Value::Bool(b) => range.contains(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => num_traits::ToPrimitive::to_i64(f).is_some_and(|i| range.contains(i)),
            _ => false,
        }),
        Value::Instance(_) => {
            if let Some(method) = user_special(container, "__contains__") {
                let result = call_method(ctx, &method, container, CallArgs::positional([item.clone()]))?;
                return truthy(ctx, &result);
            }
            contains_by_iteration(ctx, container, item)
        }
        Value::Iterator(_) | Value::Generator(_) => contains_by_iteration(ctx, container, item),
        other => Err(RunError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn contains_in(ctx: &mut ExecCtx, items: &[Value], item: &Value) -> RunResult<bool> {
    for candidate in items {
        if element_eq(ctx, candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn contains_by_iteration(ctx: &mut ExecCtx, container: &Value, item: &Value) -> RunResult<bool> {
    let iterator = crate::ops::iter::iter(ctx, container)?;
    while let Some(candidate) = crate::ops::iter::next(ctx, &iterator)? {
        if element_eq(ctx, &candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `hash(value)`.
pub fn hash(ctx: &mut ExecCtx, value: &Value) -> RunResult<i64> {
    if let Some(method) = user_special(value, "__hash__") {
        if method.is_none() {
            return Err(RunError::type_error(format!("unhashable type: '{}'", value.type_name())));
        }
        let result = call_method(ctx, &method, value, CallArgs::new())?;
        return result
            .as_i64()
            .ok_or_else(|| RunError::type_error("__hash__ method should return an integer"));
    }
    Ok(DictKey::new(value)?.hash_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_and_int_compare_exactly() {
        let big = BigInt::from(2).pow(60) + 1;
        assert_eq!(float_int_cmp(2f64.powi(60), &big), Some(Ordering::Less));
        assert_eq!(float_int_cmp(2.5, &BigInt::from(2)), Some(Ordering::Greater));
        assert_eq!(float_int_cmp(f64::NAN, &BigInt::from(0)), None);
    }

    #[test]
    fn nan_is_only_unequal() {
        assert!(apply(CmpOp::NotEq, None));
        assert!(!apply(CmpOp::Eq, None));
        assert!(!apply(CmpOp::LtE, None));
    }

    #[test]
    fn mixed_numbers_order() {
        assert_eq!(numeric_cmp(&Value::Bool(true), &Value::Float(1.0)), Some(Some(Ordering::Equal)));
        assert_eq!(numeric_cmp(&Value::Int(3), &Value::Float(2.5)), Some(Some(Ordering::Greater)));
        assert_eq!(numeric_cmp(&Value::str("a"), &Value::Int(1)), None);
    }
}
