//! Methods of `set` and `frozenset`.
//!
//! Operations that build a new set return the receiver's kind, so `frozenset.union` gives a
//! `frozenset`. Arguments may be any iterable.

use std::sync::Arc;

use super::wrong_receiver;
use crate::{
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    ops::iter::collect,
    types::{BuiltinFn, CallArgs, PySet},
    value::Value,
};

pub(super) const FROZENSET_METHODS: &[(&str, BuiltinFn)] = &[
    ("copy", copy),
    ("union", union),
    ("intersection", intersection),
    ("difference", difference),
    ("symmetric_difference", symmetric_difference),
    ("issubset", issubset),
    ("issuperset", issuperset),
    ("isdisjoint", isdisjoint),
];

pub(super) const SET_METHODS: &[(&str, BuiltinFn)] = &[
    ("add", add),
    ("remove", remove),
    ("discard", discard),
    ("pop", pop),
    ("clear", clear),
    ("update", update),
    ("intersection_update", intersection_update),
    ("difference_update", difference_update),
    ("copy", copy),
    ("union", union),
    ("intersection", intersection),
    ("difference", difference),
    ("symmetric_difference", symmetric_difference),
    ("issubset", issubset),
    ("issuperset", issuperset),
    ("isdisjoint", isdisjoint),
];

/// The receiver and whether it is frozen.
fn this(args: &mut CallArgs, method: &str) -> RunResult<(Arc<PySet>, bool)> {
    match args.receiver(method)? {
        Value::Set(set) => Ok((set, false)),
        Value::FrozenSet(set) => Ok((set, true)),
        other => Err(wrong_receiver(method, "set", &other)),
    }
}

fn mutable(args: &mut CallArgs, method: &str) -> RunResult<Arc<PySet>> {
    match args.receiver(method)? {
        Value::Set(set) => Ok(set),
        other => Err(wrong_receiver(method, "set", &other)),
    }
}

fn wrap(set: PySet, frozen: bool) -> Value {
    if frozen {
        Value::FrozenSet(Arc::new(set))
    } else {
        Value::Set(Arc::new(set))
    }
}

/// Views any iterable argument as a set.
fn as_set(ctx: &mut ExecCtx, value: &Value) -> RunResult<Arc<PySet>> {
    match value {
        Value::Set(set) | Value::FrozenSet(set) => Ok(Arc::clone(set)),
        other => Ok(Arc::new(PySet::from_values(collect(ctx, other)?)?)),
    }
}

fn add(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let set = mutable(&mut args, "add")?;
    args.check("add", 1, 1)?;
    set.add(args.positional[0].clone())?;
    Ok(Value::None)
}

fn remove(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let set = mutable(&mut args, "remove")?;
    args.check("remove", 1, 1)?;
    if set.remove(&args.positional[0])? {
        Ok(Value::None)
    } else {
        Err(RunError::key_error(args.positional[0].clone()))
    }
}

fn discard(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let set = mutable(&mut args, "discard")?;
    args.check("discard", 1, 1)?;
    set.remove(&args.positional[0])?;
    Ok(Value::None)
}

fn pop(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let set = mutable(&mut args, "pop")?;
    args.check("pop", 0, 0)?;
    set.pop().ok_or_else(|| RunError::key_error(Value::str("pop from an empty set")))
}

fn clear(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let set = mutable(&mut args, "clear")?;
    args.check("clear", 0, 0)?;
    set.clear();
    Ok(Value::None)
}

fn update(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let set = mutable(&mut args, "update")?;
    args.no_keywords("update")?;
    for other in &args.positional {
        for item in collect(ctx, other)? {
            set.add(item)?;
        }
    }
    Ok(Value::None)
}

/// Keeps only the items present in every argument.
fn intersection_update(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let set = mutable(&mut args, "intersection_update")?;
    args.no_keywords("intersection_update")?;
    for other in &args.positional {
        let other = as_set(ctx, other)?;
        for item in set.values() {
            if !other.contains(&item)? {
                set.remove(&item)?;
            }
        }
    }
    Ok(Value::None)
}

fn difference_update(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let set = mutable(&mut args, "difference_update")?;
    args.no_keywords("difference_update")?;
    for other in &args.positional {
        for item in collect(ctx, other)? {
            set.remove(&item)?;
        }
    }
    Ok(Value::None)
}

fn copy(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (set, frozen) = this(&mut args, "copy")?;
    args.check("copy", 0, 0)?;
    Ok(wrap(PySet::from_shared(set.snapshot()), frozen))
}

fn union(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (set, frozen) = this(&mut args, "union")?;
    args.no_keywords("union")?;
    let result = PySet::from_shared(set.snapshot());
    for other in &args.positional {
        for item in collect(ctx, other)? {
            result.add(item)?;
        }
    }
    Ok(wrap(result, frozen))
}

fn intersection(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (set, frozen) = this(&mut args, "intersection")?;
    args.no_keywords("intersection")?;
    let mut items = set.values();
    for other in &args.positional {
        let other = as_set(ctx, other)?;
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            if other.contains(&item)? {
                kept.push(item);
            }
        }
        items = kept;
    }
    Ok(wrap(PySet::from_values(items)?, frozen))
}

fn difference(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (set, frozen) = this(&mut args, "difference")?;
    args.no_keywords("difference")?;
    let result = PySet::from_shared(set.snapshot());
    for other in &args.positional {
        for item in collect(ctx, other)? {
            result.remove(&item)?;
        }
    }
    Ok(wrap(result, frozen))
}

fn symmetric_difference(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (set, frozen) = this(&mut args, "symmetric_difference")?;
    args.check("symmetric_difference", 1, 1)?;
    let other = as_set(ctx, &args.positional[0])?;
    let result = PySet::new();
    for item in set.values() {
        if !other.contains(&item)? {
            result.add(item)?;
        }
    }
    for item in other.values() {
        if !set.contains(&item)? {
            result.add(item)?;
        }
    }
    Ok(wrap(result, frozen))
}

fn issubset(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (set, _) = this(&mut args, "issubset")?;
    args.check("issubset", 1, 1)?;
    let other = as_set(ctx, &args.positional[0])?;
    Ok(Value::Bool(set.is_subset(&other)))
}

fn issuperset(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (set, _) = this(&mut args, "issuperset")?;
    args.check("issuperset", 1, 1)?;
    let other = as_set(ctx, &args.positional[0])?;
    Ok(Value::Bool(other.is_subset(&set)))
}

fn isdisjoint(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (set, _) = this(&mut args, "isdisjoint")?;
    args.check("isdisjoint", 1, 1)?;
    for item in collect(ctx, &args.positional[0])? {
        if set.contains(&item)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::HostConfig, exception_private::ExcType, tracer::NoopTracer};

    fn ctx() -> ExecCtx {
        ExecCtx::for_tests(HostConfig::default(), Arc::new(NoopTracer))
    }

    fn set_of(values: &[i64]) -> PySet {
        PySet::from_values(values.iter().map(|&i| Value::Int(i))).unwrap()
    }

    fn sorted_ints(value: &Value) -> Vec<i64> {
        let (Value::Set(set) | Value::FrozenSet(set)) = value else {
            panic!("not a set: {value:?}");
        };
        let mut ints: Vec<i64> = set.values().iter().filter_map(Value::as_i64).collect();
        ints.sort_unstable();
        ints
    }

    #[test]
    fn frozen_receivers_stay_frozen() {
        let mut ctx = ctx();
        let frozen = Value::FrozenSet(Arc::new(set_of(&[1, 2])));
        let args = CallArgs::positional([Value::list(vec![Value::Int(3)])]).with_receiver(frozen);
        let result = union(&mut ctx, args).unwrap();
        assert!(matches!(result, Value::FrozenSet(_)));
        assert_eq!(sorted_ints(&result), vec![1, 2, 3]);
    }

    #[test]
    fn algebra_over_iterables() {
        let mut ctx = ctx();
        let set = Value::Set(Arc::new(set_of(&[1, 2, 3])));
        let other = Value::list(vec![Value::Int(2), Value::Int(4)]);
        let inter = intersection(&mut ctx, CallArgs::positional([other.clone()]).with_receiver(set.clone())).unwrap();
        assert_eq!(sorted_ints(&inter), vec![2]);
        let diff = difference(&mut ctx, CallArgs::positional([other.clone()]).with_receiver(set.clone())).unwrap();
        assert_eq!(sorted_ints(&diff), vec![1, 3]);
        let sym = symmetric_difference(&mut ctx, CallArgs::positional([other]).with_receiver(set)).unwrap();
        assert_eq!(sorted_ints(&sym), vec![1, 3, 4]);
    }

    #[test]
    fn remove_missing_raises_but_discard_does_not() {
        let mut ctx = ctx();
        let set = Arc::new(set_of(&[1]));
        let receiver = Value::Set(Arc::clone(&set));
        discard(&mut ctx, CallArgs::positional([Value::Int(9)]).with_receiver(receiver.clone())).unwrap();
        let err = remove(&mut ctx, CallArgs::positional([Value::Int(9)]).with_receiver(receiver.clone())).unwrap_err();
        assert!(err.matches(ExcType::KeyError));
        pop(&mut ctx, CallArgs::new().with_receiver(receiver.clone())).unwrap();
        let err = pop(&mut ctx, CallArgs::new().with_receiver(receiver)).unwrap_err();
        assert!(err.matches(ExcType::KeyError));
        assert!(set.is_empty());
    }
}
