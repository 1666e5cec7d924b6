//! Methods of `list`.
//!
//! Comparisons may run user code, so none of them happen while the list's storage is locked:
//! methods search a snapshot and then apply the mutation.

use std::sync::Arc;

use super::{count_equal, find_equal, slice_bounds, wrong_receiver};
use crate::{
    builtins::{sort_values, sorted::sort_options},
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    ops::{self, format::repr, item::normalize_index, iter::collect},
    types::{BuiltinFn, CallArgs, PyList},
    value::Value,
};

pub(super) const METHODS: &[(&str, BuiltinFn)] = &[
    ("append", append),
    ("extend", extend),
    ("insert", insert),
    ("pop", pop),
    ("remove", remove),
    ("index", index),
    ("count", count),
    ("clear", clear),
    ("copy", copy),
    ("reverse", reverse),
    ("sort", sort),
];

fn this(args: &mut CallArgs, method: &str) -> RunResult<Arc<PyList>> {
    match args.receiver(method)? {
        Value::List(list) => Ok(list),
        other => Err(wrong_receiver(method, "list", &other)),
    }
}

fn append(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "append")?;
    args.check("append", 1, 1)?;
    list.push(args.positional[0].clone());
    Ok(Value::None)
}

fn extend(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "extend")?;
    args.check("extend", 1, 1)?;
    let items = collect(ctx, &args.positional[0])?;
    list.extend(items);
    Ok(Value::None)
}

/// Out-of-range positions clamp to the ends.
fn insert(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "insert")?;
    args.check("insert", 2, 2)?;
    let index = ops::expect_index(ctx, &args.positional[0])?;
    let value = args.positional[1].clone();
    list.with_mut(|items| {
        let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
        let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
        items.insert(usize::try_from(at).unwrap_or(0), value);
    });
    Ok(Value::None)
}

fn pop(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "pop")?;
    args.check("pop", 0, 1)?;
    let index = match args.get(0) {
        Some(value) => ops::expect_index(ctx, value)?,
        None => -1,
    };
    list.with_mut(|items| {
        if items.is_empty() {
            return Err(RunError::index_error("pop from empty list"));
        }
        let at = normalize_index(index, items.len()).ok_or_else(|| RunError::index_error("pop index out of range"))?;
        Ok(items.remove(at))
    })
}

fn remove(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "remove")?;
    args.check("remove", 1, 1)?;
    let snapshot = list.snapshot();
    let Some(at) = find_equal(ctx, &snapshot, &args.positional[0], 0, snapshot.len())? else {
        return Err(RunError::value_error("list.remove(x): x not in list"));
    };
    list.with_mut(|items| {
        if at < items.len() {
            items.remove(at);
        }
    });
    Ok(Value::None)
}

fn index(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "index")?;
    args.check("index", 1, 3)?;
    let snapshot = list.snapshot();
    let (start, end) = slice_bounds(ctx, args.get(1), args.get(2), snapshot.len())?;
    match find_equal(ctx, &snapshot, &args.positional[0], start, end)? {
        Some(at) => Ok(Value::from(at)),
        None => Err(RunError::value_error(format!(
            "{} is not in list",
            repr(ctx, &args.positional[0])?
        ))),
    }
}

fn count(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "count")?;
    args.check("count", 1, 1)?;
    count_equal(ctx, &list.snapshot(), &args.positional[0]).map(Value::from)
}

fn clear(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "clear")?;
    args.check("clear", 0, 0)?;
    list.replace(Vec::new());
    Ok(Value::None)
}

/// Shallow copy; the new list shares storage until either side writes.
fn copy(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "copy")?;
    args.check("copy", 0, 0)?;
    Ok(Value::List(Arc::new(PyList::from_shared(list.snapshot()))))
}

fn reverse(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "reverse")?;
    args.check("reverse", 0, 0)?;
    list.with_mut(|items| items.reverse());
    Ok(Value::None)
}

/// `list.sort(*, key=None, reverse=False)`: stable, in place.
fn sort(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let list = this(&mut args, "sort")?;
    let (key, reverse) = sort_options(ctx, &mut args, "sort")?;
    args.check("sort", 0, 0)?;
    let sorted = sort_values(ctx, list.to_vec(), key.as_ref(), reverse)?;
    list.replace(sorted);
    Ok(Value::None)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::HostConfig, exception_private::ExcType, tracer::NoopTracer};

    fn ctx() -> ExecCtx {
        ExecCtx::for_tests(HostConfig::default(), Arc::new(NoopTracer))
    }

    fn ints(list: &PyList) -> Vec<i64> {
        list.to_vec().iter().filter_map(Value::as_i64).collect()
    }

    fn run(ctx: &mut ExecCtx, method: BuiltinFn, list: &Arc<PyList>, args: Vec<Value>) -> RunResult<Value> {
        method(ctx, CallArgs::positional(args).with_receiver(Value::List(Arc::clone(list))))
    }

    #[test]
    fn insert_and_pop_clamp_like_python() {
        let mut ctx = ctx();
        let list = Arc::new(PyList::new(vec![Value::Int(1), Value::Int(2)]));
        run(&mut ctx, insert, &list, vec![Value::Int(-10), Value::Int(0)]).unwrap();
        run(&mut ctx, insert, &list, vec![Value::Int(99), Value::Int(3)]).unwrap();
        assert_eq!(ints(&list), vec![0, 1, 2, 3]);
        assert_eq!(run(&mut ctx, pop, &list, vec![]).unwrap().as_i64(), Some(3));
        assert_eq!(run(&mut ctx, pop, &list, vec![Value::Int(0)]).unwrap().as_i64(), Some(0));
        let err = run(&mut ctx, pop, &list, vec![Value::Int(5)]).unwrap_err();
        assert_eq!(err.message(), "pop index out of range");
    }

    #[test]
    fn remove_and_index_use_equality() {
        let mut ctx = ctx();
        let list = Arc::new(PyList::new(vec![Value::Int(1), Value::Float(2.0), Value::Int(2)]));
        assert_eq!(run(&mut ctx, index, &list, vec![Value::Int(2)]).unwrap().as_i64(), Some(1));
        run(&mut ctx, remove, &list, vec![Value::Int(2)]).unwrap();
        assert_eq!(ints(&list), vec![1, 2]);
        let err = run(&mut ctx, index, &list, vec![Value::Int(7)]).unwrap_err();
        assert!(err.matches(ExcType::ValueError));
        assert_eq!(err.message(), "7 is not in list");
    }

    #[test]
    fn copies_diverge_on_write() {
        let mut ctx = ctx();
        let list = Arc::new(PyList::new(vec![Value::Int(1)]));
        let Value::List(copied) = run(&mut ctx, copy, &list, vec![]).unwrap() else {
            panic!("copy returned a non-list");
        };
        assert!(copied.shares_storage(&list));
        run(&mut ctx, append, &copied, vec![Value::Int(2)]).unwrap();
        assert_eq!(ints(&list), vec![1]);
        assert_eq!(ints(&copied), vec![1, 2]);
    }

    #[test]
    fn sort_in_place_with_reverse() {
        let mut ctx = ctx();
        let list = Arc::new(PyList::new(vec![Value::Int(2), Value::Int(3), Value::Int(1)]));
        let mut args = CallArgs::new().with_receiver(Value::List(Arc::clone(&list)));
        args.keywords.push((Arc::from("reverse"), Value::Bool(true)));
        sort(&mut ctx, args).unwrap();
        assert_eq!(ints(&list), vec![3, 2, 1]);
    }
}
