//! Iteration builtins: `iter`, `next`, the lazy adapters (`enumerate`, `zip`, `map`,
//! `filter`, `reversed`) and the reductions `any`, `all` and `sum`.

use super::keyword_only;
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    expressions::Operator,
    interp::ExecCtx,
    ops::{
        self, arith,
        call::call_special,
        compare::truthy,
        iter::{collect, iter, next, next_or_stop},
    },
    types::{CallArgs, IterState, PyIterator},
    value::Value,
};

pub fn builtin_iter(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("iter", 1, 1)?;
    iter(ctx, &args.positional[0])
}

/// `next(iterator[, default])`.
pub fn builtin_next(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("next", 1, 2)?;
    match (next_or_stop(ctx, &args.positional[0]), args.get(1)) {
        (Err(err), Some(default)) if err.matches(ExcType::StopIteration) => Ok(default.clone()),
        (result, _) => result,
    }
}

/// `enumerate(iterable, start=0)`.
pub fn builtin_enumerate(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let [start] = keyword_only(&mut args, "enumerate", ["start"])?;
    args.check("enumerate", 1, 2)?;
    let start = match args.get(1).cloned().or(start) {
        Some(value) => ops::expect_index(ctx, &value)?,
        None => 0,
    };
    let inner = iter(ctx, &args.positional[0])?;
    Ok(PyIterator::value(IterState::Enumerate { inner, count: start }))
}

/// `zip(*iterables)`: stops at the shortest input.
pub fn builtin_zip(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.no_keywords("zip")?;
    let inners = args
        .positional
        .iter()
        .map(|iterable| iter(ctx, iterable))
        .collect::<RunResult<Vec<_>>>()?;
    Ok(PyIterator::value(IterState::Zip { inners }))
}

/// `map(func, *iterables)`.
pub fn builtin_map(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.no_keywords("map")?;
    let Some((func, iterables)) = args.positional.split_first() else {
        return Err(RunError::type_error("map() must have at least two arguments."));
    };
    if iterables.is_empty() {
        return Err(RunError::type_error("map() must have at least two arguments."));
    }
    let inners = iterables
        .iter()
        .map(|iterable| iter(ctx, iterable))
        .collect::<RunResult<Vec<_>>>()?;
    Ok(PyIterator::value(IterState::Map {
        func: func.clone(),
        inners,
    }))
}

/// `filter(func, iterable)`; a `None` function keeps truthy items.
pub fn builtin_filter(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("filter", 2, 2)?;
    let inner = iter(ctx, &args.positional[1])?;
    Ok(PyIterator::value(IterState::Filter {
        func: args.positional[0].clone(),
        inner,
    }))
}

/// `reversed(seq)`: sequences are snapshotted, instances may supply `__reversed__`.
pub fn builtin_reversed(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("reversed", 1, 1)?;
    let seq = &args.positional[0];
    let items = match seq {
        Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Bytes(_) | Value::Range(_) | Value::Dict(_) => {
            collect(ctx, seq)?
        }
        Value::Instance(_) => match call_special(ctx, seq, "__reversed__", CallArgs::new())? {
            Some(iterator) => return Ok(iterator),
            None => return Err(not_reversible(seq)),
        },
        other => return Err(not_reversible(other)),
    };
    Ok(PyIterator::value(IterState::Reversed { items }))
}

fn not_reversible(value: &Value) -> RunError {
    RunError::type_error(format!("'{}' object is not reversible", value.type_name()))
}

pub fn builtin_any(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("any", 1, 1)?;
    let it = iter(ctx, &args.positional[0])?;
    while let Some(item) = next(ctx, &it)? {
        if truthy(ctx, &item)? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

pub fn builtin_all(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("all", 1, 1)?;
    let it = iter(ctx, &args.positional[0])?;
    while let Some(item) = next(ctx, &it)? {
        if !truthy(ctx, &item)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

/// `sum(iterable, start=0)`.
pub fn builtin_sum(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let [start] = keyword_only(&mut args, "sum", ["start"])?;
    args.check("sum", 1, 2)?;
    let mut total = args.get(1).cloned().or(start).unwrap_or(Value::Int(0));
    match total {
        Value::Str(_) => return Err(RunError::type_error("sum() can't sum strings [use ''.join(seq) instead]")),
        Value::Bytes(_) => return Err(RunError::type_error("sum() can't sum bytes [use b''.join(seq) instead]")),
        _ => {}
    }
    let it = iter(ctx, &args.positional[0])?;
    while let Some(item) = next(ctx, &it)? {
        total = arith::binary(ctx, Operator::Add, &total, &item)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::HostConfig, tracer::NoopTracer};

    fn ctx() -> ExecCtx {
        ExecCtx::for_tests(HostConfig::default(), Arc::new(NoopTracer))
    }

    fn ints(values: &[Value]) -> Vec<i64> {
        values.iter().filter_map(Value::as_i64).collect()
    }

    #[test]
    fn reversed_walks_backwards() {
        let mut ctx = ctx();
        let list = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let it = builtin_reversed(&mut ctx, CallArgs::positional([list])).unwrap();
        assert_eq!(ints(&collect(&mut ctx, &it).unwrap()), vec![3, 2, 1]);
    }

    #[test]
    fn enumerate_honors_start_keyword() {
        let mut ctx = ctx();
        let mut args = CallArgs::positional([Value::str("ab")]);
        args.keywords.push((Arc::from("start"), Value::Int(5)));
        let it = builtin_enumerate(&mut ctx, args).unwrap();
        let pairs = collect(&mut ctx, &it).unwrap();
        let firsts: Vec<i64> = pairs
            .iter()
            .filter_map(|pair| match pair {
                Value::Tuple(items) => items[0].as_i64(),
                _ => None,
            })
            .collect();
        assert_eq!(firsts, vec![5, 6]);
    }

    #[test]
    fn sum_rejects_string_start() {
        let mut ctx = ctx();
        let args = CallArgs::positional([Value::list(vec![]), Value::str("")]);
        let err = builtin_sum(&mut ctx, args).unwrap_err();
        assert_eq!(err.message(), "sum() can't sum strings [use ''.join(seq) instead]");
        let args = CallArgs::positional([Value::tuple(vec![Value::Int(1), Value::Int(2)])]);
        assert_eq!(builtin_sum(&mut ctx, args).unwrap().as_i64(), Some(3));
    }
}
