//! The iteration protocol.
//!
//! Builtin iterators advance under their own lock. States that call back into user code
//! (`map`, `filter`, `zip`, `enumerate`) are moved out and replaced by `Running` while they
//! advance, so the lock is never held across a call and re-entrant use is detected.

use std::sync::Arc;

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    interp::{ExecCtx, generator},
    ops::{
        call::{call, call_special},
        compare::truthy,
    },
    types::{CallArgs, IterState, PyIterator},
    value::Value,
};

/// `iter(value)`.
pub fn iter(ctx: &mut ExecCtx, value: &Value) -> RunResult<Value> {
    let state = match value {
        Value::Iterator(_) | Value::Generator(_) => return Ok(value.clone()),
        Value::List(list) => IterState::List {
            list: Arc::clone(list),
            index: 0,
        },
        Value::Tuple(items) => IterState::Items {
            items: Arc::clone(items),
            index: 0,
        },
        Value::Str(text) => IterState::Chars {
            text: Arc::clone(text),
            offset: 0,
        },
        Value::Bytes(bytes) => IterState::Bytes {
            bytes: Arc::clone(bytes),
            index: 0,
        },
        Value::Range(range) => IterState::Range {
            range: **range,
            index: 0,
        },
        Value::Dict(dict) => IterState::Items {
            items: dict.keys().into(),
            index: 0,
        },
        Value::Set(set) | Value::FrozenSet(set) => IterState::Items {
            items: set.values().into(),
            index: 0,
        },
        Value::Instance(_) => {
            let Some(iterator) = call_special(ctx, value, "__iter__", CallArgs::new())? else {
                return Err(not_iterable(value));
            };
            if !is_iterator(&iterator) {
                return Err(RunError::type_error(format!(
                    "iter() returned non-iterator of type '{}'",
                    iterator.type_name()
                )));
            }
            return Ok(iterator);
        }
        other => return Err(not_iterable(other)),
    };
    Ok(PyIterator::value(state))
}

fn not_iterable(value: &Value) -> RunError {
    RunError::type_error(format!("'{}' object is not iterable", value.type_name()))
}

fn is_iterator(value: &Value) -> bool {
    match value {
        Value::Iterator(_) | Value::Generator(_) => true,
        Value::Instance(_) => crate::ops::attr::user_special(value, "__next__").is_some(),
        _ => false,
    }
}

/// Advances an iterator. `None` means exhausted.
pub fn next(ctx: &mut ExecCtx, iterator: &Value) -> RunResult<Option<Value>> {
    match iterator {
        Value::Iterator(it) => advance(ctx, it),
        Value::Generator(generator) => generator::next(ctx, generator),
        Value::Instance(_) => match call_special(ctx, iterator, "__next__", CallArgs::new()) {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => Err(not_iterator(iterator)),
            Err(err) if err.matches(ExcType::StopIteration) => Ok(None),
            Err(err) => Err(err),
        },
        other => Err(not_iterator(other)),
    }
}

/// Advances an iterator the way `next()` does: exhaustion raises `StopIteration`, carrying
/// a generator's return value or whatever a user `__next__` raised.
pub fn next_or_stop(ctx: &mut ExecCtx, iterator: &Value) -> RunResult<Value> {
    match iterator {
        Value::Generator(generator) => generator::send(ctx, generator, Value::None),
        Value::Instance(_) => match call_special(ctx, iterator, "__next__", CallArgs::new())? {
            Some(value) => Ok(value),
            None => Err(not_iterator(iterator)),
        },
        _ => next(ctx, iterator)?.ok_or_else(|| RunError::stop_iteration(Value::None)),
    }
}

fn not_iterator(value: &Value) -> RunError {
    RunError::type_error(format!("'{}' object is not an iterator", value.type_name()))
}

fn advance(ctx: &mut ExecCtx, it: &PyIterator) -> RunResult<Option<Value>> {
    let mut state = it.state.lock();
    let calls_back = matches!(
        *state,
        IterState::Enumerate { .. } | IterState::Zip { .. } | IterState::Map { .. } | IterState::Filter { .. }
    );
    if calls_back {
        let taken = std::mem::replace(&mut *state, IterState::Running);
        drop(state);
        return advance_calling(ctx, it, taken);
    }
    let item = match &mut *state {
        IterState::List { list, index } => {
            let item = list.get(*index);
            *index += 1;
            item
        }
        IterState::Items { items, index } => {
            let item = items.get(*index).cloned();
            *index += 1;
            item
        }
        IterState::Chars { text, offset } => {
            let next_char = text.get(*offset..).and_then(|rest| rest.chars().next());
            next_char.map(|c| {
                *offset += c.len_utf8();
                Value::from(c.to_string())
            })
        }
        IterState::Bytes { bytes, index } => {
            let item = bytes.get(*index).map(|b| Value::Int(i64::from(*b)));
            *index += 1;
            item
        }
        IterState::Range { range, index } => {
            let item = range.get(*index).map(Value::Int);
            *index += 1;
            item
        }
        IterState::Reversed { items } => items.pop(),
        IterState::Running => return Err(RunError::value_error("iterator already executing")),
        _ => None,
    };
    if item.is_none() {
        *state = IterState::Exhausted;
    }
    Ok(item)
}

fn advance_calling(ctx: &mut ExecCtx, it: &PyIterator, mut taken: IterState) -> RunResult<Option<Value>> {
    let result = step_calling(ctx, &mut taken);
    let exhausted = matches!(result, Ok(None));
    *it.state.lock() = if exhausted { IterState::Exhausted } else { taken };
    result
}

fn next_of_each(ctx: &mut ExecCtx, inners: &[Value]) -> RunResult<Option<Vec<Value>>> {
    let mut items = Vec::with_capacity(inners.len());
    for inner in inners {
        match next(ctx, inner)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(items))
}

fn step_calling(ctx: &mut ExecCtx, state: &mut IterState) -> RunResult<Option<Value>> {
    match state {
        IterState::Enumerate { inner, count } => {
            let Some(item) = next(ctx, inner)? else {
                return Ok(None);
            };
            let index = *count;
            *count += 1;
            Ok(Some(Value::tuple(vec![Value::Int(index), item])))
        }
        IterState::Zip { inners } => match next_of_each(ctx, inners)? {
            Some(items) if !items.is_empty() => Ok(Some(Value::tuple(items))),
            _ => Ok(None),
        },
        IterState::Map { func, inners } => match next_of_each(ctx, inners)? {
            Some(items) => call(ctx, func, CallArgs::positional(items)).map(Some),
            None => Ok(None),
        },
        IterState::Filter { func, inner } => loop {
            let Some(item) = next(ctx, inner)? else {
                return Ok(None);
            };
            let keep = if func.is_none() {
                truthy(ctx, &item)?
            } else {
                let verdict = call(ctx, func, CallArgs::positional([item.clone()]))?;
                truthy(ctx, &verdict)?
            };
            if keep {
                return Ok(Some(item));
            }
        },
        _ => Ok(None),
    }
}

/// Drains any iterable into a vector.
pub fn collect(ctx: &mut ExecCtx, iterable: &Value) -> RunResult<Vec<Value>> {
    match iterable {
        Value::List(list) => return Ok(list.to_vec()),
        Value::Tuple(items) => return Ok(items.to_vec()),
        _ => {}
    }
    let iterator = iter(ctx, iterable)?;
    let mut items = Vec::new();
    while let Some(item) = next(ctx, &iterator)? {
        items.push(item);
    }
    Ok(items)
}

/// Unpacks exactly `count` values, as `a, b = value` does.
pub fn unpack(ctx: &mut ExecCtx, value: &Value, count: usize) -> RunResult<Vec<Value>> {
    let items = collect(ctx, value).map_err(|err| reword_not_iterable(err, value))?;
    match items.len().cmp(&count) {
        std::cmp::Ordering::Equal => Ok(items),
        std::cmp::Ordering::Less => Err(RunError::value_error(format!(
            "not enough values to unpack (expected {count}, got {})",
            items.len()
        ))),
        std::cmp::Ordering::Greater => Err(RunError::value_error(format!(
            "too many values to unpack (expected {count})"
        ))),
    }
}

/// Unpacks into `before` values, a list of the middle, and `after` values: `a, *b, c = value`.
pub fn unpack_star(ctx: &mut ExecCtx, value: &Value, before: usize, after: usize) -> RunResult<Vec<Value>> {
    let mut items = collect(ctx, value).map_err(|err| reword_not_iterable(err, value))?;
    if items.len() < before + after {
        return Err(RunError::value_error(format!(
            "not enough values to unpack (expected at least {}, got {})",
            before + after,
            items.len()
        )));
    }
    let tail = items.split_off(items.len() - after);
    let middle = items.split_off(before);
    items.push(Value::list(middle));
    items.extend(tail);
    Ok(items)
}

fn reword_not_iterable(err: RunError, value: &Value) -> RunError {
    if err.matches(ExcType::TypeError) && !matches!(value, Value::Instance(_)) && err.message().ends_with("is not iterable") {
        RunError::type_error(format!(
            "cannot unpack non-iterable {} object",
            value.type_name()
        ))
    } else {
        err
    }
}
