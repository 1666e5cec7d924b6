//! Subscription: `obj[key]`, `obj[key] = v` and `del obj[key]`.

use std::sync::Arc;

use crate::{
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    ops::{as_index, call::call_special, iter::collect},
    types::{CallArgs, PyRange, PySlice},
    value::Value,
};

/// Resolves a possibly negative index against `len`.
#[must_use]
pub fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

fn sequence_index(ctx: &mut ExecCtx, container: &Value, key: &Value, len: usize, kind: &str) -> RunResult<usize> {
    let Some(index) = as_index(ctx, key)? else {
        return Err(RunError::type_error(format!(
            "{kind} indices must be integers or slices, not {}",
            key.type_name()
        )));
    };
    normalize_index(index, len).ok_or_else(|| {
        let noun = match container {
            Value::Str(_) => "string",
            _ => kind,
        };
        RunError::index_error(format!("{noun} index out of range"))
    })
}

fn pick<T: Clone>(items: &[T], slice: &PySlice) -> RunResult<Vec<T>> {
    Ok(slice.positions(items.len())?.into_iter().map(|i| items[i].clone()).collect())
}

/// `container[key]`.
pub fn get_item(ctx: &mut ExecCtx, container: &Value, key: &Value) -> RunResult<Value> {
    match container {
        Value::List(list) => {
            let items = list.snapshot();
            if let Value::Slice(slice) = key {
                return Ok(Value::list(pick(&items, slice)?));
            }
            let index = sequence_index(ctx, container, key, items.len(), "list")?;
            Ok(items[index].clone())
        }
        Value::Tuple(items) => {
            if let Value::Slice(slice) = key {
                return Ok(Value::tuple(pick(items, slice)?));
            }
            let index = sequence_index(ctx, container, key, items.len(), "tuple")?;
            Ok(items[index].clone())
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            if let Value::Slice(slice) = key {
                return Ok(Value::from(pick(&chars, slice)?.into_iter().collect::<String>()));
            }
            let index = sequence_index(ctx, container, key, chars.len(), "string")?;
            Ok(Value::from(chars[index].to_string()))
        }
        Value::Bytes(bytes) => {
            if let Value::Slice(slice) = key {
                return Ok(Value::Bytes(pick(bytes, slice)?.into()));
            }
            let index = sequence_index(ctx, container, key, bytes.len(), "byte")?;
            Ok(Value::Int(i64::from(bytes[index])))
        }
        Value::Range(range) => {
            if let Value::Slice(slice) = key {
                let (start, stop, step) = slice.indices(range.len())?;
                let sliced = PyRange::new(
                    range.start + start * range.step,
                    range.start + stop * range.step,
                    range.step * step,
                )?;
                return Ok(Value::Range(Arc::new(sliced)));
            }
            let index = sequence_index(ctx, container, key, range.len(), "range object")?;
            range
                .get(index)
                .map(Value::Int)
                .ok_or_else(|| RunError::index_error("range object index out of range"))
        }
        Value::Dict(dict) => dict.get(key)?.ok_or_else(|| RunError::key_error(key.clone())),
        Value::Instance(_) => call_special(ctx, container, "__getitem__", CallArgs::positional([key.clone()]))?
            .ok_or_else(|| not_subscriptable(container)),
        // `list[int]` style annotations evaluate to the class itself.
        Value::Type(_) => Ok(container.clone()),
        other => Err(not_subscriptable(other)),
    }
}

fn not_subscriptable(value: &Value) -> RunError {
    RunError::type_error(format!("'{}' object is not subscriptable", value.type_name()))
}

/// `container[key] = value`.
pub fn set_item(ctx: &mut ExecCtx, container: &Value, key: &Value, value: Value) -> RunResult<()> {
    match container {
        Value::List(list) => {
            if let Value::Slice(slice) = key {
                let replacement = collect(ctx, &value)?;
                return assign_slice(list, slice, replacement);
            }
            let index = sequence_index(ctx, container, key, list.len(), "list")
                .map_err(|err| reword_assignment(err, "list"))?;
            if list.set(index, value) {
                Ok(())
            } else {
                Err(RunError::index_error("list assignment index out of range"))
            }
        }
        Value::Dict(dict) => dict.set(key.clone(), value),
        Value::Instance(_) => {
            call_special(ctx, container, "__setitem__", CallArgs::positional([key.clone(), value]))?
                .map(drop)
                .ok_or_else(|| no_item_assignment(container))
        }
        other => Err(no_item_assignment(other)),
    }
}

fn reword_assignment(err: RunError, kind: &str) -> RunError {
    if err.matches(crate::exception_private::ExcType::IndexError) {
        RunError::index_error(format!("{kind} assignment index out of range"))
    } else {
        err
    }
}

fn no_item_assignment(value: &Value) -> RunError {
    RunError::type_error(format!(
        "'{}' object does not support item assignment",
        value.type_name()
    ))
}

fn assign_slice(list: &crate::types::PyList, slice: &PySlice, replacement: Vec<Value>) -> RunResult<()> {
    let len = list.len();
    let (start, stop, step) = slice.indices(len)?;
    if step == 1 {
        let start = usize::try_from(start).unwrap_or(0);
        let stop = usize::try_from(stop).unwrap_or(0).max(start);
        list.with_mut(|items| {
            items.splice(start..stop.min(items.len()), replacement);
        });
        return Ok(());
    }
    let positions = slice.positions(len)?;
    if positions.len() != replacement.len() {
        return Err(RunError::value_error(format!(
            "attempt to assign sequence of size {} to extended slice of size {}",
            replacement.len(),
            positions.len()
        )));
    }
    list.with_mut(|items| {
        for (position, value) in positions.into_iter().zip(replacement) {
            items[position] = value;
        }
    });
    Ok(())
}

/// `del container[key]`.
pub fn del_item(ctx: &mut ExecCtx, container: &Value, key: &Value) -> RunResult<()> {
    match container {
        Value::List(list) => {
            if let Value::Slice(slice) = key {
                let mut positions = slice.positions(list.len())?;
                positions.sort_unstable();
                list.with_mut(|items| {
                    for position in positions.into_iter().rev() {
                        if position < items.len() {
                            items.remove(position);
                        }
                    }
                });
                return Ok(());
            }
            let index = sequence_index(ctx, container, key, list.len(), "list")
                .map_err(|err| reword_assignment(err, "list"))?;
            list.with_mut(|items| {
                if index < items.len() {
                    items.remove(index);
                }
            });
            Ok(())
        }
        Value::Dict(dict) => match dict.remove(key)? {
            Some(_) => Ok(()),
            None => Err(RunError::key_error(key.clone())),
        },
        Value::Instance(_) => call_special(ctx, container, "__delitem__", CallArgs::positional([key.clone()]))?
            .map(drop)
            .ok_or_else(|| no_item_deletion(container)),
        other => Err(no_item_deletion(other)),
    }
}

fn no_item_deletion(value: &Value) -> RunError {
    RunError::type_error(format!("'{}' object doesn't support item deletion", value.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indexes_wrap_once() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(-4, 3), None);
        assert_eq!(normalize_index(3, 3), None);
        assert_eq!(normalize_index(0, 0), None);
    }

    #[test]
    fn slice_assignment_grows_and_shrinks() {
        let list = crate::types::PyList::new((0..5).map(Value::Int).collect());
        let slice = PySlice {
            start: Value::Int(1),
            stop: Value::Int(3),
            step: Value::None,
        };
        assign_slice(&list, &slice, vec![Value::Int(9)]).unwrap();
        let values: Vec<i64> = list.to_vec().iter().filter_map(Value::as_i64).collect();
        assert_eq!(values, vec![0, 9, 3, 4]);

        let every_other = PySlice {
            start: Value::None,
            stop: Value::None,
            step: Value::Int(2),
        };
        let err = assign_slice(&list, &every_other, vec![Value::Int(1)]).unwrap_err();
        assert!(err.matches(crate::exception_private::ExcType::ValueError));
    }
}
