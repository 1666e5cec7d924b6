//! Implementation of the sorted() builtin function and the sort shared with `list.sort`.

use std::cmp::Ordering;

use super::keyword_only;
use crate::{
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    ops::{
        call::call,
        compare::{less_than, truthy},
        iter::collect,
    },
    types::CallArgs,
    value::Value,
};

/// Stable sort of `items` using `<`, optionally through a key function.
///
/// The first comparison error aborts the sort and is returned; the order of `items` at that
/// point is unspecified.
pub(crate) fn sort_values(ctx: &mut ExecCtx, items: Vec<Value>, key: Option<&Value>, reverse: bool) -> RunResult<Vec<Value>> {
    let keys = match key {
        Some(func) => items
            .iter()
            .map(|item| call(ctx, func, CallArgs::positional([item.clone()])))
            .collect::<RunResult<Vec<_>>>()?,
        None => items.clone(),
    };
    let mut order: Vec<(Value, Value)> = keys.into_iter().zip(items).collect();
    let mut failure: Option<RunError> = None;
    order.sort_by(|(a, _), (b, _)| {
        if failure.is_some() {
            return Ordering::Equal;
        }
        let (a, b) = if reverse { (b, a) } else { (a, b) };
        match ordering(ctx, a, b) {
            Ok(ordering) => ordering,
            Err(err) => {
                failure = Some(err);
                Ordering::Equal
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(order.into_iter().map(|(_, item)| item).collect()),
    }
}

fn ordering(ctx: &mut ExecCtx, a: &Value, b: &Value) -> RunResult<Ordering> {
    if less_than(ctx, a, b)? {
        Ok(Ordering::Less)
    } else if less_than(ctx, b, a)? {
        Ok(Ordering::Greater)
    } else {
        Ok(Ordering::Equal)
    }
}

/// Reads the `key=` and `reverse=` keywords shared by `sorted` and `list.sort`.
pub(crate) fn sort_options(ctx: &mut ExecCtx, args: &mut CallArgs, func: &str) -> RunResult<(Option<Value>, bool)> {
    let [key, reverse] = keyword_only(args, func, ["key", "reverse"])?;
    let key = key.filter(|key| !key.is_none());
    let reverse = match reverse {
        Some(flag) => truthy(ctx, &flag)?,
        None => false,
    };
    Ok((key, reverse))
}

/// Implementation of the sorted() builtin function.
///
/// Returns a new sorted list from the items in an iterable.
pub fn builtin_sorted(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let (key, reverse) = sort_options(ctx, &mut args, "sorted")?;
    if args.positional.len() != 1 {
        return Err(RunError::type_error(format!(
            "sorted expected 1 argument, got {}",
            args.positional.len()
        )));
    }
    let items = collect(ctx, &args.positional[0])?;
    sort_values(ctx, items, key.as_ref(), reverse).map(Value::list)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::HostConfig, exception_private::ExcType, tracer::NoopTracer};

    fn ctx() -> ExecCtx {
        ExecCtx::for_tests(HostConfig::default(), Arc::new(NoopTracer))
    }

    #[test]
    fn reverse_sort_keeps_equal_items_in_order() {
        let mut ctx = ctx();
        let pair = |k: i64, tag: &str| Value::tuple(vec![Value::Int(k), Value::str(tag)]);
        let key = crate::types::BuiltinFunction::value("first", |_, args| {
            Ok(match &args.positional[0] {
                Value::Tuple(items) => items[0].clone(),
                other => other.clone(),
            })
        });
        let items = vec![pair(1, "a"), pair(2, "b"), pair(1, "c"), pair(2, "d")];
        let sorted = sort_values(&mut ctx, items, Some(&key), true).unwrap();
        let tags: Vec<String> = sorted
            .iter()
            .map(|v| match v {
                Value::Tuple(items) => items[1].as_str().unwrap_or_default().to_owned(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(tags, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn incomparable_items_raise() {
        let mut ctx = ctx();
        let err = sort_values(&mut ctx, vec![Value::Int(1), Value::str("x")], None, false).unwrap_err();
        assert!(err.matches(ExcType::TypeError));
    }
}
