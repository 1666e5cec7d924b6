//! Implementation of the min() and max() builtin functions.

use super::keyword_only;
use crate::{
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    ops::{call::call, compare::less_than, iter::collect},
    types::CallArgs,
    value::Value,
};

/// Implementation of the min() builtin function.
///
/// Returns the smallest item in an iterable or the smallest of two or more arguments.
/// Supports two forms:
/// - `min(iterable, *, key=None, default=...)` - returns smallest item from iterable
/// - `min(arg1, arg2, ..., *, key=None)` - returns smallest of the arguments
pub fn builtin_min(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    builtin_min_max(ctx, args, true)
}

/// Implementation of the max() builtin function.
///
/// Mirror image of [`builtin_min`].
pub fn builtin_max(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    builtin_min_max(ctx, args, false)
}

/// Shared implementation for min() and max().
///
/// Ties keep the first item seen, as in CPython.
fn builtin_min_max(ctx: &mut ExecCtx, mut args: CallArgs, is_min: bool) -> RunResult<Value> {
    let func_name = if is_min { "min" } else { "max" };
    let [key, default] = keyword_only(&mut args, func_name, ["key", "default"])?;
    let key = key.filter(|key| !key.is_none());
    let items = match args.positional.len() {
        0 => {
            return Err(RunError::type_error(format!(
                "{func_name} expected at least 1 argument, got 0"
            )));
        }
        1 => collect(ctx, &args.positional[0])?,
        _ => {
            if default.is_some() {
                return Err(RunError::type_error(format!(
                    "Cannot specify a default for {func_name}() with multiple positional arguments"
                )));
            }
            args.positional.into_vec()
        }
    };

    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let item_key = match &key {
            Some(func) => call(ctx, func, CallArgs::positional([item.clone()]))?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_key, _)) if is_min => less_than(ctx, &item_key, best_key)?,
            Some((best_key, _)) => less_than(ctx, best_key, &item_key)?,
        };
        if replace {
            best = Some((item_key, item));
        }
    }
    match (best, default) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(RunError::value_error(format!("{func_name}() iterable argument is empty"))),
    }
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

    #[test]
    fn ties_keep_the_first_item() {
        let mut ctx = ctx();
        let a = Value::list(vec![]);
        let b = Value::list(vec![]);
        let len_key = crate::types::BuiltinFunction::value("zero", |_, _| Ok(Value::Int(0)));
        let mut args = CallArgs::positional([a.clone(), b]);
        args.keywords.push((Arc::from("key"), len_key));
        assert!(builtin_max(&mut ctx, args).unwrap().is(&a));
    }

    #[test]
    fn empty_iterables_need_a_default() {
        let mut ctx = ctx();
        let err = builtin_min(&mut ctx, CallArgs::positional([Value::list(vec![])])).unwrap_err();
        assert_eq!(err.message(), "min() iterable argument is empty");
        let mut args = CallArgs::positional([Value::list(vec![])]);
        args.keywords.push((Arc::from("default"), Value::Int(7)));
        assert_eq!(builtin_min(&mut ctx, args).unwrap().as_i64(), Some(7));
    }
}
