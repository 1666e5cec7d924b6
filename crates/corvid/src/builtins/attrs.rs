//! Object protocol builtins: `len`, `repr`, `id`, `hash`, `callable`, `format` and the
//! attribute functions.

use std::sync::Arc;

use crate::{
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    ops::{self, attr, call::call_special, format},
    types::CallArgs,
    value::Value,
};

/// `len(obj)` as a native length.
pub(crate) fn length(ctx: &mut ExecCtx, value: &Value) -> RunResult<usize> {
    Ok(match value {
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Tuple(items) => items.len(),
        Value::List(list) => list.len(),
        Value::Dict(dict) => dict.len(),
        Value::Set(set) | Value::FrozenSet(set) => set.len(),
        Value::Range(range) => range.len(),
        Value::Instance(_) => {
            let Some(result) = call_special(ctx, value, "__len__", CallArgs::new())? else {
                return Err(no_len(value));
            };
            let n = ops::expect_index(ctx, &result)?;
            return usize::try_from(n).map_err(|_| RunError::value_error("__len__() should return >= 0"));
        }
        other => return Err(no_len(other)),
    })
}

fn no_len(value: &Value) -> RunError {
    RunError::type_error(format!("object of type '{}' has no len()", value.type_name()))
}

pub fn builtin_len(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("len", 1, 1)?;
    length(ctx, &args.positional[0]).map(Value::from)
}

pub fn builtin_repr(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("repr", 1, 1)?;
    format::repr(ctx, &args.positional[0]).map(Value::from)
}

pub fn builtin_id(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("id", 1, 1)?;
    Ok(Value::from(args.positional[0].id()))
}

pub fn builtin_hash(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("hash", 1, 1)?;
    ops::compare::hash(ctx, &args.positional[0]).map(Value::Int)
}

pub fn builtin_callable(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("callable", 1, 1)?;
    Ok(Value::Bool(ops::call::is_callable(&args.positional[0])))
}

/// `format(value, spec='')`.
pub fn builtin_format(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("format", 1, 2)?;
    let spec = match args.get(1) {
        None => "",
        Some(Value::Str(spec)) => spec,
        Some(other) => {
            return Err(RunError::type_error(format!(
                "format() argument 2 must be str, not {}",
                other.type_name()
            )));
        }
    };
    format::format_value(ctx, &args.positional[0], spec).map(Value::from)
}

fn attr_name(value: &Value) -> RunResult<Arc<str>> {
    match value {
        Value::Str(name) => Ok(Arc::clone(name)),
        other => Err(RunError::type_error(format!(
            "attribute name must be string, not '{}'",
            other.type_name()
        ))),
    }
}

/// `getattr(obj, name[, default])`.
pub fn builtin_getattr(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("getattr", 2, 3)?;
    let name = attr_name(&args.positional[1])?;
    match args.get(2) {
        None => attr::get_attr(ctx, &args.positional[0], &name),
        Some(default) => Ok(attr::get_attr_opt(ctx, &args.positional[0], &name)?.unwrap_or_else(|| default.clone())),
    }
}

pub fn builtin_setattr(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("setattr", 3, 3)?;
    let name = attr_name(&args.positional[1])?;
    attr::set_attr(ctx, &args.positional[0], &name, args.positional[2].clone())?;
    Ok(Value::None)
}

pub fn builtin_hasattr(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("hasattr", 2, 2)?;
    let name = attr_name(&args.positional[1])?;
    Ok(Value::Bool(attr::get_attr_opt(ctx, &args.positional[0], &name)?.is_some()))
}

pub fn builtin_delattr(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("delattr", 2, 2)?;
    let name = attr_name(&args.positional[1])?;
    attr::del_attr(ctx, &args.positional[0], &name)?;
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

    #[test]
    fn len_counts_characters_not_bytes() {
        let mut ctx = ctx();
        assert_eq!(length(&mut ctx, &Value::str("héllo")).unwrap(), 5);
        assert_eq!(length(&mut ctx, &Value::tuple(vec![Value::None; 3])).unwrap(), 3);
        let err = length(&mut ctx, &Value::Int(3)).unwrap_err();
        assert_eq!(err.message(), "object of type 'int' has no len()");
    }

    #[test]
    fn getattr_default_swallows_only_attribute_errors() {
        let mut ctx = ctx();
        let args = CallArgs::positional([Value::Int(1), Value::str("missing"), Value::str("fallback")]);
        let value = builtin_getattr(&mut ctx, args).unwrap();
        assert_eq!(value.as_str(), Some("fallback"));
        let args = CallArgs::positional([Value::Int(1), Value::Int(2)]);
        let err = builtin_getattr(&mut ctx, args).unwrap_err();
        assert!(err.matches(ExcType::TypeError));
    }
}
