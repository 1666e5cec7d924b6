//! Methods of `dict`. The view methods return lists.

use std::sync::Arc;

use super::wrong_receiver;
use crate::{
    builtins::construct::fill_dict,
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    ops::{call::construct, iter::collect, item::set_item},
    types::{BuiltinFn, CallArgs, PyDict, TypeKind},
    value::Value,
};

pub(super) const METHODS: &[(&str, BuiltinFn)] = &[
    ("keys", keys),
    ("values", values),
    ("items", items),
    ("get", get),
    ("pop", pop),
    ("popitem", popitem),
    ("setdefault", setdefault),
    ("update", update),
    ("clear", clear),
    ("copy", copy),
];

fn this(args: &mut CallArgs, method: &str) -> RunResult<Arc<PyDict>> {
    match args.receiver(method)? {
        Value::Dict(dict) => Ok(dict),
        other => Err(wrong_receiver(method, "dict", &other)),
    }
}

fn keys(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "keys")?;
    args.check("keys", 0, 0)?;
    Ok(Value::list(dict.keys()))
}

fn values(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "values")?;
    args.check("values", 0, 0)?;
    Ok(Value::list(dict.values()))
}

fn items(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "items")?;
    args.check("items", 0, 0)?;
    Ok(Value::list(
        dict.items()
            .into_iter()
            .map(|(key, value)| Value::tuple(vec![key, value]))
            .collect(),
    ))
}

fn get(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "get")?;
    args.check("get", 1, 2)?;
    Ok(dict
        .get(&args.positional[0])?
        .or_else(|| args.get(1).cloned())
        .unwrap_or(Value::None))
}

fn pop(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "pop")?;
    args.check("pop", 1, 2)?;
    match (dict.remove(&args.positional[0])?, args.get(1)) {
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(RunError::key_error(args.positional[0].clone())),
    }
}

/// Removes the most recently inserted pair.
fn popitem(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "popitem")?;
    args.check("popitem", 0, 0)?;
    match dict.pop_last() {
        Some((key, value)) => Ok(Value::tuple(vec![key, value])),
        None => Err(RunError::key_error(Value::str("popitem(): dictionary is empty"))),
    }
}

fn setdefault(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "setdefault")?;
    args.check("setdefault", 1, 2)?;
    if let Some(existing) = dict.get(&args.positional[0])? {
        return Ok(existing);
    }
    let default = args.get(1).cloned().unwrap_or(Value::None);
    dict.set(args.positional[0].clone(), default.clone())?;
    Ok(default)
}

/// `update([other], **kwargs)`.
fn update(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "update")?;
    if args.positional.len() > 1 {
        return Err(RunError::type_error(format!(
            "update expected at most 1 argument, got {}",
            args.positional.len()
        )));
    }
    if let Some(source) = args.get(0) {
        fill_dict(ctx, &dict, source)?;
    }
    for (key, value) in args.keywords {
        dict.set(Value::Str(key), value)?;
    }
    Ok(Value::None)
}

fn clear(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "clear")?;
    args.check("clear", 0, 0)?;
    dict.clear();
    Ok(Value::None)
}

fn copy(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let dict = this(&mut args, "copy")?;
    args.check("copy", 0, 0)?;
    Ok(Value::Dict(Arc::new(dict.copy())))
}

/// `dict.fromkeys(iterable, value=None)`, bound to the class it was looked up on.
pub(super) fn fromkeys(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let class = args.receiver("dict.fromkeys")?;
    args.check("fromkeys", 1, 2)?;
    let value = args.get(1).cloned().unwrap_or(Value::None);
    let keys = collect(ctx, &args.positional[0])?;
    let target = match &class {
        Value::Type(ty) if ty.kind != TypeKind::User => Value::Dict(Arc::new(PyDict::new())),
        Value::Type(ty) => construct(ctx, ty, CallArgs::new())?,
        other => return Err(wrong_receiver("fromkeys", "type", other)),
    };
    for key in keys {
        set_item(ctx, &target, &key, value.clone())?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::HostConfig,
        exception_private::ExcType,
        tracer::NoopTracer,
        types::{BuiltinKind, builtin_type},
    };

    fn ctx() -> ExecCtx {
        ExecCtx::for_tests(HostConfig::default(), Arc::new(NoopTracer))
    }

    fn run(ctx: &mut ExecCtx, method: BuiltinFn, dict: &Arc<PyDict>, args: Vec<Value>) -> RunResult<Value> {
        method(ctx, CallArgs::positional(args).with_receiver(Value::Dict(Arc::clone(dict))))
    }

    #[test]
    fn pop_and_get_defaults() {
        let mut ctx = ctx();
        let dict = Arc::new(PyDict::from_pairs([(Value::str("a"), Value::Int(1))]).unwrap());
        assert_eq!(run(&mut ctx, get, &dict, vec![Value::str("z"), Value::Int(0)]).unwrap().as_i64(), Some(0));
        assert_eq!(run(&mut ctx, pop, &dict, vec![Value::str("a")]).unwrap().as_i64(), Some(1));
        let err = run(&mut ctx, pop, &dict, vec![Value::str("a")]).unwrap_err();
        assert!(err.matches(ExcType::KeyError));
        assert!(run(&mut ctx, pop, &dict, vec![Value::str("a"), Value::None]).unwrap().is_none());
    }

    #[test]
    fn popitem_is_last_in_first_out() {
        let mut ctx = ctx();
        let dict = Arc::new(
            PyDict::from_pairs([(Value::Int(1), Value::str("x")), (Value::Int(2), Value::str("y"))]).unwrap(),
        );
        let Value::Tuple(pair) = run(&mut ctx, popitem, &dict, vec![]).unwrap() else {
            panic!("popitem returned a non-tuple");
        };
        assert_eq!(pair[0].as_i64(), Some(2));
        run(&mut ctx, popitem, &dict, vec![]).unwrap();
        let err = run(&mut ctx, popitem, &dict, vec![]).unwrap_err();
        assert!(err.matches(ExcType::KeyError));
    }

    #[test]
    fn update_accepts_pairs_and_keywords() {
        let mut ctx = ctx();
        let dict = Arc::new(PyDict::new());
        let pairs = Value::list(vec![Value::tuple(vec![Value::str("a"), Value::Int(1)])]);
        let mut args = CallArgs::positional([pairs]).with_receiver(Value::Dict(Arc::clone(&dict)));
        args.keywords.push((Arc::from("b"), Value::Int(2)));
        update(&mut ctx, args).unwrap();
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get_str("b").and_then(|v| v.as_i64()), Some(2));
    }

    #[test]
    fn fromkeys_on_the_builtin_class() {
        let mut ctx = ctx();
        let class = Value::Type(Arc::clone(builtin_type(BuiltinKind::Dict)));
        let args = CallArgs::positional([Value::str("ab")]).with_receiver(class);
        let Value::Dict(dict) = fromkeys(&mut ctx, args).unwrap() else {
            panic!("fromkeys returned a non-dict");
        };
        assert_eq!(dict.len(), 2);
        assert!(dict.get_str("a").is_some_and(|v| v.is_none()));
    }
}
