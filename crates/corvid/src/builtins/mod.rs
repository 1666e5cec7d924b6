//! The `builtins` namespace: functions, types and exception classes.
//!
//! Each family of builtin functions has its own submodule. Builtin types are constructed in
//! [`construct`] and their methods live in [`methods`], which also supplies the class
//! dictionaries the type registry is built from.

mod attrs;
mod construct;
mod isinstance;
mod iteration;
pub(crate) mod methods;
mod min_max; // min and max share implementation
mod numeric;
mod print;
mod sorted;

use std::sync::Arc;

use strum::IntoEnumIterator;

pub(crate) use self::{construct::construct_builtin, sorted::sort_values};
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    interp::{ExecCtx, intrinsics},
    modes::GlobalTable,
    ops::{attr::attr_names, call::call_special},
    types::{
        BuiltinFn, BuiltinFunction, BuiltinKind, CallArgs, FrameIntrinsic, SuperObject, builtin_type, exc_class,
        type_of,
    },
    value::Value,
};

/// Builtin functions that need nothing but their arguments.
const FUNCTIONS: &[(&str, BuiltinFn)] = &[
    ("print", print::builtin_print),
    ("len", attrs::builtin_len),
    ("repr", attrs::builtin_repr),
    ("id", attrs::builtin_id),
    ("hash", attrs::builtin_hash),
    ("callable", attrs::builtin_callable),
    ("getattr", attrs::builtin_getattr),
    ("setattr", attrs::builtin_setattr),
    ("hasattr", attrs::builtin_hasattr),
    ("delattr", attrs::builtin_delattr),
    ("format", attrs::builtin_format),
    ("isinstance", isinstance::builtin_isinstance),
    ("issubclass", isinstance::builtin_issubclass),
    ("iter", iteration::builtin_iter),
    ("next", iteration::builtin_next),
    ("enumerate", iteration::builtin_enumerate),
    ("zip", iteration::builtin_zip),
    ("map", iteration::builtin_map),
    ("filter", iteration::builtin_filter),
    ("reversed", iteration::builtin_reversed),
    ("any", iteration::builtin_any),
    ("all", iteration::builtin_all),
    ("sum", iteration::builtin_sum),
    ("min", min_max::builtin_min),
    ("max", min_max::builtin_max),
    ("sorted", sorted::builtin_sorted),
    ("abs", numeric::builtin_abs),
    ("divmod", numeric::builtin_divmod),
    ("pow", numeric::builtin_pow),
    ("round", numeric::builtin_round),
    ("chr", numeric::builtin_chr),
    ("ord", numeric::builtin_ord),
    ("bin", numeric::builtin_bin),
    ("oct", numeric::builtin_oct),
    ("hex", numeric::builtin_hex),
];

/// Builtin types reachable by name.
const TYPES: &[BuiltinKind] = &[
    BuiltinKind::Object,
    BuiltinKind::Type,
    BuiltinKind::Int,
    BuiltinKind::Bool,
    BuiltinKind::Float,
    BuiltinKind::Str,
    BuiltinKind::Bytes,
    BuiltinKind::Tuple,
    BuiltinKind::List,
    BuiltinKind::Dict,
    BuiltinKind::Set,
    BuiltinKind::FrozenSet,
    BuiltinKind::Range,
    BuiltinKind::Slice,
    BuiltinKind::Property,
    BuiltinKind::ClassMethod,
    BuiltinKind::StaticMethod,
    BuiltinKind::Super,
];

/// Builds the builtins namespace every unit falls back to.
#[must_use]
pub(crate) fn builtins_table() -> GlobalTable {
    let table = GlobalTable::new();
    table.set("__name__", Value::str("builtins"));
    for (name, func) in FUNCTIONS {
        table.set(name, BuiltinFunction::value(name, *func));
    }
    for kind in TYPES {
        let name: &'static str = (*kind).into();
        table.set(name, Value::Type(Arc::clone(builtin_type(*kind))));
    }
    for exc in ExcType::iter() {
        let name: &'static str = exc.into();
        table.set(name, Value::Type(Arc::clone(exc_class(exc))));
    }
    table.set("NotImplemented", Value::NotImplemented);
    table.set("Ellipsis", Value::Ellipsis);

    let intrinsics: [(&'static str, BuiltinFn, FrameIntrinsic); 6] = [
        ("globals", detached_globals, FrameIntrinsic::Globals),
        ("locals", detached_locals, FrameIntrinsic::Locals),
        ("vars", detached_vars, FrameIntrinsic::Vars),
        ("dir", detached_dir, FrameIntrinsic::Dir),
        ("exec", detached_exec, FrameIntrinsic::Exec),
        ("eval", detached_eval, FrameIntrinsic::Eval),
    ];
    for (name, func, intrinsic) in intrinsics {
        let builtin = BuiltinFunction::new(name, func).with_intrinsic(intrinsic);
        table.set(name, Value::Builtin(Arc::new(builtin)));
    }
    table
}

fn detached_globals(_: &mut ExecCtx, _: CallArgs) -> RunResult<Value> {
    Err(intrinsics::detached("globals"))
}

fn detached_locals(_: &mut ExecCtx, _: CallArgs) -> RunResult<Value> {
    Err(intrinsics::detached("locals"))
}

fn detached_exec(_: &mut ExecCtx, _: CallArgs) -> RunResult<Value> {
    Err(intrinsics::detached("exec"))
}

fn detached_eval(_: &mut ExecCtx, _: CallArgs) -> RunResult<Value> {
    Err(intrinsics::detached("eval"))
}

/// `vars(obj)` needs no frame; only the zero-argument form does.
fn detached_vars(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("vars", 0, 1)?;
    match args.get(0) {
        Some(object) => crate::ops::attr::get_attr_opt(ctx, object, "__dict__")?
            .ok_or_else(|| RunError::type_error("vars() argument must have __dict__ attribute")),
        None => Err(intrinsics::detached("vars")),
    }
}

fn detached_dir(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("dir", 0, 1)?;
    let Some(object) = args.get(0) else {
        return Err(intrinsics::detached("dir"));
    };
    if let Some(custom) = call_special(ctx, object, "__dir__", CallArgs::new())? {
        let mut names = crate::ops::iter::collect(ctx, &custom)?;
        names.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
        return Ok(Value::list(names));
    }
    Ok(Value::list(attr_names(object).into_iter().map(Value::Str).collect()))
}

/// Builds the object `super(class, obj)` returns.
pub(crate) fn make_super(class: &Value, obj: Value) -> RunResult<Value> {
    let Value::Type(this_class) = class else {
        return Err(RunError::type_error(format!(
            "super() argument 1 must be a type, not {}",
            class.type_name()
        )));
    };
    let obj_type = match &obj {
        Value::Type(ty) if ty.is_subclass(this_class) => Arc::clone(ty),
        other => {
            let ty = type_of(other);
            if !ty.is_subclass(this_class) {
                return Err(RunError::type_error(
                    "super(type, obj): obj must be an instance or subtype of type",
                ));
            }
            ty
        }
    };
    Ok(Value::Super(Arc::new(SuperObject {
        this_class: Arc::clone(this_class),
        obj,
        obj_type,
    })))
}

/// Pulls an optional keyword, rejecting any other keyword the caller did not take.
fn keyword_only<const N: usize>(args: &mut CallArgs, func: &str, names: [&str; N]) -> RunResult<[Option<Value>; N]> {
    let taken = names.map(|name| args.take_keyword(name));
    if let Some((name, _)) = args.keywords.first() {
        return Err(RunError::type_error(format!(
            "{func}() got an unexpected keyword argument '{name}'"
        )));
    }
    Ok(taken)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn table_has_functions_types_and_exceptions() {
        let table = builtins_table();
        assert!(matches!(table.get("print"), Some(Value::Builtin(_))));
        assert!(matches!(table.get("int"), Some(Value::Type(_))));
        assert!(matches!(table.get("KeyError"), Some(Value::Type(_))));
        assert!(matches!(table.get("NotImplemented"), Some(Value::NotImplemented)));
        match table.get("locals") {
            Some(Value::Builtin(builtin)) => assert_eq!(builtin.intrinsic, Some(FrameIntrinsic::Locals)),
            other => panic!("unexpected locals binding: {other:?}"),
        }
    }

    #[test]
    fn super_checks_the_receiver() {
        let int_type = Value::Type(Arc::clone(builtin_type(BuiltinKind::Int)));
        assert!(make_super(&int_type, Value::Int(1)).is_ok());
        let err = make_super(&int_type, Value::str("x")).unwrap_err();
        assert_eq!(
            err.message(),
            "super(type, obj): obj must be an instance or subtype of type"
        );
        let err = make_super(&Value::Int(1), Value::Int(1)).unwrap_err();
        assert!(err.matches(ExcType::TypeError));
    }
}
