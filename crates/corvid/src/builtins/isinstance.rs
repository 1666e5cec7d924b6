//! Implementation of the isinstance() and issubclass() builtin functions.

use std::sync::Arc;

use crate::{
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    types::{CallArgs, PyType, type_of},
    value::Value,
};

/// Checks `class` against a class or an arbitrarily nested tuple of classes.
fn matches_classinfo(class: &Arc<PyType>, classinfo: &Value, func: &str) -> RunResult<bool> {
    match classinfo {
        Value::Type(target) => Ok(class.is_subclass(target)),
        Value::Tuple(options) => {
            for option in options.iter() {
                if matches_classinfo(class, option, func)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(RunError::type_error(format!(
            "{func}() arg 2 must be a type, a tuple of types, or a union"
        ))),
    }
}

/// Implementation of the isinstance() builtin function.
///
/// Instances of user classes are checked along their class's MRO, so a subclass instance
/// matches every base.
pub fn builtin_isinstance(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("isinstance", 2, 2)?;
    let class = type_of(&args.positional[0]);
    matches_classinfo(&class, &args.positional[1], "isinstance").map(Value::Bool)
}

pub fn builtin_issubclass(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("issubclass", 2, 2)?;
    let Value::Type(class) = &args.positional[0] else {
        return Err(RunError::type_error("issubclass() arg 1 must be a class"));
    };
    matches_classinfo(class, &args.positional[1], "issubclass").map(Value::Bool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exception_private::ExcType,
        types::{BuiltinKind, builtin_type, exc_class},
    };

    #[test]
    fn nested_tuples_are_searched() {
        let int = Value::Type(Arc::clone(builtin_type(BuiltinKind::Int)));
        let str_ = Value::Type(Arc::clone(builtin_type(BuiltinKind::Str)));
        let info = Value::tuple(vec![str_, Value::tuple(vec![int])]);
        assert!(matches_classinfo(&type_of(&Value::Bool(true)), &info, "isinstance").unwrap());
        assert!(!matches_classinfo(&type_of(&Value::Float(1.0)), &info, "isinstance").unwrap());
    }

    #[test]
    fn exception_hierarchy_is_visible() {
        let key_error = exc_class(ExcType::KeyError);
        let lookup = Value::Type(Arc::clone(exc_class(ExcType::LookupError)));
        assert!(matches_classinfo(key_error, &lookup, "issubclass").unwrap());
        assert!(matches_classinfo(key_error, &Value::Int(1), "issubclass").is_err());
    }
}
