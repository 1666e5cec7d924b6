//! Dynamic operations on runtime values.
//!
//! Every operation here is the uncached "bind every time" path: call sites in `sites` cache
//! the plans these modules produce, and fall back to these functions when megamorphic or
//! when caching is turned off.

pub mod arith;
pub mod attr;
pub mod call;
pub mod compare;
pub mod format;
pub mod item;
pub mod iter;

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    interp::ExecCtx,
    types::CallArgs,
    value::Value,
};

/// Converts an index-like value to `i64`.
///
/// Returns `Ok(None)` for values that are not integers and have no `__index__`, so the caller
/// can phrase its own `TypeError`.
pub fn as_index(ctx: &mut ExecCtx, value: &Value) -> RunResult<Option<i64>> {
    match value {
        Value::Int(i) => Ok(Some(*i)),
        Value::Bool(b) => Ok(Some(i64::from(*b))),
        Value::BigInt(_) => Err(RunError::new(
            ExcType::IndexError,
            "cannot fit 'int' into an index-sized integer",
        )),
        Value::Instance(_) => match call::call_special(ctx, value, "__index__", CallArgs::new())? {
            Some(Value::Int(i)) => Ok(Some(i)),
            Some(Value::Bool(b)) => Ok(Some(i64::from(b))),
            Some(other) => Err(RunError::type_error(format!(
                "__index__ returned non-int (type {})",
                other.type_name()
            ))),
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

/// Like [`as_index`] but raises the usual "cannot be interpreted as an integer" error.
pub fn expect_index(ctx: &mut ExecCtx, value: &Value) -> RunResult<i64> {
    as_index(ctx, value)?.ok_or_else(|| {
        RunError::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}
