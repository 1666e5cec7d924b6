//! Implementation of the print() builtin function.

use std::borrow::Cow;

use super::keyword_only;
use crate::{
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    ops::{compare::truthy, format},
    types::CallArgs,
    value::Value,
};

/// Implementation of the print() builtin function.
///
/// Supports the following keyword arguments:
/// - `sep`: separator between values (default: " ")
/// - `end`: string appended after the last value (default: "\n")
/// - `file`: only `None` is accepted; output goes to the runtime's writer
/// - `flush`: asks the writer to flush after this call
///
/// Every argument is rendered before the writer is locked, so a `__str__` that prints does
/// not deadlock and concurrent sessions never interleave inside one call.
pub fn builtin_print(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let [sep, end, file, flush] = keyword_only(&mut args, "print", ["sep", "end", "file", "flush"])?;
    let sep = text_option(sep, "sep")?.unwrap_or(Cow::Borrowed(" "));
    let end = text_option(end, "end")?.unwrap_or(Cow::Borrowed("\n"));
    if file.as_ref().is_some_and(|file| !file.is_none()) {
        return Err(RunError::type_error("print() file argument is not supported"));
    }
    let flush = match flush {
        Some(flag) => truthy(ctx, &flag)?,
        None => false,
    };

    let rendered = args
        .positional
        .iter()
        .map(|value| format::str(ctx, value))
        .collect::<RunResult<Vec<_>>>()?;

    let mut output = ctx.runtime().output.lock();
    for (index, text) in rendered.into_iter().enumerate() {
        if index > 0 {
            write_text(&mut **output, &sep)?;
        }
        output.stdout_write(Cow::Owned(text))?;
    }
    write_text(&mut **output, &end)?;
    if flush {
        output.flush()?;
    }
    Ok(Value::None)
}

fn write_text(output: &mut dyn crate::io::PrintWriter, text: &str) -> RunResult<()> {
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (None, _) => Ok(()),
        (Some(c), None) => output.stdout_push(c),
        _ => output.stdout_write(Cow::Borrowed(text)),
    }
}

fn text_option(value: Option<Value>, name: &str) -> RunResult<Option<Cow<'static, str>>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(Cow::Owned(s.to_string()))),
        Some(other) => Err(RunError::type_error(format!(
            "{name} must be None or a string, not {}",
            other.type_name()
        ))),
    }
}
