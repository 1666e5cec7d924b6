//! Exceptions as the host sees them.
//!
//! An exception escaping a session is converted from the runtime's shared exception object
//! into a plain owned value: no locks, no references back into the runtime, and a
//! `Display` impl that renders the traceback the way the interpreter would print it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    exception_private::{ExcType, RunError},
    ops::format::plain_str,
    value::Value,
};

/// One traceback line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    pub line: u32,
    pub name: String,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  File \"{}\", line {}, in {}", self.filename, self.line, self.name)
    }
}

/// An exception that escaped to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PyException {
    /// Class name, e.g. `ValueError` or a user class name.
    pub type_name: String,
    /// The nearest builtin exception class.
    pub kind: ExcType,
    pub message: String,
    /// Outermost frame first, as tracebacks print.
    pub traceback: Vec<StackFrame>,
    pub cause: Option<Box<PyException>>,
    pub context: Option<Box<PyException>>,
    pub suppress_context: bool,
    /// Set for `SystemExit`: the requested process status.
    pub exit_code: Option<i32>,
}

/// How deep cause/context chains are followed when converting.
const MAX_CHAIN: usize = 32;

impl PyException {
    pub(crate) fn from_run_error(err: &RunError) -> Self {
        Self::convert(err, 0)
    }

    fn convert(err: &RunError, depth: usize) -> Self {
        let (cause, context, suppress_context, traceback, args) = {
            let state = err.state();
            (
                state.cause.clone(),
                state.context.clone(),
                state.suppress_context,
                state.traceback.clone(),
                state.args.clone(),
            )
        };
        let chained = |value: Option<Value>| -> Option<Box<Self>> {
            if depth >= MAX_CHAIN {
                return None;
            }
            value
                .as_ref()
                .and_then(RunError::from_value)
                .map(|inner| Box::new(Self::convert(&inner, depth + 1)))
        };
        let kind = err.instance().class.exc_base.unwrap_or(ExcType::Exception);
        let exit_code = (kind == ExcType::SystemExit).then(|| match args.first() {
            None | Some(Value::None) => 0,
            Some(Value::Int(code)) => i32::try_from(*code).unwrap_or(1),
            Some(Value::Bool(flag)) => i32::from(*flag),
            Some(_) => 1,
        });
        Self {
            type_name: err.type_name().to_string(),
            kind,
            message: err.message(),
            traceback: traceback
                .iter()
                .rev()
                .map(|entry| StackFrame {
                    filename: entry.filename.to_string(),
                    line: entry.line,
                    name: entry.name.to_string(),
                })
                .collect(),
            cause: chained(cause),
            context: chained(context),
            suppress_context,
            exit_code,
        }
    }

    /// `Type: message`, the last line of a traceback.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.message.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}: {}", self.type_name, self.message)
        }
    }

    /// Whether this is (a subclass of) the given builtin exception.
    #[must_use]
    pub fn is(&self, kind: ExcType) -> bool {
        self.kind.is_subclass_of(kind)
    }

    /// The message `SystemExit` prints to stderr when its argument is not an integer.
    #[must_use]
    pub fn exit_message(&self) -> Option<&str> {
        (self.exit_code == Some(1) && !self.message.is_empty() && self.message.parse::<i64>().is_err())
            .then_some(self.message.as_str())
    }

    /// The full traceback text including chained exceptions.
    #[must_use]
    pub fn traceback_text(&self) -> String {
        let mut out = String::new();
        self.write_chain(&mut out);
        out
    }

    fn write_chain(&self, out: &mut String) {
        if let Some(cause) = &self.cause {
            cause.write_chain(out);
            out.push_str("\nThe above exception was the direct cause of the following exception:\n\n");
        } else if let Some(context) = self.context.as_ref().filter(|_| !self.suppress_context) {
            context.write_chain(out);
            out.push_str("\nDuring handling of the above exception, another exception occurred:\n\n");
        }
        if !self.traceback.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            for frame in &self.traceback {
                out.push_str(&frame.to_string());
                out.push('\n');
            }
        }
        out.push_str(&self.summary());
        out.push('\n');
    }
}

impl fmt::Display for PyException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

impl std::error::Error for PyException {}

/// Process status derived from how a program finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    pub const SUCCESS: Self = Self(0);
    pub const FAILURE: Self = Self(1);

    #[must_use]
    pub fn code(self) -> i32 {
        self.0
    }

    #[must_use]
    pub fn success(self) -> bool {
        self.0 == 0
    }
}

impl From<&PyException> for ExitStatus {
    fn from(exc: &PyException) -> Self {
        Self(exc.exit_code.unwrap_or(1))
    }
}

/// Renders a value the way `print` would, for host-side display of results.
#[must_use]
pub fn display_value(value: &Value) -> String {
    plain_str(value)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::exception_private::TracebackEntry;

    #[test]
    fn chained_tracebacks_print_cause_first() {
        let cause = RunError::value_error("inner");
        let outer = RunError::type_error("outer");
        outer.state().cause = Some(cause.value());
        outer.state().suppress_context = true;
        outer.push_traceback(TracebackEntry {
            filename: "main.py".into(),
            name: "f".into(),
            line: 3,
        });
        outer.push_traceback(TracebackEntry {
            filename: "main.py".into(),
            name: "<module>".into(),
            line: 7,
        });
        let exc = PyException::from_run_error(&outer);
        assert_eq!(
            exc.traceback_text(),
            "ValueError: inner\n\
             \nThe above exception was the direct cause of the following exception:\n\n\
             Traceback (most recent call last):\n  \
             File \"main.py\", line 7, in <module>\n  \
             File \"main.py\", line 3, in f\n\
             TypeError: outer\n"
        );
    }

    #[test]
    fn system_exit_maps_to_status() {
        let exit = RunError::with_args(ExcType::SystemExit, vec![Value::Int(3)]);
        let exc = PyException::from_run_error(&exit);
        assert_eq!(ExitStatus::from(&exc), ExitStatus(3));
        let bare = PyException::from_run_error(&RunError::bare(ExcType::SystemExit));
        assert!(ExitStatus::from(&bare).success());
        let text = PyException::from_run_error(&RunError::new(ExcType::SystemExit, "bye"));
        assert_eq!(text.exit_message(), Some("bye"));
        assert_eq!(ExitStatus::from(&text), ExitStatus::FAILURE);
    }
}
