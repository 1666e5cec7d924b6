use std::{fmt, sync::Arc};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    ops::format::plain_str,
    types::{Instance, exc_class},
    value::Value,
};

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Builtin exception classes.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and `Into<&'static str>` implementations.
/// The string representation matches the class name exactly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr, Serialize, Deserialize,
)]
pub enum ExcType {
    BaseException,
    SystemExit,
    KeyboardInterrupt,
    /// Raised inside a generator by `close()`.
    GeneratorExit,
    Exception,
    /// Carries a generator's return value in `args[0]`.
    StopIteration,
    StopAsyncIteration,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,

    AssertionError,
    AttributeError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- NameError hierarchy ---
    NameError,
    /// Subclass of NameError - reading a local before assignment.
    UnboundLocalError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    RecursionError,

    // --- SyntaxError hierarchy ---
    SyntaxError,
    IndentationError,
    /// Subclass of IndentationError - inconsistent tabs and spaces.
    TabError,

    TypeError,
    ValueError,

    // --- ImportError hierarchy ---
    ImportError,
    ModuleNotFoundError,

    // --- OSError hierarchy ---
    OSError,
    FileNotFoundError,
    PermissionError,
}

impl ExcType {
    /// The direct base class, `None` for `BaseException`.
    #[must_use]
    pub fn parent(self) -> Option<Self> {
        Some(match self {
            Self::BaseException => return None,
            Self::SystemExit | Self::KeyboardInterrupt | Self::GeneratorExit | Self::Exception => Self::BaseException,
            Self::StopIteration
            | Self::StopAsyncIteration
            | Self::ArithmeticError
            | Self::AssertionError
            | Self::AttributeError
            | Self::LookupError
            | Self::NameError
            | Self::RuntimeError
            | Self::SyntaxError
            | Self::TypeError
            | Self::ValueError
            | Self::ImportError
            | Self::OSError => Self::Exception,
            Self::ZeroDivisionError | Self::OverflowError => Self::ArithmeticError,
            Self::IndexError | Self::KeyError => Self::LookupError,
            Self::UnboundLocalError => Self::NameError,
            Self::NotImplementedError | Self::RecursionError => Self::RuntimeError,
            Self::IndentationError => Self::SyntaxError,
            Self::TabError => Self::IndentationError,
            Self::ModuleNotFoundError => Self::ImportError,
            Self::FileNotFoundError | Self::PermissionError => Self::OSError,
        })
    }

    /// Whether `self` is `other` or one of its subclasses.
    #[must_use]
    pub fn is_subclass_of(self, other: Self) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty == other {
                return true;
            }
            current = ty.parent();
        }
        false
    }
}

/// One frame of an exception's traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    pub filename: Arc<str>,
    pub name: Arc<str>,
    pub line: u32,
}

/// Mutable state carried by every exception instance.
#[derive(Debug, Clone, Default)]
pub struct ExcState {
    pub args: Arc<[Value]>,
    /// Explicit cause from `raise ... from ...`.
    pub cause: Option<Value>,
    /// The exception being handled when this one was raised.
    pub context: Option<Value>,
    pub suppress_context: bool,
    /// Frames in unwind order, innermost first.
    pub traceback: Vec<TracebackEntry>,
    /// Serial of the activation that recorded the latest traceback entry.
    pub recorded_by: Option<u64>,
}

impl ExcState {
    #[must_use]
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args: args.into(),
            cause: None,
            context: None,
            suppress_context: false,
            traceback: Vec::new(),
            recorded_by: None,
        }
    }
}

/// A raised exception propagating through the runtime.
///
/// Always wraps an instance of a `BaseException` subclass.
#[derive(Clone)]
pub struct RunError {
    exc: Arc<Instance>,
    state: Arc<Mutex<ExcState>>,
}

impl RunError {
    /// Creates an exception of a builtin class with a single message argument.
    pub fn new(ty: ExcType, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::with_args(ty, vec![Value::Str(message.into())])
    }

    #[must_use]
    pub fn bare(ty: ExcType) -> Self {
        Self::with_args(ty, Vec::new())
    }

    #[must_use]
    pub fn with_args(ty: ExcType, args: Vec<Value>) -> Self {
        let exc = Instance::new_exception(Arc::clone(exc_class(ty)), args);
        let state = exc.exc.clone().unwrap_or_default();
        Self { exc, state }
    }

    /// Wraps an exception instance. Returns `None` for values that are not exceptions.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Instance(inst) => inst.exc.as_ref().map(|state| Self {
                exc: Arc::clone(inst),
                state: Arc::clone(state),
            }),
            _ => None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::ValueError, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::AttributeError, message)
    }

    pub fn name_error(name: &str) -> Self {
        Self::new(ExcType::NameError, format!("name '{name}' is not defined"))
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::new(ExcType::IndexError, message)
    }

    #[must_use]
    pub fn key_error(key: Value) -> Self {
        Self::with_args(ExcType::KeyError, vec![key])
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new(ExcType::ZeroDivisionError, message)
    }

    #[must_use]
    pub fn stop_iteration(value: Value) -> Self {
        if value.is_none() {
            Self::bare(ExcType::StopIteration)
        } else {
            Self::with_args(ExcType::StopIteration, vec![value])
        }
    }

    #[must_use]
    pub fn value(&self) -> Value {
        Value::Instance(Arc::clone(&self.exc))
    }

    #[must_use]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.exc
    }

    /// Locks the exception state.
    pub fn state(&self) -> MutexGuard<'_, ExcState> {
        self.state.lock()
    }

    /// Whether this exception is an instance of the builtin class `ty`.
    #[must_use]
    pub fn matches(&self, ty: ExcType) -> bool {
        self.exc.class.is_subclass(exc_class(ty))
    }

    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.exc, &other.exc)
    }

    #[must_use]
    pub fn type_name(&self) -> Arc<str> {
        Arc::clone(&self.exc.class.name)
    }

    /// Message text as `str(exc)` renders it for builtin argument types.
    #[must_use]
    pub fn message(&self) -> String {
        let args = Arc::clone(&self.state().args);
        match &*args {
            [] => String::new(),
            [single] if self.matches(ExcType::KeyError) => crate::ops::format::plain_repr(single),
            [single] => plain_str(single),
            many => crate::ops::format::plain_repr(&Value::Tuple(Arc::from(many))),
        }
    }

    /// Sets the implicit context unless one is already recorded or it would be self-referential.
    pub fn attach_context(&self, handled: &Value) {
        if let Value::Instance(inst) = handled
            && Arc::ptr_eq(inst, &self.exc)
        {
            return;
        }
        let mut state = self.state();
        if state.context.is_none() {
            state.context = Some(handled.clone());
        }
    }

    pub fn push_traceback(&self, entry: TracebackEntry) {
        self.state().traceback.push(entry);
    }

    /// Records the activation `serial` once: a re-raise inside the activation that already
    /// recorded the exception keeps the line it was first seen at.
    pub fn record_frame(&self, serial: u64, entry: impl FnOnce() -> TracebackEntry) {
        {
            let mut state = self.state();
            if state.recorded_by == Some(serial) {
                return;
            }
            state.recorded_by = Some(serial);
        }
        self.push_traceback(entry());
    }
}

impl fmt::Debug for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RunError({}: {})", self.type_name(), self.message())
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            write!(f, "{}", self.type_name())
        } else {
            write!(f, "{}: {message}", self.type_name())
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn hierarchy_reaches_base_exception() {
        for ty in ExcType::iter() {
            assert!(ty.is_subclass_of(ExcType::BaseException), "{ty}");
        }
        assert!(ExcType::TabError.is_subclass_of(ExcType::SyntaxError));
        assert!(!ExcType::KeyboardInterrupt.is_subclass_of(ExcType::Exception));
    }

    #[test]
    fn errors_render_like_tracebacks() {
        let err = RunError::new(ExcType::ValueError, "bad value");
        assert_eq!(err.to_string(), "ValueError: bad value");
        assert!(err.matches(ExcType::Exception));
        assert_eq!(RunError::key_error(Value::Str("k".into())).to_string(), "KeyError: 'k'");
        assert_eq!(RunError::bare(ExcType::StopIteration).to_string(), "StopIteration");
    }

    #[test]
    fn context_is_never_self() {
        let err = RunError::type_error("x");
        err.attach_context(&err.value());
        assert!(err.state().context.is_none());
        let other = RunError::value_error("y");
        err.attach_context(&other.value());
        assert!(err.state().context.is_some());
    }
}
