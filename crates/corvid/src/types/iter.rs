use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::{
    types::{PyList, PyRange},
    value::Value,
};

/// Builtin iterator state. Advancing lives in `ops::iter`.
pub enum IterState {
    /// Reads the list by index on every step, so appends during iteration are seen.
    List { list: Arc<PyList>, index: usize },
    /// A fixed sequence: tuples, dict views and sets iterate over a snapshot.
    Items { items: Arc<[Value]>, index: usize },
    Chars { text: Arc<str>, offset: usize },
    Bytes { bytes: Arc<[u8]>, index: usize },
    Range { range: PyRange, index: usize },
    Reversed { items: Vec<Value> },
    Enumerate { inner: Value, count: i64 },
    Zip { inners: Vec<Value> },
    Map { func: Value, inners: Vec<Value> },
    Filter { func: Value, inner: Value },
    /// Advanced by another thread or re-entrantly.
    Running,
    Exhausted,
}

pub struct PyIterator {
    pub(crate) state: Mutex<IterState>,
}

impl PyIterator {
    #[must_use]
    pub fn new(state: IterState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn value(state: IterState) -> Value {
        Value::Iterator(Arc::new(Self::new(state)))
    }
}

impl fmt::Debug for PyIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<iterator object>")
    }
}
