use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::{exception_private::ExcState, types::PyType, value::Value};

/// An instance of a user class, `object`, or an exception class.
pub struct Instance {
    pub class: Arc<PyType>,
    pub dict: RwLock<IndexMap<Arc<str>, Value>>,
    /// Present exactly when the class derives from `BaseException`.
    pub exc: Option<Arc<Mutex<ExcState>>>,
}

impl Instance {
    #[must_use]
    pub fn new(class: Arc<PyType>) -> Arc<Self> {
        let exc = class.exc_base.map(|_| Arc::new(Mutex::new(ExcState::default())));
        Arc::new(Self {
            class,
            dict: RwLock::new(IndexMap::new()),
            exc,
        })
    }

    #[must_use]
    pub fn new_exception(class: Arc<PyType>, args: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            class,
            dict: RwLock::new(IndexMap::new()),
            exc: Some(Arc::new(Mutex::new(ExcState::new(args)))),
        })
    }

    #[must_use]
    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.dict.read().get(name).cloned()
    }

    pub fn set_attr(&self, name: Arc<str>, value: Value) {
        self.dict.write().insert(name, value);
    }

    /// Removes an instance attribute, returning whether it existed.
    pub fn del_attr(&self, name: &str) -> bool {
        self.dict.write().shift_remove(name).is_some()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object>", self.class.name)
    }
}

/// The object returned by `super()`.
#[derive(Debug)]
pub struct SuperObject {
    /// Lookups start after this class in the MRO of `obj_type`.
    pub this_class: Arc<PyType>,
    pub obj: Value,
    pub obj_type: Arc<PyType>,
}
