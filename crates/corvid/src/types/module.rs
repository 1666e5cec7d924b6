use std::{fmt, sync::Arc};

use crate::modes::Namespace;

/// A module object: a name and the namespace its top-level code ran in.
pub struct Module {
    pub name: Arc<str>,
    pub namespace: Namespace,
}

impl Module {
    #[must_use]
    pub fn new(name: Arc<str>, namespace: Namespace) -> Self {
        namespace.set("__name__", crate::value::Value::Str(Arc::clone(&name)));
        Self { name, namespace }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<module '{}'>", self.name)
    }
}
