use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    exception_private::RunResult,
    types::dict::DictKey,
    value::Value,
};

/// Backing store for `set` and `frozenset`: key to original element.
pub type SetStorage = indexmap::IndexMap<DictKey, Value, std::hash::BuildHasherDefault<ahash::AHasher>>;

/// The `set` and `frozenset` object. Frozen sets are never mutated after construction.
#[derive(Debug, Default)]
pub struct PySet {
    items: RwLock<Arc<SetStorage>>,
}

impl PySet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_shared(items: Arc<SetStorage>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> RunResult<Self> {
        let mut storage = SetStorage::default();
        for value in values {
            storage.entry(DictKey::new(&value)?).or_insert(value);
        }
        Ok(Self::from_shared(Arc::new(storage)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<SetStorage> {
        Arc::clone(&self.items.read())
    }

    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.items.read(), &other.items.read())
    }

    #[must_use]
    pub fn keys(&self) -> Vec<DictKey> {
        self.items.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.items.read().values().cloned().collect()
    }

    pub fn contains(&self, value: &Value) -> RunResult<bool> {
        let key = DictKey::new(value)?;
        Ok(self.items.read().contains_key(&key))
    }

    pub fn add(&self, value: Value) -> RunResult<()> {
        let key = DictKey::new(&value)?;
        let mut guard = self.items.write();
        if !guard.contains_key(&key) {
            Arc::make_mut(&mut guard).insert(key, value);
        }
        Ok(())
    }

    /// Removes `value`, returning whether it was present.
    pub fn remove(&self, value: &Value) -> RunResult<bool> {
        let key = DictKey::new(value)?;
        let mut guard = self.items.write();
        if !guard.contains_key(&key) {
            return Ok(false);
        }
        Arc::make_mut(&mut guard).shift_remove(&key);
        Ok(true)
    }

    pub fn pop(&self) -> Option<Value> {
        let mut guard = self.items.write();
        if guard.is_empty() {
            return None;
        }
        Arc::make_mut(&mut guard).pop().map(|(_, v)| v)
    }

    pub fn clear(&self) {
        *self.items.write() = Arc::new(SetStorage::default());
    }

    /// Whether both sets hold the same elements.
    #[must_use]
    pub fn same_elements(&self, other: &Self) -> bool {
        let a = self.snapshot();
        let b = other.snapshot();
        a.len() == b.len() && a.keys().all(|k| b.contains_key(k))
    }

    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        let a = self.snapshot();
        let b = other.snapshot();
        a.keys().all(|k| b.contains_key(k))
    }
}
