use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::Value;

/// The `list` object.
///
/// Storage is copy-on-write so a folded constant display can hand out fresh lists that share
/// one backing vector until someone mutates them.
#[derive(Debug, Default)]
pub struct PyList {
    items: RwLock<Arc<Vec<Value>>>,
}

impl PyList {
    #[must_use]
    pub fn new(items: Vec<Value>) -> Self {
        Self::from_shared(Arc::new(items))
    }

    #[must_use]
    pub fn from_shared(items: Arc<Vec<Value>>) -> Self {
        Self {
            items: RwLock::new(items),
        }
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
    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.read().get(index).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Value>> {
        Arc::clone(&self.items.read())
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.items.read().as_ref().clone()
    }

    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.items.read(), &other.items.read())
    }

    /// Mutates the items in place. `f` must not run user code.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
        let mut guard = self.items.write();
        f(Arc::make_mut(&mut guard))
    }

    pub fn push(&self, value: Value) {
        self.with_mut(|items| items.push(value));
    }

    pub fn extend(&self, values: impl IntoIterator<Item = Value>) {
        let values: Vec<Value> = values.into_iter().collect();
        self.with_mut(|items| items.extend(values));
    }

    /// Replaces the item at `index`. Returns false when out of range.
    pub fn set(&self, index: usize, value: Value) -> bool {
        self.with_mut(|items| match items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        })
    }

    pub fn replace(&self, items: Vec<Value>) {
        *self.items.write() = Arc::new(items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_lists_diverge_on_write() {
        let storage = Arc::new(vec![Value::Int(1), Value::Int(2)]);
        let a = PyList::from_shared(Arc::clone(&storage));
        let b = PyList::from_shared(storage);
        assert!(a.shares_storage(&b));
        a.push(Value::Int(3));
        assert!(!a.shares_storage(&b));
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 2);
    }
}
