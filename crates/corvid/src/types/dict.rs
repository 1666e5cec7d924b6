//! Hash keys and the `dict` object.
//!
//! Dictionary storage is an insertion-ordered map behind `RwLock<Arc<_>>`. Readers clone the
//! `Arc` to get a consistent snapshot and writers go through `Arc::make_mut`, which copies the
//! storage only while another holder (a folded constant or an iteration snapshot) still
//! shares it.

use std::{hash::BuildHasherDefault, sync::Arc};

use ahash::AHasher;
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive};
use parking_lot::RwLock;

use crate::{
    exception_private::{RunError, RunResult},
    types::{BuiltinKind, builtin_type, type_of},
    value::Value,
};

/// Normalized hash key.
///
/// Numbers that compare equal hash equal: `True`, `1` and `1.0` all map to `Int(1)`.
/// Objects without value semantics use their identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DictKey {
    None,
    Ellipsis,
    Int(i64),
    BigInt(BigInt),
    /// Bit pattern of a non-integral float.
    Float(u64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Tuple(Vec<DictKey>),
    /// Sorted element keys so equal sets produce equal keys.
    FrozenSet(Vec<DictKey>),
    Identity(usize),
}

impl DictKey {
    /// Computes the key for `value`, rejecting unhashable values.
    pub fn new(value: &Value) -> RunResult<Self> {
        Ok(match value {
            Value::None => Self::None,
            Value::Ellipsis => Self::Ellipsis,
            Value::Bool(b) => Self::Int(i64::from(*b)),
            Value::Int(i) => Self::Int(*i),
            Value::BigInt(b) => Self::BigInt((**b).clone()),
            Value::Float(f) => float_key(*f),
            Value::Str(s) => Self::Str(Arc::clone(s)),
            Value::Bytes(b) => Self::Bytes(Arc::clone(b)),
            Value::Tuple(items) => Self::Tuple(items.iter().map(Self::new).collect::<RunResult<_>>()?),
            Value::FrozenSet(set) => {
                let mut keys: Vec<Self> = set.keys();
                keys.sort();
                Self::FrozenSet(keys)
            }
            Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::Slice(_) => {
                return Err(unhashable(value));
            }
            Value::Instance(inst) => {
                if inst.class.lookup("__eq__").is_some_and(|eq| !is_object_eq(&eq))
                    && inst.class.lookup("__hash__").is_none_or(|h| h.is_none())
                {
                    return Err(unhashable(value));
                }
                Self::Identity(value.id())
            }
            _ => Self::Identity(value.id()),
        })
    }

    /// The integer returned by `hash()` for this key.
    #[must_use]
    pub fn hash_value(&self) -> i64 {
        use std::hash::{BuildHasher, Hash, Hasher};
        match self {
            Self::Int(i) => *i,
            _ => {
                let mut hasher = BuildHasherDefault::<AHasher>::default().build_hasher();
                self.hash(&mut hasher);
                hasher.finish() as i64
            }
        }
    }
}

fn float_key(f: f64) -> DictKey {
    if f.fract() == 0.0 && f.is_finite() {
        if let Some(i) = f.to_i64() {
            return DictKey::Int(i);
        }
        if let Some(big) = <BigInt as FromPrimitive>::from_f64(f) {
            return DictKey::BigInt(big);
        }
    }
    DictKey::Float(f.to_bits())
}

fn is_object_eq(value: &Value) -> bool {
    builtin_type(BuiltinKind::Object)
        .get_own("__eq__")
        .is_some_and(|object_eq| object_eq.is(value))
}

fn unhashable(value: &Value) -> RunError {
    RunError::type_error(format!("unhashable type: '{}'", type_of(value).name))
}

type Hasher = BuildHasherDefault<AHasher>;

/// Entries keep the original key object alongside the value.
pub type DictStorage = IndexMap<DictKey, (Value, Value), Hasher>;

#[derive(Debug, Default)]
pub struct PyDict {
    storage: RwLock<Arc<DictStorage>>,
}

impl PyDict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dict that shares `storage` until its first mutation.
    #[must_use]
    pub fn from_shared(storage: Arc<DictStorage>) -> Self {
        Self {
            storage: RwLock::new(storage),
        }
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Value, Value)>) -> RunResult<Self> {
        let mut storage = DictStorage::default();
        for (key, value) in pairs {
            insert_entry(&mut storage, key, value)?;
        }
        Ok(Self::from_shared(Arc::new(storage)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A consistent view of the current entries.
    #[must_use]
    pub fn snapshot(&self) -> Arc<DictStorage> {
        Arc::clone(&self.storage.read())
    }

    /// Whether two dicts currently share backing storage.
    #[must_use]
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage.read(), &other.storage.read())
    }

    pub fn get(&self, key: &Value) -> RunResult<Option<Value>> {
        let key = DictKey::new(key)?;
        Ok(self.storage.read().get(&key).map(|(_, v)| v.clone()))
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<Value> {
        self.storage
            .read()
            .get(&DictKey::Str(Arc::from(key)))
            .map(|(_, v)| v.clone())
    }

    pub fn contains(&self, key: &Value) -> RunResult<bool> {
        let key = DictKey::new(key)?;
        Ok(self.storage.read().contains_key(&key))
    }

    pub fn set(&self, key: Value, value: Value) -> RunResult<()> {
        let mut guard = self.storage.write();
        insert_entry(Arc::make_mut(&mut guard), key, value)
    }

    pub fn set_str(&self, key: &str, value: Value) {
        let name: Arc<str> = Arc::from(key);
        let mut guard = self.storage.write();
        Arc::make_mut(&mut guard).insert(DictKey::Str(Arc::clone(&name)), (Value::Str(name), value));
    }

    pub fn remove(&self, key: &Value) -> RunResult<Option<Value>> {
        let key = DictKey::new(key)?;
        let mut guard = self.storage.write();
        if !guard.contains_key(&key) {
            return Ok(None);
        }
        Ok(Arc::make_mut(&mut guard).shift_remove(&key).map(|(_, v)| v))
    }

    pub fn remove_str(&self, key: &str) -> Option<Value> {
        self.remove(&Value::str(key)).ok().flatten()
    }

    /// Removes and returns the most recently inserted entry.
    pub fn pop_last(&self) -> Option<(Value, Value)> {
        let mut guard = self.storage.write();
        if guard.is_empty() {
            return None;
        }
        Arc::make_mut(&mut guard).pop().map(|(_, entry)| entry)
    }

    pub fn clear(&self) {
        *self.storage.write() = Arc::new(DictStorage::default());
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Value> {
        self.snapshot().values().map(|(k, _)| k.clone()).collect()
    }

    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.snapshot().values().map(|(_, v)| v.clone()).collect()
    }

    #[must_use]
    pub fn items(&self) -> Vec<(Value, Value)> {
        self.snapshot().values().cloned().collect()
    }

    /// Copies every entry of `other` into `self`.
    pub fn update(&self, other: &Self) {
        let entries = other.snapshot();
        let mut guard = self.storage.write();
        let storage = Arc::make_mut(&mut guard);
        for (key, entry) in entries.iter() {
            storage.insert(key.clone(), entry.clone());
        }
    }

    #[must_use]
    pub fn copy(&self) -> Self {
        Self::from_shared(self.snapshot())
    }
}

/// Inserts keeping the first key object when an equal key already exists.
pub(crate) fn insert_entry(storage: &mut DictStorage, key: Value, value: Value) -> RunResult<()> {
    let hashed = DictKey::new(&key)?;
    match storage.get_mut(&hashed) {
        Some(entry) => entry.1 = value,
        None => {
            storage.insert(hashed, (key, value));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_numbers_share_a_key() {
        let dict = PyDict::new();
        dict.set(Value::Int(1), Value::str("int")).unwrap();
        dict.set(Value::Float(1.0), Value::str("float")).unwrap();
        dict.set(Value::Bool(true), Value::str("bool")).unwrap();
        assert_eq!(dict.len(), 1);
        assert!(matches!(dict.keys()[0], Value::Int(1)));
        assert_eq!(dict.get(&Value::Int(1)).unwrap().unwrap().as_str(), Some("bool"));
    }

    #[test]
    fn lists_are_unhashable() {
        let err = DictKey::new(&Value::list(vec![])).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: unhashable type: 'list'");
    }

    #[test]
    fn shared_storage_is_copied_on_write() {
        let original = PyDict::from_pairs([(Value::str("a"), Value::Int(1))]).unwrap();
        let copy = PyDict::from_shared(original.snapshot());
        assert!(copy.shares_storage(&original));
        copy.set_str("b", Value::Int(2));
        assert!(!copy.shares_storage(&original));
        assert_eq!(original.len(), 1);
        assert_eq!(copy.len(), 2);
    }

    #[test]
    fn tuple_keys_compare_structurally() {
        let a = DictKey::new(&Value::tuple(vec![Value::Int(1), Value::str("x")])).unwrap();
        let b = DictKey::new(&Value::tuple(vec![Value::Float(1.0), Value::str("x")])).unwrap();
        assert_eq!(a, b);
    }
}
