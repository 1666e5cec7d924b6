//! Compilation modes and global-variable storage.
//!
//! Both modes run the same lowered tree; they differ only in how a global name reference
//! (`NameRef::Global(index)`) reaches its value:
//!
//! * **Lookup** resolves the unit's name table entry against a namespace by string on every
//!   access. Any namespace works, including a caller-supplied dictionary for `exec`/`eval`.
//! * **Optimized** binds every global name of the unit to a [`GlobalSlot`] of the module's
//!   [`GlobalTable`] once, when the unit is instantiated. Reads then index a vector and load
//!   the slot's value without taking a lock. The table's map lock is taken for writing only
//!   when a new slot is allocated.
//!
//! A slot that has never been assigned falls back to builtins through a cached pointer to
//! the builtins table's slot of the same name. The pointer is established lazily with a
//! compare-and-swap once the builtin exists; the first writer wins and later racers adopt its
//! value. Names missing from builtins stay unlinked and never allocate a builtins slot.
//! Because the cache points at the builtin *slot*, rebinding a builtin is seen without
//! invalidation.

use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    exception_private::{RunError, RunResult},
    types::PyDict,
    value::Value,
};

/// How a unit's globals are stored. Chosen once per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompilationMode {
    /// Name-keyed lookups against a namespace.
    Lookup,
    /// Pre-bound global slots.
    #[default]
    Optimized,
}

/// Storage for one global name.
pub struct GlobalSlot {
    pub name: Arc<str>,
    value: ArcSwapOption<Value>,
    builtin: ArcSwapOption<GlobalSlot>,
}

impl GlobalSlot {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            value: ArcSwapOption::empty(),
            builtin: ArcSwapOption::empty(),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.value.load().as_deref().cloned()
    }

    pub fn set(&self, value: Value) {
        self.value.store(Some(Arc::new(value)));
    }

    /// Unbinds the slot, returning whether it held a value.
    pub fn clear(&self) -> bool {
        self.value.swap(None).is_some()
    }

    /// The builtins slot this global falls back to, linking it on the first lookup that finds
    /// one. `None` while `builtins` has no slot of this name.
    pub fn builtin_slot(&self, builtins: &GlobalTable) -> Option<Arc<Self>> {
        if let Some(slot) = self.builtin.load_full() {
            return Some(slot);
        }
        let candidate = builtins.existing(&self.name)?;
        let previous = self
            .builtin
            .compare_and_swap(&None::<Arc<Self>>, Some(Arc::clone(&candidate)));
        match &*previous {
            Some(winner) => Some(Arc::clone(winner)),
            None => Some(candidate),
        }
    }

    /// Reads the global, falling back to builtins.
    #[must_use]
    pub fn resolve(&self, builtins: &GlobalTable) -> Option<Value> {
        self.get().or_else(|| self.builtin_slot(builtins)?.get())
    }

    #[must_use]
    pub fn has_builtin_link(&self) -> bool {
        self.builtin.load().is_some()
    }
}

impl fmt::Debug for GlobalSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalSlot({})", self.name)
    }
}

/// A module's global storage in optimized mode. Slots are never removed, only unbound.
#[derive(Debug, Default)]
pub struct GlobalTable {
    slots: RwLock<IndexMap<Arc<str>, Arc<GlobalSlot>>>,
}

impl GlobalTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `name`, allocating it if needed.
    pub fn slot(&self, name: &str) -> Arc<GlobalSlot> {
        if let Some(slot) = self.slots.read().get(name) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        let slot = slots
            .entry(Arc::from(name))
            .or_insert_with_key(|key| Arc::new(GlobalSlot::new(Arc::clone(key))));
        Arc::clone(slot)
    }

    #[must_use]
    pub fn existing(&self, name: &str) -> Option<Arc<GlobalSlot>> {
        self.slots.read().get(name).cloned()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.existing(name).and_then(|slot| slot.get())
    }

    pub fn set(&self, name: &str, value: Value) {
        self.slot(name).set(value);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.existing(name).is_some_and(|slot| slot.clear())
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Bound names and values in allocation order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Arc<str>, Value)> {
        self.slots
            .read()
            .values()
            .filter_map(|slot| slot.get().map(|value| (Arc::clone(&slot.name), value)))
            .collect()
    }

    /// Allocates (or finds) a slot for every name a unit references.
    #[must_use]
    pub fn bind(self: &Arc<Self>, names: &[Arc<str>]) -> SlotBinding {
        SlotBinding {
            table: Arc::clone(self),
            slots: names.iter().map(|name| self.slot(name)).collect(),
        }
    }
}

/// One unit's view of a [`GlobalTable`]: slot `i` holds the unit's global name `i`.
#[derive(Debug)]
pub struct SlotBinding {
    pub table: Arc<GlobalTable>,
    slots: Vec<Arc<GlobalSlot>>,
}

impl SlotBinding {
    #[must_use]
    pub fn slot(&self, index: usize) -> Option<&Arc<GlobalSlot>> {
        self.slots.get(index)
    }
}

/// A namespace a unit can run against.
#[derive(Debug, Clone)]
pub enum Namespace {
    /// A plain dictionary, as supplied to `exec`/`eval`.
    Dict(Arc<PyDict>),
    /// Slot storage, required by optimized units.
    Table(Arc<GlobalTable>),
}

impl Namespace {
    #[must_use]
    pub fn new_table() -> Self {
        Self::Table(Arc::new(GlobalTable::new()))
    }

    #[must_use]
    pub fn new_dict() -> Self {
        Self::Dict(Arc::new(PyDict::new()))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        match self {
            Self::Dict(dict) => dict.get_str(name),
            Self::Table(table) => table.get(name),
        }
    }

    pub fn set(&self, name: &str, value: Value) {
        match self {
            Self::Dict(dict) => dict.set_str(name, value),
            Self::Table(table) => table.set(name, value),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        match self {
            Self::Dict(dict) => dict.remove_str(name).is_some(),
            Self::Table(table) => table.remove(name),
        }
    }

    /// The namespace as a dictionary: the live dict itself, or a snapshot of a slot table.
    #[must_use]
    pub fn to_dict(&self) -> Arc<PyDict> {
        match self {
            Self::Dict(dict) => Arc::clone(dict),
            Self::Table(table) => {
                let dict = PyDict::new();
                for (name, value) in table.snapshot() {
                    dict.set_str(&name, value);
                }
                Arc::new(dict)
            }
        }
    }

    /// Bound names in insertion order.
    #[must_use]
    pub fn names(&self) -> Vec<Arc<str>> {
        match self {
            Self::Dict(dict) => dict
                .keys()
                .into_iter()
                .filter_map(|key| match key {
                    Value::Str(s) => Some(s),
                    _ => None,
                })
                .collect(),
            Self::Table(table) => table.snapshot().into_iter().map(|(name, _)| name).collect(),
        }
    }
}

/// The globals a frame runs against.
#[derive(Debug, Clone)]
pub enum Globals {
    Slots(Arc<SlotBinding>),
    Lookup(Namespace),
}

impl Globals {
    /// Pairs a unit's mode with a namespace.
    ///
    /// Optimized units need a slot table; lookup units accept either namespace kind.
    pub fn for_unit(mode: CompilationMode, namespace: &Namespace, names: &[Arc<str>]) -> RunResult<Self> {
        match (mode, namespace) {
            (CompilationMode::Optimized, Namespace::Table(table)) => Ok(Self::Slots(Arc::new(table.bind(names)))),
            (CompilationMode::Optimized, Namespace::Dict(_)) => Err(RunError::type_error(
                "optimized code cannot run against a dictionary namespace; compile it in lookup mode",
            )),
            (CompilationMode::Lookup, namespace) => Ok(Self::Lookup(namespace.clone())),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Namespace {
        match self {
            Self::Slots(binding) => Namespace::Table(Arc::clone(&binding.table)),
            Self::Lookup(namespace) => namespace.clone(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> CompilationMode {
        match self {
            Self::Slots(_) => CompilationMode::Optimized,
            Self::Lookup(_) => CompilationMode::Lookup,
        }
    }

    #[must_use]
    pub fn module_name(&self) -> Option<Arc<str>> {
        match self.namespace().get("__name__") {
            Some(Value::Str(name)) => Some(name),
            _ => None,
        }
    }

    /// Reads global `index` (named `name`), falling back to builtins.
    #[must_use]
    pub fn load(&self, index: usize, name: &str, builtins: &GlobalTable) -> Option<Value> {
        match self {
            Self::Slots(binding) => match binding.slot(index) {
                Some(slot) => slot.resolve(builtins),
                None => binding.table.get(name).or_else(|| builtins.get(name)),
            },
            Self::Lookup(namespace) => namespace.get(name).or_else(|| builtins.get(name)),
        }
    }

    pub fn store(&self, index: usize, name: &str, value: Value) {
        match self {
            Self::Slots(binding) => match binding.slot(index) {
                Some(slot) => slot.set(value),
                None => binding.table.set(name, value),
            },
            Self::Lookup(namespace) => namespace.set(name, value),
        }
    }

    /// Unbinds a global, returning whether it was bound.
    pub fn delete(&self, index: usize, name: &str) -> bool {
        match self {
            Self::Slots(binding) => match binding.slot(index) {
                Some(slot) => slot.clear(),
                None => binding.table.remove(name),
            },
            Self::Lookup(namespace) => namespace.remove(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<Arc<str>> {
        list.iter().map(|n| Arc::from(*n)).collect()
    }

    #[test]
    fn slots_fall_back_to_builtins_until_assigned() {
        let builtins = GlobalTable::new();
        builtins.set("len", Value::str("builtin len"));
        let module = Arc::new(GlobalTable::new());
        let globals = Globals::for_unit(CompilationMode::Optimized, &Namespace::Table(Arc::clone(&module)), &names(&["len"])).unwrap();
        assert_eq!(globals.load(0, "len", &builtins).unwrap().as_str(), Some("builtin len"));
        globals.store(0, "len", Value::Int(3));
        assert_eq!(globals.load(0, "len", &builtins).unwrap().as_i64(), Some(3));
        assert!(globals.delete(0, "len"));
        assert_eq!(globals.load(0, "len", &builtins).unwrap().as_str(), Some("builtin len"));
    }

    #[test]
    fn builtin_link_tracks_rebinding() {
        let builtins = GlobalTable::new();
        let module = Arc::new(GlobalTable::new());
        let slot = module.slot("answer");
        builtins.set("answer", Value::Int(41));
        assert_eq!(slot.resolve(&builtins).unwrap().as_i64(), Some(41));
        assert!(slot.has_builtin_link());
        builtins.set("answer", Value::Int(42));
        assert_eq!(slot.resolve(&builtins).unwrap().as_i64(), Some(42));
    }

    #[test]
    fn missing_builtins_are_not_allocated() {
        let builtins = GlobalTable::new();
        let module = Arc::new(GlobalTable::new());
        let slot = module.slot("nowhere");
        for _ in 0..3 {
            assert!(slot.resolve(&builtins).is_none());
        }
        assert!(!slot.has_builtin_link());
        assert_eq!(builtins.slot_count(), 0);
        builtins.set("nowhere", Value::Int(1));
        assert_eq!(slot.resolve(&builtins).unwrap().as_i64(), Some(1));
    }

    #[test]
    fn first_builtin_link_wins() {
        let builtins = GlobalTable::new();
        builtins.set("x", Value::Int(1));
        let other = GlobalTable::new();
        other.set("x", Value::Int(2));
        let slot = Arc::new(GlobalSlot::new("x".into()));
        let first = slot.builtin_slot(&builtins).unwrap();
        let second = slot.builtin_slot(&other).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(slot.resolve(&other).unwrap().as_i64(), Some(1));
    }

    #[test]
    fn two_units_share_module_slots() {
        let module = Arc::new(GlobalTable::new());
        let a = module.bind(&names(&["x", "y"]));
        let b = module.bind(&names(&["y"]));
        a.slot(1).unwrap().set(Value::Int(7));
        assert_eq!(b.slot(0).unwrap().get().unwrap().as_i64(), Some(7));
        assert_eq!(module.slot_count(), 2);
    }

    #[test]
    fn optimized_units_reject_dict_namespaces() {
        let err = Globals::for_unit(CompilationMode::Optimized, &Namespace::new_dict(), &[]).unwrap_err();
        assert!(err.to_string().starts_with("TypeError"));
        assert!(Globals::for_unit(CompilationMode::Lookup, &Namespace::new_table(), &[]).is_ok());
    }

    #[test]
    fn table_namespace_exports_snapshot() {
        let ns = Namespace::new_table();
        ns.set("a", Value::Int(1));
        let dict = ns.to_dict();
        ns.set("b", Value::Int(2));
        assert_eq!(dict.len(), 1);
        assert_eq!(ns.names().len(), 2);
    }
}
