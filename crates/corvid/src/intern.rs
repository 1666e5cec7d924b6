//! String interning for identifiers seen by the front end.
//!
//! The parser interns every identifier once and the AST, scope binder and lowering pass
//! refer to names by [`StringId`]. Lowering converts the ids it needs at runtime into
//! shared `Arc<str>` names so compiled code never touches the interner.

use std::sync::Arc;

use ahash::AHashMap;

/// Index into an [`Interner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only string table owned by one compilation unit.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Interner {
    strings: Vec<Arc<str>>,
    #[serde(skip)]
    lookup: AHashMap<Arc<str>, StringId>,
}

impl Interner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> StringId {
        if let Some(id) = self.lookup.get(name) {
            return *id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("interner overflow"));
        let shared: Arc<str> = Arc::from(name);
        self.strings.push(Arc::clone(&shared));
        self.lookup.insert(shared, id);
        id
    }

    /// Returns the id for `name` if it has been interned.
    #[must_use]
    pub fn get_id(&self, name: &str) -> Option<StringId> {
        self.lookup.get(name).copied()
    }

    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    #[must_use]
    pub fn get_arc(&self, id: StringId) -> Arc<str> {
        Arc::clone(&self.strings[id.index()])
    }

    /// Rebuilds the reverse lookup table after deserialization.
    pub(crate) fn rebuild_lookup(&mut self) {
        self.lookup = self
            .strings
            .iter()
            .enumerate()
            .map(|(index, s)| (Arc::clone(s), StringId(u32::try_from(index).expect("interner overflow"))))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut interner = Interner::new();
        let a = interner.intern("spam");
        let b = interner.intern("eggs");
        assert_ne!(a, b);
        assert_eq!(interner.intern("spam"), a);
        assert_eq!(interner.get(b), "eggs");
    }

    #[test]
    fn lookup_survives_serialization() {
        let mut interner = Interner::new();
        let id = interner.intern("value");
        let bytes = postcard::to_allocvec(&interner).unwrap();
        let mut restored: Interner = postcard::from_bytes(&bytes).unwrap();
        restored.rebuild_lookup();
        assert_eq!(restored.get_id("value"), Some(id));
    }
}
