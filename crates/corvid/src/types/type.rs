//! Class objects, the builtin type registry and method resolution order.
//!
//! Every class carries a version number drawn from a process-wide counter. Any mutation of
//! a class dictionary assigns a fresh version to the class and to all of its subclasses, so
//! call-site guards keyed on `(type identity, version)` go stale without anyone having to
//! find and patch the sites that cached the old shape.

use std::{
    fmt,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::{
    builtins::methods,
    exception_private::{ExcType, RunError, RunResult},
    value::Value,
};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

/// Builtin classes with a native instance layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
pub enum BuiltinKind {
    #[strum(serialize = "object")]
    Object,
    #[strum(serialize = "type")]
    Type,
    #[strum(serialize = "NoneType")]
    NoneType,
    #[strum(serialize = "NotImplementedType")]
    NotImplementedType,
    #[strum(serialize = "ellipsis")]
    Ellipsis,
    #[strum(serialize = "int")]
    Int,
    #[strum(serialize = "bool")]
    Bool,
    #[strum(serialize = "float")]
    Float,
    #[strum(serialize = "str")]
    Str,
    #[strum(serialize = "bytes")]
    Bytes,
    #[strum(serialize = "tuple")]
    Tuple,
    #[strum(serialize = "list")]
    List,
    #[strum(serialize = "dict")]
    Dict,
    #[strum(serialize = "set")]
    Set,
    #[strum(serialize = "frozenset")]
    FrozenSet,
    #[strum(serialize = "range")]
    Range,
    #[strum(serialize = "slice")]
    Slice,
    #[strum(serialize = "function")]
    Function,
    #[strum(serialize = "builtin_function_or_method")]
    BuiltinFunction,
    #[strum(serialize = "method")]
    Method,
    #[strum(serialize = "module")]
    Module,
    #[strum(serialize = "generator")]
    Generator,
    #[strum(serialize = "coroutine")]
    Coroutine,
    #[strum(serialize = "iterator")]
    Iterator,
    #[strum(serialize = "property")]
    Property,
    #[strum(serialize = "classmethod")]
    ClassMethod,
    #[strum(serialize = "staticmethod")]
    StaticMethod,
    #[strum(serialize = "super")]
    Super,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Builtin(BuiltinKind),
    Exception(ExcType),
    /// Created by a `class` statement.
    User,
}

pub struct PyType {
    pub name: Arc<str>,
    pub qualname: Arc<str>,
    pub module: Arc<str>,
    pub bases: Vec<Arc<PyType>>,
    /// Method resolution order, excluding the class itself.
    pub mro: Vec<Arc<PyType>>,
    pub kind: TypeKind,
    /// Nearest builtin exception class in the MRO; instances then carry exception state.
    pub exc_base: Option<ExcType>,
    dict: RwLock<IndexMap<Arc<str>, Value>>,
    version: AtomicU64,
    subclasses: Mutex<Vec<Weak<PyType>>>,
}

impl PyType {
    fn builtin(name: &str, kind: TypeKind, bases: Vec<Arc<Self>>, dict: IndexMap<Arc<str>, Value>) -> Arc<Self> {
        let mut mro = Vec::new();
        if let Some(base) = bases.first() {
            mro.push(Arc::clone(base));
            mro.extend(base.mro.iter().cloned());
        }
        let exc_base = match kind {
            TypeKind::Exception(exc) => Some(exc),
            _ => None,
        };
        Arc::new(Self {
            name: Arc::from(name),
            qualname: Arc::from(name),
            module: Arc::from("builtins"),
            bases,
            mro,
            kind,
            exc_base,
            dict: RwLock::new(dict),
            version: AtomicU64::new(next_version()),
            subclasses: Mutex::new(Vec::new()),
        })
    }

    /// Creates a class from a `class` statement's evaluated bases and namespace.
    pub fn new_class(
        name: Arc<str>,
        qualname: Arc<str>,
        module: Arc<str>,
        bases: Vec<Arc<Self>>,
        namespace: IndexMap<Arc<str>, Value>,
    ) -> RunResult<Arc<Self>> {
        let bases = if bases.is_empty() {
            vec![Arc::clone(builtin_type(BuiltinKind::Object))]
        } else {
            bases
        };
        for base in &bases {
            if let TypeKind::Builtin(kind) = base.kind
                && kind != BuiltinKind::Object
            {
                return Err(RunError::type_error(format!(
                    "subclassing builtin type '{}' is not supported",
                    base.name
                )));
            }
        }
        let mro = linearize(&name, &bases)?;
        let exc_base = mro.iter().find_map(|ty| ty.exc_base);
        let class = Arc::new(Self {
            name,
            qualname,
            module,
            bases,
            mro,
            kind: TypeKind::User,
            exc_base,
            dict: RwLock::new(namespace),
            version: AtomicU64::new(next_version()),
            subclasses: Mutex::new(Vec::new()),
        });
        for base in &class.bases {
            if base.kind == TypeKind::User {
                base.subclasses.lock().push(Arc::downgrade(&class));
            }
        }
        Ok(class)
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_builtin(&self) -> bool {
        self.kind != TypeKind::User
    }

    #[must_use]
    pub fn builtin_kind(&self) -> Option<BuiltinKind> {
        match self.kind {
            TypeKind::Builtin(kind) => Some(kind),
            _ => None,
        }
    }

    /// The class itself followed by its MRO.
    pub fn mro_iter<'a>(self: &'a Arc<Self>) -> impl Iterator<Item = &'a Arc<Self>> {
        std::iter::once(self).chain(self.mro.iter())
    }

    /// Whether `self` is `other` or inherits from it.
    #[must_use]
    pub fn is_subclass(&self, other: &Arc<Self>) -> bool {
        std::ptr::eq(self, Arc::as_ptr(other)) || self.mro.iter().any(|ty| Arc::ptr_eq(ty, other))
    }

    /// Reads an attribute from this class's own dictionary.
    #[must_use]
    pub fn get_own(&self, name: &str) -> Option<Value> {
        self.dict.read().get(name).cloned()
    }

    /// Looks `name` up along the MRO, returning the value and the class that defines it.
    #[must_use]
    pub fn lookup_with_owner(self: &Arc<Self>, name: &str) -> Option<(Value, Arc<Self>)> {
        self.mro_iter()
            .find_map(|ty| ty.get_own(name).map(|value| (value, Arc::clone(ty))))
    }

    #[must_use]
    pub fn lookup(self: &Arc<Self>, name: &str) -> Option<Value> {
        self.mro_iter().find_map(|ty| ty.get_own(name))
    }

    /// Looks `name` up in the MRO entries that come after `after`, as `super()` does.
    #[must_use]
    pub fn lookup_after(self: &Arc<Self>, after: &Arc<Self>, name: &str) -> Option<Value> {
        self.mro_iter()
            .skip_while(|ty| !Arc::ptr_eq(ty, after))
            .skip(1)
            .find_map(|ty| ty.get_own(name))
    }

    /// Class-level assignment. Invalidates every cache keyed on this class or its subclasses.
    pub fn set_attr(&self, name: Arc<str>, value: Value) -> RunResult<()> {
        self.check_mutable(&name)?;
        self.dict.write().insert(name, value);
        self.bump_version();
        Ok(())
    }

    pub fn del_attr(&self, name: &str) -> RunResult<()> {
        self.check_mutable(name)?;
        let removed = self.dict.write().shift_remove(name);
        if removed.is_none() {
            return Err(RunError::attribute_error(format!(
                "type object '{}' has no attribute '{name}'",
                self.name
            )));
        }
        self.bump_version();
        Ok(())
    }

    fn check_mutable(&self, name: &str) -> RunResult<()> {
        if self.is_builtin() {
            Err(RunError::type_error(format!(
                "cannot set '{name}' attribute of immutable type '{}'",
                self.name
            )))
        } else {
            Ok(())
        }
    }

    fn bump_version(&self) {
        self.version.store(next_version(), Ordering::Release);
        let subclasses: Vec<Arc<Self>> = {
            let mut list = self.subclasses.lock();
            list.retain(|weak| weak.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for sub in subclasses {
            sub.bump_version();
        }
    }

    /// Copy of the class dictionary in definition order.
    #[must_use]
    pub fn dict_snapshot(&self) -> Vec<(Arc<str>, Value)> {
        self.dict.read().iter().map(|(k, v)| (Arc::clone(k), v.clone())).collect()
    }
}

impl fmt::Debug for PyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class '{}'>", self.name)
    }
}

/// C3 linearization of `bases`.
fn linearize(name: &str, bases: &[Arc<PyType>]) -> RunResult<Vec<Arc<PyType>>> {
    let mut sequences: Vec<Vec<Arc<PyType>>> = bases
        .iter()
        .map(|base| base.mro_iter().cloned().collect())
        .collect();
    sequences.push(bases.to_vec());
    let mut result = Vec::new();
    loop {
        sequences.retain(|seq| !seq.is_empty());
        if sequences.is_empty() {
            return Ok(result);
        }
        let candidate = sequences.iter().map(|seq| &seq[0]).find(|head| {
            !sequences
                .iter()
                .any(|seq| seq[1..].iter().any(|ty| Arc::ptr_eq(ty, head)))
        });
        let Some(next) = candidate.cloned() else {
            let names: Vec<&str> = bases.iter().map(|b| &*b.name).collect();
            return Err(RunError::type_error(format!(
                "Cannot create a consistent method resolution order (MRO) for bases {} in class {name}",
                names.join(", ")
            )));
        };
        for seq in &mut sequences {
            if Arc::ptr_eq(&seq[0], &next) {
                seq.remove(0);
            }
        }
        result.push(next);
    }
}

struct Registry {
    builtins: Vec<Arc<PyType>>,
    exceptions: Vec<Arc<PyType>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let mut builtins: Vec<Arc<PyType>> = Vec::new();
        for kind in BuiltinKind::iter() {
            let bases = match kind {
                BuiltinKind::Object => Vec::new(),
                BuiltinKind::Bool => vec![Arc::clone(&builtins[BuiltinKind::Int as usize])],
                _ => vec![Arc::clone(&builtins[BuiltinKind::Object as usize])],
            };
            let name: &'static str = kind.into();
            builtins.push(PyType::builtin(name, TypeKind::Builtin(kind), bases, methods::type_dict(kind)));
        }
        let object = Arc::clone(&builtins[BuiltinKind::Object as usize]);
        let mut exceptions: Vec<Arc<PyType>> = Vec::new();
        for exc in ExcType::iter() {
            let base = match exc.parent() {
                Some(parent) => Arc::clone(&exceptions[parent as usize]),
                None => Arc::clone(&object),
            };
            let dict = if exc == ExcType::BaseException {
                methods::exception_dict()
            } else {
                IndexMap::new()
            };
            let name: &'static str = exc.into();
            exceptions.push(PyType::builtin(name, TypeKind::Exception(exc), vec![base], dict));
        }
        Registry { builtins, exceptions }
    })
}

/// The class object for a builtin kind.
#[must_use]
pub fn builtin_type(kind: BuiltinKind) -> &'static Arc<PyType> {
    &registry().builtins[kind as usize]
}

/// The class object for a builtin exception.
#[must_use]
pub fn exc_class(ty: ExcType) -> &'static Arc<PyType> {
    &registry().exceptions[ty as usize]
}

/// The class of any value.
#[must_use]
pub fn type_of(value: &Value) -> Arc<PyType> {
    let kind = match value {
        Value::Instance(inst) => return Arc::clone(&inst.class),
        Value::Generator(generator) if generator.is_coroutine => BuiltinKind::Coroutine,
        Value::None => BuiltinKind::NoneType,
        Value::NotImplemented => BuiltinKind::NotImplementedType,
        Value::Ellipsis => BuiltinKind::Ellipsis,
        Value::Bool(_) => BuiltinKind::Bool,
        Value::Int(_) | Value::BigInt(_) => BuiltinKind::Int,
        Value::Float(_) => BuiltinKind::Float,
        Value::Str(_) => BuiltinKind::Str,
        Value::Bytes(_) => BuiltinKind::Bytes,
        Value::Tuple(_) => BuiltinKind::Tuple,
        Value::List(_) => BuiltinKind::List,
        Value::Dict(_) => BuiltinKind::Dict,
        Value::Set(_) => BuiltinKind::Set,
        Value::FrozenSet(_) => BuiltinKind::FrozenSet,
        Value::Range(_) => BuiltinKind::Range,
        Value::Slice(_) => BuiltinKind::Slice,
        Value::Function(_) => BuiltinKind::Function,
        Value::Builtin(_) => BuiltinKind::BuiltinFunction,
        Value::BoundMethod(_) => BuiltinKind::Method,
        Value::Type(_) => BuiltinKind::Type,
        Value::Module(_) => BuiltinKind::Module,
        Value::Generator(_) => BuiltinKind::Generator,
        Value::Iterator(_) => BuiltinKind::Iterator,
        Value::Property(_) => BuiltinKind::Property,
        Value::ClassMethod(_) => BuiltinKind::ClassMethod,
        Value::StaticMethod(_) => BuiltinKind::StaticMethod,
        Value::Super(_) => BuiltinKind::Super,
    };
    Arc::clone(builtin_type(kind))
}

/// `isinstance(value, class)` without user-defined hooks.
#[must_use]
pub fn is_instance(value: &Value, class: &Arc<PyType>) -> bool {
    type_of(value).is_subclass(class)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(name: &str, bases: Vec<Arc<PyType>>) -> Arc<PyType> {
        PyType::new_class(name.into(), name.into(), "test".into(), bases, IndexMap::new()).unwrap()
    }

    fn names(ty: &Arc<PyType>) -> Vec<String> {
        ty.mro_iter().map(|t| t.name.to_string()).collect()
    }

    #[test]
    fn diamond_mro_is_c3() {
        let a = class("A", vec![]);
        let b = class("B", vec![Arc::clone(&a)]);
        let c = class("C", vec![Arc::clone(&a)]);
        let d = class("D", vec![b, c]);
        assert_eq!(names(&d), vec!["D", "B", "C", "A", "object"]);
    }

    #[test]
    fn inconsistent_mro_is_rejected() {
        let a = class("A", vec![]);
        let b = class("B", vec![Arc::clone(&a)]);
        let err = PyType::new_class("C".into(), "C".into(), "test".into(), vec![a, b], IndexMap::new()).unwrap_err();
        assert!(err.matches(ExcType::TypeError));
    }

    #[test]
    fn mutation_bumps_subclass_versions() {
        let base = class("Base", vec![]);
        let derived = class("Derived", vec![Arc::clone(&base)]);
        let before = (base.version(), derived.version());
        base.set_attr("x".into(), Value::Int(1)).unwrap();
        assert_ne!(base.version(), before.0);
        assert_ne!(derived.version(), before.1);
        assert_eq!(derived.lookup("x").and_then(|v| v.as_i64()), Some(1));
    }

    #[test]
    fn builtin_types_are_immutable() {
        let list = builtin_type(BuiltinKind::List);
        let version = list.version();
        assert!(list.set_attr("x".into(), Value::None).is_err());
        assert_eq!(list.version(), version);
        assert!(builtin_type(BuiltinKind::Bool).is_subclass(builtin_type(BuiltinKind::Int)));
    }

    #[test]
    fn exception_classes_follow_hierarchy() {
        let key_error = exc_class(ExcType::KeyError);
        assert!(key_error.is_subclass(exc_class(ExcType::LookupError)));
        assert!(key_error.is_subclass(builtin_type(BuiltinKind::Object)));
        let custom = class("MyError", vec![Arc::clone(exc_class(ExcType::ValueError))]);
        assert_eq!(custom.exc_base, Some(ExcType::ValueError));
    }
}
