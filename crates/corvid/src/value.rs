//! The runtime value representation.
//!
//! `Value` is a cheap-to-clone handle: scalars are stored inline and every heap object is
//! behind an `Arc`, so values can be shared freely between frames, closures, generators and
//! threads. Identity (`is`) for heap objects is pointer identity of the `Arc`.

use std::{fmt, sync::Arc};

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::types::{
    BoundMethod, BuiltinFunction, Function, Generator, Instance, Module, Property, PyDict, PyIterator, PyList,
    PyRange, PySet, PySlice, PyType, SuperObject,
};

#[derive(Clone)]
pub enum Value {
    None,
    NotImplemented,
    Ellipsis,
    Bool(bool),
    Int(i64),
    /// Integers outside the `i64` range. Never holds a value that fits in `Int`.
    BigInt(Arc<BigInt>),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Tuple(Arc<[Value]>),
    List(Arc<PyList>),
    Dict(Arc<PyDict>),
    Set(Arc<PySet>),
    FrozenSet(Arc<PySet>),
    Range(Arc<PyRange>),
    Slice(Arc<PySlice>),
    Function(Arc<Function>),
    Builtin(Arc<BuiltinFunction>),
    BoundMethod(Arc<BoundMethod>),
    Type(Arc<PyType>),
    Instance(Arc<Instance>),
    Module(Arc<Module>),
    Generator(Arc<Generator>),
    Iterator(Arc<PyIterator>),
    Property(Arc<Property>),
    ClassMethod(Arc<Value>),
    StaticMethod(Arc<Value>),
    Super(Arc<SuperObject>),
}

impl Value {
    #[must_use]
    pub fn str(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }

    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(items.into())
    }

    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Arc::new(PyList::new(items)))
    }

    /// Normalizes a big integer into `Int` when it fits.
    #[must_use]
    pub fn from_bigint(value: BigInt) -> Self {
        match value.to_i64() {
            Some(small) => Self::Int(small),
            None => Self::BigInt(Arc::new(value)),
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// The value as an `i64` if it is an integer (or bool) that fits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// The value as a big integer if it is any kind of integer.
    #[must_use]
    pub fn as_bigint(&self) -> Option<BigInt> {
        match self {
            Self::Int(i) => Some(BigInt::from(*i)),
            Self::Bool(b) => Some(BigInt::from(u8::from(*b))),
            Self::BigInt(b) => Some((**b).clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_int_like(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Bool(_) | Self::BigInt(_))
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Identity comparison, the `is` operator.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None)
            | (Self::NotImplemented, Self::NotImplemented)
            | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::BigInt(a), Self::BigInt(b)) => Arc::ptr_eq(a, b),
            (Self::Str(a), Self::Str(b)) => Arc::ptr_eq(a, b) || (a.is_empty() && b.is_empty()),
            (Self::Bytes(a), Self::Bytes(b)) => Arc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Arc::ptr_eq(a, b) || (a.is_empty() && b.is_empty()),
            (Self::List(a), Self::List(b)) => Arc::ptr_eq(a, b),
            (Self::Dict(a), Self::Dict(b)) => Arc::ptr_eq(a, b),
            (Self::Set(a), Self::Set(b)) | (Self::FrozenSet(a), Self::FrozenSet(b)) => Arc::ptr_eq(a, b),
            (Self::Range(a), Self::Range(b)) => Arc::ptr_eq(a, b),
            (Self::Slice(a), Self::Slice(b)) => Arc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Builtin(a), Self::Builtin(b)) => Arc::ptr_eq(a, b),
            (Self::BoundMethod(a), Self::BoundMethod(b)) => Arc::ptr_eq(a, b),
            (Self::Type(a), Self::Type(b)) => Arc::ptr_eq(a, b),
            (Self::Instance(a), Self::Instance(b)) => Arc::ptr_eq(a, b),
            (Self::Module(a), Self::Module(b)) => Arc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => Arc::ptr_eq(a, b),
            (Self::Iterator(a), Self::Iterator(b)) => Arc::ptr_eq(a, b),
            (Self::Property(a), Self::Property(b)) => Arc::ptr_eq(a, b),
            (Self::ClassMethod(a), Self::ClassMethod(b)) | (Self::StaticMethod(a), Self::StaticMethod(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Self::Super(a), Self::Super(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// A stable identity number, the `id()` builtin.
    #[must_use]
    pub fn id(&self) -> usize {
        fn addr<T: ?Sized>(arc: &Arc<T>) -> usize {
            Arc::as_ptr(arc).cast::<()>() as usize
        }
        match self {
            Self::None => 0x10,
            Self::NotImplemented => 0x20,
            Self::Ellipsis => 0x30,
            Self::Bool(b) => 0x40 + usize::from(*b),
            Self::Int(i) => (*i as usize).wrapping_mul(2).wrapping_add(1),
            Self::Float(f) => f.to_bits() as usize | 1,
            Self::BigInt(v) => addr(v),
            Self::Str(v) => addr(v),
            Self::Bytes(v) => addr(v),
            Self::Tuple(v) => addr(v),
            Self::List(v) => addr(v),
            Self::Dict(v) => addr(v),
            Self::Set(v) | Self::FrozenSet(v) => addr(v),
            Self::Range(v) => addr(v),
            Self::Slice(v) => addr(v),
            Self::Function(v) => addr(v),
            Self::Builtin(v) => addr(v),
            Self::BoundMethod(v) => addr(v),
            Self::Type(v) => addr(v),
            Self::Instance(v) => addr(v),
            Self::Module(v) => addr(v),
            Self::Generator(v) => addr(v),
            Self::Iterator(v) => addr(v),
            Self::Property(v) => addr(v),
            Self::ClassMethod(v) | Self::StaticMethod(v) => addr(v),
            Self::Super(v) => addr(v),
        }
    }

    /// Name of the value's class, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> Arc<str> {
        Arc::clone(&crate::types::type_of(self).name)
    }

    /// Truthiness for values whose truth does not involve user code.
    ///
    /// Returns `None` for instances, which need `__bool__`/`__len__` dispatch.
    #[must_use]
    pub fn native_truth(&self) -> Option<bool> {
        Some(match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::BigInt(b) => !b.is_zero(),
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Bytes(b) => !b.is_empty(),
            Self::Tuple(t) => !t.is_empty(),
            Self::List(l) => l.len() != 0,
            Self::Dict(d) => d.len() != 0,
            Self::Set(s) | Self::FrozenSet(s) => s.len() != 0,
            Self::Range(r) => r.len() != 0,
            Self::Instance(_) => return None,
            _ => true,
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        match i64::try_from(n) {
            Ok(i) => Self::Int(i),
            Err(_) => Self::from_bigint(BigInt::from(n)),
        }
    }
}

/// Debug output uses the context-free repr so AST and tree dumps stay readable.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::ops::format::plain_repr(self))
    }
}
