//! Runtime object model: classes, containers, callables and iterators.

pub mod class;
pub mod dict;
pub mod function;
pub mod generator;
pub mod iter;
pub mod list;
pub mod module;
pub mod range;
pub mod set;
pub mod r#type;

pub use class::{Instance, SuperObject};
pub use dict::{DictKey, DictStorage, PyDict};
pub use function::{
    BodyKind, BoundMethod, BuiltinFn, BuiltinFunction, CallArgs, Cell, CodeFlags, FrameIntrinsic, Function,
    FunctionCode, ParamSpec, Property,
};
pub use generator::{GenState, Generator};
pub use iter::{IterState, PyIterator};
pub use list::PyList;
pub use module::Module;
pub use range::{PyRange, PySlice};
pub use set::{PySet, SetStorage};
pub use r#type::{BuiltinKind, PyType, TypeKind, builtin_type, exc_class, is_instance, type_of};
