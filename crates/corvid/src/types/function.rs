//! Code objects, function objects and the other callables.
//!
//! A [`FunctionCode`] is produced once per `def`/`lambda`/comprehension/class body by the
//! lowering pass and is shared by every function object created from it. A [`Function`] pairs
//! that code with what varies per definition: the globals it runs against, evaluated default
//! values and the closure cells captured at creation time. Two closures made by the same
//! factory therefore share one code object but never share cells.

use std::{
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU32, Ordering},
    },
};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    delegate::Delegate,
    exception_private::{RunError, RunResult},
    interp::ExecCtx,
    lower::tree::{Stmt, UnitInfo},
    modes::Globals,
    value::Value,
};

/// Closed set of code-object flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFlags(u32);

impl CodeFlags {
    pub const VARARGS: Self = Self(1);
    pub const VARKEYWORDS: Self = Self(1 << 1);
    pub const GENERATOR: Self = Self(1 << 2);
    pub const COROUTINE: Self = Self(1 << 3);
    /// Defined inside another function.
    pub const NESTED: Self = Self(1 << 4);
    /// The frame outlives a single activation or is observed by name (`locals()`, `exec`).
    pub const HEAP_FRAME: Self = Self(1 << 5);
    pub const LAMBDA: Self = Self(1 << 6);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Parameter metadata. Names are in slot order: positional, `*args`, keyword-only, `**kwargs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSpec {
    pub names: Vec<Arc<str>>,
    pub posonly: usize,
    /// Positional parameters including positional-only ones.
    pub positional: usize,
    pub kwonly: usize,
    pub varargs: bool,
    pub varkw: bool,
}

impl ParamSpec {
    #[must_use]
    pub fn vararg_slot(&self) -> Option<usize> {
        self.varargs.then_some(self.positional)
    }

    #[must_use]
    pub fn kwonly_start(&self) -> usize {
        self.positional + usize::from(self.varargs)
    }

    #[must_use]
    pub fn varkw_slot(&self) -> Option<usize> {
        self.varkw.then(|| self.kwonly_start() + self.kwonly)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.names.len()
    }
}

/// What kind of body a code object holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Module,
    Class,
    Function,
}

/// The immutable compiled representation of one function, class or module body.
pub struct FunctionCode {
    pub name: Arc<str>,
    pub qualname: Arc<str>,
    pub kind: BodyKind,
    pub params: ParamSpec,
    pub flags: CodeFlags,
    pub slot_count: usize,
    pub temp_count: usize,
    /// Names of the fast slots.
    pub local_names: Vec<Arc<str>>,
    /// Cells created by this code, then cells received from the closure.
    pub cell_names: Vec<Arc<str>>,
    pub free_names: Vec<Arc<str>>,
    /// Parameters that live in cells: `(slot, cell index)`.
    pub cell_params: Vec<(usize, usize)>,
    pub body: Vec<Stmt>,
    pub unit: Arc<UnitInfo>,
    pub doc: Option<Value>,
    pub first_line: u32,
    calls: AtomicU32,
    delegate: OnceLock<Delegate>,
}

impl FunctionCode {
    #[expect(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        name: Arc<str>,
        qualname: Arc<str>,
        kind: BodyKind,
        params: ParamSpec,
        flags: CodeFlags,
        temp_count: usize,
        local_names: Vec<Arc<str>>,
        cell_names: Vec<Arc<str>>,
        free_names: Vec<Arc<str>>,
        body: Vec<Stmt>,
        unit: Arc<UnitInfo>,
        doc: Option<Value>,
        first_line: u32,
    ) -> Self {
        let cell_params = params
            .names
            .iter()
            .enumerate()
            .filter_map(|(slot, name)| cell_names.iter().position(|c| c == name).map(|cell| (slot, cell)))
            .collect();
        Self {
            name,
            qualname,
            kind,
            params,
            flags,
            slot_count: local_names.len(),
            temp_count,
            local_names,
            cell_names,
            free_names,
            cell_params,
            body,
            unit,
            doc,
            first_line,
            calls: AtomicU32::new(0),
            delegate: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    #[must_use]
    pub fn needs_heap_frame(&self) -> bool {
        self.flags.contains(CodeFlags::HEAP_FRAME)
    }

    #[must_use]
    pub fn is_coroutine(&self) -> bool {
        self.flags.contains(CodeFlags::COROUTINE)
    }

    /// Counts an entry and returns the new total.
    pub(crate) fn record_call(&self) -> u32 {
        self.calls.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    /// The compiled delegate, if this code has tiered up.
    #[must_use]
    pub fn delegate(&self) -> Option<&Delegate> {
        self.delegate.get()
    }

    /// Compiles the delegate once. Returns it and whether this call performed the compilation.
    pub(crate) fn delegate_or_compile(&self, compile: impl FnOnce() -> Delegate) -> (&Delegate, bool) {
        let mut compiled = false;
        let delegate = self.delegate.get_or_init(|| {
            compiled = true;
            compile()
        });
        (delegate, compiled)
    }
}

impl fmt::Debug for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionCode")
            .field("qualname", &self.qualname)
            .field("params", &self.params.names)
            .field("flags", &self.flags)
            .field("slots", &self.slot_count)
            .field("cells", &self.cell_names)
            .field("free", &self.free_names)
            .finish_non_exhaustive()
    }
}

/// A boxed variable shared between a defining scope and the scopes nested in it.
#[derive(Debug, Default)]
pub struct Cell {
    value: RwLock<Option<Value>>,
}

impl Cell {
    #[must_use]
    pub fn new(value: Option<Value>) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.value.read().clone()
    }

    pub fn set(&self, value: Value) {
        *self.value.write() = Some(value);
    }

    /// Unbinds the cell, returning whether it held a value.
    pub fn clear(&self) -> bool {
        self.value.write().take().is_some()
    }
}

/// A function object: shared code plus per-definition state.
pub struct Function {
    pub code: Arc<FunctionCode>,
    pub globals: Globals,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Value>,
    pub kw_defaults: Vec<(Arc<str>, Value)>,
    /// One cell per name in `code.free_names`.
    pub closure: Arc<[Arc<Cell>]>,
    pub module: Option<Arc<str>>,
    pub dict: RwLock<IndexMap<Arc<str>, Value>>,
}

impl Function {
    #[must_use]
    pub fn new(
        code: Arc<FunctionCode>,
        globals: Globals,
        defaults: Vec<Value>,
        kw_defaults: Vec<(Arc<str>, Value)>,
        closure: Arc<[Arc<Cell>]>,
    ) -> Self {
        let module = globals.module_name();
        Self {
            code,
            globals,
            defaults,
            kw_defaults,
            closure,
            module,
            dict: RwLock::new(IndexMap::new()),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.code.qualname)
    }
}

/// Native implementation of a builtin function or method.
///
/// Methods receive the bound object as the first positional argument.
pub type BuiltinFn = fn(&mut ExecCtx, CallArgs) -> RunResult<Value>;

/// Builtins that need the calling frame rather than just their arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameIntrinsic {
    Locals,
    Globals,
    Vars,
    Dir,
    Exec,
    Eval,
}

pub struct BuiltinFunction {
    pub name: &'static str,
    pub func: BuiltinFn,
    pub intrinsic: Option<FrameIntrinsic>,
}

impl BuiltinFunction {
    #[must_use]
    pub fn new(name: &'static str, func: BuiltinFn) -> Self {
        Self {
            name,
            func,
            intrinsic: None,
        }
    }

    #[must_use]
    pub fn with_intrinsic(mut self, intrinsic: FrameIntrinsic) -> Self {
        self.intrinsic = Some(intrinsic);
        self
    }

    #[must_use]
    pub fn value(name: &'static str, func: BuiltinFn) -> Value {
        Value::Builtin(Arc::new(Self::new(name, func)))
    }
}

impl fmt::Debug for BuiltinFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<built-in function {}>", self.name)
    }
}

/// A callable bound to its receiver.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub func: Value,
}

/// `property(fget, fset, fdel, doc)`.
#[derive(Debug, Clone, Default)]
pub struct Property {
    pub fget: Option<Value>,
    pub fset: Option<Value>,
    pub fdel: Option<Value>,
    pub doc: Option<Value>,
}

/// Evaluated call arguments.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: SmallVec<[Value; 4]>,
    pub keywords: Vec<(Arc<str>, Value)>,
}

impl CallArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keywords: Vec::new(),
        }
    }

    /// Prepends a receiver, as method binding does.
    #[must_use]
    pub fn with_receiver(mut self, receiver: Value) -> Self {
        self.positional.insert(0, receiver);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len() + self.keywords.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns a keyword argument.
    pub fn take_keyword(&mut self, name: &str) -> Option<Value> {
        let index = self.keywords.iter().position(|(k, _)| &**k == name)?;
        Some(self.keywords.remove(index).1)
    }

    /// Rejects keyword arguments for builtins that take none.
    pub fn no_keywords(&self, func: &str) -> RunResult<()> {
        if self.keywords.is_empty() {
            Ok(())
        } else {
            Err(RunError::type_error(format!("{func}() takes no keyword arguments")))
        }
    }

    /// Checks the positional count against `min..=max` and that no keywords remain.
    pub fn check(&self, func: &str, min: usize, max: usize) -> RunResult<()> {
        self.no_keywords(func)?;
        let n = self.positional.len();
        if n < min || n > max {
            let expected = if min == max {
                format!("exactly {min} argument{}", if min == 1 { "" } else { "s" })
            } else if n < min {
                format!("at least {min} argument{}", if min == 1 { "" } else { "s" })
            } else {
                format!("at most {max} argument{}", if max == 1 { "" } else { "s" })
            };
            return Err(RunError::type_error(format!("{func}() takes {expected} ({n} given)")));
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Splits off the receiver of a method call.
    pub fn receiver(&mut self, method: &str) -> RunResult<Value> {
        if self.positional.is_empty() {
            return Err(RunError::type_error(format!("descriptor '{method}' needs an argument")));
        }
        Ok(self.positional.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_flags_compose() {
        let mut flags = CodeFlags::VARARGS.union(CodeFlags::GENERATOR);
        assert!(flags.contains(CodeFlags::GENERATOR));
        assert!(!flags.contains(CodeFlags::VARKEYWORDS));
        flags.set(CodeFlags::GENERATOR, false);
        assert_eq!(flags, CodeFlags::VARARGS);
    }

    #[test]
    fn param_spec_slots() {
        let spec = ParamSpec {
            names: ["a", "b", "args", "k", "kw"].into_iter().map(Arc::from).collect(),
            posonly: 0,
            positional: 2,
            kwonly: 1,
            varargs: true,
            varkw: true,
        };
        assert_eq!(spec.vararg_slot(), Some(2));
        assert_eq!(spec.kwonly_start(), 3);
        assert_eq!(spec.varkw_slot(), Some(4));
    }

    #[test]
    fn argument_count_messages() {
        let args = CallArgs::positional([Value::Int(1), Value::Int(2)]);
        let err = args.check("len", 1, 1).unwrap_err();
        assert_eq!(err.to_string(), "TypeError: len() takes exactly 1 argument (2 given)");
        assert!(args.check("pow", 2, 3).is_ok());
    }

    #[test]
    fn cells_are_shared_by_reference() {
        let cell = Arc::new(Cell::new(Some(Value::Int(1))));
        let alias = Arc::clone(&cell);
        alias.set(Value::Int(2));
        assert_eq!(cell.get().and_then(|v| v.as_i64()), Some(2));
        assert!(cell.clear());
        assert!(alias.get().is_none());
    }
}
