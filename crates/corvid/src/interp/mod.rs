//! Tree-walking execution of lowered code.
//!
//! [`ExecCtx`] is the per-thread execution context threaded through every operation: the
//! shared runtime (configuration, builtins, module registry, importer, tracer, output), the
//! stack of exceptions currently being handled and the call depth. [`Frame`] is the storage
//! of one activation of a code object.
//!
//! [`run_code`] is the single entry for every non-generator activation. It counts entries on
//! the code object and, once the tiering policy says so, compiles the code to a
//! [`Delegate`] and runs that instead of walking the tree. Generator frames never tier: a
//! generator body always resumes on the interpreter, so a paused instance can never observe
//! a switch of representation.

pub(crate) mod exec;
pub mod generator;
pub(crate) mod intrinsics;

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{
    config::HostConfig,
    delegate::Delegate,
    exception_private::{ExcType, RunError, RunResult, TracebackEntry},
    lower::tree::{Name, NameRef},
    modes::{GlobalTable, Globals, Namespace},
    run::RuntimeInner,
    source::TieringPolicy,
    tracer::RuntimeTracer,
    types::{BodyKind, Cell, Function, FunctionCode, Generator},
    value::Value,
};

/// Per-thread execution context.
///
/// One context runs one thread's frames; [`ExecCtx::fork`] makes another over the same
/// runtime for a different thread.
pub struct ExecCtx {
    runtime: Arc<RuntimeInner>,
    /// Exceptions whose handlers are running, innermost last.
    handled: Vec<RunError>,
    depth: usize,
    interrupt: Arc<AtomicBool>,
    /// The most recent error reported to the tracer, so propagation does not re-report it.
    last_raised: Option<RunError>,
}

impl ExecCtx {
    pub(crate) fn new(runtime: Arc<RuntimeInner>, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            runtime,
            handled: Vec::new(),
            depth: 0,
            interrupt,
            last_raised: None,
        }
    }

    /// A context over a fresh runtime, for unit tests of the dispatch layer.
    #[cfg(test)]
    pub(crate) fn for_tests<T: RuntimeTracer + 'static>(config: HostConfig, tracer: Arc<T>) -> Self {
        let tracer: Arc<dyn RuntimeTracer> = tracer;
        let runtime = RuntimeInner::new(
            Arc::new(config),
            Arc::new(crate::import::MemoryImporter::new()),
            tracer,
            Box::new(crate::io::NoPrint),
        );
        Self::new(Arc::new(runtime), Arc::new(AtomicBool::new(false)))
    }

    /// A context for another thread: same runtime and interrupt flag, empty stack.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self::new(Arc::clone(&self.runtime), Arc::clone(&self.interrupt))
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.runtime.config
    }

    #[must_use]
    pub fn tracer(&self) -> &dyn RuntimeTracer {
        &*self.runtime.tracer
    }

    #[must_use]
    pub fn builtins(&self) -> &Arc<GlobalTable> {
        &self.runtime.builtins
    }

    pub(crate) fn runtime(&self) -> &Arc<RuntimeInner> {
        &self.runtime
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Raises `KeyboardInterrupt` once after the host requested an interrupt.
    pub(crate) fn check_interrupt(&self) -> RunResult<()> {
        if self.interrupt.load(Ordering::Relaxed) && self.interrupt.swap(false, Ordering::AcqRel) {
            return Err(RunError::bare(ExcType::KeyboardInterrupt));
        }
        Ok(())
    }

    /// Statement boundary: delivers a pending interrupt, then closes generators dropped while
    /// suspended.
    pub(crate) fn safe_point(&mut self) -> RunResult<()> {
        self.check_interrupt()?;
        if Generator::has_orphans() {
            generator::reap_orphans(self);
        }
        Ok(())
    }

    /// Pushes a frame, enforcing the recursion limit.
    pub(crate) fn enter(&mut self, name: &str) -> RunResult<()> {
        if self.depth >= self.config().recursion_limit {
            return Err(RunError::new(ExcType::RecursionError, "maximum recursion depth exceeded"));
        }
        self.depth += 1;
        self.runtime.tracer.on_call(name, self.depth);
        Ok(())
    }

    pub(crate) fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.runtime.tracer.on_return(self.depth);
    }

    /// The exception whose handler is innermost, for bare `raise` and implicit chaining.
    #[must_use]
    pub(crate) fn handled(&self) -> Option<&RunError> {
        self.handled.last()
    }

    pub(crate) fn push_handled(&mut self, err: RunError) {
        self.handled.push(err);
    }

    pub(crate) fn pop_handled(&mut self) {
        self.handled.pop();
    }

    /// Reports a newly raised error to the tracer exactly once.
    pub(crate) fn note_raise(&mut self, err: &RunError, line: u32) {
        if self.last_raised.as_ref().is_some_and(|last| last.is(err)) {
            return;
        }
        self.runtime.tracer.on_raise(&err.type_name(), line);
        self.last_raised = Some(err.clone());
    }
}

/// Storage of one activation.
pub struct Frame {
    pub(crate) code: Arc<FunctionCode>,
    pub(crate) globals: Globals,
    pub(crate) slots: Vec<Option<Value>>,
    /// Own cells first, then the closure's.
    pub(crate) cells: Vec<Arc<Cell>>,
    /// Separate locals namespace for class bodies and exec/eval with explicit locals.
    pub(crate) locals: Option<Namespace>,
    pub(crate) temps: Vec<Temp>,
    pub(crate) resume: Option<Resume>,
    /// Resume index of the yield the frame is suspended at.
    pub(crate) suspended_at: u32,
    pub(crate) line: u32,
    /// Process-unique identity, so an exception records each activation at most once.
    serial: u64,
}

static NEXT_FRAME_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Contents of a frame temporary.
#[derive(Default)]
pub(crate) enum Temp {
    #[default]
    Empty,
    Value(Value),
    /// The exception a handler is running for.
    Error(RunError),
    /// What a `finally` block continues with.
    Pending(Pending),
}

/// The outcome a `finally` block replays once it completes normally.
pub(crate) enum Pending {
    Normal,
    Raise(RunError),
    Return(Value),
    Break,
    Continue,
}

impl Pending {
    pub(crate) fn from_outcome(outcome: RunResult<Flow>) -> Self {
        match outcome {
            Ok(Flow::Normal | Flow::Yield(_)) => Self::Normal,
            Ok(Flow::Break) => Self::Break,
            Ok(Flow::Continue) => Self::Continue,
            Ok(Flow::Return(value)) => Self::Return(value),
            Err(err) => Self::Raise(err),
        }
    }

    pub(crate) fn replay(self) -> RunResult<Flow> {
        match self {
            Self::Normal => Ok(Flow::Normal),
            Self::Raise(err) => Err(err),
            Self::Return(value) => Ok(Flow::Return(value)),
            Self::Break => Ok(Flow::Break),
            Self::Continue => Ok(Flow::Continue),
        }
    }
}

/// How a resumed generator frame continues at its suspension point.
pub(crate) struct Resume {
    pub(crate) index: u32,
    pub(crate) action: ResumeAction,
}

pub(crate) enum ResumeAction {
    Send(Value),
    Throw(RunError),
}

/// Completion of a statement or block.
#[derive(Debug)]
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
    /// The frame suspends with this value; `Frame::suspended_at` says where.
    Yield(Value),
}

impl Frame {
    fn new(code: Arc<FunctionCode>, globals: Globals, slots: Vec<Option<Value>>, cells: Vec<Arc<Cell>>) -> Self {
        let temps = std::iter::repeat_with(Temp::default).take(code.temp_count).collect();
        let line = code.first_line;
        Self {
            code,
            globals,
            slots,
            cells,
            locals: None,
            temps,
            resume: None,
            suspended_at: 0,
            line,
            serial: NEXT_FRAME_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// A function activation over bound argument slots.
    pub(crate) fn for_call(func: &Function, mut slots: Vec<Option<Value>>) -> Self {
        let code = Arc::clone(&func.code);
        slots.resize(code.slot_count.max(slots.len()), None);
        let mut cells: Vec<Arc<Cell>> = (0..code.cell_names.len()).map(|_| Arc::new(Cell::default())).collect();
        for &(slot, cell) in &code.cell_params {
            if let (Some(value), Some(cell)) = (slots.get_mut(slot).and_then(Option::take), cells.get(cell)) {
                cell.set(value);
            }
        }
        cells.extend(func.closure.iter().cloned());
        Self::new(code, func.globals.clone(), slots, cells)
    }

    /// A module, exec or eval activation.
    pub(crate) fn for_module(code: Arc<FunctionCode>, globals: Globals, locals: Option<Namespace>) -> Self {
        let cells = (0..code.cell_names.len()).map(|_| Arc::new(Cell::default())).collect();
        let mut frame = Self::new(code, globals, Vec::new(), cells);
        frame.locals = locals;
        frame
    }

    /// A class body activation over the class namespace.
    pub(crate) fn for_class(code: Arc<FunctionCode>, globals: Globals, namespace: Namespace, closure: Vec<Arc<Cell>>) -> Self {
        let mut cells: Vec<Arc<Cell>> = (0..code.cell_names.len()).map(|_| Arc::new(Cell::default())).collect();
        cells.extend(closure);
        let mut frame = Self::new(code, globals, Vec::new(), cells);
        frame.locals = Some(namespace);
        frame
    }

    /// Adds this activation, at its current line, to `err`'s traceback unless it is already
    /// there.
    pub(crate) fn record_in(&self, err: &RunError) {
        err.record_frame(self.serial, || TracebackEntry {
            filename: Arc::clone(&self.code.unit.filename),
            name: Arc::clone(&self.code.name),
            line: self.line,
        });
    }

    // -- temporaries --

    pub(crate) fn set_temp(&mut self, index: u32, value: Value) {
        self.put_temp(index, Temp::Value(value));
    }

    pub(crate) fn put_temp(&mut self, index: u32, temp: Temp) {
        if let Some(slot) = self.temps.get_mut(index as usize) {
            *slot = temp;
        }
    }

    pub(crate) fn take_temp(&mut self, index: u32) -> Temp {
        self.temps.get_mut(index as usize).map(std::mem::take).unwrap_or_default()
    }

    pub(crate) fn clear_temp(&mut self, index: u32) {
        self.put_temp(index, Temp::Empty);
    }

    pub(crate) fn temp_value(&self, index: u32) -> RunResult<Value> {
        match self.temps.get(index as usize) {
            Some(Temp::Value(value)) => Ok(value.clone()),
            _ => Err(lost_state()),
        }
    }

    pub(crate) fn temp_error(&self, index: u32) -> RunResult<RunError> {
        match self.temps.get(index as usize) {
            Some(Temp::Error(err)) => Ok(err.clone()),
            _ => Err(lost_state()),
        }
    }

    // -- resumption --

    /// The pending resume index, while a generator frame is walking back to its yield.
    pub(crate) fn resume_index(&self) -> Option<u32> {
        self.resume.as_ref().map(|resume| resume.index)
    }

    /// Whether the pending resume point lies inside `block`.
    pub(crate) fn resuming_into(&self, block: &[crate::lower::tree::Stmt]) -> bool {
        self.resume_index()
            .is_some_and(|index| crate::lower::tree::block_contains(block, index))
    }

    /// Takes the resume action if the frame is resuming at exactly `index`.
    pub(crate) fn take_resume_at(&mut self, index: u32) -> Option<ResumeAction> {
        if self.resume_index() == Some(index) {
            return self.resume.take().map(|resume| resume.action);
        }
        None
    }

    // -- names --

    pub(crate) fn load(&self, ctx: &ExecCtx, name: &Name) -> RunResult<Value> {
        self.load_ref(ctx, &name.name, &name.target)
    }

    fn load_ref(&self, ctx: &ExecCtx, name: &str, target: &NameRef) -> RunResult<Value> {
        match target {
            NameRef::Fast(slot) => self
                .slots
                .get(*slot as usize)
                .and_then(Clone::clone)
                .ok_or_else(|| unbound_local(name)),
            NameRef::Cell(index) => match self.cells.get(*index as usize).and_then(|cell| cell.get()) {
                Some(value) => Ok(value),
                None if (*index as usize) < self.code.cell_names.len() => Err(unbound_local(name)),
                None => Err(RunError::new(
                    ExcType::NameError,
                    format!("cannot access free variable '{name}' where it is not associated with a value in enclosing scope"),
                )),
            },
            NameRef::Global(index) => self
                .globals
                .load(*index as usize, name, ctx.builtins())
                .ok_or_else(|| RunError::name_error(name)),
            NameRef::Local { fallback } => match self.locals.as_ref().and_then(|locals| locals.get(name)) {
                Some(value) => Ok(value),
                None => self.load_ref(ctx, name, fallback),
            },
        }
    }

    pub(crate) fn store(&mut self, name: &Name, value: Value) {
        self.store_ref(&name.name, &name.target, value);
    }

    fn store_ref(&mut self, name: &str, target: &NameRef, value: Value) {
        match target {
            NameRef::Fast(slot) => {
                if let Some(slot) = self.slots.get_mut(*slot as usize) {
                    *slot = Some(value);
                }
            }
            NameRef::Cell(index) => {
                if let Some(cell) = self.cells.get(*index as usize) {
                    cell.set(value);
                }
            }
            NameRef::Global(index) => self.globals.store(*index as usize, name, value),
            NameRef::Local { fallback } => match &self.locals {
                Some(locals) => locals.set(name, value),
                None => self.store_ref(name, fallback, value),
            },
        }
    }

    pub(crate) fn delete(&mut self, name: &Name) -> RunResult<()> {
        self.delete_ref(&name.name, &name.target)
    }

    fn delete_ref(&mut self, name: &str, target: &NameRef) -> RunResult<()> {
        let bound = match target {
            NameRef::Fast(slot) => self.slots.get_mut(*slot as usize).and_then(Option::take).is_some(),
            NameRef::Cell(index) => self.cells.get(*index as usize).is_some_and(|cell| cell.clear()),
            NameRef::Global(index) => self.globals.delete(*index as usize, name),
            NameRef::Local { fallback } => match &self.locals {
                Some(locals) => locals.remove(name),
                None => return self.delete_ref(name, fallback),
            },
        };
        if bound {
            Ok(())
        } else if matches!(target, NameRef::Fast(_) | NameRef::Cell(_)) {
            Err(unbound_local(name))
        } else {
            Err(RunError::name_error(name))
        }
    }
}

fn unbound_local(name: &str) -> RunError {
    RunError::new(
        ExcType::UnboundLocalError,
        format!("cannot access local variable '{name}' where it is not associated with a value"),
    )
}

fn lost_state() -> RunError {
    RunError::new(ExcType::RuntimeError, "frame state lost while resuming")
}

/// Runs a Python function with already-bound argument slots.
///
/// Generator functions return a fresh generator object without running any of the body.
pub fn run_function(ctx: &mut ExecCtx, func: &Arc<Function>, slots: Vec<Option<Value>>) -> RunResult<Value> {
    let frame = Frame::for_call(func, slots);
    if func.code.is_generator() {
        return Ok(Value::Generator(Arc::new(Generator::new(Arc::clone(&func.code), frame))));
    }
    let mut frame = frame;
    let result = run_code(ctx, &mut frame);
    // Locals die with the frame; generators suspended in them close before the caller resumes.
    drop(frame);
    if Generator::has_orphans() {
        generator::reap_orphans(ctx);
    }
    result
}

/// Native stack that must remain before entering another activation.
const STACK_RED_ZONE: usize = 128 * 1024;
/// Size of each stack segment allocated once the red zone is reached.
const STACK_SEGMENT: usize = 4 * 1024 * 1024;

/// Runs `f` with at least [`STACK_RED_ZONE`] bytes of native stack available.
///
/// Every activation recurses through the Rust stack, so deep recursion in user code must
/// reach the recursion limit without overflowing the host thread, whatever its size.
pub(crate) fn with_stack<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, f)
}

/// Runs one activation to completion: depth accounting, tiering and traceback recording.
pub(crate) fn run_code(ctx: &mut ExecCtx, frame: &mut Frame) -> RunResult<Value> {
    with_stack(|| run_activation(ctx, frame))
}

fn run_activation(ctx: &mut ExecCtx, frame: &mut Frame) -> RunResult<Value> {
    let code = Arc::clone(&frame.code);
    if let Err(err) = ctx.enter(&code.qualname) {
        frame.record_in(&err);
        return Err(err);
    }
    let result = execute(ctx, frame, &code);
    ctx.leave();
    match result {
        Ok(Flow::Return(value)) => Ok(value),
        Ok(_) => Ok(Value::None),
        Err(err) => {
            ctx.note_raise(&err, frame.line);
            frame.record_in(&err);
            Err(err)
        }
    }
}

fn execute(ctx: &mut ExecCtx, frame: &mut Frame, code: &Arc<FunctionCode>) -> RunResult<Flow> {
    let calls = code.record_call();
    if let Some(delegate) = code.delegate() {
        return delegate.run(ctx, frame);
    }
    if should_compile(ctx, code, calls) {
        let (delegate, compiled) = code.delegate_or_compile(|| Delegate::compile(code));
        if compiled {
            ctx.tracer().on_tier_up(&code.qualname, calls);
        }
        return delegate.run(ctx, frame);
    }
    exec::run_body(ctx, frame)
}

fn should_compile(ctx: &ExecCtx, code: &FunctionCode, calls: u32) -> bool {
    // Suspended and introspected frames stay on the interpreter.
    if code.is_generator() || code.needs_heap_frame() {
        return false;
    }
    // Class bodies stay on the interpreter.
    if code.kind == BodyKind::Class {
        return false;
    }
    match code.unit.tiering {
        Some(TieringPolicy::AlwaysInterpret) => false,
        Some(TieringPolicy::AlwaysCompile) => true,
        Some(TieringPolicy::Threshold(threshold)) => calls > threshold,
        None => calls > ctx.config().tier_threshold,
    }
}
