//! Public interface for compiling and running code.
//!
//! A [`Runtime`] owns everything process-wide: the frozen [`HostConfig`], the builtins, the
//! module registry, the importer, the tracer and the print writer. It is cheap to clone and
//! can be shared between threads. Code runs in a [`Session`], which holds one thread's
//! execution context; open one session per thread.
//!
//! # Example
//! ```
//! use corvid::{CollectStringPrint, CompileOptions, HostConfig, Runtime, SourceUnit};
//!
//! let output = CollectStringPrint::new();
//! let runtime = Runtime::new(HostConfig::default()).with_output(output.clone());
//! let unit = runtime
//!     .compile(&SourceUnit::new("main.py", "print(6 * 7)"), &CompileOptions::default())
//!     .unwrap();
//! runtime.session().run_module(&unit, "__main__").unwrap();
//! assert_eq!(output.output(), "42\n");
//! ```

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, ReentrantMutex};

use crate::{
    builtins::builtins_table,
    compile::{self, CompileError, CompiledUnit},
    config::HostConfig,
    exception_private::{ExcType, RunError, RunResult},
    exception_public::{ExitStatus, PyException},
    import::{self, Found, Importer, MemoryImporter},
    interp::{ExecCtx, Frame, generator, run_code},
    io::{PrintWriter, StdPrint},
    modes::{CompilationMode, GlobalTable, Globals, Namespace},
    modules::BuiltinModule,
    ops::call::call,
    source::{CompileOptions, SourceUnit},
    tracer::{NoopTracer, RuntimeTracer},
    types::{CallArgs, Module, PyDict},
    value::Value,
};

/// State shared by every session of one runtime.
pub(crate) struct RuntimeInner {
    pub config: Arc<HostConfig>,
    pub builtins: Arc<GlobalTable>,
    pub importer: Arc<dyn Importer>,
    pub tracer: Arc<dyn RuntimeTracer>,
    pub output: Arc<Mutex<Box<dyn PrintWriter>>>,
    /// `sys.modules`.
    pub modules: Arc<PyDict>,
    /// Held for the whole of an import; nested imports on the same thread re-enter it.
    pub import_lock: ReentrantMutex<()>,
}

impl RuntimeInner {
    pub fn new(
        config: Arc<HostConfig>,
        importer: Arc<dyn Importer>,
        tracer: Arc<dyn RuntimeTracer>,
        output: Box<dyn PrintWriter>,
    ) -> Self {
        Self {
            config,
            builtins: Arc::new(builtins_table()),
            importer,
            tracer,
            output: Arc::new(Mutex::new(output)),
            modules: Arc::new(PyDict::new()),
            import_lock: ReentrantMutex::new(()),
        }
    }

    /// A copy sharing everything but the module registry, for reconfiguring a runtime.
    fn rebuild(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            builtins: Arc::clone(&self.builtins),
            importer: Arc::clone(&self.importer),
            tracer: Arc::clone(&self.tracer),
            output: Arc::clone(&self.output),
            modules: Arc::new(PyDict::new()),
            import_lock: ReentrantMutex::new(()),
        }
    }
}

/// A compiler and runtime instance.
///
/// The `with_*` methods return a reconfigured runtime with an empty module registry;
/// sessions opened before the call keep the old configuration.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// A runtime with no importable modules beyond `sys` and `builtins`, no tracing, and
    /// `print` writing to stdout.
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        let inner = RuntimeInner::new(
            Arc::new(config),
            Arc::new(MemoryImporter::new()),
            Arc::new(NoopTracer),
            Box::new(StdPrint::new()),
        );
        Self { inner: Arc::new(inner) }
    }

    #[must_use]
    pub fn with_importer(self, importer: impl Importer + 'static) -> Self {
        let mut inner = self.inner.rebuild();
        inner.importer = Arc::new(importer);
        Self { inner: Arc::new(inner) }
    }

    #[must_use]
    pub fn with_tracer(self, tracer: Arc<dyn RuntimeTracer>) -> Self {
        let mut inner = self.inner.rebuild();
        inner.tracer = tracer;
        Self { inner: Arc::new(inner) }
    }

    #[must_use]
    pub fn with_output(self, output: impl PrintWriter + 'static) -> Self {
        let mut inner = self.inner.rebuild();
        inner.output = Arc::new(Mutex::new(Box::new(output)));
        Self { inner: Arc::new(inner) }
    }

    #[must_use]
    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    /// Compiles a source unit. A non-zero `-O` level in the host config turns on
    /// `optimize` regardless of `options`.
    pub fn compile(&self, source: &SourceUnit, options: &CompileOptions) -> Result<CompiledUnit, CompileError> {
        let mut options = options.clone();
        options.optimize |= self.inner.config.optimize > 0;
        compile::compile(source, &options)
    }

    /// Loads a unit from [`CompiledUnit::to_image`] output without re-parsing it.
    pub fn load_image(&self, bytes: &[u8]) -> Result<CompiledUnit, CompileError> {
        compile::load_image(bytes, None)
    }

    /// Opens a session for the calling thread.
    #[must_use]
    pub fn session(&self) -> Session {
        let interrupt = Arc::new(AtomicBool::new(false));
        Session {
            ctx: ExecCtx::new(Arc::clone(&self.inner), Arc::clone(&interrupt)),
            interrupt,
        }
    }

    /// A registered module, if anything imported or ran it.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<Arc<Module>> {
        match self.inner.modules.get_str(name) {
            Some(Value::Module(module)) => Some(module),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("importer", &self.inner.importer)
            .field("tracer", &self.inner.tracer)
            .finish_non_exhaustive()
    }
}

/// Requests `KeyboardInterrupt` in a running session from any thread.
///
/// The exception is raised at the next statement or loop iteration of the session's code,
/// and unwinds through `finally` blocks like any other exception.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// One thread's execution context over a [`Runtime`].
pub struct Session {
    ctx: ExecCtx,
    interrupt: Arc<AtomicBool>,
}

impl Session {
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.interrupt),
        }
    }

    /// Runs `unit` as the body of a new module called `name`, registering it in
    /// `sys.modules` first. Lookup-mode units get a dict namespace, optimized units a slot
    /// table.
    pub fn run_module(&mut self, unit: &CompiledUnit, name: &str) -> Result<Arc<Module>, PyException> {
        let namespace = match unit.mode() {
            CompilationMode::Lookup => Namespace::new_dict(),
            CompilationMode::Optimized => Namespace::new_table(),
        };
        let module = Arc::new(Module::new(Arc::from(name), namespace));
        module.namespace.set("__file__", Value::str(unit.filename()));
        self.run_registered(unit, module)
    }

    fn run_registered(&mut self, unit: &CompiledUnit, module: Arc<Module>) -> Result<Arc<Module>, PyException> {
        let registry = Arc::clone(&self.ctx.runtime().modules);
        registry.set_str(&module.name, Value::Module(Arc::clone(&module)));
        let result = import::exec_module(&mut self.ctx, unit, &module);
        self.finish(result).map(|_| module)
    }

    /// Runs an exec unit against `namespace`.
    pub fn exec(&mut self, unit: &CompiledUnit, namespace: &Namespace) -> Result<(), PyException> {
        let result = self.run_in(unit, namespace);
        self.finish(result).map(drop)
    }

    /// Runs an eval unit against `namespace` and returns the expression's value.
    pub fn eval(&mut self, unit: &CompiledUnit, namespace: &Namespace) -> Result<Value, PyException> {
        let result = self.run_in(unit, namespace);
        self.finish(result)
    }

    fn run_in(&mut self, unit: &CompiledUnit, namespace: &Namespace) -> RunResult<Value> {
        let globals = Globals::for_unit(unit.info.mode, namespace, &unit.info.global_names)?;
        let mut frame = Frame::for_module(Arc::clone(&unit.code), globals, None);
        run_code(&mut self.ctx, &mut frame)
    }

    /// Calls any callable value with positional arguments.
    pub fn call(&mut self, callable: &Value, args: Vec<Value>) -> Result<Value, PyException> {
        let result = call(&mut self.ctx, callable, CallArgs::positional(args));
        self.finish(result)
    }

    /// Calls a callable with positional and keyword arguments.
    pub fn call_with_keywords(
        &mut self,
        callable: &Value,
        args: Vec<Value>,
        keywords: Vec<(&str, Value)>,
    ) -> Result<Value, PyException> {
        let mut call_args = CallArgs::positional(args);
        call_args.keywords = keywords.into_iter().map(|(name, value)| (Arc::from(name), value)).collect();
        let result = call(&mut self.ctx, callable, call_args);
        self.finish(result)
    }

    /// Imports a module by absolute name, as `import name` would.
    pub fn import(&mut self, name: &str) -> Result<Arc<Module>, PyException> {
        let result = import::import_module(&mut self.ctx, name, 0, None).map(|imported| imported.leaf);
        self.finish(result)
    }

    /// Runs a program's main unit and reports how it ended, writing any unhandled exception
    /// to stderr.
    pub fn run_main(&mut self, unit: &CompiledUnit) -> ExitStatus {
        self.run_main_to(unit, &mut io::stderr().lock())
    }

    /// [`Session::run_main`] with an explicit error stream.
    pub fn run_main_to(&mut self, unit: &CompiledUnit, stderr: &mut dyn io::Write) -> ExitStatus {
        let outcome = self.run_module(unit, "__main__").map(drop);
        report(outcome, stderr)
    }

    /// Runs module `name`, found through the importer, as `__main__` (`-m name`). A
    /// package runs its `__main__` submodule.
    pub fn run_module_as_main(&mut self, name: &str, stderr: &mut dyn io::Write) -> ExitStatus {
        let outcome = self.locate_main(name).and_then(|(unit, package)| {
            let module = Arc::new(Module::new(Arc::from("__main__"), Namespace::new_table()));
            import::init_module_attrs(&module, unit.filename(), false);
            module.namespace.set("__package__", Value::Str(package));
            self.run_registered(&unit, module).map(drop)
        });
        report(outcome, stderr)
    }

    /// The unit to run for `-m name` and the package it runs in.
    fn locate_main(&mut self, name: &str) -> Result<(CompiledUnit, Arc<str>), PyException> {
        if BuiltinModule::from_name(name).is_some() {
            return Err(PyException::from_run_error(&RunError::new(
                ExcType::ImportError,
                format!("No code object available for {name}"),
            )));
        }
        if let Some((parent, _)) = name.rsplit_once('.') {
            self.import(parent)?;
        }
        let found = import::find(&mut self.ctx, name, 0);
        match self.finish(found)? {
            Found::Unit { package: false, unit } => {
                let parent = name.rsplit_once('.').map_or("", |(parent, _)| parent);
                Ok((unit, Arc::from(parent)))
            }
            Found::Unit { package: true, .. } => {
                self.import(name)?;
                let main = format!("{name}.__main__");
                let found = import::find(&mut self.ctx, &main, 0);
                match self.finish(found)? {
                    Found::Unit { unit, .. } => Ok((unit, Arc::from(name))),
                    Found::Module(_) => Err(no_code(&main)),
                }
            }
            Found::Module(_) => Err(no_code(name)),
        }
    }

    /// Converts an internal result, flushing printed output either way.
    fn finish<T>(&mut self, result: RunResult<T>) -> Result<T, PyException> {
        generator::reap_orphans(&mut self.ctx);
        let flushed = self.ctx.runtime().output.lock().flush();
        match (result, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) | (Ok(_), Err(err)) => Err(PyException::from_run_error(&err)),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("depth", &self.ctx.depth()).finish_non_exhaustive()
    }
}

fn no_code(name: &str) -> PyException {
    PyException::from_run_error(&RunError::new(
        ExcType::ImportError,
        format!("No code object available for {name}"),
    ))
}

/// Maps how a program ended to its exit status, printing what the user needs to see.
fn report(outcome: Result<(), PyException>, stderr: &mut dyn io::Write) -> ExitStatus {
    let Err(exc) = outcome else {
        return ExitStatus::SUCCESS;
    };
    if exc.is(ExcType::SystemExit) {
        if let Some(message) = exc.exit_message() {
            let _ = writeln!(stderr, "{message}");
        }
        return ExitStatus::from(&exc);
    }
    let _ = write!(stderr, "{}", exc.traceback_text());
    if exc.is(ExcType::KeyboardInterrupt) {
        return ExitStatus(130);
    }
    ExitStatus::FAILURE
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::io::CollectStringPrint;

    fn runtime() -> (Runtime, CollectStringPrint) {
        let output = CollectStringPrint::new();
        let runtime = Runtime::new(HostConfig::default()).with_output(output.clone());
        (runtime, output)
    }

    fn unit(runtime: &Runtime, text: &str) -> CompiledUnit {
        runtime
            .compile(&SourceUnit::new("main.py", text), &CompileOptions::default())
            .unwrap()
    }

    #[test]
    fn exit_codes_follow_system_exit() {
        let (runtime, _) = runtime();
        let mut stderr = Vec::new();
        let status = runtime
            .session()
            .run_main_to(&unit(&runtime, "import sys\nsys.exit(3)\n"), &mut stderr);
        assert_eq!(status, ExitStatus(3));
        assert!(stderr.is_empty());
        let status = runtime
            .session()
            .run_main_to(&unit(&runtime, "raise SystemExit('bye')\n"), &mut stderr);
        assert_eq!(status, ExitStatus::FAILURE);
        assert_eq!(String::from_utf8(stderr).unwrap(), "bye\n");
    }

    #[test]
    fn unhandled_exceptions_print_a_traceback() {
        let (runtime, _) = runtime();
        let mut stderr = Vec::new();
        let source = "def f():\n    return 1 / 0\nf()\n";
        let status = runtime.session().run_main_to(&unit(&runtime, source), &mut stderr);
        assert_eq!(status, ExitStatus::FAILURE);
        assert_eq!(
            String::from_utf8(stderr).unwrap(),
            "Traceback (most recent call last):\n  \
             File \"main.py\", line 3, in <module>\n  \
             File \"main.py\", line 2, in f\n\
             ZeroDivisionError: division by zero\n"
        );
    }

    #[test]
    fn modules_are_registered_before_they_run() {
        let (runtime, output) = runtime();
        let source = "import sys\nprint(sys.modules['__main__'].__name__)\n";
        runtime.session().run_module(&unit(&runtime, source), "__main__").unwrap();
        assert_eq!(output.output(), "__main__\n");
        assert!(runtime.module("__main__").is_some());
    }

    #[test]
    fn optimize_level_strips_asserts() {
        let config = HostConfig::builder().optimize(1).build();
        let runtime = Runtime::new(config).with_output(CollectStringPrint::new());
        let mut session = runtime.session();
        assert!(session.run_module(&unit(&runtime, "assert False\n"), "m").is_ok());
    }

    #[test]
    fn interrupt_raises_keyboard_interrupt() {
        let (runtime, _) = runtime();
        let mut session = runtime.session();
        session.interrupt_handle().interrupt();
        let err = session
            .run_module(&unit(&runtime, "while True:\n    pass\n"), "m")
            .unwrap_err();
        assert!(err.is(ExcType::KeyboardInterrupt));
    }
}
