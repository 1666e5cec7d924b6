//! The import system.
//!
//! The runtime resolves relative names, keeps the module registry (`sys.modules`) and runs
//! module bodies. Finding a module's code is the host's job: it supplies an [`Importer`]
//! that maps an absolute dotted name to source text, a code image or a ready module.
//!
//! A module is registered before its body runs, so a circular import sees the partially
//! initialized module instead of recursing. If the body raises, the module is removed again.

use std::{fmt, sync::Arc};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::{
    compile::{self, CompiledUnit},
    exception_private::{ExcType, RunError, RunResult},
    interp::{ExecCtx, Frame, run_code},
    modes::{Globals, Namespace},
    modules::BuiltinModule,
    source::{CodeKind, CompileOptions, SourceUnit},
    types::Module,
    value::Value,
};

/// What an [`Importer`] found for a module name.
pub enum Imported {
    /// Source text to compile as a module. `package` marks an `__init__`.
    Source { unit: SourceUnit, package: bool },
    /// A code image produced by [`CompiledUnit::to_image`].
    Image { bytes: Arc<[u8]>, package: bool },
    /// A module the host built itself.
    Module(Arc<Module>),
}

/// A failure inside the importer, reported to the program as `ImportError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ImportFailure {
    pub message: String,
}

impl ImportFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The module-finding collaborator supplied by the host.
pub trait Importer: fmt::Debug + Send + Sync {
    /// Looks up the module with absolute dotted `name`. `level` is the number of leading
    /// dots the import statement was written with; the name has already been resolved
    /// against the importing package. `Ok(None)` means there is no such module.
    fn import(&self, name: &str, level: u32) -> Result<Option<Imported>, ImportFailure>;
}

/// An importer over sources registered in memory.
#[derive(Debug, Default)]
pub struct MemoryImporter {
    modules: RwLock<AHashMap<Arc<str>, (Arc<str>, bool)>>,
}

impl MemoryImporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plain module.
    #[must_use]
    pub fn with_module(self, name: &str, text: &str) -> Self {
        self.add(name, text, false);
        self
    }

    /// Registers a package; `text` is its `__init__` body.
    #[must_use]
    pub fn with_package(self, name: &str, text: &str) -> Self {
        self.add(name, text, true);
        self
    }

    pub fn add(&self, name: &str, text: &str, package: bool) {
        self.modules.write().insert(Arc::from(name), (Arc::from(text), package));
    }
}

impl Importer for MemoryImporter {
    fn import(&self, name: &str, _level: u32) -> Result<Option<Imported>, ImportFailure> {
        let modules = self.modules.read();
        Ok(modules.get(name).map(|(text, package)| {
            let file = name.replace('.', "/");
            let path = if *package {
                format!("{file}/__init__.py")
            } else {
                format!("{file}.py")
            };
            Imported::Source {
                unit: SourceUnit::new(path, Arc::clone(text)),
                package: *package,
            }
        }))
    }
}

/// The modules bound by one `import` statement.
pub(crate) struct ImportedModule {
    /// The first component, which `import a.b` binds.
    pub top: Arc<Module>,
    pub leaf: Arc<Module>,
}

/// Imports `module` (`level` leading dots, relative to `package`), loading every parent
/// package on the way.
pub(crate) fn import_module(
    ctx: &mut ExecCtx,
    module: &str,
    level: u32,
    package: Option<&str>,
) -> RunResult<ImportedModule> {
    let name = resolve_name(module, level, package)?;
    let runtime = Arc::clone(ctx.runtime());
    let _guard = runtime.import_lock.lock();
    let mut top: Option<Arc<Module>> = None;
    let mut parent: Option<Arc<Module>> = None;
    let mut start = 0;
    loop {
        let end = name[start..].find('.').map_or(name.len(), |dot| start + dot);
        let loaded = load(ctx, &name[..end], level)?;
        if let Some(parent) = &parent {
            parent.namespace.set(&name[start..end], Value::Module(Arc::clone(&loaded)));
        }
        let first = top.get_or_insert_with(|| Arc::clone(&loaded));
        if end == name.len() {
            return Ok(ImportedModule {
                top: Arc::clone(first),
                leaf: loaded,
            });
        }
        parent = Some(loaded);
        start = end + 1;
    }
}

/// `from module import name`: an attribute of the module, or else a submodule.
pub(crate) fn import_from(ctx: &mut ExecCtx, module: &Arc<Module>, name: &str) -> RunResult<Value> {
    if let Some(value) = module.namespace.get(name) {
        return Ok(value);
    }
    let submodule = format!("{}.{name}", module.name);
    let is_package = module.namespace.get("__path__").is_some();
    if is_package {
        match import_module(ctx, &submodule, 0, None) {
            Ok(imported) => return Ok(Value::Module(imported.leaf)),
            Err(err) if !err.matches(ExcType::ModuleNotFoundError) => return Err(err),
            Err(_) => {}
        }
    }
    Err(RunError::new(
        ExcType::ImportError,
        format!("cannot import name '{name}' from '{}'", module.name),
    ))
}

/// The names `from module import *` binds: `__all__` if the module defines it, otherwise
/// every name not starting with an underscore.
pub(crate) fn public_names(ctx: &mut ExecCtx, module: &Arc<Module>) -> RunResult<Vec<(Arc<str>, Value)>> {
    if let Some(all) = module.namespace.get("__all__") {
        let mut names = Vec::new();
        for item in crate::ops::iter::collect(ctx, &all)? {
            let name = match item {
                Value::Str(name) => name,
                other => {
                    return Err(RunError::type_error(format!(
                        "Item in {}.__all__ must be str, not {}",
                        module.name,
                        other.type_name()
                    )));
                }
            };
            let value = import_from(ctx, module, &name)?;
            names.push((name, value));
        }
        return Ok(names);
    }
    Ok(module
        .namespace
        .names()
        .into_iter()
        .filter(|name| !name.starts_with('_'))
        .filter_map(|name| module.namespace.get(&name).map(|value| (name, value)))
        .collect())
}

/// Turns `level` leading dots plus `module` into an absolute name.
fn resolve_name(module: &str, level: u32, package: Option<&str>) -> RunResult<String> {
    if level == 0 {
        if module.is_empty() {
            return Err(RunError::value_error("Empty module name"));
        }
        return Ok(module.to_owned());
    }
    let package = package.filter(|p| !p.is_empty()).ok_or_else(|| {
        RunError::new(ExcType::ImportError, "attempted relative import with no known parent package")
    })?;
    let mut base = package;
    for _ in 1..level {
        match base.rfind('.') {
            Some(dot) => base = &base[..dot],
            None => {
                return Err(RunError::new(
                    ExcType::ImportError,
                    "attempted relative import beyond top-level package",
                ));
            }
        }
    }
    Ok(if module.is_empty() {
        base.to_owned()
    } else {
        format!("{base}.{module}")
    })
}

/// Returns the registered module `name`, loading it if needed.
fn load(ctx: &mut ExecCtx, name: &str, level: u32) -> RunResult<Arc<Module>> {
    let registry = Arc::clone(&ctx.runtime().modules);
    if let Some(Value::Module(module)) = registry.get_str(name) {
        return Ok(module);
    }
    let (unit, package) = match find(ctx, name, level)? {
        Found::Module(module) => {
            registry.set_str(name, Value::Module(Arc::clone(&module)));
            return Ok(module);
        }
        Found::Unit { unit, package } => (unit, package),
    };
    let module = Arc::new(Module::new(Arc::from(name), Namespace::new_table()));
    init_module_attrs(&module, unit.filename(), package);
    registry.set_str(name, Value::Module(Arc::clone(&module)));
    if let Err(err) = exec_module(ctx, &unit, &module) {
        registry.remove_str(name);
        return Err(err);
    }
    // the body may have replaced its own registry entry
    Ok(match registry.get_str(name) {
        Some(Value::Module(replaced)) => replaced,
        _ => module,
    })
}

/// A module found but not yet registered.
pub(crate) enum Found {
    Module(Arc<Module>),
    Unit { unit: CompiledUnit, package: bool },
}

/// Asks the built-in modules, then the host's importer, for `name`.
pub(crate) fn find(ctx: &mut ExecCtx, name: &str, level: u32) -> RunResult<Found> {
    if let Some(builtin) = BuiltinModule::from_name(name) {
        return builtin.create(ctx).map(Found::Module);
    }
    let found = ctx
        .runtime()
        .importer
        .import(name, level)
        .map_err(|failure| RunError::new(ExcType::ImportError, failure.message))?;
    match found {
        None => Err(RunError::new(
            ExcType::ModuleNotFoundError,
            format!("No module named '{name}'"),
        )),
        Some(Imported::Module(module)) => Ok(Found::Module(module)),
        Some(Imported::Source { unit, package }) => {
            let options = module_options(ctx);
            let unit = compile::compile(&unit, &options).map_err(|err| err.to_run_error())?;
            Ok(Found::Unit { unit, package })
        }
        Some(Imported::Image { bytes, package }) => {
            let options = module_options(ctx);
            let unit = compile::load_image(&bytes, Some(&options)).map_err(|err| err.to_run_error())?;
            Ok(Found::Unit { unit, package })
        }
    }
}

fn module_options(ctx: &ExecCtx) -> CompileOptions {
    CompileOptions {
        kind: CodeKind::Module,
        optimize: ctx.config().optimize > 0,
        ..CompileOptions::default()
    }
}

/// Sets `__file__`, `__package__` and, for packages, `__path__`.
pub(crate) fn init_module_attrs(module: &Module, file: &str, package: bool) {
    let namespace = &module.namespace;
    namespace.set("__file__", Value::str(file));
    let parent = if package {
        let dir = file.rsplit_once('/').map_or("", |(dir, _)| dir);
        namespace.set("__path__", Value::list(vec![Value::str(dir)]));
        Arc::clone(&module.name)
    } else {
        match module.name.rfind('.') {
            Some(dot) => Arc::from(&module.name[..dot]),
            None => Arc::from(""),
        }
    };
    namespace.set("__package__", Value::Str(parent));
}

/// Runs a compiled unit's body in a module's namespace.
pub(crate) fn exec_module(ctx: &mut ExecCtx, unit: &CompiledUnit, module: &Module) -> RunResult<Value> {
    module
        .namespace
        .set("__doc__", unit.code.doc.clone().unwrap_or(Value::None));
    let globals = Globals::for_unit(unit.info.mode, &module.namespace, &unit.info.global_names)?;
    let mut frame = Frame::for_module(Arc::clone(&unit.code), globals, None);
    run_code(ctx, &mut frame)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn relative_names_resolve_against_the_package() {
        assert_eq!(resolve_name("b", 1, Some("pkg.sub")).unwrap(), "pkg.sub.b");
        assert_eq!(resolve_name("b", 2, Some("pkg.sub")).unwrap(), "pkg.b");
        assert_eq!(resolve_name("", 1, Some("pkg")).unwrap(), "pkg");
        assert_eq!(resolve_name("os.path", 0, None).unwrap(), "os.path");
    }

    #[test]
    fn relative_imports_need_a_package() {
        let err = resolve_name("b", 1, None).unwrap_err();
        assert!(err.matches(ExcType::ImportError));
        let err = resolve_name("b", 3, Some("pkg.sub")).unwrap_err();
        assert_eq!(err.message(), "attempted relative import beyond top-level package");
    }

    #[test]
    fn memory_importer_paths_follow_package_layout() {
        let importer = MemoryImporter::new()
            .with_package("pkg", "")
            .with_module("pkg.mod", "x = 1");
        let Some(Imported::Source { unit, package }) = importer.import("pkg", 0).unwrap() else {
            panic!("pkg not found");
        };
        assert!(package);
        assert_eq!(unit.path.as_ref(), "pkg/__init__.py");
        let Some(Imported::Source { unit, .. }) = importer.import("pkg.mod", 1).unwrap() else {
            panic!("pkg.mod not found");
        };
        assert_eq!(unit.path.as_ref(), "pkg/mod.py");
        assert!(importer.import("missing", 0).unwrap().is_none());
    }

    #[test]
    fn package_attributes() {
        let module = Module::new(Arc::from("pkg.sub"), Namespace::new_dict());
        init_module_attrs(&module, "pkg/sub/__init__.py", true);
        assert_eq!(module.namespace.get("__package__").and_then(|v| v.as_str().map(str::to_owned)), Some("pkg.sub".to_owned()));
        let leaf = Module::new(Arc::from("pkg.leaf"), Namespace::new_dict());
        init_module_attrs(&leaf, "pkg/leaf.py", false);
        assert_eq!(leaf.namespace.get("__package__").and_then(|v| v.as_str().map(str::to_owned)), Some("pkg".to_owned()));
    }
}
