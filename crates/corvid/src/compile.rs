//! The compiler pipeline: source or image in, runnable unit out.
//!
//! `source text -> parse -> bind -> lower`. Each stage collects every diagnostic it finds
//! and the pipeline stops after the first stage that reported any.

use std::{fmt, sync::Arc};

use crate::{
    exception_private::{ExcType, RunError},
    image::{CodeImage, ImageError},
    intern::Interner,
    lower::{self, tree::UnitInfo},
    modes::CompilationMode,
    parse::{ParseError, parse},
    prepare::{BindError, bind},
    sites::SiteView,
    source::{CodeKind, CompileOptions, SourceUnit},
    types::FunctionCode,
};

/// Everything that can stop a unit from compiling.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("{}", describe(.filename, .errors))]
    Parse { filename: Arc<str>, errors: Vec<ParseError> },
    #[error("{}", describe(.filename, .errors))]
    Bind { filename: Arc<str>, errors: Vec<BindError> },
    #[error(transparent)]
    Image(#[from] ImageError),
}

fn describe<E: fmt::Display>(filename: &str, errors: &[E]) -> String {
    let mut out = String::new();
    for (index, err) in errors.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        out.push_str(&format!("{filename}: {err}"));
    }
    out
}

impl CompileError {
    /// The exception class programs see for this failure.
    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        match self {
            Self::Parse { errors, .. } => errors.first().map_or(ExcType::SyntaxError, ParseError::exc_type),
            Self::Bind { .. } => ExcType::SyntaxError,
            Self::Image(_) => ExcType::ImportError,
        }
    }

    /// Line of the first diagnostic.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        match self {
            Self::Parse { errors, .. } => errors.first().map(|err| err.range().line()),
            Self::Bind { errors, .. } => errors.first().map(|err| err.range.line()),
            Self::Image(_) => None,
        }
    }

    /// The first diagnostic's message, without position.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Parse { errors, .. } => errors.first().map(|err| err.message().to_owned()).unwrap_or_default(),
            Self::Bind { errors, .. } => errors.first().map(|err| err.message.clone()).unwrap_or_default(),
            Self::Image(err) => err.to_string(),
        }
    }

    /// Converts the first diagnostic into the exception `exec`, `eval` and `import` raise.
    #[must_use]
    pub fn to_run_error(&self) -> RunError {
        match (self, self.line()) {
            (Self::Parse { filename, .. } | Self::Bind { filename, .. }, Some(line)) => RunError::new(
                self.exc_type(),
                format!("{} ({filename}, line {line})", self.message()),
            ),
            _ => RunError::new(self.exc_type(), self.message()),
        }
    }
}

/// A compiled unit, ready to run in any session of any runtime.
///
/// Cloning is cheap and clones share code objects, and with them call-site caches and
/// tier-up state.
#[derive(Clone)]
pub struct CompiledUnit {
    pub(crate) code: Arc<FunctionCode>,
    pub(crate) info: Arc<UnitInfo>,
    sites: Arc<[Arc<dyn SiteView>]>,
    image: Arc<CodeImage>,
}

impl CompiledUnit {
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.info.filename
    }

    #[must_use]
    pub fn kind(&self) -> CodeKind {
        self.info.kind
    }

    #[must_use]
    pub fn mode(&self) -> CompilationMode {
        self.info.mode
    }

    /// Names the unit reads or writes in its global namespace.
    #[must_use]
    pub fn global_names(&self) -> &[Arc<str>] {
        &self.info.global_names
    }

    /// Every dynamic operation site of the unit, in source order of creation.
    #[must_use]
    pub fn sites(&self) -> &[Arc<dyn SiteView>] {
        &self.sites
    }

    /// Serializes the unit's front-end output so [`Runtime::load_image`](crate::Runtime::load_image)
    /// can skip parsing and binding.
    pub fn to_image(&self) -> Result<Vec<u8>, CompileError> {
        Ok(self.image.to_bytes()?)
    }
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("filename", &self.info.filename)
            .field("kind", &self.info.kind)
            .field("mode", &self.info.mode)
            .field("sites", &self.sites.len())
            .finish_non_exhaustive()
    }
}

/// Compiles a source unit.
pub fn compile(source: &SourceUnit, options: &CompileOptions) -> Result<CompiledUnit, CompileError> {
    let mut interner = Interner::new();
    let text = source.effective_text(options);
    let ast = parse(text, options.kind, &mut interner).map_err(|errors| CompileError::Parse {
        filename: Arc::clone(&source.path),
        errors,
    })?;
    let scopes = bind(&ast, &mut interner).map_err(|errors| CompileError::Bind {
        filename: Arc::clone(&source.path),
        errors,
    })?;
    let image = CodeImage {
        path: Arc::clone(&source.path),
        kind: options.kind,
        optimize: options.optimize,
        mode: options.effective_mode(),
        ast,
        scopes,
        interner,
    };
    finish(image, options)
}

/// Compiles source text held in memory, as `exec` and `eval` do.
pub fn compile_text(text: &str, filename: Arc<str>, options: &CompileOptions) -> Result<CompiledUnit, CompileError> {
    compile(&SourceUnit::new(filename, text), options)
}

/// Lowers a previously serialized unit. Runtime-only options (tiering, inline caches) come
/// from `overrides`; the rest are the ones the image was compiled with.
pub fn load_image(bytes: &[u8], overrides: Option<&CompileOptions>) -> Result<CompiledUnit, CompileError> {
    let image = CodeImage::from_bytes(bytes)?;
    let mut options = image.options();
    if let Some(overrides) = overrides {
        options.tiering = overrides.tiering;
        options.inline_caches = overrides.inline_caches;
    }
    finish(image, &options)
}

fn finish(image: CodeImage, options: &CompileOptions) -> Result<CompiledUnit, CompileError> {
    let lowered = lower::lower(
        &image.ast,
        &image.scopes,
        &image.interner,
        options,
        Arc::clone(&image.path),
    )
    .map_err(|errors| CompileError::Bind {
        filename: Arc::clone(&image.path),
        errors,
    })?;
    Ok(CompiledUnit {
        code: lowered.code,
        info: lowered.info,
        sites: lowered.sites.into(),
        image: Arc::new(image),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn module(text: &str) -> Result<CompiledUnit, CompileError> {
        compile_text(text, Arc::from("m.py"), &CompileOptions::default())
    }

    #[test]
    fn syntax_errors_become_syntax_error_exceptions() {
        let err = module("x = = 1\n").unwrap_err();
        assert_eq!(err.exc_type(), ExcType::SyntaxError);
        assert_eq!(err.line(), Some(1));
        let exc = err.to_run_error();
        assert!(exc.matches(ExcType::SyntaxError));
        assert!(exc.message().ends_with("(m.py, line 1)"), "{}", exc.message());
    }

    #[test]
    fn indentation_errors_keep_their_subtype() {
        let err = module("if x:\npass\n").unwrap_err();
        assert_eq!(err.exc_type(), ExcType::IndentationError);
    }

    #[test]
    fn binding_errors_are_reported_before_running() {
        let err = module("def f():\n    x = 1\n    global x\n").unwrap_err();
        assert!(matches!(err, CompileError::Bind { .. }));
        assert_eq!(err.exc_type(), ExcType::SyntaxError);
        assert!(err.to_string().starts_with("m.py: "), "{err}");
    }

    #[test]
    fn images_relower_to_an_equivalent_unit() {
        let unit = module("import sys\ndef f(a):\n    return a.b + len(a)\n").unwrap();
        let restored = load_image(&unit.to_image().unwrap(), None).unwrap();
        assert_eq!(restored.global_names(), unit.global_names());
        assert_eq!(restored.mode(), CompilationMode::Optimized);
        assert_eq!(restored.sites().len(), unit.sites().len());
        assert_eq!(restored.filename(), "m.py");
    }

    #[test]
    fn exec_units_default_to_lookup_mode() {
        let unit = compile_text("y = 2", Arc::from("<string>"), &CompileOptions::exec()).unwrap();
        assert_eq!(unit.mode(), CompilationMode::Lookup);
        assert_eq!(unit.kind(), CodeKind::Exec);
    }
}
