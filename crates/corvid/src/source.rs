//! Source ingestion: the source-unit abstraction, compile options, and code positions.

use std::{fmt, sync::Arc};

use crate::modes::CompilationMode;

/// A position in source text. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

impl CodeLoc {
    #[must_use]
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A span of source text, used for diagnostics and traceback lines.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct CodeRange {
    pub start: CodeLoc,
    pub end: CodeLoc,
}

/// Custom Debug implementation to keep AST dumps readable.
impl fmt::Debug for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl CodeRange {
    #[must_use]
    pub const fn new(start: CodeLoc, end: CodeLoc) -> Self {
        Self { start, end }
    }

    /// Returns a range covering both `self` and `other`.
    #[must_use]
    pub fn to(self, other: Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.start.line
    }
}

/// The kind of top-level unit being compiled.
///
/// Module units are normally compiled in optimized mode; exec and eval units run against
/// a caller-supplied namespace and default to lookup mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum CodeKind {
    #[default]
    Module,
    Exec,
    /// A single expression whose value is the unit's result.
    Eval,
}

/// How often a code object runs on the tree interpreter before it is compiled to a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieringPolicy {
    /// Interpret until the code object has been entered this many times, then compile.
    Threshold(u32),
    AlwaysInterpret,
    AlwaysCompile,
}

/// Per-unit compilation options.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub kind: CodeKind,
    /// Strips docstrings and `assert` statements.
    pub optimize: bool,
    /// Skips a leading `#!` line.
    pub skip_shebang: bool,
    /// Storage strategy for globals. `None` picks the default for `kind`.
    pub mode: Option<CompilationMode>,
    /// Tiering override. `None` uses the runtime's configured threshold.
    pub tiering: Option<TieringPolicy>,
    /// When false every dynamic operation site takes the uncached path.
    pub inline_caches: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            kind: CodeKind::Module,
            optimize: false,
            skip_shebang: true,
            mode: None,
            tiering: None,
            inline_caches: true,
        }
    }
}

impl CompileOptions {
    #[must_use]
    pub fn exec() -> Self {
        Self {
            kind: CodeKind::Exec,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn eval() -> Self {
        Self {
            kind: CodeKind::Eval,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: CompilationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_tiering(mut self, tiering: TieringPolicy) -> Self {
        self.tiering = Some(tiering);
        self
    }

    #[must_use]
    pub fn without_inline_caches(mut self) -> Self {
        self.inline_caches = false;
        self
    }

    /// The storage mode this unit will be compiled with.
    #[must_use]
    pub fn effective_mode(&self) -> CompilationMode {
        self.mode.unwrap_or(match self.kind {
            CodeKind::Module => CompilationMode::Optimized,
            CodeKind::Exec | CodeKind::Eval => CompilationMode::Lookup,
        })
    }
}

/// A unit of source text handed to the compiler.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub path: Arc<str>,
    /// Encoding label as declared by the host. Text is always held as UTF-8.
    pub encoding: Arc<str>,
    pub text: Arc<str>,
}

impl SourceUnit {
    #[must_use]
    pub fn new(path: impl Into<Arc<str>>, text: impl Into<Arc<str>>) -> Self {
        Self {
            path: path.into(),
            encoding: Arc::from("utf-8"),
            text: text.into(),
        }
    }

    /// Returns the text to tokenize, honoring `skip_shebang`.
    ///
    /// A skipped shebang line is replaced by an empty line so line numbers stay accurate.
    #[must_use]
    pub fn effective_text(&self, options: &CompileOptions) -> &str {
        if options.skip_shebang && self.text.starts_with("#!") {
            match self.text.find('\n') {
                Some(idx) => &self.text[idx..],
                None => "",
            }
        } else {
            &self.text
        }
    }

    /// Returns the 1-based source line, used for traceback previews.
    #[must_use]
    pub fn line_text(&self, line: u32) -> Option<&str> {
        let index = usize::try_from(line).ok()?.checked_sub(1)?;
        self.text.lines().nth(index)
    }
}
