//! Runs every program under `test_cases/` and checks what it printed.
//!
//! Expected output is written inline as `# > ` comments, one per printed line, in the order
//! the lines are printed. A program expected to die with an unhandled exception ends with a
//! `# raises: Type: message` comment. Each program runs under every combination of storage
//! mode and execution tier, with and without inline caches, and must behave identically.

use std::{error::Error, fs, path::Path};

use corvid::{
    CollectStringPrint, CompilationMode, CompileOptions, HostConfig, MemoryImporter, Runtime, SourceUnit,
    TieringPolicy,
};
use pretty_assertions::assert_eq;

struct Expectation {
    output: String,
    raises: Option<String>,
}

impl Expectation {
    fn parse(text: &str) -> Self {
        let mut output = String::new();
        let mut raises = None;
        for line in text.lines().map(str::trim_start) {
            if let Some(expected) = line.strip_prefix("# >") {
                output.push_str(expected.strip_prefix(' ').unwrap_or(expected));
                output.push('\n');
            } else if let Some(summary) = line.strip_prefix("# raises:") {
                raises = Some(summary.trim().to_owned());
            }
        }
        Self { output, raises }
    }
}

/// Modules the programs can import.
fn library() -> MemoryImporter {
    MemoryImporter::new()
        .with_module("helpers", "GREETING = 'hello'\n\ndef shout(text):\n    return text.upper() + '!'\n")
        .with_package("shapes", "from .square import Square\n__all__ = ['Square', 'unit']\nunit = 1\n")
        .with_module(
            "shapes.square",
            "class Square:\n    def __init__(self, side):\n        self.side = side\n\n    def area(self):\n        return self.side * self.side\n",
        )
}

fn variants() -> Vec<(&'static str, CompileOptions)> {
    let base = CompileOptions::default();
    vec![
        ("lookup", base.clone().with_mode(CompilationMode::Lookup)),
        ("optimized", base.clone().with_mode(CompilationMode::Optimized)),
        (
            "optimized/compiled",
            base.clone()
                .with_mode(CompilationMode::Optimized)
                .with_tiering(TieringPolicy::AlwaysCompile),
        ),
        (
            "optimized/uncached",
            base.with_mode(CompilationMode::Optimized).without_inline_caches(),
        ),
    ]
}

fn run_case(path: &Path) -> Result<(), Box<dyn Error>> {
    let text = fs::read_to_string(path)?;
    let expected = Expectation::parse(&text);
    let filename = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    let source = SourceUnit::new(filename, text);

    for (label, options) in variants() {
        let output = CollectStringPrint::new();
        let runtime = Runtime::new(HostConfig::default())
            .with_importer(library())
            .with_output(output.clone());
        let unit = runtime.compile(&source, &options)?;
        let outcome = runtime.session().run_module(&unit, "__main__");
        assert_eq!(output.output(), expected.output, "{label}: printed output");
        match (outcome, &expected.raises) {
            (Ok(_), None) => {}
            (Err(exc), Some(summary)) => assert_eq!(&exc.summary(), summary, "{label}: exception"),
            (Ok(_), Some(summary)) => return Err(format!("{label}: expected `{summary}`, program finished").into()),
            (Err(exc), None) => return Err(format!("{label}: unexpected exception\n{}", exc.traceback_text()).into()),
        }
    }
    Ok(())
}

datatest_stable::harness!(run_case, "test_cases", r"^.*\.py$");
