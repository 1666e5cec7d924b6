#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "narrowing casts are range-checked first")]
#![expect(clippy::cast_possible_wrap, reason = "int and float conversions follow the language's wrapping rules")]
#![expect(clippy::cast_sign_loss, reason = "sign is checked before every unsigned cast")]
#![expect(clippy::needless_pass_by_value, reason = "builtins share one by-value signature")]
#![expect(clippy::float_cmp, reason = "language semantics require exact float comparison")]

mod builtins;
mod compile;
mod config;
mod delegate;
mod exception_private;
mod exception_public;
mod expressions;
mod image;
mod import;
mod intern;
mod interp;
mod io;
mod lexer;
mod lower;
mod modes;
mod modules;
mod ops;
mod parse;
mod prepare;
mod run;
pub mod sites;
mod source;
pub mod tracer;
mod types;
mod value;

pub use crate::{
    compile::{CompileError, CompiledUnit},
    config::{
        DEFAULT_POLYMORPHIC_LIMIT, DEFAULT_RECURSION_LIMIT, DEFAULT_TIER_THRESHOLD, HostConfig, HostConfigBuilder,
        WarningFilter,
    },
    exception_private::ExcType,
    exception_public::{ExitStatus, PyException, StackFrame, display_value},
    image::ImageError,
    import::{ImportFailure, Imported, Importer, MemoryImporter},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    modes::{CompilationMode, GlobalTable, Namespace},
    parse::ParseError,
    prepare::BindError,
    run::{InterruptHandle, Runtime, Session},
    sites::{SiteOp, SiteState, SiteStats, SiteView},
    source::{CodeKind, CodeLoc, CodeRange, CompileOptions, SourceUnit, TieringPolicy},
    tracer::{GeneratorEvent, NoopTracer, RecordingTracer, RuntimeTracer, SiteEvent, StderrTracer, TraceEvent},
    types::{Module, PyDict, PyList},
    value::Value,
};
