use std::{
    env, fs,
    io::{self, Write as _},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    thread,
};

use clap::{ArgAction, Parser};
use corvid::{
    CompileError, CompileOptions, ExitStatus, HostConfig, Runtime, Session, SourceUnit, StderrTracer, WarningFilter,
};

mod importer;

use importer::{FsImporter, display};

/// The tree interpreter recurses once per nested call, so the main thread's default stack
/// is too small for the default recursion limit.
const STACK_SIZE: usize = 256 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "corvid", version, about = "Run a program with the corvid runtime")]
struct Opt {
    /// Program passed in as a string
    #[arg(short = 'c', value_name = "cmd", conflicts_with = "module")]
    command: Option<String>,

    /// Run library module as a script
    #[arg(short = 'm', value_name = "mod")]
    module: Option<String>,

    /// Trace calls, call-site transitions and tier-ups on stderr
    #[arg(short = 'd', action = ArgAction::SetTrue)]
    debug: bool,

    /// Remove assert statements and docstrings; may be given twice
    #[arg(short = 'O', action = ArgAction::Count)]
    optimize: u8,

    /// Isolate from the environment: ignore CORVIDPATH
    #[arg(short = 'I', action = ArgAction::SetTrue)]
    isolated: bool,

    /// Warning control: default, ignore, error or always
    #[arg(short = 'W', value_name = "arg")]
    warnings: Vec<String>,

    /// Program file followed by the arguments passed in sys.argv[1:]
    #[arg(value_name = "file", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// What to run.
enum Target {
    Script(PathBuf),
    Command(String),
    Module(String),
}

fn main() -> ExitCode {
    let opt = Opt::parse();
    let worker = thread::Builder::new()
        .name("corvid-main".to_owned())
        .stack_size(STACK_SIZE)
        .spawn(move || run(opt));
    let status = match worker.map(thread::JoinHandle::join) {
        Ok(Ok(status)) => status,
        Ok(Err(_)) => ExitStatus::FAILURE,
        Err(err) => {
            eprintln!("corvid: cannot start interpreter thread: {err}");
            ExitStatus::FAILURE
        }
    };
    ExitCode::from(u8::try_from(status.code().rem_euclid(256)).unwrap_or(1))
}

fn run(opt: Opt) -> ExitStatus {
    let mut args = opt.args.into_iter();
    let target = match (opt.command, opt.module) {
        (Some(command), _) => Target::Command(command),
        (None, Some(module)) => Target::Module(module),
        (None, None) => match args.next() {
            Some(script) => Target::Script(PathBuf::from(script)),
            None => {
                eprintln!("corvid: no program given (interactive mode is not supported); try 'corvid --help'");
                return ExitStatus(2);
            }
        },
    };

    let mut config = HostConfig::builder().optimize(opt.optimize).isolated(opt.isolated);
    for action in &opt.warnings {
        match WarningFilter::parse(action.split(':').next().unwrap_or_default()) {
            Some(filter) => config = config.warning(filter),
            None => eprintln!("Invalid -W option ignored: invalid action: '{action}'"),
        }
    }
    let roots = search_roots(&target, opt.isolated);
    for root in &roots {
        config = config.search_path(display(root));
    }
    let argv0 = match &target {
        Target::Script(path) => display(path),
        Target::Command(_) => "-c".to_owned(),
        Target::Module(name) => name.clone(),
    };
    let config = config.argv(std::iter::once(argv0).chain(args)).build();

    let mut runtime = Runtime::new(config).with_importer(FsImporter::new(roots));
    if opt.debug {
        runtime = runtime.with_tracer(Arc::new(StderrTracer::new()));
    }
    let mut session = runtime.session();
    match target {
        Target::Module(name) => session.run_module_as_main(&name, &mut io::stderr().lock()),
        Target::Script(path) => match fs::read_to_string(&path) {
            Ok(text) => run_source(&runtime, &mut session, SourceUnit::new(display(&path), text)),
            Err(err) => {
                eprintln!("corvid: can't open file '{}': {err}", display(&path));
                ExitStatus(2)
            }
        },
        Target::Command(text) => run_source(&runtime, &mut session, SourceUnit::new("<string>", text)),
    }
}

fn run_source(runtime: &Runtime, session: &mut Session, source: SourceUnit) -> ExitStatus {
    match runtime.compile(&source, &CompileOptions::default()) {
        Ok(unit) => session.run_main(&unit),
        Err(err) => {
            report_compile_error(&source, &err);
            ExitStatus::FAILURE
        }
    }
}

/// Prints a compile failure the way an unhandled `SyntaxError` looks.
fn report_compile_error(source: &SourceUnit, err: &CompileError) {
    let mut stderr = io::stderr().lock();
    if let Some(line) = err.line() {
        let _ = writeln!(stderr, "  File \"{}\", line {line}", source.path);
        if let Some(text) = source.line_text(line) {
            let _ = writeln!(stderr, "    {}", text.trim());
        }
    }
    let _ = writeln!(stderr, "{}: {}", err.exc_type(), err.message());
}

/// The script's directory (or the working directory for `-c` and `-m`), then CORVIDPATH
/// unless isolated.
fn search_roots(target: &Target, isolated: bool) -> Vec<PathBuf> {
    let first = match target {
        Target::Script(path) => path.parent().map(PathBuf::from).unwrap_or_default(),
        Target::Command(_) | Target::Module(_) => PathBuf::new(),
    };
    let mut roots = vec![if first.as_os_str().is_empty() { PathBuf::from(".") } else { first }];
    if !isolated && let Some(extra) = env::var_os("CORVIDPATH") {
        roots.extend(env::split_paths(&extra));
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_arguments_follow_the_file() {
        let opt = Opt::parse_from(["corvid", "-O", "-O", "prog.py", "-x", "y"]);
        assert_eq!(opt.optimize, 2);
        assert_eq!(opt.args, vec!["prog.py", "-x", "y"]);
    }

    #[test]
    fn commands_keep_positional_arguments_for_argv() {
        let opt = Opt::parse_from(["corvid", "-c", "print(1)", "a"]);
        assert_eq!(opt.command.as_deref(), Some("print(1)"));
        assert_eq!(opt.args, vec!["a"]);
    }

    #[test]
    fn bare_scripts_search_the_working_directory() {
        let roots = search_roots(&Target::Script(PathBuf::from("prog.py")), true);
        assert_eq!(roots, vec![PathBuf::from(".")]);
        let roots = search_roots(&Target::Script(PathBuf::from("src/prog.py")), true);
        assert_eq!(roots, vec![PathBuf::from("src")]);
    }
}
