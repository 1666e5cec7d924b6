//! Builtins that read or run code against the calling frame.
//!
//! Call sites recognise these by [`FrameIntrinsic`] and route them here with the frame in
//! hand. Reached any other way (through a variable, `map`, a bound method) they have no frame
//! to look at and raise instead.

use std::sync::Arc;

use super::{ExecCtx, Frame, run_code};
use crate::{
    compile::compile_text,
    exception_private::{ExcType, RunError, RunResult},
    modes::{Globals, Namespace},
    ops::{self, attr::attr_names},
    source::CompileOptions,
    types::{BodyKind, CallArgs, FrameIntrinsic, PyDict},
    value::Value,
};

pub(crate) fn call(ctx: &mut ExecCtx, frame: &mut Frame, intrinsic: FrameIntrinsic, mut args: CallArgs) -> RunResult<Value> {
    match intrinsic {
        FrameIntrinsic::Globals => {
            args.check("globals", 0, 0)?;
            Ok(Value::Dict(frame.globals.namespace().to_dict()))
        }
        FrameIntrinsic::Locals => {
            args.check("locals", 0, 0)?;
            Ok(Value::Dict(locals_dict(frame)))
        }
        FrameIntrinsic::Vars => {
            args.check("vars", 0, 1)?;
            match args.get(0) {
                None => Ok(Value::Dict(locals_dict(frame))),
                Some(object) => {
                    let object = object.clone();
                    ops::attr::get_attr_opt(ctx, &object, "__dict__")?
                        .ok_or_else(|| RunError::type_error("vars() argument must have __dict__ attribute"))
                }
            }
        }
        FrameIntrinsic::Dir => {
            args.check("dir", 0, 1)?;
            let mut names: Vec<Arc<str>> = match args.get(0) {
                None => locals_dict(frame)
                    .keys()
                    .into_iter()
                    .filter_map(|key| match key {
                        Value::Str(name) => Some(name),
                        _ => None,
                    })
                    .collect(),
                Some(object) => attr_names(object),
            };
            names.sort();
            names.dedup();
            Ok(Value::list(names.into_iter().map(Value::Str).collect()))
        }
        FrameIntrinsic::Exec => {
            let (source, globals, locals) = code_args(&mut args, "exec")?;
            run_source(ctx, frame, &source, CompileOptions::exec(), globals, locals)?;
            Ok(Value::None)
        }
        FrameIntrinsic::Eval => {
            let (source, globals, locals) = code_args(&mut args, "eval")?;
            run_source(ctx, frame, source.trim_start(), CompileOptions::eval(), globals, locals)
        }
    }
}

/// The error a frame intrinsic raises when it is called without a frame.
pub(crate) fn detached(name: &str) -> RunError {
    RunError::new(
        ExcType::RuntimeError,
        format!("{name}() must be called directly, not through an alias"),
    )
}

/// The frame's local names as a dict.
///
/// Module frames answer with their globals and class bodies with their namespace; function
/// frames get a snapshot of their slots and cells that later assignments do not update.
pub(crate) fn locals_dict(frame: &Frame) -> Arc<PyDict> {
    if let Some(locals) = &frame.locals {
        return locals.to_dict();
    }
    if frame.code.kind == BodyKind::Module {
        return frame.globals.namespace().to_dict();
    }
    let dict = PyDict::new();
    for (name, value) in frame.code.local_names.iter().zip(&frame.slots) {
        if let Some(value) = value {
            dict.set_str(name, value.clone());
        }
    }
    for (name, cell) in frame.code.cell_names.iter().chain(&frame.code.free_names).zip(&frame.cells) {
        if let Some(value) = cell.get() {
            dict.set_str(name, value);
        }
    }
    Arc::new(dict)
}

type CodeArgs = (Arc<str>, Option<Arc<PyDict>>, Option<Arc<PyDict>>);

fn code_args(args: &mut CallArgs, name: &str) -> RunResult<CodeArgs> {
    let globals = args.take_keyword("globals");
    let locals = args.take_keyword("locals");
    args.check(name, 1, 3)?;
    let source = match args.get(0) {
        Some(Value::Str(source)) => Arc::clone(source),
        Some(other) => {
            return Err(RunError::type_error(format!(
                "{name}() arg 1 must be a string, not {}",
                other.type_name()
            )));
        }
        None => return Err(RunError::type_error(format!("{name}() missing required argument 'source'"))),
    };
    let globals = namespace_arg(args.get(1).cloned().or(globals), name, "globals")?;
    let locals = namespace_arg(args.get(2).cloned().or(locals), name, "locals")?;
    Ok((source, globals, locals))
}

fn namespace_arg(value: Option<Value>, func: &str, which: &str) -> RunResult<Option<Arc<PyDict>>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(Value::Dict(dict)) => Ok(Some(dict)),
        Some(other) => Err(RunError::type_error(format!(
            "{func}() {which} must be a dict, not {}",
            other.type_name()
        ))),
    }
}

fn run_source(
    ctx: &mut ExecCtx,
    frame: &Frame,
    source: &str,
    options: CompileOptions,
    globals: Option<Arc<PyDict>>,
    locals: Option<Arc<PyDict>>,
) -> RunResult<Value> {
    let unit = compile_text(source, Arc::from("<string>"), &options).map_err(|err| err.to_run_error())?;
    let explicit_globals = globals.is_some();
    let namespace = match globals {
        Some(dict) => Namespace::Dict(dict),
        None => frame.globals.namespace(),
    };
    let locals = match locals {
        Some(dict) => Some(Namespace::Dict(dict)),
        None if explicit_globals => None,
        None => match &frame.locals {
            Some(locals) => Some(locals.clone()),
            None if frame.code.kind == BodyKind::Module => None,
            None => Some(Namespace::Dict(locals_dict(frame))),
        },
    };
    let globals = Globals::for_unit(unit.info.mode, &namespace, &unit.info.global_names)?;
    let mut body = Frame::for_module(Arc::clone(&unit.code), globals, locals);
    run_code(ctx, &mut body)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn detached_intrinsics_explain_themselves() {
        let err = detached("locals");
        assert!(err.matches(ExcType::RuntimeError));
        assert_eq!(err.message(), "locals() must be called directly, not through an alias");
    }

    #[test]
    fn namespace_arguments_must_be_dicts() {
        assert!(namespace_arg(None, "exec", "globals").unwrap().is_none());
        assert!(namespace_arg(Some(Value::None), "exec", "globals").unwrap().is_none());
        let err = namespace_arg(Some(Value::Int(1)), "exec", "globals").unwrap_err();
        assert_eq!(err.message(), "exec() globals must be a dict, not int");
    }
}
