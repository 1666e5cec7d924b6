//! The `sys` module.
//!
//! Everything here is a read-only view of the runtime's [`HostConfig`](crate::HostConfig)
//! except `sys.modules`, which is the runtime's live module registry.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    interp::ExecCtx,
    modes::Namespace,
    types::{BuiltinFunction, CallArgs, Instance, Module, PyType},
    value::Value,
};

const VERSION: &str = "3.12.0 (corvid)";

pub(crate) fn create(ctx: &mut ExecCtx) -> RunResult<Arc<Module>> {
    let config = ctx.config();
    let namespace = Namespace::new_table();
    let argv = config.argv.iter().map(|arg| Value::Str(Arc::clone(arg))).collect();
    let path = config.search_paths.iter().map(|dir| Value::Str(Arc::clone(dir))).collect();
    namespace.set("argv", Value::list(argv));
    namespace.set("path", Value::list(path));
    namespace.set("version", Value::str(VERSION));
    namespace.set("version_info", Value::tuple(vec![Value::Int(3), Value::Int(12), Value::Int(0)]));
    namespace.set("platform", Value::str("corvid"));
    namespace.set("maxsize", Value::Int(i64::MAX));
    namespace.set("flags", flags(config.optimize, config.isolated)?);
    namespace.set("modules", Value::Dict(Arc::clone(&ctx.runtime().modules)));
    namespace.set("exit", BuiltinFunction::value("exit", sys_exit));
    namespace.set("getrecursionlimit", BuiltinFunction::value("getrecursionlimit", sys_getrecursionlimit));
    Ok(Arc::new(Module::new(Arc::from("sys"), namespace)))
}

/// `sys.flags`: an object whose attributes mirror the command-line flags.
fn flags(optimize: u8, isolated: bool) -> RunResult<Value> {
    let class = PyType::new_class(
        Arc::from("flags"),
        Arc::from("flags"),
        Arc::from("sys"),
        Vec::new(),
        IndexMap::new(),
    )?;
    let flags = Instance::new(class);
    flags.set_attr(Arc::from("optimize"), Value::Int(i64::from(optimize)));
    flags.set_attr(Arc::from("isolated"), Value::Int(i64::from(isolated)));
    Ok(Value::Instance(flags))
}

/// `sys.exit([status])` raises `SystemExit`; the host turns it into the process status.
fn sys_exit(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("exit", 0, 1)?;
    let args = args.positional.into_iter().filter(|arg| !arg.is_none()).collect();
    Err(RunError::with_args(ExcType::SystemExit, args))
}

fn sys_getrecursionlimit(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("getrecursionlimit", 0, 0)?;
    Ok(Value::from(ctx.config().recursion_limit))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::HostConfig, tracer::NoopTracer};

    #[test]
    fn reflects_host_config() {
        let config = HostConfig::builder()
            .argv(["prog.py", "-v"])
            .search_path("lib")
            .recursion_limit(250)
            .optimize(1)
            .build();
        let mut ctx = ExecCtx::for_tests(config, Arc::new(NoopTracer));
        let sys = create(&mut ctx).unwrap();
        let Some(Value::List(argv)) = sys.namespace.get("argv") else {
            panic!("argv is not a list");
        };
        assert_eq!(argv.len(), 2);
        let Some(Value::Instance(flags)) = sys.namespace.get("flags") else {
            panic!("flags is not an object");
        };
        assert_eq!(flags.get_attr("optimize").and_then(|v| v.as_i64()), Some(1));
        let limit = sys_getrecursionlimit(&mut ctx, CallArgs::new()).unwrap();
        assert_eq!(limit.as_i64(), Some(250));
    }

    #[test]
    fn exit_raises_system_exit() {
        let mut ctx = ExecCtx::for_tests(HostConfig::default(), Arc::new(NoopTracer));
        let err = sys_exit(&mut ctx, CallArgs::positional([Value::Int(4)])).unwrap_err();
        assert!(err.matches(ExcType::SystemExit));
        let err = sys_exit(&mut ctx, CallArgs::positional([Value::None])).unwrap_err();
        assert!(err.state().args.is_empty());
    }
}
