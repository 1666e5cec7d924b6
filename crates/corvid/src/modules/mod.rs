//! Modules the runtime provides itself.
//!
//! Only `sys` and `builtins` are built in. Everything else is found by the host's
//! [`Importer`](crate::import::Importer).

pub(crate) mod sys;

use std::sync::Arc;

use strum::{EnumString, IntoStaticStr};

use crate::{
    exception_private::RunResult,
    interp::ExecCtx,
    modes::Namespace,
    types::Module,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, IntoStaticStr)]
pub(crate) enum BuiltinModule {
    #[strum(serialize = "sys")]
    Sys,
    #[strum(serialize = "builtins")]
    Builtins,
}

impl BuiltinModule {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }

    pub(crate) fn create(self, ctx: &mut ExecCtx) -> RunResult<Arc<Module>> {
        match self {
            Self::Sys => sys::create(ctx),
            Self::Builtins => Ok(Arc::new(Module::new(
                Arc::from("builtins"),
                Namespace::Table(Arc::clone(ctx.builtins())),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sys_and_builtins_are_built_in() {
        assert_eq!(BuiltinModule::from_name("sys"), Some(BuiltinModule::Sys));
        assert_eq!(BuiltinModule::from_name("builtins"), Some(BuiltinModule::Builtins));
        assert_eq!(BuiltinModule::from_name("os"), None);
    }
}
