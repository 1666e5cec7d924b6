//! Guards and the concrete sites for each kind of dynamic operation.
//!
//! Every site entry point has the same shape: compute the guard inputs from the operands,
//! probe, run the cached plan on a hit, otherwise build the plan with the same `ops::plan_*`
//! function the uncached path uses and install it. A plan is always computed *after* the
//! guard captured the class versions, so a class mutated while planning leaves a rule that
//! can never match rather than a stale one that does.

use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use super::{CallSite, Probe, Rule};
use crate::{
    exception_private::RunResult,
    expressions::{CmpOp, Operator},
    interp::ExecCtx,
    ops::{
        arith::{BinaryPlan, InplacePlan, plan_binary, plan_inplace},
        attr::{AttrPlan, plan_get_attr},
        call::{ArgShape, InvokePlan, call, plan_invoke},
        compare::{ComparePlan, plan_compare},
    },
    types::{CallArgs, FunctionCode, PyType, type_of},
    value::Value,
};

/// Exact class identity plus the version it had when the rule was bound.
#[derive(Debug, Clone)]
pub struct ClassGuard {
    class: Weak<PyType>,
    version: u64,
}

impl ClassGuard {
    #[must_use]
    pub fn new(class: &Arc<PyType>) -> Self {
        Self {
            class: Arc::downgrade(class),
            version: class.version(),
        }
    }

    /// A dropped class never matches, so a new class allocated at the same address cannot
    /// alias an old rule.
    #[must_use]
    pub fn matches(&self, class: &Arc<PyType>) -> bool {
        std::ptr::eq(self.class.as_ptr(), Arc::as_ptr(class))
            && self.class.strong_count() > 0
            && class.version() == self.version
    }
}

#[derive(Debug, Clone)]
pub struct AttrGuard {
    class: ClassGuard,
    /// The receiver is the class object itself rather than an instance of it.
    on_type: bool,
}

#[derive(Debug, Clone)]
pub struct PairGuard {
    left: ClassGuard,
    right: ClassGuard,
}

impl PairGuard {
    fn new(left: &Arc<PyType>, right: &Arc<PyType>) -> Self {
        Self {
            left: ClassGuard::new(left),
            right: ClassGuard::new(right),
        }
    }

    fn matches(&self, left: &Arc<PyType>, right: &Arc<PyType>) -> bool {
        self.left.matches(left) && self.right.matches(right)
    }
}

#[derive(Debug, Clone)]
pub enum InvokeGuard {
    /// A Python function (or a bound method over one) with a given code, argument shape and
    /// default layout.
    Code {
        code: Weak<FunctionCode>,
        bound: bool,
        shape: ArgShape,
        defaults: usize,
        kw_defaults: SmallVec<[Arc<str>; 2]>,
    },
    Builtin,
    Class,
    /// Anything the other guards do not describe.
    Other,
}

impl InvokeGuard {
    fn for_callee(callee: &Value, shape: &ArgShape) -> Self {
        let function = match callee {
            Value::Function(func) => Some((func, false)),
            Value::BoundMethod(method) => match &method.func {
                Value::Function(func) => Some((func, true)),
                _ => None,
            },
            _ => None,
        };
        if let Some((func, bound)) = function {
            return Self::Code {
                code: Arc::downgrade(&func.code),
                bound,
                shape: shape.clone(),
                defaults: func.defaults.len(),
                kw_defaults: func.kw_defaults.iter().map(|(name, _)| Arc::clone(name)).collect(),
            };
        }
        match callee {
            Value::Builtin(builtin) if builtin.intrinsic.is_none() => Self::Builtin,
            Value::Type(_) => Self::Class,
            _ => Self::Other,
        }
    }

    fn matches(&self, callee: &Value, shape: &ArgShape) -> bool {
        match self {
            Self::Code {
                code,
                bound,
                shape: expected,
                defaults,
                kw_defaults,
            } => {
                let func = match (callee, bound) {
                    (Value::Function(func), false) => func,
                    (Value::BoundMethod(method), true) => match &method.func {
                        Value::Function(func) => func,
                        _ => return false,
                    },
                    _ => return false,
                };
                std::ptr::eq(code.as_ptr(), Arc::as_ptr(&func.code))
                    && code.strong_count() > 0
                    && expected == shape
                    && func.defaults.len() == *defaults
                    && func.kw_defaults.len() == kw_defaults.len()
                    && func.kw_defaults.iter().zip(kw_defaults).all(|((a, _), b)| a == b)
            }
            Self::Builtin => matches!(callee, Value::Builtin(builtin) if builtin.intrinsic.is_none()),
            Self::Class => matches!(callee, Value::Type(_)),
            Self::Other => matches!(Self::for_callee(callee, shape), Self::Other),
        }
    }
}

pub type AttrSite = CallSite<AttrGuard, AttrPlan>;
pub type BinarySite = CallSite<PairGuard, BinaryPlan>;
pub type InplaceSite = CallSite<PairGuard, InplacePlan>;
pub type CompareSite = CallSite<PairGuard, ComparePlan>;
pub type InvokeSite = CallSite<InvokeGuard, InvokePlan>;

fn receiver_class(receiver: &Value) -> (Arc<PyType>, bool) {
    match receiver {
        Value::Type(ty) => (Arc::clone(ty), true),
        other => (type_of(other), false),
    }
}

impl AttrSite {
    /// `receiver.name` through the cache.
    pub fn get(&self, ctx: &mut ExecCtx, receiver: &Value, name: &str) -> RunResult<Value> {
        let (class, on_type) = receiver_class(receiver);
        match self.probe(|guard| guard.on_type == on_type && guard.class.matches(&class)) {
            Probe::Hit(rule) => rule.plan.run(ctx, receiver, name),
            Probe::Generic => plan_get_attr(receiver, name).run(ctx, receiver, name),
            Probe::Miss => {
                let guard = AttrGuard {
                    class: ClassGuard::new(&class),
                    on_type,
                };
                let plan = plan_get_attr(receiver, name);
                self.install(ctx, Rule { guard, plan: plan.clone() });
                plan.run(ctx, receiver, name)
            }
        }
    }
}

impl BinarySite {
    /// `left op right` through the cache.
    pub fn run(&self, ctx: &mut ExecCtx, op: Operator, left: &Value, right: &Value) -> RunResult<Value> {
        let (lt, rt) = (type_of(left), type_of(right));
        match self.probe(|guard| guard.matches(&lt, &rt)) {
            Probe::Hit(rule) => rule.plan.run(ctx, op, left, right),
            Probe::Generic => plan_binary(op, &lt, &rt).run(ctx, op, left, right),
            Probe::Miss => {
                let guard = PairGuard::new(&lt, &rt);
                let plan = plan_binary(op, &lt, &rt);
                self.install(ctx, Rule { guard, plan: plan.clone() });
                plan.run(ctx, op, left, right)
            }
        }
    }
}

impl InplaceSite {
    /// `left op= right` through the cache; returns the value to store back.
    pub fn run(&self, ctx: &mut ExecCtx, op: Operator, left: &Value, right: &Value) -> RunResult<Value> {
        let (lt, rt) = (type_of(left), type_of(right));
        match self.probe(|guard| guard.matches(&lt, &rt)) {
            Probe::Hit(rule) => rule.plan.run(ctx, op, left, right),
            Probe::Generic => plan_inplace(op, &lt, &rt).run(ctx, op, left, right),
            Probe::Miss => {
                let guard = PairGuard::new(&lt, &rt);
                let plan = plan_inplace(op, &lt, &rt);
                self.install(ctx, Rule { guard, plan: plan.clone() });
                plan.run(ctx, op, left, right)
            }
        }
    }
}

impl CompareSite {
    /// A rich comparison through the cache. Identity and membership tests have no site.
    pub fn run(&self, ctx: &mut ExecCtx, op: CmpOp, left: &Value, right: &Value) -> RunResult<Value> {
        let (lt, rt) = (type_of(left), type_of(right));
        match self.probe(|guard| guard.matches(&lt, &rt)) {
            Probe::Hit(rule) => rule.plan.run(ctx, op, left, right),
            Probe::Generic => plan_compare(op, &lt, &rt).run(ctx, op, left, right),
            Probe::Miss => {
                let guard = PairGuard::new(&lt, &rt);
                let plan = plan_compare(op, &lt, &rt);
                self.install(ctx, Rule { guard, plan: plan.clone() });
                plan.run(ctx, op, left, right)
            }
        }
    }
}

impl InvokeSite {
    /// `callee(*args)` through the cache.
    ///
    /// Argument-binding errors are raised while planning, so a call that fails to bind never
    /// installs a rule.
    pub fn call(&self, ctx: &mut ExecCtx, callee: &Value, args: CallArgs) -> RunResult<Value> {
        let shape = ArgShape::of(&args);
        match self.probe(|guard| guard.matches(callee, &shape)) {
            Probe::Hit(rule) => rule.plan.run(ctx, callee, args),
            Probe::Generic => call(ctx, callee, args),
            Probe::Miss => {
                let plan = plan_invoke(callee, &shape)?;
                let guard = InvokeGuard::for_callee(callee, &shape);
                self.install(ctx, Rule { guard, plan: plan.clone() });
                plan.run(ctx, callee, args)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    fn class(name: &str) -> Arc<PyType> {
        PyType::new_class(name.into(), name.into(), "test".into(), vec![], IndexMap::new()).unwrap()
    }

    #[test]
    fn class_guard_tracks_version() {
        let ty = class("A");
        let guard = ClassGuard::new(&ty);
        assert!(guard.matches(&ty));
        ty.set_attr("x".into(), Value::Int(1)).unwrap();
        assert!(!guard.matches(&ty));
        assert!(ClassGuard::new(&ty).matches(&ty));
    }

    #[test]
    fn class_guard_is_exact() {
        let a = class("A");
        let b = PyType::new_class("B".into(), "B".into(), "test".into(), vec![Arc::clone(&a)], IndexMap::new()).unwrap();
        assert!(!ClassGuard::new(&a).matches(&b));
    }

    #[test]
    fn dropped_class_never_matches() {
        let ty = class("Gone");
        let guard = ClassGuard::new(&ty);
        drop(ty);
        let other = class("New");
        assert!(!guard.matches(&other));
    }

    #[test]
    fn invoke_guard_distinguishes_callee_kinds() {
        let shape = ArgShape {
            positional: 1,
            keywords: SmallVec::new(),
        };
        let ty = Value::Type(class("C"));
        let guard = InvokeGuard::for_callee(&ty, &shape);
        assert!(matches!(guard, InvokeGuard::Class));
        assert!(guard.matches(&Value::Type(class("D")), &shape));
        assert!(!guard.matches(&Value::Int(1), &shape));
        let other = InvokeGuard::for_callee(&Value::Int(1), &shape);
        assert!(other.matches(&Value::None, &shape));
        assert!(!other.matches(&ty, &shape));
    }
}
