//! Calling: argument binding, method calls and object construction.
//!
//! Binding a call to a Python function is planned once per (code object, argument shape)
//! pair. The [`BindPlan`] records where every parameter slot gets its value from, so an
//! invoke site that has seen the shape before only moves values into slots.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    exception_private::{RunError, RunResult},
    interp::{self, ExecCtx},
    ops::attr::user_special,
    types::{CallArgs, Function, Instance, PyDict, PyType, TypeKind, type_of},
    value::Value,
};

/// Positional count and keyword names of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgShape {
    pub positional: usize,
    pub keywords: SmallVec<[Arc<str>; 2]>,
}

impl ArgShape {
    #[must_use]
    pub fn of(args: &CallArgs) -> Self {
        Self {
            positional: args.positional.len(),
            keywords: args.keywords.iter().map(|(name, _)| Arc::clone(name)).collect(),
        }
    }

    fn with_receiver(&self) -> Self {
        Self {
            positional: self.positional + 1,
            keywords: self.keywords.clone(),
        }
    }
}

/// Where a parameter slot takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Positional(usize),
    Keyword(usize),
    Default(usize),
    KwDefault(usize),
    /// Positional arguments from this index on, as a tuple.
    VarArgs(usize),
    /// Keywords not matched by name, as a dict.
    VarKw,
}

/// The slot layout for one argument shape against one code object.
#[derive(Debug, Clone)]
pub struct BindPlan {
    sources: Vec<Source>,
    /// Keyword indexes collected into `**kwargs`.
    extra_keywords: Vec<usize>,
}

impl BindPlan {
    /// Plans the binding, raising the same `TypeError`s a call would.
    pub fn new(func: &Function, shape: &ArgShape) -> RunResult<Self> {
        let code = &func.code;
        let params = &code.params;
        let name = &code.qualname;
        let mut sources: Vec<Option<Source>> = vec![None; params.total()];
        let mut used_keywords = vec![false; shape.keywords.len()];

        let bound_positional = shape.positional.min(params.positional);
        for (slot, source) in sources.iter_mut().enumerate().take(bound_positional) {
            *source = Some(Source::Positional(slot));
        }
        if shape.positional > params.positional {
            if let Some(slot) = params.vararg_slot() {
                sources[slot] = Some(Source::VarArgs(params.positional));
            } else {
                return Err(too_many_positional(name, params.positional, func.defaults.len(), shape));
            }
        } else if let Some(slot) = params.vararg_slot() {
            sources[slot] = Some(Source::VarArgs(shape.positional));
        }

        let mut posonly_as_keyword = Vec::new();
        for (index, keyword) in shape.keywords.iter().enumerate() {
            let target = params.names[..params.kwonly_start() + params.kwonly]
                .iter()
                .position(|param| param == keyword)
                .filter(|&slot| Some(slot) != params.vararg_slot());
            match target {
                Some(slot) if slot < params.posonly => {
                    if params.varkw {
                        continue;
                    }
                    posonly_as_keyword.push(Arc::clone(keyword));
                    used_keywords[index] = true;
                }
                Some(slot) => {
                    if sources[slot].is_some() {
                        return Err(RunError::type_error(format!(
                            "{name}() got multiple values for argument '{keyword}'"
                        )));
                    }
                    sources[slot] = Some(Source::Keyword(index));
                    used_keywords[index] = true;
                }
                None if params.varkw => {}
                None => {
                    return Err(RunError::type_error(format!(
                        "{name}() got an unexpected keyword argument '{keyword}'"
                    )));
                }
            }
        }
        if !posonly_as_keyword.is_empty() {
            let names: Vec<&str> = posonly_as_keyword.iter().map(|n| &**n).collect();
            return Err(RunError::type_error(format!(
                "{name}() got some positional-only arguments passed as keyword arguments: '{}'",
                names.join(", ")
            )));
        }

        let first_default = params.positional - func.defaults.len().min(params.positional);
        let mut missing = Vec::new();
        for slot in 0..params.positional {
            if sources[slot].is_none() {
                if slot >= first_default {
                    sources[slot] = Some(Source::Default(slot - first_default));
                } else {
                    missing.push(Arc::clone(&params.names[slot]));
                }
            }
        }
        if !missing.is_empty() {
            return Err(missing_arguments(name, "positional", &missing));
        }
        let kwonly_start = params.kwonly_start();
        for slot in kwonly_start..kwonly_start + params.kwonly {
            if sources[slot].is_none() {
                let param = &params.names[slot];
                match func.kw_defaults.iter().position(|(n, _)| n == param) {
                    Some(index) => sources[slot] = Some(Source::KwDefault(index)),
                    None => missing.push(Arc::clone(param)),
                }
            }
        }
        if !missing.is_empty() {
            return Err(missing_arguments(name, "keyword-only", &missing));
        }
        if let Some(slot) = params.varkw_slot() {
            sources[slot] = Some(Source::VarKw);
        }
        let extra_keywords = used_keywords
            .iter()
            .enumerate()
            .filter(|(_, used)| !**used)
            .map(|(index, _)| index)
            .collect();
        Ok(Self {
            sources: sources.into_iter().map(|s| s.unwrap_or(Source::VarKw)).collect(),
            extra_keywords,
        })
    }

    /// Moves the arguments into a fresh slot vector of `code.slot_count` entries.
    #[must_use]
    pub fn bind(&self, func: &Function, args: CallArgs) -> Vec<Option<Value>> {
        let CallArgs { positional, keywords } = args;
        let mut slots: Vec<Option<Value>> = vec![None; func.code.slot_count];
        for (slot, source) in self.sources.iter().enumerate() {
            slots[slot] = Some(match *source {
                Source::Positional(index) => positional[index].clone(),
                Source::Keyword(index) => keywords[index].1.clone(),
                Source::Default(index) => func.defaults[index].clone(),
                Source::KwDefault(index) => func.kw_defaults[index].1.clone(),
                Source::VarArgs(start) => Value::tuple(positional.get(start..).map(<[Value]>::to_vec).unwrap_or_default()),
                Source::VarKw => {
                    let dict = PyDict::new();
                    for &index in &self.extra_keywords {
                        let (key, value) = &keywords[index];
                        dict.set_str(key, value.clone());
                    }
                    Value::Dict(Arc::new(dict))
                }
            });
        }
        slots
    }
}

fn too_many_positional(name: &str, max: usize, defaults: usize, shape: &ArgShape) -> RunError {
    let min = max - defaults.min(max);
    let takes = if min == max {
        format!("{max} positional argument{}", if max == 1 { "" } else { "s" })
    } else {
        format!("from {min} to {max} positional arguments")
    };
    let given = shape.positional;
    let verb = if given == 1 { "was" } else { "were" };
    let keywords = if shape.keywords.is_empty() {
        String::new()
    } else {
        let n = shape.keywords.len();
        format!(" (and {n} keyword-only argument{})", if n == 1 { "" } else { "s" })
    };
    RunError::type_error(format!("{name}() takes {takes} but {given}{keywords} {verb} given"))
}

fn missing_arguments(name: &str, kind: &str, missing: &[Arc<str>]) -> RunError {
    let quoted: Vec<String> = missing.iter().map(|n| format!("'{n}'")).collect();
    let list = match quoted.as_slice() {
        [one] => one.clone(),
        [init @ .., last] => format!("{} and {last}", init.join(", ")),
        [] => String::new(),
    };
    let n = missing.len();
    RunError::type_error(format!(
        "{name}() missing {n} required {kind} argument{}: {list}",
        if n == 1 { "" } else { "s" }
    ))
}

/// A resolved call target for one callee shape.
#[derive(Debug, Clone)]
pub enum InvokePlan {
    /// A Python function: bind into slots and run.
    Function(Arc<BindPlan>),
    /// A bound method over a Python function; the receiver is the first argument.
    Method(Arc<BindPlan>),
    /// A native builtin.
    Builtin,
    /// Calling a class.
    Construct,
    Generic,
}

impl InvokePlan {
    pub fn run(&self, ctx: &mut ExecCtx, callee: &Value, args: CallArgs) -> RunResult<Value> {
        match (self, callee) {
            (Self::Function(plan), Value::Function(func)) => {
                let slots = plan.bind(func, args);
                interp::run_function(ctx, func, slots)
            }
            (Self::Method(plan), Value::BoundMethod(method)) => {
                if let Value::Function(func) = &method.func {
                    let slots = plan.bind(func, args.with_receiver(method.receiver.clone()));
                    return interp::run_function(ctx, func, slots);
                }
                call(ctx, callee, args)
            }
            (Self::Builtin, Value::Builtin(builtin)) => (builtin.func)(ctx, args),
            (Self::Construct, Value::Type(ty)) => construct(ctx, ty, args),
            _ => call(ctx, callee, args),
        }
    }
}

/// Plans an invocation. Binding errors surface here, before anything is cached.
pub fn plan_invoke(callee: &Value, shape: &ArgShape) -> RunResult<InvokePlan> {
    Ok(match callee {
        Value::Function(func) => InvokePlan::Function(Arc::new(BindPlan::new(func, shape)?)),
        Value::BoundMethod(method) => match &method.func {
            Value::Function(func) => InvokePlan::Method(Arc::new(BindPlan::new(func, &shape.with_receiver())?)),
            _ => InvokePlan::Generic,
        },
        Value::Builtin(builtin) if builtin.intrinsic.is_none() => InvokePlan::Builtin,
        Value::Type(_) => InvokePlan::Construct,
        _ => InvokePlan::Generic,
    })
}

/// Calls any callable value.
pub fn call(ctx: &mut ExecCtx, callee: &Value, args: CallArgs) -> RunResult<Value> {
    match callee {
        Value::Function(func) => call_function(ctx, func, args),
        Value::Builtin(builtin) => (builtin.func)(ctx, args),
        Value::BoundMethod(method) => call(ctx, &method.func, args.with_receiver(method.receiver.clone())),
        Value::Type(ty) => construct(ctx, ty, args),
        Value::StaticMethod(func) => call(ctx, func, args),
        Value::Instance(_) => match user_special(callee, "__call__") {
            Some(method) => call_method(ctx, &method, callee, args),
            None => Err(not_callable(callee)),
        },
        other => Err(not_callable(other)),
    }
}

fn not_callable(value: &Value) -> RunError {
    RunError::type_error(format!("'{}' object is not callable", value.type_name()))
}

/// Whether `callable()` holds for a value.
#[must_use]
pub fn is_callable(value: &Value) -> bool {
    match value {
        Value::Function(_) | Value::Builtin(_) | Value::BoundMethod(_) | Value::Type(_) | Value::StaticMethod(_) => true,
        Value::Instance(_) => user_special(value, "__call__").is_some(),
        _ => false,
    }
}

/// Binds and runs a Python function.
pub fn call_function(ctx: &mut ExecCtx, func: &Arc<Function>, args: CallArgs) -> RunResult<Value> {
    let plan = BindPlan::new(func, &ArgShape::of(&args))?;
    let slots = plan.bind(func, args);
    interp::run_function(ctx, func, slots)
}

/// Calls an unbound class attribute with `receiver` as its first argument.
pub fn call_method(ctx: &mut ExecCtx, method: &Value, receiver: &Value, args: CallArgs) -> RunResult<Value> {
    match method {
        Value::Function(_) | Value::Builtin(_) => call(ctx, method, args.with_receiver(receiver.clone())),
        Value::ClassMethod(func) => {
            let class = match receiver {
                Value::Type(ty) => Arc::clone(ty),
                other => type_of(other),
            };
            call(ctx, func, args.with_receiver(Value::Type(class)))
        }
        Value::StaticMethod(func) => call(ctx, func, args),
        other => call(ctx, other, args),
    }
}

/// Calls a user-defined special method if the receiver's class has one.
pub fn call_special(ctx: &mut ExecCtx, receiver: &Value, name: &str, args: CallArgs) -> RunResult<Option<Value>> {
    match user_special(receiver, name) {
        Some(method) => call_method(ctx, &method, receiver, args).map(Some),
        None => Ok(None),
    }
}

/// Calls a class: `__new__` then `__init__`, or the builtin constructor.
pub fn construct(ctx: &mut ExecCtx, ty: &Arc<PyType>, args: CallArgs) -> RunResult<Value> {
    if let TypeKind::Builtin(kind) = ty.kind {
        return crate::builtins::construct_builtin(ctx, kind, args);
    }
    let user_new = ty
        .lookup_with_owner("__new__")
        .filter(|(_, owner)| owner.kind == TypeKind::User)
        .map(|(new, _)| new);
    let instance = match &user_new {
        Some(new) => {
            let new = match new {
                Value::StaticMethod(inner) => (**inner).clone(),
                other => other.clone(),
            };
            call(ctx, &new, args.clone().with_receiver(Value::Type(Arc::clone(ty))))?
        }
        None if ty.exc_base.is_some() => Value::Instance(Instance::new_exception(
            Arc::clone(ty),
            args.positional.to_vec(),
        )),
        None => Value::Instance(Instance::new(Arc::clone(ty))),
    };
    if !crate::types::is_instance(&instance, ty) {
        return Ok(instance);
    }
    match ty.lookup_with_owner("__init__") {
        Some((init, owner)) if owner.kind == TypeKind::User => {
            let result = call_method(ctx, &init, &instance, args)?;
            if !result.is_none() {
                return Err(RunError::type_error(format!(
                    "__init__() should return None, not '{}'",
                    result.type_name()
                )));
            }
        }
        _ if ty.exc_base.is_some() => {}
        _ => {
            if user_new.is_none() && !args.is_empty() {
                return Err(RunError::type_error(format!("{}() takes no arguments", ty.name)));
            }
        }
    }
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_argument_lists_read_naturally() {
        let names: Vec<Arc<str>> = ["a", "b", "c"].into_iter().map(Arc::from).collect();
        let err = missing_arguments("f", "positional", &names);
        assert_eq!(
            err.to_string(),
            "TypeError: f() missing 3 required positional arguments: 'a', 'b' and 'c'"
        );
        let err = missing_arguments("g", "keyword-only", &names[..1]);
        assert_eq!(err.to_string(), "TypeError: g() missing 1 required keyword-only argument: 'a'");
    }

    #[test]
    fn too_many_positional_messages() {
        let shape = ArgShape {
            positional: 3,
            keywords: SmallVec::new(),
        };
        assert_eq!(
            too_many_positional("f", 2, 0, &shape).to_string(),
            "TypeError: f() takes 2 positional arguments but 3 were given"
        );
        assert_eq!(
            too_many_positional("f", 2, 1, &shape).to_string(),
            "TypeError: f() takes from 1 to 2 positional arguments but 3 were given"
        );
    }
}
