//! Attribute access: `obj.name`, `obj.name = v` and `del obj.name`.
//!
//! Reads resolve through an [`AttrPlan`] computed from the receiver's class alone, which is
//! what a call site caches. Plans that depend on a class dictionary are only valid while the
//! class version is unchanged; the site guard checks that, not the plan.

use std::sync::Arc;

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    interp::ExecCtx,
    ops::call::{call, call_method},
    types::{BoundMethod, CallArgs, Instance, PyDict, PyType, SuperObject, TypeKind, type_of},
    value::Value,
};

/// Exception attributes stored in the exception state rather than the instance dict.
const EXCEPTION_ATTRS: [&str; 5] = [
    "args",
    "__cause__",
    "__context__",
    "__suppress_context__",
    "__traceback__",
];

/// A resolved attribute read for one receiver class.
#[derive(Debug, Clone)]
pub enum AttrPlan {
    /// A property on the class; it takes precedence over the instance dict.
    Property(Value),
    /// Instance dict first, then the class attribute, then a user `__getattr__`.
    Instance {
        class_attr: Option<Value>,
        getattr: Option<Value>,
    },
    /// Attribute of a class object, already bound for that class.
    TypeAttr(Value),
    /// Method found in a builtin type's dictionary, bound to the receiver on use.
    BuiltinMethod(Value),
    /// No cacheable shape: full lookup every time.
    Generic,
}

impl AttrPlan {
    pub fn run(&self, ctx: &mut ExecCtx, receiver: &Value, name: &str) -> RunResult<Value> {
        match self {
            Self::Property(prop) => read_property(ctx, prop, receiver, name),
            Self::Instance { class_attr, getattr } => {
                let Value::Instance(inst) = receiver else {
                    return generic_get(ctx, receiver, name);
                };
                if let Some(value) = inst.get_attr(name) {
                    return Ok(value);
                }
                if let Some(attr) = class_attr {
                    return Ok(bind_class_attr(attr.clone(), receiver, &inst.class));
                }
                if let Some(getattr) = getattr {
                    return call_method(ctx, getattr, receiver, CallArgs::positional([Value::str(name)]));
                }
                Err(no_attribute(receiver, name))
            }
            Self::TypeAttr(value) => Ok(value.clone()),
            Self::BuiltinMethod(method) => Ok(bind_class_attr(method.clone(), receiver, &type_of(receiver))),
            Self::Generic => generic_get(ctx, receiver, name),
        }
    }
}

/// Computes the read plan for `receiver.name`.
#[must_use]
pub fn plan_get_attr(receiver: &Value, name: &str) -> AttrPlan {
    match receiver {
        Value::Instance(inst) => plan_instance(&inst.class, name),
        Value::Type(ty) => {
            if is_type_special(name) {
                return AttrPlan::Generic;
            }
            match type_attr(ty, name) {
                Some(value) => AttrPlan::TypeAttr(value),
                None => AttrPlan::Generic,
            }
        }
        Value::Module(_) | Value::Function(_) | Value::BoundMethod(_) | Value::Super(_) => AttrPlan::Generic,
        _ if matches!(name, "__class__" | "__doc__" | "__name__" | "__qualname__") => AttrPlan::Generic,
        _ => match type_of(receiver).lookup(name) {
            Some(method) => AttrPlan::BuiltinMethod(method),
            None => AttrPlan::Generic,
        },
    }
}

fn plan_instance(class: &Arc<PyType>, name: &str) -> AttrPlan {
    if matches!(name, "__class__" | "__dict__")
        || (class.exc_base.is_some() && EXCEPTION_ATTRS.contains(&name))
        || is_stop_value(class, name)
    {
        return AttrPlan::Generic;
    }
    let class_attr = class.lookup(name);
    if let Some(prop @ Value::Property(_)) = class_attr {
        return AttrPlan::Property(prop);
    }
    AttrPlan::Instance {
        class_attr,
        getattr: user_class_method(class, "__getattr__"),
    }
}

fn is_type_special(name: &str) -> bool {
    matches!(
        name,
        "__name__" | "__qualname__" | "__module__" | "__mro__" | "__bases__" | "__dict__" | "__doc__" | "__class__"
    )
}

/// `getattr(receiver, name)` without a call site.
pub fn get_attr(ctx: &mut ExecCtx, receiver: &Value, name: &str) -> RunResult<Value> {
    plan_get_attr(receiver, name).run(ctx, receiver, name)
}

/// Like [`get_attr`] but maps `AttributeError` to `None`.
pub fn get_attr_opt(ctx: &mut ExecCtx, receiver: &Value, name: &str) -> RunResult<Option<Value>> {
    match get_attr(ctx, receiver, name) {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.matches(ExcType::AttributeError) => Ok(None),
        Err(err) => Err(err),
    }
}

/// A special method defined by a user class on the value's class.
///
/// Builtin behavior for builtin owners is handled natively by the callers, so only methods
/// whose owner is a user class are returned. The result is unbound.
#[must_use]
pub fn user_special(value: &Value, name: &str) -> Option<Value> {
    match value {
        Value::Instance(inst) => user_class_method(&inst.class, name),
        _ => None,
    }
}

/// Looks up `name` along the MRO, keeping it only if a user class defines it.
#[must_use]
pub fn user_class_method(class: &Arc<PyType>, name: &str) -> Option<Value> {
    class
        .lookup_with_owner(name)
        .filter(|(_, owner)| owner.kind == TypeKind::User)
        .map(|(value, _)| value)
}

/// Binds a class attribute fetched for `receiver`.
#[must_use]
pub fn bind_class_attr(attr: Value, receiver: &Value, class: &Arc<PyType>) -> Value {
    match attr {
        Value::Function(_) | Value::Builtin(_) => Value::BoundMethod(Arc::new(BoundMethod {
            receiver: receiver.clone(),
            func: attr,
        })),
        Value::ClassMethod(func) => Value::BoundMethod(Arc::new(BoundMethod {
            receiver: Value::Type(Arc::clone(class)),
            func: (*func).clone(),
        })),
        Value::StaticMethod(func) => (*func).clone(),
        other => other,
    }
}

/// Attribute of a class object: functions stay unbound, classmethods bind to the class.
fn type_attr(ty: &Arc<PyType>, name: &str) -> Option<Value> {
    let attr = ty.lookup(name)?;
    Some(match attr {
        Value::ClassMethod(func) => Value::BoundMethod(Arc::new(BoundMethod {
            receiver: Value::Type(Arc::clone(ty)),
            func: (*func).clone(),
        })),
        Value::StaticMethod(func) => (*func).clone(),
        other => other,
    })
}

fn read_property(ctx: &mut ExecCtx, prop: &Value, receiver: &Value, name: &str) -> RunResult<Value> {
    let Value::Property(prop) = prop else {
        return Ok(prop.clone());
    };
    match &prop.fget {
        Some(fget) => call(ctx, fget, CallArgs::positional([receiver.clone()])),
        None => Err(RunError::attribute_error(format!(
            "property '{name}' of '{}' object has no getter",
            receiver.type_name()
        ))),
    }
}

fn no_attribute(receiver: &Value, name: &str) -> RunError {
    match receiver {
        Value::Type(ty) => RunError::attribute_error(format!("type object '{}' has no attribute '{name}'", ty.name)),
        Value::Module(module) => {
            RunError::attribute_error(format!("module '{}' has no attribute '{name}'", module.name))
        }
        other => RunError::attribute_error(format!("'{}' object has no attribute '{name}'", other.type_name())),
    }
}

fn dict_of(entries: impl IntoIterator<Item = (Arc<str>, Value)>) -> Value {
    let dict = PyDict::new();
    for (key, value) in entries {
        dict.set_str(&key, value);
    }
    Value::Dict(Arc::new(dict))
}

fn is_stop_value(class: &PyType, name: &str) -> bool {
    name == "value" && class.exc_base == Some(ExcType::StopIteration)
}

fn opt(value: Option<Value>) -> Value {
    value.unwrap_or(Value::None)
}

/// The uncacheable read path.
fn generic_get(ctx: &mut ExecCtx, receiver: &Value, name: &str) -> RunResult<Value> {
    if let Some(value) = special_attr(ctx, receiver, name)? {
        return Ok(value);
    }
    match receiver {
        Value::Instance(inst) => {
            if let Some(state) = &inst.exc
                && EXCEPTION_ATTRS.contains(&name)
            {
                let state = state.lock();
                return Ok(match name {
                    "args" => Value::Tuple(Arc::clone(&state.args)),
                    "__cause__" => opt(state.cause.clone()),
                    "__context__" => opt(state.context.clone()),
                    "__suppress_context__" => Value::Bool(state.suppress_context),
                    _ => traceback_value(&state.traceback),
                });
            }
            if let Some(state) = &inst.exc
                && is_stop_value(&inst.class, name)
            {
                // `StopIteration.value` mirrors the first argument unless assigned directly.
                return Ok(inst
                    .get_attr(name)
                    .unwrap_or_else(|| state.lock().args.first().cloned().unwrap_or(Value::None)));
            }
            match plan_instance(&inst.class, name) {
                AttrPlan::Generic => Err(no_attribute(receiver, name)),
                plan => plan.run(ctx, receiver, name),
            }
        }
        Value::Type(ty) => type_attr(ty, name)
            .or_else(|| type_of(receiver).lookup(name).map(|m| bind_class_attr(m, receiver, &type_of(receiver))))
            .ok_or_else(|| no_attribute(receiver, name)),
        Value::Module(module) => module.namespace.get(name).ok_or_else(|| no_attribute(receiver, name)),
        Value::Function(func) => func
            .dict
            .read()
            .get(name)
            .cloned()
            .or_else(|| type_of(receiver).lookup(name).map(|m| bind_class_attr(m, receiver, &type_of(receiver))))
            .ok_or_else(|| no_attribute(receiver, name)),
        Value::BoundMethod(method) => get_attr(ctx, &method.func, name),
        Value::Super(sup) => super_attr(ctx, sup, name),
        other => type_of(other)
            .lookup(name)
            .map(|m| bind_class_attr(m, other, &type_of(other)))
            .ok_or_else(|| no_attribute(other, name)),
    }
}

fn traceback_value(frames: &[crate::exception_private::TracebackEntry]) -> Value {
    if frames.is_empty() {
        return Value::None;
    }
    Value::list(
        frames
            .iter()
            .map(|frame| {
                Value::tuple(vec![
                    Value::Str(Arc::clone(&frame.filename)),
                    Value::Str(Arc::clone(&frame.name)),
                    Value::Int(i64::from(frame.line)),
                ])
            })
            .collect(),
    )
}

/// Attributes that exist on every object of a kind regardless of class dictionaries.
fn special_attr(ctx: &mut ExecCtx, receiver: &Value, name: &str) -> RunResult<Option<Value>> {
    if name == "__class__" {
        return Ok(Some(Value::Type(type_of(receiver))));
    }
    Ok(match (receiver, name) {
        (Value::Instance(inst), "__dict__") => Some(dict_of(
            inst.dict.read().iter().map(|(k, v)| (Arc::clone(k), v.clone())),
        )),
        (Value::Type(ty), _) => match name {
            "__name__" => Some(Value::Str(Arc::clone(&ty.name))),
            "__qualname__" => Some(Value::Str(Arc::clone(&ty.qualname))),
            "__module__" => Some(Value::Str(Arc::clone(&ty.module))),
            "__mro__" => Some(Value::tuple(ty.mro_iter().map(|t| Value::Type(Arc::clone(t))).collect())),
            "__bases__" => Some(Value::tuple(ty.bases.iter().map(|t| Value::Type(Arc::clone(t))).collect())),
            "__dict__" => Some(dict_of(ty.dict_snapshot())),
            "__doc__" => Some(ty.get_own("__doc__").unwrap_or(Value::None)),
            _ => None,
        },
        (Value::Module(module), "__dict__") => Some(Value::Dict(module.namespace.to_dict())),
        (Value::Function(func), _) => match name {
            "__name__" => Some(Value::Str(Arc::clone(&func.code.name))),
            "__qualname__" => Some(Value::Str(Arc::clone(&func.code.qualname))),
            "__module__" => Some(func.module.clone().map_or(Value::None, Value::Str)),
            "__doc__" => Some(func.dict.read().get("__doc__").cloned().or_else(|| func.code.doc.clone()).unwrap_or(Value::None)),
            "__defaults__" => Some(if func.defaults.is_empty() {
                Value::None
            } else {
                Value::tuple(func.defaults.clone())
            }),
            "__dict__" => Some(dict_of(
                func.dict.read().iter().map(|(k, v)| (Arc::clone(k), v.clone())),
            )),
            _ => None,
        },
        (Value::Builtin(builtin), "__name__" | "__qualname__") => Some(Value::str(builtin.name)),
        (Value::BoundMethod(method), "__self__") => Some(method.receiver.clone()),
        (Value::BoundMethod(method), "__func__") => Some(method.func.clone()),
        (Value::Generator(generator), "__name__") => Some(Value::Str(Arc::clone(&generator.code.name))),
        (Value::Generator(generator), "__qualname__") => Some(Value::Str(Arc::clone(&generator.code.qualname))),
        (Value::Generator(generator), "gi_running" | "cr_running") => Some(Value::Bool(generator.is_running())),
        (Value::Slice(slice), "start") => Some(slice.start.clone()),
        (Value::Slice(slice), "stop") => Some(slice.stop.clone()),
        (Value::Slice(slice), "step") => Some(slice.step.clone()),
        (Value::Range(range), "start") => Some(Value::Int(range.start)),
        (Value::Range(range), "stop") => Some(Value::Int(range.stop)),
        (Value::Range(range), "step") => Some(Value::Int(range.step)),
        (Value::Property(prop), "fget") => Some(opt(prop.fget.clone())),
        (Value::Property(prop), "fset") => Some(opt(prop.fset.clone())),
        (Value::Property(prop), "fdel") => Some(opt(prop.fdel.clone())),
        (Value::Property(prop), "__doc__") => Some(opt(prop.doc.clone())),
        (Value::ClassMethod(func) | Value::StaticMethod(func), "__func__") => Some((**func).clone()),
        (Value::Int(_) | Value::Bool(_) | Value::BigInt(_), "real" | "numerator") => {
            Some(crate::ops::arith::to_int(ctx, receiver)?)
        }
        (Value::Int(_) | Value::Bool(_) | Value::BigInt(_), "imag") => Some(Value::Int(0)),
        (Value::Int(_) | Value::Bool(_) | Value::BigInt(_), "denominator") => Some(Value::Int(1)),
        (Value::Float(f), "real") => Some(Value::Float(*f)),
        (Value::Float(_), "imag") => Some(Value::Float(0.0)),
        (Value::Instance(_) | Value::Module(_), _) => None,
        (_, "__doc__") => Some(Value::None),
        _ => None,
    })
}

fn super_attr(ctx: &mut ExecCtx, sup: &SuperObject, name: &str) -> RunResult<Value> {
    let Some(attr) = sup.obj_type.lookup_after(&sup.this_class, name) else {
        return Err(RunError::attribute_error(format!("'super' object has no attribute '{name}'")));
    };
    Ok(match attr {
        Value::Property(_) => return read_property(ctx, &attr, &sup.obj, name),
        Value::ClassMethod(func) => Value::BoundMethod(Arc::new(BoundMethod {
            receiver: Value::Type(Arc::clone(&sup.obj_type)),
            func: (*func).clone(),
        })),
        Value::StaticMethod(func) => (*func).clone(),
        // `super()` inside a classmethod: the receiver is the class, so plain functions stay unbound.
        attr @ (Value::Function(_) | Value::Builtin(_)) if matches!(sup.obj, Value::Type(_)) => attr,
        attr => bind_class_attr(attr, &sup.obj, &sup.obj_type),
    })
}

/// `receiver.name = value`.
pub fn set_attr(ctx: &mut ExecCtx, receiver: &Value, name: &str, value: Value) -> RunResult<()> {
    match receiver {
        Value::Instance(inst) => set_instance_attr(ctx, inst, receiver, name, value),
        Value::Type(ty) => ty.set_attr(Arc::from(name), value),
        Value::Module(module) => {
            module.namespace.set(name, value);
            Ok(())
        }
        Value::Function(func) => {
            func.dict.write().insert(Arc::from(name), value);
            Ok(())
        }
        other => Err(no_attribute(other, name)),
    }
}

fn set_instance_attr(ctx: &mut ExecCtx, inst: &Arc<Instance>, receiver: &Value, name: &str, value: Value) -> RunResult<()> {
    if !matches!(inst.class.lookup(name), Some(Value::Property(_)))
        && let Some(setattr) = user_class_method(&inst.class, "__setattr__")
    {
        return call_method(ctx, &setattr, receiver, CallArgs::positional([Value::str(name), value])).map(drop);
    }
    store_instance_attr(ctx, inst, receiver, name, value)
}

/// `object.__setattr__`: properties and exception state, then the instance dict.
pub fn store_instance_attr(
    ctx: &mut ExecCtx,
    inst: &Arc<Instance>,
    receiver: &Value,
    name: &str,
    value: Value,
) -> RunResult<()> {
    if let Some(Value::Property(prop)) = inst.class.lookup(name) {
        return match &prop.fset {
            Some(fset) => call(ctx, fset, CallArgs::positional([receiver.clone(), value])).map(drop),
            None => Err(RunError::attribute_error(format!(
                "property '{name}' of '{}' object has no setter",
                inst.class.name
            ))),
        };
    }
    if let Some(state) = &inst.exc {
        if name == "args" {
            let args = crate::ops::iter::collect(ctx, &value)?;
            state.lock().args = args.into();
            return Ok(());
        }
        let mut state = state.lock();
        match name {
            "__cause__" => {
                state.cause = (!value.is_none()).then_some(value);
                state.suppress_context = true;
                return Ok(());
            }
            "__context__" => {
                state.context = (!value.is_none()).then_some(value);
                return Ok(());
            }
            "__suppress_context__" => {
                state.suppress_context = value.native_truth().unwrap_or(true);
                return Ok(());
            }
            _ => {}
        }
    }
    inst.set_attr(Arc::from(name), value);
    Ok(())
}

/// `del receiver.name`.
pub fn del_attr(ctx: &mut ExecCtx, receiver: &Value, name: &str) -> RunResult<()> {
    match receiver {
        Value::Instance(inst) => {
            if !matches!(inst.class.lookup(name), Some(Value::Property(_)))
                && let Some(delattr) = user_class_method(&inst.class, "__delattr__")
            {
                return call_method(ctx, &delattr, receiver, CallArgs::positional([Value::str(name)])).map(drop);
            }
            remove_instance_attr(ctx, inst, receiver, name)
        }
        Value::Type(ty) => ty.del_attr(name),
        Value::Module(module) => {
            if module.namespace.remove(name) {
                Ok(())
            } else {
                Err(no_attribute(receiver, name))
            }
        }
        Value::Function(func) => {
            if func.dict.write().shift_remove(name).is_some() {
                Ok(())
            } else {
                Err(no_attribute(receiver, name))
            }
        }
        other => Err(no_attribute(other, name)),
    }
}

/// `object.__delattr__`.
pub fn remove_instance_attr(ctx: &mut ExecCtx, inst: &Arc<Instance>, receiver: &Value, name: &str) -> RunResult<()> {
    if let Some(Value::Property(prop)) = inst.class.lookup(name) {
        return match &prop.fdel {
            Some(fdel) => call(ctx, fdel, CallArgs::positional([receiver.clone()])).map(drop),
            None => Err(RunError::attribute_error(format!(
                "property '{name}' of '{}' object has no deleter",
                inst.class.name
            ))),
        };
    }
    if inst.del_attr(name) {
        Ok(())
    } else {
        Err(no_attribute(receiver, name))
    }
}

/// Attribute names visible on a value, for `dir()`.
#[must_use]
pub fn attr_names(value: &Value) -> Vec<Arc<str>> {
    let mut names: Vec<Arc<str>> = Vec::new();
    match value {
        Value::Instance(inst) => names.extend(inst.dict.read().keys().cloned()),
        Value::Module(module) => names.extend(module.namespace.names()),
        Value::Function(func) => names.extend(func.dict.read().keys().cloned()),
        _ => {}
    }
    let class = match value {
        Value::Type(ty) => Arc::clone(ty),
        other => type_of(other),
    };
    if !matches!(value, Value::Module(_)) {
        for ty in class.mro_iter() {
            names.extend(ty.dict_snapshot().into_iter().map(|(name, _)| name));
        }
    }
    names.sort();
    names.dedup();
    names
}
