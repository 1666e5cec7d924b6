//! Methods of builtin types, and the class dictionaries built from them.
//!
//! Every method is a plain [`BuiltinFn`] that receives its bound object as the first
//! positional argument. The tables here are read once, while the type registry is being
//! initialised, so nothing in this module may look up a builtin class at table-build time.

mod dict;
mod list;
mod set;
mod string;

use std::sync::Arc;

use indexmap::IndexMap;

use super::construct::decode;
use crate::{
    exception_private::{RunError, RunResult},
    interp::{ExecCtx, exec::to_exception, generator},
    ops::{
        self,
        attr::{remove_instance_attr, store_instance_attr, user_class_method},
        compare::eq,
        format,
    },
    types::{BuiltinFn, BuiltinFunction, BuiltinKind, CallArgs, Instance, Property, TypeKind},
    value::Value,
};

/// Class dictionary of a builtin type.
pub(crate) fn type_dict(kind: BuiltinKind) -> IndexMap<Arc<str>, Value> {
    match kind {
        BuiltinKind::Object => table(OBJECT_METHODS),
        BuiltinKind::Type => table(&[("mro", type_mro)]),
        BuiltinKind::Int | BuiltinKind::Bool => table(&[("bit_length", int_bit_length), ("conjugate", conjugate)]),
        BuiltinKind::Float => table(&[("is_integer", float_is_integer), ("conjugate", conjugate)]),
        BuiltinKind::Str => table(string::METHODS),
        BuiltinKind::Bytes => table(&[("decode", bytes_decode), ("hex", bytes_hex)]),
        BuiltinKind::Tuple => table(&[("index", tuple_index), ("count", tuple_count)]),
        BuiltinKind::List => table(list::METHODS),
        BuiltinKind::Dict => {
            let mut methods = table(dict::METHODS);
            methods.insert(
                Arc::from("fromkeys"),
                Value::ClassMethod(Arc::new(BuiltinFunction::value("fromkeys", dict::fromkeys))),
            );
            methods
        }
        BuiltinKind::Set => table(set::SET_METHODS),
        BuiltinKind::FrozenSet => table(set::FROZENSET_METHODS),
        BuiltinKind::Generator | BuiltinKind::Coroutine => table(GENERATOR_METHODS),
        BuiltinKind::Iterator => table(&[("__next__", iterator_next), ("__iter__", iterator_iter)]),
        BuiltinKind::Property => table(&[
            ("getter", property_getter),
            ("setter", property_setter),
            ("deleter", property_deleter),
        ]),
        _ => IndexMap::new(),
    }
}

/// Class dictionary of `BaseException`; every other exception class inherits it.
pub(crate) fn exception_dict() -> IndexMap<Arc<str>, Value> {
    table(&[
        ("__init__", exception_init),
        ("__str__", exception_str),
        ("__repr__", exception_repr),
        ("with_traceback", exception_with_traceback),
    ])
}

fn table(entries: &[(&'static str, BuiltinFn)]) -> IndexMap<Arc<str>, Value> {
    entries
        .iter()
        .map(|&(name, func)| (Arc::from(name), BuiltinFunction::value(name, func)))
        .collect()
}

fn wrong_receiver(method: &str, expected: &str, got: &Value) -> RunError {
    RunError::type_error(format!(
        "descriptor '{method}' requires a '{expected}' object but received a '{}'",
        got.type_name()
    ))
}

/// Clamps optional `start`/`end` arguments to `0..=len` the way slicing does.
pub(super) fn slice_bounds(ctx: &mut ExecCtx, start: Option<&Value>, end: Option<&Value>, len: usize) -> RunResult<(usize, usize)> {
    let clamp = |index: i64| -> usize {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let index = if index < 0 { (index + len).max(0) } else { index.min(len) };
        usize::try_from(index).unwrap_or(0)
    };
    let start = match start {
        Some(value) if !value.is_none() => clamp(ops::expect_index(ctx, value)?),
        _ => 0,
    };
    let end = match end {
        Some(value) if !value.is_none() => clamp(ops::expect_index(ctx, value)?),
        _ => len,
    };
    Ok((start, end))
}

/// Position of the first item equal to `target` within `start..end`.
pub(super) fn find_equal(ctx: &mut ExecCtx, items: &[Value], target: &Value, start: usize, end: usize) -> RunResult<Option<usize>> {
    for (index, item) in items.iter().enumerate().take(end).skip(start) {
        if item.is(target) || eq(ctx, item, target)? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

pub(super) fn count_equal(ctx: &mut ExecCtx, items: &[Value], target: &Value) -> RunResult<usize> {
    let mut count = 0;
    for item in items {
        if item.is(target) || eq(ctx, item, target)? {
            count += 1;
        }
    }
    Ok(count)
}

// object

const OBJECT_METHODS: &[(&str, BuiltinFn)] = &[
    ("__new__", object_new),
    ("__init__", object_init),
    ("__repr__", object_repr),
    ("__str__", object_str),
    ("__eq__", object_eq),
    ("__setattr__", object_setattr),
    ("__delattr__", object_delattr),
];

/// `object.__new__(cls, *args)`.
fn object_new(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    let Some(Value::Type(class)) = args.get(0) else {
        return Err(RunError::type_error("object.__new__(X): X is not a type object"));
    };
    if let TypeKind::Builtin(kind) = class.kind
        && kind != BuiltinKind::Object
    {
        return Err(RunError::type_error(format!(
            "object.__new__({}) is not safe, use {}.__new__()",
            class.name, class.name
        )));
    }
    let instance = if class.exc_base.is_some() {
        Instance::new_exception(Arc::clone(class), args.positional[1..].to_vec())
    } else {
        Instance::new(Arc::clone(class))
    };
    Ok(Value::Instance(instance))
}

/// `object.__init__(self)`: extra arguments are only tolerated when the class overrides `__new__`.
fn object_init(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("object.__init__")?;
    if args.is_empty() {
        return Ok(Value::None);
    }
    let overrides_new = match &this {
        Value::Instance(inst) => user_class_method(&inst.class, "__new__").is_some(),
        _ => false,
    };
    if overrides_new {
        Ok(Value::None)
    } else {
        Err(RunError::type_error(
            "object.__init__() takes exactly one argument (the instance to initialize)",
        ))
    }
}

fn object_repr(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("object.__repr__")?;
    args.check("object.__repr__", 0, 0)?;
    format::base_repr(ctx, &this).map(Value::from)
}

fn object_str(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("object.__str__")?;
    args.check("object.__str__", 0, 0)?;
    format::repr(ctx, &this).map(Value::from)
}

fn object_eq(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("object.__eq__")?;
    args.check("object.__eq__", 1, 1)?;
    Ok(if this.is(&args.positional[0]) {
        Value::Bool(true)
    } else {
        Value::NotImplemented
    })
}

fn attr_name(value: &Value) -> RunResult<&str> {
    value.as_str().ok_or_else(|| {
        RunError::type_error(format!(
            "attribute name must be string, not '{}'",
            value.type_name()
        ))
    })
}

fn object_setattr(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("object.__setattr__")?;
    args.check("object.__setattr__", 2, 2)?;
    let name = attr_name(&args.positional[0])?;
    let value = args.positional[1].clone();
    match &this {
        Value::Instance(inst) => store_instance_attr(ctx, inst, &this, name, value)?,
        other => ops::attr::set_attr(ctx, other, name, value)?,
    }
    Ok(Value::None)
}

fn object_delattr(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("object.__delattr__")?;
    args.check("object.__delattr__", 1, 1)?;
    let name = attr_name(&args.positional[0])?;
    match &this {
        Value::Instance(inst) => remove_instance_attr(ctx, inst, &this, name)?,
        other => ops::attr::del_attr(ctx, other, name)?,
    }
    Ok(Value::None)
}

fn type_mro(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("type.mro")?;
    args.check("type.mro", 0, 0)?;
    match &this {
        Value::Type(ty) => Ok(Value::list(ty.mro_iter().map(|t| Value::Type(Arc::clone(t))).collect())),
        other => Err(wrong_receiver("mro", "type", other)),
    }
}

// numbers

fn int_bit_length(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("int.bit_length")?;
    args.check("int.bit_length", 0, 0)?;
    let value = this.as_bigint().ok_or_else(|| wrong_receiver("bit_length", "int", &this))?;
    Ok(Value::Int(i64::try_from(value.bits()).unwrap_or(i64::MAX)))
}

fn conjugate(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("conjugate")?;
    args.check("conjugate", 0, 0)?;
    match this {
        Value::Float(_) => Ok(this),
        other => ops::arith::to_int(ctx, &other),
    }
}

fn float_is_integer(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("float.is_integer")?;
    args.check("float.is_integer", 0, 0)?;
    match this {
        Value::Float(f) => Ok(Value::Bool(f.is_finite() && f.fract() == 0.0)),
        other => Err(wrong_receiver("is_integer", "float", &other)),
    }
}

// bytes and tuple

fn bytes_decode(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("bytes.decode")?;
    let [encoding, _errors] = super::keyword_only(&mut args, "decode", ["encoding", "errors"])?;
    args.check("decode", 0, 2)?;
    let Value::Bytes(bytes) = &this else {
        return Err(wrong_receiver("decode", "bytes", &this));
    };
    decode(bytes, args.get(0).or(encoding.as_ref()))
}

fn bytes_hex(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("bytes.hex")?;
    args.check("hex", 0, 0)?;
    let Value::Bytes(bytes) = &this else {
        return Err(wrong_receiver("hex", "bytes", &this));
    };
    Ok(Value::from(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()))
}

fn tuple_items(this: &Value, method: &str) -> RunResult<Arc<[Value]>> {
    match this {
        Value::Tuple(items) => Ok(Arc::clone(items)),
        other => Err(wrong_receiver(method, "tuple", other)),
    }
}

fn tuple_index(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("tuple.index")?;
    args.check("index", 1, 3)?;
    let items = tuple_items(&this, "index")?;
    let (start, end) = slice_bounds(ctx, args.get(1), args.get(2), items.len())?;
    match find_equal(ctx, &items, &args.positional[0], start, end)? {
        Some(index) => Ok(Value::from(index)),
        None => Err(RunError::value_error("tuple.index(x): x not in tuple")),
    }
}

fn tuple_count(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("tuple.count")?;
    args.check("count", 1, 1)?;
    let items = tuple_items(&this, "count")?;
    count_equal(ctx, &items, &args.positional[0]).map(Value::from)
}

// generators, coroutines and iterators

const GENERATOR_METHODS: &[(&str, BuiltinFn)] = &[
    ("send", generator_send),
    ("throw", generator_throw),
    ("close", generator_close),
    ("__next__", iterator_next),
    ("__iter__", iterator_iter),
];

fn generator_of(this: &Value, method: &str) -> RunResult<Arc<crate::types::Generator>> {
    match this {
        Value::Generator(generator) => Ok(Arc::clone(generator)),
        other => Err(wrong_receiver(method, "generator", other)),
    }
}

fn generator_send(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("generator.send")?;
    args.check("send", 1, 1)?;
    let generator = generator_of(&this, "send")?;
    generator::send(ctx, &generator, args.positional[0].clone())
}

/// `throw(exc)` or the legacy `throw(type, value)`.
fn generator_throw(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("generator.throw")?;
    args.check("throw", 1, 3)?;
    let generator = generator_of(&this, "throw")?;
    let exc = match (&args.positional[0], args.get(1)) {
        (class @ Value::Type(_), Some(value)) if !value.is_none() => match RunError::from_value(value) {
            Some(_) => value.clone(),
            None => ops::call::call(ctx, class, CallArgs::positional([value.clone()]))?,
        },
        (exc, _) => exc.clone(),
    };
    let err = to_exception(ctx, &exc)?;
    generator::throw(ctx, &generator, err)
}

fn generator_close(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("generator.close")?;
    args.check("close", 0, 0)?;
    let generator = generator_of(&this, "close")?;
    generator::close(ctx, &generator)?;
    Ok(Value::None)
}

fn iterator_next(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("__next__")?;
    args.check("__next__", 0, 0)?;
    ops::iter::next_or_stop(ctx, &this)
}

fn iterator_iter(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("__iter__")?;
    args.check("__iter__", 0, 0)?;
    Ok(this)
}

// property

fn with_accessor(mut args: CallArgs, method: &str, set: fn(&mut Property, Option<Value>)) -> RunResult<Value> {
    let this = args.receiver(method)?;
    args.check(method, 1, 1)?;
    let Value::Property(prop) = &this else {
        return Err(wrong_receiver(method, "property", &this));
    };
    let mut copy = (**prop).clone();
    let func = args.positional[0].clone();
    set(&mut copy, (!func.is_none()).then_some(func));
    Ok(Value::Property(Arc::new(copy)))
}

fn property_getter(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    with_accessor(args, "getter", |prop, func| prop.fget = func)
}

fn property_setter(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    with_accessor(args, "setter", |prop, func| prop.fset = func)
}

fn property_deleter(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    with_accessor(args, "deleter", |prop, func| prop.fdel = func)
}

// BaseException

fn exception_instance(this: &Value, method: &str) -> RunResult<Arc<Instance>> {
    match this {
        Value::Instance(inst) if inst.exc.is_some() => Ok(Arc::clone(inst)),
        other => Err(wrong_receiver(method, "BaseException", other)),
    }
}

fn exception_init(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("BaseException.__init__")?;
    args.no_keywords("BaseException.__init__")?;
    let inst = exception_instance(&this, "__init__")?;
    if let Some(state) = &inst.exc {
        state.lock().args = args.positional.into_vec().into();
    }
    Ok(Value::None)
}

fn exception_str(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("BaseException.__str__")?;
    args.check("__str__", 0, 0)?;
    let inst = exception_instance(&this, "__str__")?;
    format::exception_str(ctx, &inst).map(Value::from)
}

fn exception_repr(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("BaseException.__repr__")?;
    args.check("__repr__", 0, 0)?;
    exception_instance(&this, "__repr__")?;
    format::base_repr(ctx, &this).map(Value::from)
}

fn exception_with_traceback(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let this = args.receiver("BaseException.with_traceback")?;
    args.check("with_traceback", 1, 1)?;
    exception_instance(&this, "with_traceback")?;
    Ok(this)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::HostConfig, exception_private::ExcType, tracer::NoopTracer, types::builtin_type};

    fn ctx() -> ExecCtx {
        ExecCtx::for_tests(HostConfig::default(), Arc::new(NoopTracer))
    }

    fn call_method(ctx: &mut ExecCtx, receiver: &Value, name: &str, args: Vec<Value>) -> RunResult<Value> {
        let method = ops::attr::get_attr(ctx, receiver, name)?;
        ops::call::call(ctx, &method, CallArgs::positional(args))
    }

    #[test]
    fn object_dictionary_has_the_protocol_slots() {
        let object = builtin_type(BuiltinKind::Object);
        for name in ["__new__", "__init__", "__repr__", "__eq__", "__setattr__"] {
            assert!(object.get_own(name).is_some(), "{name}");
        }
        assert!(object.get_own("__hash__").is_none());
    }

    #[test]
    fn tuple_methods_compare_by_equality() {
        let mut ctx = ctx();
        let tuple = Value::tuple(vec![Value::Int(1), Value::Float(2.0), Value::Int(2)]);
        let index = call_method(&mut ctx, &tuple, "index", vec![Value::Int(2)]).unwrap();
        assert_eq!(index.as_i64(), Some(1));
        let count = call_method(&mut ctx, &tuple, "count", vec![Value::Int(2)]).unwrap();
        assert_eq!(count.as_i64(), Some(2));
        let err = call_method(&mut ctx, &tuple, "index", vec![Value::Int(9)]).unwrap_err();
        assert!(err.matches(ExcType::ValueError));
    }

    #[test]
    fn property_accessors_return_copies() {
        let mut ctx = ctx();
        let prop = Value::Property(Arc::new(Property::default()));
        let setter = BuiltinFunction::value("set", |_, _| Ok(Value::None));
        let updated = call_method(&mut ctx, &prop, "setter", vec![setter]).unwrap();
        let (Value::Property(before), Value::Property(after)) = (&prop, &updated) else {
            panic!("expected properties");
        };
        assert!(before.fset.is_none());
        assert!(after.fset.is_some());
    }

    #[test]
    fn bytes_hex_and_bit_length() {
        let mut ctx = ctx();
        let bytes = Value::Bytes(Arc::from(&b"\x01\xff"[..]));
        let hex = call_method(&mut ctx, &bytes, "hex", vec![]).unwrap();
        assert_eq!(hex.as_str(), Some("01ff"));
        let bits = call_method(&mut ctx, &Value::Int(255), "bit_length", vec![]).unwrap();
        assert_eq!(bits.as_i64(), Some(8));
    }
}
