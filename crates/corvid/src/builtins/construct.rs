//! Calling a builtin class: `int(...)`, `list(...)`, `type(...)` and friends.

use std::sync::Arc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::Num;

use super::{keyword_only, make_super};
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    interp::ExecCtx,
    ops::{
        self,
        arith::{merge_mapping, to_f64, to_int},
        call::call_special,
        compare::truthy,
        format::{self, str_repr},
        iter::collect,
    },
    types::{
        BuiltinKind, CallArgs, Instance, Property, PyDict, PyRange, PySet, PySlice, PyType, builtin_type, type_of,
    },
    value::Value,
};

/// Calls the builtin class `kind` with `args`.
pub(crate) fn construct_builtin(ctx: &mut ExecCtx, kind: BuiltinKind, mut args: CallArgs) -> RunResult<Value> {
    match kind {
        BuiltinKind::Object => {
            args.check("object", 0, 0)?;
            Ok(Value::Instance(Instance::new(Arc::clone(builtin_type(BuiltinKind::Object)))))
        }
        BuiltinKind::Type => construct_type(&args),
        BuiltinKind::Int => construct_int(ctx, args),
        BuiltinKind::Bool => {
            args.check("bool", 0, 1)?;
            match args.get(0) {
                Some(value) => truthy(ctx, value).map(Value::Bool),
                None => Ok(Value::Bool(false)),
            }
        }
        BuiltinKind::Float => {
            args.check("float", 0, 1)?;
            match args.get(0) {
                Some(value) => to_float(ctx, value).map(Value::Float),
                None => Ok(Value::Float(0.0)),
            }
        }
        BuiltinKind::Str => construct_str(ctx, args),
        BuiltinKind::Bytes => construct_bytes(ctx, args),
        BuiltinKind::Tuple => {
            args.check("tuple", 0, 1)?;
            match args.get(0) {
                Some(Value::Tuple(items)) => Ok(Value::Tuple(Arc::clone(items))),
                Some(iterable) => Ok(Value::tuple(collect(ctx, iterable)?)),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        BuiltinKind::List => {
            args.check("list", 0, 1)?;
            match args.get(0) {
                Some(iterable) => Ok(Value::list(collect(ctx, iterable)?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        BuiltinKind::Dict => construct_dict(ctx, args),
        BuiltinKind::Set | BuiltinKind::FrozenSet => {
            let name = if kind == BuiltinKind::Set { "set" } else { "frozenset" };
            args.check(name, 0, 1)?;
            let set = match args.get(0) {
                Some(iterable) => PySet::from_values(collect(ctx, iterable)?)?,
                None => PySet::new(),
            };
            Ok(if kind == BuiltinKind::Set {
                Value::Set(Arc::new(set))
            } else {
                Value::FrozenSet(Arc::new(set))
            })
        }
        BuiltinKind::Range => {
            args.check("range", 1, 3)?;
            let bounds = args
                .positional
                .iter()
                .map(|value| ops::expect_index(ctx, value))
                .collect::<RunResult<Vec<_>>>()?;
            let range = match bounds[..] {
                [stop] => PyRange::new(0, stop, 1)?,
                [start, stop] => PyRange::new(start, stop, 1)?,
                [start, stop, step] => PyRange::new(start, stop, step)?,
                _ => return Err(RunError::type_error("range expected at most 3 arguments")),
            };
            Ok(Value::Range(Arc::new(range)))
        }
        BuiltinKind::Slice => {
            args.check("slice", 1, 3)?;
            let slice = match &args.positional[..] {
                [stop] => PySlice {
                    start: Value::None,
                    stop: stop.clone(),
                    step: Value::None,
                },
                [start, stop] => PySlice {
                    start: start.clone(),
                    stop: stop.clone(),
                    step: Value::None,
                },
                [start, stop, step, ..] => PySlice {
                    start: start.clone(),
                    stop: stop.clone(),
                    step: step.clone(),
                },
                [] => return Err(RunError::type_error("slice expected at least 1 argument, got 0")),
            };
            Ok(Value::Slice(Arc::new(slice)))
        }
        BuiltinKind::Property => {
            let [fget, fset, fdel, doc] = keyword_only(&mut args, "property", ["fget", "fset", "fdel", "doc"])?;
            args.check("property", 0, 4)?;
            let pick = |index: usize, keyword: Option<Value>| {
                args.get(index).cloned().or(keyword).filter(|value| !value.is_none())
            };
            Ok(Value::Property(Arc::new(Property {
                fget: pick(0, fget),
                fset: pick(1, fset),
                fdel: pick(2, fdel),
                doc: pick(3, doc),
            })))
        }
        BuiltinKind::ClassMethod => {
            args.check("classmethod", 1, 1)?;
            Ok(Value::ClassMethod(Arc::new(args.positional[0].clone())))
        }
        BuiltinKind::StaticMethod => {
            args.check("staticmethod", 1, 1)?;
            Ok(Value::StaticMethod(Arc::new(args.positional[0].clone())))
        }
        BuiltinKind::Super => {
            args.check("super", 0, 2)?;
            match &args.positional[..] {
                [class, obj] => make_super(class, obj.clone()),
                [_] => Err(RunError::type_error("unbound super objects are not supported")),
                _ => Err(RunError::new(ExcType::RuntimeError, "super(): no arguments")),
            }
        }
        other => {
            let name: &'static str = other.into();
            Err(RunError::type_error(format!("cannot create '{name}' instances")))
        }
    }
}

/// `type(obj)` or `type(name, bases, dict)`.
fn construct_type(args: &CallArgs) -> RunResult<Value> {
    args.no_keywords("type")?;
    match &args.positional[..] {
        [obj] => Ok(Value::Type(type_of(obj))),
        [Value::Str(name), Value::Tuple(bases), Value::Dict(namespace)] => {
            let bases = bases
                .iter()
                .map(|base| match base {
                    Value::Type(ty) => Ok(Arc::clone(ty)),
                    other => Err(RunError::type_error(format!(
                        "type() bases must be types, not {}",
                        other.type_name()
                    ))),
                })
                .collect::<RunResult<Vec<Arc<PyType>>>>()?;
            let mut entries = IndexMap::new();
            for (key, value) in namespace.items() {
                let Value::Str(key) = key else {
                    return Err(RunError::type_error("type() namespace keys must be strings"));
                };
                entries.insert(key, value);
            }
            let module = match entries.get("__module__") {
                Some(Value::Str(module)) => Arc::clone(module),
                _ => Arc::from("__main__"),
            };
            let class = PyType::new_class(Arc::clone(name), Arc::clone(name), module, bases, entries)?;
            Ok(Value::Type(class))
        }
        [_, _, _] => Err(RunError::type_error("type() argument 1 must be str, bases a tuple and dict a dict")),
        _ => Err(RunError::type_error("type() takes 1 or 3 arguments")),
    }
}

/// `int(x=0)` or `int(text, base=10)`.
fn construct_int(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let [base_kw] = keyword_only(&mut args, "int", ["base"])?;
    args.check("int", 0, 2)?;
    let base = args.get(1).cloned().or(base_kw);
    let Some(value) = args.get(0) else {
        if base.is_some() {
            return Err(RunError::type_error("int() missing string argument"));
        }
        return Ok(Value::Int(0));
    };
    let text = match value {
        Value::Str(text) => Arc::clone(text),
        Value::Bytes(bytes) if base.is_some() => Arc::from(String::from_utf8_lossy(bytes).as_ref()),
        _ if base.is_some() => {
            return Err(RunError::type_error("int() can't convert non-string with explicit base"));
        }
        other => return to_int(ctx, other),
    };
    let base = match base {
        Some(base) => {
            let base = ops::expect_index(ctx, &base)?;
            if base != 0 && !(2..=36).contains(&base) {
                return Err(RunError::value_error("int() base must be >= 2 and <= 36, or 0"));
            }
            u32::try_from(base).unwrap_or(10)
        }
        None => 10,
    };
    parse_int(&text, base).map(Value::from_bigint).ok_or_else(|| {
        RunError::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            str_repr(&text)
        ))
    })
}

/// Parses an integer literal the way `int(text, base)` does. Base 0 reads the prefix.
pub(crate) fn parse_int(text: &str, base: u32) -> Option<BigInt> {
    let trimmed = text.trim();
    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = unsigned.to_ascii_lowercase();
    let prefixed = |p: &str| lower.starts_with(p).then(|| &unsigned[2..]);
    let (radix, digits) = match base {
        0 => match lower.get(..2) {
            Some("0x") => (16, &unsigned[2..]),
            Some("0o") => (8, &unsigned[2..]),
            Some("0b") => (2, &unsigned[2..]),
            _ => {
                // Base 0 rejects leading zeros on non-zero decimals.
                let body = unsigned.trim_start_matches(['0', '_']);
                if unsigned.starts_with('0') && !body.is_empty() {
                    return None;
                }
                (10, unsigned)
            }
        },
        16 => (16, prefixed("0x").unwrap_or(unsigned)),
        8 => (8, prefixed("0o").unwrap_or(unsigned)),
        2 => (2, prefixed("0b").unwrap_or(unsigned)),
        other => (other, unsigned),
    };
    let digits = digits.strip_prefix('_').filter(|_| digits.len() != unsigned.len()).unwrap_or(digits);
    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__") {
        return None;
    }
    let clean: String = digits.chars().filter(|c| *c != '_').collect();
    let magnitude = BigInt::from_str_radix(&clean, radix).ok()?;
    if clean.starts_with(['+', '-']) {
        return None;
    }
    Some(if negative { -magnitude } else { magnitude })
}

/// `float(x)`.
fn to_float(ctx: &mut ExecCtx, value: &Value) -> RunResult<f64> {
    match value {
        Value::Str(text) => parse_float(text).ok_or_else(|| {
            RunError::value_error(format!("could not convert string to float: {}", str_repr(text)))
        }),
        Value::Instance(_) => match call_special(ctx, value, "__float__", CallArgs::new())? {
            Some(Value::Float(f)) => Ok(f),
            Some(other) => Err(RunError::type_error(format!(
                "{}.__float__ returned non-float (type {})",
                value.type_name(),
                other.type_name()
            ))),
            None => match ops::as_index(ctx, value)? {
                Some(i) => Ok(i as f64),
                None => Err(float_argument(value)),
            },
        },
        Value::Float(_) | Value::Int(_) | Value::Bool(_) | Value::BigInt(_) => to_f64(value),
        other => Err(float_argument(other)),
    }
}

fn float_argument(value: &Value) -> RunError {
    RunError::type_error(format!(
        "float() argument must be a string or a real number, not '{}'",
        value.type_name()
    ))
}

pub(crate) fn parse_float(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.starts_with('_') || trimmed.ends_with('_') || trimmed.contains("__") {
        return None;
    }
    let clean: String = trimmed.chars().filter(|c| *c != '_').collect();
    let unsigned = clean.trim_start_matches(['+', '-']);
    let lower = unsigned.to_ascii_lowercase();
    if matches!(lower.as_str(), "inf" | "infinity" | "nan") {
        let value = if lower == "nan" { f64::NAN } else { f64::INFINITY };
        return Some(if clean.starts_with('-') { -value } else { value });
    }
    if !unsigned.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
        return None;
    }
    clean.parse().ok()
}

/// `str(obj)` or `str(bytes, encoding)`.
fn construct_str(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let [encoding, errors] = keyword_only(&mut args, "str", ["encoding", "errors"])?;
    args.check("str", 0, 3)?;
    let encoding = args.get(1).cloned().or(encoding);
    match args.get(0) {
        None => Ok(Value::str("")),
        Some(Value::Bytes(bytes)) if encoding.is_some() || errors.is_some() => decode(bytes, encoding.as_ref()),
        Some(_) if encoding.is_some() => Err(RunError::type_error("decoding to str: need a bytes-like object")),
        Some(value) => format::str(ctx, value).map(Value::from),
    }
}

/// UTF-8 (or ASCII) decoding for `str(b, enc)` and `bytes.decode`.
pub(crate) fn decode(bytes: &[u8], encoding: Option<&Value>) -> RunResult<Value> {
    let name = match encoding {
        None => "utf-8".to_owned(),
        Some(Value::Str(name)) => name.to_ascii_lowercase().replace('_', "-"),
        Some(other) => {
            return Err(RunError::type_error(format!(
                "decode() argument 'encoding' must be str, not {}",
                other.type_name()
            )));
        }
    };
    match name.as_str() {
        "utf-8" | "utf8" => std::str::from_utf8(bytes)
            .map(Value::from)
            .map_err(|err| RunError::value_error(format!("'utf-8' codec can't decode bytes: {err}"))),
        "ascii" => match bytes.iter().position(|b| !b.is_ascii()) {
            Some(pos) => Err(RunError::value_error(format!(
                "'ascii' codec can't decode byte {:#04x} in position {pos}: ordinal not in range(128)",
                bytes[pos]
            ))),
            None => Ok(Value::from(String::from_utf8_lossy(bytes).into_owned())),
        },
        "latin-1" | "latin1" | "iso-8859-1" => Ok(Value::from(bytes.iter().map(|b| char::from(*b)).collect::<String>())),
        _ => Err(RunError::new(ExcType::LookupError, format!("unknown encoding: {name}"))),
    }
}

/// `bytes()`, `bytes(n)`, `bytes(text, encoding)` or `bytes(iterable_of_ints)`.
fn construct_bytes(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let [encoding] = keyword_only(&mut args, "bytes", ["encoding"])?;
    args.check("bytes", 0, 2)?;
    let encoding = args.get(1).cloned().or(encoding);
    let bytes: Vec<u8> = match args.get(0) {
        None => Vec::new(),
        Some(Value::Str(text)) => match encoding {
            Some(_) => text.as_bytes().to_vec(),
            None => return Err(RunError::type_error("string argument without an encoding")),
        },
        Some(Value::Bytes(bytes)) => bytes.to_vec(),
        Some(Value::Int(n)) => {
            let n = usize::try_from(*n).map_err(|_| RunError::value_error("negative count"))?;
            vec![0; n]
        }
        Some(iterable) => collect(ctx, iterable)?
            .iter()
            .map(|item| {
                item.as_i64()
                    .and_then(|i| u8::try_from(i).ok())
                    .ok_or_else(|| RunError::value_error("bytes must be in range(0, 256)"))
            })
            .collect::<RunResult<_>>()?,
    };
    Ok(Value::Bytes(bytes.into()))
}

/// `dict(mapping_or_pairs, **kwargs)`.
fn construct_dict(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    if args.positional.len() > 1 {
        return Err(RunError::type_error(format!(
            "dict expected at most 1 argument, got {}",
            args.positional.len()
        )));
    }
    let dict = PyDict::new();
    if let Some(source) = args.get(0) {
        fill_dict(ctx, &dict, source)?;
    }
    for (key, value) in args.keywords {
        dict.set(Value::Str(key), value)?;
    }
    Ok(Value::Dict(Arc::new(dict)))
}

/// Adds a mapping or an iterable of pairs to `dict`, as `dict(x)` and `dict.update(x)` do.
pub(crate) fn fill_dict(ctx: &mut ExecCtx, dict: &PyDict, source: &Value) -> RunResult<()> {
    let is_mapping = match source {
        Value::Dict(_) => true,
        Value::Instance(_) => ops::attr::get_attr_opt(ctx, source, "keys")?.is_some(),
        _ => false,
    };
    if is_mapping {
        return merge_mapping(ctx, dict, source);
    }
    for (index, item) in collect(ctx, source)?.into_iter().enumerate() {
        let pair = collect(ctx, &item).map_err(|_| {
            RunError::type_error(format!(
                "cannot convert dictionary update sequence element #{index} to a sequence"
            ))
        })?;
        let [key, value] = <[Value; 2]>::try_from(pair).map_err(|pair| {
            RunError::value_error(format!(
                "dictionary update sequence element #{index} has length {}; 2 is required",
                pair.len()
            ))
        })?;
        dict.set(key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn int_literals_follow_base_rules() {
        assert_eq!(parse_int(" -42 ", 10), Some(BigInt::from(-42)));
        assert_eq!(parse_int("1_000", 10), Some(BigInt::from(1000)));
        assert_eq!(parse_int("0x1F", 0), Some(BigInt::from(31)));
        assert_eq!(parse_int("ff", 16), Some(BigInt::from(255)));
        assert_eq!(parse_int("0b101", 2), Some(BigInt::from(5)));
        assert_eq!(parse_int("z", 36), Some(BigInt::from(35)));
        assert_eq!(parse_int("010", 0), None);
        assert_eq!(parse_int("1__0", 10), None);
        assert_eq!(parse_int("", 10), None);
        assert_eq!(parse_int("12a", 10), None);
        assert_eq!(parse_int("--1", 10), None);
    }

    #[test]
    fn float_literals_accept_specials() {
        assert_eq!(parse_float(" 1.5 "), Some(1.5));
        assert_eq!(parse_float("-inf"), Some(f64::NEG_INFINITY));
        assert!(parse_float("nan").is_some_and(f64::is_nan));
        assert_eq!(parse_float("1_0.5"), Some(10.5));
        assert_eq!(parse_float("abc"), None);
        assert_eq!(parse_float("0x10"), None);
    }

    #[test]
    fn decode_reports_unknown_encodings() {
        let value = decode(b"hi", Some(&Value::str("ASCII"))).unwrap();
        assert_eq!(value.as_str(), Some("hi"));
        let err = decode(b"hi", Some(&Value::str("rot13"))).unwrap_err();
        assert!(err.matches(ExcType::LookupError));
    }
}
