//! `repr()`, `str()`, format specs and printf-style `%` formatting.
//!
//! Rendering comes in two flavours. [`plain_repr`] and [`plain_str`] never run user code and
//! are used for diagnostics and `Debug` output; [`repr`] and [`str`] dispatch to
//! user-defined `__repr__`/`__str__` through the execution context.

use std::{fmt::Write as _, sync::Arc};

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    interp::ExecCtx,
    ops::{attr::user_special, call::call_method},
    types::{CallArgs, Instance, PyType, TypeKind},
    value::Value,
};

type Hook<'a> = dyn FnMut(&Value, &str) -> Option<RunResult<String>> + 'a;

/// `repr(value)` without running user code.
#[must_use]
pub fn plain_repr(value: &Value) -> String {
    let mut seen = Vec::new();
    render(value, &mut seen, &mut |_, _| None).unwrap_or_else(|err| format!("<repr failed: {err}>"))
}

/// `str(value)` without running user code.
#[must_use]
pub fn plain_str(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        Value::Instance(inst) if inst.exc.is_some() => exception_message(inst, &mut |v| plain_repr(v), &mut |v| plain_str(v)),
        _ => plain_repr(value),
    }
}

/// `repr(value)`.
pub fn repr(ctx: &mut ExecCtx, value: &Value) -> RunResult<String> {
    let mut seen = Vec::new();
    render(value, &mut seen, &mut |v, dunder| user_render(ctx, v, dunder))
}

/// `str(value)`.
pub fn str(ctx: &mut ExecCtx, value: &Value) -> RunResult<String> {
    match value {
        Value::Str(s) => Ok(s.to_string()),
        Value::Instance(inst) => {
            if let Some(result) = user_render(ctx, value, "__str__") {
                return result;
            }
            if inst.exc.is_some() {
                return exception_str(ctx, inst);
            }
            repr(ctx, value)
        }
        _ => repr(ctx, value),
    }
}

/// `BaseException.__str__`: the message built from `args`.
pub fn exception_str(ctx: &mut ExecCtx, inst: &Instance) -> RunResult<String> {
    let args = exception_args(inst);
    match &*args {
        [] => Ok(String::new()),
        [single] if is_key_error(inst) => repr(ctx, single),
        [single] => str(ctx, single),
        many => repr(ctx, &Value::Tuple(Arc::from(many))),
    }
}

/// `object.__repr__`: the builtin rendering of `value` itself, with user hooks for anything nested.
pub fn base_repr(ctx: &mut ExecCtx, value: &Value) -> RunResult<String> {
    let mut seen = Vec::new();
    let mut top = true;
    render(value, &mut seen, &mut |v, dunder| {
        if std::mem::take(&mut top) {
            None
        } else {
            user_render(ctx, v, dunder)
        }
    })
}

fn user_render(ctx: &mut ExecCtx, value: &Value, dunder: &str) -> Option<RunResult<String>> {
    let method = user_special(value, dunder)?;
    Some(call_method(ctx, &method, value, CallArgs::new()).and_then(|result| match result {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(RunError::type_error(format!(
            "{dunder} returned non-string (type {})",
            other.type_name()
        ))),
    }))
}

fn exception_args(inst: &Instance) -> Arc<[Value]> {
    inst.exc
        .as_ref()
        .map_or_else(|| Arc::from(Vec::new()), |state| Arc::clone(&state.lock().args))
}

fn is_key_error(inst: &Instance) -> bool {
    inst.class.is_subclass(crate::types::exc_class(ExcType::KeyError))
}

fn exception_message(
    inst: &Instance,
    repr_fn: &mut dyn FnMut(&Value) -> String,
    str_fn: &mut dyn FnMut(&Value) -> String,
) -> String {
    let args = exception_args(inst);
    match &*args {
        [] => String::new(),
        [single] if is_key_error(inst) => repr_fn(single),
        [single] => str_fn(single),
        many => repr_fn(&Value::Tuple(Arc::from(many))),
    }
}

/// Renders `value` as `repr` does. `hook` may override any value (user `__repr__`).
fn render(value: &Value, seen: &mut Vec<usize>, hook: &mut Hook<'_>) -> RunResult<String> {
    if let Some(result) = hook(value, "__repr__") {
        return result;
    }
    Ok(match value {
        Value::None => "None".to_owned(),
        Value::NotImplemented => "NotImplemented".to_owned(),
        Value::Ellipsis => "Ellipsis".to_owned(),
        Value::Bool(true) => "True".to_owned(),
        Value::Bool(false) => "False".to_owned(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(b) => b.to_string(),
        Value::Float(f) => float_repr(*f),
        Value::Str(s) => str_repr(s),
        Value::Bytes(b) => bytes_repr(b),
        Value::Tuple(items) => {
            if items.len() == 1 {
                format!("({},)", render(&items[0], seen, hook)?)
            } else {
                render_seq(value, items, "(", ")", seen, hook)?
            }
        }
        Value::List(list) => {
            let items = list.snapshot();
            render_seq(value, &items, "[", "]", seen, hook)?
        }
        Value::Dict(dict) => {
            let id = value.id();
            if seen.contains(&id) {
                return Ok("{...}".to_owned());
            }
            seen.push(id);
            let mut out = String::from("{");
            for (i, (k, v)) in dict.items().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&render(k, seen, hook)?);
                out.push_str(": ");
                out.push_str(&render(v, seen, hook)?);
            }
            seen.pop();
            out.push('}');
            out
        }
        Value::Set(set) => {
            if set.is_empty() {
                "set()".to_owned()
            } else {
                render_seq(value, &set.values(), "{", "}", seen, hook)?
            }
        }
        Value::FrozenSet(set) => {
            if set.is_empty() {
                "frozenset()".to_owned()
            } else {
                format!("frozenset({})", render_seq(value, &set.values(), "{", "}", seen, hook)?)
            }
        }
        Value::Range(range) => {
            if range.step == 1 {
                format!("range({}, {})", range.start, range.stop)
            } else {
                format!("range({}, {}, {})", range.start, range.stop, range.step)
            }
        }
        Value::Slice(slice) => format!(
            "slice({}, {}, {})",
            render(&slice.start, seen, hook)?,
            render(&slice.stop, seen, hook)?,
            render(&slice.step, seen, hook)?
        ),
        Value::Function(func) => format!("<function {} at {:#x}>", func.code.qualname, value.id()),
        Value::Builtin(builtin) => format!("<built-in function {}>", builtin.name),
        Value::BoundMethod(method) => {
            let name = match &method.func {
                Value::Function(func) => func.code.qualname.to_string(),
                Value::Builtin(builtin) => builtin.name.to_owned(),
                other => render(other, seen, hook)?,
            };
            format!("<bound method {name} of {}>", render(&method.receiver, seen, hook)?)
        }
        Value::Type(ty) => format!("<class '{}'>", qualified_name(ty)),
        Value::Module(module) => format!("<module '{}'>", module.name),
        Value::Generator(generator) => {
            let kind = if generator.is_coroutine { "coroutine" } else { "generator" };
            format!("<{kind} object {} at {:#x}>", generator.code.qualname, value.id())
        }
        Value::Iterator(_) => format!("<iterator object at {:#x}>", value.id()),
        Value::Property(_) => format!("<property object at {:#x}>", value.id()),
        Value::ClassMethod(_) => format!("<classmethod object at {:#x}>", value.id()),
        Value::StaticMethod(_) => format!("<staticmethod object at {:#x}>", value.id()),
        Value::Super(sup) => format!(
            "<super: <class '{}'>, <{} object>>",
            sup.this_class.name, sup.obj_type.name
        ),
        Value::Instance(inst) => {
            if inst.exc.is_some() {
                let args = exception_args(inst);
                let mut out = format!("{}(", inst.class.name);
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&render(arg, seen, hook)?);
                }
                out.push(')');
                out
            } else {
                format!("<{} object at {:#x}>", qualified_name(&inst.class), value.id())
            }
        }
    })
}

fn render_seq(
    container: &Value,
    items: &[Value],
    open: &str,
    close: &str,
    seen: &mut Vec<usize>,
    hook: &mut Hook<'_>,
) -> RunResult<String> {
    let id = container.id();
    if seen.contains(&id) {
        return Ok(format!("{open}...{close}"));
    }
    seen.push(id);
    let mut out = String::from(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match render(item, seen, hook) {
            Ok(text) => out.push_str(&text),
            Err(err) => {
                seen.pop();
                return Err(err);
            }
        }
    }
    seen.pop();
    out.push_str(close);
    Ok(out)
}

/// `module.qualname`, omitting the module for builtins.
#[must_use]
pub fn qualified_name(ty: &PyType) -> String {
    if ty.kind == TypeKind::User && &*ty.module != "builtins" {
        format!("{}.{}", ty.module, ty.qualname)
    } else {
        ty.qualname.to_string()
    }
}

/// Shortest round-tripping float text, switching to exponent notation outside `1e-4..1e16`.
#[must_use]
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_owned();
    }
    let sci = format!("{f:e}");
    let (mantissa, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if mantissa.starts_with('-') { "-" } else { "" };
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    if !(-4..16).contains(&exp) {
        let (first, rest) = digits.split_at(1);
        let frac = if rest.is_empty() { String::new() } else { format!(".{rest}") };
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{sign}{first}{frac}e{exp_sign}{:02}", exp.abs())
    } else if exp < 0 {
        format!("{sign}0.{}{digits}", "0".repeat((-exp - 1) as usize))
    } else {
        let point = exp as usize + 1;
        if digits.len() <= point {
            format!("{sign}{digits}{}.0", "0".repeat(point - digits.len()))
        } else {
            format!("{sign}{}.{}", &digits[..point], &digits[point..])
        }
    }
}

/// Quotes a string the way `repr` does.
#[must_use]
pub fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[must_use]
pub fn bytes_repr(bytes: &[u8]) -> String {
    let quote = if bytes.contains(&b'\'') && !bytes.contains(&b'"') { b'"' } else { b'\'' };
    let mut out = String::from("b");
    out.push(quote as char);
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b if b == quote => {
                out.push('\\');
                out.push(b as char);
            }
            0x20..=0x7e => out.push(b as char),
            b => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push(quote as char);
    out
}

/// A parsed format specification: `[[fill]align][sign][#][0][width][,|_][.precision][type]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FormatSpec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alternate: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    ty: Option<char>,
}

fn parse_spec(spec: &str) -> RunResult<FormatSpec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut out = FormatSpec::default();
    let mut i = 0;
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i)
        && matches!(c, '+' | '-' | ' ')
    {
        out.sign = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        out.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(char::is_ascii_digit) {
        i += 1;
    }
    if i > start {
        out.width = chars[start..i].iter().collect::<String>().parse().unwrap_or(0);
    }
    if let Some(&c) = chars.get(i)
        && matches!(c, ',' | '_')
    {
        out.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
        if i == start {
            return Err(RunError::value_error("Format specifier missing precision"));
        }
        out.precision = chars[start..i].iter().collect::<String>().parse().ok();
    }
    if let Some(&c) = chars.get(i) {
        out.ty = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(RunError::value_error("Invalid format specifier"));
    }
    Ok(out)
}

/// `format(value, spec)`, also used by f-string fields.
pub fn format_value(ctx: &mut ExecCtx, value: &Value, spec: &str) -> RunResult<String> {
    if let Some(method) = user_special(value, "__format__") {
        return match call_method(ctx, &method, value, CallArgs::positional([Value::str(spec)]))? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(RunError::type_error(format!(
                "__format__ must return a str, not {}",
                other.type_name()
            ))),
        };
    }
    if spec.is_empty() {
        return str(ctx, value);
    }
    let parsed = parse_spec(spec)?;
    match value {
        Value::Bool(_) | Value::Int(_) | Value::BigInt(_) if parsed.ty.is_none_or(|t| "dnxXobc".contains(t)) => {
            if matches!(value, Value::Bool(_)) && parsed.ty.is_none() {
                return Ok(pad(&plain_str(value), &parsed, '<'));
            }
            format_int(value, &parsed)
        }
        Value::Bool(_) | Value::Int(_) | Value::BigInt(_) | Value::Float(_) => {
            let f = match value {
                Value::Float(f) => *f,
                other => crate::ops::arith::to_f64(other)?,
            };
            format_float(f, &parsed)
        }
        Value::Str(s) => {
            if parsed.ty.is_some_and(|t| t != 's') {
                return Err(RunError::value_error(format!(
                    "Unknown format code '{}' for object of type 'str'",
                    parsed.ty.unwrap_or('s')
                )));
            }
            let text: String = match parsed.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.to_string(),
            };
            Ok(pad(&text, &parsed, '<'))
        }
        _ => Err(RunError::type_error(format!(
            "unsupported format string passed to {}.__format__",
            value.type_name()
        ))),
    }
}

fn pad(text: &str, spec: &FormatSpec, default_align: char) -> String {
    let len = text.chars().count();
    if len >= spec.width {
        return text.to_owned();
    }
    let fill = spec.fill.unwrap_or(if spec.zero { '0' } else { ' ' });
    let align = spec.align.unwrap_or(if spec.zero { '=' } else { default_align });
    let missing = spec.width - len;
    let fill_str = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
    match align {
        '<' => format!("{text}{}", fill_str(missing)),
        '^' => format!("{}{text}{}", fill_str(missing / 2), fill_str(missing - missing / 2)),
        '=' => {
            let sign_len = text
                .chars()
                .take_while(|c| matches!(c, '+' | '-' | ' '))
                .count();
            let prefix_len = if text[sign_len..].starts_with("0x")
                || text[sign_len..].starts_with("0o")
                || text[sign_len..].starts_with("0b")
                || text[sign_len..].starts_with("0X")
            {
                sign_len + 2
            } else {
                sign_len
            };
            format!("{}{}{}", &text[..prefix_len], fill_str(missing), &text[prefix_len..])
        }
        _ => format!("{}{text}", fill_str(missing)),
    }
}

fn group_digits(digits: &str, sep: char, every: usize) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / every);
    let first = digits.len() % every;
    for (i, c) in digits.chars().enumerate() {
        if i != 0 && (i + every - first) % every == 0 {
            out.push(sep);
        }
        out.push(c);
    }
    out
}

fn sign_prefix(negative: bool, sign: Option<char>) -> &'static str {
    match (negative, sign) {
        (true, _) => "-",
        (false, Some('+')) => "+",
        (false, Some(' ')) => " ",
        _ => "",
    }
}

fn format_int(value: &Value, spec: &FormatSpec) -> RunResult<String> {
    let big = value.as_bigint().unwrap_or_default();
    let negative = big.sign() == num_bigint::Sign::Minus;
    let magnitude = big.magnitude();
    let (digits, prefix) = match spec.ty {
        Some('x') => (magnitude.to_str_radix(16), "0x"),
        Some('X') => (magnitude.to_str_radix(16).to_uppercase(), "0X"),
        Some('o') => (magnitude.to_str_radix(8), "0o"),
        Some('b') => (magnitude.to_str_radix(2), "0b"),
        Some('c') => {
            let code = value.as_i64().and_then(|i| u32::try_from(i).ok()).and_then(char::from_u32);
            let Some(c) = code else {
                return Err(RunError::new(ExcType::OverflowError, "%c arg not in range(0x110000)"));
            };
            return Ok(pad(&c.to_string(), spec, '<'));
        }
        _ => (magnitude.to_str_radix(10), ""),
    };
    let digits = match spec.grouping {
        Some(sep) if spec.ty.is_none_or(|t| t == 'd' || t == 'n') => group_digits(&digits, sep, 3),
        Some('_') => group_digits(&digits, '_', 4),
        _ => digits,
    };
    let prefix = if spec.alternate { prefix } else { "" };
    let text = format!("{}{prefix}{digits}", sign_prefix(negative, spec.sign));
    Ok(pad(&text, spec, '>'))
}

fn format_float(f: f64, spec: &FormatSpec) -> RunResult<String> {
    let negative = f.is_sign_negative() && !f.is_nan();
    let abs = f.abs();
    let body = if abs.is_infinite() {
        if spec.ty.is_some_and(char::is_uppercase) { "INF" } else { "inf" }.to_owned()
    } else if abs.is_nan() {
        if spec.ty.is_some_and(char::is_uppercase) { "NAN" } else { "nan" }.to_owned()
    } else {
        match spec.ty {
            Some('f' | 'F') => format!("{abs:.*}", spec.precision.unwrap_or(6)),
            Some('e' | 'E') => {
                let text = exp_notation(abs, spec.precision.unwrap_or(6));
                if spec.ty == Some('E') { text.to_uppercase() } else { text }
            }
            Some('%') => format!("{:.*}%", spec.precision.unwrap_or(6), abs * 100.0),
            Some('g' | 'G') => {
                let text = general(abs, spec.precision.unwrap_or(6), spec.alternate);
                if spec.ty == Some('G') { text.to_uppercase() } else { text }
            }
            None => match spec.precision {
                Some(p) => general(abs, p, spec.alternate),
                None => float_repr(abs),
            },
            Some(other) => {
                return Err(RunError::value_error(format!(
                    "Unknown format code '{other}' for object of type 'float'"
                )));
            }
        }
    };
    let body = match spec.grouping {
        Some(sep) => {
            let (int_part, rest) = body.find(['.', 'e', '%']).map_or((body.as_str(), ""), |i| body.split_at(i));
            if int_part.chars().all(|c| c.is_ascii_digit()) {
                format!("{}{rest}", group_digits(int_part, sep, 3))
            } else {
                body.clone()
            }
        }
        None => body,
    };
    let text = format!("{}{body}", sign_prefix(negative, spec.sign));
    Ok(pad(&text, spec, '>'))
}

/// `d.ddde+XX` with at least two exponent digits.
fn exp_notation(abs: f64, precision: usize) -> String {
    let text = format!("{abs:.precision$e}");
    let (mantissa, exp) = text.split_once('e').unwrap_or((&text, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let exp_sign = if exp < 0 { '-' } else { '+' };
    format!("{mantissa}e{exp_sign}{:02}", exp.abs())
}

/// The `g` presentation type.
fn general(abs: f64, precision: usize, keep_zeros: bool) -> String {
    let precision = precision.max(1);
    if abs == 0.0 {
        return if keep_zeros {
            format!("{:.*}", precision - 1, 0.0)
        } else {
            "0".to_owned()
        };
    }
    let rounded = format!("{abs:.*e}", precision - 1);
    let exp: i32 = rounded.split_once('e').and_then(|(_, e)| e.parse().ok()).unwrap_or(0);
    let precision_i = i32::try_from(precision).unwrap_or(i32::MAX);
    let text = if (-4..precision_i).contains(&exp) {
        let decimals = usize::try_from(precision_i - 1 - exp).unwrap_or(0);
        format!("{abs:.decimals$}")
    } else {
        exp_notation(abs, precision - 1)
    };
    if keep_zeros {
        return text;
    }
    match text.split_once('e') {
        Some((mantissa, exp)) => format!("{}e{exp}", strip_zeros(mantissa)),
        None => strip_zeros(&text).to_owned(),
    }
}

fn strip_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// printf-style `format % args`.
pub fn percent_format(ctx: &mut ExecCtx, format: &str, args: &Value) -> RunResult<String> {
    let (positional, mapping): (Vec<Value>, Option<&Value>) = match args {
        Value::Tuple(items) => (items.to_vec(), None),
        Value::Dict(_) => (vec![args.clone()], Some(args)),
        other => (vec![other.clone()], None),
    };
    let mut next = 0usize;
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut key = None;
        if chars.peek() == Some(&'(') {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == ')' {
                    break;
                }
                name.push(c);
            }
            key = Some(name);
        }
        let mut spec = String::new();
        while let Some(&c) = chars.peek() {
            if "-+ #0123456789.".contains(c) {
                spec.push(c);
                chars.next();
            } else {
                break;
            }
        }
        let Some(conversion) = chars.next() else {
            return Err(RunError::value_error("incomplete format"));
        };
        if conversion == '%' {
            out.push('%');
            continue;
        }
        let arg = match (&key, mapping) {
            (Some(name), Some(map)) => crate::ops::item::get_item(ctx, map, &Value::str(name))?,
            (Some(_), None) => return Err(RunError::type_error("format requires a mapping")),
            (None, _) => {
                let Some(arg) = positional.get(next).cloned() else {
                    return Err(RunError::type_error("not enough arguments for format string"));
                };
                next += 1;
                arg
            }
        };
        let flag_len = spec.chars().take_while(|c| "-+ #0".contains(*c)).count();
        let (flags, rest) = spec.split_at(flag_len);
        let mut converted = String::new();
        if flags.contains('-') {
            converted.push('<');
        }
        if flags.contains('+') {
            converted.push('+');
        } else if flags.contains(' ') {
            converted.push(' ');
        }
        if flags.contains('#') {
            converted.push('#');
        }
        if flags.contains('0') && !flags.contains('-') {
            converted.push('0');
        }
        converted.push_str(rest);
        let text = match conversion {
            's' => pad(&str(ctx, &arg)?, &parse_spec(&converted)?, '>'),
            'r' | 'a' => pad(&repr(ctx, &arg)?, &parse_spec(&converted)?, '>'),
            'd' | 'i' | 'u' => {
                let int = crate::ops::arith::to_int(ctx, &arg)?;
                format_value(ctx, &int, &format!("{converted}d"))?
            }
            'x' | 'X' | 'o' | 'c' | 'e' | 'E' | 'f' | 'F' | 'g' | 'G' => {
                format_value(ctx, &arg, &format!("{converted}{conversion}"))?
            }
            other => {
                return Err(RunError::value_error(format!(
                    "unsupported format character '{other}' ({:#x})",
                    other as u32
                )));
            }
        };
        out.push_str(&text);
    }
    if mapping.is_none() && next < positional.len() {
        return Err(RunError::type_error("not all arguments converted during string formatting"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn floats_use_shortest_repr() {
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(123.456), "123.456");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(0.0001), "0.0001");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn strings_pick_quotes() {
        assert_eq!(str_repr("abc"), "'abc'");
        assert_eq!(str_repr("it's"), "\"it's\"");
        assert_eq!(str_repr("a\nb"), "'a\\nb'");
        assert_eq!(bytes_repr(b"hi\x00"), "b'hi\\x00'");
    }

    #[test]
    fn containers_render_recursively() {
        let list = Value::list(vec![Value::Int(1), Value::str("x"), Value::tuple(vec![Value::Float(2.0)])]);
        assert_eq!(plain_repr(&list), "[1, 'x', (2.0,)]");
        if let Value::List(inner) = &list {
            inner.push(list.clone());
        }
        assert_eq!(plain_repr(&list), "[1, 'x', (2.0,), [...]]");
    }

    #[test]
    fn spec_parsing() {
        let spec = parse_spec("*^+#010,.3f").unwrap();
        assert_eq!(spec.fill, Some('*'));
        assert_eq!(spec.align, Some('^'));
        assert_eq!(spec.sign, Some('+'));
        assert!(spec.alternate && spec.zero);
        assert_eq!(spec.width, 10);
        assert_eq!(spec.grouping, Some(','));
        assert_eq!(spec.precision, Some(3));
        assert_eq!(spec.ty, Some('f'));
    }

    #[test]
    fn numeric_presentation() {
        let spec = |s: &str| parse_spec(s).unwrap();
        assert_eq!(format_int(&Value::Int(255), &spec("#x")).unwrap(), "0xff");
        assert_eq!(format_int(&Value::Int(-42), &spec("06d")).unwrap(), "-00042");
        assert_eq!(format_int(&Value::Int(1_234_567), &spec(",")).unwrap(), "1,234,567");
        assert_eq!(format_float(3.14159, &spec(".2f")).unwrap(), "3.14");
        assert_eq!(format_float(1234.5, &spec(".3e")).unwrap(), "1.234e+03");
        assert_eq!(format_float(0.000_012_5, &spec("g")).unwrap(), "1.25e-05");
        assert_eq!(format_float(100_000.0, &spec("g")).unwrap(), "100000");
        assert_eq!(format_float(0.5, &spec(".1%")).unwrap(), "50.0%");
    }
}
