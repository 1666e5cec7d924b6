//! Methods of `str`.
//!
//! Positions taken and returned by these methods count code points, not bytes.

use std::sync::Arc;

use super::{slice_bounds, wrong_receiver};
use crate::{
    builtins::keyword_only,
    exception_private::{ExcType, RunError, RunResult},
    interp::ExecCtx,
    ops::{self, attr::get_attr, compare::truthy, format, item::get_item, iter::collect},
    types::{BuiltinFn, CallArgs},
    value::Value,
};

pub(super) const METHODS: &[(&str, BuiltinFn)] = &[
    ("join", join),
    ("split", split),
    ("rsplit", rsplit),
    ("splitlines", splitlines),
    ("strip", strip),
    ("lstrip", lstrip),
    ("rstrip", rstrip),
    ("upper", upper),
    ("lower", lower),
    ("swapcase", swapcase),
    ("title", title),
    ("capitalize", capitalize),
    ("startswith", startswith),
    ("endswith", endswith),
    ("find", find),
    ("rfind", rfind),
    ("index", index),
    ("rindex", rindex),
    ("count", count),
    ("replace", replace),
    ("removeprefix", removeprefix),
    ("removesuffix", removesuffix),
    ("partition", partition),
    ("rpartition", rpartition),
    ("center", center),
    ("ljust", ljust),
    ("rjust", rjust),
    ("zfill", zfill),
    ("isdigit", isdigit),
    ("isalpha", isalpha),
    ("isalnum", isalnum),
    ("isspace", isspace),
    ("isupper", isupper),
    ("islower", islower),
    ("encode", encode),
    ("format", format_method),
];

fn this(args: &mut CallArgs, method: &str) -> RunResult<Arc<str>> {
    match args.receiver(method)? {
        Value::Str(text) => Ok(text),
        other => Err(wrong_receiver(method, "str", &other)),
    }
}

fn text_arg<'a>(value: &'a Value, method: &str) -> RunResult<&'a str> {
    value.as_str().ok_or_else(|| {
        RunError::type_error(format!(
            "{method}() argument must be str, not {}",
            value.type_name()
        ))
    })
}

/// Byte offset of the code point at `index`, or the end of the string.
fn byte_offset(text: &str, index: usize) -> usize {
    text.char_indices().nth(index).map_or(text.len(), |(offset, _)| offset)
}

/// The `text[start:end]` window selected by optional `start`/`end` arguments, plus its
/// code-point start.
fn slice_window<'a>(ctx: &mut ExecCtx, text: &'a str, start: Option<&Value>, end: Option<&Value>) -> RunResult<Option<(&'a str, usize)>> {
    let (start, end) = slice_bounds(ctx, start, end, text.chars().count())?;
    if start > end {
        return Ok(None);
    }
    Ok(Some((&text[byte_offset(text, start)..byte_offset(text, end)], start)))
}

fn char_index(text: &str, byte: usize) -> usize {
    text[..byte].chars().count()
}

fn join(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let sep = this(&mut args, "join")?;
    args.check("join", 1, 1)?;
    let items = collect(ctx, &args.positional[0])?;
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        let Value::Str(part) = item else {
            return Err(RunError::type_error(format!(
                "sequence item {i}: expected str instance, {} found",
                item.type_name()
            )));
        };
        if i > 0 {
            out.push_str(&sep);
        }
        out.push_str(part);
    }
    Ok(Value::from(out))
}

/// Reads `(sep=None, maxsplit=-1)`. A negative `maxsplit` means no limit.
fn split_args(ctx: &mut ExecCtx, args: &mut CallArgs, method: &str) -> RunResult<(Option<Arc<str>>, Option<usize>)> {
    let [sep_kw, max_kw] = keyword_only(args, method, ["sep", "maxsplit"])?;
    args.check(method, 0, 2)?;
    let sep = match args.get(0).cloned().or(sep_kw) {
        None | Some(Value::None) => None,
        Some(Value::Str(sep)) if sep.is_empty() => return Err(RunError::value_error("empty separator")),
        Some(Value::Str(sep)) => Some(sep),
        Some(other) => {
            return Err(RunError::type_error(format!(
                "must be str or None, not {}",
                other.type_name()
            )));
        }
    };
    let max = match args.get(1).cloned().or(max_kw) {
        Some(value) => usize::try_from(ops::expect_index(ctx, &value)?).ok(),
        None => None,
    };
    Ok((sep, max))
}

fn to_list<'a>(parts: impl IntoIterator<Item = &'a str>) -> Value {
    Value::list(parts.into_iter().map(Value::from).collect())
}

fn split(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "split")?;
    let (sep, max) = split_args(ctx, &mut args, "split")?;
    Ok(match (sep, max) {
        (None, max) => to_list(split_whitespace(&text, max)),
        (Some(sep), Some(max)) => to_list(text.splitn(max + 1, &*sep)),
        (Some(sep), None) => to_list(text.split(&*sep)),
    })
}

fn rsplit(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "rsplit")?;
    let (sep, max) = split_args(ctx, &mut args, "rsplit")?;
    let mut parts: Vec<&str> = match (&sep, max) {
        (None, max) => rsplit_whitespace(&text, max),
        (Some(sep), Some(max)) => text.rsplitn(max + 1, &**sep).collect(),
        (Some(sep), None) => text.rsplit(&**sep).collect(),
    };
    parts.reverse();
    Ok(to_list(parts))
}

/// Whitespace splitting: runs collapse, and the unsplit remainder keeps its trailing space.
fn split_whitespace(text: &str, max: Option<usize>) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        if max.is_some_and(|max| parts.len() >= max) {
            parts.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(rest);
                break;
            }
        }
    }
    parts
}

/// Mirror of [`split_whitespace`]; parts come back last-first.
fn rsplit_whitespace(text: &str, max: Option<usize>) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text.trim_end();
    while !rest.is_empty() {
        if max.is_some_and(|max| parts.len() >= max) {
            parts.push(rest);
            break;
        }
        match rest.rfind(char::is_whitespace) {
            Some(start) => {
                let width = rest[start..].chars().next().map_or(1, char::len_utf8);
                parts.push(&rest[start + width..]);
                rest = rest[..start].trim_end();
            }
            None => {
                parts.push(rest);
                break;
            }
        }
    }
    parts
}

fn is_line_break(c: char) -> bool {
    matches!(
        c,
        '\n' | '\r' | '\x0b' | '\x0c' | '\x1c' | '\x1d' | '\x1e' | '\u{85}' | '\u{2028}' | '\u{2029}'
    )
}

fn splitlines(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "splitlines")?;
    let [keep_kw] = keyword_only(&mut args, "splitlines", ["keepends"])?;
    args.check("splitlines", 0, 1)?;
    let keep = match args.get(0).cloned().or(keep_kw) {
        Some(flag) => truthy(ctx, &flag)?,
        None => false,
    };
    let mut lines = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((offset, c)) = chars.next() {
        if !is_line_break(c) {
            continue;
        }
        let mut end = offset + c.len_utf8();
        if c == '\r' && chars.peek().is_some_and(|&(_, next)| next == '\n') {
            chars.next();
            end += 1;
        }
        lines.push(if keep { &text[start..end] } else { &text[start..offset] });
        start = end;
    }
    if start < text.len() {
        lines.push(&text[start..]);
    }
    Ok(to_list(lines))
}

fn strip_chars(args: &mut CallArgs, method: &str) -> RunResult<Option<Arc<str>>> {
    args.check(method, 0, 1)?;
    match args.get(0) {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(chars)) => Ok(Some(Arc::clone(chars))),
        Some(other) => Err(RunError::type_error(format!(
            "{method} arg must be None or str, not {}",
            other.type_name()
        ))),
    }
}

fn strip(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "strip")?;
    Ok(Value::from(match strip_chars(&mut args, "strip")? {
        None => text.trim(),
        Some(chars) => text.trim_matches(|c| chars.contains(c)),
    }))
}

fn lstrip(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "lstrip")?;
    Ok(Value::from(match strip_chars(&mut args, "lstrip")? {
        None => text.trim_start(),
        Some(chars) => text.trim_start_matches(|c| chars.contains(c)),
    }))
}

fn rstrip(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "rstrip")?;
    Ok(Value::from(match strip_chars(&mut args, "rstrip")? {
        None => text.trim_end(),
        Some(chars) => text.trim_end_matches(|c| chars.contains(c)),
    }))
}

fn transform(mut args: CallArgs, method: &str, f: fn(&str) -> String) -> RunResult<Value> {
    let text = this(&mut args, method)?;
    args.check(method, 0, 0)?;
    Ok(Value::from(f(&text)))
}

fn upper(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    transform(args, "upper", str::to_uppercase)
}

fn lower(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    transform(args, "lower", str::to_lowercase)
}

fn swapcase(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    transform(args, "swapcase", |text| {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if c.is_uppercase() {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
        }
        out
    })
}

/// Words start after any character without case.
fn title(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    transform(args, "title", |text| {
        let mut out = String::with_capacity(text.len());
        let mut in_word = false;
        for c in text.chars() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = c.is_alphabetic();
        }
        out
    })
}

fn capitalize(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    transform(args, "capitalize", |text| {
        let mut chars = text.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars.as_str().to_lowercase().chars()).collect(),
            None => String::new(),
        }
    })
}

/// Shared by `startswith` and `endswith`: the affix may be a tuple of candidates.
fn affix_test(ctx: &mut ExecCtx, mut args: CallArgs, method: &str, test: fn(&str, &str) -> bool) -> RunResult<Value> {
    let text = this(&mut args, method)?;
    args.check(method, 1, 3)?;
    let Some((window, _)) = slice_window(ctx, &text, args.get(1), args.get(2))? else {
        return Ok(Value::Bool(false));
    };
    let candidates = match &args.positional[0] {
        Value::Tuple(items) => items.to_vec(),
        other => vec![other.clone()],
    };
    for candidate in &candidates {
        let Value::Str(affix) = candidate else {
            return Err(RunError::type_error(format!(
                "{method} first arg must be str or a tuple of str, not {}",
                candidate.type_name()
            )));
        };
        if test(window, affix) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn startswith(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    affix_test(ctx, args, "startswith", |text, affix| text.starts_with(affix))
}

fn endswith(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    affix_test(ctx, args, "endswith", |text, affix| text.ends_with(affix))
}

/// Code-point position of `sub` within `text[start:end]`, searching from the left or right.
fn locate(ctx: &mut ExecCtx, args: &mut CallArgs, method: &str, from_right: bool) -> RunResult<Option<usize>> {
    let text = this(args, method)?;
    args.check(method, 1, 3)?;
    let sub = text_arg(&args.positional[0], method)?.to_owned();
    let Some((window, start)) = slice_window(ctx, &text, args.get(1), args.get(2))? else {
        return Ok(None);
    };
    let found = if from_right { window.rfind(&sub) } else { window.find(&sub) };
    Ok(found.map(|byte| start + char_index(window, byte)))
}

fn find(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let found = locate(ctx, &mut args, "find", false)?;
    Ok(found.map_or(Value::Int(-1), Value::from))
}

fn rfind(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let found = locate(ctx, &mut args, "rfind", true)?;
    Ok(found.map_or(Value::Int(-1), Value::from))
}

fn index(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    locate(ctx, &mut args, "index", false)?
        .map(Value::from)
        .ok_or_else(|| RunError::value_error("substring not found"))
}

fn rindex(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    locate(ctx, &mut args, "rindex", true)?
        .map(Value::from)
        .ok_or_else(|| RunError::value_error("substring not found"))
}

fn count(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "count")?;
    args.check("count", 1, 3)?;
    let sub = text_arg(&args.positional[0], "count")?.to_owned();
    let Some((window, _)) = slice_window(ctx, &text, args.get(1), args.get(2))? else {
        return Ok(Value::Int(0));
    };
    let n = if sub.is_empty() {
        window.chars().count() + 1
    } else {
        window.matches(&sub).count()
    };
    Ok(Value::from(n))
}

fn replace(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "replace")?;
    let [count_kw] = keyword_only(&mut args, "replace", ["count"])?;
    args.check("replace", 2, 3)?;
    let old = text_arg(&args.positional[0], "replace")?;
    let new = text_arg(&args.positional[1], "replace")?;
    let limit = match args.get(2).cloned().or(count_kw) {
        Some(value) => usize::try_from(ops::expect_index(ctx, &value)?).ok(),
        None => None,
    };
    Ok(Value::from(match limit {
        Some(limit) => text.replacen(old, new, limit),
        None => text.replace(old, new),
    }))
}

fn removeprefix(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "removeprefix")?;
    args.check("removeprefix", 1, 1)?;
    let prefix = text_arg(&args.positional[0], "removeprefix")?;
    Ok(Value::from(text.strip_prefix(prefix).unwrap_or(&text)))
}

fn removesuffix(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "removesuffix")?;
    args.check("removesuffix", 1, 1)?;
    let suffix = text_arg(&args.positional[0], "removesuffix")?;
    Ok(Value::from(text.strip_suffix(suffix).unwrap_or(&text)))
}

fn partition_with(mut args: CallArgs, method: &str, from_right: bool) -> RunResult<Value> {
    let text = this(&mut args, method)?;
    args.check(method, 1, 1)?;
    let sep = text_arg(&args.positional[0], method)?;
    if sep.is_empty() {
        return Err(RunError::value_error("empty separator"));
    }
    let found = if from_right { text.rfind(sep) } else { text.find(sep) };
    let parts = match found {
        Some(at) => [&text[..at], sep, &text[at + sep.len()..]],
        None if from_right => ["", "", &*text],
        None => [&*text, "", ""],
    };
    Ok(Value::tuple(parts.into_iter().map(Value::from).collect()))
}

fn partition(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    partition_with(args, "partition", false)
}

fn rpartition(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    partition_with(args, "rpartition", true)
}

#[derive(Clone, Copy)]
enum Justify {
    Left,
    Right,
    Center,
}

fn justify(ctx: &mut ExecCtx, mut args: CallArgs, method: &str, how: Justify) -> RunResult<Value> {
    let text = this(&mut args, method)?;
    args.check(method, 1, 2)?;
    let width = usize::try_from(ops::expect_index(ctx, &args.positional[0])?).unwrap_or(0);
    let fill = match args.get(1) {
        None => ' ',
        Some(Value::Str(fill)) if fill.chars().count() == 1 => fill.chars().next().unwrap_or(' '),
        Some(_) => {
            return Err(RunError::type_error(
                "The fill character must be exactly one character long",
            ));
        }
    };
    let len = text.chars().count();
    if width <= len {
        return Ok(Value::Str(text));
    }
    let margin = width - len;
    let left = match how {
        Justify::Left => 0,
        Justify::Right => margin,
        // Odd margins put the extra character on the left only when the width is odd.
        Justify::Center => margin / 2 + (margin & width & 1),
    };
    let mut out = String::with_capacity(text.len() + margin);
    out.extend(std::iter::repeat_n(fill, left));
    out.push_str(&text);
    out.extend(std::iter::repeat_n(fill, margin - left));
    Ok(Value::from(out))
}

fn center(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    justify(ctx, args, "center", Justify::Center)
}

fn ljust(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    justify(ctx, args, "ljust", Justify::Left)
}

fn rjust(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    justify(ctx, args, "rjust", Justify::Right)
}

fn zfill(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "zfill")?;
    args.check("zfill", 1, 1)?;
    let width = usize::try_from(ops::expect_index(ctx, &args.positional[0])?).unwrap_or(0);
    let len = text.chars().count();
    if width <= len {
        return Ok(Value::Str(text));
    }
    let (sign, digits) = match text.as_bytes().first() {
        Some(b'+' | b'-') => text.split_at(1),
        _ => ("", &*text),
    };
    Ok(Value::from(format!("{sign}{}{digits}", "0".repeat(width - len))))
}

fn predicate(mut args: CallArgs, method: &str, test: fn(&str) -> bool) -> RunResult<Value> {
    let text = this(&mut args, method)?;
    args.check(method, 0, 0)?;
    Ok(Value::Bool(!text.is_empty() && test(&text)))
}

fn isdigit(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    predicate(args, "isdigit", |text| text.chars().all(|c| c.is_ascii_digit() || c.is_numeric()))
}

fn isalpha(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    predicate(args, "isalpha", |text| text.chars().all(char::is_alphabetic))
}

fn isalnum(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    predicate(args, "isalnum", |text| text.chars().all(char::is_alphanumeric))
}

fn isspace(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    predicate(args, "isspace", |text| text.chars().all(char::is_whitespace))
}

/// At least one cased character and no lowercase ones.
fn isupper(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    predicate(args, "isupper", |text| {
        text.chars().any(char::is_uppercase) && !text.chars().any(char::is_lowercase)
    })
}

fn islower(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    predicate(args, "islower", |text| {
        text.chars().any(char::is_lowercase) && !text.chars().any(char::is_uppercase)
    })
}

fn encode(_: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let text = this(&mut args, "encode")?;
    let [encoding_kw, _errors] = keyword_only(&mut args, "encode", ["encoding", "errors"])?;
    args.check("encode", 0, 2)?;
    let encoding = match args.get(0).cloned().or(encoding_kw) {
        None => "utf-8".to_owned(),
        Some(value) => text_arg(&value, "encode")?.to_ascii_lowercase().replace('_', "-"),
    };
    let bytes: Vec<u8> = match encoding.as_str() {
        "utf-8" | "utf8" => text.as_bytes().to_vec(),
        "ascii" | "latin-1" | "latin1" | "iso-8859-1" => {
            let limit = if encoding == "ascii" { 0x80 } else { 0x100 };
            text.chars()
                .enumerate()
                .map(|(pos, c)| {
                    u8::try_from(u32::from(c)).ok().filter(|b| u32::from(*b) < limit).ok_or_else(|| {
                        RunError::value_error(format!(
                            "'{encoding}' codec can't encode character {:?} in position {pos}",
                            c
                        ))
                    })
                })
                .collect::<RunResult<_>>()?
        }
        _ => return Err(RunError::new(ExcType::LookupError, format!("unknown encoding: {encoding}"))),
    };
    Ok(Value::Bytes(bytes.into()))
}

/// `str.format(*args, **kwargs)`.
fn format_method(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let template = this(&mut args, "format")?;
    let mut fields = FieldSource {
        args: &args,
        next_auto: 0,
        used_manual: false,
    };
    render_template(ctx, &template, &mut fields, 2).map(Value::from)
}

struct FieldSource<'a> {
    args: &'a CallArgs,
    next_auto: usize,
    used_manual: bool,
}

impl FieldSource<'_> {
    fn lookup(&mut self, ctx: &mut ExecCtx, field: &str) -> RunResult<Value> {
        let end = field.find(['.', '[']).unwrap_or(field.len());
        let (head, mut rest) = field.split_at(end);
        let mut value = if head.is_empty() {
            if self.used_manual {
                return Err(RunError::value_error(
                    "cannot switch from manual field specification to automatic field numbering",
                ));
            }
            let index = self.next_auto;
            self.next_auto += 1;
            self.positional(index)?
        } else if let Ok(index) = head.parse::<usize>() {
            if self.next_auto > 0 {
                return Err(RunError::value_error(
                    "cannot switch from automatic field numbering to manual field specification",
                ));
            }
            self.used_manual = true;
            self.positional(index)?
        } else {
            self.args
                .keywords
                .iter()
                .find(|(name, _)| &**name == head)
                .map(|(_, value)| value.clone())
                .ok_or_else(|| RunError::key_error(Value::str(head)))?
        };
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(['.', '[']).unwrap_or(after.len());
                value = get_attr(ctx, &value, &after[..end])?;
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let Some(close) = after.find(']') else {
                    return Err(RunError::value_error("Missing ']' in format string"));
                };
                let key = &after[..close];
                let key = match key.parse::<i64>() {
                    Ok(index) => Value::Int(index),
                    Err(_) => Value::str(key),
                };
                value = get_item(ctx, &value, &key)?;
                rest = &after[close + 1..];
            } else {
                return Err(RunError::value_error(
                    "Only '.' or '[' may follow ']' in format field specifier",
                ));
            }
        }
        Ok(value)
    }

    fn positional(&self, index: usize) -> RunResult<Value> {
        self.args.get(index).cloned().ok_or_else(|| {
            RunError::index_error(format!(
                "Replacement index {index} out of range for positional args tuple"
            ))
        })
    }
}

fn render_template(ctx: &mut ExecCtx, template: &str, fields: &mut FieldSource<'_>, depth: u8) -> RunResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(at) = rest.find(['{', '}']) {
        out.push_str(&rest[..at]);
        let brace = rest.as_bytes()[at];
        let after = &rest[at + 1..];
        if after.as_bytes().first() == Some(&brace) {
            out.push(char::from(brace));
            rest = &after[1..];
            continue;
        }
        if brace == b'}' {
            return Err(RunError::value_error("Single '}' encountered in format string"));
        }
        let close = matching_brace(after).ok_or_else(|| RunError::value_error("expected '}' before end of string"))?;
        out.push_str(&render_field(ctx, &after[..close], fields, depth)?);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Index of the `}` closing a field, skipping nested `{...}` in the spec.
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in text.bytes().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' if depth == 0 => return Some(i),
            b'}' => depth -= 1,
            _ => {}
        }
    }
    None
}

fn render_field(ctx: &mut ExecCtx, field: &str, fields: &mut FieldSource<'_>, depth: u8) -> RunResult<String> {
    let (name_part, spec) = match field.find(':') {
        Some(colon) => (&field[..colon], &field[colon + 1..]),
        None => (field, ""),
    };
    let (name, conversion) = match name_part.find('!') {
        Some(bang) => (&name_part[..bang], Some(&name_part[bang + 1..])),
        None => (name_part, None),
    };
    let value = fields.lookup(ctx, name)?;
    let value = match conversion {
        None => value,
        Some("r") => Value::from(format::repr(ctx, &value)?),
        Some("s") => Value::from(format::str(ctx, &value)?),
        Some("a") => Value::from(ascii_escape(&format::repr(ctx, &value)?)),
        Some(_) => return Err(RunError::value_error("Unknown conversion specifier")),
    };
    let spec = if spec.contains('{') {
        if depth == 0 {
            return Err(RunError::value_error("Max string recursion exceeded"));
        }
        render_template(ctx, spec, fields, depth - 1)?
    } else {
        spec.to_owned()
    };
    format::format_value(ctx, &value, &spec)
}

/// `ascii()`-style escaping of everything outside ASCII.
fn ascii_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match u32::from(c) {
            0..0x80 => out.push(c),
            code @ 0x80..0x100 => out.push_str(&format!("\\x{code:02x}")),
            code @ 0x100..0x10000 => out.push_str(&format!("\\u{code:04x}")),
            code => out.push_str(&format!("\\U{code:08x}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::HostConfig, tracer::NoopTracer};

    fn ctx() -> ExecCtx {
        ExecCtx::for_tests(HostConfig::default(), Arc::new(NoopTracer))
    }

    fn call(method: BuiltinFn, text: &str, args: Vec<Value>) -> RunResult<Value> {
        let mut ctx = ctx();
        method(&mut ctx, CallArgs::positional(args).with_receiver(Value::str(text)))
    }

    fn strings(value: &Value) -> Vec<String> {
        match value {
            Value::List(list) => list
                .to_vec()
                .iter()
                .map(|v| v.as_str().unwrap_or("<not str>").to_owned())
                .collect(),
            Value::Tuple(items) => items.iter().map(|v| v.as_str().unwrap_or("<not str>").to_owned()).collect(),
            other => panic!("not a sequence: {other:?}"),
        }
    }

    #[test]
    fn whitespace_split_keeps_the_remainder() {
        assert_eq!(split_whitespace("  a b  c ", None), vec!["a", "b", "c"]);
        assert_eq!(split_whitespace("a b  ", Some(1)), vec!["a", "b  "]);
        let mut right = rsplit_whitespace("  a b c", Some(1));
        right.reverse();
        assert_eq!(right, vec!["  a b", "c"]);
    }

    #[test]
    fn split_with_separator_and_limit() {
        let parts = call(split, "a,b,,c", vec![Value::str(","), Value::Int(2)]).unwrap();
        assert_eq!(strings(&parts), vec!["a", "b", ",c"]);
        let parts = call(rsplit, "a,b,c", vec![Value::str(","), Value::Int(1)]).unwrap();
        assert_eq!(strings(&parts), vec!["a,b", "c"]);
        let err = call(split, "abc", vec![Value::str("")]).unwrap_err();
        assert_eq!(err.message(), "empty separator");
    }

    #[test]
    fn splitlines_handles_crlf() {
        let lines = call(splitlines, "a\r\nb\nc", vec![]).unwrap();
        assert_eq!(strings(&lines), vec!["a", "b", "c"]);
        let lines = call(splitlines, "a\r\nb\n", vec![Value::Bool(true)]).unwrap();
        assert_eq!(strings(&lines), vec!["a\r\n", "b\n"]);
    }

    #[test]
    fn positions_count_code_points() {
        let found = call(find, "héllo", vec![Value::str("l")]).unwrap();
        assert_eq!(found.as_i64(), Some(2));
        let found = call(rfind, "héllo", vec![Value::str("l"), Value::Int(0), Value::Int(3)]).unwrap();
        assert_eq!(found.as_i64(), Some(2));
        let missing = call(find, "abc", vec![Value::str("z")]).unwrap();
        assert_eq!(missing.as_i64(), Some(-1));
        let count = call(count, "aaa", vec![Value::str("")]).unwrap();
        assert_eq!(count.as_i64(), Some(4));
    }

    #[test]
    fn justification_matches_python_centering() {
        assert_eq!(call(center, "ab", vec![Value::Int(5)]).unwrap().as_str(), Some("  ab "));
        assert_eq!(call(center, "abc", vec![Value::Int(6)]).unwrap().as_str(), Some(" abc  "));
        assert_eq!(call(rjust, "7", vec![Value::Int(3), Value::str("0")]).unwrap().as_str(), Some("007"));
        assert_eq!(call(zfill, "-42", vec![Value::Int(5)]).unwrap().as_str(), Some("-0042"));
    }

    #[test]
    fn case_transforms() {
        assert_eq!(call(title, "hello wORLD's", vec![]).unwrap().as_str(), Some("Hello World'S"));
        assert_eq!(call(capitalize, "hELLO", vec![]).unwrap().as_str(), Some("Hello"));
        assert_eq!(call(swapcase, "aBc", vec![]).unwrap().as_str(), Some("AbC"));
    }

    #[test]
    fn partition_keeps_three_parts() {
        let parts = call(partition, "k=v=w", vec![Value::str("=")]).unwrap();
        assert_eq!(strings(&parts), vec!["k", "=", "v=w"]);
        let parts = call(rpartition, "kvw", vec![Value::str("=")]).unwrap();
        assert_eq!(strings(&parts), vec!["", "", "kvw"]);
    }

    #[test]
    fn format_fields() {
        let mut ctx = ctx();
        let mut args = CallArgs::positional([Value::Int(1), Value::str("x")]).with_receiver(Value::str("{} {!r} {{}}"));
        assert_eq!(format_method(&mut ctx, args).unwrap().as_str(), Some("1 'x' {}"));

        args = CallArgs::positional([Value::Float(3.14159)]).with_receiver(Value::str("{0:.{1}f}"));
        args.positional.push(Value::Int(2));
        assert_eq!(format_method(&mut ctx, args).unwrap().as_str(), Some("3.14"));

        let mut args = CallArgs::new().with_receiver(Value::str("{name}"));
        args.keywords.push((Arc::from("name"), Value::str("corvid")));
        assert_eq!(format_method(&mut ctx, args).unwrap().as_str(), Some("corvid"));

        let args = CallArgs::positional([Value::Int(1)]).with_receiver(Value::str("{0} {}"));
        let err = format_method(&mut ctx, args).unwrap_err();
        assert!(err.matches(ExcType::ValueError));
    }
}
