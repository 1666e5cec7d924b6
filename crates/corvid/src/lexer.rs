//! Tokenizer for source text.
//!
//! [`Tokenizer`] is a lazy, single-pass iterator over [`Token`]s. It owns the indentation
//! stack, so it cannot be restarted mid-stream. Lexical problems never abort tokenization:
//! they are emitted as [`TokenKind::Error`] tokens carrying a [`LexError`] so the parser can
//! report several diagnostics from one pass and attach exact positions.
//!
//! Interpolated strings are split here into literal and expression segments. Each
//! expression segment is tokenized by a nested `Tokenizer` whose positions are mapped back
//! onto the enclosing source.

use std::{collections::VecDeque, fmt, iter::Peekable, str::CharIndices};

use num_bigint::BigInt;
use num_traits::Num;
use strum::{Display, EnumString, IntoStaticStr};

use crate::source::{CodeLoc, CodeRange};

/// Tab stops used to compute indentation columns.
const TAB_SIZE: u32 = 8;

/// A lexical diagnostic carried by an error token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub kind: LexErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexErrorKind {
    Syntax,
    /// Dedent to a column that matches no enclosing block.
    Indentation,
    /// Indentation whose meaning depends on the tab width.
    Tab,
}

impl LexError {
    fn syntax(message: impl Into<String>) -> Self {
        Self {
            kind: LexErrorKind::Syntax,
            message: message.into(),
        }
    }
}

/// Reserved words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    #[strum(serialize = "False")]
    False,
    #[strum(serialize = "None")]
    None,
    #[strum(serialize = "True")]
    True,
    And,
    As,
    Assert,
    Async,
    Await,
    Break,
    Class,
    Continue,
    Def,
    Del,
    Elif,
    Else,
    Except,
    Finally,
    For,
    From,
    Global,
    If,
    Import,
    In,
    Is,
    Lambda,
    Nonlocal,
    Not,
    Or,
    Pass,
    Raise,
    Return,
    Try,
    While,
    With,
    Yield,
}

/// Operators and delimiters.
///
/// Displayed through `IntoStaticStr`, since strum's `Display` derive treats `{` and `}`
/// as format braces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
pub enum Op {
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "*")]
    Star,
    #[strum(serialize = "**")]
    DoubleStar,
    #[strum(serialize = "/")]
    Slash,
    #[strum(serialize = "//")]
    DoubleSlash,
    #[strum(serialize = "%")]
    Percent,
    #[strum(serialize = "@")]
    At,
    #[strum(serialize = "<<")]
    LeftShift,
    #[strum(serialize = ">>")]
    RightShift,
    #[strum(serialize = "&")]
    Amper,
    #[strum(serialize = "|")]
    Pipe,
    #[strum(serialize = "^")]
    Caret,
    #[strum(serialize = "~")]
    Tilde,
    #[strum(serialize = "<")]
    Less,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = "<=")]
    LessEqual,
    #[strum(serialize = ">=")]
    GreaterEqual,
    #[strum(serialize = "==")]
    EqEqual,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = "(")]
    LParen,
    #[strum(serialize = ")")]
    RParen,
    #[strum(serialize = "[")]
    LSquare,
    #[strum(serialize = "]")]
    RSquare,
    #[strum(serialize = "{")]
    LBrace,
    #[strum(serialize = "}")]
    RBrace,
    #[strum(serialize = ",")]
    Comma,
    #[strum(serialize = ":")]
    Colon,
    #[strum(serialize = ";")]
    Semi,
    #[strum(serialize = ".")]
    Dot,
    #[strum(serialize = "...")]
    Ellipsis,
    #[strum(serialize = "=")]
    Equal,
    #[strum(serialize = "->")]
    Arrow,
    #[strum(serialize = ":=")]
    ColonEqual,
    #[strum(serialize = "+=")]
    PlusEqual,
    #[strum(serialize = "-=")]
    MinusEqual,
    #[strum(serialize = "*=")]
    StarEqual,
    #[strum(serialize = "**=")]
    DoubleStarEqual,
    #[strum(serialize = "/=")]
    SlashEqual,
    #[strum(serialize = "//=")]
    DoubleSlashEqual,
    #[strum(serialize = "%=")]
    PercentEqual,
    #[strum(serialize = "@=")]
    AtEqual,
    #[strum(serialize = "<<=")]
    LeftShiftEqual,
    #[strum(serialize = ">>=")]
    RightShiftEqual,
    #[strum(serialize = "&=")]
    AmperEqual,
    #[strum(serialize = "|=")]
    PipeEqual,
    #[strum(serialize = "^=")]
    CaretEqual,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.into())
    }
}

/// Operators ordered longest first so maximal munch falls out of a linear scan.
const OPERATORS: &[(&str, Op)] = &[
    ("**=", Op::DoubleStarEqual),
    ("//=", Op::DoubleSlashEqual),
    ("<<=", Op::LeftShiftEqual),
    (">>=", Op::RightShiftEqual),
    ("...", Op::Ellipsis),
    ("**", Op::DoubleStar),
    ("//", Op::DoubleSlash),
    ("<<", Op::LeftShift),
    (">>", Op::RightShift),
    ("<=", Op::LessEqual),
    (">=", Op::GreaterEqual),
    ("==", Op::EqEqual),
    ("!=", Op::NotEqual),
    ("->", Op::Arrow),
    (":=", Op::ColonEqual),
    ("+=", Op::PlusEqual),
    ("-=", Op::MinusEqual),
    ("*=", Op::StarEqual),
    ("/=", Op::SlashEqual),
    ("%=", Op::PercentEqual),
    ("@=", Op::AtEqual),
    ("&=", Op::AmperEqual),
    ("|=", Op::PipeEqual),
    ("^=", Op::CaretEqual),
    ("+", Op::Plus),
    ("-", Op::Minus),
    ("*", Op::Star),
    ("/", Op::Slash),
    ("%", Op::Percent),
    ("@", Op::At),
    ("&", Op::Amper),
    ("|", Op::Pipe),
    ("^", Op::Caret),
    ("~", Op::Tilde),
    ("<", Op::Less),
    (">", Op::Greater),
    ("(", Op::LParen),
    (")", Op::RParen),
    ("[", Op::LSquare),
    ("]", Op::RSquare),
    ("{", Op::LBrace),
    ("}", Op::RBrace),
    (",", Op::Comma),
    (":", Op::Colon),
    (";", Op::Semi),
    (".", Op::Dot),
    ("=", Op::Equal),
];

#[derive(Debug, Clone, PartialEq)]
pub enum IntLiteral {
    Small(i64),
    Big(BigInt),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrLiteral {
    Text(String),
    Bytes(Vec<u8>),
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum FStringSegment {
    Literal(String),
    Expr(FStringExpr),
}

/// A `{expr!conv:spec}` replacement field, already tokenized.
#[derive(Debug, Clone, PartialEq)]
pub struct FStringExpr {
    pub tokens: Vec<Token>,
    pub conversion: Option<char>,
    pub format_spec: Vec<FStringSegment>,
    /// Source text of the expression including the `=`, for self-documenting fields.
    pub self_documenting: Option<String>,
    pub range: CodeRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(IntLiteral),
    Float(f64),
    Str(StrLiteral),
    FString(Vec<FStringSegment>),
    Keyword(Keyword),
    Op(Op),
    Newline,
    Indent,
    Dedent,
    EndOfFile,
    Error(LexError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub range: CodeRange,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name '{name}'"),
            Self::Int(_) | Self::Float(_) => f.write_str("number"),
            Self::Str(_) | Self::FString(_) => f.write_str("string"),
            Self::Keyword(kw) => write!(f, "'{kw}'"),
            Self::Op(op) => write!(f, "'{op}'"),
            Self::Newline => f.write_str("newline"),
            Self::Indent => f.write_str("indent"),
            Self::Dedent => f.write_str("dedent"),
            Self::EndOfFile => f.write_str("end of file"),
            Self::Error(err) => f.write_str(&err.message),
        }
    }
}

/// Lazy tokenizer over one source text.
pub struct Tokenizer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: u32,
    column: u32,
    /// Pending tokens (dedent runs, synthesized newlines).
    pending: VecDeque<Token>,
    /// Indentation columns computed with [`TAB_SIZE`] and with tab width 1.
    indents: Vec<(u32, u32)>,
    bracket_depth: u32,
    at_line_start: bool,
    /// Whether the current logical line has produced a token.
    line_has_tokens: bool,
    finished: bool,
    /// Nested tokenizers for f-string fields do not track indentation.
    nested: bool,
    /// Mapping applied to positions of a nested tokenizer.
    origin: CodeLoc,
}

impl<'a> Tokenizer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
            pending: VecDeque::new(),
            indents: vec![(0, 0)],
            bracket_depth: 0,
            at_line_start: true,
            line_has_tokens: false,
            finished: false,
            nested: false,
            origin: CodeLoc::new(1, 1),
        }
    }

    /// Tokenizer for an f-string replacement field starting at `origin`.
    fn nested(source: &'a str, origin: CodeLoc) -> Self {
        Self {
            bracket_depth: 1,
            at_line_start: false,
            nested: true,
            origin,
            ..Self::new(source)
        }
    }

    fn loc(&self) -> CodeLoc {
        if self.line == 1 {
            CodeLoc::new(self.origin.line, self.origin.column + self.column - 1)
        } else {
            CodeLoc::new(self.origin.line + self.line - 1, self.column)
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn peek_offset(&mut self) -> usize {
        self.chars.peek().map_or(self.source.len(), |&(i, _)| i)
    }

    fn bump(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn rest(&mut self) -> &'a str {
        let offset = self.peek_offset();
        &self.source[offset..]
    }

    fn token(&self, kind: TokenKind, start: CodeLoc) -> Token {
        Token {
            kind,
            range: CodeRange::new(start, self.loc()),
        }
    }

    fn error(&self, message: impl Into<String>, start: CodeLoc) -> Token {
        self.token(TokenKind::Error(LexError::syntax(message)), start)
    }

    /// Handles indentation at the start of a logical line.
    ///
    /// Returns `false` when the line is blank or a comment and should be skipped entirely.
    fn process_line_start(&mut self) -> bool {
        let mut col = 0u32;
        let mut col_unit_tabs = 0u32;
        loop {
            match self.peek_char() {
                Some(' ') => {
                    col += 1;
                    col_unit_tabs += 1;
                }
                Some('\t') => {
                    col = (col / TAB_SIZE + 1) * TAB_SIZE;
                    col_unit_tabs += 1;
                }
                Some('\x0c') => {
                    col = 0;
                    col_unit_tabs = 0;
                }
                _ => break,
            }
            self.bump();
        }
        match self.peek_char() {
            Some('#' | '\n' | '\r') => return false,
            None => return false,
            _ => {}
        }
        let start = self.loc();
        let &(current, current_unit) = self.indents.last().unwrap_or(&(0, 0));
        if col > current {
            if col_unit_tabs <= current_unit {
                self.pending.push_back(self.tab_error(start));
            }
            self.indents.push((col, col_unit_tabs));
            self.pending.push_back(self.token(TokenKind::Indent, start));
        } else if col < current {
            while let Some(&(top, _)) = self.indents.last() {
                if top <= col {
                    break;
                }
                self.indents.pop();
                self.pending.push_back(self.token(TokenKind::Dedent, start));
            }
            match self.indents.last() {
                Some(&(top, top_unit)) if top == col => {
                    if top_unit != col_unit_tabs {
                        self.pending.push_back(self.tab_error(start));
                    }
                }
                _ => {
                    self.pending.push_back(self.token(
                        TokenKind::Error(LexError {
                            kind: LexErrorKind::Indentation,
                            message: "unindent does not match any outer indentation level".to_owned(),
                        }),
                        start,
                    ));
                }
            }
        } else if col_unit_tabs != current_unit {
            self.pending.push_back(self.tab_error(start));
        }
        true
    }

    fn tab_error(&self, start: CodeLoc) -> Token {
        self.token(
            TokenKind::Error(LexError {
                kind: LexErrorKind::Tab,
                message: "inconsistent use of tabs and spaces in indentation".to_owned(),
            }),
            start,
        )
    }

    fn skip_to_line_end(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn finish(&mut self) -> Token {
        let start = self.loc();
        self.finished = true;
        if self.nested {
            return self.token(TokenKind::EndOfFile, start);
        }
        if self.bracket_depth > 0 {
            self.bracket_depth = 0;
            self.pending
                .push_back(self.error("unexpected EOF in multi-line statement", start));
        }
        if self.line_has_tokens {
            self.pending.push_back(self.token(TokenKind::Newline, start));
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.pending.push_back(self.token(TokenKind::Dedent, start));
        }
        self.pending.push_back(self.token(TokenKind::EndOfFile, start));
        self.pending.pop_front().unwrap_or_else(|| self.token(TokenKind::EndOfFile, start))
    }

    fn next_token(&mut self) -> Token {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return token;
            }
            if self.finished {
                return self.token(TokenKind::EndOfFile, self.loc());
            }
            if self.at_line_start && self.bracket_depth == 0 {
                self.at_line_start = false;
                if !self.process_line_start() {
                    // blank or comment-only line
                    self.skip_to_line_end();
                    if self.bump().is_none() {
                        return self.finish();
                    }
                    self.at_line_start = true;
                    continue;
                }
                continue;
            }
            let Some(c) = self.peek_char() else {
                return self.finish();
            };
            let start = self.loc();
            match c {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.bump();
                }
                '#' => self.skip_to_line_end(),
                '\n' => {
                    self.bump();
                    if self.bracket_depth == 0 {
                        self.at_line_start = true;
                        if self.line_has_tokens {
                            self.line_has_tokens = false;
                            return self.token(TokenKind::Newline, start);
                        }
                    }
                }
                '\\' => {
                    self.bump();
                    match self.peek_char() {
                        Some('\n') => {
                            self.bump();
                        }
                        Some('\r') => {
                            self.bump();
                            if self.peek_char() == Some('\n') {
                                self.bump();
                            }
                        }
                        None => return self.error("unexpected EOF while scanning line continuation", start),
                        Some(_) => return self.error("unexpected character after line continuation character", start),
                    }
                }
                _ => {
                    self.line_has_tokens = true;
                    return self.lex_token(c, start);
                }
            }
        }
    }

    fn lex_token(&mut self, c: char, start: CodeLoc) -> Token {
        if c.is_ascii_digit() || (c == '.' && self.rest()[1..].starts_with(|d: char| d.is_ascii_digit())) {
            return self.lex_number(start);
        }
        if is_identifier_start(c) {
            let word_start = self.peek_offset();
            while self.peek_char().is_some_and(is_identifier_continue) {
                self.bump();
            }
            let word = &self.source[word_start..self.peek_offset()];
            if matches!(self.peek_char(), Some('\'' | '"'))
                && let Some(prefix) = StringPrefix::parse(word)
            {
                return self.lex_string(prefix, start);
            }
            return match word.parse::<Keyword>() {
                Ok(kw) => self.token(TokenKind::Keyword(kw), start),
                Err(_) => self.token(TokenKind::Name(word.to_owned()), start),
            };
        }
        if c == '\'' || c == '"' {
            return self.lex_string(StringPrefix::default(), start);
        }
        let rest = self.rest();
        for &(text, op) in OPERATORS {
            if rest.starts_with(text) {
                for _ in 0..text.len() {
                    self.bump();
                }
                match op {
                    Op::LParen | Op::LSquare | Op::LBrace => self.bracket_depth += 1,
                    Op::RParen | Op::RSquare | Op::RBrace => {
                        if self.bracket_depth == 0 || (self.nested && self.bracket_depth == 1) {
                            return self.error(format!("unmatched '{op}'"), start);
                        }
                        self.bracket_depth -= 1;
                    }
                    _ => {}
                }
                return self.token(TokenKind::Op(op), start);
            }
        }
        self.bump();
        self.error(format!("invalid character '{c}' (U+{:04X})", c as u32), start)
    }

    fn lex_number(&mut self, start: CodeLoc) -> Token {
        let begin = self.peek_offset();
        let radix = if self.peek_char() == Some('0') {
            let second = self.rest().chars().nth(1);
            match second {
                Some('x' | 'X') => Some(16),
                Some('o' | 'O') => Some(8),
                Some('b' | 'B') => Some(2),
                _ => None,
            }
        } else {
            None
        };
        if let Some(radix) = radix {
            self.bump();
            self.bump();
            let digits_start = self.peek_offset();
            while self.peek_char().is_some_and(|d| d.is_ascii_alphanumeric() || d == '_') {
                self.bump();
            }
            let digits: String = self.source[digits_start..self.peek_offset()]
                .chars()
                .filter(|&d| d != '_')
                .collect();
            return match BigInt::from_str_radix(&digits, radix) {
                Ok(value) => self.token(TokenKind::Int(int_literal(value)), start),
                Err(_) => self.error("invalid digit in integer literal", start),
            };
        }
        let mut is_float = false;
        while self.peek_char().is_some_and(|d| d.is_ascii_digit() || d == '_') {
            self.bump();
        }
        if self.peek_char() == Some('.') {
            is_float = true;
            self.bump();
            while self.peek_char().is_some_and(|d| d.is_ascii_digit() || d == '_') {
                self.bump();
            }
        }
        if matches!(self.peek_char(), Some('e' | 'E')) {
            let mut lookahead = self.rest().chars().skip(1);
            let next = lookahead.next();
            let valid = match next {
                Some('+' | '-') => lookahead.next().is_some_and(|d| d.is_ascii_digit()),
                Some(d) => d.is_ascii_digit(),
                None => false,
            };
            if valid {
                is_float = true;
                self.bump();
                if matches!(self.peek_char(), Some('+' | '-')) {
                    self.bump();
                }
                while self.peek_char().is_some_and(|d| d.is_ascii_digit() || d == '_') {
                    self.bump();
                }
            }
        }
        let text: String = self.source[begin..self.peek_offset()]
            .chars()
            .filter(|&d| d != '_')
            .collect();
        if matches!(self.peek_char(), Some('j' | 'J')) {
            self.bump();
            return self.error("imaginary literals are not supported", start);
        }
        if self.peek_char().is_some_and(is_identifier_start) {
            return self.error("invalid decimal literal", start);
        }
        if is_float {
            match text.parse::<f64>() {
                Ok(value) => self.token(TokenKind::Float(value), start),
                Err(_) => self.error("invalid float literal", start),
            }
        } else {
            if text.len() > 1 && text.starts_with('0') && text.chars().any(|d| d != '0') {
                return self.error(
                    "leading zeros in decimal integer literals are not permitted; use an 0o prefix for octal integers",
                    start,
                );
            }
            match text.parse::<BigInt>() {
                Ok(value) => self.token(TokenKind::Int(int_literal(value)), start),
                Err(_) => self.error("invalid integer literal", start),
            }
        }
    }

    fn lex_string(&mut self, prefix: StringPrefix, start: CodeLoc) -> Token {
        let Some(quote) = self.bump() else {
            return self.error("unterminated string literal", start);
        };
        let triple = self.rest().starts_with(&format!("{quote}{quote}"));
        if triple {
            self.bump();
            self.bump();
        }
        let body_start = self.peek_offset();
        let body_loc = self.loc();
        let body_end;
        loop {
            let Some(c) = self.peek_char() else {
                let message = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return self.error(message, start);
            };
            if c == '\\' {
                self.bump();
                if self.peek_char().is_some() {
                    self.bump();
                }
                continue;
            }
            if c == '\n' && !triple {
                return self.error("unterminated string literal", start);
            }
            if c == quote {
                if !triple {
                    body_end = self.peek_offset();
                    self.bump();
                    break;
                }
                let closing: String = [quote; 3].iter().collect();
                if self.rest().starts_with(&closing) {
                    body_end = self.peek_offset();
                    self.bump();
                    self.bump();
                    self.bump();
                    break;
                }
            }
            self.bump();
        }
        let body = &self.source[body_start..body_end];
        if prefix.formatted {
            return match parse_fstring(body, prefix.raw, body_loc) {
                Ok(segments) => self.token(TokenKind::FString(segments), start),
                Err(message) => self.error(message, start),
            };
        }
        if prefix.bytes {
            if !body.is_ascii() {
                return self.error("bytes can only contain ASCII literal characters", start);
            }
            let decoded = if prefix.raw {
                body.as_bytes().to_vec()
            } else {
                match decode_escapes(body, true) {
                    Ok(text) => text.chars().map(|c| c as u32 as u8).collect(),
                    Err(message) => return self.error(message, start),
                }
            };
            return self.token(TokenKind::Str(StrLiteral::Bytes(decoded)), start);
        }
        let value = if prefix.raw {
            body.to_owned()
        } else {
            match decode_escapes(body, false) {
                Ok(value) => value,
                Err(message) => return self.error(message, start),
            }
        };
        self.token(TokenKind::Str(StrLiteral::Text(value)), start)
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.finished && self.pending.is_empty() {
            return None;
        }
        Some(self.next_token())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct StringPrefix {
    raw: bool,
    bytes: bool,
    formatted: bool,
}

impl StringPrefix {
    fn parse(word: &str) -> Option<Self> {
        if word.len() > 2 {
            return None;
        }
        let mut prefix = Self::default();
        for c in word.chars() {
            match c.to_ascii_lowercase() {
                'r' if !prefix.raw => prefix.raw = true,
                'b' if !prefix.bytes && !prefix.formatted => prefix.bytes = true,
                'f' if !prefix.formatted && !prefix.bytes => prefix.formatted = true,
                'u' if word.len() == 1 => {}
                _ => return None,
            }
        }
        Some(prefix)
    }
}

fn int_literal(value: BigInt) -> IntLiteral {
    match i64::try_from(&value) {
        Ok(small) => IntLiteral::Small(small),
        Err(_) => IntLiteral::Big(value),
    }
}

fn is_identifier_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_identifier_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

/// Decodes backslash escapes. In bytes mode `\u`, `\U` and `\N` are literal.
fn decode_escapes(body: &str, bytes: bool) -> Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(esc) = chars.next() else {
            out.push('\\');
            break;
        };
        match esc {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\x0b'),
            '0'..='7' => {
                let mut value = esc.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(value).ok_or("invalid octal escape")?);
            }
            'x' => out.push(read_hex_escape(&mut chars, 2)?),
            'u' if !bytes => out.push(read_hex_escape(&mut chars, 4)?),
            'U' if !bytes => out.push(read_hex_escape(&mut chars, 8)?),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

fn read_hex_escape(chars: &mut Peekable<std::str::Chars<'_>>, count: usize) -> Result<char, String> {
    let mut value = 0u32;
    for _ in 0..count {
        let digit = chars
            .next()
            .and_then(|d| d.to_digit(16))
            .ok_or_else(|| format!("truncated \\{}XX escape", if count == 2 { 'x' } else { 'u' }))?;
        value = value * 16 + digit;
    }
    char::from_u32(value).ok_or_else(|| "illegal Unicode character".to_owned())
}

/// Splits an f-string body into segments, tokenizing each replacement field.
fn parse_fstring(body: &str, raw: bool, origin: CodeLoc) -> Result<Vec<FStringSegment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let chars: Vec<(usize, char)> = body.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (_, c) = chars[i];
        match c {
            '{' if chars.get(i + 1).is_some_and(|&(_, n)| n == '{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1).is_some_and(|&(_, n)| n == '}') => {
                literal.push('}');
                i += 2;
            }
            '}' => return Err("f-string: single '}' is not allowed".to_owned()),
            '{' => {
                if !literal.is_empty() {
                    segments.push(FStringSegment::Literal(finish_literal(&literal, raw)?));
                    literal.clear();
                }
                let (field, next) = parse_replacement_field(body, &chars, i + 1, raw, origin)?;
                segments.push(FStringSegment::Expr(field));
                i = next;
            }
            _ => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        segments.push(FStringSegment::Literal(finish_literal(&literal, raw)?));
    }
    Ok(segments)
}

fn finish_literal(text: &str, raw: bool) -> Result<String, String> {
    if raw { Ok(text.to_owned()) } else { decode_escapes(text, false) }
}

/// Parses a replacement field starting just after its `{`, returning the index after `}`.
fn parse_replacement_field(
    body: &str,
    chars: &[(usize, char)],
    start: usize,
    raw: bool,
    origin: CodeLoc,
) -> Result<(FStringExpr, usize), String> {
    let mut depth = 0u32;
    let mut quote: Option<char> = None;
    let mut i = start;
    let mut expr_end = None;
    while i < chars.len() {
        let (_, c) = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth > 0 => depth -= 1,
            '}' | ':' if depth == 0 => {
                expr_end = Some(i);
                break;
            }
            '!' if depth == 0 && chars.get(i + 1).is_some_and(|&(_, n)| n != '=') => {
                expr_end = Some(i);
                break;
            }
            _ => {}
        }
        i += 1;
    }
    let end = expr_end.ok_or("f-string: expecting '}'")?;
    let byte_start = chars[start].0;
    let byte_end = chars[end].0;
    let mut expr_text = &body[byte_start..byte_end];
    let mut self_documenting = None;
    let trimmed = expr_text.trim_end();
    if trimmed.ends_with('=') && !trimmed.ends_with("==") && !trimmed.ends_with("!=") {
        self_documenting = Some(expr_text.to_owned());
        expr_text = &trimmed[..trimmed.len() - 1];
    }
    if expr_text.trim().is_empty() {
        return Err("f-string: empty expression not allowed".to_owned());
    }
    let field_origin = offset_loc(origin, &body[..byte_start]);
    let tokens: Vec<Token> = Tokenizer::nested(expr_text, field_origin).collect();
    let mut i = end;
    let mut conversion = None;
    if chars[i].1 == '!' {
        let conv = chars.get(i + 1).map(|&(_, c)| c).ok_or("f-string: expecting '}'")?;
        if !matches!(conv, 'r' | 's' | 'a') {
            return Err("f-string: invalid conversion character: expected 's', 'r', or 'a'".to_owned());
        }
        conversion = Some(conv);
        i += 2;
    }
    let mut format_spec = Vec::new();
    if chars.get(i).is_some_and(|&(_, c)| c == ':') {
        let spec_start = i + 1;
        let mut depth = 0u32;
        let mut j = spec_start;
        while j < chars.len() {
            match chars[j].1 {
                '{' => depth += 1,
                '}' if depth == 0 => break,
                '}' => depth -= 1,
                _ => {}
            }
            j += 1;
        }
        if j >= chars.len() {
            return Err("f-string: expecting '}'".to_owned());
        }
        let spec_text = &body[chars[spec_start.min(j)].0..chars[j].0];
        let spec_origin = offset_loc(origin, &body[..chars[spec_start.min(j)].0]);
        format_spec = parse_fstring(spec_text, raw, spec_origin)?;
        i = j;
    }
    if !chars.get(i).is_some_and(|&(_, c)| c == '}') {
        return Err("f-string: expecting '}'".to_owned());
    }
    let range = CodeRange::new(field_origin, offset_loc(origin, &body[..chars[i].0]));
    Ok((
        FStringExpr {
            tokens,
            conversion,
            format_spec,
            self_documenting,
            range,
        },
        i + 1,
    ))
}

/// Advances `origin` over `text`.
fn offset_loc(origin: CodeLoc, text: &str) -> CodeLoc {
    let mut loc = origin;
    for c in text.chars() {
        if c == '\n' {
            loc.line += 1;
            loc.column = 1;
        } else {
            loc.column += 1;
        }
    }
    loc
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Tokenizer::new(source).map(|t| t.kind).collect()
    }

    #[test]
    fn simple_statement() {
        assert_eq!(
            kinds("x = 1\n"),
            vec![
                TokenKind::Name("x".to_owned()),
                TokenKind::Op(Op::Equal),
                TokenKind::Int(IntLiteral::Small(1)),
                TokenKind::Newline,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn indentation_produces_blocks() {
        let toks = kinds("if x:\n    y\nz\n");
        assert!(toks.contains(&TokenKind::Indent));
        assert!(toks.contains(&TokenKind::Dedent));
        let indent = toks.iter().position(|k| *k == TokenKind::Indent).unwrap();
        let dedent = toks.iter().position(|k| *k == TokenKind::Dedent).unwrap();
        assert!(indent < dedent);
    }

    #[test]
    fn brackets_suppress_newlines() {
        let toks = kinds("f(1,\n  2)\n");
        assert_eq!(toks.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
        assert!(!toks.contains(&TokenKind::Indent));
    }

    #[test]
    fn bad_dedent_is_an_error_token() {
        let toks = kinds("if x:\n    y\n  z\n");
        assert!(toks.iter().any(|k| matches!(
            k,
            TokenKind::Error(LexError {
                kind: LexErrorKind::Indentation,
                ..
            })
        )));
    }

    #[test]
    fn mixed_tabs_and_spaces_is_a_tab_error() {
        let toks = kinds("if x:\n        a\n\tb\n");
        assert!(toks.iter().any(|k| matches!(
            k,
            TokenKind::Error(LexError {
                kind: LexErrorKind::Tab,
                ..
            })
        )));
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("0x_ff")[0], TokenKind::Int(IntLiteral::Small(255)));
        assert_eq!(kinds("1_000")[0], TokenKind::Int(IntLiteral::Small(1000)));
        assert_eq!(kinds("1.5e3")[0], TokenKind::Float(1500.0));
        assert!(matches!(kinds("99999999999999999999")[0], TokenKind::Int(IntLiteral::Big(_))));
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(
            kinds(r"'a\tb'")[0],
            TokenKind::Str(StrLiteral::Text("a\tb".to_owned()))
        );
        assert_eq!(
            kinds(r"r'a\tb'")[0],
            TokenKind::Str(StrLiteral::Text("a\\tb".to_owned()))
        );
        assert_eq!(kinds("b'ab'")[0], TokenKind::Str(StrLiteral::Bytes(b"ab".to_vec())));
        assert_eq!(
            kinds("'''two\nlines'''")[0],
            TokenKind::Str(StrLiteral::Text("two\nlines".to_owned()))
        );
    }

    #[test]
    fn unterminated_string_does_not_stop_tokenizing() {
        let toks = kinds("'abc\nx = 1\n");
        assert!(matches!(toks[0], TokenKind::Error(_)));
        assert!(toks.contains(&TokenKind::Name("x".to_owned())));
    }

    #[test]
    fn fstring_segments_are_tokenized() {
        let toks = kinds("f'a{x + 1!r:>4}b'");
        let TokenKind::FString(segments) = &toks[0] else {
            panic!("expected f-string, got {:?}", toks[0]);
        };
        assert_eq!(segments.len(), 3);
        let FStringSegment::Expr(field) = &segments[1] else {
            panic!("expected expression segment");
        };
        assert_eq!(field.conversion, Some('r'));
        assert_eq!(field.tokens[0].kind, TokenKind::Name("x".to_owned()));
        assert_eq!(field.format_spec, vec![FStringSegment::Literal(">4".to_owned())]);
    }

    #[test]
    fn fstring_self_documenting() {
        let toks = kinds("f'{x=}'");
        let TokenKind::FString(segments) = &toks[0] else {
            panic!("expected f-string");
        };
        let FStringSegment::Expr(field) = &segments[0] else {
            panic!("expected expression segment");
        };
        assert_eq!(field.self_documenting.as_deref(), Some("x="));
    }
}
