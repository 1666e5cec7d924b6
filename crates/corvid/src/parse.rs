//! Recursive-descent parser producing the [`crate::expressions`] AST.
//!
//! Statements are parsed by recursive descent and binary operators by precedence climbing.
//! Errors are collected rather than returned on first failure: lexer error tokens become
//! [`Expr::Error`] placeholders, and a malformed statement is replaced by [`Stmt::Error`]
//! after skipping to the next logical line. The caller receives every diagnostic found in
//! the pass.
//!
//! Displays whose elements are all constants are folded here, so the lowering pass sees a
//! single constant node instead of a build sequence.

use num_bigint::BigInt;

use crate::{
    exception_private::ExcType,
    expressions::{
        Alias, Argument, BoolOp, ClassDef, CmpOp, Comprehension, ComprehensionFor, Const, DictItem, ExceptHandler, Expr,
        ExprLoc, FStringPart, FunctionDef, Identifier, ModuleAst, Operator, Parameter, Parameters, ScopeId, Stmt,
        StmtLoc, UnaryOp, WithItem,
    },
    intern::Interner,
    lexer::{FStringSegment, IntLiteral, Keyword as Kw, LexError, LexErrorKind, Op, StrLiteral, Token, TokenKind, Tokenizer},
    source::{CodeKind, CodeLoc, CodeRange},
};

/// A syntax diagnostic. The variant selects the exception type reported to programs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("{message} (line {})", range.start.line)]
    Syntax { message: String, range: CodeRange },
    #[error("{message} (line {})", range.start.line)]
    Indentation { message: String, range: CodeRange },
    #[error("{message} (line {})", range.start.line)]
    Tab { message: String, range: CodeRange },
}

impl ParseError {
    fn syntax(message: impl Into<String>, range: CodeRange) -> Self {
        Self::Syntax {
            message: message.into(),
            range,
        }
    }

    fn indentation(message: impl Into<String>, range: CodeRange) -> Self {
        Self::Indentation {
            message: message.into(),
            range,
        }
    }

    fn from_lex(err: LexError, range: CodeRange) -> Self {
        match err.kind {
            LexErrorKind::Syntax => Self::syntax(err.message, range),
            LexErrorKind::Indentation => Self::indentation(err.message, range),
            LexErrorKind::Tab => Self::Tab {
                message: err.message,
                range,
            },
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Syntax { message, .. } | Self::Indentation { message, .. } | Self::Tab { message, .. } => message,
        }
    }

    #[must_use]
    pub fn range(&self) -> CodeRange {
        match self {
            Self::Syntax { range, .. } | Self::Indentation { range, .. } | Self::Tab { range, .. } => *range,
        }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        match self {
            Self::Syntax { .. } => ExcType::SyntaxError,
            Self::Indentation { .. } => ExcType::IndentationError,
            Self::Tab { .. } => ExcType::TabError,
        }
    }
}

type PResult<T> = Result<T, ParseError>;

/// Parses `source` into a module AST, collecting every diagnostic.
///
/// For [`CodeKind::Eval`] the source must be a single expression, which becomes the only
/// statement of the returned body.
pub fn parse(source: &str, kind: CodeKind, interner: &mut Interner) -> Result<ModuleAst, Vec<ParseError>> {
    let mut state = ParseState {
        interner,
        errors: Vec::new(),
        next_scope: 1,
    };
    let tokens: Vec<Token> = Tokenizer::new(source).collect();
    let mut parser = Parser::new(tokens, &mut state);
    let body = if kind == CodeKind::Eval {
        parser.parse_eval_input()
    } else {
        parser.parse_file()
    };
    if state.errors.is_empty() {
        Ok(ModuleAst {
            body,
            scope_count: state.next_scope,
        })
    } else {
        Err(state.errors)
    }
}

struct ParseState<'i> {
    interner: &'i mut Interner,
    errors: Vec<ParseError>,
    next_scope: u32,
}

impl ParseState<'_> {
    fn new_scope(&mut self) -> ScopeId {
        let id = ScopeId(self.next_scope);
        self.next_scope += 1;
        id
    }
}

#[derive(Clone, Copy, PartialEq)]
enum TargetCtx {
    Assign,
    Delete,
    Augmented,
}

struct Parser<'s, 'i> {
    tokens: Vec<Token>,
    pos: usize,
    prev_end: CodeLoc,
    state: &'s mut ParseState<'i>,
}

impl<'s, 'i> Parser<'s, 'i> {
    fn new(mut tokens: Vec<Token>, state: &'s mut ParseState<'i>) -> Self {
        if !matches!(tokens.last(), Some(Token { kind: TokenKind::EndOfFile, .. })) {
            let end = tokens.last().map(|t| t.range.end).unwrap_or_default();
            tokens.push(Token {
                kind: TokenKind::EndOfFile,
                range: CodeRange::new(end, end),
            });
        }
        Self {
            tokens,
            pos: 0,
            prev_end: CodeLoc::new(1, 1),
            state,
        }
    }

    // ---- token helpers ----

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn peek_nth(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].kind
    }

    fn range(&self) -> CodeRange {
        self.tokens[self.pos.min(self.tokens.len() - 1)].range
    }

    fn start(&self) -> CodeLoc {
        self.range().start
    }

    fn span(&self, start: CodeLoc) -> CodeRange {
        CodeRange::new(start, self.prev_end.max(start))
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        self.prev_end = token.range.end;
        token
    }

    fn at_op(&self, op: Op) -> bool {
        matches!(self.peek(), TokenKind::Op(o) if *o == op)
    }

    fn at_kw(&self, kw: Kw) -> bool {
        matches!(self.peek(), TokenKind::Keyword(k) if *k == kw)
    }

    fn eat_op(&mut self, op: Op) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self) -> ParseError {
        let message = match self.peek() {
            TokenKind::Error(err) => err.message.clone(),
            TokenKind::Indent => return ParseError::indentation("unexpected indent", self.range()),
            TokenKind::EndOfFile => "unexpected EOF while parsing".to_owned(),
            other => format!("invalid syntax: unexpected {other}"),
        };
        ParseError::syntax(message, self.range())
    }

    fn expect_op(&mut self, op: Op) -> PResult<CodeRange> {
        if self.at_op(op) {
            Ok(self.advance().range)
        } else if matches!(self.peek(), TokenKind::Error(_)) {
            Err(self.unexpected())
        } else {
            Err(ParseError::syntax(
                format!("expected '{op}', found {}", self.peek()),
                self.range(),
            ))
        }
    }

    fn expect_kw(&mut self, kw: Kw) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(ParseError::syntax(format!("expected '{kw}'"), self.range()))
        }
    }

    fn expect_name(&mut self) -> PResult<Identifier> {
        if let TokenKind::Name(name) = self.peek() {
            let name = name.clone();
            let name = self.state.interner.intern(&name);
            let range = self.advance().range;
            Ok(Identifier { name, range })
        } else {
            Err(ParseError::syntax(
                format!("expected a name, found {}", self.peek()),
                self.range(),
            ))
        }
    }

    fn record(&mut self, error: ParseError) {
        self.state.errors.push(error);
    }

    fn intern(&mut self, name: &str) -> Identifier {
        Identifier {
            name: self.state.interner.intern(name),
            range: self.range(),
        }
    }

    /// Skips the rest of a broken logical line and any block indented under it.
    fn synchronize(&mut self) {
        loop {
            match self.peek() {
                TokenKind::EndOfFile => return,
                TokenKind::Newline => {
                    self.advance();
                    break;
                }
                _ => {
                    self.advance();
                }
            }
        }
        if matches!(self.peek(), TokenKind::Indent) {
            let mut depth = 0usize;
            loop {
                match self.peek() {
                    TokenKind::EndOfFile => return,
                    TokenKind::Indent => depth += 1,
                    TokenKind::Dedent => {
                        depth -= 1;
                        if depth == 0 {
                            self.advance();
                            return;
                        }
                    }
                    _ => {}
                }
                self.advance();
            }
        }
    }

    // ---- statements ----

    fn parse_file(&mut self) -> Vec<StmtLoc> {
        let mut body = Vec::new();
        loop {
            match self.peek().clone() {
                TokenKind::EndOfFile => break,
                TokenKind::Newline | TokenKind::Dedent => {
                    self.advance();
                }
                TokenKind::Indent => {
                    let range = self.advance().range;
                    self.record(ParseError::indentation("unexpected indent", range));
                }
                TokenKind::Error(err) => {
                    let range = self.advance().range;
                    self.record(ParseError::from_lex(err, range));
                }
                _ => self.parse_statement_into(&mut body),
            }
        }
        body
    }

    fn parse_eval_input(&mut self) -> Vec<StmtLoc> {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
        let start = self.start();
        let result = self.parse_expressions(false);
        match result {
            Ok(expr) => {
                while matches!(self.peek(), TokenKind::Newline | TokenKind::Dedent) {
                    self.advance();
                }
                if !matches!(self.peek(), TokenKind::EndOfFile) {
                    let err = self.unexpected();
                    self.record(err);
                }
                vec![StmtLoc {
                    stmt: Stmt::Expr(expr),
                    range: self.span(start),
                }]
            }
            Err(err) => {
                self.record(err);
                Vec::new()
            }
        }
    }

    fn parse_statement_into(&mut self, body: &mut Vec<StmtLoc>) {
        let start = self.start();
        match self.parse_statement() {
            Ok(stmts) => body.extend(stmts),
            Err(err) => {
                self.record(err);
                self.synchronize();
                body.push(StmtLoc {
                    stmt: Stmt::Error,
                    range: self.span(start),
                });
            }
        }
    }

    fn parse_statement(&mut self) -> PResult<Vec<StmtLoc>> {
        let start = self.start();
        let stmt = match self.peek() {
            TokenKind::Keyword(Kw::If) => self.parse_if()?,
            TokenKind::Keyword(Kw::While) => self.parse_while()?,
            TokenKind::Keyword(Kw::For) => self.parse_for(false)?,
            TokenKind::Keyword(Kw::Try) => self.parse_try()?,
            TokenKind::Keyword(Kw::With) => self.parse_with(false)?,
            TokenKind::Keyword(Kw::Def) => Stmt::FunctionDef(Box::new(self.parse_def(Vec::new(), false, start)?)),
            TokenKind::Keyword(Kw::Class) => Stmt::ClassDef(Box::new(self.parse_class(Vec::new(), start)?)),
            TokenKind::Keyword(Kw::Async) => self.parse_async(Vec::new(), start)?,
            TokenKind::Op(Op::At) => self.parse_decorated()?,
            _ => return self.parse_simple_statements(),
        };
        Ok(vec![StmtLoc {
            stmt,
            range: self.span(start),
        }])
    }

    fn parse_simple_statements(&mut self) -> PResult<Vec<StmtLoc>> {
        let mut stmts = Vec::new();
        loop {
            let start = self.start();
            let stmt = self.parse_small_statement()?;
            stmts.push(StmtLoc {
                stmt,
                range: self.span(start),
            });
            if !self.eat_op(Op::Semi) {
                break;
            }
            if matches!(self.peek(), TokenKind::Newline | TokenKind::EndOfFile) {
                break;
            }
        }
        match self.peek() {
            TokenKind::Newline => {
                self.advance();
            }
            TokenKind::EndOfFile | TokenKind::Dedent => {}
            _ => return Err(self.unexpected()),
        }
        Ok(stmts)
    }

    fn parse_small_statement(&mut self) -> PResult<Stmt> {
        let TokenKind::Keyword(kw) = self.peek() else {
            return self.parse_expression_statement();
        };
        let kw = *kw;
        match kw {
            Kw::Pass => {
                self.advance();
                Ok(Stmt::Pass)
            }
            Kw::Break => {
                self.advance();
                Ok(Stmt::Break)
            }
            Kw::Continue => {
                self.advance();
                Ok(Stmt::Continue)
            }
            Kw::Return => {
                self.advance();
                if self.at_statement_end() {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.parse_expressions(true)?)))
                }
            }
            Kw::Raise => {
                self.advance();
                if self.at_statement_end() {
                    return Ok(Stmt::Raise { exc: None, cause: None });
                }
                let exc = self.parse_test()?;
                let cause = if self.eat_kw(Kw::From) {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                Ok(Stmt::Raise { exc: Some(exc), cause })
            }
            Kw::Global | Kw::Nonlocal => {
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(Op::Comma) {
                    names.push(self.expect_name()?);
                }
                Ok(if kw == Kw::Global {
                    Stmt::Global(names)
                } else {
                    Stmt::Nonlocal(names)
                })
            }
            Kw::Del => {
                self.advance();
                let targets = self.parse_target_list()?;
                let flat = match targets.expr {
                    Expr::Tuple(items) => items,
                    _ => vec![targets],
                };
                for target in &flat {
                    self.check_target(target, TargetCtx::Delete);
                }
                Ok(Stmt::Delete(flat))
            }
            Kw::Assert => {
                self.advance();
                let test = self.parse_test()?;
                let msg = if self.eat_op(Op::Comma) {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                Ok(Stmt::Assert { test, msg })
            }
            Kw::Import => self.parse_import(),
            Kw::From => self.parse_from_import(),
            _ => self.parse_expression_statement(),
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek(),
            TokenKind::Newline | TokenKind::EndOfFile | TokenKind::Op(Op::Semi)
        )
    }

    fn parse_expression_statement(&mut self) -> PResult<Stmt> {
        let first = if self.at_kw(Kw::Yield) {
            self.parse_yield()?
        } else {
            self.parse_expressions(true)?
        };
        if self.at_op(Op::Equal) {
            let mut targets = vec![first];
            let mut value;
            loop {
                self.advance();
                value = if self.at_kw(Kw::Yield) {
                    self.parse_yield()?
                } else {
                    self.parse_expressions(true)?
                };
                if self.at_op(Op::Equal) {
                    targets.push(value);
                } else {
                    break;
                }
            }
            for target in &targets {
                self.check_target(target, TargetCtx::Assign);
            }
            return Ok(Stmt::Assign { targets, value });
        }
        if let TokenKind::Op(op) = self.peek()
            && let Some(operator) = augmented_operator(*op)
        {
            self.advance();
            self.check_target(&first, TargetCtx::Augmented);
            let value = if self.at_kw(Kw::Yield) {
                self.parse_yield()?
            } else {
                self.parse_expressions(false)?
            };
            return Ok(Stmt::AugAssign {
                target: first,
                op: operator,
                value,
            });
        }
        if self.at_op(Op::Colon) {
            self.advance();
            if !matches!(
                first.expr,
                Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. }
            ) {
                self.record(ParseError::syntax(
                    "only single target (not tuple) can be annotated",
                    first.range,
                ));
            }
            let annotation = self.parse_test()?;
            let value = if self.eat_op(Op::Equal) {
                Some(if self.at_kw(Kw::Yield) {
                    self.parse_yield()?
                } else {
                    self.parse_expressions(true)?
                })
            } else {
                None
            };
            return Ok(Stmt::AnnAssign {
                target: first,
                annotation,
                value,
            });
        }
        if matches!(first.expr, Expr::Starred(_)) {
            self.record(ParseError::syntax("can't use starred expression here", first.range));
        }
        Ok(Stmt::Expr(first))
    }

    fn check_target(&mut self, target: &ExprLoc, ctx: TargetCtx) {
        let verb = if ctx == TargetCtx::Delete { "delete" } else { "assign to" };
        let describe = match &target.expr {
            Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. } => return,
            Expr::Tuple(items) | Expr::List(items) if ctx != TargetCtx::Augmented => {
                let mut starred = 0;
                for item in items {
                    if let Expr::Starred(inner) = &item.expr {
                        if ctx == TargetCtx::Delete {
                            self.record(ParseError::syntax("cannot delete starred", item.range));
                        }
                        starred += 1;
                        self.check_target(inner, ctx);
                    } else {
                        self.check_target(item, ctx);
                    }
                }
                if starred > 1 {
                    self.record(ParseError::syntax(
                        "multiple starred expressions in assignment",
                        target.range,
                    ));
                }
                return;
            }
            Expr::Tuple(_) => "tuple",
            Expr::List(_) => "list",
            Expr::Constant(Const::Tuple(items)) if items.is_empty() && ctx == TargetCtx::Assign => return,
            Expr::Constant(_) | Expr::FoldedList(_) | Expr::FoldedDict(_) | Expr::FoldedSet(_) => "literal",
            Expr::Call { .. } => "function call",
            Expr::Starred(_) => {
                self.record(ParseError::syntax(
                    "starred assignment target must be in a list or tuple",
                    target.range,
                ));
                return;
            }
            Expr::Named { .. } => "named expression",
            Expr::Lambda(_) => "lambda",
            Expr::Error => return,
            _ => "expression",
        };
        let message = if ctx == TargetCtx::Augmented {
            format!("'{describe}' is an illegal expression for augmented assignment")
        } else {
            format!("cannot {verb} {describe}")
        };
        self.record(ParseError::syntax(message, target.range));
    }

    fn parse_block(&mut self) -> PResult<Vec<StmtLoc>> {
        self.expect_op(Op::Colon)?;
        if !matches!(self.peek(), TokenKind::Newline) {
            return self.parse_simple_statements();
        }
        self.advance();
        while let TokenKind::Error(err) = self.peek().clone() {
            let range = self.advance().range;
            self.record(ParseError::from_lex(err, range));
        }
        if !matches!(self.peek(), TokenKind::Indent) {
            return Err(ParseError::indentation("expected an indented block", self.range()));
        }
        self.advance();
        let mut body = Vec::new();
        loop {
            match self.peek().clone() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::EndOfFile => break,
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Indent => {
                    let range = self.advance().range;
                    self.record(ParseError::indentation("unexpected indent", range));
                }
                TokenKind::Error(err) => {
                    let range = self.advance().range;
                    self.record(ParseError::from_lex(err, range));
                }
                _ => self.parse_statement_into(&mut body),
            }
        }
        Ok(body)
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        self.advance();
        let test = self.parse_named_test()?;
        let body = self.parse_block()?;
        let orelse = self.parse_else_chain()?;
        Ok(Stmt::If { test, body, orelse })
    }

    fn parse_else_chain(&mut self) -> PResult<Vec<StmtLoc>> {
        if self.at_kw(Kw::Elif) {
            let start = self.start();
            let stmt = self.parse_if()?;
            return Ok(vec![StmtLoc {
                stmt,
                range: self.span(start),
            }]);
        }
        if self.eat_kw(Kw::Else) {
            return self.parse_block();
        }
        Ok(Vec::new())
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        self.advance();
        let test = self.parse_named_test()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_kw(Kw::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt::While { test, body, orelse })
    }

    fn parse_for(&mut self, is_async: bool) -> PResult<Stmt> {
        self.expect_kw(Kw::For)?;
        let target = self.parse_target_list()?;
        self.check_target(&target, TargetCtx::Assign);
        self.expect_kw(Kw::In)?;
        let iter = self.parse_expressions(true)?;
        let body = self.parse_block()?;
        let orelse = if self.eat_kw(Kw::Else) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt::For {
            target,
            iter,
            body,
            orelse,
            is_async,
        })
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        self.advance();
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.at_kw(Kw::Except) {
            let start = self.start();
            self.advance();
            if self.at_op(Op::Star) {
                return Err(ParseError::syntax("exception groups are not supported", self.range()));
            }
            let (kind, name) = if self.at_op(Op::Colon) {
                (None, None)
            } else {
                let kind = self.parse_test()?;
                let name = if self.eat_kw(Kw::As) {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let handler_body = self.parse_block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body: handler_body,
                range: self.span(start),
            });
        }
        for (index, handler) in handlers.iter().enumerate() {
            if handler.kind.is_none() && index + 1 != handlers.len() {
                self.state
                    .errors
                    .push(ParseError::syntax("default 'except:' must be last", handler.range));
            }
        }
        let orelse = if self.at_kw(Kw::Else) {
            if handlers.is_empty() {
                return Err(ParseError::syntax("expected 'except' or 'finally' block", self.range()));
            }
            self.advance();
            self.parse_block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw(Kw::Finally) {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(ParseError::syntax("expected 'except' or 'finally' block", self.range()));
        }
        Ok(Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn parse_with(&mut self, is_async: bool) -> PResult<Stmt> {
        self.expect_kw(Kw::With)?;
        let items = if self.at_op(Op::LParen) {
            match self.try_parenthesized_with_items() {
                Some(items) => items,
                None => self.parse_with_items()?,
            }
        } else {
            self.parse_with_items()?
        };
        let body = self.parse_block()?;
        Ok(Stmt::With { items, body, is_async })
    }

    /// Attempts `with (a as b, c as d):`, rewinding if the parenthesis turns out to belong
    /// to an ordinary expression.
    fn try_parenthesized_with_items(&mut self) -> Option<Vec<WithItem>> {
        let saved_pos = self.pos;
        let saved_end = self.prev_end;
        let saved_errors = self.state.errors.len();
        self.advance();
        match self.parse_parenthesized_with_items() {
            Ok(items) if items.iter().any(|i| i.target.is_some()) || items.len() > 1 => Some(items),
            _ => {
                self.pos = saved_pos;
                self.prev_end = saved_end;
                self.state.errors.truncate(saved_errors);
                None
            }
        }
    }

    fn parse_parenthesized_with_items(&mut self) -> PResult<Vec<WithItem>> {
        let mut items = Vec::new();
        loop {
            if self.at_op(Op::RParen) {
                break;
            }
            items.push(self.parse_with_item()?);
            if !self.eat_op(Op::Comma) {
                break;
            }
        }
        self.expect_op(Op::RParen)?;
        if !self.at_op(Op::Colon) {
            return Err(self.unexpected());
        }
        Ok(items)
    }

    fn parse_with_items(&mut self) -> PResult<Vec<WithItem>> {
        let mut items = vec![self.parse_with_item()?];
        while self.eat_op(Op::Comma) {
            items.push(self.parse_with_item()?);
        }
        Ok(items)
    }

    fn parse_with_item(&mut self) -> PResult<WithItem> {
        let context = self.parse_test()?;
        let target = if self.eat_kw(Kw::As) {
            let target = self.parse_target()?;
            self.check_target(&target, TargetCtx::Assign);
            Some(target)
        } else {
            None
        };
        Ok(WithItem { context, target })
    }

    fn parse_async(&mut self, decorators: Vec<ExprLoc>, start: CodeLoc) -> PResult<Stmt> {
        self.advance();
        match self.peek() {
            TokenKind::Keyword(Kw::Def) => Ok(Stmt::FunctionDef(Box::new(self.parse_def(decorators, true, start)?))),
            TokenKind::Keyword(Kw::For) if decorators.is_empty() => self.parse_for(true),
            TokenKind::Keyword(Kw::With) if decorators.is_empty() => self.parse_with(true),
            _ => Err(self.unexpected()),
        }
    }

    fn parse_decorated(&mut self) -> PResult<Stmt> {
        let start = self.start();
        let mut decorators = Vec::new();
        while self.eat_op(Op::At) {
            decorators.push(self.parse_named_test()?);
            if !matches!(self.peek(), TokenKind::Newline) {
                return Err(self.unexpected());
            }
            self.advance();
        }
        match self.peek() {
            TokenKind::Keyword(Kw::Def) => Ok(Stmt::FunctionDef(Box::new(self.parse_def(decorators, false, start)?))),
            TokenKind::Keyword(Kw::Class) => Ok(Stmt::ClassDef(Box::new(self.parse_class(decorators, start)?))),
            TokenKind::Keyword(Kw::Async) => self.parse_async(decorators, start),
            _ => Err(ParseError::syntax(
                "decorators must be followed by a function or class definition",
                self.range(),
            )),
        }
    }

    fn parse_def(&mut self, decorators: Vec<ExprLoc>, is_async: bool, start: CodeLoc) -> PResult<FunctionDef> {
        self.expect_kw(Kw::Def)?;
        let name = self.expect_name()?;
        self.expect_op(Op::LParen)?;
        let params = self.parse_parameters(Op::RParen, true)?;
        self.expect_op(Op::RParen)?;
        let returns = if self.eat_op(Op::Arrow) {
            Some(self.parse_test()?)
        } else {
            None
        };
        let scope = self.state.new_scope();
        let body = self.parse_block()?;
        Ok(FunctionDef {
            name,
            params,
            body,
            decorators,
            returns,
            is_async,
            is_lambda: false,
            scope,
            range: self.span(start),
        })
    }

    fn parse_parameters(&mut self, close: Op, annotations: bool) -> PResult<Parameters> {
        let mut params = Parameters::default();
        let mut seen_default = false;
        let mut after_star = false;
        let mut seen_names: Vec<crate::intern::StringId> = Vec::new();
        loop {
            if self.at_op(close) {
                break;
            }
            if self.eat_op(Op::Slash) {
                if after_star || !params.posonly.is_empty() || params.args.is_empty() {
                    return Err(ParseError::syntax("invalid '/' in parameter list", self.range()));
                }
                params.posonly = std::mem::take(&mut params.args);
            } else if self.eat_op(Op::DoubleStar) {
                let param = self.parse_parameter(annotations, false)?;
                params.kwarg = Some(param);
                self.eat_op(Op::Comma);
                if !self.at_op(close) {
                    return Err(ParseError::syntax("arguments cannot follow var-keyword argument", self.range()));
                }
                break;
            } else if self.eat_op(Op::Star) {
                if after_star {
                    return Err(ParseError::syntax("* argument may appear only once", self.range()));
                }
                after_star = true;
                if !self.at_op(Op::Comma) && !self.at_op(close) {
                    params.vararg = Some(self.parse_parameter(annotations, false)?);
                } else if self.at_op(close) {
                    return Err(ParseError::syntax("named arguments must follow bare *", self.range()));
                }
            } else {
                let param = self.parse_parameter(annotations, true)?;
                if after_star {
                    params.kwonly.push(param);
                } else {
                    if param.default.is_some() {
                        seen_default = true;
                    } else if seen_default {
                        return Err(ParseError::syntax(
                            "non-default argument follows default argument",
                            param.name.range,
                        ));
                    }
                    params.args.push(param);
                }
            }
            if !self.eat_op(Op::Comma) {
                break;
            }
        }
        for name in params.names() {
            if seen_names.contains(&name.name) {
                let text = self.state.interner.get(name.name).to_owned();
                self.state.errors.push(ParseError::syntax(
                    format!("duplicate argument '{text}' in function definition"),
                    name.range,
                ));
            } else {
                seen_names.push(name.name);
            }
        }
        Ok(params)
    }

    fn parse_parameter(&mut self, annotations: bool, allow_default: bool) -> PResult<Parameter> {
        let name = self.expect_name()?;
        let annotation = if annotations && self.eat_op(Op::Colon) {
            Some(self.parse_test()?)
        } else {
            None
        };
        let default = if allow_default && self.eat_op(Op::Equal) {
            Some(self.parse_test()?)
        } else {
            None
        };
        Ok(Parameter {
            name,
            default,
            annotation,
        })
    }

    fn parse_class(&mut self, decorators: Vec<ExprLoc>, start: CodeLoc) -> PResult<ClassDef> {
        self.expect_kw(Kw::Class)?;
        let name = self.expect_name()?;
        let mut bases = Vec::new();
        let mut keywords = Vec::new();
        if self.eat_op(Op::LParen) {
            for arg in self.parse_arguments()? {
                match arg {
                    Argument::Positional(expr) => bases.push(expr),
                    Argument::Keyword(name, value) => keywords.push((name, value)),
                    Argument::Star(expr) | Argument::DoubleStar(expr) => {
                        self.record(ParseError::syntax("unpacking in class bases is not supported", expr.range));
                    }
                }
            }
        }
        let scope = self.state.new_scope();
        let body = self.parse_block()?;
        Ok(ClassDef {
            name,
            bases,
            keywords,
            body,
            decorators,
            scope,
            range: self.span(start),
        })
    }

    fn parse_import(&mut self) -> PResult<Stmt> {
        self.advance();
        let mut aliases = Vec::new();
        loop {
            let path = self.parse_dotted_name()?;
            let asname = if self.eat_kw(Kw::As) {
                Some(self.expect_name()?)
            } else {
                None
            };
            aliases.push(Alias { path, asname });
            if !self.eat_op(Op::Comma) {
                break;
            }
        }
        Ok(Stmt::Import(aliases))
    }

    fn parse_dotted_name(&mut self) -> PResult<Vec<Identifier>> {
        let mut path = vec![self.expect_name()?];
        while self.eat_op(Op::Dot) {
            path.push(self.expect_name()?);
        }
        Ok(path)
    }

    fn parse_from_import(&mut self) -> PResult<Stmt> {
        self.advance();
        let mut level = 0;
        loop {
            if self.eat_op(Op::Dot) {
                level += 1;
            } else if self.eat_op(Op::Ellipsis) {
                level += 3;
            } else {
                break;
            }
        }
        let module = if self.at_kw(Kw::Import) {
            if level == 0 {
                return Err(self.unexpected());
            }
            Vec::new()
        } else {
            self.parse_dotted_name()?
        };
        self.expect_kw(Kw::Import)?;
        if self.eat_op(Op::Star) {
            return Ok(Stmt::ImportFrom {
                module,
                names: None,
                level,
            });
        }
        let parenthesized = self.eat_op(Op::LParen);
        let mut names = Vec::new();
        loop {
            if parenthesized && self.at_op(Op::RParen) {
                break;
            }
            let name = self.expect_name()?;
            let asname = if self.eat_kw(Kw::As) {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push(Alias {
                path: vec![name],
                asname,
            });
            if !self.eat_op(Op::Comma) {
                break;
            }
            if !parenthesized && self.at_statement_end() {
                return Err(ParseError::syntax(
                    "trailing comma not allowed without surrounding parentheses",
                    self.range(),
                ));
            }
        }
        if parenthesized {
            self.expect_op(Op::RParen)?;
        }
        Ok(Stmt::ImportFrom {
            module,
            names: Some(names),
            level,
        })
    }

    // ---- expressions ----

    /// `a, *b, c` style expression lists; a trailing comma or any comma makes a tuple.
    fn parse_expressions(&mut self, allow_star: bool) -> PResult<ExprLoc> {
        let start = self.start();
        let first = self.parse_list_item(allow_star)?;
        if !self.at_op(Op::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(Op::Comma) {
            if self.at_expression_end() {
                break;
            }
            items.push(self.parse_list_item(allow_star)?);
        }
        Ok(make_tuple(items, self.span(start)))
    }

    fn at_expression_end(&self) -> bool {
        match self.peek() {
            TokenKind::Newline | TokenKind::EndOfFile | TokenKind::Indent | TokenKind::Dedent => true,
            TokenKind::Op(op) => matches!(
                op,
                Op::RParen | Op::RSquare | Op::RBrace | Op::Equal | Op::Semi | Op::Colon
            ) || augmented_operator(*op).is_some(),
            TokenKind::Keyword(kw) => matches!(kw, Kw::In | Kw::For | Kw::If),
            _ => false,
        }
    }

    fn parse_list_item(&mut self, allow_star: bool) -> PResult<ExprLoc> {
        if self.at_op(Op::Star) {
            let start = self.start();
            self.advance();
            let inner = self.parse_binary(0)?;
            let expr = ExprLoc::new(Expr::Starred(Box::new(inner)), self.span(start));
            if !allow_star {
                self.record(ParseError::syntax("can't use starred expression here", expr.range));
            }
            return Ok(expr);
        }
        self.parse_named_test()
    }

    /// Target lists for `for` and `del`: `a, b.c, *d`.
    fn parse_target_list(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let first = self.parse_target()?;
        if !self.at_op(Op::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(Op::Comma) {
            if self.at_kw(Kw::In) || self.at_statement_end() {
                break;
            }
            items.push(self.parse_target()?);
        }
        Ok(ExprLoc::new(Expr::Tuple(items), self.span(start)))
    }

    fn parse_target(&mut self) -> PResult<ExprLoc> {
        if self.at_op(Op::Star) {
            let start = self.start();
            self.advance();
            let inner = self.parse_binary(0)?;
            return Ok(ExprLoc::new(Expr::Starred(Box::new(inner)), self.span(start)));
        }
        self.parse_binary(0)
    }

    fn parse_named_test(&mut self) -> PResult<ExprLoc> {
        if let TokenKind::Name(_) = self.peek()
            && matches!(self.peek_nth(1), TokenKind::Op(Op::ColonEqual))
        {
            let start = self.start();
            let target = self.expect_name()?;
            self.advance();
            let value = self.parse_test()?;
            return Ok(ExprLoc::new(
                Expr::Named {
                    target,
                    value: Box::new(value),
                },
                self.span(start),
            ));
        }
        self.parse_test()
    }

    fn parse_test(&mut self) -> PResult<ExprLoc> {
        if self.at_kw(Kw::Lambda) {
            return self.parse_lambda();
        }
        let start = self.start();
        let body = self.parse_or()?;
        if self.at_kw(Kw::If) {
            self.advance();
            let test = self.parse_or()?;
            self.expect_kw(Kw::Else)?;
            let orelse = self.parse_test()?;
            return Ok(ExprLoc::new(
                Expr::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                self.span(start),
            ));
        }
        Ok(body)
    }

    fn parse_test_no_cond(&mut self) -> PResult<ExprLoc> {
        if self.at_kw(Kw::Lambda) {
            return self.parse_lambda();
        }
        self.parse_or()
    }

    fn parse_lambda(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        self.advance();
        let params = self.parse_parameters(Op::Colon, false)?;
        self.expect_op(Op::Colon)?;
        let scope = self.state.new_scope();
        let body = self.parse_test()?;
        let range = self.span(start);
        let name = self.intern("<lambda>");
        let body_range = body.range;
        Ok(ExprLoc::new(
            Expr::Lambda(Box::new(FunctionDef {
                name: Identifier { range, ..name },
                params,
                body: vec![StmtLoc {
                    stmt: Stmt::Return(Some(body)),
                    range: body_range,
                }],
                decorators: Vec::new(),
                returns: None,
                is_async: false,
                is_lambda: true,
                scope,
                range,
            })),
            range,
        ))
    }

    fn parse_or(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let first = self.parse_and()?;
        if !self.at_kw(Kw::Or) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw(Kw::Or) {
            values.push(self.parse_and()?);
        }
        Ok(ExprLoc::new(Expr::BoolOp { op: BoolOp::Or, values }, self.span(start)))
    }

    fn parse_and(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let first = self.parse_not()?;
        if !self.at_kw(Kw::And) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat_kw(Kw::And) {
            values.push(self.parse_not()?);
        }
        Ok(ExprLoc::new(Expr::BoolOp { op: BoolOp::And, values }, self.span(start)))
    }

    fn parse_not(&mut self) -> PResult<ExprLoc> {
        if self.at_kw(Kw::Not) {
            let start = self.start();
            self.advance();
            let operand = self.parse_not()?;
            return Ok(ExprLoc::new(
                Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                self.span(start),
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let left = self.parse_binary(0)?;
        let mut comparisons = Vec::new();
        while let Some(op) = self.comparison_operator() {
            let right = self.parse_binary(0)?;
            comparisons.push((op, right));
        }
        if comparisons.is_empty() {
            return Ok(left);
        }
        Ok(ExprLoc::new(
            Expr::Compare {
                left: Box::new(left),
                comparisons,
            },
            self.span(start),
        ))
    }

    fn comparison_operator(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            TokenKind::Op(Op::Less) => CmpOp::Lt,
            TokenKind::Op(Op::Greater) => CmpOp::Gt,
            TokenKind::Op(Op::EqEqual) => CmpOp::Eq,
            TokenKind::Op(Op::NotEqual) => CmpOp::NotEq,
            TokenKind::Op(Op::LessEqual) => CmpOp::LtE,
            TokenKind::Op(Op::GreaterEqual) => CmpOp::GtE,
            TokenKind::Keyword(Kw::In) => CmpOp::In,
            TokenKind::Keyword(Kw::Is) => {
                self.advance();
                return Some(if self.eat_kw(Kw::Not) { CmpOp::IsNot } else { CmpOp::Is });
            }
            TokenKind::Keyword(Kw::Not) if matches!(self.peek_nth(1), TokenKind::Keyword(Kw::In)) => {
                self.advance();
                CmpOp::NotIn
            }
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    /// Precedence climbing over the binary operators from `|` up to `*`.
    fn parse_binary(&mut self, min_prec: u8) -> PResult<ExprLoc> {
        let start = self.start();
        let mut left = self.parse_factor()?;
        loop {
            let Some((op, prec)) = self.binary_operator() else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            left = ExprLoc::new(
                Expr::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
                self.span(start),
            );
        }
        Ok(left)
    }

    fn binary_operator(&self) -> Option<(Operator, u8)> {
        let TokenKind::Op(op) = self.peek() else {
            return None;
        };
        Some(match op {
            Op::Pipe => (Operator::BitOr, 1),
            Op::Caret => (Operator::BitXor, 2),
            Op::Amper => (Operator::BitAnd, 3),
            Op::LeftShift => (Operator::LShift, 4),
            Op::RightShift => (Operator::RShift, 4),
            Op::Plus => (Operator::Add, 5),
            Op::Minus => (Operator::Sub, 5),
            Op::Star => (Operator::Mult, 6),
            Op::Slash => (Operator::Div, 6),
            Op::DoubleSlash => (Operator::FloorDiv, 6),
            Op::Percent => (Operator::Mod, 6),
            Op::At => (Operator::MatMult, 6),
            _ => return None,
        })
    }

    fn parse_factor(&mut self) -> PResult<ExprLoc> {
        let op = match self.peek() {
            TokenKind::Op(Op::Minus) => UnaryOp::Neg,
            TokenKind::Op(Op::Plus) => UnaryOp::Pos,
            TokenKind::Op(Op::Tilde) => UnaryOp::Invert,
            _ => return self.parse_power(),
        };
        let start = self.start();
        self.advance();
        let operand = self.parse_factor()?;
        let range = self.span(start);
        if let Expr::Constant(value) = &operand.expr
            && let Some(folded) = fold_unary(op, value)
        {
            return Ok(ExprLoc::new(Expr::Constant(folded), range));
        }
        Ok(ExprLoc::new(
            Expr::Unary {
                op,
                operand: Box::new(operand),
            },
            range,
        ))
    }

    fn parse_power(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let base = if self.at_kw(Kw::Await) {
            self.advance();
            let operand = self.parse_primary()?;
            ExprLoc::new(Expr::Await(Box::new(operand)), self.span(start))
        } else {
            self.parse_primary()?
        };
        if self.eat_op(Op::DoubleStar) {
            let exponent = self.parse_factor()?;
            return Ok(ExprLoc::new(
                Expr::Binary {
                    left: Box::new(base),
                    op: Operator::Pow,
                    right: Box::new(exponent),
                },
                self.span(start),
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                TokenKind::Op(Op::LParen) => {
                    self.advance();
                    let args = self.parse_arguments()?;
                    expr = ExprLoc::new(
                        Expr::Call {
                            func: Box::new(expr),
                            args,
                        },
                        self.span(start),
                    );
                }
                TokenKind::Op(Op::LSquare) => {
                    self.advance();
                    let index = self.parse_subscript()?;
                    self.expect_op(Op::RSquare)?;
                    expr = ExprLoc::new(
                        Expr::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                        self.span(start),
                    );
                }
                TokenKind::Op(Op::Dot) => {
                    self.advance();
                    let attr = self.expect_name()?;
                    expr = ExprLoc::new(
                        Expr::Attribute {
                            value: Box::new(expr),
                            attr,
                        },
                        self.span(start),
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Parses call arguments after `(` up to and including `)`.
    fn parse_arguments(&mut self) -> PResult<Vec<Argument>> {
        let mut args = Vec::new();
        let mut seen_keyword = false;
        let mut seen_double_star = false;
        loop {
            if self.at_op(Op::RParen) {
                break;
            }
            let start = self.start();
            let arg = if self.eat_op(Op::Star) {
                if seen_double_star {
                    self.record(ParseError::syntax(
                        "iterable argument unpacking follows keyword argument unpacking",
                        self.range(),
                    ));
                }
                Argument::Star(self.parse_test()?)
            } else if self.eat_op(Op::DoubleStar) {
                seen_double_star = true;
                Argument::DoubleStar(self.parse_test()?)
            } else if matches!(self.peek(), TokenKind::Name(_)) && matches!(self.peek_nth(1), TokenKind::Op(Op::Equal)) {
                let name = self.expect_name()?;
                self.advance();
                seen_keyword = true;
                Argument::Keyword(name, self.parse_test()?)
            } else {
                let value = self.parse_named_test()?;
                if self.at_kw(Kw::For) || self.at_kw(Kw::Async) {
                    let genexp = self.parse_comprehension_tail(value, None, start, ComprehensionKind::Generator)?;
                    if !args.is_empty() || self.at_op(Op::Comma) && !matches!(self.peek_nth(1), TokenKind::Op(Op::RParen)) {
                        self.record(ParseError::syntax(
                            "Generator expression must be parenthesized",
                            genexp.range,
                        ));
                    }
                    Argument::Positional(genexp)
                } else {
                    if seen_keyword || seen_double_star {
                        self.record(ParseError::syntax(
                            if seen_double_star {
                                "positional argument follows keyword argument unpacking"
                            } else {
                                "positional argument follows keyword argument"
                            },
                            value.range,
                        ));
                    }
                    Argument::Positional(value)
                }
            };
            args.push(arg);
            if !self.eat_op(Op::Comma) {
                break;
            }
        }
        self.expect_op(Op::RParen)?;
        Ok(args)
    }

    fn parse_subscript(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let first = self.parse_slice_item()?;
        if !self.at_op(Op::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(Op::Comma) {
            if self.at_op(Op::RSquare) {
                break;
            }
            items.push(self.parse_slice_item()?);
        }
        Ok(make_tuple(items, self.span(start)))
    }

    fn parse_slice_item(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let lower = if self.at_op(Op::Colon) {
            None
        } else {
            let item = self.parse_list_item(true)?;
            if !self.at_op(Op::Colon) {
                return Ok(item);
            }
            Some(Box::new(item))
        };
        self.expect_op(Op::Colon)?;
        let upper = if self.at_op(Op::Colon) || self.at_op(Op::RSquare) || self.at_op(Op::Comma) {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        let step = if self.eat_op(Op::Colon) {
            if self.at_op(Op::RSquare) || self.at_op(Op::Comma) {
                None
            } else {
                Some(Box::new(self.parse_test()?))
            }
        } else {
            None
        };
        Ok(ExprLoc::new(Expr::Slice { lower, upper, step }, self.span(start)))
    }

    fn parse_atom(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let token = self.peek().clone();
        let expr = match token {
            TokenKind::Name(name) => {
                let id = self.state.interner.intern(&name);
                let range = self.advance().range;
                Expr::Name(Identifier { name: id, range })
            }
            TokenKind::Int(IntLiteral::Small(value)) => {
                self.advance();
                Expr::Constant(Const::Int(value))
            }
            TokenKind::Int(IntLiteral::Big(value)) => {
                self.advance();
                Expr::Constant(Const::BigInt(value))
            }
            TokenKind::Float(value) => {
                self.advance();
                Expr::Constant(Const::Float(value))
            }
            TokenKind::Str(_) | TokenKind::FString(_) => return self.parse_strings(),
            TokenKind::Keyword(Kw::None) => {
                self.advance();
                Expr::Constant(Const::None)
            }
            TokenKind::Keyword(Kw::True) => {
                self.advance();
                Expr::Constant(Const::Bool(true))
            }
            TokenKind::Keyword(Kw::False) => {
                self.advance();
                Expr::Constant(Const::Bool(false))
            }
            TokenKind::Op(Op::Ellipsis) => {
                self.advance();
                Expr::Constant(Const::Ellipsis)
            }
            TokenKind::Op(Op::LParen) => return self.parse_paren(),
            TokenKind::Op(Op::LSquare) => return self.parse_list_display(),
            TokenKind::Op(Op::LBrace) => return self.parse_brace_display(),
            TokenKind::Keyword(Kw::Yield) => {
                let expr = self.parse_yield()?;
                self.record(ParseError::syntax("yield expression must be parenthesized here", expr.range));
                return Ok(expr);
            }
            TokenKind::Error(err) => {
                let range = self.advance().range;
                self.record(ParseError::from_lex(err, range));
                Expr::Error
            }
            _ => return Err(self.unexpected()),
        };
        Ok(ExprLoc::new(expr, self.span(start)))
    }

    fn parse_yield(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        self.expect_kw(Kw::Yield)?;
        if self.eat_kw(Kw::From) {
            let value = self.parse_test()?;
            return Ok(ExprLoc::new(Expr::YieldFrom(Box::new(value)), self.span(start)));
        }
        if self.at_expression_end() || self.at_op(Op::RParen) {
            return Ok(ExprLoc::new(Expr::Yield(None), self.span(start)));
        }
        let value = self.parse_expressions(true)?;
        Ok(ExprLoc::new(Expr::Yield(Some(Box::new(value))), self.span(start)))
    }

    fn parse_paren(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        self.advance();
        if self.eat_op(Op::RParen) {
            return Ok(ExprLoc::new(Expr::Constant(Const::Tuple(Vec::new())), self.span(start)));
        }
        if self.at_kw(Kw::Yield) {
            let expr = self.parse_yield()?;
            self.expect_op(Op::RParen)?;
            return Ok(expr);
        }
        let first = self.parse_list_item(true)?;
        if self.at_kw(Kw::For) || self.at_kw(Kw::Async) {
            let genexp = self.parse_comprehension_tail(first, None, start, ComprehensionKind::Generator)?;
            self.expect_op(Op::RParen)?;
            return Ok(ExprLoc::new(genexp.expr, self.span(start)));
        }
        if self.eat_op(Op::RParen) {
            if matches!(first.expr, Expr::Starred(_)) {
                self.record(ParseError::syntax("cannot use starred expression here", first.range));
            }
            // parentheses only group; the inner range is widened to include them
            return Ok(ExprLoc::new(first.expr, self.span(start)));
        }
        let mut items = vec![first];
        while self.eat_op(Op::Comma) {
            if self.at_op(Op::RParen) {
                break;
            }
            items.push(self.parse_list_item(true)?);
        }
        self.expect_op(Op::RParen)?;
        Ok(make_tuple(items, self.span(start)))
    }

    fn parse_list_display(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        self.advance();
        let mut items = Vec::new();
        if !self.at_op(Op::RSquare) {
            let first = self.parse_list_item(true)?;
            if self.at_kw(Kw::For) || self.at_kw(Kw::Async) {
                let comp = self.parse_comprehension_tail(first, None, start, ComprehensionKind::List)?;
                self.expect_op(Op::RSquare)?;
                return Ok(ExprLoc::new(comp.expr, self.span(start)));
            }
            items.push(first);
            while self.eat_op(Op::Comma) {
                if self.at_op(Op::RSquare) {
                    break;
                }
                items.push(self.parse_list_item(true)?);
            }
        }
        self.expect_op(Op::RSquare)?;
        let range = self.span(start);
        Ok(match constants_of(&items) {
            Some(consts) => ExprLoc::new(Expr::FoldedList(consts), range),
            None => ExprLoc::new(Expr::List(items), range),
        })
    }

    fn parse_brace_display(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        self.advance();
        if self.eat_op(Op::RBrace) {
            return Ok(ExprLoc::new(Expr::FoldedDict(Vec::new()), self.span(start)));
        }
        if self.at_op(Op::DoubleStar) {
            return self.parse_dict_rest(Vec::new(), start);
        }
        let first = self.parse_list_item(true)?;
        if self.eat_op(Op::Colon) {
            let value = self.parse_test()?;
            if self.at_kw(Kw::For) || self.at_kw(Kw::Async) {
                let comp = self.parse_comprehension_tail(first, Some(value), start, ComprehensionKind::Dict)?;
                self.expect_op(Op::RBrace)?;
                return Ok(ExprLoc::new(comp.expr, self.span(start)));
            }
            let mut items = vec![DictItem::Pair(first, value)];
            if self.eat_op(Op::Comma) {
                return self.parse_dict_rest(items, start);
            }
            self.expect_op(Op::RBrace)?;
            return Ok(finish_dict(std::mem::take(&mut items), self.span(start)));
        }
        if self.at_kw(Kw::For) || self.at_kw(Kw::Async) {
            let comp = self.parse_comprehension_tail(first, None, start, ComprehensionKind::Set)?;
            self.expect_op(Op::RBrace)?;
            return Ok(ExprLoc::new(comp.expr, self.span(start)));
        }
        let mut items = vec![first];
        while self.eat_op(Op::Comma) {
            if self.at_op(Op::RBrace) {
                break;
            }
            items.push(self.parse_list_item(true)?);
        }
        self.expect_op(Op::RBrace)?;
        let range = self.span(start);
        Ok(match constants_of(&items) {
            Some(consts) => ExprLoc::new(Expr::FoldedSet(consts), range),
            None => ExprLoc::new(Expr::Set(items), range),
        })
    }

    fn parse_dict_rest(&mut self, mut items: Vec<DictItem>, start: CodeLoc) -> PResult<ExprLoc> {
        loop {
            if self.at_op(Op::RBrace) {
                break;
            }
            if self.eat_op(Op::DoubleStar) {
                items.push(DictItem::Unpack(self.parse_binary(0)?));
            } else {
                let key = self.parse_test()?;
                self.expect_op(Op::Colon)?;
                let value = self.parse_test()?;
                items.push(DictItem::Pair(key, value));
            }
            if !self.eat_op(Op::Comma) {
                break;
            }
        }
        self.expect_op(Op::RBrace)?;
        Ok(finish_dict(items, self.span(start)))
    }

    fn parse_comprehension_tail(
        &mut self,
        element: ExprLoc,
        value: Option<ExprLoc>,
        start: CodeLoc,
        kind: ComprehensionKind,
    ) -> PResult<ExprLoc> {
        if matches!(element.expr, Expr::Starred(_)) {
            self.record(ParseError::syntax("iterable unpacking cannot be used in comprehension", element.range));
        }
        let scope = self.state.new_scope();
        let mut generators = Vec::new();
        loop {
            let is_async = self.eat_kw(Kw::Async);
            if !self.eat_kw(Kw::For) {
                if is_async {
                    return Err(self.unexpected());
                }
                break;
            }
            let target = self.parse_target_list()?;
            self.check_target(&target, TargetCtx::Assign);
            self.expect_kw(Kw::In)?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.eat_kw(Kw::If) {
                ifs.push(self.parse_test_no_cond()?);
            }
            generators.push(ComprehensionFor {
                target,
                iter,
                ifs,
                is_async,
            });
        }
        let comp = Box::new(Comprehension {
            element,
            value,
            generators,
            scope,
        });
        let expr = match kind {
            ComprehensionKind::List => Expr::ListComp(comp),
            ComprehensionKind::Set => Expr::SetComp(comp),
            ComprehensionKind::Dict => Expr::DictComp(comp),
            ComprehensionKind::Generator => Expr::GeneratorExp(comp),
        };
        Ok(ExprLoc::new(expr, self.span(start)))
    }

    /// Concatenates adjacent string literals, producing an f-string if any piece is one.
    fn parse_strings(&mut self) -> PResult<ExprLoc> {
        let start = self.start();
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut text = String::new();
        let mut bytes: Option<Vec<u8>> = None;
        let mut saw_text = false;
        let mut formatted = false;
        loop {
            match self.peek().clone() {
                TokenKind::Str(StrLiteral::Text(piece)) => {
                    self.advance();
                    saw_text = true;
                    text.push_str(&piece);
                }
                TokenKind::Str(StrLiteral::Bytes(piece)) => {
                    self.advance();
                    bytes.get_or_insert_with(Vec::new).extend(piece);
                }
                TokenKind::FString(segments) => {
                    self.advance();
                    saw_text = true;
                    formatted = true;
                    if !text.is_empty() {
                        parts.push(FStringPart::Literal(std::mem::take(&mut text)));
                    }
                    parts.extend(self.convert_fstring(segments)?);
                }
                _ => break,
            }
        }
        let range = self.span(start);
        if let Some(bytes) = bytes {
            if saw_text {
                return Err(ParseError::syntax("cannot mix bytes and nonbytes literals", range));
            }
            return Ok(ExprLoc::new(Expr::Constant(Const::Bytes(bytes)), range));
        }
        if !formatted {
            return Ok(ExprLoc::new(Expr::Constant(Const::Str(text)), range));
        }
        if !text.is_empty() {
            parts.push(FStringPart::Literal(text));
        }
        Ok(ExprLoc::new(Expr::FString(parts), range))
    }

    fn convert_fstring(&mut self, segments: Vec<FStringSegment>) -> PResult<Vec<FStringPart>> {
        let mut parts = Vec::with_capacity(segments.len());
        for segment in segments {
            match segment {
                FStringSegment::Literal(text) => parts.push(FStringPart::Literal(text)),
                FStringSegment::Expr(field) => {
                    let mut sub = Parser::new(field.tokens, &mut *self.state);
                    let value = if sub.at_kw(Kw::Yield) {
                        sub.parse_yield()?
                    } else {
                        sub.parse_expressions(true)?
                    };
                    if !matches!(sub.peek(), TokenKind::EndOfFile) {
                        return Err(ParseError::syntax("f-string: expecting '}'", field.range));
                    }
                    let format_spec = self.convert_fstring(field.format_spec)?;
                    parts.push(FStringPart::Field {
                        value: Box::new(value),
                        conversion: field.conversion,
                        format_spec,
                        self_documenting: field.self_documenting,
                    });
                }
            }
        }
        Ok(parts)
    }
}

#[derive(Clone, Copy)]
enum ComprehensionKind {
    List,
    Set,
    Dict,
    Generator,
}

fn augmented_operator(op: Op) -> Option<Operator> {
    Some(match op {
        Op::PlusEqual => Operator::Add,
        Op::MinusEqual => Operator::Sub,
        Op::StarEqual => Operator::Mult,
        Op::AtEqual => Operator::MatMult,
        Op::SlashEqual => Operator::Div,
        Op::DoubleSlashEqual => Operator::FloorDiv,
        Op::PercentEqual => Operator::Mod,
        Op::DoubleStarEqual => Operator::Pow,
        Op::LeftShiftEqual => Operator::LShift,
        Op::RightShiftEqual => Operator::RShift,
        Op::PipeEqual => Operator::BitOr,
        Op::CaretEqual => Operator::BitXor,
        Op::AmperEqual => Operator::BitAnd,
        _ => return None,
    })
}

/// Returns the constants of a display if every element is one and none is starred.
fn constants_of(items: &[ExprLoc]) -> Option<Vec<Const>> {
    items
        .iter()
        .map(|item| match &item.expr {
            Expr::Constant(value) => Some(value.clone()),
            _ => None,
        })
        .collect()
}

fn make_tuple(items: Vec<ExprLoc>, range: CodeRange) -> ExprLoc {
    match constants_of(&items) {
        Some(consts) => ExprLoc::new(Expr::Constant(Const::Tuple(consts)), range),
        None => ExprLoc::new(Expr::Tuple(items), range),
    }
}

fn finish_dict(items: Vec<DictItem>, range: CodeRange) -> ExprLoc {
    let folded: Option<Vec<(Const, Const)>> = items
        .iter()
        .map(|item| match item {
            DictItem::Pair(
                ExprLoc {
                    expr: Expr::Constant(key),
                    ..
                },
                ExprLoc {
                    expr: Expr::Constant(value),
                    ..
                },
            ) => Some((key.clone(), value.clone())),
            _ => None,
        })
        .collect();
    match folded {
        Some(pairs) => ExprLoc::new(Expr::FoldedDict(pairs), range),
        None => ExprLoc::new(Expr::Dict(items), range),
    }
}

fn fold_unary(op: UnaryOp, value: &Const) -> Option<Const> {
    Some(match (op, value) {
        (UnaryOp::Neg, Const::Int(v)) => match v.checked_neg() {
            Some(n) => Const::Int(n),
            None => Const::BigInt(-BigInt::from(*v)),
        },
        (UnaryOp::Neg, Const::BigInt(v)) => {
            let negated = -v.clone();
            match i64::try_from(&negated) {
                Ok(small) => Const::Int(small),
                Err(_) => Const::BigInt(negated),
            }
        }
        (UnaryOp::Neg, Const::Float(v)) => Const::Float(-v),
        (UnaryOp::Pos, Const::Int(_) | Const::BigInt(_) | Const::Float(_)) => value.clone(),
        (UnaryOp::Invert, Const::Int(v)) => Const::Int(!v),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_ok(source: &str) -> (ModuleAst, Interner) {
        let mut interner = Interner::new();
        let ast = parse(source, CodeKind::Module, &mut interner).unwrap();
        (ast, interner)
    }

    fn parse_errors(source: &str) -> Vec<ParseError> {
        let mut interner = Interner::new();
        parse(source, CodeKind::Module, &mut interner).unwrap_err()
    }

    #[test]
    fn precedence_of_binary_operators() {
        let (ast, _) = parse_ok("x = 1 + 2 * y\n");
        let Stmt::Assign { value, .. } = &ast.body[0].stmt else {
            panic!("expected assignment");
        };
        let Expr::Binary { op, right, .. } = &value.expr else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, Operator::Add);
        assert!(matches!(right.expr, Expr::Binary { op: Operator::Mult, .. }));
    }

    #[test]
    fn constant_displays_are_folded() {
        let (ast, _) = parse_ok("a = [1, 2]\nb = (1, (2, 3))\nc = {1: 'x'}\nd = [1, x]\n");
        let values: Vec<&Expr> = ast
            .body
            .iter()
            .map(|s| match &s.stmt {
                Stmt::Assign { value, .. } => &value.expr,
                _ => panic!("expected assignment"),
            })
            .collect();
        assert!(matches!(values[0], Expr::FoldedList(items) if items.len() == 2));
        assert!(matches!(values[1], Expr::Constant(Const::Tuple(items)) if matches!(items[1], Const::Tuple(_))));
        assert!(matches!(values[2], Expr::FoldedDict(_)));
        assert!(matches!(values[3], Expr::List(_)));
    }

    #[test]
    fn starred_display_is_not_folded() {
        let (ast, _) = parse_ok("a = [*b, 1]\n");
        let Stmt::Assign { value, .. } = &ast.body[0].stmt else {
            panic!("expected assignment");
        };
        assert!(matches!(value.expr, Expr::List(_)));
    }

    #[test]
    fn comprehensions_get_distinct_scopes() {
        let (ast, _) = parse_ok("a = [x for x in y]\nb = {x: 1 for x in y}\n");
        assert_eq!(ast.scope_count, 3);
    }

    #[test]
    fn relative_import_levels() {
        let (ast, _) = parse_ok("from ..pkg import a as b\nfrom . import c\n");
        assert!(matches!(ast.body[0].stmt, Stmt::ImportFrom { level: 2, .. }));
        assert!(matches!(&ast.body[1].stmt, Stmt::ImportFrom { level: 1, module, .. } if module.is_empty()));
    }

    #[test]
    fn raise_from_keeps_cause() {
        let (ast, _) = parse_ok("raise ValueError('x') from err\n");
        assert!(matches!(ast.body[0].stmt, Stmt::Raise { exc: Some(_), cause: Some(_) }));
    }

    #[test]
    fn several_errors_in_one_pass() {
        let errors = parse_errors("x = = 1\ny = 2\nz = )\n");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].range().start.line, 1);
        assert_eq!(errors[1].range().start.line, 3);
    }

    #[test]
    fn lexer_errors_are_reported_with_parse_errors() {
        let errors = parse_errors("a = 'unterminated\nb = 1 +\n");
        assert!(errors.len() >= 2);
    }

    #[test]
    fn indentation_errors_have_their_own_kind() {
        let errors = parse_errors("if x:\npass\n");
        assert_eq!(errors[0].exc_type(), ExcType::IndentationError);
        let errors = parse_errors("if x:\n        a\n\tb\n");
        assert!(errors.iter().any(|e| e.exc_type() == ExcType::TabError));
    }

    #[test]
    fn invalid_targets() {
        let errors = parse_errors("f() = 1\n");
        assert_eq!(errors[0].message(), "cannot assign to function call");
        let errors = parse_errors("a, *b, *c = x\n");
        assert_eq!(errors[0].message(), "multiple starred expressions in assignment");
    }

    #[test]
    fn fstring_fields_parse_as_expressions() {
        let (ast, _) = parse_ok("s = f'{a + 1:>{w}} and {b!r}'\n");
        let Stmt::Assign { value, .. } = &ast.body[0].stmt else {
            panic!("expected assignment");
        };
        let Expr::FString(parts) = &value.expr else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 3);
        let FStringPart::Field { format_spec, .. } = &parts[0] else {
            panic!("expected field");
        };
        assert!(matches!(format_spec[1], FStringPart::Field { .. }));
    }

    #[test]
    fn decorators_and_defaults() {
        let (ast, _) = parse_ok("@dec\ndef f(a, b=2, *args, c, **kw):\n    return a\n");
        let Stmt::FunctionDef(def) = &ast.body[0].stmt else {
            panic!("expected def");
        };
        assert_eq!(def.decorators.len(), 1);
        assert_eq!(def.params.args.len(), 2);
        assert!(def.params.vararg.is_some());
        assert_eq!(def.params.kwonly.len(), 1);
        assert!(def.params.kwarg.is_some());
    }

    #[test]
    fn eval_input_is_a_single_expression() {
        let mut interner = Interner::new();
        let ast = parse("1 + 2", CodeKind::Eval, &mut interner).unwrap();
        assert_eq!(ast.body.len(), 1);
        assert!(parse("x = 1", CodeKind::Eval, &mut interner).is_err());
    }
}
