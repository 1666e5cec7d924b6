//! The lowered operation tree.
//!
//! This is what both execution backends consume: the tree interpreter in `interp` and the
//! closure compiler in `delegate`. Every name is already resolved to its storage, every
//! dynamic operation carries its call site, and every `yield` has been hoisted out of
//! expressions into a statement of its own with a unit-wide resume index.
//!
//! A generator frame resumes at index `K` by walking from the top of the body into the
//! statement whose [`Stmt::yields`] range contains `K`. Compound statements keep whatever
//! they need to re-enter (loop iterators, the exception being handled, a pending `finally`
//! outcome) in frame temporaries, so re-entry never re-evaluates anything.

use std::{ops::Range, sync::Arc};

use crate::{
    expressions::{BoolOp, CmpOp, Operator, UnaryOp},
    modes::CompilationMode,
    sites::{AttrSite, BinarySite, CompareSite, InplaceSite, InvokeSite},
    source::{CodeKind, TieringPolicy},
    types::{DictStorage, FunctionCode, SetStorage},
    value::Value,
};

/// Facts shared by every code object of one compiled unit.
#[derive(Debug)]
pub struct UnitInfo {
    pub filename: Arc<str>,
    pub kind: CodeKind,
    pub mode: CompilationMode,
    /// Global names referenced anywhere in the unit; `NameRef::Global(i)` indexes this.
    pub global_names: Vec<Arc<str>>,
    pub tiering: Option<TieringPolicy>,
    pub inline_caches: bool,
}

/// Where a name lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameRef {
    /// Fast local slot.
    Fast(u32),
    /// Index into the frame's cell array: own cells, then closure cells.
    Cell(u32),
    /// Index into [`UnitInfo::global_names`].
    Global(u32),
    /// The frame's locals namespace if it has one, otherwise `fallback`. Class bodies and
    /// exec/eval units with separate locals use this.
    Local { fallback: Box<NameRef> },
}

#[derive(Debug, Clone)]
pub struct Name {
    pub name: Arc<str>,
    pub target: NameRef,
}

#[derive(Debug)]
pub enum Expr {
    Const(Value),
    /// A literal whose elements are all constants. Each evaluation yields a fresh list that
    /// shares this storage until one of them is mutated.
    FoldedList(Arc<Vec<Value>>),
    FoldedSet(Arc<SetStorage>),
    FoldedDict(Arc<DictStorage>),
    Load(Name),
    Temp(u32),
    Attr {
        value: Box<Expr>,
        name: Arc<str>,
        site: Arc<AttrSite>,
    },
    Item {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Arg>,
        site: Arc<InvokeSite>,
    },
    /// Zero-argument `super()`: resolved from the `__class__` cell and the first parameter
    /// when `func` evaluates to the builtin `super`.
    Super {
        func: Box<Expr>,
        class_cell: u32,
        receiver: Name,
        site: Arc<InvokeSite>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: Operator,
        right: Box<Expr>,
        site: Arc<BinarySite>,
    },
    BoolOp {
        op: BoolOp,
        values: Vec<Expr>,
    },
    Compare {
        left: Box<Expr>,
        rest: Vec<CompareStep>,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },
    /// Creates a function object.
    Function(Arc<FunctionTemplate>),
    /// Creates the comprehension function and calls it with `iter(iterable)`.
    Comprehension {
        template: Arc<FunctionTemplate>,
        iterable: Box<Expr>,
    },
    Tuple(Vec<Elem>),
    List(Vec<Elem>),
    Set(Vec<Elem>),
    Dict(Vec<DictElem>),
    Named {
        target: Name,
        value: Box<Expr>,
    },
    FString(Vec<FPart>),
}

#[derive(Debug)]
pub struct CompareStep {
    pub op: CmpOp,
    pub right: Expr,
    /// Rich comparisons only; identity and membership tests are not cached.
    pub site: Option<Arc<CompareSite>>,
}

#[derive(Debug)]
pub enum Elem {
    Plain(Expr),
    Star(Expr),
}

#[derive(Debug)]
pub enum DictElem {
    Pair(Expr, Expr),
    Unpack(Expr),
}

#[derive(Debug)]
pub enum Arg {
    Positional(Expr),
    Star(Expr),
    Keyword(Arc<str>, Expr),
    DoubleStar(Expr),
}

#[derive(Debug)]
pub enum FPart {
    Literal(Arc<str>),
    Field {
        value: Expr,
        conversion: Option<char>,
        spec: Vec<FPart>,
    },
}

/// Everything needed to create a function object at a `def`, `lambda` or comprehension.
#[derive(Debug)]
pub struct FunctionTemplate {
    pub code: Arc<FunctionCode>,
    pub defaults: Vec<Expr>,
    pub kw_defaults: Vec<(Arc<str>, Expr)>,
    /// Cells of the defining frame captured as the new function's closure, in the order of
    /// the code's free names.
    pub closure: Vec<u32>,
}

/// An assignment target.
#[derive(Debug)]
pub enum Target {
    Name(Name),
    Attr { value: Expr, name: Arc<str> },
    Item { value: Expr, index: Expr },
    Unpack { items: Vec<Target>, star: Option<usize> },
}

/// The target of an augmented assignment. Its object and index are evaluated once.
#[derive(Debug)]
pub enum AugTarget {
    Name(Name),
    Attr {
        value: Expr,
        name: Arc<str>,
        site: Arc<AttrSite>,
    },
    Item { value: Expr, index: Expr },
}

#[derive(Debug)]
pub struct Handler {
    /// `None` for a bare `except:`.
    pub kind: Option<Expr>,
    pub name: Option<Name>,
    pub body: Vec<Stmt>,
}

/// What a comprehension body adds to its accumulator.
#[derive(Debug)]
pub enum Collect {
    List(Expr),
    Set(Expr),
    Dict(Expr, Expr),
}

#[derive(Debug)]
pub struct ClassNode {
    pub name: Arc<str>,
    pub qualname: Arc<str>,
    pub bases: Vec<Elem>,
    pub keywords: Vec<(Arc<str>, Expr)>,
    pub body: Arc<FunctionCode>,
    /// Cells of the defining frame the class body closes over.
    pub closure: Vec<u32>,
    pub decorators: Vec<Expr>,
    pub target: Name,
    /// Index of the body's own `__class__` cell when a method uses `super()`.
    pub class_cell: Option<u32>,
}

#[derive(Debug)]
pub struct ImportName {
    /// Name in the source module.
    pub name: Arc<str>,
    pub target: Name,
}

#[derive(Debug)]
pub enum StmtKind {
    Expr(Expr),
    Assign {
        targets: Vec<Target>,
        value: Expr,
    },
    AugAssign {
        target: AugTarget,
        op: Operator,
        value: Expr,
        site: Arc<InplaceSite>,
    },
    Delete(Vec<Target>),
    SetTemp(u32, Expr),
    Pass,
    Break,
    Continue,
    Return(Option<Expr>),
    Raise {
        exc: Option<Expr>,
        cause: Option<Expr>,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },
    For {
        target: Target,
        iter: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        /// Holds the iterator while the loop runs.
        iter_temp: u32,
    },
    Try {
        body: Vec<Stmt>,
        handlers: Vec<Handler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
        /// The exception being handled, while a handler runs.
        exc_temp: u32,
        /// The outcome `finally` resumes after it completes.
        pending_temp: u32,
    },
    With {
        context: Expr,
        target: Option<Target>,
        body: Vec<Stmt>,
        /// Holds the context manager while the body runs.
        manager_temp: u32,
    },
    Assert {
        test: Expr,
        msg: Option<Expr>,
    },
    /// `import a.b.c` binds `a`; `import a.b.c as x` binds the leaf module.
    Import {
        module: Arc<str>,
        target: Name,
        bind_leaf: bool,
    },
    ImportFrom {
        module: Arc<str>,
        level: u32,
        names: Vec<ImportName>,
    },
    ImportStar {
        module: Arc<str>,
        level: u32,
    },
    Def {
        template: Arc<FunctionTemplate>,
        decorators: Vec<Expr>,
        target: Name,
    },
    Class(Box<ClassNode>),
    Yield {
        index: u32,
        value: Option<Expr>,
        /// Receives the sent value.
        into: Option<u32>,
    },
    /// `yield from` and `await`: delegates to a sub-iterator until it is exhausted.
    YieldFrom {
        index: u32,
        value: Expr,
        iter_temp: u32,
        into: Option<u32>,
        is_await: bool,
    },
    /// Adds to a comprehension accumulator held in a temp.
    Append {
        temp: u32,
        value: Collect,
    },
}

#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
    /// Resume indexes of the yields this statement contains; empty if none.
    pub yields: Range<u32>,
}

impl Stmt {
    #[must_use]
    pub fn new(kind: StmtKind, line: u32) -> Self {
        let yields = yield_span(&kind);
        Self { kind, line, yields }
    }

    #[must_use]
    pub fn contains_yield(&self, index: u32) -> bool {
        self.yields.contains(&index)
    }
}

/// Whether any statement of `block` contains resume point `index`.
#[must_use]
pub fn block_contains(block: &[Stmt], index: u32) -> bool {
    block.iter().any(|stmt| stmt.contains_yield(index))
}

fn block_span(block: &[Stmt]) -> Option<Range<u32>> {
    let start = block.iter().filter(|s| !s.yields.is_empty()).map(|s| s.yields.start).min()?;
    let end = block.iter().map(|s| s.yields.end).max()?;
    Some(start..end)
}

fn yield_span(kind: &StmtKind) -> Range<u32> {
    let blocks: Vec<&[Stmt]> = match kind {
        StmtKind::Yield { index, .. } | StmtKind::YieldFrom { index, .. } => return *index..*index + 1,
        StmtKind::If { body, orelse, .. } | StmtKind::While { body, orelse, .. } | StmtKind::For { body, orelse, .. } => {
            vec![body, orelse]
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        } => {
            let mut blocks: Vec<&[Stmt]> = vec![body, orelse, finalbody];
            blocks.extend(handlers.iter().map(|h| h.body.as_slice()));
            blocks
        }
        StmtKind::With { body, .. } => vec![body],
        _ => return 0..0,
    };
    let spans: Vec<Range<u32>> = blocks.into_iter().filter_map(block_span).collect();
    match (spans.iter().map(|r| r.start).min(), spans.iter().map(|r| r.end).max()) {
        (Some(start), Some(end)) => start..end,
        _ => 0..0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yield_stmt(index: u32) -> Stmt {
        Stmt::new(
            StmtKind::Yield {
                index,
                value: None,
                into: None,
            },
            1,
        )
    }

    #[test]
    fn compound_statements_span_their_yields() {
        let stmt = Stmt::new(
            StmtKind::If {
                test: Expr::Const(Value::Bool(true)),
                body: vec![yield_stmt(3), Stmt::new(StmtKind::Pass, 2)],
                orelse: vec![yield_stmt(4)],
            },
            1,
        );
        assert_eq!(stmt.yields, 3..5);
        assert!(stmt.contains_yield(4));
        assert!(!stmt.contains_yield(5));
        assert!(Stmt::new(StmtKind::Pass, 1).yields.is_empty());
    }
}
