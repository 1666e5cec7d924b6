//! Abstract syntax tree produced by the parser.
//!
//! Nodes are plain owned trees: every child is owned by exactly one parent and nothing in
//! the tree is mutated after parsing. Scope-introducing nodes (functions, lambdas, classes
//! and comprehensions) carry the [`ScopeId`] assigned by the parser so the binder and the
//! lowering pass agree on scope identity without a side table keyed by node address.
//!
//! The whole tree derives serde so a parsed and bound unit can be stored as a code image.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::{intern::StringId, source::CodeRange};

/// Index of a lexical scope. Scope 0 is always the module scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub const MODULE: Self = Self(0);

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An identifier together with where it appeared.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    pub name: StringId,
    pub range: CodeRange,
}

/// A compile-time constant.
///
/// Tuples of constants are constants themselves, which is what lets nested constant
/// tuples fold into a single shared value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    BigInt(BigInt),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Const>),
}

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr)]
pub enum Operator {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mult,
    #[strum(serialize = "@")]
    MatMult,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "//")]
    FloorDiv,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "**")]
    Pow,
    #[strum(serialize = "<<")]
    LShift,
    #[strum(serialize = ">>")]
    RShift,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "&")]
    BitAnd,
}

impl Operator {
    /// Name of the forward special method, e.g. `__add__`.
    #[must_use]
    pub fn dunder(self) -> &'static str {
        match self {
            Self::Add => "__add__",
            Self::Sub => "__sub__",
            Self::Mult => "__mul__",
            Self::MatMult => "__matmul__",
            Self::Div => "__truediv__",
            Self::FloorDiv => "__floordiv__",
            Self::Mod => "__mod__",
            Self::Pow => "__pow__",
            Self::LShift => "__lshift__",
            Self::RShift => "__rshift__",
            Self::BitOr => "__or__",
            Self::BitXor => "__xor__",
            Self::BitAnd => "__and__",
        }
    }

    /// Name of the reflected special method, e.g. `__radd__`.
    #[must_use]
    pub fn reflected_dunder(self) -> &'static str {
        match self {
            Self::Add => "__radd__",
            Self::Sub => "__rsub__",
            Self::Mult => "__rmul__",
            Self::MatMult => "__rmatmul__",
            Self::Div => "__rtruediv__",
            Self::FloorDiv => "__rfloordiv__",
            Self::Mod => "__rmod__",
            Self::Pow => "__rpow__",
            Self::LShift => "__rlshift__",
            Self::RShift => "__rrshift__",
            Self::BitOr => "__ror__",
            Self::BitXor => "__rxor__",
            Self::BitAnd => "__rand__",
        }
    }

    /// Name of the in-place special method, e.g. `__iadd__`.
    #[must_use]
    pub fn inplace_dunder(self) -> &'static str {
        match self {
            Self::Add => "__iadd__",
            Self::Sub => "__isub__",
            Self::Mult => "__imul__",
            Self::MatMult => "__imatmul__",
            Self::Div => "__itruediv__",
            Self::FloorDiv => "__ifloordiv__",
            Self::Mod => "__imod__",
            Self::Pow => "__ipow__",
            Self::LShift => "__ilshift__",
            Self::RShift => "__irshift__",
            Self::BitOr => "__ior__",
            Self::BitXor => "__ixor__",
            Self::BitAnd => "__iand__",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum UnaryOp {
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "+")]
    Pos,
    #[strum(serialize = "~")]
    Invert,
}

impl UnaryOp {
    #[must_use]
    pub fn dunder(self) -> &'static str {
        match self {
            Self::Not => "__bool__",
            Self::Neg => "__neg__",
            Self::Pos => "__pos__",
            Self::Invert => "__invert__",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum CmpOp {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    NotEq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    LtE,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    GtE,
    #[strum(serialize = "is")]
    Is,
    #[strum(serialize = "is not")]
    IsNot,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "not in")]
    NotIn,
}

impl CmpOp {
    /// Special method for rich comparisons. `None` for identity and membership tests.
    #[must_use]
    pub fn dunder(self) -> Option<&'static str> {
        match self {
            Self::Eq => Some("__eq__"),
            Self::NotEq => Some("__ne__"),
            Self::Lt => Some("__lt__"),
            Self::LtE => Some("__le__"),
            Self::Gt => Some("__gt__"),
            Self::GtE => Some("__ge__"),
            Self::Is | Self::IsNot | Self::In | Self::NotIn => None,
        }
    }

    /// The comparison tried on the right operand when the left one declines.
    #[must_use]
    pub fn swapped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::LtE => Self::GtE,
            Self::Gt => Self::Lt,
            Self::GtE => Self::LtE,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprLoc {
    pub expr: Expr,
    pub range: CodeRange,
}

impl ExprLoc {
    #[must_use]
    pub fn new(expr: Expr, range: CodeRange) -> Self {
        Self { expr, range }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Constant(Const),
    /// A list display whose elements were all constants.
    FoldedList(Vec<Const>),
    FoldedSet(Vec<Const>),
    FoldedDict(Vec<(Const, Const)>),
    Name(Identifier),
    Attribute {
        value: Box<ExprLoc>,
        attr: Identifier,
    },
    Subscript {
        value: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    Slice {
        lower: Option<Box<ExprLoc>>,
        upper: Option<Box<ExprLoc>>,
        step: Option<Box<ExprLoc>>,
    },
    Call {
        func: Box<ExprLoc>,
        args: Vec<Argument>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<ExprLoc>,
    },
    Binary {
        left: Box<ExprLoc>,
        op: Operator,
        right: Box<ExprLoc>,
    },
    BoolOp {
        op: BoolOp,
        values: Vec<ExprLoc>,
    },
    /// Chained comparison: `left op0 c0 op1 c1 ...`.
    Compare {
        left: Box<ExprLoc>,
        comparisons: Vec<(CmpOp, ExprLoc)>,
    },
    IfExp {
        test: Box<ExprLoc>,
        body: Box<ExprLoc>,
        orelse: Box<ExprLoc>,
    },
    Lambda(Box<FunctionDef>),
    Tuple(Vec<ExprLoc>),
    List(Vec<ExprLoc>),
    Set(Vec<ExprLoc>),
    Dict(Vec<DictItem>),
    Starred(Box<ExprLoc>),
    ListComp(Box<Comprehension>),
    SetComp(Box<Comprehension>),
    DictComp(Box<Comprehension>),
    GeneratorExp(Box<Comprehension>),
    Yield(Option<Box<ExprLoc>>),
    YieldFrom(Box<ExprLoc>),
    Await(Box<ExprLoc>),
    /// Assignment expression `name := value`.
    Named {
        target: Identifier,
        value: Box<ExprLoc>,
    },
    FString(Vec<FStringPart>),
    /// Placeholder left by error recovery. Never reaches lowering.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Argument {
    Positional(ExprLoc),
    Star(ExprLoc),
    Keyword(Identifier, ExprLoc),
    DoubleStar(ExprLoc),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DictItem {
    Pair(ExprLoc, ExprLoc),
    Unpack(ExprLoc),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FStringPart {
    Literal(String),
    Field {
        value: Box<ExprLoc>,
        conversion: Option<char>,
        format_spec: Vec<FStringPart>,
        /// Literal `expr=` text emitted before the value.
        self_documenting: Option<String>,
    },
}

/// Any comprehension. `element` is the key for dict comprehensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comprehension {
    pub element: ExprLoc,
    pub value: Option<ExprLoc>,
    pub generators: Vec<ComprehensionFor>,
    pub scope: ScopeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensionFor {
    pub target: ExprLoc,
    pub iter: ExprLoc,
    pub ifs: Vec<ExprLoc>,
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: Identifier,
    pub default: Option<ExprLoc>,
    pub annotation: Option<ExprLoc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub posonly: Vec<Parameter>,
    pub args: Vec<Parameter>,
    pub vararg: Option<Parameter>,
    pub kwonly: Vec<Parameter>,
    pub kwarg: Option<Parameter>,
}

impl Parameters {
    /// Parameter names in frame-slot order: positional, `*args`, keyword-only, `**kwargs`.
    pub fn names(&self) -> impl Iterator<Item = &Identifier> {
        self.posonly
            .iter()
            .chain(&self.args)
            .map(|p| &p.name)
            .chain(self.vararg.iter().map(|p| &p.name))
            .chain(self.kwonly.iter().map(|p| &p.name))
            .chain(self.kwarg.iter().map(|p| &p.name))
    }

    pub fn all(&self) -> impl Iterator<Item = &Parameter> {
        self.posonly
            .iter()
            .chain(&self.args)
            .chain(&self.vararg)
            .chain(&self.kwonly)
            .chain(&self.kwarg)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: Identifier,
    pub params: Parameters,
    pub body: Vec<StmtLoc>,
    pub decorators: Vec<ExprLoc>,
    pub returns: Option<ExprLoc>,
    pub is_async: bool,
    pub is_lambda: bool,
    pub scope: ScopeId,
    pub range: CodeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: Identifier,
    pub bases: Vec<ExprLoc>,
    pub keywords: Vec<(Identifier, ExprLoc)>,
    pub body: Vec<StmtLoc>,
    pub decorators: Vec<ExprLoc>,
    pub scope: ScopeId,
    pub range: CodeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptHandler {
    pub kind: Option<ExprLoc>,
    pub name: Option<Identifier>,
    pub body: Vec<StmtLoc>,
    pub range: CodeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithItem {
    pub context: ExprLoc,
    pub target: Option<ExprLoc>,
}

/// `name` or `name as alias` in an import. Dotted names keep their components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub path: Vec<Identifier>,
    pub asname: Option<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StmtLoc {
    pub stmt: Stmt,
    pub range: CodeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Expr(ExprLoc),
    Assign {
        targets: Vec<ExprLoc>,
        value: ExprLoc,
    },
    AugAssign {
        target: ExprLoc,
        op: Operator,
        value: ExprLoc,
    },
    AnnAssign {
        target: ExprLoc,
        annotation: ExprLoc,
        value: Option<ExprLoc>,
    },
    Delete(Vec<ExprLoc>),
    Pass,
    Break,
    Continue,
    Return(Option<ExprLoc>),
    Raise {
        exc: Option<ExprLoc>,
        cause: Option<ExprLoc>,
    },
    Global(Vec<Identifier>),
    Nonlocal(Vec<Identifier>),
    If {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    While {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    For {
        target: ExprLoc,
        iter: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
        is_async: bool,
    },
    Try {
        body: Vec<StmtLoc>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<StmtLoc>,
        finalbody: Vec<StmtLoc>,
    },
    With {
        items: Vec<WithItem>,
        body: Vec<StmtLoc>,
        is_async: bool,
    },
    Assert {
        test: ExprLoc,
        msg: Option<ExprLoc>,
    },
    Import(Vec<Alias>),
    /// `from ..pkg import a, b`. `names` is `None` for `import *`.
    ImportFrom {
        module: Vec<Identifier>,
        names: Option<Vec<Alias>>,
        level: u32,
    },
    FunctionDef(Box<FunctionDef>),
    ClassDef(Box<ClassDef>),
    Error,
}

/// A parsed compilation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleAst {
    pub body: Vec<StmtLoc>,
    /// Number of scopes allocated by the parser, including the module scope.
    pub scope_count: u32,
}
