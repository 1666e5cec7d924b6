//! Scope binding: classifies every identifier of a parsed unit.
//!
//! Binding runs in two sub-passes. The collector walks the AST once, recording for every
//! scope the names it binds, the names it reads and its `global`/`nonlocal` declarations,
//! together with the structural flags the runtime needs (generator, coroutine, try/finally,
//! varargs, locals introspection). The resolver then classifies each name:
//!
//! * bound in a function scope and not declared: [`VariableKind::Local`] (or `Parameter`)
//! * bound in a function scope and read by a nested scope: promoted to [`VariableKind::Cell`]
//! * read but not bound: resolved outward through enclosing function scopes (class scopes
//!   are transparent) to [`VariableKind::Free`], falling back to an implicit global
//!
//! Intermediate scopes between a free variable and its owner receive the variable as a
//! pass-through free variable so closures can hand the cell down.
//!
//! Every problem found here is a compile-time [`BindError`]; nothing is deferred to runtime.
//!
//! Namespace layout for function frames follows `[params][other locals]` for fast slots and
//! `[cell_vars][free_vars]` for the closure-cell array.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::{
    expressions::{
        Argument, ClassDef, Comprehension, DictItem, Expr, ExprLoc, FStringPart, FunctionDef, Identifier, ModuleAst,
        ScopeId, Stmt, StmtLoc,
    },
    intern::{Interner, StringId},
    source::CodeRange,
};

/// A binding diagnostic (invalid `global`/`nonlocal`, misplaced `return`, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (line {})", range.start.line)]
pub struct BindError {
    pub message: String,
    pub range: CodeRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Module,
    Function,
    Class,
    Comprehension,
}

/// Storage class of one name within one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableKind {
    Local,
    Parameter,
    /// `explicit` is true for names declared with `global`.
    Global { explicit: bool },
    /// Owned by this scope and shared with nested scopes through a cell.
    Cell,
    /// Owned by an enclosing function scope.
    Free,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFlags {
    pub is_generator: bool,
    pub is_coroutine: bool,
    pub contains_try_finally: bool,
    pub has_varargs: bool,
    pub has_kwargs: bool,
    /// Calls `locals()`, `vars()`, `exec` or `eval`, so its locals are observable by name.
    pub uses_locals: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: Option<StringId>,
    pub parent: Option<ScopeId>,
    pub variables: IndexMap<StringId, VariableKind>,
    pub flags: ScopeFlags,
    /// Parameter names in slot order.
    pub params: Vec<StringId>,
    /// Names whose cells this scope creates, parameters first.
    pub cell_vars: Vec<StringId>,
    /// Names whose cells this scope receives from its closure.
    pub free_vars: Vec<StringId>,
    /// Fast-slot names: parameters followed by other locals. Empty for module and class scopes.
    pub fast_locals: Vec<StringId>,
}

impl Scope {
    /// Generator and introspected frames must outlive a single activation.
    #[must_use]
    pub fn needs_heap_frame(&self) -> bool {
        self.flags.is_generator || self.flags.uses_locals
    }

    #[must_use]
    pub fn kind_of(&self, name: StringId) -> Option<VariableKind> {
        self.variables.get(&name).copied()
    }

    #[must_use]
    pub fn slot(&self, name: StringId) -> Option<usize> {
        self.fast_locals.iter().position(|n| *n == name)
    }

    /// Index of `name` in the closure-cell array (`cell_vars` then `free_vars`).
    #[must_use]
    pub fn closure_index(&self, name: StringId) -> Option<usize> {
        if let Some(i) = self.cell_vars.iter().position(|n| *n == name) {
            return Some(i);
        }
        self.free_vars
            .iter()
            .position(|n| *n == name)
            .map(|i| i + self.cell_vars.len())
    }

    fn is_function_like(&self) -> bool {
        matches!(self.kind, ScopeKind::Function | ScopeKind::Comprehension)
    }
}

/// Result of binding one unit: every scope indexed by [`ScopeId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeTree {
    pub scopes: Vec<Scope>,
    /// Every name stored in the unit's global namespace, in first-reference order.
    pub global_names: Vec<StringId>,
}

impl ScopeTree {
    #[must_use]
    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.index()]
    }
}

/// Identifiers the binder treats specially.
struct WellKnown {
    super_: StringId,
    class_cell: StringId,
    comprehension_arg: StringId,
    introspection: [StringId; 4],
}

/// Binds a parsed unit.
pub fn bind(ast: &ModuleAst, interner: &mut Interner) -> Result<ScopeTree, Vec<BindError>> {
    let names = WellKnown {
        super_: interner.intern("super"),
        class_cell: interner.intern("__class__"),
        comprehension_arg: interner.intern(".0"),
        introspection: [
            interner.intern("locals"),
            interner.intern("vars"),
            interner.intern("exec"),
            interner.intern("eval"),
        ],
    };
    let mut collector = Collector {
        scopes: (0..ast.scope_count).map(|_| ScopeInfo::default()).collect(),
        current: ScopeId::MODULE,
        loop_depth: 0,
        errors: Vec::new(),
        names: &names,
        interner: &*interner,
    };
    collector.scopes[0].kind = Some(ScopeKind::Module);
    for stmt in &ast.body {
        collector.visit_stmt(stmt);
    }
    let Collector {
        scopes, mut errors, ..
    } = collector;
    let tree = resolve(scopes, &names, interner, &mut errors);
    if errors.is_empty() { Ok(tree) } else { Err(errors) }
}

#[derive(Debug, Default)]
struct ScopeInfo {
    kind: Option<ScopeKind>,
    name: Option<StringId>,
    parent: Option<ScopeId>,
    bound: IndexSet<StringId>,
    used: IndexSet<StringId>,
    globals: IndexSet<StringId>,
    nonlocals: IndexMap<StringId, CodeRange>,
    params: Vec<StringId>,
    flags: ScopeFlags,
    is_async: bool,
    uses_class_cell: bool,
}

struct Collector<'a> {
    scopes: Vec<ScopeInfo>,
    current: ScopeId,
    loop_depth: u32,
    errors: Vec<BindError>,
    names: &'a WellKnown,
    interner: &'a Interner,
}

impl Collector<'_> {
    fn scope(&mut self) -> &mut ScopeInfo {
        &mut self.scopes[self.current.index()]
    }

    fn kind(&self) -> ScopeKind {
        self.scopes[self.current.index()].kind.unwrap_or(ScopeKind::Module)
    }

    fn error(&mut self, message: impl Into<String>, range: CodeRange) {
        self.errors.push(BindError {
            message: message.into(),
            range,
        });
    }

    fn text(&self, name: StringId) -> &str {
        self.interner.get(name)
    }

    fn bind_name(&mut self, name: StringId) {
        self.scope().bound.insert(name);
    }

    fn use_name(&mut self, ident: &Identifier) {
        let name = ident.name;
        if name == self.names.super_ || name == self.names.class_cell {
            self.scope().uses_class_cell = true;
        }
        if self.names.introspection.contains(&name) {
            self.scope().flags.uses_locals = true;
        }
        self.scope().used.insert(name);
    }

    /// Enters a new scope, runs `f`, and restores the enclosing scope and loop state.
    fn with_scope(&mut self, id: ScopeId, kind: ScopeKind, name: Option<StringId>, f: impl FnOnce(&mut Self)) {
        let parent = self.current;
        {
            let info = &mut self.scopes[id.index()];
            info.kind = Some(kind);
            info.name = name;
            info.parent = Some(parent);
        }
        let saved_loop = self.loop_depth;
        self.current = id;
        self.loop_depth = 0;
        f(self);
        self.current = parent;
        self.loop_depth = saved_loop;
    }

    fn visit_body(&mut self, body: &[StmtLoc]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &StmtLoc) {
        match &stmt.stmt {
            Stmt::Expr(expr) => self.visit_expr(expr),
            Stmt::Assign { targets, value } => {
                self.visit_expr(value);
                for target in targets {
                    self.visit_target(target);
                }
            }
            Stmt::AugAssign { target, value, .. } => {
                self.visit_expr(value);
                if let Expr::Name(ident) = &target.expr {
                    self.use_name(ident);
                    self.bind_name(ident.name);
                } else {
                    self.visit_expr(target);
                }
            }
            Stmt::AnnAssign { target, value, .. } => {
                if let Some(value) = value {
                    self.visit_expr(value);
                }
                if let Expr::Name(ident) = &target.expr {
                    self.bind_name(ident.name);
                } else {
                    self.visit_expr(target);
                }
            }
            Stmt::Delete(targets) => {
                for target in targets {
                    self.visit_target(target);
                }
            }
            Stmt::Pass | Stmt::Error => {}
            Stmt::Break => {
                if self.loop_depth == 0 {
                    self.error("'break' outside loop", stmt.range);
                }
            }
            Stmt::Continue => {
                if self.loop_depth == 0 {
                    self.error("'continue' not properly in loop", stmt.range);
                }
            }
            Stmt::Return(value) => {
                if !matches!(self.kind(), ScopeKind::Function) {
                    self.error("'return' outside function", stmt.range);
                }
                if let Some(value) = value {
                    self.visit_expr(value);
                }
            }
            Stmt::Raise { exc, cause } => {
                if let Some(exc) = exc {
                    self.visit_expr(exc);
                }
                if let Some(cause) = cause {
                    self.visit_expr(cause);
                }
            }
            Stmt::Global(names) => {
                for ident in names {
                    self.declare_global(ident);
                }
            }
            Stmt::Nonlocal(names) => {
                for ident in names {
                    self.declare_nonlocal(ident);
                }
            }
            Stmt::If { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            Stmt::While { test, body, orelse } => {
                self.visit_expr(test);
                self.loop_depth += 1;
                self.visit_body(body);
                self.loop_depth -= 1;
                self.visit_body(orelse);
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            } => {
                if *is_async {
                    self.require_async("'async for' outside async function", stmt.range);
                }
                self.visit_expr(iter);
                self.visit_target(target);
                self.loop_depth += 1;
                self.visit_body(body);
                self.loop_depth -= 1;
                self.visit_body(orelse);
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                if !finalbody.is_empty() {
                    self.scope().flags.contains_try_finally = true;
                }
                self.visit_body(body);
                for handler in handlers {
                    if let Some(kind) = &handler.kind {
                        self.visit_expr(kind);
                    }
                    if let Some(name) = &handler.name {
                        self.bind_name(name.name);
                    }
                    self.visit_body(&handler.body);
                }
                self.visit_body(orelse);
                self.visit_body(finalbody);
            }
            Stmt::With { items, body, is_async } => {
                if *is_async {
                    self.require_async("'async with' outside async function", stmt.range);
                }
                self.scope().flags.contains_try_finally = true;
                for item in items {
                    self.visit_expr(&item.context);
                    if let Some(target) = &item.target {
                        self.visit_target(target);
                    }
                }
                self.visit_body(body);
            }
            Stmt::Assert { test, msg } => {
                self.visit_expr(test);
                if let Some(msg) = msg {
                    self.visit_expr(msg);
                }
            }
            Stmt::Import(aliases) => {
                for alias in aliases {
                    let bound = alias.asname.as_ref().unwrap_or(&alias.path[0]);
                    self.bind_name(bound.name);
                }
            }
            Stmt::ImportFrom { names, .. } => match names {
                Some(names) => {
                    for alias in names {
                        let bound = alias.asname.as_ref().unwrap_or(&alias.path[0]);
                        self.bind_name(bound.name);
                    }
                }
                None => {
                    if self.kind() != ScopeKind::Module {
                        self.error("import * only allowed at module level", stmt.range);
                    }
                }
            },
            Stmt::FunctionDef(def) => {
                for decorator in &def.decorators {
                    self.visit_expr(decorator);
                }
                self.bind_name(def.name.name);
                self.visit_function(def);
            }
            Stmt::ClassDef(class) => {
                for decorator in &class.decorators {
                    self.visit_expr(decorator);
                }
                self.visit_class(class);
                self.bind_name(class.name.name);
            }
        }
    }

    fn require_async(&mut self, message: &str, range: CodeRange) {
        let info = &self.scopes[self.current.index()];
        if !(info.kind == Some(ScopeKind::Function) && info.is_async) {
            self.error(message, range);
        }
    }

    fn declare_global(&mut self, ident: &Identifier) {
        let name = ident.name;
        let text = self.text(name).to_owned();
        let info = &self.scopes[self.current.index()];
        let message = if info.params.contains(&name) {
            Some(format!("name '{text}' is parameter and global"))
        } else if info.nonlocals.contains_key(&name) {
            Some(format!("name '{text}' is nonlocal and global"))
        } else if info.bound.contains(&name) {
            Some(format!("name '{text}' is assigned to before global declaration"))
        } else if info.used.contains(&name) {
            Some(format!("name '{text}' is used prior to global declaration"))
        } else {
            None
        };
        if let Some(message) = message {
            self.error(message, ident.range);
        }
        self.scope().globals.insert(name);
    }

    fn declare_nonlocal(&mut self, ident: &Identifier) {
        let name = ident.name;
        let text = self.text(name).to_owned();
        if self.kind() == ScopeKind::Module {
            self.error("nonlocal declaration not allowed at module level", ident.range);
            return;
        }
        let info = &self.scopes[self.current.index()];
        let message = if info.params.contains(&name) {
            Some(format!("name '{text}' is parameter and nonlocal"))
        } else if info.globals.contains(&name) {
            Some(format!("name '{text}' is nonlocal and global"))
        } else if info.bound.contains(&name) {
            Some(format!("name '{text}' is assigned to before nonlocal declaration"))
        } else if info.used.contains(&name) {
            Some(format!("name '{text}' is used prior to nonlocal declaration"))
        } else {
            None
        };
        if let Some(message) = message {
            self.error(message, ident.range);
        }
        self.scope().nonlocals.insert(name, ident.range);
    }

    fn visit_function(&mut self, def: &FunctionDef) {
        for param in def.params.all() {
            if let Some(default) = &param.default {
                self.visit_expr(default);
            }
        }
        self.with_scope(def.scope, ScopeKind::Function, Some(def.name.name), |this| {
            {
                let info = this.scope();
                info.is_async = def.is_async;
                info.flags.is_coroutine = def.is_async;
                info.flags.has_varargs = def.params.vararg.is_some();
                info.flags.has_kwargs = def.params.kwarg.is_some();
            }
            for name in def.params.names() {
                this.scope().params.push(name.name);
                this.bind_name(name.name);
            }
            this.visit_body(&def.body);
        });
    }

    fn visit_class(&mut self, class: &ClassDef) {
        for base in &class.bases {
            self.visit_expr(base);
        }
        for (_, value) in &class.keywords {
            self.visit_expr(value);
        }
        self.with_scope(class.scope, ScopeKind::Class, Some(class.name.name), |this| {
            this.visit_body(&class.body);
        });
    }

    fn visit_comprehension(&mut self, comp: &Comprehension, is_generator: bool, range: CodeRange) {
        let Some(first) = comp.generators.first() else {
            return;
        };
        self.visit_expr(&first.iter);
        let arg = self.names.comprehension_arg;
        self.with_scope(comp.scope, ScopeKind::Comprehension, None, |this| {
            {
                let info = this.scope();
                info.flags.is_generator = is_generator;
                info.params.push(arg);
            }
            this.bind_name(arg);
            for (index, generator) in comp.generators.iter().enumerate() {
                if index > 0 {
                    this.visit_expr(&generator.iter);
                }
                this.visit_target(&generator.target);
                for cond in &generator.ifs {
                    this.visit_expr(cond);
                }
                if generator.is_async {
                    this.error("asynchronous comprehensions are not supported", range);
                }
            }
            this.visit_expr(&comp.element);
            if let Some(value) = &comp.value {
                this.visit_expr(value);
            }
        });
    }

    /// Records an assignment target: names are bound, everything else is evaluated.
    fn visit_target(&mut self, target: &ExprLoc) {
        match &target.expr {
            Expr::Name(ident) => self.bind_name(ident.name),
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.visit_target(item);
                }
            }
            Expr::Starred(inner) => self.visit_target(inner),
            _ => self.visit_expr(target),
        }
    }

    fn visit_expr(&mut self, expr: &ExprLoc) {
        match &expr.expr {
            Expr::Constant(_) | Expr::FoldedList(_) | Expr::FoldedSet(_) | Expr::FoldedDict(_) | Expr::Error => {}
            Expr::Name(ident) => self.use_name(ident),
            Expr::Attribute { value, .. } => self.visit_expr(value),
            Expr::Subscript { value, index } => {
                self.visit_expr(value);
                self.visit_expr(index);
            }
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.visit_expr(part);
                }
            }
            Expr::Call { func, args } => {
                self.visit_expr(func);
                for arg in args {
                    match arg {
                        Argument::Positional(e) | Argument::Star(e) | Argument::DoubleStar(e) | Argument::Keyword(_, e) => {
                            self.visit_expr(e);
                        }
                    }
                }
            }
            Expr::Unary { operand, .. } => self.visit_expr(operand),
            Expr::Binary { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            Expr::BoolOp { values, .. } => {
                for value in values {
                    self.visit_expr(value);
                }
            }
            Expr::Compare { left, comparisons } => {
                self.visit_expr(left);
                for (_, right) in comparisons {
                    self.visit_expr(right);
                }
            }
            Expr::IfExp { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            Expr::Lambda(def) => self.visit_function(def),
            Expr::Tuple(items) | Expr::List(items) | Expr::Set(items) => {
                for item in items {
                    self.visit_expr(item);
                }
            }
            Expr::Dict(items) => {
                for item in items {
                    match item {
                        DictItem::Pair(k, v) => {
                            self.visit_expr(k);
                            self.visit_expr(v);
                        }
                        DictItem::Unpack(e) => self.visit_expr(e),
                    }
                }
            }
            Expr::Starred(inner) => self.visit_expr(inner),
            Expr::ListComp(comp) | Expr::SetComp(comp) | Expr::DictComp(comp) => {
                self.visit_comprehension(comp, false, expr.range);
            }
            Expr::GeneratorExp(comp) => self.visit_comprehension(comp, true, expr.range),
            Expr::Yield(value) => {
                self.mark_yield(expr.range, false);
                if let Some(value) = value {
                    self.visit_expr(value);
                }
            }
            Expr::YieldFrom(value) => {
                self.mark_yield(expr.range, true);
                self.visit_expr(value);
            }
            Expr::Await(value) => {
                let info = &self.scopes[self.current.index()];
                if info.kind == Some(ScopeKind::Function) && info.is_async {
                    self.scope().flags.is_generator = true;
                } else {
                    self.error("'await' outside async function", expr.range);
                }
                self.visit_expr(value);
            }
            Expr::Named { target, value } => {
                self.visit_expr(value);
                self.bind_walrus(target);
            }
            Expr::FString(parts) => self.visit_fstring(parts),
        }
    }

    fn visit_fstring(&mut self, parts: &[FStringPart]) {
        for part in parts {
            if let FStringPart::Field {
                value, format_spec, ..
            } = part
            {
                self.visit_expr(value);
                self.visit_fstring(format_spec);
            }
        }
    }

    fn mark_yield(&mut self, range: CodeRange, is_from: bool) {
        let info = &self.scopes[self.current.index()];
        match info.kind {
            Some(ScopeKind::Function) => {
                if is_from && info.is_async {
                    self.error("'yield from' inside async function", range);
                }
                self.scope().flags.is_generator = true;
            }
            Some(ScopeKind::Comprehension) => {
                self.error("'yield' inside comprehension", range);
            }
            _ => self.error("'yield' outside function", range),
        }
    }

    /// `:=` inside a comprehension binds in the nearest enclosing non-comprehension scope.
    fn bind_walrus(&mut self, target: &Identifier) {
        let mut id = self.current;
        let mut through = Vec::new();
        while self.scopes[id.index()].kind == Some(ScopeKind::Comprehension) {
            through.push(id);
            match self.scopes[id.index()].parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
        let owner_kind = self.scopes[id.index()].kind;
        if !through.is_empty() && owner_kind == Some(ScopeKind::Class) {
            self.error(
                "assignment expression within a comprehension cannot be used in a class body",
                target.range,
            );
            return;
        }
        self.scopes[id.index()].bound.insert(target.name);
        for comp in through {
            let info = &mut self.scopes[comp.index()];
            if owner_kind == Some(ScopeKind::Module) {
                info.globals.insert(target.name);
            } else {
                info.nonlocals.insert(target.name, target.range);
            }
        }
    }
}

/// Second sub-pass: classifies every collected name and lays out cells and slots.
fn resolve(infos: Vec<ScopeInfo>, names: &WellKnown, interner: &Interner, errors: &mut Vec<BindError>) -> ScopeTree {
    let mut scopes: Vec<Scope> = infos
        .iter()
        .map(|info| Scope {
            kind: info.kind.unwrap_or(ScopeKind::Function),
            name: info.name,
            parent: info.parent,
            variables: IndexMap::new(),
            flags: info.flags,
            params: info.params.clone(),
            cell_vars: Vec::new(),
            free_vars: Vec::new(),
            fast_locals: Vec::new(),
        })
        .collect();

    // initial classification from local information only
    for (scope, info) in scopes.iter_mut().zip(&infos) {
        match scope.kind {
            ScopeKind::Module => {
                for name in info.bound.iter().chain(&info.used).chain(&info.globals) {
                    scope.variables.insert(
                        *name,
                        VariableKind::Global {
                            explicit: info.globals.contains(name),
                        },
                    );
                }
            }
            ScopeKind::Class | ScopeKind::Function | ScopeKind::Comprehension => {
                for name in &info.globals {
                    scope.variables.insert(*name, VariableKind::Global { explicit: true });
                }
                for name in &info.params {
                    scope.variables.insert(*name, VariableKind::Parameter);
                }
                for name in &info.bound {
                    if !info.globals.contains(name) && !info.nonlocals.contains_key(name) {
                        scope.variables.entry(*name).or_insert(VariableKind::Local);
                    }
                }
            }
        }
    }

    let mut passthrough: Vec<IndexSet<StringId>> = vec![IndexSet::new(); scopes.len()];

    for index in 0..scopes.len() {
        let info = &infos[index];
        if scopes[index].kind == ScopeKind::Module {
            continue;
        }
        let id = ScopeId(u32::try_from(index).unwrap_or(u32::MAX));
        for (&name, &range) in &info.nonlocals {
            if resolve_free(&mut scopes, &mut passthrough, id, name) {
                scopes[index].variables.insert(name, VariableKind::Free);
            } else {
                errors.push(BindError {
                    message: format!("no binding for nonlocal '{}' found", interner.get(name)),
                    range,
                });
            }
        }
        for &name in &info.used {
            if scopes[index].variables.contains_key(&name) {
                continue;
            }
            let kind = if resolve_free(&mut scopes, &mut passthrough, id, name) {
                VariableKind::Free
            } else {
                VariableKind::Global { explicit: false }
            };
            scopes[index].variables.insert(name, kind);
        }
        if info.uses_class_cell && scopes[index].kind == ScopeKind::Function {
            attach_class_cell(&mut scopes, &mut passthrough, id, names.class_cell);
        }
    }

    // layout
    let mut global_names: IndexSet<StringId> = IndexSet::new();
    for (index, scope) in scopes.iter_mut().enumerate() {
        let mut cells: Vec<StringId> = scope
            .params
            .iter()
            .filter(|p| scope.variables.get(*p) == Some(&VariableKind::Cell))
            .copied()
            .collect();
        for (name, kind) in &scope.variables {
            match kind {
                VariableKind::Cell if !cells.contains(name) => cells.push(*name),
                VariableKind::Global { .. } => {
                    global_names.insert(*name);
                }
                _ => {}
            }
        }
        scope.cell_vars = cells;
        let mut free: Vec<StringId> = scope
            .variables
            .iter()
            .filter(|(_, kind)| **kind == VariableKind::Free)
            .map(|(name, _)| *name)
            .collect();
        for name in &passthrough[index] {
            if !free.contains(name) && !scope.cell_vars.contains(name) {
                free.push(*name);
            }
        }
        scope.free_vars = free;
        if scope.is_function_like() {
            let mut slots = scope.params.clone();
            for (name, kind) in &scope.variables {
                if *kind == VariableKind::Local && !slots.contains(name) {
                    slots.push(*name);
                }
            }
            scope.fast_locals = slots;
        }
    }
    ScopeTree {
        scopes,
        global_names: global_names.into_iter().collect(),
    }
}

/// Walks outward from `from` looking for a function scope that owns `name`.
///
/// On success the owner's variable becomes a cell and every scope strictly between the
/// owner and `from` receives a pass-through free variable.
fn resolve_free(
    scopes: &mut [Scope],
    passthrough: &mut [IndexSet<StringId>],
    from: ScopeId,
    name: StringId,
) -> bool {
    let mut between = Vec::new();
    let mut current = scopes[from.index()].parent;
    while let Some(id) = current {
        let scope = &mut scopes[id.index()];
        match scope.kind {
            ScopeKind::Module => return false,
            ScopeKind::Class => between.push(id),
            ScopeKind::Function | ScopeKind::Comprehension => match scope.variables.get(&name).copied() {
                Some(VariableKind::Local | VariableKind::Parameter | VariableKind::Cell) => {
                    scope.variables.insert(name, VariableKind::Cell);
                    for mid in between {
                        mark_passthrough(scopes, passthrough, mid, name);
                    }
                    return true;
                }
                Some(VariableKind::Free) => {
                    for mid in between {
                        mark_passthrough(scopes, passthrough, mid, name);
                    }
                    return true;
                }
                Some(VariableKind::Global { .. }) => return false,
                None => between.push(id),
            },
        }
        current = scopes[id.index()].parent;
    }
    false
}

fn mark_passthrough(scopes: &mut [Scope], passthrough: &mut [IndexSet<StringId>], id: ScopeId, name: StringId) {
    let scope = &mut scopes[id.index()];
    if scope.kind == ScopeKind::Class {
        passthrough[id.index()].insert(name);
        scope.variables.entry(name).or_insert(VariableKind::Free);
    } else {
        scope.variables.insert(name, VariableKind::Free);
    }
}

/// Gives a method an implicit `__class__` free variable backed by a cell in its class scope.
fn attach_class_cell(scopes: &mut [Scope], passthrough: &mut [IndexSet<StringId>], from: ScopeId, cell: StringId) {
    let mut between = Vec::new();
    let mut current = scopes[from.index()].parent;
    while let Some(id) = current {
        match scopes[id.index()].kind {
            ScopeKind::Class => {
                scopes[id.index()].variables.insert(cell, VariableKind::Cell);
                scopes[from.index()].variables.insert(cell, VariableKind::Free);
                for mid in between {
                    mark_passthrough(scopes, passthrough, mid, cell);
                }
                return;
            }
            ScopeKind::Module => return,
            ScopeKind::Function | ScopeKind::Comprehension => between.push(id),
        }
        current = scopes[id.index()].parent;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{parse::parse, source::CodeKind};

    fn bind_source(source: &str) -> (ScopeTree, Interner) {
        let mut interner = Interner::new();
        let ast = parse(source, CodeKind::Module, &mut interner).unwrap();
        let tree = bind(&ast, &mut interner).unwrap();
        (tree, interner)
    }

    fn bind_errors(source: &str) -> Vec<BindError> {
        let mut interner = Interner::new();
        let ast = parse(source, CodeKind::Module, &mut interner).unwrap();
        bind(&ast, &mut interner).unwrap_err()
    }

    fn kind(tree: &ScopeTree, interner: &Interner, scope: u32, name: &str) -> Option<VariableKind> {
        let id = interner.get_id(name)?;
        tree.get(ScopeId(scope)).kind_of(id)
    }

    #[test]
    fn closure_variable_becomes_cell() {
        let (tree, interner) = bind_source("def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n");
        assert_eq!(kind(&tree, &interner, 1, "x"), Some(VariableKind::Cell));
        assert_eq!(kind(&tree, &interner, 2, "x"), Some(VariableKind::Free));
        assert_eq!(kind(&tree, &interner, 1, "inner"), Some(VariableKind::Local));
        assert_eq!(tree.get(ScopeId(2)).free_vars.len(), 1);
    }

    #[test]
    fn unbound_reads_are_implicit_globals() {
        let (tree, interner) = bind_source("def f():\n    return len(y)\n");
        assert_eq!(
            kind(&tree, &interner, 1, "len"),
            Some(VariableKind::Global { explicit: false })
        );
        assert!(tree.global_names.contains(&interner.get_id("y").unwrap()));
    }

    #[test]
    fn explicit_global_declaration() {
        let (tree, interner) = bind_source("def f():\n    global g\n    g = 1\n");
        assert_eq!(kind(&tree, &interner, 1, "g"), Some(VariableKind::Global { explicit: true }));
        assert!(tree.get(ScopeId(1)).fast_locals.is_empty());
    }

    #[test]
    fn nonlocal_passes_through_intermediate_scopes() {
        let source = "def a():\n    v = 0\n    def b():\n        def c():\n            nonlocal v\n            v += 1\n        return c\n    return b\n";
        let (tree, interner) = bind_source(source);
        assert_eq!(kind(&tree, &interner, 1, "v"), Some(VariableKind::Cell));
        assert_eq!(kind(&tree, &interner, 2, "v"), Some(VariableKind::Free));
        assert_eq!(kind(&tree, &interner, 3, "v"), Some(VariableKind::Free));
    }

    #[test]
    fn class_scope_is_transparent_to_methods() {
        let source = "def f():\n    x = 1\n    class C:\n        x = 2\n        def m(self):\n            return x\n    return C\n";
        let (tree, interner) = bind_source(source);
        assert_eq!(kind(&tree, &interner, 1, "x"), Some(VariableKind::Cell));
        assert_eq!(kind(&tree, &interner, 2, "x"), Some(VariableKind::Local));
        assert!(tree.get(ScopeId(2)).free_vars.contains(&interner.get_id("x").unwrap()));
        assert_eq!(kind(&tree, &interner, 3, "x"), Some(VariableKind::Free));
    }

    #[test]
    fn super_creates_class_cell() {
        let (tree, interner) = bind_source("class C(B):\n    def m(self):\n        return super().m()\n");
        let cell = interner.get_id("__class__").unwrap();
        assert_eq!(tree.get(ScopeId(1)).cell_vars, vec![cell]);
        assert_eq!(tree.get(ScopeId(2)).free_vars, vec![cell]);
    }

    #[test]
    fn captured_parameter_is_a_cell_with_a_slot() {
        let (tree, interner) = bind_source("def f(a):\n    return lambda: a\n");
        let a = interner.get_id("a").unwrap();
        let scope = tree.get(ScopeId(1));
        assert_eq!(scope.cell_vars, vec![a]);
        assert_eq!(scope.slot(a), Some(0));
    }

    #[test]
    fn generator_and_comprehension_flags() {
        let (tree, _) = bind_source("def g():\n    yield 1\nsquares = [x * x for x in range(3)]\n");
        assert!(tree.get(ScopeId(1)).flags.is_generator);
        assert!(tree.get(ScopeId(1)).needs_heap_frame());
        let comp = tree.get(ScopeId(2));
        assert_eq!(comp.kind, ScopeKind::Comprehension);
        assert_eq!(comp.params.len(), 1);
    }

    #[test]
    fn walrus_in_comprehension_binds_enclosing_scope() {
        let (tree, interner) = bind_source("def f(xs):\n    [last := x for x in xs]\n    return last\n");
        assert_eq!(kind(&tree, &interner, 1, "last"), Some(VariableKind::Cell));
        assert_eq!(kind(&tree, &interner, 2, "last"), Some(VariableKind::Free));
    }

    #[test]
    fn binding_diagnostics() {
        assert_eq!(bind_errors("nonlocal x\n")[0].message, "nonlocal declaration not allowed at module level");
        assert_eq!(bind_errors("def f():\n    nonlocal x\n")[0].message, "no binding for nonlocal 'x' found");
        assert_eq!(bind_errors("def f(a):\n    global a\n")[0].message, "name 'a' is parameter and global");
        assert_eq!(bind_errors("def f():\n    x = 1\n    global x\n")[0].message, "name 'x' is assigned to before global declaration");
        assert_eq!(bind_errors("return 1\n")[0].message, "'return' outside function");
        assert_eq!(bind_errors("yield 1\n")[0].message, "'yield' outside function");
        assert_eq!(bind_errors("break\n")[0].message, "'break' outside loop");
    }

    #[test]
    fn errors_are_collected_not_short_circuited() {
        assert_eq!(bind_errors("break\ncontinue\nreturn\n").len(), 3);
    }
}
