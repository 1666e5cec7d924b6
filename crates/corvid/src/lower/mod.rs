//! Lowering: turns a bound AST into the operation tree both backends execute.
//!
//! The pass resolves every name to its storage using the binder's classification, creates
//! one call site per dynamic operation, builds a [`FunctionCode`] for every function,
//! lambda, comprehension and class body, and hoists `yield` out of expressions.
//!
//! Hoisting is what makes generators resumable without a bytecode program counter. An
//! expression containing a yield is split so that the yield becomes its own statement
//! writing the sent value to a temporary; every operand evaluated *before* the yield is
//! spilled to a temporary first so re-entry does not evaluate it twice. Short-circuit
//! operators and conditional expressions with a yield in them turn into `if` statements
//! over a result temporary.

pub mod tree;

use std::{cell::RefCell, sync::Arc};

use indexmap::IndexSet;

use self::tree::{
    Arg, AugTarget, ClassNode, Collect, CompareStep, DictElem, Elem, Expr, FPart, FunctionTemplate, Handler,
    ImportName, Name, NameRef, Stmt, StmtKind, Target, UnitInfo,
};
use crate::{
    expressions::{
        self as ast, Argument, BoolOp, ClassDef, Comprehension, Const, DictItem, ExprLoc, FStringPart, FunctionDef,
        ModuleAst, ScopeId, StmtLoc, UnaryOp,
    },
    intern::{Interner, StringId},
    prepare::{BindError, ScopeKind, ScopeTree, VariableKind},
    sites::{CallSite, SiteOp, SiteView},
    source::{CodeKind, CodeRange, CompileOptions},
    types::{BodyKind, CodeFlags, FunctionCode, ParamSpec, PyDict, PySet},
    value::Value,
};

/// A lowered unit: its top-level code object and the facts shared by all its code.
#[derive(Debug)]
pub struct LoweredUnit {
    pub code: Arc<FunctionCode>,
    pub info: Arc<UnitInfo>,
    /// Every operation site created for the unit, in creation order.
    pub sites: Vec<Arc<dyn SiteView>>,
}

/// Lowers a parsed and bound unit.
pub fn lower(
    ast: &ModuleAst,
    scopes: &ScopeTree,
    interner: &Interner,
    options: &CompileOptions,
    filename: Arc<str>,
) -> Result<LoweredUnit, Vec<BindError>> {
    let global_names = collect_global_names(scopes, interner);
    let info = Arc::new(UnitInfo {
        filename,
        kind: options.kind,
        mode: options.effective_mode(),
        global_names: global_names.iter().cloned().collect(),
        tiering: options.tiering,
        inline_caches: options.inline_caches,
    });
    let mut lowerer = Lowerer {
        scopes,
        interner,
        options,
        unit: Arc::clone(&info),
        globals: global_names,
        state: CodeState::new(ScopeId::MODULE, "<module>".into()),
        errors: Vec::new(),
        super_name: interner.get_id("super"),
        class_cell: interner.get_id("__class__"),
        sites: RefCell::new(Vec::new()),
    };
    let code = lowerer.module(ast);
    if lowerer.errors.is_empty() {
        Ok(LoweredUnit {
            code,
            info,
            sites: lowerer.sites.into_inner(),
        })
    } else {
        Err(lowerer.errors)
    }
}

/// Every name that can live in the unit's global namespace. Names bound in class bodies are
/// included because a class body without a separate namespace falls back to globals.
fn collect_global_names(scopes: &ScopeTree, interner: &Interner) -> IndexSet<Arc<str>> {
    let mut names: IndexSet<Arc<str>> = scopes.global_names.iter().map(|id| interner.get_arc(*id)).collect();
    for scope in scopes.scopes.iter().filter(|s| s.kind == ScopeKind::Class) {
        for (name, kind) in &scope.variables {
            if matches!(kind, VariableKind::Local | VariableKind::Global { .. }) {
                names.insert(interner.get_arc(*name));
            }
        }
    }
    names
}

/// Per-code-object counters.
struct CodeState {
    scope: ScopeId,
    qualname: Arc<str>,
    temps: u32,
    next_yield: u32,
}

impl CodeState {
    fn new(scope: ScopeId, qualname: Arc<str>) -> Self {
        Self {
            scope,
            qualname,
            temps: 0,
            next_yield: 0,
        }
    }
}

/// Operand bookkeeping while rebuilding a node whose operands contain a yield.
struct Hoist<'p> {
    pre: &'p mut Vec<Stmt>,
    /// Index of the last operand containing a yield.
    last: usize,
    seen: usize,
}

#[derive(Clone, Copy)]
enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

struct Lowerer<'a> {
    scopes: &'a ScopeTree,
    interner: &'a Interner,
    options: &'a CompileOptions,
    unit: Arc<UnitInfo>,
    globals: IndexSet<Arc<str>>,
    state: CodeState,
    errors: Vec<BindError>,
    super_name: Option<StringId>,
    class_cell: Option<StringId>,
    sites: RefCell<Vec<Arc<dyn SiteView>>>,
}

impl Lowerer<'_> {
    fn error(&mut self, message: impl Into<String>, range: CodeRange) {
        self.errors.push(BindError {
            message: message.into(),
            range,
        });
    }

    fn text(&self, id: StringId) -> Arc<str> {
        self.interner.get_arc(id)
    }

    fn temp(&mut self) -> u32 {
        let temp = self.state.temps;
        self.state.temps += 1;
        temp
    }

    fn next_yield(&mut self) -> u32 {
        let index = self.state.next_yield;
        self.state.next_yield += 1;
        index
    }

    fn enabled(&self) -> bool {
        self.options.inline_caches
    }

    fn site<G, P>(&self, op: SiteOp, line: u32) -> Arc<CallSite<G, P>>
    where
        G: Send + Sync + 'static,
        P: Send + Sync + 'static,
    {
        let site = Arc::new(CallSite::new(op, line, self.enabled()));
        self.sites.borrow_mut().push(Arc::clone(&site) as Arc<dyn SiteView>);
        site
    }

    fn global_ref(&mut self, name: &Arc<str>, range: CodeRange) -> NameRef {
        if let Some(index) = self.globals.get_index_of(name) {
            return NameRef::Global(u32::try_from(index).unwrap_or(u32::MAX));
        }
        self.error(format!("internal error: unresolved global '{name}'"), range);
        NameRef::Global(0)
    }

    fn resolve(&mut self, id: StringId, range: CodeRange) -> Name {
        let name = self.text(id);
        let scope = self.scopes.get(self.state.scope);
        let kind = scope.kind_of(id);
        let target = match scope.kind {
            ScopeKind::Module => {
                let global = self.global_ref(&name, range);
                if self.options.kind == CodeKind::Module {
                    global
                } else {
                    NameRef::Local {
                        fallback: Box::new(global),
                    }
                }
            }
            ScopeKind::Class => match kind {
                Some(VariableKind::Global { explicit: true }) => self.global_ref(&name, range),
                Some(VariableKind::Cell) => NameRef::Cell(closure_slot(scope.closure_index(id))),
                Some(VariableKind::Free) => NameRef::Local {
                    fallback: Box::new(NameRef::Cell(closure_slot(scope.closure_index(id)))),
                },
                _ => NameRef::Local {
                    fallback: Box::new(self.global_ref(&name, range)),
                },
            },
            ScopeKind::Function | ScopeKind::Comprehension => match kind {
                Some(VariableKind::Local | VariableKind::Parameter) => match scope.slot(id) {
                    Some(slot) => NameRef::Fast(u32::try_from(slot).unwrap_or(u32::MAX)),
                    None => self.global_ref(&name, range),
                },
                Some(VariableKind::Cell | VariableKind::Free) => {
                    NameRef::Cell(closure_slot(scope.closure_index(id)))
                }
                Some(VariableKind::Global { .. }) | None => self.global_ref(&name, range),
            },
        };
        Name { name, target }
    }

    /// Closure indexes, in the current scope, of the free names of a nested scope.
    fn closure_of(&mut self, nested: ScopeId, range: CodeRange) -> Vec<u32> {
        let scope = self.scopes.get(self.state.scope);
        let mut closure = Vec::new();
        for name in &self.scopes.get(nested).free_vars {
            match scope.closure_index(*name) {
                Some(index) => closure.push(closure_slot(Some(index))),
                None => {
                    let text = self.text(*name);
                    self.error(format!("internal error: no cell for free variable '{text}'"), range);
                }
            }
        }
        closure
    }

    fn child_qualname(&self, name: &str) -> Arc<str> {
        match self.scopes.get(self.state.scope).kind {
            ScopeKind::Module => name.into(),
            ScopeKind::Class => format!("{}.{name}", self.state.qualname).into(),
            ScopeKind::Function | ScopeKind::Comprehension => format!("{}.<locals>.{name}", self.state.qualname).into(),
        }
    }

    fn nested(&self) -> bool {
        matches!(
            self.scopes.get(self.state.scope).kind,
            ScopeKind::Function | ScopeKind::Comprehension
        )
    }

    fn names(&self, ids: &[StringId]) -> Vec<Arc<str>> {
        ids.iter().map(|id| self.text(*id)).collect()
    }

    // ---- code objects ----

    fn module(&mut self, ast: &ModuleAst) -> Arc<FunctionCode> {
        let (doc, body) = if self.options.kind == CodeKind::Eval {
            let mut body = Vec::new();
            for stmt in &ast.body {
                if let ast::Stmt::Expr(expr) = &stmt.stmt {
                    let value = self.value(expr, &mut body);
                    body.push(Stmt::new(StmtKind::Return(Some(value)), stmt.range.line()));
                }
            }
            (None, body)
        } else {
            self.body_with_doc(&ast.body)
        };
        let first_line = ast.body.first().map_or(1, |s| s.range.line());
        Arc::new(FunctionCode::new(
            "<module>".into(),
            "<module>".into(),
            BodyKind::Module,
            ParamSpec::default(),
            CodeFlags::empty(),
            self.state.temps as usize,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            body,
            Arc::clone(&self.unit),
            doc,
            first_line,
        ))
    }

    /// Splits off a leading docstring. With `optimize` the docstring is dropped.
    fn body_with_doc(&mut self, body: &[StmtLoc]) -> (Option<Value>, Vec<Stmt>) {
        if let Some(StmtLoc {
            stmt:
                ast::Stmt::Expr(ExprLoc {
                    expr: ast::Expr::Constant(Const::Str(text)),
                    ..
                }),
            ..
        }) = body.first()
        {
            let doc = (!self.options.optimize).then(|| Value::str(text));
            return (doc, self.block(&body[1..]));
        }
        (None, self.block(body))
    }

    fn enter(&mut self, scope: ScopeId, qualname: Arc<str>) -> CodeState {
        std::mem::replace(&mut self.state, CodeState::new(scope, qualname))
    }

    fn leave(&mut self, saved: CodeState) -> CodeState {
        std::mem::replace(&mut self.state, saved)
    }

    /// Builds the function object template for a `def` or `lambda`. Defaults are lowered
    /// by the caller in the enclosing scope.
    fn function_template(
        &mut self,
        def: &FunctionDef,
        defaults: Vec<Expr>,
        kw_defaults: Vec<(Arc<str>, Expr)>,
    ) -> Arc<FunctionTemplate> {
        let name: Arc<str> = if def.is_lambda {
            "<lambda>".into()
        } else {
            self.text(def.name.name)
        };
        let qualname = self.child_qualname(&name);
        let nested = self.nested();
        let closure = self.closure_of(def.scope, def.range);
        let saved = self.enter(def.scope, qualname);
        let (doc, body) = if def.is_lambda {
            let mut body = Vec::new();
            if let Some(StmtLoc {
                stmt: ast::Stmt::Return(Some(expr)),
                range,
            }) = def.body.first()
            {
                let value = self.value(expr, &mut body);
                body.push(Stmt::new(StmtKind::Return(Some(value)), range.line()));
            }
            (None, body)
        } else {
            self.body_with_doc(&def.body)
        };
        let state = self.leave(saved);
        let scope = self.scopes.get(def.scope);
        let params = ParamSpec {
            names: self.names(&scope.params),
            posonly: def.params.posonly.len(),
            positional: def.params.posonly.len() + def.params.args.len(),
            kwonly: def.params.kwonly.len(),
            varargs: def.params.vararg.is_some(),
            varkw: def.params.kwarg.is_some(),
        };
        let mut flags = CodeFlags::empty();
        flags.set(CodeFlags::VARARGS, params.varargs);
        flags.set(CodeFlags::VARKEYWORDS, params.varkw);
        flags.set(CodeFlags::GENERATOR, scope.flags.is_generator || def.is_async);
        flags.set(CodeFlags::COROUTINE, def.is_async);
        flags.set(CodeFlags::NESTED, nested);
        flags.set(CodeFlags::HEAP_FRAME, scope.needs_heap_frame());
        flags.set(CodeFlags::LAMBDA, def.is_lambda);
        let code = FunctionCode::new(
            name,
            state.qualname,
            BodyKind::Function,
            params,
            flags,
            state.temps as usize,
            self.names(&scope.fast_locals),
            self.names(&scope.cell_vars),
            self.names(&scope.free_vars),
            body,
            Arc::clone(&self.unit),
            doc,
            def.range.line(),
        );
        Arc::new(FunctionTemplate {
            code: Arc::new(code),
            defaults,
            kw_defaults,
            closure,
        })
    }

    fn class(&mut self, def: &ClassDef, out: &mut Vec<Stmt>) -> StmtKind {
        let decorators = def.decorators.iter().map(|d| self.value(d, out)).collect();
        let bases = def
            .bases
            .iter()
            .map(|base| match &base.expr {
                ast::Expr::Starred(inner) => Elem::Star(self.value(inner, out)),
                _ => Elem::Plain(self.value(base, out)),
            })
            .collect();
        let keywords = def
            .keywords
            .iter()
            .map(|(name, value)| (self.text(name.name), self.value(value, out)))
            .collect();
        let name = self.text(def.name.name);
        let qualname = self.child_qualname(&name);
        let nested = self.nested();
        let closure = self.closure_of(def.scope, def.range);
        let saved = self.enter(def.scope, Arc::clone(&qualname));
        let (doc, body) = self.body_with_doc(&def.body);
        let state = self.leave(saved);
        let scope = self.scopes.get(def.scope);
        let class_cell = self
            .class_cell
            .and_then(|cell| scope.cell_vars.iter().position(|n| *n == cell))
            .map(|index| closure_slot(Some(index)));
        let mut flags = CodeFlags::empty();
        flags.set(CodeFlags::NESTED, nested);
        let code = FunctionCode::new(
            Arc::clone(&name),
            Arc::clone(&qualname),
            BodyKind::Class,
            ParamSpec::default(),
            flags,
            state.temps as usize,
            Vec::new(),
            self.names(&scope.cell_vars),
            self.names(&scope.free_vars),
            body,
            Arc::clone(&self.unit),
            doc,
            def.range.line(),
        );
        let target = self.resolve(def.name.name, def.name.range);
        StmtKind::Class(Box::new(ClassNode {
            name,
            qualname,
            bases,
            keywords,
            body: Arc::new(code),
            closure,
            decorators,
            target,
            class_cell,
        }))
    }

    fn comprehension(&mut self, comp: &Comprehension, kind: CompKind, range: CodeRange, iterable: Expr) -> Expr {
        let line = range.line();
        let label = match kind {
            CompKind::List => "<listcomp>",
            CompKind::Set => "<setcomp>",
            CompKind::Dict => "<dictcomp>",
            CompKind::Generator => "<genexpr>",
        };
        let name: Arc<str> = label.into();
        let qualname = self.child_qualname(label);
        let nested = self.nested();
        let closure = self.closure_of(comp.scope, range);
        let saved = self.enter(comp.scope, qualname);
        let mut body = Vec::new();
        let acc = match kind {
            CompKind::Generator => None,
            _ => {
                let acc = self.temp();
                let empty = match kind {
                    CompKind::Set => Expr::Set(Vec::new()),
                    CompKind::Dict => Expr::Dict(Vec::new()),
                    _ => Expr::List(Vec::new()),
                };
                body.push(Stmt::new(StmtKind::SetTemp(acc, empty), line));
                Some(acc)
            }
        };
        let loops = self.comprehension_loop(comp, 0, acc, kind, line);
        body.push(loops);
        if let Some(acc) = acc {
            body.push(Stmt::new(StmtKind::Return(Some(Expr::Temp(acc))), line));
        }
        let state = self.leave(saved);
        let scope = self.scopes.get(comp.scope);
        let mut flags = CodeFlags::empty();
        flags.set(CodeFlags::GENERATOR, matches!(kind, CompKind::Generator));
        flags.set(CodeFlags::NESTED, nested);
        let params = ParamSpec {
            names: self.names(&scope.params),
            posonly: scope.params.len(),
            positional: scope.params.len(),
            ..ParamSpec::default()
        };
        let code = FunctionCode::new(
            name,
            state.qualname,
            BodyKind::Function,
            params,
            flags,
            state.temps as usize,
            self.names(&scope.fast_locals),
            self.names(&scope.cell_vars),
            self.names(&scope.free_vars),
            body,
            Arc::clone(&self.unit),
            None,
            line,
        );
        Expr::Comprehension {
            template: Arc::new(FunctionTemplate {
                code: Arc::new(code),
                defaults: Vec::new(),
                kw_defaults: Vec::new(),
                closure,
            }),
            iterable: Box::new(iterable),
        }
    }

    fn comprehension_loop(
        &mut self,
        comp: &Comprehension,
        index: usize,
        acc: Option<u32>,
        kind: CompKind,
        line: u32,
    ) -> Stmt {
        let generator = &comp.generators[index];
        if generator.is_async {
            self.error("asynchronous comprehensions are not supported", generator.iter.range);
        }
        let iter = if index == 0 {
            let scope = self.scopes.get(self.state.scope);
            match scope.params.first() {
                Some(param) => Expr::Load(self.resolve(*param, generator.iter.range)),
                None => Expr::Const(Value::None),
            }
        } else {
            self.expr(&generator.iter)
        };
        let target = self.target(&generator.target);
        let inner = if index + 1 < comp.generators.len() {
            self.comprehension_loop(comp, index + 1, acc, kind, line)
        } else {
            self.comprehension_element(comp, acc, kind, line)
        };
        let mut body = vec![inner];
        for condition in generator.ifs.iter().rev() {
            let test = self.expr(condition);
            body = vec![Stmt::new(
                StmtKind::If {
                    test,
                    body,
                    orelse: Vec::new(),
                },
                condition.range.line(),
            )];
        }
        let iter_temp = self.temp();
        Stmt::new(
            StmtKind::For {
                target,
                iter,
                body,
                orelse: Vec::new(),
                iter_temp,
            },
            line,
        )
    }

    fn comprehension_element(&mut self, comp: &Comprehension, acc: Option<u32>, kind: CompKind, line: u32) -> Stmt {
        let element = self.expr(&comp.element);
        let value = match (kind, acc) {
            (CompKind::Generator, _) | (_, None) => {
                let index = self.next_yield();
                return Stmt::new(
                    StmtKind::Yield {
                        index,
                        value: Some(element),
                        into: None,
                    },
                    line,
                );
            }
            (CompKind::List, _) => Collect::List(element),
            (CompKind::Set, _) => Collect::Set(element),
            (CompKind::Dict, _) => {
                let value = comp.value.as_ref().map_or(Expr::Const(Value::None), |v| self.expr(v));
                Collect::Dict(element, value)
            }
        };
        Stmt::new(
            StmtKind::Append {
                temp: acc.unwrap_or_default(),
                value,
            },
            line,
        )
    }

    // ---- statements ----

    fn block(&mut self, body: &[StmtLoc]) -> Vec<Stmt> {
        let mut out = Vec::with_capacity(body.len());
        for stmt in body {
            self.stmt(stmt, &mut out);
        }
        out
    }

    #[expect(clippy::too_many_lines, reason = "one arm per statement kind")]
    fn stmt(&mut self, stmt: &StmtLoc, out: &mut Vec<Stmt>) {
        let line = stmt.range.line();
        let kind = match &stmt.stmt {
            ast::Stmt::Expr(expr) => match &expr.expr {
                ast::Expr::Yield(value) => {
                    let value = value.as_ref().map(|v| self.value(v, out));
                    let index = self.next_yield();
                    StmtKind::Yield {
                        index,
                        value,
                        into: None,
                    }
                }
                ast::Expr::YieldFrom(value) | ast::Expr::Await(value) => {
                    let is_await = matches!(expr.expr, ast::Expr::Await(_));
                    let value = self.value(value, out);
                    let iter_temp = self.temp();
                    let index = self.next_yield();
                    StmtKind::YieldFrom {
                        index,
                        value,
                        iter_temp,
                        into: None,
                        is_await,
                    }
                }
                _ => StmtKind::Expr(self.value(expr, out)),
            },
            ast::Stmt::Assign { targets, value } => {
                let value = self.value(value, out);
                let targets = targets.iter().map(|t| self.target(t)).collect();
                StmtKind::Assign { targets, value }
            }
            ast::Stmt::AugAssign { target, op, value } => {
                let target = self.aug_target(target, out);
                let value = self.value(value, out);
                StmtKind::AugAssign {
                    target,
                    op: *op,
                    value,
                    site: self.site(SiteOp::Inplace(*op), line),
                }
            }
            ast::Stmt::AnnAssign { target, value, .. } => match value {
                Some(value) => {
                    let value = self.value(value, out);
                    StmtKind::Assign {
                        targets: vec![self.target(target)],
                        value,
                    }
                }
                None => return,
            },
            ast::Stmt::Delete(targets) => StmtKind::Delete(targets.iter().map(|t| self.target(t)).collect()),
            ast::Stmt::Pass | ast::Stmt::Global(_) | ast::Stmt::Nonlocal(_) | ast::Stmt::Error => return,
            ast::Stmt::Break => StmtKind::Break,
            ast::Stmt::Continue => StmtKind::Continue,
            ast::Stmt::Return(value) => StmtKind::Return(value.as_ref().map(|v| self.value(v, out))),
            ast::Stmt::Raise { exc, cause } => {
                let exc = exc.as_ref().map(|e| self.value(e, out));
                let cause = cause.as_ref().map(|c| self.value(c, out));
                StmtKind::Raise { exc, cause }
            }
            ast::Stmt::If { test, body, orelse } => {
                let test = self.value(test, out);
                StmtKind::If {
                    test,
                    body: self.block(body),
                    orelse: self.block(orelse),
                }
            }
            ast::Stmt::While { test, body, orelse } => self.while_loop(test, body, orelse, line),
            ast::Stmt::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            } => {
                if *is_async {
                    self.error("'async for' is not supported", stmt.range);
                }
                let iter = self.value(iter, out);
                StmtKind::For {
                    target: self.target(target),
                    iter,
                    body: self.block(body),
                    orelse: self.block(orelse),
                    iter_temp: self.temp(),
                }
            }
            ast::Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                let body = self.block(body);
                let handlers = handlers
                    .iter()
                    .map(|handler| {
                        let kind = handler.kind.as_ref().map(|k| {
                            if contains_yield(k) {
                                self.error("'yield' is not supported in an except clause", k.range);
                            }
                            self.expr(k)
                        });
                        Handler {
                            kind,
                            name: handler.name.map(|n| self.resolve(n.name, n.range)),
                            body: self.block(&handler.body),
                        }
                    })
                    .collect();
                StmtKind::Try {
                    body,
                    handlers,
                    orelse: self.block(orelse),
                    finalbody: self.block(finalbody),
                    exc_temp: self.temp(),
                    pending_temp: self.temp(),
                }
            }
            ast::Stmt::With { items, body, is_async } => {
                if *is_async {
                    self.error("'async with' is not supported", stmt.range);
                }
                self.with_items(items, body, line, out);
                return;
            }
            ast::Stmt::Assert { test, msg } => {
                if self.options.optimize {
                    return;
                }
                if let Some(msg) = msg.as_ref().filter(|m| contains_yield(m)) {
                    self.error("'yield' is not supported in an assert message", msg.range);
                }
                let test = self.value(test, out);
                StmtKind::Assert {
                    test,
                    msg: msg.as_ref().map(|m| self.expr(m)),
                }
            }
            ast::Stmt::Import(aliases) => {
                for alias in aliases {
                    let module = self.dotted(&alias.path);
                    let (target, bind_leaf) = match (&alias.asname, alias.path.first()) {
                        (Some(asname), _) => (self.resolve(asname.name, asname.range), true),
                        (None, Some(head)) => (self.resolve(head.name, head.range), false),
                        (None, None) => continue,
                    };
                    out.push(Stmt::new(
                        StmtKind::Import {
                            module,
                            target,
                            bind_leaf,
                        },
                        line,
                    ));
                }
                return;
            }
            ast::Stmt::ImportFrom { module, names, level } => {
                let module = self.dotted(module);
                match names {
                    None => StmtKind::ImportStar { module, level: *level },
                    Some(aliases) => {
                        let names = aliases
                            .iter()
                            .filter_map(|alias| {
                                let source = alias.path.first()?;
                                let bound = alias.asname.as_ref().unwrap_or(source);
                                Some(ImportName {
                                    name: self.text(source.name),
                                    target: self.resolve(bound.name, bound.range),
                                })
                            })
                            .collect();
                        StmtKind::ImportFrom {
                            module,
                            level: *level,
                            names,
                        }
                    }
                }
            }
            ast::Stmt::FunctionDef(def) => {
                let decorators = def.decorators.iter().map(|d| self.value(d, out)).collect();
                let (defaults, kw_defaults) = self.defaults(def, out);
                let template = self.function_template(def, defaults, kw_defaults);
                StmtKind::Def {
                    template,
                    decorators,
                    target: self.resolve(def.name.name, def.name.range),
                }
            }
            ast::Stmt::ClassDef(def) => self.class(def, out),
        };
        out.push(Stmt::new(kind, line));
    }

    fn dotted(&self, path: &[ast::Identifier]) -> Arc<str> {
        let parts: Vec<&str> = path.iter().map(|p| self.interner.get(p.name)).collect();
        parts.join(".").into()
    }

    fn defaults(&mut self, def: &FunctionDef, out: &mut Vec<Stmt>) -> (Vec<Expr>, Vec<(Arc<str>, Expr)>) {
        let defaults = def
            .params
            .posonly
            .iter()
            .chain(&def.params.args)
            .filter_map(|p| p.default.as_ref())
            .map(|d| self.value(d, out))
            .collect();
        let kw_defaults = def
            .params
            .kwonly
            .iter()
            .filter_map(|p| p.default.as_ref().map(|d| (p.name.name, d)))
            .map(|(name, d)| (self.text(name), self.value(d, out)))
            .collect();
        (defaults, kw_defaults)
    }

    fn while_loop(&mut self, test: &ExprLoc, body: &[StmtLoc], orelse: &[StmtLoc], line: u32) -> StmtKind {
        if !contains_yield(test) {
            let test = self.expr(test);
            return StmtKind::While {
                test,
                body: self.block(body),
                orelse: self.block(orelse),
            };
        }
        if !orelse.is_empty() {
            self.error("'yield' in a while condition is not supported with an else clause", test.range);
        }
        // while True: <pre>; if not test: break; body
        let mut inner = Vec::new();
        let value = self.value(test, &mut inner);
        inner.push(Stmt::new(
            StmtKind::If {
                test: Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(value),
                },
                body: vec![Stmt::new(StmtKind::Break, line)],
                orelse: Vec::new(),
            },
            line,
        ));
        inner.extend(self.block(body));
        StmtKind::While {
            test: Expr::Const(Value::Bool(true)),
            body: inner,
            orelse: Vec::new(),
        }
    }

    /// `with a, b:` is `with a: with b:`.
    fn with_items(&mut self, items: &[ast::WithItem], body: &[StmtLoc], line: u32, out: &mut Vec<Stmt>) {
        let Some((item, rest)) = items.split_first() else {
            out.extend(self.block(body));
            return;
        };
        let context = self.value(&item.context, out);
        let target = item.target.as_ref().map(|t| self.target(t));
        let mut inner = Vec::new();
        if rest.is_empty() {
            inner = self.block(body);
        } else {
            self.with_items(rest, body, line, &mut inner);
        }
        let manager_temp = self.temp();
        out.push(Stmt::new(
            StmtKind::With {
                context,
                target,
                body: inner,
                manager_temp,
            },
            line,
        ));
    }

    fn target(&mut self, target: &ExprLoc) -> Target {
        if contains_yield(target) {
            self.error("'yield' is not supported in an assignment target", target.range);
        }
        match &target.expr {
            ast::Expr::Name(id) => Target::Name(self.resolve(id.name, id.range)),
            ast::Expr::Attribute { value, attr } => Target::Attr {
                value: self.expr(value),
                name: self.text(attr.name),
            },
            ast::Expr::Subscript { value, index } => Target::Item {
                value: self.expr(value),
                index: self.expr(index),
            },
            ast::Expr::Tuple(items) | ast::Expr::List(items) => {
                let mut star = None;
                let mut targets = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    if let ast::Expr::Starred(inner) = &item.expr {
                        if star.is_some() {
                            self.error("multiple starred expressions in assignment", item.range);
                        }
                        star = Some(index);
                        targets.push(self.target(inner));
                    } else {
                        targets.push(self.target(item));
                    }
                }
                Target::Unpack { items: targets, star }
            }
            ast::Expr::Starred(_) => {
                self.error("starred assignment target must be in a list or tuple", target.range);
                Target::Unpack {
                    items: Vec::new(),
                    star: None,
                }
            }
            _ => {
                self.error("cannot assign to expression", target.range);
                Target::Unpack {
                    items: Vec::new(),
                    star: None,
                }
            }
        }
    }

    fn aug_target(&mut self, target: &ExprLoc, out: &mut Vec<Stmt>) -> AugTarget {
        match &target.expr {
            ast::Expr::Name(id) => AugTarget::Name(self.resolve(id.name, id.range)),
            ast::Expr::Attribute { value, attr } => {
                let name = self.text(attr.name);
                let value = self.value(value, out);
                AugTarget::Attr {
                    value,
                    site: self.site(SiteOp::GetAttr(Arc::clone(&name)), target.range.line()),
                    name,
                }
            }
            ast::Expr::Subscript { value, index } => {
                let object = self.value(value, out);
                let object = if contains_yield(index) {
                    self.spill(object, target.range.line(), out)
                } else {
                    object
                };
                AugTarget::Item {
                    value: object,
                    index: self.value(index, out),
                }
            }
            _ => {
                self.error("illegal expression for augmented assignment", target.range);
                AugTarget::Name(Name {
                    name: "".into(),
                    target: NameRef::Global(0),
                })
            }
        }
    }

    // ---- expressions ----

    /// Lowers an expression that may contain yields; hoisted statements go to `pre`.
    fn value(&mut self, expr: &ExprLoc, pre: &mut Vec<Stmt>) -> Expr {
        if contains_yield(expr) {
            self.hoist(expr, pre)
        } else {
            self.expr(expr)
        }
    }

    /// Lowers an expression known to contain no yields.
    fn expr(&mut self, expr: &ExprLoc) -> Expr {
        self.build(expr, None)
    }

    /// Stores a non-trivial value in a temporary so it is evaluated exactly once.
    fn spill(&mut self, value: Expr, line: u32, pre: &mut Vec<Stmt>) -> Expr {
        if matches!(value, Expr::Temp(_) | Expr::Const(_)) {
            return value;
        }
        let temp = self.temp();
        pre.push(Stmt::new(StmtKind::SetTemp(temp, value), line));
        Expr::Temp(temp)
    }

    fn hoist(&mut self, expr: &ExprLoc, pre: &mut Vec<Stmt>) -> Expr {
        let line = expr.range.line();
        match &expr.expr {
            ast::Expr::Yield(value) => {
                let value = value.as_ref().map(|v| self.value(v, pre));
                let into = self.temp();
                let index = self.next_yield();
                pre.push(Stmt::new(
                    StmtKind::Yield {
                        index,
                        value,
                        into: Some(into),
                    },
                    line,
                ));
                Expr::Temp(into)
            }
            ast::Expr::YieldFrom(value) | ast::Expr::Await(value) => {
                let is_await = matches!(expr.expr, ast::Expr::Await(_));
                let value = self.value(value, pre);
                let into = self.temp();
                let iter_temp = self.temp();
                let index = self.next_yield();
                pre.push(Stmt::new(
                    StmtKind::YieldFrom {
                        index,
                        value,
                        iter_temp,
                        into: Some(into),
                        is_await,
                    },
                    line,
                ));
                Expr::Temp(into)
            }
            ast::Expr::BoolOp { op, values } => {
                let result = self.temp();
                self.hoist_bool_op(*op, values, result, line, pre);
                Expr::Temp(result)
            }
            ast::Expr::IfExp { test, body, orelse } => {
                let result = self.temp();
                let test = self.value(test, pre);
                let mut then = Vec::new();
                let value = self.value(body, &mut then);
                then.push(Stmt::new(StmtKind::SetTemp(result, value), line));
                let mut other = Vec::new();
                let value = self.value(orelse, &mut other);
                other.push(Stmt::new(StmtKind::SetTemp(result, value), line));
                pre.push(Stmt::new(
                    StmtKind::If {
                        test,
                        body: then,
                        orelse: other,
                    },
                    line,
                ));
                Expr::Temp(result)
            }
            ast::Expr::Compare { left, comparisons } if comparisons.len() > 1 => {
                let result = self.temp();
                let left = self.value(left, pre);
                let left = self.spill(left, line, pre);
                self.hoist_chain(left, comparisons, result, line, pre);
                Expr::Temp(result)
            }
            other => {
                let last = children(other).iter().rposition(|c| contains_yield(c)).unwrap_or(0);
                let mut hoist = Hoist { pre, last, seen: 0 };
                self.build(expr, Some(&mut hoist))
            }
        }
    }

    fn hoist_bool_op(&mut self, op: BoolOp, values: &[ExprLoc], result: u32, line: u32, pre: &mut Vec<Stmt>) {
        let Some((first, rest)) = values.split_first() else {
            return;
        };
        let value = self.value(first, pre);
        pre.push(Stmt::new(StmtKind::SetTemp(result, value), line));
        if rest.is_empty() {
            return;
        }
        let test = match op {
            BoolOp::And => Expr::Temp(result),
            BoolOp::Or => Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(Expr::Temp(result)),
            },
        };
        let mut body = Vec::new();
        self.hoist_bool_op(op, rest, result, line, &mut body);
        pre.push(Stmt::new(
            StmtKind::If {
                test,
                body,
                orelse: Vec::new(),
            },
            line,
        ));
    }

    fn hoist_chain(
        &mut self,
        left: Expr,
        comparisons: &[(ast::CmpOp, ExprLoc)],
        result: u32,
        line: u32,
        pre: &mut Vec<Stmt>,
    ) {
        let Some(((op, right), rest)) = comparisons.split_first() else {
            return;
        };
        let right = self.value(right, pre);
        let right = if rest.is_empty() {
            right
        } else {
            self.spill(right, line, pre)
        };
        let next_left = match &right {
            Expr::Temp(temp) => Expr::Temp(*temp),
            Expr::Const(value) => Expr::Const(value.clone()),
            _ => Expr::Const(Value::None),
        };
        let step = self.compare_step(*op, right, line);
        pre.push(Stmt::new(
            StmtKind::SetTemp(
                result,
                Expr::Compare {
                    left: Box::new(left),
                    rest: vec![step],
                },
            ),
            line,
        ));
        if rest.is_empty() {
            return;
        }
        let mut body = Vec::new();
        self.hoist_chain(next_left, rest, result, line, &mut body);
        pre.push(Stmt::new(
            StmtKind::If {
                test: Expr::Temp(result),
                body,
                orelse: Vec::new(),
            },
            line,
        ));
    }

    fn compare_step(&self, op: ast::CmpOp, right: Expr, line: u32) -> CompareStep {
        CompareStep {
            op,
            right,
            site: op.dunder().map(|_| self.site(SiteOp::Compare(op), line)),
        }
    }

    /// Lowers one operand of the node being built.
    fn child(&mut self, expr: &ExprLoc, hoist: Option<&mut Hoist<'_>>) -> Expr {
        let Some(hoist) = hoist else {
            return self.expr(expr);
        };
        let index = hoist.seen;
        hoist.seen += 1;
        if index < hoist.last {
            let value = self.value(expr, hoist.pre);
            self.spill(value, expr.range.line(), hoist.pre)
        } else if index == hoist.last {
            self.value(expr, hoist.pre)
        } else {
            self.expr(expr)
        }
    }

    fn boxed(&mut self, expr: &ExprLoc, hoist: Option<&mut Hoist<'_>>) -> Box<Expr> {
        Box::new(self.child(expr, hoist))
    }

    /// Rebuilds one node. With `hoist`, operands are lowered in evaluation order, matching
    /// [`children`], so the ones before the yield are spilled.
    #[expect(clippy::too_many_lines, reason = "one arm per expression kind")]
    fn build(&mut self, expr: &ExprLoc, mut hoist: Option<&mut Hoist<'_>>) -> Expr {
        let line = expr.range.line();
        match &expr.expr {
            ast::Expr::Constant(value) => Expr::Const(constant(value)),
            ast::Expr::FoldedList(items) => Expr::FoldedList(Arc::new(items.iter().map(constant).collect())),
            ast::Expr::FoldedSet(items) => {
                let values: Vec<Value> = items.iter().map(constant).collect();
                match PySet::from_values(values.iter().cloned()) {
                    Ok(set) => Expr::FoldedSet(set.snapshot()),
                    Err(_) => Expr::Set(values.into_iter().map(|v| Elem::Plain(Expr::Const(v))).collect()),
                }
            }
            ast::Expr::FoldedDict(pairs) => {
                let pairs: Vec<(Value, Value)> = pairs.iter().map(|(k, v)| (constant(k), constant(v))).collect();
                match PyDict::from_pairs(pairs.iter().cloned()) {
                    Ok(dict) => Expr::FoldedDict(dict.snapshot()),
                    Err(_) => Expr::Dict(
                        pairs
                            .into_iter()
                            .map(|(k, v)| DictElem::Pair(Expr::Const(k), Expr::Const(v)))
                            .collect(),
                    ),
                }
            }
            ast::Expr::Name(id) => Expr::Load(self.resolve(id.name, id.range)),
            ast::Expr::Attribute { value, attr } => {
                let name = self.text(attr.name);
                Expr::Attr {
                    value: self.boxed(value, hoist),
                    site: self.site(SiteOp::GetAttr(Arc::clone(&name)), line),
                    name,
                }
            }
            ast::Expr::Subscript { value, index } => Expr::Item {
                value: self.boxed(value, hoist.as_deref_mut()),
                index: self.boxed(index, hoist),
            },
            ast::Expr::Slice { lower, upper, step } => {
                let lower = lower.as_ref().map(|e| self.boxed(e, hoist.as_deref_mut()));
                let upper = upper.as_ref().map(|e| self.boxed(e, hoist.as_deref_mut()));
                let step = step.as_ref().map(|e| self.boxed(e, hoist.as_deref_mut()));
                Expr::Slice { lower, upper, step }
            }
            ast::Expr::Call { func, args } => {
                if let Some(zero_arg_super) = self.zero_arg_super(func, args, line) {
                    return zero_arg_super;
                }
                let func = self.boxed(func, hoist.as_deref_mut());
                let args = args
                    .iter()
                    .map(|arg| match arg {
                        Argument::Positional(e) => Arg::Positional(self.child(e, hoist.as_deref_mut())),
                        Argument::Star(e) => Arg::Star(self.child(e, hoist.as_deref_mut())),
                        Argument::Keyword(name, e) => {
                            Arg::Keyword(self.text(name.name), self.child(e, hoist.as_deref_mut()))
                        }
                        Argument::DoubleStar(e) => Arg::DoubleStar(self.child(e, hoist.as_deref_mut())),
                    })
                    .collect();
                Expr::Call {
                    func,
                    args,
                    site: self.site(SiteOp::Invoke, line),
                }
            }
            ast::Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: self.boxed(operand, hoist),
            },
            ast::Expr::Binary { left, op, right } => Expr::Binary {
                left: self.boxed(left, hoist.as_deref_mut()),
                op: *op,
                right: self.boxed(right, hoist),
                site: self.site(SiteOp::Binary(*op), line),
            },
            ast::Expr::BoolOp { op, values } => Expr::BoolOp {
                op: *op,
                values: values.iter().map(|v| self.child(v, hoist.as_deref_mut())).collect(),
            },
            ast::Expr::Compare { left, comparisons } => {
                let left = self.boxed(left, hoist.as_deref_mut());
                let rest = comparisons
                    .iter()
                    .map(|(op, right)| {
                        let right = self.child(right, hoist.as_deref_mut());
                        self.compare_step(*op, right, line)
                    })
                    .collect();
                Expr::Compare { left, rest }
            }
            ast::Expr::IfExp { test, body, orelse } => Expr::IfExp {
                test: self.boxed(test, hoist.as_deref_mut()),
                body: self.boxed(body, hoist.as_deref_mut()),
                orelse: self.boxed(orelse, hoist),
            },
            ast::Expr::Lambda(def) => {
                let defaults = def
                    .params
                    .posonly
                    .iter()
                    .chain(&def.params.args)
                    .filter_map(|p| p.default.as_ref())
                    .map(|d| self.child(d, hoist.as_deref_mut()))
                    .collect();
                let kw_defaults = def
                    .params
                    .kwonly
                    .iter()
                    .filter_map(|p| p.default.as_ref().map(|d| (p.name.name, d)))
                    .map(|(name, d)| (self.text(name), self.child(d, hoist.as_deref_mut())))
                    .collect();
                Expr::Function(self.function_template(def, defaults, kw_defaults))
            }
            ast::Expr::Tuple(items) => Expr::Tuple(self.elems(items, hoist)),
            ast::Expr::List(items) => Expr::List(self.elems(items, hoist)),
            ast::Expr::Set(items) => Expr::Set(self.elems(items, hoist)),
            ast::Expr::Dict(items) => Expr::Dict(
                items
                    .iter()
                    .map(|item| match item {
                        DictItem::Pair(key, value) => {
                            let key = self.child(key, hoist.as_deref_mut());
                            DictElem::Pair(key, self.child(value, hoist.as_deref_mut()))
                        }
                        DictItem::Unpack(value) => DictElem::Unpack(self.child(value, hoist.as_deref_mut())),
                    })
                    .collect(),
            ),
            ast::Expr::Starred(_) => {
                self.error("can't use starred expression here", expr.range);
                Expr::Const(Value::None)
            }
            ast::Expr::ListComp(comp) => self.comprehension_expr(comp, CompKind::List, expr.range, hoist),
            ast::Expr::SetComp(comp) => self.comprehension_expr(comp, CompKind::Set, expr.range, hoist),
            ast::Expr::DictComp(comp) => self.comprehension_expr(comp, CompKind::Dict, expr.range, hoist),
            ast::Expr::GeneratorExp(comp) => self.comprehension_expr(comp, CompKind::Generator, expr.range, hoist),
            ast::Expr::Yield(_) | ast::Expr::YieldFrom(_) | ast::Expr::Await(_) => {
                self.error("'yield' is not supported here", expr.range);
                Expr::Const(Value::None)
            }
            ast::Expr::Named { target, value } => {
                let value = self.boxed(value, hoist);
                Expr::Named {
                    target: self.resolve(target.name, target.range),
                    value,
                }
            }
            ast::Expr::FString(parts) => Expr::FString(self.fstring(parts, &mut hoist)),
            ast::Expr::Error => Expr::Const(Value::None),
        }
    }

    fn elems(&mut self, items: &[ExprLoc], mut hoist: Option<&mut Hoist<'_>>) -> Vec<Elem> {
        items
            .iter()
            .map(|item| match &item.expr {
                ast::Expr::Starred(inner) => Elem::Star(self.child(inner, hoist.as_deref_mut())),
                _ => Elem::Plain(self.child(item, hoist.as_deref_mut())),
            })
            .collect()
    }

    fn fstring(&mut self, parts: &[FStringPart], hoist: &mut Option<&mut Hoist<'_>>) -> Vec<FPart> {
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                FStringPart::Literal(text) => out.push(FPart::Literal(text.as_str().into())),
                FStringPart::Field {
                    value,
                    conversion,
                    format_spec,
                    self_documenting,
                } => {
                    if let Some(text) = self_documenting {
                        out.push(FPart::Literal(text.as_str().into()));
                    }
                    let value = self.child(value, hoist.as_deref_mut());
                    let spec = self.fstring(format_spec, hoist);
                    // `f"{x=}"` shows the repr unless a conversion or spec says otherwise
                    let conversion = match conversion {
                        None if self_documenting.is_some() && spec.is_empty() => Some('r'),
                        other => *other,
                    };
                    out.push(FPart::Field {
                        value,
                        conversion,
                        spec,
                    });
                }
            }
        }
        out
    }

    fn comprehension_expr(
        &mut self,
        comp: &Comprehension,
        kind: CompKind,
        range: CodeRange,
        hoist: Option<&mut Hoist<'_>>,
    ) -> Expr {
        let iterable = match comp.generators.first() {
            Some(first) => self.child(&first.iter, hoist),
            None => Expr::Tuple(Vec::new()),
        };
        self.comprehension(comp, kind, range, iterable)
    }

    /// `super()` with no arguments inside a method becomes `super(__class__, <first arg>)`.
    fn zero_arg_super(&mut self, func: &ExprLoc, args: &[Argument], line: u32) -> Option<Expr> {
        let ast::Expr::Name(id) = &func.expr else {
            return None;
        };
        if Some(id.name) != self.super_name || !args.is_empty() {
            return None;
        }
        let scope = self.scopes.get(self.state.scope);
        if scope.kind != ScopeKind::Function {
            return None;
        }
        let cell = self.class_cell?;
        if scope.kind_of(cell) != Some(VariableKind::Free) {
            return None;
        }
        let class_cell = closure_slot(scope.closure_index(cell));
        let first = *scope.params.first()?;
        let receiver = self.resolve(first, func.range);
        Some(Expr::Super {
            func: Box::new(Expr::Load(self.resolve(id.name, id.range))),
            class_cell,
            receiver,
            site: self.site(SiteOp::Invoke, line),
        })
    }
}

fn closure_slot(index: Option<usize>) -> u32 {
    index.and_then(|i| u32::try_from(i).ok()).unwrap_or(u32::MAX)
}

fn constant(value: &Const) -> Value {
    match value {
        Const::None => Value::None,
        Const::Ellipsis => Value::Ellipsis,
        Const::Bool(b) => Value::Bool(*b),
        Const::Int(i) => Value::Int(*i),
        Const::BigInt(b) => Value::from_bigint(b.clone()),
        Const::Float(f) => Value::Float(*f),
        Const::Str(s) => Value::str(s),
        Const::Bytes(b) => Value::Bytes(b.as_slice().into()),
        Const::Tuple(items) => Value::tuple(items.iter().map(constant).collect()),
    }
}

/// Operands of a node in evaluation order. Lambda bodies and comprehension bodies run in
/// their own frames, so only their defaults and first iterable count.
fn children(expr: &ast::Expr) -> Vec<&ExprLoc> {
    use ast::Expr as E;
    match expr {
        E::Constant(_) | E::FoldedList(_) | E::FoldedSet(_) | E::FoldedDict(_) | E::Name(_) | E::Error => Vec::new(),
        E::Attribute { value, .. } | E::Unary { operand: value, .. } | E::Starred(value) => vec![value.as_ref()],
        E::Named { value, .. } | E::YieldFrom(value) | E::Await(value) => vec![value.as_ref()],
        E::Yield(value) => value.iter().map(AsRef::as_ref).collect(),
        E::Subscript { value, index } => vec![value.as_ref(), index.as_ref()],
        E::Slice { lower, upper, step } => [lower, upper, step]
            .into_iter()
            .filter_map(|e| e.as_deref())
            .collect(),
        E::Call { func, args } => {
            let mut out: Vec<&ExprLoc> = vec![func.as_ref()];
            out.extend(args.iter().map(|arg| match arg {
                Argument::Positional(e) | Argument::Star(e) | Argument::Keyword(_, e) | Argument::DoubleStar(e) => e,
            }));
            out
        }
        E::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
        E::BoolOp { values, .. } => values.iter().collect(),
        E::Compare { left, comparisons } => {
            let mut out: Vec<&ExprLoc> = vec![left.as_ref()];
            out.extend(comparisons.iter().map(|(_, e)| e));
            out
        }
        E::IfExp { test, body, orelse } => vec![test.as_ref(), body.as_ref(), orelse.as_ref()],
        E::Lambda(def) => def
            .params
            .posonly
            .iter()
            .chain(&def.params.args)
            .chain(&def.params.kwonly)
            .filter_map(|p| p.default.as_ref())
            .collect(),
        E::Tuple(items) | E::List(items) | E::Set(items) => items
            .iter()
            .map(|item| match &item.expr {
                E::Starred(inner) => inner.as_ref(),
                _ => item,
            })
            .collect(),
        E::Dict(items) => items
            .iter()
            .flat_map(|item| match item {
                DictItem::Pair(k, v) => vec![k, v],
                DictItem::Unpack(v) => vec![v],
            })
            .collect(),
        E::ListComp(comp) | E::SetComp(comp) | E::DictComp(comp) | E::GeneratorExp(comp) => {
            comp.generators.first().map(|g| &g.iter).into_iter().collect()
        }
        E::FString(parts) => {
            let mut out = Vec::new();
            fstring_children(parts, &mut out);
            out
        }
    }
}

fn fstring_children<'e>(parts: &'e [FStringPart], out: &mut Vec<&'e ExprLoc>) {
    for part in parts {
        if let FStringPart::Field { value, format_spec, .. } = part {
            out.push(value);
            fstring_children(format_spec, out);
        }
    }
}

/// Whether evaluating `expr` in the current frame can suspend it.
fn contains_yield(expr: &ExprLoc) -> bool {
    match &expr.expr {
        ast::Expr::Yield(_) | ast::Expr::YieldFrom(_) | ast::Expr::Await(_) => true,
        other => children(other).into_iter().any(contains_yield),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{parse::parse, prepare::bind};

    fn lower_source(source: &str, options: &CompileOptions) -> Result<LoweredUnit, Vec<BindError>> {
        let mut interner = Interner::new();
        let ast = parse(source, options.kind, &mut interner).expect("parse");
        let scopes = bind(&ast, &mut interner)?;
        lower(&ast, &scopes, &interner, options, "test.py".into())
    }

    fn module(source: &str) -> LoweredUnit {
        lower_source(source, &CompileOptions::default()).expect("lower")
    }

    fn def_code(stmt: &Stmt) -> &Arc<FunctionCode> {
        match &stmt.kind {
            StmtKind::Def { template, .. } => &template.code,
            other => panic!("expected def, got {other:?}"),
        }
    }

    #[test]
    fn names_resolve_to_their_storage() {
        let unit = module("x = 1\ndef f(a):\n    b = a\n    def g():\n        return b + x\n    return g\n");
        let f = def_code(&unit.code.body[1]);
        assert_eq!(f.local_names.iter().map(AsRef::as_ref).collect::<Vec<&str>>(), ["a", "g"]);
        assert_eq!(f.cell_names.iter().map(AsRef::as_ref).collect::<Vec<&str>>(), ["b"]);
        let g = def_code(&f.body[1]);
        assert_eq!(g.qualname.as_ref(), "f.<locals>.g");
        let StmtKind::Return(Some(Expr::Binary { left, right, .. })) = &g.body[0].kind else {
            panic!("unexpected body {:?}", g.body[0]);
        };
        assert!(matches!(&**left, Expr::Load(Name { target: NameRef::Cell(0), .. })));
        assert!(matches!(&**right, Expr::Load(Name { target: NameRef::Global(_), .. })));
    }

    #[test]
    fn yields_are_hoisted_in_order() {
        let unit = module("def gen():\n    x = f((yield 1), (yield 2))\n    yield x\n");
        let code = def_code(&unit.code.body[0]);
        assert!(code.is_generator());
        assert!(code.needs_heap_frame());
        let indexes: Vec<u32> = code
            .body
            .iter()
            .filter_map(|stmt| match stmt.kind {
                StmtKind::Yield { index, .. } => Some(index),
                _ => None,
            })
            .collect();
        assert_eq!(indexes, [0, 1, 2]);
        // the callee is spilled before the first yield so resuming does not reload it
        assert!(matches!(code.body[0].kind, StmtKind::SetTemp(..)));
    }

    #[test]
    fn class_bodies_fall_back_to_globals() {
        let unit = module("class C:\n    '''doc'''\n    y = 2\n    def m(self):\n        return __class__\n");
        let StmtKind::Class(node) = &unit.code.body[0].kind else {
            panic!("expected class");
        };
        assert_eq!(node.class_cell, Some(0));
        assert!(node.body.doc.is_some());
        assert!(matches!(
            &node.body.body[0].kind,
            StmtKind::Assign { targets, .. }
                if matches!(&targets[0], Target::Name(Name { target: NameRef::Local { .. }, .. }))
        ));
        let method = def_code(&node.body.body[1]);
        assert_eq!(method.qualname.as_ref(), "C.m");
    }

    #[test]
    fn constant_literals_fold() {
        let unit = module("a = [1, 2, 3]\nb = {1: 'x'}\n");
        assert!(matches!(&unit.code.body[0].kind, StmtKind::Assign { value: Expr::FoldedList(items), .. } if items.len() == 3));
        assert!(matches!(&unit.code.body[1].kind, StmtKind::Assign { value: Expr::FoldedDict(_), .. }));
    }

    #[test]
    fn optimize_strips_asserts_and_docstrings() {
        let options = CompileOptions {
            optimize: true,
            ..CompileOptions::default()
        };
        let unit = lower_source("'''doc'''\nassert False\nx = 1\n", &options).expect("lower");
        assert!(unit.code.doc.is_none());
        assert_eq!(unit.code.body.len(), 1);
    }

    #[test]
    fn yield_in_target_is_rejected() {
        let errors = lower_source("def g():\n    a[(yield)] = 1\n", &CompileOptions::default()).unwrap_err();
        assert!(errors[0].message.contains("assignment target"), "{errors:?}");
    }

    #[test]
    fn comprehension_captures_enclosing_cells() {
        let unit = module("def f(n):\n    return [i * n for i in range(n)]\n");
        let f = def_code(&unit.code.body[0]);
        let StmtKind::Return(Some(Expr::Comprehension { template, .. })) = &f.body[0].kind else {
            panic!("expected comprehension");
        };
        assert_eq!(template.closure, [0]);
        assert_eq!(template.code.qualname.as_ref(), "f.<locals>.<listcomp>");
    }

    #[test]
    fn every_dynamic_operation_gets_a_recorded_site() {
        let unit = module("def f(o, b):\n    return o.x + b(1)\n");
        let ops: Vec<String> = unit.sites.iter().map(|site| site.op().to_string()).collect();
        assert_eq!(ops, ["getattr .x", "invoke", "binary +"]);
        assert!(unit.sites.iter().all(|site| site.line() == 2));
    }
}
