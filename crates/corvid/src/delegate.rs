//! The compiled tier.
//!
//! Once a code object has been entered often enough, its lowered tree is translated into a
//! tree of boxed closures, one per statement and expression. Each closure owns exactly what
//! it needs (names, constants, call sites, nested code objects) and calls straight into its
//! children, so running a delegate does no matching on tree nodes at all.
//!
//! Delegates never run generator bodies, so they have no resume logic: loops keep their
//! iterator in a Rust local, and `finally` keeps its pending outcome on the Rust stack.
//! The value-level work is shared with the tree walker through the helpers in
//! `interp::exec`, which keeps the two tiers observably identical.

use std::{fmt, sync::Arc};

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    expressions::{BoolOp, CmpOp},
    import,
    interp::{
        ExecCtx, Flow, Frame, Pending,
        exec::{
            ClassShape, append_item, append_pair, apply_decorators, assertion_error, build_class, current_package,
            exception_matches, format_field, import_name, invoke, make_function, push_double_star, push_keyword,
            push_star, raise_error, run_comprehension, store_dynamic, unpack_values, with_enter, with_finish,
            zero_arg_super,
        },
    },
    lower::tree::{
        Arg, AugTarget, Collect, DictElem, Elem, Expr, FPart, Handler, ImportName, Name, NameRef, Stmt, StmtKind,
        Target,
    },
    ops::{
        self,
        attr::{del_attr, set_attr},
        compare::{compare, truthy},
        item::{del_item, get_item, set_item},
    },
    sites::CompareSite,
    types::{CallArgs, FunctionCode, PyDict, PyList, PySet, PySlice},
    value::Value,
};

type ExprFn = Box<dyn Fn(&mut ExecCtx, &mut Frame) -> RunResult<Value> + Send + Sync>;
type StmtFn = Box<dyn Fn(&mut ExecCtx, &mut Frame) -> RunResult<Flow> + Send + Sync>;

fn stmt_fn(f: impl Fn(&mut ExecCtx, &mut Frame) -> RunResult<Flow> + Send + Sync + 'static) -> StmtFn {
    Box::new(f)
}

fn expr_fn(f: impl Fn(&mut ExecCtx, &mut Frame) -> RunResult<Value> + Send + Sync + 'static) -> ExprFn {
    Box::new(f)
}

struct CompiledStmt {
    line: u32,
    run: StmtFn,
}

type Block = Vec<CompiledStmt>;

/// A code object's body compiled to closures.
pub struct Delegate {
    body: Block,
}

impl Delegate {
    #[must_use]
    pub(crate) fn compile(code: &FunctionCode) -> Self {
        Self {
            body: block(&code.body),
        }
    }

    pub(crate) fn run(&self, ctx: &mut ExecCtx, frame: &mut Frame) -> RunResult<Flow> {
        run_block(ctx, frame, &self.body)
    }

    /// Number of top-level statements, for diagnostics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

impl fmt::Debug for Delegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegate").field("statements", &self.body.len()).finish()
    }
}

fn run_block(ctx: &mut ExecCtx, frame: &mut Frame, block: &[CompiledStmt]) -> RunResult<Flow> {
    for stmt in block {
        frame.line = stmt.line;
        ctx.safe_point()?;
        match (stmt.run)(ctx, frame) {
            Ok(Flow::Normal) => {}
            Ok(flow) => return Ok(flow),
            Err(err) => {
                ctx.note_raise(&err, frame.line);
                return Err(err);
            }
        }
    }
    Ok(Flow::Normal)
}

fn block(stmts: &[Stmt]) -> Block {
    stmts
        .iter()
        .map(|s| CompiledStmt {
            line: s.line,
            run: stmt(s),
        })
        .collect()
}

// -- statements --

fn stmt(s: &Stmt) -> StmtFn {
    match &s.kind {
        StmtKind::Expr(e) => {
            let e = expr(e);
            stmt_fn(move |ctx, frame| {
                e(ctx, frame)?;
                Ok(Flow::Normal)
            })
        }
        StmtKind::Assign { targets, value } => {
            let value = expr(value);
            let mut targets: Vec<CTarget> = targets.iter().map(CTarget::compile).collect();
            if targets.len() == 1
                && let Some(target) = targets.pop()
            {
                return stmt_fn(move |ctx, frame| {
                    let value = value(ctx, frame)?;
                    target.assign(ctx, frame, value)?;
                    Ok(Flow::Normal)
                });
            }
            stmt_fn(move |ctx, frame| {
                let value = value(ctx, frame)?;
                for target in &targets {
                    target.assign(ctx, frame, value.clone())?;
                }
                Ok(Flow::Normal)
            })
        }
        StmtKind::AugAssign { target, op, value, site } => {
            let (op, site, value) = (*op, Arc::clone(site), expr(value));
            match target {
                AugTarget::Name(name) => {
                    let name = name.clone();
                    stmt_fn(move |ctx, frame| {
                        let current = frame.load(ctx, &name)?;
                        let rhs = value(ctx, frame)?;
                        let result = site.run(ctx, op, &current, &rhs)?;
                        frame.store(&name, result);
                        Ok(Flow::Normal)
                    })
                }
                AugTarget::Attr {
                    value: object,
                    name,
                    site: attr_site,
                } => {
                    let (object, name, attr_site) = (expr(object), Arc::clone(name), Arc::clone(attr_site));
                    stmt_fn(move |ctx, frame| {
                        let object = object(ctx, frame)?;
                        let current = attr_site.get(ctx, &object, &name)?;
                        let rhs = value(ctx, frame)?;
                        let result = site.run(ctx, op, &current, &rhs)?;
                        set_attr(ctx, &object, &name, result)?;
                        Ok(Flow::Normal)
                    })
                }
                AugTarget::Item { value: object, index } => {
                    let (object, index) = (expr(object), expr(index));
                    stmt_fn(move |ctx, frame| {
                        let object = object(ctx, frame)?;
                        let index = index(ctx, frame)?;
                        let current = get_item(ctx, &object, &index)?;
                        let rhs = value(ctx, frame)?;
                        let result = site.run(ctx, op, &current, &rhs)?;
                        set_item(ctx, &object, &index, result)?;
                        Ok(Flow::Normal)
                    })
                }
            }
        }
        StmtKind::Delete(targets) => {
            let targets: Vec<CTarget> = targets.iter().map(CTarget::compile).collect();
            stmt_fn(move |ctx, frame| {
                for target in &targets {
                    target.delete(ctx, frame)?;
                }
                Ok(Flow::Normal)
            })
        }
        StmtKind::SetTemp(index, e) => {
            let (index, e) = (*index, expr(e));
            stmt_fn(move |ctx, frame| {
                let value = e(ctx, frame)?;
                frame.set_temp(index, value);
                Ok(Flow::Normal)
            })
        }
        StmtKind::Pass => stmt_fn(|_, _| Ok(Flow::Normal)),
        StmtKind::Break => stmt_fn(|_, _| Ok(Flow::Break)),
        StmtKind::Continue => stmt_fn(|_, _| Ok(Flow::Continue)),
        StmtKind::Return(value) => match value {
            Some(value) => {
                let value = expr(value);
                stmt_fn(move |ctx, frame| Ok(Flow::Return(value(ctx, frame)?)))
            }
            None => stmt_fn(|_, _| Ok(Flow::Return(Value::None))),
        },
        StmtKind::Raise { exc, cause } => {
            let exc = exc.as_ref().map(expr);
            let cause = cause.as_ref().map(expr);
            stmt_fn(move |ctx, frame| {
                let exc = exc.as_ref().map(|e| e(ctx, frame)).transpose()?;
                let cause = cause.as_ref().map(|e| e(ctx, frame)).transpose()?;
                Err(raise_error(ctx, exc, cause))
            })
        }
        StmtKind::If { test, body, orelse } => {
            let (test, body, orelse) = (expr(test), block(body), block(orelse));
            stmt_fn(move |ctx, frame| {
                let value = test(ctx, frame)?;
                if truthy(ctx, &value)? {
                    run_block(ctx, frame, &body)
                } else {
                    run_block(ctx, frame, &orelse)
                }
            })
        }
        StmtKind::While { test, body, orelse } => {
            let (test, body, orelse) = (expr(test), block(body), block(orelse));
            stmt_fn(move |ctx, frame| {
                loop {
                    ctx.check_interrupt()?;
                    let value = test(ctx, frame)?;
                    if !truthy(ctx, &value)? {
                        break;
                    }
                    match run_block(ctx, frame, &body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => return Ok(Flow::Normal),
                        flow => return Ok(flow),
                    }
                }
                run_block(ctx, frame, &orelse)
            })
        }
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
            ..
        } => {
            let (target, iter, body, orelse) = (CTarget::compile(target), expr(iter), block(body), block(orelse));
            stmt_fn(move |ctx, frame| {
                let iterable = iter(ctx, frame)?;
                let iterator = ops::iter::iter(ctx, &iterable)?;
                while let Some(item) = ops::iter::next(ctx, &iterator)? {
                    ctx.check_interrupt()?;
                    target.assign(ctx, frame, item)?;
                    match run_block(ctx, frame, &body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => return Ok(Flow::Normal),
                        flow => return Ok(flow),
                    }
                }
                run_block(ctx, frame, &orelse)
            })
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        } => {
            let body = block(body);
            let handlers: Vec<CHandler> = handlers.iter().map(CHandler::compile).collect();
            let orelse = block(orelse);
            let finalbody = block(finalbody);
            stmt_fn(move |ctx, frame| {
                let outcome = match run_block(ctx, frame, &body) {
                    Ok(Flow::Normal) => run_block(ctx, frame, &orelse),
                    Ok(flow) => Ok(flow),
                    Err(err) => {
                        frame.record_in(&err);
                        catch(ctx, frame, &handlers, err)
                    }
                };
                if finalbody.is_empty() {
                    return outcome;
                }
                let pending = Pending::from_outcome(outcome);
                match run_block(ctx, frame, &finalbody) {
                    Ok(Flow::Normal) => pending.replay(),
                    Ok(flow) => Ok(flow),
                    Err(err) => {
                        if let Pending::Raise(previous) = &pending {
                            err.attach_context(&previous.value());
                        }
                        Err(err)
                    }
                }
            })
        }
        StmtKind::With {
            context, target, body, ..
        } => {
            let context = expr(context);
            let target = target.as_ref().map(CTarget::compile);
            let body = block(body);
            stmt_fn(move |ctx, frame| {
                let manager = context(ctx, frame)?;
                let (exit, entered) = with_enter(ctx, &manager)?;
                let result = match &target {
                    Some(target) => match target.assign(ctx, frame, entered) {
                        Ok(()) => run_block(ctx, frame, &body),
                        Err(err) => Err(err),
                    },
                    None => run_block(ctx, frame, &body),
                };
                with_finish(ctx, &exit, result)
            })
        }
        StmtKind::Assert { test, msg } => {
            let test = expr(test);
            let msg = msg.as_ref().map(expr);
            stmt_fn(move |ctx, frame| {
                let value = test(ctx, frame)?;
                if truthy(ctx, &value)? {
                    return Ok(Flow::Normal);
                }
                let msg = msg.as_ref().map(|m| m(ctx, frame)).transpose()?;
                Err(assertion_error(msg))
            })
        }
        StmtKind::Import {
            module,
            target,
            bind_leaf,
        } => {
            let (module, target, bind_leaf) = (Arc::clone(module), target.clone(), *bind_leaf);
            stmt_fn(move |ctx, frame| {
                let value = import_name(ctx, frame, &module, bind_leaf)?;
                frame.store(&target, value);
                Ok(Flow::Normal)
            })
        }
        StmtKind::ImportFrom { module, level, names } => {
            let (module, level) = (Arc::clone(module), *level);
            let names: Vec<(Arc<str>, Name)> = names
                .iter()
                .map(|ImportName { name, target }| (Arc::clone(name), target.clone()))
                .collect();
            stmt_fn(move |ctx, frame| {
                let source = import::import_module(ctx, &module, level, current_package(frame).as_deref())?;
                for (name, target) in &names {
                    let value = import::import_from(ctx, &source.leaf, name)?;
                    frame.store(target, value);
                }
                Ok(Flow::Normal)
            })
        }
        StmtKind::ImportStar { module, level } => {
            let (module, level) = (Arc::clone(module), *level);
            stmt_fn(move |ctx, frame| {
                let source = import::import_module(ctx, &module, level, current_package(frame).as_deref())?;
                for (name, value) in import::public_names(ctx, &source.leaf)? {
                    store_dynamic(frame, &name, value);
                }
                Ok(Flow::Normal)
            })
        }
        StmtKind::Def {
            template,
            decorators,
            target,
        } => {
            let decorators: Vec<ExprFn> = decorators.iter().map(expr).collect();
            let maker = FunctionMaker::compile(&template.code, &template.closure, &template.defaults, &template.kw_defaults);
            let target = target.clone();
            stmt_fn(move |ctx, frame| {
                let decorators = eval_all(ctx, frame, &decorators)?;
                let function = maker.make(ctx, frame)?;
                let value = apply_decorators(ctx, decorators, function)?;
                frame.store(&target, value);
                Ok(Flow::Normal)
            })
        }
        StmtKind::Class(node) => {
            let decorators: Vec<ExprFn> = node.decorators.iter().map(expr).collect();
            let bases: Vec<CElem> = node.bases.iter().map(CElem::compile).collect();
            let keywords: Vec<(Arc<str>, ExprFn)> = node
                .keywords
                .iter()
                .map(|(name, value)| (Arc::clone(name), expr(value)))
                .collect();
            let (name, qualname, body) = (Arc::clone(&node.name), Arc::clone(&node.qualname), Arc::clone(&node.body));
            let (closure, class_cell, target) = (node.closure.clone(), node.class_cell, node.target.clone());
            stmt_fn(move |ctx, frame| {
                let decorators = eval_all(ctx, frame, &decorators)?;
                let bases = eval_elems(ctx, frame, &bases)?;
                let keywords = keywords
                    .iter()
                    .map(|(name, value)| Ok((Arc::clone(name), value(ctx, frame)?)))
                    .collect::<RunResult<Vec<_>>>()?;
                let shape = ClassShape {
                    name: &name,
                    qualname: &qualname,
                    body: &body,
                    closure: &closure,
                    class_cell,
                };
                let class = build_class(ctx, frame, shape, bases, keywords)?;
                let value = apply_decorators(ctx, decorators, class)?;
                frame.store(&target, value);
                Ok(Flow::Normal)
            })
        }
        StmtKind::Yield { .. } | StmtKind::YieldFrom { .. } => stmt_fn(|_, _| {
            Err(RunError::new(
                ExcType::RuntimeError,
                "compiled code cannot suspend; generator bodies run in the interpreter",
            ))
        }),
        StmtKind::Append { temp, value } => {
            let temp = *temp;
            match value {
                Collect::List(item) | Collect::Set(item) => {
                    let item = expr(item);
                    stmt_fn(move |ctx, frame| {
                        let accumulator = frame.temp_value(temp)?;
                        let item = item(ctx, frame)?;
                        append_item(&accumulator, item)?;
                        Ok(Flow::Normal)
                    })
                }
                Collect::Dict(key, value) => {
                    let (key, value) = (expr(key), expr(value));
                    stmt_fn(move |ctx, frame| {
                        let accumulator = frame.temp_value(temp)?;
                        let key = key(ctx, frame)?;
                        let value = value(ctx, frame)?;
                        append_pair(&accumulator, key, value)?;
                        Ok(Flow::Normal)
                    })
                }
            }
        }
    }
}

struct CHandler {
    kind: Option<ExprFn>,
    name: Option<Name>,
    body: Block,
}

impl CHandler {
    fn compile(handler: &Handler) -> Self {
        Self {
            kind: handler.kind.as_ref().map(expr),
            name: handler.name.clone(),
            body: block(&handler.body),
        }
    }
}

fn catch(ctx: &mut ExecCtx, frame: &mut Frame, handlers: &[CHandler], err: RunError) -> RunResult<Flow> {
    for handler in handlers {
        let matched = match &handler.kind {
            None => true,
            Some(kind) => {
                let kind = kind(ctx, frame).inspect_err(|e| e.attach_context(&err.value()))?;
                exception_matches(&err, &kind).inspect_err(|e| e.attach_context(&err.value()))?
            }
        };
        if !matched {
            continue;
        }
        if let Some(name) = &handler.name {
            frame.store(name, err.value());
        }
        ctx.push_handled(err.clone());
        let result = run_block(ctx, frame, &handler.body);
        ctx.pop_handled();
        if let Some(name) = &handler.name {
            let _ = frame.delete(name);
        }
        if let Err(raised) = &result {
            raised.attach_context(&err.value());
        }
        return result;
    }
    Err(err)
}

/// An assignment or deletion target.
enum CTarget {
    Name(Name),
    Attr(ExprFn, Arc<str>),
    Item(ExprFn, ExprFn),
    Unpack(Vec<CTarget>, Option<usize>),
}

impl CTarget {
    fn compile(target: &Target) -> Self {
        match target {
            Target::Name(name) => Self::Name(name.clone()),
            Target::Attr { value, name } => Self::Attr(expr(value), Arc::clone(name)),
            Target::Item { value, index } => Self::Item(expr(value), expr(index)),
            Target::Unpack { items, star } => Self::Unpack(items.iter().map(Self::compile).collect(), *star),
        }
    }

    fn assign(&self, ctx: &mut ExecCtx, frame: &mut Frame, value: Value) -> RunResult<()> {
        match self {
            Self::Name(name) => frame.store(name, value),
            Self::Attr(object, name) => {
                let object = object(ctx, frame)?;
                set_attr(ctx, &object, name, value)?;
            }
            Self::Item(object, index) => {
                let object = object(ctx, frame)?;
                let index = index(ctx, frame)?;
                set_item(ctx, &object, &index, value)?;
            }
            Self::Unpack(items, star) => {
                let values = unpack_values(ctx, &value, items.len(), *star)?;
                for (target, value) in items.iter().zip(values) {
                    target.assign(ctx, frame, value)?;
                }
            }
        }
        Ok(())
    }

    fn delete(&self, ctx: &mut ExecCtx, frame: &mut Frame) -> RunResult<()> {
        match self {
            Self::Name(name) => frame.delete(name),
            Self::Attr(object, name) => {
                let object = object(ctx, frame)?;
                del_attr(ctx, &object, name)
            }
            Self::Item(object, index) => {
                let object = object(ctx, frame)?;
                let index = index(ctx, frame)?;
                del_item(ctx, &object, &index)
            }
            Self::Unpack(items, _) => items.iter().try_for_each(|item| item.delete(ctx, frame)),
        }
    }
}

/// Creates function objects for `def` and `lambda`.
struct FunctionMaker {
    code: Arc<FunctionCode>,
    closure: Vec<u32>,
    defaults: Vec<ExprFn>,
    kw_defaults: Vec<(Arc<str>, ExprFn)>,
}

impl FunctionMaker {
    fn compile(code: &Arc<FunctionCode>, closure: &[u32], defaults: &[Expr], kw_defaults: &[(Arc<str>, Expr)]) -> Self {
        Self {
            code: Arc::clone(code),
            closure: closure.to_vec(),
            defaults: defaults.iter().map(expr).collect(),
            kw_defaults: kw_defaults
                .iter()
                .map(|(name, value)| (Arc::clone(name), expr(value)))
                .collect(),
        }
    }

    fn make(&self, ctx: &mut ExecCtx, frame: &mut Frame) -> RunResult<Value> {
        let defaults = eval_all(ctx, frame, &self.defaults)?;
        let kw_defaults = self
            .kw_defaults
            .iter()
            .map(|(name, value)| Ok((Arc::clone(name), value(ctx, frame)?)))
            .collect::<RunResult<Vec<_>>>()?;
        Ok(make_function(frame, &self.code, &self.closure, defaults, kw_defaults))
    }
}

// -- expressions --

enum CElem {
    Plain(ExprFn),
    Star(ExprFn),
}

impl CElem {
    fn compile(elem: &Elem) -> Self {
        match elem {
            Elem::Plain(e) => Self::Plain(expr(e)),
            Elem::Star(e) => Self::Star(expr(e)),
        }
    }
}

enum CArg {
    Positional(ExprFn),
    Star(ExprFn),
    Keyword(Arc<str>, ExprFn),
    DoubleStar(ExprFn),
}

enum CDictElem {
    Pair(ExprFn, ExprFn),
    Unpack(ExprFn),
}

enum CFPart {
    Literal(Arc<str>),
    Field {
        value: ExprFn,
        conversion: Option<char>,
        spec: Vec<CFPart>,
    },
}

impl CFPart {
    fn compile(part: &FPart) -> Self {
        match part {
            FPart::Literal(text) => Self::Literal(Arc::clone(text)),
            FPart::Field { value, conversion, spec } => Self::Field {
                value: expr(value),
                conversion: *conversion,
                spec: spec.iter().map(Self::compile).collect(),
            },
        }
    }
}

fn eval_all(ctx: &mut ExecCtx, frame: &mut Frame, exprs: &[ExprFn]) -> RunResult<Vec<Value>> {
    exprs.iter().map(|e| e(ctx, frame)).collect()
}

fn eval_elems(ctx: &mut ExecCtx, frame: &mut Frame, elems: &[CElem]) -> RunResult<Vec<Value>> {
    let mut out = Vec::with_capacity(elems.len());
    for elem in elems {
        match elem {
            CElem::Plain(e) => out.push(e(ctx, frame)?),
            CElem::Star(e) => {
                let value = e(ctx, frame)?;
                out.extend(ops::iter::collect(ctx, &value)?);
            }
        }
    }
    Ok(out)
}

fn eval_args(ctx: &mut ExecCtx, frame: &mut Frame, args: &[CArg]) -> RunResult<CallArgs> {
    let mut out = CallArgs::new();
    for arg in args {
        match arg {
            CArg::Positional(e) => out.positional.push(e(ctx, frame)?),
            CArg::Star(e) => {
                let value = e(ctx, frame)?;
                push_star(ctx, &mut out, &value)?;
            }
            CArg::Keyword(name, e) => {
                let value = e(ctx, frame)?;
                push_keyword(&mut out, Arc::clone(name), value)?;
            }
            CArg::DoubleStar(e) => {
                let value = e(ctx, frame)?;
                push_double_star(ctx, &mut out, &value)?;
            }
        }
    }
    Ok(out)
}

fn render(ctx: &mut ExecCtx, frame: &mut Frame, parts: &[CFPart]) -> RunResult<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            CFPart::Literal(text) => out.push_str(text),
            CFPart::Field { value, conversion, spec } => {
                let value = value(ctx, frame)?;
                let spec = render(ctx, frame, spec)?;
                out.push_str(&format_field(ctx, &value, *conversion, &spec)?);
            }
        }
    }
    Ok(out)
}

fn optional(e: Option<&Expr>) -> Option<ExprFn> {
    e.map(expr)
}

fn expr(e: &Expr) -> ExprFn {
    match e {
        Expr::Const(value) => {
            let value = value.clone();
            expr_fn(move |_, _| Ok(value.clone()))
        }
        Expr::FoldedList(items) => {
            let items = Arc::clone(items);
            expr_fn(move |_, _| Ok(Value::List(Arc::new(PyList::from_shared(Arc::clone(&items))))))
        }
        Expr::FoldedSet(items) => {
            let items = Arc::clone(items);
            expr_fn(move |_, _| Ok(Value::Set(Arc::new(PySet::from_shared(Arc::clone(&items))))))
        }
        Expr::FoldedDict(items) => {
            let items = Arc::clone(items);
            expr_fn(move |_, _| Ok(Value::Dict(Arc::new(PyDict::from_shared(Arc::clone(&items))))))
        }
        Expr::Load(name) => load(name.clone()),
        Expr::Temp(index) => {
            let index = *index;
            expr_fn(move |_, frame| frame.temp_value(index))
        }
        Expr::Attr { value, name, site } => {
            let (value, name, site) = (expr(value), Arc::clone(name), Arc::clone(site));
            expr_fn(move |ctx, frame| {
                let object = value(ctx, frame)?;
                site.get(ctx, &object, &name)
            })
        }
        Expr::Item { value, index } => {
            let (value, index) = (expr(value), expr(index));
            expr_fn(move |ctx, frame| {
                let object = value(ctx, frame)?;
                let index = index(ctx, frame)?;
                get_item(ctx, &object, &index)
            })
        }
        Expr::Slice { lower, upper, step } => {
            let parts = [
                optional(lower.as_deref()),
                optional(upper.as_deref()),
                optional(step.as_deref()),
            ];
            expr_fn(move |ctx, frame| {
                let mut values = [Value::None, Value::None, Value::None];
                for (part, value) in parts.iter().zip(&mut values) {
                    if let Some(part) = part {
                        *value = part(ctx, frame)?;
                    }
                }
                let [start, stop, step] = values;
                Ok(Value::Slice(Arc::new(PySlice { start, stop, step })))
            })
        }
        Expr::Call { func, args, site } => {
            let (func, site) = (expr(func), Arc::clone(site));
            if args.iter().all(|a| matches!(a, Arg::Positional(_))) {
                let args: Vec<ExprFn> = args
                    .iter()
                    .filter_map(|a| match a {
                        Arg::Positional(e) => Some(expr(e)),
                        _ => None,
                    })
                    .collect();
                return expr_fn(move |ctx, frame| {
                    let callee = func(ctx, frame)?;
                    let mut call_args = CallArgs::new();
                    for arg in &args {
                        call_args.positional.push(arg(ctx, frame)?);
                    }
                    invoke(ctx, frame, &site, &callee, call_args)
                });
            }
            let args: Vec<CArg> = args
                .iter()
                .map(|a| match a {
                    Arg::Positional(e) => CArg::Positional(expr(e)),
                    Arg::Star(e) => CArg::Star(expr(e)),
                    Arg::Keyword(name, e) => CArg::Keyword(Arc::clone(name), expr(e)),
                    Arg::DoubleStar(e) => CArg::DoubleStar(expr(e)),
                })
                .collect();
            expr_fn(move |ctx, frame| {
                let callee = func(ctx, frame)?;
                let call_args = eval_args(ctx, frame, &args)?;
                invoke(ctx, frame, &site, &callee, call_args)
            })
        }
        Expr::Super {
            func,
            class_cell,
            receiver,
            site,
        } => {
            let (func, class_cell, receiver, site) = (expr(func), *class_cell, receiver.clone(), Arc::clone(site));
            expr_fn(move |ctx, frame| {
                let callee = func(ctx, frame)?;
                zero_arg_super(ctx, frame, &callee, class_cell, &receiver, &site)
            })
        }
        Expr::Unary { op, operand } => {
            let (op, operand) = (*op, expr(operand));
            expr_fn(move |ctx, frame| {
                let operand = operand(ctx, frame)?;
                ops::arith::unary(ctx, op, &operand)
            })
        }
        Expr::Binary { left, op, right, site } => {
            let (left, op, right, site) = (expr(left), *op, expr(right), Arc::clone(site));
            expr_fn(move |ctx, frame| {
                let left = left(ctx, frame)?;
                let right = right(ctx, frame)?;
                site.run(ctx, op, &left, &right)
            })
        }
        Expr::BoolOp { op, values } => {
            let is_and = *op == BoolOp::And;
            let values: Vec<ExprFn> = values.iter().map(expr).collect();
            expr_fn(move |ctx, frame| {
                let mut result = Value::None;
                for value in &values {
                    result = value(ctx, frame)?;
                    if is_and != truthy(ctx, &result)? {
                        break;
                    }
                }
                Ok(result)
            })
        }
        Expr::Compare { left, rest } => {
            let left = expr(left);
            let steps: Vec<(CmpOp, ExprFn, Option<Arc<CompareSite>>)> = rest
                .iter()
                .map(|step| (step.op, expr(&step.right), step.site.clone()))
                .collect();
            expr_fn(move |ctx, frame| {
                let mut left = left(ctx, frame)?;
                let mut result = Value::Bool(true);
                for (op, right, site) in &steps {
                    let right = right(ctx, frame)?;
                    result = match site {
                        Some(site) => site.run(ctx, *op, &left, &right)?,
                        None => compare(ctx, *op, &left, &right)?,
                    };
                    if !truthy(ctx, &result)? {
                        break;
                    }
                    left = right;
                }
                Ok(result)
            })
        }
        Expr::IfExp { test, body, orelse } => {
            let (test, body, orelse) = (expr(test), expr(body), expr(orelse));
            expr_fn(move |ctx, frame| {
                let value = test(ctx, frame)?;
                if truthy(ctx, &value)? {
                    body(ctx, frame)
                } else {
                    orelse(ctx, frame)
                }
            })
        }
        Expr::Function(template) => {
            let maker = FunctionMaker::compile(&template.code, &template.closure, &template.defaults, &template.kw_defaults);
            expr_fn(move |ctx, frame| maker.make(ctx, frame))
        }
        Expr::Comprehension { template, iterable } => {
            let (code, closure, iterable) = (Arc::clone(&template.code), template.closure.clone(), expr(iterable));
            expr_fn(move |ctx, frame| {
                let iterable = iterable(ctx, frame)?;
                run_comprehension(ctx, frame, &code, &closure, &iterable)
            })
        }
        Expr::Tuple(elems) => {
            let elems: Vec<CElem> = elems.iter().map(CElem::compile).collect();
            expr_fn(move |ctx, frame| Ok(Value::tuple(eval_elems(ctx, frame, &elems)?)))
        }
        Expr::List(elems) => {
            let elems: Vec<CElem> = elems.iter().map(CElem::compile).collect();
            expr_fn(move |ctx, frame| Ok(Value::list(eval_elems(ctx, frame, &elems)?)))
        }
        Expr::Set(elems) => {
            let elems: Vec<CElem> = elems.iter().map(CElem::compile).collect();
            expr_fn(move |ctx, frame| {
                let values = eval_elems(ctx, frame, &elems)?;
                Ok(Value::Set(Arc::new(PySet::from_values(values)?)))
            })
        }
        Expr::Dict(elems) => {
            let elems: Vec<CDictElem> = elems
                .iter()
                .map(|elem| match elem {
                    DictElem::Pair(key, value) => CDictElem::Pair(expr(key), expr(value)),
                    DictElem::Unpack(mapping) => CDictElem::Unpack(expr(mapping)),
                })
                .collect();
            expr_fn(move |ctx, frame| {
                let dict = PyDict::new();
                for elem in &elems {
                    match elem {
                        CDictElem::Pair(key, value) => {
                            let key = key(ctx, frame)?;
                            let value = value(ctx, frame)?;
                            dict.set(key, value)?;
                        }
                        CDictElem::Unpack(mapping) => {
                            let mapping = mapping(ctx, frame)?;
                            ops::arith::merge_mapping(ctx, &dict, &mapping)?;
                        }
                    }
                }
                Ok(Value::Dict(Arc::new(dict)))
            })
        }
        Expr::Named { target, value } => {
            let (target, value) = (target.clone(), expr(value));
            expr_fn(move |ctx, frame| {
                let value = value(ctx, frame)?;
                frame.store(&target, value.clone());
                Ok(value)
            })
        }
        Expr::FString(parts) => {
            let parts: Vec<CFPart> = parts.iter().map(CFPart::compile).collect();
            expr_fn(move |ctx, frame| Ok(Value::from(render(ctx, frame, &parts)?)))
        }
    }
}

/// Name loads. Fast slots are read directly; everything else, including the unbound-slot
/// error, goes through the frame.
fn load(name: Name) -> ExprFn {
    match name.target {
        NameRef::Fast(slot) => {
            let slot = slot as usize;
            expr_fn(move |ctx, frame| match frame.slots.get(slot) {
                Some(Some(value)) => Ok(value.clone()),
                _ => frame.load(ctx, &name),
            })
        }
        _ => expr_fn(move |ctx, frame| frame.load(ctx, &name)),
    }
}
