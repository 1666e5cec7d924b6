//! The statement and expression walker.
//!
//! A generator frame resumes by running its body again with `Frame::resume` set: each block
//! skips forward to the statement containing the resume index, and each compound statement
//! re-enters the branch, loop iteration, handler or `finally` the index lies in, reading
//! whatever it saved in frame temporaries instead of re-evaluating. The yield statement at
//! the index consumes the resume action and execution continues normally from there.
//!
//! The value-level helpers at the bottom are shared with the delegate compiler so both
//! backends implement each operation exactly once.

use std::sync::Arc;

use super::{ExecCtx, Flow, Frame, Pending, ResumeAction, Temp, generator, intrinsics, run_code};
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    expressions::BoolOp,
    import,
    lower::tree::{
        Arg, AugTarget, ClassNode, Collect, CompareStep, DictElem, Elem, Expr, FPart, Handler,
        Name, Stmt, StmtKind, Target,
    },
    modes::Namespace,
    ops::{
        self,
        attr::{del_attr, get_attr, set_attr},
        call::call,
        compare::{compare, truthy},
        item::{del_item, get_item, set_item},
    },
    sites::InvokeSite,
    types::{BuiltinKind, CallArgs, Cell, Function, FunctionCode, PyDict, PyList, PySet, PySlice, PyType},
    value::Value,
};

/// Runs a frame's body from the top, or from its pending resume point.
pub(crate) fn run_body(ctx: &mut ExecCtx, frame: &mut Frame) -> RunResult<Flow> {
    let code = Arc::clone(&frame.code);
    exec_block(ctx, frame, &code.body)
}

fn exec_block(ctx: &mut ExecCtx, frame: &mut Frame, block: &[Stmt]) -> RunResult<Flow> {
    let start = match frame.resume_index() {
        Some(index) => match block.iter().position(|stmt| stmt.contains_yield(index)) {
            Some(start) => start,
            None => return Err(RunError::new(ExcType::RuntimeError, "generator resume point not found")),
        },
        None => 0,
    };
    for stmt in &block[start..] {
        frame.line = stmt.line;
        if frame.resume.is_none() {
            ctx.safe_point()?;
        }
        match exec_stmt(ctx, frame, stmt) {
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

fn exec_stmt(ctx: &mut ExecCtx, frame: &mut Frame, stmt: &Stmt) -> RunResult<Flow> {
    match &stmt.kind {
        StmtKind::Expr(expr) => {
            eval(ctx, frame, expr)?;
        }
        StmtKind::Assign { targets, value } => {
            let value = eval(ctx, frame, value)?;
            for target in targets {
                assign(ctx, frame, target, value.clone())?;
            }
        }
        StmtKind::AugAssign { target, op, value, site } => match target {
            AugTarget::Name(name) => {
                let current = frame.load(ctx, name)?;
                let rhs = eval(ctx, frame, value)?;
                let result = site.run(ctx, *op, &current, &rhs)?;
                frame.store(name, result);
            }
            AugTarget::Attr {
                value: object,
                name,
                site: attr_site,
            } => {
                let object = eval(ctx, frame, object)?;
                let current = attr_site.get(ctx, &object, name)?;
                let rhs = eval(ctx, frame, value)?;
                let result = site.run(ctx, *op, &current, &rhs)?;
                set_attr(ctx, &object, name, result)?;
            }
            AugTarget::Item { value: object, index } => {
                let object = eval(ctx, frame, object)?;
                let index = eval(ctx, frame, index)?;
                let current = get_item(ctx, &object, &index)?;
                let rhs = eval(ctx, frame, value)?;
                let result = site.run(ctx, *op, &current, &rhs)?;
                set_item(ctx, &object, &index, result)?;
            }
        },
        StmtKind::Delete(targets) => {
            for target in targets {
                delete(ctx, frame, target)?;
            }
        }
        StmtKind::SetTemp(index, expr) => {
            let value = eval(ctx, frame, expr)?;
            frame.set_temp(*index, value);
        }
        StmtKind::Pass => {}
        StmtKind::Break => return Ok(Flow::Break),
        StmtKind::Continue => return Ok(Flow::Continue),
        StmtKind::Return(value) => {
            let value = match value {
                Some(expr) => eval(ctx, frame, expr)?,
                None => Value::None,
            };
            return Ok(Flow::Return(value));
        }
        StmtKind::Raise { exc, cause } => {
            let exc = exc.as_ref().map(|e| eval(ctx, frame, e)).transpose()?;
            let cause = cause.as_ref().map(|e| eval(ctx, frame, e)).transpose()?;
            return Err(raise_error(ctx, exc, cause));
        }
        StmtKind::If { test, body, orelse } => {
            if frame.resuming_into(body) {
                return exec_block(ctx, frame, body);
            }
            if frame.resuming_into(orelse) {
                return exec_block(ctx, frame, orelse);
            }
            let test = eval(ctx, frame, test)?;
            return if truthy(ctx, &test)? {
                exec_block(ctx, frame, body)
            } else {
                exec_block(ctx, frame, orelse)
            };
        }
        StmtKind::While { test, body, orelse } => return exec_while(ctx, frame, test, body, orelse),
        StmtKind::For {
            target,
            iter,
            body,
            orelse,
            iter_temp,
        } => return exec_for(ctx, frame, target, iter, body, orelse, *iter_temp),
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
            exc_temp,
            pending_temp,
        } => {
            return exec_try(
                ctx,
                frame,
                TryParts {
                    body,
                    handlers,
                    orelse,
                    finalbody,
                    exc_temp: *exc_temp,
                    pending_temp: *pending_temp,
                },
            );
        }
        StmtKind::With {
            context,
            target,
            body,
            manager_temp,
        } => return exec_with(ctx, frame, context, target.as_ref(), body, *manager_temp),
        StmtKind::Assert { test, msg } => {
            let test = eval(ctx, frame, test)?;
            if !truthy(ctx, &test)? {
                let msg = msg.as_ref().map(|m| eval(ctx, frame, m)).transpose()?;
                return Err(assertion_error(msg));
            }
        }
        StmtKind::Import {
            module,
            target,
            bind_leaf,
        } => {
            let value = import_name(ctx, frame, module, *bind_leaf)?;
            frame.store(target, value);
        }
        StmtKind::ImportFrom { module, level, names } => {
            let source = import::import_module(ctx, module, *level, current_package(frame).as_deref())?;
            for item in names {
                let value = import::import_from(ctx, &source.leaf, &item.name)?;
                frame.store(&item.target, value);
            }
        }
        StmtKind::ImportStar { module, level } => {
            let source = import::import_module(ctx, module, *level, current_package(frame).as_deref())?;
            for (name, value) in import::public_names(ctx, &source.leaf)? {
                store_dynamic(frame, &name, value);
            }
        }
        StmtKind::Def {
            template,
            decorators,
            target,
        } => {
            let decorators = eval_all(ctx, frame, decorators)?;
            let defaults = eval_all(ctx, frame, &template.defaults)?;
            let kw_defaults = template
                .kw_defaults
                .iter()
                .map(|(name, expr)| Ok((Arc::clone(name), eval(ctx, frame, expr)?)))
                .collect::<RunResult<Vec<_>>>()?;
            let function = make_function(frame, &template.code, &template.closure, defaults, kw_defaults);
            let value = apply_decorators(ctx, decorators, function)?;
            frame.store(target, value);
        }
        StmtKind::Class(node) => {
            let decorators = eval_all(ctx, frame, &node.decorators)?;
            let bases = eval_elems(ctx, frame, &node.bases)?;
            let keywords = node
                .keywords
                .iter()
                .map(|(name, expr)| Ok((Arc::clone(name), eval(ctx, frame, expr)?)))
                .collect::<RunResult<Vec<_>>>()?;
            let class = build_class(ctx, frame, ClassShape::from(&**node), bases, keywords)?;
            let value = apply_decorators(ctx, decorators, class)?;
            frame.store(&node.target, value);
        }
        StmtKind::Yield { index, value, into } => {
            if let Some(action) = frame.take_resume_at(*index) {
                return match action {
                    ResumeAction::Send(sent) => {
                        if let Some(temp) = into {
                            frame.set_temp(*temp, sent);
                        }
                        Ok(Flow::Normal)
                    }
                    ResumeAction::Throw(err) => Err(err),
                };
            }
            let value = match value {
                Some(expr) => eval(ctx, frame, expr)?,
                None => Value::None,
            };
            frame.suspended_at = *index;
            return Ok(Flow::Yield(value));
        }
        StmtKind::YieldFrom {
            index,
            value,
            iter_temp,
            into,
            is_await,
        } => {
            let step = match frame.take_resume_at(*index) {
                Some(action) => {
                    let sub = frame.temp_value(*iter_temp)?;
                    match action {
                        ResumeAction::Send(sent) => delegate_send(ctx, &sub, sent),
                        ResumeAction::Throw(err) => delegate_throw(ctx, &sub, err),
                    }
                }
                None => {
                    let source = eval(ctx, frame, value)?;
                    let sub = if *is_await {
                        awaitable(ctx, &source)?
                    } else {
                        ops::iter::iter(ctx, &source)?
                    };
                    frame.set_temp(*iter_temp, sub.clone());
                    delegate_send(ctx, &sub, Value::None)
                }
            };
            match step {
                Ok(generator::GenStep::Yielded(value)) => {
                    frame.suspended_at = *index;
                    return Ok(Flow::Yield(value));
                }
                Ok(generator::GenStep::Returned(value)) => {
                    frame.clear_temp(*iter_temp);
                    if let Some(temp) = into {
                        frame.set_temp(*temp, value);
                    }
                }
                Err(err) => {
                    frame.clear_temp(*iter_temp);
                    return Err(err);
                }
            }
        }
        StmtKind::Append { temp, value } => {
            let accumulator = frame.temp_value(*temp)?;
            match value {
                Collect::List(expr) | Collect::Set(expr) => {
                    let item = eval(ctx, frame, expr)?;
                    append_item(&accumulator, item)?;
                }
                Collect::Dict(key, value) => {
                    let key = eval(ctx, frame, key)?;
                    let value = eval(ctx, frame, value)?;
                    append_pair(&accumulator, key, value)?;
                }
            }
        }
    }
    Ok(Flow::Normal)
}

fn exec_while(ctx: &mut ExecCtx, frame: &mut Frame, test: &Expr, body: &[Stmt], orelse: &[Stmt]) -> RunResult<Flow> {
    if frame.resuming_into(orelse) {
        return exec_block(ctx, frame, orelse);
    }
    let mut resuming = frame.resuming_into(body);
    loop {
        if !resuming {
            ctx.check_interrupt()?;
            let value = eval(ctx, frame, test)?;
            if !truthy(ctx, &value)? {
                break;
            }
        }
        resuming = false;
        match exec_block(ctx, frame, body)? {
            Flow::Normal | Flow::Continue => {}
            Flow::Break => return Ok(Flow::Normal),
            flow => return Ok(flow),
        }
    }
    exec_block(ctx, frame, orelse)
}

fn exec_for(
    ctx: &mut ExecCtx,
    frame: &mut Frame,
    target: &Target,
    iter: &Expr,
    body: &[Stmt],
    orelse: &[Stmt],
    iter_temp: u32,
) -> RunResult<Flow> {
    if frame.resuming_into(orelse) {
        return exec_block(ctx, frame, orelse);
    }
    let mut resuming = frame.resuming_into(body);
    let iterator = if resuming {
        frame.temp_value(iter_temp)?
    } else {
        let iterable = eval(ctx, frame, iter)?;
        let iterator = ops::iter::iter(ctx, &iterable)?;
        frame.set_temp(iter_temp, iterator.clone());
        iterator
    };
    loop {
        if !resuming {
            ctx.check_interrupt()?;
            let Some(item) = ops::iter::next(ctx, &iterator)? else {
                break;
            };
            assign(ctx, frame, target, item)?;
        }
        resuming = false;
        match exec_block(ctx, frame, body)? {
            Flow::Normal | Flow::Continue => {}
            Flow::Break => {
                frame.clear_temp(iter_temp);
                return Ok(Flow::Normal);
            }
            flow @ Flow::Yield(_) => return Ok(flow),
            flow => {
                frame.clear_temp(iter_temp);
                return Ok(flow);
            }
        }
    }
    frame.clear_temp(iter_temp);
    exec_block(ctx, frame, orelse)
}

struct TryParts<'a> {
    body: &'a [Stmt],
    handlers: &'a [Handler],
    orelse: &'a [Stmt],
    finalbody: &'a [Stmt],
    exc_temp: u32,
    pending_temp: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TryPhase {
    Body,
    Handler(usize),
    Else,
    Finally,
}

fn exec_try(ctx: &mut ExecCtx, frame: &mut Frame, parts: TryParts<'_>) -> RunResult<Flow> {
    let phase = match frame.resume_index() {
        None => TryPhase::Body,
        Some(index) if crate::lower::tree::block_contains(parts.body, index) => TryPhase::Body,
        Some(index) => match parts
            .handlers
            .iter()
            .position(|h| crate::lower::tree::block_contains(&h.body, index))
        {
            Some(i) => TryPhase::Handler(i),
            None if crate::lower::tree::block_contains(parts.orelse, index) => TryPhase::Else,
            None => TryPhase::Finally,
        },
    };
    let outcome = match phase {
        TryPhase::Body => match exec_block(ctx, frame, parts.body) {
            Ok(Flow::Normal) => exec_block(ctx, frame, parts.orelse),
            Ok(flow) => Ok(flow),
            Err(err) => {
                frame.record_in(&err);
                catch(ctx, frame, parts.handlers, parts.exc_temp, err)
            }
        },
        TryPhase::Handler(i) => {
            let err = frame.temp_error(parts.exc_temp)?;
            run_handler(ctx, frame, &parts.handlers[i], parts.exc_temp, err)
        }
        TryPhase::Else => exec_block(ctx, frame, parts.orelse),
        TryPhase::Finally => Ok(Flow::Normal),
    };
    if matches!(outcome, Ok(Flow::Yield(_))) || parts.finalbody.is_empty() {
        return outcome;
    }
    if phase != TryPhase::Finally {
        frame.put_temp(parts.pending_temp, Temp::Pending(Pending::from_outcome(outcome)));
    }
    match exec_block(ctx, frame, parts.finalbody) {
        Ok(Flow::Yield(value)) => Ok(Flow::Yield(value)),
        Ok(Flow::Normal) => match frame.take_temp(parts.pending_temp) {
            Temp::Pending(pending) => pending.replay(),
            _ => Ok(Flow::Normal),
        },
        Ok(flow) => {
            frame.clear_temp(parts.pending_temp);
            Ok(flow)
        }
        Err(err) => {
            if let Temp::Pending(Pending::Raise(previous)) = frame.take_temp(parts.pending_temp) {
                err.attach_context(&previous.value());
            }
            Err(err)
        }
    }
}

fn catch(ctx: &mut ExecCtx, frame: &mut Frame, handlers: &[Handler], exc_temp: u32, err: RunError) -> RunResult<Flow> {
    for handler in handlers {
        let matched = match &handler.kind {
            None => true,
            Some(kind) => {
                let kind = eval(ctx, frame, kind).inspect_err(|e| e.attach_context(&err.value()))?;
                exception_matches(&err, &kind).inspect_err(|e| e.attach_context(&err.value()))?
            }
        };
        if matched {
            frame.put_temp(exc_temp, Temp::Error(err.clone()));
            if let Some(name) = &handler.name {
                frame.store(name, err.value());
            }
            return run_handler(ctx, frame, handler, exc_temp, err);
        }
    }
    Err(err)
}

fn run_handler(ctx: &mut ExecCtx, frame: &mut Frame, handler: &Handler, exc_temp: u32, err: RunError) -> RunResult<Flow> {
    ctx.push_handled(err.clone());
    let result = exec_block(ctx, frame, &handler.body);
    ctx.pop_handled();
    if matches!(result, Ok(Flow::Yield(_))) {
        return result;
    }
    frame.clear_temp(exc_temp);
    if let Some(name) = &handler.name {
        let _ = frame.delete(name);
    }
    if let Err(raised) = &result {
        raised.attach_context(&err.value());
    }
    result
}

fn exec_with(
    ctx: &mut ExecCtx,
    frame: &mut Frame,
    context: &Expr,
    target: Option<&Target>,
    body: &[Stmt],
    manager_temp: u32,
) -> RunResult<Flow> {
    let result = if frame.resuming_into(body) {
        exec_block(ctx, frame, body)
    } else {
        let manager = eval(ctx, frame, context)?;
        let (exit, entered) = with_enter(ctx, &manager)?;
        frame.set_temp(manager_temp, exit);
        match target.map(|t| assign(ctx, frame, t, entered)) {
            Some(Err(err)) => Err(err),
            _ => exec_block(ctx, frame, body),
        }
    };
    if matches!(result, Ok(Flow::Yield(_))) {
        return result;
    }
    let exit = frame.temp_value(manager_temp)?;
    frame.clear_temp(manager_temp);
    with_finish(ctx, &exit, result)
}

fn assign(ctx: &mut ExecCtx, frame: &mut Frame, target: &Target, value: Value) -> RunResult<()> {
    match target {
        Target::Name(name) => frame.store(name, value),
        Target::Attr { value: object, name } => {
            let object = eval(ctx, frame, object)?;
            set_attr(ctx, &object, name, value)?;
        }
        Target::Item { value: object, index } => {
            let object = eval(ctx, frame, object)?;
            let index = eval(ctx, frame, index)?;
            set_item(ctx, &object, &index, value)?;
        }
        Target::Unpack { items, star } => {
            let values = unpack_values(ctx, &value, items.len(), *star)?;
            for (target, value) in items.iter().zip(values) {
                assign(ctx, frame, target, value)?;
            }
        }
    }
    Ok(())
}

fn delete(ctx: &mut ExecCtx, frame: &mut Frame, target: &Target) -> RunResult<()> {
    match target {
        Target::Name(name) => frame.delete(name),
        Target::Attr { value: object, name } => {
            let object = eval(ctx, frame, object)?;
            del_attr(ctx, &object, name)
        }
        Target::Item { value: object, index } => {
            let object = eval(ctx, frame, object)?;
            let index = eval(ctx, frame, index)?;
            del_item(ctx, &object, &index)
        }
        Target::Unpack { items, .. } => {
            for item in items {
                delete(ctx, frame, item)?;
            }
            Ok(())
        }
    }
}

fn eval_all(ctx: &mut ExecCtx, frame: &mut Frame, exprs: &[Expr]) -> RunResult<Vec<Value>> {
    exprs.iter().map(|expr| eval(ctx, frame, expr)).collect()
}

fn eval_elems(ctx: &mut ExecCtx, frame: &mut Frame, elems: &[Elem]) -> RunResult<Vec<Value>> {
    let mut out = Vec::with_capacity(elems.len());
    for elem in elems {
        match elem {
            Elem::Plain(expr) => out.push(eval(ctx, frame, expr)?),
            Elem::Star(expr) => {
                let value = eval(ctx, frame, expr)?;
                out.extend(ops::iter::collect(ctx, &value)?);
            }
        }
    }
    Ok(out)
}

fn eval_args(ctx: &mut ExecCtx, frame: &mut Frame, args: &[Arg]) -> RunResult<CallArgs> {
    let mut out = CallArgs::new();
    for arg in args {
        match arg {
            Arg::Positional(expr) => out.positional.push(eval(ctx, frame, expr)?),
            Arg::Star(expr) => {
                let value = eval(ctx, frame, expr)?;
                push_star(ctx, &mut out, &value)?;
            }
            Arg::Keyword(name, expr) => {
                let value = eval(ctx, frame, expr)?;
                push_keyword(&mut out, Arc::clone(name), value)?;
            }
            Arg::DoubleStar(expr) => {
                let value = eval(ctx, frame, expr)?;
                push_double_star(ctx, &mut out, &value)?;
            }
        }
    }
    Ok(out)
}

/// Evaluates an expression.
pub(crate) fn eval(ctx: &mut ExecCtx, frame: &mut Frame, expr: &Expr) -> RunResult<Value> {
    Ok(match expr {
        Expr::Const(value) => value.clone(),
        Expr::FoldedList(items) => Value::List(Arc::new(PyList::from_shared(Arc::clone(items)))),
        Expr::FoldedSet(items) => Value::Set(Arc::new(PySet::from_shared(Arc::clone(items)))),
        Expr::FoldedDict(items) => Value::Dict(Arc::new(PyDict::from_shared(Arc::clone(items)))),
        Expr::Load(name) => frame.load(ctx, name)?,
        Expr::Temp(index) => frame.temp_value(*index)?,
        Expr::Attr { value, name, site } => {
            let object = eval(ctx, frame, value)?;
            site.get(ctx, &object, name)?
        }
        Expr::Item { value, index } => {
            let object = eval(ctx, frame, value)?;
            let index = eval(ctx, frame, index)?;
            get_item(ctx, &object, &index)?
        }
        Expr::Slice { lower, upper, step } => {
            let mut part = |e: &Option<Box<Expr>>| -> RunResult<Value> {
                e.as_ref().map_or(Ok(Value::None), |e| eval(ctx, frame, e))
            };
            let start = part(lower)?;
            let stop = part(upper)?;
            let step = part(step)?;
            Value::Slice(Arc::new(PySlice { start, stop, step }))
        }
        Expr::Call { func, args, site } => {
            let callee = eval(ctx, frame, func)?;
            let args = eval_args(ctx, frame, args)?;
            invoke(ctx, frame, site, &callee, args)?
        }
        Expr::Super {
            func,
            class_cell,
            receiver,
            site,
        } => {
            let callee = eval(ctx, frame, func)?;
            zero_arg_super(ctx, frame, &callee, *class_cell, receiver, site)?
        }
        Expr::Unary { op, operand } => {
            let operand = eval(ctx, frame, operand)?;
            ops::arith::unary(ctx, *op, &operand)?
        }
        Expr::Binary { left, op, right, site } => {
            let left = eval(ctx, frame, left)?;
            let right = eval(ctx, frame, right)?;
            site.run(ctx, *op, &left, &right)?
        }
        Expr::BoolOp { op, values } => {
            let mut result = Value::None;
            for value in values {
                result = eval(ctx, frame, value)?;
                let truth = truthy(ctx, &result)?;
                if (*op == BoolOp::And) != truth {
                    break;
                }
            }
            result
        }
        Expr::Compare { left, rest } => {
            let mut left = eval(ctx, frame, left)?;
            let mut result = Value::Bool(true);
            for step in rest {
                let right = eval(ctx, frame, &step.right)?;
                result = compare_step(ctx, step, &left, &right)?;
                if !truthy(ctx, &result)? {
                    break;
                }
                left = right;
            }
            result
        }
        Expr::IfExp { test, body, orelse } => {
            let test = eval(ctx, frame, test)?;
            if truthy(ctx, &test)? {
                eval(ctx, frame, body)?
            } else {
                eval(ctx, frame, orelse)?
            }
        }
        Expr::Function(template) => {
            let defaults = eval_all(ctx, frame, &template.defaults)?;
            let kw_defaults = template
                .kw_defaults
                .iter()
                .map(|(name, expr)| Ok((Arc::clone(name), eval(ctx, frame, expr)?)))
                .collect::<RunResult<Vec<_>>>()?;
            make_function(frame, &template.code, &template.closure, defaults, kw_defaults)
        }
        Expr::Comprehension { template, iterable } => {
            let iterable = eval(ctx, frame, iterable)?;
            run_comprehension(ctx, frame, &template.code, &template.closure, &iterable)?
        }
        Expr::Tuple(elems) => Value::tuple(eval_elems(ctx, frame, elems)?),
        Expr::List(elems) => Value::list(eval_elems(ctx, frame, elems)?),
        Expr::Set(elems) => Value::Set(Arc::new(PySet::from_values(eval_elems(ctx, frame, elems)?)?)),
        Expr::Dict(elems) => {
            let dict = PyDict::new();
            for elem in elems {
                match elem {
                    DictElem::Pair(key, value) => {
                        let key = eval(ctx, frame, key)?;
                        let value = eval(ctx, frame, value)?;
                        dict.set(key, value)?;
                    }
                    DictElem::Unpack(mapping) => {
                        let mapping = eval(ctx, frame, mapping)?;
                        ops::arith::merge_mapping(ctx, &dict, &mapping)?;
                    }
                }
            }
            Value::Dict(Arc::new(dict))
        }
        Expr::Named { target, value } => {
            let value = eval(ctx, frame, value)?;
            frame.store(target, value.clone());
            value
        }
        Expr::FString(parts) => Value::from(render_fstring(ctx, frame, parts)?),
    })
}

fn render_fstring(ctx: &mut ExecCtx, frame: &mut Frame, parts: &[FPart]) -> RunResult<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            FPart::Literal(text) => out.push_str(text),
            FPart::Field { value, conversion, spec } => {
                let value = eval(ctx, frame, value)?;
                let spec = render_fstring(ctx, frame, spec)?;
                out.push_str(&format_field(ctx, &value, *conversion, &spec)?);
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------------------
// Value-level helpers shared with the delegate compiler.
// ---------------------------------------------------------------------------------------

/// Calls through a site, intercepting builtins that need the calling frame.
pub(crate) fn invoke(ctx: &mut ExecCtx, frame: &mut Frame, site: &InvokeSite, callee: &Value, args: CallArgs) -> RunResult<Value> {
    if let Value::Builtin(builtin) = callee
        && let Some(intrinsic) = builtin.intrinsic
    {
        return intrinsics::call(ctx, frame, intrinsic, args);
    }
    site.call(ctx, callee, args)
}

pub(crate) fn compare_step(ctx: &mut ExecCtx, step: &CompareStep, left: &Value, right: &Value) -> RunResult<Value> {
    match &step.site {
        Some(site) => site.run(ctx, step.op, left, right),
        None => compare(ctx, step.op, left, right),
    }
}

/// Appends `*value` to positional arguments.
pub(crate) fn push_star(ctx: &mut ExecCtx, args: &mut CallArgs, value: &Value) -> RunResult<()> {
    let items = ops::iter::collect(ctx, value).map_err(|err| {
        if err.matches(ExcType::TypeError) && err.message().contains("is not iterable") {
            RunError::type_error(format!(
                "Value after * must be an iterable, not {}",
                value.type_name()
            ))
        } else {
            err
        }
    })?;
    args.positional.extend(items);
    Ok(())
}

pub(crate) fn push_keyword(args: &mut CallArgs, name: Arc<str>, value: Value) -> RunResult<()> {
    if args.keywords.iter().any(|(existing, _)| *existing == name) {
        return Err(RunError::type_error(format!("got multiple values for keyword argument '{name}'")));
    }
    args.keywords.push((name, value));
    Ok(())
}

/// Appends `**mapping` to keyword arguments.
pub(crate) fn push_double_star(ctx: &mut ExecCtx, args: &mut CallArgs, value: &Value) -> RunResult<()> {
    let merged = PyDict::new();
    ops::arith::merge_mapping(ctx, &merged, value).map_err(|err| {
        if err.matches(ExcType::TypeError) {
            RunError::type_error(format!(
                "argument after ** must be a mapping, not {}",
                value.type_name()
            ))
        } else {
            err
        }
    })?;
    for (key, value) in merged.items() {
        let Value::Str(name) = key else {
            return Err(RunError::type_error("keywords must be strings"));
        };
        push_keyword(args, name, value)?;
    }
    Ok(())
}

/// Creates a function object from a template and its evaluated defaults.
pub(crate) fn make_function(
    frame: &Frame,
    code: &Arc<FunctionCode>,
    closure: &[u32],
    defaults: Vec<Value>,
    kw_defaults: Vec<(Arc<str>, Value)>,
) -> Value {
    let closure: Arc<[Arc<Cell>]> = closure
        .iter()
        .map(|&index| {
            frame
                .cells
                .get(index as usize)
                .cloned()
                .unwrap_or_else(|| Arc::new(Cell::default()))
        })
        .collect();
    Value::Function(Arc::new(Function::new(
        Arc::clone(code),
        frame.globals.clone(),
        defaults,
        kw_defaults,
        closure,
    )))
}

/// Runs a comprehension: creates its function and calls it with `iter(iterable)`.
pub(crate) fn run_comprehension(
    ctx: &mut ExecCtx,
    frame: &Frame,
    code: &Arc<FunctionCode>,
    closure: &[u32],
    iterable: &Value,
) -> RunResult<Value> {
    let iterator = ops::iter::iter(ctx, iterable)?;
    let Value::Function(function) = make_function(frame, code, closure, Vec::new(), Vec::new()) else {
        return Err(RunError::new(ExcType::RuntimeError, "comprehension is not a function"));
    };
    let mut slots = vec![None; function.code.slot_count.max(1)];
    slots[0] = Some(iterator);
    super::run_function(ctx, &function, slots)
}

/// `super()` with no arguments, or whatever else the name `super` is bound to.
pub(crate) fn zero_arg_super(
    ctx: &mut ExecCtx,
    frame: &Frame,
    callee: &Value,
    class_cell: u32,
    receiver: &Name,
    site: &InvokeSite,
) -> RunResult<Value> {
    let is_builtin_super = matches!(callee, Value::Type(ty) if ty.builtin_kind() == Some(BuiltinKind::Super));
    if !is_builtin_super {
        return site.call(ctx, callee, CallArgs::new());
    }
    let class = frame
        .cells
        .get(class_cell as usize)
        .and_then(|cell| cell.get())
        .ok_or_else(|| RunError::new(ExcType::RuntimeError, "super(): __class__ cell not found"))?;
    let obj = frame
        .load(ctx, receiver)
        .map_err(|_| RunError::new(ExcType::RuntimeError, "super(): no arguments"))?;
    crate::builtins::make_super(&class, obj)
}

/// Unpacks `value` into `count` targets, one of which may be starred.
pub(crate) fn unpack_values(ctx: &mut ExecCtx, value: &Value, count: usize, star: Option<usize>) -> RunResult<Vec<Value>> {
    match star {
        None => ops::iter::unpack(ctx, value, count),
        Some(index) => ops::iter::unpack_star(ctx, value, index, count - index - 1),
    }
}

/// Adds an item to a list or set accumulator.
pub(crate) fn append_item(accumulator: &Value, item: Value) -> RunResult<()> {
    match accumulator {
        Value::List(list) => {
            list.push(item);
            Ok(())
        }
        Value::Set(set) => set.add(item),
        _ => Err(RunError::new(ExcType::RuntimeError, "bad comprehension accumulator")),
    }
}

pub(crate) fn append_pair(accumulator: &Value, key: Value, value: Value) -> RunResult<()> {
    match accumulator {
        Value::Dict(dict) => dict.set(key, value),
        _ => Err(RunError::new(ExcType::RuntimeError, "bad comprehension accumulator")),
    }
}

/// Renders one f-string field.
pub(crate) fn format_field(ctx: &mut ExecCtx, value: &Value, conversion: Option<char>, spec: &str) -> RunResult<String> {
    let converted = match conversion {
        Some('r' | 'a') => Value::from(ops::format::repr(ctx, value)?),
        Some('s') => Value::from(ops::format::str(ctx, value)?),
        _ => value.clone(),
    };
    ops::format::format_value(ctx, &converted, spec)
}

/// Builds the error a `raise` statement raises.
pub(crate) fn raise_error(ctx: &mut ExecCtx, exc: Option<Value>, cause: Option<Value>) -> RunError {
    let Some(exc) = exc else {
        return match ctx.handled() {
            Some(err) => err.clone(),
            None => RunError::new(ExcType::RuntimeError, "No active exception to reraise"),
        };
    };
    let err = match to_exception(ctx, &exc) {
        Ok(err) => err,
        Err(err) => return err,
    };
    if let Some(cause) = cause {
        let cause = if cause.is_none() {
            None
        } else {
            match to_exception(ctx, &cause) {
                Ok(cause) => Some(cause.value()),
                Err(_) => {
                    return RunError::type_error("exception causes must derive from BaseException");
                }
            }
        };
        let mut state = err.state();
        state.cause = cause;
        state.suppress_context = true;
    }
    // An explicit `raise e` records the raising frame again, at the new line.
    err.state().recorded_by = None;
    if let Some(handled) = ctx.handled() {
        err.attach_context(&handled.value());
    }
    err
}

/// Turns a raised value into an exception, instantiating classes.
pub(crate) fn to_exception(ctx: &mut ExecCtx, value: &Value) -> RunResult<RunError> {
    let instance = match value {
        Value::Type(ty) if ty.exc_base.is_some() => call(ctx, value, CallArgs::new())?,
        Value::Type(_) => return Err(RunError::type_error("exceptions must derive from BaseException")),
        other => other.clone(),
    };
    RunError::from_value(&instance).ok_or_else(|| RunError::type_error("exceptions must derive from BaseException"))
}

/// Whether `err` matches an `except` clause's class or tuple of classes.
pub(crate) fn exception_matches(err: &RunError, kind: &Value) -> RunResult<bool> {
    match kind {
        Value::Type(ty) if ty.exc_base.is_some() => Ok(err.instance().class.is_subclass(ty)),
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if exception_matches(err, kind)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(RunError::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

pub(crate) fn assertion_error(msg: Option<Value>) -> RunError {
    match msg {
        Some(msg) => RunError::with_args(ExcType::AssertionError, vec![msg]),
        None => RunError::bare(ExcType::AssertionError),
    }
}

/// `with` entry: returns the bound `__exit__` and the value of `__enter__()`.
pub(crate) fn with_enter(ctx: &mut ExecCtx, manager: &Value) -> RunResult<(Value, Value)> {
    let no_protocol = || {
        RunError::type_error(format!(
            "'{}' object does not support the context manager protocol",
            manager.type_name()
        ))
    };
    let enter = ops::attr::get_attr_opt(ctx, manager, "__enter__")?.ok_or_else(no_protocol)?;
    let exit = ops::attr::get_attr_opt(ctx, manager, "__exit__")?.ok_or_else(no_protocol)?;
    let entered = call(ctx, &enter, CallArgs::new())?;
    Ok((exit, entered))
}

/// `with` exit: calls `__exit__` and decides whether an error is suppressed.
pub(crate) fn with_finish(ctx: &mut ExecCtx, exit: &Value, result: RunResult<Flow>) -> RunResult<Flow> {
    match result {
        Ok(flow) => {
            call(ctx, exit, CallArgs::positional([Value::None, Value::None, Value::None]))?;
            Ok(flow)
        }
        Err(err) => {
            let exc = err.value();
            let args = CallArgs::positional([Value::Type(Arc::clone(&err.instance().class)), exc.clone(), Value::None]);
            ctx.push_handled(err.clone());
            let suppress = call(ctx, exit, args).and_then(|result| truthy(ctx, &result));
            ctx.pop_handled();
            match suppress {
                Ok(true) => Ok(Flow::Normal),
                Ok(false) => Err(err),
                Err(raised) => {
                    raised.attach_context(&exc);
                    Err(raised)
                }
            }
        }
    }
}

pub(crate) fn apply_decorators(ctx: &mut ExecCtx, decorators: Vec<Value>, mut value: Value) -> RunResult<Value> {
    for decorator in decorators.into_iter().rev() {
        value = call(ctx, &decorator, CallArgs::positional([value]))?;
    }
    Ok(value)
}

/// The parts of a `class` statement that survive evaluation of its bases and keywords.
pub(crate) struct ClassShape<'a> {
    pub(crate) name: &'a Arc<str>,
    pub(crate) qualname: &'a Arc<str>,
    pub(crate) body: &'a Arc<FunctionCode>,
    pub(crate) closure: &'a [u32],
    pub(crate) class_cell: Option<u32>,
}

impl<'a> From<&'a ClassNode> for ClassShape<'a> {
    fn from(node: &'a ClassNode) -> Self {
        Self {
            name: &node.name,
            qualname: &node.qualname,
            body: &node.body,
            closure: &node.closure,
            class_cell: node.class_cell,
        }
    }
}

/// Runs a class body and creates the class.
pub(crate) fn build_class(
    ctx: &mut ExecCtx,
    frame: &Frame,
    node: ClassShape<'_>,
    bases: Vec<Value>,
    keywords: Vec<(Arc<str>, Value)>,
) -> RunResult<Value> {
    for (name, value) in &keywords {
        let is_type = matches!(value, Value::Type(ty) if ty.builtin_kind() == Some(BuiltinKind::Type));
        if &**name != "metaclass" || !is_type {
            return Err(RunError::type_error(format!(
                "{}.__init_subclass__() takes no keyword argument '{name}'",
                node.name
            )));
        }
    }
    let bases = bases
        .into_iter()
        .map(|base| match base {
            Value::Type(ty) => Ok(ty),
            other => Err(RunError::type_error(format!(
                "bases must be types, not '{}'",
                other.type_name()
            ))),
        })
        .collect::<RunResult<Vec<Arc<PyType>>>>()?;
    let module = frame
        .globals
        .module_name()
        .unwrap_or_else(|| Arc::from("builtins"));
    let namespace = Arc::new(PyDict::new());
    namespace.set_str("__module__", Value::Str(Arc::clone(&module)));
    namespace.set_str("__qualname__", Value::Str(Arc::clone(node.qualname)));
    if let Some(doc) = &node.body.doc {
        namespace.set_str("__doc__", doc.clone());
    }
    let closure = node
        .closure
        .iter()
        .map(|&index| frame.cells.get(index as usize).cloned().unwrap_or_default())
        .collect();
    let mut body = Frame::for_class(
        Arc::clone(node.body),
        frame.globals.clone(),
        Namespace::Dict(Arc::clone(&namespace)),
        closure,
    );
    run_code(ctx, &mut body)?;
    let mut attrs = indexmap::IndexMap::new();
    for (key, value) in namespace.items() {
        if let Value::Str(name) = key {
            attrs.insert(name, value);
        }
    }
    let class = PyType::new_class(Arc::clone(node.name), Arc::clone(node.qualname), module, bases, attrs)?;
    if let Some(cell) = node.class_cell.and_then(|index| body.cells.get(index as usize)) {
        cell.set(Value::Type(Arc::clone(&class)));
    }
    Ok(Value::Type(class))
}

/// `import a.b.c`: binds the top-level package unless `bind_leaf`.
pub(crate) fn import_name(ctx: &mut ExecCtx, frame: &Frame, module: &str, bind_leaf: bool) -> RunResult<Value> {
    let imported = import::import_module(ctx, module, 0, current_package(frame).as_deref())?;
    Ok(Value::Module(if bind_leaf { imported.leaf } else { imported.top }))
}

/// The package relative imports in this frame resolve against.
pub(crate) fn current_package(frame: &Frame) -> Option<Arc<str>> {
    let namespace = frame.globals.namespace();
    if let Some(Value::Str(package)) = namespace.get("__package__") {
        return Some(package);
    }
    match namespace.get("__name__") {
        Some(Value::Str(name)) => Some(match name.rfind('.') {
            Some(dot) => Arc::from(&name[..dot]),
            None => Arc::from(""),
        }),
        _ => None,
    }
}

/// Binds a name chosen at run time (`from m import *`) in the frame's namespace.
pub(crate) fn store_dynamic(frame: &Frame, name: &str, value: Value) {
    match &frame.locals {
        Some(locals) => locals.set(name, value),
        None => frame.globals.namespace().set(name, value),
    }
}

/// Sends into a `yield from` / `await` sub-iterator.
pub(crate) fn delegate_send(ctx: &mut ExecCtx, sub: &Value, sent: Value) -> RunResult<generator::GenStep> {
    if let Value::Generator(generator) = sub {
        return generator::resume(ctx, generator, ResumeAction::Send(sent));
    }
    if sent.is_none() {
        return Ok(match ops::iter::next(ctx, sub) {
            Ok(Some(value)) => generator::GenStep::Yielded(value),
            Ok(None) => generator::GenStep::Returned(Value::None),
            Err(err) => return Err(err),
        });
    }
    let send = get_attr(ctx, sub, "send")?;
    match call(ctx, &send, CallArgs::positional([sent])) {
        Ok(value) => Ok(generator::GenStep::Yielded(value)),
        Err(err) if err.matches(ExcType::StopIteration) => Ok(generator::GenStep::Returned(stop_value(&err))),
        Err(err) => Err(err),
    }
}

/// Throws into a `yield from` / `await` sub-iterator.
pub(crate) fn delegate_throw(ctx: &mut ExecCtx, sub: &Value, err: RunError) -> RunResult<generator::GenStep> {
    if err.matches(ExcType::GeneratorExit) {
        if let Value::Generator(generator) = sub {
            generator::close(ctx, generator)?;
        } else if let Some(close) = ops::attr::get_attr_opt(ctx, sub, "close")? {
            call(ctx, &close, CallArgs::new())?;
        }
        return Err(err);
    }
    if let Value::Generator(generator) = sub {
        return generator::resume(ctx, generator, ResumeAction::Throw(err));
    }
    let Some(throw) = ops::attr::get_attr_opt(ctx, sub, "throw")? else {
        return Err(err);
    };
    match call(ctx, &throw, CallArgs::positional([err.value()])) {
        Ok(value) => Ok(generator::GenStep::Yielded(value)),
        Err(raised) if raised.matches(ExcType::StopIteration) => Ok(generator::GenStep::Returned(stop_value(&raised))),
        Err(raised) => Err(raised),
    }
}

/// The value a `StopIteration` carries.
pub(crate) fn stop_value(err: &RunError) -> Value {
    err.state().args.first().cloned().unwrap_or(Value::None)
}

/// The iterator an `await` expression drives.
pub(crate) fn awaitable(ctx: &mut ExecCtx, value: &Value) -> RunResult<Value> {
    match value {
        Value::Generator(_) => Ok(value.clone()),
        Value::Instance(_) => match ops::call::call_special(ctx, value, "__await__", CallArgs::new())? {
            Some(iterator) => ops::iter::iter(ctx, &iterator),
            None => Err(not_awaitable(value)),
        },
        other => Err(not_awaitable(other)),
    }
}

fn not_awaitable(value: &Value) -> RunError {
    RunError::type_error(format!(
        "object {} can't be used in 'await' expression",
        value.type_name()
    ))
}
