//! Driving generator and coroutine frames.
//!
//! A suspended generator owns its frame. Resuming moves the frame out of the generator,
//! sets [`Frame::resume`] to the yield it stopped at plus the value or exception being
//! delivered, and re-runs the body walker, which skips straight back to that point.

use std::sync::Arc;

use super::{ExecCtx, Flow, Resume, ResumeAction, exec};
use crate::{
    exception_private::{ExcType, RunError, RunResult},
    tracer::GeneratorEvent,
    types::{GenState, Generator},
    value::Value,
};

/// What one resumption produced.
#[derive(Debug)]
pub enum GenStep {
    Yielded(Value),
    /// The body finished; a `return x` carries `x`.
    Returned(Value),
}

pub(crate) fn resume(ctx: &mut ExecCtx, generator: &Arc<Generator>, action: ResumeAction) -> RunResult<GenStep> {
    let mut frame = {
        let mut state = generator.state.lock();
        match std::mem::replace(&mut *state, GenState::Running) {
            GenState::Created(frame) => match action {
                ResumeAction::Send(value) if !value.is_none() => {
                    *state = GenState::Created(frame);
                    return Err(RunError::type_error(format!(
                        "can't send non-None value to a just-started {}",
                        kind(generator)
                    )));
                }
                ResumeAction::Send(_) => frame,
                ResumeAction::Throw(err) => {
                    *state = GenState::Finished;
                    return Err(err);
                }
            },
            GenState::Suspended(mut frame) => {
                frame.resume = Some(Resume {
                    index: frame.suspended_at,
                    action,
                });
                frame
            }
            GenState::Running => {
                return Err(RunError::value_error(format!("{} already executing", kind(generator))));
            }
            GenState::Finished => {
                *state = GenState::Finished;
                return match action {
                    ResumeAction::Send(_) => Ok(GenStep::Returned(Value::None)),
                    ResumeAction::Throw(err) => Err(err),
                };
            }
        }
    };

    let name = Arc::clone(&generator.code.qualname);
    ctx.tracer().on_generator(&name, GeneratorEvent::Resume);
    let outcome = match ctx.enter(&name) {
        Ok(()) => {
            let outcome = super::with_stack(|| exec::run_body(ctx, &mut frame));
            ctx.leave();
            outcome
        }
        Err(err) => Err(err),
    };

    match outcome {
        Ok(Flow::Yield(value)) => {
            ctx.tracer().on_generator(&name, GeneratorEvent::Suspend);
            *generator.state.lock() = GenState::Suspended(frame);
            Ok(GenStep::Yielded(value))
        }
        Ok(flow) => {
            *generator.state.lock() = GenState::Finished;
            ctx.tracer().on_generator(&name, GeneratorEvent::Finish);
            Ok(GenStep::Returned(match flow {
                Flow::Return(value) => value,
                _ => Value::None,
            }))
        }
        Err(err) => {
            *generator.state.lock() = GenState::Finished;
            ctx.tracer().on_generator(&name, GeneratorEvent::Finish);
            let err = if err.matches(ExcType::StopIteration) {
                let converted = RunError::new(
                    ExcType::RuntimeError,
                    format!("{} raised StopIteration", kind(generator)),
                );
                let mut state = converted.state();
                state.cause = Some(err.value());
                state.context = Some(err.value());
                drop(state);
                converted
            } else {
                err
            };
            ctx.note_raise(&err, frame.line);
            frame.record_in(&err);
            Err(err)
        }
    }
}

/// Advances the generator; `None` once it is exhausted.
pub fn next(ctx: &mut ExecCtx, generator: &Arc<Generator>) -> RunResult<Option<Value>> {
    match resume(ctx, generator, ResumeAction::Send(Value::None))? {
        GenStep::Yielded(value) => Ok(Some(value)),
        GenStep::Returned(_) => Ok(None),
    }
}

/// `generator.send(value)`: exhaustion raises `StopIteration` carrying the return value.
pub fn send(ctx: &mut ExecCtx, generator: &Arc<Generator>, value: Value) -> RunResult<Value> {
    match resume(ctx, generator, ResumeAction::Send(value))? {
        GenStep::Yielded(value) => Ok(value),
        GenStep::Returned(value) => Err(RunError::stop_iteration(value)),
    }
}

/// `generator.throw(exc)`: raises `exc` at the suspension point.
pub fn throw(ctx: &mut ExecCtx, generator: &Arc<Generator>, err: RunError) -> RunResult<Value> {
    match resume(ctx, generator, ResumeAction::Throw(err))? {
        GenStep::Yielded(value) => Ok(value),
        GenStep::Returned(value) => Err(RunError::stop_iteration(value)),
    }
}

/// `generator.close()`: raises `GeneratorExit` inside the frame so its `finally` blocks run.
pub fn close(ctx: &mut ExecCtx, generator: &Arc<Generator>) -> RunResult<()> {
    {
        let mut state = generator.state.lock();
        match &*state {
            GenState::Created(_) => {
                *state = GenState::Finished;
                return Ok(());
            }
            GenState::Finished => return Ok(()),
            GenState::Suspended(_) | GenState::Running => {}
        }
    }
    match resume(ctx, generator, ResumeAction::Throw(RunError::bare(ExcType::GeneratorExit))) {
        Ok(GenStep::Yielded(_)) => Err(RunError::new(
            ExcType::RuntimeError,
            format!("{} ignored GeneratorExit", kind(generator)),
        )),
        Ok(GenStep::Returned(_)) => Ok(()),
        Err(err) if err.matches(ExcType::GeneratorExit) || err.matches(ExcType::StopIteration) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Closes every generator dropped while suspended since the last call.
///
/// Errors escaping a finalizing `close()` have nowhere to propagate; the tracer has already
/// seen them through `on_raise`.
pub(crate) fn reap_orphans(ctx: &mut ExecCtx) {
    loop {
        let orphans = Generator::take_orphans();
        if orphans.is_empty() {
            return;
        }
        for generator in orphans {
            if let Err(err) = close(ctx, &generator) {
                ctx.note_raise(&err, 0);
            }
        }
    }
}

fn kind(generator: &Generator) -> &'static str {
    if generator.is_coroutine { "coroutine" } else { "generator" }
}
