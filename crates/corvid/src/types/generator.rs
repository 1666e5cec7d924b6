use std::{cell::RefCell, fmt, mem, sync::Arc};

use parking_lot::Mutex;

use crate::{interp::Frame, types::FunctionCode};

/// Execution state of a generator or coroutine.
///
/// The frame is moved out while the body runs so a re-entrant resume can be detected
/// without holding the lock across user code.
pub enum GenState {
    /// Created but never started; only `None` may be sent.
    Created(Box<Frame>),
    Suspended(Box<Frame>),
    Running,
    Finished,
}

thread_local! {
    /// Suspended generators dropped on this thread, waiting to be closed at the next
    /// statement boundary.
    static ORPHANS: RefCell<Vec<Arc<Generator>>> = const { RefCell::new(Vec::new()) };
}

/// A generator (or coroutine) object. Each call of a generator function gets its own frame,
/// so two live instances never observe each other's locals.
pub struct Generator {
    pub code: Arc<FunctionCode>,
    pub is_coroutine: bool,
    pub(crate) state: Mutex<GenState>,
}

impl Generator {
    #[must_use]
    pub fn new(code: Arc<FunctionCode>, frame: Frame) -> Self {
        let is_coroutine = code.is_coroutine();
        Self {
            code,
            is_coroutine,
            state: Mutex::new(GenState::Created(Box::new(frame))),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), GenState::Running)
    }

    /// Whether a suspended generator was dropped on this thread and still needs closing.
    pub(crate) fn has_orphans() -> bool {
        ORPHANS.try_with(|orphans| !orphans.borrow().is_empty()).unwrap_or(false)
    }

    pub(crate) fn take_orphans() -> Vec<Arc<Self>> {
        ORPHANS
            .try_with(|orphans| mem::take(&mut *orphans.borrow_mut()))
            .unwrap_or_default()
    }
}

/// A generator dropped while suspended still owes its `finally` blocks a run. Its frame moves
/// to a fresh generator queued for `close()`; the interpreter has the context to run it.
impl Drop for Generator {
    fn drop(&mut self) {
        let GenState::Suspended(frame) = mem::replace(self.state.get_mut(), GenState::Finished) else {
            return;
        };
        let mut orphan = Some(Arc::new(Self {
            code: Arc::clone(&self.code),
            is_coroutine: self.is_coroutine,
            state: Mutex::new(GenState::Suspended(frame)),
        }));
        let _ = ORPHANS.try_with(|orphans| orphans.borrow_mut().extend(orphan.take()));
        // Thread teardown: the frame is discarded without running.
        if let Some(orphan) = orphan {
            *orphan.state.lock() = GenState::Finished;
        }
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_coroutine { "coroutine" } else { "generator" };
        write!(f, "<{kind} object {}>", self.code.qualname)
    }
}
