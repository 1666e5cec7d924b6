//! Runtime tracing hooks.
//!
//! The [`RuntimeTracer`] trait defines hook points at the events that explain what the
//! dispatch runtime is doing: function calls and returns, call-site cache transitions,
//! tier-up compilation, generator suspension and raised exceptions. Every hook has a no-op
//! default so a tracer only overrides what it cares about.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Does nothing (default) |
//! | [`StderrTracer`] | Human-readable event log on stderr (`corvid -d`) |
//! | [`RecordingTracer`] | Keeps every event for inspection by tests and tools |
//!
//! One tracer is shared by every session of a runtime, possibly on several threads, so hooks
//! take `&self` and implementations use interior mutability where they keep state.

use std::fmt;

use parking_lot::Mutex;

use crate::sites::SiteOp;

/// A call-site cache transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteEvent {
    /// A new rule was bound; `rules` is the rule count afterwards.
    Bind { rules: usize },
    /// No rule matched and the site will rebind.
    Miss,
    /// The rule list was discarded for the generic fallback.
    Megamorphic,
}

impl fmt::Display for SiteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { rules } => write!(f, "bind ({rules} rules)"),
            Self::Miss => f.write_str("miss"),
            Self::Megamorphic => f.write_str("megamorphic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorEvent {
    Suspend,
    Resume,
    Finish,
}

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Call { name: String, depth: usize },
    Return { depth: usize },
    Site { op: String, line: u32, event: SiteEvent },
    TierUp { name: String, calls: u32 },
    Generator { name: String, event: GeneratorEvent },
    Raise { type_name: String, line: u32 },
}

/// Hook points for observing execution.
pub trait RuntimeTracer: fmt::Debug + Send + Sync {
    /// A frame was entered. `depth` counts frames after the push.
    fn on_call(&self, _name: &str, _depth: usize) {}

    /// A frame was left. `depth` counts frames after the pop.
    fn on_return(&self, _depth: usize) {}

    /// A call site changed state.
    fn on_site(&self, _op: &SiteOp, _line: u32, _event: SiteEvent) {}

    /// A code object was compiled to a delegate after `calls` entries.
    fn on_tier_up(&self, _name: &str, _calls: u32) {}

    fn on_generator(&self, _name: &str, _event: GeneratorEvent) {}

    /// An exception was raised by a `raise` statement or a failing operation.
    fn on_raise(&self, _type_name: &str, _line: u32) {}
}

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl RuntimeTracer for NoopTracer {}

/// Prints a human-readable event log to stderr.
///
/// ```text
///   >>> CALL fib                 depth=2
///   ... SITE binary + line 3     bind (1 rules)
///   +++ TIER UP fib after 32 calls
///   <<< RETURN                   depth=1
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Stop after this many lines. `None` is unlimited.
    limit: Option<usize>,
    count: Mutex<usize>,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that goes quiet after `limit` lines.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: Mutex::new(0),
        }
    }

    fn emit(&self, line: fmt::Arguments<'_>) {
        let mut count = self.count.lock();
        if let Some(limit) = self.limit {
            if *count > limit {
                return;
            }
            if *count == limit {
                eprintln!("--- trace limit reached ({limit} events) ---");
                *count += 1;
                return;
            }
        }
        *count += 1;
        eprintln!("{line}");
    }
}

impl RuntimeTracer for StderrTracer {
    fn on_call(&self, name: &str, depth: usize) {
        self.emit(format_args!("  >>> CALL {name:<20} depth={depth}"));
    }

    fn on_return(&self, depth: usize) {
        self.emit(format_args!("  <<< RETURN                   depth={depth}"));
    }

    fn on_site(&self, op: &SiteOp, line: u32, event: SiteEvent) {
        let site = format!("{op} line {line}");
        self.emit(format_args!("  ... SITE {site:<20} {event}"));
    }

    fn on_tier_up(&self, name: &str, calls: u32) {
        self.emit(format_args!("  +++ TIER UP {name} after {calls} calls"));
    }

    fn on_generator(&self, name: &str, event: GeneratorEvent) {
        self.emit(format_args!("  ~~~ {event:?} {name}"));
    }

    fn on_raise(&self, type_name: &str, line: u32) {
        self.emit(format_args!("  !!! RAISE {type_name} line {line}"));
    }
}

/// Records every event in order.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Site events only, as `(op, event)` pairs.
    #[must_use]
    pub fn site_events(&self) -> Vec<(String, SiteEvent)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Site { op, event, .. } => Some((op.clone(), *event)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl RuntimeTracer for RecordingTracer {
    fn on_call(&self, name: &str, depth: usize) {
        self.push(TraceEvent::Call {
            name: name.to_owned(),
            depth,
        });
    }

    fn on_return(&self, depth: usize) {
        self.push(TraceEvent::Return { depth });
    }

    fn on_site(&self, op: &SiteOp, line: u32, event: SiteEvent) {
        self.push(TraceEvent::Site {
            op: op.to_string(),
            line,
            event,
        });
    }

    fn on_tier_up(&self, name: &str, calls: u32) {
        self.push(TraceEvent::TierUp {
            name: name.to_owned(),
            calls,
        });
    }

    fn on_generator(&self, name: &str, event: GeneratorEvent) {
        self.push(TraceEvent::Generator {
            name: name.to_owned(),
            event,
        });
    }

    fn on_raise(&self, type_name: &str, line: u32) {
        self.push(TraceEvent::Raise {
            type_name: type_name.to_owned(),
            line,
        });
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::expressions::Operator;

    #[test]
    fn recording_tracer_keeps_order() {
        let tracer = RecordingTracer::new();
        tracer.on_call("f", 1);
        tracer.on_site(&SiteOp::Binary(Operator::Add), 3, SiteEvent::Bind { rules: 1 });
        tracer.on_return(0);
        assert_eq!(tracer.events().len(), 3);
        assert_eq!(
            tracer.site_events(),
            vec![("binary +".to_owned(), SiteEvent::Bind { rules: 1 })]
        );
        tracer.clear();
        assert!(tracer.events().is_empty());
    }

    #[test]
    fn site_events_render() {
        assert_eq!(SiteEvent::Bind { rules: 2 }.to_string(), "bind (2 rules)");
        assert_eq!(SiteEvent::Megamorphic.to_string(), "megamorphic");
    }
}
