//! Dynamic operation sites and their inline caches.
//!
//! Every syntactic dynamic operation in the lowered tree (`obj.attr`, `a + b`, `a < b`,
//! `f(x)`, `x += y`) owns one [`CallSite`], created by the lowering pass and shared by every
//! execution of that code, on every thread, by both the tree interpreter and the compiled
//! delegate.
//!
//! A site holds an immutable rule list behind an [`ArcSwap`]. Readers load the current
//! snapshot without locking; a miss binds a new rule and publishes a *new* list with
//! `rcu`, so a concurrent reader sees either the old list or the new one. Rules are tried
//! most recently bound first. Once a further rule would exceed the configured limit the
//! list is replaced by the megamorphic marker and every later execution takes the generic
//! path.
//!
//! Guards test exact classes plus the class version recorded when the rule was bound (see
//! `types::type`). Mutating a class gives it a fresh version, so stale rules simply stop
//! matching; nothing walks the sites.

mod rules;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;

pub use rules::{AttrSite, BinarySite, ClassGuard, CompareSite, InplaceSite, InvokeSite};

use crate::{
    expressions::{CmpOp, Operator},
    interp::ExecCtx,
    tracer::SiteEvent,
};

/// What a site does, for tracing and introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteOp {
    GetAttr(Arc<str>),
    Binary(Operator),
    Inplace(Operator),
    Compare(CmpOp),
    Invoke,
}

impl fmt::Display for SiteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetAttr(name) => write!(f, "getattr .{name}"),
            Self::Binary(op) => write!(f, "binary {op}"),
            Self::Inplace(op) => write!(f, "inplace {op}="),
            Self::Compare(op) => write!(f, "compare {op}"),
            Self::Invoke => f.write_str("invoke"),
        }
    }
}

/// Cache state classification of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    Empty,
    Monomorphic,
    Polymorphic(usize),
    Megamorphic,
}

/// Counters for one site. Updated with relaxed atomics; they are statistics, not state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteStats {
    pub hits: u64,
    pub misses: u64,
    pub binds: u64,
    /// Executions that took the generic path after the site went megamorphic.
    pub generic: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    binds: AtomicU64,
    generic: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A bound (guard, plan) pair.
#[derive(Debug)]
pub struct Rule<G, P> {
    pub guard: G,
    pub plan: P,
}

enum RuleSet<G, P> {
    Bound(Vec<Arc<Rule<G, P>>>),
    Megamorphic,
}

/// Result of probing a site for a matching rule.
pub enum Probe<G, P> {
    Hit(Arc<Rule<G, P>>),
    /// No rule matched; the caller binds one and calls [`CallSite::install`].
    Miss,
    /// Caching is off for this site, or it has gone megamorphic: take the generic path.
    Generic,
}

/// The rewritable rule list of one operation site.
pub struct CallSite<G, P> {
    op: SiteOp,
    line: u32,
    enabled: bool,
    rules: ArcSwap<RuleSet<G, P>>,
    counters: Counters,
}

impl<G, P> CallSite<G, P> {
    #[must_use]
    pub fn new(op: SiteOp, line: u32, enabled: bool) -> Self {
        Self {
            op,
            line,
            enabled,
            rules: ArcSwap::from_pointee(RuleSet::Bound(Vec::new())),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn op(&self) -> &SiteOp {
        &self.op
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Finds the first rule whose guard accepts the operands.
    pub fn probe(&self, matches: impl Fn(&G) -> bool) -> Probe<G, P> {
        if !self.enabled {
            return Probe::Generic;
        }
        let rules = self.rules.load();
        match &**rules {
            RuleSet::Bound(list) => {
                if let Some(rule) = list.iter().find(|rule| matches(&rule.guard)) {
                    Counters::bump(&self.counters.hits);
                    return Probe::Hit(Arc::clone(rule));
                }
                Counters::bump(&self.counters.misses);
                Probe::Miss
            }
            RuleSet::Megamorphic => {
                Counters::bump(&self.counters.generic);
                Probe::Generic
            }
        }
    }

    /// Publishes a new rule at the front of the list, or turns the site megamorphic when the
    /// list is already at `ctx`'s polymorphic limit.
    pub fn install(&self, ctx: &ExecCtx, rule: Rule<G, P>) {
        let limit = ctx.config().polymorphic_limit.max(1);
        let rule = Arc::new(rule);
        let previous = self.rules.rcu(|current| match &**current {
            RuleSet::Megamorphic => Arc::clone(current),
            RuleSet::Bound(list) if list.len() >= limit => Arc::new(RuleSet::Megamorphic),
            RuleSet::Bound(list) => {
                let mut next = Vec::with_capacity(list.len() + 1);
                next.push(Arc::clone(&rule));
                next.extend(list.iter().cloned());
                Arc::new(RuleSet::Bound(next))
            }
        });
        Counters::bump(&self.counters.binds);
        let tracer = ctx.tracer();
        match &*previous {
            RuleSet::Megamorphic => {}
            RuleSet::Bound(list) if list.len() >= limit => {
                tracer.on_site(&self.op, self.line, SiteEvent::Megamorphic);
            }
            RuleSet::Bound(list) => {
                if !list.is_empty() {
                    tracer.on_site(&self.op, self.line, SiteEvent::Miss);
                }
                tracer.on_site(&self.op, self.line, SiteEvent::Bind { rules: list.len() + 1 });
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> SiteState {
        match &**self.rules.load() {
            RuleSet::Megamorphic => SiteState::Megamorphic,
            RuleSet::Bound(list) => match list.len() {
                0 => SiteState::Empty,
                1 => SiteState::Monomorphic,
                n => SiteState::Polymorphic(n),
            },
        }
    }

    #[must_use]
    pub fn stats(&self) -> SiteStats {
        SiteStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            binds: self.counters.binds.load(Ordering::Relaxed),
            generic: self.counters.generic.load(Ordering::Relaxed),
        }
    }
}

impl<G, P> fmt::Debug for CallSite<G, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSite")
            .field("op", &self.op)
            .field("line", &self.line)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A type-erased read-only view of a site, for introspecting a compiled unit.
pub trait SiteView: Send + Sync + fmt::Debug {
    fn op(&self) -> &SiteOp;
    fn line(&self) -> u32;
    fn state(&self) -> SiteState;
    fn stats(&self) -> SiteStats;
}

impl<G: Send + Sync, P: Send + Sync> SiteView for CallSite<G, P> {
    fn op(&self) -> &SiteOp {
        Self::op(self)
    }

    fn line(&self) -> u32 {
        Self::line(self)
    }

    fn state(&self) -> SiteState {
        Self::state(self)
    }

    fn stats(&self) -> SiteStats {
        Self::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::HostConfig, interp::ExecCtx, tracer::RecordingTracer};

    fn ctx_with_limit(limit: usize, tracer: Arc<RecordingTracer>) -> ExecCtx {
        let config = HostConfig::builder().polymorphic_limit(limit).build();
        ExecCtx::for_tests(config, tracer)
    }

    fn site() -> CallSite<u32, &'static str> {
        CallSite::new(SiteOp::Binary(Operator::Add), 1, true)
    }

    #[test]
    fn rules_are_tried_most_recent_first() {
        let ctx = ctx_with_limit(4, Arc::new(RecordingTracer::new()));
        let site = site();
        assert_eq!(site.state(), SiteState::Empty);
        site.install(&ctx, Rule { guard: 1, plan: "old" });
        site.install(&ctx, Rule { guard: 1, plan: "new" });
        let Probe::Hit(rule) = site.probe(|g| *g == 1) else {
            panic!("expected a hit");
        };
        assert_eq!(rule.plan, "new");
        assert_eq!(site.state(), SiteState::Polymorphic(2));
    }

    #[test]
    fn exceeding_the_limit_goes_megamorphic() {
        let tracer = Arc::new(RecordingTracer::new());
        let ctx = ctx_with_limit(2, Arc::clone(&tracer));
        let site = site();
        for guard in 0..3 {
            assert!(matches!(site.probe(|g| *g == guard), Probe::Miss));
            site.install(&ctx, Rule { guard, plan: "p" });
        }
        assert_eq!(site.state(), SiteState::Megamorphic);
        assert!(matches!(site.probe(|_| true), Probe::Generic));
        let events: Vec<SiteEvent> = tracer.site_events().into_iter().map(|(_, e)| e).collect();
        assert_eq!(
            events,
            vec![
                SiteEvent::Bind { rules: 1 },
                SiteEvent::Miss,
                SiteEvent::Bind { rules: 2 },
                SiteEvent::Megamorphic,
            ]
        );
        let stats = site.stats();
        assert_eq!((stats.misses, stats.binds, stats.generic), (3, 3, 1));
    }

    #[test]
    fn disabled_sites_never_cache() {
        let ctx = ctx_with_limit(4, Arc::new(RecordingTracer::new()));
        let site: CallSite<u32, ()> = CallSite::new(SiteOp::Invoke, 1, false);
        assert!(matches!(site.probe(|_| true), Probe::Generic));
        site.install(&ctx, Rule { guard: 0, plan: () });
        assert!(matches!(site.probe(|_| true), Probe::Generic));
    }

    #[test]
    fn concurrent_installs_never_tear() {
        let ctx = ctx_with_limit(64, Arc::new(RecordingTracer::new()));
        let site = Arc::new(site());
        std::thread::scope(|scope| {
            for t in 0..4u32 {
                let site = Arc::clone(&site);
                let ctx = ctx.fork();
                scope.spawn(move || {
                    for i in 0..8 {
                        site.install(&ctx, Rule { guard: t * 100 + i, plan: "p" });
                        let _ = site.probe(|g| *g == t * 100);
                    }
                });
            }
        });
        assert_eq!(site.state(), SiteState::Polymorphic(32));
    }
}
