use std::sync::Arc;

use corvid::{
    CollectStringPrint, CompileOptions, CompiledUnit, HostConfig, RecordingTracer, Runtime, SiteEvent, SiteState,
    SiteView, SourceUnit, TieringPolicy, TraceEvent,
};
use pretty_assertions::assert_eq;

/// Defines `N` classes with an `x` attribute and reads it through one site.
fn classes_source(count: usize, rounds: usize) -> String {
    let mut source = String::from("def read(o):\n    return o.x\n\nobjs = []\n");
    for i in 0..count {
        source.push_str(&format!("class C{i}:\n    x = {i}\nobjs.append(C{i}())\n"));
    }
    source.push_str(&format!("total = 0\nfor _ in range({rounds}):\n    for o in objs:\n        total += read(o)\nprint(total)\n"));
    source
}

fn site<'a>(unit: &'a CompiledUnit, op: &str) -> &'a Arc<dyn SiteView> {
    unit.sites()
        .iter()
        .find(|site| site.op().to_string() == op)
        .unwrap_or_else(|| panic!("no {op} site"))
}

fn run_with(config: HostConfig, options: &CompileOptions, source: &str) -> (CompiledUnit, String, Arc<RecordingTracer>) {
    let output = CollectStringPrint::new();
    let tracer = Arc::new(RecordingTracer::new());
    let runtime = Runtime::new(config)
        .with_output(output.clone())
        .with_tracer(Arc::clone(&tracer) as _);
    let unit = runtime.compile(&SourceUnit::new("main.py", source), options).unwrap();
    runtime.session().run_module(&unit, "__main__").unwrap();
    (unit, output.output(), tracer)
}

#[test]
fn sites_widen_from_monomorphic_to_megamorphic() {
    let options = CompileOptions::default();
    let (unit, output, _) = run_with(HostConfig::default(), &options, &classes_source(1, 3));
    assert_eq!(output, "0\n");
    assert_eq!(site(&unit, "getattr .x").state(), SiteState::Monomorphic);

    let (unit, output, _) = run_with(HostConfig::default(), &options, &classes_source(3, 2));
    assert_eq!(output, "6\n");
    let stats = site(&unit, "getattr .x").stats();
    assert_eq!(site(&unit, "getattr .x").state(), SiteState::Polymorphic(3));
    assert_eq!((stats.binds, stats.hits), (3, 3));

    let (unit, output, tracer) = run_with(HostConfig::default(), &options, &classes_source(12, 1));
    assert_eq!(output, "66\n");
    assert_eq!(site(&unit, "getattr .x").state(), SiteState::Megamorphic);
    let megamorphic = tracer
        .site_events()
        .into_iter()
        .filter(|(op, event)| op == "getattr .x" && *event == SiteEvent::Megamorphic)
        .count();
    assert_eq!(megamorphic, 1);
}

#[test]
fn polymorphic_limit_is_configurable() {
    let config = HostConfig::builder().polymorphic_limit(2).build();
    let (unit, output, _) = run_with(config, &CompileOptions::default(), &classes_source(3, 1));
    assert_eq!(output, "3\n");
    assert_eq!(site(&unit, "getattr .x").state(), SiteState::Megamorphic);
}

#[test]
fn caches_never_change_what_a_program_computes() {
    let source = "class A:\n    def f(self):\n        return 1\nclass B:\n    def f(self):\n        return 'b'\n\
                  def call(o):\n    return o.f()\nout = []\nfor o in [A(), B(), A()]:\n    out.append(call(o))\n\
                  A.f = lambda self: 2\nout.append(call(A()))\nb = B()\nb.f = lambda: 'own'\nout.append(call(b))\nprint(out)\n";
    let (cached, with_caches, _) = run_with(HostConfig::default(), &CompileOptions::default(), source);
    let (uncached, without_caches, _) = run_with(
        HostConfig::default(),
        &CompileOptions::default().without_inline_caches(),
        source,
    );
    assert_eq!(with_caches, "[1, 'b', 1, 2, 'own']\n");
    assert_eq!(without_caches, with_caches);
    assert_ne!(site(&cached, "getattr .f").state(), SiteState::Empty);
    assert!(uncached.sites().iter().all(|site| site.state() == SiteState::Empty));
    assert!(uncached.sites().iter().all(|site| site.stats().hits == 0));
}

#[test]
fn hot_functions_tier_up_once() {
    let source = "def f(n):\n    return n + 1\nfor i in range(6):\n    f(i)\nprint(f(0))\n";
    let config = HostConfig::builder().tier_threshold(3).build();
    let (_, output, tracer) = run_with(config, &CompileOptions::default(), source);
    assert_eq!(output, "1\n");
    let tier_ups: Vec<TraceEvent> = tracer
        .events()
        .into_iter()
        .filter(|event| matches!(event, TraceEvent::TierUp { .. }))
        .collect();
    assert_eq!(
        tier_ups,
        vec![TraceEvent::TierUp {
            name: "f".to_owned(),
            calls: 4
        }]
    );
}

#[test]
fn generators_and_interpreted_units_never_tier() {
    let source = "def g():\n    yield 1\nfor i in range(10):\n    list(g())\nprint('done')\n";
    let options = CompileOptions::default().with_tiering(TieringPolicy::Threshold(1));
    let (_, output, tracer) = run_with(HostConfig::default(), &options, source);
    assert_eq!(output, "done\n");
    assert!(!tracer.events().iter().any(|event| matches!(event, TraceEvent::TierUp { .. })));

    let options = CompileOptions::default().with_tiering(TieringPolicy::AlwaysInterpret);
    let (_, _, tracer) = run_with(HostConfig::default(), &options, "def f():\n    pass\nfor i in range(50):\n    f()\n");
    assert!(!tracer.events().iter().any(|event| matches!(event, TraceEvent::TierUp { .. })));
}

#[test]
fn introspected_functions_stay_on_the_interpreter() {
    let source = "def f(a):\n    return sorted(locals())\ndef h():\n    return 2\nfor i in range(4):\n    f(i)\n    h()\nprint(f(0))\n";
    let options = CompileOptions::default().with_tiering(TieringPolicy::Threshold(1));
    let (_, output, tracer) = run_with(HostConfig::default(), &options, source);
    assert_eq!(output, "['a']\n");
    let tier_ups: Vec<TraceEvent> = tracer
        .events()
        .into_iter()
        .filter(|event| matches!(event, TraceEvent::TierUp { .. }))
        .collect();
    assert_eq!(
        tier_ups,
        vec![TraceEvent::TierUp {
            name: "h".to_owned(),
            calls: 2
        }]
    );
}

#[test]
fn compiled_code_shares_sites_with_the_interpreter() {
    let source = "def add(a, b):\n    return a + b\nr = [add(1, 2), add('x', 'y')]\nfor i in range(5):\n    r.append(add(i, 1.5))\nprint(r[:3])\n";
    let config = HostConfig::builder().tier_threshold(2).build();
    let (unit, output, _) = run_with(config, &CompileOptions::default(), source);
    assert_eq!(output, "[3, 'xy', 1.5]\n");
    assert_eq!(site(&unit, "binary +").state(), SiteState::Polymorphic(3));
}
