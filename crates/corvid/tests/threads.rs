use std::thread;

use corvid::{CollectStringPrint, CompileOptions, HostConfig, MemoryImporter, Runtime, SourceUnit, display_value};
use pretty_assertions::assert_eq;

#[test]
fn sessions_on_many_threads_share_modules_and_caches() {
    let importer = MemoryImporter::new().with_module(
        "shared",
        "print('loading shared')\ncount = 0\ndef area(o):\n    return o.w * o.h\nclass Box:\n    def __init__(self, w, h):\n        self.w = w\n        self.h = h\n",
    );
    let output = CollectStringPrint::new();
    let runtime = Runtime::new(HostConfig::default())
        .with_importer(importer)
        .with_output(output.clone());
    let unit = runtime
        .compile(
            &SourceUnit::new(
                "worker.py",
                "import shared\nresult = sum(shared.area(shared.Box(i, 2)) for i in range(100))\n",
            ),
            &CompileOptions::default(),
        )
        .unwrap();

    let results: Vec<String> = thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let runtime = runtime.clone();
                let unit = unit.clone();
                scope.spawn(move || {
                    let module = runtime.session().run_module(&unit, &format!("worker{i}")).unwrap();
                    display_value(&module.namespace.get("result").unwrap())
                })
            })
            .collect();
        workers.into_iter().map(|worker| worker.join().unwrap()).collect()
    });

    assert_eq!(results, vec!["9900"; 4]);
    assert_eq!(output.output(), "loading shared\n");
    assert!(runtime.module("shared").is_some());
}

#[test]
fn concurrent_global_updates_are_never_torn() {
    let runtime = Runtime::new(HostConfig::default());
    let unit = runtime
        .compile(
            &SourceUnit::new("state.py", "values = []\ndef record(tag):\n    values.append(tag)\n"),
            &CompileOptions::default(),
        )
        .unwrap();
    let module = runtime.session().run_module(&unit, "state").unwrap();
    let record = module.namespace.get("record").unwrap();

    thread::scope(|scope| {
        for t in 0..4 {
            let runtime = runtime.clone();
            let record = record.clone();
            scope.spawn(move || {
                let mut session = runtime.session();
                for _ in 0..250 {
                    session.call(&record, vec![corvid::Value::Int(t)]).unwrap();
                }
            });
        }
    });
    let values = module.namespace.get("values").unwrap();
    let len = runtime
        .compile(&SourceUnit::new("<string>", "len(values)"), &CompileOptions::eval())
        .unwrap();
    let count = runtime.session().eval(&len, &module.namespace).unwrap();
    assert_eq!(display_value(&count), "1000");
    assert!(matches!(values, corvid::Value::List(_)));
}
