use std::{sync::Arc, thread, time::Duration};

use corvid::{
    CollectStringPrint, CompileOptions, ExcType, HostConfig, Namespace, PyDict, Runtime, SourceUnit, TieringPolicy, Value,
    display_value,
};
use pretty_assertions::assert_eq;

fn runtime() -> (Runtime, CollectStringPrint) {
    let output = CollectStringPrint::new();
    let runtime = Runtime::new(HostConfig::default()).with_output(output.clone());
    (runtime, output)
}

fn run(source: &str) -> (String, Result<(), String>) {
    let (runtime, output) = runtime();
    let unit = runtime
        .compile(&SourceUnit::new("main.py", source), &CompileOptions::default())
        .unwrap();
    let outcome = runtime.session().run_module(&unit, "__main__").map(drop);
    (output.output(), outcome.map_err(|exc| exc.summary()))
}

#[test]
fn exec_and_eval_share_a_caller_namespace() {
    let (runtime, _) = runtime();
    let mut session = runtime.session();
    let namespace = Namespace::Dict(Arc::new(PyDict::new()));
    let unit = runtime
        .compile(&SourceUnit::new("<string>", "x = 20\ny = x + 1"), &CompileOptions::exec())
        .unwrap();
    session.exec(&unit, &namespace).unwrap();
    let expr = runtime
        .compile(&SourceUnit::new("<string>", "x * 2 + y"), &CompileOptions::eval())
        .unwrap();
    let value = session.eval(&expr, &namespace).unwrap();
    assert_eq!(display_value(&value), "61");
}

#[test]
fn host_calls_functions_defined_by_programs() {
    let (runtime, _) = runtime();
    let unit = runtime
        .compile(
            &SourceUnit::new("lib.py", "def scale(v, by=2):\n    return [x * by for x in v]\n"),
            &CompileOptions::default(),
        )
        .unwrap();
    let mut session = runtime.session();
    let module = session.run_module(&unit, "lib").unwrap();
    let scale = module.namespace.get("scale").unwrap();
    let result = session
        .call_with_keywords(
            &scale,
            vec![Value::list(vec![Value::Int(1), Value::Int(2)])],
            vec![("by", Value::Int(10))],
        )
        .unwrap();
    assert_eq!(display_value(&result), "[10, 20]");
    let err = session.call(&scale, vec![]).unwrap_err();
    assert!(err.is(ExcType::TypeError), "{err}");
}

#[test]
fn unhandled_exceptions_carry_the_whole_chain() {
    let (_, outcome) = run("def f():\n    try:\n        {}['k']\n    except KeyError as e:\n        raise ValueError('bad') from e\nf()\n");
    assert_eq!(outcome, Err("ValueError: bad".to_owned()));

    let (runtime, _) = runtime();
    let unit = runtime
        .compile(
            &SourceUnit::new("main.py", "try:\n    1 / 0\nexcept ZeroDivisionError:\n    raise KeyError('k')\n"),
            &CompileOptions::default(),
        )
        .unwrap();
    let exc = runtime.session().run_module(&unit, "__main__").unwrap_err();
    let context = exc.context.as_deref().unwrap();
    assert_eq!(context.summary(), "ZeroDivisionError: division by zero");
    assert!(exc.cause.is_none());
    assert!(
        exc.traceback_text()
            .contains("During handling of the above exception, another exception occurred:"),
        "{}",
        exc.traceback_text()
    );
}

#[test]
fn bare_raise_keeps_the_original_frames() {
    let source = "def inner():\n    raise ValueError('boom')\n\n\ndef outer():\n    try:\n        inner()\n    except ValueError:\n        print('retrying')\n        raise\n\n\nouter()\n";
    for tiering in [TieringPolicy::AlwaysInterpret, TieringPolicy::AlwaysCompile] {
        let (runtime, output) = runtime();
        let unit = runtime
            .compile(&SourceUnit::new("main.py", source), &CompileOptions::default().with_tiering(tiering))
            .unwrap();
        let exc = runtime.session().run_module(&unit, "__main__").unwrap_err();
        assert_eq!(output.output(), "retrying\n");
        assert_eq!(exc.summary(), "ValueError: boom");
        let frames: Vec<(&str, u32)> = exc.traceback.iter().map(|f| (f.name.as_str(), f.line)).collect();
        assert_eq!(frames, vec![("<module>", 13), ("outer", 7), ("inner", 2)], "{tiering:?}");
    }
}

#[test]
fn system_exit_sets_the_status() {
    let (runtime, _) = runtime();
    let mut stderr = Vec::new();
    for (source, code) in [
        ("import sys\nsys.exit()\n", 0),
        ("import sys\nsys.exit(3)\n", 3),
        ("import sys\nsys.exit('bye')\n", 1),
        ("raise SystemExit(True)\n", 1),
        ("x = 1\n", 0),
        ("x = undefined\n", 1),
    ] {
        let unit = runtime
            .compile(&SourceUnit::new("main.py", source), &CompileOptions::default())
            .unwrap();
        let status = runtime.session().run_main_to(&unit, &mut stderr);
        assert_eq!(status.code(), code, "{source}");
    }
    let stderr = String::from_utf8(stderr).unwrap();
    assert!(stderr.contains("bye\n"), "{stderr}");
    assert!(stderr.ends_with("NameError: name 'undefined' is not defined\n"), "{stderr}");
}

#[test]
fn recursion_is_bounded_by_the_configured_limit() {
    let output = CollectStringPrint::new();
    let runtime = Runtime::new(HostConfig::builder().recursion_limit(40).build()).with_output(output.clone());
    let unit = runtime
        .compile(
            &SourceUnit::new(
                "main.py",
                "import sys\ndef down(n):\n    return down(n + 1)\ntry:\n    down(0)\nexcept RecursionError as e:\n    print(e, sys.getrecursionlimit())\n",
            ),
            &CompileOptions::default(),
        )
        .unwrap();
    runtime.session().run_module(&unit, "__main__").unwrap();
    assert_eq!(output.output(), "maximum recursion depth exceeded 40\n");
}

#[test]
fn default_recursion_limit_fits_small_host_threads() {
    let worker = thread::Builder::new()
        .stack_size(512 * 1024)
        .spawn(|| run("def down(n):\n    return down(n + 1)\ntry:\n    down(0)\nexcept RecursionError:\n    print('too deep')\n"))
        .unwrap();
    let (output, outcome) = worker.join().unwrap();
    assert_eq!(outcome, Ok(()));
    assert_eq!(output, "too deep\n");
}

#[test]
fn interrupts_stop_long_running_loops() {
    let source = "try:\n    print('started')\n    while True:\n        pass\nfinally:\n    print('cleanup')\n";
    for tiering in [TieringPolicy::AlwaysInterpret, TieringPolicy::AlwaysCompile] {
        let (runtime, output) = runtime();
        let unit = runtime
            .compile(&SourceUnit::new("main.py", source), &CompileOptions::default().with_tiering(tiering))
            .unwrap();
        let mut session = runtime.session();
        let handle = session.interrupt_handle();
        let watched = output.clone();
        let interrupter = thread::spawn(move || {
            while watched.output().is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
            handle.interrupt();
        });
        let exc = session.run_module(&unit, "__main__").unwrap_err();
        interrupter.join().unwrap();
        assert!(exc.is(ExcType::KeyboardInterrupt), "{tiering:?}: {exc}");
        assert_eq!(output.output(), "started\ncleanup\n", "{tiering:?}");
    }
}

#[test]
fn generators_finish_and_report_their_value() {
    let (output, outcome) = run(
        "def g():\n    x = yield 1\n    return x * 2\nit = g()\nnext(it)\ntry:\n    it.send(21)\nexcept StopIteration as s:\n    print(s.value)\n",
    );
    assert_eq!(outcome, Ok(()));
    assert_eq!(output, "42\n");
}

#[test]
fn optimized_and_lookup_modes_agree_on_rebinding_builtins() {
    let source = "def n(v):\n    return len(v)\nr = [n('ab')]\nlen = lambda v: 0\nr.append(n('ab'))\ndel len\nr.append(n('ab'))\nprint(r)\n";
    for mode in [corvid::CompilationMode::Lookup, corvid::CompilationMode::Optimized] {
        let (runtime, output) = runtime();
        let unit = runtime
            .compile(&SourceUnit::new("main.py", source), &CompileOptions::default().with_mode(mode))
            .unwrap();
        runtime.session().run_module(&unit, "__main__").unwrap();
        assert_eq!(output.output(), "[2, 0, 2]\n", "{mode:?}");
    }
}

#[test]
fn constant_displays_are_built_once_per_literal() {
    let (output, outcome) = run(
        "def point():\n    return (1, (2, 3))\ndef other():\n    return (1, (2, 3))\n\
         seen = [point() for _ in range(3)]\n\
         print(all(p is seen[0] for p in seen), point() is other(), point() == other())\n",
    );
    assert_eq!(outcome, Ok(()));
    assert_eq!(output, "True False True\n");
}
