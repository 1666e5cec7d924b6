use std::sync::Arc;

use corvid::{
    CollectStringPrint, CompileError, CompileOptions, HostConfig, ImageError, Imported, ImportFailure, Importer,
    Runtime, SourceUnit,
};
use pretty_assertions::assert_eq;

const PROGRAM: &str = "\"\"\"doc\"\"\"\nimport sys\n\ndef fib(n):\n    return n if n < 2 else fib(n - 1) + fib(n - 2)\n\nassert fib(0) == 1, 'stripped when optimized'\nprint([fib(i) for i in range(8)], __doc__)\n";

fn new_runtime() -> (Runtime, CollectStringPrint) {
    let output = CollectStringPrint::new();
    (Runtime::new(HostConfig::default()).with_output(output.clone()), output)
}

#[test]
fn images_run_like_their_source() {
    let (runtime, output) = new_runtime();
    let options = CompileOptions {
        optimize: true,
        ..CompileOptions::default()
    };
    let unit = runtime.compile(&SourceUnit::new("fib.py", PROGRAM), &options).unwrap();
    let bytes = unit.to_image().unwrap();

    let (other, other_output) = new_runtime();
    let restored = other.load_image(&bytes).unwrap();
    assert_eq!(restored.filename(), "fib.py");
    assert_eq!(restored.global_names(), unit.global_names());
    other.session().run_module(&restored, "__main__").unwrap();
    runtime.session().run_module(&unit, "__main__").unwrap();
    assert_eq!(other_output.output(), "[0, 1, 1, 2, 3, 5, 8, 13] None\n");
    assert_eq!(output.output(), other_output.output());
}

#[test]
fn unoptimized_images_keep_asserts() {
    let (runtime, _) = new_runtime();
    let unit = runtime
        .compile(&SourceUnit::new("fib.py", PROGRAM), &CompileOptions::default())
        .unwrap();
    let restored = runtime.load_image(&unit.to_image().unwrap()).unwrap();
    let exc = runtime.session().run_module(&restored, "__main__").unwrap_err();
    assert_eq!(exc.summary(), "AssertionError: stripped when optimized");
    assert_eq!(exc.traceback.last().map(|frame| frame.line), Some(7));
}

#[test]
fn damaged_images_are_rejected() {
    let (runtime, _) = new_runtime();
    let err = runtime.load_image(b"\x00\x01").unwrap_err();
    assert!(matches!(err, CompileError::Image(ImageError::BadMagic)), "{err}");
    let unit = runtime
        .compile(&SourceUnit::new("m.py", "x = 1\n"), &CompileOptions::default())
        .unwrap();
    let mut bytes = unit.to_image().unwrap();
    bytes.truncate(bytes.len() / 2);
    assert!(matches!(runtime.load_image(&bytes), Err(CompileError::Image(ImageError::Decode(_)))));
}

/// Serves one module as a precompiled image.
#[derive(Debug)]
struct ImageImporter {
    bytes: Arc<[u8]>,
}

impl Importer for ImageImporter {
    fn import(&self, name: &str, _level: u32) -> Result<Option<Imported>, ImportFailure> {
        match name {
            "precompiled" => Ok(Some(Imported::Image {
                bytes: Arc::clone(&self.bytes),
                package: false,
            })),
            "broken" => Err(ImportFailure::new("storage offline")),
            _ => Ok(None),
        }
    }
}

#[test]
fn importers_can_serve_images() {
    let (compiler, _) = new_runtime();
    let library = compiler
        .compile(
            &SourceUnit::new("precompiled.py", "def triple(x):\n    return 3 * x\n"),
            &CompileOptions::default(),
        )
        .unwrap();
    let importer = ImageImporter {
        bytes: library.to_image().unwrap().into(),
    };
    let output = CollectStringPrint::new();
    let runtime = Runtime::new(HostConfig::default())
        .with_importer(importer)
        .with_output(output.clone());
    let main = runtime
        .compile(
            &SourceUnit::new(
                "main.py",
                "import precompiled\nprint(precompiled.triple(14), precompiled.__file__)\ntry:\n    import broken\nexcept ImportError as e:\n    print(e)\n",
            ),
            &CompileOptions::default(),
        )
        .unwrap();
    runtime.session().run_module(&main, "__main__").unwrap();
    assert_eq!(output.output(), "42 precompiled.py\nstorage offline\n");
}
