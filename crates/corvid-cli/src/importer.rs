//! Filesystem module search for the command line.

use std::{
    fs,
    path::{Path, PathBuf},
};

use corvid::{ImportFailure, Imported, Importer, SourceUnit};

/// Finds `a.b` as `a/b.py` or `a/b/__init__.py` under each search directory, in order.
#[derive(Debug, Clone)]
pub struct FsImporter {
    roots: Vec<PathBuf>,
}

impl FsImporter {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    fn candidates(&self, name: &str) -> impl Iterator<Item = (PathBuf, bool)> + '_ {
        let relative: PathBuf = name.split('.').collect();
        self.roots.iter().flat_map(move |root| {
            let base = root.join(&relative);
            [(base.join("__init__.py"), true), (base.with_extension("py"), false)]
        })
    }
}

impl Importer for FsImporter {
    fn import(&self, name: &str, _level: u32) -> Result<Option<Imported>, ImportFailure> {
        for (path, package) in self.candidates(name) {
            if !path.is_file() {
                continue;
            }
            let text = read_source(&path)?;
            return Ok(Some(Imported::Source {
                unit: SourceUnit::new(display(&path), text),
                package,
            }));
        }
        Ok(None)
    }
}

pub fn read_source(path: &Path) -> Result<String, ImportFailure> {
    fs::read_to_string(path).map_err(|err| ImportFailure::new(format!("cannot read {}: {err}", display(path))))
}

pub fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packages_win_over_modules_in_the_same_root() {
        let importer = FsImporter::new(vec![PathBuf::from("lib")]);
        let found: Vec<(PathBuf, bool)> = importer.candidates("pkg.mod").collect();
        assert_eq!(
            found,
            vec![
                (PathBuf::from("lib/pkg/mod/__init__.py"), true),
                (PathBuf::from("lib/pkg/mod.py"), false),
            ]
        );
    }
}
