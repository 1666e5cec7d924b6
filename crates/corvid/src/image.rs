//! Precompiled code images.
//!
//! An image is the front end's output for one unit: the parsed AST, the binder's scope
//! table and the identifier table, plus the options that shape lowering. Loading one skips
//! lexing, parsing and binding and goes straight to lowering. Images are trusted input;
//! nothing re-validates the scope table against the AST.
//!
//! Layout: a 4-byte magic, a format byte, then the `postcard` encoding of [`CodeImage`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    expressions::ModuleAst,
    intern::Interner,
    modes::CompilationMode,
    prepare::ScopeTree,
    source::{CodeKind, CompileOptions},
};

const MAGIC: &[u8; 4] = b"CVIM";
const FORMAT: u8 = 1;

/// Why an image could not be read or written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("not a code image")]
    BadMagic,
    #[error("unsupported image format {0} (expected {FORMAT})")]
    Format(u8),
    #[error("corrupt image: {0}")]
    Decode(String),
    #[error("cannot encode image: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CodeImage {
    pub path: Arc<str>,
    pub kind: CodeKind,
    pub optimize: bool,
    pub mode: CompilationMode,
    pub ast: ModuleAst,
    pub scopes: ScopeTree,
    pub interner: Interner,
}

impl CodeImage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let payload = postcard::to_allocvec(self).map_err(|err| ImageError::Encode(err.to_string()))?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + 1 + payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.push(FORMAT);
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        let Some(rest) = bytes.strip_prefix(MAGIC.as_slice()) else {
            return Err(ImageError::BadMagic);
        };
        let Some((&format, payload)) = rest.split_first() else {
            return Err(ImageError::BadMagic);
        };
        if format != FORMAT {
            return Err(ImageError::Format(format));
        }
        let mut image: Self = postcard::from_bytes(payload).map_err(|err| ImageError::Decode(err.to_string()))?;
        image.interner.rebuild_lookup();
        Ok(image)
    }

    /// The options the unit was compiled with, minus the runtime-only ones.
    pub fn options(&self) -> CompileOptions {
        CompileOptions {
            kind: self.kind,
            optimize: self.optimize,
            mode: Some(self.mode),
            ..CompileOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{parse::parse, prepare::bind};

    fn image(source: &str) -> CodeImage {
        let mut interner = Interner::new();
        let ast = parse(source, CodeKind::Module, &mut interner).unwrap();
        let scopes = bind(&ast, &mut interner).unwrap();
        CodeImage {
            path: Arc::from("m.py"),
            kind: CodeKind::Module,
            optimize: true,
            mode: CompilationMode::Optimized,
            ast,
            scopes,
            interner,
        }
    }

    #[test]
    fn bytes_restore_the_front_end_output() {
        let original = image("def f(x):\n    return x + y\n");
        let restored = CodeImage::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.ast, original.ast);
        assert_eq!(restored.scopes, original.scopes);
        assert_eq!(restored.interner.get_id("y"), original.interner.get_id("y"));
        assert!(restored.options().optimize);
    }

    #[test]
    fn foreign_bytes_are_rejected() {
        assert_eq!(CodeImage::from_bytes(b"print(1)").unwrap_err(), ImageError::BadMagic);
        let mut bytes = image("x = 1\n").to_bytes().unwrap();
        bytes[4] = 9;
        assert_eq!(CodeImage::from_bytes(&bytes).unwrap_err(), ImageError::Format(9));
        bytes[4] = FORMAT;
        bytes.truncate(8);
        assert!(matches!(CodeImage::from_bytes(&bytes), Err(ImageError::Decode(_))));
    }
}
