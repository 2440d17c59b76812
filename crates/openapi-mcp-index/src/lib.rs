//! Indexed read access to an OpenAPI 3.0 document.
//!
//! The index is built once at startup and serves resolved, self-contained
//! views of every operation. `$ref` pointers are resolved against
//! `#/components`, `allOf` schemas are merged, and reference cycles are
//! marked rather than expanded. All accessors return owned clones so callers
//! may mutate the views freely.

mod operation;
mod resolver;

pub mod index;

pub use index::OperationIndex;
pub use operation::{
    OperationInfo, ParameterInfo, ParameterLocation, RequestBodyInfo, SecurityScheme,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read OpenAPI document {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse OpenAPI document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("document has no `paths` object")]
    MissingPaths,

    #[error("unsupported OpenAPI version {0:?}, expected 3.x")]
    UnsupportedVersion(Option<String>),
}
