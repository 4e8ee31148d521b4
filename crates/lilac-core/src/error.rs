//! Error taxonomy for the dataset engine.
//!
//! Every variant carries the offending path or name so callers can match on
//! *kind* rather than parse a message, per the engine's testable properties.

use crate::path::Path;
use std::fmt;

/// The closed set of ways a dataset operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum LilacError {
    /// A value didn't conform to its field's declared dtype.
    #[error("schema mismatch at {path}: {detail}")]
    SchemaMismatch { path: Path, detail: String },

    /// A column path was referenced that doesn't exist in the merged schema.
    #[error("unknown path: {path}")]
    UnknownPath { path: Path },

    /// A signal UDF was referenced whose dependency chain isn't satisfied.
    #[error("missing dependency for signal `{signal}`: requires `{dependency}`")]
    MissingDependency { signal: String, dependency: String },

    /// A query was malformed independent of any particular schema.
    #[error("invalid query: {detail}")]
    InvalidQuery { detail: String },

    /// A list-valued column was used somewhere requiring scalar cardinality.
    #[error("cardinality error at {path}: {detail}")]
    CardinalityError { path: Path, detail: String },

    /// A row, shard, or signal manifest could not be located.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The on-disk manifest or shard layout is inconsistent or unreadable.
    #[error("storage error: {detail}")]
    StorageError { detail: String },

    /// A vector store operation failed (unknown key, dimension mismatch, ...).
    #[error("vector store error: {detail}")]
    VectorStoreError { detail: String },
}

impl LilacError {
    pub fn unknown_path(path: Path) -> Self {
        LilacError::UnknownPath { path }
    }

    pub fn schema_mismatch(path: Path, detail: impl fmt::Display) -> Self {
        LilacError::SchemaMismatch {
            path,
            detail: detail.to_string(),
        }
    }

    pub fn missing_dependency(signal: impl Into<String>, dependency: impl Into<String>) -> Self {
        LilacError::MissingDependency {
            signal: signal.into(),
            dependency: dependency.into(),
        }
    }

    pub fn invalid_query(detail: impl Into<String>) -> Self {
        LilacError::InvalidQuery {
            detail: detail.into(),
        }
    }

    pub fn cardinality(path: Path, detail: impl Into<String>) -> Self {
        LilacError::CardinalityError {
            path,
            detail: detail.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        LilacError::NotFound { what: what.into() }
    }

    pub fn storage(detail: impl Into<String>) -> Self {
        LilacError::StorageError {
            detail: detail.into(),
        }
    }

    pub fn vector_store(detail: impl Into<String>) -> Self {
        LilacError::VectorStoreError {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LilacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_path_carries_the_path() {
        let p = Path::from(["a", "b"]);
        let err = LilacError::unknown_path(p.clone());
        match err {
            LilacError::UnknownPath { path } => assert_eq!(path, p),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn display_includes_detail() {
        let err = LilacError::invalid_query("limit must be positive");
        assert!(err.to_string().contains("limit must be positive"));
    }
}
