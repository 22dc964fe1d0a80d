//! Error types for the ChronDB crate.
//!
//! This module defines a unified error enumeration used across the object
//! store, the commit pipeline, the durability layer, the search index and the
//! admin facade. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - `IndexUnavailable` and `Remote` are non-fatal by contract: the storage
//!   operation they decorate has already succeeded.
//! - `Corruption` is fatal for the affected resource and halts WAL replay.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ChronError>;

#[derive(Error, Debug)]
/// Unified error enumeration for ChronDB.
pub enum ChronError {
    /// Document or branch missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Null or missing-id input document.
    #[error("Document is nil or has no id: {0}")]
    NilDocument(String),

    /// Schema check failed; carries the per-path violations.
    #[error("Validation failed for `{document_id}`: {violations:?}")]
    Validation {
        document_id: String,
        violations: Vec<String>,
    },

    /// OCC retries exhausted or a merge has unresolved paths.
    #[error("Conflict on `{subject}` (branch `{branch}`): {detail}")]
    Conflict {
        subject: String,
        branch: String,
        detail: String,
    },

    /// Object store, WAL, or filesystem failure.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// Index offline; the storage operation still succeeded.
    #[error("Search index unavailable: {0}")]
    IndexUnavailable(String),

    /// Checksum mismatch in the WAL or an unreadable object.
    #[error("Corruption detected in {resource}: {detail}")]
    Corruption { resource: String, detail: String },

    /// Push or pull against the upstream failed; never fatal to local state.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Malformed object bytes (blob, tree, commit, or note).
    #[error("The `{0}` is not a valid {1} object.")]
    InvalidObject(String, &'static str),

    /// Invalid or unsupported object type name.
    #[error("The `{0}` is not a valid object type.")]
    InvalidObjectType(String),

    /// Invalid hash formatting or value.
    #[error("The `{0}` is not a valid hash value.")]
    InvalidHashValue(String),

    /// Invalid ref name or ref file contents.
    #[error("Invalid ref `{0}`: {1}")]
    InvalidRef(String, String),

    /// Key cannot be mapped to a tree path or back.
    #[error("Invalid document key `{0}`: {1}")]
    InvalidKey(String, String),

    /// Serialization failure (JSON or binary record encoding).
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid CLI or function argument.
    #[error("Argument parse failed: {0}")]
    InvalidArgument(String),
}

impl ChronError {
    /// Conflicts are the only retryable failures; the OCC loop keys off this.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ChronError::Conflict { .. })
    }

    /// Non-fatal errors decorate an operation that already succeeded.
    pub fn is_non_fatal(&self) -> bool {
        matches!(
            self,
            ChronError::IndexUnavailable(_) | ChronError::Remote(_)
        )
    }

    pub(crate) fn corrupt(resource: impl Into<String>, detail: impl Into<String>) -> Self {
        ChronError::Corruption {
            resource: resource.into(),
            detail: detail.into(),
        }
    }
}

impl From<serde_json::Error> for ChronError {
    fn from(e: serde_json::Error) -> Self {
        ChronError::Serialization(e.to_string())
    }
}
