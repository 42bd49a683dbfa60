//! Error types
//!
//! Every failure the pipeline can report, with enough context (file path,
//! chunk index, or query hash) to diagnose it without re-running.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Which input an embedding failure belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbedTarget {
    /// Position inside an embedding batch (0-based)
    Item(usize),
    /// A user query, identified by its hash
    Query(String),
}

impl fmt::Display for EmbedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbedTarget::Item(index) => write!(f, "batch item {}", index),
            EmbedTarget::Query(hash) => write!(f, "query {}", hash),
        }
    }
}

/// Main error type for instant-rag operations.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported format '{extension}': {path:?}")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("failed to load {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("embedding failed for {target}: {reason}")]
    Embedding { target: EmbedTarget, reason: String },

    #[error("dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("no index found at {0:?}")]
    IndexNotFound(PathBuf),

    #[error("generation failed for query {query_hash}: {reason}")]
    Generation { query_hash: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("session has no index attached; ingest a document first")]
    SessionNotReady,
}

impl RagError {
    /// Load error for `path`
    pub fn load(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        RagError::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        RagError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn persistence(reason: impl fmt::Display) -> Self {
        RagError::Persistence(reason.to_string())
    }

    /// Whether this error came from an elapsed deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, RagError::Timeout { .. })
    }
}

/// Result type alias for instant-rag operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Short, stable identifier for a query text (first 12 hex chars of SHA-256).
///
/// Used in error context instead of the raw query.
pub fn query_hash(text: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    digest[..12].to_string()
}

// ============================================================================
// Tests
// ============================================================================
