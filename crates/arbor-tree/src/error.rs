//! Error types for tree reads and writes.

use std::sync::Arc;

use arbor_bundle::BundleError;
use arbor_storage::BackendError;
use arbor_types::{RefName, TypeError};
use thiserror::Error;

/// Errors raised by the tree store.
///
/// Cloneable: a failed shared fetch or bundle write is reported to every
/// waiter.
#[derive(Clone, Debug, Error)]
pub enum StorageError {
    /// Malformed bundle data: bad signature, unsupported version, unknown or
    /// unavailable compression, truncated header.
    #[error("format error: {0}")]
    Format(#[from] BundleError),

    /// Structurally valid data that does not fit together: an unregistered
    /// node type, a reference out of range, a hash mismatch.
    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("ref not found: {0}")]
    RefNotFound(RefName),

    #[error("backend error: {0}")]
    Backend(BackendError),

    #[error("bundle write failed: {reason}")]
    BundleWriteFailed { reason: Arc<str> },

    /// A bundle this one imports from failed to write.
    #[error("dependency failed: {reason}")]
    DependencyFailed { reason: Arc<str> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl From<BackendError> for StorageError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::RefNotFound(name) => Self::RefNotFound(name),
            other => Self::Backend(other),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
