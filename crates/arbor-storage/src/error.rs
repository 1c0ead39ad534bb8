//! Error types for backend operations.

use std::sync::Arc;

use arbor_types::{BlobLocator, ContentHash, RefName, TypeError};
use thiserror::Error;

/// Errors raised by a blob/ref backend.
///
/// Cloneable so that one failed fetch can be reported to every waiter that
/// shared it.
#[derive(Clone, Debug, Error)]
pub enum BackendError {
    /// No blob is stored under the locator.
    #[error("blob not found: {0}")]
    BlobNotFound(BlobLocator),

    /// A range read started past the end of the blob.
    #[error("range at offset {offset} is past the end of blob {locator} ({len} bytes)")]
    RangeOutOfBounds {
        locator: BlobLocator,
        offset: usize,
        len: usize,
    },

    /// The ref has no target (or its target expired).
    #[error("ref not found: {0}")]
    RefNotFound(RefName),

    /// Refs may only point at durably written nodes.
    #[error("cannot point ref {name} at node {hash}: its bundle has not been written")]
    UnresolvedHandle { name: RefName, hash: ContentHash },

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error(transparent)]
    Type(#[from] TypeError),

    /// Any other failure reported by a backend implementation.
    #[error("backend error: {0}")]
    Other(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Convenience type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;
