use thiserror::Error;

/// Errors produced by type operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid blob locator {value:?}: {reason}")]
    InvalidLocator { value: String, reason: String },

    #[error("invalid ref name {name:?}: {reason}")]
    InvalidRefName { name: String, reason: String },

    #[error("node handle {hash} already resolved to {existing}, cannot rebind to {requested}")]
    LocatorAlreadySet {
        hash: String,
        existing: String,
        requested: String,
    },
}
