use arbor_types::TypeError;
use thiserror::Error;

use crate::compression::CompressionFormat;

#[derive(Clone, Debug, Error)]
pub enum BundleError {
    #[error("invalid bundle signature: expected {expected:?}, got {actual:?}")]
    InvalidSignature { expected: String, actual: String },

    #[error("unsupported bundle version: {0}")]
    UnsupportedVersion(u64),

    #[error("unknown compression format tag: {0}")]
    UnknownCompression(u64),

    #[error("compression format {0} is not available in this build")]
    UnsupportedCodec(CompressionFormat),

    #[error("truncated bundle data at offset {offset}: {context}")]
    Truncated { offset: usize, context: &'static str },

    #[error("corrupt bundle: {0}")]
    Corrupt(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("invalid value in bundle: {0}")]
    Type(#[from] TypeError),
}

pub type BundleResult<T> = Result<T, BundleError>;
