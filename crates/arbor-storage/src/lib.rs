//! Blob and ref backend contract for the Arbor tree store.
//!
//! The tree store never talks to storage directly; it goes through a
//! [`StorageBackend`], which stores immutable blobs, named refs pointing at
//! root nodes, and node aliases.
//!
//! # Key Types
//!
//! - **[`StorageBackend`]**: async trait implemented by concrete backends
//! - **[`RefOptions`]**: ref lifetime and auto-extend flag
//! - **[`RefCacheTime`]**: acceptable staleness of a ref read
//! - **[`InMemoryBackend`]**: HashMap-based backend for tests and embedding

pub mod backend;
pub mod error;
pub mod memory;

pub use backend::{RefCacheTime, RefOptions, StorageBackend};
pub use error::{BackendError, BackendResult};
pub use memory::InMemoryBackend;
