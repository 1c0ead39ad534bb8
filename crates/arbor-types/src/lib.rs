//! Foundation types for the Arbor tree store.
//!
//! Every other Arbor crate depends on `arbor-types`.
//!
//! # Key Types
//!
//! - **[`ContentHash`]**: BLAKE3 hash of a node's serialized bytes
//! - **[`BlobLocator`]**: backend-assigned address of a stored blob
//! - **[`NodeLocator`]**: one export inside a bundle: `(blob, export index)`
//! - **[`NodeType`]**: declared node type: GUID + serializer version
//! - **[`NodeKey`]**: dedup identity `(hash, type)`
//! - **[`NodeHandle`]**: hash plus a write-once, possibly pending, locator
//! - **[`WriteSignal`]**: completion signal of an in-flight bundle
//! - **[`RefName`]**: validated name of a ref

pub mod error;
pub mod handle;
pub mod hash;
pub mod locator;
pub mod node_type;
pub mod ref_name;

pub use error::TypeError;
pub use handle::{write_signal, NodeHandle, WriteCallback, WriteSignal, WriteSignalSender, WriteState};
pub use hash::ContentHash;
pub use locator::{BlobLocator, NodeLocator};
pub use node_type::{NodeKey, NodeType};
pub use ref_name::RefName;
