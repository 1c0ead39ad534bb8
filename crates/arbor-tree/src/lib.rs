//! Content-addressed tree storage on top of bundles.
//!
//! Trees of user-defined nodes are written into bundles, deduplicated by
//! content hash and declared type, and read back lazily through a caching,
//! coalescing reader.
//!
//! # Key Types
//!
//! - **[`StorageClient`]**: facade over one backend, node cache and reader
//! - **[`TreeWriter`]**: packs nodes into bundles and writes them in the background
//! - **[`TreeReader`]**: fetches headers and packets with prefetch, coalescing and caching
//! - **[`TreeNode`] / [`TreeNodeRef`]**: the user-facing node graph with dirty tracking
//! - **[`NodeRegistry`]**: explicit node type to decoder mapping
//! - **[`NodeCache`]**: bounded dedup index from (hash, type) to handle
//! - **[`StorageConfig`]**: writer, reader and cache tuning, loadable from TOML

pub mod bundle_info;
pub mod client;
pub mod config;
pub mod error;
pub mod node;
pub mod node_cache;
pub mod node_ref;
pub mod reader;
pub mod registry;
pub mod writer;

pub use bundle_info::BundleInfo;
pub use client::StorageClient;
pub use config::{NodeCacheOptions, ReaderOptions, StorageConfig, WriterOptions};
pub use error::{StorageError, StorageResult};
pub use node::{NodeData, NodeDecode, NodeMeta, NodeReader, NodeWriter, TreeNode};
pub use node_cache::NodeCache;
pub use node_ref::TreeNodeRef;
pub use reader::{ReaderStats, TreeReader};
pub use registry::NodeRegistry;
pub use writer::{TreeWriter, WriterStats, DEFAULT_NAME_HINT};
