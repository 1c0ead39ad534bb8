//! Pre-write deduplication index.
//!
//! Maps a [`NodeKey`] (content hash plus declared type) to the handle of the
//! node already written, or still being written, with those bytes. The index
//! is bounded by key count and evicts in insertion order. Eviction only drops
//! index entries, so it can cause duplicate writes but never data loss.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use arbor_types::{NodeHandle, NodeKey, WriteState};
use tracing::trace;

use crate::config::NodeCacheOptions;

#[derive(Default)]
struct CacheInner {
    entries: HashMap<NodeKey, NodeHandle>,
    order: VecDeque<NodeKey>,
}

/// FIFO-bounded map from [`NodeKey`] to [`NodeHandle`], shared by writers.
pub struct NodeCache {
    inner: Mutex<CacheInner>,
    max_keys: usize,
}

impl NodeCache {
    pub fn new(max_keys: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_keys,
        }
    }

    pub fn from_options(options: &NodeCacheOptions) -> Self {
        Self::new(options.max_keys)
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Look up a key. Handles whose bundle failed are dropped and reported
    /// as misses.
    pub fn get(&self, key: &NodeKey) -> Option<NodeHandle> {
        let mut inner = self.lock();
        let handle = inner.entries.get(key)?;
        let failed = handle
            .pending_signal()
            .is_some_and(|signal| matches!(signal.state(), WriteState::Failed(_)));
        if failed {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        Some(handle.clone())
    }

    /// Insert a key, evicting the oldest keys to stay within capacity. If the
    /// key is already present the existing handle is kept and returned.
    pub fn insert(&self, key: NodeKey, handle: NodeHandle) -> Option<NodeHandle> {
        if self.max_keys == 0 {
            return None;
        }
        let mut inner = self.lock();
        if let Some(existing) = inner.entries.get(&key) {
            return Some(existing.clone());
        }
        while inner.entries.len() >= self.max_keys {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            trace!(hash = %oldest.hash.short_hex(), "evicted node cache key");
        }
        inner.order.push_back(key);
        inner.entries.insert(key, handle);
        None
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    // The guarded maps stay consistent even if a holder panicked.
    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::from_options(&NodeCacheOptions::default())
    }
}

impl std::fmt::Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("len", &self.len())
            .field("max_keys", &self.max_keys)
            .finish()
    }
}
