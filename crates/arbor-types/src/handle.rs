//! Write-once node handles and bundle completion signals.
//!
//! A [`NodeHandle`] pairs a content hash with a locator that may not be known
//! yet: while the owning bundle is still being assembled the handle only
//! knows its export index and the bundle's [`WriteSignal`]. The locator is
//! fixed exactly once, when the bundle is durably written.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;

use crate::error::TypeError;
use crate::hash::ContentHash;
use crate::locator::{BlobLocator, NodeLocator};

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Completion state of one in-flight bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteState {
    Pending,
    Written(BlobLocator),
    Failed(Arc<str>),
}

/// Receiving side of a bundle's completion signal.
///
/// Cloneable; every clone observes the same state transitions.
#[derive(Clone)]
pub struct WriteSignal {
    id: u64,
    rx: watch::Receiver<WriteState>,
}

/// Sending side of a bundle's completion signal. Held by the bundle's
/// background write task. Dropping it without completing fails the signal.
#[derive(Debug)]
pub struct WriteSignalSender {
    id: u64,
    tx: watch::Sender<WriteState>,
}

/// Create a fresh completion signal with a process-unique bundle id.
pub fn write_signal() -> (WriteSignalSender, WriteSignal) {
    let id = NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = watch::channel(WriteState::Pending);
    (WriteSignalSender { id, tx }, WriteSignal { id, rx })
}

impl WriteSignal {
    /// Process-unique id of the bundle this signal belongs to.
    pub fn bundle_id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> WriteState {
        self.rx.borrow().clone()
    }

    /// True once the bundle is written or has failed.
    pub fn is_settled(&self) -> bool {
        !matches!(*self.rx.borrow(), WriteState::Pending)
    }

    /// Wait until the bundle settles.
    pub async fn wait(&self) -> Result<BlobLocator, Arc<str>> {
        let mut rx = self.rx.clone();
        let settled = rx
            .wait_for(|state| !matches!(state, WriteState::Pending))
            .await;
        match settled {
            Ok(state) => match &*state {
                WriteState::Written(locator) => Ok(locator.clone()),
                WriteState::Failed(reason) => Err(reason.clone()),
                WriteState::Pending => unreachable!("wait_for returned a pending state"),
            },
            Err(_) => Err(Arc::from("bundle writer dropped before completion")),
        }
    }
}

impl fmt::Debug for WriteSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSignal")
            .field("bundle_id", &self.id)
            .field("state", &*self.rx.borrow())
            .finish()
    }
}

impl WriteSignalSender {
    pub fn bundle_id(&self) -> u64 {
        self.id
    }

    pub fn complete(&self, locator: BlobLocator) {
        self.tx.send_replace(WriteState::Written(locator));
    }

    pub fn fail(&self, reason: impl Into<Arc<str>>) {
        self.tx.send_replace(WriteState::Failed(reason.into()));
    }
}

impl Drop for WriteSignalSender {
    fn drop(&mut self) {
        self.tx.send_if_modified(|state| {
            if matches!(state, WriteState::Pending) {
                *state = WriteState::Failed(Arc::from("bundle writer dropped before completion"));
                true
            } else {
                false
            }
        });
    }
}

/// Invoked once when a node's locator becomes known.
pub type WriteCallback = Box<dyn FnOnce(&NodeHandle) + Send + 'static>;

struct LocatorSlot {
    locator: OnceLock<NodeLocator>,
    pending: Option<(WriteSignal, usize)>,
    callbacks: Mutex<Vec<WriteCallback>>,
}

/// Content hash plus a write-once locator.
///
/// Clones share the same locator slot; handles returned by a dedup hit share
/// the slot of the original write, so they resolve together and share one
/// set of write callbacks.
#[derive(Clone)]
pub struct NodeHandle {
    hash: ContentHash,
    slot: Arc<LocatorSlot>,
}

impl NodeHandle {
    /// A handle whose locator is already known.
    pub fn new(hash: ContentHash, locator: NodeLocator) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(locator);
        Self {
            hash,
            slot: Arc::new(LocatorSlot {
                locator: cell,
                pending: None,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A handle for export `export_index` of a bundle that is still in flight.
    pub fn pending(hash: ContentHash, signal: WriteSignal, export_index: usize) -> Self {
        Self {
            hash,
            slot: Arc::new(LocatorSlot {
                locator: OnceLock::new(),
                pending: Some((signal, export_index)),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    /// The locator, if the owning bundle has been written.
    pub fn locator(&self) -> Option<NodeLocator> {
        if let Some(locator) = self.slot.locator.get() {
            return Some(locator.clone());
        }
        let (signal, export_index) = self.slot.pending.as_ref()?;
        match signal.state() {
            WriteState::Written(blob) => {
                let locator = blob.node(*export_index);
                // Losing a race against another resolver is fine: both derive
                // the locator from the same signal.
                let _ = self.resolve(locator);
                self.slot.locator.get().cloned()
            }
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.locator().is_some()
    }

    /// The owning bundle's signal, while the locator is still unknown.
    pub fn pending_signal(&self) -> Option<&WriteSignal> {
        if self.slot.locator.get().is_some() {
            return None;
        }
        self.slot.pending.as_ref().map(|(signal, _)| signal)
    }

    /// Export index assigned at admission, for pending handles.
    pub fn pending_export_index(&self) -> Option<usize> {
        self.slot.pending.as_ref().map(|(_, index)| *index)
    }

    /// Wait for the owning bundle to be written.
    pub async fn wait_for_locator(&self) -> Result<NodeLocator, Arc<str>> {
        if let Some(locator) = self.locator() {
            return Ok(locator);
        }
        match &self.slot.pending {
            Some((signal, _)) => {
                signal.wait().await?;
                self.locator()
                    .ok_or_else(|| Arc::from("bundle completed without resolving handle"))
            }
            None => Err(Arc::from("handle has neither a locator nor a pending bundle")),
        }
    }

    /// Fix the locator. Resolving again to the same locator is a no-op;
    /// resolving to a different one is an error.
    pub fn resolve(&self, locator: NodeLocator) -> Result<(), TypeError> {
        match self.slot.locator.set(locator.clone()) {
            Ok(()) => {
                let callbacks = {
                    let mut guard = self
                        .slot
                        .callbacks
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    std::mem::take(&mut *guard)
                };
                for callback in callbacks {
                    callback(self);
                }
                Ok(())
            }
            Err(_) => {
                let existing = self.slot.locator.get().cloned();
                match existing {
                    Some(existing) if existing == locator => Ok(()),
                    Some(existing) => Err(TypeError::LocatorAlreadySet {
                        hash: self.hash.to_hex(),
                        existing: existing.to_string(),
                        requested: locator.to_string(),
                    }),
                    None => Ok(()),
                }
            }
        }
    }

    /// Register a callback for when the locator becomes known. Runs
    /// immediately if it already is.
    pub fn on_write(&self, callback: WriteCallback) {
        {
            let mut guard = self
                .slot
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.slot.locator.get().is_none() {
                guard.push(callback);
                return;
            }
        }
        callback(self);
    }

    /// True if both handles share one locator slot.
    pub fn same_slot(&self, other: &NodeHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Identity of the locator slot, stable for the lifetime of the handle.
    pub fn slot_id(&self) -> usize {
        Arc::as_ptr(&self.slot) as usize
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        if self.hash != other.hash {
            return false;
        }
        if self.same_slot(other) {
            return true;
        }
        match (self.locator(), other.locator()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for NodeHandle {}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locator() {
            Some(locator) => write!(f, "NodeHandle({} @ {})", self.hash.short_hex(), locator),
            None => write!(f, "NodeHandle({} @ pending)", self.hash.short_hex()),
        }
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locator() {
            Some(locator) => write!(f, "{}@{}", self.hash, locator),
            None => write!(f, "{}@pending", self.hash),
        }
    }
}
