//! Tree reader: fetches bundle headers and packets and decodes nodes.
//!
//! Every fetch runs on a small worker pool, not in the caller's task. Callers
//! asking for the same header or packet share one pending request, and
//! dropping a caller's future never cancels a fetch other callers wait on.
//! Workers take header jobs before packet jobs and keep at most one request
//! per blob in flight. Queued packet jobs for adjacent packets of the same
//! blob are merged into a single range read up to `max_fetch_size`.
//!
//! Three caches sit in front of the backend: parsed headers
//! ([`BundleInfo`]), encoded packets as read, and decoded packets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arbor_bundle::{decompress, BundleError, BundleHeader};
use arbor_storage::{BackendError, StorageBackend};
use arbor_types::{BlobLocator, ContentHash, NodeHandle, NodeLocator};
use bytes::Bytes;
use moka::sync::Cache;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::bundle_info::BundleInfo;
use crate::config::ReaderOptions;
use crate::error::{StorageError, StorageResult};
use crate::node::{NodeData, TreeNode};
use crate::registry::NodeRegistry;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PacketKey {
    blob: BlobLocator,
    packet: usize,
}

impl PacketKey {
    fn new(blob: &BlobLocator, packet: usize) -> Self {
        Self {
            blob: blob.clone(),
            packet,
        }
    }
}

type Waiter<T> = watch::Sender<Option<StorageResult<T>>>;

struct PacketJob {
    key: PacketKey,
    info: Arc<BundleInfo>,
}

enum Job {
    Header(BlobLocator),
    Packets {
        info: Arc<BundleInfo>,
        first: usize,
        last: usize,
    },
}

#[derive(Default)]
struct QueueState {
    header_waiters: HashMap<BlobLocator, Waiter<Arc<BundleInfo>>>,
    packet_waiters: HashMap<PacketKey, Waiter<Bytes>>,
    header_queue: VecDeque<BlobLocator>,
    packet_queue: VecDeque<PacketJob>,
    active_blobs: HashSet<BlobLocator>,
}

#[derive(Debug, Default)]
struct AtomicReaderStats {
    header_reads: AtomicU64,
    second_header_reads: AtomicU64,
    packet_reads: AtomicU64,
    header_hits: AtomicU64,
    encoded_hits: AtomicU64,
    decoded_hits: AtomicU64,
    coalesced: AtomicU64,
}

impl AtomicReaderStats {
    fn snapshot(&self) -> ReaderStats {
        ReaderStats {
            header_reads: self.header_reads.load(Ordering::Relaxed),
            second_header_reads: self.second_header_reads.load(Ordering::Relaxed),
            packet_reads: self.packet_reads.load(Ordering::Relaxed),
            header_hits: self.header_hits.load(Ordering::Relaxed),
            encoded_hits: self.encoded_hits.load(Ordering::Relaxed),
            decoded_hits: self.decoded_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time reader counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Speculative header reads issued to the backend.
    pub header_reads: u64,
    /// Exact-size rereads for headers larger than the prefetch window.
    pub second_header_reads: u64,
    /// Range reads for packets.
    pub packet_reads: u64,
    pub header_hits: u64,
    pub encoded_hits: u64,
    pub decoded_hits: u64,
    /// Requests that joined a fetch already in flight.
    pub coalesced: u64,
}

struct ReaderInner {
    backend: Arc<dyn StorageBackend>,
    registry: Arc<NodeRegistry>,
    options: ReaderOptions,
    headers: Cache<BlobLocator, Arc<BundleInfo>>,
    encoded: Cache<PacketKey, Bytes>,
    decoded: Cache<PacketKey, Bytes>,
    queue: Mutex<QueueState>,
    notify: Notify,
    stats: AtomicReaderStats,
}

struct ReaderShared {
    inner: Arc<ReaderInner>,
    workers: Vec<JoinHandle<()>>,
}

impl Drop for ReaderShared {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Shared, cloneable node reader.
#[derive(Clone)]
pub struct TreeReader {
    shared: Arc<ReaderShared>,
}

fn byte_weight(_key: &PacketKey, value: &Bytes) -> u32 {
    u32::try_from(value.len()).unwrap_or(u32::MAX)
}

impl TreeReader {
    /// Create a reader and start its workers. Must be called inside a tokio
    /// runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        registry: Arc<NodeRegistry>,
        options: ReaderOptions,
    ) -> StorageResult<Self> {
        options.validate()?;
        let inner = Arc::new(ReaderInner {
            backend,
            registry,
            headers: Cache::builder()
                .max_capacity(options.header_cache_entries)
                .build(),
            encoded: Cache::builder()
                .weigher(byte_weight)
                .max_capacity(options.encoded_cache_bytes)
                .build(),
            decoded: Cache::builder()
                .weigher(byte_weight)
                .max_capacity(options.decoded_cache_bytes)
                .build(),
            queue: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            stats: AtomicReaderStats::default(),
            options,
        });
        let workers = (0..inner.options.worker_count)
            .map(|worker| tokio::spawn(run_worker(inner.clone(), worker)))
            .collect();
        Ok(Self {
            shared: Arc::new(ReaderShared { inner, workers }),
        })
    }

    fn inner(&self) -> &ReaderInner {
        &self.shared.inner
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner().registry
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.inner().options
    }

    pub fn stats(&self) -> ReaderStats {
        self.inner().stats.snapshot()
    }

    /// Drop every cached header and packet.
    pub fn clear_caches(&self) {
        let inner = self.inner();
        inner.headers.invalidate_all();
        inner.encoded.invalidate_all();
        inner.decoded.invalidate_all();
    }

    /// Parsed header of a bundle, from cache or fetched.
    pub async fn bundle_info(&self, blob: &BlobLocator) -> StorageResult<Arc<BundleInfo>> {
        let inner = self.inner();
        if let Some(info) = inner.headers.get(blob) {
            inner.stats.header_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(info);
        }
        let rx = {
            let mut queue = inner.lock();
            // Completed fetches fill the cache before they leave the waiter map.
            if let Some(info) = inner.headers.get(blob) {
                inner.stats.header_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(info);
            }
            match queue.header_waiters.get(blob) {
                Some(tx) => {
                    inner.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    tx.subscribe()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    queue.header_waiters.insert(blob.clone(), tx);
                    queue.header_queue.push_back(blob.clone());
                    inner.notify.notify_one();
                    rx
                }
            }
        };
        wait(rx).await
    }

    async fn packet(&self, info: &Arc<BundleInfo>, packet: usize) -> StorageResult<Bytes> {
        let inner = self.inner();
        let key = PacketKey::new(&info.locator, packet);
        if let Some(data) = inner.decoded.get(&key) {
            inner.stats.decoded_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data);
        }
        let rx = {
            let mut queue = inner.lock();
            if let Some(data) = inner.decoded.get(&key) {
                inner.stats.decoded_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(data);
            }
            match queue.packet_waiters.get(&key) {
                Some(tx) => {
                    inner.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    tx.subscribe()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    queue.packet_waiters.insert(key.clone(), tx);
                    queue.packet_queue.push_back(PacketJob {
                        key,
                        info: info.clone(),
                    });
                    inner.notify.notify_one();
                    rx
                }
            }
        };
        wait(rx).await
    }

    /// Raw bytes, type and resolved references of one stored node.
    pub async fn read_node_data(&self, locator: &NodeLocator) -> StorageResult<NodeData> {
        let info = self.bundle_info(&locator.blob).await?;
        let index = locator.export_index;
        let export = info.export(index)?;
        let span = info.span(index)?;
        let packet = self.packet(&info, span.packet).await?;
        let end = span.offset + span.length;
        if end > packet.len() {
            return Err(StorageError::Consistency(format!(
                "{locator}: export ends at {end} but its packet decodes to {} bytes",
                packet.len()
            )));
        }
        let data = packet.slice(span.offset..end);
        if ContentHash::of(&data) != export.hash {
            return Err(StorageError::Consistency(format!(
                "{locator}: content does not match hash {}",
                export.hash.short_hex()
            )));
        }
        Ok(NodeData {
            hash: export.hash,
            node_type: info.node_type(index)?,
            data,
            refs: info.export_refs(index)?,
        })
    }

    /// Read and decode the node a handle points at. Waits for a pending
    /// handle's bundle to be written first.
    pub async fn read_node(&self, handle: &NodeHandle) -> StorageResult<Box<dyn TreeNode>> {
        let locator = handle
            .wait_for_locator()
            .await
            .map_err(|reason| StorageError::BundleWriteFailed { reason })?;
        let data = self.read_node_data(&locator).await?;
        if data.hash != handle.hash() {
            return Err(StorageError::Consistency(format!(
                "{locator} holds {} but the handle expects {}",
                data.hash.short_hex(),
                handle.hash().short_hex()
            )));
        }
        self.inner().registry.decode(&data)
    }
}

impl std::fmt::Debug for TreeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeReader")
            .field("workers", &self.shared.workers.len())
            .field("stats", &self.stats())
            .finish()
    }
}

async fn wait<T: Clone>(mut rx: watch::Receiver<Option<StorageResult<T>>>) -> StorageResult<T> {
    let result = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| StorageError::Backend(BackendError::Other("reader shut down".into())))?;
    match result.as_ref() {
        Some(result) => result.clone(),
        None => Err(StorageError::Backend(BackendError::Other(
            "fetch completed without a result".into(),
        ))),
    }
}

async fn run_worker(inner: Arc<ReaderInner>, worker: usize) {
    trace!(worker, "reader worker started");
    loop {
        match inner.next_job() {
            Some(Job::Header(blob)) => {
                let result = inner.fetch_header(&blob).await;
                inner.complete_header(blob, result);
            }
            Some(Job::Packets { info, first, last }) => {
                let result = inner.fetch_packets(&info, first, last).await;
                inner.complete_packets(&info, first, last, result);
            }
            None => inner.notify.notified().await,
        }
    }
}

impl ReaderInner {
    // Queue state is metadata only; it stays usable if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_job(&self) -> Option<Job> {
        let mut guard = self.lock();
        let queue = &mut *guard;

        let job = if let Some(pos) = queue
            .header_queue
            .iter()
            .position(|blob| !queue.active_blobs.contains(blob))
        {
            let blob = queue.header_queue.remove(pos)?;
            queue.active_blobs.insert(blob.clone());
            Job::Header(blob)
        } else {
            let pos = queue
                .packet_queue
                .iter()
                .position(|job| !queue.active_blobs.contains(&job.key.blob))?;
            let job = queue.packet_queue.remove(pos)?;
            let blob = job.key.blob.clone();
            let (mut first, mut last) = (job.key.packet, job.key.packet);

            // Merge queued neighbours of the same blob into one range read.
            loop {
                let next = queue.packet_queue.iter().position(|other| {
                    other.key.blob == blob
                        && (other.key.packet + 1 == first || other.key.packet == last + 1)
                });
                let Some(next) = next else { break };
                let packet = queue.packet_queue[next].key.packet;
                let (lo, hi) = (first.min(packet), last.max(packet));
                if job.info.packet_range(lo, hi).1 > self.options.max_fetch_size {
                    break;
                }
                queue.packet_queue.remove(next);
                first = lo;
                last = hi;
            }
            if last > first {
                trace!(blob = %blob, first, last, "merged packet reads");
            }
            queue.active_blobs.insert(blob);
            Job::Packets {
                info: job.info,
                first,
                last,
            }
        };

        if !queue.header_queue.is_empty() || !queue.packet_queue.is_empty() {
            self.notify.notify_one();
        }
        Some(job)
    }

    async fn fetch_header(&self, blob: &BlobLocator) -> StorageResult<Arc<BundleInfo>> {
        let prefetch = self.options.header_prefetch_size;
        let prefix = self.backend.read_blob_range(blob, 0, prefetch).await?;
        self.stats.header_reads.fetch_add(1, Ordering::Relaxed);

        let header_len = BundleHeader::read_prelude(&prefix)?;
        let header_bytes = if header_len > prefix.len() {
            debug!(blob = %blob, header_len, prefetch, "header exceeds prefetch window");
            self.stats.second_header_reads.fetch_add(1, Ordering::Relaxed);
            self.backend.read_blob_range(blob, 0, header_len).await?
        } else {
            prefix.clone()
        };
        let header = BundleHeader::decode(&header_bytes)?;
        let limit = self.options.max_decoded_packet_size;
        if let Some((index, packet)) = header
            .packets
            .iter()
            .enumerate()
            .find(|(_, packet)| packet.decoded_length > limit)
        {
            return Err(BundleError::Corrupt(format!(
                "{blob}: packet {index} declares {} decoded bytes, above the {limit} byte limit",
                packet.decoded_length
            ))
            .into());
        }
        let info = Arc::new(BundleInfo::new(blob.clone(), header, header_len)?);

        for packet in info.packets_within(prefix.len()) {
            let (offset, len) = info.packet_range(packet, packet);
            self.encoded
                .insert(PacketKey::new(blob, packet), prefix.slice(offset..offset + len));
        }
        trace!(
            blob = %blob,
            header_len,
            exports = info.export_count(),
            packets = info.packet_count(),
            "fetched bundle header"
        );
        Ok(info)
    }

    fn complete_header(&self, blob: BlobLocator, result: StorageResult<Arc<BundleInfo>>) {
        if let Ok(info) = &result {
            self.headers.insert(blob.clone(), info.clone());
        }
        let mut queue = self.lock();
        queue.active_blobs.remove(&blob);
        if let Some(tx) = queue.header_waiters.remove(&blob) {
            tx.send_replace(Some(result));
        }
        if !queue.packet_queue.is_empty() || !queue.header_queue.is_empty() {
            self.notify.notify_one();
        }
    }

    async fn fetch_packets(
        &self,
        info: &BundleInfo,
        first: usize,
        last: usize,
    ) -> StorageResult<Vec<Bytes>> {
        let blob = &info.locator;
        let mut encoded: Vec<Option<Bytes>> = (first..=last)
            .map(|packet| self.encoded.get(&PacketKey::new(blob, packet)))
            .collect();
        let hits = encoded.iter().filter(|body| body.is_some()).count();
        self.stats
            .encoded_hits
            .fetch_add(hits as u64, Ordering::Relaxed);

        let missing_lo = encoded.iter().position(Option::is_none);
        let missing_hi = encoded.iter().rposition(Option::is_none);
        if let (Some(lo), Some(hi)) = (missing_lo, missing_hi) {
            let (offset, len) = info.packet_range(first + lo, first + hi);
            let bytes = self.backend.read_blob_range(blob, offset, len).await?;
            self.stats.packet_reads.fetch_add(1, Ordering::Relaxed);
            if bytes.len() < len {
                return Err(BundleError::Truncated {
                    offset: offset + bytes.len(),
                    context: "bundle packets",
                }
                .into());
            }
            trace!(blob = %blob, offset, len, packets = hi - lo + 1, "read packets");
            for i in lo..=hi {
                let (start, size) = info.packet_range(first + i, first + i);
                let body = bytes.slice(start - offset..start - offset + size);
                self.encoded
                    .insert(PacketKey::new(blob, first + i), body.clone());
                encoded[i].get_or_insert(body);
            }
        }

        let compression = info.header.compression;
        let mut decoded = Vec::with_capacity(encoded.len());
        for (i, body) in encoded.into_iter().enumerate() {
            let packet = first + i;
            let body = body.ok_or_else(|| {
                StorageError::Consistency(format!("{blob}: packet {packet} was not fetched"))
            })?;
            let decoded_len = info.header.packets[packet].decoded_length;
            let data = tokio::task::spawn_blocking(move || -> StorageResult<Bytes> {
                let mut out = vec![0u8; decoded_len];
                decompress(compression, &body, &mut out)?;
                Ok(Bytes::from(out))
            })
            .await
            .map_err(|e| {
                StorageError::Consistency(format!("packet decode task failed: {e}"))
            })??;
            self.decoded
                .insert(PacketKey::new(blob, packet), data.clone());
            decoded.push(data);
        }
        Ok(decoded)
    }

    fn complete_packets(
        &self,
        info: &BundleInfo,
        first: usize,
        last: usize,
        result: StorageResult<Vec<Bytes>>,
    ) {
        let mut queue = self.lock();
        queue.active_blobs.remove(&info.locator);
        for packet in first..=last {
            let key = PacketKey::new(&info.locator, packet);
            let Some(tx) = queue.packet_waiters.remove(&key) else {
                continue;
            };
            let outcome = match &result {
                Ok(decoded) => Ok(decoded[packet - first].clone()),
                Err(err) => Err(err.clone()),
            };
            tx.send_replace(Some(outcome));
        }
        if !queue.packet_queue.is_empty() || !queue.header_queue.is_empty() {
            self.notify.notify_one();
        }
    }
}
