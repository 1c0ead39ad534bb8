//! Tree writer: packs nodes into bundles and writes them in the background.
//!
//! Each bundle moves through accumulating, sealed, writing and complete.
//! While accumulating, node bytes fill a packet buffer; a full packet is
//! compressed on the blocking pool while the next one fills. A bundle seals
//! once it holds more than `max_blob_size` uncompressed bytes or when the
//! writer is flushed. A sealed bundle is finished by its own task, which
//! awaits its packets in order, then every bundle it imports from, and only
//! then assembles the header and writes the blob. Import tables therefore
//! only ever name blobs that already exist.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_bundle::{
    compress, BundleExport, BundleHeader, BundleImport, BundlePacket, BundleVersion,
    CompressionFormat,
};
use arbor_storage::StorageBackend;
use arbor_types::{
    write_signal, BlobLocator, ContentHash, NodeHandle, NodeKey, NodeLocator, NodeType,
    WriteSignal, WriteSignalSender,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::WriterOptions;
use crate::error::{StorageError, StorageResult};
use crate::node::NodeWriter;
use crate::node_cache::NodeCache;
use crate::node_ref::TreeNodeRef;

/// Name hint passed to the backend for bundle blobs.
pub const DEFAULT_NAME_HINT: &str = "bundles";

#[derive(Debug, Default)]
struct AtomicWriterStats {
    nodes_admitted: AtomicU64,
    dedup_hits: AtomicU64,
    bundles_written: AtomicU64,
    bytes_written: AtomicU64,
}

impl AtomicWriterStats {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            nodes_admitted: self.nodes_admitted.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            bundles_written: self.bundles_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Counters for one writer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Nodes added to a bundle.
    pub nodes_admitted: u64,
    /// Writes answered by the node cache.
    pub dedup_hits: u64,
    pub bundles_written: u64,
    /// Blob bytes handed to the backend.
    pub bytes_written: u64,
}

struct PendingExport {
    type_index: usize,
    hash: ContentHash,
    length: usize,
    refs: Vec<NodeHandle>,
    alias: Option<String>,
    handle: NodeHandle,
}

type PacketTask = JoinHandle<StorageResult<Bytes>>;

/// A bundle that is still admitting nodes.
struct PendingBundle {
    sender: WriteSignalSender,
    signal: WriteSignal,
    compression: CompressionFormat,
    types: Vec<NodeType>,
    type_indices: HashMap<NodeType, usize>,
    exports: Vec<PendingExport>,
    /// Export index by locator slot identity: which handles belong to this
    /// bundle. Keyed by identity, not hash, so equal content admitted under
    /// two slots never aliases.
    local_exports: HashMap<usize, usize>,
    buffer: Vec<u8>,
    /// Decoded length and compression task of every closed packet, in order.
    packets: Vec<(usize, PacketTask)>,
    dependencies: HashMap<u64, WriteSignal>,
    uncompressed_len: usize,
}

impl PendingBundle {
    fn new(compression: CompressionFormat) -> Self {
        let (sender, signal) = write_signal();
        Self {
            sender,
            signal,
            compression,
            types: Vec::new(),
            type_indices: HashMap::new(),
            exports: Vec::new(),
            local_exports: HashMap::new(),
            buffer: Vec::new(),
            packets: Vec::new(),
            dependencies: HashMap::new(),
            uncompressed_len: 0,
        }
    }

    fn id(&self) -> u64 {
        self.sender.bundle_id()
    }

    fn type_index(&mut self, node_type: NodeType) -> usize {
        if let Some(&index) = self.type_indices.get(&node_type) {
            return index;
        }
        let index = self.types.len();
        self.types.push(node_type);
        self.type_indices.insert(node_type, index);
        index
    }

    fn admit(
        &mut self,
        node_type: NodeType,
        hash: ContentHash,
        data: &[u8],
        refs: &[NodeHandle],
        alias: Option<&str>,
        options: &WriterOptions,
    ) -> NodeHandle {
        let type_index = self.type_index(node_type);
        let export_index = self.exports.len();
        let handle = NodeHandle::pending(hash, self.signal.clone(), export_index);

        for child in refs {
            if local_index(&self.local_exports, self.id(), child).is_some() {
                continue;
            }
            if let Some(signal) = child.pending_signal() {
                self.dependencies
                    .entry(signal.bundle_id())
                    .or_insert_with(|| signal.clone());
            }
        }

        self.local_exports.insert(handle.slot_id(), export_index);
        self.exports.push(PendingExport {
            type_index,
            hash,
            length: data.len(),
            refs: refs.to_vec(),
            alias: alias.map(str::to_owned),
            handle: handle.clone(),
        });
        self.append(data, options);
        handle
    }

    fn append(&mut self, data: &[u8], options: &WriterOptions) {
        let packetized = self.compression != CompressionFormat::None;
        if packetized
            && !self.buffer.is_empty()
            && self.buffer.len() + data.len() > options.max_packet_size
        {
            self.close_packet();
        }
        self.buffer.extend_from_slice(data);
        self.uncompressed_len += data.len();
        if packetized && self.buffer.len() >= options.min_packet_size {
            self.close_packet();
        }
    }

    fn close_packet(&mut self) {
        let data = std::mem::take(&mut self.buffer);
        let decoded_len = data.len();
        let format = self.compression;
        let bundle = self.id();
        let packet = self.packets.len();
        let task = tokio::task::spawn_blocking(move || -> StorageResult<Bytes> {
            let encoded = compress(format, &data)?;
            debug!(bundle, packet, decoded = decoded_len, encoded = encoded.len(), "compressed packet");
            Ok(Bytes::from(encoded))
        });
        self.packets.push((decoded_len, task));
    }

    /// Close the last packet and hand everything needed to finish the bundle
    /// to a job. Returns `None` for a bundle with no exports.
    fn into_job(
        mut self,
        backend: Arc<dyn StorageBackend>,
        name_hint: Arc<str>,
        stats: Arc<AtomicWriterStats>,
    ) -> Option<(WriteSignalSender, BundleJob)> {
        if self.exports.is_empty() {
            return None;
        }
        if !self.buffer.is_empty() || self.packets.is_empty() {
            self.close_packet();
        }
        let job = BundleJob {
            bundle: self.id(),
            backend,
            name_hint,
            stats,
            compression: self.compression,
            types: self.types,
            exports: self.exports,
            local_exports: self.local_exports,
            packets: self.packets,
            dependencies: self.dependencies.into_values().collect(),
        };
        Some((self.sender, job))
    }
}

/// Export index of `handle` in bundle `bundle`, if it is one of its exports.
fn local_index(local: &HashMap<usize, usize>, bundle: u64, handle: &NodeHandle) -> Option<usize> {
    if let Some(&index) = local.get(&handle.slot_id()) {
        return Some(index);
    }
    match handle.pending_signal() {
        Some(signal) if signal.bundle_id() == bundle => handle.pending_export_index(),
        _ => None,
    }
}

/// Everything a sealed bundle needs to be written.
struct BundleJob {
    bundle: u64,
    backend: Arc<dyn StorageBackend>,
    name_hint: Arc<str>,
    stats: Arc<AtomicWriterStats>,
    compression: CompressionFormat,
    types: Vec<NodeType>,
    exports: Vec<PendingExport>,
    local_exports: HashMap<usize, usize>,
    packets: Vec<(usize, PacketTask)>,
    dependencies: Vec<WriteSignal>,
}

enum RefSlot {
    Local(usize),
    Import { import: usize, position: usize },
}

async fn finish_bundle(sender: WriteSignalSender, job: BundleJob) -> StorageResult<BlobLocator> {
    let bundle = job.bundle;
    match write_bundle(job).await {
        Ok(locator) => {
            sender.complete(locator.clone());
            Ok(locator)
        }
        Err(err) => {
            warn!(bundle, error = %err, "bundle write failed");
            sender.fail(err.to_string());
            Err(err)
        }
    }
}

async fn write_bundle(job: BundleJob) -> StorageResult<BlobLocator> {
    let BundleJob {
        bundle,
        backend,
        name_hint,
        stats,
        compression,
        types,
        exports,
        local_exports,
        packets,
        dependencies,
    } = job;

    let mut packet_table = Vec::with_capacity(packets.len());
    let mut bodies = Vec::with_capacity(packets.len());
    for (decoded_length, task) in packets {
        let body = task.await.map_err(|e| StorageError::BundleWriteFailed {
            reason: format!("packet compression task failed: {e}").into(),
        })??;
        packet_table.push(BundlePacket {
            encoded_length: body.len(),
            decoded_length,
        });
        bodies.push(body);
    }

    for dependency in &dependencies {
        trace!(bundle, dependency = dependency.bundle_id(), "waiting for dependency");
        dependency
            .wait()
            .await
            .map_err(|reason| StorageError::DependencyFailed { reason })?;
    }

    // Reference table: imported exports grouped by blob in first-use order,
    // followed by this bundle's own exports.
    let mut imports: Vec<BundleImport> = Vec::new();
    let mut import_by_blob: HashMap<BlobLocator, usize> = HashMap::new();
    let mut import_positions: HashMap<NodeLocator, usize> = HashMap::new();
    let mut slots: Vec<Vec<RefSlot>> = Vec::with_capacity(exports.len());
    for export in &exports {
        let mut export_slots = Vec::with_capacity(export.refs.len());
        for child in &export.refs {
            if let Some(index) = local_index(&local_exports, bundle, child) {
                export_slots.push(RefSlot::Local(index));
                continue;
            }
            let locator = child.locator().ok_or_else(|| {
                StorageError::Consistency(format!(
                    "node {} is referenced before its bundle was written",
                    child.hash().short_hex()
                ))
            })?;
            let import = *import_by_blob.entry(locator.blob.clone()).or_insert_with(|| {
                imports.push(BundleImport {
                    locator: locator.blob.clone(),
                    exports: Vec::new(),
                });
                imports.len() - 1
            });
            let position = match import_positions.get(&locator) {
                Some(&position) => position,
                None => {
                    let list = &mut imports[import].exports;
                    list.push(locator.export_index);
                    let position = list.len() - 1;
                    import_positions.insert(locator, position);
                    position
                }
            };
            export_slots.push(RefSlot::Import { import, position });
        }
        slots.push(export_slots);
    }

    let mut import_base = Vec::with_capacity(imports.len());
    let mut import_count = 0;
    for import in &imports {
        import_base.push(import_count);
        import_count += import.exports.len();
    }

    let header_exports = exports
        .iter()
        .zip(slots)
        .map(|(export, slots)| BundleExport {
            type_index: export.type_index,
            hash: export.hash,
            length: export.length,
            references: slots
                .into_iter()
                .map(|slot| match slot {
                    RefSlot::Local(index) => import_count + index,
                    RefSlot::Import { import, position } => import_base[import] + position,
                })
                .collect(),
            alias: export.alias.clone(),
        })
        .collect();

    let header = BundleHeader {
        version: BundleVersion::LATEST,
        compression,
        types,
        imports,
        exports: header_exports,
        packets: packet_table,
    };
    let mut blob = header.encode()?;
    for body in &bodies {
        blob.extend_from_slice(body);
    }
    let len = blob.len();

    let locator = backend
        .write_blob(Bytes::from(blob), Some(name_hint.as_ref()))
        .await?;
    stats.bundles_written.fetch_add(1, Ordering::Relaxed);
    stats.bytes_written.fetch_add(len as u64, Ordering::Relaxed);

    // Aliases are registered before any handle resolves, so a failed
    // registration leaves the whole bundle failed and unresolved.
    for (index, export) in exports.iter().enumerate() {
        if let Some(alias) = &export.alias {
            let target = NodeHandle::new(export.hash, locator.node(index));
            backend.add_alias(alias, &target).await?;
        }
    }
    for (index, export) in exports.iter().enumerate() {
        export.handle.resolve(locator.node(index))?;
    }

    info!(
        bundle,
        blob = %locator,
        exports = exports.len(),
        imports = header.imports.len(),
        bytes = len,
        "wrote bundle"
    );
    Ok(locator)
}

struct InFlightBundle {
    id: u64,
    bytes: usize,
    task: JoinHandle<StorageResult<BlobLocator>>,
}

/// Writes nodes into bundles.
///
/// A writer is meant for one producer; independent writers may share a
/// backend and a [`NodeCache`] and run concurrently. Must be used inside a
/// tokio runtime.
pub struct TreeWriter {
    backend: Arc<dyn StorageBackend>,
    cache: Arc<NodeCache>,
    options: WriterOptions,
    name_hint: Arc<str>,
    current: Option<PendingBundle>,
    in_flight: VecDeque<InFlightBundle>,
    /// Still-pending bundles that dedup hits returned handles from.
    reused: HashMap<u64, WriteSignal>,
    /// Aliases requested on dedup hits, registered once the target is written.
    deferred_aliases: Vec<(String, NodeHandle)>,
    /// First failure seen; the session is failed from then on.
    failure: Option<StorageError>,
    stats: Arc<AtomicWriterStats>,
}

impl TreeWriter {
    /// A writer that dedups against `cache`, which may be shared with other
    /// writers on the same backend.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        cache: Arc<NodeCache>,
        options: WriterOptions,
    ) -> Self {
        Self {
            backend,
            cache,
            options,
            name_hint: Arc::from(DEFAULT_NAME_HINT),
            current: None,
            in_flight: VecDeque::new(),
            reused: HashMap::new(),
            deferred_aliases: Vec::new(),
            failure: None,
            stats: Arc::new(AtomicWriterStats::default()),
        }
    }

    /// Name hint handed to the backend with every bundle blob.
    pub fn with_name_hint(mut self, name_hint: impl Into<Arc<str>>) -> Self {
        self.name_hint = name_hint.into();
        self
    }

    /// Packing and back-pressure settings this writer was built with.
    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Counters accumulated since the writer was created.
    pub fn stats(&self) -> WriterStats {
        self.stats.snapshot()
    }

    /// Signal of the bundle currently admitting nodes, if any.
    pub fn current_bundle(&self) -> Option<WriteSignal> {
        self.current.as_ref().map(|pending| pending.signal.clone())
    }

    /// Number of sealed bundles not yet observed complete.
    pub fn in_flight_bundles(&self) -> usize {
        self.in_flight.len()
    }

    /// Uncompressed bytes held by sealed bundles not yet observed complete.
    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight.iter().map(|bundle| bundle.bytes).sum()
    }

    /// Add one serialized node. `refs` are the handles its payload references,
    /// in positional order. Returns the existing handle when the same bytes
    /// were already written under the same type; an alias given with such a
    /// write is registered for the existing node on the next flush.
    pub async fn write_node(
        &mut self,
        node_type: NodeType,
        data: &[u8],
        refs: &[NodeHandle],
        alias: Option<&str>,
    ) -> StorageResult<NodeHandle> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let hash = ContentHash::of(data);
        let key = NodeKey::new(hash, node_type);
        if let Some(existing) = self.cache.get(&key) {
            self.stats.dedup_hits.fetch_add(1, Ordering::Relaxed);
            trace!(hash = %hash.short_hex(), "node cache hit");
            if let Some(signal) = existing.pending_signal() {
                self.reused
                    .entry(signal.bundle_id())
                    .or_insert_with(|| signal.clone());
            }
            if let Some(alias) = alias {
                self.deferred_aliases.push((alias.to_owned(), existing.clone()));
            }
            return Ok(existing);
        }

        self.wait_for_capacity().await?;

        let compression = self.options.compression;
        let pending = self
            .current
            .get_or_insert_with(|| PendingBundle::new(compression));
        let handle = pending.admit(node_type, hash, data, refs, alias, &self.options);
        let full = pending.uncompressed_len > self.options.max_blob_size;
        self.stats.nodes_admitted.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(key, handle.clone());

        if full {
            self.seal_current();
        }
        Ok(handle)
    }

    /// Write a ref and, first, every dirty ref below it. Clean and collapsed
    /// refs are reused without writing anything. Returns the ref's handle,
    /// which may still be pending.
    pub fn write_ref<'a>(
        &'a mut self,
        node_ref: &'a mut TreeNodeRef,
    ) -> BoxFuture<'a, StorageResult<NodeHandle>> {
        async move {
            if !node_ref.is_dirty() {
                return node_ref.handle.clone().ok_or_else(|| {
                    StorageError::Consistency("tree node ref has neither a node nor a handle".into())
                });
            }
            let node = node_ref.target.as_deref_mut().ok_or_else(|| {
                StorageError::Consistency("dirty tree node ref has no node".into())
            })?;
            for child in node.refs_mut() {
                self.write_ref(child).await?;
            }

            let mut writer = NodeWriter::new();
            node.serialize(&mut writer)?;
            let node_type = node.node_type();
            let alias = node.alias();
            let (data, refs) = writer.into_parts();
            let handle = self
                .write_node(node_type, &data, &refs, alias.as_deref())
                .await?;

            for child in node.refs_mut() {
                child.collapse_written();
            }
            node_ref.set_written(handle.clone());
            Ok(handle)
        }
        .boxed()
    }

    /// Seal the current bundle and wait for every outstanding bundle to be
    /// written, including bundles of other writers whose nodes this writer
    /// reused. Returns the first failure of this writer session.
    pub async fn flush(&mut self) -> StorageResult<()> {
        self.seal_current();
        while let Some(bundle) = self.in_flight.pop_front() {
            if let Err(err) = self.settle(bundle).await {
                debug!(error = %err, "bundle failed during flush");
            }
        }
        for (bundle, signal) in std::mem::take(&mut self.reused) {
            trace!(bundle, "waiting for reused bundle");
            if let Err(reason) = signal.wait().await {
                self.record_failure(StorageError::DependencyFailed { reason });
            }
        }
        for (alias, handle) in std::mem::take(&mut self.deferred_aliases) {
            if self.failure.is_some() {
                break;
            }
            if let Err(err) = self.backend.add_alias(&alias, &handle).await {
                self.record_failure(err.into());
            }
        }
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn seal_current(&mut self) {
        let Some(pending) = self.current.take() else {
            return;
        };
        let id = pending.id();
        let bytes = pending.uncompressed_len;
        let exports = pending.exports.len();
        let dependencies = pending.dependencies.len();
        let Some((sender, job)) =
            pending.into_job(self.backend.clone(), self.name_hint.clone(), self.stats.clone())
        else {
            return;
        };
        debug!(bundle = id, exports, dependencies, bytes, "sealed bundle");
        let task = tokio::spawn(finish_bundle(sender, job));
        self.in_flight.push_back(InFlightBundle { id, bytes, task });
    }

    async fn wait_for_capacity(&mut self) -> StorageResult<()> {
        while self
            .in_flight
            .front()
            .is_some_and(|bundle| bundle.task.is_finished())
        {
            if let Some(bundle) = self.in_flight.pop_front() {
                self.settle(bundle).await?;
            }
        }
        while self.in_flight_bytes() > self.options.max_in_flight_bytes {
            let Some(oldest) = self.in_flight.pop_front() else {
                break;
            };
            debug!(
                bundle = oldest.id,
                in_flight = self.in_flight_bytes() + oldest.bytes,
                "waiting for bundle to drain"
            );
            self.settle(oldest).await?;
        }
        Ok(())
    }

    async fn settle(&mut self, bundle: InFlightBundle) -> StorageResult<BlobLocator> {
        let result = match bundle.task.await {
            Ok(result) => result,
            Err(e) => Err(StorageError::BundleWriteFailed {
                reason: format!("bundle task failed: {e}").into(),
            }),
        };
        if let Err(err) = &result {
            self.record_failure(err.clone());
        }
        result
    }

    fn record_failure(&mut self, err: StorageError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }
}

impl std::fmt::Debug for TreeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeWriter")
            .field("current", &self.current.as_ref().map(|p| p.id()))
            .field("in_flight", &self.in_flight.len())
            .field("failed", &self.failure.is_some())
            .finish()
    }
}
