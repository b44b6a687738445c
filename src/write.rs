//! Block-aligned voxel writes.
//!
//! A PUT fans one chunk task per intersecting block, gated by a counted
//! semaphore sized at startup. Each task persists its block and emits
//! exactly one block change onto the aggregation channel; the aggregator
//! folds those into per-label diffs and routes them to the label shards.

use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::block::Block;
use crate::config::Config;
use crate::envelope::{self, Checksum, Compression};
use crate::error::Result;
use crate::events::{next_mutation_id, BlockEvent, SyncBus};
use crate::geom::{BlockCoord, Point3d};
use crate::keys::{self, InstanceId, VersionId};
use crate::labelidx::{aggregate_block_changes, BlockChange, LabelIndexer};
use crate::mapping::LabelMapping;
use crate::store::{KeyStore, RequestBuffer};
use crate::version::{VersionDag, VersionedCtx};
use crate::{errdata, errinput};

/// A subvolume of 64-bit labels in ZYX order (Z major, then Y, then X).
#[derive(Clone, Debug)]
pub struct Subvolume {
    offset: Point3d,
    size: Point3d,
    data: Vec<u64>,
}

impl Subvolume {
    pub fn new(offset: Point3d, size: Point3d, data: Vec<u64>) -> Result<Self> {
        if size.x() <= 0 || size.y() <= 0 || size.z() <= 0 {
            return errinput!("invalid subvolume size {size}");
        }
        if data.len() as i64 != size.prod() {
            return errinput!("{} voxels do not fill subvolume of size {size}", data.len());
        }
        Ok(Subvolume { offset, size, data })
    }

    pub fn offset(&self) -> Point3d {
        self.offset
    }

    pub fn size(&self) -> Point3d {
        self.size
    }

    /// Maximum voxel coordinate covered, inclusive.
    pub fn end_point(&self) -> Point3d {
        Point3d([
            self.offset.x() + self.size.x() - 1,
            self.offset.y() + self.size.y() - 1,
            self.offset.z() + self.size.z() - 1,
        ])
    }

    /// True if both offset and size are multiples of the block dimensions.
    pub fn is_block_aligned(&self, block_size: Point3d) -> bool {
        (0..3).all(|i| {
            self.offset.0[i] % block_size.0[i] == 0 && self.size.0[i] % block_size.0[i] == 0
        })
    }

    /// Every block intersecting the subvolume, in ZYX order.
    pub fn block_range(&self, block_size: Point3d) -> Vec<BlockCoord> {
        let min = self.offset.block_coord(block_size);
        let max = self.end_point().block_coord(block_size);
        let mut blocks = Vec::new();
        for z in min.z()..=max.z() {
            for y in min.y()..=max.y() {
                for x in min.x()..=max.x() {
                    blocks.push(BlockCoord::new(x, y, z));
                }
            }
        }
        blocks
    }

    /// Copies the voxels of one fully-covered block out of the subvolume.
    pub fn extract_block(&self, coord: BlockCoord, block_size: Point3d) -> Vec<u64> {
        let min = coord.min_point(block_size);
        let (nx, ny) = (self.size.x() as i64, self.size.y() as i64);
        let mut out = Vec::with_capacity(block_size.prod() as usize);
        for bz in 0..block_size.z() {
            let z = (min.z() + bz - self.offset.z()) as i64;
            for by in 0..block_size.y() {
                let y = (min.y() + by - self.offset.y()) as i64;
                let row = ((z * ny + y) * nx + (min.x() - self.offset.x()) as i64) as usize;
                out.extend_from_slice(&self.data[row..row + block_size.x() as usize]);
            }
        }
        out
    }
}

/// Counted semaphore gating concurrent block-chunk tasks across the mutation
/// and sparse-volume pipelines. Sized once at startup.
pub struct HandlerTokens {
    available: Mutex<usize>,
    released: Condvar,
}

impl HandlerTokens {
    pub fn new(count: usize) -> Self {
        HandlerTokens {
            available: Mutex::new(count.max(1)),
            released: Condvar::new(),
        }
    }

    /// Blocks until a token is free, returning a guard that releases it.
    pub fn acquire(self: &Arc<Self>) -> TokenGuard {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.released.wait(available).unwrap();
        }
        *available -= 1;
        TokenGuard {
            tokens: self.clone(),
        }
    }

    fn release(&self) {
        *self.available.lock().unwrap() += 1;
        self.released.notify_one();
    }
}

pub struct TokenGuard {
    tokens: Arc<HandlerTokens>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.tokens.release();
    }
}

/// A versioned label-block data instance: block storage plus the per-label
/// index pipeline.
pub struct LabelData<S: KeyStore> {
    pub(crate) name: String,
    pub(crate) instance: InstanceId,
    pub(crate) config: Config,
    pub(crate) store: Arc<S>,
    pub(crate) dag: Arc<VersionDag>,
    pub(crate) tokens: Arc<HandlerTokens>,
    // Only one voxel PUT admitted at a time, although each PUT starts many
    // chunk workers.
    spawn_mutex: Mutex<()>,
    indexer: LabelIndexer,
    bus: Arc<SyncBus>,
    mapping: RwLock<Option<Arc<dyn LabelMapping>>>,
}

impl<S: KeyStore> LabelData<S> {
    pub fn new(
        name: impl Into<String>,
        instance: InstanceId,
        store: Arc<S>,
        dag: Arc<VersionDag>,
        config: Config,
    ) -> Self {
        let indexer = LabelIndexer::start(
            store.clone(),
            dag.clone(),
            instance,
            config.num_label_handlers,
            config.meta_cache_size,
        );
        LabelData {
            name: name.into(),
            instance,
            tokens: Arc::new(HandlerTokens::new(config.handler_tokens)),
            config,
            store,
            dag,
            spawn_mutex: Mutex::new(()),
            indexer,
            bus: Arc::new(SyncBus::new()),
            mapping: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> Point3d {
        self.config.block_size
    }

    pub fn bus(&self) -> &SyncBus {
        &self.bus
    }

    /// Attaches the external merge mapping service.
    pub fn set_mapping(&self, mapping: Arc<dyn LabelMapping>) {
        *self.mapping.write().unwrap() = Some(mapping);
    }

    pub(crate) fn mapping(&self) -> Option<Arc<dyn LabelMapping>> {
        self.mapping.read().unwrap().clone()
    }

    pub(crate) fn ctx(&self, version: VersionId) -> VersionedCtx<S> {
        VersionedCtx::new(self.dag.clone(), self.store.clone(), self.instance, version)
    }

    /// Ingests voxels from a subvolume, assuming no prior block values.
    /// Re-ingesting the same coordinates double-counts voxel deltas; the
    /// pipeline does not deduplicate ingests (use `mutate_voxels` when a
    /// prior value may exist).
    pub fn ingest_voxels(&self, version: VersionId, vox: Subvolume) -> Result<()> {
        self.put_voxels(version, vox, false)
    }

    /// Mutates voxels from a subvolume, reading prior blocks so subscribers
    /// see old and new values and voxel deltas stay exact.
    pub fn mutate_voxels(&self, version: VersionId, vox: Subvolume) -> Result<()> {
        self.put_voxels(version, vox, true)
    }

    fn put_voxels(&self, version: VersionId, vox: Subvolume, mutate: bool) -> Result<()> {
        let block_size = self.config.block_size;
        if !vox.is_block_aligned(block_size) {
            return errinput!(
                "cannot store voxels in non-block-aligned geometry {} -> {}",
                vox.offset(),
                vox.end_point()
            );
        }
        self.dag.ancestors(version)?;

        // Only one request at a time.
        let _admit = self.spawn_mutex.lock()?;

        let mut_id = next_mutation_id();
        let vox = Arc::new(vox);
        let blocks = vox.block_range(block_size);
        tracing::debug!(
            data = %self.name,
            mutation = mut_id,
            blocks = blocks.len(),
            "starting voxel put"
        );

        let (change_tx, change_rx) = mpsc::sync_channel(self.config.block_change_buffer);
        let shards = self.indexer.senders();
        let aggregator = thread::spawn(move || aggregate_block_changes(version, change_rx, shards));

        let buffer = self
            .store
            .request_buffer()
            .map(|b| Arc::new(Mutex::new(b)));

        let mut chunks = Vec::with_capacity(blocks.len());
        for coord in blocks {
            let token = self.tokens.acquire();
            let op = PutOperation {
                store: self.store.clone(),
                dag: self.dag.clone(),
                instance: self.instance,
                version,
                block_size,
                coord,
                vox: vox.clone(),
                mutate,
                mut_id,
                change_tx: change_tx.clone(),
                bus: self.bus.clone(),
                buffer: buffer.clone(),
                _token: token,
            };
            chunks.push(thread::spawn(move || op.run()));
        }

        let mut waiters = Vec::new();
        for chunk in chunks {
            if let Ok(Some(waiter)) = chunk.join() {
                waiters.push(waiter);
            }
        }

        // Flush buffered writes, firing completion callbacks; block changes
        // and sync events are emitted only once writes are durable.
        if let Some(buffer) = &buffer {
            buffer.lock()?.flush()?;
        }
        for waiter in waiters {
            waiter.join().ok();
        }

        drop(change_tx);
        aggregator.join().ok();

        tracing::debug!(data = %self.name, mutation = mut_id, "done with voxel put");
        Ok(())
    }

    /// The decoded label volume of one block, None if the block is absent at
    /// this version.
    pub fn get_block_volume(&self, version: VersionId, coord: BlockCoord) -> Result<Option<Vec<u64>>> {
        let ctx = self.ctx(version);
        let Some(serialization) = ctx.get(&keys::block_tkey(coord))? else {
            return Ok(None);
        };
        let raw = envelope::deserialize_data(&serialization, true)?;
        let block = Block::decode(&raw)?;
        Ok(Some(block.make_label_volume()))
    }

    /// The label stored at one voxel position, 0 if unset.
    pub fn label_at_point(&self, version: VersionId, p: Point3d) -> Result<u64> {
        let block_size = self.config.block_size;
        let coord = p.block_coord(block_size);
        let Some(volume) = self.get_block_volume(version, coord)? else {
            return Ok(0);
        };
        let min = coord.min_point(block_size);
        let idx = ((p.z() - min.z()) as i64 * block_size.y() as i64
            + (p.y() - min.y()) as i64)
            * block_size.x() as i64
            + (p.x() - min.x()) as i64;
        volume
            .get(idx as usize)
            .copied()
            .ok_or_else(|| crate::error::Error::InvalidData(format!("voxel {p} outside block {coord}")))
    }

    /// Blocks until every label-index update routed before this call has
    /// settled. Tests and callers needing read-your-writes use this.
    pub fn sync_indexes(&self) {
        self.indexer.sync();
    }
}

/// One block-chunk task of an in-flight PUT.
struct PutOperation<S: KeyStore> {
    store: Arc<S>,
    dag: Arc<VersionDag>,
    instance: InstanceId,
    version: VersionId,
    block_size: Point3d,
    coord: BlockCoord,
    vox: Arc<Subvolume>,
    mutate: bool,
    mut_id: u64,
    change_tx: SyncSender<BlockChange>,
    bus: Arc<SyncBus>,
    buffer: Option<Arc<Mutex<Box<dyn RequestBuffer>>>>,
    _token: TokenGuard,
}

impl<S: KeyStore> PutOperation<S> {
    /// Persists the block and emits its change. On the buffered path a
    /// waiter thread is returned; it emits once the write is durable. On any
    /// failure the block's change is omitted and the remaining pipeline
    /// continues, leaving accounting drift.
    fn run(self) -> Option<JoinHandle<()>> {
        let coord = self.coord;
        let new_volume = Arc::new(self.vox.extract_block(coord, self.block_size));

        let old = if self.mutate {
            match self.old_block(coord) {
                Ok(old) => old,
                Err(e) => {
                    tracing::error!(block = %coord, error = %e, "unable to load previous block");
                    return None;
                }
            }
        } else {
            None
        };

        let new_block = match Block::from_label_volume(self.block_size, &new_volume) {
            Ok(block) => block,
            Err(e) => {
                tracing::error!(block = %coord, error = %e, "unable to build label block");
                return None;
            }
        };
        let serialization = match envelope::serialize_data(
            &new_block.encode(),
            Compression::Lz4,
            Checksum::Crc32,
        ) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(block = %coord, error = %e, "unable to serialize block");
                return None;
            }
        };

        let (old_labels, old_volume) = match &old {
            Some((labels, volume)) => (Some(labels.as_slice()), Some(volume.clone())),
            None => (None, None),
        };
        let change = BlockChange::compute(
            coord,
            old_labels,
            old_volume.as_ref().map(|v| v.as_slice()),
            new_block.labels(),
            &new_volume,
        );
        let event = if self.mutate {
            BlockEvent::Mutate {
                block: coord,
                prev: old_volume,
                data: new_volume,
                mutation: self.mut_id,
            }
        } else {
            BlockEvent::Ingest {
                block: coord,
                data: new_volume,
                mutation: self.mut_id,
            }
        };

        let key = keys::DataContext::new(self.instance, self.version)
            .construct_key(&keys::block_tkey(coord));

        match &self.buffer {
            Some(buffer) => {
                let (ready_tx, ready_rx) = mpsc::channel();
                buffer.lock().unwrap().put_callback(key, serialization, ready_tx);
                let change_tx = self.change_tx.clone();
                let bus = self.bus.clone();
                Some(thread::spawn(move || match ready_rx.recv() {
                    Ok(Ok(())) => {
                        change_tx.send(change).ok();
                        bus.publish(&event);
                    }
                    Ok(Err(e)) => {
                        tracing::error!(block = %coord, error = %e, "unable to put voxel data")
                    }
                    Err(_) => {
                        tracing::error!(block = %coord, "write buffer dropped before completion")
                    }
                }))
            }
            None => {
                if let Err(e) = self.store.put(&key, serialization) {
                    tracing::error!(block = %coord, error = %e, "unable to put voxel data");
                    return None;
                }
                self.change_tx.send(change).ok();
                self.bus.publish(&event);
                None
            }
        }
    }

    /// Loads the prior block's labels and voxel volume, None if absent.
    #[allow(clippy::type_complexity)]
    fn old_block(&self, coord: BlockCoord) -> Result<Option<(Vec<u64>, Arc<Vec<u64>>)>> {
        let ctx = VersionedCtx::new(
            self.dag.clone(),
            self.store.clone(),
            self.instance,
            self.version,
        );
        let Some(serialization) = ctx.get(&keys::block_tkey(coord))? else {
            return Ok(None);
        };
        let raw = envelope::deserialize_data(&serialization, true)?;
        let block = Block::decode(&raw)?;
        if block.size() != self.block_size {
            return errdata!("prior block {coord} has size {}", block.size());
        }
        Ok(Some((
            block.labels().to_vec(),
            Arc::new(block.make_label_volume()),
        )))
    }
}
