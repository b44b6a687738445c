//! Per-label block indexing.
//!
//! Meta records are sharded by label although they can be mutated by any
//! block-level change, so all Meta read-modify-writes for one label are
//! routed to a single shard worker. The aggregator folds the block changes
//! of one PUT into per-label diffs before routing; shard ownership replaces
//! per-label locks.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use itertools::Itertools;

use crate::envelope::{self, Checksum, Compression};
use crate::errdata;
use crate::error::Result;
use crate::geom::{BlockCoord, Bounds, IZYX_SIZE};
use crate::keys::{self, InstanceId, VersionId};
use crate::store::KeyStore;
use crate::version::{VersionDag, VersionedCtx};

/// Bit flag for label presence in the old block.
pub const PRESENT_OLD: u8 = 0x01;
/// Bit flag for label presence in the new block.
pub const PRESENT_NEW: u8 = 0x02;

const SHARD_CHANNEL_CAP: usize = 100;

/// High-level overview of all voxels in a label: total voxel count plus the
/// sorted block coordinates the label occupies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    /// Total # of voxels in label.
    pub voxels: u64,
    /// Sorted block coordinates occupied by label.
    pub blocks: Vec<BlockCoord>,
}

impl Meta {
    /// Binary form: 8-byte little-endian voxel count followed by 12-byte
    /// IZYX entries; length implicit from byte count.
    pub fn marshal_binary(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8 + self.blocks.len() * IZYX_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.voxels);
        let mut off = 8;
        for block in &self.blocks {
            buf[off..off + IZYX_SIZE].copy_from_slice(&block.to_izyx());
            off += IZYX_SIZE;
        }
        buf
    }

    pub fn unmarshal_binary(data: &[u8]) -> Result<Self> {
        if data.len() < 8 || (data.len() - 8) % IZYX_SIZE != 0 {
            return errdata!("cannot unmarshal {} bytes into label meta", data.len());
        }
        let voxels = LittleEndian::read_u64(&data[0..8]);
        let mut blocks = Vec::with_capacity((data.len() - 8) / IZYX_SIZE);
        for chunk in data[8..].chunks(IZYX_SIZE) {
            blocks.push(BlockCoord::from_izyx(chunk)?);
        }
        Ok(Meta { voxels, blocks })
    }

    /// Folds one PUT's aggregated block diffs into this Meta: newly-present
    /// blocks are merged into the sorted list, newly-absent blocks removed,
    /// and voxel deltas summed into the count.
    pub fn apply_changes(&mut self, bdm: &BlockDiffMap) {
        let mut present = Vec::new();
        let mut absent = Vec::new();
        for (&block, diff) in bdm {
            self.voxels = self.voxels.saturating_add_signed(diff.delta as i64);
            if diff.present {
                present.push(block);
            } else {
                absent.push(block);
            }
        }
        present.sort_unstable();
        absent.sort_unstable();

        if !absent.is_empty() {
            self.blocks.retain(|b| absent.binary_search(b).is_err());
        }
        if !present.is_empty() {
            let existing = std::mem::take(&mut self.blocks);
            self.blocks = existing.into_iter().merge(present).dedup().collect();
        }
    }
}

/// Restricts a sorted block list to the given block bounds.
pub fn fit_to_bounds(blocks: &[BlockCoord], bounds: &crate::geom::OptionalBounds) -> Vec<BlockCoord> {
    blocks
        .iter()
        .filter(|b| !(bounds.outside_x(b.x()) || bounds.outside_y(b.y()) || bounds.outside_z(b.z())))
        .copied()
        .collect()
}

/// Per-block change to one label within a PUT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LabelDiff {
    /// Change in # voxels.
    pub delta: i32,
    /// Whether the label exists in the new block.
    pub present: bool,
}

pub type BlockDiffMap = HashMap<BlockCoord, LabelDiff>;

/// Block-level analysis of one chunk write: presence flags and voxel deltas
/// for every label touched by the block.
#[derive(Clone, Debug, Default)]
pub struct BlockChange {
    pub block: BlockCoord,
    pub present: HashMap<u64, u8>,
    pub delta: HashMap<u64, i32>,
}

impl BlockChange {
    /// Derives the change record from the old and new label volumes of a
    /// block. Presence comes from the distinct-label lists; deltas from
    /// voxel counts. Label 0 is background and never indexed.
    pub fn compute(
        block: BlockCoord,
        old_labels: Option<&[u64]>,
        old_volume: Option<&[u64]>,
        new_labels: &[u64],
        new_volume: &[u64],
    ) -> Self {
        let mut change = BlockChange {
            block,
            ..Default::default()
        };
        if let Some(labels) = old_labels {
            for &label in labels {
                if label != 0 {
                    *change.present.entry(label).or_insert(0) |= PRESENT_OLD;
                }
            }
        }
        for &label in new_labels {
            if label != 0 {
                *change.present.entry(label).or_insert(0) |= PRESENT_NEW;
            }
        }
        if let Some(volume) = old_volume {
            for &label in volume {
                if label != 0 {
                    *change.delta.entry(label).or_insert(0) -= 1;
                }
            }
        }
        for &label in new_volume {
            if label != 0 {
                *change.delta.entry(label).or_insert(0) += 1;
            }
        }
        change
    }
}

type LabelDiffMap = HashMap<u64, BlockDiffMap>;

/// One label's aggregated diffs, routed to its shard.
pub(crate) enum LabelChange {
    Change {
        version: VersionId,
        label: u64,
        bdm: BlockDiffMap,
    },
    /// Drain barrier: the shard acks once every prior change has settled.
    Flush(Sender<()>),
}

/// Consumes block changes until the channel closes, folding them into a
/// per-label diff map, then routes each label to its shard.
pub(crate) fn aggregate_block_changes(
    version: VersionId,
    rx: Receiver<BlockChange>,
    shards: Vec<SyncSender<LabelChange>>,
) {
    let mut ldm = LabelDiffMap::new();
    for change in rx {
        for (&label, &flag) in &change.present {
            let present = match flag {
                PRESENT_OLD => false, // label no longer in this block
                f if f & PRESENT_NEW != 0 => true,
                _ => continue,
            };
            ldm.entry(label)
                .or_default()
                .entry(change.block)
                .or_default()
                .present = present;
        }
        for (&label, &delta) in &change.delta {
            ldm.entry(label)
                .or_default()
                .entry(change.block)
                .or_default()
                .delta += delta;
        }
    }
    let num_shards = shards.len() as u64;
    for (label, bdm) in ldm {
        let shard = (label % num_shards) as usize;
        let change = LabelChange::Change { version, label, bdm };
        if shards[shard].send(change).is_err() {
            tracing::error!(label, "label shard closed, dropping index update");
        }
    }
}

/// A label Meta cache evicting by time since last access. Owned by exactly
/// one shard worker and never shared.
#[derive(Debug)]
pub struct MetaCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<u64, TimedMeta>,
}

#[derive(Debug)]
struct TimedMeta {
    meta: Meta,
    last_access: u64,
}

impl MetaCache {
    pub fn new(capacity: usize) -> Self {
        MetaCache {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::with_capacity(capacity.max(1)),
        }
    }

    /// Returns the label's Meta if cached, refreshing its access time.
    pub fn get(&mut self, label: u64) -> Option<&Meta> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&label).map(|tm| {
            tm.last_access = tick;
            &tm.meta
        })
    }

    /// Removes and returns the label's Meta for mutation; the caller
    /// reinserts the updated record afterwards.
    pub fn take(&mut self, label: u64) -> Option<Meta> {
        self.entries.remove(&label).map(|tm| tm.meta)
    }

    /// Inserts a label's Meta, evicting the single least-recently-accessed
    /// entry if the cache is full.
    pub fn insert(&mut self, label: u64, meta: Meta) {
        self.tick += 1;
        if !self.entries.contains_key(&label) && self.entries.len() >= self.capacity {
            if let Some(&oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, tm)| tm.last_access)
                .map(|(label, _)| label)
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            label,
            TimedMeta {
                meta,
                last_access: self.tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Loads one label's Meta through the envelope, None if absent.
pub fn load_label_meta<S: KeyStore>(ctx: &VersionedCtx<S>, label: u64) -> Result<Option<Meta>> {
    let Some(compressed) = ctx.get(&keys::label_index_tkey(label))? else {
        return Ok(None);
    };
    let raw = envelope::deserialize_data(&compressed, true)?;
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(Meta::unmarshal_binary(&raw)?))
}

/// Returns the union Meta over a set of labels: block lists merged sorted,
/// voxel counts summed. If block bounds are supplied the block set is
/// clipped and the voxel count reported as 0, since exact bookkeeping
/// across clipping is not guaranteed.
pub fn get_label_meta<S: KeyStore>(
    ctx: &VersionedCtx<S>,
    labels: &[u64],
    bounds: &Bounds,
) -> Result<Meta> {
    let mut voxels = 0u64;
    let mut blocks: Vec<BlockCoord> = Vec::new();
    for &label in labels {
        if let Some(meta) = load_label_meta(ctx, label)? {
            if meta.blocks.is_empty() {
                continue;
            }
            voxels += meta.voxels;
            if blocks.is_empty() {
                blocks = meta.blocks;
            } else {
                let existing = std::mem::take(&mut blocks);
                blocks = existing.into_iter().merge(meta.blocks).dedup().collect();
            }
        }
    }
    if bounds.block.is_set() {
        blocks = fit_to_bounds(&blocks, &bounds.block);
        voxels = 0;
    }
    Ok(Meta { voxels, blocks })
}

/// Serializes and stores one label's Meta under its single-label key,
/// LZ4-compressed inside the engine envelope.
pub fn put_label_meta<S: KeyStore>(ctx: &VersionedCtx<S>, label: u64, meta: &Meta) -> Result<()> {
    let serialization = meta.marshal_binary();
    let compressed = envelope::serialize_data(&serialization, Compression::Lz4, Checksum::None)?;
    ctx.put(&keys::label_index_tkey(label), compressed)
}

/// Removes one label's Meta at this version.
pub fn delete_label_meta<S: KeyStore>(ctx: &VersionedCtx<S>, label: u64) -> Result<()> {
    ctx.delete(&keys::label_index_tkey(label))
}

/// Shard workers owning all get/put transactions on label indexes. Labels
/// are routed by `label % num_shards` so each Meta sees serial
/// read-modify-write without locks.
pub struct LabelIndexer {
    senders: Vec<SyncSender<LabelChange>>,
    handles: Vec<JoinHandle<()>>,
}

impl LabelIndexer {
    pub fn start<S: KeyStore>(
        store: Arc<S>,
        dag: Arc<VersionDag>,
        instance: InstanceId,
        num_shards: usize,
        cache_size: usize,
    ) -> Self {
        let mut senders = Vec::with_capacity(num_shards);
        let mut handles = Vec::with_capacity(num_shards);
        for shard in 0..num_shards.max(1) {
            let (tx, rx) = mpsc::sync_channel(SHARD_CHANNEL_CAP);
            let store = store.clone();
            let dag = dag.clone();
            let handle = std::thread::Builder::new()
                .name(format!("label-index-{shard}"))
                .spawn(move || index_labels(rx, store, dag, instance, cache_size))
                .expect("spawning label index shard");
            senders.push(tx);
            handles.push(handle);
        }
        LabelIndexer { senders, handles }
    }

    pub(crate) fn senders(&self) -> Vec<SyncSender<LabelChange>> {
        self.senders.clone()
    }

    /// Blocks until every change routed before this call has settled.
    pub fn sync(&self) {
        for tx in &self.senders {
            let (ack_tx, ack_rx) = mpsc::channel();
            if tx.send(LabelChange::Flush(ack_tx)).is_ok() {
                ack_rx.recv().ok();
            }
        }
    }
}

impl Drop for LabelIndexer {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            handle.join().ok();
        }
    }
}

/// Shard worker loop: fetch-or-load Meta, apply diffs, cache and persist.
/// Data-level errors are logged and the worker continues with later changes.
fn index_labels<S: KeyStore>(
    rx: Receiver<LabelChange>,
    store: Arc<S>,
    dag: Arc<VersionDag>,
    instance: InstanceId,
    cache_size: usize,
) {
    let mut cache = MetaCache::new(cache_size);
    for change in rx {
        match change {
            LabelChange::Change { version, label, bdm } => {
                let ctx = VersionedCtx::new(dag.clone(), store.clone(), instance, version);
                let mut meta = match cache.take(label) {
                    Some(meta) => meta,
                    None => match load_label_meta(&ctx, label) {
                        Ok(meta) => meta.unwrap_or_default(),
                        Err(e) => {
                            tracing::error!(label, error = %e, "reading label meta for index update");
                            continue;
                        }
                    },
                };
                meta.apply_changes(&bdm);

                // A label with no remaining blocks no longer persists.
                let stored = if meta.blocks.is_empty() {
                    delete_label_meta(&ctx, label)
                } else {
                    put_label_meta(&ctx, label, &meta)
                };
                if let Err(e) = stored {
                    tracing::error!(label, error = %e, "storing label index");
                    continue;
                }
                cache.insert(label, meta);
            }
            LabelChange::Flush(ack) => {
                ack.send(()).ok();
            }
        }
    }
    tracing::info!("closing label index handler");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn meta_with(voxels: u64, blocks: &[(i32, i32, i32)]) -> Meta {
        Meta {
            voxels,
            blocks: blocks.iter().map(|&(x, y, z)| BlockCoord::new(x, y, z)).collect(),
        }
    }

    #[test]
    fn test_meta_marshal_roundtrip() {
        let meta = meta_with(12345, &[(0, 0, 0), (1, 0, 0), (0, 1, 2)]);
        let bytes = meta.marshal_binary();
        assert_eq!(bytes.len(), 8 + 3 * IZYX_SIZE);
        assert_eq!(Meta::unmarshal_binary(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_meta_unmarshal_rejects_bad_lengths() {
        assert!(Meta::unmarshal_binary(&[0u8; 7]).is_err());
        assert!(Meta::unmarshal_binary(&[0u8; 8 + 5]).is_err());
        assert_eq!(Meta::unmarshal_binary(&[0u8; 8]).unwrap(), Meta::default());
    }

    #[test]
    fn test_apply_changes_merges_and_deletes() {
        let mut meta = meta_with(100, &[(0, 0, 0), (1, 0, 0)]);
        let mut bdm = BlockDiffMap::new();
        bdm.insert(BlockCoord::new(2, 0, 0), LabelDiff { delta: 10, present: true });
        bdm.insert(BlockCoord::new(1, 0, 0), LabelDiff { delta: -50, present: false });
        meta.apply_changes(&bdm);

        assert_eq!(meta.voxels, 60);
        assert_eq!(meta.blocks, vec![BlockCoord::new(0, 0, 0), BlockCoord::new(2, 0, 0)]);
    }

    #[test]
    fn test_apply_changes_keeps_sorted_no_duplicates() {
        let mut meta = meta_with(0, &[(1, 0, 0)]);
        let mut bdm = BlockDiffMap::new();
        // re-adding an existing block must not duplicate it
        bdm.insert(BlockCoord::new(1, 0, 0), LabelDiff { delta: 1, present: true });
        bdm.insert(BlockCoord::new(0, 0, 0), LabelDiff { delta: 1, present: true });
        bdm.insert(BlockCoord::new(0, 0, 1), LabelDiff { delta: 1, present: true });
        meta.apply_changes(&bdm);

        assert_eq!(
            meta.blocks,
            vec![BlockCoord::new(0, 0, 0), BlockCoord::new(1, 0, 0), BlockCoord::new(0, 0, 1)]
        );
    }

    #[test]
    fn test_block_change_compute() {
        let old = vec![1, 1, 2, 0];
        let new = vec![1, 3, 3, 3];
        let change = BlockChange::compute(
            BlockCoord::new(0, 0, 0),
            Some(&[1, 2]),
            Some(&old),
            &[1, 3],
            &new,
        );

        assert_eq!(change.present[&1], PRESENT_OLD | PRESENT_NEW);
        assert_eq!(change.present[&2], PRESENT_OLD);
        assert_eq!(change.present[&3], PRESENT_NEW);
        assert_eq!(change.delta[&1], -1); // two before, one after
        assert_eq!(change.delta[&2], -1);
        assert_eq!(change.delta[&3], 3);
        assert!(!change.present.contains_key(&0));
    }

    #[test]
    fn test_cache_evicts_least_recently_accessed() {
        let mut cache = MetaCache::new(2);
        cache.insert(1, meta_with(1, &[]));
        cache.insert(2, meta_with(2, &[]));

        // touch 1 so 2 becomes the eviction candidate
        assert!(cache.get(1).is_some());
        cache.insert(3, meta_with(3, &[]));

        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_reinsert_does_not_evict() {
        let mut cache = MetaCache::new(2);
        cache.insert(1, meta_with(1, &[]));
        cache.insert(2, meta_with(2, &[]));
        cache.insert(2, meta_with(20, &[]));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(2).unwrap().voxels, 20);
    }

    #[test]
    fn test_aggregator_folds_and_routes_by_shard() {
        let (block_tx, block_rx) = mpsc::sync_channel(10);
        let (shard0_tx, shard0_rx) = mpsc::sync_channel(10);
        let (shard1_tx, shard1_rx) = mpsc::sync_channel(10);

        let mut change = BlockChange {
            block: BlockCoord::new(0, 0, 0),
            ..Default::default()
        };
        change.present.insert(2, PRESENT_NEW);
        change.delta.insert(2, 5);
        block_tx.send(change).unwrap();

        let mut change = BlockChange {
            block: BlockCoord::new(0, 0, 0),
            ..Default::default()
        };
        change.present.insert(3, PRESENT_OLD);
        change.delta.insert(3, -4);
        change.delta.insert(2, 2);
        block_tx.send(change).unwrap();
        drop(block_tx);

        aggregate_block_changes(VersionId(1), block_rx, vec![shard0_tx, shard1_tx]);

        // label 2 -> shard 0, folded delta 7, present
        match shard0_rx.try_recv().unwrap() {
            LabelChange::Change { label, bdm, .. } => {
                assert_eq!(label, 2);
                let diff = bdm[&BlockCoord::new(0, 0, 0)];
                assert_eq!(diff.delta, 7);
                assert!(diff.present);
            }
            _ => panic!("expected change"),
        }
        // label 3 -> shard 1, removed
        match shard1_rx.try_recv().unwrap() {
            LabelChange::Change { label, bdm, .. } => {
                assert_eq!(label, 3);
                assert!(!bdm[&BlockCoord::new(0, 0, 0)].present);
            }
            _ => panic!("expected change"),
        }
    }

    #[test]
    fn test_indexer_applies_and_removes_meta() {
        use crate::store::Memory;

        let store = Arc::new(Memory::new());
        let dag = Arc::new(VersionDag::new());
        dag.add_node(VersionId(1), None).unwrap();
        let instance = InstanceId(1);
        let indexer = LabelIndexer::start(store.clone(), dag.clone(), instance, 2, 50);

        let block = BlockCoord::new(0, 0, 0);
        let mut bdm = BlockDiffMap::new();
        bdm.insert(block, LabelDiff { delta: 42, present: true });
        let senders = indexer.senders();
        senders[(7 % 2) as usize]
            .send(LabelChange::Change { version: VersionId(1), label: 7, bdm })
            .unwrap();
        indexer.sync();

        let ctx = VersionedCtx::new(dag.clone(), store.clone(), instance, VersionId(1));
        let meta = load_label_meta(&ctx, 7).unwrap().unwrap();
        assert_eq!(meta.voxels, 42);
        assert_eq!(meta.blocks, vec![block]);

        // removing the only block removes the record entirely
        let mut bdm = BlockDiffMap::new();
        bdm.insert(block, LabelDiff { delta: -42, present: false });
        senders[(7 % 2) as usize]
            .send(LabelChange::Change { version: VersionId(1), label: 7, bdm })
            .unwrap();
        indexer.sync();

        assert!(load_label_meta(&ctx, 7).unwrap().is_none());
    }

    #[test]
    fn test_get_label_meta_unions_and_clips() {
        use crate::store::Memory;

        let store = Arc::new(Memory::new());
        let dag = Arc::new(VersionDag::new());
        dag.add_node(VersionId(1), None).unwrap();
        let ctx = VersionedCtx::new(dag, store, InstanceId(1), VersionId(1));

        put_label_meta(&ctx, 1, &meta_with(10, &[(0, 0, 0), (5, 0, 0)])).unwrap();
        put_label_meta(&ctx, 2, &meta_with(20, &[(1, 0, 0), (5, 0, 0)])).unwrap();

        let union = get_label_meta(&ctx, &[1, 2], &Bounds::default()).unwrap();
        assert_eq!(union.voxels, 30);
        assert_eq!(
            union.blocks,
            vec![BlockCoord::new(0, 0, 0), BlockCoord::new(1, 0, 0), BlockCoord::new(5, 0, 0)]
        );

        // block bounds clip the set and zero the voxel count
        let mut bounds = Bounds::default();
        bounds.block.max_x = Some(1);
        let clipped = get_label_meta(&ctx, &[1, 2], &bounds).unwrap();
        assert_eq!(clipped.voxels, 0);
        assert_eq!(clipped.blocks, vec![BlockCoord::new(0, 0, 0), BlockCoord::new(1, 0, 0)]);
    }

    proptest! {
        #[test]
        fn prop_meta_roundtrip(voxels in any::<u64>(), raw in prop::collection::vec((-100i32..100, -100i32..100, -100i32..100), 0..40)) {
            let mut blocks: Vec<BlockCoord> = raw.into_iter().map(|(x, y, z)| BlockCoord::new(x, y, z)).collect();
            blocks.sort_unstable();
            blocks.dedup();
            let meta = Meta { voxels, blocks };
            prop_assert_eq!(Meta::unmarshal_binary(&meta.marshal_binary()).unwrap(), meta);
        }

        #[test]
        fn prop_apply_changes_keeps_blocks_strictly_ascending(
            initial in prop::collection::vec((-8i32..8, -8i32..8, -8i32..8), 0..20),
            changes in prop::collection::vec(((-8i32..8, -8i32..8, -8i32..8), any::<bool>(), -5i32..5), 0..20),
        ) {
            let mut blocks: Vec<BlockCoord> = initial.into_iter().map(|(x, y, z)| BlockCoord::new(x, y, z)).collect();
            blocks.sort_unstable();
            blocks.dedup();
            let mut meta = Meta { voxels: 1000, blocks };

            let mut bdm = BlockDiffMap::new();
            for ((x, y, z), present, delta) in changes {
                bdm.insert(BlockCoord::new(x, y, z), LabelDiff { delta, present });
            }
            meta.apply_changes(&bdm);

            for w in meta.blocks.windows(2) {
                prop_assert!(w[0] < w[1], "blocks not strictly ascending");
            }
        }
    }
}
