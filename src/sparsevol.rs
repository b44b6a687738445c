//! Sparse-volume reconstruction.
//!
//! Maps a (possibly merged) label to its blocks, decodes blocks in a worker
//! pool, and emits bounded run-length encodings. The wire format, integers
//! little endian:
//!
//! ```text
//! byte     encoding (0 = binary)
//! uint8    number of dimensions (3)
//! uint8    dimension of run (0 = X)
//! byte     reserved
//! uint32   0 (reserved placeholder)
//! uint32   # runs (backfilled)
//! Repeated per run:
//!     int32    x, y, z of run start
//!     int32    length of run
//! ```
//!
//! Runs never cross a row boundary: the end of an X scan forces closure.

use std::collections::HashSet;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use byteorder::{LittleEndian, ByteOrder, WriteBytesExt};

use crate::block::Block;
use crate::envelope::{self, Compression};
use crate::errdata;
use crate::error::Result;
use crate::geom::{BlockCoord, Bounds, OptionalBounds, Point3d};
use crate::keys::{self, VersionId};
use crate::labelidx::{get_label_meta, Meta};
use crate::store::KeyStore;
use crate::write::LabelData;

/// Offset of the run-count placeholder within the header.
const RUN_COUNT_OFFSET: usize = 8;
const HEADER_SIZE: usize = 12;
const RUN_SIZE: usize = 16;

const DECODER_CHANNEL_CAP: usize = 10;
const RESULT_CHANNEL_CAP: usize = 100;

struct LabelBlock {
    coord: BlockCoord,
    data: Vec<u8>,
}

#[derive(Default)]
struct RleResult {
    runs: u32,
    serialization: Vec<u8>,
}

fn sparse_vol_header() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    buf.push(0); // encoding: binary
    buf.push(3); // # of dimensions
    buf.push(0); // dimension of run (X = 0)
    buf.push(0); // reserved
    buf.write_u32::<LittleEndian>(0).unwrap(); // reserved placeholder
    buf.write_u32::<LittleEndian>(0).unwrap(); // placeholder for # runs
    buf
}

fn write_rle(buf: &mut Vec<u8>, start: Point3d, run: i32) {
    buf.write_i32::<LittleEndian>(start.x()).unwrap();
    buf.write_i32::<LittleEndian>(start.y()).unwrap();
    buf.write_i32::<LittleEndian>(start.z()).unwrap();
    buf.write_i32::<LittleEndian>(run).unwrap();
}

/// Scans a block volume in ZYX order and appends RLE runs for voxels whose
/// label is in the set.
fn add_rles(
    coord: BlockCoord,
    block_size: Point3d,
    volume: &[u64],
    labels: &HashSet<u64>,
) -> Result<(Vec<u8>, u32)> {
    if volume.len() as i64 != block_size.prod() {
        return errdata!(
            "block volume is {} voxels, not the {} block elements",
            volume.len(),
            block_size.prod()
        );
    }
    let first = coord.min_point(block_size);
    let last = coord.max_point(block_size);

    let mut buf = Vec::new();
    let mut runs = 0u32;
    let mut span_start = Point3d::default();
    let mut span_run = 0i32;
    let mut idx = 0usize;
    for z in first.z()..=last.z() {
        for y in first.y()..=last.y() {
            for x in first.x()..=last.x() {
                let label = volume[idx];
                idx += 1;

                let in_span = label != 0 && labels.contains(&label);
                if in_span {
                    span_run += 1;
                    if span_run == 1 {
                        span_start = Point3d::new(x, y, z);
                    }
                } else if span_run > 0 {
                    runs += 1;
                    write_rle(&mut buf, span_start, span_run);
                    span_run = 0;
                }
            }
            // Force break of any runs when we finish x scan.
            if span_run > 0 {
                runs += 1;
                write_rle(&mut buf, span_start, span_run);
                span_run = 0;
            }
        }
    }
    Ok((buf, runs))
}

/// As `add_rles`, clipping runs to the voxel bounds per axis.
fn add_bounded_rles(
    coord: BlockCoord,
    block_size: Point3d,
    volume: &[u64],
    labels: &HashSet<u64>,
    bounds: &OptionalBounds,
) -> Result<(Vec<u8>, u32)> {
    if volume.len() as i64 != block_size.prod() {
        return errdata!(
            "block volume is {} voxels, not the {} block elements",
            volume.len(),
            block_size.prod()
        );
    }
    let first = coord.min_point(block_size);
    let last = coord.max_point(block_size);

    let mut buf = Vec::new();
    let mut runs = 0u32;
    let mut span_start = Point3d::default();
    let mut span_run = 0i32;
    let mut idx = 0usize;
    let yskip = block_size.x() as usize;
    let zskip = block_size.y() as usize * yskip;
    for z in first.z()..=last.z() {
        if bounds.outside_z(z) {
            idx += zskip;
            continue;
        }
        for y in first.y()..=last.y() {
            if bounds.outside_y(y) {
                idx += yskip;
                continue;
            }
            for x in first.x()..=last.x() {
                let label = volume[idx];
                idx += 1;

                let mut in_span = label != 0 && labels.contains(&label);
                if in_span && bounds.outside_x(x) {
                    in_span = false;
                }
                if in_span {
                    span_run += 1;
                    if span_run == 1 {
                        span_start = Point3d::new(x, y, z);
                    }
                } else if span_run > 0 {
                    runs += 1;
                    write_rle(&mut buf, span_start, span_run);
                    span_run = 0;
                }
            }
            if span_run > 0 {
                runs += 1;
                write_rle(&mut buf, span_start, span_run);
                span_run = 0;
            }
        }
    }
    Ok((buf, runs))
}

/// Decode worker: unwraps each retrieved block, materializes its voxel
/// array, and produces RLE runs. Corrupt blocks are logged and contribute
/// zero runs; exactly one result is emitted per incoming block.
fn process_blocks_to_rles(
    block_size: Point3d,
    labels: HashSet<u64>,
    bounds: Bounds,
    rx: Receiver<LabelBlock>,
    out: SyncSender<RleResult>,
) {
    for lb in rx {
        let mut result = RleResult::default();
        match decode_block_volume(&lb.data) {
            Ok(volume) => {
                let rles = if bounds.exact && bounds.voxel.is_set() {
                    add_bounded_rles(lb.coord, block_size, &volume, &labels, &bounds.voxel)
                } else {
                    add_rles(lb.coord, block_size, &volume, &labels)
                };
                match rles {
                    Ok((serialization, runs)) => result = RleResult { runs, serialization },
                    Err(e) => {
                        tracing::error!(block = %lb.coord, error = %e, "could not process block into runs")
                    }
                }
            }
            Err(e) => {
                tracing::error!(block = %lb.coord, error = %e, "unable to unmarshal label block")
            }
        }
        if out.send(result).is_err() {
            return;
        }
    }
}

fn decode_block_volume(serialization: &[u8]) -> Result<Vec<u64>> {
    let raw = envelope::deserialize_data(serialization, true)?;
    Ok(Block::decode(&raw)?.make_label_volume())
}

impl<S: KeyStore> LabelData<S> {
    /// Resolves a user-provided label against the merge mapping and returns
    /// the union Meta over its constituents. None if the label has been
    /// merged away; the merged form owns the voxels.
    pub fn get_mapped_label_meta(
        &self,
        version: VersionId,
        label: u64,
        bounds: &Bounds,
    ) -> Result<Option<(Meta, Vec<u64>)>> {
        let mapping = self.mapping();
        if let Some(mapping) = &mapping {
            if let Some(merged) = mapping.final_label(label) {
                tracing::debug!(label, merged, "label already merged, skipping sparse vol");
                return Ok(None);
            }
        }
        let labels = match &mapping {
            Some(mapping) => mapping.constituent_labels(label),
            None => vec![label],
        };
        let ctx = self.ctx(version);
        let meta = get_label_meta(&ctx, &labels, bounds)?;
        Ok(Some((meta, labels)))
    }

    /// True if any voxel of the label (or its constituents) exists within
    /// the given bounds.
    pub fn found_sparse_vol(&self, version: VersionId, label: u64, bounds: &Bounds) -> Result<bool> {
        match self.get_mapped_label_meta(version, label, bounds)? {
            Some((meta, _)) => Ok(!meta.blocks.is_empty()),
            None => Ok(false),
        }
    }

    /// Builds the RLE sparse volume of a label. A missing or merged-away
    /// label yields None, not an error.
    pub fn get_sparse_vol(
        &self,
        version: VersionId,
        label: u64,
        bounds: &Bounds,
    ) -> Result<Option<Vec<u8>>> {
        let Some((meta, labels)) = self.get_mapped_label_meta(version, label, bounds)? else {
            return Ok(None);
        };
        if meta.blocks.is_empty() {
            return Ok(None);
        }
        let label_set: HashSet<u64> = labels.into_iter().collect();
        let block_size = self.block_size();
        let decoders = self.config.block_decoders.max(1);

        let (result_tx, result_rx) = mpsc::sync_channel(RESULT_CHANNEL_CAP);
        let mut feeds = Vec::with_capacity(decoders);
        let mut workers = Vec::with_capacity(decoders);
        for _ in 0..decoders {
            let (tx, rx) = mpsc::sync_channel(DECODER_CHANNEL_CAP);
            let labels = label_set.clone();
            let bounds = *bounds;
            let result_tx = result_tx.clone();
            workers.push(thread::spawn(move || {
                process_blocks_to_rles(block_size, labels, bounds, rx, result_tx)
            }));
            feeds.push(tx);
        }
        drop(result_tx);

        // Collector accumulates run counts and serializations as decoders
        // finish; per-block ordering holds within a decoder but not across.
        let collector = thread::spawn(move || {
            let mut runs = 0u32;
            let mut serialization = Vec::new();
            for result in result_rx {
                runs += result.runs;
                serialization.extend_from_slice(&result.serialization);
            }
            (runs, serialization)
        });

        let ctx = self.ctx(version);
        let mut feed_err = None;
        for &coord in &meta.blocks {
            match ctx.get(&keys::block_tkey(coord)) {
                Ok(Some(data)) => {
                    let n = coord.hash(decoders);
                    feeds[n].send(LabelBlock { coord, data }).ok();
                }
                Ok(None) => {
                    tracing::error!(block = %coord, "indexed block missing from store");
                }
                Err(e) => {
                    feed_err = Some(e);
                    break;
                }
            }
        }
        drop(feeds);
        for worker in workers {
            worker.join().ok();
        }
        let (runs, serialization) = match collector.join() {
            Ok(collected) => collected,
            Err(_) => (0, Vec::new()),
        };
        if let Some(e) = feed_err {
            return Err(e);
        }
        if runs == 0 {
            // Couldn't know until voxel-level clipping was done.
            return Ok(None);
        }

        let mut buf = sparse_vol_header();
        buf.extend_from_slice(&serialization);
        LittleEndian::write_u32(&mut buf[RUN_COUNT_OFFSET..RUN_COUNT_OFFSET + 4], runs);
        tracing::debug!(
            data = %self.name,
            label,
            blocks = meta.blocks.len(),
            runs,
            bytes = buf.len(),
            "sparse volume built"
        );
        Ok(Some(buf))
    }

    /// Coarse sparse volume: one run per contiguous block span in sorted
    /// IZYX order, run coordinates in block space. Skips voxel
    /// materialization entirely.
    pub fn get_sparse_coarse_vol(
        &self,
        version: VersionId,
        label: u64,
        bounds: &Bounds,
    ) -> Result<Option<Vec<u8>>> {
        let Some((meta, _)) = self.get_mapped_label_meta(version, label, bounds)? else {
            return Ok(None);
        };
        if meta.blocks.is_empty() {
            return Ok(None);
        }

        let mut buf = sparse_vol_header();
        let mut spans = 0u32;
        let mut blocks = meta.blocks.iter();
        let first = *blocks.next().unwrap();
        let (mut run_start, mut run_len) = (first, 1i32);
        for &block in blocks {
            let contiguous = block.z() == run_start.z()
                && block.y() == run_start.y()
                && block.x() == run_start.x() + run_len;
            if contiguous {
                run_len += 1;
            } else {
                spans += 1;
                write_rle(&mut buf, Point3d(run_start.0), run_len);
                run_start = block;
                run_len = 1;
            }
        }
        spans += 1;
        write_rle(&mut buf, Point3d(run_start.0), run_len);
        LittleEndian::write_u32(&mut buf[RUN_COUNT_OFFSET..RUN_COUNT_OFFSET + 4], spans);
        Ok(Some(buf))
    }
}

/// Writes a built sparse volume with the named output compression
/// ("", "lz4", or "gzip"). Unknown names are rejected before writing.
pub fn write_output<W: Write>(mut w: W, data: &[u8], compression: &str) -> Result<()> {
    let compression = Compression::from_name(compression)?;
    let payload = envelope::compress_payload(data, compression)?;
    w.write_all(&payload)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::keys::InstanceId;
    use crate::mapping::{LabelMapping, MergeTable};
    use crate::store::Memory;
    use crate::version::VersionDag;
    use crate::write::Subvolume;
    use std::sync::Arc;

    const V1: VersionId = VersionId(1);

    fn new_data() -> LabelData<Memory> {
        let dag = VersionDag::new();
        dag.add_node(V1, None).unwrap();
        let config = Config::new()
            .block_size(Point3d([8, 8, 8]))
            .num_label_handlers(2)
            .block_decoders(3);
        LabelData::new("labels", InstanceId(1), Arc::new(Memory::new()), Arc::new(dag), config)
    }

    /// 16x8x8 volume: label 1 fills z=0 of the left block, label 2 fills all
    /// of the right block.
    fn ingest_fixture(data: &LabelData<Memory>) {
        let size = Point3d([16, 8, 8]);
        let mut voxels = vec![0u64; size.prod() as usize];
        for z in 0..8 {
            for y in 0..8 {
                for x in 0..16 {
                    let idx = ((z * 8 + y) * 16 + x) as usize;
                    if x < 8 {
                        if z == 0 {
                            voxels[idx] = 1;
                        }
                    } else {
                        voxels[idx] = 2;
                    }
                }
            }
        }
        let vox = Subvolume::new(Point3d([0, 0, 0]), size, voxels).unwrap();
        data.ingest_voxels(V1, vox).unwrap();
        data.sync_indexes();
    }

    fn parse_runs(encoding: &[u8]) -> Vec<(i32, i32, i32, i32)> {
        assert_eq!(encoding[0], 0);
        assert_eq!(encoding[1], 3);
        assert_eq!(encoding[2], 0);
        assert_eq!(encoding[3], 0);
        assert_eq!(LittleEndian::read_u32(&encoding[4..8]), 0);
        let runs = LittleEndian::read_u32(&encoding[8..12]) as usize;
        assert_eq!(encoding.len(), HEADER_SIZE + runs * RUN_SIZE);
        encoding[HEADER_SIZE..]
            .chunks(RUN_SIZE)
            .map(|run| {
                (
                    LittleEndian::read_i32(&run[0..4]),
                    LittleEndian::read_i32(&run[4..8]),
                    LittleEndian::read_i32(&run[8..12]),
                    LittleEndian::read_i32(&run[12..16]),
                )
            })
            .collect()
    }

    #[test]
    fn test_add_rles_row_bounded() {
        let block_size = Point3d([4, 2, 1]);
        // label 7 fills both rows entirely: runs must break at row ends
        let volume = vec![7u64; 8];
        let labels: HashSet<u64> = [7].into();
        let (buf, runs) = add_rles(BlockCoord::new(0, 0, 0), block_size, &volume, &labels).unwrap();
        assert_eq!(runs, 2);
        let mut full = sparse_vol_header();
        full.extend_from_slice(&buf);
        LittleEndian::write_u32(&mut full[8..12], runs);
        assert_eq!(parse_runs(&full), vec![(0, 0, 0, 4), (0, 1, 0, 4)]);
    }

    #[test]
    fn test_sparse_vol_voxel_count_matches_meta() {
        let data = new_data();
        ingest_fixture(&data);

        let encoding = data.get_sparse_vol(V1, 2, &Bounds::default()).unwrap().unwrap();
        let runs = parse_runs(&encoding);
        let total: i64 = runs.iter().map(|&(_, _, _, len)| len as i64).sum();

        let ctx = data.ctx(V1);
        let meta = crate::labelidx::load_label_meta(&ctx, 2).unwrap().unwrap();
        assert_eq!(total as u64, meta.voxels);
        assert_eq!(meta.voxels, 512);

        // 64 rows of 8 voxels each, all starting in the right block
        assert_eq!(runs.len(), 64);
        assert!(runs.iter().all(|&(x, _, _, len)| x == 8 && len == 8));
    }

    #[test]
    fn test_sparse_vol_missing_label_absent() {
        let data = new_data();
        ingest_fixture(&data);
        assert!(data.get_sparse_vol(V1, 99, &Bounds::default()).unwrap().is_none());
        assert!(!data.found_sparse_vol(V1, 99, &Bounds::default()).unwrap());
        assert!(data.found_sparse_vol(V1, 1, &Bounds::default()).unwrap());
    }

    #[test]
    fn test_sparse_vol_respects_merge_mapping() {
        let data = new_data();
        ingest_fixture(&data);

        let table = Arc::new(MergeTable::new());
        table.merge(1, 2);
        let mapping: Arc<dyn LabelMapping> = table.clone();
        data.set_mapping(mapping);

        // merged-away label yields absent without error
        assert!(data.get_sparse_vol(V1, 1, &Bounds::default()).unwrap().is_none());

        // the merged form owns both labels' voxels
        let encoding = data.get_sparse_vol(V1, 2, &Bounds::default()).unwrap().unwrap();
        let total: i64 = parse_runs(&encoding).iter().map(|&(_, _, _, len)| len as i64).sum();
        assert_eq!(total, 512 + 64);
    }

    #[test]
    fn test_sparse_vol_voxel_bounds_clip_runs() {
        let data = new_data();
        ingest_fixture(&data);

        let mut bounds = Bounds::default();
        bounds.exact = true;
        bounds.voxel = OptionalBounds::from_min_max(Point3d([10, 2, 0]), Point3d([12, 3, 7]));

        let encoding = data.get_sparse_vol(V1, 2, &bounds).unwrap().unwrap();
        let runs = parse_runs(&encoding);
        // 8 z-slices x 2 rows, each clipped to x in [10, 12]
        assert_eq!(runs.len(), 16);
        assert!(runs.iter().all(|&(x, y, _, len)| x == 10 && (2..=3).contains(&y) && len == 3));
    }

    #[test]
    fn test_sparse_vol_block_bounds_clip_blocks() {
        let data = new_data();
        ingest_fixture(&data);

        let mut bounds = Bounds::default();
        bounds.block.max_x = Some(0);
        // label 2 lives entirely in block x=1
        assert!(data.get_sparse_vol(V1, 2, &bounds).unwrap().is_none());
        assert!(data.get_sparse_vol(V1, 1, &bounds).unwrap().is_some());
    }

    #[test]
    fn test_coarse_vol_contiguous_spans() {
        let data = new_data();
        // labels span blocks (0,0,0), (1,0,0) contiguously and (0,1,0) apart
        let size = Point3d([16, 16, 8]);
        let mut voxels = vec![0u64; size.prod() as usize];
        for z in 0..8 {
            for y in 0..16 {
                for x in 0..16 {
                    let idx = ((z * 16 + y) * 16 + x) as usize;
                    if y < 8 || x < 8 {
                        voxels[idx] = 5;
                    }
                }
            }
        }
        let vox = Subvolume::new(Point3d([0, 0, 0]), size, voxels).unwrap();
        data.ingest_voxels(V1, vox).unwrap();
        data.sync_indexes();

        let encoding = data.get_sparse_coarse_vol(V1, 5, &Bounds::default()).unwrap().unwrap();
        let runs = parse_runs(&encoding);
        assert_eq!(runs, vec![(0, 0, 0, 2), (0, 1, 0, 1)]);
    }

    #[test]
    fn test_write_output_compression() {
        let data = vec![1u8; 64];
        let mut plain = Vec::new();
        write_output(&mut plain, &data, "").unwrap();
        assert_eq!(plain, data);

        let mut lz4 = Vec::new();
        write_output(&mut lz4, &data, "lz4").unwrap();
        assert_eq!(lz4_flex::decompress_size_prepended(&lz4).unwrap(), data);

        let mut gz = Vec::new();
        write_output(&mut gz, &data, "gzip").unwrap();
        assert!(gz.starts_with(&[0x1f, 0x8b]));

        let mut out = Vec::new();
        assert!(write_output(&mut out, &data, "zstd").is_err());
        assert!(out.is_empty());
    }
}
