//! Synaptic annotation elements.
//!
//! Elements are stored in per-block buckets keyed by the block containing
//! each element's position; tag and label buckets are secondary indices
//! maintained synchronously with element writes. Elements reference each
//! other by position, so moves and deletes repair relationships by visiting
//! the buckets of every referenced position.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::errinput;
use crate::geom::{BlockCoord, Point3d};
use crate::keys::{self, InstanceId, VersionId};
use crate::store::KeyStore;
use crate::version::{VersionDag, VersionedCtx};
use crate::write::LabelData;

pub type Tag = String;

/// The kind of a synaptic element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Unknown,
    PreSyn,
    PostSyn,
    Gap,
    Note,
}

/// How one element relates to another, referenced by position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RelType {
    UnknownRel,
    PreSynTo,
    PostSynTo,
    ConvergentTo,
    GroupedWith,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "Rel")]
    pub rel: RelType,
    #[serde(rename = "To")]
    pub to: Point3d,
}

/// One annotation: a position plus kind, relationships, tags, and
/// free-form properties. Position is the stable identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    #[serde(rename = "Pos")]
    pub pos: Point3d,
    #[serde(rename = "Kind")]
    pub kind: ElementKind,
    #[serde(rename = "Rels", default)]
    pub rels: Vec<Relationship>,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<Tag>,
    #[serde(rename = "Prop", default)]
    pub prop: BTreeMap<String, String>,
}

/// Canonical ordering for deterministic reads and equality: elements sorted
/// by position, relationships by (to, rel), tags sorted.
pub fn normalize(mut elements: Vec<Element>) -> Vec<Element> {
    for elem in &mut elements {
        elem.rels.sort_by_key(|r| (r.to, r.rel));
        elem.tags.sort();
    }
    elements.sort_by_key(|e| e.pos);
    elements
}

fn upsert(bucket: &mut Vec<Element>, elem: &Element) -> Option<Element> {
    match bucket.iter_mut().find(|e| e.pos == elem.pos) {
        Some(slot) => Some(std::mem::replace(slot, elem.clone())),
        None => {
            bucket.push(elem.clone());
            None
        }
    }
}

fn remove_at(bucket: &mut Vec<Element>, pos: Point3d) -> Option<Element> {
    bucket.iter().position(|e| e.pos == pos).map(|i| bucket.remove(i))
}

/// Load-once, flush-once view over the block, tag, and label buckets touched
/// by one write. All dirty buckets are committed in a single atomic batch.
struct Buckets<'a, S: KeyStore> {
    ctx: &'a VersionedCtx<S>,
    blocks: HashMap<BlockCoord, Vec<Element>>,
    tags: HashMap<Tag, Vec<Element>>,
    labels: HashMap<u64, Vec<Element>>,
    dirty_blocks: HashSet<BlockCoord>,
    dirty_tags: HashSet<Tag>,
    dirty_labels: HashSet<u64>,
}

impl<'a, S: KeyStore> Buckets<'a, S> {
    fn new(ctx: &'a VersionedCtx<S>) -> Self {
        Buckets {
            ctx,
            blocks: HashMap::new(),
            tags: HashMap::new(),
            labels: HashMap::new(),
            dirty_blocks: HashSet::new(),
            dirty_tags: HashSet::new(),
            dirty_labels: HashSet::new(),
        }
    }

    fn load(ctx: &VersionedCtx<S>, index: &[u8]) -> Result<Vec<Element>> {
        match ctx.get(index)? {
            Some(value) => Ok(serde_json::from_slice(&value)?),
            None => Ok(Vec::new()),
        }
    }

    fn block(&mut self, coord: BlockCoord) -> Result<&Vec<Element>> {
        if !self.blocks.contains_key(&coord) {
            let bucket = Self::load(self.ctx, &keys::element_block_tkey(coord))?;
            self.blocks.insert(coord, bucket);
        }
        Ok(&self.blocks[&coord])
    }

    fn block_mut(&mut self, coord: BlockCoord) -> Result<&mut Vec<Element>> {
        self.block(coord)?;
        self.dirty_blocks.insert(coord);
        Ok(self.blocks.get_mut(&coord).unwrap())
    }

    fn tag_mut(&mut self, tag: &str) -> Result<&mut Vec<Element>> {
        if !self.tags.contains_key(tag) {
            let bucket = Self::load(self.ctx, &keys::element_tag_tkey(tag))?;
            self.tags.insert(tag.to_string(), bucket);
        }
        self.dirty_tags.insert(tag.to_string());
        Ok(self.tags.get_mut(tag).unwrap())
    }

    fn label_mut(&mut self, label: u64) -> Result<&mut Vec<Element>> {
        if !self.labels.contains_key(&label) {
            let bucket = Self::load(self.ctx, &keys::element_label_tkey(label))?;
            self.labels.insert(label, bucket);
        }
        self.dirty_labels.insert(label);
        Ok(self.labels.get_mut(&label).unwrap())
    }

    /// Serializes every dirty bucket and writes all of them atomically.
    /// Emptied buckets become tombstones.
    fn flush(self) -> Result<()> {
        let mut batch = Vec::new();
        for coord in &self.dirty_blocks {
            batch.push(self.entry(keys::element_block_tkey(*coord), &self.blocks[coord])?);
        }
        for tag in &self.dirty_tags {
            batch.push(self.entry(keys::element_tag_tkey(tag), &self.tags[tag])?);
        }
        for label in &self.dirty_labels {
            batch.push(self.entry(keys::element_label_tkey(*label), &self.labels[label])?);
        }
        self.ctx.store.write_batch(batch)
    }

    fn entry(&self, index: Vec<u8>, bucket: &[Element]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let value = if bucket.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&normalize(bucket.to_vec()))?
        };
        Ok(self.ctx.batch_put(&index, value))
    }
}

/// Positional, tag, and label-indexed storage of synaptic elements for one
/// data instance.
pub struct AnnotationData<S: KeyStore> {
    name: String,
    instance: InstanceId,
    block_size: Point3d,
    store: Arc<S>,
    dag: Arc<VersionDag>,
    // element writes are serialized per instance
    write_mutex: Mutex<()>,
    labels: RwLock<Option<Arc<LabelData<S>>>>,
}

impl<S: KeyStore> AnnotationData<S> {
    pub fn new(
        name: impl Into<String>,
        instance: InstanceId,
        store: Arc<S>,
        dag: Arc<VersionDag>,
        block_size: Point3d,
    ) -> Self {
        AnnotationData {
            name: name.into(),
            instance,
            block_size,
            store,
            dag,
            write_mutex: Mutex::new(()),
            labels: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Syncs this instance with a companion label instance; element writes
    /// then maintain the label index through positional lookups.
    pub fn sync_labels(&self, labels: Arc<LabelData<S>>) {
        *self.labels.write().unwrap() = Some(labels);
    }

    fn labels(&self) -> Option<Arc<LabelData<S>>> {
        self.labels.read().unwrap().clone()
    }

    fn ctx(&self, version: VersionId) -> VersionedCtx<S> {
        VersionedCtx::new(self.dag.clone(), self.store.clone(), self.instance, version)
    }

    fn label_at(&self, version: VersionId, pos: Point3d) -> Result<u64> {
        match self.labels() {
            Some(labels) => labels.label_at_point(version, pos),
            None => Ok(0),
        }
    }

    /// Stores a batch of elements: grouped by block, merged into existing
    /// buckets with position as identity, with the affected tag and label
    /// buckets rewritten in the same atomic batch.
    pub fn put_elements(&self, version: VersionId, elements: Vec<Element>) -> Result<()> {
        let _write = self.write_mutex.lock()?;
        let ctx = self.ctx(version);
        let mut buckets = Buckets::new(&ctx);

        for elem in &elements {
            let coord = elem.pos.block_coord(self.block_size);
            let replaced = upsert(buckets.block_mut(coord)?, elem);

            // tags dropped by an overwrite lose their entry
            if let Some(old) = &replaced {
                for tag in &old.tags {
                    if !elem.tags.contains(tag) {
                        remove_at(buckets.tag_mut(tag)?, elem.pos);
                    }
                }
            }
            for tag in &elem.tags {
                upsert(buckets.tag_mut(tag)?, elem);
            }

            let label = self.label_at(version, elem.pos)?;
            if label != 0 {
                upsert(buckets.label_mut(label)?, elem);
            }
        }
        buckets.flush()
    }

    /// Every element whose position lies inside the box `[offset,
    /// offset+size)`, in normalized order.
    pub fn get_elements(&self, version: VersionId, size: Point3d, offset: Point3d) -> Result<Vec<Element>> {
        if size.x() <= 0 || size.y() <= 0 || size.z() <= 0 {
            return errinput!("invalid bounding box size {size}");
        }
        let max = Point3d([
            offset.x() + size.x() - 1,
            offset.y() + size.y() - 1,
            offset.z() + size.z() - 1,
        ]);
        let box_bounds = crate::geom::OptionalBounds::from_min_max(offset, max);
        let block_bounds = crate::geom::OptionalBounds::from_min_max(
            Point3d(offset.block_coord(self.block_size).0),
            Point3d(max.block_coord(self.block_size).0),
        );

        let ctx = self.ctx(version);
        let mut out = Vec::new();
        for (index, value) in ctx.scan_indexed(&[keys::TKEY_ELEMENT_BLOCK])? {
            let coord = keys::element_block_from_tkey(&index)?;
            if block_bounds.outside(Point3d(coord.0)) {
                continue;
            }
            let bucket: Vec<Element> = serde_json::from_slice(&value)?;
            out.extend(bucket.into_iter().filter(|e| !box_bounds.outside(e.pos)));
        }
        Ok(normalize(out))
    }

    /// Every element carrying the given tag, in normalized order.
    pub fn get_by_tag(&self, version: VersionId, tag: &str) -> Result<Vec<Element>> {
        let ctx = self.ctx(version);
        Ok(normalize(Buckets::load(&ctx, &keys::element_tag_tkey(tag))?))
    }

    /// Every element whose position carries the given label, in normalized
    /// order.
    pub fn get_by_label(&self, version: VersionId, label: u64) -> Result<Vec<Element>> {
        let ctx = self.ctx(version);
        Ok(normalize(Buckets::load(&ctx, &keys::element_label_tkey(label))?))
    }

    /// Finds the element at `pos`, tolerating an off-by-one source position:
    /// an exact match wins, else the nearest element within one voxel on
    /// every axis (ties broken by position order).
    fn find_element_near(&self, buckets: &mut Buckets<'_, S>, pos: Point3d) -> Result<Element> {
        let coord = pos.block_coord(self.block_size);
        if let Some(elem) = buckets.block(coord)?.iter().find(|e| e.pos == pos) {
            return Ok(elem.clone());
        }

        let min = Point3d([pos.x() - 1, pos.y() - 1, pos.z() - 1]);
        let max = Point3d([pos.x() + 1, pos.y() + 1, pos.z() + 1]);
        let min_block = min.block_coord(self.block_size);
        let max_block = max.block_coord(self.block_size);
        let mut best: Option<(i32, Point3d, Element)> = None;
        for z in min_block.z()..=max_block.z() {
            for y in min_block.y()..=max_block.y() {
                for x in min_block.x()..=max_block.x() {
                    for elem in buckets.block(BlockCoord::new(x, y, z))? {
                        let (dx, dy, dz) = (
                            (elem.pos.x() - pos.x()).abs(),
                            (elem.pos.y() - pos.y()).abs(),
                            (elem.pos.z() - pos.z()).abs(),
                        );
                        if dx > 1 || dy > 1 || dz > 1 {
                            continue;
                        }
                        let key = (dx + dy + dz, elem.pos);
                        if best.as_ref().is_none_or(|(d, p, _)| key < (*d, *p)) {
                            best = Some((key.0, key.1, elem.clone()));
                        }
                    }
                }
            }
        }
        match best {
            Some((_, _, elem)) => Ok(elem),
            None => Err(Error::NotFound),
        }
    }

    /// Relocates an element and rewrites every relationship targeting its
    /// old position in the buckets of its related elements, updating block,
    /// tag, and label membership as needed.
    pub fn move_element(&self, version: VersionId, from: Point3d, to: Point3d) -> Result<()> {
        let _write = self.write_mutex.lock()?;
        let ctx = self.ctx(version);
        let mut buckets = Buckets::new(&ctx);

        let source = self.find_element_near(&mut buckets, from)?;
        let old_pos = source.pos;

        remove_at(buckets.block_mut(old_pos.block_coord(self.block_size))?, old_pos);
        let mut moved = source;
        moved.pos = to;
        upsert(buckets.block_mut(to.block_coord(self.block_size))?, &moved);

        // repair backrefs in the buckets of every related position, plus the
        // old and new home blocks
        let mut repair_blocks: HashSet<BlockCoord> = HashSet::new();
        repair_blocks.insert(old_pos.block_coord(self.block_size));
        repair_blocks.insert(to.block_coord(self.block_size));
        for rel in &moved.rels {
            repair_blocks.insert(rel.to.block_coord(self.block_size));
        }
        let mut repaired: Vec<Element> = Vec::new();
        for coord in repair_blocks {
            for elem in buckets.block_mut(coord)?.iter_mut() {
                let mut changed = false;
                for rel in &mut elem.rels {
                    if rel.to == old_pos {
                        rel.to = to;
                        changed = true;
                    }
                }
                if changed {
                    repaired.push(elem.clone());
                }
            }
        }

        // secondary index upkeep for the moved element
        for tag in &moved.tags {
            let bucket = buckets.tag_mut(tag)?;
            remove_at(bucket, old_pos);
            upsert(bucket, &moved);
        }
        let old_label = self.label_at(version, old_pos)?;
        let new_label = self.label_at(version, to)?;
        if old_label != 0 {
            remove_at(buckets.label_mut(old_label)?, old_pos);
        }
        if new_label != 0 {
            upsert(buckets.label_mut(new_label)?, &moved);
        }

        // repaired partners keep their positions; refresh their copies
        for elem in &repaired {
            for tag in &elem.tags {
                upsert(buckets.tag_mut(tag)?, elem);
            }
            let label = self.label_at(version, elem.pos)?;
            if label != 0 {
                upsert(buckets.label_mut(label)?, elem);
            }
        }
        buckets.flush()
    }

    /// Removes the element at the exact position and strips every
    /// relationship referencing it from the related elements' buckets.
    pub fn delete_element(&self, version: VersionId, pos: Point3d) -> Result<()> {
        let _write = self.write_mutex.lock()?;
        let ctx = self.ctx(version);
        let mut buckets = Buckets::new(&ctx);

        let coord = pos.block_coord(self.block_size);
        let Some(deleted) = remove_at(buckets.block_mut(coord)?, pos) else {
            return Err(Error::NotFound);
        };

        let mut strip_blocks: HashSet<BlockCoord> = HashSet::new();
        strip_blocks.insert(coord);
        for rel in &deleted.rels {
            strip_blocks.insert(rel.to.block_coord(self.block_size));
        }
        let mut stripped: Vec<Element> = Vec::new();
        for block in strip_blocks {
            for elem in buckets.block_mut(block)?.iter_mut() {
                let before = elem.rels.len();
                elem.rels.retain(|r| r.to != pos);
                if elem.rels.len() != before {
                    stripped.push(elem.clone());
                }
            }
        }

        for tag in &deleted.tags {
            remove_at(buckets.tag_mut(tag)?, pos);
        }
        let label = self.label_at(version, pos)?;
        if label != 0 {
            remove_at(buckets.label_mut(label)?, pos);
        }

        for elem in &stripped {
            for tag in &elem.tags {
                upsert(buckets.tag_mut(tag)?, elem);
            }
            let label = self.label_at(version, elem.pos)?;
            if label != 0 {
                upsert(buckets.label_mut(label)?, elem);
            }
        }
        buckets.flush()
    }
}
