//! Key space partitioning.
//!
//! A single flat ordered key-value store holds metadata, data-instance, and
//! version-qualified regions. Every well-formed key matches exactly one
//! layout:
//!
//! ```text
//! metadata key:  0x00 | type-specific bytes
//! data key:      0x01 | instance id (4, BE) | index bytes | version id (4, BE)
//! ```
//!
//! Index bytes are opaque here; versioned reads scan every key sharing the
//! `instance | index` prefix and resolve among the version suffixes.

use byteorder::{BigEndian, ByteOrder};

use crate::errdata;
use crate::error::Result;
use crate::geom::{BlockCoord, IZYX_SIZE};

/// Prefix byte of the metadata key family.
pub const METADATA_KEY_PREFIX: u8 = 0x00;
/// Prefix byte of the data key family.
pub const DATA_KEY_PREFIX: u8 = 0x01;

pub const INSTANCE_ID_SIZE: usize = 4;
pub const VERSION_ID_SIZE: usize = 4;

/// Local identifier of a named data instance within a repository.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

impl InstanceId {
    pub fn bytes(&self) -> [u8; INSTANCE_ID_SIZE] {
        self.0.to_be_bytes()
    }
}

/// Local identifier of a node in the version DAG. Version 0 denotes
/// metadata, which is DAG-independent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId(pub u32);

impl VersionId {
    pub fn bytes(&self) -> [u8; VERSION_ID_SIZE] {
        self.0.to_be_bytes()
    }
}

pub const MAX_VERSION_ID: VersionId = VersionId(u32::MAX);

/// Constructs a key in the metadata family.
pub fn metadata_key(index: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + index.len());
    key.push(METADATA_KEY_PREFIX);
    key.extend_from_slice(index);
    key
}

/// Extracts the type-specific index from a metadata key.
pub fn metadata_index(key: &[u8]) -> Result<&[u8]> {
    if key.first() != Some(&METADATA_KEY_PREFIX) {
        return errdata!("cannot extract metadata index from different keyspace");
    }
    Ok(&key[1..])
}

/// Key construction and parsing for one data instance at one version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataContext {
    pub instance: InstanceId,
    pub version: VersionId,
}

impl DataContext {
    pub fn new(instance: InstanceId, version: VersionId) -> Self {
        DataContext { instance, version }
    }

    /// `0x01 | instance`, the prefix shared by every key of this instance.
    pub fn instance_prefix(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + INSTANCE_ID_SIZE);
        key.push(DATA_KEY_PREFIX);
        key.extend_from_slice(&self.instance.bytes());
        key
    }

    /// Namespaced key for the given index bytes at this context's version.
    pub fn construct_key(&self, index: &[u8]) -> Vec<u8> {
        let mut key = self.instance_prefix();
        key.extend_from_slice(index);
        key.extend_from_slice(&self.version.bytes());
        key
    }

    /// The type-specific index component of an entire storage key.
    pub fn index_from_key<'a>(&self, key: &'a [u8]) -> Result<&'a [u8]> {
        if key.first() != Some(&DATA_KEY_PREFIX) {
            return errdata!("cannot extract data index from different keyspace");
        }
        let start = 1 + INSTANCE_ID_SIZE;
        if key.len() < start + VERSION_ID_SIZE {
            return errdata!("data key too short: {} bytes", key.len());
        }
        Ok(&key[start..key.len() - VERSION_ID_SIZE])
    }

    /// The version suffix of an entire storage key.
    pub fn version_from_key(&self, key: &[u8]) -> Result<VersionId> {
        if key.first() != Some(&DATA_KEY_PREFIX) {
            return errdata!("cannot extract version from different keyspace");
        }
        if key.len() < 1 + INSTANCE_ID_SIZE + VERSION_ID_SIZE {
            return errdata!("data key too short: {} bytes", key.len());
        }
        let v = BigEndian::read_u32(&key[key.len() - VERSION_ID_SIZE..]);
        Ok(VersionId(v))
    }

    /// Lower bound key bracketing every versioned copy of the given index.
    pub fn min_version_key(&self, index: &[u8]) -> Vec<u8> {
        let mut key = self.instance_prefix();
        key.extend_from_slice(index);
        key.extend_from_slice(&VersionId(0).bytes());
        key
    }

    /// Upper bound key bracketing every versioned copy of the given index.
    pub fn max_version_key(&self, index: &[u8]) -> Vec<u8> {
        let mut key = self.instance_prefix();
        key.extend_from_slice(index);
        key.extend_from_slice(&MAX_VERSION_ID.bytes());
        key
    }
}

// Type-specific key classes within a data instance. The class byte leads the
// index bytes so all records of one class are contiguous under the instance
// prefix.

/// Label block values keyed by IZYX coordinate.
pub const TKEY_LABEL_BLOCK: u8 = 0x10;
/// Per-label index (Meta) records keyed by label.
pub const TKEY_LABEL_INDEX: u8 = 0x11;
/// Annotation element buckets keyed by IZYX coordinate.
pub const TKEY_ELEMENT_BLOCK: u8 = 0x20;
/// Annotation element buckets keyed by tag.
pub const TKEY_ELEMENT_TAG: u8 = 0x21;
/// Annotation element buckets keyed by label.
pub const TKEY_ELEMENT_LABEL: u8 = 0x22;

fn class_coord_tkey(class: u8, coord: BlockCoord) -> Vec<u8> {
    let mut index = Vec::with_capacity(1 + IZYX_SIZE);
    index.push(class);
    index.extend_from_slice(&coord.to_izyx());
    index
}

fn coord_from_class_tkey(class: u8, index: &[u8]) -> Result<BlockCoord> {
    if index.first() != Some(&class) {
        return errdata!("index bytes are not class {class:#04x}");
    }
    BlockCoord::from_izyx(&index[1..])
}

/// Index bytes for a label block at the given coordinate.
pub fn block_tkey(coord: BlockCoord) -> Vec<u8> {
    class_coord_tkey(TKEY_LABEL_BLOCK, coord)
}

pub fn block_from_tkey(index: &[u8]) -> Result<BlockCoord> {
    coord_from_class_tkey(TKEY_LABEL_BLOCK, index)
}

/// Index bytes for a single-label, instance-scoped Meta record.
pub fn label_index_tkey(label: u64) -> Vec<u8> {
    let mut index = Vec::with_capacity(9);
    index.push(TKEY_LABEL_INDEX);
    index.extend_from_slice(&label.to_be_bytes());
    index
}

pub fn label_from_index_tkey(index: &[u8]) -> Result<u64> {
    if index.len() != 9 || index[0] != TKEY_LABEL_INDEX {
        return errdata!("index bytes are not a label index key");
    }
    Ok(u64::from_be_bytes(index[1..9].try_into().unwrap()))
}

/// Index bytes for the annotation bucket of a block.
pub fn element_block_tkey(coord: BlockCoord) -> Vec<u8> {
    class_coord_tkey(TKEY_ELEMENT_BLOCK, coord)
}

pub fn element_block_from_tkey(index: &[u8]) -> Result<BlockCoord> {
    coord_from_class_tkey(TKEY_ELEMENT_BLOCK, index)
}

/// Index bytes for the annotation bucket of a tag. The tag is
/// null-terminated so a shorter tag's version scan cannot pick up keys of a
/// longer tag sharing its prefix.
pub fn element_tag_tkey(tag: &str) -> Vec<u8> {
    let mut index = Vec::with_capacity(2 + tag.len());
    index.push(TKEY_ELEMENT_TAG);
    index.extend_from_slice(tag.as_bytes());
    index.push(0x00);
    index
}

/// Index bytes for the annotation bucket of a label.
pub fn element_label_tkey(label: u64) -> Vec<u8> {
    let mut index = Vec::with_capacity(9);
    index.push(TKEY_ELEMENT_LABEL);
    index.extend_from_slice(&label.to_be_bytes());
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_key_roundtrip() {
        let key = metadata_key(b"repos");
        assert_eq!(key[0], METADATA_KEY_PREFIX);
        assert_eq!(metadata_index(&key).unwrap(), b"repos");
    }

    #[test]
    fn test_metadata_wrong_keyspace() {
        let ctx = DataContext::new(InstanceId(1), VersionId(2));
        let key = ctx.construct_key(b"idx");
        assert!(metadata_index(&key).is_err());
    }

    #[test]
    fn test_data_key_roundtrip() {
        let ctx = DataContext::new(InstanceId(7), VersionId(3));
        let index = block_tkey(BlockCoord::new(1, 2, 3));
        let key = ctx.construct_key(&index);

        assert_eq!(key[0], DATA_KEY_PREFIX);
        assert_eq!(ctx.index_from_key(&key).unwrap(), &index[..]);
        assert_eq!(ctx.version_from_key(&key).unwrap(), VersionId(3));
        assert_eq!(block_from_tkey(&index).unwrap(), BlockCoord::new(1, 2, 3));
    }

    #[test]
    fn test_data_wrong_keyspace() {
        let ctx = DataContext::new(InstanceId(7), VersionId(3));
        assert!(ctx.index_from_key(&metadata_key(b"x")).is_err());
    }

    #[test]
    fn test_version_bracket_contains_all_versions() {
        let index = label_index_tkey(42);
        let ctx = DataContext::new(InstanceId(1), VersionId(9));
        let min = ctx.min_version_key(&index);
        let max = ctx.max_version_key(&index);
        for v in [0u32, 1, 9, u32::MAX] {
            let key = DataContext::new(InstanceId(1), VersionId(v)).construct_key(&index);
            assert!(min <= key && key <= max, "version {v} outside bracket");
        }
    }

    #[test]
    fn test_label_index_tkey_roundtrip() {
        let index = label_index_tkey(u64::MAX - 3);
        assert_eq!(label_from_index_tkey(&index).unwrap(), u64::MAX - 3);
        assert!(label_from_index_tkey(&block_tkey(BlockCoord::default())).is_err());
    }

    #[test]
    fn test_tag_prefix_does_not_bleed_into_longer_tag() {
        // the version bracket of tag "a" must exclude every key of tag "ab"
        let ctx = DataContext::new(InstanceId(1), VersionId(1));
        let min = ctx.min_version_key(&element_tag_tkey("a"));
        let max = ctx.max_version_key(&element_tag_tkey("a"));
        let ab = ctx.construct_key(&element_tag_tkey("ab"));
        assert!(ab < min || ab > max);
    }

    #[test]
    fn test_tkey_classes_partition_instance_space() {
        // All blocks sort before all label indexes under the same instance.
        let ctx = DataContext::new(InstanceId(1), VersionId(1));
        let block_key = ctx.construct_key(&block_tkey(BlockCoord::new(i32::MAX, 0, 0)));
        let meta_key = ctx.construct_key(&label_index_tkey(0));
        assert!(block_key < meta_key);
    }
}
