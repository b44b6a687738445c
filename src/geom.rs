use std::cmp::Ordering;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::errdata;
use crate::error::Result;

/// Byte length of a packed IZYX block coordinate.
pub const IZYX_SIZE: usize = 12;

/// A 3d point or extent in voxel coordinates, ordered (x, y, z).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Point3d(pub [i32; 3]);

impl Point3d {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Point3d([x, y, z])
    }

    pub fn x(&self) -> i32 {
        self.0[0]
    }

    pub fn y(&self) -> i32 {
        self.0[1]
    }

    pub fn z(&self) -> i32 {
        self.0[2]
    }

    /// Product of the three components, e.g. voxels per block.
    pub fn prod(&self) -> i64 {
        self.0[0] as i64 * self.0[1] as i64 * self.0[2] as i64
    }

    /// The block containing this point for the given block dimensions.
    /// Uses floor division so negative coordinates land in negative blocks.
    pub fn block_coord(&self, block_size: Point3d) -> BlockCoord {
        BlockCoord([
            self.0[0].div_euclid(block_size.0[0]),
            self.0[1].div_euclid(block_size.0[1]),
            self.0[2].div_euclid(block_size.0[2]),
        ])
    }
}

impl fmt::Display for Point3d {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{},{})", self.0[0], self.0[1], self.0[2])
    }
}

/// A block coordinate, stored (x, y, z) but ordered Z-then-Y-then-X to match
/// the lexicographic order of its packed IZYX form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockCoord(pub [i32; 3]);

impl BlockCoord {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        BlockCoord([x, y, z])
    }

    pub fn x(&self) -> i32 {
        self.0[0]
    }

    pub fn y(&self) -> i32 {
        self.0[1]
    }

    pub fn z(&self) -> i32 {
        self.0[2]
    }

    /// Packs (z, y, x) as big-endian with the sign bit flipped on each
    /// component, so byte-wise lexicographic order equals numeric ZYX order.
    pub fn to_izyx(self) -> [u8; IZYX_SIZE] {
        let mut buf = [0u8; IZYX_SIZE];
        BigEndian::write_u32(&mut buf[0..4], order_preserving(self.0[2]));
        BigEndian::write_u32(&mut buf[4..8], order_preserving(self.0[1]));
        BigEndian::write_u32(&mut buf[8..12], order_preserving(self.0[0]));
        buf
    }

    pub fn from_izyx(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != IZYX_SIZE {
            return errdata!("cannot unpack IZYX coordinate from {} bytes", bytes.len());
        }
        let z = from_order_preserving(BigEndian::read_u32(&bytes[0..4]));
        let y = from_order_preserving(BigEndian::read_u32(&bytes[4..8]));
        let x = from_order_preserving(BigEndian::read_u32(&bytes[8..12]));
        Ok(BlockCoord([x, y, z]))
    }

    /// Minimum voxel coordinate covered by this block.
    pub fn min_point(&self, block_size: Point3d) -> Point3d {
        Point3d([
            self.0[0] * block_size.0[0],
            self.0[1] * block_size.0[1],
            self.0[2] * block_size.0[2],
        ])
    }

    /// Maximum voxel coordinate covered by this block (inclusive).
    pub fn max_point(&self, block_size: Point3d) -> Point3d {
        Point3d([
            (self.0[0] + 1) * block_size.0[0] - 1,
            (self.0[1] + 1) * block_size.0[1] - 1,
            (self.0[2] + 1) * block_size.0[2] - 1,
        ])
    }

    /// Deterministic routing hash folding the packed coordinate into a bucket.
    pub fn hash(&self, buckets: usize) -> usize {
        let izyx = self.to_izyx();
        let mut h = 0u32;
        for chunk in izyx.chunks(4) {
            h ^= BigEndian::read_u32(chunk);
            h = h.rotate_left(5);
        }
        (h as usize) % buckets.max(1)
    }
}

impl PartialOrd for BlockCoord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockCoord {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = [self.0[2], self.0[1], self.0[0]];
        let b = [other.0[2], other.0[1], other.0[0]];
        a.cmp(&b)
    }
}

impl fmt::Display for BlockCoord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{},{})", self.0[0], self.0[1], self.0[2])
    }
}

// Flip the sign bit so negative values sort before positive in unsigned
// big-endian byte order.
fn order_preserving(v: i32) -> u32 {
    (v as u32) ^ 0x8000_0000
}

fn from_order_preserving(v: u32) -> i32 {
    (v ^ 0x8000_0000) as i32
}

/// Optional per-axis inclusive bounds used for clipping blocks or voxels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptionalBounds {
    pub min_x: Option<i32>,
    pub max_x: Option<i32>,
    pub min_y: Option<i32>,
    pub max_y: Option<i32>,
    pub min_z: Option<i32>,
    pub max_z: Option<i32>,
}

impl OptionalBounds {
    /// True if any axis carries a bound.
    pub fn is_set(&self) -> bool {
        self.min_x.is_some()
            || self.max_x.is_some()
            || self.min_y.is_some()
            || self.max_y.is_some()
            || self.min_z.is_some()
            || self.max_z.is_some()
    }

    pub fn bounded_x(&self) -> bool {
        self.min_x.is_some() || self.max_x.is_some()
    }

    pub fn bounded_y(&self) -> bool {
        self.min_y.is_some() || self.max_y.is_some()
    }

    pub fn bounded_z(&self) -> bool {
        self.min_z.is_some() || self.max_z.is_some()
    }

    pub fn outside_x(&self, x: i32) -> bool {
        self.min_x.is_some_and(|min| x < min) || self.max_x.is_some_and(|max| x > max)
    }

    pub fn outside_y(&self, y: i32) -> bool {
        self.min_y.is_some_and(|min| y < min) || self.max_y.is_some_and(|max| y > max)
    }

    pub fn outside_z(&self, z: i32) -> bool {
        self.min_z.is_some_and(|min| z < min) || self.max_z.is_some_and(|max| z > max)
    }

    pub fn outside(&self, p: Point3d) -> bool {
        self.outside_x(p.x()) || self.outside_y(p.y()) || self.outside_z(p.z())
    }

    /// Inclusive bounds covering [min, max].
    pub fn from_min_max(min: Point3d, max: Point3d) -> Self {
        OptionalBounds {
            min_x: Some(min.x()),
            max_x: Some(max.x()),
            min_y: Some(min.y()),
            max_y: Some(max.y()),
            min_z: Some(min.z()),
            max_z: Some(max.z()),
        }
    }
}

/// Block-level and voxel-level clipping for sparse volume requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Bounds {
    pub block: OptionalBounds,
    pub voxel: OptionalBounds,
    /// If true, runs are clipped exactly to the voxel bounds.
    pub exact: bool,
}
