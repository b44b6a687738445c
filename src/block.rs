//! Palette-encoded label block codec.
//!
//! A block stores a dictionary of the unique labels it contains plus a
//! per-voxel index into that dictionary, so the distinct labels of a block
//! can be enumerated without materializing the voxel array. Layout:
//!
//! ```text
//! u8          index width (1, 2, or 4 bytes per voxel)
//! u8 * 3      reserved (0)
//! u32 LE * 3  block dimensions (nx, ny, nz)
//! u32 LE      dictionary length
//! u64 LE * n  label dictionary
//! uN  LE * v  per-voxel dictionary indices, ZYX order
//! ```

use std::collections::HashMap;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errdata;
use crate::error::Result;
use crate::geom::Point3d;

const HEADER_SIZE: usize = 20;

/// A decoded label block: dictionary plus voxel indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    size: Point3d,
    labels: Vec<u64>,
    indices: Vec<u32>,
}

impl Block {
    /// Builds a palette-encoded block from a flat label volume in ZYX order.
    pub fn from_label_volume(size: Point3d, voxels: &[u64]) -> Result<Self> {
        let prod = size.prod();
        if voxels.len() as i64 != prod {
            return errdata!("volume of {} voxels does not fill {size} block", voxels.len());
        }
        let mut labels = Vec::new();
        let mut positions: HashMap<u64, u32> = HashMap::new();
        let mut indices = Vec::with_capacity(voxels.len());
        for &label in voxels {
            let idx = *positions.entry(label).or_insert_with(|| {
                labels.push(label);
                (labels.len() - 1) as u32
            });
            indices.push(idx);
        }
        Ok(Block { size, labels, indices })
    }

    pub fn size(&self) -> Point3d {
        self.size
    }

    /// Distinct labels present in the block, without materializing voxels.
    /// The mutation indexer uses this fast path for presence flags.
    pub fn labels(&self) -> &[u64] {
        &self.labels
    }

    /// Materializes the flat voxel array in ZYX order. Only needed for
    /// sparse-volume reconstruction.
    pub fn make_label_volume(&self) -> Vec<u64> {
        self.indices.iter().map(|&i| self.labels[i as usize]).collect()
    }

    fn index_width(&self) -> u8 {
        match self.labels.len() {
            0..=0xff => 1,
            0x100..=0xffff => 2,
            _ => 4,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let width = self.index_width();
        let mut out =
            Vec::with_capacity(HEADER_SIZE + self.labels.len() * 8 + self.indices.len() * width as usize);
        out.push(width);
        out.extend_from_slice(&[0u8; 3]);
        for d in self.size.0 {
            out.write_u32::<LittleEndian>(d as u32).unwrap();
        }
        out.write_u32::<LittleEndian>(self.labels.len() as u32).unwrap();
        for &label in &self.labels {
            out.write_u64::<LittleEndian>(label).unwrap();
        }
        for &idx in &self.indices {
            match width {
                1 => out.write_u8(idx as u8).unwrap(),
                2 => out.write_u16::<LittleEndian>(idx as u16).unwrap(),
                _ => out.write_u32::<LittleEndian>(idx).unwrap(),
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return errdata!("block header truncated at {} bytes", data.len());
        }
        let mut reader = data;
        let width = reader.read_u8()?;
        if !matches!(width, 1 | 2 | 4) {
            return errdata!("invalid block index width {width}");
        }
        let mut reserved = [0u8; 3];
        std::io::Read::read_exact(&mut reader, &mut reserved)?;
        let nx = reader.read_u32::<LittleEndian>()? as i32;
        let ny = reader.read_u32::<LittleEndian>()? as i32;
        let nz = reader.read_u32::<LittleEndian>()? as i32;
        let size = Point3d([nx, ny, nz]);
        let prod = size.prod();
        if prod <= 0 {
            return errdata!("invalid block dimensions {size}");
        }
        let nlabels = reader.read_u32::<LittleEndian>()? as usize;
        if nlabels == 0 {
            return errdata!("block dictionary is empty");
        }

        let body = data.len() - HEADER_SIZE;
        let expect = nlabels * 8 + prod as usize * width as usize;
        if body != expect {
            return errdata!("block body is {body} bytes, expected {expect}");
        }

        let mut labels = Vec::with_capacity(nlabels);
        for _ in 0..nlabels {
            labels.push(reader.read_u64::<LittleEndian>()?);
        }
        let mut indices = Vec::with_capacity(prod as usize);
        for _ in 0..prod {
            let idx = match width {
                1 => reader.read_u8()? as u32,
                2 => reader.read_u16::<LittleEndian>()? as u32,
                _ => reader.read_u32::<LittleEndian>()?,
            };
            if idx as usize >= nlabels {
                return errdata!("voxel index {idx} outside dictionary of {nlabels}");
            }
            indices.push(idx);
        }
        Ok(Block { size, labels, indices })
    }
}
