//! Outer serialization envelope for stored values.
//!
//! Every stored value is wrapped as:
//!
//! ```text
//! [compression tag u8] [checksum tag u8] [crc32 u32 LE, if any] [payload]
//! ```
//!
//! The checksum covers the (possibly compressed) payload. Sparse-volume
//! output streams use the raw compression helpers instead, selected by name.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::{errdata, errinput};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Compression applied inside the envelope or to an output stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Gzip,
}

impl Compression {
    pub fn tag(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Gzip => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Gzip),
            _ => errdata!("unknown compression tag {tag:#04x}"),
        }
    }

    /// Parses the compression name used by output requests. The empty string
    /// means uncompressed. Unknown names are rejected before any work.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "gzip" => Ok(Compression::Gzip),
            _ => errinput!("unknown compression type {name:?}"),
        }
    }
}

/// Checksum applied to the enveloped payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Checksum {
    #[default]
    None,
    Crc32,
}

impl Checksum {
    fn tag(&self) -> u8 {
        match self {
            Checksum::None => 0,
            Checksum::Crc32 => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Checksum::None),
            1 => Ok(Checksum::Crc32),
            _ => errdata!("unknown checksum tag {tag:#04x}"),
        }
    }
}

/// Compresses a raw payload with no envelope, for output streams.
pub fn compress_payload(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

fn decompress_payload(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| crate::error::Error::InvalidData(format!("lz4 decompression: {e}"))),
        Compression::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// Wraps data in the compression+checksum envelope.
pub fn serialize_data(data: &[u8], compression: Compression, checksum: Checksum) -> Result<Vec<u8>> {
    let payload = compress_payload(data, compression)?;
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(compression.tag());
    out.push(checksum.tag());
    if checksum == Checksum::Crc32 {
        out.write_u32::<LittleEndian>(CRC32.checksum(&payload))?;
    }
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Unwraps an enveloped value, optionally verifying its checksum.
pub fn deserialize_data(data: &[u8], verify: bool) -> Result<Vec<u8>> {
    let mut reader = data;
    if data.len() < 2 {
        return errdata!("cannot deserialize envelope from {} bytes", data.len());
    }
    let compression = Compression::from_tag(reader.read_u8()?)?;
    let checksum = Checksum::from_tag(reader.read_u8()?)?;
    let stored = match checksum {
        Checksum::None => None,
        Checksum::Crc32 => Some(reader.read_u32::<LittleEndian>()?),
    };
    if verify {
        if let Some(stored) = stored {
            let computed = CRC32.checksum(reader);
            if computed != stored {
                return errdata!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}");
            }
        }
    }
    decompress_payload(reader, compression)
}
