//! Binary framing for block files in the flat-fs store.
//!
//! Every block file is a 16-byte header followed by the payload:
//!
//! ```text
//! 0x00  4   "BLKQ" magic
//! 0x04  1   version (u8) = 1
//! 0x05  1   codec: 1=raw, 2=node
//! 0x06  1   algo: 1=blake3-256, 2=sha2-256
//! 0x07  1   compression: 0=none, 1=zstd
//! 0x08  8   payload_len (u64 LE) - stored (possibly compressed) size
//! 0x10  ... payload
//! ```
//!
//! The header is informational; the CID in the file name stays authoritative
//! and every read re-verifies the decompressed payload against it.

use crate::error::{Error, Result};
use crate::hash::{Algorithm, Codec};

/// Magic bytes at the start of every block file.
pub const MAGIC: &[u8; 4] = b"BLKQ";

/// Current block file format version.
pub const VERSION: u8 = 1;

/// Size of the block file header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Compression types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression.
    None = 0,
    /// Zstandard compression.
    Zstd = 1,
}

impl CompressionType {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            _ => Err(Error::backend(format!("Invalid compression type: {}", value))),
        }
    }
}

fn codec_id(codec: Codec) -> u8 {
    match codec {
        Codec::Raw => 1,
        Codec::Node => 2,
    }
}

fn codec_from_id(id: u8) -> Result<Codec> {
    match id {
        1 => Ok(Codec::Raw),
        2 => Ok(Codec::Node),
        _ => Err(Error::backend(format!("Invalid codec id: {}", id))),
    }
}

fn algo_id(algorithm: Algorithm) -> u8 {
    match algorithm {
        Algorithm::Blake3 => 1,
        Algorithm::Sha2_256 => 2,
    }
}

fn algo_from_id(id: u8) -> Result<Algorithm> {
    match id {
        1 => Ok(Algorithm::Blake3),
        2 => Ok(Algorithm::Sha2_256),
        _ => Err(Error::unsupported_algorithm(format!("ID {}", id))),
    }
}

/// A 16-byte block file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u8,
    pub codec: Codec,
    pub algorithm: Algorithm,
    pub compression: CompressionType,
    /// Length of the stored payload in bytes.
    pub payload_len: u64,
}

impl BlockHeader {
    pub fn new(
        codec: Codec,
        algorithm: Algorithm,
        compression: CompressionType,
        payload_len: u64,
    ) -> Self {
        Self {
            version: VERSION,
            codec,
            algorithm,
            compression,
            payload_len,
        }
    }

    /// Encode the header to a 16-byte array.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = self.version;
        buf[5] = codec_id(self.codec);
        buf[6] = algo_id(self.algorithm);
        buf[7] = self.compression.to_u8();
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Decode a header from at least 16 bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::backend(format!(
                "Header too short: {} bytes (expected {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        if &buf[0..4] != MAGIC {
            return Err(Error::backend(format!(
                "Invalid magic: expected {:?}, got {:?}",
                MAGIC,
                &buf[0..4]
            )));
        }

        let version = buf[4];
        if version != VERSION {
            return Err(Error::backend(format!(
                "Unsupported block file version: {}",
                version
            )));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[8..16]);

        Ok(Self {
            version,
            codec: codec_from_id(buf[5])?,
            algorithm: algo_from_id(buf[6])?,
            compression: CompressionType::from_u8(buf[7])?,
            payload_len: u64::from_le_bytes(len_bytes),
        })
    }
}
