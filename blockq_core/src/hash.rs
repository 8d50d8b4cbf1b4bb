//! Content identifiers: hash functions, codecs and CID construction.

use crate::error::{Error, Result};
use cid::Cid;
use cid::multihash::Multihash;
use sha2::{Digest, Sha256};
use std::fmt;

/// Digest size in bytes for every supported hash function.
pub const DIGEST_SIZE: usize = 32;

/// Supported multihash functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    /// BLAKE3 with 256-bit output.
    #[default]
    Blake3,
    /// SHA2 with 256-bit output.
    Sha2_256,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Blake3 => "blake3-256",
            Algorithm::Sha2_256 => "sha2-256",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blake3-256" | "blake3" => Ok(Algorithm::Blake3),
            "sha2-256" => Ok(Algorithm::Sha2_256),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }

    /// Multihash function code.
    pub fn code(&self) -> u64 {
        match self {
            Algorithm::Blake3 => 0x1e,
            Algorithm::Sha2_256 => 0x12,
        }
    }

    /// Parse algorithm from a multihash function code.
    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            0x1e => Ok(Algorithm::Blake3),
            0x12 => Ok(Algorithm::Sha2_256),
            _ => Err(Error::unsupported_algorithm(format!("multihash 0x{:x}", code))),
        }
    }

    /// Hash raw bytes into a multihash.
    pub fn digest(&self, data: &[u8]) -> Result<Multihash<64>> {
        let digest: [u8; DIGEST_SIZE] = match self {
            Algorithm::Blake3 => *blake3::hash(data).as_bytes(),
            Algorithm::Sha2_256 => Sha256::digest(data).into(),
        };
        Multihash::wrap(self.code(), &digest)
            .map_err(|e| Error::invalid_input(format!("multihash: {}", e)))
    }
}

/// Codec tags carried in a CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    /// Bare bytes with no framing.
    Raw,
    /// A DAG node in this crate's node encoding.
    Node,
}

impl Codec {
    /// Multicodec code.
    pub fn code(&self) -> u64 {
        match self {
            Codec::Raw => 0x55,
            // private-use multicodec range
            Codec::Node => 0x30_0001,
        }
    }

    /// Parse codec from a multicodec code.
    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            0x55 => Ok(Codec::Raw),
            0x30_0001 => Ok(Codec::Node),
            _ => Err(Error::invalid_input(format!("unknown codec 0x{:x}", code))),
        }
    }

    /// Name used on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Raw => "raw",
            Codec::Node => "node",
        }
    }

    /// Parse a codec name.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Codec::Raw),
            "node" => Ok(Codec::Node),
            _ => Err(Error::invalid_configuration(format!(
                "unrecognized format: {}",
                s
            ))),
        }
    }
}

/// Everything needed to derive a CID from bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidPrefix {
    pub codec: Codec,
    pub algorithm: Algorithm,
}

impl CidPrefix {
    pub fn new(codec: Codec, algorithm: Algorithm) -> Self {
        Self { codec, algorithm }
    }

    /// Compute the CIDv1 for `data`.
    pub fn sum(&self, data: &[u8]) -> Result<Cid> {
        let mh = self.algorithm.digest(data)?;
        Ok(Cid::new_v1(self.codec.code(), mh))
    }

    /// Recover the prefix a CID was built with.
    pub fn of(cid: &Cid) -> Result<Self> {
        Ok(Self {
            codec: Codec::from_code(cid.codec())?,
            algorithm: Algorithm::from_code(cid.hash().code())?,
        })
    }
}

impl fmt::Display for CidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.codec.as_str(), self.algorithm.as_str())
    }
}

/// Decode the base-encoded string form of a CID.
pub fn parse_cid(s: &str) -> Result<Cid> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::invalid_input("zero length cid invalid"));
    }
    s.parse::<Cid>()
        .map_err(|e| Error::invalid_input(format!("invalid content id: {} ({})", s, e)))
}

/// Recompute the hash of `data` under `cid`'s hash function and compare.
pub fn verify_cid(cid: &Cid, data: &[u8]) -> Result<bool> {
    let algorithm = Algorithm::from_code(cid.hash().code())?;
    let mh = algorithm.digest(data)?;
    Ok(mh.digest() == cid.hash().digest())
}

/// Split a CID into (shard directory, file name) for on-disk layouts.
///
/// The shard is the hex of the last digest byte, so that shards spread evenly
/// even though every CID shares the same version/codec prefix bytes.
pub fn shard_key(cid: &Cid) -> (String, String) {
    let digest = cid.hash().digest();
    let shard = hex::encode(&digest[digest.len().saturating_sub(1)..]);
    (shard, hex::encode(cid.to_bytes()))
}

/// Inverse of the file-name half of [`shard_key`].
pub fn cid_from_key(name: &str) -> Result<Cid> {
    let bytes =
        hex::decode(name).map_err(|e| Error::invalid_input(format!("Invalid hex: {}", e)))?;
    Ok(Cid::try_from(bytes.as_slice())?)
}
