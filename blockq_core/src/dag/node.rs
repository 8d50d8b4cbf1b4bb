//! DAG node encoding.
//!
//! A node is a kind tag, an ordered list of links, the byte size of each
//! file child, and an inline data payload:
//!
//! ```text
//! 1 byte   kind (1=file, 2=directory, 3=symlink)
//! 4 bytes  link count (u32 LE)
//! per link:
//!   1 byte   cid length
//!   N bytes  cid (binary)
//!   8 bytes  tsize (u64 LE)
//!   2 bytes  name length (u16 LE, 0 = unnamed)
//!   N bytes  name (UTF-8)
//! 4 bytes  blocksize count (u32 LE)
//! 8 bytes  per blocksize (u64 LE)
//! 8 bytes  data length (u64 LE)
//! N bytes  data
//! ```
//!
//! Directory links are kept sorted bytewise by name so that the same set of
//! entries always encodes to the same bytes.

use crate::block::Block;
use crate::error::{Error, Result};
use crate::hash::{Algorithm, CidPrefix, Codec};
use cid::Cid;
use std::io::{Cursor, Read};

/// Kind of a DAG node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// File data: inline bytes plus child file nodes or raw leaves.
    File = 1,
    /// Named links to files, directories and symlinks.
    Directory = 2,
    /// The data payload is the link target.
    Symlink = 3,
}

impl NodeKind {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(NodeKind::File),
            2 => Ok(NodeKind::Directory),
            3 => Ok(NodeKind::Symlink),
            _ => Err(malformed(format!("Invalid node kind: {}", value))),
        }
    }
}

/// A link to a child block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub cid: Cid,
    /// Cumulative size of the child subtree as stored.
    pub tsize: u64,
    /// Entry name; set for directory entries only.
    pub name: Option<String>,
}

impl Link {
    pub fn new(cid: Cid, tsize: u64) -> Self {
        Self {
            cid,
            tsize,
            name: None,
        }
    }

    /// A named directory entry.
    pub fn named(name: impl Into<String>, cid: Cid, tsize: u64) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            cid,
            tsize,
            name: Some(name),
        })
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let cid = self.cid.to_bytes();
        buf.push(cid.len() as u8);
        buf.extend_from_slice(&cid);
        buf.extend_from_slice(&self.tsize.to_le_bytes());

        let name = self.name.as_deref().unwrap_or("");
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
    }

    fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let cid_len = read_u8(reader)? as usize;
        let mut cid_buf = vec![0u8; cid_len];
        reader.read_exact(&mut cid_buf).map_err(truncated)?;
        let cid = Cid::try_from(cid_buf.as_slice())?;

        let tsize = read_u64(reader)?;

        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).map_err(truncated)?;
        let name_len = u16::from_le_bytes(len_buf) as usize;

        let name = if name_len == 0 {
            None
        } else {
            let mut name_buf = vec![0u8; name_len];
            reader.read_exact(&mut name_buf).map_err(truncated)?;
            let name = String::from_utf8(name_buf)
                .map_err(|e| malformed(format!("Invalid UTF-8 in name: {}", e)))?;
            validate_name(&name)?;
            Some(name)
        };

        Ok(Self { cid, tsize, name })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_input("Name cannot be empty"));
    }
    if name.len() > 255 {
        return Err(Error::invalid_input(format!(
            "Name too long: {} bytes (max 255)",
            name.len()
        )));
    }
    if name.contains('\0') || name.contains('/') {
        return Err(Error::invalid_input(format!(
            "Name cannot contain null bytes or '/': {:?}",
            name
        )));
    }
    Ok(())
}

/// A decoded DAG node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagNode {
    pub kind: NodeKind,
    pub data: Vec<u8>,
    pub links: Vec<Link>,
    /// File size under each link, for file nodes.
    pub blocksizes: Vec<u64>,
}

impl DagNode {
    /// A wrapped leaf holding `data` inline.
    pub fn file_leaf(data: Vec<u8>) -> Self {
        Self {
            kind: NodeKind::File,
            data,
            links: Vec::new(),
            blocksizes: Vec::new(),
        }
    }

    /// An internal file node.
    pub fn file(links: Vec<Link>, blocksizes: Vec<u64>) -> Self {
        Self {
            kind: NodeKind::File,
            data: Vec::new(),
            links,
            blocksizes,
        }
    }

    /// A directory over named entries, sorted by name.
    pub fn directory(mut entries: Vec<Link>) -> Self {
        entries.sort_by(|a, b| {
            let a = a.name.as_deref().unwrap_or("");
            let b = b.name.as_deref().unwrap_or("");
            a.as_bytes().cmp(b.as_bytes())
        });
        Self {
            kind: NodeKind::Directory,
            data: Vec::new(),
            links: entries,
            blocksizes: Vec::new(),
        }
    }

    pub fn symlink(target: &str) -> Self {
        Self {
            kind: NodeKind::Symlink,
            data: target.as_bytes().to_vec(),
            links: Vec::new(),
            blocksizes: Vec::new(),
        }
    }

    /// Logical file size of the subtree rooted here.
    pub fn filesize(&self) -> u64 {
        self.data.len() as u64 + self.blocksizes.iter().sum::<u64>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.data.len() + self.links.len() * 64);

        buf.push(self.kind.to_u8());

        buf.extend_from_slice(&(self.links.len() as u32).to_le_bytes());
        for link in &self.links {
            link.encode_into(&mut buf);
        }

        buf.extend_from_slice(&(self.blocksizes.len() as u32).to_le_bytes());
        for size in &self.blocksizes {
            buf.extend_from_slice(&size.to_le_bytes());
        }

        buf.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.data);

        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);

        let kind = NodeKind::from_u8(read_u8(&mut reader)?)?;

        let link_count = read_u32(&mut reader)? as usize;
        let mut links = Vec::with_capacity(link_count.min(1024));
        for _ in 0..link_count {
            links.push(Link::decode(&mut reader)?);
        }

        let size_count = read_u32(&mut reader)? as usize;
        let mut blocksizes = Vec::with_capacity(size_count.min(1024));
        for _ in 0..size_count {
            blocksizes.push(read_u64(&mut reader)?);
        }

        let data_len = read_u64(&mut reader)?;
        let remaining = data.len() as u64 - reader.position();
        if data_len != remaining {
            return Err(malformed(format!(
                "Data length mismatch: declared {}, found {}",
                data_len, remaining
            )));
        }
        let mut payload = Vec::with_capacity(remaining as usize);
        reader.read_to_end(&mut payload)?;

        Ok(Self {
            kind,
            data: payload,
            links,
            blocksizes,
        })
    }

    /// Encode and hash into a node block.
    pub fn to_block(&self, algorithm: Algorithm) -> Result<Block> {
        Block::new(CidPrefix::new(Codec::Node, algorithm), self.encode())
    }
}

fn malformed(reason: impl std::fmt::Display) -> Error {
    Error::invalid_input(format!("malformed node: {}", reason))
}

fn truncated(e: std::io::Error) -> Error {
    malformed(e)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(u64::from_le_bytes(buf))
}
