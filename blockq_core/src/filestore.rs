//! No-copy storage: blocks backed by byte ranges of external files.
//!
//! The [`FileManager`] keeps one JSON record per CID describing where the
//! block's bytes live. Nothing is copied; every read goes back to the original
//! file and re-verifies the range against the CID. Deleting a reference never
//! touches the external file.

use crate::block::Block;
use crate::blockstore::BlockStore;
use crate::error::{Error, Result};
use crate::hash::{cid_from_key, shard_key, verify_cid};
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Position of a block's bytes inside an external file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilestoreRef {
    pub cid: Cid,
    /// Absolute path of the backing file.
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

/// On-disk form of a reference.
#[derive(Debug, Serialize, Deserialize)]
struct RefRecord {
    cid: String,
    path: PathBuf,
    offset: u64,
    size: u64,
}

impl From<&FilestoreRef> for RefRecord {
    fn from(r: &FilestoreRef) -> Self {
        RefRecord {
            cid: r.cid.to_string(),
            path: r.path.clone(),
            offset: r.offset,
            size: r.size,
        }
    }
}

/// Reference registry implementing the block store interface.
#[derive(Debug)]
pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    /// Open (creating if needed) a reference directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn record_path(&self, cid: &Cid) -> PathBuf {
        let (shard, name) = shard_key(cid);
        self.root.join(shard).join(name)
    }

    /// Record that `reference.cid` can be read from the given file range.
    ///
    /// The range is read and hashed once up front so that a bad reference is
    /// rejected at registration rather than at first read.
    pub fn register(&self, reference: FilestoreRef) -> Result<()> {
        if !reference.path.is_absolute() {
            return Err(Error::invalid_input(format!(
                "filestore path must be absolute: {}",
                reference.path.display()
            )));
        }

        let data = read_range(&reference.path, reference.offset, reference.size).map_err(|e| {
            Error::invalid_input(format!(
                "cannot read {} [{}+{}]: {}",
                reference.path.display(),
                reference.offset,
                reference.size,
                e
            ))
        })?;
        if !verify_cid(&reference.cid, &data)? {
            return Err(Error::integrity_fault(
                reference.cid,
                format!("range of {} does not match", reference.path.display()),
            ));
        }

        let record_path = self.record_path(&reference.cid);
        let parent = record_path
            .parent()
            .ok_or_else(|| Error::backend("filestore record has no parent"))?;
        fs::create_dir_all(parent)?;

        let mut temp = tempfile::Builder::new().prefix(".tmp").tempfile_in(parent)?;
        serde_json::to_writer(&mut temp, &RefRecord::from(&reference))?;
        temp.flush()?;
        temp.persist(&record_path)?;

        debug!(cid = %reference.cid, path = %reference.path.display(), "filestore reference registered");
        Ok(())
    }

    /// Look up the reference for a CID.
    pub fn reference(&self, cid: &Cid) -> Result<FilestoreRef> {
        let path = self.record_path(cid);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::not_found(cid)),
            Err(e) => return Err(e.into()),
        };
        let record: RefRecord = serde_json::from_slice(&raw)?;
        Ok(FilestoreRef {
            cid: *cid,
            path: record.path,
            offset: record.offset,
            size: record.size,
        })
    }

    /// Every reference, ordered by CID.
    pub fn list(&self) -> Result<Vec<FilestoreRef>> {
        self.keys()?
            .iter()
            .map(|cid| self.reference(cid))
            .collect()
    }

    /// Re-read and re-hash every reference.
    pub fn verify_all(&self) -> Result<Vec<(Cid, Result<()>)>> {
        Ok(self
            .keys()?
            .into_iter()
            .map(|cid| {
                let outcome = self.get(&cid).map(|_| ());
                if let Err(e) = &outcome {
                    warn!(%cid, error = %e, "filestore reference failed verification");
                }
                (cid, outcome)
            })
            .collect())
    }
}

impl BlockStore for FileManager {
    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.record_path(cid).is_file())
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        let reference = self.reference(cid)?;
        let data = read_range(&reference.path, reference.offset, reference.size)
            .map_err(|e| Error::file_unavailable(&reference.path, e.to_string()))?;

        if !verify_cid(cid, &data)? {
            return Err(Error::integrity_fault(
                cid,
                format!("{} changed since it was added", reference.path.display()),
            ));
        }

        Ok(Block::new_unchecked(*cid, data))
    }

    fn put(&self, block: Block) -> Result<()> {
        Err(Error::invalid_input(format!(
            "filestore cannot store {} without a file position",
            block.cid()
        )))
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        match fs::remove_file(self.record_path(cid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::not_found(cid)),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<Cid>> {
        let mut keys = Vec::new();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&shard)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str()
                    && let Ok(cid) = cid_from_key(name)
                {
                    keys.push(cid);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn size(&self, cid: &Cid) -> Result<u64> {
        Ok(self.reference(cid)?.size)
    }
}

/// A plain store paired with a file manager.
///
/// Reads prefer the plain store, writes always go to the plain store, and a
/// delete removes the block from both.
pub struct Filestore {
    blocks: Arc<dyn BlockStore>,
    manager: Arc<FileManager>,
}

impl Filestore {
    pub fn new(blocks: Arc<dyn BlockStore>, manager: Arc<FileManager>) -> Self {
        Self { blocks, manager }
    }

    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    pub fn manager(&self) -> &Arc<FileManager> {
        &self.manager
    }
}

impl BlockStore for Filestore {
    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.has(cid)? || self.manager.has(cid)?)
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        match self.blocks.get(cid) {
            Err(e) if e.is_not_found() => self.manager.get(cid),
            other => other,
        }
    }

    fn put(&self, block: Block) -> Result<()> {
        self.blocks.put(block)
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        let plain = self.blocks.delete(cid);
        let referenced = self.manager.delete(cid);
        match (plain, referenced) {
            (Err(a), Err(b)) if a.is_not_found() && b.is_not_found() => Err(a),
            (Err(e), _) if !e.is_not_found() => Err(e),
            (_, Err(e)) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    fn keys(&self) -> Result<Vec<Cid>> {
        let mut keys = self.blocks.keys()?;
        keys.extend(self.manager.keys()?);
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Read exactly `size` bytes at `offset`.
fn read_range(path: &Path, offset: u64, size: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::new();
    file.take(size).read_to_end(&mut data)?;
    if (data.len() as u64) < size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("file is shorter than recorded ({} of {} bytes)", data.len(), size),
        ));
    }
    Ok(data)
}
