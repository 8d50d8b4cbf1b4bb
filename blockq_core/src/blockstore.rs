//! Block store interface and its plain backends.

use crate::block::Block;
use crate::error::{Error, Result};
use crate::gc_lock::GcLocker;
use crate::hash::{CidPrefix, cid_from_key, shard_key, verify_cid};
use crate::object::{BlockHeader, CompressionType, HEADER_SIZE};
use cid::Cid;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, instrument};

/// Compression threshold: payloads >= 4KB are compressed.
const COMPRESSION_THRESHOLD: usize = 4096;

/// Durable mapping from CID to bytes.
///
/// `get`, `delete` and `size` of an absent CID fail with [`Error::NotFound`];
/// every other failure is a backend failure.
pub trait BlockStore: Send + Sync {
    fn has(&self, cid: &Cid) -> Result<bool>;
    fn get(&self, cid: &Cid) -> Result<Block>;
    /// Store a block. Storing a CID that is already present is a no-op.
    fn put(&self, block: Block) -> Result<()>;
    fn delete(&self, cid: &Cid) -> Result<()>;
    /// Every CID currently held.
    fn keys(&self) -> Result<Vec<Cid>>;
    /// Logical size of a block in bytes.
    fn size(&self, cid: &Cid) -> Result<u64> {
        Ok(self.get(cid)?.len() as u64)
    }
}

/// The capability to delete blocks by CID.
pub trait Deleter {
    fn delete_block(&self, cid: &Cid) -> Result<()>;
}

impl<T: BlockStore + ?Sized> Deleter for T {
    fn delete_block(&self, cid: &Cid) -> Result<()> {
        self.delete(cid)
    }
}

impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    fn has(&self, cid: &Cid) -> Result<bool> {
        (**self).has(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        (**self).get(cid)
    }

    fn put(&self, block: Block) -> Result<()> {
        (**self).put(block)
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        (**self).delete(cid)
    }

    fn keys(&self) -> Result<Vec<Cid>> {
        (**self).keys()
    }

    fn size(&self, cid: &Cid) -> Result<u64> {
        (**self).size(cid)
    }
}

/// One file per block under `<root>/<shard>/<cid hex>`.
#[derive(Debug)]
pub struct FlatFsBlockstore {
    root: PathBuf,
}

impl FlatFsBlockstore {
    /// Open (creating if needed) a block directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to a block file given its CID.
    pub fn block_path(&self, cid: &Cid) -> PathBuf {
        let (shard, name) = shard_key(cid);
        self.root.join(shard).join(name)
    }

    /// Read a block file: header, then payload of the declared length.
    fn read_block_file(&self, cid: &Cid, path: &Path) -> Result<Vec<u8>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::not_found(cid)),
            Err(e) => return Err(e.into()),
        };
        let header = BlockHeader::decode(&raw)?;
        let payload = &raw[HEADER_SIZE..];

        if payload.len() as u64 != header.payload_len {
            return Err(Error::integrity_fault(
                cid,
                format!(
                    "Payload length mismatch: expected {}, got {}",
                    header.payload_len,
                    payload.len()
                ),
            ));
        }

        match header.compression {
            CompressionType::None => Ok(payload.to_vec()),
            CompressionType::Zstd => decompress_zstd(payload),
        }
    }

    /// Write a block file atomically using tempfile.
    fn write_block_atomic(&self, path: &Path, header: &BlockHeader, payload: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::backend(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut temp_file = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(parent)?;
        temp_file.write_all(&header.encode())?;
        temp_file.write_all(payload)?;
        temp_file.flush()?;
        temp_file.persist(path)?;

        Ok(())
    }
}

impl BlockStore for FlatFsBlockstore {
    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.block_path(cid).is_file())
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        let path = self.block_path(cid);
        let data = self.read_block_file(cid, &path)?;

        // Verify hash matches (corruption detection)
        if !verify_cid(cid, &data)? {
            return Err(Error::integrity_fault(
                cid,
                format!("stored bytes at {} do not match", path.display()),
            ));
        }

        Ok(Block::new_unchecked(*cid, data))
    }

    #[instrument(skip(self, block), fields(cid = %block.cid()), level = "debug")]
    fn put(&self, block: Block) -> Result<()> {
        let path = self.block_path(block.cid());

        // Deduplication: skip if already exists
        if path.exists() {
            return Ok(());
        }

        let prefix = CidPrefix::of(block.cid())?;
        let (payload, compression) = if block.len() >= COMPRESSION_THRESHOLD {
            (compress_zstd(block.data())?, CompressionType::Zstd)
        } else {
            (block.data().to_vec(), CompressionType::None)
        };

        let header = BlockHeader::new(
            prefix.codec,
            prefix.algorithm,
            compression,
            payload.len() as u64,
        );
        self.write_block_atomic(&path, &header, &payload)?;
        debug!(bytes = block.len(), "block written");

        Ok(())
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        let path = self.block_path(cid);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::not_found(cid)),
            Err(e) => return Err(e.into()),
        }

        // Remove empty shard directories
        if let Some(shard) = path.parent()
            && let Ok(mut entries) = fs::read_dir(shard)
            && entries.next().is_none()
        {
            let _ = fs::remove_dir(shard);
        }

        Ok(())
    }

    fn keys(&self) -> Result<Vec<Cid>> {
        let mut keys = Vec::new();

        for shard_entry in fs::read_dir(&self.root)? {
            let shard_path = shard_entry?.path();
            if !shard_path.is_dir() {
                continue;
            }

            for block_entry in fs::read_dir(&shard_path)? {
                let block_path = block_entry?.path();
                if !block_path.is_file() {
                    continue;
                }

                let name = block_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("");
                // In-flight temp files and foreign files are not blocks
                if let Ok(cid) = cid_from_key(name) {
                    keys.push(cid);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Non-persistent store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBlockstore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total stored bytes.
    pub fn total_bytes(&self) -> u64 {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|d| d.len() as u64)
            .sum()
    }
}

impl BlockStore for MemoryBlockstore {
    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(cid))
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cid)
            .map(|data| Block::new_unchecked(*cid, data.clone()))
            .ok_or_else(|| Error::not_found(cid))
    }

    fn put(&self, block: Block) -> Result<()> {
        let cid = *block.cid();
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(cid)
            .or_insert_with(|| block.into_data());
        Ok(())
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(cid))
    }

    fn keys(&self) -> Result<Vec<Cid>> {
        let mut keys: Vec<Cid> = self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Wraps a store so that every write holds the shared GC lock.
///
/// Reads and deletes pass straight through: deletes only ever run inside an
/// exclusive GC section, and pin checks read blocks while that section is held.
#[derive(Debug)]
pub struct GcBlockstore<B> {
    inner: B,
    locker: Arc<GcLocker>,
}

impl<B: BlockStore> GcBlockstore<B> {
    pub fn new(inner: B, locker: Arc<GcLocker>) -> Self {
        Self { inner, locker }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn locker(&self) -> &Arc<GcLocker> {
        &self.locker
    }
}

impl<B: BlockStore> BlockStore for GcBlockstore<B> {
    fn has(&self, cid: &Cid) -> Result<bool> {
        self.inner.has(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        self.inner.get(cid)
    }

    fn put(&self, block: Block) -> Result<()> {
        let _shared = self.locker.shared_lock();
        self.inner.put(block)
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        self.inner.delete(cid)
    }

    fn keys(&self) -> Result<Vec<Cid>> {
        self.inner.keys()
    }

    fn size(&self, cid: &Cid) -> Result<u64> {
        self.inner.size(cid)
    }
}

/// Compress data using zstd.
fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::encode_all(data, 3) // Level 3 = fast compression
        .map_err(|e| Error::backend(format!("zstd compression failed: {}", e)))
}

/// Decompress data using zstd.
fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(data)
        .map_err(|e| Error::backend(format!("zstd decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hash::{Algorithm, Codec};
    use tempfile::TempDir;

    fn raw_block(data: &[u8]) -> Block {
        Block::new(CidPrefix::new(Codec::Raw, Algorithm::Blake3), data.to_vec()).unwrap()
    }

    #[test]
    fn test_flatfs_put_get() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFsBlockstore::open(temp_dir.path()).unwrap();

        let block = raw_block(b"hello world");
        let cid = *block.cid();
        store.put(block).unwrap();

        assert!(store.has(&cid).unwrap());
        assert_eq!(store.get(&cid).unwrap().data(), b"hello world");
        assert_eq!(store.size(&cid).unwrap(), 11);
    }

    #[test]
    fn test_flatfs_large_block_compressed_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFsBlockstore::open(temp_dir.path()).unwrap();

        let data = vec![0xAB; 64 * 1024];
        let block = raw_block(&data);
        let cid = *block.cid();
        store.put(block).unwrap();

        let on_disk = fs::read(store.block_path(&cid)).unwrap();
        let header = BlockHeader::decode(&on_disk).unwrap();
        assert_eq!(header.compression, CompressionType::Zstd);
        assert!(on_disk.len() < data.len());

        assert_eq!(store.get(&cid).unwrap().data(), &data[..]);
    }

    #[test]
    fn test_flatfs_missing_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFsBlockstore::open(temp_dir.path()).unwrap();
        let cid = *raw_block(b"nope").cid();

        assert!(!store.has(&cid).unwrap());
        assert_eq!(store.get(&cid).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(store.delete(&cid).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_flatfs_corruption_detection() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFsBlockstore::open(temp_dir.path()).unwrap();

        let block = raw_block(b"test");
        let cid = *block.cid();
        store.put(block).unwrap();

        // Modify a byte in the payload (after the 16-byte header)
        let path = store.block_path(&cid);
        let mut file_data = fs::read(&path).unwrap();
        file_data[HEADER_SIZE] ^= 0xFF;
        fs::write(&path, file_data).unwrap();

        assert_eq!(store.get(&cid).unwrap_err().kind(), ErrorKind::IntegrityFault);
    }

    #[test]
    fn test_flatfs_delete_and_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFsBlockstore::open(temp_dir.path()).unwrap();

        let a = raw_block(b"a");
        let b = raw_block(b"b");
        let (cid_a, cid_b) = (*a.cid(), *b.cid());
        store.put(a).unwrap();
        store.put(b).unwrap();

        let mut expected = vec![cid_a, cid_b];
        expected.sort();
        assert_eq!(store.keys().unwrap(), expected);

        store.delete(&cid_a).unwrap();
        assert!(!store.has(&cid_a).unwrap());
        assert_eq!(store.keys().unwrap(), vec![cid_b]);
    }

    #[test]
    fn test_flatfs_dedup_keeps_single_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFsBlockstore::open(temp_dir.path()).unwrap();

        store.put(raw_block(b"same")).unwrap();
        store.put(raw_block(b"same")).unwrap();
        assert_eq!(store.keys().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlockstore::new();
        let block = raw_block(b"mem");
        let cid = *block.cid();

        store.put(block).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 3);
        assert_eq!(store.get(&cid).unwrap().data(), b"mem");

        store.delete(&cid).unwrap();
        assert!(store.is_empty());
        assert!(store.delete(&cid).unwrap_err().is_not_found());
    }

    #[test]
    fn test_gc_blockstore_put_passes_through() {
        let locker = Arc::new(GcLocker::new());
        let store = GcBlockstore::new(MemoryBlockstore::new(), Arc::clone(&locker));

        let block = raw_block(b"locked write");
        let cid = *block.cid();
        store.put(block).unwrap();

        assert!(store.has(&cid).unwrap());
        assert!(store.inner().has(&cid).unwrap());
        assert!(!locker.gc_requested());
    }

    #[test]
    fn test_deleter_capability() {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let block = raw_block(b"to delete");
        let cid = *block.cid();
        store.put(block).unwrap();

        let deleter: &dyn Deleter = &store;
        deleter.delete_block(&cid).unwrap();
        assert!(!store.has(&cid).unwrap());
    }
}
