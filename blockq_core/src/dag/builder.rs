//! Shared machinery for the DAG layouts.
//!
//! A [`DagBuilder`] pulls chunks from a splitter, turns them into leaves and
//! commits internal nodes. Blocks go through a [`Batch`] that deduplicates by
//! CID and flushes to the target store in groups.

use crate::block::Block;
use crate::blockstore::BlockStore;
use crate::cancel::CancelToken;
use crate::chunker::{Chunk, Splitter};
use crate::dag::DagRoot;
use crate::dag::node::{DagNode, Link};
use crate::error::Result;
use crate::filestore::{FileManager, FilestoreRef};
use crate::gc_lock::GcLocker;
use crate::hash::{Algorithm, CidPrefix, Codec};
use cid::Cid;
use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;

/// Maximum number of links in an internal file node.
pub const DEFAULT_MAX_LINKS: usize = 174;

/// Flush once this many blocks are pending.
pub const BATCH_MAX_BLOCKS: usize = 128;

/// Flush once this many bytes are pending (8 MiB).
pub const BATCH_MAX_BYTES: usize = 8 * 1024 * 1024;

/// Pending writes for one ingestion session.
#[derive(Debug, Default)]
pub struct Batch {
    pending: Vec<Block>,
    pending_bytes: usize,
    seen: HashSet<Cid>,
    written: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a block unless it was already queued or is already stored.
    pub fn add(&mut self, target: &dyn BlockStore, block: Block) -> Result<()> {
        if !self.seen.insert(*block.cid()) || target.has(block.cid())? {
            return Ok(());
        }

        self.pending_bytes += block.len();
        self.pending.push(block);

        if self.pending.len() >= BATCH_MAX_BLOCKS || self.pending_bytes >= BATCH_MAX_BYTES {
            self.flush(target)?;
        }
        Ok(())
    }

    /// Write every pending block to the target.
    pub fn flush(&mut self, target: &dyn BlockStore) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        debug!(blocks = self.pending.len(), bytes = self.pending_bytes, "flushing batch");

        for block in self.pending.drain(..) {
            target.put(block)?;
            self.written += 1;
        }
        self.pending_bytes = 0;
        Ok(())
    }

    /// Blocks written to the target so far (duplicates excluded).
    pub fn written(&self) -> usize {
        self.written
    }

    /// Encode `node`, queue it, and return its CID and encoded size.
    pub fn put_node(
        &mut self,
        target: &dyn BlockStore,
        node: &DagNode,
        algorithm: Algorithm,
    ) -> Result<(Cid, u64)> {
        let block = node.to_block(algorithm)?;
        let cid = *block.cid();
        let size = block.len() as u64;
        self.add(target, block)?;
        Ok((cid, size))
    }
}

/// Where a leaf's bytes go.
pub struct LeafParams<'a> {
    pub algorithm: Algorithm,
    pub raw_leaves: bool,
    /// Register raw leaves here instead of storing their bytes.
    pub filestore: Option<&'a FileManager>,
    /// Absolute path of the file being chunked, for filestore references.
    pub source: Option<PathBuf>,
    /// Held shared around each filestore registration.
    pub locker: Option<&'a GcLocker>,
}

/// Feeds one file's chunks to a layout.
pub struct DagBuilder<'a, R: Read> {
    splitter: Splitter<R>,
    next: Option<Chunk>,
    exhausted: bool,
    target: &'a dyn BlockStore,
    batch: &'a mut Batch,
    params: LeafParams<'a>,
    max_links: usize,
    cancel: &'a CancelToken,
    progress: Option<&'a mut dyn FnMut(u64)>,
}

impl<'a, R: Read> DagBuilder<'a, R> {
    pub fn new(
        splitter: Splitter<R>,
        target: &'a dyn BlockStore,
        batch: &'a mut Batch,
        params: LeafParams<'a>,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            splitter,
            next: None,
            exhausted: false,
            target,
            batch,
            params,
            max_links: DEFAULT_MAX_LINKS,
            cancel,
            progress: None,
        }
    }

    /// Report the byte length of every consumed chunk.
    pub fn with_progress(mut self, progress: &'a mut dyn FnMut(u64)) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_max_links(mut self, max_links: usize) -> Self {
        self.max_links = max_links.max(2);
        self
    }

    pub fn max_links(&self) -> usize {
        self.max_links
    }

    /// True once the input has no more chunks.
    pub fn is_done(&mut self) -> Result<bool> {
        if self.next.is_none() && !self.exhausted {
            match self.splitter.next() {
                Some(chunk) => self.next = Some(chunk?),
                None => self.exhausted = true,
            }
        }
        Ok(self.next.is_none())
    }

    /// Turn the next chunk into a leaf. An exhausted input gives an empty leaf.
    pub fn new_leaf(&mut self) -> Result<DagRoot> {
        self.cancel.check()?;
        self.is_done()?;
        let chunk = self.next.take().unwrap_or(Chunk {
            offset: 0,
            data: Vec::new(),
        });
        let len = chunk.data.len() as u64;

        let leaf = if self.params.raw_leaves {
            let block = Block::new(
                CidPrefix::new(Codec::Raw, self.params.algorithm),
                chunk.data,
            )?;
            let cid = *block.cid();
            match (self.params.filestore, &self.params.source) {
                (Some(manager), Some(path)) => {
                    let _shared = self.params.locker.map(|locker| locker.shared_lock());
                    manager.register(FilestoreRef {
                        cid,
                        path: path.clone(),
                        offset: chunk.offset,
                        size: len,
                    })?
                }
                _ => self.batch.add(self.target, block)?,
            }
            DagRoot {
                cid,
                filesize: len,
                tsize: len,
            }
        } else {
            let (cid, size) = self.batch.put_node(
                self.target,
                &DagNode::file_leaf(chunk.data),
                self.params.algorithm,
            )?;
            DagRoot {
                cid,
                filesize: len,
                tsize: size,
            }
        };

        if let Some(progress) = self.progress.as_mut() {
            progress(len);
        }
        Ok(leaf)
    }

    /// Commit a file node over `children`.
    pub fn add_node(&mut self, children: &[DagRoot]) -> Result<DagRoot> {
        let links = children.iter().map(|c| Link::new(c.cid, c.tsize)).collect();
        let blocksizes = children.iter().map(|c| c.filesize).collect();
        let node = DagNode::file(links, blocksizes);

        let (cid, size) = self.batch.put_node(self.target, &node, self.params.algorithm)?;
        Ok(DagRoot {
            cid,
            filesize: node.filesize(),
            tsize: size + children.iter().map(|c| c.tsize).sum::<u64>(),
        })
    }
}
