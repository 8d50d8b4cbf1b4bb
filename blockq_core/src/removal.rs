//! Pin-safe block removal.
//!
//! A removal holds the exclusive GC lock for its whole check-then-delete
//! sequence, so no pin can change and no other collection can run between the
//! pin check and the deletes that rely on it. A pinned block is only deleted
//! when the sibling backend still holds a copy, which keeps the pin satisfied.

use crate::blockstore::{BlockStore, Deleter};
use crate::cancel::CancelToken;
use crate::error::{Error, ErrorKind, Result};
use crate::filestore::FileManager;
use crate::gc_lock::GcLocker;
use crate::pin::Pinner;
use cid::Cid;
use crossbeam_channel::{Receiver, bounded};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, instrument, warn};

/// Which physical store a removal targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// The plain block store.
    #[default]
    Blocks,
    /// Filestore references.
    Filestore,
}

impl Backend {
    /// Resolve a store prefix such as `/blocks`.
    pub fn from_prefix(prefix: &str) -> Result<Self> {
        match prefix {
            "/blocks" => Ok(Backend::Blocks),
            "/filestore" => Ok(Backend::Filestore),
            _ => Err(Error::invalid_configuration(format!(
                "unknown store prefix: {}",
                prefix
            ))),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Backend::Blocks => "/blocks",
            Backend::Filestore => "/filestore",
        }
    }

    /// The other backend.
    pub fn sibling(&self) -> Backend {
        match self {
            Backend::Blocks => Backend::Filestore,
            Backend::Filestore => Backend::Blocks,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Options for one removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveOptions {
    /// Treat an already-absent block as removed.
    pub force: bool,
    /// Report failures only.
    pub quiet: bool,
    pub backend: Backend,
}

/// Outcome for one requested CID.
///
/// An empty `hash` means the whole operation was aborted and `error` says why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedBlock {
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl RemovedBlock {
    fn removed(cid: &Cid) -> Self {
        Self {
            hash: cid.to_string(),
            error: None,
            kind: None,
        }
    }

    fn failed(cid: &Cid, error: &Error) -> Self {
        Self {
            hash: cid.to_string(),
            error: Some(error.to_string()),
            kind: Some(error.kind()),
        }
    }

    fn aborted(reason: String, kind: ErrorKind) -> Self {
        Self {
            hash: String::new(),
            error: Some(reason),
            kind: Some(kind),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// True for the single outcome of an aborted operation.
    pub fn is_abort(&self) -> bool {
        self.hash.is_empty()
    }
}

/// The backends a repository has.
#[derive(Clone)]
pub struct StoreSet {
    pub blocks: Arc<dyn BlockStore>,
    pub filestore: Option<Arc<FileManager>>,
}

impl StoreSet {
    pub fn new(blocks: Arc<dyn BlockStore>, filestore: Option<Arc<FileManager>>) -> Self {
        Self { blocks, filestore }
    }

    /// The delete capability of `backend`.
    pub fn deleter(&self, backend: Backend) -> Result<&dyn Deleter> {
        match backend {
            Backend::Blocks => Ok(&self.blocks),
            Backend::Filestore => self
                .filestore
                .as_ref()
                .map(|manager| manager as &dyn Deleter)
                .ok_or_else(|| Error::invalid_configuration("filestore is not enabled")),
        }
    }

    fn store(&self, backend: Backend) -> Option<&dyn BlockStore> {
        match backend {
            Backend::Blocks => Some(&*self.blocks),
            Backend::Filestore => self.filestore.as_deref().map(|m| m as &dyn BlockStore),
        }
    }

    /// Whether the backend other than `backend` holds `cid`.
    ///
    /// A lookup failure counts as "not available".
    pub fn available_elsewhere(&self, backend: Backend, cid: &Cid) -> bool {
        match self.store(backend.sibling()) {
            Some(store) => store.has(cid).unwrap_or_else(|e| {
                warn!(%cid, error = %e, "availability check failed");
                false
            }),
            None => false,
        }
    }
}

/// Remove `cids` on a worker thread, streaming one outcome per CID.
///
/// An unknown backend is rejected before the worker starts. The channel holds
/// every possible outcome, so the worker never waits on the consumer while it
/// holds the GC lock. An empty request returns an already-closed channel.
pub fn rm_blocks(
    stores: StoreSet,
    locker: Arc<GcLocker>,
    pins: Arc<dyn Pinner>,
    cids: Vec<Cid>,
    options: RemoveOptions,
    cancel: CancelToken,
) -> Result<Receiver<RemovedBlock>> {
    stores.deleter(options.backend)?;

    let (tx, rx) = bounded(cids.len().max(1));
    if cids.is_empty() {
        return Ok(rx);
    }

    thread::spawn(move || {
        remove(&stores, &locker, &*pins, &cids, &options, &cancel, &mut |outcome| {
            // The buffer is sized to the request, so this never blocks.
            let _ = tx.send(outcome);
        });
    });

    Ok(rx)
}

/// Remove `cids` on the current thread and collect the outcomes.
pub fn rm_blocks_sync(
    stores: &StoreSet,
    locker: &GcLocker,
    pins: &dyn Pinner,
    cids: &[Cid],
    options: &RemoveOptions,
    cancel: &CancelToken,
) -> Result<Vec<RemovedBlock>> {
    stores.deleter(options.backend)?;

    let mut outcomes = Vec::with_capacity(cids.len());
    if !cids.is_empty() {
        remove(stores, locker, pins, cids, options, cancel, &mut |o| {
            outcomes.push(o)
        });
    }
    Ok(outcomes)
}

#[instrument(skip_all, fields(count = cids.len(), backend = %options.backend))]
fn remove(
    stores: &StoreSet,
    locker: &GcLocker,
    pins: &dyn Pinner,
    cids: &[Cid],
    options: &RemoveOptions,
    cancel: &CancelToken,
    emit: &mut dyn FnMut(RemovedBlock),
) {
    let deleter = match stores.deleter(options.backend) {
        Ok(deleter) => deleter,
        Err(e) => {
            emit(RemovedBlock::aborted(e.to_string(), e.kind()));
            return;
        }
    };

    let _gc = locker.gc_lock();

    let pinned = match pins.check_if_pinned(cids) {
        Ok(pinned) => pinned,
        Err(e) => {
            warn!(error = %e, "pin check failed, nothing removed");
            emit(RemovedBlock::aborted(
                format!("pin check failed: {}", e),
                e.kind(),
            ));
            return;
        }
    };

    let mut safe = Vec::with_capacity(cids.len());
    for result in &pinned {
        if !result.is_pinned() || stores.available_elsewhere(options.backend, &result.cid) {
            safe.push(result.cid);
        } else {
            emit(RemovedBlock::failed(
                &result.cid,
                &Error::pin_conflict(result.cid, result.to_string()),
            ));
        }
    }

    let mut removed = 0usize;
    for cid in &safe {
        if cancel.is_cancelled() {
            emit(RemovedBlock::aborted(
                Error::Cancelled.to_string(),
                ErrorKind::Cancelled,
            ));
            break;
        }

        match deleter.delete_block(cid) {
            Ok(()) => {
                removed += 1;
                if !options.quiet {
                    emit(RemovedBlock::removed(cid));
                }
            }
            Err(e) if e.is_not_found() && options.force => {
                debug!(%cid, "already absent");
            }
            Err(e) => emit(RemovedBlock::failed(cid, &e)),
        }
    }

    info!(requested = cids.len(), removed, "removal finished");
}
