//! Garbage collection.

use crate::blockstore::BlockStore;
use crate::error::Result;
use crate::gc_lock::GcLocker;
use crate::pin::Pinner;
use crate::removal::StoreSet;
use cid::Cid;
use std::collections::HashSet;
use tracing::{debug, info, instrument};

/// Statistics from a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Number of blocks (or filestore references) deleted.
    pub blocks_deleted: usize,
    /// Payload bytes freed. Filestore references count their range size.
    pub bytes_freed: u64,
}

/// Run garbage collection over every backend in `stores`.
///
/// Marks everything reachable from the pin set, then deletes the rest. If
/// `dry_run` is true, reports what would be deleted without deleting. The
/// exclusive GC lock is held throughout, so no add can pin new content
/// between the mark and the sweep.
#[instrument(skip_all, fields(dry_run = dry_run))]
pub fn collect(
    stores: &StoreSet,
    pins: &dyn Pinner,
    locker: &GcLocker,
    dry_run: bool,
) -> Result<GcStats> {
    let _gc = locker.gc_lock();

    // Mark phase: a dangling pin aborts the whole run
    let reachable = pins.pinned_set()?;
    debug!(reachable = reachable.len(), "mark phase complete");

    // Sweep phase
    let mut stats = GcStats::default();
    sweep(&*stores.blocks, &reachable, dry_run, &mut stats)?;
    if let Some(manager) = &stores.filestore {
        sweep(&**manager, &reachable, dry_run, &mut stats)?;
    }

    info!(
        blocks = stats.blocks_deleted,
        bytes = stats.bytes_freed,
        "garbage collection finished"
    );
    Ok(stats)
}

fn sweep(
    store: &dyn BlockStore,
    reachable: &HashSet<Cid>,
    dry_run: bool,
    stats: &mut GcStats,
) -> Result<()> {
    for cid in store.keys()? {
        if reachable.contains(&cid) {
            continue;
        }

        // A block that cannot be sized is still garbage
        stats.bytes_freed += store.size(&cid).unwrap_or(0);
        stats.blocks_deleted += 1;

        if !dry_run {
            match store.delete(&cid) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}
