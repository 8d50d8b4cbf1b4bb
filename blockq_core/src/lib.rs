//! # blockq core
//!
//! A content-addressed block repository with pinning and pin-safe removal.
//!
//! Files and directories are chunked into Merkle DAGs of blocks, each
//! identified by a CID. Roots can be pinned; pinned content and everything it
//! links to survives garbage collection and explicit block removal.
//!
//! ## Features
//!
//! - Fixed-size and content-defined chunking
//! - Balanced and trickle DAG layouts
//! - Flat-fs block storage with integrity checks on every read
//! - No-copy filestore references into files on disk
//! - Recursive and direct pins, with indirect pin reasons
//! - Pin-safe block removal and full garbage collection under one GC lock
//!
//! ## Example
//!
//! ```no_run
//! use blockq_core::{AddInput, AddOptions, CancelToken, PinMode, Pinner, Repo, RepoConfig};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Initialize a new repository
//! let repo = Repo::init("./my-repo", RepoConfig::default())?;
//!
//! // Add a file or directory; the root is pinned recursively
//! let summary = repo
//!     .adder(AddOptions::default())?
//!     .add_all(vec![AddInput::path("./my-data")], &CancelToken::new())?;
//! let root = summary.root.ok_or("nothing added")?;
//! assert!(repo.pins().is_pinned(&root)?);
//!
//! // Collect everything unpinned
//! let stats = repo.gc(false)?;
//! println!("Deleted {} blocks", stats.blocks_deleted);
//!
//! // Export back to the filesystem
//! repo.export(&root, Path::new("./restored"))?;
//! # let _ = PinMode::Recursive;
//! # Ok(())
//! # }
//! ```

mod adder;
mod block;
mod blockstore;
mod cancel;
mod chunker;
pub mod dag;
mod error;
mod filestore;
mod gc;
mod gc_lock;
mod hash;
mod object;
mod pin;
mod removal;
mod repo;

pub use adder::{AddEvent, AddInput, AddOptions, AddPlan, AddSummary, Adder, EVENT_BUFFER};
pub use block::Block;
pub use blockstore::{BlockStore, Deleter, FlatFsBlockstore, GcBlockstore, MemoryBlockstore};
pub use cancel::CancelToken;
pub use chunker::{Chunk, ChunkerSpec, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, Splitter};
pub use cid::Cid;
pub use dag::{DagRoot, Layout};
pub use error::{Error, ErrorKind, Result};
pub use filestore::{FileManager, Filestore, FilestoreRef};
pub use gc::{GcStats, collect};
pub use gc_lock::{GcGuard, GcLocker, SharedGuard};
pub use hash::{Algorithm, CidPrefix, Codec, parse_cid, verify_cid};
pub use object::{BlockHeader, CompressionType};
pub use pin::{PinMode, PinSet, Pinned, Pinner};
pub use removal::{Backend, RemoveOptions, RemovedBlock, StoreSet, rm_blocks, rm_blocks_sync};
pub use repo::{BlockStat, Repo, RepoConfig};
