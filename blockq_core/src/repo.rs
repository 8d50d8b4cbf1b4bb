//! Repository layout, configuration and wiring.

use crate::adder::{AddOptions, Adder};
use crate::block::Block;
use crate::blockstore::{BlockStore, FlatFsBlockstore, GcBlockstore};
use crate::cancel::CancelToken;
use crate::chunker::ChunkerSpec;
use crate::dag::reader::DagReader;
use crate::error::{Error, Result};
use crate::filestore::{FileManager, Filestore};
use crate::gc::{self, GcStats};
use crate::gc_lock::GcLocker;
use crate::hash::{Algorithm, CidPrefix, Codec};
use crate::pin::{PinMode, PinSet, Pinner};
use crate::removal::{self, Backend, RemoveOptions, RemovedBlock, StoreSet};
use cid::Cid;
use crossbeam_channel::Receiver;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const CONFIG_FILE: &str = "config";
const BLOCKS_DIR: &str = "blocks";
const FILESTORE_DIR: &str = "filestore";
const PINS_FILE: &str = "pins";

/// Settings stored in the repository `config` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepoConfig {
    /// Hash function for new CIDs.
    pub algorithm: Algorithm,
    /// Whether the no-copy filestore backend is available.
    pub filestore: bool,
    /// Chunker used when an add does not name one.
    pub chunker: ChunkerSpec,
}

impl RepoConfig {
    /// Parse `key=value` lines. `#` starts a comment; unknown keys are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut version = None;
        let mut algo = None;
        let mut filestore = None;
        let mut chunker = None;

        for line in content.lines() {
            let line = match line.split_once('#') {
                Some((before, _)) => before.trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    "filestore" => filestore = Some(value.trim()),
                    "chunker" => chunker = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_configuration(format!(
                "Unsupported config version: {:?}",
                version
            )));
        }

        let algo = algo.ok_or_else(|| Error::invalid_configuration("Missing algo in config"))?;
        let filestore = match filestore {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(Error::invalid_configuration(format!(
                    "filestore must be true or false, got {:?}",
                    other
                )));
            }
        };

        Ok(Self {
            algorithm: Algorithm::parse(algo)?,
            filestore,
            chunker: ChunkerSpec::parse(chunker.unwrap_or_default())?,
        })
    }

    /// Render in the form `parse` reads.
    pub fn render(&self) -> String {
        format!(
            "version=1\nalgo={}\nfilestore={}\nchunker={}\n",
            self.algorithm.as_str(),
            self.filestore,
            self.chunker
        )
    }
}

/// Where `Repo::stat_block` found a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStat {
    pub cid: Cid,
    pub size: u64,
    pub backend: Backend,
}

/// A block repository on disk.
///
/// Layout:
/// - `config` with version, algorithm, filestore flag and default chunker
/// - `blocks/` flat-fs block files
/// - `filestore/` reference records, when enabled
/// - `pins` the pin set
pub struct Repo {
    root: PathBuf,
    config: RepoConfig,
    stores: StoreSet,
    /// Plain blocks plus filestore references, for reads and pin walks.
    view: Arc<dyn BlockStore>,
    pins: Arc<PinSet>,
    locker: Arc<GcLocker>,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Repo {
    /// Initialize a new repository at `root`.
    pub fn init<P: AsRef<Path>>(root: P, config: RepoConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(Error::invalid_configuration(format!(
                "repository already initialized at {}",
                root.display()
            )));
        }

        fs::create_dir_all(root.join(BLOCKS_DIR))?;
        if config.filestore {
            fs::create_dir_all(root.join(FILESTORE_DIR))?;
        }

        let mut temp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&root)?;
        temp.write_all(config.render().as_bytes())?;
        temp.flush()?;
        temp.persist(&config_path)?;

        info!(root = %root.display(), algo = config.algorithm.as_str(), "repository initialized");
        Self::assemble(root, config)
    }

    /// Open an existing repository at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(Error::invalid_configuration(format!(
                "no repository at {}: directory does not exist",
                root.display()
            )));
        }

        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(Error::invalid_configuration(format!(
                "no repository at {}: config file not found",
                root.display()
            )));
        }
        let config = RepoConfig::parse(&fs::read_to_string(&config_path)?)?;

        if !root.join(BLOCKS_DIR).is_dir() {
            return Err(Error::invalid_configuration(format!(
                "repository at {} is missing its blocks directory",
                root.display()
            )));
        }

        Self::assemble(root, config)
    }

    fn assemble(root: PathBuf, config: RepoConfig) -> Result<Self> {
        let locker = Arc::new(GcLocker::new());
        let flat = FlatFsBlockstore::open(root.join(BLOCKS_DIR))?;
        let blocks: Arc<dyn BlockStore> = Arc::new(GcBlockstore::new(flat, Arc::clone(&locker)));

        let (filestore, view) = if config.filestore {
            let manager = Arc::new(FileManager::open(root.join(FILESTORE_DIR))?);
            let view: Arc<dyn BlockStore> =
                Arc::new(Filestore::new(Arc::clone(&blocks), Arc::clone(&manager)));
            (Some(manager), view)
        } else {
            (None, Arc::clone(&blocks))
        };

        let pins = Arc::new(PinSet::open(root.join(PINS_FILE), Arc::clone(&view))?);

        Ok(Self {
            root,
            config,
            stores: StoreSet::new(blocks, filestore),
            view,
            pins,
            locker,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// The plain block store. Writes through it take the shared GC lock.
    pub fn blocks(&self) -> &Arc<dyn BlockStore> {
        &self.stores.blocks
    }

    pub fn filestore(&self) -> Option<&Arc<FileManager>> {
        self.stores.filestore.as_ref()
    }

    pub fn pins(&self) -> &Arc<PinSet> {
        &self.pins
    }

    pub fn locker(&self) -> &Arc<GcLocker> {
        &self.locker
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    /// Raw-codec prefix with the repository's hash function.
    pub fn default_prefix(&self) -> CidPrefix {
        CidPrefix::new(Codec::Raw, self.config.algorithm)
    }

    /// Build an adder. An empty chunker falls back to the configured one.
    pub fn adder(&self, mut options: AddOptions) -> Result<Adder> {
        if options.chunker.trim().is_empty() {
            options.chunker = self.config.chunker.to_string();
        }
        Adder::new(
            &self.stores,
            self.pins.clone(),
            Arc::clone(&self.locker),
            self.config.algorithm,
            options,
        )
    }

    /// Start a pin-safe removal; see [`removal::rm_blocks`].
    pub fn rm_blocks(
        &self,
        cids: Vec<Cid>,
        options: RemoveOptions,
        cancel: CancelToken,
    ) -> Result<Receiver<RemovedBlock>> {
        removal::rm_blocks(
            self.stores.clone(),
            Arc::clone(&self.locker),
            self.pins.clone(),
            cids,
            options,
            cancel,
        )
    }

    /// Delete everything unreachable from the pin set.
    pub fn gc(&self, dry_run: bool) -> Result<GcStats> {
        gc::collect(&self.stores, &*self.pins, &self.locker, dry_run)
    }

    /// Pin under the shared lock so a concurrent collection cannot interleave.
    pub fn pin(&self, cid: &Cid, mode: PinMode) -> Result<()> {
        let _pin_guard = self.locker.pin_lock();
        self.pins.pin(cid, mode)
    }

    pub fn unpin(&self, cid: &Cid, recursive: bool) -> Result<()> {
        let _pin_guard = self.locker.pin_lock();
        self.pins.unpin(cid, recursive)
    }

    /// Store `data` as a single block.
    pub fn put_block(&self, data: Vec<u8>, prefix: Option<CidPrefix>) -> Result<Cid> {
        let block = Block::new(prefix.unwrap_or_else(|| self.default_prefix()), data)?;
        let cid = *block.cid();
        self.stores.blocks.put(block)?;
        Ok(cid)
    }

    /// Fetch a block from the plain store, then the filestore.
    pub fn get_block(&self, cid: &Cid) -> Result<Block> {
        self.view.get(cid)
    }

    /// Size and location of a block.
    pub fn stat_block(&self, cid: &Cid) -> Result<BlockStat> {
        if self.stores.blocks.has(cid)? {
            return Ok(BlockStat {
                cid: *cid,
                size: self.stores.blocks.size(cid)?,
                backend: Backend::Blocks,
            });
        }
        if let Some(manager) = &self.stores.filestore
            && manager.has(cid)?
        {
            return Ok(BlockStat {
                cid: *cid,
                size: manager.size(cid)?,
                backend: Backend::Filestore,
            });
        }
        Err(Error::not_found(cid))
    }

    /// Stream the file rooted at `cid` into `writer`.
    pub fn cat<W: Write>(&self, cid: &Cid, writer: W) -> Result<()> {
        DagReader::new(&*self.view).write_to(cid, writer)
    }

    /// Write the DAG rooted at `cid` to `dest`, which must not exist.
    pub fn export(&self, cid: &Cid, dest: &Path) -> Result<()> {
        DagReader::new(&*self.view).export(cid, dest)
    }
}
