//! Ingestion: turning files, directories and streams into pinned DAGs.

use crate::blockstore::{BlockStore, MemoryBlockstore};
use crate::cancel::CancelToken;
use crate::chunker::ChunkerSpec;
use crate::dag::builder::{Batch, DagBuilder, LeafParams};
use crate::dag::node::{DagNode, Link};
use crate::dag::{DagRoot, Layout, balanced, trickle};
use crate::error::{Error, Result};
use crate::filestore::{FileManager, Filestore};
use crate::gc_lock::GcLocker;
use crate::hash::Algorithm;
use crate::pin::{PinMode, Pinner};
use crate::removal::StoreSet;
use cid::Cid;
use crossbeam_channel::{Receiver, bounded};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, instrument};

/// Events buffered between a spawned add and its consumer.
pub const EVENT_BUFFER: usize = 8;

/// Options for one add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOptions {
    /// Chunker description, see [`ChunkerSpec::parse`].
    pub chunker: String,
    pub layout: Layout,
    /// Store leaves as bare raw blocks. `None` means "default", which is on
    /// only for no-copy adds.
    pub raw_leaves: Option<bool>,
    /// Reference file ranges through the filestore instead of copying them.
    pub no_copy: bool,
    /// Skip writing blocks the filestore already references. Has no effect
    /// when the repository has no filestore.
    pub fs_cache: bool,
    /// Wrap all top-level entries in an unnamed directory.
    pub wrap: bool,
    /// Include hidden files when walking directories.
    pub hidden: bool,
    /// Pin the result recursively.
    pub pin: bool,
    /// Compute CIDs without writing anything to the repository.
    pub only_hash: bool,
    /// Emit no events at all.
    pub silent: bool,
    /// Emit progress events.
    pub progress: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            chunker: String::new(),
            layout: Layout::Balanced,
            raw_leaves: None,
            no_copy: false,
            fs_cache: false,
            wrap: false,
            hidden: false,
            pin: true,
            only_hash: false,
            silent: false,
            progress: false,
        }
    }
}

/// Options after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddPlan {
    pub chunker: ChunkerSpec,
    pub raw_leaves: bool,
}

impl AddOptions {
    /// Check option combinations before anything is written.
    pub fn validate(&self, filestore_enabled: bool) -> Result<AddPlan> {
        let raw_leaves = if self.no_copy {
            if !filestore_enabled {
                return Err(Error::invalid_configuration(
                    "filestore is not enabled, see the filestore setting in the repo config",
                ));
            }
            match self.raw_leaves {
                Some(false) => {
                    return Err(Error::invalid_configuration(
                        "nocopy option requires raw leaves to be enabled as well",
                    ));
                }
                _ => true,
            }
        } else {
            self.raw_leaves.unwrap_or(false)
        };

        Ok(AddPlan {
            chunker: ChunkerSpec::parse(&self.chunker)?,
            raw_leaves,
        })
    }
}

/// One top-level input.
pub enum AddInput {
    /// A file, directory or symlink on disk.
    Path(PathBuf),
    /// A byte stream with no backing file.
    Reader {
        name: String,
        reader: Box<dyn Read + Send>,
    },
}

impl AddInput {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        AddInput::Path(path.into())
    }

    pub fn reader(name: impl Into<String>, reader: impl Read + Send + 'static) -> Self {
        AddInput::Reader {
            name: name.into(),
            reader: Box::new(reader),
        }
    }
}

/// Ingestion progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddEvent {
    /// Bytes of `name` consumed so far.
    Progress { name: String, bytes: u64 },
    /// `name` is fully stored. `size` is its file size; directories sum their
    /// entries. The wrapping directory has an empty name.
    Completed { name: String, cid: Cid, size: u64 },
}

/// Result of a successful add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddSummary {
    /// Each top-level input with its root.
    pub roots: Vec<(String, Cid)>,
    /// The wrapping directory, or the only root.
    pub root: Option<Cid>,
    /// File bytes ingested.
    pub bytes: u64,
    /// Every `Completed` event, in emission order. Recorded even when silent.
    pub completed: Vec<AddEvent>,
}

/// Adds content to a repository.
pub struct Adder {
    blocks: Arc<dyn BlockStore>,
    filestore: Option<Arc<FileManager>>,
    pins: Arc<dyn Pinner>,
    locker: Arc<GcLocker>,
    algorithm: Algorithm,
    options: AddOptions,
    plan: AddPlan,
}

impl Adder {
    /// Validate `options` against the stores and build an adder.
    pub fn new(
        stores: &StoreSet,
        pins: Arc<dyn Pinner>,
        locker: Arc<GcLocker>,
        algorithm: Algorithm,
        options: AddOptions,
    ) -> Result<Self> {
        let plan = options.validate(stores.filestore.is_some())?;
        Ok(Self {
            blocks: Arc::clone(&stores.blocks),
            filestore: stores.filestore.clone(),
            pins,
            locker,
            algorithm,
            options,
            plan,
        })
    }

    pub fn options(&self) -> &AddOptions {
        &self.options
    }

    /// Add every input, discarding events.
    pub fn add_all(&self, inputs: Vec<AddInput>, cancel: &CancelToken) -> Result<AddSummary> {
        self.add_all_with(inputs, cancel, &mut |_| {})
    }

    /// Add every input, passing events to `emit` as they happen.
    #[instrument(skip_all, fields(inputs = inputs.len()))]
    pub fn add_all_with(
        &self,
        inputs: Vec<AddInput>,
        cancel: &CancelToken,
        emit: &mut dyn FnMut(AddEvent),
    ) -> Result<AddSummary> {
        self.check_inputs(&inputs)?;

        let scratch;
        let cached;
        let (target, filestore): (&dyn BlockStore, Option<&FileManager>) = if self.options.only_hash
        {
            scratch = MemoryBlockstore::new();
            (&scratch, None)
        } else if self.options.fs_cache
            && let Some(manager) = &self.filestore
        {
            // Existence checks see both backends; writes still go to the plain store.
            cached = Filestore::new(Arc::clone(&self.blocks), Arc::clone(manager));
            (&cached, Some(&**manager))
        } else {
            (&*self.blocks, self.filestore.as_deref())
        };

        let mut session = Session {
            adder: self,
            target,
            filestore,
            batch: Batch::new(),
            cancel,
            emit,
            completed: Vec::new(),
            bytes: 0,
        };

        match session.run(inputs) {
            Ok(summary) => {
                info!(
                    root = ?summary.root,
                    bytes = summary.bytes,
                    blocks = session.batch.written(),
                    "add complete"
                );
                Ok(summary)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(cause) => Err(Error::IngestFailure {
                cause: Box::new(cause),
                completed: session.completed,
            }),
        }
    }

    /// Run the add on a worker thread.
    ///
    /// Events arrive on the returned channel, which holds at most
    /// [`EVENT_BUFFER`] events; a slow consumer blocks the worker.
    pub fn spawn(
        self,
        inputs: Vec<AddInput>,
        cancel: CancelToken,
    ) -> (Receiver<AddEvent>, JoinHandle<Result<AddSummary>>) {
        let (tx, rx) = bounded(EVENT_BUFFER);
        let handle = thread::spawn(move || {
            self.add_all_with(inputs, &cancel, &mut |event| {
                // A dropped receiver only means nobody is listening.
                let _ = tx.send(event);
            })
        });
        (rx, handle)
    }

    /// Reject inputs that can never succeed, before anything is written.
    fn check_inputs(&self, inputs: &[AddInput]) -> Result<()> {
        let mut names = HashSet::new();
        for input in inputs {
            let name = match input {
                AddInput::Path(path) => {
                    fs::symlink_metadata(path).map_err(|e| {
                        Error::invalid_input(format!("cannot read {}: {}", path.display(), e))
                    })?;
                    input_name(path)?
                }
                AddInput::Reader { name, .. } => {
                    if self.options.no_copy {
                        return Err(Error::invalid_configuration(format!(
                            "nocopy requires a file on disk, got stream {:?}",
                            name
                        )));
                    }
                    name.clone()
                }
            };
            if self.options.wrap && !names.insert(name.clone()) {
                return Err(Error::invalid_input(format!(
                    "duplicate entry name when wrapping: {}",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// State of one add call.
struct Session<'a> {
    adder: &'a Adder,
    target: &'a dyn BlockStore,
    filestore: Option<&'a FileManager>,
    batch: Batch,
    cancel: &'a CancelToken,
    emit: &'a mut dyn FnMut(AddEvent),
    completed: Vec<AddEvent>,
    bytes: u64,
}

impl Session<'_> {
    fn run(&mut self, inputs: Vec<AddInput>) -> Result<AddSummary> {
        let mut roots = Vec::with_capacity(inputs.len());
        let mut entries = Vec::with_capacity(inputs.len());

        for input in inputs {
            self.cancel.check()?;
            let (name, root) = match input {
                AddInput::Path(path) => {
                    let name = input_name(&path)?;
                    let root = self.add_path(&path, &name)?;
                    (name, root)
                }
                AddInput::Reader { name, reader } => {
                    let root = self.add_stream(reader, None, &name)?;
                    self.complete(&name, &root);
                    (name, root)
                }
            };
            roots.push((name.clone(), root.cid));
            entries.push((name, root));
        }

        let root = if self.adder.options.wrap {
            let wrapper = self.add_directory_node(entries)?;
            self.complete("", &wrapper);
            Some(wrapper.cid)
        } else if roots.len() == 1 {
            Some(roots[0].1)
        } else {
            None
        };

        // Finalize
        self.cancel.check()?;
        self.batch.flush(self.target)?;

        let options = &self.adder.options;
        if options.pin && !options.only_hash {
            let _pin_guard = self.adder.locker.pin_lock();
            let to_pin: Vec<Cid> = match (options.wrap, root) {
                (true, Some(wrapper)) => vec![wrapper],
                _ => roots.iter().map(|(_, cid)| *cid).collect(),
            };
            for cid in &to_pin {
                self.adder.pins.pin(cid, PinMode::Recursive)?;
            }
            debug!(count = to_pin.len(), "pinned add roots");
        }

        Ok(AddSummary {
            roots,
            root,
            bytes: self.bytes,
            completed: std::mem::take(&mut self.completed),
        })
    }

    fn complete(&mut self, name: &str, root: &DagRoot) {
        let event = AddEvent::Completed {
            name: name.to_string(),
            cid: root.cid,
            size: root.filesize,
        };
        self.completed.push(event.clone());
        if !self.adder.options.silent {
            (self.emit)(event);
        }
    }

    /// Add a file, directory or symlink and emit its completion.
    fn add_path(&mut self, path: &Path, name: &str) -> Result<DagRoot> {
        self.cancel.check()?;
        let metadata = fs::symlink_metadata(path)?;
        let file_type = metadata.file_type();

        let root = if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            let target = target.to_str().ok_or_else(|| {
                Error::invalid_input(format!("symlink target is not UTF-8: {}", path.display()))
            })?;
            let node = DagNode::symlink(target);
            let (cid, size) = self.batch.put_node(self.target, &node, self.adder.algorithm)?;
            DagRoot {
                cid,
                filesize: node.filesize(),
                tsize: size,
            }
        } else if file_type.is_dir() {
            self.add_directory(path, name)?
        } else if file_type.is_file() {
            let source = if self.adder.options.no_copy {
                Some(fs::canonicalize(path)?)
            } else {
                None
            };
            let file = fs::File::open(path)?;
            self.add_stream(file, source, name)?
        } else {
            return Err(Error::invalid_input(format!(
                "Unsupported file type: {}",
                path.display()
            )));
        };

        self.complete(name, &root);
        Ok(root)
    }

    fn add_directory(&mut self, path: &Path, name: &str) -> Result<DagRoot> {
        let walker = ignore::WalkBuilder::new(path)
            .max_depth(Some(1)) // Only immediate children
            .standard_filters(false)
            .hidden(!self.adder.options.hidden)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry?;
            let entry_path = entry.path();

            // Skip the directory itself
            if entry.depth() == 0 {
                continue;
            }

            let file_name = entry_path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::invalid_input(format!("Invalid filename: {}", entry_path.display()))
                })?
                .to_string();

            let child_name = format!("{}/{}", name, file_name);
            let child = self.add_path(entry_path, &child_name)?;
            entries.push((file_name, child));
        }

        self.add_directory_node(entries)
    }

    fn add_directory_node(&mut self, entries: Vec<(String, DagRoot)>) -> Result<DagRoot> {
        let mut filesize = 0;
        let mut child_tsize = 0;
        let mut links = Vec::with_capacity(entries.len());
        for (name, child) in entries {
            filesize += child.filesize;
            child_tsize += child.tsize;
            links.push(Link::named(name, child.cid, child.tsize)?);
        }

        let (cid, size) =
            self.batch
                .put_node(self.target, &DagNode::directory(links), self.adder.algorithm)?;
        Ok(DagRoot {
            cid,
            filesize,
            tsize: size + child_tsize,
        })
    }

    /// Chunk and lay out one byte stream.
    fn add_stream<R: Read>(
        &mut self,
        reader: R,
        source: Option<PathBuf>,
        name: &str,
    ) -> Result<DagRoot> {
        let Session {
            adder,
            target,
            filestore,
            batch,
            cancel,
            emit,
            ..
        } = self;

        let report = adder.options.progress && !adder.options.silent;
        let mut sent = 0u64;
        let mut on_chunk = |n: u64| {
            sent += n;
            if report {
                emit(AddEvent::Progress {
                    name: name.to_string(),
                    bytes: sent,
                });
            }
        };

        let params = LeafParams {
            algorithm: adder.algorithm,
            raw_leaves: adder.plan.raw_leaves,
            filestore: if source.is_some() { *filestore } else { None },
            source,
            locker: Some(&*adder.locker),
        };
        let splitter = adder.plan.chunker.splitter(reader);
        let root = {
            let mut builder = DagBuilder::new(splitter, *target, batch, params, *cancel)
                .with_progress(&mut on_chunk);
            match adder.options.layout {
                Layout::Balanced => balanced::layout(&mut builder)?,
                Layout::Trickle => trickle::layout(&mut builder)?,
            }
        };

        self.bytes += root.filesize;
        Ok(root)
    }
}

/// Entry name for a top-level path.
fn input_name(path: &Path) -> Result<String> {
    let named = match path.file_name() {
        Some(name) => PathBuf::from(name),
        None => fs::canonicalize(path)?
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_default(),
    };
    let name = named.to_str().unwrap_or_default();
    if name.is_empty() {
        return Err(Error::invalid_input(format!(
            "cannot name input {}",
            path.display()
        )));
    }
    Ok(name.to_string())
}
