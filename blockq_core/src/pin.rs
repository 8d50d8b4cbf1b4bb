//! Pin set: the roots that garbage collection and block removal must keep.
//!
//! Pins live in a single text file, one `mode cid` pair per line:
//!
//! ```text
//! # blockq pins
//! recursive bafkr4i...
//! direct bafkr4i...
//! ```
//!
//! Recursive pins protect every block reachable through DAG links. Those
//! descendants are never stored; they are recomputed by walking the DAG.

use crate::blockstore::BlockStore;
use crate::dag;
use crate::error::{Error, Result};
use crate::hash::{Codec, parse_cid};
use cid::Cid;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// How a CID is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    /// Only the block itself.
    Direct,
    /// The block and everything reachable from it.
    Recursive,
    /// Reachable from some recursive pin. Reported, never set.
    Indirect,
}

impl PinMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinMode::Direct => "direct",
            PinMode::Recursive => "recursive",
            PinMode::Indirect => "indirect",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(PinMode::Direct),
            "recursive" => Ok(PinMode::Recursive),
            "indirect" => Ok(PinMode::Indirect),
            _ => Err(Error::invalid_input(format!("invalid pin mode: {}", s))),
        }
    }
}

/// Result of a pin check for one CID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pinned {
    pub cid: Cid,
    /// `None` when the CID is not pinned.
    pub mode: Option<PinMode>,
    /// The recursive root an indirect pin comes from.
    pub via: Option<Cid>,
}

impl Pinned {
    pub fn is_pinned(&self) -> bool {
        self.mode.is_some()
    }
}

impl fmt::Display for Pinned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mode, self.via) {
            (None, _) => f.write_str("not pinned"),
            (Some(PinMode::Indirect), Some(root)) => write!(f, "pinned via {}", root),
            (Some(mode), _) => write!(f, "pinned: {}", mode.as_str()),
        }
    }
}

/// Read/update access to a pin set.
pub trait Pinner: Send + Sync {
    /// One result per input CID, in input order.
    fn check_if_pinned(&self, cids: &[Cid]) -> Result<Vec<Pinned>>;

    fn pin(&self, cid: &Cid, mode: PinMode) -> Result<()>;

    /// Remove a pin. A recursive pin is only removed when `recursive` is set.
    fn unpin(&self, cid: &Cid, recursive: bool) -> Result<()>;

    fn list(&self, mode: PinMode) -> Result<Vec<Cid>>;

    /// Every CID that is pinned in any mode.
    fn pinned_set(&self) -> Result<HashSet<Cid>>;

    fn is_pinned(&self, cid: &Cid) -> Result<bool> {
        Ok(self
            .check_if_pinned(std::slice::from_ref(cid))?
            .first()
            .is_some_and(Pinned::is_pinned))
    }
}

#[derive(Debug, Default)]
struct PinState {
    direct: BTreeSet<Cid>,
    recursive: BTreeSet<Cid>,
}

/// Pin set backed by an optional pin file.
pub struct PinSet {
    state: RwLock<PinState>,
    blocks: Arc<dyn BlockStore>,
    path: Option<PathBuf>,
}

impl PinSet {
    /// A pin set that is never persisted.
    pub fn in_memory(blocks: Arc<dyn BlockStore>) -> Self {
        Self {
            state: RwLock::new(PinState::default()),
            blocks,
            path: None,
        }
    }

    /// Load pins from `path`. A missing file is an empty set.
    pub fn open<P: AsRef<Path>>(path: P, blocks: Arc<dyn BlockStore>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = PinState::default();

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }

                let Some((mode, cid)) = line.split_once(char::is_whitespace) else {
                    warn!(line, "ignoring malformed pin line");
                    continue;
                };
                match (PinMode::parse(mode), parse_cid(cid)) {
                    (Ok(PinMode::Direct), Ok(cid)) => {
                        state.direct.insert(cid);
                    }
                    (Ok(PinMode::Recursive), Ok(cid)) => {
                        state.recursive.insert(cid);
                    }
                    _ => warn!(line, "ignoring malformed pin line"),
                }
            }
        }

        Ok(Self {
            state: RwLock::new(state),
            blocks,
            path: Some(path),
        })
    }

    fn save(&self, state: &PinState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let parent = path
            .parent()
            .ok_or_else(|| Error::backend("pin file has no parent"))?;

        let mut temp = tempfile::Builder::new().prefix(".tmp").tempfile_in(parent)?;
        writeln!(temp, "# blockq pins")?;
        for cid in &state.recursive {
            writeln!(temp, "recursive {}", cid)?;
        }
        for cid in &state.direct {
            writeln!(temp, "direct {}", cid)?;
        }
        temp.flush()?;
        temp.persist(path)?;
        Ok(())
    }

    /// Add every CID reachable from `root` (excluding `root`) to `seen`.
    fn collect_descendants(&self, root: &Cid, seen: &mut HashSet<Cid>) -> Result<()> {
        let mut stack = dag::links(&*self.blocks, root)?;
        while let Some(cid) = stack.pop() {
            if seen.insert(cid) {
                stack.extend(dag::links(&*self.blocks, &cid)?);
            }
        }
        Ok(())
    }

    /// Fail with `NotFound` unless every block under `root` is present,
    /// raw leaves included.
    fn check_complete(&self, root: &Cid) -> Result<()> {
        let mut seen = HashSet::new();
        let mut stack = vec![*root];
        while let Some(cid) = stack.pop() {
            if !seen.insert(cid) {
                continue;
            }
            if cid.codec() == Codec::Raw.code() {
                if !self.blocks.has(&cid)? {
                    return Err(Error::not_found(cid));
                }
                continue;
            }
            stack.extend(dag::links(&*self.blocks, &cid)?);
        }
        Ok(())
    }
}

impl Pinner for PinSet {
    fn check_if_pinned(&self, cids: &[Cid]) -> Result<Vec<Pinned>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let mut results: Vec<Pinned> = cids
            .iter()
            .map(|cid| {
                let mode = if state.recursive.contains(cid) {
                    Some(PinMode::Recursive)
                } else if state.direct.contains(cid) {
                    Some(PinMode::Direct)
                } else {
                    None
                };
                Pinned {
                    cid: *cid,
                    mode,
                    via: None,
                }
            })
            .collect();

        let mut pending: HashSet<Cid> = results
            .iter()
            .filter(|p| !p.is_pinned())
            .map(|p| p.cid)
            .collect();

        for root in &state.recursive {
            if pending.is_empty() {
                break;
            }
            let mut reachable = HashSet::new();
            self.collect_descendants(root, &mut reachable)?;

            for result in results.iter_mut().filter(|p| !p.is_pinned()) {
                if reachable.contains(&result.cid) {
                    result.mode = Some(PinMode::Indirect);
                    result.via = Some(*root);
                    pending.remove(&result.cid);
                }
            }
        }

        Ok(results)
    }

    fn pin(&self, cid: &Cid, mode: PinMode) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        match mode {
            PinMode::Direct => {
                if state.recursive.contains(cid) {
                    return Err(Error::invalid_input(format!(
                        "{} is already pinned recursively",
                        cid
                    )));
                }
                state.direct.insert(*cid);
            }
            PinMode::Recursive => {
                self.check_complete(cid)?;
                state.direct.remove(cid);
                state.recursive.insert(*cid);
            }
            PinMode::Indirect => {
                return Err(Error::invalid_input("indirect pins cannot be set"));
            }
        }

        self.save(&state)?;
        debug!(%cid, mode = mode.as_str(), "pinned");
        Ok(())
    }

    fn unpin(&self, cid: &Cid, recursive: bool) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.recursive.contains(cid) {
            if !recursive {
                return Err(Error::invalid_input(format!(
                    "{} is pinned recursively",
                    cid
                )));
            }
            state.recursive.remove(cid);
        } else if !state.direct.remove(cid) {
            return Err(Error::not_found(cid));
        }

        self.save(&state)?;
        debug!(%cid, "unpinned");
        Ok(())
    }

    fn list(&self, mode: PinMode) -> Result<Vec<Cid>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match mode {
            PinMode::Direct => Ok(state.direct.iter().copied().collect()),
            PinMode::Recursive => Ok(state.recursive.iter().copied().collect()),
            PinMode::Indirect => {
                let mut reachable = HashSet::new();
                for root in &state.recursive {
                    self.collect_descendants(root, &mut reachable)?;
                }
                let mut indirect: Vec<Cid> = reachable
                    .into_iter()
                    .filter(|cid| !state.recursive.contains(cid))
                    .collect();
                indirect.sort();
                Ok(indirect)
            }
        }
    }

    fn pinned_set(&self) -> Result<HashSet<Cid>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut pinned: HashSet<Cid> = state.direct.iter().copied().collect();
        for root in &state.recursive {
            pinned.insert(*root);
            self.collect_descendants(root, &mut pinned)?;
        }
        Ok(pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::blockstore::MemoryBlockstore;
    use crate::dag::node::{DagNode, Link};
    use crate::error::ErrorKind;
    use crate::hash::{Algorithm, CidPrefix, Codec};
    use tempfile::TempDir;

    fn raw(store: &dyn BlockStore, data: &[u8]) -> Cid {
        let block = Block::new(CidPrefix::new(Codec::Raw, Algorithm::Blake3), data.to_vec()).unwrap();
        let cid = *block.cid();
        store.put(block).unwrap();
        cid
    }

    /// root -> [a, b], a and b raw.
    fn small_dag(store: &dyn BlockStore) -> (Cid, Cid, Cid) {
        let a = raw(store, b"leaf a");
        let b = raw(store, b"leaf b");
        let node = DagNode::file(vec![Link::new(a, 6), Link::new(b, 6)], vec![6, 6]);
        let block = node.to_block(Algorithm::Blake3).unwrap();
        let root = *block.cid();
        store.put(block).unwrap();
        (root, a, b)
    }

    #[test]
    fn test_reasons() {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let (root, a, _b) = small_dag(&*store);
        let loose = raw(&*store, b"loose");
        let direct = raw(&*store, b"direct");

        let pins = PinSet::in_memory(Arc::clone(&store));
        pins.pin(&root, PinMode::Recursive).unwrap();
        pins.pin(&direct, PinMode::Direct).unwrap();

        let results = pins.check_if_pinned(&[loose, a, root, direct]).unwrap();
        let reasons: Vec<String> = results.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            reasons,
            vec![
                "not pinned".to_string(),
                format!("pinned via {}", root),
                "pinned: recursive".to_string(),
                "pinned: direct".to_string(),
            ]
        );
        assert!(!results[0].is_pinned());
        assert_eq!(results[1].via, Some(root));
    }

    #[test]
    fn test_recursive_pin_requires_root() {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let missing = DagNode::file(vec![], vec![])
            .to_block(Algorithm::Blake3)
            .unwrap();
        let pins = PinSet::in_memory(store);
        let err = pins.pin(missing.cid(), PinMode::Recursive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_recursive_pin_requires_every_raw_leaf() {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let present = raw(&*store, b"present");
        let absent = CidPrefix::new(Codec::Raw, Algorithm::Blake3)
            .sum(b"never stored")
            .unwrap();
        let node = DagNode::file(vec![Link::new(present, 7), Link::new(absent, 12)], vec![7, 12]);
        let block = node.to_block(Algorithm::Blake3).unwrap();
        let root = *block.cid();
        store.put(block).unwrap();

        let pins = PinSet::in_memory(Arc::clone(&store));
        let err = pins.pin(&root, PinMode::Recursive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains(&absent.to_string()));
        assert!(!pins.is_pinned(&root).unwrap());

        // A missing raw root is refused the same way.
        assert!(pins.pin(&absent, PinMode::Recursive).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unpin_rules() {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let (root, _a, _b) = small_dag(&*store);
        let pins = PinSet::in_memory(Arc::clone(&store));
        pins.pin(&root, PinMode::Recursive).unwrap();

        assert_eq!(
            pins.unpin(&root, false).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        pins.unpin(&root, true).unwrap();
        assert!(!pins.is_pinned(&root).unwrap());
        assert!(pins.unpin(&root, true).unwrap_err().is_not_found());
    }

    #[test]
    fn test_recursive_upgrades_direct() {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let (root, _a, _b) = small_dag(&*store);
        let pins = PinSet::in_memory(Arc::clone(&store));

        pins.pin(&root, PinMode::Direct).unwrap();
        pins.pin(&root, PinMode::Recursive).unwrap();
        assert!(pins.list(PinMode::Direct).unwrap().is_empty());
        assert_eq!(pins.list(PinMode::Recursive).unwrap(), vec![root]);
        assert!(pins.pin(&root, PinMode::Direct).is_err());
    }

    #[test]
    fn test_list_indirect_and_pinned_set() {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let (root, a, b) = small_dag(&*store);
        let pins = PinSet::in_memory(Arc::clone(&store));
        pins.pin(&root, PinMode::Recursive).unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(pins.list(PinMode::Indirect).unwrap(), expected);

        let all = pins.pinned_set().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.contains(&root));
    }

    #[test]
    fn test_pins_persist() {
        let temp_dir = TempDir::new().unwrap();
        let pin_path = temp_dir.path().join("pins");
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let (root, _a, _b) = small_dag(&*store);
        let direct = raw(&*store, b"direct");

        {
            let pins = PinSet::open(&pin_path, Arc::clone(&store)).unwrap();
            pins.pin(&root, PinMode::Recursive).unwrap();
            pins.pin(&direct, PinMode::Direct).unwrap();
        }

        let reopened = PinSet::open(&pin_path, Arc::clone(&store)).unwrap();
        assert_eq!(reopened.list(PinMode::Recursive).unwrap(), vec![root]);
        assert_eq!(reopened.list(PinMode::Direct).unwrap(), vec![direct]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let pin_path = temp_dir.path().join("pins");
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        let direct = raw(&*store, b"direct");
        fs::write(
            &pin_path,
            format!("# comment\ngarbage\nsideways {}\ndirect {}\n", direct, direct),
        )
        .unwrap();

        let pins = PinSet::open(&pin_path, store).unwrap();
        assert_eq!(pins.list(PinMode::Direct).unwrap(), vec![direct]);
        assert!(pins.list(PinMode::Recursive).unwrap().is_empty());
    }
}
