//! Reading DAGs back: file bytes, link walks and export to disk.

use crate::blockstore::BlockStore;
use crate::dag;
use crate::dag::node::{DagNode, NodeKind};
use crate::error::{Error, Result};
use crate::hash::Codec;
use cid::Cid;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Reads DAGs out of a block store. Every block is verified on read.
pub struct DagReader<'a> {
    store: &'a dyn BlockStore,
}

impl<'a> DagReader<'a> {
    pub fn new(store: &'a dyn BlockStore) -> Self {
        Self { store }
    }

    /// Load and decode a node block.
    pub fn node(&self, cid: &Cid) -> Result<DagNode> {
        let block = self.store.get(cid)?;
        DagNode::decode(block.data())
    }

    /// Reassemble the file rooted at `cid`.
    pub fn read_all(&self, cid: &Cid) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(cid, &mut out)?;
        Ok(out)
    }

    /// Stream the file rooted at `cid` into `writer`, in link order.
    pub fn write_to<W: Write>(&self, cid: &Cid, mut writer: W) -> Result<()> {
        self.write_file(cid, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    fn write_file(&self, cid: &Cid, writer: &mut dyn Write) -> Result<()> {
        if cid.codec() == Codec::Raw.code() {
            writer.write_all(self.store.get(cid)?.data())?;
            return Ok(());
        }

        let node = self.node(cid)?;
        match node.kind {
            NodeKind::File => {
                writer.write_all(&node.data)?;
                for link in &node.links {
                    self.write_file(&link.cid, writer)?;
                }
                Ok(())
            }
            NodeKind::Directory => Err(Error::invalid_input(format!("{} is a directory", cid))),
            NodeKind::Symlink => Err(Error::invalid_input(format!("{} is a symlink", cid))),
        }
    }

    /// Child CIDs of `cid`.
    pub fn links(&self, cid: &Cid) -> Result<Vec<Cid>> {
        dag::links(self.store, cid)
    }

    /// Write the DAG rooted at `cid` to `dest`, which must not exist yet.
    ///
    /// Files become regular files, directories become directories, and
    /// symlink nodes become symlinks (plain files holding the target on
    /// platforms without symlinks).
    pub fn export(&self, cid: &Cid, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(Error::path_exists(dest));
        }
        if let Some(parent) = dest.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        self.export_entry(cid, dest)
    }

    fn export_entry(&self, cid: &Cid, dest: &Path) -> Result<()> {
        if cid.codec() == Codec::Raw.code() {
            return self.export_file(cid, dest);
        }

        let node = self.node(cid)?;
        match node.kind {
            NodeKind::File => self.export_file(cid, dest),
            NodeKind::Directory => {
                fs::create_dir(dest)?;
                for link in &node.links {
                    let name = link.name.as_deref().ok_or_else(|| {
                        Error::invalid_input(format!("unnamed entry in directory {}", cid))
                    })?;
                    self.export_entry(&link.cid, &dest.join(name))?;
                }
                Ok(())
            }
            NodeKind::Symlink => {
                let target = String::from_utf8(node.data)
                    .map_err(|e| Error::invalid_input(format!("symlink target: {}", e)))?;
                make_symlink(&target, dest)
            }
        }
    }

    fn export_file(&self, cid: &Cid, dest: &Path) -> Result<()> {
        let file = fs::File::create(dest)?;
        self.write_to(cid, BufWriter::new(file))
    }
}

#[cfg(unix)]
fn make_symlink(target: &str, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &str, dest: &Path) -> Result<()> {
    fs::write(dest, target)?;
    Ok(())
}
