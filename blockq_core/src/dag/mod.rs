//! Merkle DAGs over blocks: node format, construction and reading.

pub mod balanced;
pub mod builder;
pub mod node;
pub mod reader;
pub mod trickle;

use crate::blockstore::BlockStore;
use crate::error::{Error, Result};
use crate::hash::Codec;
use cid::Cid;
use node::DagNode;

/// Shape of the DAG built over a file's chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// Bounded fan-out, depth grows as the tree fills.
    #[default]
    Balanced,
    /// Trickle DAG, tuned for sequential reads.
    Trickle,
}

impl Layout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layout::Balanced => "balanced",
            Layout::Trickle => "trickle",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "balanced" => Ok(Layout::Balanced),
            "trickle" => Ok(Layout::Trickle),
            _ => Err(Error::invalid_configuration(format!("unknown layout: {}", s))),
        }
    }
}

/// Root of a built subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DagRoot {
    pub cid: Cid,
    /// Logical bytes of file content below this root.
    pub filesize: u64,
    /// Stored bytes of every block below and including this root.
    pub tsize: u64,
}

/// Child CIDs of a block. Raw blocks have no links and are not fetched.
pub fn links(store: &dyn BlockStore, cid: &Cid) -> Result<Vec<Cid>> {
    if cid.codec() == Codec::Raw.code() {
        return Ok(Vec::new());
    }
    let block = store.get(cid)?;
    let node = DagNode::decode(block.data())?;
    Ok(node.links.into_iter().map(|l| l.cid).collect())
}
