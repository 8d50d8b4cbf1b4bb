//! Trickle layout.
//!
//! Each node first takes up to `max_links` leaves directly, then repeated
//! subtrees of increasing depth, [`LAYER_REPEAT`] of each depth. Early data sits
//! close to the root, which suits streaming reads of append-heavy files.

use crate::dag::DagRoot;
use crate::dag::builder::DagBuilder;
use crate::error::Result;
use std::io::Read;

/// Subtrees of each depth under a trickle node.
pub const LAYER_REPEAT: usize = 4;

/// Build a trickle DAG over everything left in the builder.
pub fn layout<R: Read>(builder: &mut DagBuilder<'_, R>) -> Result<DagRoot> {
    fill_trickle(builder, None)
}

fn fill_trickle<R: Read>(
    builder: &mut DagBuilder<'_, R>,
    max_depth: Option<usize>,
) -> Result<DagRoot> {
    let mut children = Vec::new();

    // Leaf layer first, even when max_depth is 1.
    while children.len() < builder.max_links() && !builder.is_done()? {
        children.push(builder.new_leaf()?);
    }

    let mut depth = 1;
    while max_depth.is_none_or(|max| depth < max) && !builder.is_done()? {
        for _ in 0..LAYER_REPEAT {
            if builder.is_done()? {
                break;
            }
            children.push(fill_trickle(builder, Some(depth))?);
        }
        depth += 1;
    }

    builder.add_node(&children)
}
