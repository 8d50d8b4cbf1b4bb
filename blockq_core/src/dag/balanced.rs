//! Balanced layout.
//!
//! Every internal node holds up to `max_links` children and all leaves sit at
//! the same depth. A single-chunk file is just its leaf. Once a tree of depth
//! `d` is full, it becomes the first child of a new root of depth `d + 1`.

use crate::dag::DagRoot;
use crate::dag::builder::DagBuilder;
use crate::error::{Error, Result};
use std::io::Read;

/// Build a balanced DAG over everything left in the builder.
pub fn layout<R: Read>(builder: &mut DagBuilder<'_, R>) -> Result<DagRoot> {
    let mut root = builder.new_leaf()?;

    let mut depth = 1;
    while !builder.is_done()? {
        let mut children = vec![root];
        fill_node(builder, &mut children, depth)?;
        root = builder.add_node(&children)?;
        depth += 1;
    }

    Ok(root)
}

/// Append subtrees of `depth` to `children` until full or out of input.
fn fill_node<R: Read>(
    builder: &mut DagBuilder<'_, R>,
    children: &mut Vec<DagRoot>,
    depth: usize,
) -> Result<()> {
    if depth < 1 {
        return Err(Error::invalid_input("balanced fill depth must be at least 1"));
    }

    while children.len() < builder.max_links() && !builder.is_done()? {
        let child = if depth == 1 {
            builder.new_leaf()?
        } else {
            let mut grandchildren = Vec::new();
            fill_node(builder, &mut grandchildren, depth - 1)?;
            builder.add_node(&grandchildren)?
        };
        children.push(child);
    }
    Ok(())
}
