//! Index-based access to the nested pipeline tree.
//!
//! [`TreeIndex`] walks the tree once, iteratively, recording the child-index
//! path of every identified node. Splicing a node in or cutting a subtree
//! out then follows a stored path instead of searching the tree again, and
//! corrupted input (repeated ids, runaway nesting) is reported as a
//! [`GraphIntegrityError`] rather than recursing without bound.

use std::collections::HashMap;

use crate::types::{GraphIntegrityError, PipelineNode};

/// Map from node id to the child-index path leading to it from the root.
///
/// The root's path is empty. Nodes without an id are not indexed, and
/// neither is anything below them.
#[derive(Debug, Clone, Default)]
pub struct TreeIndex {
    paths: HashMap<String, Vec<usize>>,
}

impl TreeIndex {
    /// Index every identified node of `tree`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphIntegrityError::Cycle`] if an id reappears below
    /// itself, [`GraphIntegrityError::DuplicateNode`] for any other
    /// repeated id, and [`GraphIntegrityError::DepthExceeded`] if the tree
    /// nests deeper than `max_depth`.
    pub fn build(tree: &PipelineNode, max_depth: usize) -> Result<Self, GraphIntegrityError> {
        let mut paths: HashMap<String, Vec<usize>> = HashMap::new();
        let mut stack: Vec<(&PipelineNode, Vec<usize>)> = vec![(tree, Vec::new())];

        while let Some((node, path)) = stack.pop() {
            let Some(id) = node.id() else {
                continue;
            };
            if path.len() > max_depth {
                return Err(GraphIntegrityError::DepthExceeded { limit: max_depth });
            }
            if let Some(existing) = paths.get(id) {
                return Err(if path.starts_with(existing) {
                    GraphIntegrityError::Cycle { id: id.to_owned() }
                } else {
                    GraphIntegrityError::DuplicateNode { id: id.to_owned() }
                });
            }
            // Push in reverse so children pop in their original order.
            for (i, child) in node.children.iter().enumerate().rev() {
                let mut child_path = path.clone();
                child_path.push(i);
                stack.push((child, child_path));
            }
            paths.insert(id.to_owned(), path);
        }

        Ok(Self { paths })
    }

    /// Child-index path of the node with `id`.
    #[must_use]
    pub fn path(&self, id: &str) -> Option<&[usize]> {
        self.paths.get(id).map(Vec::as_slice)
    }

    /// Returns `true` if a node with `id` was indexed.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.paths.contains_key(id)
    }

    /// Number of indexed nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns `true` if nothing was indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Follow a child-index path from `root`.
fn node_at_mut<'a>(root: &'a mut PipelineNode, path: &[usize]) -> Option<&'a mut PipelineNode> {
    path.iter()
        .try_fold(root, |node, &i| node.children.get_mut(i))
}

/// Append `child` under the node with id `parent_id`.
///
/// Sets the child's `parent_id` back-reference. Returns `false` (leaving the
/// tree untouched) when no such parent exists.
///
/// # Errors
///
/// Propagates [`TreeIndex::build`] failures.
pub fn insert_child(
    tree: &mut PipelineNode,
    parent_id: &str,
    mut child: PipelineNode,
    max_depth: usize,
) -> Result<bool, GraphIntegrityError> {
    let index = TreeIndex::build(tree, max_depth)?;
    if let Some(id) = child.id()
        && index.contains(id)
    {
        return Err(GraphIntegrityError::DuplicateNode { id: id.to_owned() });
    }
    let Some(parent) = index
        .path(parent_id)
        .and_then(|path| node_at_mut(tree, path))
    else {
        return Ok(false);
    };
    child.parent_id = Some(parent_id.to_owned());
    parent.children.push(child);
    Ok(true)
}

/// Remove the node with id `id` and everything below it.
///
/// The root itself cannot be removed. Returns the detached subtree.
///
/// # Errors
///
/// Propagates [`TreeIndex::build`] failures.
pub fn remove_subtree(
    tree: &mut PipelineNode,
    id: &str,
    max_depth: usize,
) -> Result<Option<PipelineNode>, GraphIntegrityError> {
    let index = TreeIndex::build(tree, max_depth)?;
    let Some((&last, parent_path)) = index.path(id).and_then(<[usize]>::split_last) else {
        return Ok(None);
    };
    let removed = node_at_mut(tree, parent_path).and_then(|parent| {
        (last < parent.children.len()).then(|| parent.children.remove(last))
    });
    Ok(removed)
}
