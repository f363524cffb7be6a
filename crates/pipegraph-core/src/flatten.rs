//! Tree flattening: nested pipeline tree → ordered node and edge lists.
//!
//! The three pipeline views (manager, editor, review) differ only in
//! whether the pipeline root is drawn as a start node and in which status
//! counts as "complete" for edge animation. Both are [`FlattenOptions`].
//!
//! Traversal is depth-first in original child order, and nodes and edges
//! are appended in visit order. That order is what the layout engine uses
//! to break ties, so it must stay stable.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::tree::{TreeIndex, insert_child};
use crate::types::{
    GraphIntegrityError, JobMap, NEW_NODE_ID, NodeKind, PipelineNode, StatusCode,
};

/// Per-call-site flattening options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlattenOptions {
    /// Emit the pipeline root as a `start` node with edges to its children.
    pub include_root: bool,
    /// Status at which an incoming edge stops animating.
    pub completion_code: StatusCode,
    /// Deepest nesting accepted before the tree is rejected as corrupt.
    pub max_depth: usize,
}

impl FlattenOptions {
    /// Default nesting limit.
    pub const DEFAULT_MAX_DEPTH: usize = 512;
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            include_root: true,
            completion_code: StatusCode::DONE,
            max_depth: Self::DEFAULT_MAX_DEPTH,
        }
    }
}

/// A client-side node waiting to be created under `root_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualNode {
    /// The placeholder itself; its id is normally [`NEW_NODE_ID`].
    pub node: PipelineNode,
    /// Id of the node it will be attached under.
    pub root_id: String,
}

/// Inputs that vary from call to call, as opposed to [`FlattenOptions`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenContext<'a> {
    /// Node to mark as selected.
    pub selected_id: Option<&'a str>,
    /// Unsaved node to splice in before flattening.
    pub virtual_node: Option<&'a VirtualNode>,
    /// Live job states; preferred over the tree's own status when present.
    pub jobs: Option<&'a JobMap>,
}

/// Serializable payload attached to a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    pub name: String,
    pub status: Option<StatusCode>,
    pub kind: NodeKind,
    pub parent_id: Option<String>,
    pub params: serde_json::Value,
    pub params_meta: serde_json::Value,
    pub script: Option<String>,
    pub script_path: Option<String>,
    pub folder: Option<String>,
}

/// A node of the flattened graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    /// Renderer node type (`start` or `job`).
    #[serde(rename = "type")]
    pub node_type: NodeKind,
    pub data: NodeData,
    pub is_new: bool,
    pub is_selected: bool,
}

/// A parent → child edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    /// Animated while the target has not reached the completion code.
    pub animated: bool,
}

impl GraphEdge {
    fn between(source_id: &str, target_id: &str, animated: bool) -> Self {
        Self {
            id: format!("e{source_id}-{target_id}"),
            source_id: source_id.to_owned(),
            target_id: target_id.to_owned(),
            animated,
        }
    }
}

/// Flat graph derived from one tree snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlattenedGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// Nodes dropped because they (or an ancestor) had no id.
    pub skipped: usize,
}

impl FlattenedGraph {
    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Flatten `tree` into a graph.
///
/// When `context.virtual_node` is set, it is inserted under its `root_id`
/// in a copy of the tree first; `tree` itself is never modified. An unknown
/// `root_id` leaves the copy unchanged.
///
/// # Errors
///
/// Returns [`GraphIntegrityError`] when ids repeat (including a second
/// [`NEW_NODE_ID`] node) or the tree nests deeper than
/// `options.max_depth`.
pub fn flatten(
    tree: &PipelineNode,
    context: &FlattenContext<'_>,
    options: &FlattenOptions,
) -> Result<FlattenedGraph, GraphIntegrityError> {
    let spliced;
    let tree = match context.virtual_node {
        Some(virtual_node) => {
            let mut copy = tree.clone();
            let inserted = insert_child(
                &mut copy,
                &virtual_node.root_id,
                virtual_node.node.clone(),
                options.max_depth,
            )?;
            if !inserted {
                warn!(root_id = %virtual_node.root_id, "virtual node parent not found; not spliced");
            }
            spliced = copy;
            &spliced
        }
        None => {
            TreeIndex::build(tree, options.max_depth)?;
            tree
        }
    };

    let mut graph = FlattenedGraph::default();
    // (node, parent id, depth)
    let mut stack: Vec<(&PipelineNode, Option<&str>, usize)> = vec![(tree, None, 0)];

    while let Some((node, parent, depth)) = stack.pop() {
        let Some(id) = node.id() else {
            graph.skipped += count_subtree(node);
            continue;
        };
        let is_root = depth == 0;
        let status = live_status(node, id, context.jobs);

        if !is_root || options.include_root {
            let kind = if is_root { NodeKind::Start } else { node.kind };
            graph.nodes.push(GraphNode {
                id: id.to_owned(),
                node_type: kind,
                data: NodeData {
                    name: node.name.clone(),
                    status,
                    kind,
                    parent_id: node.parent_id.clone().or_else(|| parent.map(str::to_owned)),
                    params: node.params.clone(),
                    params_meta: node.params_meta.clone(),
                    script: node.script.clone(),
                    script_path: node.script_path.clone(),
                    folder: node.folder.clone(),
                },
                is_new: id == NEW_NODE_ID,
                is_selected: context.selected_id == Some(id),
            });
        }

        if let Some(parent) = parent
            && (depth > 1 || options.include_root)
        {
            let animated = status != Some(options.completion_code);
            graph.edges.push(GraphEdge::between(parent, id, animated));
        }

        for child in node.children.iter().rev() {
            stack.push((child, Some(id), depth + 1));
        }
    }

    debug!(
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        skipped = graph.skipped,
        "flattened pipeline tree"
    );
    Ok(graph)
}

/// Status from the live job map when the job is known there, otherwise
/// from the tree snapshot.
fn live_status(node: &PipelineNode, id: &str, jobs: Option<&JobMap>) -> Option<StatusCode> {
    jobs.and_then(|jobs| jobs.get(id))
        .map_or(node.status, |job| job.status)
}

/// Number of nodes in a subtree, counted iteratively.
fn count_subtree(node: &PipelineNode) -> usize {
    let mut count = 0;
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        count += 1;
        stack.extend(n.children.iter());
    }
    count
}
