//! Layered layout of the flattened graph.
//!
//! A simplified Sugiyama pass:
//!
//! 1. Rank assignment: longest path from sources (Kahn order).
//! 2. Crossing minimization: barycenter heuristic, one forward sweep
//!    (parents) and one backward sweep (children).
//! 3. Coordinate assignment: ranks advance along the layout direction,
//!    each rank is centered on the cross axis.
//!
//! Every sort is stable, so ties fall back to flattened visit order and
//! the same graph always lays out the same way.

use std::collections::{HashMap, VecDeque};
use std::hash::Hasher;

use petgraph::Direction::{Incoming, Outgoing};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use tracing::{debug, warn};

use crate::flatten::{FlattenedGraph, GraphEdge, GraphNode};

/// Direction in which ranks advance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Left to right.
    #[default]
    #[serde(rename = "LR")]
    LeftRight,
    /// Top to bottom.
    #[serde(rename = "TB")]
    TopBottom,
}

/// Side of a node box where edges attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSide {
    Left,
    Right,
    Top,
    Bottom,
}

impl Direction {
    /// `(target, source)` port sides for this direction.
    #[must_use]
    pub const fn ports(self) -> (PortSide, PortSide) {
        match self {
            Self::LeftRight => (PortSide::Left, PortSide::Right),
            Self::TopBottom => (PortSide::Top, PortSide::Bottom),
        }
    }

    /// Short name, as serialized.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LeftRight => "LR",
            Self::TopBottom => "TB",
        }
    }
}

/// Layout geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutConfig {
    /// Direction used by callers that do not pick one per call.
    pub direction: Direction,
    /// Node box width in logical units.
    pub node_width: f64,
    /// Node box height in logical units.
    pub node_height: f64,
    /// Gap between consecutive ranks.
    pub rank_separation: f64,
    /// Gap between neighbours within a rank.
    pub node_separation: f64,
    /// Add a deterministic sub-pixel offset per node so no two nodes share
    /// exact coordinates.
    pub jitter: bool,
}

impl LayoutConfig {
    pub const DEFAULT_NODE_WIDTH: f64 = 172.0;
    pub const DEFAULT_NODE_HEIGHT: f64 = 36.0;
    pub const DEFAULT_RANK_SEPARATION: f64 = 50.0;
    pub const DEFAULT_NODE_SEPARATION: f64 = 50.0;
    /// Upper bound (exclusive) of the per-axis jitter.
    pub const MAX_JITTER: f64 = 0.5;
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            direction: Direction::default(),
            node_width: Self::DEFAULT_NODE_WIDTH,
            node_height: Self::DEFAULT_NODE_HEIGHT,
            rank_separation: Self::DEFAULT_RANK_SEPARATION,
            node_separation: Self::DEFAULT_NODE_SEPARATION,
            jitter: true,
        }
    }
}

/// Top-left corner of a node box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A graph node with its computed placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionedNode {
    #[serde(flatten)]
    pub node: GraphNode,
    pub position: Position,
    /// Layer index (0 = sources).
    pub rank: usize,
    /// Position within the layer after crossing minimization.
    pub order: usize,
    pub target_position: PortSide,
    pub source_position: PortSide,
}

/// Positioned graph handed to the renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutResult {
    pub direction: Direction,
    /// Nodes in flattened order.
    pub nodes: Vec<PositionedNode>,
    /// Edges whose endpoints both exist.
    pub edges: Vec<GraphEdge>,
    /// Edges discarded for referring to a missing node (or to themselves).
    pub dropped_edges: usize,
}

impl LayoutResult {
    /// Look up a positioned node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&PositionedNode> {
        self.nodes.iter().find(|n| n.node.id == id)
    }

    /// Number of ranks in the layout.
    #[must_use]
    pub fn rank_count(&self) -> usize {
        self.nodes.iter().map(|n| n.rank + 1).max().unwrap_or(0)
    }
}

/// Lay out `graph` in `direction`.
///
/// Never fails: dangling edges are dropped and counted, nodes unreachable
/// from any source land in rank 0, and an empty graph gives an empty
/// result.
#[must_use]
pub fn layout(graph: &FlattenedGraph, direction: Direction, config: &LayoutConfig) -> LayoutResult {
    let mut dag: DiGraph<usize, ()> = DiGraph::with_capacity(graph.nodes.len(), graph.edges.len());
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::with_capacity(graph.nodes.len());
    for (i, node) in graph.nodes.iter().enumerate() {
        let ix = dag.add_node(i);
        index_of.entry(node.id.as_str()).or_insert(ix);
    }

    let mut edges = Vec::with_capacity(graph.edges.len());
    let mut dropped_edges = 0;
    for edge in &graph.edges {
        match (
            index_of.get(edge.source_id.as_str()),
            index_of.get(edge.target_id.as_str()),
        ) {
            (Some(&s), Some(&t)) if s != t => {
                dag.add_edge(s, t, ());
                edges.push(edge.clone());
            }
            _ => dropped_edges += 1,
        }
    }
    if dropped_edges > 0 {
        warn!(dropped_edges, "dropped edges with missing endpoints");
    }

    let ranks = assign_ranks(&dag);
    let mut layers: Vec<Vec<NodeIndex>> = vec![Vec::new(); ranks.iter().max().map_or(0, |r| r + 1)];
    for ix in dag.node_indices() {
        if let Some(layer) = layers.get_mut(ranks[ix.index()]) {
            layer.push(ix);
        }
    }
    minimize_crossings(&mut layers, &dag);

    let (target_position, source_position) = direction.ports();
    let mut placed: Vec<Option<(usize, usize, Position)>> = vec![None; graph.nodes.len()];
    for (rank, layer) in layers.iter().enumerate() {
        for (order, &ix) in layer.iter().enumerate() {
            let id = &graph.nodes[dag[ix]].id;
            let position = place(rank, order, layer.len(), id, direction, config);
            placed[dag[ix]] = Some((rank, order, position));
        }
    }

    let nodes = graph
        .nodes
        .iter()
        .zip(placed)
        .map(|(node, slot)| {
            let (rank, order, position) = slot.unwrap_or_default();
            PositionedNode {
                node: node.clone(),
                position,
                rank,
                order,
                target_position,
                source_position,
            }
        })
        .collect();

    debug!(
        nodes = graph.nodes.len(),
        ranks = layers.len(),
        dropped_edges,
        ?direction,
        "computed layered layout"
    );

    LayoutResult {
        direction,
        nodes,
        edges,
        dropped_edges,
    }
}

// ── Rank assignment (longest path from sources) ─────────────────────────

fn assign_ranks(dag: &DiGraph<usize, ()>) -> Vec<usize> {
    let mut ranks = vec![0usize; dag.node_count()];
    let mut in_degree: Vec<usize> = dag
        .node_indices()
        .map(|ix| dag.neighbors_directed(ix, Incoming).count())
        .collect();
    let mut queue: VecDeque<NodeIndex> = dag
        .node_indices()
        .filter(|ix| in_degree[ix.index()] == 0)
        .collect();

    while let Some(ix) = queue.pop_front() {
        let next_rank = ranks[ix.index()] + 1;
        for child in dag.neighbors_directed(ix, Outgoing) {
            let c = child.index();
            ranks[c] = ranks[c].max(next_rank);
            in_degree[c] = in_degree[c].saturating_sub(1);
            if in_degree[c] == 0 {
                queue.push_back(child);
            }
        }
    }

    // Nodes on a cycle never reach in-degree zero; reset them to rank 0.
    for (rank, degree) in ranks.iter_mut().zip(&in_degree) {
        if *degree > 0 {
            *rank = 0;
        }
    }
    ranks
}

// ── Crossing minimization (barycenter heuristic) ────────────────────────

fn minimize_crossings(layers: &mut [Vec<NodeIndex>], dag: &DiGraph<usize, ()>) {
    if layers.len() <= 1 {
        return;
    }
    let mut order = vec![0usize; dag.node_count()];
    let record = |layer: &[NodeIndex], order: &mut [usize]| {
        for (i, ix) in layer.iter().enumerate() {
            order[ix.index()] = i;
        }
    };
    for layer in layers.iter() {
        record(layer, &mut order);
    }

    for i in 1..layers.len() {
        reorder(&mut layers[i], dag, &order, Incoming);
        record(&layers[i], &mut order);
    }
    for i in (0..layers.len() - 1).rev() {
        reorder(&mut layers[i], dag, &order, Outgoing);
        record(&layers[i], &mut order);
    }
}

/// Stable-sort one layer by the mean order of its neighbours in
/// `direction`. Nodes without such neighbours keep their current slot as
/// their key.
#[allow(clippy::cast_precision_loss)]
fn reorder(
    layer: &mut Vec<NodeIndex>,
    dag: &DiGraph<usize, ()>,
    order: &[usize],
    direction: petgraph::Direction,
) {
    let mut keyed: Vec<(NodeIndex, f64)> = layer
        .iter()
        .map(|&ix| {
            let (sum, count) = dag
                .neighbors_directed(ix, direction)
                .fold((0usize, 0usize), |(s, c), n| (s + order[n.index()], c + 1));
            let key = if count == 0 {
                order[ix.index()] as f64
            } else {
                sum as f64 / count as f64
            };
            (ix, key)
        })
        .collect();
    keyed.sort_by(|a, b| a.1.total_cmp(&b.1));
    *layer = keyed.into_iter().map(|(ix, _)| ix).collect();
}

// ── Coordinate assignment ───────────────────────────────────────────────

#[allow(clippy::cast_precision_loss)]
fn place(
    rank: usize,
    order: usize,
    layer_len: usize,
    id: &str,
    direction: Direction,
    config: &LayoutConfig,
) -> Position {
    let (along_extent, cross_extent) = match direction {
        Direction::LeftRight => (config.node_width, config.node_height),
        Direction::TopBottom => (config.node_height, config.node_width),
    };
    let along = (rank as f64).mul_add(along_extent + config.rank_separation, along_extent / 2.0);
    let offset = order as f64 - (layer_len.saturating_sub(1) as f64) / 2.0;
    let across = offset * (cross_extent + config.node_separation);

    let (cx, cy) = match direction {
        Direction::LeftRight => (along, across),
        Direction::TopBottom => (across, along),
    };
    let (jx, jy) = if config.jitter { jitter(id) } else { (0.0, 0.0) };
    Position {
        x: cx - config.node_width / 2.0 + jx,
        y: cy - config.node_height / 2.0 + jy,
    }
}

/// Deterministic per-node offsets in `[0, MAX_JITTER)` on each axis.
fn jitter(id: &str) -> (f64, f64) {
    let mut hasher = SipHasher13::new();
    hasher.write(id.as_bytes());
    let [a, b, c, d, e, f, g, h] = hasher.finish().to_le_bytes();
    let scale = LayoutConfig::MAX_JITTER / (f64::from(u32::MAX) + 1.0);
    (
        f64::from(u32::from_le_bytes([a, b, c, d])) * scale,
        f64::from(u32::from_le_bytes([e, f, g, h])) * scale,
    )
}
