//! Graph build diagnostics: timing and counts for flatten and layout.
//!
//! Collected by [`build_graph_with_diagnostics`] alongside the layout. The
//! caller supplies a [`Clock`], so the core itself never reads the system
//! time and stays usable from tests and WASM hosts.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flatten::{FlattenContext, flatten};
use crate::layout::{Direction, LayoutResult, layout};
use crate::types::{EngineConfig, GraphIntegrityError, PipelineNode};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of timestamps for diagnostics.
pub trait Clock {
    type Instant;

    /// Current time.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Diagnostics collected from one graph build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDiagnostics {
    pub flatten: StageDiagnostics,
    pub layout: StageDiagnostics,
    /// Wall-clock duration of the whole build (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    pub summary: GraphSummary,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    Flatten {
        node_count: usize,
        edge_count: usize,
        /// Nodes dropped because they (or an ancestor) had no id.
        skipped: usize,
        /// Edges whose target has not reached the completion code.
        animated_edges: usize,
        /// Whether the unsaved `"new"` block was spliced in.
        has_new_node: bool,
    },
    Layout {
        direction: Direction,
        rank_count: usize,
        /// Largest number of nodes sharing one rank.
        max_rank_width: usize,
        dropped_edges: usize,
    },
}

/// High-level summary of the built graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSummary {
    pub node_count: usize,
    pub edge_count: usize,
    pub rank_count: usize,
    /// Bounding box of all node boxes.
    pub width: f64,
    pub height: f64,
}

impl GraphDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Graph Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Graph: {} nodes, {} edges, {} ranks ({:.0}x{:.0})",
            self.summary.node_count,
            self.summary.edge_count,
            self.summary.rank_count,
            self.summary.width,
            self.summary.height,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<12} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(72));

        let total_ms = duration_ms(self.total_duration);
        for (name, diag) in [("Flatten", &self.flatten), ("Layout", &self.layout)] {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<12} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.join("\n")
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Flatten {
            node_count,
            edge_count,
            skipped,
            animated_edges,
            has_new_node,
        } => {
            let new = if *has_new_node { " +new" } else { "" };
            format!(
                "{node_count} nodes, {edge_count} edges ({animated_edges} animated), {skipped} skipped{new}"
            )
        }
        StageMetrics::Layout {
            direction,
            rank_count,
            max_rank_width,
            dropped_edges,
        } => format!(
            "{} {rank_count} ranks, widest {max_rank_width}, {dropped_edges} dropped edges",
            direction.as_str()
        ),
    }
}

/// [`build_graph`](crate::build_graph) with per-stage diagnostics.
///
/// # Errors
///
/// Returns the [`GraphIntegrityError`] raised by flattening.
pub fn build_graph_with_diagnostics<C: Clock>(
    tree: &PipelineNode,
    context: &FlattenContext<'_>,
    config: &EngineConfig,
    clock: &C,
) -> Result<(LayoutResult, GraphDiagnostics), GraphIntegrityError> {
    let total_start = clock.now();

    let start = clock.now();
    let graph = flatten(tree, context, &config.flatten)?;
    let flatten_diag = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Flatten {
            node_count: graph.nodes.len(),
            edge_count: graph.edges.len(),
            skipped: graph.skipped,
            animated_edges: graph.edges.iter().filter(|e| e.animated).count(),
            has_new_node: graph.nodes.iter().any(|n| n.is_new),
        },
    };

    let direction = config.layout.direction;
    let start = clock.now();
    let result = layout(&graph, direction, &config.layout);
    let rank_count = result.rank_count();
    let mut widths = vec![0_usize; rank_count];
    for node in &result.nodes {
        if let Some(width) = widths.get_mut(node.rank) {
            *width += 1;
        }
    }
    let layout_diag = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Layout {
            direction,
            rank_count,
            max_rank_width: widths.into_iter().max().unwrap_or(0),
            dropped_edges: result.dropped_edges,
        },
    };

    let (width, height) = bounding_box(&result, config);
    let diagnostics = GraphDiagnostics {
        flatten: flatten_diag,
        layout: layout_diag,
        total_duration: clock.elapsed(&total_start),
        summary: GraphSummary {
            node_count: result.nodes.len(),
            edge_count: result.edges.len(),
            rank_count,
            width,
            height,
        },
    };
    Ok((result, diagnostics))
}

fn bounding_box(result: &LayoutResult, config: &EngineConfig) -> (f64, f64) {
    if result.nodes.is_empty() {
        return (0.0, 0.0);
    }
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for node in &result.nodes {
        min_x = min_x.min(node.position.x);
        min_y = min_y.min(node.position.y);
        max_x = max_x.max(node.position.x + config.layout.node_width);
        max_y = max_y.max(node.position.y + config.layout.node_height);
    }
    (max_x - min_x, max_y - min_y)
}
