//! pipegraph-core: Pipeline graph engine (sans-IO).
//!
//! Turns a backend pipeline tree into a positioned graph and keeps the
//! user's selection consistent with live job state:
//!
//! tree -> flatten (virtual splice, live status) -> layered layout ->
//! positioned nodes and edges.
//!
//! This crate has **no I/O dependencies**: no network, no timers, no
//! system clock. Fetching, polling and the event loop live in
//! `pipegraph-io`.

pub mod actions;
pub mod diagnostics;
pub mod flatten;
pub mod layout;
pub mod reconcile;
pub mod refresh;
pub mod status;
pub mod tree;
pub mod types;

pub use actions::JobPayload;
pub use flatten::{
    FlattenContext, FlattenOptions, FlattenedGraph, GraphEdge, GraphNode, NodeData, VirtualNode,
    flatten,
};
pub use layout::{Direction, LayoutConfig, LayoutResult, PortSide, Position, PositionedNode, layout};
pub use reconcile::{BlockTemplate, Reconciler, SelectedBlock, Selection, SelectionChange};
pub use refresh::{FetchTicket, RefreshAction, RefreshCoordinator};
pub use status::{
    Status, StatusBucket, TaskError, aggregate_job_status, bucket_by_status, progress_label,
    sort_tasks_by_id, status_color, status_label, task_errors,
};
pub use tree::{TreeIndex, insert_child, remove_subtree};
pub use types::{
    ConfigError, EngineConfig, GraphIntegrityError, JobMap, JobRecord, JobType, JobTypeCatalog,
    NEW_NODE_ID, NodeKind, PipelineNode, StatusCode, Task, job_map,
};

/// Flatten `tree` and lay it out in `config.layout.direction`.
///
/// # Errors
///
/// Returns [`GraphIntegrityError`] if the tree repeats an id or nests
/// deeper than `config.flatten.max_depth`.
pub fn build_graph(
    tree: &PipelineNode,
    context: &FlattenContext<'_>,
    config: &EngineConfig,
) -> Result<LayoutResult, GraphIntegrityError> {
    let graph = flatten(tree, context, &config.flatten)?;
    Ok(layout(&graph, config.layout.direction, &config.layout))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn build_graph_positions_every_node() {
        let tree = PipelineNode::start("p1", "pipeline")
            .with_child(PipelineNode::job("1", "import").with_status(StatusCode::DONE))
            .with_child(PipelineNode::job("2", "segment"));
        let result = build_graph(&tree, &FlattenContext::default(), &EngineConfig::default()).unwrap();
        assert_eq!(result.nodes.len(), 3);
        assert_eq!(result.edges.len(), 2);
        assert_eq!(result.direction, Direction::LeftRight);
        assert!(!result.edges[0].animated);
        assert!(result.edges[1].animated);
    }

    #[test]
    fn build_graph_rejects_duplicates() {
        let tree = PipelineNode::start("p1", "pipeline")
            .with_child(PipelineNode::job("1", "a"))
            .with_child(PipelineNode::job("1", "b"));
        assert_eq!(
            build_graph(&tree, &FlattenContext::default(), &EngineConfig::default()).unwrap_err(),
            GraphIntegrityError::DuplicateNode { id: "1".into() }
        );
    }

    #[test]
    fn empty_tree_lays_out_to_single_start_node() {
        let result = build_graph(
            &PipelineNode::start("p1", "pipeline"),
            &FlattenContext::default(),
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(result.nodes.len(), 1);
        assert!(result.edges.is_empty());
    }
}
