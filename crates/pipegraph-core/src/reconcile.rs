//! Selection and action reconciliation.
//!
//! [`Reconciler`] tracks which node the settings form is editing and keeps
//! its view-model ([`SelectedBlock`]) in step with the live job map:
//!
//! ```text
//!        select / add                    select (id in jobs)
//! Idle ─────────────────► Virtual ───────────────────────► Materialized
//!  ▲                         │  promote when the id appears      │
//!  │                         │  in a later job fetch             │
//!  └─────── clear ───────────┴──────── clear / id vanished ──────┘
//! ```
//!
//! A live status change for the materialized job refreshes the status
//! fields in place. Parameters are never overwritten from a poll: the form
//! owns the user's drafts, the reconciler only supplies initial values.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::flatten::{GraphNode, VirtualNode};
use crate::status::{TaskError, aggregate_job_status, sort_tasks_by_id, task_errors};
use crate::types::{
    JobMap, JobRecord, JobType, JobTypeCatalog, NEW_NODE_ID, NodeKind, PipelineNode, StatusCode,
    Task,
};

/// Settings for a block about to be added, usually taken from a [`JobType`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockTemplate {
    pub name: String,
    pub script: Option<String>,
    pub script_path: Option<String>,
    pub folder: Option<String>,
    pub params: serde_json::Value,
    pub params_meta: serde_json::Value,
}

impl From<&JobType> for BlockTemplate {
    fn from(job_type: &JobType) -> Self {
        Self {
            name: job_type.name.clone(),
            script: Some(job_type.script.clone()),
            script_path: Some(job_type.script_path.clone()),
            folder: job_type.folder.clone(),
            params: serde_json::Value::Null,
            params_meta: job_type.params_meta.clone(),
        }
    }
}

/// View-model of the node being edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedBlock {
    pub id: String,
    /// Intended parent of an unsaved block.
    pub root_id: Option<String>,
    pub name: String,
    pub status: Option<StatusCode>,
    pub kind: NodeKind,
    pub folder: Option<String>,
    pub script: Option<String>,
    pub script_path: Option<String>,
    pub params: serde_json::Value,
    pub params_meta: serde_json::Value,
    /// Tasks in ascending id order.
    pub tasks: Vec<Task>,
    pub errors: Vec<TaskError>,
    pub omero_ids: Vec<i64>,
    pub file_names: Vec<String>,
    /// Aggregate task progress, see [`aggregate_job_status`].
    pub progress: Option<f64>,
    pub job_type: Option<JobType>,
}

impl SelectedBlock {
    /// Provisional view-model from what the clicked node already carries.
    fn from_node(node: &GraphNode) -> Self {
        Self {
            id: node.id.clone(),
            root_id: node.data.parent_id.clone(),
            name: node.data.name.clone(),
            status: node.data.status,
            kind: node.data.kind,
            folder: node.data.folder.clone(),
            script: node.data.script.clone(),
            script_path: node.data.script_path.clone(),
            params: node.data.params.clone(),
            params_meta: node.data.params_meta.clone(),
            tasks: Vec::new(),
            errors: Vec::new(),
            omero_ids: Vec::new(),
            file_names: Vec::new(),
            progress: None,
            job_type: None,
        }
    }

    /// Full view-model of a persisted job.
    ///
    /// The parameter schema comes from the matching job type, else from
    /// `node_meta` (what the clicked node carried).
    fn from_job(
        job: &JobRecord,
        kind: NodeKind,
        root_id: Option<String>,
        node_meta: &serde_json::Value,
        catalog: &JobTypeCatalog,
    ) -> Self {
        let job_type = catalog
            .find(job.script.as_deref(), job.script_path.as_deref())
            .cloned();
        let params_meta = job_type
            .as_ref()
            .map_or_else(|| node_meta.clone(), |t| t.params_meta.clone());
        let mut block = Self {
            id: job.id.clone(),
            root_id,
            name: job.name.clone(),
            status: None,
            kind,
            folder: job.folder.clone(),
            script: job.script.clone(),
            script_path: job.script_path.clone(),
            params: job.params.clone(),
            params_meta,
            tasks: Vec::new(),
            errors: Vec::new(),
            omero_ids: job.omero_ids.clone(),
            file_names: job.file_names.clone(),
            progress: None,
            job_type,
        };
        block.refresh_status_fields(job.status, &job.tasks);
        block
    }

    /// Overwrite only the fields a background poll is allowed to change.
    fn refresh_status_fields(&mut self, status: Option<StatusCode>, tasks: &[Task]) {
        let mut tasks = tasks.to_vec();
        sort_tasks_by_id(&mut tasks);
        self.status = status;
        self.errors = task_errors(&tasks);
        self.progress = aggregate_job_status(&tasks);
        self.tasks = tasks;
    }

    /// Returns `true` for the unsaved placeholder.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.id == NEW_NODE_ID
    }
}

/// Current selection state.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Selection {
    #[default]
    Idle,
    /// Editing a node the job map does not know (yet).
    Virtual(SelectedBlock),
    /// Editing a persisted job.
    Materialized(SelectedBlock),
}

impl Selection {
    /// The block being edited, if any.
    #[must_use]
    pub const fn block(&self) -> Option<&SelectedBlock> {
        match self {
            Self::Idle => None,
            Self::Virtual(block) | Self::Materialized(block) => Some(block),
        }
    }
}

/// What a reconciler call did to the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionChange {
    Unchanged,
    /// A new block was selected (identity changed).
    Selected,
    /// The same block was updated in place.
    Refreshed,
    /// The selection went back to idle.
    Cleared,
}

/// Selection state machine. See the module docs.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    selection: Selection,
    generation: u64,
}

impl Reconciler {
    /// Create an idle reconciler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current selection.
    #[must_use]
    pub const fn selection(&self) -> &Selection {
        &self.selection
    }

    /// The block being edited, if any.
    #[must_use]
    pub const fn selected_block(&self) -> Option<&SelectedBlock> {
        self.selection.block()
    }

    /// Bumped on every select, add and clear. Results computed for an
    /// older generation belong to a click that has since been superseded.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Select a clicked graph node.
    ///
    /// The `"new"` placeholder is not selectable. A node missing from
    /// `jobs` (including every node while jobs are still loading) is
    /// selected virtually from its own data.
    pub fn select_node(
        &mut self,
        node: &GraphNode,
        jobs: &JobMap,
        catalog: &JobTypeCatalog,
    ) -> SelectionChange {
        if node.id == NEW_NODE_ID {
            return SelectionChange::Unchanged;
        }
        self.selection = match jobs.get(&node.id) {
            Some(job) => Selection::Materialized(SelectedBlock::from_job(
                job,
                node.data.kind,
                node.data.parent_id.clone(),
                &node.data.params_meta,
                catalog,
            )),
            None => Selection::Virtual(SelectedBlock::from_node(node)),
        };
        self.generation += 1;
        debug!(id = %node.id, materialized = matches!(self.selection, Selection::Materialized(_)), "node selected");
        SelectionChange::Selected
    }

    /// Start editing a new block under `parent_id`.
    ///
    /// No-op while no pipeline is loaded. The block inherits the parent
    /// job's image ids.
    pub fn add_block(
        &mut self,
        pipeline: Option<&PipelineNode>,
        parent_id: &str,
        template: &BlockTemplate,
        jobs: &JobMap,
    ) -> SelectionChange {
        if pipeline.is_none() {
            debug!(parent_id, "add ignored: no pipeline loaded");
            return SelectionChange::Unchanged;
        }
        let omero_ids = jobs
            .get(parent_id)
            .map(|parent| parent.omero_ids.clone())
            .unwrap_or_default();
        self.selection = Selection::Virtual(SelectedBlock {
            id: NEW_NODE_ID.to_owned(),
            root_id: Some(parent_id.to_owned()),
            name: template.name.clone(),
            status: Some(StatusCode::STARTED),
            kind: NodeKind::Job,
            folder: template.folder.clone(),
            script: template.script.clone(),
            script_path: template.script_path.clone(),
            params: template.params.clone(),
            params_meta: template.params_meta.clone(),
            tasks: Vec::new(),
            errors: Vec::new(),
            omero_ids,
            file_names: Vec::new(),
            progress: None,
            job_type: None,
        });
        self.generation += 1;
        debug!(parent_id, name = %template.name, "virtual block added");
        SelectionChange::Selected
    }

    /// Drop the selection (pane click, delete, or successful submit).
    pub fn clear_selection(&mut self) -> SelectionChange {
        self.generation += 1;
        if matches!(self.selection, Selection::Idle) {
            return SelectionChange::Unchanged;
        }
        self.selection = Selection::Idle;
        SelectionChange::Cleared
    }

    /// Apply a live status change for `job_id`.
    ///
    /// Only affects a materialized selection of the same id whose status
    /// differs; tasks, errors and progress are re-derived from `jobs` when
    /// the record is there. Identity and parameters are kept.
    pub fn live_status_changed(
        &mut self,
        job_id: &str,
        new_status: StatusCode,
        jobs: &JobMap,
    ) -> SelectionChange {
        let Selection::Materialized(block) = &mut self.selection else {
            return SelectionChange::Unchanged;
        };
        if block.id != job_id || block.status == Some(new_status) {
            return SelectionChange::Unchanged;
        }
        let tasks = jobs
            .get(job_id)
            .map_or_else(|| block.tasks.clone(), |job| job.tasks.clone());
        block.refresh_status_fields(Some(new_status), &tasks);
        info!(job_id, status = new_status.get(), "selected job status refreshed");
        SelectionChange::Refreshed
    }

    /// Reconcile the selection with a freshly fetched job map.
    ///
    /// - a materialized job that disappeared clears the selection;
    /// - a materialized job whose status changed is refreshed in place;
    /// - a virtual selection of a real id that now exists is promoted.
    pub fn reconcile_jobs(&mut self, jobs: &JobMap, catalog: &JobTypeCatalog) -> SelectionChange {
        match &self.selection {
            Selection::Idle => SelectionChange::Unchanged,
            Selection::Materialized(block) => match jobs.get(&block.id) {
                None => {
                    info!(job_id = %block.id, "selected job no longer exists; clearing selection");
                    self.clear_selection()
                }
                Some(job) => match job.status {
                    Some(status) => {
                        let id = block.id.clone();
                        self.live_status_changed(&id, status, jobs)
                    }
                    None => SelectionChange::Unchanged,
                },
            },
            Selection::Virtual(block) if !block.is_new() => match jobs.get(&block.id) {
                Some(job) => {
                    let promoted = SelectedBlock::from_job(
                        job,
                        block.kind,
                        block.root_id.clone(),
                        &block.params_meta,
                        catalog,
                    );
                    debug!(job_id = %promoted.id, "virtual selection promoted");
                    self.selection = Selection::Materialized(promoted);
                    SelectionChange::Refreshed
                }
                None => SelectionChange::Unchanged,
            },
            Selection::Virtual(_) => SelectionChange::Unchanged,
        }
    }

    /// The unsaved block as a node to splice into the tree before
    /// flattening, if one is being edited.
    #[must_use]
    pub fn virtual_node(&self) -> Option<VirtualNode> {
        let Selection::Virtual(block) = &self.selection else {
            return None;
        };
        if !block.is_new() {
            return None;
        }
        let root_id = block.root_id.clone()?;
        Some(VirtualNode {
            node: PipelineNode {
                id: Some(NEW_NODE_ID.to_owned()),
                name: block.name.clone(),
                status: block.status,
                kind: NodeKind::Job,
                parent_id: Some(root_id.clone()),
                params: block.params.clone(),
                params_meta: block.params_meta.clone(),
                script: block.script.clone(),
                script_path: block.script_path.clone(),
                folder: block.folder.clone(),
                children: Vec::new(),
            },
            root_id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::flatten::{FlattenContext, FlattenOptions, flatten};
    use crate::types::job_map;

    fn tree() -> PipelineNode {
        PipelineNode::start("p1", "pipeline").with_child(
            PipelineNode::job("42", "import").with_child(PipelineNode::job("43", "segment")),
        )
    }

    fn node(id: &str) -> GraphNode {
        flatten(&tree(), &FlattenContext::default(), &FlattenOptions::default())
            .unwrap()
            .node(id)
            .cloned()
            .unwrap()
    }

    fn task(id: &str, status: i64) -> Task {
        Task {
            id: id.into(),
            status: StatusCode(status),
            ..Task::default()
        }
    }

    fn jobs(status: i64) -> JobMap {
        job_map([
            JobRecord {
                id: "42".into(),
                name: "import".into(),
                status: Some(StatusCode::DONE),
                omero_ids: vec![7, 8],
                ..JobRecord::default()
            },
            JobRecord {
                id: "43".into(),
                name: "segment".into(),
                status: Some(StatusCode(status)),
                tasks: vec![task("11", status), task("2", status)],
                params: serde_json::json!({ "diameter": 30 }),
                script: Some("segment.py".into()),
                script_path: Some("cellpose".into()),
                ..JobRecord::default()
            },
        ])
    }

    fn catalog() -> JobTypeCatalog {
        JobTypeCatalog::new(vec![JobType {
            name: "Cellpose".into(),
            script: "segment.py".into(),
            script_path: "cellpose".into(),
            folder: Some("segmentation".into()),
            params_meta: serde_json::json!({ "diameter": { "type": "number" } }),
        }])
    }

    #[test]
    fn selecting_known_job_materializes() {
        let mut r = Reconciler::new();
        assert_eq!(r.select_node(&node("43"), &jobs(0), &catalog()), SelectionChange::Selected);
        let Selection::Materialized(block) = r.selection() else {
            panic!("expected materialized selection");
        };
        assert_eq!(block.id, "43");
        let task_ids: Vec<&str> = block.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(task_ids, ["2", "11"]);
        assert_eq!(block.job_type.as_ref().unwrap().name, "Cellpose");
        assert_eq!(block.params_meta["diameter"]["type"], "number");
        assert_eq!(block.root_id.as_deref(), Some("42"));
    }

    #[test]
    fn uncatalogued_job_keeps_node_schema() {
        let mut r = Reconciler::new();
        let mut clicked = node("43");
        clicked.data.params_meta = serde_json::json!({ "threshold": { "type": "number" } });
        r.select_node(&clicked, &jobs(0), &JobTypeCatalog::default());
        let block = r.selected_block().unwrap();
        assert!(block.job_type.is_none());
        assert_eq!(block.params_meta["threshold"]["type"], "number");
    }

    #[test]
    fn selecting_before_jobs_load_is_virtual() {
        let mut r = Reconciler::new();
        r.select_node(&node("43"), &JobMap::new(), &catalog());
        let Selection::Virtual(block) = r.selection() else {
            panic!("expected virtual selection");
        };
        assert_eq!(block.name, "segment");
        assert!(block.tasks.is_empty());
    }

    #[test]
    fn new_placeholder_is_not_selectable() {
        let mut r = Reconciler::new();
        let mut placeholder = node("43");
        placeholder.id = NEW_NODE_ID.into();
        assert_eq!(
            r.select_node(&placeholder, &jobs(0), &catalog()),
            SelectionChange::Unchanged
        );
        assert_eq!(r.selection(), &Selection::Idle);
        assert_eq!(r.generation(), 0);
    }

    #[test]
    fn add_then_cancel() {
        let mut r = Reconciler::new();
        let template = BlockTemplate {
            name: "segment".into(),
            ..BlockTemplate::default()
        };
        let t = tree();
        r.add_block(Some(&t), "42", &template, &jobs(0));
        let Selection::Virtual(block) = r.selection() else {
            panic!("expected virtual selection");
        };
        assert_eq!(block.id, NEW_NODE_ID);
        assert_eq!(block.root_id.as_deref(), Some("42"));
        assert_eq!(block.status, Some(StatusCode::STARTED));
        assert_eq!(block.omero_ids, [7, 8]);

        assert_eq!(r.clear_selection(), SelectionChange::Cleared);
        assert_eq!(r.selection(), &Selection::Idle);
        assert!(r.virtual_node().is_none());

        let graph = flatten(&t, &FlattenContext::default(), &FlattenOptions::default()).unwrap();
        assert!(graph.node(NEW_NODE_ID).is_none());
    }

    #[test]
    fn add_without_pipeline_is_noop() {
        let mut r = Reconciler::new();
        let change = r.add_block(None, "42", &BlockTemplate::default(), &jobs(0));
        assert_eq!(change, SelectionChange::Unchanged);
        assert_eq!(r.selection(), &Selection::Idle);
    }

    #[test]
    fn virtual_node_splices_into_flatten() {
        let mut r = Reconciler::new();
        let t = tree();
        r.add_block(Some(&t), "43", &BlockTemplate::default(), &JobMap::new());
        let virtual_node = r.virtual_node().unwrap();
        let context = FlattenContext {
            virtual_node: Some(&virtual_node),
            ..FlattenContext::default()
        };
        let graph = flatten(&t, &context, &FlattenOptions::default()).unwrap();
        assert_eq!(graph.nodes.iter().filter(|n| n.is_new).count(), 1);
        assert_eq!(
            graph.node(NEW_NODE_ID).unwrap().data.parent_id.as_deref(),
            Some("43")
        );
    }

    #[test]
    fn live_status_refreshes_in_place() {
        let mut r = Reconciler::new();
        r.select_node(&node("43"), &jobs(0), &catalog());
        let generation = r.generation();

        let updated = jobs(50);
        assert_eq!(
            r.live_status_changed("43", StatusCode(50), &updated),
            SelectionChange::Refreshed
        );
        let Selection::Materialized(block) = r.selection() else {
            panic!("expected materialized selection");
        };
        assert_eq!(block.id, "43");
        assert_eq!(block.status, Some(StatusCode(50)));
        assert_eq!(block.progress, Some(0.5));
        assert_eq!(r.generation(), generation);
    }

    #[test]
    fn live_status_keeps_params() {
        let mut r = Reconciler::new();
        r.select_node(&node("43"), &jobs(0), &catalog());
        let mut updated = jobs(60);
        if let Some(job) = updated.get_mut("43") {
            job.params = serde_json::json!({ "diameter": 99 });
        }
        r.live_status_changed("43", StatusCode(60), &updated);
        assert_eq!(r.selected_block().unwrap().params["diameter"], 30);
    }

    #[test]
    fn live_status_for_other_job_is_ignored() {
        let mut r = Reconciler::new();
        r.select_node(&node("43"), &jobs(0), &catalog());
        assert_eq!(
            r.live_status_changed("42", StatusCode(50), &jobs(0)),
            SelectionChange::Unchanged
        );
        assert_eq!(
            r.live_status_changed("43", StatusCode(0), &jobs(0)),
            SelectionChange::Unchanged
        );
    }

    #[test]
    fn last_click_wins() {
        let mut r = Reconciler::new();
        r.select_node(&node("43"), &jobs(0), &catalog());
        r.select_node(&node("42"), &jobs(0), &catalog());
        // A late update for the first click must not touch the second.
        assert_eq!(
            r.live_status_changed("43", StatusCode(80), &jobs(80)),
            SelectionChange::Unchanged
        );
        assert_eq!(r.selected_block().unwrap().id, "42");
    }

    #[test]
    fn vanished_job_clears_selection() {
        let mut r = Reconciler::new();
        r.select_node(&node("43"), &jobs(0), &catalog());
        let mut remaining = jobs(0);
        remaining.remove("43");
        assert_eq!(r.reconcile_jobs(&remaining, &catalog()), SelectionChange::Cleared);
        assert_eq!(r.selection(), &Selection::Idle);
    }

    #[test]
    fn reconcile_refreshes_changed_status() {
        let mut r = Reconciler::new();
        r.select_node(&node("43"), &jobs(0), &catalog());
        assert_eq!(r.reconcile_jobs(&jobs(75), &catalog()), SelectionChange::Refreshed);
        assert_eq!(r.selected_block().unwrap().status, Some(StatusCode(75)));
        assert_eq!(r.reconcile_jobs(&jobs(75), &catalog()), SelectionChange::Unchanged);
    }

    #[test]
    fn virtual_selection_promoted_when_jobs_arrive() {
        let mut r = Reconciler::new();
        r.select_node(&node("43"), &JobMap::new(), &catalog());
        assert_eq!(r.reconcile_jobs(&jobs(10), &catalog()), SelectionChange::Refreshed);
        assert!(matches!(r.selection(), Selection::Materialized(b) if b.tasks.len() == 2));
    }

    #[test]
    fn unsaved_block_survives_job_refresh() {
        let mut r = Reconciler::new();
        let t = tree();
        r.add_block(Some(&t), "42", &BlockTemplate::default(), &jobs(0));
        assert_eq!(r.reconcile_jobs(&jobs(0), &catalog()), SelectionChange::Unchanged);
        assert!(r.selected_block().unwrap().is_new());
    }
}
