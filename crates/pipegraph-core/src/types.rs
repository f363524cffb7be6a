//! Shared types for the pipegraph engine.
//!
//! These mirror the JSON shapes exchanged with the job-processing backend
//! (camelCase field names). Ids arrive as either JSON strings or integers
//! depending on the endpoint, so every id field accepts both and is stored
//! as a `String`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::flatten::FlattenOptions;
use crate::layout::LayoutConfig;

/// Reserved id of a node that has not been persisted yet.
pub const NEW_NODE_ID: &str = "new";

/// Raw numeric status code reported by the backend for jobs and tasks.
///
/// The domain is closed: the named constants below, and any other value
/// meaning "in progress". A missing status is modelled as
/// `Option::<StatusCode>::None` and means "new/unknown". The default is
/// [`STARTED`](Self::STARTED), which is what a task without a reported
/// status is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StatusCode(pub i64);

impl StatusCode {
    /// Queued, not yet picked up by a worker.
    pub const PENDING: Self = Self(-4);
    /// Execution failed.
    pub const FAILED: Self = Self(-3);
    /// Created but waiting for the pipeline to be started.
    pub const WAITING_FOR_START: Self = Self(-2);
    /// Execution raised an error.
    pub const ERROR: Self = Self(-1);
    /// Execution started, no progress reported yet.
    pub const STARTED: Self = Self(0);
    /// Execution finished.
    pub const DONE: Self = Self(100);

    /// The raw numeric value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for StatusCode {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Kind of a node in the pipeline tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Synthetic entry point standing for the pipeline itself.
    Start,
    /// An executable job.
    #[default]
    Job,
}

impl NodeKind {
    /// Node type name used by the graph renderer.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Job => "job",
        }
    }
}

/// One node of the nested pipeline tree returned by the backend.
///
/// `children` is only meaningful in tree form; the flattener turns it into
/// edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineNode {
    /// Node id. Missing on malformed entries, which are skipped.
    #[serde(deserialize_with = "id_serde::deserialize_opt")]
    pub id: Option<String>,
    /// Display name.
    pub name: String,
    /// Last status reported in the tree snapshot.
    pub status: Option<StatusCode>,
    /// Start placeholder or job.
    pub kind: NodeKind,
    /// Id of the node that produced this one (a back-reference, not ownership).
    #[serde(deserialize_with = "id_serde::deserialize_opt")]
    pub parent_id: Option<String>,
    /// Opaque job parameters.
    pub params: serde_json::Value,
    /// Schema of `params`.
    pub params_meta: serde_json::Value,
    /// Script implementing the job.
    pub script: Option<String>,
    /// Path of `script` within its folder.
    pub script_path: Option<String>,
    /// Script folder.
    pub folder: Option<String>,
    /// Ordered child nodes.
    pub children: Vec<PipelineNode>,
}

impl PipelineNode {
    /// Create a job node with the given id and name.
    #[must_use]
    pub fn job(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            kind: NodeKind::Job,
            ..Self::default()
        }
    }

    /// Create a start node standing for the pipeline with the given id.
    #[must_use]
    pub fn start(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: name.into(),
            kind: NodeKind::Start,
            ..Self::default()
        }
    }

    /// Builder-style status setter.
    #[must_use]
    pub const fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Builder-style child append.
    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// The node id, if present.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Returns `true` if this node is the unsaved placeholder.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.id() == Some(NEW_NODE_ID)
    }
}

/// The smallest unit of execution, bound to one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    #[serde(deserialize_with = "id_serde::deserialize")]
    pub id: String,
    pub status: StatusCode,
    /// Error text reported by the worker, surfaced verbatim.
    pub error: Option<String>,
    pub omero_id: Option<i64>,
    pub params: serde_json::Value,
}

/// Live state of one job, as returned by the jobs-by-pipeline endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobRecord {
    #[serde(deserialize_with = "id_serde::deserialize")]
    pub id: String,
    pub name: String,
    pub status: Option<StatusCode>,
    pub tasks: Vec<Task>,
    pub omero_ids: Vec<i64>,
    pub file_names: Vec<String>,
    pub params: serde_json::Value,
    pub script: Option<String>,
    pub script_path: Option<String>,
    pub folder: Option<String>,
}

/// Live jobs of one pipeline keyed by job id.
///
/// Ordered so iteration (and therefore every derived display) is
/// deterministic.
pub type JobMap = BTreeMap<String, JobRecord>;

/// Index a list of job records by id. Later duplicates win.
#[must_use]
pub fn job_map(records: impl IntoIterator<Item = JobRecord>) -> JobMap {
    records
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect()
}

/// A job type the settings form can instantiate, identified by its script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobType {
    pub name: String,
    pub script: String,
    pub script_path: String,
    pub folder: Option<String>,
    pub params_meta: serde_json::Value,
}

/// Known job types, looked up by `(script, script_path)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobTypeCatalog(Vec<JobType>);

impl JobTypeCatalog {
    /// Create a catalog from a list of job types.
    #[must_use]
    pub const fn new(types: Vec<JobType>) -> Self {
        Self(types)
    }

    /// Find the job type implemented by `script` at `script_path`.
    #[must_use]
    pub fn find(&self, script: Option<&str>, script_path: Option<&str>) -> Option<&JobType> {
        let (script, script_path) = (script?, script_path?);
        self.0
            .iter()
            .find(|t| t.script == script && t.script_path == script_path)
    }

    /// All job types in catalog order.
    #[must_use]
    pub fn types(&self) -> &[JobType] {
        &self.0
    }
}

/// Top-level engine configuration.
///
/// Each call site (manager, editor, review) picks its own flatten options;
/// layout and refresh settings are usually shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Tree flattening options.
    pub flatten: FlattenOptions,
    /// Layered layout options.
    pub layout: LayoutConfig,
    /// Period of the polling refresh, serialized as milliseconds.
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
}

impl EngineConfig {
    /// Default polling period (60 s).
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(60_000);

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let layout = &self.layout;
        for (field, value) in [
            ("layout.nodeWidth", layout.node_width),
            ("layout.nodeHeight", layout.node_height),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositive { field, value });
            }
        }
        for (field, value) in [
            ("layout.rankSeparation", layout.rank_separation),
            ("layout.nodeSeparation", layout.node_separation),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::Negative { field, value });
            }
        }
        if self.flatten.max_depth == 0 {
            return Err(ConfigError::ZeroMaxDepth);
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroRefreshInterval);
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flatten: FlattenOptions::default(),
            layout: LayoutConfig::default(),
            refresh_interval: Self::DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// Invalid [`EngineConfig`] value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be a positive finite number, got {value}")]
    NonPositive { field: &'static str, value: f64 },

    #[error("{field} must be a non-negative finite number, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("flatten.maxDepth must be at least 1")]
    ZeroMaxDepth,

    #[error("refreshInterval must be greater than zero")]
    ZeroRefreshInterval,
}

/// The pipeline tree cannot be turned into a graph.
///
/// Raised instead of recursing forever (or overflowing the stack) on
/// corrupted backend data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphIntegrityError {
    /// A node id reappears among its own ancestors.
    #[error("node '{id}' is its own ancestor")]
    Cycle { id: String },

    /// A node id appears twice in one snapshot.
    #[error("node id '{id}' appears more than once in the pipeline tree")]
    DuplicateNode { id: String },

    /// The tree nests deeper than the configured limit.
    #[error("pipeline tree is nested deeper than {limit} levels")]
    DepthExceeded { limit: usize },
}

/// Serde support for ids sent as either strings or integers.
mod id_serde {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
    }

    impl From<RawId> for String {
        fn from(raw: RawId) -> Self {
            match raw {
                RawId::Text(s) => s,
                RawId::Int(n) => n.to_string(),
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        RawId::deserialize(deserializer).map(String::from)
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
    }
}

/// Serde support for `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_accept_strings_and_integers() {
        let json = r#"{ "id": 7, "name": "segment", "tasks": [{ "id": "12", "status": 100 }] }"#;
        let job: JobRecord = serde_json::from_str(json).unwrap();
        assert_eq!(job.id, "7");
        assert_eq!(job.tasks[0].id, "12");
        assert_eq!(job.tasks[0].status, StatusCode::DONE);
    }

    #[test]
    fn task_without_status_is_started() {
        let task: Task = serde_json::from_str(r#"{ "id": 3 }"#).unwrap();
        assert_eq!(task.status, StatusCode::STARTED);
        assert_eq!(Task::default().status, StatusCode::default());
    }

    #[test]
    fn missing_node_id_deserializes_as_none() {
        let node: PipelineNode = serde_json::from_str(r#"{ "name": "orphan" }"#).unwrap();
        assert_eq!(node.id, None);
        assert_eq!(node.kind, NodeKind::Job);
        assert!(node.children.is_empty());
    }

    #[test]
    fn null_status_is_none() {
        let node: PipelineNode =
            serde_json::from_str(r#"{ "id": "1", "status": null, "parentId": 3 }"#).unwrap();
        assert_eq!(node.status, None);
        assert_eq!(node.parent_id.as_deref(), Some("3"));
    }

    #[test]
    fn catalog_matches_on_script_and_path() {
        let catalog = JobTypeCatalog::new(vec![
            JobType {
                name: "Segment".into(),
                script: "segment.py".into(),
                script_path: "cellpose".into(),
                ..JobType::default()
            },
            JobType {
                name: "Segment (legacy)".into(),
                script: "segment.py".into(),
                script_path: "legacy".into(),
                ..JobType::default()
            },
        ]);
        let found = catalog.find(Some("segment.py"), Some("legacy")).unwrap();
        assert_eq!(found.name, "Segment (legacy)");
        assert!(catalog.find(Some("segment.py"), None).is_none());
        assert!(catalog.find(Some("other.py"), Some("cellpose")).is_none());
    }

    #[test]
    fn job_map_indexes_by_id() {
        let map = job_map([
            JobRecord {
                id: "2".into(),
                ..JobRecord::default()
            },
            JobRecord {
                id: "1".into(),
                ..JobRecord::default()
            },
        ]);
        assert_eq!(map.keys().collect::<Vec<_>>(), ["1", "2"]);
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(EngineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn config_rejects_zero_width() {
        let mut config = EngineConfig::default();
        config.layout.node_width = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositive {
                field: "layout.nodeWidth",
                ..
            })
        ));
    }

    #[test]
    fn config_refresh_interval_round_trips_as_millis() {
        let config = EngineConfig {
            refresh_interval: Duration::from_millis(1500),
            ..EngineConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["refreshInterval"], 1500);
        let parsed: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_config_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "flatten": { "includeRoot": false } }"#).unwrap();
        assert!(!config.flatten.include_root);
        assert_eq!(config.refresh_interval, EngineConfig::DEFAULT_REFRESH_INTERVAL);
        assert_eq!(config.layout, LayoutConfig::default());
    }
}
