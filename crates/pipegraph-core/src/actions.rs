//! Request bodies for the job mutations the graph view triggers.

use serde::{Deserialize, Serialize};

use crate::reconcile::SelectedBlock;
use crate::types::StatusCode;

/// Body of a create/update job request. Absent fields are omitted from the
/// JSON so an update only touches what it names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub omero_ids: Option<Vec<i64>>,
}

impl JobPayload {
    /// Create request for an unsaved block.
    ///
    /// Returns `None` unless `block` is the `"new"` placeholder with a
    /// parent to attach to.
    #[must_use]
    pub fn create(pipeline_id: &str, block: &SelectedBlock, params: serde_json::Value) -> Option<Self> {
        if !block.is_new() {
            return None;
        }
        let parent_id = block.root_id.clone()?;
        Some(Self {
            pipeline_id: Some(pipeline_id.to_owned()),
            parent_id: Some(parent_id),
            name: Some(block.name.clone()),
            script: block.script.clone(),
            script_path: block.script_path.clone(),
            folder: block.folder.clone(),
            params: Some(params),
            omero_ids: Some(block.omero_ids.clone()),
            ..Self::default()
        })
    }

    /// Update request replacing the parameters of a persisted job.
    ///
    /// Returns `None` for the `"new"` placeholder.
    #[must_use]
    pub fn update(block: &SelectedBlock, params: serde_json::Value) -> Option<Self> {
        if block.is_new() {
            return None;
        }
        Some(Self {
            id: Some(block.id.clone()),
            params: Some(params),
            ..Self::default()
        })
    }

    /// Update request that puts a job back in the queue.
    #[must_use]
    pub fn restart(job_id: &str) -> Self {
        Self {
            id: Some(job_id.to_owned()),
            status: Some(StatusCode::WAITING_FOR_START),
            ..Self::default()
        }
    }
}
