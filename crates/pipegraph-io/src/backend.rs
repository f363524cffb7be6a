//! The job-processing service as seen by the graph view.
//!
//! [`JobsBackend`] is injected into [`PipelineSession`](crate::PipelineSession)
//! as an `Arc<B>`; there is no global client. Implementations own
//! transport, authentication and retries (the session never retries).

use async_trait::async_trait;
use pipegraph_core::{JobPayload, JobRecord, PipelineNode};
use thiserror::Error;

/// Errors reported by a [`JobsBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request could not be completed (network, HTTP status, ...).
    #[error("backend request failed: {0}")]
    Request(String),

    /// The requested pipeline or job does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The response body did not have the expected shape.
    #[error("malformed backend response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Data-fetching and mutation capability of the job service.
#[async_trait]
pub trait JobsBackend: Send + Sync {
    /// Fetch the nested job tree of a pipeline; the root is the pipeline
    /// itself.
    async fn fetch_pipeline_tree(
        &self,
        project_id: &str,
        pipeline_id: &str,
    ) -> Result<PipelineNode, BackendError>;

    /// Fetch the live state of every job of a pipeline.
    async fn fetch_jobs_by_pipeline_id(
        &self,
        pipeline_id: &str,
    ) -> Result<Vec<JobRecord>, BackendError>;

    /// Create a job and return it as persisted.
    async fn create_job(&self, payload: &JobPayload) -> Result<JobRecord, BackendError>;

    /// Apply a partial update to an existing job.
    async fn update_job(&self, payload: &JobPayload) -> Result<(), BackendError>;

    /// Delete a job (and, server-side, its descendants).
    async fn delete_job(&self, job_id: &str) -> Result<(), BackendError>;

    /// Queue every waiting job of a pipeline for execution.
    async fn start_pipeline(&self, pipeline_id: &str) -> Result<(), BackendError>;
}
