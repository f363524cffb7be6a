//! One open pipeline: cached tree and jobs, the current layout, and the
//! event contract the rendering layer calls into.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`. Every backend round-trip follows the same shape: lock and
//! take a ticket or snapshot, unlock, await the backend, lock again and
//! apply the result only if it still belongs to the current pipeline
//! (refresh generation) or the current selection (selection generation).
//! A mutation supersedes any refresh already in flight, so a snapshot
//! requested before the mutation is never applied after it.
//!
//! Time is read from the tokio clock, so paused-time tests drive the
//! refresh schedule too.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pipegraph_core::{
    BlockTemplate, EngineConfig, FetchTicket, FlattenContext, GraphIntegrityError, JobMap,
    JobPayload, JobRecord, JobTypeCatalog, LayoutResult, PipelineNode, Reconciler,
    RefreshAction, RefreshCoordinator, SelectedBlock, Selection, SelectionChange, StatusCode,
    build_graph, job_map, remove_subtree,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::backend::{BackendError, JobsBackend};
use crate::poller::Poller;

/// Errors returned by [`PipelineSession`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid pipeline tree: {0}")]
    Graph(#[from] GraphIntegrityError),

    #[error("invalid configuration: {0}")]
    Config(#[from] pipegraph_core::ConfigError),

    /// The operation needs an open pipeline.
    #[error("no pipeline is open")]
    NotOpen,

    /// The operation needs a selected block.
    #[error("no block is selected")]
    NothingSelected,

    /// The operation needs a job the backend knows about.
    #[error("block {id} has not been saved")]
    NotPersisted { id: String },
}

/// Identifies an open pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub project_id: String,
    pub pipeline_id: String,
}

/// Result of a successful [`PipelineSession::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// A new job was created.
    Created(JobRecord),
    /// An existing job's parameters were replaced.
    Updated { id: String },
}

/// A pipeline tree with the live records of its jobs.
pub type Snapshot = (PipelineNode, Vec<JobRecord>);

#[derive(Debug, Default)]
struct SessionState {
    coordinator: RefreshCoordinator<PipelineKey>,
    tree: Option<PipelineNode>,
    jobs: JobMap,
    jobs_loaded: bool,
    reconciler: Reconciler,
    layout: Option<LayoutResult>,
}

impl SessionState {
    fn clear_cache(&mut self) {
        self.tree = None;
        self.jobs.clear();
        self.jobs_loaded = false;
        self.reconciler.clear_selection();
        self.layout = None;
    }

    /// Re-flatten and re-layout the cached tree after a selection or
    /// status change. On failure the previous layout stays.
    fn rebuild(&mut self, config: &EngineConfig) {
        let Some(tree) = &self.tree else {
            self.layout = None;
            return;
        };
        let jobs = self.jobs_loaded.then_some(&self.jobs);
        match graph_for(tree, jobs, &self.reconciler, config) {
            Ok(layout) => self.layout = Some(layout),
            Err(err) => {
                warn!(error = %err, "pipeline graph rebuild failed; keeping previous layout");
            }
        }
    }
}

/// Lay out `tree` as seen through `reconciler`'s selection.
fn graph_for(
    tree: &PipelineNode,
    jobs: Option<&JobMap>,
    reconciler: &Reconciler,
    config: &EngineConfig,
) -> Result<LayoutResult, GraphIntegrityError> {
    let virtual_node = reconciler.virtual_node();
    let context = FlattenContext {
        selected_id: reconciler.selected_block().map(|b| b.id.as_str()),
        virtual_node: virtual_node.as_ref(),
        jobs,
    };
    build_graph(tree, &context, config)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// An open pipeline and its graph view.
pub struct PipelineSession<B> {
    backend: Arc<B>,
    config: EngineConfig,
    catalog: JobTypeCatalog,
    state: Mutex<SessionState>,
}

impl<B> std::fmt::Debug for PipelineSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSession")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<B: JobsBackend> PipelineSession<B> {
    /// Create a session with no pipeline open.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if `config` does not validate.
    pub fn new(
        backend: Arc<B>,
        config: EngineConfig,
        catalog: JobTypeCatalog,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let state = SessionState {
            coordinator: RefreshCoordinator::new(config.refresh_interval),
            ..SessionState::default()
        };
        Ok(Self {
            backend,
            config,
            catalog,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Engine configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The open pipeline, if any.
    #[must_use]
    pub fn pipeline(&self) -> Option<PipelineKey> {
        self.state().coordinator.active().cloned()
    }

    /// Open a pipeline, dropping everything cached for the previous one,
    /// and load it.
    ///
    /// Returns `Ok(false)` if another `open` or `close` superseded this one
    /// while its data was loading.
    ///
    /// # Errors
    ///
    /// Returns the backend error if loading failed, or
    /// [`SessionError::Graph`] if the fetched tree is malformed.
    pub async fn open(&self, project_id: &str, pipeline_id: &str) -> Result<bool, SessionError> {
        let key = PipelineKey {
            project_id: project_id.to_owned(),
            pipeline_id: pipeline_id.to_owned(),
        };
        let ticket = {
            let mut state = self.state();
            let mut ticket = None;
            for action in state.coordinator.start(key, now()) {
                match action {
                    RefreshAction::Clear(old) => {
                        debug!(pipeline_id = %old.pipeline_id, "clearing previous pipeline");
                        state.clear_cache();
                    }
                    RefreshAction::Fetch(t) => ticket = Some(t),
                }
            }
            ticket
        };
        info!(project_id, pipeline_id, "pipeline opened");
        match ticket {
            Some(ticket) => self.fetch_and_apply(ticket).await,
            None => Ok(false),
        }
    }

    /// Re-fetch the open pipeline's tree and jobs.
    ///
    /// Returns `Ok(false)` if nothing was applied: no pipeline is open, a
    /// fetch is already in flight, or the pipeline changed meanwhile.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open). On error the cached data stays as it was.
    pub async fn refresh(&self) -> Result<bool, SessionError> {
        match self.begin_refresh() {
            Some(ticket) => self.fetch_and_apply(ticket).await,
            None => Ok(false),
        }
    }

    /// First half of [`refresh`](Self::refresh) for drivers that run the
    /// fetch themselves: claims a ticket unless a fetch is in flight.
    #[must_use]
    pub fn begin_refresh(&self) -> Option<FetchTicket<PipelineKey>> {
        self.state().coordinator.trigger(now())
    }

    /// Refresh if the periodic schedule says one is due.
    ///
    /// Returns `Ok(false)` when nothing was due or applied.
    ///
    /// # Errors
    ///
    /// See [`refresh`](Self::refresh).
    pub async fn poll_due(&self) -> Result<bool, SessionError> {
        let action = self.state().coordinator.poll(now());
        match action {
            Some(RefreshAction::Fetch(ticket)) => self.fetch_and_apply(ticket).await,
            _ => Ok(false),
        }
    }

    /// Fetch the snapshot a ticket asks for.
    ///
    /// # Errors
    ///
    /// Propagates the first backend failure.
    pub async fn fetch_snapshot(
        &self,
        ticket: &FetchTicket<PipelineKey>,
    ) -> Result<Snapshot, BackendError> {
        let key = &ticket.key;
        tokio::try_join!(
            self.backend
                .fetch_pipeline_tree(&key.project_id, &key.pipeline_id),
            self.backend.fetch_jobs_by_pipeline_id(&key.pipeline_id),
        )
    }

    /// Second half of [`refresh`](Self::refresh): store a fetched snapshot
    /// if `ticket` is still current.
    ///
    /// # Errors
    ///
    /// Returns the fetch error unchanged, or [`SessionError::Graph`] if the
    /// tree is malformed; in both cases the cached tree, jobs, selection
    /// and layout stay as they were.
    pub fn apply_refresh(
        &self,
        ticket: &FetchTicket<PipelineKey>,
        result: Result<Snapshot, BackendError>,
    ) -> Result<bool, SessionError> {
        let mut guard = self.state();
        let state = &mut *guard;
        if !state.coordinator.complete(ticket) {
            return Ok(false);
        }
        let (tree, records) = result.inspect_err(|err| {
            warn!(pipeline_id = %ticket.key.pipeline_id, error = %err, "refresh failed; keeping cached data");
        })?;

        // Build everything on the side and commit only a consistent set.
        let jobs = job_map(records);
        let mut reconciler = state.reconciler.clone();
        let change = reconciler.reconcile_jobs(&jobs, &self.catalog);
        let layout = graph_for(&tree, Some(&jobs), &reconciler, &self.config).inspect_err(|err| {
            warn!(pipeline_id = %ticket.key.pipeline_id, error = %err, "fetched tree rejected; keeping cached data");
        })?;
        if change != SelectionChange::Unchanged {
            debug!(?change, "selection reconciled with fetched jobs");
        }
        state.tree = Some(tree);
        state.jobs = jobs;
        state.jobs_loaded = true;
        state.reconciler = reconciler;
        state.layout = Some(layout);
        debug!(
            pipeline_id = %ticket.key.pipeline_id,
            jobs = state.jobs.len(),
            "refresh applied"
        );
        Ok(true)
    }

    async fn fetch_and_apply(&self, ticket: FetchTicket<PipelineKey>) -> Result<bool, SessionError> {
        let result = self.fetch_snapshot(&ticket).await;
        self.apply_refresh(&ticket, result)
    }

    /// Close the pipeline and drop everything cached for it.
    pub fn close(&self) {
        let mut state = self.state();
        if let Some(RefreshAction::Clear(key)) = state.coordinator.cancel() {
            state.clear_cache();
            info!(pipeline_id = %key.pipeline_id, "pipeline closed");
        }
    }

    /// Poll the open pipeline every `config.refresh_interval`.
    ///
    /// Each tick asks the refresh schedule first, so a tick right after
    /// `open` or a mutation-driven refresh does not fetch again.
    /// Cancelling or dropping the returned [`Poller`] closes the session.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_polling(self: &Arc<Self>) -> Poller
    where
        B: 'static,
    {
        let fetch_session = Arc::clone(self);
        let cleanup_session = Arc::clone(self);
        Poller::start(
            self.config.refresh_interval,
            move || {
                let session = Arc::clone(&fetch_session);
                async move { session.poll_due().await.map(|_| ()) }
            },
            move || cleanup_session.close(),
        )
    }

    /// Current positioned graph, if a pipeline has loaded.
    #[must_use]
    pub fn layout_result(&self) -> Option<LayoutResult> {
        self.state().layout.clone()
    }

    /// View-model of the block being edited.
    #[must_use]
    pub fn selected_block(&self) -> Option<SelectedBlock> {
        self.state().reconciler.selected_block().cloned()
    }

    /// Current selection state.
    #[must_use]
    pub fn selection(&self) -> Selection {
        self.state().reconciler.selection().clone()
    }

    /// Cached live job map.
    #[must_use]
    pub fn jobs(&self) -> JobMap {
        self.state().jobs.clone()
    }

    /// A node in the current layout was clicked.
    pub fn on_node_click(&self, node_id: &str) -> SelectionChange {
        let mut state = self.state();
        let Some(node) = state
            .layout
            .as_ref()
            .and_then(|layout| layout.node(node_id))
            .map(|positioned| positioned.node.clone())
        else {
            debug!(node_id, "click on unknown node ignored");
            return SelectionChange::Unchanged;
        };
        let state = &mut *state;
        let change = state.reconciler.select_node(&node, &state.jobs, &self.catalog);
        if change != SelectionChange::Unchanged {
            state.rebuild(&self.config);
        }
        change
    }

    /// The empty canvas was clicked.
    pub fn on_pane_click(&self) -> SelectionChange {
        let mut state = self.state();
        let change = state.reconciler.clear_selection();
        if change != SelectionChange::Unchanged {
            state.rebuild(&self.config);
        }
        change
    }

    /// The user asked to add a block under `parent_id`.
    pub fn on_add_requested(&self, parent_id: &str, template: &BlockTemplate) -> SelectionChange {
        let mut state = self.state();
        let state = &mut *state;
        let change =
            state
                .reconciler
                .add_block(state.tree.as_ref(), parent_id, template, &state.jobs);
        if change != SelectionChange::Unchanged {
            state.rebuild(&self.config);
        }
        change
    }

    /// A pushed status update for one job arrived.
    pub fn on_job_status(&self, job_id: &str, status: StatusCode) -> SelectionChange {
        let mut state = self.state();
        let state = &mut *state;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return SelectionChange::Unchanged;
        };
        if job.status == Some(status) {
            return SelectionChange::Unchanged;
        }
        job.status = Some(status);
        let change = state.reconciler.live_status_changed(job_id, status, &state.jobs);
        state.rebuild(&self.config);
        change
    }

    /// Delete the selected block and everything below it.
    ///
    /// An unsaved block is just discarded. A persisted one is deleted on
    /// the backend, removed from the cached tree right away, and the
    /// pipeline is refreshed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NothingSelected`] with no selection, or the
    /// backend error if the delete failed (the cache is left untouched).
    pub async fn on_delete_requested(&self) -> Result<(), SessionError> {
        let (block, generation) = self.selected_for_action()?;
        if block.is_new() {
            self.on_pane_click();
            return Ok(());
        }

        self.backend.delete_job(&block.id).await?;
        info!(job_id = %block.id, "job deleted");

        {
            let mut state = self.state();
            let state = &mut *state;
            if let Some(tree) = state.tree.as_mut() {
                match remove_subtree(tree, &block.id, self.config.flatten.max_depth) {
                    Ok(Some(removed)) => {
                        let mut stack = vec![&removed];
                        while let Some(node) = stack.pop() {
                            if let Some(id) = node.id() {
                                state.jobs.remove(id);
                            }
                            stack.extend(node.children.iter());
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "cached tree is malformed; skipping local delete"),
                }
            }
            if state.reconciler.generation() == generation {
                state.reconciler.clear_selection();
            }
            state.rebuild(&self.config);
        }

        self.refresh_after_mutation().await;
        Ok(())
    }

    /// Re-queue the selected job and start the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NothingSelected`] or
    /// [`SessionError::NotPersisted`] if there is no saved job selected,
    /// [`SessionError::NotOpen`] without a pipeline, or the backend error.
    pub async fn on_restart_requested(&self) -> Result<(), SessionError> {
        let (block, _) = self.selected_for_action()?;
        if !matches!(self.selection(), Selection::Materialized(_)) {
            return Err(SessionError::NotPersisted { id: block.id });
        }
        let key = self.pipeline().ok_or(SessionError::NotOpen)?;

        self.backend
            .update_job(&JobPayload::restart(&block.id))
            .await?;
        self.backend.start_pipeline(&key.pipeline_id).await?;
        info!(job_id = %block.id, pipeline_id = %key.pipeline_id, "job restarted");

        self.refresh_after_mutation().await;
        Ok(())
    }

    /// Save the settings form for the selected block.
    ///
    /// Creates the job for an unsaved block, otherwise replaces the job's
    /// parameters. The selection is cleared (unless the user has selected
    /// something else meanwhile) and the pipeline refreshed.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NothingSelected`], [`SessionError::NotOpen`],
    /// or the backend error (the selection is kept so the form can retry).
    pub async fn submit(&self, params: serde_json::Value) -> Result<SubmitOutcome, SessionError> {
        let (block, generation) = self.selected_for_action()?;
        let key = self.pipeline().ok_or(SessionError::NotOpen)?;

        let outcome = match JobPayload::create(&key.pipeline_id, &block, params.clone()) {
            Some(payload) => {
                let created = self.backend.create_job(&payload).await?;
                info!(job_id = %created.id, parent_id = ?payload.parent_id, "job created");
                SubmitOutcome::Created(created)
            }
            None => {
                let payload =
                    JobPayload::update(&block, params).ok_or(SessionError::NotPersisted {
                        id: block.id.clone(),
                    })?;
                self.backend.update_job(&payload).await?;
                info!(job_id = %block.id, "job parameters updated");
                SubmitOutcome::Updated { id: block.id }
            }
        };

        {
            let mut state = self.state();
            if state.reconciler.generation() == generation {
                state.reconciler.clear_selection();
                state.rebuild(&self.config);
            }
        }

        self.refresh_after_mutation().await;
        Ok(outcome)
    }

    fn selected_for_action(&self) -> Result<(SelectedBlock, u64), SessionError> {
        let state = self.state();
        let block = state
            .reconciler
            .selected_block()
            .cloned()
            .ok_or(SessionError::NothingSelected)?;
        Ok((block, state.reconciler.generation()))
    }

    /// Refresh after a mutation, superseding any fetch already in flight:
    /// its snapshot predates the mutation.
    async fn refresh_after_mutation(&self) {
        let ticket = self.state().coordinator.supersede(now());
        let Some(ticket) = ticket else {
            return;
        };
        if let Err(err) = self.fetch_and_apply(ticket).await {
            warn!(error = %err, "refresh after mutation failed");
        }
    }
}
