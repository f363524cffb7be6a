//! pipegraph-io: Backend boundary and async drivers.
//!
//! Wires the sans-IO engine in `pipegraph-core` to a job service:
//!
//! - [`JobsBackend`]: the injected data-fetching capability;
//! - [`Poller`] / [`KeyedPoller`]: tokio timer driving periodic refreshes;
//! - [`PipelineSession`]: cached pipeline state plus the event contract
//!   the rendering layer calls (`on_node_click`, `on_add_requested`, ...).

pub mod backend;
pub mod poller;
pub mod session;

pub use backend::{BackendError, JobsBackend};
pub use poller::{KeyedPoller, Poller};
pub use session::{PipelineKey, PipelineSession, SessionError, Snapshot, SubmitOutcome};
