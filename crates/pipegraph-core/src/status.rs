//! Status aggregation: labels, colors, job-level progress, and grouping.
//!
//! Per-task status codes roll up into a job-level progress fraction and
//! into display buckets. Nothing here drives control flow; these are the
//! values the renderer uses for node borders, status dots, and grouped
//! job lists.

use serde::{Deserialize, Serialize};

use crate::types::{JobRecord, StatusCode, Task};

/// Classified status, derived from an optional raw code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// No status reported yet (unsaved or unknown node).
    New,
    Pending,
    Failed,
    WaitingForStart,
    Error,
    Started,
    Done,
    /// Any code outside the named set.
    InProgress(i64),
}

impl Status {
    /// Classify a raw status code.
    #[must_use]
    pub const fn classify(code: Option<StatusCode>) -> Self {
        match code {
            None => Self::New,
            Some(StatusCode(-4)) => Self::Pending,
            Some(StatusCode(-3)) => Self::Failed,
            Some(StatusCode(-2)) => Self::WaitingForStart,
            Some(StatusCode(-1)) => Self::Error,
            Some(StatusCode(0)) => Self::Started,
            Some(StatusCode(100)) => Self::Done,
            Some(StatusCode(other)) => Self::InProgress(other),
        }
    }

    /// Returns `true` for statuses that will not change without user action.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Error)
    }

    /// Human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Pending => "Pending",
            Self::Failed => "Failed",
            Self::WaitingForStart => "Waiting for start",
            Self::Error => "Error",
            Self::Started => "Started",
            Self::Done => "Done",
            Self::InProgress(_) => "In progress",
        }
    }

    /// Palette entry used for node borders and status dots.
    #[must_use]
    pub const fn color(self) -> &'static str {
        match self {
            Self::New => palette::NEW,
            Self::Pending => palette::PENDING,
            Self::Failed | Self::Error => palette::ERROR,
            Self::WaitingForStart => palette::WAITING,
            Self::Started => palette::STARTED,
            Self::Done => palette::DONE,
            Self::InProgress(_) => palette::IN_PROGRESS,
        }
    }
}

/// Fixed status palette.
pub mod palette {
    pub const NEW: &str = "#9e9e9e";
    pub const PENDING: &str = "#ffc107";
    pub const WAITING: &str = "#ff9800";
    pub const ERROR: &str = "#f44336";
    pub const STARTED: &str = "#2196f3";
    pub const IN_PROGRESS: &str = "#03a9f4";
    pub const DONE: &str = "#4caf50";
}

/// Label for a discrete status code.
#[must_use]
pub const fn status_label(code: Option<StatusCode>) -> &'static str {
    Status::classify(code).label()
}

/// Color for a status code; `None` maps to the "new" color.
#[must_use]
pub const fn status_color(code: Option<StatusCode>) -> &'static str {
    Status::classify(code).color()
}

/// Job-level progress as a fraction of [`StatusCode::DONE`].
///
/// The mean of all task status codes divided by 100, so one finished task
/// gives `1.0` and a started plus a finished task give `0.5`. Returns
/// `None` when there are no tasks.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate_job_status(tasks: &[Task]) -> Option<f64> {
    if tasks.is_empty() {
        return None;
    }
    let sum: f64 = tasks.iter().map(|t| t.status.get() as f64).sum();
    let done = StatusCode::DONE.get() as f64;
    Some(sum / tasks.len() as f64 / done)
}

/// Progress text for a job: the status label once terminal, otherwise a
/// rounded percentage of [`aggregate_job_status`].
#[must_use]
pub fn progress_label(job_status: Option<StatusCode>, tasks: &[Task]) -> String {
    let status = Status::classify(job_status);
    if status.is_terminal() {
        return status.label().to_owned();
    }
    aggregate_job_status(tasks).map_or_else(
        || status.label().to_owned(),
        |avg| format!("{:.0}%", (avg * 100.0).round()),
    )
}

/// Sort tasks by ascending numeric id.
///
/// Ids that do not parse as integers sort after numeric ones, in string
/// order.
pub fn sort_tasks_by_id(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        match (a.id.parse::<i64>(), b.id.parse::<i64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => a.id.cmp(&b.id),
        }
    });
}

/// An error reported by one task, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub task_id: String,
    pub omero_id: Option<i64>,
    pub message: String,
}

/// Collect the task errors in task order, skipping blank messages.
#[must_use]
pub fn task_errors(tasks: &[Task]) -> Vec<TaskError> {
    tasks
        .iter()
        .filter_map(|t| {
            let message = t.error.as_deref()?;
            if message.trim().is_empty() {
                return None;
            }
            Some(TaskError {
                task_id: t.id.clone(),
                omero_id: t.omero_id,
                message: message.to_owned(),
            })
        })
        .collect()
}

/// Jobs sharing one raw status code.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusBucket<'a> {
    pub status: Option<StatusCode>,
    pub jobs: Vec<&'a JobRecord>,
}

/// Group jobs by raw status code, keeping first-seen order of the keys and
/// input order within each bucket.
#[must_use]
pub fn bucket_by_status<'a>(jobs: impl IntoIterator<Item = &'a JobRecord>) -> Vec<StatusBucket<'a>> {
    let mut buckets: Vec<StatusBucket<'a>> = Vec::new();
    for job in jobs {
        match buckets.iter_mut().find(|b| b.status == job.status) {
            Some(bucket) => bucket.jobs.push(job),
            None => buckets.push(StatusBucket {
                status: job.status,
                jobs: vec![job],
            }),
        }
    }
    buckets
}
