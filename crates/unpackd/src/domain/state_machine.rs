//! Transition tables for jobs and items, plus progress math.
//!
//! Everything here is pure. Store operations call the `assert_*` functions
//! before every write so an illegal transition surfaces as an error rather
//! than silently corrupting a row.

use serde::Serialize;

use super::status::{ItemStatus, JobStatus};

/// An attempted transition that is not in the table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid {kind} transition: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

/// Allowed targets for a job in `from`.
pub fn job_targets(from: JobStatus) -> &'static [JobStatus] {
    use JobStatus::*;
    match from {
        Draft => &[Queued],
        Queued => &[Running, Canceling],
        Running => &[Pausing, Canceling, Completed, Failed],
        Pausing => &[Paused],
        Paused => &[Queued, Canceling],
        Canceling => &[Canceled],
        Canceled | Completed | Failed => &[],
    }
}

/// Allowed targets for an item in `from`.
pub fn item_targets(from: ItemStatus) -> &'static [ItemStatus] {
    use ItemStatus::*;
    match from {
        Pending => &[Running, Canceled],
        Running => &[Success, Failed, Skipped, Canceled],
        // Only reachable through an explicit retry.
        Failed => &[Pending],
        Success | Skipped | Canceled => &[],
    }
}

pub fn assert_job_transition(from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
    if job_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition {
            kind: "job",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub fn assert_item_transition(from: ItemStatus, to: ItemStatus) -> Result<(), TransitionError> {
    if item_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition {
            kind: "item",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Aggregate item counters of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub canceled: u64,
}

impl JobCounts {
    /// Items with a recorded outcome.
    pub fn done(&self) -> u64 {
        self.success + self.failed + self.skipped + self.canceled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub done: u64,
    pub ratio: f64,
}

pub fn compute_progress(counts: &JobCounts) -> Progress {
    let done = counts.done();
    let ratio = if counts.total > 0 {
        done as f64 / counts.total as f64
    } else {
        0.0
    };
    Progress { done, ratio }
}

/// The status a drained job settles in, derived only from item counts.
///
/// Returns `None` when some items have no outcome yet; sequential dispatch
/// never finalizes such a job, so callers log it and leave the job running.
pub fn derive_final_status(counts: &JobCounts) -> Option<JobStatus> {
    if counts.canceled == counts.total {
        Some(JobStatus::Canceled)
    } else if counts.failed > 0 {
        Some(JobStatus::Failed)
    } else if counts.done() == counts.total {
        Some(JobStatus::Completed)
    } else {
        None
    }
}
