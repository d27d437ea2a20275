//! Boot reconciliation: repairs what a crash or hard stop left behind.
//!
//! Must run once before the dispatcher starts. Whatever was in flight is
//! assumed dead: running items are failed as `interrupted` and active jobs go
//! back to `queued` so the dispatcher resumes their pending items. This is a
//! repair step and deliberately writes statuses without the transition table
//! (`running` → `queued` is not a legal client transition).

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::db::item_repo;
use crate::db::job_repo;
use crate::db::now_millis;
use crate::domain::{FailedReason, ItemStatus, JobId, JobStatus};
use crate::store::{JobStore, StoreError};

/// Detail written on items that were running when the process stopped.
pub const INTERRUPTED_ITEM_DETAIL: &str = "interrupted by restart";

/// `last_error` written on jobs that were re-queued.
pub const REQUEUED_JOB_ERROR: &str = "interrupted, re-queued";

/// Job statuses that only exist while a worker owns the job.
const IN_FLIGHT: &[JobStatus] = &[JobStatus::Running, JobStatus::Pausing, JobStatus::Canceling];

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Jobs moved back to `queued`.
    pub requeued_jobs: Vec<JobId>,
    /// Items failed as `interrupted`.
    pub interrupted_items: usize,
    /// Jobs whose counters were recomputed from their items.
    pub recounted_jobs: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.requeued_jobs.is_empty() && self.interrupted_items == 0
    }
}

/// Runs the repair in one transaction.
pub fn reconcile_on_boot(store: &JobStore) -> Result<ReconcileReport, StoreError> {
    let report = store
        .database()
        .with_tx(|tx| -> Result<ReconcileReport, StoreError> {
            let now = now_millis();

            let requeued_jobs = job_repo::ids_with_status(tx, IN_FLIGHT)?;
            for job_id in &requeued_jobs {
                job_repo::force_status(tx, *job_id, JobStatus::Queued)?;
                job_repo::set_last_error(tx, *job_id, Some(REQUEUED_JOB_ERROR))?;
            }

            let mut affected: BTreeSet<JobId> = requeued_jobs.iter().copied().collect();
            affected.extend(item_repo::job_ids_with_status(tx, ItemStatus::Running)?);
            let interrupted_items = item_repo::fail_all_running(
                tx,
                FailedReason::Interrupted,
                INTERRUPTED_ITEM_DETAIL,
                now,
            )?;

            for job_id in &affected {
                let counts = item_repo::count_for_job(tx, *job_id)?;
                job_repo::store_counts(tx, *job_id, &counts)?;
            }

            Ok(ReconcileReport {
                requeued_jobs,
                interrupted_items,
                recounted_jobs: affected.len(),
            })
        })?;

    if report.is_noop() {
        info!("Boot reconciliation: nothing to repair");
    } else {
        warn!(
            "Boot reconciliation: re-queued {} job(s) {:?}, failed {} interrupted item(s)",
            report.requeued_jobs.len(),
            report.requeued_jobs,
            report.interrupted_items
        );
    }
    Ok(report)
}
