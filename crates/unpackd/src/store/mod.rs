//! Transactional job/item persistence.
//!
//! Every mutating operation runs in one `BEGIN IMMEDIATE` transaction via
//! [`Database::with_tx`] and checks the state machine before writing.
//! Conditional updates (`WHERE status = ?`) make concurrent claims from
//! several handles or processes resolve to exactly one winner.

mod error;
mod settings;

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::item_repo::{self, ItemRow};
use crate::db::job_repo::{self, JobRow, NewJobRow};
use crate::db::{self, now_millis, Database, RetryPolicy};
use crate::domain::options::DraftError;
use crate::domain::{
    assert_item_transition, assert_job_transition, derive_final_status, FailedReason, ItemId,
    ItemOutcome, ItemStatus, Job, JobCounts, JobId, JobItem, JobOptions, JobStatus, NewItem,
    NewJob, PasswordStrategy, TransitionError,
};

pub use error::StoreError;

/// Detail written on items that were still unfinished when their job ended.
pub const FORCED_FAILURE_DETAIL: &str =
    "Job ended but item was not finalized; force failed for consistency.";

/// Result of [`JobStore::finalize_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub counts: JobCounts,
    /// Items force-failed as `interrupted` during finalization.
    pub forced: usize,
}

/// Durable store of jobs, items and settings.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    log_dir: PathBuf,
}

impl JobStore {
    pub fn new(db: Database, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            log_dir: log_dir.into(),
        }
    }

    /// Opens the store inside a var directory: database under `data/`,
    /// job logs under `logs/`.
    pub fn open(var_dir: &Path, retry: RetryPolicy) -> Result<Self, StoreError> {
        let log_dir = var_dir.join("logs");
        std::fs::create_dir_all(&log_dir).map_err(|e| StoreError::Io {
            path: log_dir.clone(),
            source: e,
        })?;
        let db = Database::open(&db::database_path(var_dir))?.with_retry_policy(retry);
        Ok(Self::new(db, log_dir))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Log file of a job: `<log_dir>/job-<id>.log`.
    pub fn log_path_for(&self, job_id: JobId) -> PathBuf {
        self.log_dir.join(format!("job-{}.log", job_id))
    }

    // ---------------------------------------------------------------------
    // Creation and client-driven transitions
    // ---------------------------------------------------------------------

    /// Persists a new `draft` job with one `pending` item per archive.
    pub fn create_job(&self, new_job: &NewJob) -> Result<JobId, StoreError> {
        let options = new_job.options.clone().resolve().map_err(|e| match e {
            DraftError::Missing(fields) => StoreError::MissingOptions(fields),
            DraftError::Invalid(msg) => StoreError::Validation(msg),
        })?;
        if new_job.concurrency == 0 {
            return Err(StoreError::Validation(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let root_path = new_job.root_path.to_string_lossy();
        let id = self.db.with_tx(|tx| {
            insert_job(
                tx,
                &self.log_dir,
                &NewJobRow {
                    root_path: &root_path,
                    options: &options,
                    concurrency: new_job.concurrency,
                    total: new_job.items.len() as u64,
                    retry_from_job_id: new_job.retry_from_job_id,
                    created_at: now_millis(),
                },
                &new_job.items,
            )
        })?;

        info!(
            "Created job {} with {} item(s) under {}",
            id,
            new_job.items.len(),
            root_path
        );
        Ok(id)
    }

    /// `draft`/`paused` → `queued`. Any other status is left untouched.
    pub fn enqueue_job(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        self.request(job_id, &[JobStatus::Draft, JobStatus::Paused], JobStatus::Queued)
    }

    /// `running` → `pausing`; observed by the dispatcher between items.
    pub fn request_pause(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        self.request(job_id, &[JobStatus::Running], JobStatus::Pausing)
    }

    /// `queued`/`running`/`paused` → `canceling`.
    pub fn request_cancel(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        self.request(
            job_id,
            &[JobStatus::Queued, JobStatus::Running, JobStatus::Paused],
            JobStatus::Canceling,
        )
    }

    /// Moves the job to `to` when it is in one of `from`; otherwise a no-op.
    /// Returns the status the job is in afterwards.
    fn request(
        &self,
        job_id: JobId,
        from: &[JobStatus],
        to: JobStatus,
    ) -> Result<JobStatus, StoreError> {
        self.db.with_tx(|tx| {
            let current = load_job(tx, job_id)?.status()?;
            if !from.contains(&current) {
                debug!("Job {}: {} request ignored while {}", job_id, to, current);
                return Ok(current);
            }
            transition_job(tx, job_id, current, to)?;
            info!("Job {}: {} -> {}", job_id, current, to);
            Ok(to)
        })
    }

    // ---------------------------------------------------------------------
    // Dispatcher primitives
    // ---------------------------------------------------------------------

    /// Claims the oldest queued job for this worker, moving it to `running`.
    ///
    /// Returns `None` when nothing is queued or another claimer won the row.
    pub fn claim_next_queued(&self) -> Result<Option<Job>, StoreError> {
        let claimed = self.db.with_tx(|tx| -> Result<Option<JobRow>, StoreError> {
            let Some(row) = job_repo::oldest_with_status(tx, JobStatus::Queued)? else {
                return Ok(None);
            };
            assert_job_transition(JobStatus::Queued, JobStatus::Running)?;
            if !job_repo::compare_and_set_status(tx, row.id, JobStatus::Queued, JobStatus::Running)?
            {
                return Ok(None);
            }
            job_repo::mark_started(tx, row.id, now_millis())?;
            Ok(Some(load_job(tx, row.id)?))
        })?;

        match claimed {
            Some(row) => {
                let job = row.into_job()?;
                info!("Claimed job {} ({} item(s))", job.id, job.counts.total);
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// `pending` → `running` for one item.
    pub fn start_item(&self, item_id: ItemId) -> Result<JobItem, StoreError> {
        let row = self.db.with_tx(|tx| {
            let row = load_item(tx, item_id)?;
            assert_item_transition(row.status()?, ItemStatus::Running)?;
            item_repo::mark_running(tx, item_id, now_millis())?;
            load_item(tx, item_id)
        })?;
        Ok(row.into_item()?)
    }

    /// Records the outcome of a running item and bumps the matching job counter.
    pub fn finalize_item(
        &self,
        job_id: JobId,
        item_id: ItemId,
        outcome: &ItemOutcome,
    ) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let row = load_item(tx, item_id)?;
            if row.job_id != job_id {
                return Err(StoreError::Validation(format!(
                    "item {} does not belong to job {}",
                    item_id, job_id
                )));
            }
            let status = row.status()?;
            if status != ItemStatus::Running {
                return Err(StoreError::NotRunning { item_id, status });
            }
            assert_item_transition(status, outcome.status)?;

            item_repo::record_outcome(tx, item_id, outcome, now_millis())?;
            if let Some(column) = outcome.status.counter_column() {
                job_repo::add_to_counter(tx, job_id, column, 1)?;
            }
            Ok(())
        })?;

        debug!("Job {}: item {} -> {}", job_id, item_id, outcome.status);
        Ok(())
    }

    /// Cancels every pending item of a job. Returns how many were canceled.
    pub fn cancel_remaining_items(&self, job_id: JobId) -> Result<usize, StoreError> {
        let n = self.db.with_tx(|tx| {
            load_job(tx, job_id)?;
            cancel_pending(tx, job_id)
        })?;
        if n > 0 {
            info!("Job {}: canceled {} remaining item(s)", job_id, n);
        }
        Ok(n)
    }

    /// Fails every pending and running item of a job with `reason`.
    ///
    /// Pending items pass through `running` so every recorded transition is
    /// legal. Returns how many items were failed.
    pub fn fail_unfinished_items(
        &self,
        job_id: JobId,
        reason: FailedReason,
        detail: &str,
    ) -> Result<usize, StoreError> {
        let n = self.db.with_tx(|tx| {
            load_job(tx, job_id)?;
            fail_unfinished(tx, job_id, reason, detail)
        })?;
        if n > 0 {
            warn!("Job {}: failed {} unfinished item(s) as {}", job_id, n, reason);
        }
        Ok(n)
    }

    /// Settles a job whose item loop has ended.
    ///
    /// Stray pending/running items are force-failed as `interrupted`,
    /// counters are recomputed from items, and the status is derived:
    /// a `running` job takes the derived final status, a `canceling` job
    /// finishes canceling, a `canceled` job keeps its status, and a late
    /// `pausing` marker converges to `paused` without touching items.
    pub fn finalize_job(&self, job_id: JobId) -> Result<FinalizeReport, StoreError> {
        let report = self.db.with_tx(|tx| finalize_in_tx(tx, job_id))?;
        info!(
            "Job {} finalized: status={}, total={}, success={}, failed={}, skipped={}, canceled={}",
            job_id,
            report.status,
            report.counts.total,
            report.counts.success,
            report.counts.failed,
            report.counts.skipped,
            report.counts.canceled
        );
        Ok(report)
    }

    /// `pausing` → `paused`. A no-op for any other status.
    pub fn pause_job(&self, job_id: JobId) -> Result<JobStatus, StoreError> {
        self.db.with_tx(|tx| {
            let current = load_job(tx, job_id)?.status()?;
            if current != JobStatus::Pausing {
                return Ok(current);
            }
            transition_job(tx, job_id, JobStatus::Pausing, JobStatus::Paused)?;
            info!("Job {} paused", job_id);
            Ok(JobStatus::Paused)
        })
    }

    /// Completes a cancel request: pending items are canceled and the job
    /// moves `canceling` → `canceled`. Returns how many items were canceled.
    pub fn complete_cancel(&self, job_id: JobId) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| {
            let current = load_job(tx, job_id)?.status()?;
            if current != JobStatus::Canceling {
                return Ok(0);
            }
            let n = cancel_pending(tx, job_id)?;
            transition_job(tx, job_id, JobStatus::Canceling, JobStatus::Canceled)?;
            job_repo::mark_ended(tx, job_id, now_millis())?;
            info!("Job {} canceled ({} pending item(s) canceled)", job_id, n);
            Ok(n)
        })
    }

    /// Stores a human-readable error on the job row.
    pub fn record_job_error(&self, job_id: JobId, message: &str) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            load_job(tx, job_id)?;
            job_repo::set_last_error(tx, job_id, Some(message))?;
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Deletes a terminal job and its items. Never touches extracted files.
    pub fn delete_job(&self, job_id: JobId) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let status = load_job(tx, job_id)?.status()?;
            if !status.is_terminal() {
                return Err(StoreError::NotDeletable { job_id, status });
            }
            job_repo::delete(tx, job_id)?;
            Ok(())
        })?;
        info!("Deleted job {}", job_id);
        Ok(())
    }

    /// Creates a new `draft` job re-running every item of a failed job with
    /// another password strategy. The failed job is left untouched.
    pub fn retry_job(
        &self,
        failed_job_id: JobId,
        password: PasswordStrategy,
    ) -> Result<JobId, StoreError> {
        password.validate().map_err(StoreError::Validation)?;
        let id = self.db.with_tx(|tx| {
            let row = load_job(tx, failed_job_id)?;
            let status = row.status()?;
            if status != JobStatus::Failed {
                return Err(StoreError::NotRetriable {
                    entity: "Job",
                    id: failed_job_id,
                    reason: format!("status is {}", status),
                });
            }
            let original = row.into_job()?;
            let root_path = original.root_path.to_string_lossy().into_owned();
            let options = JobOptions {
                password: password.clone(),
                ..original.options.clone()
            };
            let items = item_repo::list_for_job(tx, failed_job_id)?
                .into_iter()
                .map(|r| r.into_item().map(NewItem::from))
                .collect::<Result<Vec<_>, _>>()?;

            let row = NewJobRow {
                root_path: &root_path,
                options: &options,
                concurrency: original.concurrency,
                total: items.len() as u64,
                retry_from_job_id: Some(failed_job_id),
                created_at: now_millis(),
            };
            let id = insert_job(tx, &self.log_dir, &row, &items)?;
            Ok(id)
        })?;

        info!(
            "Created retry job {} from failed job {} (password mode: {})",
            id,
            failed_job_id,
            password.mode()
        );
        Ok(id)
    }

    /// Moves one failed item back to `pending` for another attempt.
    ///
    /// Only allowed while the owning job is not being dispatched and not
    /// finished (`draft`, `queued` or `paused`).
    pub fn retry_item(&self, item_id: ItemId) -> Result<JobItem, StoreError> {
        let row = self.db.with_tx(|tx| {
            let row = load_item(tx, item_id)?;
            let status = row.status()?;
            if status != ItemStatus::Failed {
                return Err(StoreError::NotRetriable {
                    entity: "Item",
                    id: item_id,
                    reason: format!("status is {}", status),
                });
            }
            let job_status = load_job(tx, row.job_id)?.status()?;
            if !matches!(
                job_status,
                JobStatus::Draft | JobStatus::Queued | JobStatus::Paused
            ) {
                return Err(StoreError::NotRetriable {
                    entity: "Item",
                    id: item_id,
                    reason: format!("job {} is {}", row.job_id, job_status),
                });
            }
            assert_item_transition(status, ItemStatus::Pending)?;
            item_repo::reset_for_retry(tx, item_id)?;
            if let Some(column) = ItemStatus::Failed.counter_column() {
                job_repo::add_to_counter(tx, row.job_id, column, -1)?;
            }
            load_item(tx, item_id)
        })?;
        let item = row.into_item()?;
        info!(
            "Job {}: item {} re-queued (attempt {})",
            item.job_id, item.id, item.attempt
        );
        Ok(item)
    }

    /// Deletes every failed job. Returns how many were removed.
    pub fn clear_failed_jobs(&self) -> Result<usize, StoreError> {
        let n = self.db.with_tx(|tx| {
            Ok::<_, StoreError>(job_repo::delete_with_status(tx, JobStatus::Failed)?)
        })?;
        info!("Cleared {} failed job(s)", n);
        Ok(n)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn get_job(&self, job_id: JobId) -> Result<Job, StoreError> {
        let row = self.db.with_conn(|conn| job_repo::find_by_id(conn, job_id))?;
        match row {
            Some(row) => Ok(row.into_job()?),
            None => Err(StoreError::job_not_found(job_id)),
        }
    }

    /// Most recently created jobs first.
    pub fn list_jobs(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        let rows = self.db.with_conn(|conn| job_repo::list_recent(conn, limit))?;
        Ok(rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_items(&self, job_id: JobId) -> Result<Vec<JobItem>, StoreError> {
        let rows = self.db.with_conn(|conn| item_repo::list_for_job(conn, job_id))?;
        into_items(rows)
    }

    /// Pending items of a job in dispatch order.
    pub fn pending_items(&self, job_id: JobId) -> Result<Vec<JobItem>, StoreError> {
        let rows = self
            .db
            .with_conn(|conn| item_repo::list_with_status(conn, job_id, ItemStatus::Pending))?;
        into_items(rows)
    }

    /// Jobs waiting in `canceling`, oldest first.
    pub fn find_canceling_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        Ok(self
            .db
            .with_conn(|conn| job_repo::ids_with_status(conn, &[JobStatus::Canceling]))?)
    }
}

fn into_items(rows: Vec<ItemRow>) -> Result<Vec<JobItem>, StoreError> {
    Ok(rows
        .into_iter()
        .map(ItemRow::into_item)
        .collect::<Result<Vec<_>, _>>()?)
}

fn load_job(conn: &Connection, job_id: JobId) -> Result<JobRow, StoreError> {
    job_repo::find_by_id(conn, job_id)?.ok_or_else(|| StoreError::job_not_found(job_id))
}

fn load_item(conn: &Connection, item_id: ItemId) -> Result<ItemRow, StoreError> {
    item_repo::find_by_id(conn, item_id)?.ok_or_else(|| StoreError::item_not_found(item_id))
}

fn insert_job(
    conn: &Connection,
    log_dir: &Path,
    row: &NewJobRow<'_>,
    items: &[NewItem],
) -> Result<JobId, StoreError> {
    let id = job_repo::insert(conn, row)?;
    let log_path = log_dir.join(format!("job-{}.log", id));
    job_repo::set_log_path(conn, id, &log_path.to_string_lossy())?;
    for item in items {
        item_repo::insert(conn, id, item, row.created_at)?;
    }
    Ok(id)
}

/// Checked conditional status update.
fn transition_job(
    conn: &Connection,
    job_id: JobId,
    from: JobStatus,
    to: JobStatus,
) -> Result<(), StoreError> {
    assert_job_transition(from, to)?;
    if !job_repo::compare_and_set_status(conn, job_id, from, to)? {
        let current = load_job(conn, job_id)?.status()?;
        return Err(TransitionError::InvalidTransition {
            kind: "job",
            from: current.as_str(),
            to: to.as_str(),
        }
        .into());
    }
    Ok(())
}

fn cancel_pending(conn: &Connection, job_id: JobId) -> Result<usize, StoreError> {
    assert_item_transition(ItemStatus::Pending, ItemStatus::Canceled)?;
    let n = item_repo::move_all(
        conn,
        job_id,
        ItemStatus::Pending,
        ItemStatus::Canceled,
        None,
        None,
        now_millis(),
    )?;
    if let Some(column) = ItemStatus::Canceled.counter_column() {
        job_repo::add_to_counter(conn, job_id, column, n as i64)?;
    }
    Ok(n)
}

fn fail_unfinished(
    conn: &Connection,
    job_id: JobId,
    reason: FailedReason,
    detail: &str,
) -> Result<usize, StoreError> {
    assert_item_transition(ItemStatus::Pending, ItemStatus::Running)?;
    assert_item_transition(ItemStatus::Running, ItemStatus::Failed)?;
    let now = now_millis();
    item_repo::start_all_pending(conn, job_id, now)?;
    let n = item_repo::move_all(
        conn,
        job_id,
        ItemStatus::Running,
        ItemStatus::Failed,
        Some(reason),
        Some(detail),
        now,
    )?;
    if let Some(column) = ItemStatus::Failed.counter_column() {
        job_repo::add_to_counter(conn, job_id, column, n as i64)?;
    }
    Ok(n)
}

fn finalize_in_tx(conn: &Connection, job_id: JobId) -> Result<FinalizeReport, StoreError> {
    let row = load_job(conn, job_id)?;
    let current = row.status()?;
    let unchanged = |status: JobStatus| -> Result<FinalizeReport, StoreError> {
        Ok(FinalizeReport {
            job_id,
            status,
            counts: item_repo::count_for_job(conn, job_id)?,
            forced: 0,
        })
    };

    match current {
        JobStatus::Completed | JobStatus::Failed => return unchanged(current),
        JobStatus::Draft | JobStatus::Queued | JobStatus::Paused => {
            warn!("Job {}: finalize requested while {}, leaving it", job_id, current);
            return unchanged(current);
        }
        JobStatus::Pausing => {
            transition_job(conn, job_id, JobStatus::Pausing, JobStatus::Paused)?;
            info!("Job {}: pause observed at finalize", job_id);
            return unchanged(JobStatus::Paused);
        }
        JobStatus::Canceling => {
            cancel_pending(conn, job_id)?;
        }
        JobStatus::Running | JobStatus::Canceled => {}
    }

    let forced = fail_unfinished(conn, job_id, FailedReason::Interrupted, FORCED_FAILURE_DETAIL)?;
    if forced > 0 {
        warn!(
            "Job {} had {} unconverged item(s), forced to failed",
            job_id, forced
        );
    }

    let counts = item_repo::count_for_job(conn, job_id)?;
    job_repo::store_counts(conn, job_id, &counts)?;

    let status = match current {
        JobStatus::Canceling => {
            transition_job(conn, job_id, JobStatus::Canceling, JobStatus::Canceled)?;
            JobStatus::Canceled
        }
        JobStatus::Running => match derive_final_status(&counts) {
            Some(JobStatus::Canceled) => {
                transition_job(conn, job_id, JobStatus::Running, JobStatus::Canceling)?;
                transition_job(conn, job_id, JobStatus::Canceling, JobStatus::Canceled)?;
                JobStatus::Canceled
            }
            Some(status) => {
                transition_job(conn, job_id, JobStatus::Running, status)?;
                status
            }
            None => {
                warn!(
                    "Job {} not fully done: total={}, done={}",
                    job_id,
                    counts.total,
                    counts.done()
                );
                return Ok(FinalizeReport {
                    job_id,
                    status: JobStatus::Running,
                    counts,
                    forced,
                });
            }
        },
        other => other,
    };

    job_repo::mark_ended(conn, job_id, now_millis())?;
    Ok(FinalizeReport {
        job_id,
        status,
        counts,
        forced,
    })
}
