//! Item repository: row-level operations on the `job_items` table.

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::error::{CorruptRow, DatabaseError};
use super::from_millis;
use crate::domain::{
    FailedReason, ItemId, ItemOutcome, ItemStatus, JobCounts, JobId, JobItem, NewItem,
};

const TABLE: &str = "job_items";

/// A raw item row from the database.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: i64,
    pub job_id: i64,
    pub archive_path: String,
    pub archive_group_json: Option<String>,
    pub ext: String,
    pub out_dir: Option<String>,
    pub status: String,
    pub attempt: i64,
    pub failed_reason: Option<String>,
    pub failed_detail: Option<String>,
    pub password_index: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            archive_path: row.get("archive_path")?,
            archive_group_json: row.get("archive_group_json")?,
            ext: row.get("ext")?,
            out_dir: row.get("out_dir")?,
            status: row.get("status")?,
            attempt: row.get("attempt")?,
            failed_reason: row.get("failed_reason")?,
            failed_detail: row.get("failed_detail")?,
            password_index: row.get("password_index")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
        })
    }

    pub fn status(&self) -> Result<ItemStatus, CorruptRow> {
        self.status
            .parse()
            .map_err(|e| CorruptRow::new(TABLE, self.id, e))
    }

    /// Converts the raw row into the domain model.
    pub fn into_item(self) -> Result<JobItem, CorruptRow> {
        let id = self.id;
        let status = self.status()?;
        let failed_reason = self
            .failed_reason
            .as_deref()
            .map(str::parse::<FailedReason>)
            .transpose()
            .map_err(|e| CorruptRow::new(TABLE, id, e))?;
        let archive_group = self
            .archive_group_json
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .map_err(|e| CorruptRow::new(TABLE, id, format!("archive_group_json: {}", e)))?;
        let attempt = u32::try_from(self.attempt)
            .map_err(|_| CorruptRow::new(TABLE, id, "attempt out of range"))?;
        let password_index = self
            .password_index
            .map(usize::try_from)
            .transpose()
            .map_err(|_| CorruptRow::new(TABLE, id, "negative password_index"))?;

        Ok(JobItem {
            id,
            job_id: self.job_id,
            archive_path: PathBuf::from(self.archive_path),
            archive_group,
            ext: self.ext,
            out_dir: self.out_dir.map(PathBuf::from),
            status,
            attempt,
            failed_reason,
            failed_detail: self.failed_detail,
            password_index,
            created_at: from_millis(self.created_at),
            started_at: self.started_at.map(from_millis),
            ended_at: self.ended_at.map(from_millis),
        })
    }
}

/// Inserts a `pending` item (attempt 0) and returns its id.
pub fn insert(
    conn: &Connection,
    job_id: JobId,
    item: &NewItem,
    created_at: i64,
) -> Result<ItemId, DatabaseError> {
    let group_json = item
        .archive_group
        .as_ref()
        .map(|g| g.to_string());
    conn.execute(
        "INSERT INTO job_items (job_id, archive_path, archive_group_json, ext, out_dir,
         status, attempt, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        params![
            job_id,
            item.archive_path.to_string_lossy(),
            group_json,
            item.ext,
            item.out_dir.as_ref().map(|p| p.to_string_lossy().into_owned()),
            ItemStatus::Pending.as_str(),
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_by_id(conn: &Connection, id: ItemId) -> Result<Option<ItemRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM job_items WHERE id = ?1",
            params![id],
            ItemRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Every item of a job in insertion order.
pub fn list_for_job(conn: &Connection, job_id: JobId) -> Result<Vec<ItemRow>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM job_items WHERE job_id = ?1 ORDER BY id ASC")?;
    let rows = stmt
        .query_map(params![job_id], ItemRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Items of a job in `status`, in insertion order.
pub fn list_with_status(
    conn: &Connection,
    job_id: JobId,
    status: ItemStatus,
) -> Result<Vec<ItemRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM job_items WHERE job_id = ?1 AND status = ?2 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![job_id, status.as_str()], ItemRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Distinct owning jobs of every item in `status`, across all jobs.
pub fn job_ids_with_status(
    conn: &Connection,
    status: ItemStatus,
) -> Result<Vec<JobId>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT job_id FROM job_items WHERE status = ?1 ORDER BY job_id ASC",
    )?;
    let ids = stmt
        .query_map(params![status.as_str()], |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Moves one item to `running` and stamps `started_at`.
pub fn mark_running(conn: &Connection, id: ItemId, now: i64) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE job_items SET status = ?2, started_at = ?3 WHERE id = ?1",
        params![id, ItemStatus::Running.as_str(), now],
    )?;
    Ok(())
}

/// Writes the outcome of a finished item. `out_dir` and `password_index`
/// are only overwritten when the outcome carries them.
pub fn record_outcome(
    conn: &Connection,
    id: ItemId,
    outcome: &ItemOutcome,
    now: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE job_items SET status = ?2, failed_reason = ?3, failed_detail = ?4, ended_at = ?5,
         out_dir = COALESCE(?6, out_dir), password_index = COALESCE(?7, password_index)
         WHERE id = ?1",
        params![
            id,
            outcome.status.as_str(),
            outcome.reason.map(|r| r.as_str()),
            outcome.detail,
            now,
            outcome
                .out_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            outcome.password_index.map(|i| i as i64),
        ],
    )?;
    Ok(())
}

/// Bulk-moves every `from` item of a job to `to`, stamping `ended_at`.
/// Returns the number of rows moved.
pub fn move_all(
    conn: &Connection,
    job_id: JobId,
    from: ItemStatus,
    to: ItemStatus,
    reason: Option<FailedReason>,
    detail: Option<&str>,
    now: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_items SET status = ?3, failed_reason = ?4, failed_detail = ?5, ended_at = ?6
         WHERE job_id = ?1 AND status = ?2",
        params![
            job_id,
            from.as_str(),
            to.as_str(),
            reason.map(|r| r.as_str()),
            detail,
            now,
        ],
    )?;
    Ok(changed)
}

/// Stamps `started_at` on every pending item of a job, as part of driving
/// them through `running` in bulk.
pub fn start_all_pending(
    conn: &Connection,
    job_id: JobId,
    now: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_items SET status = ?2, started_at = ?3 WHERE job_id = ?1 AND status = ?4",
        params![
            job_id,
            ItemStatus::Running.as_str(),
            now,
            ItemStatus::Pending.as_str(),
        ],
    )?;
    Ok(changed)
}

/// Fails every running item in the database regardless of job.
pub fn fail_all_running(
    conn: &Connection,
    reason: FailedReason,
    detail: &str,
    now: i64,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE job_items SET status = ?1, failed_reason = ?2, failed_detail = ?3, ended_at = ?4
         WHERE status = ?5",
        params![
            ItemStatus::Failed.as_str(),
            reason.as_str(),
            detail,
            now,
            ItemStatus::Running.as_str(),
        ],
    )?;
    Ok(changed)
}

/// Puts a failed item back in the queue for another attempt.
pub fn reset_for_retry(conn: &Connection, id: ItemId) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE job_items SET status = ?2, attempt = attempt + 1, failed_reason = NULL,
         failed_detail = NULL, started_at = NULL, ended_at = NULL
         WHERE id = ?1",
        params![id, ItemStatus::Pending.as_str()],
    )?;
    Ok(())
}

/// Recomputes a job's counters from its items.
pub fn count_for_job(conn: &Connection, job_id: JobId) -> Result<JobCounts, DatabaseError> {
    let mut counts = JobCounts::default();
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM job_items WHERE job_id = ?1 GROUP BY status")?;
    let rows = stmt
        .query_map(params![job_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (status, n) in rows {
        let n = n.max(0) as u64;
        counts.total += n;
        match status.parse::<ItemStatus>() {
            Ok(ItemStatus::Success) => counts.success += n,
            Ok(ItemStatus::Failed) => counts.failed += n,
            Ok(ItemStatus::Skipped) => counts.skipped += n,
            Ok(ItemStatus::Canceled) => counts.canceled += n,
            Ok(ItemStatus::Pending) | Ok(ItemStatus::Running) => {}
            Err(e) => log::warn!("Job {}: ignoring item status in recount: {}", job_id, e),
        }
    }
    Ok(counts)
}
