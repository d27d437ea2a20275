//! Job repository: row-level operations on the `jobs` table.
//!
//! Functions take a `&Connection` so the store can compose several of them
//! inside one transaction (`Transaction` derefs to `Connection`).

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use super::error::{CorruptRow, DatabaseError};
use super::from_millis;
use crate::domain::{Job, JobCounts, JobId, JobOptions, JobStatus};

const TABLE: &str = "jobs";

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: i64,
    pub status: String,
    pub root_path: String,
    pub output_mode: String,
    pub output_dir: Option<String>,
    pub conflict_policy: String,
    pub concurrency: i64,
    pub options_json: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub skipped: i64,
    pub canceled: i64,
    pub last_error: Option<String>,
    pub log_path: Option<String>,
    pub retry_from_job_id: Option<i64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            status: row.get("status")?,
            root_path: row.get("root_path")?,
            output_mode: row.get("output_mode")?,
            output_dir: row.get("output_dir")?,
            conflict_policy: row.get("conflict_policy")?,
            concurrency: row.get("concurrency")?,
            options_json: row.get("options_json")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
            total: row.get("total")?,
            success: row.get("success")?,
            failed: row.get("failed")?,
            skipped: row.get("skipped")?,
            canceled: row.get("canceled")?,
            last_error: row.get("last_error")?,
            log_path: row.get("log_path")?,
            retry_from_job_id: row.get("retry_from_job_id")?,
        })
    }

    /// The status column alone, for callers that only branch on it.
    pub fn status(&self) -> Result<JobStatus, CorruptRow> {
        self.status
            .parse()
            .map_err(|e| CorruptRow::new(TABLE, self.id, e))
    }

    /// Converts the raw row into the domain model.
    pub fn into_job(self) -> Result<Job, CorruptRow> {
        let id = self.id;
        let corrupt = |reason: String| CorruptRow::new(TABLE, id, reason);
        let count = |column: &str, value: i64| {
            u64::try_from(value).map_err(|_| corrupt(format!("negative {} counter", column)))
        };

        let status = self.status()?;
        let options: JobOptions = serde_json::from_str(&self.options_json)
            .map_err(|e| corrupt(format!("options_json: {}", e)))?;
        let concurrency = u32::try_from(self.concurrency)
            .map_err(|_| corrupt(format!("concurrency out of range: {}", self.concurrency)))?;

        Ok(Job {
            id,
            status,
            root_path: PathBuf::from(self.root_path),
            output_mode: parse_wire(&self.output_mode).map_err(|e| corrupt(e.to_string()))?,
            output_dir: self.output_dir.map(PathBuf::from),
            conflict_policy: parse_wire(&self.conflict_policy)
                .map_err(|e| corrupt(e.to_string()))?,
            concurrency,
            options,
            created_at: from_millis(self.created_at),
            started_at: self.started_at.map(from_millis),
            ended_at: self.ended_at.map(from_millis),
            counts: JobCounts {
                total: count("total", self.total)?,
                success: count("success", self.success)?,
                failed: count("failed", self.failed)?,
                skipped: count("skipped", self.skipped)?,
                canceled: count("canceled", self.canceled)?,
            },
            last_error: self.last_error,
            log_path: self.log_path.map(PathBuf::from),
            retry_from_job_id: self.retry_from_job_id,
        })
    }
}

/// Parses a snake_case wire name through the type's serde representation.
pub(crate) fn parse_wire<T: DeserializeOwned>(value: &str) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
}

/// Column values for a freshly created job.
#[derive(Debug)]
pub struct NewJobRow<'a> {
    pub root_path: &'a str,
    pub options: &'a JobOptions,
    pub concurrency: u32,
    pub total: u64,
    pub retry_from_job_id: Option<JobId>,
    pub created_at: i64,
}

/// Inserts a new `draft` job row and returns its id.
pub fn insert(conn: &Connection, job: &NewJobRow<'_>) -> Result<JobId, DatabaseError> {
    let options_json = serde_json::to_string(job.options).map_err(|e| {
        DatabaseError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    })?;
    conn.execute(
        "INSERT INTO jobs (status, root_path, output_mode, output_dir, conflict_policy,
         concurrency, options_json, created_at, total, retry_from_job_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            JobStatus::Draft.as_str(),
            job.root_path,
            job.options.output_mode.as_str(),
            job.options
                .output_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            job.options.conflict_policy.as_str(),
            job.concurrency,
            options_json,
            job.created_at,
            job.total as i64,
            job.retry_from_job_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn set_log_path(conn: &Connection, id: JobId, log_path: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET log_path = ?2 WHERE id = ?1",
        params![id, log_path],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: JobId) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Most recent jobs first.
pub fn list_recent(conn: &Connection, limit: u32) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1")?;
    let rows = stmt
        .query_map(params![limit], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The oldest job in `status`, by creation time then id.
pub fn oldest_with_status(
    conn: &Connection,
    status: JobStatus,
) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC LIMIT 1",
            params![status.as_str()],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Ids of every job currently in one of `statuses`, oldest first.
pub fn ids_with_status(
    conn: &Connection,
    statuses: &[JobStatus],
) -> Result<Vec<JobId>, DatabaseError> {
    let mut ids = Vec::new();
    let mut stmt =
        conn.prepare("SELECT id FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC")?;
    for status in statuses {
        let found = stmt
            .query_map(params![status.as_str()], |r| r.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.extend(found);
    }
    Ok(ids)
}

/// Conditional status update. Returns `true` only when this call moved the
/// row, i.e. the job was still in `from`.
pub fn compare_and_set_status(
    conn: &Connection,
    id: JobId,
    from: JobStatus,
    to: JobStatus,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = ?3 WHERE id = ?1 AND status = ?2",
        params![id, from.as_str(), to.as_str()],
    )?;
    Ok(changed == 1)
}

/// Unconditional status write, for boot repair only.
pub fn force_status(conn: &Connection, id: JobId, status: JobStatus) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET status = ?2 WHERE id = ?1",
        params![id, status.as_str()],
    )?;
    Ok(())
}

/// Sets `started_at` unless the job already has one.
pub fn mark_started(conn: &Connection, id: JobId, now: i64) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET started_at = COALESCE(started_at, ?2) WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

pub fn mark_ended(conn: &Connection, id: JobId, now: i64) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET ended_at = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

/// Adds `delta` to one aggregate counter.
///
/// `column` must come from `ItemStatus::counter_column`; it is never user input.
pub fn add_to_counter(
    conn: &Connection,
    id: JobId,
    column: &'static str,
    delta: i64,
) -> Result<(), DatabaseError> {
    debug_assert!(matches!(
        column,
        "success" | "failed" | "skipped" | "canceled"
    ));
    conn.execute(
        &format!(
            "UPDATE jobs SET {col} = MAX({col} + ?2, 0) WHERE id = ?1",
            col = column
        ),
        params![id, delta],
    )?;
    Ok(())
}

/// Overwrites every aggregate counter.
pub fn store_counts(conn: &Connection, id: JobId, counts: &JobCounts) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET total = ?2, success = ?3, failed = ?4, skipped = ?5, canceled = ?6
         WHERE id = ?1",
        params![
            id,
            counts.total as i64,
            counts.success as i64,
            counts.failed as i64,
            counts.skipped as i64,
            counts.canceled as i64,
        ],
    )?;
    Ok(())
}

pub fn set_last_error(
    conn: &Connection,
    id: JobId,
    message: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET last_error = ?2 WHERE id = ?1",
        params![id, message],
    )?;
    Ok(())
}

/// Deletes a job; its items go with it through the foreign key cascade.
pub fn delete(conn: &Connection, id: JobId) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(changed == 1)
}

pub fn delete_with_status(conn: &Connection, status: JobStatus) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "DELETE FROM jobs WHERE status = ?1",
        params![status.as_str()],
    )?;
    Ok(changed)
}
