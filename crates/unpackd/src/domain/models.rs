use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::options::{ConflictPolicy, JobOptions, JobOptionsDraft, OutputMode, ZipSlipPolicy};
use super::state_machine::JobCounts;
use super::status::{FailedReason, ItemStatus, JobStatus};

pub type JobId = i64;
pub type ItemId = i64;

/// One extraction batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub root_path: PathBuf,
    pub output_mode: OutputMode,
    pub output_dir: Option<PathBuf>,
    pub conflict_policy: ConflictPolicy,
    pub concurrency: u32,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub counts: JobCounts,
    pub last_error: Option<String>,
    pub log_path: Option<PathBuf>,
    pub retry_from_job_id: Option<JobId>,
}

/// One archive within a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobItem {
    pub id: ItemId,
    pub job_id: JobId,
    pub archive_path: PathBuf,
    pub archive_group: Option<serde_json::Value>,
    pub ext: String,
    pub out_dir: Option<PathBuf>,
    pub status: ItemStatus,
    pub attempt: u32,
    pub failed_reason: Option<FailedReason>,
    pub failed_detail: Option<String>,
    /// Position in the common password list of the password that worked.
    pub password_index: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Input for `JobStore::create_job`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub root_path: PathBuf,
    pub concurrency: u32,
    pub options: JobOptionsDraft,
    pub retry_from_job_id: Option<JobId>,
    pub items: Vec<NewItem>,
}

impl NewJob {
    pub fn new(root_path: impl Into<PathBuf>, options: JobOptionsDraft) -> Self {
        Self {
            root_path: root_path.into(),
            concurrency: 1,
            options,
            retry_from_job_id: None,
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: NewItem) -> Self {
        self.items.push(item);
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub archive_path: PathBuf,
    pub ext: String,
    pub out_dir: Option<PathBuf>,
    pub archive_group: Option<serde_json::Value>,
}

impl NewItem {
    /// An item whose extension is taken from the archive path.
    pub fn for_archive(archive_path: impl Into<PathBuf>) -> Self {
        let archive_path = archive_path.into();
        let ext = archive_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        Self {
            archive_path,
            ext,
            out_dir: None,
            archive_group: None,
        }
    }
}

/// A retry re-creates an item from the archive it points at.
impl From<JobItem> for NewItem {
    fn from(item: JobItem) -> Self {
        Self {
            archive_path: item.archive_path,
            ext: item.ext,
            out_dir: item.out_dir,
            archive_group: item.archive_group,
        }
    }
}

/// The recorded outcome of a running item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub status: ItemStatus,
    pub reason: Option<FailedReason>,
    pub detail: Option<String>,
    pub out_dir: Option<PathBuf>,
    pub password_index: Option<usize>,
}

impl ItemOutcome {
    pub fn success(out_dir: PathBuf, password_index: Option<usize>) -> Self {
        Self {
            status: ItemStatus::Success,
            reason: None,
            detail: Some("Extracted successfully".to_string()),
            out_dir: Some(out_dir),
            password_index,
        }
    }

    pub fn failed(reason: FailedReason, detail: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Failed,
            reason: Some(reason),
            detail: Some(detail.into()),
            out_dir: None,
            password_index: None,
        }
    }

    pub fn skipped(detail: impl Into<String>) -> Self {
        Self {
            status: ItemStatus::Skipped,
            reason: None,
            detail: Some(detail.into()),
            out_dir: None,
            password_index: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: ItemStatus::Canceled,
            reason: None,
            detail: None,
            out_dir: None,
            password_index: None,
        }
    }
}

/// The global settings row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub conflict_policy: ConflictPolicy,
    pub output_mode: OutputMode,
    pub zip_slip_policy: ZipSlipPolicy,
    pub common_passwords: Vec<String>,
    pub password_masking: bool,
    pub updated_at: DateTime<Utc>,
}

/// Partial settings write. The first write must carry every policy field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub conflict_policy: Option<ConflictPolicy>,
    pub output_mode: Option<OutputMode>,
    pub zip_slip_policy: Option<ZipSlipPolicy>,
    pub common_passwords: Option<Vec<String>>,
    pub password_masking: Option<bool>,
}
