//! Resolved job options.
//!
//! `JobOptions` is the single closed record the core works with. Callers
//! build a [`JobOptionsDraft`] (policy fields optional) and the store resolves
//! it at creation time; missing fields are an error, never defaulted.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Current version of the persisted options record.
pub const OPTIONS_VERSION: u32 = 1;

/// What to do when an extracted path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    Skip,
    Overwrite,
    Rename,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Skip => "skip",
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Rename => "rename",
        }
    }
}

/// Where the extracted content of an archive lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// `<archive dir>/<archive stem>/`
    SiblingNamedDir,
    /// `<archive dir>/`
    InPlace,
    /// `<job output_dir>/<archive stem>/`
    Custom,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::SiblingNamedDir => "sibling_named_dir",
            OutputMode::InPlace => "in_place",
            OutputMode::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZipSlipPolicy {
    Block,
    Allow,
}

impl ZipSlipPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZipSlipPolicy::Block => "block",
            ZipSlipPolicy::Allow => "allow",
        }
    }
}

/// Which password(s), if any, are tried for each archive of a job.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PasswordStrategy {
    #[default]
    None,
    /// A single password typed by the user.
    Manual { value: String },
    /// One entry of the shared common password list.
    Select { ref_index: i64 },
    /// Every entry of the shared common password list, in stored order.
    TryList,
    /// A mode this build does not know, read back from an older row.
    #[serde(other)]
    Unrecognized,
}

impl PasswordStrategy {
    pub fn mode(&self) -> &'static str {
        match self {
            PasswordStrategy::None => "none",
            PasswordStrategy::Manual { .. } => "manual",
            PasswordStrategy::Select { .. } => "select",
            PasswordStrategy::TryList => "try_list",
            PasswordStrategy::Unrecognized => "unrecognized",
        }
    }

    /// Rejects strategies that can never produce a password, whatever the
    /// common list holds at run time.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            PasswordStrategy::Manual { value } if value.trim().is_empty() => {
                Err("password mode manual requires a non-empty password".to_string())
            }
            PasswordStrategy::Select { ref_index } if *ref_index < 0 => Err(format!(
                "password ref_index must not be negative (got {})",
                ref_index
            )),
            PasswordStrategy::Unrecognized => Err("unknown password mode".to_string()),
            _ => Ok(()),
        }
    }
}

// Manual passwords must never end up in logs.
impl fmt::Debug for PasswordStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PasswordStrategy::Manual { .. } => f
                .debug_struct("Manual")
                .field("value", &"***")
                .finish(),
            PasswordStrategy::Select { ref_index } => f
                .debug_struct("Select")
                .field("ref_index", ref_index)
                .finish(),
            other => f.write_str(other.mode()),
        }
    }
}

/// Fully resolved options of a job, persisted as JSON in `jobs.options_json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub version: u32,
    pub output_mode: OutputMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    pub conflict_policy: ConflictPolicy,
    pub zip_slip_policy: ZipSlipPolicy,
    #[serde(default)]
    pub password: PasswordStrategy,
}

impl JobOptions {
    /// Output directory for one archive under these options.
    pub fn output_dir_for(&self, archive_path: &Path) -> PathBuf {
        let parent = archive_path.parent().unwrap_or_else(|| Path::new(""));
        let stem = archive_path
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        match self.output_mode {
            OutputMode::SiblingNamedDir => parent.join(stem),
            OutputMode::InPlace => parent.to_path_buf(),
            OutputMode::Custom => match &self.output_dir {
                Some(dir) => dir.join(stem),
                None => parent.join(stem),
            },
        }
    }
}

/// Options as handed over by the request layer, before the store checks them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptionsDraft {
    pub output_mode: Option<OutputMode>,
    pub output_dir: Option<PathBuf>,
    pub conflict_policy: Option<ConflictPolicy>,
    pub zip_slip_policy: Option<ZipSlipPolicy>,
    #[serde(default)]
    pub password: PasswordStrategy,
}

/// Why a draft could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftError {
    Missing(Vec<&'static str>),
    Invalid(String),
}

impl JobOptionsDraft {
    pub fn resolve(self) -> Result<JobOptions, DraftError> {
        let mut missing = Vec::new();
        if self.conflict_policy.is_none() {
            missing.push("conflict_policy");
        }
        if self.output_mode.is_none() {
            missing.push("output_mode");
        }
        if self.zip_slip_policy.is_none() {
            missing.push("zip_slip_policy");
        }

        match (self.conflict_policy, self.output_mode, self.zip_slip_policy) {
            (Some(conflict_policy), Some(output_mode), Some(zip_slip_policy)) => {
                let output_dir = self
                    .output_dir
                    .filter(|dir| !dir.as_os_str().is_empty());
                if output_mode == OutputMode::Custom && output_dir.is_none() {
                    return Err(DraftError::Invalid(
                        "output_mode=custom requires a non-empty output_dir".to_string(),
                    ));
                }
                self.password.validate().map_err(DraftError::Invalid)?;
                Ok(JobOptions {
                    version: OPTIONS_VERSION,
                    output_mode,
                    output_dir,
                    conflict_policy,
                    zip_slip_policy,
                    password: self.password,
                })
            }
            _ => Err(DraftError::Missing(missing)),
        }
    }
}

impl From<JobOptions> for JobOptionsDraft {
    fn from(options: JobOptions) -> Self {
        Self {
            output_mode: Some(options.output_mode),
            output_dir: options.output_dir,
            conflict_policy: Some(options.conflict_policy),
            zip_slip_policy: Some(options.zip_slip_policy),
            password: options.password,
        }
    }
}
