//! Job, item and failure-reason enums with their persisted wire names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a persisted status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The snake_case name stored in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
    Queued,
    Running,
    Pausing,
    Paused,
    Canceling,
    Canceled,
    Completed,
    Failed,
}

wire_enum!(JobStatus, "job status", {
    Draft => "draft",
    Queued => "queued",
    Running => "running",
    Pausing => "pausing",
    Paused => "paused",
    Canceling => "canceling",
    Canceled => "canceled",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    /// Terminal statuses have no outgoing transitions and allow deletion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Canceled,
}

wire_enum!(ItemStatus, "item status", {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
    Canceled => "canceled",
});

impl ItemStatus {
    /// An item outcome has been recorded. `Failed` counts as terminal even
    /// though an explicit retry may move it back to `Pending`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Success | ItemStatus::Failed | ItemStatus::Skipped | ItemStatus::Canceled
        )
    }

    /// The job aggregate column incremented when an item reaches this status.
    pub(crate) fn counter_column(&self) -> Option<&'static str> {
        match self {
            ItemStatus::Success => Some("success"),
            ItemStatus::Failed => Some("failed"),
            ItemStatus::Skipped => Some("skipped"),
            ItemStatus::Canceled => Some("canceled"),
            ItemStatus::Pending | ItemStatus::Running => None,
        }
    }
}

/// Why an item ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedReason {
    /// The extraction tool could not be located.
    ToolMissing,
    /// The archive is encrypted and no password was supplied.
    PasswordRequired,
    /// Every supplied password was rejected.
    PasswordWrong,
    Corrupted,
    VolumeMissing,
    PermissionDenied,
    DiskFull,
    /// Reserved for an entry that would land outside the output directory.
    /// Not assigned by the worker; 7-Zip sanitises entry paths itself.
    PathTraversalBlocked,
    /// Outcome unknown: the process died or the dispatcher lost track of it.
    Interrupted,
    Unknown,
}

wire_enum!(FailedReason, "failed reason", {
    ToolMissing => "tool_missing",
    PasswordRequired => "password_required",
    PasswordWrong => "password_wrong",
    Corrupted => "corrupted",
    VolumeMissing => "volume_missing",
    PermissionDenied => "permission_denied",
    DiskFull => "disk_full",
    PathTraversalBlocked => "path_traversal_blocked",
    Interrupted => "interrupted",
    Unknown => "unknown",
});
