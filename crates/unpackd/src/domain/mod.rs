//! Core data model: statuses, transition rules, options and row types.

pub mod models;
pub mod options;
pub mod state_machine;
pub mod status;

pub use models::{
    ItemId, ItemOutcome, Job, JobId, JobItem, NewItem, NewJob, Settings, SettingsUpdate,
};
pub use options::{
    ConflictPolicy, JobOptions, JobOptionsDraft, OutputMode, PasswordStrategy, ZipSlipPolicy,
};
pub use state_machine::{
    assert_item_transition, assert_job_transition, compute_progress, derive_final_status,
    JobCounts, Progress, TransitionError,
};
pub use status::{FailedReason, ItemStatus, JobStatus, ParseStatusError};
