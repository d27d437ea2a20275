pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod extract;
pub mod logging;
pub mod reconcile;
pub mod store;
pub mod worker;

pub use config::{load_config, load_config_from_str, Config};
pub use db::{Database, DatabaseError, RetryPolicy};
pub use domain::{
    FailedReason, ItemOutcome, ItemStatus, Job, JobId, JobItem, JobOptions, JobOptionsDraft,
    JobStatus, NewItem, NewJob, PasswordStrategy, Settings, SettingsUpdate,
};
pub use error::{ConfigError, Result, UnpackdError, WorkerError};
pub use extract::{CommandRunner, ProcessRunner, SearchPathResolver, ToolResolver};
pub use reconcile::{reconcile_on_boot, ReconcileReport};
pub use store::{FinalizeReport, JobStore, StoreError};
pub use worker::{Dispatcher, DispatcherConfig, TickOutcome};
