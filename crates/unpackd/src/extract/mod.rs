//! Everything between a job item and the 7-Zip process.

pub mod args;
pub mod invoker;
pub mod password;
pub mod tool;

pub use args::{build_extract_args, display_args, ArgsError, OverwriteMode};
pub use invoker::{
    classify, AttemptResult, CommandOutput, CommandRunner, ExtractOutcome, ExtractRequest, Invoker,
    ProcessRunner, RunStatus,
};
pub use password::{is_password_error, resolve_password_attempts, PasswordAttempt, PasswordError};
pub use tool::{SearchPathResolver, ToolError, ToolResolver, DEFAULT_CANDIDATES};
