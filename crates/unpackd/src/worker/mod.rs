pub mod dispatcher;
pub mod job_log;

pub use dispatcher::{Dispatcher, DispatcherConfig, TickOutcome};
pub use job_log::{read_tail, JobLog};
