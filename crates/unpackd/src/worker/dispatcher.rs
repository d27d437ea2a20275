//! The worker loop: claims queued jobs and drives their items one at a time.
//!
//! One tick claims at most one job and runs it until it drains, pauses or is
//! canceled. Pause and cancel requests are observed between items; an
//! extraction that is already running is never interrupted by them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::job_log::JobLog;
use crate::domain::{FailedReason, ItemOutcome, Job, JobId, JobItem, JobStatus};
use crate::error::WorkerError;
use crate::extract::invoker::{CommandRunner, ExtractOutcome, ExtractRequest, Invoker};
use crate::extract::password::resolve_password_attempts;
use crate::extract::tool::ToolResolver;
use crate::store::{JobStore, StoreError};

/// Tuning knobs of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    /// Failure reasons that fail every remaining item of the job.
    pub job_fatal_reasons: Vec<FailedReason>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            job_fatal_reasons: vec![FailedReason::ToolMissing],
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick was still in progress.
    Busy,
    /// Nothing was queued.
    Idle,
    /// The job was claimed and driven until it stopped.
    Processed(JobId),
}

/// Resets the tick flag however the tick ends, including cancellation.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Why the item loop of a job stopped.
enum LoopExit {
    /// No pending items left, or the job left `running`.
    Drained,
    /// The job was paused; it must not be finalized.
    Paused,
}

pub struct Dispatcher {
    store: JobStore,
    invoker: Invoker,
    resolver: Arc<dyn ToolResolver>,
    config: DispatcherConfig,
    ticking: AtomicBool,
    shutdown: AtomicBool,
    shutdown_signal: Notify,
}

impl Dispatcher {
    pub fn new(
        store: JobStore,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn ToolResolver>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            invoker: Invoker::new(runner),
            resolver,
            config,
            ticking: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Runs one dispatch cycle. Overlapping calls return [`TickOutcome::Busy`].
    pub async fn tick(&self) -> Result<TickOutcome, WorkerError> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Tick skipped: previous tick still running");
            return Ok(TickOutcome::Busy);
        }
        let _guard = TickGuard(&self.ticking);

        self.converge_canceling()?;

        let Some(job) = self.store.claim_next_queued()? else {
            return Ok(TickOutcome::Idle);
        };
        self.run_job(&job).await;
        Ok(TickOutcome::Processed(job.id))
    }

    /// Ticks until nothing is left to claim. Returns the processed job ids.
    pub async fn drain(&self) -> Result<Vec<JobId>, WorkerError> {
        let mut processed = Vec::new();
        loop {
            match self.tick().await? {
                TickOutcome::Processed(id) => processed.push(id),
                TickOutcome::Idle | TickOutcome::Busy => return Ok(processed),
            }
        }
    }

    /// Starts the poll loop on its own thread with a current-thread runtime.
    pub fn start(self: Arc<Self>) -> JoinHandle<Result<(), WorkerError>> {
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(WorkerError::Runtime)?;

            rt.block_on(async {
                let mut interval = tokio::time::interval(self.config.poll_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(
                    "Dispatcher started (poll every {}ms)",
                    self.config.poll_interval.as_millis()
                );

                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = self.shutdown_signal.notified() => {}
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        outcome = self.tick() => match outcome {
                            // Look for the next job right away.
                            Ok(TickOutcome::Processed(_)) => interval.reset_immediately(),
                            Ok(_) => {}
                            Err(e) => error!("Dispatch tick failed: {}", e),
                        },
                        _ = self.shutdown_signal.notified() => {
                            warn!("Shutdown during dispatch; the running job is recovered at next boot");
                            break;
                        }
                    }
                }
            });

            info!("Dispatcher stopped");
            Ok(())
        })
    }

    /// Signals the poll loop to stop. A job in progress is abandoned and its
    /// extractor killed.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_signal.notify_one();
    }

    /// Finishes jobs canceled while nothing was dispatching them.
    fn converge_canceling(&self) -> Result<(), StoreError> {
        for job_id in self.store.find_canceling_jobs()? {
            self.store.complete_cancel(job_id)?;
            self.store.finalize_job(job_id)?;
        }
        Ok(())
    }

    fn is_job_fatal(&self, reason: FailedReason) -> bool {
        self.config.job_fatal_reasons.contains(&reason)
    }

    /// Drives a claimed job. Store failures are recorded on the job and the
    /// job is finalized so it never stays `running`.
    async fn run_job(&self, job: &Job) {
        let log_path = job
            .log_path
            .clone()
            .unwrap_or_else(|| self.store.log_path_for(job.id));
        let log = JobLog::open(&log_path).unwrap_or_else(|e| {
            warn!("Job {}: cannot open log {}: {}", job.id, log_path.display(), e);
            JobLog::discard(&log_path)
        });
        log.line(format!(
            "=== Job {} started at {}",
            job.id,
            job.started_at.unwrap_or(job.created_at).to_rfc3339()
        ));

        if let Err(e) = self.drive(job, &log).await {
            error!("Job {} failed: {}", job.id, e);
            log.line(format!("ERROR: {}", e));
            if let Err(e) = self.store.record_job_error(job.id, &e.to_string()) {
                error!("Job {}: failed to record error: {}", job.id, e);
            }
            if let Err(e) = self.store.finalize_job(job.id) {
                error!("Job {}: failed to finalize after error: {}", job.id, e);
            }
        }
    }

    async fn drive(&self, job: &Job, log: &JobLog) -> Result<(), StoreError> {
        let tool = match self.resolver.resolve() {
            Ok(tool) => {
                log.line(format!("Using 7z: {}", tool.display()));
                Some(tool)
            }
            Err(e) => {
                warn!("Job {}: {}", job.id, e);
                log.line(format!("ERROR: {}", e));
                if self.is_job_fatal(FailedReason::ToolMissing) {
                    self.store
                        .fail_unfinished_items(job.id, FailedReason::ToolMissing, &e.to_string())?;
                    self.finish(job.id, log)?;
                    return Ok(());
                }
                None
            }
        };

        let common_passwords = self
            .store
            .get_settings()?
            .map(|s| s.common_passwords)
            .unwrap_or_default();

        match self
            .item_loop(job.id, tool.as_deref(), &common_passwords, log)
            .await?
        {
            LoopExit::Paused => Ok(()),
            LoopExit::Drained => self.finish(job.id, log),
        }
    }

    async fn item_loop(
        &self,
        job_id: JobId,
        tool: Option<&Path>,
        common_passwords: &[String],
        log: &JobLog,
    ) -> Result<LoopExit, StoreError> {
        loop {
            let job = self.store.get_job(job_id)?;
            match job.status {
                JobStatus::Running => {}
                JobStatus::Pausing => {
                    self.store.pause_job(job_id)?;
                    log.line(format!("Job {} paused", job_id));
                    return Ok(LoopExit::Paused);
                }
                JobStatus::Canceling => {
                    let n = self.store.complete_cancel(job_id)?;
                    log.line(format!("Job {} canceled {} remaining items", job_id, n));
                    return Ok(LoopExit::Drained);
                }
                other => {
                    warn!("Job {} left running while dispatched (now {})", job_id, other);
                    return Ok(LoopExit::Drained);
                }
            }

            let Some(item) = self.store.pending_items(job_id)?.into_iter().next() else {
                return Ok(LoopExit::Drained);
            };
            let outcome = self
                .process_item(&job, item, tool, common_passwords, log)
                .await?;

            if let Some(reason) = outcome.reason.filter(|r| self.is_job_fatal(*r)) {
                let detail = outcome.detail.as_deref().unwrap_or(reason.as_str());
                let n = self.store.fail_unfinished_items(job_id, reason, detail)?;
                log.line(format!(
                    "ERROR: {} is fatal for the job; failed {} remaining item(s)",
                    reason, n
                ));
                return Ok(LoopExit::Drained);
            }
        }
    }

    async fn process_item(
        &self,
        job: &Job,
        item: JobItem,
        tool: Option<&Path>,
        common_passwords: &[String],
        log: &JobLog,
    ) -> Result<ItemOutcome, StoreError> {
        let item = self.store.start_item(item.id)?;
        log.line(format!("\n--- Processing: {}", item.archive_path.display()));

        let out_dir = item
            .out_dir
            .clone()
            .unwrap_or_else(|| job.options.output_dir_for(&item.archive_path));
        log.line(format!("[Extract] outDir: {}", out_dir.display()));

        let outcome = match tool {
            None => ItemOutcome::failed(FailedReason::ToolMissing, "7-Zip executable not found"),
            Some(tool) => match resolve_password_attempts(&job.options.password, common_passwords)
            {
                Err(e) => {
                    log.line(format!("[Extract] ERROR: {}", e));
                    ItemOutcome::failed(FailedReason::Unknown, e.to_string())
                }
                Ok(attempts) => {
                    log.line(format!(
                        "[Extract] passwordMode={} attempts={}",
                        job.options.password.mode(),
                        attempts.len()
                    ));
                    let request = ExtractRequest {
                        tool,
                        archive_path: &item.archive_path,
                        out_dir: &out_dir,
                        overwrite: job.conflict_policy.into(),
                        attempts: &attempts,
                    };
                    match self.invoker.extract(&request, log).await {
                        ExtractOutcome::Success { password_index, .. } => {
                            log.line(format!(
                                "[Success] Item {} completed: {}",
                                item.id,
                                out_dir.display()
                            ));
                            ItemOutcome::success(out_dir, password_index)
                        }
                        ExtractOutcome::Failed { reason, detail, .. } => {
                            ItemOutcome::failed(reason, detail)
                        }
                    }
                }
            },
        };

        self.store.finalize_item(job.id, item.id, &outcome)?;
        Ok(outcome)
    }

    fn finish(&self, job_id: JobId, log: &JobLog) -> Result<(), StoreError> {
        let report = self.store.finalize_job(job_id)?;
        if report.forced > 0 {
            log.line(format!(
                "WARNING: {} item(s) were not finalized and were force failed",
                report.forced
            ));
        }
        log.line(format!(
            "\n=== Job {} processing completed: {} (success {}, failed {}, skipped {}, canceled {})",
            job_id,
            report.status,
            report.counts.success,
            report.counts.failed,
            report.counts.skipped,
            report.counts.canceled
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::domain::{
        ConflictPolicy, ItemStatus, JobOptionsDraft, NewItem, NewJob, OutputMode,
        PasswordStrategy, SettingsUpdate, ZipSlipPolicy,
    };
    use crate::extract::invoker::CommandOutput;
    use crate::extract::tool::ToolError;
    use async_trait::async_trait;
    use std::ffi::OsString;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Succeeds every call; optionally requests pause/cancel on the first call.
    struct FakeRunner {
        calls: Mutex<usize>,
        on_first_call: Mutex<Option<Box<dyn FnOnce() + Send>>>,
        output: CommandOutput,
    }

    impl FakeRunner {
        fn new(output: CommandOutput) -> Self {
            Self {
                calls: Mutex::new(0),
                on_first_call: Mutex::new(None),
                output,
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, _program: &Path, _args: &[OsString], _log: &JobLog) -> CommandOutput {
            *self.calls.lock().unwrap() += 1;
            if let Some(hook) = self.on_first_call.lock().unwrap().take() {
                hook();
            }
            self.output.clone()
        }
    }

    struct FixedTool(Option<PathBuf>);

    impl ToolResolver for FixedTool {
        fn resolve(&self) -> Result<PathBuf, ToolError> {
            self.0.clone().ok_or(ToolError::NotFound {
                candidates: "7z".to_string(),
            })
        }
    }

    fn store(dir: &Path) -> JobStore {
        JobStore::new(Database::open_in_memory().unwrap(), dir.join("logs"))
    }

    fn queued_job(store: &JobStore, archives: &[&str], password: PasswordStrategy) -> JobId {
        let mut new_job = NewJob::new(
            "/data",
            JobOptionsDraft {
                output_mode: Some(OutputMode::SiblingNamedDir),
                output_dir: None,
                conflict_policy: Some(ConflictPolicy::Skip),
                zip_slip_policy: Some(ZipSlipPolicy::Block),
                password,
            },
        );
        for archive in archives {
            new_job = new_job.with_item(NewItem::for_archive(*archive));
        }
        let id = store.create_job(&new_job).unwrap();
        store.enqueue_job(id).unwrap();
        id
    }

    fn dispatcher(store: &JobStore, runner: Arc<FakeRunner>, tool: Option<&str>) -> Dispatcher {
        Dispatcher::new(
            store.clone(),
            runner,
            Arc::new(FixedTool(tool.map(PathBuf::from))),
            DispatcherConfig::default(),
        )
    }

    fn ok() -> CommandOutput {
        CommandOutput::exited(0, "Everything is Ok", "")
    }

    #[tokio::test]
    async fn test_idle_when_nothing_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let d = dispatcher(&store, Arc::new(FakeRunner::new(ok())), Some("/bin/7z"));
        assert_eq!(d.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let d = dispatcher(&store, Arc::new(FakeRunner::new(ok())), Some("/bin/7z"));
        d.ticking.store(true, Ordering::Release);
        assert_eq!(d.tick().await.unwrap(), TickOutcome::Busy);
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = queued_job(&store, &["/data/a.zip", "/data/b.7z"], PasswordStrategy::None);
        let runner = Arc::new(FakeRunner::new(ok()));
        let d = dispatcher(&store, runner.clone(), Some("/bin/7z"));

        assert_eq!(d.tick().await.unwrap(), TickOutcome::Processed(id));
        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counts.success, 2);
        assert!(job.ended_at.is_some());
        assert_eq!(runner.calls(), 2);

        let items = store.list_items(id).unwrap();
        assert_eq!(items[0].out_dir.as_deref(), Some(Path::new("/data/a")));

        let log = std::fs::read_to_string(store.log_path_for(id)).unwrap();
        assert!(log.contains(&format!("=== Job {} started", id)));
        assert!(log.contains("processing completed: completed"));
    }

    #[tokio::test]
    async fn test_item_failure_does_not_abort_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = queued_job(&store, &["/data/a.zip", "/data/b.zip"], PasswordStrategy::None);
        let runner = Arc::new(FakeRunner::new(CommandOutput::exited(2, "", "Headers Error")));
        let d = dispatcher(&store, runner.clone(), Some("/bin/7z"));

        d.tick().await.unwrap();
        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.counts.failed, 2);
        assert_eq!(runner.calls(), 2);
        let items = store.list_items(id).unwrap();
        assert!(items
            .iter()
            .all(|i| i.failed_reason == Some(FailedReason::Corrupted)));
    }

    #[tokio::test]
    async fn test_pause_between_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = queued_job(&store, &["/data/a.zip", "/data/b.zip"], PasswordStrategy::None);
        let runner = Arc::new(FakeRunner::new(ok()));
        let pauser = store.clone();
        *runner.on_first_call.lock().unwrap() = Some(Box::new(move || {
            pauser.request_pause(id).unwrap();
        }));
        let d = dispatcher(&store, runner.clone(), Some("/bin/7z"));

        d.tick().await.unwrap();
        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.counts.success, 1);
        assert!(job.ended_at.is_none());
        assert_eq!(store.pending_items(id).unwrap().len(), 1);

        // Resuming picks up where it stopped.
        store.enqueue_job(id).unwrap();
        d.tick().await.unwrap();
        assert_eq!(store.get_job(id).unwrap().status, JobStatus::Completed);
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_between_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = queued_job(
            &store,
            &["/data/a.zip", "/data/b.zip", "/data/c.zip"],
            PasswordStrategy::None,
        );
        let runner = Arc::new(FakeRunner::new(ok()));
        let canceler = store.clone();
        *runner.on_first_call.lock().unwrap() = Some(Box::new(move || {
            canceler.request_cancel(id).unwrap();
        }));
        let d = dispatcher(&store, runner.clone(), Some("/bin/7z"));

        d.tick().await.unwrap();
        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.counts.success, 1);
        assert_eq!(job.counts.canceled, 2);
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_queued_cancel_converges_without_claim() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = queued_job(&store, &["/data/a.zip"], PasswordStrategy::None);
        store.request_cancel(id).unwrap();
        let runner = Arc::new(FakeRunner::new(ok()));
        let d = dispatcher(&store, runner.clone(), Some("/bin/7z"));

        assert_eq!(d.tick().await.unwrap(), TickOutcome::Idle);
        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.counts.canceled, 1);
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_tool_fails_whole_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = queued_job(&store, &["/data/a.zip", "/data/b.zip"], PasswordStrategy::None);
        let runner = Arc::new(FakeRunner::new(ok()));
        let d = dispatcher(&store, runner.clone(), None);

        d.tick().await.unwrap();
        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.counts.failed, 2);
        assert_eq!(runner.calls(), 0);
        assert!(store
            .list_items(id)
            .unwrap()
            .iter()
            .all(|i| i.failed_reason == Some(FailedReason::ToolMissing)));
    }

    #[tokio::test]
    async fn test_missing_tool_per_item_when_not_job_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = queued_job(&store, &["/data/a.zip", "/data/b.zip"], PasswordStrategy::None);
        let d = Dispatcher::new(
            store.clone(),
            Arc::new(FakeRunner::new(ok())),
            Arc::new(FixedTool(None)),
            DispatcherConfig {
                job_fatal_reasons: Vec::new(),
                ..DispatcherConfig::default()
            },
        );

        d.tick().await.unwrap();
        let items = store.list_items(id).unwrap();
        assert!(items.iter().all(|i| i.status == ItemStatus::Failed
            && i.failed_reason == Some(FailedReason::ToolMissing)
            && i.failed_detail.as_deref() == Some("7-Zip executable not found")));
        assert_eq!(store.get_job(id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_password_resolution_failure_fails_item() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .update_settings(&SettingsUpdate {
                conflict_policy: Some(ConflictPolicy::Skip),
                output_mode: Some(OutputMode::SiblingNamedDir),
                zip_slip_policy: Some(ZipSlipPolicy::Block),
                common_passwords: Some(vec!["only".into()]),
                password_masking: None,
            })
            .unwrap();
        let id = queued_job(
            &store,
            &["/data/a.zip"],
            PasswordStrategy::Select { ref_index: 4 },
        );
        let runner = Arc::new(FakeRunner::new(ok()));
        let d = dispatcher(&store, runner.clone(), Some("/bin/7z"));

        d.tick().await.unwrap();
        let item = &store.list_items(id).unwrap()[0];
        assert_eq!(item.failed_reason, Some(FailedReason::Unknown));
        assert!(item.failed_detail.as_deref().unwrap().contains("out of range"));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_drain_processes_jobs_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let first = queued_job(&store, &["/data/a.zip"], PasswordStrategy::None);
        let second = queued_job(&store, &["/data/b.zip"], PasswordStrategy::None);
        let d = dispatcher(&store, Arc::new(FakeRunner::new(ok())), Some("/bin/7z"));

        assert_eq!(d.drain().await.unwrap(), vec![first, second]);
    }

    #[test]
    fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let d = Arc::new(Dispatcher::new(
            store,
            Arc::new(FakeRunner::new(ok())),
            Arc::new(FixedTool(Some(PathBuf::from("/bin/7z")))),
            DispatcherConfig {
                poll_interval: Duration::from_millis(20),
                ..DispatcherConfig::default()
            },
        ));

        let handle = Arc::clone(&d).start();
        std::thread::sleep(Duration::from_millis(80));
        d.stop();
        handle.join().unwrap().unwrap();
    }
}
