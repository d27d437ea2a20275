//! Isolated store and a scripted extractor.

#![allow(dead_code)]

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use unpackd::extract::tool::ToolError;
use unpackd::extract::{CommandOutput, CommandRunner, ToolResolver};
use unpackd::worker::JobLog;
use unpackd::{Dispatcher, DispatcherConfig, JobId, JobStore, NewJob, RetryPolicy};

type Script = dyn Fn(&[String]) -> CommandOutput + Send + Sync;

/// Answers each invocation through a script and records its arguments.
pub struct FakeSevenZip {
    script: Box<Script>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeSevenZip {
    pub fn new(script: impl Fn(&[String]) -> CommandOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Extracts everything successfully.
    pub fn always_ok() -> Arc<Self> {
        Self::new(|_| CommandOutput::exited(0, "Everything is Ok", ""))
    }

    /// Succeeds only for `-p<password>`; anything else is a wrong password.
    pub fn with_password(password: &'static str) -> Arc<Self> {
        Self::new(move |args| {
            let expected = format!("-p{}", password);
            if args.iter().any(|a| *a == expected) {
                CommandOutput::exited(0, "Everything is Ok", "")
            } else {
                CommandOutput::exited(2, "", "ERROR: Wrong password : secret.txt")
            }
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeSevenZip {
    async fn run(&self, _program: &Path, args: &[OsString], _log: &JobLog) -> CommandOutput {
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        self.calls.lock().unwrap().push(args.clone());
        (self.script)(&args)
    }
}

/// Resolves to a fixed path, or fails as if 7-Zip were not installed.
pub struct StaticTool(pub Option<PathBuf>);

impl ToolResolver for StaticTool {
    fn resolve(&self) -> Result<PathBuf, ToolError> {
        self.0.clone().ok_or(ToolError::NotFound {
            candidates: "7zz, 7z, 7za".to_string(),
        })
    }
}

/// A var directory in a temp dir with a file-backed store.
pub struct TestHarness {
    temp_dir: TempDir,
    pub store: JobStore,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store =
            JobStore::open(temp_dir.path(), RetryPolicy::default()).expect("Failed to open store");
        Self { temp_dir, store }
    }

    pub fn var_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// A second, independent store handle on the same database file.
    pub fn reopen(&self) -> JobStore {
        JobStore::open(self.var_dir(), RetryPolicy::default()).expect("Failed to reopen store")
    }

    /// Creates and enqueues a job.
    pub fn submit(&self, job: &NewJob) -> JobId {
        let id = self.store.create_job(job).expect("Failed to create job");
        self.store.enqueue_job(id).expect("Failed to enqueue job");
        id
    }

    pub fn dispatcher(&self, runner: Arc<FakeSevenZip>) -> Dispatcher {
        self.dispatcher_with_tool(runner, Some(PathBuf::from("/usr/bin/7z")))
    }

    pub fn dispatcher_with_tool(
        &self,
        runner: Arc<FakeSevenZip>,
        tool: Option<PathBuf>,
    ) -> Dispatcher {
        Dispatcher::new(
            self.store.clone(),
            runner,
            Arc::new(StaticTool(tool)),
            DispatcherConfig::default(),
        )
    }
}
