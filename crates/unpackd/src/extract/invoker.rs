//! Running the extractor and classifying what it did.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::args::{build_extract_args, display_args, OverwriteMode};
use super::password::{is_password_error, PasswordAttempt};
use crate::domain::FailedReason;
use crate::worker::job_log::JobLog;

/// Longest stderr excerpt kept in an item's failure detail.
const DETAIL_STDERR_CHARS: usize = 200;

/// How a subprocess run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Exited(i32),
    /// Killed by a signal; no exit code.
    Terminated,
    SpawnFailed(String),
    TimedOut(Duration),
}

/// Captured result of one subprocess run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Exited(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Runs one program with an argument vector, streaming its output to a job log.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[OsString], log: &JobLog) -> CommandOutput;
}

/// Real subprocess execution through `tokio::process`.
///
/// The program is spawned directly (no shell) with stdin closed. A child
/// that outlives `timeout` is killed; dropping the future also kills it.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &Path, args: &[OsString], log: &JobLog) -> CommandOutput {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput {
                    status: RunStatus::SpawnFailed(e.to_string()),
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let run = async {
            let (stdout, stderr) =
                tokio::join!(stream_lines(stdout, log), stream_lines(stderr, log));
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        let finished = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };

        match finished {
            Some((stdout, stderr, Ok(status))) => CommandOutput {
                status: status
                    .code()
                    .map_or(RunStatus::Terminated, RunStatus::Exited),
                stdout,
                stderr,
            },
            Some((stdout, stderr, Err(e))) => CommandOutput {
                status: RunStatus::SpawnFailed(format!("failed to wait for process: {}", e)),
                stdout,
                stderr,
            },
            None => {
                if let Err(e) = child.kill().await {
                    debug!("Failed to kill timed out extractor: {}", e);
                }
                CommandOutput {
                    status: RunStatus::TimedOut(self.timeout.unwrap_or_default()),
                    stdout: String::new(),
                    stderr: String::new(),
                }
            }
        }
    }
}

/// Copies a child stream line by line into the job log and returns it whole.
///
/// Lines are decoded lossily: archive entry names are often not UTF-8, and
/// the stream is drained to EOF so the child never writes into a closed pipe.
async fn stream_lines<R>(stream: Option<R>, log: &JobLog) -> String
where
    R: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let Some(stream) = stream else {
        return collected;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                log.line(line);
                collected.push_str(line);
                collected.push('\n');
            }
            Err(e) => {
                debug!("Failed to read extractor output: {}", e);
                break;
            }
        }
    }
    collected
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    /// The archive rejected the password; the next one may work.
    PasswordFailure,
    /// Any other failure; no further attempts are made.
    Fatal { reason: FailedReason, detail: String },
}

/// Maps a finished run onto an attempt result.
pub fn classify(output: &CommandOutput) -> AttemptResult {
    match &output.status {
        RunStatus::Exited(0) => AttemptResult::Success,
        RunStatus::Exited(code) => {
            if is_password_error(&output.stdout, &output.stderr) {
                return AttemptResult::PasswordFailure;
            }
            let stderr = output.stderr.trim();
            let detail = if stderr.is_empty() {
                format!("exited with code {}", code)
            } else {
                format!(
                    "exited with code {}: {}",
                    code,
                    stderr.chars().take(DETAIL_STDERR_CHARS).collect::<String>()
                )
            };
            AttemptResult::Fatal {
                reason: refine_reason(&output.stdout, &output.stderr),
                detail,
            }
        }
        RunStatus::Terminated => AttemptResult::Fatal {
            reason: FailedReason::Unknown,
            detail: "terminated by signal".to_string(),
        },
        RunStatus::SpawnFailed(e) => AttemptResult::Fatal {
            reason: FailedReason::Unknown,
            detail: format!("failed to spawn extractor: {}", e),
        },
        RunStatus::TimedOut(limit) => AttemptResult::Fatal {
            reason: FailedReason::Unknown,
            detail: format!("timed out after {}s and was killed", limit.as_secs()),
        },
    }
}

/// Buckets a non-password failure by what the extractor printed.
fn refine_reason(stdout: &str, stderr: &str) -> FailedReason {
    const BUCKETS: &[(FailedReason, &[&str])] = &[
        (FailedReason::VolumeMissing, &["missing volume", "unavailable start of archive"]),
        (
            FailedReason::DiskFull,
            &["no space left on device", "there is not enough space on the disk", "disk full"],
        ),
        (
            FailedReason::PermissionDenied,
            &["permission denied", "access is denied", "operation not permitted"],
        ),
        (
            FailedReason::Corrupted,
            &[
                "headers error",
                "crc failed",
                "unexpected end of archive",
                "cannot open the file as archive",
                "can not open the file as archive",
                "is not archive",
            ],
        ),
    ];

    let combined = format!("{}{}", stdout, stderr).to_lowercase();
    BUCKETS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| combined.contains(n)))
        .map(|(reason, _)| *reason)
        .unwrap_or(FailedReason::Unknown)
}

/// One archive to extract.
#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub tool: &'a Path,
    pub archive_path: &'a Path,
    pub out_dir: &'a Path,
    pub overwrite: OverwriteMode,
    /// Ordered attempts; empty means one passwordless attempt.
    pub attempts: &'a [PasswordAttempt],
}

/// Result of running every attempt for one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    Success {
        /// Common-list position of the password that worked.
        password_index: Option<usize>,
        invocations: usize,
    },
    Failed {
        reason: FailedReason,
        detail: String,
        invocations: usize,
    },
}

/// Drives the password attempts for one archive through a [`CommandRunner`].
#[derive(Clone)]
pub struct Invoker {
    runner: Arc<dyn CommandRunner>,
}

impl Invoker {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Tries each attempt in order, stopping at the first success or the
    /// first failure that is not about the password.
    pub async fn extract(&self, request: &ExtractRequest<'_>, log: &JobLog) -> ExtractOutcome {
        let passwordless = [PasswordAttempt {
            password: String::new(),
            list_index: None,
        }];
        let attempts = if request.attempts.is_empty() {
            &passwordless[..]
        } else {
            request.attempts
        };

        let mut invocations = 0;
        for (n, attempt) in attempts.iter().enumerate() {
            let args = match build_extract_args(
                request.archive_path,
                request.out_dir,
                request.overwrite,
                Some(&attempt.password),
            ) {
                Ok(args) => args,
                Err(e) => {
                    log.line(format!("[Extract] ERROR: failed to build arguments: {}", e));
                    return ExtractOutcome::Failed {
                        reason: FailedReason::Unknown,
                        detail: format!("failed to build arguments: {}", e),
                        invocations,
                    };
                }
            };

            if attempts.len() > 1 {
                log.line(format!(
                    "[Extract] Attempt {}/{}{}",
                    n + 1,
                    attempts.len(),
                    if attempt.password.is_empty() {
                        " (no password)"
                    } else {
                        " (with password)"
                    }
                ));
            }
            log.line(format!("[Extract] 7z args: {}", display_args(&args)));

            invocations += 1;
            let output = self.runner.run(request.tool, &args, log).await;
            match classify(&output) {
                AttemptResult::Success => {
                    log.line(format!(
                        "[Extract] Successfully extracted{}",
                        if attempt.password.is_empty() {
                            ""
                        } else {
                            " (with password)"
                        }
                    ));
                    return ExtractOutcome::Success {
                        password_index: attempt.list_index,
                        invocations,
                    };
                }
                AttemptResult::PasswordFailure => {
                    log.line(format!("[Extract] Attempt {} failed: wrong password", n + 1));
                }
                AttemptResult::Fatal { reason, detail } => {
                    log.line(format!("[Extract] ERROR: {}", detail));
                    return ExtractOutcome::Failed {
                        reason,
                        detail,
                        invocations,
                    };
                }
            }
        }

        let reason = if request.attempts.is_empty() {
            FailedReason::PasswordRequired
        } else {
            FailedReason::PasswordWrong
        };
        let detail = format!(
            "All password attempts failed (tried {} password(s))",
            invocations
        );
        log.line(format!("[Extract] ERROR: {}", detail));
        ExtractOutcome::Failed {
            reason,
            detail,
            invocations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Replays canned outputs and records every argument vector.
    struct Scripted {
        outputs: Mutex<VecDeque<CommandOutput>>,
        calls: Mutex<Vec<Vec<OsString>>>,
    }

    impl Scripted {
        fn new(outputs: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for Scripted {
        async fn run(&self, _program: &Path, args: &[OsString], _log: &JobLog) -> CommandOutput {
            self.calls.lock().unwrap().push(args.to_vec());
            self.outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| CommandOutput::exited(0, "", ""))
        }
    }

    fn wrong_password() -> CommandOutput {
        CommandOutput::exited(2, "", "ERROR: Wrong password : a.txt")
    }

    fn attempts(passwords: &[&str]) -> Vec<PasswordAttempt> {
        passwords
            .iter()
            .enumerate()
            .map(|(i, p)| PasswordAttempt {
                password: p.to_string(),
                list_index: Some(i),
            })
            .collect()
    }

    async fn run(runner: Arc<Scripted>, attempts: &[PasswordAttempt]) -> ExtractOutcome {
        let log = JobLog::discard(Path::new("job.log"));
        let tool = PathBuf::from("/usr/bin/7z");
        Invoker::new(runner)
            .extract(
                &ExtractRequest {
                    tool: &tool,
                    archive_path: Path::new("/in/a.zip"),
                    out_dir: Path::new("/in/a"),
                    overwrite: OverwriteMode::SkipExisting,
                    attempts,
                },
                &log,
            )
            .await
    }

    #[test]
    fn test_classify_exit_codes() {
        assert_eq!(
            classify(&CommandOutput::exited(0, "Everything is Ok", "")),
            AttemptResult::Success
        );
        assert_eq!(classify(&wrong_password()), AttemptResult::PasswordFailure);
        assert_eq!(
            classify(&CommandOutput::exited(2, "", "ERROR: CRC Failed : x.bin")),
            AttemptResult::Fatal {
                reason: FailedReason::Corrupted,
                detail: "exited with code 2: ERROR: CRC Failed : x.bin".to_string(),
            }
        );
        assert_eq!(
            classify(&CommandOutput::exited(7, "", "")),
            AttemptResult::Fatal {
                reason: FailedReason::Unknown,
                detail: "exited with code 7".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_refines_reasons() {
        let reason = |stderr: &str| match classify(&CommandOutput::exited(2, "", stderr)) {
            AttemptResult::Fatal { reason, .. } => reason,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reason("Missing volume : a.7z.002"), FailedReason::VolumeMissing);
        assert_eq!(reason("E_FAIL: No space left on device"), FailedReason::DiskFull);
        assert_eq!(
            reason("can't open output file: Permission denied"),
            FailedReason::PermissionDenied
        );
        assert_eq!(reason("Unexpected end of archive"), FailedReason::Corrupted);
    }

    #[test]
    fn test_detail_truncates_stderr() {
        let long = "x".repeat(500);
        match classify(&CommandOutput::exited(1, "", long)) {
            AttemptResult::Fatal { detail, .. } => {
                assert_eq!(detail.len(), "exited with code 1: ".len() + DETAIL_STDERR_CHARS)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_spawn_failure_and_timeout() {
        let spawn = CommandOutput {
            status: RunStatus::SpawnFailed("No such file".into()),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(matches!(
            classify(&spawn),
            AttemptResult::Fatal {
                reason: FailedReason::Unknown,
                ..
            }
        ));
        let timeout = CommandOutput {
            status: RunStatus::TimedOut(Duration::from_secs(5)),
            ..spawn
        };
        match classify(&timeout) {
            AttemptResult::Fatal { detail, .. } => assert!(detail.contains("timed out after 5s")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_passwordless_single_attempt() {
        let runner = Scripted::new(vec![CommandOutput::exited(0, "Everything is Ok", "")]);
        let outcome = run(runner.clone(), &[]).await;
        assert_eq!(
            outcome,
            ExtractOutcome::Success {
                password_index: None,
                invocations: 1
            }
        );
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0], vec!["x", "/in/a.zip", "-o/in/a", "-aos", "-y"]);
    }

    #[tokio::test]
    async fn test_third_password_wins() {
        let runner = Scripted::new(vec![
            wrong_password(),
            wrong_password(),
            CommandOutput::exited(0, "Everything is Ok", ""),
        ]);
        let outcome = run(runner.clone(), &attempts(&["p1", "p2", "p3"])).await;
        assert_eq!(
            outcome,
            ExtractOutcome::Success {
                password_index: Some(2),
                invocations: 3
            }
        );
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[2].last().unwrap(), "-pp3");
    }

    #[tokio::test]
    async fn test_fatal_error_stops_attempts() {
        let runner = Scripted::new(vec![
            wrong_password(),
            CommandOutput::exited(2, "", "Headers Error"),
            CommandOutput::exited(0, "", ""),
        ]);
        let outcome = run(runner.clone(), &attempts(&["p1", "p2", "p3"])).await;
        assert!(matches!(
            outcome,
            ExtractOutcome::Failed {
                reason: FailedReason::Corrupted,
                invocations: 2,
                ..
            }
        ));
        assert_eq!(runner.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts() {
        let encrypted = Scripted::new(vec![wrong_password()]);
        assert_eq!(
            run(encrypted, &[]).await,
            ExtractOutcome::Failed {
                reason: FailedReason::PasswordRequired,
                detail: "All password attempts failed (tried 1 password(s))".to_string(),
                invocations: 1,
            }
        );

        let wrong = Scripted::new(vec![wrong_password(), wrong_password()]);
        assert!(matches!(
            run(wrong, &attempts(&["p1", "p2"])).await,
            ExtractOutcome::Failed {
                reason: FailedReason::PasswordWrong,
                invocations: 2,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::open(&dir.path().join("job.log")).unwrap();
        let runner = ProcessRunner::new(None);
        let args: Vec<OsString> = vec!["-c".into(), "echo out; echo err >&2; exit 3".into()];

        let output = runner.run(Path::new("/bin/sh"), &args, &log).await;
        assert_eq!(output.status, RunStatus::Exited(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");

        let logged = std::fs::read_to_string(log.path()).unwrap();
        assert!(logged.contains("out\n") && logged.contains("err\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_survives_non_utf8_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::open(&dir.path().join("job.log")).unwrap();
        let script = "printf 'Extracting \\377\\376name.txt\\n'; \
                      i=0; while [ $i -lt 20000 ]; do echo \"- file $i\"; i=$((i+1)); done; \
                      echo 'Everything is Ok'; exit 0";
        let args: Vec<OsString> = vec!["-c".into(), script.into()];

        let output = ProcessRunner::new(None)
            .run(Path::new("/bin/sh"), &args, &log)
            .await;
        assert_eq!(output.status, RunStatus::Exited(0));
        assert_eq!(classify(&output), AttemptResult::Success);
        assert!(output.stdout.starts_with("Extracting \u{FFFD}\u{FFFD}name.txt\n"));
        assert!(output.stdout.ends_with("Everything is Ok\n"));
        assert_eq!(output.stdout.lines().count(), 20002);

        let logged = std::fs::read_to_string(log.path()).unwrap();
        assert!(logged.contains("- file 19999"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_password_error_after_non_utf8_line_moves_to_next_password() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("7z");
        std::fs::write(
            &tool,
            "#!/bin/sh\n\
             for arg in \"$@\"; do case \"$arg\" in -p*) pw=\"${arg#-p}\" ;; esac; done\n\
             printf 'Extracting \\351t\\351.txt\\n'\n\
             if [ \"$pw\" != \"p2\" ]; then\n\
               printf 'ERROR: \\351t\\351.txt\\n' >&2\n\
               echo 'ERROR: Wrong password : \u{e9}t\u{e9}.txt' >&2\n\
               exit 2\n\
             fi\n\
             echo 'Everything is Ok'\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let log = JobLog::open(&dir.path().join("job.log")).unwrap();
        let attempts = attempts(&["p1", "p2"]);
        let outcome = Invoker::new(Arc::new(ProcessRunner::new(None)))
            .extract(
                &ExtractRequest {
                    tool: &tool,
                    archive_path: Path::new("/in/a.zip"),
                    out_dir: Path::new("/in/a"),
                    overwrite: OverwriteMode::SkipExisting,
                    attempts: &attempts,
                },
                &log,
            )
            .await;

        assert_eq!(
            outcome,
            ExtractOutcome::Success {
                password_index: Some(1),
                invocations: 2
            }
        );
        let logged = std::fs::read_to_string(log.path()).unwrap();
        assert!(logged.contains("Wrong password"));
        assert!(logged.contains("Attempt 1 failed: wrong password"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_kills_on_timeout() {
        let log = JobLog::discard(Path::new("job.log"));
        let runner = ProcessRunner::new(Some(Duration::from_millis(200)));
        let args: Vec<OsString> = vec!["-c".into(), "sleep 30".into()];

        let started = std::time::Instant::now();
        let output = runner.run(Path::new("/bin/sh"), &args, &log).await;
        assert_eq!(output.status, RunStatus::TimedOut(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_process_runner_reports_spawn_failure() {
        let log = JobLog::discard(Path::new("job.log"));
        let output = ProcessRunner::default()
            .run(Path::new("/definitely/not/here/7z"), &[], &log)
            .await;
        assert!(matches!(output.status, RunStatus::SpawnFailed(_)));
    }
}
