//! External tool execution with deadlines, cancellation and reaping.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::{CancelToken, Deadline};
use crate::error::ToolError;

/// One external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    /// Stage that issued the command, for logs and call accounting.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a tool that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external tools. Swapped for a recording fake in tests.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `command`, giving up after `timeout` or when `cancel` fires.
    async fn run(
        &self,
        command: &ToolCommand,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, ToolError>;
}

/// Real subprocess runner.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// How long a cancelled tool may keep running before it is killed.
    pub grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
        }
    }
}

impl ProcessRunner {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

fn collect<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// SIGKILL the tool's process group so helpers it started (`cc1`, `as`)
/// die with it.
#[cfg(unix)]
fn kill_group(group: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = group.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        debug!(pgid, error = %e, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

/// Kill the whole group, then reap the direct child.
async fn terminate(child: &mut Child, group: Option<u32>) {
    kill_group(group);
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed; child already exited");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap child process");
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        command: &ToolCommand,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The tool leads a fresh process group.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        debug!(stage = %command.label, command = %command.display(), "spawning tool");
        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound {
                    program: command.program.clone(),
                }
            } else {
                ToolError::Io {
                    program: command.program.clone(),
                    source,
                }
            }
        })?;
        let group = child.id();

        let mut stdout = collect(child.stdout.take());
        let mut stderr = collect(child.stderr.take());

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let waited = match waited {
            Waited::Cancelled => {
                // Let the tool finish on its own within the grace period.
                let grace = self.grace.min(timeout.saturating_sub(start.elapsed()));
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => Waited::Exited(status),
                    Err(_) => Waited::Cancelled,
                }
            }
            other => other,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match waited {
            Waited::Exited(Ok(status)) => {
                // A background helper may still hold the pipes open; the
                // drain shares the tool's deadline.
                let remaining = timeout.saturating_sub(start.elapsed());
                let drained = tokio::time::timeout(remaining, async {
                    ((&mut stdout).await, (&mut stderr).await)
                })
                .await;
                match drained {
                    Ok((out, err)) => Ok(ToolOutput {
                        exit_code: status.code(),
                        stdout: String::from_utf8_lossy(&out.unwrap_or_default()).into_owned(),
                        stderr: String::from_utf8_lossy(&err.unwrap_or_default()).into_owned(),
                        duration_ms: elapsed_ms,
                    }),
                    Err(_) => {
                        kill_group(group);
                        stdout.abort();
                        stderr.abort();
                        let elapsed_ms = start.elapsed().as_millis() as u64;
                        warn!(
                            stage = %command.label,
                            program = %command.program,
                            elapsed_ms,
                            "tool output still open at deadline"
                        );
                        Err(ToolError::Timeout {
                            program: command.program.clone(),
                            elapsed_ms,
                        })
                    }
                }
            }
            Waited::Exited(Err(source)) => {
                terminate(&mut child, group).await;
                stdout.abort();
                stderr.abort();
                Err(ToolError::Io {
                    program: command.program.clone(),
                    source,
                })
            }
            Waited::TimedOut => {
                terminate(&mut child, group).await;
                stdout.abort();
                stderr.abort();
                warn!(stage = %command.label, program = %command.program, elapsed_ms, "tool timed out");
                Err(ToolError::Timeout {
                    program: command.program.clone(),
                    elapsed_ms,
                })
            }
            Waited::Cancelled => {
                terminate(&mut child, group).await;
                stdout.abort();
                stderr.abort();
                Err(ToolError::Cancelled {
                    program: command.program.clone(),
                })
            }
        }
    }
}

/// Bounded retry for infrastructure failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first (0 = run once).
    pub retry_limit: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base: Duration,
    /// Cap on a single attempt; the stage deadline always applies.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 1,
            backoff_base: Duration::from_millis(250),
            attempt_timeout: None,
        }
    }
}

/// Outcome of a possibly retried tool invocation.
#[derive(Debug)]
pub struct ToolAttempt {
    pub result: Result<ToolOutput, ToolError>,
    pub attempts: u32,
}

/// Run `command` under `deadline`, retrying `ToolNotFound`/timeout failures
/// while the policy and the remaining budget allow it. Code-quality failures
/// (a tool that ran and reported errors) are returned as-is.
pub async fn run_with_retry(
    runner: &dyn ToolRunner,
    command: &ToolCommand,
    deadline: &Deadline,
    policy: &RetryPolicy,
) -> ToolAttempt {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return ToolAttempt {
                result: Err(ToolError::Timeout {
                    program: command.program.clone(),
                    elapsed_ms: 0,
                }),
                attempts: attempt - 1,
            };
        }
        let timeout = policy
            .attempt_timeout
            .map_or(remaining, |cap| cap.min(remaining));

        let result = runner.run(command, timeout, deadline.cancel()).await;
        let retry = match &result {
            Err(e) if e.is_retryable() && attempt <= policy.retry_limit => {
                let backoff = policy.backoff_base * 2u32.saturating_pow(attempt - 1);
                // Only retry when the stage budget leaves room for it.
                deadline.remaining() > backoff
            }
            _ => false,
        };
        if !retry {
            return ToolAttempt {
                result,
                attempts: attempt,
            };
        }

        let backoff = policy.backoff_base * 2u32.saturating_pow(attempt - 1);
        if let Err(e) = &result {
            warn!(stage = %command.label, error = %e, attempt, "retrying tool invocation");
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = deadline.cancel().cancelled() => {
                return ToolAttempt {
                    result: Err(ToolError::Cancelled { program: command.program.clone() }),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyRunner {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ToolRunner for FlakyRunner {
        async fn run(
            &self,
            command: &ToolCommand,
            _timeout: Duration,
            _cancel: &CancelToken,
        ) -> Result<ToolOutput, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(ToolError::NotFound {
                    program: command.program.clone(),
                })
            } else {
                Ok(ToolOutput {
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: 1,
                })
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            retry_limit: 1,
            backoff_base: Duration::from_millis(1),
            attempt_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_not_found() {
        let runner = FlakyRunner {
            calls: AtomicU32::new(0),
            fail_first: 1,
        };
        let deadline = Deadline::after(Duration::from_secs(5), CancelToken::never());
        let attempt =
            run_with_retry(&runner, &ToolCommand::new("syntax", "cc"), &deadline, &policy()).await;
        assert!(attempt.result.is_ok());
        assert_eq!(attempt.attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let runner = FlakyRunner {
            calls: AtomicU32::new(0),
            fail_first: 10,
        };
        let deadline = Deadline::after(Duration::from_secs(5), CancelToken::never());
        let attempt =
            run_with_retry(&runner, &ToolCommand::new("syntax", "cc"), &deadline, &policy()).await;
        assert!(matches!(attempt.result, Err(ToolError::NotFound { .. })));
        assert_eq!(attempt.attempts, 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_without_budget() {
        let runner = FlakyRunner {
            calls: AtomicU32::new(0),
            fail_first: 10,
        };
        let mut slow = policy();
        slow.backoff_base = Duration::from_secs(60);
        let deadline = Deadline::after(Duration::from_secs(1), CancelToken::never());
        let attempt =
            run_with_retry(&runner, &ToolCommand::new("syntax", "cc"), &deadline, &slow).await;
        assert_eq!(attempt.attempts, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let runner = ProcessRunner::default();
        let cmd = ToolCommand::new("test", "sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = runner
            .run(&cmd, Duration::from_secs(10), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_missing_program() {
        let runner = ProcessRunner::default();
        let cmd = ToolCommand::new("test", "/nonexistent/periphgen-cc");
        let err = runner
            .run(&cmd, Duration::from_secs(1), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_timeout_kills_child() {
        let runner = ProcessRunner::default();
        let cmd = ToolCommand::new("test", "sleep").arg("30");
        let start = std::time::Instant::now();
        let err = runner
            .run(&cmd, Duration::from_millis(200), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_process_runner_timeout_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("helper.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pidfile.display());
        let cmd = ToolCommand::new("test", "sh").args(["-c".to_string(), script]);
        let err = ProcessRunner::default()
            .run(&cmd, Duration::from_millis(300), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));

        let pid = std::fs::read_to_string(&pidfile).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        // The orphan is reparented and reaped asynchronously; a zombie counts as dead.
        let gone = || match std::fs::read_to_string(&stat) {
            Err(_) => true,
            Ok(line) => line
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        };
        let start = std::time::Instant::now();
        while !gone() && start.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone(), "helper process {} survived the timeout", pid.trim());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_bounds_output_held_by_background_job() {
        let cmd = ToolCommand::new("test", "sh").args(["-c", "(sleep 5) & exit 0"]);
        let start = std::time::Instant::now();
        let err = ProcessRunner::default()
            .run(&cmd, Duration::from_millis(500), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_cancel_after_grace() {
        let runner = ProcessRunner::new(Duration::from_millis(100));
        let (handle, token) = CancelHandle::new();
        let cmd = ToolCommand::new("test", "sleep").arg("30");
        let start = std::time::Instant::now();
        let task = tokio::spawn(async move {
            runner.run(&cmd, Duration::from_secs(30), &token).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_cancel_lets_quick_tool_finish() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let (handle, token) = CancelHandle::new();
        handle.cancel();
        let cmd = ToolCommand::new("test", "sh").args(["-c", "sleep 0.1; echo done"]);
        let output = runner
            .run(&cmd, Duration::from_secs(10), &token)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "done");
    }
}
