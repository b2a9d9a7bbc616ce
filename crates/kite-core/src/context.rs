//! `ExecutionContext`: what a segment body sees (Section 4.6.4).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::artifacts::ArtifactStore;
use crate::logger::SegmentLogger;
use crate::runner::{ProcessRunner, RunSpec};
use crate::secrets;
use crate::types::BodyError;

/// Snapshot handed to a segment body, condition, or hook. Exposes the
/// workspace, the bound artifact store/logger, secret-aware environment
/// accessors, and process execution delegating to `ProcessRunner` with
/// this segment's logger and the ride's environment overlay.
///
/// Owns (via `Arc`) rather than borrows its collaborators so the
/// scheduler can move a context into a spawned task and run segments in
/// the same level concurrently.
#[derive(Clone)]
pub struct ExecutionContext {
    pub workspace: PathBuf,
    pub ride_name: String,
    pub segment_name: String,
    pub logger: Arc<SegmentLogger>,
    pub artifacts: Arc<ArtifactStore>,
    pub environment: Arc<BTreeMap<String, String>>,
    pub timeout: Option<Duration>,
}

impl ExecutionContext {
    pub fn new(
        workspace: PathBuf,
        ride_name: impl Into<String>,
        segment_name: impl Into<String>,
        logger: Arc<SegmentLogger>,
        artifacts: Arc<ArtifactStore>,
        environment: Arc<BTreeMap<String, String>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            workspace,
            ride_name: ride_name.into(),
            segment_name: segment_name.into(),
            logger,
            artifacts,
            environment,
            timeout,
        }
    }

    /// Read a variable from the ride's environment overlay, falling back
    /// to the process environment.
    pub fn env(&self, name: &str) -> Option<String> {
        self.environment
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    pub fn env_or_default(&self, name: &str, default: impl Into<String>) -> String {
        self.env(name).unwrap_or_else(|| default.into())
    }

    pub fn require_env(&self, name: &str) -> Result<String, BodyError> {
        self.env(name)
            .ok_or_else(|| BodyError::user(format!("required environment variable '{name}' is not set")))
    }

    /// Read `name` and, if non-empty, register its value with the
    /// process-wide `SecretRegistry` using the variable name as hint
    /// before returning it.
    pub fn secret(&self, name: &str) -> Option<String> {
        let value = self.env(name)?;
        if !value.is_empty() {
            secrets::register(&value, Some(name));
        }
        Some(value)
    }

    pub fn require_secret(&self, name: &str) -> Result<String, BodyError> {
        let value = self.require_env(name)?;
        if !value.is_empty() {
            secrets::register(&value, Some(name));
        }
        Ok(value)
    }

    /// Run `program` with `args` (no shell), using this segment's
    /// timeout and the ride's environment overlay.
    pub fn exec(&self, program: &str, args: &[&str]) -> Result<String, BodyError> {
        self.run_spec(RunSpec::new(
            program,
            args.iter().map(|s| (*s).to_string()).collect(),
            self.workspace.clone(),
        ))
    }

    /// Run a single shell command string via a platform shell.
    pub fn shell(&self, command: &str) -> Result<String, BodyError> {
        self.run_spec(RunSpec::shell(command, self.workspace.clone()))
    }

    fn run_spec(&self, spec: RunSpec) -> Result<String, BodyError> {
        let spec = spec
            .with_env_overlay((*self.environment).clone())
            .with_timeout(self.timeout);
        let runner = ProcessRunner::new(&self.logger);
        // ExecutionContext is synchronous from the body's point of view
        // (Section 4.6.4 describes plain function calls); bridge into the
        // scheduler's async runtime with `block_in_place` so the body
        // doesn't need to be async itself.
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(runner.run(&spec))
        })
        .map_err(BodyError::Command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verbosity;
    use tempfile::TempDir;

    fn context(
        workspace: &Path,
        logger: SegmentLogger,
        artifacts: ArtifactStore,
        environment: BTreeMap<String, String>,
    ) -> ExecutionContext {
        ExecutionContext::new(
            workspace.to_path_buf(),
            "ride",
            "segment",
            Arc::new(logger),
            Arc::new(artifacts),
            Arc::new(environment),
            None,
        )
    }

    #[tokio::test]
    async fn env_falls_back_to_process_environment() {
        let dir = TempDir::new().unwrap();
        let logger = SegmentLogger::open(dir.path(), "seg", Verbosity::Quiet).unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
        std::env::set_var("KITE_CTX_TEST", "from-process");
        let ctx = context(dir.path(), logger, artifacts, BTreeMap::new());
        assert_eq!(ctx.env("KITE_CTX_TEST").as_deref(), Some("from-process"));
        std::env::remove_var("KITE_CTX_TEST");
    }

    #[tokio::test]
    async fn ride_environment_overrides_process_environment() {
        let dir = TempDir::new().unwrap();
        let logger = SegmentLogger::open(dir.path(), "seg", Verbosity::Quiet).unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
        let mut environment = BTreeMap::new();
        environment.insert("KITE_CTX_TEST2".to_string(), "from-ride".to_string());
        let ctx = context(dir.path(), logger, artifacts, environment);
        assert_eq!(ctx.env("KITE_CTX_TEST2").as_deref(), Some("from-ride"));
    }

    #[tokio::test]
    async fn require_env_fails_when_missing() {
        let dir = TempDir::new().unwrap();
        let logger = SegmentLogger::open(dir.path(), "seg", Verbosity::Quiet).unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
        let ctx = context(dir.path(), logger, artifacts, BTreeMap::new());
        assert!(ctx.require_env("KITE_DEFINITELY_UNSET").is_err());
    }

    #[tokio::test]
    async fn secret_registers_value_with_variable_name_as_hint() {
        crate::secrets::reset();
        let dir = TempDir::new().unwrap();
        let logger = SegmentLogger::open(dir.path(), "seg", Verbosity::Quiet).unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
        let mut environment = BTreeMap::new();
        environment.insert("API_KEY".to_string(), "sk-abcd1234".to_string());
        let ctx = context(dir.path(), logger, artifacts, environment);
        let value = ctx.secret("API_KEY").unwrap();
        assert_eq!(value, "sk-abcd1234");
        assert_eq!(crate::secrets::mask("sk-abcd1234"), "[API_KEY:***]");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exec_runs_program_and_returns_stdout() {
        let dir = TempDir::new().unwrap();
        let logger = SegmentLogger::open(dir.path(), "seg", Verbosity::Quiet).unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
        let ctx = context(dir.path(), logger, artifacts, BTreeMap::new());
        let out = ctx.exec("echo", &["hi"]).unwrap();
        assert_eq!(out, "hi");
    }
}
