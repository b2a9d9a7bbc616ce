//! Ride execution: the per-segment protocol, sequential and
//! bounded-parallel variants (Section 4.6).

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::graph::Graph;
use crate::logger::{LogError, SegmentLogger};
use crate::types::{
    BodyError, ConditionFn, FailureKind, Ride, Segment, SegmentResult, SegmentStatus, SkipReason,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to open log file for segment '{segment}': {source}")]
    LogOpen {
        segment: String,
        #[source]
        source: LogError,
    },
    #[error("failed to persist artifact manifest: {0}")]
    ManifestPersist(#[from] crate::artifacts::ArtifactError),
}

/// Overall outcome of a ride run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideStatus {
    Success,
    Failure,
}

/// Full record of one ride run: every segment's terminal result plus the
/// ride-level verdict.
#[derive(Debug, Clone)]
pub struct RideReport {
    pub ride_name: String,
    pub results: BTreeMap<String, SegmentResult>,
    pub status: RideStatus,
}

impl RideReport {
    fn compute_status(results: &BTreeMap<String, SegmentResult>) -> RideStatus {
        if results.values().any(|r| r.status.is_failure_like()) {
            RideStatus::Failure
        } else {
            RideStatus::Success
        }
    }
}

/// Executes a `Ride` against its `Graph`, one execution level at a time,
/// with a semaphore bounding how many segments in a level run
/// concurrently. A level of size 1 (or `maxConcurrency`/`default_parallelism`
/// of 1) degenerates to strictly sequential execution — the sequential
/// and bounded-parallel variants of Section 4.6 share this one
/// implementation.
pub struct Scheduler {
    config: Config,
    workspace: PathBuf,
    artifacts: Arc<ArtifactStore>,
}

impl Scheduler {
    pub fn new(config: Config, workspace: PathBuf, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            config,
            workspace,
            artifacts,
        }
    }

    /// Run every segment in `graph` to completion, respecting `ride`'s
    /// environment overlay and concurrency, and return the full report.
    pub async fn run(&self, ride: &Ride, graph: &Graph) -> Result<RideReport, SchedulerError> {
        let results: Arc<Mutex<BTreeMap<String, SegmentResult>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let environment = Arc::new(ride.environment.clone());

        let effective_default = ride.max_concurrency.unwrap_or(self.config.default_parallelism).max(1);

        let mut fatal_failure_seen = false;

        for level in graph.levels() {
            if fatal_failure_seen {
                self.skip_level(level, &results, SkipReason::DependencyFailed);
                continue;
            }

            let permits = effective_default.min(level.len().max(1));
            let semaphore = Arc::new(Semaphore::new(permits));
            let mut handles = Vec::with_capacity(level.len());

            for name in level {
                let Some(segment) = graph.segment(name) else {
                    continue;
                };
                let depends_on = graph.depends_on(name).cloned().unwrap_or_default();

                // Eligibility (Section 4.6.1 step 1): resolve now, since every
                // dependency lives in a strictly earlier, already-completed level.
                if let Some(skip) = self.eligibility_skip(&depends_on, &results) {
                    results
                        .lock()
                        .expect("results poisoned")
                        .insert(name.clone(), SegmentResult::skipped(name, skip));
                    continue;
                }

                // Per-ride overrides (Section 4.5 step 2, Section 4.6.1 steps
                // 3 and 5b): an override's timeout/condition replaces the
                // segment's own, rather than layering on top of it.
                let override_ = ride.overrides.get(name);
                let effective_timeout = override_.and_then(|o| o.timeout).or(segment.timeout);
                let effective_condition = override_
                    .and_then(|o| o.condition.clone())
                    .or_else(|| segment.condition.clone());

                let segment = segment.clone();
                let semaphore = Arc::clone(&semaphore);
                let artifacts = Arc::clone(&self.artifacts);
                let environment = Arc::clone(&environment);
                let workspace = self.workspace.clone();
                let ride_name = ride.name.clone();
                let log_root = self.config.log_root.clone();
                let verbosity = self.config.console_verbosity;
                let results = Arc::clone(&results);
                let name = name.clone();

                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    let outcome = run_segment(
                        &segment,
                        effective_timeout,
                        effective_condition,
                        &workspace,
                        &ride_name,
                        &log_root,
                        verbosity,
                        artifacts,
                        environment,
                    )
                    .await;
                    match outcome {
                        Ok(result) => {
                            results.lock().expect("results poisoned").insert(name, result);
                        }
                        Err(source) => {
                            results.lock().expect("results poisoned").insert(
                                name.clone(),
                                SegmentResult {
                                    segment_name: name,
                                    status: SegmentStatus::Failure {
                                        error: FailureKind::UserError {
                                            message: format!("failed to open segment log: {source}"),
                                        },
                                    },
                                    started_at: None,
                                    ended_at: None,
                                    attempts: 0,
                                    outputs_captured: Vec::new(),
                                },
                            );
                        }
                    }
                });
                handles.push(handle);
            }

            for handle in handles {
                let _ = handle.await;
            }

            let level_failed = level.iter().any(|name| {
                results
                    .lock()
                    .expect("results poisoned")
                    .get(name)
                    .is_some_and(|r| r.status.is_failure_like())
            });
            if level_failed {
                fatal_failure_seen = true;
            }
        }

        self.artifacts.save_manifest()?;

        let results = Arc::try_unwrap(results)
            .map(|m| m.into_inner().expect("results poisoned"))
            .unwrap_or_else(|arc| arc.lock().expect("results poisoned").clone());
        let status = RideReport::compute_status(&results);

        // Ride-level hooks (Section 5: onComplete fires after every segment
        // has reached a terminal state and after the manifest has been
        // persisted).
        self.run_ride_hooks(ride, status, &environment)?;

        Ok(RideReport {
            ride_name: ride.name.clone(),
            results,
            status,
        })
    }

    fn run_ride_hooks(
        &self,
        ride: &Ride,
        status: RideStatus,
        environment: &Arc<BTreeMap<String, String>>,
    ) -> Result<(), SchedulerError> {
        if ride.on_success.is_none() && ride.on_failure.is_none() && ride.on_complete.is_none() {
            return Ok(());
        }

        let logger = Arc::new(
            SegmentLogger::open(&self.config.log_root, "_ride", self.config.console_verbosity)
                .map_err(|source| SchedulerError::LogOpen {
                    segment: ride.name.clone(),
                    source,
                })?,
        );
        let ctx = ExecutionContext::new(
            self.workspace.clone(),
            ride.name.clone(),
            ride.name.clone(),
            logger,
            Arc::clone(&self.artifacts),
            Arc::clone(environment),
            None,
        );
        let ride_result = SegmentResult {
            segment_name: ride.name.clone(),
            status: match status {
                RideStatus::Success => SegmentStatus::Success,
                RideStatus::Failure => SegmentStatus::Failure {
                    error: FailureKind::UserError {
                        message: "one or more segments did not succeed".to_string(),
                    },
                },
            },
            started_at: None,
            ended_at: None,
            attempts: 0,
            outputs_captured: Vec::new(),
        };

        match status {
            RideStatus::Success => invoke_hook(&ride.on_success, &ctx, &ride_result, "ride onSuccess"),
            RideStatus::Failure => invoke_hook(&ride.on_failure, &ctx, &ride_result, "ride onFailure"),
        }
        invoke_hook(&ride.on_complete, &ctx, &ride_result, "ride onComplete");
        Ok(())
    }

    fn eligibility_skip(
        &self,
        depends_on: &std::collections::BTreeSet<String>,
        results: &Arc<Mutex<BTreeMap<String, SegmentResult>>>,
    ) -> Option<SkipReason> {
        let results = results.lock().expect("results poisoned");
        let mut any_skipped = false;
        for dep in depends_on {
            match results.get(dep).map(|r| &r.status) {
                Some(SegmentStatus::Failure { .. } | SegmentStatus::Timeout) => {
                    return Some(SkipReason::DependencyFailed);
                }
                Some(SegmentStatus::Skipped {
                    reason: SkipReason::DependencyFailed | SkipReason::DependencySkipped,
                }) => any_skipped = true,
                _ => {}
            }
        }
        any_skipped.then_some(SkipReason::DependencySkipped)
    }

    /// Mark every segment in `level` as skipped due to an earlier fatal
    /// failure (Section 4.6.3: once a level fails, all remaining levels
    /// are skipped wholesale rather than re-checked segment by segment).
    fn skip_level(
        &self,
        level: &[String],
        results: &Arc<Mutex<BTreeMap<String, SegmentResult>>>,
        reason: SkipReason,
    ) {
        let mut results = results.lock().expect("results poisoned");
        for name in level {
            results
                .entry(name.clone())
                .or_insert_with(|| SegmentResult::skipped(name, reason));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_segment(
    segment: &Segment,
    effective_timeout: Option<Duration>,
    effective_condition: Option<ConditionFn>,
    workspace: &std::path::Path,
    ride_name: &str,
    log_root: &std::path::Path,
    verbosity: crate::config::Verbosity,
    artifacts: Arc<ArtifactStore>,
    environment: Arc<BTreeMap<String, String>>,
) -> Result<SegmentResult, LogError> {
    let logger = Arc::new(SegmentLogger::open(log_root, &segment.name, verbosity)?);
    let ctx = ExecutionContext::new(
        workspace.to_path_buf(),
        ride_name,
        segment.name.clone(),
        Arc::clone(&logger),
        Arc::clone(&artifacts),
        environment,
        effective_timeout,
    );

    // Condition (Section 4.6.1 step 2). A per-ride override replaces the
    // segment's own condition rather than layering on top of it.
    if let Some(condition) = effective_condition {
        let ctx_for_condition = ctx.clone();
        let passed = tokio::task::block_in_place(|| condition(&ctx_for_condition));
        if !passed {
            logger.info("condition evaluated to false, skipping");
            return Ok(SegmentResult::skipped(&segment.name, SkipReason::ConditionFalse));
        }
    }

    // Input check (Section 4.6.1 step 3).
    for input in &segment.declared_inputs {
        if !artifacts.has(input) {
            let error = FailureKind::MissingInput {
                name: input.clone(),
            };
            logger.error(format!("missing required input artifact '{input}'"));
            return Ok(SegmentResult {
                segment_name: segment.name.clone(),
                status: SegmentStatus::Failure { error },
                started_at: Some(Utc::now()),
                ended_at: Some(Utc::now()),
                attempts: 0,
                outputs_captured: Vec::new(),
            });
        }
    }

    let started_at = Utc::now();
    let attempt_start = Instant::now();
    let max_attempts = segment.max_retries + 1;
    let mut attempts = 0u32;
    let mut last_error: Option<BodyError> = None;
    let mut timed_out = false;

    loop {
        attempts += 1;
        timed_out = false;
        let attempt_result = run_attempt(segment, &ctx, effective_timeout).await;

        match attempt_result {
            AttemptOutcome::Success => {
                last_error = None;
                break;
            }
            AttemptOutcome::Timeout => {
                timed_out = true;
                last_error = None;
            }
            AttemptOutcome::Failed(err) => {
                last_error = Some(err);
            }
        }

        let retryable = if timed_out {
            segment.retry_on.is_empty() || segment.retry_on.contains("Timeout")
        } else if let Some(err) = &last_error {
            segment.retry_on.is_empty() || segment.retry_on.contains(err.kind_tag())
        } else {
            false
        };

        if attempts >= max_attempts || !retryable {
            break;
        }

        logger.warn(format!(
            "attempt {attempts}/{max_attempts} failed, retrying in {:?}",
            segment.retry_delay
        ));
        tokio::time::sleep(segment.retry_delay).await;
    }

    let ended_at = Utc::now();
    let duration_ms = (attempt_start.elapsed().as_millis()) as i64;

    let status = if timed_out {
        SegmentStatus::Timeout
    } else if let Some(err) = &last_error {
        SegmentStatus::Failure {
            error: body_error_to_failure_kind(err),
        }
    } else {
        SegmentStatus::Success
    };

    // Output capture (Section 4.6.1 step 5), only on success.
    let mut outputs_captured = Vec::new();
    let mut final_status = status.clone();
    if matches!(status, SegmentStatus::Success) {
        for (artifact_name, path) in &segment.declared_outputs {
            let absolute = workspace.join(path);
            match artifacts.put(artifact_name, &absolute) {
                Ok(_) => outputs_captured.push(artifact_name.clone()),
                Err(_) => {
                    logger.error(format!(
                        "declared output '{artifact_name}' not found at '{path}'"
                    ));
                    final_status = SegmentStatus::Failure {
                        error: FailureKind::MissingOutput {
                            name: artifact_name.clone(),
                        },
                    };
                    break;
                }
            }
        }
    }

    logger.log_completion(&final_status, duration_ms);

    let result = SegmentResult {
        segment_name: segment.name.clone(),
        status: final_status,
        started_at: Some(started_at),
        ended_at: Some(ended_at),
        attempts,
        outputs_captured,
    };

    run_hooks(segment, &ctx, &result);

    Ok(result)
}

enum AttemptOutcome {
    Success,
    Timeout,
    Failed(BodyError),
}

async fn run_attempt(
    segment: &Segment,
    ctx: &ExecutionContext,
    timeout: Option<Duration>,
) -> AttemptOutcome {
    let body = Arc::clone(&segment.body);
    let ctx_owned = ctx.clone();
    let call = tokio::task::spawn(async move {
        tokio::task::block_in_place(|| (body)(&ctx_owned))
    });

    let joined = match timeout {
        Some(duration) => match tokio::time::timeout(duration, call).await {
            Ok(joined) => joined,
            Err(_) => return AttemptOutcome::Timeout,
        },
        None => call.await,
    };

    match joined {
        Ok(Ok(())) => AttemptOutcome::Success,
        Ok(Err(err)) => AttemptOutcome::Failed(err),
        Err(join_err) => AttemptOutcome::Failed(BodyError::user(format!(
            "segment task panicked: {join_err}"
        ))),
    }
}

fn body_error_to_failure_kind(err: &BodyError) -> FailureKind {
    match err {
        BodyError::Command(crate::runner::RunnerFailureKind::NonZeroExit { code, .. }) => {
            FailureKind::CommandNonZeroExit { code: *code }
        }
        BodyError::Command(crate::runner::RunnerFailureKind::Timeout) => {
            FailureKind::UserError {
                message: "command timed out".to_string(),
            }
        }
        BodyError::Command(crate::runner::RunnerFailureKind::LaunchFailure { .. }) => {
            FailureKind::CommandLaunchFailure
        }
        BodyError::User { message, .. } => FailureKind::UserError {
            message: message.clone(),
        },
    }
}

fn run_hooks(segment: &Segment, ctx: &ExecutionContext, result: &SegmentResult) {
    let succeeded = matches!(result.status, SegmentStatus::Success);
    if succeeded {
        invoke_hook(&segment.on_success, ctx, result, "onSuccess");
    } else if result.status.is_failure_like() {
        invoke_hook(&segment.on_failure, ctx, result, "onFailure");
    }
    invoke_hook(&segment.on_complete, ctx, result, "onComplete");
}

fn invoke_hook(
    hook: &Option<crate::types::HookFn>,
    ctx: &ExecutionContext,
    result: &SegmentResult,
    label: &str,
) {
    let Some(hook) = hook else { return };
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| hook(ctx, result)));
    if outcome.is_err() {
        ctx.logger.error(format!("{label} hook panicked"));
    }
}
