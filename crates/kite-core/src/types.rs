//! Core data model for segments, rides, and their execution results.
//!
//! Shapes mirror Section 3 of the system design: a `Ride` composes
//! `Segment`s through a `FlowNode` tree, but the executable schedule is
//! always determined by `dependsOn` (see `graph`), never by flow shape.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::runner::RunnerFailureKind;

/// Unique identifier for rides and segment results.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A user-supplied body function: receives a snapshot context, may fail.
pub type SegmentBody = Arc<dyn Fn(&ExecutionContext) -> BodyResult + Send + Sync>;

/// A condition predicate over an execution context snapshot.
pub type ConditionFn = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

/// A lifecycle hook invoked at fixed protocol points. Errors are caught
/// and logged; they never change the status of what they observe.
pub type HookFn = Arc<dyn Fn(&ExecutionContext, &SegmentResult) + Send + Sync>;

/// Result of running a segment body.
pub type BodyResult = Result<(), BodyError>;

/// An error a segment body can raise. Distinct from `RunnerFailureKind`,
/// which classifies `ProcessRunner` outcomes specifically.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BodyError {
    #[error("command failed: {0}")]
    Command(#[from] RunnerFailureKind),
    #[error("{message}")]
    User {
        message: String,
        #[source]
        cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },
}

impl BodyError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User {
            message: message.into(),
            cause: None,
        }
    }

    /// The retry-eligibility tag for this error kind, matched against a
    /// segment's `retryOn` set.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::Command(RunnerFailureKind::NonZeroExit { .. }) => "NonZeroExit",
            Self::Command(RunnerFailureKind::Timeout) => "Timeout",
            Self::Command(RunnerFailureKind::LaunchFailure { .. }) => "LaunchFailure",
            Self::User { .. } => "UserError",
        }
    }
}

/// Per-ride adjustment to a segment's declared configuration.
#[derive(Debug, Clone, Default)]
pub struct SegmentOverride {
    pub timeout: Option<Duration>,
    pub extra_depends_on: BTreeSet<String>,
    pub condition: Option<ConditionFn>,
    pub enabled: bool,
}

impl SegmentOverride {
    pub fn new() -> Self {
        Self {
            timeout: None,
            extra_depends_on: BTreeSet::new(),
            condition: None,
            enabled: true,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }
}

/// A named unit of work.
#[derive(Clone)]
pub struct Segment {
    pub name: String,
    pub description: Option<String>,
    pub depends_on: BTreeSet<String>,
    pub condition: Option<ConditionFn>,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_on: BTreeSet<String>,
    pub declared_inputs: BTreeSet<String>,
    pub declared_outputs: Vec<(String, String)>,
    pub body: SegmentBody,
    pub on_success: Option<HookFn>,
    pub on_failure: Option<HookFn>,
    pub on_complete: Option<HookFn>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("max_retries", &self.max_retries)
            .field("declared_inputs", &self.declared_inputs)
            .field("declared_outputs", &self.declared_outputs)
            .finish_non_exhaustive()
    }
}

impl Segment {
    /// Start building a segment with a name and body; all other fields
    /// take spec-mandated defaults (`maxRetries = 0`, `retryDelay = 0`,
    /// no timeout, no dependencies).
    pub fn new(name: impl Into<String>, body: SegmentBody) -> Self {
        Self {
            name: name.into(),
            description: None,
            depends_on: BTreeSet::new(),
            condition: None,
            timeout: None,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            retry_on: BTreeSet::new(),
            declared_inputs: BTreeSet::new(),
            declared_outputs: Vec::new(),
            body,
            on_success: None,
            on_failure: None,
            on_complete: None,
        }
    }
}

/// Tagged flow tree: the authored shape of a ride. Advisory only — the
/// executable schedule is fully determined by `dependsOn` (see `graph`).
#[derive(Debug, Clone)]
pub enum FlowNode {
    Sequence(Vec<FlowNode>),
    Parallel(Vec<FlowNode>),
    Ref(String),
}

impl FlowNode {
    /// Collect every segment name referenced anywhere in this tree.
    pub fn referenced_names(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Sequence(children) | Self::Parallel(children) => {
                for child in children {
                    child.referenced_names(out);
                }
            }
            Self::Ref(name) => {
                out.insert(name.clone());
            }
        }
    }
}

/// A named composition of segments.
#[derive(Clone)]
pub struct Ride {
    pub name: String,
    pub flow: FlowNode,
    pub environment: BTreeMap<String, String>,
    pub max_concurrency: Option<usize>,
    pub on_success: Option<HookFn>,
    pub on_failure: Option<HookFn>,
    pub on_complete: Option<HookFn>,
    pub overrides: BTreeMap<String, SegmentOverride>,
}

impl std::fmt::Debug for Ride {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ride")
            .field("name", &self.name)
            .field("flow", &self.flow)
            .field("environment", &self.environment)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl Ride {
    pub fn new(name: impl Into<String>, flow: FlowNode) -> Self {
        Self {
            name: name.into(),
            flow,
            environment: BTreeMap::new(),
            max_concurrency: None,
            on_success: None,
            on_failure: None,
            on_complete: None,
            overrides: BTreeMap::new(),
        }
    }
}

/// Reason a segment was skipped rather than executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ConditionFalse,
    DependencyFailed,
    DependencySkipped,
    Disabled,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConditionFalse => "condition_false",
            Self::DependencyFailed => "dependency_failed",
            Self::DependencySkipped => "dependency_skipped",
            Self::Disabled => "disabled",
        }
    }
}

/// Classification of a failed attempt or terminal segment status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CommandNonZeroExit { code: i32 },
    CommandLaunchFailure,
    MissingInput { name: String },
    MissingOutput { name: String },
    UserError { message: String },
}

impl FailureKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::CommandNonZeroExit { .. } => "NonZeroExit",
            Self::CommandLaunchFailure => "LaunchFailure",
            Self::MissingInput { .. } => "MissingInput",
            Self::MissingOutput { .. } => "MissingOutput",
            Self::UserError { .. } => "UserError",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommandNonZeroExit { code } => write!(f, "command exited with code {code}"),
            Self::CommandLaunchFailure => write!(f, "command failed to launch"),
            Self::MissingInput { name } => write!(f, "missing input artifact '{name}'"),
            Self::MissingOutput { name } => write!(f, "missing output artifact '{name}'"),
            Self::UserError { message } => write!(f, "{message}"),
        }
    }
}

/// Tagged terminal/in-flight status of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Running,
    Success,
    Failure { error: FailureKind },
    Skipped { reason: SkipReason },
    Timeout,
}

impl SegmentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_failure_like(&self) -> bool {
        matches!(self, Self::Failure { .. } | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure { .. } => "failure",
            Self::Skipped { .. } => "skipped",
            Self::Timeout => "timeout",
        }
    }
}

/// Outcome of one segment's participation in a ride.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentResult {
    pub segment_name: String,
    pub status: SegmentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// At least 1 unless the segment was skipped.
    pub attempts: u32,
    pub outputs_captured: Vec<String>,
}

impl SegmentResult {
    pub fn skipped(segment_name: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            segment_name: segment_name.into(),
            status: SegmentStatus::Skipped { reason },
            started_at: None,
            ended_at: None,
            attempts: 0,
            outputs_captured: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
