//! Reference loader: parses a `kite.yaml` workspace file into the core
//! `Segment`/`Ride` types (Section 1B).
//!
//! `kite-core` has no notion of a file format — segment bodies are plain
//! Rust closures. This loader is the one concrete way this binary builds
//! those closures: every YAML segment's `run` field becomes a body that
//! shells out via `ExecutionContext::shell`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kite_core::{FlowNode, Ride, Segment};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("ride '{0}' not found in kite.yaml")]
    UnknownRide(String),
    #[error("segment '{0}' not found in kite.yaml")]
    UnknownSegment(String),
    #[error("flow entry '{0}' is a bare string list only; nested groups must use 'sequence' or 'parallel'")]
    InvalidFlowEntry(String),
}

#[derive(Debug, Deserialize)]
struct YamlFile {
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    segments: BTreeMap<String, YamlSegment>,
    #[serde(default)]
    rides: BTreeMap<String, YamlRide>,
}

#[derive(Debug, Deserialize)]
struct YamlSegment {
    run: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    depends_on: BTreeSet<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    max_retries: u32,
    #[serde(default)]
    retry_delay_secs: u64,
    #[serde(default)]
    retry_on: BTreeSet<String>,
    #[serde(default)]
    inputs: BTreeSet<String>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct YamlRide {
    flow: Vec<YamlFlowEntry>,
    #[serde(default)]
    max_concurrency: Option<usize>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum YamlFlowEntry {
    Ref(String),
    Sequence { sequence: Vec<YamlFlowEntry> },
    Parallel { parallel: Vec<YamlFlowEntry> },
}

impl YamlFlowEntry {
    fn into_flow_node(self) -> FlowNode {
        match self {
            Self::Ref(name) => FlowNode::Ref(name),
            Self::Sequence { sequence } => {
                FlowNode::Sequence(sequence.into_iter().map(Self::into_flow_node).collect())
            }
            Self::Parallel { parallel } => {
                FlowNode::Parallel(parallel.into_iter().map(Self::into_flow_node).collect())
            }
        }
    }
}

/// All segments and rides declared by a `kite.yaml` workspace file.
pub struct Workspace {
    pub segments: Vec<Segment>,
    pub ride_names: Vec<String>,
    rides: BTreeMap<String, YamlRide>,
    global_environment: BTreeMap<String, String>,
}

impl Workspace {
    pub fn load(path: &Path) -> Result<Self, LoaderError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoaderError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: YamlFile = serde_yaml::from_str(&content).map_err(|source| LoaderError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let segments = file
            .segments
            .into_iter()
            .map(|(name, spec)| build_segment(name, spec))
            .collect();

        Ok(Self {
            segments,
            ride_names: file.rides.keys().cloned().collect(),
            rides: file.rides,
            global_environment: file.environment,
        })
    }

    /// Materialise the named ride, merging the workspace's global
    /// environment with the ride's own overlay (ride wins on conflict).
    pub fn ride(&self, name: &str) -> Result<Ride, LoaderError> {
        let yaml_ride = self
            .rides
            .get(name)
            .ok_or_else(|| LoaderError::UnknownRide(name.to_string()))?;

        let flow = if yaml_ride.flow.len() == 1 {
            yaml_ride.flow[0].clone().into_flow_node()
        } else {
            FlowNode::Sequence(
                yaml_ride
                    .flow
                    .iter()
                    .cloned()
                    .map(YamlFlowEntry::into_flow_node)
                    .collect(),
            )
        };

        let mut ride = Ride::new(name, flow);
        ride.max_concurrency = yaml_ride.max_concurrency;
        ride.environment = self.global_environment.clone();
        ride.environment.extend(yaml_ride.environment.clone());
        Ok(ride)
    }

    /// A ride with every loaded segment run once, in declaration order
    /// (used by `run-segments`, which bypasses rides entirely).
    pub fn ad_hoc_ride(&self, segment_names: &[String]) -> Result<Ride, LoaderError> {
        for name in segment_names {
            if !self.segments.iter().any(|s| &s.name == name) {
                return Err(LoaderError::UnknownSegment(name.clone()));
            }
        }
        let flow = FlowNode::Sequence(
            segment_names
                .iter()
                .map(|name| FlowNode::Ref(name.clone()))
                .collect(),
        );
        let mut ride = Ride::new("ad-hoc", flow);
        ride.environment = self.global_environment.clone();
        Ok(ride)
    }
}

impl Clone for YamlFlowEntry {
    fn clone(&self) -> Self {
        match self {
            Self::Ref(name) => Self::Ref(name.clone()),
            Self::Sequence { sequence } => Self::Sequence {
                sequence: sequence.clone(),
            },
            Self::Parallel { parallel } => Self::Parallel {
                parallel: parallel.clone(),
            },
        }
    }
}

fn build_segment(name: String, spec: YamlSegment) -> Segment {
    let run = spec.run;
    let body = Arc::new(move |ctx: &kite_core::ExecutionContext| -> kite_core::BodyResult {
        ctx.shell(&run).map(|_| ())
    });

    let mut segment = Segment::new(name, body);
    segment.description = spec.description;
    segment.depends_on = spec.depends_on;
    segment.timeout = spec.timeout_secs.map(Duration::from_secs);
    segment.max_retries = spec.max_retries;
    segment.retry_delay = Duration::from_secs(spec.retry_delay_secs);
    segment.retry_on = spec.retry_on;
    segment.declared_inputs = spec.inputs;
    segment.declared_outputs = spec.outputs.into_iter().collect();
    segment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segments_and_a_linear_ride() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kite.yaml");
        std::fs::write(
            &path,
            r#"
environment:
  GLOBAL: "1"
segments:
  fetch:
    run: "echo fetching"
  build:
    run: "echo building"
    depends_on: [fetch]
    timeout_secs: 30
    max_retries: 1
rides:
  default:
    flow: [fetch, build]
    max_concurrency: 2
"#,
        )
        .unwrap();

        let workspace = Workspace::load(&path).unwrap();
        assert_eq!(workspace.segments.len(), 2);
        let ride = workspace.ride("default").unwrap();
        assert_eq!(ride.max_concurrency, Some(2));
        assert_eq!(ride.environment.get("GLOBAL"), Some(&"1".to_string()));
    }

    #[test]
    fn unknown_ride_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kite.yaml");
        std::fs::write(&path, "segments: {}\nrides: {}\n").unwrap();
        let workspace = Workspace::load(&path).unwrap();
        assert!(matches!(
            workspace.ride("missing"),
            Err(LoaderError::UnknownRide(_))
        ));
    }

    #[test]
    fn nested_parallel_flow_parses() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kite.yaml");
        std::fs::write(
            &path,
            r#"
segments:
  a:
    run: "echo a"
  b:
    run: "echo b"
  c:
    run: "echo c"
rides:
  default:
    flow:
      - a
      - parallel: [b, c]
"#,
        )
        .unwrap();
        let workspace = Workspace::load(&path).unwrap();
        let ride = workspace.ride("default").unwrap();
        assert!(matches!(ride.flow, FlowNode::Sequence(_)));
    }
}
