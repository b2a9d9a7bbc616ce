//! End-to-end artifact handoff across separate runs against the same
//! workspace (Section 8, scenario 6).

use std::sync::Arc;

use kite_core::{ArtifactStore, Config, Graph, Ride, RideStatus, Scheduler, Segment};
use tempfile::TempDir;

fn sequence_ride(names: &[&str]) -> Ride {
    Ride::new(
        "handoff",
        kite_core::FlowNode::Sequence(
            names.iter().map(|n| kite_core::FlowNode::Ref((*n).to_string())).collect(),
        ),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn artifact_produced_in_one_run_is_visible_in_the_next() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path().to_path_buf();
    std::fs::write(workspace.join("apk.bin"), b"release-build").unwrap();

    let mut config = Config::default();
    config.log_root = workspace.join(".kite/logs");
    config.artifact_root = workspace.join(".kite/artifacts");

    // Run 1: a single segment produces the "apk" artifact.
    let mut producer = Segment::new("build", Arc::new(|_ctx| Ok(())));
    producer.declared_outputs.push(("apk".to_string(), "apk.bin".to_string()));
    let segments = vec![producer];
    let ride = sequence_ride(&["build"]);

    let artifacts_run1 = Arc::new(ArtifactStore::new(&config.artifact_root));
    artifacts_run1.load_manifest().unwrap();
    let graph = Graph::build(&ride, &segments).unwrap();
    let scheduler = Scheduler::new(config.clone(), workspace.clone(), Arc::clone(&artifacts_run1));
    let report = scheduler.run(&ride, &graph).await.unwrap();
    assert_eq!(report.status, RideStatus::Success);

    assert!(config.artifact_root.join("manifest").exists());
    let manifest_body = std::fs::read_to_string(config.artifact_root.join("manifest")).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&manifest_body).is_ok());

    // Run 2: a fresh store over the same root, a consumer segment that
    // only reads; no producer runs this time.
    let consumed = Arc::new(std::sync::Mutex::new(None));
    let consumed_clone = Arc::clone(&consumed);
    let mut consumer = Segment::new(
        "verify",
        Arc::new(move |ctx: &kite_core::ExecutionContext| {
            let path = ctx.artifacts.get("apk").expect("apk artifact missing");
            *consumed_clone.lock().unwrap() = Some(std::fs::read(path).unwrap());
            Ok(())
        }),
    );
    consumer.declared_inputs.insert("apk".to_string());
    let segments2 = vec![consumer];
    let ride2 = sequence_ride(&["verify"]);

    let artifacts_run2 = Arc::new(ArtifactStore::new(&config.artifact_root));
    artifacts_run2.load_manifest().unwrap();
    assert!(artifacts_run2.has("apk"));

    let graph2 = Graph::build(&ride2, &segments2).unwrap();
    let scheduler2 = Scheduler::new(config.clone(), workspace.clone(), Arc::clone(&artifacts_run2));
    let report2 = scheduler2.run(&ride2, &graph2).await.unwrap();
    assert_eq!(report2.status, RideStatus::Success);
    assert_eq!(consumed.lock().unwrap().as_deref(), Some(b"release-build".as_slice()));
}
