use std::{collections::HashSet, sync::Arc, time::Duration};

use markdownd::{
    application::render::{ComrakEngine, CompletionHeuristic, EngineConfig, RenderDispatcher},
    domain::frame::decode,
    infra::telemetry,
};
use metrics_util::debugging::DebuggingRecorder;
use serial_test::serial;
use tempfile::TempDir;

#[tokio::test]
#[serial]
async fn dispatch_emits_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let dir = TempDir::new().expect("temp dir");
    let engine = ComrakEngine::new(&EngineConfig {
        assets_dir: None,
        mermaid_cli_path: dir.path().join("missing-mmdc"),
        mermaid_cache_dir: dir.path().join("mermaid"),
    })
    .expect("engine");
    let dispatcher = RenderDispatcher::new(
        Arc::new(engine),
        CompletionHeuristic::new(Duration::from_secs(5), Duration::from_secs(5)),
    );

    dispatcher
        .dispatch(&decode(b"# Plain\n"))
        .await
        .expect("fast render");
    dispatcher
        .dispatch(&decode(b"sh\0echo hi"))
        .await
        .expect("slow render");

    let snapshot = snapshotter.snapshot().into_vec();
    let keys: HashSet<String> = snapshot
        .iter()
        .map(|(key, _, _, _)| key.key().name().to_string())
        .collect();

    for expected in ["markdownd_render_total", "markdownd_render_ms"] {
        assert!(keys.contains(expected), "missing metric {expected}: {keys:?}");
    }

    let paths: HashSet<String> = snapshot
        .iter()
        .filter(|(key, _, _, _)| key.key().name() == "markdownd_render_total")
        .flat_map(|(key, _, _, _)| {
            key.key()
                .labels()
                .filter(|label| label.key() == "path")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    assert_eq!(paths, HashSet::from(["fast".to_string(), "slow".to_string()]));
}
