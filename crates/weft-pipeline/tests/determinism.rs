use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use weft_pipeline::engines::reference::{ReferenceTemplateEngine, ReferenceValidator};
use weft_pipeline::engines::{EngineError, EngineSet, QueryEngine};
use weft_pipeline::{
    BindingRow, NormalizedGraph, OutputKind, PipelineConfig, PipelineRunner, Rule, SyncOptions,
    WeftError, WorkspaceManifest,
};
use weft_store::WorkspaceStore;

fn write(root: &Path, relative: &str, bytes: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().expect("path should have a parent"))
        .expect("mkdir should succeed");
    std::fs::write(path, bytes).expect("write should succeed");
}

fn seed_inputs(root: &Path, commands_json: &[u8]) {
    write(root, "specs/commands.json", commands_json);
    write(
        root,
        "shapes/core.json",
        br#"[{"id": "NamedShape", "target": "name", "requires": ["description"]}]"#,
    );
    write(
        root,
        "queries/by_name.json",
        br#"{"match": "name",
             "select": {"name": "value", "description": "description"}}"#,
    );
    write(
        root,
        "templates/doc.tmpl",
        b"- {{row.name}}: {{row.description}}\n",
    );
}

fn manifest() -> WorkspaceManifest {
    WorkspaceManifest {
        sources: vec!["specs/commands.json".to_string()],
        shapes: "shapes/core.json".to_string(),
        rules: vec![Rule {
            name: "command-docs".to_string(),
            source: "specs/commands.json".to_string(),
            query: "queries/by_name.json".to_string(),
            template: "templates/doc.tmpl".to_string(),
            output: "gen/commands.md".to_string(),
            kind: OutputKind::Text,
        }],
    }
}

fn runner(root: &Path, config: PipelineConfig) -> PipelineRunner {
    PipelineRunner::new(
        WorkspaceStore::open(root).expect("store should open"),
        config,
    )
}

#[tokio::test(flavor = "current_thread")]
async fn two_clean_workspaces_expected_byte_identical_artifacts() {
    let left_tmp = tempfile::tempdir().expect("tempdir should be created");
    let right_tmp = tempfile::tempdir().expect("tempdir should be created");
    let spec = br#"{
        "cmd.deploy": {"name": "deploy", "description": "Ship a release"},
        "cmd.status": {"name": "status", "description": "Show workspace state"}
    }"#;
    seed_inputs(left_tmp.path(), spec);
    seed_inputs(right_tmp.path(), spec);

    let left = runner(left_tmp.path(), PipelineConfig::default())
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect("left sync should succeed");
    let right = runner(right_tmp.path(), PipelineConfig::default())
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect("right sync should succeed");

    assert_eq!(
        std::fs::read(left_tmp.path().join("gen/commands.md")).expect("left output"),
        std::fs::read(right_tmp.path().join("gen/commands.md")).expect("right output"),
    );
    assert_eq!(
        left.receipt.expect("left receipt").outputs,
        right.receipt.expect("right receipt").outputs,
    );
}

#[tokio::test(flavor = "current_thread")]
async fn reordered_source_statements_expected_identical_outputs() {
    let left_tmp = tempfile::tempdir().expect("tempdir should be created");
    let right_tmp = tempfile::tempdir().expect("tempdir should be created");
    seed_inputs(
        left_tmp.path(),
        br#"{
            "cmd.deploy": {"name": "deploy", "description": "Ship a release"},
            "cmd.status": {"name": "status", "description": "Show workspace state"}
        }"#,
    );
    // Same statements, different declaration order and whitespace.
    seed_inputs(
        right_tmp.path(),
        br#"{
            "cmd.status": {"description": "Show workspace state", "name": "status"},
            "cmd.deploy": {"description": "Ship a release", "name": "deploy"}
        }"#,
    );

    let left = runner(left_tmp.path(), PipelineConfig::default())
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect("left sync should succeed");
    let right = runner(right_tmp.path(), PipelineConfig::default())
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect("right sync should succeed");

    assert_eq!(
        std::fs::read(left_tmp.path().join("gen/commands.md")).expect("left output"),
        std::fs::read(right_tmp.path().join("gen/commands.md")).expect("right output"),
        "statement order must not leak into generated bytes"
    );
    assert_eq!(
        left.receipt.expect("left receipt").outputs,
        right.receipt.expect("right receipt").outputs,
    );
}

/// Never resolves; used to drive engine-call timeouts.
struct StalledQueryEngine;

#[async_trait]
impl QueryEngine for StalledQueryEngine {
    async fn extract(
        &self,
        _graph: &NormalizedGraph,
        _query_text: &str,
    ) -> Result<Vec<BindingRow>, EngineError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

#[tokio::test(flavor = "current_thread")]
async fn stalled_query_engine_expected_stage_tagged_timeout() {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    seed_inputs(
        tmp.path(),
        br#"{"cmd.deploy": {"name": "deploy", "description": "Ship a release"}}"#,
    );
    let engines = EngineSet::new(
        Arc::new(ReferenceValidator),
        Arc::new(StalledQueryEngine),
        Arc::new(ReferenceTemplateEngine),
    );
    let runner = runner(
        tmp.path(),
        PipelineConfig {
            engines,
            engine_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        },
    );

    let error = runner
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect_err("stalled engine should time out");

    assert!(matches!(error, WeftError::Timeout { stage: "extracting" }));
    assert!(
        !tmp.path().join("gen/commands.md").exists(),
        "a timed-out run must not write outputs"
    );
    let store = WorkspaceStore::open(tmp.path()).expect("store should open");
    assert!(
        store.load_receipt().expect("receipt should read").is_none(),
        "a timed-out run must not produce a receipt"
    );
    assert!(
        store.read_lock().expect("lock should read").is_none(),
        "the lock must be released after a timeout"
    );
}

#[tokio::test(flavor = "current_thread")]
async fn timeout_expected_previous_receipt_left_intact() {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    seed_inputs(
        tmp.path(),
        br#"{"cmd.deploy": {"name": "deploy", "description": "Ship a release"}}"#,
    );

    let good = runner(tmp.path(), PipelineConfig::default())
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect("seed sync should succeed");
    let good_receipt = good.receipt.expect("seed receipt");

    let engines = EngineSet::new(
        Arc::new(ReferenceValidator),
        Arc::new(StalledQueryEngine),
        Arc::new(ReferenceTemplateEngine),
    );
    let stalled = runner(
        tmp.path(),
        PipelineConfig {
            engines,
            engine_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        },
    );
    stalled
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect_err("stalled run should time out");

    let current = WorkspaceStore::open(tmp.path())
        .expect("store should open")
        .load_receipt()
        .expect("receipt should read")
        .expect("previous receipt should survive the failed run");
    assert_eq!(current.outputs, good_receipt.outputs);
}
