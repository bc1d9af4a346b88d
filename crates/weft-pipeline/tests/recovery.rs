use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use weft_pipeline::engines::reference::{
    ReferenceQueryEngine, ReferenceTemplateEngine, ReferenceValidator,
};
use weft_pipeline::engines::{
    EngineError, EngineSet, ShapeValidator, TemplateEngine,
};
use weft_pipeline::{
    BindingRow, OutputKind, PipelineConfig, PipelineRunner, Rule, ShapeSet, SourceFile,
    SyncOptions, ValidationOutcome, WeftError, WorkspaceManifest,
};
use weft_store::WorkspaceStore;

fn write(root: &Path, relative: &str, bytes: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().expect("path should have a parent"))
        .expect("mkdir should succeed");
    std::fs::write(path, bytes).expect("write should succeed");
}

fn seed_inputs(root: &Path) {
    write(
        root,
        "specs/commands.json",
        br#"{"cmd.deploy": {"name": "deploy", "description": "Ship a release"}}"#,
    );
    write(
        root,
        "specs/services.json",
        br#"{"svc.indexer": {"name": "indexer", "description": "Background indexer"}}"#,
    );
    write(
        root,
        "shapes/core.json",
        br#"[
            {"id": "NamedShape", "target": "name",
             "requires": ["description"], "non_empty": ["description"]}
        ]"#,
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
        b"# {{meta.rule}}\n\n- {{row.name}}: {{row.description}}\n",
    );
}

fn manifest() -> WorkspaceManifest {
    WorkspaceManifest {
        sources: vec![
            "specs/commands.json".to_string(),
            "specs/services.json".to_string(),
        ],
        shapes: "shapes/core.json".to_string(),
        rules: vec![
            Rule {
                name: "command-docs".to_string(),
                source: "specs/commands.json".to_string(),
                query: "queries/by_name.json".to_string(),
                template: "templates/doc.tmpl".to_string(),
                output: "gen/commands.md".to_string(),
                kind: OutputKind::Text,
            },
            Rule {
                name: "service-docs".to_string(),
                source: "specs/services.json".to_string(),
                query: "queries/by_name.json".to_string(),
                template: "templates/doc.tmpl".to_string(),
                output: "gen/services.md".to_string(),
                kind: OutputKind::Text,
            },
        ],
    }
}

/// Counts validator invocations so resume tests can prove that a
/// committed Normalize stage is never replayed.
struct CountingValidator {
    calls: Arc<AtomicUsize>,
    inner: ReferenceValidator,
}

#[async_trait]
impl ShapeValidator for CountingValidator {
    async fn validate(
        &self,
        source: &SourceFile,
        shapes: &ShapeSet,
    ) -> Result<ValidationOutcome, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.validate(source, shapes).await
    }
}

/// Fails the first render call, then behaves like the reference engine.
struct FailOnceTemplateEngine {
    tripped: AtomicBool,
    inner: ReferenceTemplateEngine,
}

#[async_trait]
impl TemplateEngine for FailOnceTemplateEngine {
    async fn render(
        &self,
        template_text: &str,
        rows: &[BindingRow],
        meta: &BindingRow,
    ) -> Result<Vec<u8>, EngineError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(EngineError::new("transient renderer outage"));
        }
        self.inner.render(template_text, rows, meta).await
    }
}

#[tokio::test(flavor = "current_thread")]
async fn recover_after_emit_failure_expected_resume_without_replaying_earlier_stages() {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    seed_inputs(tmp.path());
    let calls = Arc::new(AtomicUsize::new(0));
    let engines = EngineSet::new(
        Arc::new(CountingValidator {
            calls: Arc::clone(&calls),
            inner: ReferenceValidator,
        }),
        Arc::new(ReferenceQueryEngine),
        Arc::new(FailOnceTemplateEngine {
            tripped: AtomicBool::new(false),
            inner: ReferenceTemplateEngine,
        }),
    );
    let store = WorkspaceStore::open(tmp.path()).expect("store should open");
    let runner = PipelineRunner::new(
        store,
        PipelineConfig {
            engines,
            parallelism: 1,
            ..PipelineConfig::default()
        },
    );

    let error = runner
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect_err("first render call should fail the run");
    assert!(matches!(error, WeftError::Emission { .. }));
    let validations_before_recovery = calls.load(Ordering::SeqCst);
    assert_eq!(validations_before_recovery, 2, "both sources validated once");

    let state = runner
        .store()
        .load_state()
        .expect("state should read")
        .expect("failed run should leave recovery state behind");
    assert!(state.completed_stages.contains(&"normalizing".to_string()));
    assert!(state.completed_stages.contains(&"extracting".to_string()));
    assert!(!state.completed_stages.contains(&"emitting".to_string()));

    let result = runner
        .sync(
            &manifest(),
            SyncOptions {
                recover: true,
                ..SyncOptions::full()
            },
        )
        .await
        .expect("recovery should complete the run");

    assert_eq!(
        calls.load(Ordering::SeqCst),
        validations_before_recovery,
        "recovery must not replay the committed Normalize stage"
    );
    let receipt = result.receipt.expect("recovered run should produce a receipt");
    assert_eq!(receipt.outputs.len(), 2);
    assert!(
        runner.store().load_state().expect("state should read").is_none(),
        "recovery state should be cleared after completion"
    );
}

#[tokio::test(flavor = "current_thread")]
async fn recovered_receipt_expected_identical_to_uninterrupted_run() {
    let interrupted_tmp = tempfile::tempdir().expect("tempdir should be created");
    let clean_tmp = tempfile::tempdir().expect("tempdir should be created");
    seed_inputs(interrupted_tmp.path());
    seed_inputs(clean_tmp.path());

    let interrupted_engines = EngineSet::new(
        Arc::new(ReferenceValidator),
        Arc::new(ReferenceQueryEngine),
        Arc::new(FailOnceTemplateEngine {
            tripped: AtomicBool::new(false),
            inner: ReferenceTemplateEngine,
        }),
    );
    let interrupted_runner = PipelineRunner::new(
        WorkspaceStore::open(interrupted_tmp.path()).expect("store should open"),
        PipelineConfig {
            engines: interrupted_engines,
            parallelism: 1,
            ..PipelineConfig::default()
        },
    );
    let clean_runner = PipelineRunner::new(
        WorkspaceStore::open(clean_tmp.path()).expect("store should open"),
        PipelineConfig::default(),
    );

    interrupted_runner
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect_err("interrupted run should fail at emit");
    let recovered = interrupted_runner
        .sync(
            &manifest(),
            SyncOptions {
                recover: true,
                ..SyncOptions::full()
            },
        )
        .await
        .expect("recovery should complete");
    let uninterrupted = clean_runner
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect("uninterrupted run should complete");

    let recovered_receipt = recovered.receipt.expect("recovered receipt");
    let uninterrupted_receipt = uninterrupted.receipt.expect("uninterrupted receipt");
    assert_eq!(recovered_receipt.inputs, uninterrupted_receipt.inputs);
    assert_eq!(recovered_receipt.outputs, uninterrupted_receipt.outputs);
}

#[tokio::test(flavor = "current_thread")]
async fn recover_without_interrupted_run_expected_recovery_error() {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    seed_inputs(tmp.path());
    let runner = PipelineRunner::new(
        WorkspaceStore::open(tmp.path()).expect("store should open"),
        PipelineConfig::default(),
    );

    let error = runner
        .sync(
            &manifest(),
            SyncOptions {
                recover: true,
                ..SyncOptions::full()
            },
        )
        .await
        .expect_err("recovery without state should fail");

    assert!(matches!(error, WeftError::Recovery(_)));
    assert!(error.to_string().contains("no interrupted run"));
}

#[tokio::test(flavor = "current_thread")]
async fn fresh_sync_after_failure_expected_stale_state_discarded() {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    seed_inputs(tmp.path());
    let engines = EngineSet::new(
        Arc::new(ReferenceValidator),
        Arc::new(ReferenceQueryEngine),
        Arc::new(FailOnceTemplateEngine {
            tripped: AtomicBool::new(false),
            inner: ReferenceTemplateEngine,
        }),
    );
    let runner = PipelineRunner::new(
        WorkspaceStore::open(tmp.path()).expect("store should open"),
        PipelineConfig {
            engines,
            parallelism: 1,
            ..PipelineConfig::default()
        },
    );

    runner
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect_err("first run should fail at emit");

    // A plain sync (no recovery flag) starts over and succeeds because the
    // flaky engine already tripped.
    let result = runner
        .sync(&manifest(), SyncOptions::full())
        .await
        .expect("fresh sync should succeed");

    assert_eq!(result.receipt.expect("receipt").outputs.len(), 2);
    assert!(
        runner.store().load_state().expect("state should read").is_none()
    );
}
