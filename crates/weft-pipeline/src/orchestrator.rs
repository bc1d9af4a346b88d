use crate::canonical::canonicalize;
use crate::config::{PipelineConfig, SyncOptions};
use crate::depgraph::DependencyGraph;
use crate::engines::EngineError;
use crate::errors::{ValidationFailed, WeftError};
use crate::events::{
    CheckpointEvent, EventLog, LockEvent, PipelineEvent, PlanEvent, RunEventKind, StageEvent,
};
use crate::hash::hash_bytes;
use crate::lock::LockManager;
use crate::manifest::{Rule, WorkspaceManifest};
use crate::model::{
    Artifact, BindingRow, BindingSet, NormalizedGraph, RenderJob, Severity, ValidationOutcome,
    Violation,
};
use crate::plan::{PreviousReceipt, RegenerationPlan, plan_run};
use crate::ENGINE_VERSION;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::time::Instant;
use weft_store::{
    Receipt, RunState, RunStats, Stage, StoreError, WorkspaceStore, now_millis,
};

const PLAN_WORK_FILE: &str = "plan.json";
const ADVISORIES_WORK_FILE: &str = "advisories.json";
const ARTIFACTS_WORK_FILE: &str = "artifacts.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    DryRun,
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub plan: RegenerationPlan,
    pub advisories: Vec<Violation>,
    pub receipt: Option<Receipt>,
}

/// Sequences the five stages, persisting the run state to the recovery
/// store before each stage's work and marking the stage complete only
/// after its products are on disk. Every stage reads its inputs from and
/// writes its products to the work directory, so an interrupted run
/// resumes at the first incomplete stage without replaying anything.
pub struct PipelineRunner {
    store: WorkspaceStore,
    config: PipelineConfig,
}

impl PipelineRunner {
    pub fn new(store: WorkspaceStore, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    pub async fn sync(
        &self,
        manifest: &WorkspaceManifest,
        options: SyncOptions,
    ) -> Result<RunResult, WeftError> {
        let mut events = EventLog::new(self.config.events.clone());
        let started = Instant::now();

        if options.dry_run {
            let (_inputs, plan, _previous) = self.compute_plan(manifest, options)?;
            self.emit_plan_event(&mut events, &plan);
            return Ok(RunResult {
                run_id: format!("dry-{}", now_millis()),
                status: RunStatus::DryRun,
                plan,
                advisories: Vec::new(),
                receipt: None,
            });
        }

        let lock = LockManager::new(
            self.store.clone(),
            self.config.lock_timeout,
            self.config.lock_wait,
        );
        let (guard, overridden) = lock.acquire().await?;
        if let Some(stale) = overridden {
            events.emit(RunEventKind::Lock(LockEvent::StaleOverridden {
                previous_pid: stale.holder_pid,
                previous_host: stale.holder_host,
                expired_at: stale.expires_at,
            }));
        }
        events.emit(RunEventKind::Lock(LockEvent::Acquired {
            holder_pid: guard.holder_pid(),
            expires_at: guard.expires_at(),
        }));

        // Plan only once the lock is held: a concurrent run may have
        // superseded the receipt while we were waiting.
        let outcome = match self.compute_plan(manifest, options) {
            Ok((inputs, plan, previous_receipt)) => {
                // A recovery run replays its persisted plan; the fresh
                // computation is only a fallback and would mislead the
                // event stream.
                if !options.recover {
                    self.emit_plan_event(&mut events, &plan);
                }
                self.run_stages(
                    manifest,
                    options,
                    inputs,
                    plan,
                    previous_receipt,
                    &mut events,
                    started,
                )
                .await
            }
            Err(error) => Err(error),
        };

        let holder_pid = guard.holder_pid();
        let release_result = guard.release();
        events.emit(RunEventKind::Lock(LockEvent::Released { holder_pid }));
        match (outcome, release_result) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(release_error)) => Err(release_error),
            (Err(error), _) => Err(error),
        }
    }

    /// Reads every input and the previous receipt, then computes the
    /// regeneration plan.
    fn compute_plan(
        &self,
        manifest: &WorkspaceManifest,
        options: SyncOptions,
    ) -> Result<
        (
            crate::manifest::LoadedInputs,
            RegenerationPlan,
            Option<Receipt>,
        ),
        WeftError,
    > {
        let inputs = crate::manifest::LoadedInputs::load(self.store.root(), manifest)?;
        let graph = DependencyGraph::from_manifest(manifest);

        let (previous_receipt, corrupt_detail) = match self.store.load_receipt() {
            Ok(receipt) => (receipt, None),
            Err(StoreError::Serialization(detail)) => (None, Some(detail)),
            Err(error) => return Err(error.into()),
        };
        let previous = match (&previous_receipt, corrupt_detail) {
            (Some(receipt), _) => PreviousReceipt::Valid(receipt),
            (None, Some(detail)) => PreviousReceipt::Corrupt(detail),
            (None, None) => PreviousReceipt::None,
        };

        let plan = plan_run(
            &graph,
            inputs.input_hashes(),
            previous,
            options,
            ENGINE_VERSION,
            |output| self.store.output_path(output).exists(),
        );
        Ok((inputs, plan, previous_receipt))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        manifest: &WorkspaceManifest,
        options: SyncOptions,
        inputs: crate::manifest::LoadedInputs,
        plan: RegenerationPlan,
        previous_receipt: Option<Receipt>,
        events: &mut EventLog,
        started: Instant,
    ) -> Result<RunResult, WeftError> {
        let (mut state, plan) = self.resolve_run_state(options, plan, events)?;
        if options.recover && plan.input_hashes != inputs.input_hashes() {
            return Err(WeftError::Recovery(
                "inputs changed since the interrupted run; rerun sync without recovery"
                    .to_string(),
            ));
        }
        events.emit(RunEventKind::Pipeline(PipelineEvent::Started {
            run_id: state.run_id.clone(),
        }));

        let rules: Vec<&Rule> = manifest
            .rules_in_order()
            .filter(|rule| plan.regenerate.contains(&rule.output))
            .collect();

        for stage in Stage::ALL {
            if state.is_complete(stage) {
                continue;
            }
            state.enter(stage);
            self.store.save_state(&state)?;
            events.emit(RunEventKind::Stage(StageEvent::Started {
                run_id: state.run_id.clone(),
                stage: stage.as_str().to_string(),
                items: rules.len(),
            }));

            let outcome = tokio::time::timeout(
                self.config.stage_timeout,
                self.run_stage(stage, &rules, &inputs, &plan, previous_receipt.as_ref(), started),
            )
            .await;
            let stage_result = match outcome {
                Ok(result) => result,
                Err(_) => Err(WeftError::timeout(stage)),
            };

            if let Err(error) = stage_result {
                self.discard_stage_work(stage)?;
                events.emit(RunEventKind::Stage(StageEvent::Failed {
                    run_id: state.run_id.clone(),
                    stage: stage.as_str().to_string(),
                    reason: error.to_string(),
                }));
                events.emit(RunEventKind::Pipeline(PipelineEvent::Failed {
                    run_id: state.run_id.clone(),
                    stage: Some(stage.as_str().to_string()),
                    reason: error.to_string(),
                }));
                return Err(error);
            }

            state.commit(stage);
            self.store.save_state(&state)?;
            events.emit(RunEventKind::Checkpoint(CheckpointEvent::Saved {
                run_id: state.run_id.clone(),
                stage: stage.as_str().to_string(),
                completed_stages: state.completed_stages.len(),
            }));
            events.emit(RunEventKind::Stage(StageEvent::Committed {
                run_id: state.run_id.clone(),
                stage: stage.as_str().to_string(),
                items: rules.len(),
            }));
        }

        let receipt = self
            .store
            .load_receipt()?
            .ok_or_else(|| WeftError::Recovery("receipt missing after final stage".to_string()))?;
        let advisories = self.load_advisories()?;
        self.store.clear_state()?;
        self.store.clear_work_dir()?;

        events.emit(RunEventKind::Pipeline(PipelineEvent::Completed {
            run_id: state.run_id.clone(),
            regenerated: plan.regenerate.len(),
            carried: plan.carried.len(),
        }));

        Ok(RunResult {
            run_id: state.run_id,
            status: RunStatus::Completed,
            plan,
            advisories,
            receipt: Some(receipt),
        })
    }

    /// Fresh runs clear any stale state and persist the plan checkpoint;
    /// recovery reloads both so the resumed run replays the same plan.
    fn resolve_run_state(
        &self,
        options: SyncOptions,
        plan: RegenerationPlan,
        events: &mut EventLog,
    ) -> Result<(RunState, RegenerationPlan), WeftError> {
        if options.recover {
            let state = self.store.load_state()?.ok_or_else(|| {
                WeftError::Recovery("no interrupted run to recover".to_string())
            })?;
            let raw = self
                .store
                .read_work_file(PLAN_WORK_FILE)?
                .ok_or_else(|| {
                    WeftError::Recovery(
                        "recovery state exists but the plan checkpoint is missing; \
                         rerun sync without recovery"
                            .to_string(),
                    )
                })?;
            let saved_plan: RegenerationPlan = serde_json::from_slice(&raw).map_err(|error| {
                WeftError::Recovery(format!("plan checkpoint unreadable: {error}"))
            })?;
            let resumed_at = state
                .first_incomplete_stage()
                .map(|stage| stage.as_str().to_string())
                .unwrap_or_else(|| "complete".to_string());
            events.emit(RunEventKind::Pipeline(PipelineEvent::Resumed {
                run_id: state.run_id.clone(),
                resumed_at_stage: resumed_at,
            }));
            return Ok((state, saved_plan));
        }

        self.store.clear_state()?;
        self.store.clear_work_dir()?;
        let raw = serde_json::to_vec_pretty(&plan)
            .map_err(|error| WeftError::Io(format!("failed serializing plan: {error}")))?;
        self.store.write_work_file(PLAN_WORK_FILE, &raw)?;
        Ok((RunState::new(format!("run-{}", now_millis())), plan))
    }

    async fn run_stage(
        &self,
        stage: Stage,
        rules: &[&Rule],
        inputs: &crate::manifest::LoadedInputs,
        plan: &RegenerationPlan,
        previous_receipt: Option<&Receipt>,
        started: Instant,
    ) -> Result<(), WeftError> {
        match stage {
            Stage::Normalizing => self.normalize_stage(rules, inputs).await,
            Stage::Extracting => self.extract_stage(rules, inputs).await,
            Stage::Emitting => self.emit_stage(rules, inputs).await,
            Stage::Canonicalizing => self.canonicalize_stage(rules).await,
            Stage::BuildingReceipt => {
                self.receipt_stage(plan, previous_receipt, started).await
            }
        }
    }

    /// Validates every distinct source the regeneration set touches and
    /// checkpoints each normalized graph. Any blocking violation (or any
    /// violation at all under strict mode) fails the run with the full
    /// ordered violation list.
    async fn normalize_stage(
        &self,
        rules: &[&Rule],
        inputs: &crate::manifest::LoadedInputs,
    ) -> Result<(), WeftError> {
        let mut needed: Vec<&str> = Vec::new();
        for rule in rules {
            if !needed.contains(&rule.source.as_str()) {
                needed.push(rule.source.as_str());
            }
        }

        let mut blocking = Vec::new();
        let mut advisories = Vec::new();
        for source_path in needed {
            let source = inputs.sources.get(source_path).ok_or_else(|| {
                WeftError::Manifest(format!("source '{source_path}' was not loaded"))
            })?;
            let outcome = tokio::time::timeout(
                self.config.engine_timeout,
                self.config.engines.validator.validate(source, &inputs.shapes),
            )
            .await
            .map_err(|_| WeftError::timeout(Stage::Normalizing))?
            .map_err(|EngineError(detail)| {
                WeftError::Validation(ValidationFailed::new(vec![Violation::new(
                    "validator_engine",
                    source_path,
                    "",
                    detail,
                    Severity::Blocking,
                )]))
            })?;

            match outcome {
                ValidationOutcome::Normalized {
                    graph,
                    advisories: mut found,
                } => {
                    self.write_json_work(&normalized_work_file(source_path), &graph)?;
                    advisories.append(&mut found);
                }
                ValidationOutcome::Violations { mut violations } => {
                    blocking.append(&mut violations);
                }
            }
        }

        if !blocking.is_empty() {
            blocking.extend(advisories);
            return Err(ValidationFailed::new(blocking).into());
        }
        if self.config.strict && !advisories.is_empty() {
            return Err(ValidationFailed::new(advisories).into());
        }
        self.write_json_work(ADVISORIES_WORK_FILE, &advisories)?;
        Ok(())
    }

    /// Runs each rule's query against its source's normalized graph.
    /// Queries fan out up to the parallelism limit but results are
    /// collected in declaration order; downstream caching keys depend on
    /// that order.
    async fn extract_stage(
        &self,
        rules: &[&Rule],
        inputs: &crate::manifest::LoadedInputs,
    ) -> Result<(), WeftError> {
        let mut jobs = Vec::new();
        for rule in rules {
            let graph: NormalizedGraph =
                self.read_json_work(&normalized_work_file(&rule.source))?;
            let query = inputs.queries.get(&rule.query).ok_or_else(|| {
                WeftError::Manifest(format!("query '{}' was not loaded", rule.query))
            })?;
            jobs.push((
                rule.name.clone(),
                rule.query.clone(),
                query.text.clone(),
                query.hash.clone(),
                graph,
            ));
        }

        let engine = self.config.engines.query.clone();
        let engine_timeout = self.config.engine_timeout;
        let results: Vec<(String, Result<BindingSet, WeftError>)> =
            futures::stream::iter(jobs.into_iter().map(
                |(rule_name, query_path, query_text, query_hash, graph)| {
                    let engine = engine.clone();
                    async move {
                        let extracted =
                            tokio::time::timeout(engine_timeout, engine.extract(&graph, &query_text))
                                .await
                                .map_err(|_| WeftError::timeout(Stage::Extracting))
                                .and_then(|result| {
                                    result.map_err(|EngineError(detail)| WeftError::Extraction {
                                        query: query_path.clone(),
                                        detail,
                                    })
                                })
                                .map(|rows| BindingSet {
                                    query_hash,
                                    rows,
                                });
                        (rule_name, extracted)
                    }
                },
            ))
            .buffered(self.config.parallelism.max(1))
            .collect()
            .await;

        for (rule_name, result) in results {
            let bindings = result?;
            self.write_json_work(&bindings_work_file(&rule_name), &bindings)?;
        }
        Ok(())
    }

    /// Renders one job per rule over its checkpointed bindings. Renders
    /// fan out up to the parallelism limit; results are written back in
    /// declaration order.
    async fn emit_stage(
        &self,
        rules: &[&Rule],
        inputs: &crate::manifest::LoadedInputs,
    ) -> Result<(), WeftError> {
        let mut jobs = Vec::new();
        for rule in rules {
            let bindings: BindingSet = self.read_json_work(&bindings_work_file(&rule.name))?;
            let template = inputs.templates.get(&rule.template).ok_or_else(|| {
                WeftError::Manifest(format!("template '{}' was not loaded", rule.template))
            })?;
            jobs.push(RenderJob {
                rule: rule.name.clone(),
                template_path: rule.template.clone(),
                template_text: template.text.clone(),
                bindings,
                output_path: rule.output.clone(),
            });
        }

        let engine = self.config.engines.template.clone();
        let engine_timeout = self.config.engine_timeout;
        let results: Vec<(String, Result<Vec<u8>, WeftError>)> =
            futures::stream::iter(jobs.into_iter().map(|job| {
                let engine = engine.clone();
                async move {
                    let meta = BindingRow::from([
                        ("rule".to_string(), job.rule.clone()),
                        ("count".to_string(), job.bindings.rows.len().to_string()),
                    ]);
                    let rendered = tokio::time::timeout(
                        engine_timeout,
                        engine.render(&job.template_text, &job.bindings.rows, &meta),
                    )
                    .await
                    .map_err(|_| WeftError::timeout(Stage::Emitting))
                    .and_then(|result| {
                        result.map_err(|EngineError(detail)| WeftError::Emission {
                            template: job.template_path.clone(),
                            detail,
                        })
                    });
                    (job.output_path, rendered)
                }
            }))
            .buffered(self.config.parallelism.max(1))
            .collect()
            .await;

        for (output_path, result) in results {
            let rendered = result?;
            self.store
                .write_work_file(&rendered_work_file(&output_path), &rendered)?;
        }
        Ok(())
    }

    /// Canonicalizes every rendered payload into artifacts in the work
    /// directory first, then publishes all outputs; a canonicalization
    /// failure therefore never leaves a partially updated output set
    /// behind.
    async fn canonicalize_stage(&self, rules: &[&Rule]) -> Result<(), WeftError> {
        let mut artifacts = Vec::new();
        for rule in rules {
            let rendered = self
                .store
                .read_work_file(&rendered_work_file(&rule.output))?
                .ok_or_else(|| {
                    WeftError::Recovery(format!(
                        "rendered payload for output '{}' missing from the work directory",
                        rule.output
                    ))
                })?;
            let bytes = canonicalize(rule.kind, &rendered).map_err(|detail| {
                WeftError::Canonicalization {
                    output: rule.output.clone(),
                    detail,
                }
            })?;
            self.store
                .write_work_file(&canonical_work_file(&rule.output), &bytes)?;
            artifacts.push(Artifact {
                output_path: rule.output.clone(),
                hash: hash_bytes(&bytes),
                canonical_bytes: bytes,
            });
        }

        let artifact_hashes: BTreeMap<&str, &str> = artifacts
            .iter()
            .map(|artifact| (artifact.output_path.as_str(), artifact.hash.as_str()))
            .collect();
        self.write_json_work(ARTIFACTS_WORK_FILE, &artifact_hashes)?;

        for artifact in &artifacts {
            self.store
                .write_output(&artifact.output_path, &artifact.canonical_bytes)?;
        }
        Ok(())
    }

    /// Assembles the receipt from the plan's carried hashes plus the
    /// artifact hashes recorded by the Canonicalize stage, checks no-op
    /// idempotence against the previous receipt, and writes the new
    /// receipt atomically.
    async fn receipt_stage(
        &self,
        plan: &RegenerationPlan,
        previous_receipt: Option<&Receipt>,
        started: Instant,
    ) -> Result<(), WeftError> {
        let artifact_hashes: BTreeMap<String, String> =
            self.read_json_work(ARTIFACTS_WORK_FILE)?;

        let mut outputs: BTreeMap<String, String> = plan.carried.clone();
        let mut total_bytes: u64 = 0;
        for output in &plan.regenerate {
            let hash = artifact_hashes.get(output).ok_or_else(|| {
                WeftError::Recovery(format!(
                    "artifact hash for output '{output}' missing from the work directory"
                ))
            })?;
            let bytes = self.store.read_output(output)?.ok_or_else(|| {
                WeftError::Io(format!("generated output '{output}' missing from disk"))
            })?;
            total_bytes += bytes.len() as u64;
            outputs.insert(output.clone(), hash.clone());
        }
        for output in plan.carried.keys() {
            if let Some(bytes) = self.store.read_output(output)? {
                total_bytes += bytes.len() as u64;
            }
        }

        if let Some(previous) = previous_receipt {
            let comparable = previous.engine_version == ENGINE_VERSION
                && previous.schema_version == weft_store::RECEIPT_SCHEMA_VERSION;
            if comparable && previous.inputs == plan.input_hashes && previous.outputs != outputs {
                let first_divergent = outputs
                    .iter()
                    .find(|(path, hash)| previous.outputs.get(*path) != Some(hash))
                    .map(|(path, _)| path.clone())
                    .or_else(|| previous.outputs.keys().next().cloned())
                    .unwrap_or_default();
                return Err(WeftError::IdempotenceViolation { first_divergent });
            }
        }

        let mut receipt = Receipt::new(ENGINE_VERSION);
        receipt.inputs = plan.input_hashes.clone();
        receipt.stats = RunStats {
            count: outputs.len(),
            bytes: total_bytes,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        receipt.outputs = outputs;
        self.store.save_receipt(&receipt)?;
        Ok(())
    }

    fn discard_stage_work(&self, stage: Stage) -> Result<(), WeftError> {
        match stage {
            Stage::Normalizing => self.store.clear_work_subdir("normalized")?,
            Stage::Extracting => self.store.clear_work_subdir("bindings")?,
            Stage::Emitting => self.store.clear_work_subdir("rendered")?,
            Stage::Canonicalizing => {
                self.store.clear_work_subdir("canonical")?;
                self.store.remove_work_file(ARTIFACTS_WORK_FILE)?;
            }
            Stage::BuildingReceipt => {}
        }
        Ok(())
    }

    fn load_advisories(&self) -> Result<Vec<Violation>, WeftError> {
        match self.store.read_work_file(ADVISORIES_WORK_FILE)? {
            Some(raw) => serde_json::from_slice(&raw)
                .map_err(|error| WeftError::Io(format!("advisories unreadable: {error}"))),
            None => Ok(Vec::new()),
        }
    }

    fn write_json_work<T: serde::Serialize>(
        &self,
        relative: &str,
        value: &T,
    ) -> Result<(), WeftError> {
        let raw = serde_json::to_vec_pretty(value)
            .map_err(|error| WeftError::Io(format!("failed serializing '{relative}': {error}")))?;
        self.store.write_work_file(relative, &raw)?;
        Ok(())
    }

    fn read_json_work<T: serde::de::DeserializeOwned>(
        &self,
        relative: &str,
    ) -> Result<T, WeftError> {
        let raw = self.store.read_work_file(relative)?.ok_or_else(|| {
            WeftError::Recovery(format!("work file '{relative}' missing"))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|error| WeftError::Io(format!("work file '{relative}' unreadable: {error}")))
    }

    /// Removes generated outputs, recovery state, and stage work files.
    /// The receipt survives unless the caller opts out.
    pub async fn clean(&self, keep_receipt: bool) -> Result<(), WeftError> {
        let lock = LockManager::new(
            self.store.clone(),
            self.config.lock_timeout,
            self.config.lock_wait,
        );
        let (guard, _) = lock.acquire().await?;

        match self.store.load_receipt() {
            Ok(Some(receipt)) => {
                for output in receipt.outputs.keys() {
                    self.store.remove_output(output)?;
                }
            }
            // A corrupt receipt names no outputs to remove.
            Ok(None) | Err(StoreError::Serialization(_)) => {}
            Err(error) => return Err(error.into()),
        }
        self.store.clear_state()?;
        self.store.clear_work_dir()?;
        if !keep_receipt {
            self.store.remove_receipt()?;
        }
        guard.release()?;
        Ok(())
    }

    fn emit_plan_event(&self, events: &mut EventLog, plan: &RegenerationPlan) {
        if plan.full {
            events.emit(RunEventKind::Plan(PlanEvent::Full {
                reason: plan
                    .full_reason
                    .clone()
                    .unwrap_or_else(|| "full run".to_string()),
                outputs: plan.regenerate.len(),
            }));
        } else {
            events.emit(RunEventKind::Plan(PlanEvent::Incremental {
                regenerate: plan.regenerate.len(),
                carried: plan.carried.len(),
            }));
        }
    }
}

fn sanitize_path(path: &str) -> String {
    path.replace(['/', '\\'], "__")
}

fn normalized_work_file(source_path: &str) -> String {
    format!("normalized/{}.json", sanitize_path(source_path))
}

fn bindings_work_file(rule_name: &str) -> String {
    format!("bindings/{rule_name}.json")
}

fn rendered_work_file(output_path: &str) -> String {
    format!("rendered/{}", sanitize_path(output_path))
}

fn canonical_work_file(output_path: &str) -> String {
    format!("canonical/{}", sanitize_path(output_path))
}
