use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use weft_pipeline::{
    MANIFEST_FILE_NAME, OutputStatus, PipelineConfig, PipelineRunner, RunEvent, RunEventKind,
    RunEventSink, RunResult, RunStatus, SyncOptions, Verifier, WeftError, WorkspaceManifest,
    run_event_channel,
};
use weft_store::WorkspaceStore;

#[derive(Parser, Debug)]
#[command(name = "weft")]
#[command(about = "Deterministic specification-to-artifact sync pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Sync(SyncArgs),
    Verify(VerifyArgs),
    Clean(CleanArgs),
    InspectReceipt(InspectReceiptArgs),
}

#[derive(clap::Args, Debug)]
struct SyncArgs {
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    #[arg(long)]
    manifest: Option<PathBuf>,
    #[arg(long, action = ArgAction::SetTrue)]
    force: bool,
    #[arg(long = "no-incremental", action = ArgAction::SetTrue)]
    no_incremental: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    recover: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,
    #[arg(long)]
    parallelism: Option<usize>,
    #[arg(long = "lock-wait-ms")]
    lock_wait_ms: Option<u64>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct VerifyArgs {
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    strict: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct CleanArgs {
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    #[arg(long = "keep-receipt", action = ArgAction::SetTrue)]
    keep_receipt: bool,
}

#[derive(clap::Args, Debug)]
struct InspectReceiptArgs {
    #[arg(long, default_value = ".")]
    workspace: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Sync(args) => sync_command(args).await,
        Commands::Verify(args) => verify_command(args),
        Commands::Clean(args) => clean_command(args).await,
        Commands::InspectReceipt(args) => inspect_receipt_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(exit_code_for_error(&error))
        }
    }
}

async fn sync_command(args: SyncArgs) -> Result<ExitCode, WeftError> {
    let manifest_path = args
        .manifest
        .unwrap_or_else(|| args.workspace.join(MANIFEST_FILE_NAME));
    let manifest = WorkspaceManifest::load(&manifest_path)?;
    let store = WorkspaceStore::open(&args.workspace)?;

    let (event_sink, event_task) = event_stream(!args.no_stream_events, args.event_json);
    let mut config = PipelineConfig {
        strict: args.strict,
        events: event_sink,
        ..PipelineConfig::default()
    };
    if let Some(parallelism) = args.parallelism {
        config.parallelism = parallelism.max(1);
    }
    if let Some(wait_ms) = args.lock_wait_ms {
        config.lock_wait = Duration::from_millis(wait_ms);
    }

    let options = SyncOptions {
        force: args.force,
        incremental: !args.no_incremental,
        dry_run: args.dry_run,
        recover: args.recover,
    };

    let runner = PipelineRunner::new(store, config);
    let result = runner.sync(&manifest, options).await;
    // The runner holds the event sender; the drain task only finishes once
    // every sender is gone.
    drop(runner);
    if let Some(task) = event_task {
        task.await
            .map_err(|error| WeftError::Io(format!("event stream task failed: {error}")))?;
    }

    let result = result?;
    print_run_summary(&result);
    Ok(ExitCode::SUCCESS)
}

fn verify_command(args: VerifyArgs) -> Result<ExitCode, WeftError> {
    let store = WorkspaceStore::open(&args.workspace)?;
    let verifier = Verifier::new(store);
    let report = verifier.verify()?;

    if args.json {
        let raw = serde_json::to_string_pretty(&report)
            .map_err(|error| WeftError::Io(format!("failed serializing report: {error}")))?;
        println!("{raw}");
    } else {
        if !report.receipt_found {
            println!("no receipt found; nothing to verify");
        }
        for check in &report.checks {
            let status = match check.status {
                OutputStatus::Valid => "valid",
                OutputStatus::Drift => "drift",
                OutputStatus::Missing => "missing",
            };
            println!("{status:<8} {}", check.path);
        }
        println!(
            "checked: {} valid, {} drifted, {} missing",
            report.checks.len() - report.drift_count() - report.missing_count(),
            report.drift_count(),
            report.missing_count()
        );
    }

    if args.strict && !report.is_valid() {
        return Err(WeftError::Drift {
            count: report.drift_count() + report.missing_count(),
        });
    }
    Ok(ExitCode::SUCCESS)
}

async fn clean_command(args: CleanArgs) -> Result<ExitCode, WeftError> {
    let store = WorkspaceStore::open(&args.workspace)?;
    let runner = PipelineRunner::new(store, PipelineConfig::default());
    runner.clean(args.keep_receipt).await?;
    println!(
        "cleaned generated outputs{}",
        if args.keep_receipt {
            " (receipt kept)"
        } else {
            ""
        }
    );
    Ok(ExitCode::SUCCESS)
}

fn inspect_receipt_command(args: InspectReceiptArgs) -> Result<ExitCode, WeftError> {
    let store = WorkspaceStore::open(&args.workspace)?;
    let Some(receipt) = store.load_receipt()? else {
        println!("no receipt found");
        return Ok(ExitCode::SUCCESS);
    };

    if args.json {
        let raw = serde_json::to_string_pretty(&receipt)
            .map_err(|error| WeftError::Io(format!("failed serializing receipt: {error}")))?;
        println!("{raw}");
    } else {
        println!("engine_version: {}", receipt.engine_version);
        println!("generated_at: {}", receipt.generated_at);
        println!("inputs: {}", receipt.inputs.len());
        for (path, hash) in &receipt.inputs {
            println!("  {path} {}", short_hash(hash));
        }
        println!("outputs: {}", receipt.outputs.len());
        for (path, hash) in &receipt.outputs {
            println!("  {path} {}", short_hash(hash));
        }
        println!(
            "stats: {} output(s), {} byte(s), {} ms",
            receipt.stats.count, receipt.stats.bytes, receipt.stats.duration_ms
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (RunEventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (RunEventSink::default(), None);
    }

    let (tx, mut rx) = run_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (RunEventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &RunEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_kind_label(&event.kind)
    );
}

fn event_kind_label(kind: &RunEventKind) -> &'static str {
    match kind {
        RunEventKind::Pipeline(_) => "pipeline",
        RunEventKind::Stage(_) => "stage",
        RunEventKind::Plan(_) => "plan",
        RunEventKind::Lock(_) => "lock",
        RunEventKind::Checkpoint(_) => "checkpoint",
    }
}

fn print_run_summary(result: &RunResult) {
    println!("run_id: {}", result.run_id);
    println!(
        "status: {}",
        match result.status {
            RunStatus::Completed => "completed",
            RunStatus::DryRun => "dry_run",
        }
    );
    if result.plan.full {
        println!(
            "plan: full ({})",
            result.plan.full_reason.as_deref().unwrap_or("full run")
        );
    } else {
        println!(
            "plan: incremental ({} to regenerate, {} carried)",
            result.plan.regenerate.len(),
            result.plan.carried.len()
        );
    }
    for output in &result.plan.regenerate {
        println!(
            "{} {output}",
            if result.status == RunStatus::DryRun {
                "would regenerate:"
            } else {
                "regenerated:"
            }
        );
    }
    if !result.advisories.is_empty() {
        println!("advisories: {}", result.advisories.len());
        for advisory in &result.advisories {
            println!(
                "  [{}] {} at {}: {}",
                advisory.shape, advisory.focus, advisory.path, advisory.message
            );
        }
    }
}

fn short_hash(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn exit_code_for_error(error: &WeftError) -> u8 {
    match error {
        WeftError::Validation(_) | WeftError::Drift { .. } => 1,
        WeftError::Extraction { .. } => 2,
        WeftError::Emission { .. } => 3,
        WeftError::Canonicalization { .. } => 4,
        WeftError::Manifest(_)
        | WeftError::Io(_)
        | WeftError::Recovery(_)
        | WeftError::IdempotenceViolation { .. } => 5,
        WeftError::Timeout { .. } => 6,
        WeftError::LockContention { .. } => 7,
    }
}
