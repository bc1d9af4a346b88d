use crate::engines::EngineSet;
use crate::events::RunEventSink;
use std::time::Duration;

/// Pipeline-wide knobs. Strictness is configured here, never per call.
#[derive(Clone)]
pub struct PipelineConfig {
    pub strict: bool,
    pub parallelism: usize,
    pub stage_timeout: Duration,
    pub engine_timeout: Duration,
    pub lock_timeout: Duration,
    pub lock_wait: Duration,
    pub engines: EngineSet,
    pub events: RunEventSink,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strict: false,
            parallelism: 4,
            stage_timeout: Duration::from_secs(300),
            engine_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(120),
            lock_wait: Duration::from_secs(10),
            engines: EngineSet::reference(),
            events: RunEventSink::default(),
        }
    }
}

/// Per-invocation switches for `sync`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ignore the previous receipt and regenerate everything.
    pub force: bool,
    /// Allow the planner to skip outputs whose inputs are unchanged.
    pub incremental: bool,
    /// Plan only; touch nothing on disk.
    pub dry_run: bool,
    /// Resume an interrupted run from its recovery state.
    pub recover: bool,
}

impl SyncOptions {
    pub fn full() -> Self {
        Self {
            incremental: false,
            ..Self::default()
        }
    }

    pub fn incremental() -> Self {
        Self {
            incremental: true,
            ..Self::default()
        }
    }
}
