use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub type ContentHash = String;

pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const RECEIPT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Normalizing,
    Extracting,
    Emitting,
    Canonicalizing,
    BuildingReceipt,
}

impl Stage {
    /// The five work stages in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Normalizing,
        Stage::Extracting,
        Stage::Emitting,
        Stage::Canonicalizing,
        Stage::BuildingReceipt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalizing => "normalizing",
            Self::Extracting => "extracting",
            Self::Emitting => "emitting",
            Self::Canonicalizing => "canonicalizing",
            Self::BuildingReceipt => "building_receipt",
        }
    }
}

impl TryFrom<&str> for Stage {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "normalizing" => Ok(Self::Normalizing),
            "extracting" => Ok(Self::Extracting),
            "emitting" => Ok(Self::Emitting),
            "canonicalizing" => Ok(Self::Canonicalizing),
            "building_receipt" => Ok(Self::BuildingReceipt),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Recovery state persisted before each stage's work begins and updated as
/// each stage commits. Present on disk only while a run is in flight or
/// after a failure that left resumable work behind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub schema_version: u32,
    pub run_id: String,
    pub current_stage: String,
    pub completed_stages: Vec<String>,
    pub started_at: String,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            run_id: run_id.into(),
            current_stage: String::new(),
            completed_stages: Vec::new(),
            started_at: timestamp_now(),
        }
    }

    pub fn current_stage(&self) -> Result<Option<Stage>, String> {
        if self.current_stage.is_empty() {
            return Ok(None);
        }
        Stage::try_from(self.current_stage.as_str()).map(Some)
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed_stages
            .iter()
            .any(|name| name == stage.as_str())
    }

    pub fn enter(&mut self, stage: Stage) {
        self.current_stage = stage.as_str().to_string();
    }

    pub fn commit(&mut self, stage: Stage) {
        if !self.is_complete(stage) {
            self.completed_stages.push(stage.as_str().to_string());
        }
    }

    /// The first stage, in execution order, not yet marked complete.
    pub fn first_incomplete_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| !self.is_complete(*stage))
    }
}

/// Cross-process lock record. At most one unexpired record may exist per
/// workspace; timestamps are epoch milliseconds so expiry comparison never
/// depends on string parsing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder_pid: u32,
    pub holder_host: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub count: usize,
    pub bytes: u64,
    pub duration_ms: u64,
}

/// The durable proof of a completed run: which input hashes produced which
/// output hashes. Immutable once written; superseded atomically by the
/// next successful run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub schema_version: u32,
    pub engine_version: String,
    pub generated_at: String,
    pub inputs: BTreeMap<String, ContentHash>,
    pub outputs: BTreeMap<String, ContentHash>,
    pub stats: RunStats,
}

impl Receipt {
    pub fn new(engine_version: impl Into<String>) -> Self {
        Self {
            schema_version: RECEIPT_SCHEMA_VERSION,
            engine_version: engine_version.into(),
            generated_at: timestamp_now(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            stats: RunStats::default(),
        }
    }
}

pub fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
