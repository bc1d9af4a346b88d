use crate::model::Violation;
use thiserror::Error;
use weft_store::{Stage, StoreError};

#[derive(Debug, Error)]
pub enum WeftError {
    #[error(transparent)]
    Validation(#[from] ValidationFailed),

    #[error("extraction failed for query '{query}': {detail}")]
    Extraction { query: String, detail: String },

    #[error("emission failed for template '{template}': {detail}")]
    Emission { template: String, detail: String },

    #[error("canonicalization failed for output '{output}': {detail}")]
    Canonicalization { output: String, detail: String },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("io failure: {0}")]
    Io(String),

    #[error("stage '{stage}' exceeded its timeout")]
    Timeout { stage: &'static str },

    #[error("workspace lock is held by pid {holder_pid} on {holder_host}")]
    LockContention { holder_pid: u32, holder_host: String },

    #[error("{count} generated file(s) drifted from the receipt")]
    Drift { count: usize },

    #[error(
        "no-op run produced a different output set than the previous receipt; \
         first divergent output: '{first_divergent}'"
    )]
    IdempotenceViolation { first_divergent: String },

    #[error("recovery state error: {0}")]
    Recovery(String),
}

impl WeftError {
    pub fn timeout(stage: Stage) -> Self {
        Self::Timeout {
            stage: stage.as_str(),
        }
    }
}

impl From<StoreError> for WeftError {
    fn from(error: StoreError) -> Self {
        Self::Io(error.to_string())
    }
}

/// Blocking (or, under strict mode, advisory) shape violations. Carries
/// every violation with enough context to render an actionable error
/// without re-invoking the validator.
#[derive(Debug, Error, Clone)]
#[error("validation failed with {blocking_count} blocking violation(s)")]
pub struct ValidationFailed {
    pub violations: Vec<Violation>,
    pub blocking_count: usize,
}

impl ValidationFailed {
    pub fn new(violations: Vec<Violation>) -> Self {
        let blocking_count = violations.iter().filter(|v| v.is_blocking()).count();
        Self {
            violations,
            blocking_count,
        }
    }
}
