//! Deterministic specification-transformation pipeline for weft.
//!
//! Sequences validation, extraction, rendering, and canonicalization into
//! five resumable stages (Normalize -> Extract -> Emit -> Canonicalize ->
//! Receipt), plans incremental rebuilds from content hashes, serializes
//! cross-process runs through a workspace lock, and proves each run with a
//! durable receipt.

pub mod canonical;
pub mod config;
pub mod depgraph;
pub mod engines;
pub mod errors;
pub mod events;
pub mod hash;
pub mod lock;
pub mod manifest;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod verify;

pub use canonical::*;
pub use config::*;
pub use depgraph::*;
pub use errors::*;
pub use events::*;
pub use hash::*;
pub use lock::*;
pub use manifest::*;
pub use model::*;
pub use orchestrator::*;
pub use plan::*;
pub use verify::*;

/// Version stamped into every receipt; a mismatch against a prior receipt
/// forces a full rebuild instead of trusting stale semantics.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
