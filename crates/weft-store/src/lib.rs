//! Durable workspace state for the weft pipeline.
//!
//! One `WorkspaceStore` value owns the `.weft/` directory of a workspace:
//! the lock record, the recovery state, the receipt, and the per-stage
//! work files. Every write goes through write-to-temp-then-rename so a
//! crash mid-write never leaves a corrupt file visible to a reader.

pub mod store;
pub mod types;

pub use store::*;
pub use types::*;
