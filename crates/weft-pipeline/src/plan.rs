use crate::config::SyncOptions;
use crate::depgraph::DependencyGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use weft_store::{ContentHash, RECEIPT_SCHEMA_VERSION, Receipt};

/// What the planner knows about the last run.
#[derive(Clone, Debug)]
pub enum PreviousReceipt<'a> {
    None,
    Corrupt(String),
    Valid(&'a Receipt),
}

/// The minimal set of outputs requiring regeneration, plus the prior
/// hashes carried forward unchanged for everything else. Persisted with
/// the run's work files so recovery replays the same plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenerationPlan {
    pub full: bool,
    pub full_reason: Option<String>,
    pub regenerate: BTreeSet<String>,
    pub carried: BTreeMap<String, ContentHash>,
    pub input_hashes: BTreeMap<String, ContentHash>,
}

impl RegenerationPlan {
    pub fn is_noop(&self) -> bool {
        self.regenerate.is_empty()
    }
}

/// Computes the regeneration set. Falls back to a full run whenever safety
/// cannot be proven: no/corrupt previous receipt, schema or engine-version
/// mismatch, forced or non-incremental invocation.
pub fn plan_run(
    graph: &DependencyGraph,
    input_hashes: BTreeMap<String, ContentHash>,
    previous: PreviousReceipt<'_>,
    options: SyncOptions,
    engine_version: &str,
    output_exists: impl Fn(&str) -> bool,
) -> RegenerationPlan {
    let all_outputs = graph.all_outputs();

    let full = |reason: String, input_hashes: BTreeMap<String, ContentHash>| RegenerationPlan {
        full: true,
        full_reason: Some(reason),
        regenerate: all_outputs.clone(),
        carried: BTreeMap::new(),
        input_hashes,
    };

    if options.force {
        return full("forced full run".to_string(), input_hashes);
    }
    if !options.incremental {
        return full("incremental rebuilds disabled".to_string(), input_hashes);
    }

    let receipt = match previous {
        PreviousReceipt::None => {
            return full("no previous receipt".to_string(), input_hashes);
        }
        PreviousReceipt::Corrupt(detail) => {
            return full(format!("previous receipt unreadable: {detail}"), input_hashes);
        }
        PreviousReceipt::Valid(receipt) => receipt,
    };

    if receipt.schema_version != RECEIPT_SCHEMA_VERSION {
        return full(
            format!(
                "receipt schema version {} does not match {}",
                receipt.schema_version, RECEIPT_SCHEMA_VERSION
            ),
            input_hashes,
        );
    }
    if receipt.engine_version != engine_version {
        return full(
            format!(
                "engine version changed from {} to {}",
                receipt.engine_version, engine_version
            ),
            input_hashes,
        );
    }

    let mut dirty_inputs = BTreeSet::new();
    for (path, hash) in &input_hashes {
        match receipt.inputs.get(path) {
            Some(previous_hash) if previous_hash == hash => {}
            _ => {
                dirty_inputs.insert(path.clone());
            }
        }
    }

    let mut regenerate = graph.dirty_outputs(&dirty_inputs);
    for output in &all_outputs {
        // Newly declared outputs and outputs deleted from disk are safe to
        // regenerate individually; everything else carries forward.
        if !receipt.outputs.contains_key(output) || !output_exists(output) {
            regenerate.insert(output.clone());
        }
    }

    let carried = all_outputs
        .iter()
        .filter(|output| !regenerate.contains(*output))
        .filter_map(|output| {
            receipt
                .outputs
                .get(output)
                .map(|hash| (output.clone(), hash.clone()))
        })
        .collect();

    RegenerationPlan {
        full: false,
        full_reason: None,
        regenerate,
        carried,
        input_hashes,
    }
}
