use crate::manifest::WorkspaceManifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Source,
    Shapes,
    Query,
    Template,
}

/// One uniform edge for every input kind; an output depends on multiple
/// inputs and an input may influence multiple outputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub input_id: String,
    pub input_kind: InputKind,
    pub output_path: String,
}

/// Rebuilt from the manifest each run rather than incrementally updated;
/// the rebuild is cheap and cannot go stale.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    pub edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn from_manifest(manifest: &WorkspaceManifest) -> Self {
        let mut edges = Vec::new();
        for rule in manifest.rules_in_order() {
            edges.push(DependencyEdge {
                input_id: rule.source.clone(),
                input_kind: InputKind::Source,
                output_path: rule.output.clone(),
            });
            edges.push(DependencyEdge {
                input_id: manifest.shapes.clone(),
                input_kind: InputKind::Shapes,
                output_path: rule.output.clone(),
            });
            edges.push(DependencyEdge {
                input_id: rule.query.clone(),
                input_kind: InputKind::Query,
                output_path: rule.output.clone(),
            });
            edges.push(DependencyEdge {
                input_id: rule.template.clone(),
                input_kind: InputKind::Template,
                output_path: rule.output.clone(),
            });
        }
        Self { edges }
    }

    /// Outputs attached to any edge whose input is in the dirty set: one
    /// traversal over the uniform edge list.
    pub fn dirty_outputs(&self, dirty_inputs: &BTreeSet<String>) -> BTreeSet<String> {
        self.edges
            .iter()
            .filter(|edge| dirty_inputs.contains(&edge.input_id))
            .map(|edge| edge.output_path.clone())
            .collect()
    }

    pub fn all_outputs(&self) -> BTreeSet<String> {
        self.edges
            .iter()
            .map(|edge| edge.output_path.clone())
            .collect()
    }
}
