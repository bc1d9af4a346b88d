use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use weft_store::ContentHash;

/// One canonical statement of a specification: a (subject, predicate,
/// value) triple. Statement order in a source never matters; hashing and
/// normalization sort first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Statement {
    pub subject: String,
    pub predicate: String,
    pub value: String,
}

impl Statement {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            value: value.into(),
        }
    }
}

/// A named, versioned unit of semantic input. Immutable once hashed;
/// replaced wholesale on edit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub bytes: Vec<u8>,
    pub hash: ContentHash,
}

/// The constraint definitions fed to the validator, hashed as one unit; a
/// change invalidates every normalization result that used it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeSet {
    pub paths: Vec<String>,
    pub bytes: Vec<u8>,
    pub hash: ContentHash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Advisory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub shape: String,
    pub focus: String,
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

impl Violation {
    pub fn new(
        shape: impl Into<String>,
        focus: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            shape: shape.into(),
            focus: focus.into(),
            path: path.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

/// Validator output: canonical sorted statements plus their
/// order-independent hash. A value, not a process-bound handle, so a
/// committed Normalize stage can reload it from the work directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedGraph {
    pub statements: Vec<Statement>,
    pub hash: ContentHash,
}

impl NormalizedGraph {
    /// Every distinct value of `predicate` on `subject`, in sorted order.
    pub fn values_of<'a>(&'a self, subject: &str, predicate: &str) -> Vec<&'a str> {
        self.statements
            .iter()
            .filter(|s| s.subject == subject && s.predicate == predicate)
            .map(|s| s.value.as_str())
            .collect()
    }

    pub fn subjects_with<'a>(&'a self, predicate: &str) -> Vec<&'a str> {
        let mut subjects: Vec<&str> = self
            .statements
            .iter()
            .filter(|s| s.predicate == predicate)
            .map(|s| s.subject.as_str())
            .collect();
        subjects.dedup();
        subjects
    }
}

/// Exactly one variant is populated per validation call. The engine
/// returns `Violations` only when a blocking violation exists; advisory
/// findings ride along with the normalized graph so a non-strict run can
/// report them and continue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Normalized {
        graph: NormalizedGraph,
        advisories: Vec<Violation>,
    },
    Violations {
        violations: Vec<Violation>,
    },
}

pub type BindingRow = BTreeMap<String, String>;

/// Ordered rows produced by one query against one normalized graph.
/// Carries the query's content hash for downstream cache keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSet {
    pub query_hash: ContentHash,
    pub rows: Vec<BindingRow>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Structured,
    Text,
    Opaque,
}

impl Default for OutputKind {
    fn default() -> Self {
        Self::Text
    }
}

/// One unit of rendering work: identical inputs always map to the
/// identical output path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderJob {
    pub rule: String,
    pub template_path: String,
    pub template_text: String,
    pub bindings: BindingSet,
    pub output_path: String,
}

/// Generated content owned exclusively by the pipeline; an out-of-band
/// edit is drift, not a legitimate mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub output_path: String,
    pub canonical_bytes: Vec<u8>,
    pub hash: ContentHash,
}
