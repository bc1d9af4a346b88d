use crate::model::{BindingRow, NormalizedGraph, ShapeSet, SourceFile, ValidationOutcome};
use async_trait::async_trait;
use std::sync::Arc;

pub mod reference;

/// Diagnostic from an external engine, surfaced to the user verbatim.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// Shape-validation engine contract. Pure with respect to the two content
/// hashes: identical source + shapes always yield an equivalent result.
#[async_trait]
pub trait ShapeValidator: Send + Sync {
    async fn validate(
        &self,
        source: &SourceFile,
        shapes: &ShapeSet,
    ) -> Result<ValidationOutcome, EngineError>;
}

/// Graph-query engine contract. Returns ordered binding rows; a failure
/// never yields partial bindings.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn extract(
        &self,
        graph: &NormalizedGraph,
        query_text: &str,
    ) -> Result<Vec<BindingRow>, EngineError>;
}

/// Template-rendering engine contract. `meta` carries rule-level values
/// (rule name, row count) alongside the per-row bindings.
#[async_trait]
pub trait TemplateEngine: Send + Sync {
    async fn render(
        &self,
        template_text: &str,
        rows: &[BindingRow],
        meta: &BindingRow,
    ) -> Result<Vec<u8>, EngineError>;
}

pub type SharedShapeValidator = Arc<dyn ShapeValidator>;
pub type SharedQueryEngine = Arc<dyn QueryEngine>;
pub type SharedTemplateEngine = Arc<dyn TemplateEngine>;

/// The three engine seams bundled for injection into the orchestrator.
/// Swappable per instance: in-process reference engines by default, test
/// doubles or out-of-process adapters behind the same contracts.
#[derive(Clone)]
pub struct EngineSet {
    pub validator: SharedShapeValidator,
    pub query: SharedQueryEngine,
    pub template: SharedTemplateEngine,
}

impl EngineSet {
    pub fn new(
        validator: SharedShapeValidator,
        query: SharedQueryEngine,
        template: SharedTemplateEngine,
    ) -> Self {
        Self {
            validator,
            query,
            template,
        }
    }

    pub fn reference() -> Self {
        Self::new(
            Arc::new(reference::ReferenceValidator),
            Arc::new(reference::ReferenceQueryEngine),
            Arc::new(reference::ReferenceTemplateEngine),
        )
    }
}
