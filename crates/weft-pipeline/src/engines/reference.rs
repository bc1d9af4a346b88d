//! In-process reference engines.
//!
//! Source format: a JSON object mapping subject ids to predicate/value
//! maps (array values fan out to one statement each). Shapes: a JSON array
//! of constraint objects. Queries: a JSON selector over one predicate.
//! Templates: line-oriented `{{row.*}}` / `{{meta.*}}` placeholders.

use crate::engines::{EngineError, QueryEngine, ShapeValidator, TemplateEngine};
use crate::hash::hash_statements;
use crate::model::{
    BindingRow, NormalizedGraph, Severity, ShapeSet, SourceFile, Statement, ValidationOutcome,
    Violation,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const WELL_FORMED_SHAPE: &str = "well_formed_source";

#[derive(Clone, Debug, Deserialize)]
struct ShapeDef {
    id: String,
    target: String,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    non_empty: Vec<String>,
    #[serde(default = "default_severity")]
    severity: Severity,
}

fn default_severity() -> Severity {
    Severity::Blocking
}

#[derive(Debug, Default)]
pub struct ReferenceValidator;

#[async_trait]
impl ShapeValidator for ReferenceValidator {
    async fn validate(
        &self,
        source: &SourceFile,
        shapes: &ShapeSet,
    ) -> Result<ValidationOutcome, EngineError> {
        let shape_defs: Vec<ShapeDef> = serde_json::from_slice(&shapes.bytes)
            .map_err(|error| EngineError::new(format!("malformed shapes file: {error}")))?;

        let statements = match parse_statements(source) {
            Ok(statements) => statements,
            Err(message) => {
                return Ok(ValidationOutcome::Violations {
                    violations: vec![Violation::new(
                        WELL_FORMED_SHAPE,
                        source.path.clone(),
                        "",
                        message,
                        Severity::Blocking,
                    )],
                });
            }
        };

        let graph = normalize(statements);
        let mut violations = Vec::new();
        for shape in &shape_defs {
            for subject in graph.subjects_with(&shape.target) {
                for required in &shape.requires {
                    if graph.values_of(subject, required).is_empty() {
                        violations.push(Violation::new(
                            shape.id.clone(),
                            subject,
                            required.clone(),
                            format!("missing required property '{required}'"),
                            shape.severity,
                        ));
                    }
                }
                for property in &shape.non_empty {
                    for value in graph.values_of(subject, property) {
                        if value.trim().is_empty() {
                            violations.push(Violation::new(
                                shape.id.clone(),
                                subject,
                                property.clone(),
                                format!("property '{property}' must not be empty"),
                                shape.severity,
                            ));
                        }
                    }
                }
            }
        }

        if violations.iter().any(Violation::is_blocking) {
            Ok(ValidationOutcome::Violations { violations })
        } else {
            Ok(ValidationOutcome::Normalized {
                graph,
                advisories: violations,
            })
        }
    }
}

fn parse_statements(source: &SourceFile) -> Result<Vec<Statement>, String> {
    let root: Value = serde_json::from_slice(&source.bytes)
        .map_err(|error| format!("source is not valid JSON: {error}"))?;
    let Value::Object(subjects) = root else {
        return Err("source root must be a JSON object of subjects".to_string());
    };

    let mut statements = Vec::new();
    for (subject, body) in subjects {
        let Value::Object(predicates) = body else {
            return Err(format!("subject '{subject}' must map to an object"));
        };
        for (predicate, value) in predicates {
            match value {
                Value::Array(items) => {
                    for item in items {
                        statements.push(Statement::new(
                            subject.clone(),
                            predicate.clone(),
                            scalar_to_string(&subject, &predicate, &item)?,
                        ));
                    }
                }
                other => statements.push(Statement::new(
                    subject.clone(),
                    predicate.clone(),
                    scalar_to_string(&subject, &predicate, &other)?,
                )),
            }
        }
    }
    Ok(statements)
}

fn scalar_to_string(subject: &str, predicate: &str, value: &Value) -> Result<String, String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(format!(
            "value of '{subject}.{predicate}' must be a scalar or array of scalars"
        )),
    }
}

fn normalize(mut statements: Vec<Statement>) -> NormalizedGraph {
    statements.sort();
    statements.dedup();
    let hash = hash_statements(&statements);
    NormalizedGraph { statements, hash }
}

#[derive(Clone, Debug, Deserialize)]
struct QueryDef {
    /// Predicate whose statements drive the row set.
    r#match: String,
    /// Column name -> "subject" | "value" | another predicate to join on
    /// the matched subject.
    select: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
pub struct ReferenceQueryEngine;

#[async_trait]
impl QueryEngine for ReferenceQueryEngine {
    async fn extract(
        &self,
        graph: &NormalizedGraph,
        query_text: &str,
    ) -> Result<Vec<BindingRow>, EngineError> {
        let query: QueryDef = serde_json::from_str(query_text)
            .map_err(|error| EngineError::new(format!("malformed query: {error}")))?;
        if query.select.is_empty() {
            return Err(EngineError::new("query selects no columns"));
        }

        let mut rows = Vec::new();
        for statement in graph
            .statements
            .iter()
            .filter(|s| s.predicate == query.r#match)
        {
            let mut row = BindingRow::new();
            for (column, selector) in &query.select {
                let cell = match selector.as_str() {
                    "subject" => statement.subject.clone(),
                    "value" => statement.value.clone(),
                    predicate => graph
                        .values_of(&statement.subject, predicate)
                        .first()
                        .map(|v| (*v).to_string())
                        .unwrap_or_default(),
                };
                row.insert(column.clone(), cell);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

#[derive(Debug, Default)]
pub struct ReferenceTemplateEngine;

#[async_trait]
impl TemplateEngine for ReferenceTemplateEngine {
    async fn render(
        &self,
        template_text: &str,
        rows: &[BindingRow],
        meta: &BindingRow,
    ) -> Result<Vec<u8>, EngineError> {
        let mut rendered = String::new();
        for line in template_text.split_inclusive('\n') {
            if line.contains("{{row.") {
                for row in rows {
                    rendered.push_str(&substitute(line, row, meta)?);
                }
            } else {
                rendered.push_str(&substitute(line, &BindingRow::new(), meta)?);
            }
        }
        Ok(rendered.into_bytes())
    }
}

fn substitute(line: &str, row: &BindingRow, meta: &BindingRow) -> Result<String, EngineError> {
    let mut output = String::new();
    let mut rest = line;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(EngineError::new(format!(
                "unterminated placeholder in line: {}",
                line.trim_end()
            )));
        };
        let name = after[..end].trim();
        let value = if let Some(key) = name.strip_prefix("row.") {
            row.get(key).ok_or_else(|| {
                EngineError::new(format!("template references unknown binding '{key}'"))
            })?
        } else if let Some(key) = name.strip_prefix("meta.") {
            meta.get(key).ok_or_else(|| {
                EngineError::new(format!("template references unknown meta value '{key}'"))
            })?
        } else {
            return Err(EngineError::new(format!(
                "template placeholder '{name}' must use a 'row.' or 'meta.' prefix"
            )));
        };
        output.push_str(value);
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}
