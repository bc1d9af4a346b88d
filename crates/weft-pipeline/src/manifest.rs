use crate::errors::WeftError;
use crate::hash::hash_bytes;
use crate::model::{OutputKind, ShapeSet, SourceFile};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use weft_store::ContentHash;

pub const MANIFEST_FILE_NAME: &str = "weft.json";

/// One transformation rule: one source + the shared shape set + one query
/// + one template, bound to one output path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub source: String,
    pub query: String,
    pub template: String,
    pub output: String,
    #[serde(default)]
    pub kind: OutputKind,
}

/// The declared configuration of a workspace: which sources feed which
/// queries feed which templates feed which outputs. The dependency graph
/// is rebuilt from this on every run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceManifest {
    pub sources: Vec<String>,
    pub shapes: String,
    pub rules: Vec<Rule>,
}

impl WorkspaceManifest {
    pub fn load(path: &Path) -> Result<Self, WeftError> {
        let raw = fs::read(path).map_err(|error| {
            WeftError::Manifest(format!(
                "failed reading manifest '{}': {}",
                path.display(),
                error
            ))
        })?;
        let manifest: WorkspaceManifest = serde_json::from_slice(&raw).map_err(|error| {
            WeftError::Manifest(format!(
                "failed parsing manifest '{}': {}",
                path.display(),
                error
            ))
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), WeftError> {
        if self.rules.is_empty() {
            return Err(WeftError::Manifest(
                "manifest declares no rules".to_string(),
            ));
        }
        if self.shapes.trim().is_empty() {
            return Err(WeftError::Manifest(
                "manifest declares no shapes file".to_string(),
            ));
        }

        let declared_sources: BTreeSet<&str> =
            self.sources.iter().map(String::as_str).collect();
        let mut seen_names = BTreeSet::new();
        let mut seen_outputs = BTreeSet::new();

        for rule in &self.rules {
            if rule.name.is_empty() {
                return Err(WeftError::Manifest("rule with empty name".to_string()));
            }
            // Rule names become checkpoint file names.
            if rule
                .name
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
            {
                return Err(WeftError::Manifest(format!(
                    "rule name '{}' contains unsupported characters",
                    rule.name
                )));
            }
            if !seen_names.insert(rule.name.as_str()) {
                return Err(WeftError::Manifest(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            if !declared_sources.contains(rule.source.as_str()) {
                return Err(WeftError::Manifest(format!(
                    "rule '{}' references undeclared source '{}'",
                    rule.name, rule.source
                )));
            }
            if !seen_outputs.insert(rule.output.as_str()) {
                return Err(WeftError::Manifest(format!(
                    "output path '{}' is produced by more than one rule",
                    rule.output
                )));
            }
            validate_output_path(&rule.name, &rule.output)?;
        }
        Ok(())
    }

    /// Rules in declaration order; downstream caching keys depend on this
    /// order being stable.
    pub fn rules_in_order(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }
}

fn validate_output_path(rule: &str, output: &str) -> Result<(), WeftError> {
    let path = Path::new(output);
    if path.is_absolute() {
        return Err(WeftError::Manifest(format!(
            "rule '{rule}' output '{output}' must be workspace-relative"
        )));
    }
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(WeftError::Manifest(format!(
            "rule '{rule}' output '{output}' escapes the workspace"
        )));
    }
    if output.starts_with(weft_store::STORE_DIR_NAME) {
        return Err(WeftError::Manifest(format!(
            "rule '{rule}' output '{output}' collides with the store directory"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryFile {
    pub path: String,
    pub text: String,
    pub hash: ContentHash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateFile {
    pub path: String,
    pub text: String,
    pub hash: ContentHash,
}

/// Every manifest-declared input read and hashed up front. The planner
/// diffs `input_hashes` against the previous receipt.
#[derive(Clone, Debug)]
pub struct LoadedInputs {
    pub sources: BTreeMap<String, SourceFile>,
    pub shapes: ShapeSet,
    pub queries: BTreeMap<String, QueryFile>,
    pub templates: BTreeMap<String, TemplateFile>,
}

impl LoadedInputs {
    pub fn load(root: &Path, manifest: &WorkspaceManifest) -> Result<Self, WeftError> {
        let mut sources = BTreeMap::new();
        for path in &manifest.sources {
            let bytes = read_input(root, path)?;
            sources.insert(
                path.clone(),
                SourceFile {
                    path: path.clone(),
                    hash: hash_bytes(&bytes),
                    bytes,
                },
            );
        }

        let shape_bytes = read_input(root, &manifest.shapes)?;
        let shapes = ShapeSet {
            paths: vec![manifest.shapes.clone()],
            hash: hash_bytes(&shape_bytes),
            bytes: shape_bytes,
        };

        let mut queries = BTreeMap::new();
        let mut templates = BTreeMap::new();
        for rule in &manifest.rules {
            if !queries.contains_key(&rule.query) {
                let bytes = read_input(root, &rule.query)?;
                queries.insert(
                    rule.query.clone(),
                    QueryFile {
                        path: rule.query.clone(),
                        hash: hash_bytes(&bytes),
                        text: into_utf8(&rule.query, bytes)?,
                    },
                );
            }
            if !templates.contains_key(&rule.template) {
                let bytes = read_input(root, &rule.template)?;
                templates.insert(
                    rule.template.clone(),
                    TemplateFile {
                        path: rule.template.clone(),
                        hash: hash_bytes(&bytes),
                        text: into_utf8(&rule.template, bytes)?,
                    },
                );
            }
        }

        Ok(Self {
            sources,
            shapes,
            queries,
            templates,
        })
    }

    /// Per-input hash map as recorded in the receipt, keyed by path.
    pub fn input_hashes(&self) -> BTreeMap<String, ContentHash> {
        let mut hashes = BTreeMap::new();
        for (path, source) in &self.sources {
            hashes.insert(path.clone(), source.hash.clone());
        }
        for path in &self.shapes.paths {
            hashes.insert(path.clone(), self.shapes.hash.clone());
        }
        for (path, query) in &self.queries {
            hashes.insert(path.clone(), query.hash.clone());
        }
        for (path, template) in &self.templates {
            hashes.insert(path.clone(), template.hash.clone());
        }
        hashes
    }
}

fn read_input(root: &Path, relative: &str) -> Result<Vec<u8>, WeftError> {
    let path = root.join(relative);
    fs::read(&path).map_err(|error| {
        WeftError::Io(format!(
            "failed reading input '{}': {}",
            path.display(),
            error
        ))
    })
}

fn into_utf8(path: &str, bytes: Vec<u8>) -> Result<String, WeftError> {
    String::from_utf8(bytes)
        .map_err(|_| WeftError::Io(format!("input '{path}' is not valid UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> WorkspaceManifest {
        WorkspaceManifest {
            sources: vec!["specs/commands.json".to_string()],
            shapes: "shapes/core.json".to_string(),
            rules: vec![Rule {
                name: "cli-docs".to_string(),
                source: "specs/commands.json".to_string(),
                query: "queries/commands.json".to_string(),
                template: "templates/doc.tmpl".to_string(),
                output: "gen/commands.md".to_string(),
                kind: OutputKind::Text,
            }],
        }
    }

    #[test]
    fn validate_well_formed_expected_ok() {
        manifest().validate().expect("manifest should validate");
    }

    #[test]
    fn validate_undeclared_source_expected_manifest_error() {
        let mut bad = manifest();
        bad.rules[0].source = "specs/other.json".to_string();

        let error = bad.validate().expect_err("undeclared source should fail");
        assert!(error.to_string().contains("undeclared source"));
    }

    #[test]
    fn validate_duplicate_output_expected_manifest_error() {
        let mut bad = manifest();
        let mut second = bad.rules[0].clone();
        second.name = "cli-docs-2".to_string();
        bad.rules.push(second);

        let error = bad.validate().expect_err("duplicate output should fail");
        assert!(error.to_string().contains("more than one rule"));
    }

    #[test]
    fn validate_rule_name_with_separator_expected_manifest_error() {
        let mut bad = manifest();
        bad.rules[0].name = "cli/docs".to_string();

        let error = bad.validate().expect_err("slash in rule name should fail");
        assert!(error.to_string().contains("unsupported characters"));
    }

    #[test]
    fn validate_escaping_output_expected_manifest_error() {
        let mut bad = manifest();
        bad.rules[0].output = "../outside.md".to_string();

        let error = bad.validate().expect_err("escaping output should fail");
        assert!(error.to_string().contains("escapes the workspace"));
    }

    #[test]
    fn load_inputs_expected_hashes_for_every_input_kind() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let root = tmp.path();
        std::fs::create_dir_all(root.join("specs")).expect("mkdir");
        std::fs::create_dir_all(root.join("shapes")).expect("mkdir");
        std::fs::create_dir_all(root.join("queries")).expect("mkdir");
        std::fs::create_dir_all(root.join("templates")).expect("mkdir");
        std::fs::write(root.join("specs/commands.json"), b"{}").expect("write");
        std::fs::write(root.join("shapes/core.json"), b"[]").expect("write");
        std::fs::write(root.join("queries/commands.json"), b"{}").expect("write");
        std::fs::write(root.join("templates/doc.tmpl"), b"x").expect("write");

        let inputs = LoadedInputs::load(root, &manifest()).expect("inputs should load");
        let hashes = inputs.input_hashes();
        assert_eq!(hashes.len(), 4);
        assert!(hashes.contains_key("specs/commands.json"));
        assert!(hashes.contains_key("shapes/core.json"));
        assert!(hashes.contains_key("queries/commands.json"));
        assert!(hashes.contains_key("templates/doc.tmpl"));
    }
}
