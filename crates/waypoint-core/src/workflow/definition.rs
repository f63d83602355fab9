//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML/JSON documents and the canonical `WorkflowDefinition`,
//! validates structural constraints (unique IDs, semver version, positive
//! timeouts, acyclic dependencies), and provides discovery for definition
//! files on disk.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use waypoint_types::workflow::WorkflowDefinition;

use super::dag::{self, DagError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Where in a document a parse error occurred (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} column {}", self.line, self.column)
    }
}

/// Errors raised while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON deserialization failure. `message` carries the serde field path.
    #[error("parse error{}: {message}", .location.map(|l| format!(" at {l}")).unwrap_or_default())]
    Parse {
        message: String,
        location: Option<Location>,
    },

    /// Structural validation failure on a specific field.
    #[error("invalid {field}: {message}")]
    Invalid { field: String, message: String },

    /// Dependency graph defect (cycle or unknown dependency).
    #[error(transparent)]
    Dag(#[from] DagError),

    /// Filesystem I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DefinitionError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        DefinitionError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<serde_yaml_ng::Error> for DefinitionError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        let location = e.location().map(|l| Location {
            line: l.line(),
            column: l.column(),
        });
        DefinitionError::Parse {
            message: e.to_string(),
            location,
        }
    }
}

impl From<serde_json::Error> for DefinitionError {
    fn from(e: serde_json::Error) -> Self {
        let location = (e.line() > 0).then(|| Location {
            line: e.line(),
            column: e.column(),
        });
        DefinitionError::Parse {
            message: e.to_string(),
            location,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml)?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_definition_json(json: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition = serde_json::from_str(json)?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    Ok(serde_yaml_ng::to_string(def)?)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Workflow ID is non-empty and contains only alphanumerics, `-`, `_`, `.`
/// - Version parses as semver
/// - Stage IDs are valid and unique, handlers non-empty
/// - Timeouts are > 0 when set
/// - Dependencies exist and form no cycle
///
/// A definition with zero stages is valid.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if !is_valid_id(&def.id) {
        return Err(DefinitionError::invalid(
            "id",
            format!(
                "workflow id '{}' must be non-empty and contain only alphanumerics, '-', '_' or '.'",
                def.id
            ),
        ));
    }

    semver::Version::parse(&def.version).map_err(|e| {
        DefinitionError::invalid("version", format!("'{}' is not a semantic version: {e}", def.version))
    })?;

    if def.timeout_secs == Some(0) {
        return Err(DefinitionError::invalid("timeout_secs", "timeout must be > 0"));
    }

    let mut seen = HashSet::new();
    for (i, stage) in def.stages.iter().enumerate() {
        if !is_valid_id(&stage.id) {
            return Err(DefinitionError::invalid(
                format!("stages[{i}].id"),
                format!("stage id '{}' is empty or contains invalid characters", stage.id),
            ));
        }
        if !seen.insert(stage.id.as_str()) {
            return Err(DefinitionError::invalid(
                format!("stages[{i}].id"),
                format!("duplicate stage ID: '{}'", stage.id),
            ));
        }
        if stage.handler.trim().is_empty() {
            return Err(DefinitionError::invalid(
                format!("stages[{i}].handler"),
                format!("stage '{}' has no handler", stage.id),
            ));
        }
        if stage.timeout_secs == Some(0) {
            return Err(DefinitionError::invalid(
                format!("stages[{i}].timeout_secs"),
                "timeout must be > 0",
            ));
        }
    }

    dag::validate_dag(&def.stages)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a file. `.json` files are parsed as JSON,
/// everything else as YAML.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_definition_json(&content),
        _ => parse_definition_yaml(&content),
    }
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_definition_file(path: &Path, def: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let io = |source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    let yaml = serialize_definition_yaml(def)?;
    std::fs::write(path, yaml).map_err(io)?;
    Ok(())
}

/// Discover all workflow definition files under `base_dir`.
///
/// Scans for `.yaml`, `.yml` and `.json` files recursively. Files that fail
/// to parse are skipped with a warning.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, DefinitionError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), DefinitionError> {
    let io = |source| DefinitionError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        ) {
            match load_definition_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(error) => {
                    tracing::warn!(?path, %error, "skipping unparseable workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
