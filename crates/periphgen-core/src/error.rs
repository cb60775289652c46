//! Error taxonomy for the generation front half.
//!
//! Everything that can go wrong before a candidate artifact exists:
//! descriptor parsing, metadata validation, context construction and
//! template rendering. Stage-level errors live in `periphgen-stages`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn located(file: &Path, line: &Option<usize>) -> String {
    match line {
        Some(line) => format!("{}:{}", file.display(), line),
        None => file.display().to_string(),
    }
}

/// A hardware descriptor that could not be turned into a [`crate::Device`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {message}", located(.file, .line))]
pub struct DescriptorParseError {
    /// Descriptor file the error refers to.
    pub file: PathBuf,
    /// 1-indexed line, when the failure can be pinned to one.
    pub line: Option<usize>,
    pub message: String,
}

impl DescriptorParseError {
    pub fn new(file: impl Into<PathBuf>, line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

/// The specific rule a metadata field broke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum SchemaViolation {
    MissingRequired,
    WrongType { expected: String, found: String },
    OutOfRange { value: String, min: Option<i64>, max: Option<i64> },
    NotInEnum { value: String, allowed: Vec<String> },
    PatternMismatch { value: String, pattern: String },
    UnknownField,
    UnknownSchemaVersion { version: String, known: Vec<u32> },
    UnknownKind { kind: String },
    /// The schema itself carries a pattern that does not compile.
    InvalidPattern { pattern: String, error: String },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaViolation::MissingRequired => write!(f, "required field is missing"),
            SchemaViolation::WrongType { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            SchemaViolation::OutOfRange { value, min, max } => {
                write!(f, "value {value} out of range")?;
                match (min, max) {
                    (Some(min), Some(max)) => write!(f, " [{min}, {max}]"),
                    (Some(min), None) => write!(f, " (min {min})"),
                    (None, Some(max)) => write!(f, " (max {max})"),
                    (None, None) => Ok(()),
                }
            }
            SchemaViolation::NotInEnum { value, allowed } => {
                write!(f, "{value} is not one of [{}]", allowed.join(", "))
            }
            SchemaViolation::PatternMismatch { value, pattern } => {
                write!(f, "{value:?} does not match /{pattern}/")
            }
            SchemaViolation::UnknownField => write!(f, "field is not declared by the schema"),
            SchemaViolation::UnknownSchemaVersion { version, known } => {
                let known: Vec<String> = known.iter().map(|v| v.to_string()).collect();
                write!(
                    f,
                    "unknown schema version {version} (known: {})",
                    known.join(", ")
                )
            }
            SchemaViolation::UnknownKind { kind } => write!(f, "unknown document kind {kind}"),
            SchemaViolation::InvalidPattern { pattern, error } => {
                write!(f, "schema pattern /{pattern}/ is invalid: {error}")
            }
        }
    }
}

/// One field-level violation in a metadata document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{document}: {path}: {violation}")]
pub struct SchemaError {
    /// Document name (usually its path).
    pub document: String,
    /// Dotted field path, `$` for the document root.
    pub path: String,
    pub violation: SchemaViolation,
}

/// Every violation found in one validation pass.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{} schema violation(s): {}", .0.len(), join_errors(.0))]
pub struct SchemaErrors(pub Vec<SchemaError>);

fn join_errors(errors: &[SchemaError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl SchemaErrors {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaError> {
        self.0.iter()
    }
}

/// Why a render failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderFailure {
    /// The template referenced a context path that does not exist.
    UnresolvedVariable,
    /// The template itself is malformed or misuses a value.
    TemplateDefect,
}

/// A template that could not be rendered against its context.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "{template}:{}: {}{detail}",
    .line.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string()),
    .variable.as_ref().map(|v| format!("unresolved variable `{v}`: ")).unwrap_or_default()
)]
pub struct TemplateRenderError {
    /// Template file name.
    pub template: String,
    pub line: Option<usize>,
    /// Dotted variable path that failed to resolve.
    pub variable: Option<String>,
    pub failure: RenderFailure,
    pub detail: String,
}

/// Metadata and descriptor facts that cannot be joined into a context.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("peripheral instance {instance} is not declared by descriptor {device}")]
    UnknownInstance { instance: String, device: String },

    #[error("role {role} names register {register}, which {instance} does not declare")]
    UnknownRegister {
        role: String,
        register: String,
        instance: String,
    },

    #[error("{kind} metadata is malformed: {detail}")]
    InvalidMetadata { kind: String, detail: String },

    #[error("expected {expected} metadata, got {found}")]
    WrongKind { expected: String, found: String },
}

/// Any failure before a candidate artifact exists.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("descriptor: {0}")]
    Descriptor(#[from] DescriptorParseError),

    #[error("schema: {0}")]
    Schema(#[from] SchemaErrors),

    #[error("context: {0}")]
    Context(#[from] ContextError),

    #[error("template: {0}")]
    Render(#[from] TemplateRenderError),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: invalid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl GenerationError {
    /// Pipeline phase that produced the error.
    pub fn phase(&self) -> &'static str {
        match self {
            GenerationError::Descriptor(_) => "descriptor",
            GenerationError::Schema(_) => "schema",
            GenerationError::Context(_) => "context",
            GenerationError::Render(_) => "template",
            GenerationError::Io { .. } | GenerationError::Json { .. } => "input",
        }
    }

    /// Flatten into `(location, message)` pairs; schema errors expand to one
    /// entry per violation.
    pub fn located_messages(&self) -> Vec<(Option<String>, String)> {
        match self {
            GenerationError::Descriptor(e) => {
                vec![(Some(located(&e.file, &e.line)), e.message.clone())]
            }
            GenerationError::Schema(errors) => errors
                .iter()
                .map(|e| {
                    (
                        Some(format!("{}#{}", e.document, e.path)),
                        e.violation.to_string(),
                    )
                })
                .collect(),
            GenerationError::Render(e) => {
                let location = match e.line {
                    Some(line) => format!("{}:{}", e.template, line),
                    None => e.template.clone(),
                };
                let message = match &e.variable {
                    Some(var) => format!("unresolved variable `{var}`: {}", e.detail),
                    None => e.detail.clone(),
                };
                vec![(Some(location), message)]
            }
            GenerationError::Context(e) => vec![(None, e.to_string())],
            GenerationError::Io { path, source } => {
                vec![(Some(path.display().to_string()), source.to_string())]
            }
            GenerationError::Json { path, source } => vec![(
                Some(format!("{}:{}", path.display(), source.line())),
                source.to_string(),
            )],
        }
    }
}

/// Result type for generation front-half operations.
pub type Result<T> = std::result::Result<T, GenerationError>;
