//! Error types for the verification stages.
//!
//! Stages never return these to the caller: every error is folded into the
//! stage's [`crate::StageResult`] as one or more diagnostics.

use crate::diagnostic::{Location, StageDiagnostic};

/// Errors produced while running an external tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {program}")]
    NotFound { program: String },

    #[error("{program} timed out after {elapsed_ms}ms")]
    Timeout { program: String, elapsed_ms: u64 },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// Transient failures eligible for a bounded retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::NotFound { .. } | ToolError::Timeout { .. })
    }
}

/// Stage-level failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("syntax error: {message}")]
    SyntaxError {
        location: Option<Location>,
        message: String,
    },

    #[error("literal {literal} is not traceable to the descriptor (expected {expected})")]
    SemanticMismatchError {
        literal: String,
        expected: String,
        location: Location,
    },

    #[error("compile error: {message}")]
    CompileError {
        location: Option<Location>,
        message: String,
    },

    #[error("smoke test generation failed: {message}")]
    TestGenerationError { message: String },

    #[error("{tool} exceeded its deadline after {elapsed_ms}ms")]
    ToolInvocationTimeout { tool: String, elapsed_ms: u64 },

    #[error("{tool} was not found on this system")]
    ToolNotFound { tool: String },

    #[error("{tool} was cancelled")]
    Cancelled { tool: String },
}

impl StageError {
    /// Infrastructure failures are reported separately from code defects.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            StageError::ToolInvocationTimeout { .. }
                | StageError::ToolNotFound { .. }
                | StageError::Cancelled { .. }
        )
    }

    pub fn to_diagnostic(&self) -> StageDiagnostic {
        match self {
            StageError::SyntaxError { location, message }
            | StageError::CompileError { location, message } => {
                let diag = StageDiagnostic::error(message.clone());
                match location {
                    Some(location) => diag.with_location(location.clone()),
                    None => diag,
                }
            }
            StageError::SemanticMismatchError {
                literal,
                expected,
                location,
            } => StageDiagnostic::error(format!(
                "literal {literal} is not traceable to the descriptor"
            ))
            .with_location(location.clone())
            .with_values(expected.clone(), literal.clone()),
            other => StageDiagnostic::error(other.to_string()),
        }
    }
}

impl From<ToolError> for StageError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::NotFound { program } => StageError::ToolNotFound { tool: program },
            ToolError::Timeout {
                program,
                elapsed_ms,
            } => StageError::ToolInvocationTimeout {
                tool: program,
                elapsed_ms,
            },
            ToolError::Cancelled { program } => StageError::Cancelled { tool: program },
            ToolError::Io { program, source } => StageError::ToolNotFound {
                tool: format!("{program} ({source})"),
            },
        }
    }
}
