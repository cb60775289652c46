//! Stage contract and results.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use periphgen_core::{Artifact, TemplateContext, TemplateEngine};
use serde::{Deserialize, Serialize};

use crate::cancel::Deadline;
use crate::diagnostic::StageDiagnostic;
use crate::error::StageError;
use crate::runner::{RetryPolicy, ToolRunner};

/// The built-in verification stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Syntax,
    Semantic,
    Compile,
    TestGeneration,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Syntax,
        StageKind::Semantic,
        StageKind::Compile,
        StageKind::TestGeneration,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Syntax => "syntax",
            StageKind::Semantic => "semantic",
            StageKind::Compile => "compile",
            StageKind::TestGeneration => "test_generation",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "syntax" => Ok(StageKind::Syntax),
            "semantic" => Ok(StageKind::Semantic),
            "compile" => Ok(StageKind::Compile),
            "test_generation" | "test-generation" | "testgen" => Ok(StageKind::TestGeneration),
            other => Err(format!(
                "unknown stage {other:?} (expected syntax, semantic, compile or test_generation)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pass,
    Fail,
    Timeout,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pass => "pass",
            StageStatus::Fail => "fail",
            StageStatus::Timeout => "timeout",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage run against one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_name: String,
    pub status: StageStatus,
    pub diagnostics: Vec<StageDiagnostic>,
    pub duration_ms: u64,
    /// Tool invocations made, including retries.
    pub attempts: u32,
    /// The failure came from the environment (missing tool, timeout),
    /// not from the artifact.
    pub infrastructure_failure: bool,
}

impl StageResult {
    pub fn new(stage_name: impl Into<String>, status: StageStatus) -> Self {
        Self {
            stage_name: stage_name.into(),
            status,
            diagnostics: Vec::new(),
            duration_ms: 0,
            attempts: 0,
            infrastructure_failure: false,
        }
    }

    pub fn skipped(stage_name: impl Into<String>) -> Self {
        Self::new(stage_name, StageStatus::Skipped)
    }

    /// Build a failing result from a stage error.
    pub fn from_error(stage_name: impl Into<String>, err: &StageError) -> Self {
        let status = match err {
            StageError::ToolInvocationTimeout { .. } => StageStatus::Timeout,
            StageError::Cancelled { .. } => StageStatus::Skipped,
            _ => StageStatus::Fail,
        };
        let mut result = Self::new(stage_name, status);
        result.infrastructure_failure = err.is_infrastructure();
        result.diagnostics.push(err.to_diagnostic());
        result
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<StageDiagnostic>) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }

    pub fn timed(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }

    pub fn passed(&self) -> bool {
        self.status == StageStatus::Pass
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }
}

/// One verification capability.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Verify `artifact`. Never fails: every error becomes a diagnostic.
    async fn run(
        &self,
        artifact: &Artifact,
        context: &TemplateContext,
        deadline: &Deadline,
    ) -> StageResult;
}

/// Shared services stages draw on.
#[derive(Clone)]
pub struct StageServices {
    pub runner: Arc<dyn ToolRunner>,
    pub retry: RetryPolicy,
    pub engine: TemplateEngine,
}

impl StageServices {
    pub fn new(runner: Arc<dyn ToolRunner>, retry: RetryPolicy, engine: TemplateEngine) -> Self {
        Self {
            runner,
            retry,
            engine,
        }
    }
}

/// The ordered set of stages applied to every artifact.
#[derive(Clone)]
pub struct StagePlan {
    stages: Vec<Arc<dyn Stage>>,
}

impl StagePlan {
    /// Syntax → Semantic → Compile → Test-Generation.
    pub fn standard(services: &StageServices) -> Self {
        Self {
            stages: vec![
                Arc::new(crate::syntax::SyntaxStage::new(services.clone())),
                Arc::new(crate::semantic::SemanticStage::new()),
                Arc::new(crate::compile::CompileStage::new(services.clone())),
                Arc::new(crate::testgen::TestGenerationStage::new(services.clone())),
            ],
        }
    }

    pub fn from_stages(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Append a stage after the existing ones.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Location;

    #[test]
    fn test_stage_names_and_order() {
        let names: Vec<&str> = StageKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(names, ["syntax", "semantic", "compile", "test_generation"]);
        assert!(StageKind::Syntax < StageKind::TestGeneration);
    }

    #[test]
    fn test_stage_kind_from_str() {
        assert_eq!("compile".parse::<StageKind>().unwrap(), StageKind::Compile);
        assert_eq!(
            "test-generation".parse::<StageKind>().unwrap(),
            StageKind::TestGeneration
        );
        assert!("lint".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_result_from_timeout_error() {
        let err = StageError::ToolInvocationTimeout {
            tool: "cc".to_string(),
            elapsed_ms: 2000,
        };
        let result = StageResult::from_error("syntax", &err);
        assert_eq!(result.status, StageStatus::Timeout);
        assert!(result.infrastructure_failure);
        assert!(!result.passed());
    }

    #[test]
    fn test_result_from_compile_error() {
        let err = StageError::CompileError {
            location: Some(Location::new("gpioa.c", Some(3), None)),
            message: "unknown type name 'uint32'".to_string(),
        };
        let result = StageResult::from_error("compile", &err);
        assert_eq!(result.status, StageStatus::Fail);
        assert!(!result.infrastructure_failure);
        assert_eq!(result.error_count(), 1);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&StageStatus::Skipped).unwrap();
        assert_eq!(json, "\"skipped\"");
    }
}
