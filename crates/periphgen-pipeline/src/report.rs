//! Per-request and batch reports, persisted as pretty JSON for CI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use periphgen_core::{GenerationError, Provenance};
use periphgen_stages::{StageResult, StageStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::request::{stem, GenerationRequest};
use crate::writer::WriteOutcome;

pub const REPORT_SCHEMA_VERSION: u32 = 1;
pub const BATCH_REPORT_FILE: &str = "batch-report.json";

/// A failure before any stage ran: unreadable input, schema violations,
/// descriptor or template errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationIssue {
    pub phase: String,
    pub location: Option<String>,
    pub message: String,
}

impl GenerationIssue {
    pub fn from_error(err: &GenerationError) -> Vec<Self> {
        err.located_messages()
            .into_iter()
            .map(|(location, message)| Self {
                phase: err.phase().to_string(),
                location,
                message,
            })
            .collect()
    }

    pub fn new(phase: &str, message: impl Into<String>) -> Self {
        Self {
            phase: phase.to_string(),
            location: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for GenerationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{location}: {}: {}", self.phase, self.message),
            None => write!(f, "{}: {}", self.phase, self.message),
        }
    }
}

/// Everything known about one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub schema_version: u32,
    /// `<family>/<peripheral>` once metadata validated, file stems before.
    pub request_id: String,
    pub platform: PathBuf,
    pub peripheral: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<PathBuf>,
    pub artifact_path: Option<PathBuf>,
    pub artifact_digest: Option<String>,
    pub provenance: Option<Provenance>,
    pub write_outcome: WriteOutcome,
    pub generation_errors: Vec<GenerationIssue>,
    pub stages: Vec<StageResult>,
    pub passed: bool,
    /// Last stage (or pre-stage phase) that actually ran.
    pub furthest_stage: Option<String>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report_path: Option<PathBuf>,
}

impl ValidationReport {
    pub fn new(request: &GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            request_id: request.label(),
            platform: request.platform.clone(),
            peripheral: request.peripheral.clone(),
            board: request.board.clone(),
            artifact_path: None,
            artifact_digest: None,
            provenance: None,
            write_outcome: WriteOutcome::NotWritten,
            generation_errors: Vec::new(),
            stages: Vec::new(),
            passed: false,
            furthest_stage: None,
            cancelled: false,
            started_at: now,
            finished_at: now,
            report_path: None,
        }
    }

    /// Record a pre-stage failure.
    pub fn fail_generation(&mut self, err: &GenerationError) {
        self.generation_errors.extend(GenerationIssue::from_error(err));
        self.furthest_stage = Some(err.phase().to_string());
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    /// Status shown next to `furthest_stage`.
    pub fn furthest_status(&self) -> &'static str {
        if !self.generation_errors.is_empty() {
            return "fail";
        }
        let furthest = self
            .furthest_stage
            .as_deref()
            .and_then(|name| self.stage(name));
        match furthest {
            Some(stage) => stage.status.as_str(),
            None if self.cancelled => "cancelled",
            None => StageStatus::Skipped.as_str(),
        }
    }

    /// `✓ stm32f4/gpioa  test_generation: pass  (reports/stm32f4/gpioa.report.json)`
    pub fn summary_line(&self) -> String {
        let mark = if self.passed { "✓" } else { "✗" };
        let mut line = format!(
            "{mark} {}  {}: {}",
            self.request_id,
            self.furthest_stage.as_deref().unwrap_or("none"),
            self.furthest_status()
        );
        if self.cancelled {
            line.push_str(" [cancelled]");
        }
        if let Some(path) = &self.report_path {
            line.push_str(&format!("  ({})", path.display()));
        }
        line
    }
}

/// `<report_dir>/<family>/<peripheral>.report.json`, or
/// `<peripheral>@<board>.report.json` for a board-expanded request, since one
/// peripheral may be listed by several boards in the same run.
pub fn report_path(report_dir: &Path, request_id: &str, board: Option<&Path>) -> PathBuf {
    match board {
        Some(board) => report_dir.join(format!("{request_id}@{}.report.json", stem(board))),
        None => report_dir.join(format!("{request_id}.report.json")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchTotals {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Aggregate over a batch, ordered by request index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: BatchTotals,
    pub reports: Vec<ValidationReport>,
    pub report_path: Option<PathBuf>,
}

impl BatchReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, reports: Vec<ValidationReport>) -> Self {
        let cancelled = reports.iter().filter(|r| r.cancelled).count();
        let passed = reports.iter().filter(|r| r.passed).count();
        let failed = reports.iter().filter(|r| !r.passed && !r.cancelled).count();
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            run_id,
            started_at,
            finished_at: Utc::now(),
            totals: BatchTotals {
                total: reports.len(),
                passed,
                failed,
                cancelled,
            },
            reports,
            report_path: None,
        }
    }

    /// True only if every request passed every selected stage.
    pub fn passed(&self) -> bool {
        self.reports.iter().all(|r| r.passed)
    }
}

/// Write `value` as pretty JSON, creating parent directories.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("serialize report")?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
