//! Generator configuration.
//!
//! Loaded from an optional JSON file and then overridden by CLI flags. Every
//! field has a default, so an empty `{}` document is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use periphgen_core::EngineConfig;
use periphgen_stages::{RetryPolicy, StageKind};
use serde::{Deserialize, Serialize};

/// What happens after a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every stage after the first failure.
    #[default]
    FailFast,
    /// Run every selected stage and aggregate all diagnostics.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Root for generated artifacts (`<out_dir>/<family>/<file>`).
    pub out_dir: PathBuf,
    /// Root for per-request and batch reports.
    pub report_dir: PathBuf,
    pub failure_policy: FailurePolicy,
    /// Stages to run; unselected stages are reported as skipped.
    pub stages: Vec<StageKind>,
    pub stage_timeout_secs: u64,
    /// Optional cap for a single tool attempt inside a stage.
    pub attempt_timeout_secs: Option<u64>,
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
    /// How long a cancelled tool may run before it is killed.
    pub cancel_grace_secs: u64,
    pub max_workers: usize,
    pub generator_version: String,
    /// Embedded in provenance headers when set.
    pub reproducible_timestamp: Option<DateTime<Utc>>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("generated"),
            report_dir: PathBuf::from("reports"),
            failure_policy: FailurePolicy::FailFast,
            stages: StageKind::ALL.to_vec(),
            stage_timeout_secs: 120,
            attempt_timeout_secs: None,
            retry_limit: 1,
            retry_backoff_ms: 250,
            cancel_grace_secs: 5,
            max_workers: default_workers(),
            generator_version: periphgen_core::VERSION.to_string(),
            reproducible_timestamp: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl GeneratorConfig {
    /// Read a JSON config file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    /// Pick up `SOURCE_DATE_EPOCH` unless a timestamp is already configured.
    pub fn with_env_timestamp(mut self) -> Result<Self> {
        if self.reproducible_timestamp.is_none() {
            if let Ok(raw) = std::env::var("SOURCE_DATE_EPOCH") {
                self.reproducible_timestamp = Some(parse_source_date_epoch(&raw)?);
            }
        }
        Ok(self)
    }

    pub fn stage_selected(&self, kind: StageKind) -> bool {
        self.stages.contains(&kind)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            generator_version: self.generator_version.clone(),
            reproducible_timestamp: self.reproducible_timestamp,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_limit: self.retry_limit,
            backoff_base: Duration::from_millis(self.retry_backoff_ms),
            attempt_timeout: self.attempt_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Parse a `SOURCE_DATE_EPOCH` value (whole seconds since the Unix epoch).
pub fn parse_source_date_epoch(raw: &str) -> Result<DateTime<Utc>> {
    let secs: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("SOURCE_DATE_EPOCH is not an integer: {raw:?}"))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .with_context(|| format!("SOURCE_DATE_EPOCH out of range: {secs}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GeneratorConfig::default();
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.stages.len(), 4);
        assert_eq!(config.stage_timeout(), Duration::from_secs(120));
        assert_eq!(config.retry_limit, 1);
        assert!(config.workers() >= 1);
        assert!(config.reproducible_timestamp.is_none());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: GeneratorConfig = serde_json::from_str(
            r#"{ "failure_policy": "continue", "stages": ["syntax", "semantic"] }"#,
        )
        .unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Continue);
        assert!(config.stage_selected(StageKind::Semantic));
        assert!(!config.stage_selected(StageKind::Compile));
        assert_eq!(config.retry_backoff_ms, 250);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("periphgen.json");
        std::fs::write(&path, r#"{ "max_workers": 3, "stage_timeout_secs": 30 }"#).unwrap();
        let config = GeneratorConfig::load(&path).unwrap();
        assert_eq!(config.workers(), 3);
        assert_eq!(config.stage_timeout_secs, 30);
    }

    #[test]
    fn test_source_date_epoch() {
        let ts = parse_source_date_epoch("1700000000").unwrap();
        assert_eq!(ts.to_rfc3339(), "2023-11-14T22:13:20+00:00");
        assert!(parse_source_date_epoch("yesterday").is_err());
    }

    #[test]
    fn test_retry_policy_mapping() {
        let config = GeneratorConfig {
            attempt_timeout_secs: Some(10),
            ..GeneratorConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.attempt_timeout, Some(Duration::from_secs(10)));
        assert_eq!(policy.backoff_base, Duration::from_millis(250));
    }
}
