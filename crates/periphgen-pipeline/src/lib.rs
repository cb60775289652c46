//! periphgen pipeline
//!
//! Sequences the core library and the verification stages per request, runs
//! batches on a bounded worker pool, writes passing artifacts without
//! touching unchanged files and persists JSON reports.

pub mod config;
pub mod orchestrator;
pub mod report;
pub mod request;
pub mod writer;

pub use config::{parse_source_date_epoch, FailurePolicy, GeneratorConfig};
pub use orchestrator::Orchestrator;
pub use report::{
    BatchReport, BatchTotals, GenerationIssue, ValidationReport, BATCH_REPORT_FILE,
    REPORT_SCHEMA_VERSION,
};
pub use request::GenerationRequest;
pub use writer::{write_if_changed, WriteOutcome};
