//! Structured observability hooks for generation requests.
//!
//! This module provides:
//! - Request-scoped tracing spans via the `RequestSpan` RAII guard
//! - Emission functions for key lifecycle events: request start/finish,
//!   stage completion, descriptor cache activity, artifact writes and batch
//!   completion
//!
//! Events are emitted at `info!` level with a stable `event` field so log
//! pipelines can filter on it.

use tracing::{debug, info};

/// RAII guard that enters a request-scoped tracing span.
///
/// ```ignore
/// let _span = RequestSpan::enter("stm32f4/gpioa");
/// // Every tracing call on this thread is now tagged with request_id.
/// ```
pub struct RequestSpan {
    _span: tracing::span::EnteredSpan,
}

impl RequestSpan {
    /// Create and enter a span tagged with the request id.
    pub fn enter(request_id: &str) -> Self {
        Self {
            _span: request_span(request_id).entered(),
        }
    }
}

/// The request span itself, for instrumenting futures that cross threads.
pub fn request_span(request_id: &str) -> tracing::Span {
    tracing::info_span!("periphgen.request", request_id = %request_id)
}

/// Emit event: a generation request started.
pub fn emit_request_started(request_id: &str, platform: &str, peripheral: &str) {
    info!(
        event = "request.started",
        request_id = %request_id,
        platform = %platform,
        peripheral = %peripheral,
    );
}

/// Emit event: one stage finished.
pub fn emit_stage_finished(request_id: &str, stage: &str, status: &str, duration_ms: u64) {
    info!(
        event = "stage.finished",
        request_id = %request_id,
        stage = %stage,
        status = %status,
        duration_ms = duration_ms,
    );
}

/// Emit event: a request finished with its overall verdict.
pub fn emit_request_finished(request_id: &str, passed: bool, furthest_stage: &str) {
    info!(
        event = "request.finished",
        request_id = %request_id,
        passed = passed,
        furthest_stage = %furthest_stage,
    );
}

/// Emit event: a batch finished.
pub fn emit_batch_finished(run_id: &str, total: usize, passed: usize, cancelled: bool) {
    info!(
        event = "batch.finished",
        run_id = %run_id,
        total = total,
        passed = passed,
        cancelled = cancelled,
    );
}

/// Emit event: a descriptor was parsed from source.
pub fn emit_descriptor_parsed(path: &str, digest: &str, peripherals: usize) {
    info!(
        event = "descriptor.parsed",
        path = %path,
        digest = %digest,
        peripherals = peripherals,
    );
}

/// Emit event: a descriptor was served from the cache.
pub fn emit_descriptor_cache_hit(path: &str, digest: &str) {
    debug!(event = "descriptor.cache_hit", path = %path, digest = %digest);
}

/// Emit event: an artifact write completed (or was skipped as unchanged).
pub fn emit_artifact_written(path: &str, outcome: &str) {
    info!(event = "artifact.written", path = %path, outcome = %outcome);
}
