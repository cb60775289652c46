//! Request orchestration: metadata → descriptor → context → render → stages
//! → write → report, for one request or a bounded concurrent batch.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use periphgen_core::obs;
use periphgen_core::{
    request_span, validate, Artifact, DescriptorCache, DocumentKind, GenerationError,
    MetadataDocument, PlatformMetadata, SchemaErrors, SourceIdentity, TemplateContext,
    TemplateEngine, TemplateSource, ValidatedMetadata,
};
use periphgen_stages::{
    CancelToken, Deadline, ProcessRunner, StagePlan, StageResult, StageServices, StageStatus,
    ToolRunner,
};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{FailurePolicy, GeneratorConfig};
use crate::report::{
    report_path, write_json, BatchReport, GenerationIssue, ValidationReport, BATCH_REPORT_FILE,
};
use crate::request::GenerationRequest;
use crate::writer::write_if_changed;

/// A rendered artifact with the context it was rendered from.
struct Prepared {
    context: TemplateContext,
    artifact: Artifact,
}

/// Drives requests through the pipeline.
///
/// Cheap to clone: configuration, the descriptor cache and the stage plan are
/// shared. The cache is injected so one instance serves a whole process.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<GeneratorConfig>,
    cache: Arc<DescriptorCache>,
    plan: StagePlan,
    engine: TemplateEngine,
}

impl Orchestrator {
    /// Standard stages backed by real subprocesses.
    pub fn new(config: GeneratorConfig, cache: Arc<DescriptorCache>) -> Self {
        let runner = Arc::new(ProcessRunner::new(Duration::from_secs(
            config.cancel_grace_secs,
        )));
        Self::with_runner(config, cache, runner)
    }

    /// Standard stages with a caller-supplied tool runner.
    pub fn with_runner(
        config: GeneratorConfig,
        cache: Arc<DescriptorCache>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        let engine = TemplateEngine::new(config.engine_config());
        let services = StageServices::new(runner, config.retry_policy(), engine.clone());
        let plan = StagePlan::standard(&services);
        Self::with_plan(config, cache, plan)
    }

    pub fn with_plan(config: GeneratorConfig, cache: Arc<DescriptorCache>, plan: StagePlan) -> Self {
        Self {
            engine: TemplateEngine::new(config.engine_config()),
            config: Arc::new(config),
            cache,
            plan,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DescriptorCache> {
        &self.cache
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    /// Run one request to completion.
    pub async fn generate(&self, request: &GenerationRequest) -> ValidationReport {
        self.generate_with_cancel(request, &CancelToken::never()).await
    }

    /// Run one request, observing `cancel` between and inside stages.
    pub async fn generate_with_cancel(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> ValidationReport {
        let span = request_span(&request.label());
        self.run_request(request, cancel).instrument(span).await
    }

    async fn run_request(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> ValidationReport {
        let mut report = ValidationReport::new(request);
        obs::emit_request_started(
            &report.request_id,
            &request.platform.display().to_string(),
            &request.peripheral.display().to_string(),
        );

        match self.prepare(request).await {
            Err(err) => {
                warn!(request_id = %report.request_id, phase = err.phase(), error = %err, "generation failed before verification");
                report.fail_generation(&err);
            }
            Ok(prepared) => {
                report.request_id = prepared.context.request_id();
                report.artifact_path = Some(self.config.out_dir.join(&prepared.artifact.relative_path));
                report.artifact_digest = Some(prepared.artifact.digest());
                report.provenance = Some(prepared.artifact.provenance.clone());

                self.verify(&prepared, cancel, &mut report).await;
                if report.passed {
                    self.write_artifact(&prepared.artifact, &mut report).await;
                }
            }
        }

        report.finished_at = Utc::now();
        self.persist(&mut report).await;
        obs::emit_request_finished(
            &report.request_id,
            report.passed,
            report.furthest_stage.as_deref().unwrap_or("none"),
        );
        report
    }

    /// Validate every metadata document, parse the descriptor, build the
    /// context and render the artifact.
    async fn prepare(&self, request: &GenerationRequest) -> Result<Prepared, GenerationError> {
        let (platform, peripheral, board) = validate_request(request)?;

        let platform_view = PlatformMetadata::from_validated(&platform)?;
        let descriptor_path = platform.resolve_path(&platform_view.descriptor);
        let (device, digest) = self.cache.parse_with_digest(&descriptor_path).await?;
        let descriptor = SourceIdentity {
            name: file_name(&descriptor_path),
            sha256: digest,
        };

        let context =
            TemplateContext::build(&platform, &peripheral, board.as_ref(), device, descriptor)?;
        let template = TemplateSource::load(&peripheral.resolve_path(&context.peripheral().template))?;
        let artifact = self.engine.render(&template, &context)?;
        debug!(artifact = %artifact.relative_path.display(), digest = %artifact.digest(), "rendered");

        Ok(Prepared { context, artifact })
    }

    /// Run the stage plan in order, honouring selection, failure policy and
    /// cancellation.
    async fn verify(&self, prepared: &Prepared, cancel: &CancelToken, report: &mut ValidationReport) {
        let timeout = prepared
            .context
            .platform()
            .toolchain
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.stage_timeout());

        let mut halted = false;
        let mut all_passed = true;
        for stage in self.plan.stages() {
            let name = stage.name();
            if !self.config.stage_selected(stage.kind()) || halted {
                report.stages.push(StageResult::skipped(name));
                continue;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.stages.push(StageResult::skipped(name));
                continue;
            }

            let deadline = Deadline::after(timeout, cancel.clone());
            let result = stage.run(&prepared.artifact, &prepared.context, &deadline).await;
            obs::emit_stage_finished(
                &report.request_id,
                name,
                result.status.as_str(),
                result.duration_ms,
            );
            report.furthest_stage = Some(name.to_string());

            if !result.passed() {
                all_passed = false;
                if result.status == StageStatus::Skipped {
                    // Only a cancelled tool reports a run stage as skipped.
                    report.cancelled = true;
                }
                if self.config.failure_policy == FailurePolicy::FailFast {
                    halted = true;
                }
            }
            report.stages.push(result);
        }

        report.passed = all_passed && !report.cancelled;
    }

    async fn write_artifact(&self, artifact: &Artifact, report: &mut ValidationReport) {
        let path = self.config.out_dir.join(&artifact.relative_path);
        let target = path.clone();
        let content = artifact.text.clone().into_bytes();
        let written = tokio::task::spawn_blocking(move || write_if_changed(&target, &content))
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(e)));
        match written {
            Ok(outcome) => {
                report.write_outcome = outcome;
                obs::emit_artifact_written(&path.display().to_string(), outcome.as_str());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write artifact");
                report.generation_errors.push(GenerationIssue {
                    phase: "write".to_string(),
                    location: Some(path.display().to_string()),
                    message: e.to_string(),
                });
                report.passed = false;
            }
        }
    }

    async fn persist(&self, report: &mut ValidationReport) {
        let path = report_path(
            &self.config.report_dir,
            &report.request_id,
            report.board.as_deref(),
        );
        report.report_path = Some(path.clone());
        if let Err(e) = write_json(&path, &*report).await {
            warn!(path = %path.display(), error = %e, "failed to persist report");
            report.report_path = None;
        }
    }

    /// Report for a request that was never dispatched.
    async fn cancelled_report(&self, request: &GenerationRequest) -> ValidationReport {
        let mut report = ValidationReport::new(request);
        report.cancelled = true;
        report.stages = self
            .plan
            .stages()
            .iter()
            .map(|s| StageResult::skipped(s.name()))
            .collect();
        report.finished_at = Utc::now();
        self.persist(&mut report).await;
        report
    }

    /// Run `requests` concurrently on at most `max_workers` workers.
    ///
    /// Reports come back in request order regardless of completion order.
    /// Once `cancel` fires no further request is started; requests still
    /// queued are reported as cancelled with every stage skipped.
    pub async fn generate_batch(
        &self,
        requests: Vec<GenerationRequest>,
        cancel: CancelToken,
    ) -> BatchReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let workers = self.config.workers();
        info!(run_id = %run_id, requests = requests.len(), workers, "starting batch");

        let semaphore = Arc::new(Semaphore::new(workers));
        let results: Arc<Mutex<Vec<(usize, ValidationReport)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(requests.len())));
        let mut join_set = JoinSet::new();

        for (index, request) in requests.iter().cloned().enumerate() {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let report = match permit {
                    Some(_permit) if !cancel.is_cancelled() => {
                        this.generate_with_cancel(&request, &cancel).await
                    }
                    _ => this.cancelled_report(&request).await,
                };
                results.lock().await.push((index, report));
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                warn!(run_id = %run_id, error = %e, "batch worker task failed");
            }
        }

        let mut slots: Vec<Option<ValidationReport>> = vec![None; requests.len()];
        for (index, report) in results.lock().await.drain(..) {
            slots[index] = Some(report);
        }
        let reports = slots
            .into_iter()
            .zip(&requests)
            .map(|(slot, request)| {
                slot.unwrap_or_else(|| {
                    let mut report = ValidationReport::new(request);
                    report
                        .generation_errors
                        .push(GenerationIssue::new("worker", "generation task aborted"));
                    report
                })
            })
            .collect();

        let mut batch = BatchReport::new(run_id, started_at, reports);
        let path = self.config.report_dir.join(BATCH_REPORT_FILE);
        batch.report_path = Some(path.clone());
        if let Err(e) = write_json(&path, &batch).await {
            warn!(path = %path.display(), error = %e, "failed to persist batch report");
            batch.report_path = None;
        }
        obs::emit_batch_finished(
            &run_id.to_string(),
            batch.totals.total,
            batch.totals.passed,
            cancel.is_cancelled(),
        );
        batch
    }
}

/// Validate the request's documents, aggregating violations across all of
/// them so an author sees every problem at once.
fn validate_request(
    request: &GenerationRequest,
) -> Result<(ValidatedMetadata, ValidatedMetadata, Option<ValidatedMetadata>), GenerationError> {
    let mut violations = Vec::new();
    let mut check = |path: &Path, kind: DocumentKind| -> Result<_, GenerationError> {
        let document = MetadataDocument::load(path)?;
        match validate(&document, kind) {
            Ok(validated) => Ok(Some(validated)),
            Err(SchemaErrors(errors)) => {
                violations.extend(errors);
                Ok(None)
            }
        }
    };

    let platform = check(&request.platform, DocumentKind::Platform)?;
    let peripheral = check(&request.peripheral, DocumentKind::Peripheral)?;
    let board = match &request.board {
        Some(board) => check(board, DocumentKind::Board)?,
        None => None,
    };

    match (platform, peripheral) {
        (Some(platform), Some(peripheral)) if violations.is_empty() => {
            Ok((platform, peripheral, board))
        }
        _ => Err(SchemaErrors(violations).into()),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
