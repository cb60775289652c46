//! Toolchain command construction and the shared run-a-tool stage body.

use std::path::{Path, PathBuf};
use std::time::Instant;

use periphgen_core::{Artifact, TemplateContext};
use tempfile::TempDir;

use crate::cancel::Deadline;
use crate::diagnostic::{fallback_diagnostic, parse_toolchain_output, Location};
use crate::error::StageError;
use crate::runner::{run_with_retry, ToolCommand};
use crate::stage::{StageResult, StageServices, StageStatus};

/// Sources written to a private scratch directory for one tool run.
pub(crate) struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub(crate) fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::Builder::new().prefix("periphgen-").tempdir()?,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn write(&self, name: &str, text: &str) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, text)?;
        Ok(path)
    }
}

/// Tool paths containing a separator are relative to the platform document.
pub(crate) fn resolve_tool(context: &TemplateContext, program: &str) -> String {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        context.resolve_platform_path(program).display().to_string()
    } else {
        program.to_string()
    }
}

fn include_args(context: &TemplateContext) -> Vec<String> {
    context
        .platform()
        .toolchain
        .include_paths
        .iter()
        .map(|p| {
            let path = Path::new(p);
            let resolved = if path.is_absolute() {
                path.to_path_buf()
            } else {
                context.resolve_platform_path(p)
            };
            format!("-I{}", resolved.display())
        })
        .collect()
}

/// `<checker or cc> -fsyntax-only -x <lang> -I… <file>`
pub(crate) fn syntax_command(
    context: &TemplateContext,
    scratch: &Scratch,
    file: &Path,
) -> ToolCommand {
    let toolchain = &context.platform().toolchain;
    let program = toolchain.syntax_checker.as_deref().unwrap_or(&toolchain.cc);
    ToolCommand::new("syntax", resolve_tool(context, program))
        .arg("-fsyntax-only")
        .args(["-x", toolchain.language.as_str()])
        .args(include_args(context))
        .arg(file.display().to_string())
        .current_dir(scratch.path())
}

/// `<cc> -x <lang> -mcpu=<cpu> <flags…> -I… -c <file> -o <obj>`
pub(crate) fn compile_command(
    label: &str,
    context: &TemplateContext,
    scratch: &Scratch,
    file: &Path,
) -> ToolCommand {
    let toolchain = &context.platform().toolchain;
    let object = file.with_extension("o");
    ToolCommand::new(label, resolve_tool(context, &toolchain.cc))
        .args(["-x", toolchain.language.as_str()])
        .arg(format!("-mcpu={}", context.platform().cpu))
        .args(toolchain.flags.iter().cloned())
        .args(include_args(context))
        .arg("-c")
        .arg(file.display().to_string())
        .arg("-o")
        .arg(object.display().to_string())
        .current_dir(scratch.path())
}

/// Build the stage error for one located toolchain message.
pub(crate) type DefectFn = fn(Option<Location>, String) -> StageError;

/// Run a toolchain command and turn its outcome into a stage result.
pub(crate) async fn run_tool_stage(
    services: &StageServices,
    stage_name: &str,
    command: ToolCommand,
    deadline: &Deadline,
    artifact: &Artifact,
    defect: DefectFn,
) -> StageResult {
    let started = Instant::now();
    let suffix = format!("/{}", artifact.file_name);
    let rename = [(suffix.as_str(), artifact.file_name.as_str())];

    let attempt = run_with_retry(services.runner.as_ref(), &command, deadline, &services.retry).await;
    let mut result = match attempt.result {
        Ok(output) => {
            let combined = format!("{}\n{}", output.stderr, output.stdout);
            let parsed = parse_toolchain_output(&combined, &rename);
            if output.success() {
                // Warnings and notes are kept on passing runs.
                StageResult::new(stage_name, StageStatus::Pass).with_diagnostics(parsed)
            } else {
                let mut diagnostics: Vec<_> = parsed
                    .into_iter()
                    .map(|d| {
                        if d.is_error() {
                            defect(d.location.clone(), d.message.clone()).to_diagnostic()
                        } else {
                            d
                        }
                    })
                    .collect();
                if !diagnostics.iter().any(|d| d.is_error()) {
                    diagnostics.push(fallback_diagnostic(
                        &command.program,
                        output.exit_code,
                        &output.stderr,
                    ));
                }
                StageResult::new(stage_name, StageStatus::Fail).with_diagnostics(diagnostics)
            }
        }
        Err(err) => StageResult::from_error(stage_name, &StageError::from(err)),
    };
    result.attempts = attempt.attempts;
    result.timed(started)
}

/// Result for a stage that could not even prepare its scratch sources.
pub(crate) fn scratch_failure(stage_name: &str, err: &std::io::Error) -> StageResult {
    let mut result = StageResult::new(stage_name, StageStatus::Fail);
    result.infrastructure_failure = true;
    result
        .diagnostics
        .push(crate::diagnostic::StageDiagnostic::error(format!(
            "cannot stage sources: {err}"
        )));
    result
}
