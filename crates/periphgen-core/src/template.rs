//! Template rendering.
//!
//! Templates are Jinja-syntax text rendered by `minijinja` with strict
//! undefined handling: referencing a context path that does not exist is an
//! error naming the template, line and dotted variable path, never an empty
//! substitution. Hardware idioms are expressed in the template through
//! branches on `platform.idioms.*`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact::{Artifact, Provenance, SourceIdentity};
use crate::context::TemplateContext;
use crate::error::{GenerationError, RenderFailure, TemplateRenderError};

/// Engine settings shared by every render in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub generator_version: String,
    /// Pinned timestamp for the provenance header (`SOURCE_DATE_EPOCH`).
    pub reproducible_timestamp: Option<DateTime<Utc>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            generator_version: crate::VERSION.to_string(),
            reproducible_timestamp: None,
        }
    }
}

/// A template's name and source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSource {
    /// File name, used in diagnostics and the provenance header.
    pub name: String,
    pub text: String,
}

impl TemplateSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, GenerationError> {
        let text = std::fs::read_to_string(path).map_err(|source| GenerationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, text })
    }

    pub fn identity(&self) -> SourceIdentity {
        SourceIdentity::new(self.name.clone(), self.text.as_bytes())
    }

    /// Extension of the rendered file: `gpio.c.j2` → `c`.
    pub fn output_extension(&self) -> Option<&str> {
        let stem = self.name.strip_suffix(".j2").unwrap_or(&self.name);
        Path::new(stem).extension().and_then(|e| e.to_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    config: EngineConfig,
}

impl TemplateEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Render `template` against `context` into a provenance-stamped
    /// artifact.
    pub fn render(
        &self,
        template: &TemplateSource,
        context: &TemplateContext,
    ) -> Result<Artifact, TemplateRenderError> {
        let body = self.render_text(template, context.values())?;

        let provenance = Provenance {
            descriptor: context.descriptor().clone(),
            template: template.identity(),
            metadata_digest: context.metadata_digest().to_string(),
            generator_version: self.config.generator_version.clone(),
            generation_timestamp: Utc::now(),
            reproducible_timestamp: self.config.reproducible_timestamp,
        };

        let file_name = match template.output_extension() {
            Some(ext) => format!("{}.{ext}", context.peripheral().name),
            None => context.peripheral().name.clone(),
        };
        let relative_path = PathBuf::from(&context.platform().family).join(&file_name);

        let mut text = provenance.header();
        text.push_str(&body);

        Ok(Artifact {
            file_name,
            relative_path,
            text,
            provenance,
        })
    }

    /// Render a template to plain text, without a provenance header.
    pub fn render_text(
        &self,
        template: &TemplateSource,
        values: &Value,
    ) -> Result<String, TemplateRenderError> {
        let env = environment();
        let compiled = env
            .template_from_named_str(&template.name, &template.text)
            .map_err(|e| render_error(template, values, None, &e))?;
        compiled
            .render(values)
            .map_err(|e| render_error(template, values, Some(&compiled), &e))
    }
}

fn environment<'source>() -> Environment<'source> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_filter("hex", hex);
    env
}

/// `{{ value | hex }}` → `0x1F`; `{{ value | hex(8) }}` → `0x0000001F`.
fn hex(value: u64, width: Option<usize>) -> String {
    format!("0x{:0width$X}", value, width = width.unwrap_or(0))
}

fn render_error(
    template: &TemplateSource,
    values: &Value,
    compiled: Option<&minijinja::Template<'_, '_>>,
    err: &minijinja::Error,
) -> TemplateRenderError {
    let line = err.line();
    let detail = match err.detail() {
        Some(detail) => format!("{}: {detail}", err.kind()),
        None => err.kind().to_string(),
    };

    if err.kind() != ErrorKind::UndefinedError {
        return TemplateRenderError {
            template: template.name.clone(),
            line,
            variable: None,
            failure: RenderFailure::TemplateDefect,
            detail,
        };
    }

    let variable = compiled.and_then(|t| unresolved_variable(t, template, values, line));
    TemplateRenderError {
        template: template.name.clone(),
        line,
        variable,
        failure: RenderFailure::UnresolvedVariable,
        detail,
    }
}

/// The dotted context path that failed to resolve, preferring one that
/// appears on the failing line.
fn unresolved_variable(
    compiled: &minijinja::Template<'_, '_>,
    template: &TemplateSource,
    values: &Value,
    line: Option<usize>,
) -> Option<String> {
    let mut missing: Vec<String> = compiled
        .undeclared_variables(true)
        .into_iter()
        .filter(|path| !resolves(values, path))
        .collect();
    missing.sort();

    let source_line = line.and_then(|l| template.text.lines().nth(l.saturating_sub(1)));
    if let Some(source_line) = source_line {
        if let Some(found) = missing.iter().find(|path| source_line.contains(path.as_str())) {
            return Some(found.clone());
        }
    }
    missing.into_iter().next()
}

fn resolves(values: &Value, path: &str) -> bool {
    let mut current = values;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return false,
        }
    }
    true
}
