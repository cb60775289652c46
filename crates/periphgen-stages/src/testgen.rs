//! Test-generation stage: render a smoke test that calls the artifact's
//! entry points with the signatures its peripheral class requires, then
//! compile it against the artifact.

use std::time::Instant;

use async_trait::async_trait;
use periphgen_core::{Artifact, PeripheralClass, TemplateContext, TemplateSource};
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::cancel::Deadline;
use crate::error::StageError;
use crate::stage::{Stage, StageKind, StageResult, StageServices, StageStatus};
use crate::toolchain::{compile_command, run_tool_stage, scratch_failure, Scratch};

const DIGITAL_OUTPUT: &str = include_str!("smoke/digital_output.c.j2");
const DIGITAL_INPUT: &str = include_str!("smoke/digital_input.c.j2");
const SERIAL: &str = include_str!("smoke/serial.c.j2");

/// Smoke test template for a peripheral class.
pub fn smoke_template(class: PeripheralClass) -> TemplateSource {
    let (name, text) = match class {
        PeripheralClass::DigitalOutput => ("digital_output.c.j2", DIGITAL_OUTPUT),
        PeripheralClass::DigitalInput => ("digital_input.c.j2", DIGITAL_INPUT),
        PeripheralClass::Serial => ("serial.c.j2", SERIAL),
    };
    TemplateSource::new(name, text)
}

/// Required entry points the artifact does not define, by entry-point name.
pub fn missing_entry_points(artifact: &Artifact, context: &TemplateContext) -> Vec<String> {
    let peripheral = context.peripheral();
    let body = artifact.body();
    peripheral
        .class
        .required_entry_points()
        .iter()
        .filter_map(|entry| {
            let Some(symbol) = peripheral.entry_points.get(*entry) else {
                return Some(format!("{entry} (not mapped in {})", peripheral.name));
            };
            let defined = Regex::new(&format!(r"\b{}\s*\(", regex::escape(symbol)))
                .map(|re| re.is_match(body))
                .unwrap_or(false);
            (!defined).then(|| format!("{entry} ({symbol})"))
        })
        .collect()
}

pub struct TestGenerationStage {
    services: StageServices,
}

impl TestGenerationStage {
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }

    fn smoke_values(artifact: &Artifact, context: &TemplateContext) -> Value {
        let mut values = context.values().clone();
        if let Value::Object(map) = &mut values {
            map.insert(
                "artifact".to_string(),
                json!({ "file_name": artifact.file_name }),
            );
            map.insert(
                "entry_points".to_string(),
                json!(context.peripheral().entry_points),
            );
        }
        values
    }

    fn failure(&self, message: String, started: Instant) -> StageResult {
        StageResult::from_error(self.name(), &StageError::TestGenerationError { message })
            .timed(started)
    }
}

#[async_trait]
impl Stage for TestGenerationStage {
    fn kind(&self) -> StageKind {
        StageKind::TestGeneration
    }

    async fn run(
        &self,
        artifact: &Artifact,
        context: &TemplateContext,
        deadline: &Deadline,
    ) -> StageResult {
        let started = Instant::now();

        let missing = missing_entry_points(artifact, context);
        if !missing.is_empty() {
            return self.failure(
                format!(
                    "{} class requires entry points that {} does not define: {}",
                    context.peripheral().class.as_str(),
                    artifact.file_name,
                    missing.join(", ")
                ),
                started,
            );
        }

        let template = smoke_template(context.peripheral().class);
        let smoke = match self
            .services
            .engine
            .render_text(&template, &Self::smoke_values(artifact, context))
        {
            Ok(text) => text,
            Err(e) => return self.failure(e.to_string(), started),
        };

        let scratch = match Scratch::new() {
            Ok(scratch) => scratch,
            Err(e) => return scratch_failure(self.name(), &e),
        };
        let smoke_name = format!("smoke_{}.c", context.peripheral().name);
        let written = scratch
            .write(&artifact.file_name, &artifact.text)
            .and_then(|_| scratch.write(&smoke_name, &smoke));
        let smoke_path = match written {
            Ok(path) => path,
            Err(e) => return scratch_failure(self.name(), &e),
        };
        debug!(smoke = %smoke_name, "compiling smoke test");

        let command = compile_command(self.name(), context, &scratch, &smoke_path);
        run_tool_stage(
            &self.services,
            self.name(),
            command,
            deadline,
            artifact,
            |location, message| StageError::TestGenerationError {
                message: match location {
                    Some(location) => format!("{location}: {message}"),
                    None => message,
                },
            },
        )
        .await
    }
}
