//! Compile stage: full cross-compilation with the platform toolchain.

use async_trait::async_trait;
use periphgen_core::{Artifact, TemplateContext};

use crate::cancel::Deadline;
use crate::error::StageError;
use crate::stage::{Stage, StageKind, StageResult, StageServices};
use crate::toolchain::{compile_command, run_tool_stage, scratch_failure, Scratch};

pub struct CompileStage {
    services: StageServices,
}

impl CompileStage {
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Stage for CompileStage {
    fn kind(&self) -> StageKind {
        StageKind::Compile
    }

    async fn run(
        &self,
        artifact: &Artifact,
        context: &TemplateContext,
        deadline: &Deadline,
    ) -> StageResult {
        let scratch = match Scratch::new() {
            Ok(scratch) => scratch,
            Err(e) => return scratch_failure(self.name(), &e),
        };
        let file = match scratch.write(&artifact.file_name, &artifact.text) {
            Ok(file) => file,
            Err(e) => return scratch_failure(self.name(), &e),
        };

        let command = compile_command(self.name(), context, &scratch, &file);
        run_tool_stage(
            &self.services,
            self.name(),
            command,
            deadline,
            artifact,
            |location, message| StageError::CompileError { location, message },
        )
        .await
    }
}
