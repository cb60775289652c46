//! Syntax stage: the toolchain front end in syntax-only mode.

use async_trait::async_trait;
use periphgen_core::{Artifact, TemplateContext};

use crate::cancel::Deadline;
use crate::error::StageError;
use crate::stage::{Stage, StageKind, StageResult, StageServices};
use crate::toolchain::{run_tool_stage, scratch_failure, syntax_command, Scratch};

pub struct SyntaxStage {
    services: StageServices,
}

impl SyntaxStage {
    pub fn new(services: StageServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Stage for SyntaxStage {
    fn kind(&self) -> StageKind {
        StageKind::Syntax
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

        let command = syntax_command(context, &scratch, &file);
        run_tool_stage(
            &self.services,
            self.name(),
            command,
            deadline,
            artifact,
            |location, message| StageError::SyntaxError { location, message },
        )
        .await
    }
}
