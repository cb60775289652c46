//! periphgen verification stages
//!
//! Every artifact passes through an ordered [`StagePlan`]:
//! syntax → semantic → compile → test generation. Stages that shell out go
//! through a [`ToolRunner`] so each invocation is bounded by a [`Deadline`],
//! observes cancellation and reaps the child process on the way out.

pub mod cancel;
pub mod compile;
pub mod diagnostic;
pub mod error;
pub mod runner;
pub mod semantic;
pub mod stage;
pub mod syntax;
pub mod testgen;
pub(crate) mod toolchain;

#[cfg(test)]
pub(crate) mod test_support;

pub use cancel::{CancelHandle, CancelToken, Deadline};
pub use compile::CompileStage;
pub use diagnostic::{Location, Severity, StageDiagnostic};
pub use error::{StageError, ToolError};
pub use runner::{
    run_with_retry, ProcessRunner, RetryPolicy, ToolAttempt, ToolCommand, ToolOutput, ToolRunner,
};
pub use semantic::SemanticStage;
pub use stage::{Stage, StageKind, StagePlan, StageResult, StageServices, StageStatus};
pub use syntax::SyntaxStage;
pub use testgen::TestGenerationStage;
