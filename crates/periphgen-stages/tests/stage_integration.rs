//! Stage behaviour through the public API: a recording fake runner for the
//! toolchain stages, and real subprocesses for deadline enforcement.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use periphgen_core::descriptor::parse_str;
use periphgen_core::{
    validate, Artifact, DocumentKind, MetadataDocument, SourceIdentity, TemplateContext,
    TemplateEngine, TemplateSource,
};
use periphgen_stages::{
    CancelToken, CompileStage, Deadline, RetryPolicy, SemanticStage, Stage, StageKind,
    StagePlan, StageServices, StageStatus, ToolCommand, ToolError, ToolOutput, ToolRunner,
};
use serde_json::json;

const SVD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<device schemaVersion="1.1">
  <name>STM32F4</name>
  <size>32</size>
  <peripherals>
    <peripheral>
      <name>GPIOA</name>
      <baseAddress>0x40020000</baseAddress>
      <addressBlock><offset>0x0</offset><size>0x400</size><usage>registers</usage></addressBlock>
      <registers>
        <register><name>IDR</name><addressOffset>0x10</addressOffset><access>read-only</access></register>
        <register><name>ODR</name><addressOffset>0x14</addressOffset></register>
        <register><name>BSRR</name><addressOffset>0x18</addressOffset><access>write-only</access></register>
      </registers>
    </peripheral>
    <peripheral derivedFrom="GPIOA">
      <name>GPIOB</name>
      <baseAddress>0x40020400</baseAddress>
    </peripheral>
  </peripherals>
</device>
"#;

const GOOD_BODY: &str = "#include <stdint.h>\n\
#define GPIOA_BASE 0x40020000u\n\
void gpioa_set(uint32_t pin) { *(volatile uint32_t *)0x40020018u = 1u << pin; }\n\
uint32_t gpioa_read(uint32_t pin) { return (*(volatile uint32_t *)0x40020010u >> pin) & 1u; }\n";

fn context_with_cc(cc: &str) -> TemplateContext {
    let device = parse_str(SVD, Path::new("stm32f4.svd")).unwrap();
    let platform = MetadataDocument::from_value(
        "/platforms/stm32f4.json",
        json!({
            "schema_version": 1,
            "name": "stm32f4",
            "family": "stm32f4",
            "descriptor": "stm32f4.svd",
            "arch": "arm",
            "cpu": "cortex-m4",
            "toolchain": { "cc": cc, "language": "c", "flags": ["-O2"] },
            "idioms": { "atomic_set_clear": true, "toggle_register": false }
        }),
    );
    let peripheral = MetadataDocument::from_value(
        "/platforms/gpioa.json",
        json!({
            "schema_version": 1,
            "name": "gpioa",
            "class": "digital_output",
            "instance": "GPIOA",
            "template": "gpio.c.j2",
            "pins": 4,
            "roles": { "set": "BSRR", "read": "IDR" },
            "entry_points": { "set": "gpioa_set", "read": "gpioa_read" }
        }),
    );
    TemplateContext::build(
        &validate(&platform, DocumentKind::Platform).unwrap(),
        &validate(&peripheral, DocumentKind::Peripheral).unwrap(),
        None,
        Arc::new(device),
        SourceIdentity::new("stm32f4.svd", SVD.as_bytes()),
    )
    .unwrap()
}

fn artifact(ctx: &TemplateContext, body: &str) -> Artifact {
    TemplateEngine::default()
        .render(&TemplateSource::new("gpio.c.j2", body), ctx)
        .unwrap()
}

fn deadline(secs: u64) -> Deadline {
    Deadline::after(Duration::from_secs(secs), CancelToken::never())
}

/// Records every command and answers with a canned outcome.
struct RecordingRunner {
    calls: Mutex<Vec<ToolCommand>>,
    respond: fn(&ToolCommand) -> Result<ToolOutput, ToolError>,
}

impl RecordingRunner {
    fn new(respond: fn(&ToolCommand) -> Result<ToolOutput, ToolError>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond,
        })
    }

    fn labels(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.label.clone()).collect()
    }
}

#[async_trait]
impl ToolRunner for RecordingRunner {
    async fn run(
        &self,
        command: &ToolCommand,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(command.clone());
        (self.respond)(command)
    }
}

fn ok_output(_: &ToolCommand) -> Result<ToolOutput, ToolError> {
    Ok(ToolOutput {
        exit_code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: 1,
    })
}

fn services(runner: Arc<RecordingRunner>) -> StageServices {
    StageServices::new(
        runner,
        RetryPolicy {
            retry_limit: 1,
            backoff_base: Duration::from_millis(10),
            attempt_timeout: None,
        },
        TemplateEngine::default(),
    )
}

#[tokio::test]
async fn standard_plan_invokes_toolchain_once_per_tool_stage() {
    let runner = RecordingRunner::new(ok_output);
    let plan = StagePlan::standard(&services(runner.clone()));
    let ctx = context_with_cc("arm-none-eabi-gcc");
    let art = artifact(&ctx, GOOD_BODY);

    let mut statuses = Vec::new();
    for stage in plan.stages() {
        statuses.push(stage.run(&art, &ctx, &deadline(10)).await.status);
    }

    assert_eq!(statuses, vec![StageStatus::Pass; 4]);
    assert_eq!(runner.labels(), ["syntax", "compile", "test_generation"]);

    let calls = runner.calls.lock().unwrap();
    assert!(calls[0].args.contains(&"-fsyntax-only".to_string()));
    assert!(calls[1].args.contains(&"-mcpu=cortex-m4".to_string()));
    assert!(calls[1].args.contains(&"-O2".to_string()));
    assert!(calls[2].args.iter().any(|a| a.ends_with("smoke_gpioa.c")));
}

#[tokio::test]
async fn semantic_stage_flags_wrong_instance_base() {
    let ctx = context_with_cc("arm-none-eabi-gcc");
    let body = GOOD_BODY.replace("0x40020000u", "0x40020400u");
    let art = artifact(&ctx, &body);

    let result = SemanticStage::new().run(&art, &ctx, &deadline(1)).await;
    assert_eq!(result.status, StageStatus::Fail);
    assert_eq!(result.error_count(), 1);
    let diag = &result.diagnostics[0];
    assert_eq!(diag.expected.as_deref(), Some("0x40020000"));
    assert_eq!(diag.found.as_deref(), Some("0x40020400u"));
    let location = diag.location.as_ref().unwrap();
    assert_eq!(location.file, "gpioa.c");
    assert_eq!(location.line, Some(art.header_line_count() + 2));
}

#[tokio::test]
async fn compile_errors_are_located_in_the_artifact() {
    let runner = RecordingRunner::new(|_| {
        Ok(ToolOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "/tmp/periphgen-x/gpioa.c:12:5: error: expected ';' before '}' token\n"
                .to_string(),
            duration_ms: 3,
        })
    });
    let ctx = context_with_cc("arm-none-eabi-gcc");
    let result = CompileStage::new(services(runner.clone()))
        .run(&artifact(&ctx, GOOD_BODY), &ctx, &deadline(10))
        .await;

    assert_eq!(result.status, StageStatus::Fail);
    assert!(!result.infrastructure_failure);
    assert_eq!(result.attempts, 1);
    let location = result.diagnostics[0].location.as_ref().unwrap();
    assert_eq!(location.file, "gpioa.c");
    assert_eq!(location.line, Some(12));
    assert_eq!(location.column, Some(5));
}

#[tokio::test]
async fn missing_tool_is_retried_then_reported_as_infrastructure() {
    let runner = RecordingRunner::new(|c| {
        Err(ToolError::NotFound {
            program: c.program.clone(),
        })
    });
    let ctx = context_with_cc("no-such-gcc");
    let result = CompileStage::new(services(runner.clone()))
        .run(&artifact(&ctx, GOOD_BODY), &ctx, &deadline(10))
        .await;

    assert_eq!(result.status, StageStatus::Fail);
    assert!(result.infrastructure_failure);
    assert_eq!(result.attempts, 2);
    assert_eq!(runner.labels().len(), 2);
}

#[tokio::test]
async fn missing_entry_point_fails_without_invoking_a_tool() {
    let runner = RecordingRunner::new(ok_output);
    let ctx = context_with_cc("arm-none-eabi-gcc");
    let body = "void gpioa_set(uint32_t pin) { (void)pin; }\n";
    let stage = periphgen_stages::TestGenerationStage::new(services(runner.clone()));
    assert_eq!(stage.kind(), StageKind::TestGeneration);

    let result = stage.run(&artifact(&ctx, body), &ctx, &deadline(10)).await;
    assert_eq!(result.status, StageStatus::Fail);
    assert!(result.diagnostics[0].message.contains("gpioa_read"));
    assert!(runner.labels().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn hung_compiler_is_killed_at_the_stage_deadline() {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    let dir = tempfile::tempdir().unwrap();
    let cc = dir.path().join("hung-cc");
    std::fs::write(&cc, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&cc, std::fs::Permissions::from_mode(0o755)).unwrap();

    let ctx = context_with_cc(&cc.display().to_string());
    let mut body = String::from(GOOD_BODY);
    for i in 0..50_000 {
        body.push_str(&format!("static const uint32_t k{i} = {i}u;\n"));
    }
    let art = artifact(&ctx, &body);

    let services = StageServices::new(
        Arc::new(periphgen_stages::ProcessRunner::default()),
        RetryPolicy {
            retry_limit: 0,
            ..RetryPolicy::default()
        },
        TemplateEngine::default(),
    );
    let started = Instant::now();
    let result = periphgen_stages::SyntaxStage::new(services)
        .run(&art, &ctx, &deadline(2))
        .await;

    assert_eq!(result.status, StageStatus::Timeout);
    assert!(result.infrastructure_failure);
    assert!(started.elapsed() <= Duration::from_secs(3));
}
