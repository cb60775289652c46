//! periphgen - peripheral driver generator CLI
//!
//! ## Commands
//!
//! - `generate`: render and verify one platform/peripheral pair
//! - `batch`: run many requests concurrently and write a batch report
//! - `check-metadata`: schema-validate a single metadata document
//! - `inspect-descriptor`: parse a vendor register description and summarise it

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use periphgen_core::{
    descriptor, init_tracing, validate, DescriptorCache, Device, DocumentKind, MetadataDocument,
};
use periphgen_pipeline::{
    FailurePolicy, GenerationRequest, GeneratorConfig, Orchestrator, ValidationReport,
};
use periphgen_stages::{CancelHandle, CancelToken, StageKind, StageStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "periphgen")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Generate and verify peripheral drivers from vendor register descriptions", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and verify a single driver
    Generate {
        /// Platform metadata document
        #[arg(long)]
        platform: PathBuf,

        /// Peripheral metadata document
        #[arg(long)]
        peripheral: PathBuf,

        /// Optional board document supplying board-level values
        #[arg(long)]
        board: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Generate and verify many drivers concurrently
    Batch {
        /// Board document; expands to one request per listed peripheral
        #[arg(long = "board", num_args = 1..)]
        boards: Vec<PathBuf>,

        /// Explicit `PLATFORM:PERIPHERAL` pair
        #[arg(long = "request", num_args = 1..)]
        requests: Vec<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Schema-validate one metadata document and print every violation
    CheckMetadata {
        /// Document kind: platform, peripheral or board
        #[arg(long)]
        kind: DocumentKind,

        /// Path to the JSON document
        file: PathBuf,
    },

    /// Parse a register description (SVD or ATDF) and summarise it
    InspectDescriptor {
        /// Path to the descriptor
        file: PathBuf,

        /// List registers under each peripheral
        #[arg(long)]
        registers: bool,

        /// Print the parsed device as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Flags shared by `generate` and `batch`; they override the config file.
#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Stages to run, comma separated (syntax,semantic,compile,test_generation)
    #[arg(long, value_delimiter = ',')]
    stage: Vec<StageKind>,

    /// Skip remaining stages after the first failure (default)
    #[arg(long, conflicts_with = "keep_going")]
    fail_fast: bool,

    /// Run every selected stage even after a failure
    #[arg(long = "continue")]
    keep_going: bool,

    /// Output directory for generated sources
    #[arg(long, env = "PERIPHGEN_OUT_DIR")]
    out: Option<PathBuf>,

    /// Directory for JSON reports
    #[arg(long, env = "PERIPHGEN_REPORT_DIR")]
    reports: Option<PathBuf>,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum concurrent requests in a batch
    #[arg(long, env = "PERIPHGEN_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Per-stage timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl RunArgs {
    fn load_config(&self) -> Result<GeneratorConfig> {
        let mut config = match &self.config {
            Some(path) => GeneratorConfig::load(path)?,
            None => GeneratorConfig::default(),
        };
        if !self.stage.is_empty() {
            config.stages = self.stage.clone();
        }
        if self.keep_going {
            config.failure_policy = FailurePolicy::Continue;
        } else if self.fail_fast {
            config.failure_policy = FailurePolicy::FailFast;
        }
        if let Some(out) = &self.out {
            config.out_dir = out.clone();
        }
        if let Some(reports) = &self.reports {
            config.report_dir = reports.clone();
        }
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        if let Some(secs) = self.timeout_secs {
            config.stage_timeout_secs = secs;
        }
        config.with_env_timestamp()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json_logs, level);

    match cli.command {
        Commands::Generate {
            platform,
            peripheral,
            board,
            run,
        } => cmd_generate(platform, peripheral, board, &run).await,
        Commands::Batch {
            boards,
            requests,
            run,
        } => cmd_batch(&boards, &requests, &run).await,
        Commands::CheckMetadata { kind, file } => cmd_check_metadata(kind, &file),
        Commands::InspectDescriptor {
            file,
            registers,
            json,
        } => cmd_inspect_descriptor(&file, registers, json),
    }
}

/// Cancel `token` on Ctrl-C; abort the returned task once the work is done.
fn watch_interrupt() -> (CancelToken, JoinHandle<()>) {
    let (handle, token) = CancelHandle::new();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            handle.cancel();
        }
    });
    (token, watcher)
}

async fn cmd_generate(
    platform: PathBuf,
    peripheral: PathBuf,
    board: Option<PathBuf>,
    run: &RunArgs,
) -> Result<()> {
    let config = run.load_config()?;
    let orchestrator = Orchestrator::new(config, Arc::new(DescriptorCache::new()));

    let mut request = GenerationRequest::new(platform, peripheral);
    if let Some(board) = board {
        request = request.with_board(board);
    }

    let (cancel, watcher) = watch_interrupt();
    let report = orchestrator.generate_with_cancel(&request, &cancel).await;
    watcher.abort();

    print_report(&report);

    if !report.passed {
        anyhow::bail!("{} did not pass", report.request_id);
    }
    Ok(())
}

fn print_report(report: &ValidationReport) {
    println!("Request: {}", report.request_id);

    for issue in &report.generation_errors {
        println!("  ✗ {issue}");
    }

    for stage in &report.stages {
        let mark = match stage.status {
            StageStatus::Pass => "✓",
            StageStatus::Skipped => "-",
            StageStatus::Fail | StageStatus::Timeout => "✗",
        };
        let mut line = format!(
            "  {mark} {:<16} {:<8} {:>6} ms",
            stage.stage_name,
            stage.status.as_str(),
            stage.duration_ms
        );
        if stage.attempts > 1 {
            line.push_str(&format!("  ({} attempts)", stage.attempts));
        }
        if stage.infrastructure_failure {
            line.push_str("  [infrastructure]");
        }
        println!("{line}");
        for diagnostic in &stage.diagnostics {
            println!("      {diagnostic}");
        }
    }

    if let Some(path) = &report.artifact_path {
        println!("Artifact: {} ({})", path.display(), report.write_outcome.as_str());
    }
    if let Some(path) = &report.report_path {
        println!("Report: {}", path.display());
    }
    println!(
        "Status: {}",
        if report.passed {
            "✓ PASSED"
        } else if report.cancelled {
            "✗ CANCELLED"
        } else {
            "✗ FAILED"
        }
    );
}

/// Split `PLATFORM:PERIPHERAL` at the last colon.
fn parse_request_pair(raw: &str) -> Result<GenerationRequest> {
    let (platform, peripheral) = raw
        .rsplit_once(':')
        .filter(|(p, q)| !p.is_empty() && !q.is_empty())
        .with_context(|| format!("expected PLATFORM:PERIPHERAL, got {raw:?}"))?;
    Ok(GenerationRequest::new(platform, peripheral))
}

fn collect_requests(boards: &[PathBuf], pairs: &[String]) -> Result<Vec<GenerationRequest>> {
    let mut requests = Vec::new();
    for board in boards {
        let expanded = GenerationRequest::from_board(board)
            .with_context(|| format!("expand board {}", board.display()))?;
        requests.extend(expanded);
    }
    for pair in pairs {
        requests.push(parse_request_pair(pair)?);
    }
    if requests.is_empty() {
        anyhow::bail!("nothing to do: pass at least one --board or --request");
    }
    Ok(requests)
}

async fn cmd_batch(boards: &[PathBuf], pairs: &[String], run: &RunArgs) -> Result<()> {
    let requests = collect_requests(boards, pairs)?;
    let config = run.load_config()?;
    let orchestrator = Orchestrator::new(config, Arc::new(DescriptorCache::new()));

    info!(requests = requests.len(), "running batch");
    let (cancel, watcher) = watch_interrupt();
    let batch = orchestrator.generate_batch(requests, cancel).await;
    watcher.abort();

    for report in &batch.reports {
        println!("{}", report.summary_line());
    }
    println!();
    println!(
        "{} total, {} passed, {} failed, {} cancelled",
        batch.totals.total, batch.totals.passed, batch.totals.failed, batch.totals.cancelled
    );
    if let Some(path) = &batch.report_path {
        println!("Batch report: {}", path.display());
    }

    if !batch.passed() {
        anyhow::bail!("batch {} did not pass", batch.run_id);
    }
    println!("\n✓ All requests passed!");
    Ok(())
}

fn cmd_check_metadata(kind: DocumentKind, file: &Path) -> Result<()> {
    let document = MetadataDocument::load(file)?;
    match validate(&document, kind) {
        Ok(validated) => {
            println!(
                "✓ {} is a valid {kind} document (schema v{}, digest {})",
                file.display(),
                validated.version(),
                validated.digest()
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors.0 {
                println!("  ✗ {error}");
            }
            anyhow::bail!(
                "{} has {} schema violation(s)",
                file.display(),
                errors.0.len()
            )
        }
    }
}

fn cmd_inspect_descriptor(file: &Path, registers: bool, json: bool) -> Result<()> {
    let device = descriptor::parse(file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&device)?);
        return Ok(());
    }
    print!("{}", describe_device(&device, registers));
    Ok(())
}

fn describe_device(device: &Device, registers: bool) -> String {
    let mut out = format!("Device: {} ({})\n", device.name, device.dialect.name());
    out.push_str(&format!(
        "  {} peripheral layout(s), {} instance(s), {} register(s)\n",
        device.peripherals.len(),
        device.instances().count(),
        device.register_count()
    ));
    if let Some((lo, hi)) = device.address_span() {
        out.push_str(&format!("  address span {lo:#010x}..{hi:#010x}\n"));
    }
    for peripheral in &device.peripherals {
        out.push_str(&format!(
            "\n  {}  block {:#x}, {} register(s)\n",
            peripheral.name,
            peripheral.block_size,
            peripheral.registers.len()
        ));
        for instance in &peripheral.instances {
            out.push_str(&format!(
                "    {:<12} {:#010x}\n",
                instance.name, instance.base_address
            ));
        }
        if registers {
            for register in &peripheral.registers {
                out.push_str(&format!(
                    "      +{:#06x} {:<10} {:>2} bit  reset {:#x}\n",
                    register.offset, register.name, register.size, register.reset_value
                ));
            }
        }
    }
    out
}
