use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use evochain::chain::{ChainReport, StageOrchestrator};
use evochain::client::{HttpGenerationClient, RemoteGenerationClient};
use evochain::config::ChainConfig;
use evochain::errors::ChainError;
use evochain::events::LoggingEventSink;
use evochain::observability::{init_tracing, LogFormat};

#[derive(Parser)]
#[command(name = "evochain")]
#[command(version, about = "Staged image analysis and synthesis runs")]
struct Cli {
    /// Run configuration (TOML, or JSON by extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write the result ledger as JSON to this path
    #[arg(long, global = true)]
    ledger: Option<PathBuf>,

    #[arg(long, default_value = "pretty", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run stages, each feeding on the previous stage's outputs
    Chain {
        /// Source root, required without --config
        #[arg(long)]
        source: Option<PathBuf>,
        /// First stage; above 1 resumes an earlier chain
        #[arg(long)]
        start_stage: Option<u32>,
        #[arg(long)]
        end_stage: Option<u32>,
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// One pass from an input tree into an output tree
    Batch {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(err) = init_tracing(cli.log_format, "info") {
        eprintln!("evochain: {err}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Run aborted");
            let precondition = err
                .downcast_ref::<ChainError>()
                .is_some_and(ChainError::is_precondition);
            if precondition {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let fallback_source = match &cli.command {
        Commands::Chain { source, .. } => source.clone(),
        Commands::Batch { input, .. } => Some(input.clone()),
    };
    let mut config = match (&cli.config, fallback_source) {
        (Some(path), _) => ChainConfig::load(path)?,
        (None, Some(source)) => ChainConfig::new(source),
        (None, None) => anyhow::bail!("either --config or --source is required"),
    };

    match &cli.command {
        Commands::Chain {
            source,
            start_stage,
            end_stage,
            workers,
        } => {
            if let Some(source) = source {
                config.source_root.clone_from(source);
            }
            if let Some(start) = start_stage {
                config.start_stage = *start;
            }
            if let Some(end) = end_stage {
                config.end_stage = *end;
            }
            if let Some(workers) = workers {
                config.worker_count = *workers;
            }
        }
        Commands::Batch { workers, .. } => {
            if let Some(workers) = workers {
                config.worker_count = *workers;
            }
        }
    }
    config.validate()?;

    let service = HttpGenerationClient::connect(config.service.clone())?;
    tracing::info!(
        base_url = %config.service.base_url,
        proxy = ?service.proxy_mode(),
        "Generation service ready"
    );
    let client = Arc::new(RemoteGenerationClient::new(Arc::new(service), config.retry_policy()));
    let orchestrator = StageOrchestrator::new(config, client, Arc::new(LoggingEventSink::default()));

    let report = match &cli.command {
        Commands::Chain { .. } => orchestrator.run().await?,
        Commands::Batch { input, output, .. } => orchestrator.run_batch(input, output).await?,
    };
    print_summary(&report);

    if let Some(path) = &cli.ledger {
        report
            .ledger
            .write_json(path)
            .with_context(|| format!("writing ledger to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Ledger written");
    }
    Ok(())
}

fn print_summary(report: &ChainReport) {
    for stage in &report.stages {
        println!(
            "stage {}: {} succeeded, {} failed, {} skipped ({} ms)",
            stage.ordinal, stage.succeeded, stage.failed, stage.skipped, stage.duration_ms
        );
    }
    if let Some(stage) = report.halted_after {
        println!("halted after stage {stage}: no outputs to feed the next stage");
    }
    let summary = report.summary();
    println!(
        "total: {} jobs, {} succeeded, {} failed, {} skipped",
        summary.total, summary.succeeded, summary.failed, summary.skipped
    );
}
