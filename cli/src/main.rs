//! Pipeline orchestrator command-line entry point.
//!
//! Loads the pipeline document named by `--config` / `PIPELINE_CONFIG`,
//! runs it, prints the run report as JSON and exits with the report's code:
//! 0 success, 1 node failure, 2 rejected before execution, 3 cancelled,
//! 4 internal error.

use anyhow::Context;
use clap::Parser;
use pipeline_orchestrator::bootstrap::load_orchestrator;
use pipeline_orchestrator::cancellation::CancellationToken;
use pipeline_orchestrator::events::LoggingEventSink;
use pipeline_orchestrator::registry::PackageCatalog;
use pipeline_orchestrator::state::FileBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pipeline orchestrator CLI
#[derive(Parser, Debug)]
#[command(name = "pipeline-orchestrator")]
#[command(about = "Runs a declarative infrastructure pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Pipeline document (YAML or JSON)
    #[arg(short, long, env = "PIPELINE_CONFIG")]
    config: PathBuf,

    /// Log level
    #[arg(long, env = "PIPELINE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "PIPELINE_LOG_JSON")]
    json: bool,

    /// Maximum nodes running at once (overrides the document)
    #[arg(long, env = "PIPELINE_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Directory for exported task state (overrides the document's backend)
    #[arg(long, env = "PIPELINE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Write the run report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn catalog() -> PackageCatalog {
    PackageCatalog::new().with_package(pipeline_orchestrator_extension_shell::package())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut orchestrator = match load_orchestrator(&cli.config, &catalog()) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            let info = e.error_info();
            error!(
                error = %e,
                code = info.map_or("", |i| i.code.as_str()),
                "Pipeline rejected before execution"
            );
            if let Some(hint) = info.and_then(|i| i.fix_hint.as_deref()) {
                eprintln!("hint: {hint}");
            }
            return Ok(e.exit_code());
        }
    };

    orchestrator = orchestrator.with_event_sink(Arc::new(LoggingEventSink::info()));
    if let Some(limit) = cli.max_concurrency {
        orchestrator = orchestrator.with_max_concurrency(limit);
    }
    if let Some(dir) = &cli.state_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating state directory {}", dir.display()))?;
        orchestrator = orchestrator.with_state_backend(Arc::new(FileBackend::new(dir)));
    }

    let cancel = Arc::new(CancellationToken::new());
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; cancelling pipeline");
                cancel.cancel("interrupted");
            }
        });
    }

    let report = orchestrator.run(cancel).await;
    let json = serde_json::to_string_pretty(&report).context("serializing run report")?;
    match &cli.report {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing report to {}", path.display()))?;
            info!(path = %path.display(), "Report written");
        }
        None => println!("{json}"),
    }
    Ok(report.exit_code())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let code = run(cli).await?;
    std::process::exit(code);
}
