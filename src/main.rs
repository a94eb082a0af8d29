//! dagtick: run a DAG of shell tasks on a fixed schedule.
//!
//! Tasks are declared in a TOML file. Every period the whole pipeline runs in
//! dependency order; failing tasks are retried with exponential backoff, and a
//! task that exhausts its retries aborts the run and triggers an alert.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dagtick::signal::shutdown_signal;
use dagtick::{Config, format_order};

/// Scheduled DAG task runner.
#[derive(Parser, Debug)]
#[command(name = "dagtick")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run the pipeline once and exit.
    #[arg(long)]
    once: bool,

    /// Print the execution order and dependency tree without running anything.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let graph = config.build_graph().context("invalid task graph")?;
    let order = graph.order().context("invalid task graph")?;

    if args.dry_run {
        println!("=== Execution order ===");
        print!("{}", format_order(&order));
        println!("=== Dependency tree ===");
        print!("{}", graph.render_tree()?);
        return Ok(());
    }

    let scheduler = config.build_scheduler(graph)?;

    if args.once {
        let report = scheduler.run_once().await?;
        info!(
            tasks = report.order.len(),
            duration_ms = report.duration.as_millis() as u64,
            "pipeline run finished"
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => token.cancel(),
            Err(e) => error!(error = %e, "failed to install signal handlers"),
        }
    });

    info!("Scheduler started, press Ctrl+C to stop");
    let report = scheduler.run(shutdown).await;
    info!(
        runs = report.runs,
        succeeded = report.succeeded,
        failed = report.failed,
        abandoned = report.abandoned,
        "dagtick stopped"
    );

    Ok(())
}
