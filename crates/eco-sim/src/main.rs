//! Headless runner for the predator-prey simulation.

mod report;
mod telemetry;

use anyhow::Result;
use clap::Parser;
use eco_core::{ExecutionMode, SimulationConfig};
use eco_world::SimulationEngine;
use report::RunReport;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of ticks to run
    #[arg(short, long)]
    ticks: Option<u64>,

    /// Random seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Worker threads for partitioned execution
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run every phase on the main thread
    #[arg(long, conflicts_with = "workers")]
    sequential: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// OpenTelemetry collector endpoint
    #[arg(long)]
    otel_endpoint: Option<String>,

    /// Write a JSON run report here when the run ends
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn load_config(&self) -> Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_json_file(path)?,
            None => SimulationConfig::default(),
        };
        if let Some(ticks) = self.ticks {
            config.num_ticks = ticks;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.sequential {
            config.scheduler.mode = ExecutionMode::Sequential;
        } else if let Some(workers) = self.workers {
            config.scheduler.mode = ExecutionMode::Partitioned { workers };
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    if args.print_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    telemetry::init_telemetry(args.otel_endpoint.as_deref(), args.json_logs)?;

    let run_id = uuid::Uuid::new_v4();
    info!(%run_id, seed = config.seed, ticks = config.num_ticks, "Starting eco-sim");

    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.store(true, Ordering::Relaxed);
        })
    };

    let started_at = chrono::Utc::now();
    let engine_config = config.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut engine = SimulationEngine::new(engine_config)?;
        engine.spawn_initial_population();
        let summary = engine.run_with_cancel(&cancel);
        let samples = engine.population_log().samples().cloned().collect::<Vec<_>>();
        Ok((summary, samples))
    })
    .await?;
    watcher.abort();

    let (summary, samples) = match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("Simulation failed: {}", e);
            telemetry::shutdown_telemetry();
            return Err(e);
        }
    };
    if summary.cancelled {
        warn!(ticks_run = summary.ticks_run, "Run cancelled before completion");
    }

    let report = RunReport {
        run_id,
        started_at,
        finished_at: chrono::Utc::now(),
        config,
        summary,
        samples,
    };
    info!(
        %run_id,
        population = report.summary.population,
        elapsed_secs = report.elapsed_secs(),
        "Run finished"
    );
    if let Some(path) = &args.report {
        report.write_to(path)?;
        info!("Report written to {}", path.display());
    }

    telemetry::shutdown_telemetry();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping after the current tick");
}
