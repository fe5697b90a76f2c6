//! Rungate engine daemon.
//!
//! Runs the durable-job worker pool over an in-memory engine. Delayed-run
//! and expiry callbacks fire here; the trigger entry point is consumed as a
//! library by the API layer.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rungate_engine::jobs::JobWorkerPool;
use rungate_engine::service::callbacks::RunCallbacks;
use rungate_engine::{Engine, EngineConfig};

/// Rungate engine daemon.
#[derive(Debug, Parser)]
#[command(name = "rungate-engine", version, about)]
struct Args {
    /// Number of durable-job workers.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Job poll interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter)?)
        .with_target(true)
        .init();

    let engine = Engine::in_memory(EngineConfig::default());
    let callbacks = Arc::new(RunCallbacks::new(
        engine.store.clone(),
        engine.broker.clone(),
        engine.scheduler.clone(),
        engine.events.clone(),
    ));

    let pool = JobWorkerPool::start(
        engine.scheduler.clone(),
        callbacks,
        args.workers,
        Duration::from_millis(args.poll_interval_ms),
    );

    info!(workers = args.workers, "Rungate engine started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining job workers");
    pool.shutdown().await;

    Ok(())
}
