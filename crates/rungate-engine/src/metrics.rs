//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use rungate_core::RunStatus;

use crate::engine::Engine;
use crate::jobs::DurableJobScheduler;
use crate::store::RunStore;

/// Collect all metrics from the engine and format as Prometheus text.
pub async fn collect_metrics(engine: &Engine) -> String {
    let mut output = String::new();

    collect_run_metrics(engine, &mut output).await;
    collect_job_metrics(engine, &mut output).await;

    output
}

/// Collect run counts by status.
async fn collect_run_metrics(engine: &Engine, output: &mut String) {
    let counts = engine.store.count_runs_by_status().await.unwrap_or_default();

    writeln!(output, "# HELP rungate_runs Number of runs by status").ok();
    writeln!(output, "# TYPE rungate_runs gauge").ok();

    for status in [
        RunStatus::Pending,
        RunStatus::Delayed,
        RunStatus::Executing,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
        RunStatus::Expired,
        RunStatus::SystemFailure,
    ] {
        let count = counts.get(&status).copied().unwrap_or(0);
        let label = status.as_str().to_ascii_lowercase();
        writeln!(output, "rungate_runs{{status=\"{label}\"}} {count}").ok();
    }
}

/// Collect durable-job counts.
async fn collect_job_metrics(engine: &Engine, output: &mut String) {
    let scheduled = engine.scheduler.scheduled_count().await.unwrap_or(0);

    writeln!(
        output,
        "# HELP rungate_scheduled_jobs Number of scheduled durable jobs"
    )
    .ok();
    writeln!(output, "# TYPE rungate_scheduled_jobs gauge").ok();
    writeln!(output, "rungate_scheduled_jobs {scheduled}").ok();
}
