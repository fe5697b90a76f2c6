//! Worker pool for durable-queue callbacks.
//!
//! Runs N polling workers over the job scheduler and dispatches claimed
//! jobs to the run callbacks. Jobs that fail stay claimed and reappear
//! after the visibility window; jobs with malformed payloads are dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rungate_core::RunId;

use crate::service::callbacks::RunCallbacks;

use super::{ClaimedJob, DurableJobScheduler, JobKind};

/// Maximum jobs a single worker claims per poll.
const CLAIM_BATCH: usize = 10;

/// A pool of durable-queue workers.
///
/// Constructed once per process; `shutdown` cancels polling and drains
/// jobs already claimed before returning.
pub struct JobWorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl JobWorkerPool {
    /// Start `workers` polling workers.
    pub fn start(
        scheduler: Arc<dyn DurableJobScheduler>,
        callbacks: Arc<RunCallbacks>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..workers.max(1))
            .map(|index| {
                let scheduler = scheduler.clone();
                let callbacks = callbacks.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_worker(index, scheduler, callbacks, cancel, poll_interval).await;
                })
            })
            .collect();

        Self { cancel, handles }
    }

    /// Stop polling and drain in-flight jobs.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job worker exited abnormally");
            }
        }
        info!("Job worker pool drained");
    }
}

async fn run_worker(
    index: usize,
    scheduler: Arc<dyn DurableJobScheduler>,
    callbacks: Arc<RunCallbacks>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    info!(worker = index, "Job worker started");
    let mut interval = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let claimed = match scheduler.claim_due(chrono::Utc::now(), CLAIM_BATCH).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(worker = index, error = %e, "Failed to claim jobs");
                continue;
            }
        };

        for job in claimed {
            process_job(&scheduler, &callbacks, job).await;
        }
    }

    info!(worker = index, "Job worker stopped");
}

async fn process_job(
    scheduler: &Arc<dyn DurableJobScheduler>,
    callbacks: &Arc<RunCallbacks>,
    job: ClaimedJob,
) {
    let run_id = match job.payload.get("run_id").and_then(|v| v.as_str()) {
        Some(id) => RunId::new(id),
        None => {
            warn!(job_id = %job.id, "Job payload missing run_id, dropping");
            let _ = scheduler.complete(&job.id).await;
            return;
        }
    };

    debug!(job_id = %job.id, run_id = %run_id, attempt = job.attempt, "Processing job");

    let result = match job.kind {
        JobKind::EnqueueDelayedRun => callbacks.enqueue_delayed_run(&run_id).await,
        JobKind::ExpireRun => callbacks.expire_run(&run_id).await,
    };

    match result {
        Ok(()) => {
            if let Err(e) = scheduler.complete(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to complete job");
            }
        }
        Err(e) => {
            // Left claimed: redelivered after the visibility window.
            warn!(
                job_id = %job.id,
                run_id = %run_id,
                attempt = job.attempt,
                error = %e,
                "Job failed, awaiting redelivery"
            );
        }
    }
}
