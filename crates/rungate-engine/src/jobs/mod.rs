//! Durable job scheduler boundary.
//!
//! The scheduler is a durable queue with at-least-once delivery, per-job
//! visibility timeouts, and a bounded retry count. The orchestrator keys
//! jobs by a stable identifier derived from the run id so that
//! re-scheduling naturally deduplicates at the queue layer.
//!
//! Instances are explicitly constructed and injected; init once per
//! process, shut down by draining in-flight jobs via the worker pool.

pub mod worker;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use rungate_core::RunId;

pub use worker::JobWorkerPool;

use std::collections::HashMap;

/// Scheduler-layer failure.
#[derive(Debug, Error)]
#[error("Job scheduler failure: {0}")]
pub struct SchedulerError(pub String);

/// Stable identifier for a scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Job id for the delayed-run enqueue callback of a run.
    pub fn delayed_run(run_id: &RunId) -> Self {
        Self(format!("delayed-run:{run_id}"))
    }

    /// Job id for the TTL expiry callback of a run.
    pub fn expire_run(run_id: &RunId) -> Self {
        Self(format!("expire-run:{run_id}"))
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of job types the orchestrator schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Transition a `DELAYED` run to `PENDING` and enqueue it.
    EnqueueDelayedRun,
    /// Expire a still-`PENDING` run whose TTL elapsed.
    ExpireRun,
}

/// A job claimed by a worker, hidden from other workers for the visibility
/// window.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    /// Stable job identifier.
    pub id: JobId,

    /// Job type.
    pub kind: JobKind,

    /// Job payload (the run id).
    pub payload: serde_json::Value,

    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

/// Durable job scheduler consumed by the orchestrator.
///
/// `enqueue` and `dequeue` are idempotent under repeated calls with the
/// same job id: enqueue replaces, dequeue removes-if-present.
#[async_trait]
pub trait DurableJobScheduler: Send + Sync {
    /// Schedule (or replace) a job.
    async fn enqueue(
        &self,
        job_id: JobId,
        kind: JobKind,
        payload: serde_json::Value,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError>;

    /// Remove a scheduled job if it exists.
    async fn dequeue(&self, job_id: &JobId) -> Result<(), SchedulerError>;

    /// Claim up to `max` due jobs, hiding them for the visibility window.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<ClaimedJob>, SchedulerError>;

    /// Remove a job after successful processing.
    async fn complete(&self, job_id: &JobId) -> Result<(), SchedulerError>;

    /// Number of jobs currently scheduled (including claimed ones).
    async fn scheduled_count(&self) -> Result<u64, SchedulerError>;
}

#[derive(Debug, Clone)]
struct ScheduledJob {
    kind: JobKind,
    payload: serde_json::Value,
    available_at: DateTime<Utc>,
    /// Hidden until this instant while claimed.
    visible_at: DateTime<Utc>,
    attempts: u32,
}

/// In-memory [`DurableJobScheduler`].
pub struct InMemoryJobScheduler {
    jobs: Mutex<HashMap<JobId, ScheduledJob>>,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl InMemoryJobScheduler {
    /// Create a scheduler with the default visibility timeout (30s) and
    /// retry bound (8 attempts).
    pub fn new() -> Self {
        Self::with_settings(Duration::seconds(30), 8)
    }

    /// Create a scheduler with explicit settings.
    pub fn with_settings(visibility_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            visibility_timeout,
            max_attempts,
        }
    }

    /// Whether a job with the given id is scheduled.
    pub async fn contains(&self, job_id: &JobId) -> bool {
        self.jobs.lock().await.contains_key(job_id)
    }
}

impl Default for InMemoryJobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableJobScheduler for InMemoryJobScheduler {
    async fn enqueue(
        &self,
        job_id: JobId,
        kind: JobKind,
        payload: serde_json::Value,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        let available_at = available_at.unwrap_or_else(Utc::now);
        // Same id replaces: re-scheduling dedupes at the queue layer.
        jobs.insert(
            job_id,
            ScheduledJob {
                kind,
                payload,
                available_at,
                visible_at: available_at,
                attempts: 0,
            },
        );
        Ok(())
    }

    async fn dequeue(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        jobs.remove(job_id);
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<ClaimedJob>, SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        let mut claimed = Vec::new();
        let mut exhausted = Vec::new();

        for (id, job) in jobs.iter_mut() {
            if claimed.len() >= max {
                break;
            }
            if job.available_at > now || job.visible_at > now {
                continue;
            }
            if job.attempts >= self.max_attempts {
                exhausted.push(id.clone());
                continue;
            }
            job.attempts += 1;
            job.visible_at = now + self.visibility_timeout;
            claimed.push(ClaimedJob {
                id: id.clone(),
                kind: job.kind,
                payload: job.payload.clone(),
                attempt: job.attempts,
            });
        }

        for id in exhausted {
            warn!(job_id = %id, max_attempts = self.max_attempts, "Dropping job after retry bound");
            jobs.remove(&id);
        }

        Ok(claimed)
    }

    async fn complete(&self, job_id: &JobId) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        jobs.remove(job_id);
        Ok(())
    }

    async fn scheduled_count(&self) -> Result<u64, SchedulerError> {
        Ok(self.jobs.lock().await.len() as u64)
    }
}
