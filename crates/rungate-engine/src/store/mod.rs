//! Persistent store boundary.
//!
//! The orchestrator consumes transactional CRUD with unique-constraint
//! enforcement and a serialized per-(task, environment) counter primitive.
//! Constraint violations come back as the closed [`CreationError`] enum
//! rather than driver-specific error metadata.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rungate_core::{
    AttemptId, BatchId, EnvironmentId, IoPacket, LimitUpdate, MachinePreset, QueueType, RunId,
    RunStatus, RuntimeEnvironment, TaskIdentifier, TaskQueue, TaskRun, WorkerVersionId,
};

pub use memory::InMemoryRunStore;

/// Storage-layer failure unrelated to a constraint violation.
#[derive(Debug, Error)]
#[error("Storage failure: {0}")]
pub struct StoreError(pub String);

/// Constraint violation raised while creating a run or queue.
///
/// A closed enum: callers branch on the violated index, never on error
/// strings.
#[derive(Debug, Error)]
pub enum CreationError {
    /// The (environment, task, idempotency key) tuple already exists.
    #[error("Idempotency key already exists for this task and environment")]
    DuplicateIdempotencyKey,

    /// The one-time-use token was already consumed by another run.
    #[error("One-time use token has already been used")]
    DuplicateOneTimeToken,

    /// The (environment, queue name) pair was created concurrently.
    #[error("Queue \"{0}\" already exists in this environment")]
    DuplicateQueueName(String),

    /// Any other storage failure.
    #[error("Storage failure: {0}")]
    Other(String),
}

/// An execution attempt record, referenced by dependency resolution.
///
/// Attempts are owned by the execution subsystem; the store only surfaces
/// the linkage and status the resolver needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Internal attempt identifier.
    pub id: AttemptId,

    /// Externally-visible friendly identifier (`attempt_<hex>`).
    pub friendly_id: String,

    /// The run this attempt belongs to.
    pub task_run_id: RunId,

    /// Status of the attempt. Shares the run status vocabulary at this
    /// boundary.
    pub status: RunStatus,
}

/// A batch record, referenced by dependency resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Internal batch identifier.
    pub id: BatchId,

    /// Externally-visible friendly identifier (`batch_<hex>`).
    pub friendly_id: String,

    /// Environment the batch belongs to.
    pub environment_id: EnvironmentId,

    /// The attempt that is waiting on this batch, for batch-trigger-and-wait.
    pub dependent_attempt_id: Option<AttemptId>,
}

/// Queue upsert request.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// Environment the queue belongs to.
    pub environment_id: EnvironmentId,

    /// Sanitized queue name.
    pub name: String,

    /// Whether the queue was explicitly named or is a task default.
    pub queue_type: QueueType,

    /// Concurrency-limit change to apply, if the caller requested one.
    /// `None` leaves an existing record untouched.
    pub limit: Option<LimitUpdate>,
}

/// Everything the store needs to persist a new run.
///
/// `created_at` and the run number are allocated inside the store's atomic
/// creation transaction.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub friendly_id: String,
    pub task_identifier: TaskIdentifier,
    pub queue_name: String,
    pub environment: RuntimeEnvironment,
    pub status: RunStatus,
    pub queued_at: Option<DateTime<Utc>>,
    pub queue_timestamp: DateTime<Utc>,
    pub delay_until: Option<DateTime<Utc>>,
    pub ttl: Option<String>,
    pub idempotency_key: Option<String>,
    pub idempotency_key_expires_at: Option<DateTime<Utc>>,
    pub parent_task_run_id: Option<RunId>,
    pub parent_attempt_id: Option<AttemptId>,
    pub root_task_run_id: Option<RunId>,
    pub depth: u32,
    pub batch_id: Option<BatchId>,
    pub resume_parent_on_completion: bool,
    pub payload: IoPacket,
    pub concurrency_key: Option<String>,
    pub one_time_use_token: Option<String>,
    pub machine_preset: MachinePreset,
    pub locked_to_version_id: Option<WorkerVersionId>,
    pub tags: Vec<String>,
}

/// Persistent store consumed by the orchestrator.
///
/// `create_run` is a single atomic unit: run-number allocation, uniqueness
/// checks, and the row insert either all commit or none do. Status-gated
/// transitions return `None` when the gate fails, which callbacks treat as
/// a redelivery no-op.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Look up a run by its idempotency key within (environment, task).
    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &EnvironmentId,
        task_identifier: &TaskIdentifier,
        idempotency_key: &str,
    ) -> Result<Option<TaskRun>, StoreError>;

    /// Clear the idempotency key on a stale run record.
    async fn clear_idempotency_key(&self, run_id: &RunId) -> Result<(), StoreError>;

    /// Atomically allocate a run number and persist a new run.
    async fn create_run(&self, new_run: NewRun) -> Result<TaskRun, CreationError>;

    /// Fetch a run by internal id.
    async fn get_run(&self, run_id: &RunId) -> Result<Option<TaskRun>, StoreError>;

    /// Fetch a run by its externally-visible friendly id.
    async fn find_run_by_friendly_id(
        &self,
        friendly_id: &str,
    ) -> Result<Option<TaskRun>, StoreError>;

    /// Resolve an attempt by friendly id.
    async fn find_attempt(&self, friendly_id: &str) -> Result<Option<AttemptRecord>, StoreError>;

    /// Resolve an attempt by internal id (batch dependency linkage).
    async fn find_attempt_by_id(
        &self,
        attempt_id: &AttemptId,
    ) -> Result<Option<AttemptRecord>, StoreError>;

    /// Resolve a batch by friendly id.
    async fn find_batch(&self, friendly_id: &str) -> Result<Option<BatchRecord>, StoreError>;

    /// Resolve a worker version tag to its id within an environment.
    async fn resolve_version(
        &self,
        environment_id: &EnvironmentId,
        version: &str,
    ) -> Result<Option<WorkerVersionId>, StoreError>;

    /// Move a `DELAYED` run to `PENDING`, stamping `queued_at`.
    /// Returns `None` if the run is missing or no longer `DELAYED`.
    async fn transition_delayed_to_pending(
        &self,
        run_id: &RunId,
        queued_at: DateTime<Utc>,
    ) -> Result<Option<TaskRun>, StoreError>;

    /// Move a `PENDING` run to `EXPIRED`, stamping `expired_at` and
    /// `completed_at`. Returns `None` if the run is missing or not `PENDING`.
    async fn transition_pending_to_expired(
        &self,
        run_id: &RunId,
        expired_at: DateTime<Utc>,
    ) -> Result<Option<TaskRun>, StoreError>;

    /// Move a non-terminal run to `SYSTEM_FAILURE` with the given error.
    /// Returns `None` if the run is missing or already terminal.
    async fn mark_system_failure(
        &self,
        run_id: &RunId,
        error: &str,
    ) -> Result<Option<TaskRun>, StoreError>;

    /// Create or update a queue record.
    async fn upsert_queue(&self, spec: QueueSpec) -> Result<TaskQueue, CreationError>;

    /// Fetch a queue record by (environment, name).
    async fn find_queue(
        &self,
        environment_id: &EnvironmentId,
        name: &str,
    ) -> Result<Option<TaskQueue>, StoreError>;

    /// The last allocated run number for (task, environment). Diagnostic
    /// fallback read; the authoritative allocation happens in `create_run`.
    async fn current_run_number(
        &self,
        environment_id: &EnvironmentId,
        task_identifier: &TaskIdentifier,
    ) -> Result<u64, StoreError>;

    /// Run counts by status, for metrics/audit.
    async fn count_runs_by_status(&self) -> Result<HashMap<RunStatus, u64>, StoreError>;
}
