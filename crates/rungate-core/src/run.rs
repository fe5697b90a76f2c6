//! Task run and environment types.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ids::{
    AttemptId, BatchId, EnvironmentId, OrganizationId, ProjectId, RunId, TaskIdentifier,
    WorkerVersionId,
};
use crate::packet::IoPacket;
use crate::status::{EnvironmentType, RunStatus};

/// Machine preset a run executes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachinePreset(String);

impl MachinePreset {
    /// Create a preset from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the preset name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MachinePreset {
    fn default() -> Self {
        Self("small-1x".to_string())
    }
}

impl std::fmt::Display for MachinePreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The environment a trigger request executes against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEnvironment {
    /// Unique environment identifier.
    pub id: EnvironmentId,

    /// Kind of environment (development, production, ...).
    pub environment_type: EnvironmentType,

    /// Owning organization.
    pub organization_id: OrganizationId,

    /// Owning project.
    pub project_id: ProjectId,

    /// Environment-level cap on any single queue's concurrency limit.
    pub maximum_concurrency_limit: u32,

    /// Organization-level cap on any single queue's concurrency limit.
    pub organization_concurrency_limit: u32,
}

impl RuntimeEnvironment {
    /// Create an environment with the given type and default limits.
    pub fn new(id: impl Into<EnvironmentId>, environment_type: EnvironmentType) -> Self {
        Self {
            id: id.into(),
            environment_type,
            organization_id: OrganizationId::generate(),
            project_id: ProjectId::generate(),
            maximum_concurrency_limit: 100,
            organization_concurrency_limit: 100,
        }
    }
}

/// A task run: one requested execution of a task with a specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Internal identifier.
    pub id: RunId,

    /// Externally-visible friendly identifier (`run_<hex>`).
    pub friendly_id: String,

    /// Monotonically increasing per-(task, environment) sequence number.
    pub run_number: u64,

    /// The task this run executes.
    pub task_identifier: TaskIdentifier,

    /// Resolved target queue name.
    pub queue_name: String,

    /// Environment the run belongs to.
    pub environment_id: EnvironmentId,

    /// Kind of environment, denormalized for admission decisions.
    pub environment_type: EnvironmentType,

    /// Owning organization.
    pub organization_id: OrganizationId,

    /// Owning project.
    pub project_id: ProjectId,

    /// Current lifecycle status.
    pub status: RunStatus,

    /// When the run row was created.
    pub created_at: DateTime<Utc>,

    /// When the run entered the queue (unset while `DELAYED`).
    pub queued_at: Option<DateTime<Utc>>,

    /// Fairness/ordering timestamp, inherited from an ancestor when present.
    pub queue_timestamp: DateTime<Utc>,

    /// Future timestamp before which the run must not be enqueued.
    pub delay_until: Option<DateTime<Utc>>,

    /// Maximum time the run may remain un-started, as the caller wrote it.
    pub ttl: Option<String>,

    /// When the run was force-expired.
    pub expired_at: Option<DateTime<Utc>>,

    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,

    /// Caller-supplied dedup token, unique per (environment, task).
    pub idempotency_key: Option<String>,

    /// When the idempotency key stops deduplicating.
    pub idempotency_key_expires_at: Option<DateTime<Utc>>,

    /// Parent run, when triggered from inside another run.
    pub parent_task_run_id: Option<RunId>,

    /// The specific parent attempt that triggered this run.
    pub parent_attempt_id: Option<AttemptId>,

    /// Root of the dependency chain; equals `id` for depth-0 runs.
    pub root_task_run_id: Option<RunId>,

    /// Count of ancestors in the dependency chain.
    pub depth: u32,

    /// Batch this run belongs to, if any.
    pub batch_id: Option<BatchId>,

    /// Whether the execution subsystem should resume the parent when this
    /// run finishes (trigger-and-wait semantics).
    pub resume_parent_on_completion: bool,

    /// The run's payload packet.
    pub payload: IoPacket,

    /// Optional sub-partition within the queue.
    pub concurrency_key: Option<String>,

    /// Optional single-use guard token.
    pub one_time_use_token: Option<String>,

    /// Machine preset for execution.
    pub machine_preset: MachinePreset,

    /// Worker version this run is pinned to, if locked.
    pub locked_to_version_id: Option<WorkerVersionId>,

    /// User-supplied tags.
    pub tags: Vec<String>,

    /// Terminal error message for `SYSTEM_FAILURE` runs.
    pub error: Option<String>,
}

impl TaskRun {
    /// Whether the idempotency key on this run is still deduplicating.
    pub fn idempotency_key_is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.idempotency_key_expires_at {
            Some(expires_at) => expires_at > now,
            // No expiry recorded: the key never expires.
            None => self.idempotency_key.is_some(),
        }
    }
}

/// Generate an externally-visible friendly run id (`run_<hex>`).
pub fn generate_friendly_run_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("run_{hex}")
}
