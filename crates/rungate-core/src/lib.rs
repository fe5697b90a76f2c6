//! Rungate Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Storage engines
//! - Runtime specifics
//!
//! All types here represent the core business domain of Rungate: task runs,
//! queues, payload packets, and the trigger error taxonomy.

pub mod duration;
pub mod error;
pub mod ids;
pub mod packet;
pub mod queue;
pub mod run;
pub mod status;

// Re-export commonly used types
pub use duration::{format_ttl, parse_ttl, TtlError};
pub use error::TriggerError;
pub use ids::{
    AttemptId, BatchId, EnvironmentId, OrganizationId, ProjectId, RunId, TaskIdentifier,
    WorkerVersionId,
};
pub use packet::IoPacket;
pub use queue::{sanitize_queue_name, LimitUpdate, QueueType, TaskQueue};
pub use run::{generate_friendly_run_id, MachinePreset, RuntimeEnvironment, TaskRun};
pub use status::{EnvironmentType, RunStatus};
