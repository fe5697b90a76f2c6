//! Orchestrator services.

pub mod admission;
pub mod callbacks;
pub mod dependencies;
pub mod enqueuer;
pub mod idempotency;
pub mod payloads;
pub mod queues;
pub mod trigger;
