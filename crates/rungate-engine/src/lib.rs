//! Rungate Engine
//!
//! The run lifecycle orchestrator: accepts trigger requests, makes acceptance
//! idempotent under concurrent retries, assigns runs to concurrency-limited
//! queues, defers execution (delay) or bounds lifetime (TTL), and admits
//! runnable runs into the work-queue broker.
//!
//! External collaborators (persistent store, broker, durable job scheduler,
//! object store, entitlement oracle, event sink) are consumed through traits;
//! in-memory implementations back tests and the development daemon.

pub mod broker;
pub mod config;
pub mod engine;
pub mod entitlement;
pub mod events;
pub mod jobs;
pub mod metrics;
pub mod object_store;
pub mod service;
pub mod store;

pub use config::EngineConfig;
pub use engine::Engine;
pub use service::trigger::{TriggerRequest, TriggerResult, TriggerService};
