//! Work-queue broker boundary.
//!
//! The broker is an at-least-once, priority-and-concurrency-aware message
//! queue. The orchestrator only submits, acknowledges, reads depth, and
//! synchronizes per-queue concurrency limits; dequeue belongs to the worker
//! fleet.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use rungate_core::{EnvironmentId, RunId};

/// Broker failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The message can never be admitted: it waits on an in-flight message
    /// whose concurrency slot is held by its own dependency chain.
    #[error("Recursive wait deadlock in queue \"{queue}\"")]
    RecursiveWaitDeadlock { queue: String },

    /// Network or broker-side failure. Not retried inside the orchestrator.
    #[error("Broker transport failure: {0}")]
    Transport(String),
}

/// An execution message submitted to the broker.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Environment the message belongs to.
    pub environment_id: EnvironmentId,

    /// Target queue name.
    pub queue_name: String,

    /// The run this message executes.
    pub run_id: RunId,

    /// Serialized execution message for the worker fleet.
    pub message: serde_json::Value,

    /// Optional sub-partition within the queue.
    pub concurrency_key: Option<String>,

    /// Fairness/ordering timestamp.
    pub queue_timestamp: DateTime<Utc>,

    /// In-flight message this one depends on (trigger-and-wait parent).
    /// Used to detect self-referential concurrency deadlocks.
    pub dependent_run_id: Option<RunId>,
}

/// Work-queue broker consumed by the orchestrator.
#[async_trait]
pub trait RunBroker: Send + Sync {
    /// Submit an execution message. Successful admission is silent.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<(), BrokerError>;

    /// Remove a run's message. Idempotent: safe even if the message was
    /// never enqueued.
    async fn acknowledge(&self, run_id: &RunId) -> Result<(), BrokerError>;

    /// Number of queued messages across the environment.
    async fn queue_depth(&self, environment_id: &EnvironmentId) -> Result<u64, BrokerError>;

    /// Synchronize the live concurrency limit for a queue. `None` removes
    /// any limit.
    async fn set_queue_concurrency_limit(
        &self,
        environment_id: &EnvironmentId,
        queue_name: &str,
        limit: Option<u32>,
    ) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    environment_id: EnvironmentId,
    queue_name: String,
}

#[derive(Default)]
struct BrokerState {
    /// Queued messages, keyed by run id (one execution message per run).
    messages: HashMap<RunId, QueuedMessage>,
    /// Live concurrency limits per (environment, queue).
    limits: HashMap<(EnvironmentId, String), u32>,
    /// Runs currently holding a concurrency slot per (environment, queue).
    holds: HashMap<(EnvironmentId, String), HashSet<RunId>>,
}

/// In-memory [`RunBroker`].
///
/// Holds queued messages and per-queue concurrency slots. `begin_execution`
/// / `finish_execution` stand in for the worker-side dequeue so tests can
/// saturate a queue.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker-side dequeue: the run leaves the queue and takes a
    /// concurrency slot.
    pub async fn begin_execution(
        &self,
        environment_id: &EnvironmentId,
        queue_name: &str,
        run_id: &RunId,
    ) {
        let mut state = self.state.lock().await;
        state.messages.remove(run_id);
        state
            .holds
            .entry((environment_id.clone(), queue_name.to_owned()))
            .or_default()
            .insert(run_id.clone());
    }

    /// Worker-side completion: the run releases its concurrency slot.
    pub async fn finish_execution(
        &self,
        environment_id: &EnvironmentId,
        queue_name: &str,
        run_id: &RunId,
    ) {
        let mut state = self.state.lock().await;
        if let Some(holds) = state
            .holds
            .get_mut(&(environment_id.clone(), queue_name.to_owned()))
        {
            holds.remove(run_id);
        }
    }

    /// Whether a run's message is currently queued.
    pub async fn is_enqueued(&self, run_id: &RunId) -> bool {
        self.state.lock().await.messages.contains_key(run_id)
    }

    /// Total number of queued messages (all environments).
    pub async fn total_queued(&self) -> u64 {
        self.state.lock().await.messages.len() as u64
    }

    /// The live concurrency limit for a queue, if one is set.
    pub async fn limit_for(&self, environment_id: &EnvironmentId, queue_name: &str) -> Option<u32> {
        let state = self.state.lock().await;
        state
            .limits
            .get(&(environment_id.clone(), queue_name.to_owned()))
            .copied()
    }

    /// Number of queued messages for a single queue.
    pub async fn queue_backlog(&self, environment_id: &EnvironmentId, queue_name: &str) -> u64 {
        let state = self.state.lock().await;
        state
            .messages
            .values()
            .filter(|m| &m.environment_id == environment_id && m.queue_name == queue_name)
            .count() as u64
    }
}

#[async_trait]
impl RunBroker for InMemoryBroker {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;

        // Self-deadlock check: a message that waits on an in-flight parent
        // in the same limited queue can only run once the parent's slot
        // frees, and the parent only frees once this message runs.
        if let Some(dependent_run_id) = &request.dependent_run_id {
            let queue_key = (request.environment_id.clone(), request.queue_name.clone());
            if let Some(&limit) = state.limits.get(&queue_key) {
                let holds = state.holds.get(&queue_key);
                let parent_holds_slot = holds
                    .map(|h| h.contains(dependent_run_id))
                    .unwrap_or(false);
                let saturated = holds.map(|h| h.len() as u32 >= limit).unwrap_or(false);
                if parent_holds_slot && saturated {
                    return Err(BrokerError::RecursiveWaitDeadlock {
                        queue: request.queue_name.clone(),
                    });
                }
            }
        }

        debug!(
            run_id = %request.run_id,
            queue = %request.queue_name,
            "Execution message enqueued"
        );

        state.messages.insert(
            request.run_id.clone(),
            QueuedMessage {
                environment_id: request.environment_id,
                queue_name: request.queue_name,
            },
        );

        Ok(())
    }

    async fn acknowledge(&self, run_id: &RunId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.messages.remove(run_id);
        Ok(())
    }

    async fn queue_depth(&self, environment_id: &EnvironmentId) -> Result<u64, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .messages
            .values()
            .filter(|m| &m.environment_id == environment_id)
            .count() as u64)
    }

    async fn set_queue_concurrency_limit(
        &self,
        environment_id: &EnvironmentId,
        queue_name: &str,
        limit: Option<u32>,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let key = (environment_id.clone(), queue_name.to_owned());
        match limit {
            Some(limit) => {
                state.limits.insert(key, limit);
            }
            None => {
                state.limits.remove(&key);
            }
        }
        Ok(())
    }
}
