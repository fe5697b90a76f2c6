//! Broker enqueuer: admits pending runs into the work-queue broker.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use rungate_core::{RunId, TaskRun};

use crate::broker::{BrokerError, EnqueueRequest, RunBroker};
use crate::store::RunStore;

/// Typed enqueue failure. Never an exception: the caller persists
/// deadlocks as the run's terminal state and decides what a transport
/// fault means in its context.
#[derive(Debug, Error)]
pub enum EnqueueFailure {
    /// The run waits on itself through a saturated queue; structurally
    /// un-runnable.
    #[error("Recursive wait deadlock in queue \"{queue}\"")]
    Deadlock { queue: String },

    /// Transport-level failure talking to the broker.
    #[error("Broker transport failure: {0}")]
    Transport(String),
}

/// Error-code prefix persisted with a deadlocked run.
pub const RECURSIVE_WAIT_DEADLOCK_CODE: &str = "RECURSIVE_WAIT_DEADLOCK";

/// Submits execution messages for pending runs.
pub struct BrokerEnqueuer {
    broker: Arc<dyn RunBroker>,
    store: Arc<dyn RunStore>,
}

impl BrokerEnqueuer {
    /// Create an enqueuer over the given broker and store.
    pub fn new(broker: Arc<dyn RunBroker>, store: Arc<dyn RunStore>) -> Self {
        Self { broker, store }
    }

    /// Submit the run's execution message.
    ///
    /// Runs created by trigger-and-wait declare a dependency on the
    /// parent's in-flight message so the broker can refuse self-deadlocking
    /// waits. Successful admission is silent.
    pub async fn enqueue_run(&self, run: &TaskRun) -> Result<(), EnqueueFailure> {
        let dependent_run_id: Option<RunId> = if run.resume_parent_on_completion {
            run.parent_task_run_id.clone()
        } else {
            None
        };

        let message = serde_json::json!({
            "version": "1",
            "run_id": run.id.as_str(),
            "friendly_id": run.friendly_id,
            "task_identifier": run.task_identifier.as_str(),
            "queue": run.queue_name,
            "machine_preset": run.machine_preset.as_str(),
            "locked_to_version_id": run.locked_to_version_id.as_ref().map(|v| v.as_str()),
        });

        let result = self
            .broker
            .enqueue(EnqueueRequest {
                environment_id: run.environment_id.clone(),
                queue_name: run.queue_name.clone(),
                run_id: run.id.clone(),
                message,
                concurrency_key: run.concurrency_key.clone(),
                queue_timestamp: run.queue_timestamp,
                dependent_run_id,
            })
            .await;

        match result {
            Ok(()) => {
                info!(
                    run_id = %run.id,
                    queue = %run.queue_name,
                    "Run admitted to broker"
                );
                Ok(())
            }
            Err(BrokerError::RecursiveWaitDeadlock { queue }) => {
                Err(EnqueueFailure::Deadlock { queue })
            }
            Err(BrokerError::Transport(message)) => Err(EnqueueFailure::Transport(message)),
        }
    }

    /// Persist a deadlocked run's terminal `SYSTEM_FAILURE` state.
    ///
    /// A deadlock is never retried; without this the run would sit in
    /// `PENDING` forever.
    pub async fn persist_deadlock(&self, run: &TaskRun, queue: &str) {
        error!(
            run_id = %run.id,
            queue = %queue,
            "Recursive wait deadlock, marking run as system failure"
        );
        let message = format!(
            "{RECURSIVE_WAIT_DEADLOCK_CODE}: run would wait on itself in queue \"{queue}\""
        );
        if let Err(e) = self.store.mark_system_failure(&run.id, &message).await {
            error!(run_id = %run.id, error = %e, "Failed to persist deadlock failure");
        }
    }
}
