//! Queue resolver & concurrency configurator.

use std::sync::Arc;

use tracing::info;

use rungate_core::{
    sanitize_queue_name, LimitUpdate, QueueType, RuntimeEnvironment, TaskIdentifier, TaskQueue,
    TriggerError,
};

use crate::broker::RunBroker;
use crate::store::{CreationError, QueueSpec, RunStore};

/// Queue options a trigger request may carry.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Explicit queue name override.
    pub name: Option<String>,

    /// Requested concurrency-limit change for the resolved queue.
    pub concurrency_limit: Option<LimitUpdate>,
}

/// The resolved target queue for a new run.
#[derive(Debug, Clone)]
pub struct ResolvedQueue {
    /// Sanitized queue name.
    pub name: String,

    /// Whether the name was declared or is the task fallback.
    pub queue_type: QueueType,
}

/// Resolve the target queue name with precedence:
/// explicit request name, then the task's declared default, then the
/// `task/<identifier>` fallback.
pub fn resolve_queue(
    explicit: Option<&str>,
    task_default: Option<&str>,
    task_identifier: &TaskIdentifier,
) -> ResolvedQueue {
    if let Some(name) = explicit {
        return ResolvedQueue {
            name: sanitize_queue_name(name),
            queue_type: QueueType::Named,
        };
    }
    if let Some(name) = task_default {
        return ResolvedQueue {
            name: sanitize_queue_name(name),
            queue_type: QueueType::Named,
        };
    }
    ResolvedQueue {
        name: sanitize_queue_name(&format!("task/{task_identifier}")),
        queue_type: QueueType::Task,
    }
}

/// Upserts queue records and keeps the broker's live limit in sync.
pub struct QueueConfigurator {
    store: Arc<dyn RunStore>,
    broker: Arc<dyn RunBroker>,
}

impl QueueConfigurator {
    /// Create a configurator over the given store and broker.
    pub fn new(store: Arc<dyn RunStore>, broker: Arc<dyn RunBroker>) -> Self {
        Self { store, broker }
    }

    /// Create-or-update the queue record, clamping any requested limit to
    /// the environment/organization maxima and mirroring it to the broker.
    ///
    /// The persisted record and the broker's live limit are updated
    /// together; a crash between the two heals on the next call.
    pub async fn configure(
        &self,
        environment: &RuntimeEnvironment,
        queue: &ResolvedQueue,
        requested_limit: Option<LimitUpdate>,
    ) -> Result<TaskQueue, TriggerError> {
        let limit = requested_limit.map(|update| {
            update.clamped(
                environment.maximum_concurrency_limit,
                environment.organization_concurrency_limit,
            )
        });

        let spec = QueueSpec {
            environment_id: environment.id.clone(),
            name: queue.name.clone(),
            queue_type: queue.queue_type,
            limit,
        };

        let record = match self.store.upsert_queue(spec.clone()).await {
            Ok(record) => record,
            // Concurrent first-creation: the queue now exists, one retry
            // settles on it.
            Err(CreationError::DuplicateQueueName(_)) => self
                .store
                .upsert_queue(spec)
                .await
                .map_err(|_| TriggerError::QueueNameRace {
                    name: queue.name.clone(),
                })?,
            Err(e) => return Err(TriggerError::Internal(e.to_string())),
        };

        if let Some(update) = limit {
            self.broker
                .set_queue_concurrency_limit(&environment.id, &queue.name, update.as_limit())
                .await
                .map_err(|e| TriggerError::Internal(e.to_string()))?;

            info!(
                queue = %queue.name,
                limit = ?update.as_limit(),
                "Queue concurrency limit updated"
            );
        }

        Ok(record)
    }
}
