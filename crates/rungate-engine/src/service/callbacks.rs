//! Durable-queue callbacks: delayed-run enqueue and TTL expiry.
//!
//! Both callbacks tolerate at-least-once delivery: each one re-reads the
//! run's current status before acting, and every action is a no-op on
//! redelivery. Finding the run already resolved is success, never an
//! error.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use rungate_core::{parse_ttl, RunId, RunStatus, TaskRun};

use crate::broker::RunBroker;
use crate::events::{EventOutcome, EventSink};
use crate::jobs::{DurableJobScheduler, JobId, JobKind};
use crate::service::enqueuer::{BrokerEnqueuer, EnqueueFailure};
use crate::store::RunStore;

/// Callback failure that should be redelivered by the durable queue.
#[derive(Debug, Error)]
#[error("Callback failure: {0}")]
pub struct CallbackError(pub String);

/// Handlers for the durable jobs the orchestrator schedules.
pub struct RunCallbacks {
    store: Arc<dyn RunStore>,
    broker: Arc<dyn RunBroker>,
    scheduler: Arc<dyn DurableJobScheduler>,
    enqueuer: BrokerEnqueuer,
    events: Arc<dyn EventSink>,
}

impl RunCallbacks {
    /// Create the callback set.
    pub fn new(
        store: Arc<dyn RunStore>,
        broker: Arc<dyn RunBroker>,
        scheduler: Arc<dyn DurableJobScheduler>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let enqueuer = BrokerEnqueuer::new(broker.clone(), store.clone());
        Self {
            store,
            broker,
            scheduler,
            enqueuer,
            events,
        }
    }

    /// Schedule the delayed-run enqueue callback, replacing any previous
    /// schedule for the same run.
    ///
    /// Dequeue-then-enqueue: re-scheduling after a delay change must not
    /// leave two callbacks behind.
    pub async fn schedule_delayed_enqueue(&self, run: &TaskRun) -> Result<(), CallbackError> {
        let delay_until = run.delay_until.ok_or_else(|| {
            CallbackError(format!("run {} has no delay_until to schedule", run.id))
        })?;
        let job_id = JobId::delayed_run(&run.id);
        self.scheduler
            .dequeue(&job_id)
            .await
            .map_err(|e| CallbackError(e.to_string()))?;
        self.scheduler
            .enqueue(
                job_id,
                JobKind::EnqueueDelayedRun,
                run_payload(&run.id),
                Some(delay_until),
            )
            .await
            .map_err(|e| CallbackError(e.to_string()))?;
        debug!(run_id = %run.id, delay_until = %delay_until, "Delayed enqueue scheduled");
        Ok(())
    }

    /// Schedule the TTL expiry callback for a pending run.
    pub async fn schedule_expiry(&self, run: &TaskRun) -> Result<(), CallbackError> {
        let Some(ttl) = &run.ttl else {
            return Ok(());
        };
        let ttl = parse_ttl(ttl).map_err(|e| CallbackError(e.to_string()))?;
        let job_id = JobId::expire_run(&run.id);
        self.scheduler
            .enqueue(
                job_id,
                JobKind::ExpireRun,
                run_payload(&run.id),
                Some(Utc::now() + ttl),
            )
            .await
            .map_err(|e| CallbackError(e.to_string()))?;
        debug!(run_id = %run.id, ttl = %run.ttl.as_deref().unwrap_or_default(), "Expiry scheduled");
        Ok(())
    }

    /// Transition a `DELAYED` run to `PENDING` and enqueue it.
    ///
    /// Redelivery-safe: a run that already moved on is left alone; a run
    /// stuck in `PENDING` after a partial failure is enqueued again (the
    /// broker dedupes by run id).
    pub async fn enqueue_delayed_run(&self, run_id: &RunId) -> Result<(), CallbackError> {
        let Some(current) = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| CallbackError(e.to_string()))?
        else {
            warn!(run_id = %run_id, "Delayed-run callback for unknown run");
            return Ok(());
        };

        let run = match current.status {
            RunStatus::Delayed => {
                match self
                    .store
                    .transition_delayed_to_pending(run_id, Utc::now())
                    .await
                    .map_err(|e| CallbackError(e.to_string()))?
                {
                    Some(run) => {
                        info!(run_id = %run.id, "Delayed run is now pending");
                        run
                    }
                    // Lost a race with another delivery; that delivery
                    // owns the enqueue.
                    None => return Ok(()),
                }
            }
            // Partial failure on a previous delivery: transition done,
            // enqueue outstanding.
            RunStatus::Pending => current,
            status => {
                debug!(run_id = %run_id, status = %status, "Delayed-run callback is a no-op");
                return Ok(());
            }
        };

        if run.ttl.is_some() {
            self.schedule_expiry(&run).await?;
        }

        match self.enqueuer.enqueue_run(&run).await {
            Ok(()) => Ok(()),
            Err(EnqueueFailure::Deadlock { queue }) => {
                // Terminal: recorded on the run, the job itself succeeded.
                self.enqueuer.persist_deadlock(&run, &queue).await;
                Ok(())
            }
            // Transport faults are retried by the durable queue's own
            // redelivery policy.
            Err(EnqueueFailure::Transport(message)) => Err(CallbackError(message)),
        }
    }

    /// Expire a still-`PENDING` run whose TTL elapsed.
    pub async fn expire_run(&self, run_id: &RunId) -> Result<(), CallbackError> {
        let expired = self
            .store
            .transition_pending_to_expired(run_id, Utc::now())
            .await
            .map_err(|e| CallbackError(e.to_string()))?;

        let Some(run) = expired else {
            // Already started or otherwise resolved.
            debug!(run_id = %run_id, "Expiry callback is a no-op");
            return Ok(());
        };

        info!(
            run_id = %run.id,
            ttl = run.ttl.as_deref().unwrap_or_default(),
            "Run expired before starting"
        );

        self.events
            .complete_event(
                &run.friendly_id,
                EventOutcome::Error(format!(
                    "Run expired because the TTL ({}) elapsed before it started",
                    run.ttl.as_deref().unwrap_or_default()
                )),
            )
            .await;

        // Safe even if the message was never enqueued.
        self.broker
            .acknowledge(&run.id)
            .await
            .map_err(|e| CallbackError(e.to_string()))?;

        Ok(())
    }
}

fn run_payload(run_id: &RunId) -> serde_json::Value {
    serde_json::json!({ "run_id": run_id.as_str() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::events::RecordingEventSink;
    use crate::jobs::InMemoryJobScheduler;
    use crate::store::{InMemoryRunStore, NewRun};
    use rungate_core::{
        generate_friendly_run_id, EnvironmentId, EnvironmentType, IoPacket, MachinePreset,
        RuntimeEnvironment, TaskIdentifier,
    };

    struct Fixture {
        store: Arc<InMemoryRunStore>,
        broker: Arc<InMemoryBroker>,
        scheduler: Arc<InMemoryJobScheduler>,
        events: Arc<RecordingEventSink>,
        callbacks: RunCallbacks,
        environment: RuntimeEnvironment,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRunStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let scheduler = Arc::new(InMemoryJobScheduler::new());
        let events = Arc::new(RecordingEventSink::new());
        let callbacks = RunCallbacks::new(
            store.clone(),
            broker.clone(),
            scheduler.clone(),
            events.clone(),
        );
        Fixture {
            store,
            broker,
            scheduler,
            events,
            callbacks,
            environment: RuntimeEnvironment::new(
                EnvironmentId::generate(),
                EnvironmentType::Production,
            ),
        }
    }

    async fn create_run(fixture: &Fixture, status: RunStatus, ttl: Option<&str>) -> TaskRun {
        fixture
            .store
            .create_run(NewRun {
                friendly_id: generate_friendly_run_id(),
                task_identifier: TaskIdentifier::new("my-task"),
                queue_name: "task/my-task".into(),
                environment: fixture.environment.clone(),
                status,
                queued_at: (status == RunStatus::Pending).then(Utc::now),
                queue_timestamp: Utc::now(),
                delay_until: (status == RunStatus::Delayed)
                    .then(|| Utc::now() + chrono::Duration::minutes(10)),
                ttl: ttl.map(str::to_owned),
                idempotency_key: None,
                idempotency_key_expires_at: None,
                parent_task_run_id: None,
                parent_attempt_id: None,
                root_task_run_id: None,
                depth: 0,
                batch_id: None,
                resume_parent_on_completion: false,
                payload: IoPacket::Json { data: "{}".into() },
                concurrency_key: None,
                one_time_use_token: None,
                machine_preset: MachinePreset::default(),
                locked_to_version_id: None,
                tags: Vec::new(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_delayed_callback_fires_once_under_redelivery() {
        let fixture = fixture();
        let run = create_run(&fixture, RunStatus::Delayed, None).await;

        fixture.callbacks.enqueue_delayed_run(&run.id).await.unwrap();
        fixture.callbacks.enqueue_delayed_run(&run.id).await.unwrap();

        let current = fixture.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(current.status, RunStatus::Pending);
        assert!(current.queued_at.is_some());
        // Exactly one broker message.
        assert_eq!(
            fixture.broker.queue_depth(&fixture.environment.id).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_delayed_callback_schedules_expiry_when_ttl_set() {
        let fixture = fixture();
        let run = create_run(&fixture, RunStatus::Delayed, Some("10m")).await;

        fixture.callbacks.enqueue_delayed_run(&run.id).await.unwrap();
        assert!(fixture.scheduler.contains(&JobId::expire_run(&run.id)).await);
    }

    #[tokio::test]
    async fn test_delayed_callback_noop_when_already_executing() {
        let fixture = fixture();
        let run = create_run(&fixture, RunStatus::Delayed, None).await;
        fixture.store.update_status(&run.id, RunStatus::Executing).await;

        fixture.callbacks.enqueue_delayed_run(&run.id).await.unwrap();
        assert_eq!(
            fixture.broker.queue_depth(&fixture.environment.id).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_expire_pending_run() {
        let fixture = fixture();
        let run = create_run(&fixture, RunStatus::Pending, Some("10m")).await;

        fixture.callbacks.expire_run(&run.id).await.unwrap();

        let current = fixture.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(current.status, RunStatus::Expired);
        assert!(current.expired_at.is_some());
        assert!(current.completed_at.is_some());

        let events = fixture.events.recorded().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, run.friendly_id);
        assert!(matches!(events[0].1, EventOutcome::Error(_)));
    }

    #[tokio::test]
    async fn test_expire_is_noop_after_execution_started() {
        let fixture = fixture();
        let run = create_run(&fixture, RunStatus::Pending, Some("10m")).await;
        fixture.store.update_status(&run.id, RunStatus::Executing).await;

        fixture.callbacks.expire_run(&run.id).await.unwrap();

        let current = fixture.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(current.status, RunStatus::Executing);
        assert!(fixture.events.recorded().await.is_empty());
    }

    #[tokio::test]
    async fn test_expire_redelivery_is_silent() {
        let fixture = fixture();
        let run = create_run(&fixture, RunStatus::Pending, Some("10m")).await;

        fixture.callbacks.expire_run(&run.id).await.unwrap();
        fixture.callbacks.expire_run(&run.id).await.unwrap();

        // One completion event despite two deliveries.
        assert_eq!(fixture.events.recorded().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_previous_callback() {
        let fixture = fixture();
        let mut run = create_run(&fixture, RunStatus::Delayed, None).await;

        fixture.callbacks.schedule_delayed_enqueue(&run).await.unwrap();
        // Delay changed: re-scheduling must not leave two callbacks.
        run.delay_until = Some(Utc::now() + chrono::Duration::hours(2));
        fixture.callbacks.schedule_delayed_enqueue(&run).await.unwrap();

        assert_eq!(fixture.scheduler.scheduled_count().await.unwrap(), 1);
    }
}
