//! The run lifecycle service: the public trigger entry point.
//!
//! Orchestrates the idempotency ledger, admission guard, dependency
//! resolver, payload packet handler, atomic run creation, delayed/TTL
//! scheduling, and the broker handoff.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use rungate_core::{
    generate_friendly_run_id, parse_ttl, MachinePreset, RunStatus, RuntimeEnvironment,
    TaskIdentifier, TaskRun, TriggerError, WorkerVersionId,
};

use crate::engine::Engine;
use crate::service::admission::AdmissionGuard;
use crate::service::callbacks::RunCallbacks;
use crate::service::dependencies::{DependencyRefs, DependencyResolver, ResolvedDependencies};
use crate::service::enqueuer::{BrokerEnqueuer, EnqueueFailure};
use crate::service::idempotency::{IdempotencyLedger, LedgerOutcome};
use crate::service::payloads::PayloadPacketHandler;
use crate::service::queues::{resolve_queue, QueueConfigurator, QueueOptions};
use crate::store::{CreationError, NewRun, RunStore};

/// Per-run options carried in a trigger request's body.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Deduplication token, unique per (environment, task) within its TTL.
    pub idempotency_key: Option<String>,

    /// How long the idempotency key deduplicates. Defaults to the engine's
    /// configured window.
    pub idempotency_key_ttl: Option<String>,

    /// Future timestamp before which the run must not be enqueued.
    pub delay_until: Option<DateTime<Utc>>,

    /// Maximum time the run may remain un-started ("10m", "1h30m").
    pub ttl: Option<String>,

    /// User-supplied tags.
    pub tags: Vec<String>,

    /// Queue override and concurrency-limit request.
    pub queue: QueueOptions,

    /// Optional sub-partition within the queue.
    pub concurrency_key: Option<String>,

    /// Optional single-use guard token.
    pub one_time_use_token: Option<String>,

    /// Machine preset name.
    pub machine_preset: Option<String>,

    /// Worker version tag to pin the run to.
    pub locked_to_version: Option<String>,

    /// Dependency-chain references.
    pub dependencies: DependencyRefs,
}

/// System-level flags, set by internal callers rather than users.
#[derive(Debug, Clone, Default)]
pub struct SystemOptions {
    /// Bypass queue-size and entitlement checks.
    pub skip_checks: bool,

    /// Pre-assigned friendly id (replays, batch members).
    pub friendly_id: Option<String>,

    /// Explicit fairness timestamp, overriding inheritance.
    pub queue_timestamp: Option<DateTime<Utc>>,
}

/// A request to trigger one run of a task.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    /// The task to run.
    pub task_identifier: TaskIdentifier,

    /// Environment to run in.
    pub environment: RuntimeEnvironment,

    /// Raw payload data.
    pub payload: String,

    /// Declared payload content type.
    pub payload_type: String,

    /// The task's statically-declared default queue name, if any.
    pub task_default_queue: Option<String>,

    /// Per-run options.
    pub options: RunOptions,

    /// System-level flags.
    pub system: SystemOptions,
}

impl TriggerRequest {
    /// A minimal JSON-payload request.
    pub fn new(
        task_identifier: impl Into<TaskIdentifier>,
        environment: RuntimeEnvironment,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            task_identifier: task_identifier.into(),
            environment,
            payload: payload.into(),
            payload_type: rungate_core::packet::CONTENT_TYPE_JSON.to_owned(),
            task_default_queue: None,
            options: RunOptions::default(),
            system: SystemOptions::default(),
        }
    }
}

/// Result of a trigger call.
#[derive(Debug, Clone)]
pub struct TriggerResult {
    /// The persisted (or replayed) run.
    pub run: TaskRun,

    /// True when an idempotency-key match replayed an existing run.
    pub is_cached: bool,
}

enum Outcome {
    Done(TriggerResult),
    /// Lost an idempotency-key constraint race; retry from the top.
    RetryIdempotency,
}

/// The public trigger entry point.
pub struct TriggerService {
    engine: Arc<Engine>,
    ledger: IdempotencyLedger,
    resolver: DependencyResolver,
    guard: AdmissionGuard,
    queues: QueueConfigurator,
    payloads: PayloadPacketHandler,
    enqueuer: BrokerEnqueuer,
    callbacks: RunCallbacks,
}

impl TriggerService {
    /// Create the service over an engine.
    pub fn new(engine: Arc<Engine>) -> Self {
        let ledger = IdempotencyLedger::new(engine.store.clone());
        let resolver = DependencyResolver::new(engine.store.clone());
        let guard = AdmissionGuard::new(
            engine.broker.clone(),
            engine.entitlements.clone(),
            engine.config.clone(),
        );
        let queues = QueueConfigurator::new(engine.store.clone(), engine.broker.clone());
        let payloads = PayloadPacketHandler::new(
            engine.object_store.clone(),
            engine.config.payload_offload_threshold,
            engine.config.payload_hard_limit,
        );
        let enqueuer = BrokerEnqueuer::new(engine.broker.clone(), engine.store.clone());
        let callbacks = RunCallbacks::new(
            engine.store.clone(),
            engine.broker.clone(),
            engine.scheduler.clone(),
            engine.events.clone(),
        );
        Self {
            engine,
            ledger,
            resolver,
            guard,
            queues,
            payloads,
            enqueuer,
            callbacks,
        }
    }

    /// The callback handlers this service schedules work for.
    pub fn callbacks(&self) -> &RunCallbacks {
        &self.callbacks
    }

    /// Trigger one run of a task.
    ///
    /// Idempotent under concurrent retries: an idempotency-key constraint
    /// race restarts the whole operation (bounded), which then finds the
    /// committed run and replays it.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResult, TriggerError> {
        let attempts = self.engine.config.idempotency_retry_limit.max(1);

        for attempt in 1..=attempts {
            match self.trigger_once(&request).await? {
                Outcome::Done(result) => return Ok(result),
                Outcome::RetryIdempotency => {
                    warn!(
                        task = %request.task_identifier,
                        attempt,
                        "Idempotency key race, retrying trigger from the top"
                    );
                }
            }
        }

        Err(TriggerError::IdempotencyKeyRetriesExhausted { attempts })
    }

    async fn trigger_once(&self, request: &TriggerRequest) -> Result<Outcome, TriggerError> {
        let options = &request.options;
        let environment = &request.environment;

        // Cheap validation first: nothing below may have happened yet.
        if options.tags.len() > self.engine.config.max_tags_per_run {
            return Err(TriggerError::TooManyTags {
                count: options.tags.len(),
                maximum: self.engine.config.max_tags_per_run,
            });
        }
        if let Some(ttl) = &options.ttl {
            parse_ttl(ttl)?;
        }

        // Idempotency ledger: replay without side effects on a fresh hit.
        if let LedgerOutcome::Cached(run) = self
            .ledger
            .check(
                &environment.id,
                &request.task_identifier,
                options.idempotency_key.as_deref(),
            )
            .await?
        {
            return Ok(Outcome::Done(TriggerResult {
                run,
                is_cached: true,
            }));
        }

        // Admission limits, before any persistence write.
        self.guard
            .guard(environment, 1, request.system.skip_checks)
            .await?;

        let resolved = self.resolver.resolve(&options.dependencies).await?;

        let locked_to_version_id = self.resolve_version_lock(request).await?;

        let friendly_id = request
            .system
            .friendly_id
            .clone()
            .unwrap_or_else(generate_friendly_run_id);

        let payload = self
            .payloads
            .packetize(&request.payload, &request.payload_type, &friendly_id)
            .await?;

        let queue = resolve_queue(
            options.queue.name.as_deref(),
            request.task_default_queue.as_deref(),
            &request.task_identifier,
        );
        self.queues
            .configure(environment, &queue, options.queue.concurrency_limit)
            .await?;

        let now = Utc::now();
        let status = if options.delay_until.is_some() {
            RunStatus::Delayed
        } else {
            RunStatus::Pending
        };
        let queue_timestamp = request
            .system
            .queue_timestamp
            .or(resolved.inherited_queue_timestamp)
            .or(options.delay_until)
            .unwrap_or(now);

        let idempotency_key_expires_at = match &options.idempotency_key {
            Some(_) => Some(now + self.idempotency_key_ttl(options)?),
            None => None,
        };

        let run = match self
            .engine
            .store
            .create_run(self.build_new_run(
                request,
                &resolved,
                friendly_id,
                payload,
                queue.name.clone(),
                status,
                (status == RunStatus::Pending).then_some(now),
                queue_timestamp,
                idempotency_key_expires_at,
                locked_to_version_id,
            ))
            .await
        {
            Ok(run) => run,
            Err(CreationError::DuplicateIdempotencyKey) => return Ok(Outcome::RetryIdempotency),
            Err(CreationError::DuplicateOneTimeToken) => {
                return Err(TriggerError::OneTimeTokenAlreadyUsed)
            }
            Err(CreationError::DuplicateQueueName(name)) => {
                return Err(TriggerError::QueueNameRace { name })
            }
            Err(CreationError::Other(message)) => return Err(TriggerError::Internal(message)),
        };

        info!(
            run_id = %run.id,
            friendly_id = %run.friendly_id,
            task = %run.task_identifier,
            queue = %run.queue_name,
            status = %run.status,
            depth = run.depth,
            "Run triggered"
        );

        // Outside the creation transaction: scheduling and broker handoff.
        if run.status == RunStatus::Delayed {
            self.callbacks
                .schedule_delayed_enqueue(&run)
                .await
                .map_err(|e| TriggerError::Internal(e.to_string()))?;
            return Ok(Outcome::Done(TriggerResult {
                run,
                is_cached: false,
            }));
        }

        if run.ttl.is_some() {
            self.callbacks
                .schedule_expiry(&run)
                .await
                .map_err(|e| TriggerError::Internal(e.to_string()))?;
        }

        match self.enqueuer.enqueue_run(&run).await {
            Ok(()) => Ok(Outcome::Done(TriggerResult {
                run,
                is_cached: false,
            })),
            Err(EnqueueFailure::Deadlock { queue }) => {
                self.enqueuer.persist_deadlock(&run, &queue).await;
                Err(TriggerError::RecursiveWaitDeadlock { queue })
            }
            Err(EnqueueFailure::Transport(message)) => {
                // The run exists and must reach a terminal state.
                if let Err(e) = self
                    .engine
                    .store
                    .mark_system_failure(&run.id, &message)
                    .await
                {
                    warn!(run_id = %run.id, error = %e, "Failed to record enqueue failure");
                }
                Err(TriggerError::Internal(message))
            }
        }
    }

    fn idempotency_key_ttl(&self, options: &RunOptions) -> Result<chrono::Duration, TriggerError> {
        match &options.idempotency_key_ttl {
            Some(ttl) => Ok(parse_ttl(ttl)?),
            None => Ok(self.engine.config.default_idempotency_key_ttl),
        }
    }

    async fn resolve_version_lock(
        &self,
        request: &TriggerRequest,
    ) -> Result<Option<WorkerVersionId>, TriggerError> {
        let Some(version) = &request.options.locked_to_version else {
            return Ok(None);
        };
        self.engine
            .store
            .resolve_version(&request.environment.id, version)
            .await
            .map_err(|e| TriggerError::Internal(e.to_string()))?
            .map(Some)
            .ok_or_else(|| TriggerError::ReferenceNotFound {
                reference: version.clone(),
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_new_run(
        &self,
        request: &TriggerRequest,
        resolved: &ResolvedDependencies,
        friendly_id: String,
        payload: rungate_core::IoPacket,
        queue_name: String,
        status: RunStatus,
        queued_at: Option<DateTime<Utc>>,
        queue_timestamp: DateTime<Utc>,
        idempotency_key_expires_at: Option<DateTime<Utc>>,
        locked_to_version_id: Option<WorkerVersionId>,
    ) -> NewRun {
        let options = &request.options;
        NewRun {
            friendly_id,
            task_identifier: request.task_identifier.clone(),
            queue_name,
            environment: request.environment.clone(),
            status,
            queued_at,
            queue_timestamp,
            delay_until: options.delay_until,
            ttl: options.ttl.clone(),
            idempotency_key: options.idempotency_key.clone(),
            idempotency_key_expires_at,
            parent_task_run_id: resolved.parent_task_run_id.clone(),
            parent_attempt_id: resolved.parent_attempt_id.clone(),
            root_task_run_id: resolved.root_task_run_id.clone(),
            depth: resolved.depth,
            batch_id: resolved.batch_id.clone(),
            resume_parent_on_completion: resolved.resume_parent_on_completion,
            payload,
            concurrency_key: options.concurrency_key.clone(),
            one_time_use_token: options.one_time_use_token.clone(),
            machine_preset: options
                .machine_preset
                .as_deref()
                .map(MachinePreset::new)
                .unwrap_or_else(|| self.engine.config.default_machine_preset.clone()),
            locked_to_version_id,
            tags: options.tags.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, RunBroker};
    use crate::config::EngineConfig;
    use crate::entitlement::StaticEntitlementClient;
    use crate::events::{EventOutcome, RecordingEventSink};
    use crate::jobs::{InMemoryJobScheduler, JobId};
    use crate::object_store::InMemoryObjectStore;
    use crate::service::enqueuer::RECURSIVE_WAIT_DEADLOCK_CODE;
    use crate::store::{AttemptRecord, InMemoryRunStore};
    use rungate_core::{AttemptId, EnvironmentId, EnvironmentType, IoPacket, LimitUpdate, RunId};

    struct Fixture {
        store: Arc<InMemoryRunStore>,
        broker: Arc<InMemoryBroker>,
        scheduler: Arc<InMemoryJobScheduler>,
        objects: Arc<InMemoryObjectStore>,
        events: Arc<RecordingEventSink>,
        service: TriggerService,
        environment: RuntimeEnvironment,
    }

    fn fixture_with(config: EngineConfig, entitled: bool) -> Fixture {
        let store = Arc::new(InMemoryRunStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let scheduler = Arc::new(InMemoryJobScheduler::new());
        let objects = Arc::new(InMemoryObjectStore::new());
        let events = Arc::new(RecordingEventSink::new());
        let entitlements = if entitled {
            StaticEntitlementClient::allowing()
        } else {
            StaticEntitlementClient::denying()
        };
        let engine = Engine::new(
            store.clone(),
            broker.clone(),
            scheduler.clone(),
            objects.clone(),
            Arc::new(entitlements),
            events.clone(),
            config,
        );
        Fixture {
            store,
            broker,
            scheduler,
            objects,
            events,
            service: TriggerService::new(engine),
            environment: RuntimeEnvironment::new(
                EnvironmentId::generate(),
                EnvironmentType::Production,
            ),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(EngineConfig::default(), true)
    }

    fn request(fixture: &Fixture, task: &str) -> TriggerRequest {
        TriggerRequest::new(task, fixture.environment.clone(), "{\"input\":1}")
    }

    async fn total_runs(fixture: &Fixture) -> u64 {
        fixture
            .store
            .count_runs_by_status()
            .await
            .unwrap()
            .values()
            .sum()
    }

    async fn seed_attempt_for(fixture: &Fixture, run: &TaskRun, status: RunStatus) -> String {
        let friendly = format!("attempt_{}", &run.friendly_id[4..]);
        fixture
            .store
            .seed_attempt(AttemptRecord {
                id: AttemptId::generate(),
                friendly_id: friendly.clone(),
                task_run_id: run.id.clone(),
                status,
            })
            .await;
        friendly
    }

    #[tokio::test]
    async fn test_trigger_creates_pending_run_and_enqueues() {
        let fixture = fixture();
        let result = fixture.service.trigger(request(&fixture, "my-task")).await.unwrap();

        assert!(!result.is_cached);
        let run = &result.run;
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.run_number, 1);
        assert_eq!(run.depth, 0);
        assert_eq!(run.queue_name, "task/my-task");
        assert!(run.queued_at.is_some());
        assert_eq!(run.root_task_run_id, Some(run.id.clone()));
        assert!(fixture.broker.is_enqueued(&run.id).await);

        // The task queue was created lazily.
        let queue = fixture
            .store
            .find_queue(&fixture.environment.id, "task/my-task")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.concurrency_limit, None);
    }

    #[tokio::test]
    async fn test_idempotent_trigger_replays_cached_run() {
        let fixture = fixture();
        let mut req = request(&fixture, "my-task");
        req.options.idempotency_key = Some("order-42".into());

        let first = fixture.service.trigger(req.clone()).await.unwrap();
        let second = fixture.service.trigger(req).await.unwrap();

        assert!(!first.is_cached);
        assert!(second.is_cached);
        assert_eq!(first.run.id, second.run.id);
        // Exactly one run row and one broker enqueue.
        assert_eq!(total_runs(&fixture).await, 1);
        assert_eq!(
            fixture.broker.queue_depth(&fixture.environment.id).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_expired_idempotency_key_creates_new_run() {
        let fixture = fixture();
        let mut req = request(&fixture, "my-task");
        req.options.idempotency_key = Some("order-42".into());

        let first = fixture.service.trigger(req.clone()).await.unwrap();
        fixture
            .store
            .set_idempotency_key_expiry(&first.run.id, Utc::now() - chrono::Duration::seconds(5))
            .await;

        let second = fixture.service.trigger(req).await.unwrap();
        assert!(!second.is_cached);
        assert_ne!(first.run.id, second.run.id);
        assert_eq!(total_runs(&fixture).await, 2);

        // The stale key was cleared off the old record.
        let old = fixture.store.get_run(&first.run.id).await.unwrap().unwrap();
        assert_eq!(old.idempotency_key, None);
    }

    #[tokio::test]
    async fn test_depth_and_root_inherited_through_chain() {
        let fixture = fixture();
        let parent = fixture
            .service
            .trigger(request(&fixture, "parent-task"))
            .await
            .unwrap()
            .run;
        let parent_attempt = seed_attempt_for(&fixture, &parent, RunStatus::Executing).await;

        let mut child_req = request(&fixture, "child-task");
        child_req.options.dependencies.dependent_attempt = Some(parent_attempt);
        let child = fixture.service.trigger(child_req).await.unwrap().run;

        assert_eq!(child.depth, parent.depth + 1);
        assert_eq!(child.parent_task_run_id, Some(parent.id.clone()));
        assert_eq!(child.root_task_run_id, Some(parent.id.clone()));
        assert!(child.resume_parent_on_completion);
        // The child rides the dependent ancestor's fairness timestamp.
        assert_eq!(child.queue_timestamp, parent.queue_timestamp);

        let child_attempt = seed_attempt_for(&fixture, &child, RunStatus::Executing).await;
        let mut grandchild_req = request(&fixture, "grandchild-task");
        grandchild_req.options.dependencies.dependent_attempt = Some(child_attempt);
        let grandchild = fixture.service.trigger(grandchild_req).await.unwrap().run;

        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.root_task_run_id, Some(parent.id.clone()));
    }

    #[tokio::test]
    async fn test_terminal_dependency_blocks_trigger() {
        let fixture = fixture();
        let parent = fixture
            .service
            .trigger(request(&fixture, "parent-task"))
            .await
            .unwrap()
            .run;
        fixture.store.update_status(&parent.id, RunStatus::Failed).await;
        let attempt = seed_attempt_for(&fixture, &parent, RunStatus::Failed).await;

        let mut child_req = request(&fixture, "child-task");
        child_req.options.dependencies.dependent_attempt = Some(attempt);
        let err = fixture.service.trigger(child_req).await.unwrap_err();

        assert!(matches!(
            err,
            TriggerError::DependencyInTerminalState { .. }
        ));
        // The parent's run is the only persisted row.
        assert_eq!(total_runs(&fixture).await, 1);
    }

    #[tokio::test]
    async fn test_queue_size_limit_rejects_before_any_write() {
        let config = EngineConfig {
            deployed_queue_size_limit: 2,
            ..EngineConfig::default()
        };
        let fixture = fixture_with(config, true);

        fixture.service.trigger(request(&fixture, "my-task")).await.unwrap();
        fixture.service.trigger(request(&fixture, "my-task")).await.unwrap();

        let err = fixture
            .service
            .trigger(request(&fixture, "my-task"))
            .await
            .unwrap_err();
        match &err {
            TriggerError::QueueSizeLimitReached { maximum, .. } => assert_eq!(*maximum, 2),
            other => panic!("expected queue-size error, got {other}"),
        }
        assert!(err.is_validation());
        assert!(err.to_string().contains('2'));
        assert_eq!(total_runs(&fixture).await, 2);

        // System-triggered runs bypass the ceiling.
        let mut bypass = request(&fixture, "my-task");
        bypass.system.skip_checks = true;
        fixture.service.trigger(bypass).await.unwrap();
        assert_eq!(total_runs(&fixture).await, 3);
    }

    #[tokio::test]
    async fn test_out_of_entitlement_outside_development() {
        let fixture = fixture_with(EngineConfig::default(), false);
        let err = fixture
            .service
            .trigger(request(&fixture, "my-task"))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::OutOfEntitlement));
        assert_eq!(total_runs(&fixture).await, 0);
    }

    #[tokio::test]
    async fn test_delayed_run_is_not_enqueued_until_callback_fires() {
        let fixture = fixture();
        let mut req = request(&fixture, "my-task");
        let delay_until = Utc::now() + chrono::Duration::minutes(10);
        req.options.delay_until = Some(delay_until);

        let run = fixture.service.trigger(req).await.unwrap().run;
        assert_eq!(run.status, RunStatus::Delayed);
        assert!(run.queued_at.is_none());
        assert_eq!(run.queue_timestamp, delay_until);
        assert_eq!(
            fixture.broker.queue_depth(&fixture.environment.id).await.unwrap(),
            0
        );
        assert!(fixture.scheduler.contains(&JobId::delayed_run(&run.id)).await);

        // Redelivered callback: exactly one transition, one enqueue.
        fixture.service.callbacks().enqueue_delayed_run(&run.id).await.unwrap();
        fixture.service.callbacks().enqueue_delayed_run(&run.id).await.unwrap();

        let current = fixture.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(current.status, RunStatus::Pending);
        assert!(current.queued_at.is_some());
        assert_eq!(
            fixture.broker.queue_depth(&fixture.environment.id).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_ttl_expires_pending_run() {
        let fixture = fixture();
        let mut req = request(&fixture, "my-task");
        req.options.ttl = Some("10m".into());

        let run = fixture.service.trigger(req).await.unwrap().run;
        assert_eq!(run.ttl.as_deref(), Some("10m"));
        assert!(fixture.scheduler.contains(&JobId::expire_run(&run.id)).await);

        fixture.service.callbacks().expire_run(&run.id).await.unwrap();

        let current = fixture.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(current.status, RunStatus::Expired);
        assert!(current.completed_at.is_some());
        // The broker message was acknowledged away.
        assert_eq!(
            fixture.broker.queue_depth(&fixture.environment.id).await.unwrap(),
            0
        );
        let events = fixture.events.recorded().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].1, EventOutcome::Error(_)));
    }

    #[tokio::test]
    async fn test_ttl_is_noop_once_execution_started() {
        let fixture = fixture();
        let mut req = request(&fixture, "my-task");
        req.options.ttl = Some("10m".into());
        let run = fixture.service.trigger(req).await.unwrap().run;

        fixture.store.update_status(&run.id, RunStatus::Executing).await;
        fixture.service.callbacks().expire_run(&run.id).await.unwrap();

        let current = fixture.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(current.status, RunStatus::Executing);
        assert!(fixture.events.recorded().await.is_empty());
    }

    #[tokio::test]
    async fn test_one_time_token_single_use() {
        let fixture = fixture();
        let mut req = request(&fixture, "my-task");
        req.options.one_time_use_token = Some("tok-1".into());

        fixture.service.trigger(req.clone()).await.unwrap();
        let err = fixture.service.trigger(req).await.unwrap_err();

        assert!(matches!(err, TriggerError::OneTimeTokenAlreadyUsed));
        assert!(err.to_string().contains("already been used"));
        assert_eq!(total_runs(&fixture).await, 1);
    }

    #[tokio::test]
    async fn test_recursive_deadlock_marks_system_failure() {
        let fixture = fixture();

        let mut parent_req = request(&fixture, "looping-task");
        parent_req.options.queue.name = Some("loop-queue".into());
        parent_req.options.queue.concurrency_limit = Some(LimitUpdate::Set(1));
        let parent = fixture.service.trigger(parent_req).await.unwrap().run;

        // The parent starts executing and holds the queue's only slot.
        fixture
            .broker
            .begin_execution(&fixture.environment.id, "loop-queue", &parent.id)
            .await;
        fixture.store.update_status(&parent.id, RunStatus::Executing).await;
        let attempt = seed_attempt_for(&fixture, &parent, RunStatus::Executing).await;

        let mut child_req = request(&fixture, "looping-task");
        child_req.options.queue.name = Some("loop-queue".into());
        child_req.options.dependencies.dependent_attempt = Some(attempt);
        child_req.system.friendly_id = Some("run_deadlockedchild0000".into());

        let err = fixture.service.trigger(child_req).await.unwrap_err();
        assert!(matches!(err, TriggerError::RecursiveWaitDeadlock { .. }));

        // The child is persisted terminally, never left pending.
        let child = fixture
            .store
            .find_run_by_friendly_id("run_deadlockedchild0000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(child.status, RunStatus::SystemFailure);
        assert!(child
            .error
            .as_deref()
            .unwrap_or_default()
            .contains(RECURSIVE_WAIT_DEADLOCK_CODE));
    }

    #[tokio::test]
    async fn test_large_payload_offloaded() {
        let config = EngineConfig {
            payload_offload_threshold: 64,
            ..EngineConfig::default()
        };
        let fixture = fixture_with(config, true);

        let mut req = request(&fixture, "my-task");
        req.payload = format!("{{\"blob\":\"{}\"}}", "x".repeat(200));
        let run = fixture.service.trigger(req).await.unwrap().run;

        match &run.payload {
            IoPacket::StoredPointer { key } => {
                assert_eq!(key, &format!("runs/{}/payload.json", run.friendly_id));
                assert!(fixture.objects.get(key).await.is_some());
            }
            other => panic!("expected stored pointer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_explicit_queue_timestamp_wins() {
        let fixture = fixture();
        let pinned = Utc::now() - chrono::Duration::hours(1);
        let mut req = request(&fixture, "my-task");
        req.system.queue_timestamp = Some(pinned);

        let run = fixture.service.trigger(req).await.unwrap().run;
        assert_eq!(run.queue_timestamp, pinned);
    }

    #[tokio::test]
    async fn test_version_lock_resolution() {
        let fixture = fixture();
        let version_id = rungate_core::WorkerVersionId::generate();
        fixture
            .store
            .seed_version(fixture.environment.id.clone(), "20260807.1", version_id.clone())
            .await;

        let mut req = request(&fixture, "my-task");
        req.options.locked_to_version = Some("20260807.1".into());
        let run = fixture.service.trigger(req).await.unwrap().run;
        assert_eq!(run.locked_to_version_id, Some(version_id));

        let mut missing = request(&fixture, "my-task");
        missing.options.locked_to_version = Some("20990101.1".into());
        assert!(matches!(
            fixture.service.trigger(missing).await,
            Err(TriggerError::ReferenceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_too_many_tags_rejected() {
        let config = EngineConfig {
            max_tags_per_run: 2,
            ..EngineConfig::default()
        };
        let fixture = fixture_with(config, true);

        let mut req = request(&fixture, "my-task");
        req.options.tags = vec!["a".into(), "b".into(), "c".into()];
        let err = fixture.service.trigger(req).await.unwrap_err();

        assert!(matches!(err, TriggerError::TooManyTags { .. }));
        assert_eq!(total_runs(&fixture).await, 0);
    }

    #[tokio::test]
    async fn test_invalid_ttl_rejected_before_any_write() {
        let fixture = fixture();
        let mut req = request(&fixture, "my-task");
        req.options.ttl = Some("whenever".into());

        let err = fixture.service.trigger(req).await.unwrap_err();
        assert!(matches!(err, TriggerError::InvalidTtl(_)));
        assert_eq!(total_runs(&fixture).await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_allocate_distinct_run_numbers() {
        let fixture = fixture();
        let service = Arc::new(fixture.service);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let req = TriggerRequest::new(
                "my-task",
                fixture.environment.clone(),
                "{\"input\":1}",
            );
            handles.push(tokio::spawn(async move { service.trigger(req).await }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap().unwrap().run.run_number);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_concurrent_triggers_with_same_key_settle_on_one_run() {
        let fixture = fixture();
        let service = Arc::new(fixture.service);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let mut req = TriggerRequest::new(
                "my-task",
                fixture.environment.clone(),
                "{\"input\":1}",
            );
            req.options.idempotency_key = Some("order-42".into());
            handles.push(tokio::spawn(async move { service.trigger(req).await }));
        }

        let mut run_ids: Vec<RunId> = Vec::new();
        for handle in handles {
            run_ids.push(handle.await.unwrap().unwrap().run.id);
        }
        run_ids.dedup();
        assert_eq!(run_ids.len(), 1);
    }
}
