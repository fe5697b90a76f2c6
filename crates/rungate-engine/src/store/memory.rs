//! In-memory store implementation.
//!
//! Every trait method takes the single table lock for its whole duration,
//! which is the in-memory rendering of "one serializable transaction":
//! run-number allocation, uniqueness checks, and the insert commit together
//! or not at all.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use rungate_core::{
    EnvironmentId, LimitUpdate, RunId, RunStatus, TaskIdentifier, TaskQueue, TaskRun,
    WorkerVersionId,
};

use super::{
    AttemptRecord, BatchRecord, CreationError, NewRun, QueueSpec, RunStore, StoreError,
};

#[derive(Default)]
struct Tables {
    runs: HashMap<RunId, TaskRun>,
    /// (environment, task, key) -> run. Mirrors the storage unique index.
    idempotency: HashMap<(EnvironmentId, TaskIdentifier, String), RunId>,
    /// one-time-use token -> run. Tokens are globally unique.
    tokens: HashMap<String, RunId>,
    queues: HashMap<(EnvironmentId, String), TaskQueue>,
    counters: HashMap<(EnvironmentId, TaskIdentifier), u64>,
    attempts: HashMap<String, AttemptRecord>,
    batches: HashMap<String, BatchRecord>,
    versions: HashMap<(EnvironmentId, String), WorkerVersionId>,
}

/// In-memory [`RunStore`].
///
/// Backs tests and the development daemon.
#[derive(Default)]
pub struct InMemoryRunStore {
    tables: Mutex<Tables>,
}

impl InMemoryRunStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attempt record (normally owned by the execution
    /// subsystem).
    pub async fn seed_attempt(&self, attempt: AttemptRecord) {
        let mut tables = self.tables.lock().await;
        tables.attempts.insert(attempt.friendly_id.clone(), attempt);
    }

    /// Register a batch record.
    pub async fn seed_batch(&self, batch: BatchRecord) {
        let mut tables = self.tables.lock().await;
        tables.batches.insert(batch.friendly_id.clone(), batch);
    }

    /// Register a deployed worker version.
    pub async fn seed_version(
        &self,
        environment_id: EnvironmentId,
        version: impl Into<String>,
        id: WorkerVersionId,
    ) {
        let mut tables = self.tables.lock().await;
        tables.versions.insert((environment_id, version.into()), id);
    }

    /// Overwrite a run's idempotency horizon.
    pub async fn set_idempotency_key_expiry(
        &self,
        run_id: &RunId,
        expires_at: chrono::DateTime<Utc>,
    ) -> bool {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(run_id) {
            Some(run) => {
                run.idempotency_key_expires_at = Some(expires_at);
                true
            }
            None => false,
        }
    }

    /// Overwrite a run's status. Stands in for the execution subsystem,
    /// which owns every transition the orchestrator does not make.
    pub async fn update_status(&self, run_id: &RunId, status: RunStatus) -> bool {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(run_id) {
            Some(run) => {
                run.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn find_run_by_idempotency_key(
        &self,
        environment_id: &EnvironmentId,
        task_identifier: &TaskIdentifier,
        idempotency_key: &str,
    ) -> Result<Option<TaskRun>, StoreError> {
        let tables = self.tables.lock().await;
        let key = (
            environment_id.clone(),
            task_identifier.clone(),
            idempotency_key.to_owned(),
        );
        Ok(tables
            .idempotency
            .get(&key)
            .and_then(|run_id| tables.runs.get(run_id))
            .cloned())
    }

    async fn clear_idempotency_key(&self, run_id: &RunId) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let index_key = tables.runs.get(run_id).and_then(|run| {
            run.idempotency_key.as_ref().map(|key| {
                (
                    run.environment_id.clone(),
                    run.task_identifier.clone(),
                    key.clone(),
                )
            })
        });

        if let Some(index_key) = index_key {
            tables.idempotency.remove(&index_key);
        }
        if let Some(run) = tables.runs.get_mut(run_id) {
            run.idempotency_key = None;
            run.idempotency_key_expires_at = None;
        }
        Ok(())
    }

    async fn create_run(&self, new_run: NewRun) -> Result<TaskRun, CreationError> {
        let mut tables = self.tables.lock().await;

        let environment = &new_run.environment;
        let idempotency_index_key = new_run.idempotency_key.as_ref().map(|key| {
            (
                environment.id.clone(),
                new_run.task_identifier.clone(),
                key.clone(),
            )
        });

        if let Some(index_key) = &idempotency_index_key {
            if tables.idempotency.contains_key(index_key) {
                return Err(CreationError::DuplicateIdempotencyKey);
            }
        }
        if let Some(token) = &new_run.one_time_use_token {
            if tables.tokens.contains_key(token) {
                return Err(CreationError::DuplicateOneTimeToken);
            }
        }

        let counter_key = (environment.id.clone(), new_run.task_identifier.clone());
        let run_number = {
            let counter = tables.counters.entry(counter_key).or_insert(0);
            *counter += 1;
            *counter
        };

        let id = RunId::generate();
        let run = TaskRun {
            id: id.clone(),
            friendly_id: new_run.friendly_id,
            run_number,
            task_identifier: new_run.task_identifier,
            queue_name: new_run.queue_name,
            environment_id: environment.id.clone(),
            environment_type: environment.environment_type,
            organization_id: environment.organization_id.clone(),
            project_id: environment.project_id.clone(),
            status: new_run.status,
            created_at: Utc::now(),
            queued_at: new_run.queued_at,
            queue_timestamp: new_run.queue_timestamp,
            delay_until: new_run.delay_until,
            ttl: new_run.ttl,
            expired_at: None,
            completed_at: None,
            idempotency_key: new_run.idempotency_key,
            idempotency_key_expires_at: new_run.idempotency_key_expires_at,
            parent_task_run_id: new_run.parent_task_run_id,
            parent_attempt_id: new_run.parent_attempt_id,
            // A run with no ancestor is its own root.
            root_task_run_id: Some(new_run.root_task_run_id.unwrap_or_else(|| id.clone())),
            depth: new_run.depth,
            batch_id: new_run.batch_id,
            resume_parent_on_completion: new_run.resume_parent_on_completion,
            payload: new_run.payload,
            concurrency_key: new_run.concurrency_key,
            one_time_use_token: new_run.one_time_use_token,
            machine_preset: new_run.machine_preset,
            locked_to_version_id: new_run.locked_to_version_id,
            tags: new_run.tags,
            error: None,
        };

        if let Some(index_key) = idempotency_index_key {
            tables.idempotency.insert(index_key, id.clone());
        }
        if let Some(token) = run.one_time_use_token.clone() {
            tables.tokens.insert(token, id.clone());
        }
        tables.runs.insert(id, run.clone());

        debug!(
            run_id = %run.id,
            run_number = run.run_number,
            task = %run.task_identifier,
            "Run row created"
        );

        Ok(run)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<TaskRun>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.runs.get(run_id).cloned())
    }

    async fn find_run_by_friendly_id(
        &self,
        friendly_id: &str,
    ) -> Result<Option<TaskRun>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .runs
            .values()
            .find(|run| run.friendly_id == friendly_id)
            .cloned())
    }

    async fn find_attempt(&self, friendly_id: &str) -> Result<Option<AttemptRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.attempts.get(friendly_id).cloned())
    }

    async fn find_attempt_by_id(
        &self,
        attempt_id: &rungate_core::AttemptId,
    ) -> Result<Option<AttemptRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .attempts
            .values()
            .find(|a| &a.id == attempt_id)
            .cloned())
    }

    async fn find_batch(&self, friendly_id: &str) -> Result<Option<BatchRecord>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.batches.get(friendly_id).cloned())
    }

    async fn resolve_version(
        &self,
        environment_id: &EnvironmentId,
        version: &str,
    ) -> Result<Option<WorkerVersionId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .versions
            .get(&(environment_id.clone(), version.to_owned()))
            .cloned())
    }

    async fn transition_delayed_to_pending(
        &self,
        run_id: &RunId,
        queued_at: DateTime<Utc>,
    ) -> Result<Option<TaskRun>, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(run_id) {
            Some(run) if run.status == RunStatus::Delayed => {
                run.status = RunStatus::Pending;
                run.queued_at = Some(queued_at);
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn transition_pending_to_expired(
        &self,
        run_id: &RunId,
        expired_at: DateTime<Utc>,
    ) -> Result<Option<TaskRun>, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(run_id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Expired;
                run.expired_at = Some(expired_at);
                run.completed_at = Some(expired_at);
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_system_failure(
        &self,
        run_id: &RunId,
        error: &str,
    ) -> Result<Option<TaskRun>, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(run_id) {
            Some(run) if !run.status.is_terminal() => {
                run.status = RunStatus::SystemFailure;
                run.completed_at = Some(Utc::now());
                run.error = Some(error.to_owned());
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn upsert_queue(&self, spec: QueueSpec) -> Result<TaskQueue, CreationError> {
        let mut tables = self.tables.lock().await;
        let key = (spec.environment_id.clone(), spec.name.clone());

        let queue = tables.queues.entry(key).or_insert_with(|| TaskQueue {
            name: spec.name.clone(),
            environment_id: spec.environment_id.clone(),
            concurrency_limit: None,
            queue_type: spec.queue_type,
        });

        if let Some(update) = spec.limit {
            queue.concurrency_limit = match update {
                LimitUpdate::Clear => None,
                LimitUpdate::Set(limit) => Some(limit),
            };
        }

        Ok(queue.clone())
    }

    async fn find_queue(
        &self,
        environment_id: &EnvironmentId,
        name: &str,
    ) -> Result<Option<TaskQueue>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .queues
            .get(&(environment_id.clone(), name.to_owned()))
            .cloned())
    }

    async fn current_run_number(
        &self,
        environment_id: &EnvironmentId,
        task_identifier: &TaskIdentifier,
    ) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .counters
            .get(&(environment_id.clone(), task_identifier.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn count_runs_by_status(&self) -> Result<HashMap<RunStatus, u64>, StoreError> {
        let tables = self.tables.lock().await;
        let mut counts = HashMap::new();
        for run in tables.runs.values() {
            *counts.entry(run.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rungate_core::{EnvironmentType, IoPacket, MachinePreset, RuntimeEnvironment};

    fn new_run(environment: &RuntimeEnvironment, task: &str) -> NewRun {
        NewRun {
            friendly_id: rungate_core::generate_friendly_run_id(),
            task_identifier: TaskIdentifier::new(task),
            queue_name: format!("task/{task}"),
            environment: environment.clone(),
            status: RunStatus::Pending,
            queued_at: Some(Utc::now()),
            queue_timestamp: Utc::now(),
            delay_until: None,
            ttl: None,
            idempotency_key: None,
            idempotency_key_expires_at: None,
            parent_task_run_id: None,
            parent_attempt_id: None,
            root_task_run_id: None,
            depth: 0,
            batch_id: None,
            resume_parent_on_completion: false,
            payload: IoPacket::Json {
                data: "{}".into(),
            },
            concurrency_key: None,
            one_time_use_token: None,
            machine_preset: MachinePreset::default(),
            locked_to_version_id: None,
            tags: Vec::new(),
        }
    }

    fn env() -> RuntimeEnvironment {
        RuntimeEnvironment::new(EnvironmentId::generate(), EnvironmentType::Production)
    }

    #[tokio::test]
    async fn test_run_numbers_are_gap_free_per_task() {
        let store = InMemoryRunStore::new();
        let environment = env();

        for expected in 1..=3u64 {
            let run = store.create_run(new_run(&environment, "task-a")).await.unwrap();
            assert_eq!(run.run_number, expected);
        }
        // Separate task gets its own counter.
        let other = store.create_run(new_run(&environment, "task-b")).await.unwrap();
        assert_eq!(other.run_number, 1);

        assert_eq!(
            store
                .current_run_number(&environment.id, &TaskIdentifier::new("task-a"))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_root_defaults_to_own_id() {
        let store = InMemoryRunStore::new();
        let run = store.create_run(new_run(&env(), "task-a")).await.unwrap();
        assert_eq!(run.root_task_run_id, Some(run.id.clone()));
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_rejected() {
        let store = InMemoryRunStore::new();
        let environment = env();

        let mut first = new_run(&environment, "task-a");
        first.idempotency_key = Some("key-1".into());
        store.create_run(first.clone()).await.unwrap();

        let mut second = new_run(&environment, "task-a");
        second.idempotency_key = Some("key-1".into());
        assert!(matches!(
            store.create_run(second).await,
            Err(CreationError::DuplicateIdempotencyKey)
        ));

        // Same key on a different task is a different tuple.
        let mut other_task = new_run(&environment, "task-b");
        other_task.idempotency_key = Some("key-1".into());
        store.create_run(other_task).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_one_time_token_rejected() {
        let store = InMemoryRunStore::new();
        let environment = env();

        let mut first = new_run(&environment, "task-a");
        first.one_time_use_token = Some("tok-1".into());
        store.create_run(first).await.unwrap();

        let mut second = new_run(&environment, "task-a");
        second.one_time_use_token = Some("tok-1".into());
        assert!(matches!(
            store.create_run(second).await,
            Err(CreationError::DuplicateOneTimeToken)
        ));
    }

    #[tokio::test]
    async fn test_clear_idempotency_key_frees_the_tuple() {
        let store = InMemoryRunStore::new();
        let environment = env();

        let mut first = new_run(&environment, "task-a");
        first.idempotency_key = Some("key-1".into());
        let created = store.create_run(first).await.unwrap();

        store.clear_idempotency_key(&created.id).await.unwrap();
        let cleared = store.get_run(&created.id).await.unwrap().unwrap();
        assert_eq!(cleared.idempotency_key, None);

        let mut again = new_run(&environment, "task-a");
        again.idempotency_key = Some("key-1".into());
        store.create_run(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_gated_transitions() {
        let store = InMemoryRunStore::new();
        let environment = env();

        let mut delayed = new_run(&environment, "task-a");
        delayed.status = RunStatus::Delayed;
        delayed.queued_at = None;
        let run = store.create_run(delayed).await.unwrap();

        let now = Utc::now();
        let transitioned = store
            .transition_delayed_to_pending(&run.id, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(transitioned.status, RunStatus::Pending);
        assert_eq!(transitioned.queued_at, Some(now));

        // Second delivery: the gate fails, no-op.
        assert!(store
            .transition_delayed_to_pending(&run.id, now)
            .await
            .unwrap()
            .is_none());

        let expired = store
            .transition_pending_to_expired(&run.id, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.status, RunStatus::Expired);
        assert_eq!(expired.completed_at, Some(now));

        // Terminal runs cannot be failed over.
        assert!(store
            .mark_system_failure(&run.id, "boom")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_queue_upsert_is_idempotent() {
        let store = InMemoryRunStore::new();
        let environment = env();

        let spec = QueueSpec {
            environment_id: environment.id.clone(),
            name: "task/my-task".into(),
            queue_type: rungate_core::QueueType::Task,
            limit: None,
        };
        let queue = store.upsert_queue(spec.clone()).await.unwrap();
        assert_eq!(queue.concurrency_limit, None);

        let queue = store
            .upsert_queue(QueueSpec {
                limit: Some(LimitUpdate::Set(5)),
                ..spec.clone()
            })
            .await
            .unwrap();
        assert_eq!(queue.concurrency_limit, Some(5));

        // Upsert without a limit change leaves the record untouched.
        let queue = store.upsert_queue(spec.clone()).await.unwrap();
        assert_eq!(queue.concurrency_limit, Some(5));

        let queue = store
            .upsert_queue(QueueSpec {
                limit: Some(LimitUpdate::Clear),
                ..spec
            })
            .await
            .unwrap();
        assert_eq!(queue.concurrency_limit, None);
    }
}
