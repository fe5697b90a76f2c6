//! Dependency resolver: parent/batch references, recursion depth, root and
//! queue-timestamp inheritance.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use rungate_core::{AttemptId, BatchId, RunId, TaskRun, TriggerError};

use crate::store::{AttemptRecord, RunStore, StoreError};

/// Friendly-id references a trigger request may carry.
#[derive(Debug, Clone, Default)]
pub struct DependencyRefs {
    /// Attempt that triggered this run and waits for its result.
    pub dependent_attempt: Option<String>,

    /// Attempt that triggered this run without waiting.
    pub parent_attempt: Option<String>,

    /// Batch this run belongs to, where an attempt waits on the batch.
    pub dependent_batch: Option<String>,

    /// Batch this run belongs to, without a waiting attempt.
    pub parent_batch: Option<String>,
}

impl DependencyRefs {
    /// Whether any reference is present.
    pub fn is_empty(&self) -> bool {
        self.dependent_attempt.is_none()
            && self.parent_attempt.is_none()
            && self.dependent_batch.is_none()
            && self.parent_batch.is_none()
    }
}

/// The resolved dependency chain for a new run.
#[derive(Debug, Clone, Default)]
pub struct ResolvedDependencies {
    /// Parent run, when a parent or dependent attempt resolved.
    pub parent_task_run_id: Option<RunId>,

    /// The specific parent attempt.
    pub parent_attempt_id: Option<AttemptId>,

    /// Root of the chain, inherited transitively.
    pub root_task_run_id: Option<RunId>,

    /// `1 + parent depth`, or `0` with no parent.
    pub depth: u32,

    /// Batch linkage, if any.
    pub batch_id: Option<BatchId>,

    /// True iff a dependent attempt or dependent batch resolved.
    pub resume_parent_on_completion: bool,

    /// The dependent ancestor's fairness timestamp, when present.
    pub inherited_queue_timestamp: Option<DateTime<Utc>>,
}

/// Resolves dependency references before any persistence write.
pub struct DependencyResolver {
    store: Arc<dyn RunStore>,
}

impl DependencyResolver {
    /// Create a resolver over the given store.
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Resolve the supplied references into chain bookkeeping.
    ///
    /// Fails with a validation error when a dependent attempt (or its
    /// owning run) is in a terminal failure state: the child's result
    /// would be orphaned.
    pub async fn resolve(&self, refs: &DependencyRefs) -> Result<ResolvedDependencies, TriggerError> {
        let mut resolved = ResolvedDependencies::default();
        if refs.is_empty() {
            return Ok(resolved);
        }

        // The run the chain bookkeeping derives from, with the dependent's
        // queue timestamp when the parent is waiting on us.
        let mut parent_run: Option<TaskRun> = None;

        if let Some(reference) = &refs.dependent_attempt {
            let (attempt, run) = self.resolve_attempt(reference).await?;
            ensure_dependable(reference, &attempt, &run)?;
            resolved.parent_attempt_id = Some(attempt.id);
            resolved.resume_parent_on_completion = true;
            resolved.inherited_queue_timestamp = Some(run.queue_timestamp);
            parent_run = Some(run);
        } else if let Some(reference) = &refs.parent_attempt {
            let (attempt, run) = self.resolve_attempt(reference).await?;
            resolved.parent_attempt_id = Some(attempt.id);
            parent_run = Some(run);
        }

        if let Some(reference) = &refs.dependent_batch {
            let batch = self
                .store
                .find_batch(reference)
                .await
                .map_err(internal)?
                .ok_or_else(|| TriggerError::ReferenceNotFound {
                    reference: reference.clone(),
                })?;

            resolved.batch_id = Some(batch.id.clone());
            resolved.resume_parent_on_completion = true;

            // The batch's waiting attempt is the chain parent unless an
            // explicit dependent attempt already resolved one.
            if parent_run.is_none() {
                if let Some(attempt_id) = &batch.dependent_attempt_id {
                    let attempt = self
                        .store
                        .find_attempt_by_id(attempt_id)
                        .await
                        .map_err(internal)?
                        .ok_or_else(|| TriggerError::ReferenceNotFound {
                            reference: attempt_id.to_string(),
                        })?;
                    let run = self.owning_run(&attempt).await?;
                    ensure_dependable(reference, &attempt, &run)?;
                    resolved.parent_attempt_id = Some(attempt.id);
                    resolved.inherited_queue_timestamp = Some(run.queue_timestamp);
                    parent_run = Some(run);
                }
            }
        } else if let Some(reference) = &refs.parent_batch {
            let batch = self
                .store
                .find_batch(reference)
                .await
                .map_err(internal)?
                .ok_or_else(|| TriggerError::ReferenceNotFound {
                    reference: reference.clone(),
                })?;
            resolved.batch_id = Some(batch.id);
        }

        if let Some(parent) = parent_run {
            resolved.depth = parent.depth + 1;
            resolved.root_task_run_id = Some(
                parent
                    .root_task_run_id
                    .clone()
                    .unwrap_or_else(|| parent.id.clone()),
            );
            resolved.parent_task_run_id = Some(parent.id);
        }

        Ok(resolved)
    }

    async fn resolve_attempt(
        &self,
        reference: &str,
    ) -> Result<(AttemptRecord, TaskRun), TriggerError> {
        let attempt = self
            .store
            .find_attempt(reference)
            .await
            .map_err(internal)?
            .ok_or_else(|| TriggerError::ReferenceNotFound {
                reference: reference.to_owned(),
            })?;
        let run = self.owning_run(&attempt).await?;
        Ok((attempt, run))
    }

    async fn owning_run(&self, attempt: &AttemptRecord) -> Result<TaskRun, TriggerError> {
        self.store
            .get_run(&attempt.task_run_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| TriggerError::ReferenceNotFound {
                reference: attempt.task_run_id.to_string(),
            })
    }
}

/// A dependent attempt (or its owning run) in a terminal failure state
/// cannot be depended on.
fn ensure_dependable(
    reference: &str,
    attempt: &AttemptRecord,
    run: &TaskRun,
) -> Result<(), TriggerError> {
    if attempt.status.is_failure() {
        return Err(TriggerError::DependencyInTerminalState {
            reference: reference.to_owned(),
            status: attempt.status,
        });
    }
    if run.status.is_failure() {
        return Err(TriggerError::DependencyInTerminalState {
            reference: reference.to_owned(),
            status: run.status,
        });
    }
    Ok(())
}

fn internal(e: StoreError) -> TriggerError {
    TriggerError::Internal(e.to_string())
}
