//! Idempotency ledger: decides "replay cached run" vs "create new run".

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use rungate_core::{EnvironmentId, TaskIdentifier, TaskRun, TriggerError};

use crate::store::RunStore;

/// Outcome of a ledger lookup.
#[derive(Debug)]
pub enum LedgerOutcome {
    /// A run with a fresh key exists: replay it, no side effects.
    Cached(TaskRun),
    /// No usable match: proceed to creation.
    Miss,
}

/// Per-(environment, task, key) lookup against existing runs.
pub struct IdempotencyLedger {
    store: Arc<dyn RunStore>,
}

impl IdempotencyLedger {
    /// Create a ledger over the given store.
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Look up an existing run for the key, clearing stale keys as a side
    /// effect.
    pub async fn check(
        &self,
        environment_id: &EnvironmentId,
        task_identifier: &TaskIdentifier,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerOutcome, TriggerError> {
        let Some(key) = idempotency_key else {
            return Ok(LedgerOutcome::Miss);
        };

        let existing = self
            .store
            .find_run_by_idempotency_key(environment_id, task_identifier, key)
            .await
            .map_err(|e| TriggerError::Internal(e.to_string()))?;

        let Some(run) = existing else {
            return Ok(LedgerOutcome::Miss);
        };

        if run.idempotency_key_is_fresh(Utc::now()) {
            debug!(
                run_id = %run.id,
                task = %task_identifier,
                "Idempotency key matched, replaying cached run"
            );
            return Ok(LedgerOutcome::Cached(run));
        }

        // Stale key: clear it on the old record and proceed as a miss.
        // Cleanup failure is non-blocking; creation will surface the
        // constraint if the key is still indexed.
        if let Err(e) = self.store.clear_idempotency_key(&run.id).await {
            warn!(run_id = %run.id, error = %e, "Failed to clear expired idempotency key");
        }

        Ok(LedgerOutcome::Miss)
    }
}
