//! Run admission guard: queue-size ceilings and entitlement checks.

use std::sync::Arc;

use tracing::info;

use rungate_core::{RuntimeEnvironment, TriggerError};

use crate::broker::RunBroker;
use crate::config::EngineConfig;
use crate::entitlement::EntitlementClient;

/// Enforces admission limits before any persistence write.
pub struct AdmissionGuard {
    broker: Arc<dyn RunBroker>,
    entitlements: Arc<dyn EntitlementClient>,
    config: EngineConfig,
}

impl AdmissionGuard {
    /// Create a guard over the given broker and entitlement oracle.
    pub fn new(
        broker: Arc<dyn RunBroker>,
        entitlements: Arc<dyn EntitlementClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            broker,
            entitlements,
            config,
        }
    }

    /// Check queue depth and entitlement for `items_to_add` new runs.
    ///
    /// `skip_checks` bypasses both gates for internal/system-triggered
    /// runs.
    pub async fn guard(
        &self,
        environment: &RuntimeEnvironment,
        items_to_add: u64,
        skip_checks: bool,
    ) -> Result<(), TriggerError> {
        if skip_checks {
            return Ok(());
        }

        let maximum = self
            .config
            .queue_size_limit(environment.environment_type.is_development());
        let current = self
            .broker
            .queue_depth(&environment.id)
            .await
            .map_err(|e| TriggerError::Internal(e.to_string()))?;

        if current + items_to_add > maximum {
            info!(
                environment_id = %environment.id,
                current,
                maximum,
                "Trigger rejected: queue size limit reached"
            );
            return Err(TriggerError::QueueSizeLimitReached { current, maximum });
        }

        if !environment.environment_type.is_development() {
            let entitlement = self
                .entitlements
                .current_entitlement(&environment.organization_id)
                .await
                .map_err(|e| TriggerError::Internal(e.to_string()))?;
            if !entitlement.has_access {
                return Err(TriggerError::OutOfEntitlement);
            }
        }

        Ok(())
    }
}
