//! Entitlement oracle boundary.

use async_trait::async_trait;
use thiserror::Error;

use rungate_core::OrganizationId;

/// Entitlement lookup failure.
#[derive(Debug, Error)]
#[error("Entitlement lookup failure: {0}")]
pub struct EntitlementError(pub String);

/// An organization's entitlement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlement {
    /// Whether the organization may trigger runs.
    pub has_access: bool,
}

/// Entitlement oracle consumed by the admission guard.
#[async_trait]
pub trait EntitlementClient: Send + Sync {
    /// The organization's current entitlement.
    async fn current_entitlement(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Entitlement, EntitlementError>;
}

/// Fixed-answer [`EntitlementClient`].
pub struct StaticEntitlementClient {
    has_access: bool,
}

impl StaticEntitlementClient {
    /// A client that grants access to every organization.
    pub fn allowing() -> Self {
        Self { has_access: true }
    }

    /// A client that denies access to every organization.
    pub fn denying() -> Self {
        Self { has_access: false }
    }
}

#[async_trait]
impl EntitlementClient for StaticEntitlementClient {
    async fn current_entitlement(
        &self,
        _organization_id: &OrganizationId,
    ) -> Result<Entitlement, EntitlementError> {
        Ok(Entitlement {
            has_access: self.has_access,
        })
    }
}
