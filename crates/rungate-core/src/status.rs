//! Status enums for task runs and environments.

use serde::{Deserialize, Serialize};

/// Status of a task run through its admission lifecycle.
///
/// `Executing` and the terminal success/failure states are owned by the
/// execution subsystem; the orchestrator only creates runs in `Pending` or
/// `Delayed` and moves them to `Expired` or `SystemFailure`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Run is queued and waiting for a worker.
    #[default]
    Pending,
    /// Run is waiting for its delay-until timestamp before being queued.
    Delayed,
    /// Run is actively executing on a worker.
    Executing,
    /// Run completed successfully.
    Completed,
    /// Run failed during execution.
    Failed,
    /// Run was cancelled by user or system.
    Cancelled,
    /// Run's TTL elapsed before it started executing.
    Expired,
    /// Run could not be admitted into the broker.
    SystemFailure,
}

impl RunStatus {
    /// Returns true if the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired | Self::SystemFailure
        )
    }

    /// Returns true if the run ended without completing.
    ///
    /// Runs in this set cannot be depended on: a child triggered against
    /// them would be orphaned.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Cancelled | Self::Expired | Self::SystemFailure
        )
    }

    /// Stable string form used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Delayed => "DELAYED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::SystemFailure => "SYSTEM_FAILURE",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of runtime environment a run belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentType {
    /// Local development environment.
    #[default]
    Development,
    /// Shared staging environment.
    Staging,
    /// Production environment.
    Production,
    /// Ephemeral preview environment (branch deploys).
    Preview,
}

impl EnvironmentType {
    /// Development environments use a separate queue-size ceiling and skip
    /// the entitlement check.
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Delayed.is_terminal());
        assert!(!RunStatus::Executing.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Expired.is_terminal());
        assert!(RunStatus::SystemFailure.is_terminal());
    }

    #[test]
    fn test_failure_states_exclude_success() {
        assert!(!RunStatus::Completed.is_failure());
        assert!(RunStatus::Failed.is_failure());
        assert!(RunStatus::Cancelled.is_failure());
        assert!(RunStatus::Expired.is_failure());
    }

    #[test]
    fn test_serde_screaming_snake_case() {
        let json = serde_json::to_string(&RunStatus::SystemFailure).unwrap();
        assert_eq!(json, "\"SYSTEM_FAILURE\"");
    }
}
