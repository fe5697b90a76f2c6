//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create a new id from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident) => {
        impl $name {
            /// Generate a new random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }
        }
    };
}

string_id! {
    /// Internal identifier for a task run.
    RunId
}
generated_id!(RunId);

string_id! {
    /// Identifier for a single execution attempt of a run.
    ///
    /// Attempts are owned by the execution subsystem; the orchestrator only
    /// resolves them when a trigger declares a dependency on one.
    AttemptId
}
generated_id!(AttemptId);

string_id! {
    /// Identifier for a batch of runs triggered together.
    BatchId
}
generated_id!(BatchId);

string_id! {
    /// The user-facing task slug (e.g. "send-welcome-email").
    ///
    /// Never generated - always supplied by the caller.
    TaskIdentifier
}

string_id! {
    /// Identifier for a runtime environment.
    EnvironmentId
}
generated_id!(EnvironmentId);

string_id! {
    /// Identifier for an organization.
    OrganizationId
}
generated_id!(OrganizationId);

string_id! {
    /// Identifier for a project.
    ProjectId
}
generated_id!(ProjectId);

string_id! {
    /// Identifier for a deployed worker version a run can be pinned to.
    WorkerVersionId
}
generated_id!(WorkerVersionId);
