//! Task queues: named, environment-scoped, concurrency-limited admission lanes.

use serde::{Deserialize, Serialize};

use crate::ids::EnvironmentId;

/// Maximum length of a sanitized queue name.
pub const MAX_QUEUE_NAME_LEN: usize = 100;

/// How a queue came to exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueType {
    /// Explicitly named by the task or trigger request.
    Named,
    /// Implicit per-task default queue (`task/<identifier>`).
    #[default]
    Task,
}

/// A named admission lane within an environment.
///
/// The persisted record is the source of truth for display/audit; the broker
/// holds the live limit enforced at dequeue time. The two are always updated
/// together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueue {
    /// Sanitized queue name, unique per environment.
    pub name: String,

    /// Environment this queue belongs to.
    pub environment_id: EnvironmentId,

    /// Concurrency limit. `None` means unlimited.
    pub concurrency_limit: Option<u32>,

    /// Whether the queue was explicitly named or is a task default.
    pub queue_type: QueueType,
}

/// A requested change to a queue's concurrency limit.
///
/// `Clear` explicitly removes any override (unlimited); absence of a
/// `LimitUpdate` in a trigger request leaves the queue untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitUpdate {
    /// Remove any concurrency override.
    Clear,
    /// Set the limit to the given value (clamped by the caller's maxima).
    Set(u32),
}

impl LimitUpdate {
    /// Clamp the requested limit to `[0, min(environment max, organization max)]`.
    ///
    /// `Clear` is unaffected by clamping.
    pub fn clamped(self, environment_max: u32, organization_max: u32) -> Self {
        match self {
            Self::Clear => Self::Clear,
            Self::Set(requested) => Self::Set(requested.min(environment_max).min(organization_max)),
        }
    }

    /// The persisted representation: `None` = unlimited.
    pub fn as_limit(self) -> Option<u32> {
        match self {
            Self::Clear => None,
            Self::Set(limit) => Some(limit),
        }
    }
}

/// Strip characters unsafe for the broker's namespace and bound the length.
///
/// Keeps `[A-Za-z0-9_\-/]`; everything else is dropped.
pub fn sanitize_queue_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/'))
        .take(MAX_QUEUE_NAME_LEN)
        .collect()
}
