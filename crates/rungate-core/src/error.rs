//! The trigger error taxonomy.

use thiserror::Error;

use crate::duration::TtlError;
use crate::packet::PacketError;
use crate::status::RunStatus;

/// Errors surfaced by the run lifecycle orchestrator.
///
/// This is a closed taxonomy: validation failures are user-correctable and
/// surfaced verbatim; `OutOfEntitlement` and `RecursiveWaitDeadlock` are
/// distinct so callers can branch on them; `Internal` carries transport and
/// storage faults that propagate to the caller unretried.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// The environment's queue is at its configured maximum depth.
    #[error("Cannot trigger task: the queue size limit of {maximum} has been reached (currently {current})")]
    QueueSizeLimitReached { current: u64, maximum: u64 },

    /// The request carries more tags than allowed.
    #[error("Runs can only have {maximum} tags, you provided {count}")]
    TooManyTags { count: usize, maximum: usize },

    /// A dependency reference resolved to a run in a terminal failure state.
    #[error("Cannot trigger run: dependency {reference} is {status}")]
    DependencyInTerminalState {
        reference: String,
        status: RunStatus,
    },

    /// A dependency or version reference did not resolve.
    #[error("Cannot trigger run: {reference} was not found")]
    ReferenceNotFound { reference: String },

    /// The supplied one-time-use token was already consumed.
    #[error("Cannot trigger task: one-time use token has already been used")]
    OneTimeTokenAlreadyUsed,

    /// Concurrent first-creation of the same queue; caller-retriable.
    #[error("Queue \"{name}\" is being created concurrently, retry the trigger")]
    QueueNameRace { name: String },

    /// The organization's entitlement has been revoked.
    #[error("Cannot trigger task: organization is out of entitlement")]
    OutOfEntitlement,

    /// The run can never execute: it waits on itself through a saturated
    /// concurrency-limited queue. Recorded as the run's terminal
    /// `SYSTEM_FAILURE`, never retried.
    #[error("Deadlock detected: run would wait on itself in queue \"{queue}\"")]
    RecursiveWaitDeadlock { queue: String },

    /// The idempotency-key constraint race did not settle within the retry
    /// bound.
    #[error("Trigger did not settle after {attempts} idempotency retries")]
    IdempotencyKeyRetriesExhausted { attempts: u32 },

    /// The payload exceeds the hard cap, even for offloading.
    #[error("Payload of {size} bytes exceeds the maximum of {maximum} bytes")]
    PayloadTooLarge { size: usize, maximum: usize },

    /// The payload could not be packetized.
    #[error(transparent)]
    InvalidPayload(#[from] PacketError),

    /// The TTL string could not be parsed.
    #[error(transparent)]
    InvalidTtl(#[from] TtlError),

    /// Storage, broker transport, or object-store failure. Propagated to
    /// the caller; the correct recovery depends on caller context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TriggerError {
    /// User-correctable failures, surfaced verbatim to the caller.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::QueueSizeLimitReached { .. }
                | Self::TooManyTags { .. }
                | Self::DependencyInTerminalState { .. }
                | Self::ReferenceNotFound { .. }
                | Self::OneTimeTokenAlreadyUsed
                | Self::QueueNameRace { .. }
                | Self::PayloadTooLarge { .. }
                | Self::InvalidPayload(_)
                | Self::InvalidTtl(_)
        )
    }

    /// Failures a caller may retry as-is.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::QueueNameRace { .. })
    }
}
