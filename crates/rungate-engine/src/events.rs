//! Event/tracing sink boundary.
//!
//! Used only on expiry to mark a run's trace span as errored.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// Outcome attached to a completed event span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The span completed successfully.
    Success,
    /// The span completed with an error message.
    Error(String),
}

/// Event sink consumed by the expiry callback.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Complete the span identified by `span_id` with the given outcome.
    async fn complete_event(&self, span_id: &str, outcome: EventOutcome);
}

/// [`EventSink`] that only logs.
#[derive(Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn complete_event(&self, span_id: &str, outcome: EventOutcome) {
        debug!(span_id, outcome = ?outcome, "Event completed");
    }
}

/// [`EventSink`] that records completions, for assertions in tests.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, EventOutcome)>>,
}

impl RecordingEventSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded completions.
    pub async fn recorded(&self) -> Vec<(String, EventOutcome)> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn complete_event(&self, span_id: &str, outcome: EventOutcome) {
        self.events
            .lock()
            .await
            .push((span_id.to_owned(), outcome));
    }
}
