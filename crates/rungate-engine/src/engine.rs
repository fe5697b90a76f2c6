//! The engine: the injected collaborator set every service works against.

use std::sync::Arc;

use crate::broker::{InMemoryBroker, RunBroker};
use crate::config::EngineConfig;
use crate::entitlement::{EntitlementClient, StaticEntitlementClient};
use crate::events::{EventSink, NoopEventSink};
use crate::jobs::{DurableJobScheduler, InMemoryJobScheduler};
use crate::object_store::{InMemoryObjectStore, ObjectStore};
use crate::store::{InMemoryRunStore, RunStore};

/// The orchestrator's collaborator set.
///
/// All external systems are injected; nothing here relies on process-wide
/// singletons. Construct once and share via `Arc`.
pub struct Engine {
    /// Persistent store.
    pub store: Arc<dyn RunStore>,

    /// Work-queue broker.
    pub broker: Arc<dyn RunBroker>,

    /// Durable job scheduler for delayed/TTL callbacks.
    pub scheduler: Arc<dyn DurableJobScheduler>,

    /// Object store for offloaded payloads.
    pub object_store: Arc<dyn ObjectStore>,

    /// Entitlement oracle.
    pub entitlements: Arc<dyn EntitlementClient>,

    /// Event/tracing sink.
    pub events: Arc<dyn EventSink>,

    /// Engine limits.
    pub config: EngineConfig,
}

impl Engine {
    /// Create an engine from explicit collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RunStore>,
        broker: Arc<dyn RunBroker>,
        scheduler: Arc<dyn DurableJobScheduler>,
        object_store: Arc<dyn ObjectStore>,
        entitlements: Arc<dyn EntitlementClient>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            scheduler,
            object_store,
            entitlements,
            events,
            config,
        })
    }

    /// Create an engine backed entirely by in-memory adapters.
    ///
    /// Used by the development daemon and as a test fixture.
    pub fn in_memory(config: EngineConfig) -> Arc<Self> {
        Self::new(
            Arc::new(InMemoryRunStore::new()),
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryJobScheduler::new()),
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(StaticEntitlementClient::allowing()),
            Arc::new(NoopEventSink),
            config,
        )
    }
}
