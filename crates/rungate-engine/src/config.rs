//! Engine configuration.

use rungate_core::MachinePreset;

/// Engine configuration.
///
/// Limits here are the orchestrator-wide defaults; per-environment maxima
/// travel on [`rungate_core::RuntimeEnvironment`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum queue depth for development environments.
    pub dev_queue_size_limit: u64,

    /// Maximum queue depth for deployed environments.
    pub deployed_queue_size_limit: u64,

    /// Inline payload size above which the payload is offloaded to the
    /// object store (bytes).
    pub payload_offload_threshold: usize,

    /// Absolute payload size cap (bytes). Larger payloads are rejected
    /// before any write.
    pub payload_hard_limit: usize,

    /// Maximum number of tags a single run may carry.
    pub max_tags_per_run: usize,

    /// Total trigger attempts when an idempotency-key constraint race is
    /// detected (retry-from-top bound).
    pub idempotency_retry_limit: u32,

    /// How long an idempotency key deduplicates when the caller does not
    /// supply a TTL for it.
    pub default_idempotency_key_ttl: chrono::Duration,

    /// Machine preset assigned when the caller does not specify one.
    pub default_machine_preset: MachinePreset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dev_queue_size_limit: 500,
            deployed_queue_size_limit: 10_000,
            payload_offload_threshold: 512 * 1024,
            payload_hard_limit: 3 * 1024 * 1024,
            max_tags_per_run: 10,
            idempotency_retry_limit: 5,
            default_idempotency_key_ttl: chrono::Duration::days(30),
            default_machine_preset: MachinePreset::default(),
        }
    }
}

impl EngineConfig {
    /// The queue-size ceiling for the given environment kind.
    pub fn queue_size_limit(&self, is_development: bool) -> u64 {
        if is_development {
            self.dev_queue_size_limit
        } else {
            self.deployed_queue_size_limit
        }
    }
}
