//! Payload packet handler: canonicalize, measure, offload.

use std::sync::Arc;

use tracing::debug;

use rungate_core::{IoPacket, TriggerError};

use crate::object_store::ObjectStore;

/// Builds the payload packet for a new run, offloading oversized payloads
/// to the object store under a key derived from the run's friendly id.
///
/// The indirection is transparent downstream: every consumer sees an
/// [`IoPacket`] either way.
pub struct PayloadPacketHandler {
    object_store: Arc<dyn ObjectStore>,
    offload_threshold: usize,
    hard_limit: usize,
}

impl PayloadPacketHandler {
    /// Create a handler with the given limits.
    pub fn new(object_store: Arc<dyn ObjectStore>, offload_threshold: usize, hard_limit: usize) -> Self {
        Self {
            object_store,
            offload_threshold,
            hard_limit,
        }
    }

    /// Deterministic object-store key for a run's payload.
    pub fn payload_key(friendly_id: &str) -> String {
        format!("runs/{friendly_id}/payload.json")
    }

    /// Build the packet for the raw payload, offloading if it exceeds the
    /// threshold.
    pub async fn packetize(
        &self,
        data: &str,
        content_type: &str,
        friendly_id: &str,
    ) -> Result<IoPacket, TriggerError> {
        let packet = IoPacket::from_raw(data, content_type)?;
        let size = packet.len();

        if size > self.hard_limit {
            return Err(TriggerError::PayloadTooLarge {
                size,
                maximum: self.hard_limit,
            });
        }

        if size <= self.offload_threshold {
            return Ok(packet);
        }

        let key = Self::payload_key(friendly_id);
        let bytes = packet
            .inline_data()
            .unwrap_or_default()
            .as_bytes()
            .to_vec();
        self.object_store
            .upload(&key, bytes, packet.content_type())
            .await
            .map_err(|e| TriggerError::Internal(e.to_string()))?;

        debug!(friendly_id, size, key = %key, "Payload offloaded to object store");

        Ok(IoPacket::StoredPointer { key })
    }
}
