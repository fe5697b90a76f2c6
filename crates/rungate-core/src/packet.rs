//! Payload packets: the closed set of payload representations a run carries.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content type for canonical JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Content type for verbatim text payloads.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
/// Sentinel content type for payloads offloaded to the object store.
pub const CONTENT_TYPE_STORED: &str = "application/store";

/// Errors raised while constructing a payload packet.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The declared content type is outside the supported set.
    #[error("Unsupported payload content type: {0}")]
    UnsupportedContentType(String),

    /// The payload declared itself as JSON but does not parse.
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// A run's payload, either inline or offloaded to the object store.
///
/// Every consumer matches exhaustively on this set; `dataType` is never a
/// free-form string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IoPacket {
    /// Canonically-serialized JSON payload, stored inline.
    Json { data: String },
    /// Verbatim text payload, stored inline.
    Text { data: String },
    /// Pointer to a payload offloaded to the object store.
    StoredPointer { key: String },
}

impl IoPacket {
    /// Build a packet from raw payload data and a declared content type.
    ///
    /// JSON payloads are re-serialized into canonical form so equality and
    /// size checks are stable; other content passes through verbatim.
    pub fn from_raw(data: &str, content_type: &str) -> Result<Self, PacketError> {
        match content_type {
            CONTENT_TYPE_JSON => {
                let value: serde_json::Value = serde_json::from_str(data)?;
                Ok(Self::Json {
                    data: serde_json::to_string(&value)?,
                })
            }
            CONTENT_TYPE_TEXT => Ok(Self::Text {
                data: data.to_owned(),
            }),
            other => Err(PacketError::UnsupportedContentType(other.to_owned())),
        }
    }

    /// The content-type discriminator for this packet.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json { .. } => CONTENT_TYPE_JSON,
            Self::Text { .. } => CONTENT_TYPE_TEXT,
            Self::StoredPointer { .. } => CONTENT_TYPE_STORED,
        }
    }

    /// Inline payload size in bytes. Pointers have no inline size.
    pub fn len(&self) -> usize {
        match self {
            Self::Json { data } | Self::Text { data } => data.len(),
            Self::StoredPointer { .. } => 0,
        }
    }

    /// Returns true if the packet carries no inline bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inline data, if the packet is not a pointer.
    pub fn inline_data(&self) -> Option<&str> {
        match self {
            Self::Json { data } | Self::Text { data } => Some(data),
            Self::StoredPointer { .. } => None,
        }
    }
}
