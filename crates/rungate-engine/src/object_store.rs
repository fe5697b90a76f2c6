//! Object store boundary, used only for payload offloading.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

/// Object-store failure.
#[derive(Debug, Error)]
#[error("Object store failure: {0}")]
pub struct ObjectStoreError(pub String);

/// Object store consumed by the payload packet handler.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` with the given content type.
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;
}

/// In-memory [`ObjectStore`].
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored object's bytes.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(key)
            .map(|(bytes, _)| bytes.clone())
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.objects
            .lock()
            .await
            .insert(key.to_owned(), (bytes, content_type.to_owned()));
        Ok(())
    }
}
