// Blob store trait
//
// The object store is an external collaborator; only its interface is
// specified here. Keys are generated with UUID v7 by callers, so two writers
// never target the same key. The in-memory implementation backs tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use leadforge_core::{Result, WorkerError};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes under a key; returns the public URL when `public`
    async fn put(&self, key: &str, bytes: Vec<u8>, mime_type: &str, public: bool) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Public URL for an existing key
    fn public_url(&self, key: &str) -> String;

    /// Pre-signed PUT URL for delegated upload into an external bucket
    async fn presigned_put(
        &self,
        bucket: &str,
        key: &str,
        mime_type: &str,
        expires_secs: u64,
    ) -> Result<String>;
}

/// In-memory blob store for tests
#[derive(Default)]
pub struct MemoryBlobStore {
    base_url: String,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            base_url: "https://blobs.test".to_string(),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _mime_type: &str, _public: bool) -> Result<String> {
        self.blobs.lock().unwrap().insert(key.to_string(), bytes);
        Ok(self.public_url(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| WorkerError::storage(format!("Blob {key} not found")))
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    async fn presigned_put(
        &self,
        bucket: &str,
        key: &str,
        _mime_type: &str,
        expires_secs: u64,
    ) -> Result<String> {
        Ok(format!(
            "{}/presigned/{bucket}/{key}?expires={expires_secs}",
            self.base_url
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryBlobStore::new();
        let url = store
            .put("images/a.png", vec![1, 2, 3], "image/png", true)
            .await
            .unwrap();
        assert_eq!(url, "https://blobs.test/images/a.png");
        assert_eq!(store.get("images/a.png").await.unwrap(), vec![1, 2, 3]);
    }
}
