use crate::storage::{StorageBackend, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// In-memory storage, cloned handles share the same snapshots
#[derive(Clone, Default)]
pub struct MemoryBackend {
    documents: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    stores: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a backend error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful stores so far
    pub fn store_count(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self, document_name: &str) -> Option<Vec<u8>> {
        self.documents.read().await.get(document_name).cloned()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Backend("memory backend failing".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn fetch(&self, document_name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check()?;
        Ok(self.snapshot(document_name).await)
    }

    async fn store(&self, document_name: &str, state: &[u8]) -> Result<(), StorageError> {
        self.check()?;
        self.documents
            .write()
            .await
            .insert(document_name.to_string(), state.to_vec());
        self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
