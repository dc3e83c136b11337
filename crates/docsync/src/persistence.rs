use crate::document::{Document, DocumentError};
use crate::storage::{StorageBackend, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Stored state is unusable: {0}")]
    Document(#[from] DocumentError),
}

/// Bridges document load/store to a storage backend
///
/// The stored value is the document's full state encoding, applied as a
/// plain update on load.
#[derive(Clone)]
pub struct PersistenceAdapter {
    backend: Arc<dyn StorageBackend>,
}

impl PersistenceAdapter {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Apply the stored state to `document`; false when nothing was stored
    pub async fn load(&self, document: &mut Document) -> Result<bool, PersistenceError> {
        match self.backend.fetch(document.name()).await? {
            Some(state) if !state.is_empty() => {
                document.apply_update(&state)?;
                debug!("Loaded {} ({} bytes)", document.name(), state.len());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn store(&self, document_name: &str, state: &[u8]) -> Result<(), PersistenceError> {
        self.backend.store(document_name, state).await?;
        debug!("Stored {} ({} bytes)", document_name, state.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use yrs::{GetString, ReadTxn, Text, Transact, WriteTxn};

    #[tokio::test]
    async fn test_store_then_load_restores_content() {
        let backend = MemoryBackend::new();
        let adapter = PersistenceAdapter::new(Arc::new(backend.clone()));

        let source = Document::new("doc");
        {
            let mut txn = source.doc().transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, "persisted");
        }
        adapter
            .store("doc", &source.encode_state_as_update())
            .await
            .unwrap();

        let mut restored = Document::new("doc");
        assert!(adapter.load(&mut restored).await.unwrap());
        let txn = restored.doc().transact();
        let text = txn.get_text("content").unwrap();
        assert_eq!(text.get_string(&txn), "persisted");
    }

    #[tokio::test]
    async fn test_missing_document_loads_nothing() {
        let adapter = PersistenceAdapter::new(Arc::new(MemoryBackend::new()));
        let mut doc = Document::new("absent");
        assert!(!adapter.load(&mut doc).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_an_error() {
        let backend = MemoryBackend::new();
        backend.store("doc", &[0xff, 0xff, 0xff]).await.unwrap();
        let adapter = PersistenceAdapter::new(Arc::new(backend));
        let mut doc = Document::new("doc");
        assert!(matches!(
            adapter.load(&mut doc).await,
            Err(PersistenceError::Document(_))
        ));
    }
}
