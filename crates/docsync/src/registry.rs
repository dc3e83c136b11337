use crate::document::{Document, SharedDocument};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Process-local map from document name to live document
///
/// Only guarantees one in-memory instance per name within this process;
/// consistency across processes is the replication coordinator's job.
/// Lock order is document before registry: the map lock is never held while
/// waiting on a document.
#[derive(Default)]
pub struct DocumentRegistry {
    documents: RwLock<HashMap<String, SharedDocument>>,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<SharedDocument> {
        self.documents.read().await.get(name).cloned()
    }

    /// Returns the document and whether this call created it
    pub async fn get_or_create(&self, name: &str) -> (SharedDocument, bool) {
        if let Some(document) = self.get(name).await {
            return (document, false);
        }

        let mut documents = self.documents.write().await;
        if let Some(document) = documents.get(name) {
            return (Arc::clone(document), false);
        }
        debug!("Creating document {}", name);
        let document = Document::shared(name);
        documents.insert(name.to_string(), Arc::clone(&document));
        (document, true)
    }

    pub async fn remove(&self, name: &str) -> Option<SharedDocument> {
        self.documents.write().await.remove(name)
    }

    /// Remove `name` only if it still maps to `document`
    pub async fn remove_if_same(&self, name: &str, document: &SharedDocument) -> bool {
        let mut documents = self.documents.write().await;
        match documents.get(name) {
            Some(current) if Arc::ptr_eq(current, document) => {
                documents.remove(name);
                debug!("Evicted document {}", name);
                true
            }
            _ => false,
        }
    }

    /// True when `name` currently maps to `document`
    pub async fn contains_same(&self, name: &str, document: &SharedDocument) -> bool {
        self.documents
            .read()
            .await
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, document))
    }

    /// Local connections attached to `name`, 0 when it is not loaded
    pub async fn connection_count(&self, name: &str) -> usize {
        match self.get(name).await {
            Some(document) => document.lock().await.connection_count(),
            None => 0,
        }
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.documents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}
