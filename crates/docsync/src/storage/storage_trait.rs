use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("Storage task failed: {0}")]
    Task(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence backend for document snapshots
///
/// Snapshots are opaque bytes (the CRDT's full state encoding); the backend
/// never interprets them. `store` replaces whatever was stored before.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn fetch(&self, document_name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn store(&self, document_name: &str, state: &[u8]) -> Result<(), StorageError>;
}
