mod memory;
mod sqlite;
mod storage_trait;

pub use memory::MemoryBackend;
pub use sqlite::{DbPool, SqliteBackend};
pub use storage_trait::{StorageBackend, StorageError};
