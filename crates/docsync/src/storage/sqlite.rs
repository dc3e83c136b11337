use crate::config::StorageConfig;
use crate::storage::{StorageBackend, StorageError};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite implementation of the StorageBackend trait
pub struct SqliteBackend {
    pool: DbPool,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, StorageError> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::create_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(5)
            .min_idle(Some(1))
            .build(manager)?;

        debug!("Opened document store at {:?}", path_ref);
        Ok(SqliteBackend { pool })
    }

    fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            -- One snapshot per document, replaced on every store
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Run a blocking closure on a pooled connection
    async fn with_connection<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn fetch(&self, document_name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let name = document_name.to_string();
        self.with_connection(move |conn| {
            let data = conn
                .query_row(
                    "SELECT data FROM documents WHERE name = ?1",
                    params![name],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(data)
        })
        .await
    }

    async fn store(&self, document_name: &str, state: &[u8]) -> Result<(), StorageError> {
        let name = document_name.to_string();
        let data = state.to_vec();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO documents (name, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                params![name, data, unix_millis()],
            )?;
            Ok(())
        })
        .await
    }
}
