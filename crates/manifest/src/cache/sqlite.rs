//! SQLite backend for the manifest cache.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dataset_sync_common::time::current_epoch_seconds;
use rusqlite::{params, Connection, OptionalExtension};

use super::backend::ManifestCacheBackend;
use crate::error::ManifestError;

/// SQLite-based manifest cache shared by every process on the machine.
///
/// Uses WAL mode so readers do not block the writer.
pub struct SqliteManifestCache {
    /// Database connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
    /// Table name (versioned for schema migrations).
    table_name: String,
}

impl SqliteManifestCache {
    /// Database schema version.
    const CACHE_DB_VERSION: u32 = 1;

    /// Create or open a SQLite manifest cache at the given path.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    ///
    /// # Errors
    /// Returns error if database cannot be opened or initialized.
    pub fn open(db_path: &Path) -> Result<Self, ManifestError> {
        let conn: Connection = Connection::open(db_path).map_err(|e| sqlite_error(db_path, e))?;
        Self::init(conn, db_path)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, ManifestError> {
        let conn: Connection =
            Connection::open_in_memory().map_err(|e| sqlite_error(Path::new(":memory:"), e))?;
        Self::init(conn, Path::new(":memory:"))
    }

    fn init(conn: Connection, db_path: &Path) -> Result<Self, ManifestError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| sqlite_error(db_path, e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| sqlite_error(db_path, e))?;

        let table_name: String = format!("manifest_cache_v{}", Self::CACHE_DB_VERSION);
        let create_sql: String = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
            table_name
        );
        conn.execute(&create_sql, [])
            .map_err(|e| sqlite_error(db_path, e))?;

        Ok(Self {
            conn: Mutex::new(conn),
            table_name,
        })
    }

    /// Remove expired rows.
    ///
    /// # Returns
    /// Number of rows deleted.
    pub fn cleanup_expired(&self) -> Result<usize, ManifestError> {
        let now: i64 = current_epoch_seconds() as i64;
        let conn: MutexGuard<'_, Connection> = self.conn();
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= ?",
                self.table_name
            ),
            params![now],
        )
        .map_err(|e| sqlite_error(Path::new(&self.table_name), e))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sqlite_error(path: &Path, err: rusqlite::Error) -> ManifestError {
    ManifestError::Corrupt {
        path: path.display().to_string(),
        message: format!("SQLite error: {}", err),
    }
}

#[async_trait]
impl ManifestCacheBackend for SqliteManifestCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now: i64 = current_epoch_seconds() as i64;
        let conn: MutexGuard<'_, Connection> = self.conn();
        let result: Result<Option<String>, rusqlite::Error> = conn
            .query_row(
                &format!(
                    "SELECT value FROM {} WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
                    self.table_name
                ),
                params![key, now],
                |row| row.get(0),
            )
            .optional();

        match result {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Manifest cache get error: {}", e);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str) {
        let conn: MutexGuard<'_, Connection> = self.conn();
        let result = conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value, expires_at) VALUES (?, ?, NULL)",
                self.table_name
            ),
            params![key, value],
        );
        if let Err(e) = result {
            log::warn!("Manifest cache set error: {}", e);
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now: i64 = current_epoch_seconds() as i64;
        let conn: MutexGuard<'_, Connection> = self.conn();
        let result = conn.execute(
            &format!(
                "UPDATE {} SET expires_at = ? WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
                self.table_name
            ),
            params![now + ttl.as_secs() as i64, key, now],
        );
        match result {
            Ok(updated) => updated > 0,
            Err(e) => {
                log::warn!("Manifest cache expire error: {}", e);
                false
            }
        }
    }

    async fn delete(&self, key: &str) {
        let conn: MutexGuard<'_, Connection> = self.conn();
        let result = conn.execute(
            &format!("DELETE FROM {} WHERE key = ?", self.table_name),
            params![key],
        );
        if let Err(e) = result {
            log::warn!("Manifest cache delete error: {}", e);
        }
    }
}
