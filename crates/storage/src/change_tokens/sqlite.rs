//! SQLite backend for the change-token cache.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::backend::{ChangeTokenBackend, ChangeTokenEntry};
use crate::error::StorageError;

/// SQLite-based change-token cache.
///
/// Tokens survive restarts so an unchanged public bucket is not downloaded
/// again. Uses WAL mode for better concurrent read performance.
pub struct SqliteChangeTokenCache {
    /// Database connection (protected by mutex for thread safety).
    conn: Mutex<Connection>,
    /// Table name (versioned for schema migrations).
    table_name: String,
}

impl SqliteChangeTokenCache {
    /// Database schema version.
    const CACHE_DB_VERSION: u32 = 1;

    /// Create or open a change-token cache at the given path.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    ///
    /// # Errors
    /// Returns error if database cannot be opened or initialized.
    pub fn open(db_path: &Path) -> Result<Self, StorageError> {
        let conn: Connection = Connection::open(db_path).map_err(|e| sqlite_error(db_path, e))?;
        Self::init(conn, db_path)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn: Connection =
            Connection::open_in_memory().map_err(|e| sqlite_error(Path::new(":memory:"), e))?;
        Self::init(conn, Path::new(":memory:"))
    }

    fn init(conn: Connection, db_path: &Path) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| sqlite_error(db_path, e))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| sqlite_error(db_path, e))?;

        let table_name: String = format!("change_tokens_v{}", Self::CACHE_DB_VERSION);
        let create_sql: String = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                object_key TEXT PRIMARY KEY NOT NULL,
                token TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
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

    /// Get the number of entries in the cache.
    pub fn count(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table_name), [], |row| {
                row.get(0)
            })
            .map_err(|e| sqlite_error(Path::new(&self.table_name), e))?;
        Ok(count as usize)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sqlite_error(path: &Path, err: rusqlite::Error) -> StorageError {
    StorageError::IoError {
        path: path.display().to_string(),
        message: format!("SQLite error: {}", err),
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> Result<ChangeTokenEntry, rusqlite::Error> {
    Ok(ChangeTokenEntry {
        object_key: row.get(0)?,
        token: row.get(1)?,
        recorded_at: row.get(2)?,
    })
}

#[async_trait]
impl ChangeTokenBackend for SqliteChangeTokenCache {
    async fn get(&self, object_key: &str) -> Option<ChangeTokenEntry> {
        let conn: MutexGuard<'_, Connection> = self.conn();
        let result: Result<Option<ChangeTokenEntry>, rusqlite::Error> = conn
            .query_row(
                &format!(
                    "SELECT object_key, token, recorded_at FROM {} WHERE object_key = ?",
                    self.table_name
                ),
                params![object_key],
                entry_from_row,
            )
            .optional();

        match result {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Change token cache get error: {}", e);
                None
            }
        }
    }

    async fn put(&self, entry: &ChangeTokenEntry) {
        let conn: MutexGuard<'_, Connection> = self.conn();
        let result = conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (object_key, token, recorded_at) VALUES (?, ?, ?)",
                self.table_name
            ),
            params![entry.object_key, entry.token, entry.recorded_at],
        );
        if let Err(e) = result {
            log::warn!("Change token cache put error: {}", e);
        }
    }

    async fn delete(&self, object_key: &str) {
        let conn: MutexGuard<'_, Connection> = self.conn();
        let result = conn.execute(
            &format!("DELETE FROM {} WHERE object_key = ?", self.table_name),
            params![object_key],
        );
        if let Err(e) = result {
            log::warn!("Change token cache delete error: {}", e);
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Vec<ChangeTokenEntry> {
        let conn: MutexGuard<'_, Connection> = self.conn();
        let sql: String = format!(
            "SELECT object_key, token, recorded_at FROM {}
             WHERE substr(object_key, 1, length(?1)) = ?1
             ORDER BY object_key",
            self.table_name
        );
        let result: Result<Vec<ChangeTokenEntry>, rusqlite::Error> = conn
            .prepare(&sql)
            .and_then(|mut stmt| {
                stmt.query_map(params![prefix], entry_from_row)?
                    .collect::<Result<Vec<ChangeTokenEntry>, rusqlite::Error>>()
            });

        match result {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Change token cache list error: {}", e);
                Vec::new()
            }
        }
    }

    async fn put_batch(&self, entries: &[ChangeTokenEntry]) {
        let mut conn: MutexGuard<'_, Connection> = self.conn();
        let sql: String = format!(
            "INSERT OR REPLACE INTO {} (object_key, token, recorded_at) VALUES (?, ?, ?)",
            self.table_name
        );
        let result: Result<(), rusqlite::Error> = conn.transaction().and_then(|tx| {
            for entry in entries {
                tx.execute(&sql, params![entry.object_key, entry.token, entry.recorded_at])?;
            }
            tx.commit()
        });
        if let Err(e) = result {
            log::warn!("Change token cache batch put error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, token: &str) -> ChangeTokenEntry {
        ChangeTokenEntry {
            object_key: key.to_string(),
            token: token.to_string(),
            recorded_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let cache: SqliteChangeTokenCache = SqliteChangeTokenCache::open_in_memory().unwrap();
        cache.put(&entry("b/a.bin", "t1")).await;
        assert_eq!(cache.get("b/a.bin").await, Some(entry("b/a.bin", "t1")));

        cache.put(&entry("b/a.bin", "t2")).await;
        assert_eq!(cache.get("b/a.bin").await.map(|e| e.token), Some("t2".to_string()));
        assert_eq!(cache.count().unwrap(), 1);

        cache.delete("b/a.bin").await;
        assert!(cache.get("b/a.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_is_literal() {
        let cache: SqliteChangeTokenCache = SqliteChangeTokenCache::open_in_memory().unwrap();
        cache
            .put_batch(&[
                entry("b/data_1/a", "t"),
                entry("b/data%1/b", "t"),
                entry("b/data_1/c", "t"),
            ])
            .await;

        let keys: Vec<String> = cache
            .list_prefix("b/data_1/")
            .await
            .into_iter()
            .map(|e| e.object_key)
            .collect();
        assert_eq!(keys, vec!["b/data_1/a".to_string(), "b/data_1/c".to_string()]);
    }

    #[tokio::test]
    async fn test_persists_across_connections() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tokens.db");
        {
            let cache: SqliteChangeTokenCache = SqliteChangeTokenCache::open(&db_path).unwrap();
            cache.put(&entry("b/k", "t")).await;
        }
        let cache: SqliteChangeTokenCache = SqliteChangeTokenCache::open(&db_path).unwrap();
        assert!(cache.get("b/k").await.is_some());
    }
}
