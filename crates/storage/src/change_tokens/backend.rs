//! Change-token cache backend trait.

use async_trait::async_trait;

/// A remote object's change token as last synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTokenEntry {
    /// `"{bucket}/{key}"`.
    pub object_key: String,
    /// ETag or equivalent version marker.
    pub token: String,
    /// When the token was recorded (epoch seconds).
    pub recorded_at: i64,
}

/// Pluggable storage for change tokens.
///
/// Implementations handle their own errors: a failed read is a miss, which
/// only costs a redundant download, and a failed write is logged.
#[async_trait]
pub trait ChangeTokenBackend: Send + Sync {
    async fn get(&self, object_key: &str) -> Option<ChangeTokenEntry>;

    async fn put(&self, entry: &ChangeTokenEntry);

    async fn delete(&self, object_key: &str);

    /// Every entry whose key starts with `prefix`.
    async fn list_prefix(&self, prefix: &str) -> Vec<ChangeTokenEntry>;

    async fn put_batch(&self, entries: &[ChangeTokenEntry]) {
        for entry in entries {
            self.put(entry).await;
        }
    }
}
