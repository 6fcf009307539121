//! Manifest cache backend trait.

use std::time::Duration;

use async_trait::async_trait;

/// Key-value store with per-key expiry, shared by manifest readers.
///
/// Implementations handle their own error recovery: on failure, methods
/// return `None`/`false` or do nothing, and the manifest is rebuilt from its
/// shard files.
#[async_trait]
pub trait ManifestCacheBackend: Send + Sync {
    /// Value stored under `key`, unless missing or expired.
    async fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key` with no expiry. Replaces any previous value
    /// and its expiry.
    async fn set(&self, key: &str, value: &str);

    /// Expire `key` after `ttl` from now.
    ///
    /// # Returns
    /// `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> bool;

    /// Remove `key`.
    async fn delete(&self, key: &str);
}
