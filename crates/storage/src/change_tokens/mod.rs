//! Per-object change tokens of externally owned remotes.
//!
//! An unmanaged backend compares each listed object's ETag with the token
//! recorded when it was last downloaded, and only fetches objects whose
//! token changed or that it has never seen.

mod backend;
mod sqlite;

pub use backend::{ChangeTokenBackend, ChangeTokenEntry};
pub use sqlite::SqliteChangeTokenCache;

use std::collections::BTreeMap;

use dataset_sync_common::current_epoch_seconds;

/// Change-token cache with configurable backend.
pub struct ChangeTokenCache {
    backend: Box<dyn ChangeTokenBackend>,
}

impl ChangeTokenCache {
    /// # Arguments
    /// * `backend` - Storage backend implementation
    pub fn new(backend: impl ChangeTokenBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Token recorded for an object, if any.
    pub async fn get(&self, bucket: &str, key: &str) -> Option<String> {
        self.backend
            .get(&object_key(bucket, key))
            .await
            .map(|e| e.token)
    }

    /// Whether `token` differs from the recorded one. Unknown objects
    /// count as changed.
    pub async fn has_changed(&self, bucket: &str, key: &str, token: &str) -> bool {
        self.get(bucket, key).await.as_deref() != Some(token)
    }

    pub async fn record(&self, bucket: &str, key: &str, token: &str) {
        self.backend
            .put(&ChangeTokenEntry {
                object_key: object_key(bucket, key),
                token: token.to_string(),
                recorded_at: current_epoch_seconds() as i64,
            })
            .await;
    }

    /// Record several `(key, token)` pairs at once.
    pub async fn record_batch(&self, bucket: &str, tokens: &[(String, String)]) {
        let now: i64 = current_epoch_seconds() as i64;
        let entries: Vec<ChangeTokenEntry> = tokens
            .iter()
            .map(|(key, token)| ChangeTokenEntry {
                object_key: object_key(bucket, key),
                token: token.clone(),
                recorded_at: now,
            })
            .collect();
        self.backend.put_batch(&entries).await;
    }

    pub async fn forget(&self, bucket: &str, key: &str) {
        self.backend.delete(&object_key(bucket, key)).await;
    }

    /// Recorded tokens under `bucket/prefix`, keyed by object key.
    pub async fn tokens_under(&self, bucket: &str, prefix: &str) -> BTreeMap<String, String> {
        let bucket_prefix: String = format!("{}/", bucket);
        self.backend
            .list_prefix(&object_key(bucket, prefix))
            .await
            .into_iter()
            .filter_map(|e| {
                e.object_key
                    .strip_prefix(&bucket_prefix)
                    .map(|key| (key.to_string(), e.token))
            })
            .collect()
    }
}

fn object_key(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, key)
}
