//! Fast cache for merged manifests.
//!
//! Rebuilding a manifest means reading every shard file, so the merged view
//! is cached under `DATASET-MANIFEST-CACHE|<dataset>|<revision>|<link>`. The
//! cached value carries a signature of the shard files it was built from;
//! a value whose signature no longer matches the directory is a miss. The
//! cache is an accelerator only: any entry may vanish at any time.

mod backend;
mod memory;
mod sqlite;

pub use backend::ManifestCacheBackend;
pub use memory::{CacheClock, ManualClock, MemoryManifestCache};
pub use sqlite::SqliteManifestCache;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::entry::{is_shard_file_name, ManifestEntry, LEGACY_MANIFEST_NAME};
use crate::error::ManifestError;

const CACHE_KEY_PREFIX: &str = "DATASET-MANIFEST-CACHE";

#[derive(Debug, Serialize, Deserialize)]
struct CachedManifest {
    signature: String,
    entries: Vec<ManifestEntry>,
}

/// Manifest cache with a pluggable backend and TTL.
#[derive(Clone)]
pub struct ManifestCache {
    backend: Arc<dyn ManifestCacheBackend>,
    ttl: Duration,
}

impl ManifestCache {
    /// Create a cache over a backend.
    ///
    /// # Arguments
    /// * `backend` - Storage backend implementation
    /// * `ttl` - Expiry applied on every store and refreshed on every hit
    pub fn new(backend: Arc<dyn ManifestCacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// In-memory cache, mostly for tests and one-shot tools.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryManifestCache::new()), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cache key for a dataset revision, optionally scoped to a linking project.
    pub fn key(dataset_id: &str, revision: &str, link_id: Option<&str>) -> String {
        format!(
            "{}|{}|{}|{}",
            CACHE_KEY_PREFIX,
            dataset_id,
            revision,
            link_id.unwrap_or("")
        )
    }

    /// Cached manifest for `key` if its signature matches.
    ///
    /// A hit refreshes the TTL.
    pub async fn load(
        &self,
        key: &str,
        signature: &str,
    ) -> Option<BTreeMap<String, ManifestEntry>> {
        let raw: String = self.backend.get(key).await?;
        let cached: CachedManifest = match serde_json::from_str(&raw) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Dropping unreadable manifest cache entry {}: {}", key, e);
                self.backend.delete(key).await;
                return None;
            }
        };
        if cached.signature != signature {
            log::debug!("Manifest cache entry {} is stale", key);
            return None;
        }

        self.backend.expire(key, self.ttl).await;
        Some(
            cached
                .entries
                .into_iter()
                .map(|e: ManifestEntry| (e.relative_path.clone(), e))
                .collect(),
        )
    }

    /// Replace the cached manifest for `key`.
    pub async fn store(
        &self,
        key: &str,
        signature: &str,
        manifest: &BTreeMap<String, ManifestEntry>,
    ) {
        let cached: CachedManifest = CachedManifest {
            signature: signature.to_string(),
            entries: manifest.values().cloned().collect(),
        };
        match serde_json::to_string(&cached) {
            Ok(raw) => {
                self.backend.set(key, &raw).await;
                self.backend.expire(key, self.ttl).await;
            }
            Err(e) => log::warn!("Failed to encode manifest cache entry {}: {}", key, e),
        }
    }

    /// Drop the cached manifest for `key`.
    pub async fn evict(&self, key: &str) {
        self.backend.delete(key).await;
    }
}

/// Fingerprint of the shard files in a manifest directory.
///
/// Lists every shard and the legacy file as `name:len:mtime_ns`, sorted by
/// name. Any rewrite of a shard changes it.
pub fn shard_signature(manifest_dir: &Path) -> Result<String, ManifestError> {
    let read_dir = match std::fs::read_dir(manifest_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(ManifestError::io(manifest_dir, e)),
    };

    let mut parts: Vec<String> = Vec::new();
    for item in read_dir {
        let item: std::fs::DirEntry = item.map_err(|e| ManifestError::io(manifest_dir, e))?;
        let name: String = item.file_name().to_string_lossy().into_owned();
        if name != LEGACY_MANIFEST_NAME && !is_shard_file_name(&name) {
            continue;
        }
        let metadata: std::fs::Metadata =
            item.metadata().map_err(|e| ManifestError::io(&item.path(), e))?;
        let mtime_ns: u128 = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        parts.push(format!("{}:{}:{}", name, metadata.len(), mtime_ns));
    }
    parts.sort();
    Ok(parts.join(";"))
}
