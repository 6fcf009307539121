//! Process-local manifest cache with a controllable clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dataset_sync_common::time::current_epoch_seconds;

use super::backend::ManifestCacheBackend;

/// Source of "now" for expiry checks.
#[derive(Debug, Clone)]
pub enum CacheClock {
    /// Wall-clock seconds since the epoch.
    System,
    /// Seconds that only move when [`ManualClock::advance`] is called.
    Manual(ManualClock),
}

impl CacheClock {
    fn now(&self) -> u64 {
        match self {
            CacheClock::System => current_epoch_seconds(),
            CacheClock::Manual(clock) => clock.now(),
        }
    }
}

/// Shared, manually advanced clock.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    seconds: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            seconds: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn now(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }

    pub fn advance(&self, by: Duration) {
        self.seconds.fetch_add(by.as_secs(), Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<u64>,
}

/// In-memory cache backend.
#[derive(Debug)]
pub struct MemoryManifestCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    clock: CacheClock,
}

impl MemoryManifestCache {
    pub fn new() -> Self {
        Self::with_clock(CacheClock::System)
    }

    pub fn with_clock(clock: CacheClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now: u64 = self.clock.now();
        self.lock()
            .values()
            .filter(|e: &&MemoryEntry| !is_expired(e, now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seconds until `key` expires, if it has an expiry.
    pub fn ttl(&self, key: &str) -> Option<u64> {
        let now: u64 = self.clock.now();
        self.lock()
            .get(key)
            .and_then(|e: &MemoryEntry| e.expires_at)
            .map(|at: u64| at.saturating_sub(now))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryManifestCache {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(entry: &MemoryEntry, now: u64) -> bool {
    matches!(entry.expires_at, Some(at) if at <= now)
}

#[async_trait]
impl ManifestCacheBackend for MemoryManifestCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now: u64 = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if is_expired(entry, now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &str) {
        self.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    async fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now: u64 = self.clock.now();
        match self.lock().get_mut(key) {
            Some(entry) if !is_expired(entry, now) => {
                entry.expires_at = Some(now + ttl.as_secs());
                true
            }
            _ => false,
        }
    }

    async fn delete(&self, key: &str) {
        self.lock().remove(key);
    }
}
