//! Tunables shared by sweeps, transfers and background hashing.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_JOB_POLL_INTERVAL_MS, DEFAULT_MANIFEST_CACHE_TTL_SECS,
    DEFAULT_MAX_HASH_JOB_ATTEMPTS, DEFAULT_PUSH_BATCH_SIZE, DEFAULT_UPLOAD_CONCURRENCY,
};
use crate::error::SettingsError;

/// Sync engine settings.
///
/// Every field has a default, so a settings file only needs the keys it
/// wants to override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Files hashed concurrently.
    pub hash_concurrency: usize,
    /// Objects uploaded concurrently.
    pub upload_concurrency: usize,
    /// Objects downloaded concurrently.
    pub download_concurrency: usize,
    /// Objects handed to a backend per push batch.
    pub push_batch_size: usize,
    /// TTL of the fast manifest cache, in seconds.
    pub manifest_cache_ttl_secs: u64,
    /// Attempts a background hashing job gets.
    pub max_hash_job_attempts: u32,
    /// Interval between background job status polls, in milliseconds.
    pub job_poll_interval_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            hash_concurrency: default_hash_concurrency(),
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            manifest_cache_ttl_secs: DEFAULT_MANIFEST_CACHE_TTL_SECS,
            max_hash_job_attempts: DEFAULT_MAX_HASH_JOB_ATTEMPTS,
            job_poll_interval_ms: DEFAULT_JOB_POLL_INTERVAL_MS,
        }
    }
}

fn default_hash_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl SyncSettings {
    /// Load settings from a JSON file.
    ///
    /// # Arguments
    /// * `path` - Path to the settings file
    ///
    /// # Errors
    /// Returns `SettingsError` if the file cannot be read, does not parse,
    /// or holds a zero where a positive value is required.
    pub fn from_json_file(path: &Path) -> Result<Self, SettingsError> {
        let text: String = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let settings: SyncSettings =
            serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would stall the engine.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive: [(&'static str, usize); 4] = [
            ("hash_concurrency", self.hash_concurrency),
            ("upload_concurrency", self.upload_concurrency),
            ("download_concurrency", self.download_concurrency),
            ("push_batch_size", self.push_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SettingsError::Invalid {
                    name,
                    message: "must be greater than zero".into(),
                });
            }
        }
        if self.max_hash_job_attempts == 0 {
            return Err(SettingsError::Invalid {
                name: "max_hash_job_attempts",
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn with_hash_concurrency(mut self, n: usize) -> Self {
        self.hash_concurrency = n;
        self
    }

    pub fn with_upload_concurrency(mut self, n: usize) -> Self {
        self.upload_concurrency = n;
        self
    }

    pub fn with_download_concurrency(mut self, n: usize) -> Self {
        self.download_concurrency = n;
        self
    }

    pub fn with_push_batch_size(mut self, n: usize) -> Self {
        self.push_batch_size = n;
        self
    }

    pub fn with_manifest_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.manifest_cache_ttl_secs = secs;
        self
    }

    pub fn with_max_hash_job_attempts(mut self, attempts: u32) -> Self {
        self.max_hash_job_attempts = attempts;
        self
    }

    pub fn with_job_poll_interval_ms(mut self, ms: u64) -> Self {
        self.job_poll_interval_ms = ms;
        self
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}
