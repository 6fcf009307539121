//! Redo log for multi-shard persists.
//!
//! Before any shard is rewritten, the full new contents of every affected
//! shard are written to `<cache_root>/.manifest.wal`. The log is removed once
//! all shards are on disk. A log found on open means a persist was cut
//! short; replaying it rewrites the same shard contents again.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entry::ShardContents;
use crate::error::ManifestError;

/// File name of the write-ahead log under the cache root.
pub const WAL_FILE_NAME: &str = ".manifest.wal";

/// Shard contents a persist intends to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Dataset the shards belong to.
    pub dataset_id: String,
    /// Revision that was current when the persist started.
    pub revision: String,
    /// Shard file name to its complete new contents.
    pub shards: BTreeMap<String, ShardContents>,
}

/// Write-ahead log for one dataset cache root.
#[derive(Debug, Clone)]
pub struct WriteAheadLog {
    path: PathBuf,
}

impl WriteAheadLog {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            path: cache_root.join(WAL_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably record the intended shard contents.
    pub fn write(&self, record: &WalRecord) -> Result<(), ManifestError> {
        let json: Vec<u8> =
            serde_json::to_vec(record).map_err(|e| ManifestError::corrupt(&self.path, e))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
        }
        write_synced(&self.path, &json)
    }

    /// Pending record, if a persist was interrupted.
    ///
    /// A log that does not parse was never completely renamed into place
    /// or was damaged afterwards; it is discarded with a warning.
    pub fn read(&self) -> Result<Option<WalRecord>, ManifestError> {
        let bytes: Vec<u8> = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ManifestError::io(&self.path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                log::warn!("Discarding unreadable manifest log {}: {}", self.path.display(), e);
                self.clear()?;
                Ok(None)
            }
        }
    }

    /// Remove the log after every shard it names has been written.
    pub fn clear(&self) -> Result<(), ManifestError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ManifestError::io(&self.path, e)),
        }
    }

    /// Re-apply an interrupted persist for `dataset_id`, if one is pending.
    ///
    /// # Returns
    /// `true` if shards were rewritten.
    pub fn replay(&self, dataset_id: &str, manifest_dir: &Path) -> Result<bool, ManifestError> {
        let record: WalRecord = match self.read()? {
            Some(r) => r,
            None => return Ok(false),
        };
        if record.dataset_id != dataset_id {
            log::warn!(
                "Manifest log {} belongs to dataset {}, not {}; leaving it in place",
                self.path.display(),
                record.dataset_id,
                dataset_id
            );
            return Ok(false);
        }

        log::info!(
            "Replaying interrupted manifest persist for {} ({} shards)",
            dataset_id,
            record.shards.len()
        );
        write_shards(manifest_dir, &record.shards)?;
        self.clear()?;
        Ok(true)
    }
}

/// Write each shard's complete contents, replacing the file atomically.
pub fn write_shards(
    manifest_dir: &Path,
    shards: &BTreeMap<String, ShardContents>,
) -> Result<(), ManifestError> {
    std::fs::create_dir_all(manifest_dir).map_err(|e| ManifestError::io(manifest_dir, e))?;
    for (name, contents) in shards {
        let path: PathBuf = manifest_dir.join(name);
        let json: Vec<u8> =
            serde_json::to_vec(contents).map_err(|e| ManifestError::corrupt(&path, e))?;
        write_synced(&path, &json)?;
    }
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), ManifestError> {
    let tmp: PathBuf = path.with_extension("tmp");
    let mut file: std::fs::File =
        std::fs::File::create(&tmp).map_err(|e| ManifestError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| ManifestError::io(&tmp, e))?;
    file.sync_all().map_err(|e| ManifestError::io(&tmp, e))?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(|e| ManifestError::io(path, e))
}
