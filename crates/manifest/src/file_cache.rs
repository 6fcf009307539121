//! Sharded manifest storage with a fast cache in front.
//!
//! Entries live in JSON shard files under `<root>/manifest/`, one shard per
//! revision in which paths were first added. The merged view is served from
//! the [`ManifestCache`] when its signature still matches the shard files,
//! otherwise it is rebuilt from disk.
//!
//! Changes are applied to the in-memory view immediately and queued as
//! [`PersistTask`]s. [`ManifestFileCache::persist`] rewrites every affected
//! shard in full, logging the intended contents to the write-ahead log
//! first, and only then refreshes the fast cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dataset_sync_common::MANIFEST_DIR_NAME;

use crate::cache::{shard_signature, ManifestCache};
use crate::context::DatasetRepository;
use crate::entry::{
    is_shard_file_name, shard_file_name, ManifestEntry, PersistTask, ShardContents,
    LEGACY_SHARD_NAME,
};
use crate::error::ManifestError;
use crate::legacy::{legacy_is_active, read_legacy_manifest};
use crate::wal::{write_shards, WalRecord, WriteAheadLog};

/// Merged manifest keyed by path.
pub type ManifestMap = BTreeMap<String, ManifestEntry>;

/// Durable path-to-entry store for one dataset revision.
pub struct ManifestFileCache {
    dataset_id: String,
    manifest_dir: PathBuf,
    revision: String,
    link_id: Option<String>,
    cache: ManifestCache,
    wal: WriteAheadLog,
    manifest: Option<ManifestMap>,
    tasks: Vec<PersistTask>,
}

impl ManifestFileCache {
    /// Open the manifest for the repository's current revision.
    ///
    /// An interrupted persist found in the write-ahead log is replayed
    /// before anything is read.
    ///
    /// # Arguments
    /// * `repository` - Supplies the dataset root, cache root and revision
    /// * `cache` - Fast cache shared with other manifests
    pub async fn open(
        repository: &dyn DatasetRepository,
        cache: ManifestCache,
    ) -> Result<Self, ManifestError> {
        let file_cache: ManifestFileCache = Self {
            dataset_id: repository.dataset_id().to_string(),
            manifest_dir: repository.root_dir().join(MANIFEST_DIR_NAME),
            revision: repository.revision(),
            link_id: repository.link_id(),
            cache,
            wal: WriteAheadLog::new(repository.cache_root()),
            manifest: None,
            tasks: Vec::new(),
        };
        file_cache.replay_wal().await?;
        Ok(file_cache)
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn link_id(&self) -> Option<&str> {
        self.link_id.as_deref()
    }

    pub fn manifest_dir(&self) -> &Path {
        &self.manifest_dir
    }

    /// Shard that receives paths added in the current revision.
    pub fn current_shard_file(&self) -> String {
        shard_file_name(&self.revision)
    }

    pub fn cache_key(&self) -> String {
        ManifestCache::key(&self.dataset_id, &self.revision, self.link_id.as_deref())
    }

    /// Changes queued since the last persist.
    pub fn pending_tasks(&self) -> &[PersistTask] {
        &self.tasks
    }

    /// Merged manifest for the current revision.
    ///
    /// # Errors
    /// Returns `Corrupt` if a shard file cannot be parsed.
    pub async fn get_manifest(&mut self) -> Result<&ManifestMap, ManifestError> {
        let manifest: &mut ManifestMap = self.loaded().await?;
        Ok(manifest)
    }

    /// Entry for one path.
    pub async fn get(&mut self, path: &str) -> Result<Option<ManifestEntry>, ManifestError> {
        Ok(self.get_manifest().await?.get(path).cloned())
    }

    /// Stage a new or changed entry.
    ///
    /// A tracked path keeps its shard; a new path goes to the current
    /// revision's shard.
    pub async fn add_or_update(
        &mut self,
        path: &str,
        content_hash: &str,
        modified_on: &str,
        num_bytes: &str,
    ) -> Result<ManifestEntry, ManifestError> {
        let current_shard: String = self.current_shard_file();
        let manifest: &mut ManifestMap = self.loaded().await?;

        let (shard_file, is_update): (String, bool) = match manifest.get(path) {
            Some(existing) => (existing.shard_file.clone(), true),
            None => (current_shard, false),
        };
        let entry: ManifestEntry = ManifestEntry {
            relative_path: path.to_string(),
            content_hash: content_hash.to_string(),
            modified_on: modified_on.to_string(),
            num_bytes: num_bytes.to_string(),
            shard_file,
        };
        manifest.insert(path.to_string(), entry.clone());

        let task: PersistTask = if is_update {
            PersistTask::Update(entry.clone())
        } else {
            PersistTask::Add(entry.clone())
        };
        self.tasks.push(task);
        Ok(entry)
    }

    /// Stage removal of a path.
    ///
    /// # Returns
    /// The removed entry, or `None` if the path was not tracked.
    pub async fn remove(&mut self, path: &str) -> Result<Option<ManifestEntry>, ManifestError> {
        let manifest: &mut ManifestMap = self.loaded().await?;
        let removed: Option<ManifestEntry> = manifest.remove(path);
        if let Some(entry) = &removed {
            self.tasks.push(PersistTask::Delete {
                relative_path: entry.relative_path.clone(),
                shard_file: entry.shard_file.clone(),
            });
        }
        Ok(removed)
    }

    /// Write every queued change to its shard, then refresh the fast cache.
    ///
    /// With nothing queued this touches no file. On failure the in-memory
    /// manifest and the cache entry are dropped, and any shards the
    /// write-ahead log still names are rewritten on the next load.
    ///
    /// # Errors
    /// Returns `Persist` wrapping the underlying failure.
    pub async fn persist(&mut self) -> Result<(), ManifestError> {
        if self.tasks.is_empty() {
            return Ok(());
        }

        let tasks: Vec<PersistTask> = std::mem::take(&mut self.tasks);
        match self.write_tasks(&tasks).await {
            Ok(()) => {
                log::debug!(
                    "Persisted {} manifest changes for {}@{}",
                    tasks.len(),
                    self.dataset_id,
                    self.revision
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Manifest persist failed for {}: {}", self.dataset_id, e);
                self.manifest = None;
                self.cache.evict(&self.cache_key()).await;
                Err(ManifestError::Persist {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Drop the cached and in-memory manifest so the next read rebuilds it.
    pub async fn evict(&mut self) {
        if !self.tasks.is_empty() {
            log::warn!(
                "Discarding {} unpersisted manifest changes for {}",
                self.tasks.len(),
                self.dataset_id
            );
            self.tasks.clear();
        }
        self.manifest = None;
        self.cache.evict(&self.cache_key()).await;
    }

    /// Switch to another revision or link context.
    ///
    /// The old revision's cache entry is evicted.
    pub async fn set_revision(&mut self, revision: String, link_id: Option<String>) {
        self.evict().await;
        self.revision = revision;
        self.link_id = link_id;
    }

    async fn loaded(&mut self) -> Result<&mut ManifestMap, ManifestError> {
        let manifest: ManifestMap = match self.manifest.take() {
            Some(m) => m,
            None => self.load().await?,
        };
        Ok(self.manifest.insert(manifest))
    }

    async fn load(&self) -> Result<ManifestMap, ManifestError> {
        self.replay_wal().await?;

        let key: String = self.cache_key();
        let signature: String = shard_signature(&self.manifest_dir)?;
        if let Some(manifest) = self.cache.load(&key, &signature).await {
            return Ok(manifest);
        }

        let manifest: ManifestMap = read_shards(&self.manifest_dir)?;
        self.cache.store(&key, &signature, &manifest).await;
        Ok(manifest)
    }

    async fn replay_wal(&self) -> Result<(), ManifestError> {
        if self.wal.replay(&self.dataset_id, &self.manifest_dir)? {
            self.cache.evict(&self.cache_key()).await;
        }
        Ok(())
    }

    async fn write_tasks(&self, tasks: &[PersistTask]) -> Result<(), ManifestError> {
        let mut grouped: BTreeMap<&str, Vec<&PersistTask>> = BTreeMap::new();
        for task in tasks {
            grouped.entry(task.shard_file()).or_default().push(task);
        }

        let mut shards: BTreeMap<String, ShardContents> = BTreeMap::new();
        for (shard, shard_tasks) in grouped {
            let mut contents: ShardContents =
                if shard == LEGACY_SHARD_NAME && legacy_is_active(&self.manifest_dir) {
                    read_legacy_manifest(&self.manifest_dir)?.unwrap_or_default()
                } else {
                    read_shard(&self.manifest_dir.join(shard))?
                };
            for task in shard_tasks {
                task.apply(&mut contents);
            }
            shards.insert(shard.to_string(), contents);
        }

        self.wal.write(&WalRecord {
            dataset_id: self.dataset_id.clone(),
            revision: self.revision.clone(),
            shards: shards.clone(),
        })?;
        write_shards(&self.manifest_dir, &shards)?;
        self.wal.clear()?;

        if let Some(manifest) = &self.manifest {
            let signature: String = shard_signature(&self.manifest_dir)?;
            self.cache.store(&self.cache_key(), &signature, manifest).await;
        }
        Ok(())
    }
}

/// Read and merge the legacy file and every shard in a manifest directory.
///
/// The legacy file loads first, then shards in name order. A path declared
/// by more than one shard keeps the last one loaded and a warning is logged.
pub fn read_shards(manifest_dir: &Path) -> Result<ManifestMap, ManifestError> {
    let mut manifest: ManifestMap = ManifestMap::new();

    if let Some(legacy) = read_legacy_manifest(manifest_dir)? {
        merge_shard(&mut manifest, legacy, LEGACY_SHARD_NAME);
    }

    for name in shard_file_names(manifest_dir)? {
        let contents: ShardContents = read_shard(&manifest_dir.join(&name))?;
        merge_shard(&mut manifest, contents, &name);
    }
    Ok(manifest)
}

fn merge_shard(manifest: &mut ManifestMap, contents: ShardContents, shard_file: &str) {
    for (path, record) in contents {
        let entry: ManifestEntry = ManifestEntry::from_record(path.clone(), record, shard_file);
        if let Some(previous) = manifest.insert(path, entry) {
            log::warn!(
                "{} is declared in both {} and {}; using {}",
                previous.relative_path,
                previous.shard_file,
                shard_file,
                shard_file
            );
        }
    }
}

fn shard_file_names(manifest_dir: &Path) -> Result<Vec<String>, ManifestError> {
    let read_dir = match std::fs::read_dir(manifest_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ManifestError::io(manifest_dir, e)),
    };
    let mut names: Vec<String> = Vec::new();
    for item in read_dir {
        let item: std::fs::DirEntry = item.map_err(|e| ManifestError::io(manifest_dir, e))?;
        let name: String = item.file_name().to_string_lossy().into_owned();
        if is_shard_file_name(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn read_shard(path: &Path) -> Result<ShardContents, ManifestError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ManifestError::corrupt(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ShardContents::new()),
        Err(e) => Err(ManifestError::io(path, e)),
    }
}
