//! Per-revision view of a dataset combining the manifest with the working tree.
//!
//! A [`Manifest`] owns the sharded [`ManifestFileCache`], the fingerprint
//! table of the current revision directory and the object store. It diffs
//! the working tree against the manifest, moves changed files into the
//! object store, stages them for upload and commits the result through the
//! repository.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use dataset_sync_common::{
    directory_hash, from_posix_path, is_directory_key, parent_directory_keys,
    system_time_to_iso_string, CountProgress, ProgressCallback, SyncSettings, DIRECTORY_NUM_BYTES,
};
use dataset_sync_filesystem::{walk_revision_dir, GlobFilter, HashBatchResult, SmartHash, WalkEntry};

use crate::activity::{ActivityRecord, UpdateSummary};
use crate::cache::ManifestCache;
use crate::context::{DatasetRepository, RepositoryLock};
use crate::entry::ManifestEntry;
use crate::error::ManifestError;
use crate::file_cache::{ManifestFileCache, ManifestMap};
use crate::objects::ObjectStore;
use crate::refcount::RefCountTable;
use crate::status::StatusResult;

/// Manifest of one dataset at its current revision.
pub struct Manifest {
    repository: Arc<dyn DatasetRepository>,
    file_cache: ManifestFileCache,
    smarthash: SmartHash,
    objects: ObjectStore,
    settings: SyncSettings,
    revision: String,
}

impl Manifest {
    /// Open the manifest for the repository's current revision.
    ///
    /// A revision directory that does not exist yet is materialized from
    /// the object store.
    ///
    /// # Arguments
    /// * `repository` - Repository supplying revision, locking and activity log
    /// * `cache` - Fast manifest cache
    /// * `settings` - Concurrency and cache settings
    pub async fn open(
        repository: Arc<dyn DatasetRepository>,
        cache: ManifestCache,
        settings: SyncSettings,
    ) -> Result<Self, ManifestError> {
        let revision: String = repository.revision();
        let objects: ObjectStore = ObjectStore::new(repository.cache_root());
        let revision_dir: PathBuf = objects.revision_dir(&revision);
        let fresh: bool = !revision_dir.exists();
        std::fs::create_dir_all(&revision_dir).map_err(|e| ManifestError::io(&revision_dir, e))?;

        let file_cache: ManifestFileCache = ManifestFileCache::open(&*repository, cache).await?;
        let smarthash: SmartHash = SmartHash::new(&revision_dir, settings.hash_concurrency);

        let mut manifest: Manifest = Self {
            repository,
            file_cache,
            smarthash,
            objects,
            settings,
            revision,
        };
        if fresh {
            manifest.link_revision().await?;
            manifest.fingerprint_tracked().await?;
        }
        Ok(manifest)
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn dataset_id(&self) -> &str {
        self.repository.dataset_id()
    }

    pub fn repository(&self) -> &Arc<dyn DatasetRepository> {
        &self.repository
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Working tree of the current revision.
    pub fn current_revision_dir(&self) -> PathBuf {
        self.objects.revision_dir(&self.revision)
    }

    /// Follow the repository to a new revision or link context.
    ///
    /// # Returns
    /// `true` if anything changed.
    pub async fn refresh_revision(&mut self) -> Result<bool, ManifestError> {
        let revision: String = self.repository.revision();
        let link_id: Option<String> = self.repository.link_id();
        if revision == self.revision && link_id.as_deref() == self.file_cache.link_id() {
            return Ok(false);
        }
        log::debug!(
            "Manifest for {} moving from revision {} to {}",
            self.dataset_id(),
            self.revision,
            revision
        );
        self.switch_revision(revision).await?;
        Ok(true)
    }

    /// Every tracked entry, ordered by path.
    pub async fn entries(&mut self) -> Result<&ManifestMap, ManifestError> {
        self.file_cache.get_manifest().await
    }

    pub async fn get(&mut self, path: &str) -> Result<Option<ManifestEntry>, ManifestError> {
        self.file_cache.get(path).await
    }

    /// One page of entries in path order.
    pub async fn list(
        &mut self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ManifestEntry>, ManifestError> {
        let manifest: &ManifestMap = self.file_cache.get_manifest().await?;
        Ok(manifest.values().skip(offset).take(limit).cloned().collect())
    }

    /// Location of the object backing a tracked path.
    ///
    /// # Errors
    /// Returns `NotFound` if the path is not tracked.
    pub async fn dataset_to_object_path(&mut self, path: &str) -> Result<PathBuf, ManifestError> {
        match self.file_cache.get(path).await? {
            Some(entry) => Ok(self.objects.object_path(&entry.content_hash)),
            None => Err(ManifestError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    /// Diff the working tree against the manifest.
    ///
    /// Created paths are untracked ones. A tracked file whose fingerprint
    /// changed is hashed, and only counts as modified if its content hash
    /// differs; the computed hash travels with the result. Deleted paths are
    /// tracked ones missing from disk.
    pub async fn status(&mut self) -> Result<StatusResult, ManifestError> {
        let revision_dir: PathBuf = self.current_revision_dir();
        let filter: GlobFilter = GlobFilter::for_dataset(self.repository.root_dir())?;
        let walked: Vec<WalkEntry> = walk_revision_dir(&revision_dir, &filter)?;
        let manifest: &ManifestMap = self.file_cache.get_manifest().await?;

        let mut created: Vec<String> = Vec::new();
        let mut candidates: Vec<String> = Vec::new();
        let mut on_disk: HashSet<&str> = HashSet::with_capacity(walked.len());
        for item in &walked {
            on_disk.insert(item.key.as_str());
            if !manifest.contains_key(&item.key) {
                created.push(item.key.clone());
            } else if !item.is_dir && self.smarthash.has_changed_fast(&item.key) {
                candidates.push(item.key.clone());
            }
        }

        let deleted: Vec<String> = manifest
            .keys()
            .filter(|key: &&String| !on_disk.contains(key.as_str()))
            .cloned()
            .collect();

        let hashed: HashBatchResult = self.smarthash.hash_partial(&candidates).await;
        let mut modified: Vec<String> = Vec::new();
        let mut touched: Vec<String> = Vec::new();
        let mut hashes: BTreeMap<String, String> = BTreeMap::new();
        for key in candidates {
            match hashed.hashes.get(&key) {
                Some(hash) if manifest.get(&key).map(|e| &e.content_hash) == Some(hash) => {
                    touched.push(key);
                }
                Some(hash) => {
                    hashes.insert(key.clone(), hash.clone());
                    modified.push(key);
                }
                None => modified.push(key),
            }
        }

        let mut status: StatusResult = StatusResult::new(created, modified, deleted);
        for (key, hash) in hashes {
            status.set_hash(key, hash);
        }
        for key in touched {
            status.push_touched(key);
        }
        Ok(status)
    }

    /// Hash every created or modified path the status has no hash for yet.
    ///
    /// # Errors
    /// Returns error on the first file that cannot be hashed.
    pub async fn hash_pending(&self, status: &mut StatusResult) -> Result<(), ManifestError> {
        let unhashed: Vec<String> = status.unhashed();
        if unhashed.is_empty() {
            return Ok(());
        }
        let hashes: Vec<String> = self.smarthash.hash(&unhashed).await?;
        for (key, hash) in unhashed.into_iter().zip(hashes) {
            status.set_hash(key, hash);
        }
        Ok(())
    }

    /// Apply a status to the manifest and the object store.
    ///
    /// Untracked parent directories of created paths are added first.
    /// Created and modified files move into the object store and are staged
    /// for upload unless the remote already holds them; objects whose last
    /// reference goes away are deleted along with their staging markers.
    /// Changes are queued, not persisted.
    ///
    /// # Arguments
    /// * `lock` - Held repository lock for this dataset
    /// * `status` - Classification to apply, with hashes for every changed file
    ///
    /// # Errors
    /// Returns `LockNotHeld` for another dataset's lock and `MissingHash`
    /// for a changed file without a content hash.
    pub async fn update(
        &mut self,
        lock: &RepositoryLock,
        status: &StatusResult,
    ) -> Result<UpdateSummary, ManifestError> {
        if lock.dataset_id() != self.repository.dataset_id() {
            return Err(ManifestError::LockNotHeld {
                expected: self.repository.dataset_id().to_string(),
            });
        }

        let revision: String = self.revision.clone();
        let revision_dir: PathBuf = self.current_revision_dir();
        let before: ManifestMap = self.file_cache.get_manifest().await?.clone();
        let mut refcounts: RefCountTable = RefCountTable::load(&self.objects.refcount_file())?;
        let mut summary: UpdateSummary = UpdateSummary::default();

        let mut created: BTreeSet<String> = status.created.iter().cloned().collect();
        for key in &status.created {
            for parent in parent_directory_keys(key) {
                if !before.contains_key(&parent) {
                    created.insert(parent);
                }
            }
        }

        let changed = created
            .iter()
            .map(|k: &String| (k, false))
            .chain(status.modified.iter().map(|k: &String| (k, true)));
        for (key, is_modification) in changed {
            let content_hash: String = if is_directory_key(key) {
                directory_hash()
            } else {
                status
                    .hash_of(key)
                    .ok_or_else(|| ManifestError::MissingHash { path: key.clone() })?
                    .to_string()
            };

            let path: PathBuf = from_posix_path(key, &revision_dir);
            let metadata: std::fs::Metadata =
                std::fs::metadata(&path).map_err(|e| ManifestError::io(&path, e))?;
            let modified_on: String = match metadata.modified() {
                Ok(t) => system_time_to_iso_string(t),
                Err(_) => dataset_sync_common::now_iso_string(),
            };
            let num_bytes: String = if metadata.is_dir() {
                DIRECTORY_NUM_BYTES.to_string()
            } else {
                metadata.len().to_string()
            };

            let already_stored: bool = self.objects.has_object(&content_hash);
            if metadata.is_dir() {
                self.objects.write_directory_object(&content_hash)?;
            } else {
                self.objects.store_file(&path, &content_hash)?;
            }
            refcounts.add(&content_hash, &revision, key);
            // A stored object without a marker is already on the remote.
            if !already_stored || self.objects.is_staged(&content_hash)? {
                self.objects.stage_push(&revision, &content_hash, key)?;
            }

            if is_modification {
                if let Some(old) = before.get(key) {
                    if old.content_hash != content_hash {
                        self.release(&mut refcounts, &old.content_hash, key)?;
                    }
                }
            }

            let entry: ManifestEntry = self
                .file_cache
                .add_or_update(key, &content_hash, &modified_on, &num_bytes)
                .await?;
            if is_modification {
                summary.modified.push(entry);
            } else {
                summary.created.push(entry);
            }
        }

        for key in &status.deleted {
            let old: ManifestEntry = match self.file_cache.remove(key).await? {
                Some(entry) => entry,
                None => continue,
            };
            self.release(&mut refcounts, &old.content_hash, key)?;
            summary.deleted.push(old);
        }

        refcounts.save(&self.objects.refcount_file())?;

        let mut refreshed: Vec<String> = status.changed_paths();
        refreshed.extend(created.iter().filter(|k| is_directory_key(k)).cloned());
        refreshed.extend(status.touched().iter().cloned());
        refreshed.sort();
        refreshed.dedup();
        self.smarthash.fast_hash(&refreshed, false)?;
        self.smarthash.forget(&status.deleted);
        self.smarthash.save()?;

        log::info!(
            "Updated manifest for {}@{}: {} created, {} modified, {} deleted",
            self.dataset_id(),
            revision,
            summary.created.len(),
            summary.modified.len(),
            summary.deleted.len()
        );
        Ok(summary)
    }

    /// Write queued manifest changes to disk.
    pub async fn persist(&mut self) -> Result<(), ManifestError> {
        self.file_cache.persist().await
    }

    /// Materialize the current revision directory from the object store.
    ///
    /// Missing tracked files are linked in from their objects and every
    /// entry is referenced from this revision. Files already present are
    /// left alone; entries whose object has not been pulled yet are skipped.
    pub async fn link_revision(&mut self) -> Result<(), ManifestError> {
        let revision_dir: PathBuf = self.current_revision_dir();
        let manifest: &ManifestMap = self.file_cache.get_manifest().await?;
        let mut refcounts: RefCountTable = RefCountTable::load(&self.objects.refcount_file())?;

        let mut linked: usize = 0;
        for entry in manifest.values() {
            let dest: PathBuf = from_posix_path(&entry.relative_path, &revision_dir);
            if entry.is_dir() {
                std::fs::create_dir_all(&dest).map_err(|e| ManifestError::io(&dest, e))?;
            } else if !dest.exists() {
                match self.objects.link_into(&entry.content_hash, &dest) {
                    Ok(()) => linked += 1,
                    Err(ManifestError::NotFound { .. }) => {
                        log::debug!(
                            "Object for {} not present locally; not linked",
                            entry.relative_path
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            refcounts.add(&entry.content_hash, &self.revision, &entry.relative_path);
        }

        refcounts.save(&self.objects.refcount_file())?;
        log::debug!(
            "Linked {} objects into {}",
            linked,
            revision_dir.display()
        );
        Ok(())
    }

    /// Commit every change in the working tree.
    ///
    /// Runs status, hashing, update and persist under the repository lock,
    /// records the activity and moves to the revision the repository
    /// returns.
    ///
    /// # Returns
    /// The activity record, or `None` if nothing changed.
    pub async fn sweep_all_changes(
        &mut self,
        message: Option<&str>,
    ) -> Result<Option<ActivityRecord>, ManifestError> {
        let repository: Arc<dyn DatasetRepository> = Arc::clone(&self.repository);
        let lock: RepositoryLock = repository.lock().await;
        self.refresh_revision().await?;

        let mut status: StatusResult = self.status().await?;
        if status.is_empty() {
            if !status.touched().is_empty() {
                self.smarthash.fast_hash(status.touched(), true)?;
            }
            return Ok(None);
        }

        self.hash_pending(&mut status).await?;
        let record: ActivityRecord = self.commit(&lock, &status, message).await?;
        Ok(Some(record))
    }

    /// Commit a status whose hashes were computed elsewhere.
    ///
    /// # Errors
    /// Returns `MissingHash` if a changed file has no hash and
    /// `RevisionChanged` if another commit landed after the status was taken.
    pub async fn apply_status(
        &mut self,
        status: &StatusResult,
        message: Option<&str>,
    ) -> Result<Option<ActivityRecord>, ManifestError> {
        let repository: Arc<dyn DatasetRepository> = Arc::clone(&self.repository);
        let lock: RepositoryLock = repository.lock().await;
        self.apply_status_locked(&lock, status, message).await
    }

    /// Commit a status under a lock the caller took before computing it.
    ///
    /// Holding `lock` from status to commit keeps other handles from
    /// committing in between.
    ///
    /// # Errors
    /// Same as [`Manifest::apply_status`], plus `LockNotHeld` for another
    /// dataset's lock.
    pub async fn apply_status_locked(
        &mut self,
        lock: &RepositoryLock,
        status: &StatusResult,
        message: Option<&str>,
    ) -> Result<Option<ActivityRecord>, ManifestError> {
        if status.is_empty() {
            return Ok(None);
        }
        let record: ActivityRecord = self.commit(lock, status, message).await?;
        Ok(Some(record))
    }

    /// Track a new empty directory and commit it.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the directory is tracked already.
    pub async fn create_directory(&mut self, path: &str) -> Result<ManifestEntry, ManifestError> {
        let key: String = directory_key(path)?;
        let repository: Arc<dyn DatasetRepository> = Arc::clone(&self.repository);
        let lock: RepositoryLock = repository.lock().await;
        self.refresh_revision().await?;

        if self.file_cache.get(&key).await?.is_some() {
            return Err(ManifestError::AlreadyExists { path: key });
        }
        let dir: PathBuf = from_posix_path(&key, &self.current_revision_dir());
        std::fs::create_dir_all(&dir).map_err(|e| ManifestError::io(&dir, e))?;

        let status: StatusResult = StatusResult::new(vec![key.clone()], Vec::new(), Vec::new());
        let message: String = format!("Created directory {}", key);
        let record: ActivityRecord = self.commit(&lock, &status, Some(&message)).await?;
        log::debug!("{}", record.message);

        self.file_cache
            .get(&key)
            .await?
            .ok_or_else(|| ManifestError::NotFound { path: key.clone() })
    }

    /// Delete tracked paths from the working tree and commit.
    ///
    /// Directories are deleted with everything beneath them.
    ///
    /// # Errors
    /// Returns `NotFound` if any path is not tracked; nothing is deleted then.
    pub async fn delete(&mut self, paths: &[String]) -> Result<ActivityRecord, ManifestError> {
        let repository: Arc<dyn DatasetRepository> = Arc::clone(&self.repository);
        let lock: RepositoryLock = repository.lock().await;
        self.refresh_revision().await?;
        let revision_dir: PathBuf = self.current_revision_dir();
        let manifest: &ManifestMap = self.file_cache.get_manifest().await?;

        let mut deleted: BTreeSet<String> = BTreeSet::new();
        for path in paths {
            if !manifest.contains_key(path) {
                return Err(ManifestError::NotFound { path: path.clone() });
            }
            if is_directory_key(path) {
                deleted.extend(
                    manifest
                        .range(path.clone()..)
                        .take_while(|(k, _)| k.starts_with(path.as_str()))
                        .map(|(k, _)| k.clone()),
                );
            } else {
                deleted.insert(path.clone());
            }
        }

        for path in paths {
            let target: PathBuf = from_posix_path(path, &revision_dir);
            let removed: std::io::Result<()> = if is_directory_key(path) {
                std::fs::remove_dir_all(&target)
            } else {
                std::fs::remove_file(&target)
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ManifestError::io(&target, e)),
            }
        }

        let status: StatusResult =
            StatusResult::new(Vec::new(), Vec::new(), deleted.into_iter().collect());
        let message: String = format!("Deleted {} path(s)", paths.len());
        self.commit(&lock, &status, Some(&message)).await
    }

    /// Move or rename a tracked file or directory and commit.
    ///
    /// # Arguments
    /// * `src` - Tracked key to move
    /// * `dst` - New key; a directory key gets a trailing `/` if missing
    ///
    /// # Errors
    /// Returns `NotFound` for an untracked source and `AlreadyExists` if
    /// the destination is taken.
    pub async fn move_path(&mut self, src: &str, dst: &str) -> Result<ActivityRecord, ManifestError> {
        let repository: Arc<dyn DatasetRepository> = Arc::clone(&self.repository);
        let lock: RepositoryLock = repository.lock().await;
        self.refresh_revision().await?;
        let revision_dir: PathBuf = self.current_revision_dir();
        let manifest: &ManifestMap = self.file_cache.get_manifest().await?;

        if !manifest.contains_key(src) {
            return Err(ManifestError::NotFound {
                path: src.to_string(),
            });
        }
        let dst_key: String = if is_directory_key(src) {
            directory_key(dst)?
        } else {
            file_key(dst)?
        };
        if manifest.contains_key(&dst_key) || from_posix_path(&dst_key, &revision_dir).exists() {
            return Err(ManifestError::AlreadyExists { path: dst_key });
        }
        if is_directory_key(src) && dst_key.starts_with(src) {
            return Err(ManifestError::InvalidPath {
                path: dst_key,
                message: format!("cannot move {} into itself", src),
            });
        }

        let moved: Vec<(String, String)> = manifest
            .range(src.to_string()..)
            .take_while(|(k, _)| k.as_str() == src || (is_directory_key(src) && k.starts_with(src)))
            .map(|(k, entry)| {
                let new_key: String = format!("{}{}", dst_key, &k[src.len()..]);
                (new_key, entry.content_hash.clone())
            })
            .collect();
        let old_keys: Vec<String> = manifest
            .range(src.to_string()..)
            .take_while(|(k, _)| k.as_str() == src || (is_directory_key(src) && k.starts_with(src)))
            .map(|(k, _)| k.clone())
            .collect();

        let from: PathBuf = from_posix_path(src, &revision_dir);
        let to: PathBuf = from_posix_path(&dst_key, &revision_dir);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
        }
        std::fs::rename(&from, &to).map_err(|e| ManifestError::io(&from, e))?;

        let mut status: StatusResult = StatusResult::new(
            moved.iter().map(|(k, _)| k.clone()).collect(),
            Vec::new(),
            old_keys,
        );
        for (key, hash) in moved {
            if !is_directory_key(&key) {
                status.set_hash(key, hash);
            }
        }
        let message: String = format!("Moved {} to {}", src, dst_key);
        self.commit(&lock, &status, Some(&message)).await
    }

    /// Re-hash every tracked file present locally and report mismatches.
    ///
    /// Unreadable files count as mismatches. Returning `false` from the
    /// progress callback stops after the current chunk.
    ///
    /// # Returns
    /// Paths whose contents no longer match the manifest, sorted.
    pub async fn verify_contents(
        &mut self,
        progress: &dyn ProgressCallback<CountProgress>,
    ) -> Result<Vec<String>, ManifestError> {
        let revision_dir: PathBuf = self.current_revision_dir();
        let expected: Vec<(String, String)> = self
            .file_cache
            .get_manifest()
            .await?
            .values()
            .filter(|e| !e.is_dir() && from_posix_path(&e.relative_path, &revision_dir).is_file())
            .map(|e| (e.relative_path.clone(), e.content_hash.clone()))
            .collect();

        let total: u64 = expected.len() as u64;
        let chunk_size: usize = self.settings.hash_concurrency.max(1) * 4;
        let mut mismatched: Vec<String> = Vec::new();
        let mut completed: u64 = 0;

        for chunk in expected.chunks(chunk_size) {
            let keys: Vec<String> = chunk.iter().map(|(k, _)| k.clone()).collect();
            let hashed: HashBatchResult = self.smarthash.hash_partial(&keys).await;
            for (key, hash) in chunk {
                if hashed.hashes.get(key) != Some(hash) {
                    mismatched.push(key.clone());
                }
            }
            completed += chunk.len() as u64;
            if !progress.on_progress(&CountProgress::new(completed, total)) {
                log::info!("Content verification cancelled at {}/{}", completed, total);
                break;
            }
        }

        mismatched.sort();
        if !mismatched.is_empty() {
            log::warn!(
                "{} file(s) in {} no longer match the manifest",
                mismatched.len(),
                self.dataset_id()
            );
        }
        Ok(mismatched)
    }

    /// Refresh fingerprints of tracked paths after they were written.
    pub fn fingerprint(&mut self, keys: &[String]) -> Result<(), ManifestError> {
        self.smarthash.fast_hash(keys, true)?;
        Ok(())
    }

    /// Forget every fingerprint so the next status hashes all tracked files.
    pub async fn forget_fingerprints(&mut self) -> Result<(), ManifestError> {
        let keys: Vec<String> = self.file_cache.get_manifest().await?.keys().cloned().collect();
        self.smarthash.forget(&keys);
        self.smarthash.save()?;
        Ok(())
    }

    async fn commit(
        &mut self,
        lock: &RepositoryLock,
        status: &StatusResult,
        message: Option<&str>,
    ) -> Result<ActivityRecord, ManifestError> {
        let current: String = self.repository.revision();
        if current != self.revision {
            return Err(ManifestError::RevisionChanged {
                expected: self.revision.clone(),
                actual: current,
            });
        }
        let summary: UpdateSummary = self.update(lock, status).await?;
        self.persist().await?;

        let record: ActivityRecord = ActivityRecord::from_summary(&summary, &self.revision, message);
        let next: String = self.repository.create_activity_record(&record).await?;
        let previous: String = self.revision.clone();
        self.switch_revision(next).await?;
        if previous != self.revision {
            self.drop_revision_refs(&previous)?;
        }
        Ok(record)
    }

    async fn switch_revision(&mut self, revision: String) -> Result<(), ManifestError> {
        self.file_cache
            .set_revision(revision.clone(), self.repository.link_id())
            .await;
        self.revision = revision;

        let revision_dir: PathBuf = self.current_revision_dir();
        std::fs::create_dir_all(&revision_dir).map_err(|e| ManifestError::io(&revision_dir, e))?;
        self.smarthash.set_revision_dir(&revision_dir);

        self.link_revision().await?;
        self.fingerprint_tracked().await
    }

    /// Release the references of the revision a commit superseded.
    ///
    /// Entries carried into the new revision were re-referenced by
    /// [`Manifest::link_revision`]; objects only the old revision held are
    /// deleted with their push markers. Revisions left by a checkout keep
    /// their references.
    fn drop_revision_refs(&self, revision: &str) -> Result<(), ManifestError> {
        let mut refcounts: RefCountTable = RefCountTable::load(&self.objects.refcount_file())?;
        let orphaned: Vec<String> = refcounts.drop_revision(revision);
        for content_hash in &orphaned {
            log::debug!("Deleting object {} left behind by revision {}", content_hash, revision);
            self.objects.delete_object(content_hash)?;
            self.objects.purge_push_markers(content_hash)?;
        }
        refcounts.save(&self.objects.refcount_file())
    }

    async fn fingerprint_tracked(&mut self) -> Result<(), ManifestError> {
        let revision_dir: PathBuf = self.current_revision_dir();
        let present: Vec<String> = self
            .file_cache
            .get_manifest()
            .await?
            .keys()
            .filter(|k| from_posix_path(k, &revision_dir).exists())
            .cloned()
            .collect();
        self.smarthash.fast_hash(&present, true)?;
        Ok(())
    }

    fn release(
        &self,
        refcounts: &mut RefCountTable,
        content_hash: &str,
        key: &str,
    ) -> Result<(), ManifestError> {
        self.objects.unstage_path(content_hash, key)?;
        if refcounts.remove(content_hash, &self.revision, key) {
            log::debug!("Deleting unreferenced object {}", content_hash);
            self.objects.delete_object(content_hash)?;
            self.objects.purge_push_markers(content_hash)?;
        }
        Ok(())
    }
}

fn file_key(path: &str) -> Result<String, ManifestError> {
    let trimmed: &str = path.trim_matches('/');
    validate_key(path, trimmed)?;
    Ok(trimmed.to_string())
}

fn directory_key(path: &str) -> Result<String, ManifestError> {
    let trimmed: &str = path.trim_matches('/');
    validate_key(path, trimmed)?;
    Ok(format!("{}/", trimmed))
}

fn validate_key(original: &str, trimmed: &str) -> Result<(), ManifestError> {
    let bad_segment: bool = trimmed
        .split('/')
        .any(|s: &str| s.is_empty() || s == "." || s == "..");
    if trimmed.is_empty() || bad_segment || trimmed.contains('\\') {
        return Err(ManifestError::InvalidPath {
            path: original.to_string(),
            message: "expected a relative path inside the dataset".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::StagedPush;
    use crate::standalone::StandaloneRepository;
    use dataset_sync_common::{hash_bytes, NoOpProgress};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: Arc<StandaloneRepository>,
        manifest: Manifest,
    }

    async fn fixture() -> Fixture {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let repo: Arc<StandaloneRepository> = Arc::new(
            StandaloneRepository::open(dir.path().join("ds"), dir.path().join("cache"), "ds-1")
                .unwrap(),
        );
        let manifest: Manifest = Manifest::open(
            repo.clone(),
            ManifestCache::in_memory(Duration::from_secs(3600)),
            SyncSettings::default().with_hash_concurrency(2),
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            repo,
            manifest,
        }
    }

    fn write(manifest: &Manifest, key: &str, contents: &[u8]) {
        let path: PathBuf = from_posix_path(key, &manifest.current_revision_dir());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_status_classifies_created_files_and_dirs() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "test1.txt", b"asdfadfsdf");
        std::fs::create_dir_all(fx.manifest.current_revision_dir().join("other_dir")).unwrap();

        let status: StatusResult = fx.manifest.status().await.unwrap();
        assert_eq!(status.created, vec!["other_dir/", "test1.txt"]);
        assert!(status.modified.is_empty());
        assert!(status.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_commits_and_advances_revision() {
        let mut fx: Fixture = fixture().await;
        let first: String = fx.manifest.revision().to_string();
        write(&fx.manifest, "test1.txt", b"asdfadfsdf");

        let record: ActivityRecord = fx
            .manifest
            .sweep_all_changes(None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.parent_revision, first);
        assert_eq!(record.num_created, 1);
        assert_ne!(fx.manifest.revision(), first);
        assert_eq!(fx.manifest.revision(), fx.repo.revision());

        let entry: ManifestEntry = fx.manifest.get("test1.txt").await.unwrap().unwrap();
        assert_eq!(entry.content_hash, hash_bytes(b"asdfadfsdf"));
        assert_eq!(entry.num_bytes, "10");
        assert!(fx.manifest.objects().has_object(&entry.content_hash));
        assert!(fx.manifest.current_revision_dir().join("test1.txt").is_file());

        assert!(fx.manifest.sweep_all_changes(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_modified_and_deleted_files() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "a.txt", b"one");
        write(&fx.manifest, "b.txt", b"two");
        fx.manifest.sweep_all_changes(None).await.unwrap();

        let a_path: PathBuf = fx.manifest.current_revision_dir().join("a.txt");
        std::fs::remove_file(&a_path).unwrap();
        std::fs::write(&a_path, b"one, changed").unwrap();
        std::fs::remove_file(fx.manifest.current_revision_dir().join("b.txt")).unwrap();

        let status: StatusResult = fx.manifest.status().await.unwrap();
        assert_eq!(status.modified, vec!["a.txt"]);
        assert_eq!(status.deleted, vec!["b.txt"]);
        assert_eq!(status.hash_of("a.txt"), Some(hash_bytes(b"one, changed").as_str()));

        let record: ActivityRecord = fx
            .manifest
            .sweep_all_changes(Some("edit"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.num_modified, 1);
        assert_eq!(record.num_deleted, 1);
        assert!(fx.manifest.get("b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touched_file_is_not_modified() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "a.txt", b"same");
        fx.manifest.sweep_all_changes(None).await.unwrap();

        let path: PathBuf = fx.manifest.current_revision_dir().join("a.txt");
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_500_000_000, 0))
            .unwrap();

        let status: StatusResult = fx.manifest.status().await.unwrap();
        assert!(status.is_empty());
        assert_eq!(status.touched(), ["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_update_infers_parent_directories() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "deep/nested/file.txt", b"x");

        let mut status: StatusResult =
            StatusResult::new(vec!["deep/nested/file.txt".to_string()], vec![], vec![]);
        fx.manifest.hash_pending(&mut status).await.unwrap();

        let lock: RepositoryLock = fx.repo.lock().await;
        let summary: UpdateSummary = fx.manifest.update(&lock, &status).await.unwrap();
        let created: Vec<&str> = summary
            .created
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect();
        assert_eq!(created, vec!["deep/", "deep/nested/", "deep/nested/file.txt"]);
        assert_eq!(summary.created[0].num_bytes, DIRECTORY_NUM_BYTES);
    }

    #[tokio::test]
    async fn test_update_rejects_foreign_lock_and_missing_hash() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "a.txt", b"x");
        let status: StatusResult = StatusResult::new(vec!["a.txt".to_string()], vec![], vec![]);

        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let other: StandaloneRepository =
            StandaloneRepository::open(dir.path().join("o"), dir.path().join("oc"), "other")
                .unwrap();
        let foreign: RepositoryLock = other.lock().await;
        assert!(matches!(
            fx.manifest.update(&foreign, &status).await,
            Err(ManifestError::LockNotHeld { .. })
        ));

        let lock: RepositoryLock = fx.repo.lock().await;
        assert!(matches!(
            fx.manifest.update(&lock, &status).await,
            Err(ManifestError::MissingHash { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_object_survives_one_deletion() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "a.txt", b"identical");
        write(&fx.manifest, "b.txt", b"identical");
        fx.manifest.sweep_all_changes(None).await.unwrap();
        let hash: String = hash_bytes(b"identical");

        fx.manifest.delete(&["a.txt".to_string()]).await.unwrap();
        assert!(fx.manifest.objects().has_object(&hash));
        assert!(fx.manifest.get("b.txt").await.unwrap().is_some());
        assert!(!fx.manifest.current_revision_dir().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_unreferenced_object_is_deleted() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "a.txt", b"short-lived");
        let lock: RepositoryLock = fx.repo.lock().await;
        let mut status: StatusResult = fx.manifest.status().await.unwrap();
        fx.manifest.hash_pending(&mut status).await.unwrap();
        fx.manifest.update(&lock, &status).await.unwrap();

        let hash: String = hash_bytes(b"short-lived");
        assert!(fx.manifest.objects().has_object(&hash));

        std::fs::remove_file(fx.manifest.current_revision_dir().join("a.txt")).unwrap();
        let status: StatusResult = fx.manifest.status().await.unwrap();
        assert_eq!(status.deleted, vec!["a.txt"]);
        fx.manifest.update(&lock, &status).await.unwrap();

        assert!(!fx.manifest.objects().has_object(&hash));
        assert!(fx.manifest.objects().staged_pushes().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_object_collected_after_many_commits() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "a.bin", b"doomed");
        fx.manifest.sweep_all_changes(None).await.unwrap();
        for i in 0..3 {
            write(&fx.manifest, &format!("x{}.bin", i), format!("extra {}", i).as_bytes());
            fx.manifest.sweep_all_changes(None).await.unwrap();
        }

        let refcounts: RefCountTable =
            RefCountTable::load(&fx.manifest.objects().refcount_file()).unwrap();
        let live: usize = fx.manifest.entries().await.unwrap().len();
        assert_eq!(refcounts.total_refs(), live);
        let hash: String = hash_bytes(b"doomed");
        assert_eq!(
            refcounts.references(&hash),
            vec![(fx.manifest.revision().to_string(), "a.bin".to_string())]
        );

        fx.manifest.delete(&["a.bin".to_string()]).await.unwrap();
        let objects: &ObjectStore = fx.manifest.objects();
        assert!(!objects.has_object(&hash));
        assert!(!objects.is_staged(&hash).unwrap());
        let refcounts: RefCountTable = RefCountTable::load(&objects.refcount_file()).unwrap();
        assert_eq!(refcounts.count(&hash), 0);
        assert_eq!(refcounts.total_refs(), 3);
    }

    #[tokio::test]
    async fn test_stale_status_is_rejected() {
        let mut fx: Fixture = fixture().await;
        let mut other: Manifest = Manifest::open(
            fx.repo.clone(),
            ManifestCache::in_memory(Duration::from_secs(3600)),
            SyncSettings::default(),
        )
        .await
        .unwrap();

        write(&fx.manifest, "mine.txt", b"mine");
        let mut status: StatusResult = fx.manifest.status().await.unwrap();
        fx.manifest.hash_pending(&mut status).await.unwrap();

        other.create_directory("theirs").await.unwrap();
        assert!(matches!(
            fx.manifest.apply_status(&status, None).await,
            Err(ManifestError::RevisionChanged { .. })
        ));
        assert!(fx.manifest.get("theirs/").await.unwrap().is_none());

        fx.manifest.refresh_revision().await.unwrap();
        assert!(fx.manifest.get("theirs/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_directory_and_move() {
        let mut fx: Fixture = fixture().await;
        let dir_entry: ManifestEntry = fx.manifest.create_directory("inputs").await.unwrap();
        assert_eq!(dir_entry.relative_path, "inputs/");
        assert!(matches!(
            fx.manifest.create_directory("inputs/").await,
            Err(ManifestError::AlreadyExists { .. })
        ));

        write(&fx.manifest, "inputs/data.csv", b"1,2,3");
        fx.manifest.sweep_all_changes(None).await.unwrap();

        fx.manifest.move_path("inputs/", "renamed").await.unwrap();
        assert!(fx.manifest.get("inputs/").await.unwrap().is_none());
        let moved: ManifestEntry = fx.manifest.get("renamed/data.csv").await.unwrap().unwrap();
        assert_eq!(moved.content_hash, hash_bytes(b"1,2,3"));
        assert!(fx.manifest.current_revision_dir().join("renamed/data.csv").is_file());

        assert!(matches!(
            fx.manifest.move_path("missing.txt", "x.txt").await,
            Err(ManifestError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_does_not_restage_pushed_objects() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "pushed.bin", b"already remote");
        write(&fx.manifest, "pending.bin", b"not yet remote");
        fx.manifest.sweep_all_changes(None).await.unwrap();

        let pushed: String = hash_bytes(b"already remote");
        let pending: String = hash_bytes(b"not yet remote");
        let objects: ObjectStore = fx.manifest.objects().clone();
        objects.purge_push_markers(&pushed).unwrap();

        fx.manifest.move_path("pushed.bin", "archive/pushed.bin").await.unwrap();
        fx.manifest.move_path("pending.bin", "archive/pending.bin").await.unwrap();

        assert!(!objects.is_staged(&pushed).unwrap());
        let staged: Vec<StagedPush> = objects.staged_pushes().unwrap();
        let for_pending: Vec<&StagedPush> =
            staged.iter().filter(|p| p.content_hash == pending).collect();
        assert_eq!(for_pending.len(), 1);
        assert_eq!(for_pending[0].dataset_paths, vec!["archive/pending.bin"]);
        assert!(objects.has_object(&pushed));
    }

    #[tokio::test]
    async fn test_delete_directory_recursively() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "d/one.txt", b"1");
        write(&fx.manifest, "d/sub/two.txt", b"2");
        write(&fx.manifest, "keep.txt", b"k");
        fx.manifest.sweep_all_changes(None).await.unwrap();

        let record: ActivityRecord = fx.manifest.delete(&["d/".to_string()]).await.unwrap();
        assert_eq!(record.num_deleted, 4);
        let remaining: Vec<ManifestEntry> = fx.manifest.list(0, 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].relative_path, "keep.txt");
    }

    #[tokio::test]
    async fn test_list_pages_in_path_order() {
        let mut fx: Fixture = fixture().await;
        for name in ["c.txt", "a.txt", "b.txt"] {
            write(&fx.manifest, name, name.as_bytes());
        }
        fx.manifest.sweep_all_changes(None).await.unwrap();

        let page: Vec<ManifestEntry> = fx.manifest.list(1, 1).await.unwrap();
        assert_eq!(page[0].relative_path, "b.txt");
        assert!(fx.manifest.list(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_contents_reports_drift() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "a.txt", b"original");
        write(&fx.manifest, "b.txt", b"untouched");
        fx.manifest.sweep_all_changes(None).await.unwrap();
        assert!(fx.manifest.verify_contents(&NoOpProgress).await.unwrap().is_empty());

        let path: PathBuf = fx.manifest.current_revision_dir().join("a.txt");
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"tampered").unwrap();
        assert_eq!(
            fx.manifest.verify_contents(&NoOpProgress).await.unwrap(),
            vec!["a.txt"]
        );
    }

    #[tokio::test]
    async fn test_dataset_to_object_path() {
        let mut fx: Fixture = fixture().await;
        write(&fx.manifest, "a.txt", b"abc");
        fx.manifest.sweep_all_changes(None).await.unwrap();

        let object: PathBuf = fx.manifest.dataset_to_object_path("a.txt").await.unwrap();
        assert_eq!(object, fx.manifest.objects().object_path(&hash_bytes(b"abc")));
        assert!(fx.manifest.dataset_to_object_path("nope").await.is_err());
    }

    #[test]
    fn test_key_validation() {
        assert_eq!(directory_key("/a/b/").unwrap(), "a/b/");
        assert_eq!(file_key("a/b.txt").unwrap(), "a/b.txt");
        assert!(directory_key("").is_err());
        assert!(file_key("a/../b").is_err());
    }
}
