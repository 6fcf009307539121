//! Sync frontier computation and transfer orchestration.
//!
//! The push markers under `objects/.push/` are the authoritative "needs
//! upload" signal. A marker is removed only after its object was uploaded,
//! so re-running a push after a partial failure retries exactly what is
//! left, and a push with no markers is a no-op.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use dataset_sync_common::{from_posix_path, hash_file, ProgressCallback};
use dataset_sync_manifest::{
    Manifest, ManifestEntry, ManifestError, ManifestMap, ObjectStore, StagedPush,
};

use crate::backend::{ManagedStorageBackend, StorageBackend};
use crate::error::StorageError;
use crate::transfer::BatchProgress;
use crate::types::{PullObject, PullResult, PushObject, PushResult, TransferProgress};

/// Drives transfers between a dataset's object store and its backend.
pub struct IOManager {
    backend: Box<dyn StorageBackend>,
}

impl IOManager {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Objects staged for upload that the current manifest still references.
    ///
    /// A staged object counts only where the current manifest maps the
    /// staged path to the staged hash, so objects staged on another branch
    /// do not leak into this one. The result is sorted by dataset path,
    /// then revision.
    ///
    /// # Arguments
    /// * `manifest` - Manifest of the dataset, refreshed to the repository's revision
    /// * `remove_duplicates` - Keep one object per content hash instead of one per path
    pub async fn objects_to_push(
        &self,
        manifest: &mut Manifest,
        remove_duplicates: bool,
    ) -> Result<Vec<PushObject>, StorageError> {
        manifest.refresh_revision().await?;
        let store: ObjectStore = manifest.objects().clone();
        let staged: Vec<StagedPush> = store.staged_pushes()?;
        let entries: &ManifestMap = manifest.entries().await?;

        let mut objects: Vec<PushObject> = Vec::new();
        for push in staged {
            for path in push.dataset_paths {
                let entry: &ManifestEntry = match entries.get(&path) {
                    Some(entry) if entry.content_hash == push.content_hash => entry,
                    _ => continue,
                };
                objects.push(PushObject {
                    object_path: store.object_path(&push.content_hash),
                    revision: push.revision.clone(),
                    size: entry.size().unwrap_or(0),
                    dataset_path: path,
                    content_hash: push.content_hash.clone(),
                });
            }
        }

        objects.sort_by(|a, b| {
            a.dataset_path
                .cmp(&b.dataset_path)
                .then_with(|| a.revision.cmp(&b.revision))
        });
        objects.dedup_by(|later, earlier| {
            later.dataset_path == earlier.dataset_path && later.content_hash == earlier.content_hash
        });
        if remove_duplicates {
            let mut seen: HashSet<String> = HashSet::new();
            objects.retain(|o| seen.insert(o.content_hash.clone()));
        }
        Ok(objects)
    }

    /// Number of objects `objects_to_push` would return.
    pub async fn num_objects_to_push(
        &self,
        manifest: &mut Manifest,
        remove_duplicates: bool,
    ) -> Result<usize, StorageError> {
        Ok(self.objects_to_push(manifest, remove_duplicates).await?.len())
    }

    /// Upload every staged object.
    ///
    /// Objects go to the backend in batches of `push_batch_size`; each
    /// batch runs `prepare_push`, `push_objects` and `finalize_push`. A
    /// failed object stays staged and lands in `failure`; the rest of the
    /// batch and later batches carry on. Once `progress` returns `false`
    /// later batches are not started and their objects fail as cancelled.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the backend is unmanaged or not fully
    /// configured. Nothing is transferred in that case.
    pub async fn push_objects(
        &self,
        manifest: &mut Manifest,
        progress: &dyn ProgressCallback<TransferProgress>,
    ) -> Result<PushResult, StorageError> {
        let managed: &dyn ManagedStorageBackend = self.managed()?;
        self.backend.ensure_configured()?;

        let dedup: bool = self.backend.metadata().client_should_dedup_on_push;
        let objects: Vec<PushObject> = self.objects_to_push(manifest, dedup).await?;
        let manifest: &Manifest = manifest;

        let total: u64 = objects.len() as u64;
        let total_bytes: u64 = objects.iter().map(|o| o.size).sum();
        let batch_size: usize = manifest.settings().push_batch_size.max(1);
        log::info!(
            "Pushing {} object(s) ({} bytes) for {} to {}",
            total,
            total_bytes,
            manifest.dataset_id(),
            self.backend.metadata().storage_type
        );

        let mut result: PushResult = PushResult::default();
        let mut cancelled: bool = false;
        let mut completed_before: u64 = 0;
        let mut bytes_before: u64 = 0;

        for chunk in objects.chunks(batch_size) {
            let batch: Vec<PushObject> = chunk.to_vec();
            let batch_len: u64 = batch.len() as u64;
            let batch_bytes: u64 = batch.iter().map(|o| o.size).sum();

            if cancelled {
                for object in batch {
                    result.fail(object, StorageError::Cancelled);
                }
                continue;
            }

            if let Err(e) = managed.prepare_push(manifest, &batch).await {
                log::warn!("Preparing push batch failed: {}", e);
                for object in batch {
                    result.fail(object, e.clone());
                }
            } else {
                let batch_progress: BatchProgress<'_> = BatchProgress {
                    inner: progress,
                    completed_before,
                    bytes_before,
                    total,
                    total_bytes,
                    stopped: AtomicBool::new(false),
                };
                let mut batch_result: PushResult =
                    managed.push_objects(manifest, batch, &batch_progress).await;

                if let Err(e) = managed.finalize_push(manifest, &batch_result).await {
                    log::warn!("Finalizing push batch failed: {}", e);
                    let uploaded: Vec<PushObject> = std::mem::take(&mut batch_result.success);
                    for object in uploaded {
                        batch_result.fail(object, e.clone());
                    }
                }
                cancelled = batch_progress.is_stopped()
                    || batch_result
                        .errors
                        .iter()
                        .any(|e| matches!(e.error, StorageError::Cancelled));
                result.merge(batch_result);
            }
            completed_before += batch_len;
            bytes_before += batch_bytes;
        }

        clear_pushed(manifest.objects(), &result);
        result.message = format!(
            "Pushed {} of {} object(s); {} failed",
            result.success.len(),
            total,
            result.failure.len()
        );
        log::info!("{}", result.message);
        Ok(result)
    }

    /// Download the objects behind `keys` and link them into the working tree.
    ///
    /// Keys sharing a content hash share one download. Objects already in
    /// the local store are not downloaded again. Downloaded bytes are
    /// re-hashed; a mismatch discards the object and fails its keys.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the backend is unmanaged or not fully
    /// configured. Per-key problems, including untracked keys, are listed
    /// in the result.
    pub async fn pull_objects(
        &self,
        manifest: &mut Manifest,
        keys: &[String],
        progress: &dyn ProgressCallback<TransferProgress>,
    ) -> Result<PullResult, StorageError> {
        let managed: &dyn ManagedStorageBackend = self.managed()?;
        self.backend.ensure_configured()?;
        manifest.refresh_revision().await?;

        let revision: String = manifest.revision().to_string();
        let dataset_id: String = manifest.dataset_id().to_string();
        let store: ObjectStore = manifest.objects().clone();
        let revision_dir: PathBuf = manifest.current_revision_dir();

        let mut result: PullResult = PullResult::default();
        let mut groups: BTreeMap<String, Vec<PullObject>> = BTreeMap::new();
        let mut directories: Vec<PullObject> = Vec::new();
        {
            let entries: &ManifestMap = manifest.entries().await?;
            let unique: BTreeSet<&String> = keys.iter().collect();
            for key in unique {
                let entry: &ManifestEntry = match entries.get(key) {
                    Some(entry) => entry,
                    None => {
                        result.fail(
                            PullObject {
                                object_path: PathBuf::new(),
                                revision: revision.clone(),
                                dataset_path: key.clone(),
                                content_hash: String::new(),
                                size: 0,
                            },
                            StorageError::NotFound {
                                bucket: dataset_id.clone(),
                                key: key.clone(),
                            },
                        );
                        continue;
                    }
                };
                let object: PullObject = PullObject {
                    object_path: store.object_path(&entry.content_hash),
                    revision: revision.clone(),
                    dataset_path: key.clone(),
                    content_hash: entry.content_hash.clone(),
                    size: entry.size().unwrap_or(0),
                };
                if entry.is_dir() {
                    directories.push(object);
                } else {
                    groups.entry(entry.content_hash.clone()).or_default().push(object);
                }
            }
        }

        let mut linked: Vec<String> = Vec::new();
        for dir in directories {
            let dest: PathBuf = from_posix_path(&dir.dataset_path, &revision_dir);
            let created: Result<(), StorageError> = store
                .write_directory_object(&dir.content_hash)
                .map_err(StorageError::from)
                .and_then(|_| std::fs::create_dir_all(&dest).map_err(|e| StorageError::io(&dest, e)));
            match created {
                Ok(()) => {
                    linked.push(dir.dataset_path.clone());
                    result.success.push(dir);
                }
                Err(e) => result.fail(dir, e),
            }
        }

        let to_download: Vec<PullObject> = groups
            .iter()
            .filter(|(hash, _)| !store.has_object(hash))
            .filter_map(|(_, group)| group.first().cloned())
            .collect();
        let mut unavailable: HashMap<String, StorageError> = HashMap::new();
        if !to_download.is_empty() {
            log::info!("Pulling {} object(s) for {}", to_download.len(), dataset_id);
            let pulled: PullResult = managed.pull_objects(manifest, to_download, progress).await;
            for error in pulled.errors {
                if let Some(object) = pulled.failure.iter().find(|o| o.dataset_path == error.key) {
                    unavailable.insert(object.content_hash.clone(), error.error);
                }
            }
            for object in pulled.failure {
                unavailable
                    .entry(object.content_hash.clone())
                    .or_insert(StorageError::Other {
                        message: "download failed".to_string(),
                    });
            }
            for object in pulled.success {
                if let Err(e) = verify_object(&object).await {
                    if let Err(remove_err) = store.delete_object(&object.content_hash) {
                        log::warn!("Could not discard corrupt object: {}", remove_err);
                    }
                    unavailable.insert(object.content_hash.clone(), e);
                }
            }
        }

        for (hash, group) in groups {
            if let Some(error) = unavailable.get(&hash) {
                for object in group {
                    result.fail(object, error.clone());
                }
                continue;
            }
            for object in group {
                let dest: PathBuf = from_posix_path(&object.dataset_path, &revision_dir);
                match store.link_into(&hash, &dest) {
                    Ok(()) => {
                        linked.push(object.dataset_path.clone());
                        result.success.push(object);
                    }
                    Err(e) => result.fail(object, e.into()),
                }
            }
        }

        manifest.fingerprint(&linked)?;
        result.message = format!(
            "Pulled {} of {} path(s); {} failed",
            result.success.len(),
            result.success.len() + result.failure.len(),
            result.failure.len()
        );
        log::info!("{}", result.message);
        Ok(result)
    }

    /// Pull every tracked path missing from the working tree.
    pub async fn pull_all(
        &self,
        manifest: &mut Manifest,
        progress: &dyn ProgressCallback<TransferProgress>,
    ) -> Result<PullResult, StorageError> {
        manifest.refresh_revision().await?;
        let revision_dir: PathBuf = manifest.current_revision_dir();
        let missing: Vec<String> = manifest
            .entries()
            .await?
            .values()
            .filter(|e| {
                let local: PathBuf = from_posix_path(&e.relative_path, &revision_dir);
                if e.is_dir() {
                    !local.is_dir()
                } else {
                    !local.is_file()
                }
            })
            .map(|e| e.relative_path.clone())
            .collect();
        self.pull_objects(manifest, &missing, progress).await
    }

    fn managed(&self) -> Result<&dyn ManagedStorageBackend, StorageError> {
        self.backend.as_managed().ok_or_else(|| {
            StorageError::invalid_config(format!(
                "{} backend does not transfer objects",
                self.backend.metadata().storage_type
            ))
        })
    }
}

/// Remove push markers for uploaded objects.
///
/// A hash that uploaded cleanly loses its markers in every revision. A
/// hash with some failed references only loses the references that went
/// through.
fn clear_pushed(store: &ObjectStore, result: &PushResult) {
    let failed: HashSet<&str> = result.failure.iter().map(|o| o.content_hash.as_str()).collect();
    let mut purged: HashSet<&str> = HashSet::new();
    for object in &result.success {
        let cleared: Result<(), ManifestError> = if failed.contains(object.content_hash.as_str()) {
            store.unstage_push(&object.revision, &object.content_hash, &object.dataset_path)
        } else if purged.insert(object.content_hash.as_str()) {
            store.purge_push_markers(&object.content_hash)
        } else {
            Ok(())
        };
        if let Err(e) = cleared {
            log::warn!(
                "Uploaded {} but could not clear its push marker: {}",
                object.dataset_path,
                e
            );
        }
    }
}

async fn verify_object(object: &PullObject) -> Result<(), StorageError> {
    let path: PathBuf = object.object_path.clone();
    let actual: String = tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| StorageError::Other {
            message: format!("hash task failed: {}", e),
        })?
        .map_err(|e| StorageError::io(&object.object_path, e))?;
    if actual != object.content_hash {
        return Err(StorageError::HashMismatch {
            key: object.dataset_path.clone(),
            expected: object.content_hash.clone(),
            actual,
        });
    }
    Ok(())
}
