//! Unmanaged backend mirroring a public S3 bucket prefix.
//!
//! The bucket is the source of truth. An update lists the prefix, compares
//! each object's ETag with the change token recorded at its last download,
//! fetches new and changed objects, removes local files whose objects
//! vanished, and commits the result as one manifest change.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dataset_sync_common::{
    from_posix_path, is_directory_key, parent_directory_keys, ProgressCallback,
};
use dataset_sync_manifest::{ActivityRecord, Manifest};

use crate::backend::config::parameter;
use crate::backend::{
    BackendConfig, BackendFactory, RemoteUpdate, StorageBackend, UnmanagedStorageBackend,
};
use crate::change_tokens::ChangeTokenCache;
use crate::error::{StorageError, TransferError};
use crate::traits::{ObjectInfo, StorageClient};
use crate::transfer::{run_transfers, TransferItem};
use crate::types::{BackendMetadata, OperationType, ParameterKind, ParameterSpec, TransferProgress};

/// Registry key of [`PublicBucketBackend`].
pub const PUBLIC_BUCKET_STORAGE_TYPE: &str = "public_s3_bucket";

/// Directory under the cache root that downloads land in before they are
/// moved into the working tree.
const STAGING_DIR_NAME: &str = ".incoming";

/// An object listed under the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteObject {
    key: String,
    dataset_path: String,
    size: u64,
    token: String,
}

#[derive(Debug, Clone)]
struct Download {
    object: RemoteObject,
    staging: PathBuf,
    dest: PathBuf,
}

impl TransferItem for Download {
    fn key(&self) -> &str {
        &self.object.dataset_path
    }

    fn size(&self) -> u64 {
        self.object.size
    }
}

/// Unmanaged backend over a read-only bucket listing.
pub struct PublicBucketBackend {
    metadata: BackendMetadata,
    config: BackendConfig,
    client: Arc<dyn StorageClient>,
    tokens: Arc<ChangeTokenCache>,
}

impl PublicBucketBackend {
    /// # Arguments
    /// * `config` - Must provide `bucket_name` and `prefix`
    /// * `client` - Bucket client
    /// * `tokens` - Change tokens shared by every dataset using this client
    pub fn new(
        config: BackendConfig,
        client: Arc<dyn StorageClient>,
        tokens: Arc<ChangeTokenCache>,
    ) -> Self {
        Self {
            metadata: Self::backend_metadata(),
            config,
            client,
            tokens,
        }
    }

    /// Registry factory sharing one client and token cache.
    pub fn factory(client: Arc<dyn StorageClient>, tokens: Arc<ChangeTokenCache>) -> BackendFactory {
        Box::new(move |config: BackendConfig| {
            let backend: Box<dyn StorageBackend> = Box::new(PublicBucketBackend::new(
                config,
                Arc::clone(&client),
                Arc::clone(&tokens),
            ));
            Ok(backend)
        })
    }

    pub fn backend_metadata() -> BackendMetadata {
        BackendMetadata {
            storage_type: PUBLIC_BUCKET_STORAGE_TYPE.to_string(),
            name: "Public S3 bucket".to_string(),
            description: "Mirrors a prefix of a publicly readable S3 bucket. \
                          Local changes are never uploaded."
                .to_string(),
            is_managed: false,
            client_should_dedup_on_push: false,
            can_update_from_remote: true,
        }
    }

    fn bucket(&self) -> Result<&str, StorageError> {
        parameter(&self.config, "bucket_name")
    }

    /// Configured prefix as an object key prefix: `""` or `"a/b/"`.
    fn prefix(&self) -> Result<String, StorageError> {
        parameter(&self.config, "prefix").map(normalize_prefix)
    }

    async fn remote_objects(&self) -> Result<Vec<RemoteObject>, StorageError> {
        let bucket: &str = self.bucket()?;
        let prefix: String = self.prefix()?;
        let listed: Vec<ObjectInfo> = self.client.list_objects(bucket, &prefix).await?;

        let mut objects: Vec<RemoteObject> = Vec::with_capacity(listed.len());
        for info in listed {
            let relative: &str = match info.key.strip_prefix(prefix.as_str()) {
                Some(relative) => relative,
                None => continue,
            };
            if !is_valid_dataset_path(relative) {
                log::warn!("Skipping object s3://{}/{}: not a usable dataset path", bucket, info.key);
                continue;
            }
            let token: String = info
                .etag
                .clone()
                .unwrap_or_else(|| format!("{}-{}", info.size, info.last_modified.unwrap_or(0)));
            objects.push(RemoteObject {
                dataset_path: relative.to_string(),
                key: info.key,
                size: info.size,
                token,
            });
        }
        objects.sort_by(|a, b| a.dataset_path.cmp(&b.dataset_path));
        Ok(objects)
    }
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed: &str = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn is_valid_dataset_path(path: &str) -> bool {
    let trimmed: &str = path.trim_end_matches('/');
    !trimmed.is_empty()
        && !trimmed.contains('\\')
        && trimmed
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

async fn fetch(
    client: &dyn StorageClient,
    bucket: &str,
    download: &Download,
) -> Result<(), StorageError> {
    client
        .get_object_to_file(bucket, &download.object.key, &download.staging)
        .await?;
    if let Some(parent) = download.dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }
    // Renaming replaces the directory entry, so an object hard-linked at
    // `dest` keeps its contents.
    if let Err(e) = tokio::fs::rename(&download.staging, &download.dest).await {
        let _ = tokio::fs::remove_file(&download.staging).await;
        return Err(StorageError::io(&download.dest, e));
    }
    Ok(())
}

fn remove_local(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

#[async_trait]
impl StorageBackend for PublicBucketBackend {
    fn metadata(&self) -> &BackendMetadata {
        &self.metadata
    }

    fn required_parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new("bucket_name", "Name of the public S3 bucket", ParameterKind::String),
            ParameterSpec::new(
                "prefix",
                "Prefix to mirror; use \"/\" for the whole bucket",
                ParameterKind::String,
            ),
        ]
    }

    fn configuration(&self) -> &BackendConfig {
        &self.config
    }

    async fn confirm_configuration(&self, _manifest: &Manifest) -> Result<Option<String>, StorageError> {
        self.ensure_configured()?;
        let objects: Vec<RemoteObject> = self.remote_objects().await?;
        let total_bytes: u64 = objects.iter().map(|o| o.size).sum();
        Ok(Some(format!(
            "Found {} object(s) totalling {} bytes in s3://{}/{}. Files are downloaded \
             locally and local changes are never uploaded.",
            objects.len(),
            total_bytes,
            self.bucket()?,
            self.prefix()?
        )))
    }

    fn as_unmanaged(&self) -> Option<&dyn UnmanagedStorageBackend> {
        Some(self)
    }
}

#[async_trait]
impl UnmanagedStorageBackend for PublicBucketBackend {
    async fn update_from_remote(
        &self,
        manifest: &mut Manifest,
        progress: &dyn ProgressCallback<TransferProgress>,
    ) -> Result<RemoteUpdate, StorageError> {
        self.ensure_configured()?;
        manifest.refresh_revision().await?;
        let bucket: &str = self.bucket()?;
        let prefix: String = self.prefix()?;

        let remote: Vec<RemoteObject> = self.remote_objects().await?;
        let revision_dir: PathBuf = manifest.current_revision_dir();
        let staging_dir: PathBuf = manifest.objects().cache_root().join(STAGING_DIR_NAME);
        std::fs::create_dir_all(&staging_dir).map_err(|e| StorageError::io(&staging_dir, e))?;

        let mut update: RemoteUpdate = RemoteUpdate::default();
        let mut remote_paths: BTreeSet<String> = BTreeSet::new();
        let mut downloads: Vec<Download> = Vec::new();

        for object in remote {
            remote_paths.insert(object.dataset_path.clone());
            let dest: PathBuf = from_posix_path(&object.dataset_path, &revision_dir);
            if is_directory_key(&object.dataset_path) {
                std::fs::create_dir_all(&dest).map_err(|e| StorageError::io(&dest, e))?;
                continue;
            }
            if dest.is_file() && !self.tokens.has_changed(bucket, &object.key, &object.token).await {
                update.unchanged.push(object.dataset_path);
                continue;
            }
            downloads.push(Download {
                staging: staging_dir.join(uuid::Uuid::new_v4().simple().to_string()),
                dest,
                object,
            });
        }

        log::info!(
            "s3://{}/{}: {} object(s) to download, {} unchanged",
            bucket,
            prefix,
            downloads.len(),
            update.unchanged.len()
        );

        let client: &dyn StorageClient = self.client.as_ref();
        let outcomes: Vec<(Download, Result<(), StorageError>)> = run_transfers(
            downloads,
            OperationType::Downloading,
            manifest.settings().download_concurrency,
            progress,
            |download: Download| async move { fetch(client, bucket, &download).await },
        )
        .await;

        let mut fetched_tokens: Vec<(String, String)> = Vec::new();
        for (download, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    fetched_tokens.push((download.object.key.clone(), download.object.token.clone()));
                    update.downloaded.push(download.object.dataset_path);
                }
                Err(e) => update
                    .failures
                    .push(TransferError::new(download.object.dataset_path, e)),
            }
        }

        let tracked_files: Vec<String> = manifest
            .entries()
            .await?
            .keys()
            .filter(|k| !is_directory_key(k))
            .cloned()
            .collect();
        let remote_dirs: BTreeSet<String> = remote_paths
            .iter()
            .flat_map(|p| parent_directory_keys(p))
            .chain(remote_paths.iter().filter(|p| is_directory_key(p)).cloned())
            .collect();

        let mut emptied_dirs: BTreeSet<String> = BTreeSet::new();
        for path in tracked_files {
            if remote_paths.contains(&path) {
                continue;
            }
            remove_local(&from_posix_path(&path, &revision_dir))?;
            self.tokens.forget(bucket, &format!("{}{}", prefix, path)).await;
            emptied_dirs.extend(parent_directory_keys(&path));
            update.deleted.push(path);
        }
        // Deepest first so nested empty directories fold up.
        for dir in emptied_dirs.iter().rev() {
            if !remote_dirs.contains(dir) {
                let _ = std::fs::remove_dir(from_posix_path(dir, &revision_dir));
            }
        }

        update.downloaded.sort();
        update.unchanged.sort();
        update.deleted.sort();

        let message: String = format!(
            "Updated from s3://{}/{}: {} downloaded, {} deleted",
            bucket,
            prefix,
            update.downloaded.len(),
            update.deleted.len()
        );
        let record: Option<ActivityRecord> = manifest.sweep_all_changes(Some(&message)).await?;
        self.tokens.record_batch(bucket, &fetched_tokens).await;
        update.record = record;

        if !update.failures.is_empty() {
            log::warn!(
                "{} object(s) from s3://{}/{} could not be downloaded",
                update.failures.len(),
                bucket,
                prefix
            );
        }
        Ok(update)
    }
}
