//! Storage backend capability traits.
//!
//! Every backend implements [`StorageBackend`]. A backend whose remote is
//! written only by this system also implements [`ManagedStorageBackend`];
//! one whose remote is owned by someone else implements
//! [`UnmanagedStorageBackend`]. Callers reach the capability through
//! `as_managed()` / `as_unmanaged()`.
//!
//! Configuration problems are returned as `StorageError::InvalidConfig`
//! before any I/O. Per-object transfer failures never surface as `Err`;
//! they are listed in the `PushResult` / `PullResult`.

pub mod config;
pub mod registry;

use async_trait::async_trait;
use dataset_sync_common::{CountProgress, ProgressCallback};
use dataset_sync_manifest::{ActivityRecord, Manifest};

use crate::error::{StorageError, TransferError};
use crate::types::{BackendMetadata, ParameterSpec, PullObject, PullResult, PushObject, PushResult, TransferProgress};

pub use config::{
    missing_parameters, require_configured, BackendConfig, BackendConfigFile,
    StoredBackendConfig, BACKEND_CONFIG_FILE_NAME,
};
pub use registry::{BackendFactory, BackendRegistry};

/// Behaviour common to every backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn metadata(&self) -> &BackendMetadata;

    /// Parameters that must be set before the backend is usable.
    fn required_parameters(&self) -> Vec<ParameterSpec>;

    /// Current parameter values.
    fn configuration(&self) -> &BackendConfig;

    /// Required parameters that are absent or blank.
    fn missing_configuration(&self) -> Vec<String> {
        missing_parameters(&self.required_parameters(), self.configuration())
    }

    fn is_configured(&self) -> bool {
        self.missing_configuration().is_empty()
    }

    /// Fail with `InvalidConfig` if any required parameter is missing.
    fn ensure_configured(&self) -> Result<(), StorageError> {
        require_configured(
            &self.metadata().storage_type,
            &self.required_parameters(),
            self.configuration(),
        )
    }

    /// Pre-flight check once configuration is complete.
    ///
    /// # Returns
    /// A message to show the user before proceeding, or `None` if the
    /// backend has nothing to confirm.
    async fn confirm_configuration(&self, _manifest: &Manifest) -> Result<Option<String>, StorageError> {
        self.ensure_configured()?;
        Ok(None)
    }

    /// Re-hash every local file and list those that no longer match.
    async fn verify_contents(
        &self,
        manifest: &mut Manifest,
        progress: &dyn ProgressCallback<CountProgress>,
    ) -> Result<Vec<String>, StorageError> {
        Ok(manifest.verify_contents(progress).await?)
    }

    fn as_managed(&self) -> Option<&dyn ManagedStorageBackend> {
        None
    }

    fn as_unmanaged(&self) -> Option<&dyn UnmanagedStorageBackend> {
        None
    }
}

/// A backend whose remote contents this system writes.
#[async_trait]
pub trait ManagedStorageBackend: StorageBackend {
    /// Called once per batch before any object in it is uploaded.
    async fn prepare_push(&self, _manifest: &Manifest, _objects: &[PushObject]) -> Result<(), StorageError> {
        Ok(())
    }

    /// Upload a batch. Every object ends up in `success` or `failure`.
    async fn push_objects(
        &self,
        manifest: &Manifest,
        objects: Vec<PushObject>,
        progress: &dyn ProgressCallback<TransferProgress>,
    ) -> PushResult;

    /// Called once per batch after its uploads settle.
    async fn finalize_push(&self, _manifest: &Manifest, _result: &PushResult) -> Result<(), StorageError> {
        Ok(())
    }

    /// Download objects into the local object store.
    async fn pull_objects(
        &self,
        manifest: &Manifest,
        objects: Vec<PullObject>,
        progress: &dyn ProgressCallback<TransferProgress>,
    ) -> PullResult;

    /// Remove everything the dataset stored remotely.
    async fn delete_contents(&self, manifest: &Manifest) -> Result<(), StorageError>;
}

/// Result of reconciling a dataset with an external remote.
#[derive(Debug, Clone, Default)]
pub struct RemoteUpdate {
    /// Dataset paths fetched because they were new or changed.
    pub downloaded: Vec<String>,
    /// Dataset paths whose change token matched.
    pub unchanged: Vec<String>,
    /// Dataset paths removed because they vanished remotely.
    pub deleted: Vec<String>,
    /// Objects that could not be fetched. They are retried next time.
    pub failures: Vec<TransferError>,
    /// Activity recorded for the resulting change, if anything changed.
    pub record: Option<ActivityRecord>,
}

/// A backend whose remote is authoritative and not written by this system.
#[async_trait]
pub trait UnmanagedStorageBackend: StorageBackend {
    fn can_update_from_remote(&self) -> bool {
        self.metadata().can_update_from_remote
    }

    /// Commit whatever is physically present in the working tree.
    ///
    /// # Arguments
    /// * `manifest` - Manifest to update
    /// * `verify_contents` - Re-hash every tracked file instead of trusting fingerprints
    /// * `progress` - Reports verification progress
    async fn update_from_local(
        &self,
        manifest: &mut Manifest,
        verify_contents: bool,
        progress: &dyn ProgressCallback<CountProgress>,
    ) -> Result<Option<ActivityRecord>, StorageError> {
        self.ensure_configured()?;
        manifest.refresh_revision().await?;
        if verify_contents {
            let drifted: Vec<String> = manifest.verify_contents(progress).await?;
            if !drifted.is_empty() {
                log::info!("{} file(s) changed on disk without a fingerprint change", drifted.len());
            }
            manifest.forget_fingerprints().await?;
        }
        Ok(manifest.sweep_all_changes(Some("Updated dataset from local files")).await?)
    }

    /// Fetch new and changed objects from the remote and record deletions.
    async fn update_from_remote(
        &self,
        _manifest: &mut Manifest,
        _progress: &dyn ProgressCallback<TransferProgress>,
    ) -> Result<RemoteUpdate, StorageError> {
        Err(StorageError::invalid_config(format!(
            "{} backend cannot update from a remote",
            self.metadata().storage_type
        )))
    }
}
