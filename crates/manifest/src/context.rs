//! The repository a dataset manifest lives in.
//!
//! Revision history, branches and locking belong to the repository. The
//! manifest only needs a working location, a revision identifier, an
//! exclusive lock around mutations, and somewhere to record what changed.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::activity::ActivityRecord;
use crate::error::ManifestError;

/// Proof that the repository lock is held.
///
/// Released on drop.
pub struct RepositoryLock {
    dataset_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl RepositoryLock {
    pub fn new(dataset_id: impl Into<String>, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            _guard: guard,
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }
}

impl std::fmt::Debug for RepositoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryLock")
            .field("dataset_id", &self.dataset_id)
            .finish()
    }
}

/// Repository context supplying revision, location and locking.
#[async_trait]
pub trait DatasetRepository: Send + Sync {
    /// Dataset root holding `manifest/` and `.datasetignore`.
    fn root_dir(&self) -> &Path;

    /// Root of the object store and revision working trees.
    fn cache_root(&self) -> &Path;

    fn dataset_id(&self) -> &str;

    /// Identifier of the checked-out revision.
    fn revision(&self) -> String;

    /// Identifier of the project a linked dataset is embedded in.
    fn link_id(&self) -> Option<String> {
        None
    }

    /// Acquire the exclusive repository lock.
    async fn lock(&self) -> RepositoryLock;

    /// Record a committed change.
    ///
    /// # Returns
    /// The revision that is current after the record is written.
    async fn create_activity_record(&self, record: &ActivityRecord) -> Result<String, ManifestError>;
}
