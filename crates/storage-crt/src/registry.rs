//! Registry with every backend this workspace ships.

use std::path::Path;
use std::sync::Arc;

use dataset_sync_storage::{
    BackendRegistry, ChangeTokenCache, ObjectServiceBackend, PublicBucketBackend, S3Settings,
    SqliteChangeTokenCache, StorageClient, StorageError, OBJECT_SERVICE_STORAGE_TYPE,
    PUBLIC_BUCKET_STORAGE_TYPE,
};

use crate::client::CrtStorageClient;

/// Build a registry holding the object service and public bucket backends.
///
/// # Arguments
/// * `settings` - Settings for the bucket client used by public bucket datasets
/// * `change_token_db` - SQLite file holding change tokens, shared by all datasets
pub async fn default_registry(
    settings: S3Settings,
    change_token_db: &Path,
) -> Result<BackendRegistry, StorageError> {
    let client: Arc<dyn StorageClient> = Arc::new(CrtStorageClient::new(settings).await?);
    let tokens: Arc<ChangeTokenCache> = Arc::new(ChangeTokenCache::new(
        SqliteChangeTokenCache::open(change_token_db)?,
    ));

    let mut registry: BackendRegistry = BackendRegistry::new();
    registry.register(OBJECT_SERVICE_STORAGE_TYPE, ObjectServiceBackend::factory());
    registry.register(
        PUBLIC_BUCKET_STORAGE_TYPE,
        PublicBucketBackend::factory(client, tokens),
    );
    Ok(registry)
}
