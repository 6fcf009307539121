//! Managed backend storing objects in a dataset object service.
//!
//! Every transfer is a two-phase handshake: ask the service for a
//! presigned URL for the object id (its content hash), then move the bytes
//! against that URL. The service answers on
//! `<server_url>/<namespace>/<dataset_name>/<content_hash>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dataset_sync_common::ProgressCallback;
use dataset_sync_manifest::Manifest;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::backend::{BackendConfig, BackendFactory, ManagedStorageBackend, StorageBackend};
use crate::backend::config::parameter;
use crate::error::StorageError;
use crate::transfer::run_transfers;
use crate::types::{
    BackendMetadata, OperationType, ParameterKind, ParameterSpec, PullObject, PullResult,
    PushObject, PushResult, TransferProgress,
};

/// Registry key of [`ObjectServiceBackend`].
pub const OBJECT_SERVICE_STORAGE_TYPE: &str = "object_service_v1";

/// Time-limited location to move one object's bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedTarget {
    pub object_id: String,
    pub url: String,
}

/// Network side of the object service.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    async fn presign_upload(&self, content_hash: &str) -> Result<PresignedTarget, StorageError>;

    async fn presign_download(&self, content_hash: &str) -> Result<PresignedTarget, StorageError>;

    /// Send a local file to a presigned target.
    async fn upload(&self, target: &PresignedTarget, source: &Path) -> Result<(), StorageError>;

    /// Fetch a presigned target into `dest`. `dest` only appears once the
    /// transfer completed.
    async fn download(&self, target: &PresignedTarget, dest: &Path) -> Result<(), StorageError>;

    /// Remove every object of the dataset.
    async fn delete_dataset(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Deserialize)]
struct PresignResponse {
    presigned_url: String,
}

/// [`ObjectTransport`] over HTTPS with a bearer token.
pub struct HttpObjectTransport {
    client: reqwest::Client,
    dataset_url: String,
    access_token: String,
}

impl HttpObjectTransport {
    /// # Arguments
    /// * `server_url` - Object service root, e.g. `https://objects.example.com/api`
    /// * `namespace` - Owner of the dataset
    /// * `dataset_name` - Dataset name within the namespace
    /// * `access_token` - Bearer token sent with presign requests
    pub fn new(
        server_url: &str,
        namespace: &str,
        dataset_name: &str,
        access_token: &str,
    ) -> Result<Self, StorageError> {
        let client: reqwest::Client = reqwest::Client::builder()
            .build()
            .map_err(|e| StorageError::invalid_config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            dataset_url: format!(
                "{}/{}/{}",
                server_url.trim_end_matches('/'),
                namespace,
                dataset_name
            ),
            access_token: access_token.to_string(),
        })
    }

    fn object_url(&self, content_hash: &str) -> String {
        format!("{}/{}", self.dataset_url, content_hash)
    }

    async fn presign(
        &self,
        method: reqwest::Method,
        content_hash: &str,
    ) -> Result<PresignedTarget, StorageError> {
        let response: reqwest::Response = self
            .client
            .request(method, self.object_url(content_hash))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(network_error)?;
        let response: reqwest::Response = check_status(content_hash, response)?;
        let body: PresignResponse = response.json().await.map_err(|e| StorageError::Other {
            message: format!("Invalid presign response for {}: {}", content_hash, e),
        })?;
        Ok(PresignedTarget {
            object_id: content_hash.to_string(),
            url: body.presigned_url,
        })
    }
}

#[async_trait]
impl ObjectTransport for HttpObjectTransport {
    async fn presign_upload(&self, content_hash: &str) -> Result<PresignedTarget, StorageError> {
        self.presign(reqwest::Method::PUT, content_hash).await
    }

    async fn presign_download(&self, content_hash: &str) -> Result<PresignedTarget, StorageError> {
        self.presign(reqwest::Method::GET, content_hash).await
    }

    async fn upload(&self, target: &PresignedTarget, source: &Path) -> Result<(), StorageError> {
        let (body, length): (reqwest::Body, u64) = file_body(source).await?;
        let response: reqwest::Response = self
            .client
            .put(&target.url)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await
            .map_err(network_error)?;
        check_status(&target.object_id, response)?;
        Ok(())
    }

    async fn download(&self, target: &PresignedTarget, dest: &Path) -> Result<(), StorageError> {
        let response: reqwest::Response = self
            .client
            .get(&target.url)
            .send()
            .await
            .map_err(network_error)?;
        let mut response: reqwest::Response = check_status(&target.object_id, response)?;

        let tmp: PathBuf = partial_path(dest);
        if let Some(parent) = tmp.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        let mut file: tokio::fs::File = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;

        let written: Result<(), StorageError> = async {
            while let Some(chunk) = response.chunk().await.map_err(network_error)? {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| StorageError::io(&tmp, e))?;
            }
            file.flush().await.map_err(|e| StorageError::io(&tmp, e))
        }
        .await;
        drop(file);

        match written {
            Ok(()) => tokio::fs::rename(&tmp, dest)
                .await
                .map_err(|e| StorageError::io(dest, e)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn delete_dataset(&self) -> Result<(), StorageError> {
        let response: reqwest::Response = self
            .client
            .delete(&self.dataset_url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(network_error)?;
        check_status(&self.dataset_url, response)?;
        Ok(())
    }
}

fn network_error(err: reqwest::Error) -> StorageError {
    StorageError::NetworkError {
        retryable: err.is_timeout() || err.is_connect(),
        message: err.to_string(),
    }
}

fn check_status(key: &str, response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    let status: reqwest::StatusCode = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(StorageError::HttpStatus {
            key: key.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Request body streaming `source` from disk, with its length.
async fn file_body(source: &Path) -> Result<(reqwest::Body, u64), StorageError> {
    let file: tokio::fs::File = tokio::fs::File::open(source)
        .await
        .map_err(|e| StorageError::io(source, e))?;
    let length: u64 = file
        .metadata()
        .await
        .map_err(|e| StorageError::io(source, e))?
        .len();
    let body: reqwest::Body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    Ok((body, length))
}

/// Sibling of `dest` that a download writes to before renaming.
pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let name: String = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.partial", name, uuid::Uuid::new_v4().simple()))
}

/// Managed backend on top of an [`ObjectTransport`].
pub struct ObjectServiceBackend {
    metadata: BackendMetadata,
    config: BackendConfig,
    transport: Option<Arc<dyn ObjectTransport>>,
}

impl ObjectServiceBackend {
    /// Build the backend. An HTTP transport is created once every required
    /// parameter is present.
    pub fn new(config: BackendConfig) -> Result<Self, StorageError> {
        let mut backend: ObjectServiceBackend = Self {
            metadata: Self::backend_metadata(),
            config,
            transport: None,
        };
        if backend.is_configured() {
            let transport: HttpObjectTransport = HttpObjectTransport::new(
                parameter(&backend.config, "server_url")?,
                parameter(&backend.config, "namespace")?,
                parameter(&backend.config, "dataset_name")?,
                parameter(&backend.config, "access_token")?,
            )?;
            backend.transport = Some(Arc::new(transport));
        }
        Ok(backend)
    }

    /// Build the backend with an explicit transport.
    pub fn with_transport(config: BackendConfig, transport: Arc<dyn ObjectTransport>) -> Self {
        Self {
            metadata: Self::backend_metadata(),
            config,
            transport: Some(transport),
        }
    }

    /// Registry factory.
    pub fn factory() -> BackendFactory {
        Box::new(|config: BackendConfig| {
            let backend: Box<dyn StorageBackend> = Box::new(ObjectServiceBackend::new(config)?);
            Ok(backend)
        })
    }

    pub fn backend_metadata() -> BackendMetadata {
        BackendMetadata {
            storage_type: OBJECT_SERVICE_STORAGE_TYPE.to_string(),
            name: "Dataset object service".to_string(),
            description: "Objects are uploaded to and downloaded from a dataset object service \
                          through presigned URLs."
                .to_string(),
            is_managed: true,
            client_should_dedup_on_push: true,
            can_update_from_remote: false,
        }
    }

    fn transport(&self) -> Result<Arc<dyn ObjectTransport>, StorageError> {
        self.ensure_configured()?;
        self.transport
            .clone()
            .ok_or_else(|| StorageError::invalid_config("object service transport is not set up"))
    }
}

#[async_trait]
impl StorageBackend for ObjectServiceBackend {
    fn metadata(&self) -> &BackendMetadata {
        &self.metadata
    }

    fn required_parameters(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new("server_url", "Root URL of the object service", ParameterKind::String),
            ParameterSpec::new("namespace", "Namespace owning the dataset", ParameterKind::String),
            ParameterSpec::new("dataset_name", "Name of the dataset", ParameterKind::String),
            ParameterSpec::new("access_token", "Bearer token for the object service", ParameterKind::Secret),
        ]
    }

    fn configuration(&self) -> &BackendConfig {
        &self.config
    }

    fn as_managed(&self) -> Option<&dyn ManagedStorageBackend> {
        Some(self)
    }
}

#[async_trait]
impl ManagedStorageBackend for ObjectServiceBackend {
    async fn push_objects(
        &self,
        manifest: &Manifest,
        objects: Vec<PushObject>,
        progress: &dyn ProgressCallback<TransferProgress>,
    ) -> PushResult {
        let mut result: PushResult = PushResult::default();
        let transport: Arc<dyn ObjectTransport> = match self.transport() {
            Ok(transport) => transport,
            Err(e) => {
                for object in objects {
                    result.fail(object, e.clone());
                }
                return result;
            }
        };

        let outcomes: Vec<(PushObject, Result<(), StorageError>)> = run_transfers(
            objects,
            OperationType::Uploading,
            manifest.settings().upload_concurrency,
            progress,
            |object: PushObject| {
                let transport: Arc<dyn ObjectTransport> = Arc::clone(&transport);
                async move {
                    let target: PresignedTarget = transport.presign_upload(&object.content_hash).await?;
                    transport.upload(&target, &object.object_path).await
                }
            },
        )
        .await;

        for (object, outcome) in outcomes {
            match outcome {
                Ok(()) => result.success.push(object),
                Err(e) => result.fail(object, e),
            }
        }
        result.message = format!(
            "Uploaded {} of {} object(s)",
            result.success.len(),
            result.success.len() + result.failure.len()
        );
        result
    }

    async fn pull_objects(
        &self,
        manifest: &Manifest,
        objects: Vec<PullObject>,
        progress: &dyn ProgressCallback<TransferProgress>,
    ) -> PullResult {
        let mut result: PullResult = PullResult::default();
        let transport: Arc<dyn ObjectTransport> = match self.transport() {
            Ok(transport) => transport,
            Err(e) => {
                for object in objects {
                    result.fail(object, e.clone());
                }
                return result;
            }
        };

        let outcomes: Vec<(PullObject, Result<(), StorageError>)> = run_transfers(
            objects,
            OperationType::Downloading,
            manifest.settings().download_concurrency,
            progress,
            |object: PullObject| {
                let transport: Arc<dyn ObjectTransport> = Arc::clone(&transport);
                async move {
                    let target: PresignedTarget =
                        transport.presign_download(&object.content_hash).await?;
                    transport.download(&target, &object.object_path).await
                }
            },
        )
        .await;

        for (object, outcome) in outcomes {
            match outcome {
                Ok(()) => result.success.push(object),
                Err(e) => result.fail(object, e),
            }
        }
        result.message = format!(
            "Downloaded {} of {} object(s)",
            result.success.len(),
            result.success.len() + result.failure.len()
        );
        result
    }

    async fn delete_contents(&self, _manifest: &Manifest) -> Result<(), StorageError> {
        self.transport()?.delete_dataset().await
    }
}
