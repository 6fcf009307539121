//! Data types for transfers and backend descriptions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// Configuration settings for S3 access.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// AWS region.
    pub region: String,
    /// Static credentials. `None` uses the default provider chain.
    pub credentials: Option<AwsCredentials>,
    /// Expected bucket owner account id, checked on every request.
    pub expected_bucket_owner: Option<String>,
    /// Send unsigned requests, for buckets that allow public reads.
    pub anonymous: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            region: "us-east-1".into(),
            credentials: None,
            expected_bucket_owner: None,
            anonymous: true,
        }
    }
}

/// AWS credentials.
#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

/// One content object to upload, and the manifest row referencing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushObject {
    /// Local object file.
    pub object_path: PathBuf,
    /// Revision the object was staged in.
    pub revision: String,
    /// Manifest key referencing the object.
    pub dataset_path: String,
    /// Content hash, which is also the remote object id.
    pub content_hash: String,
    /// Object size in bytes.
    pub size: u64,
}

/// One content object to download into the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullObject {
    /// Where the object lands in the local store.
    pub object_path: PathBuf,
    /// Revision whose working tree receives the file.
    pub revision: String,
    /// Manifest key referencing the object.
    pub dataset_path: String,
    /// Content hash, which is also the remote object id.
    pub content_hash: String,
    /// Object size in bytes, from the manifest.
    pub size: u64,
}

/// Outcome of a push. Every submitted object is in exactly one of
/// `success` and `failure`.
#[derive(Debug, Clone, Default)]
pub struct PushResult {
    pub success: Vec<PushObject>,
    pub failure: Vec<PushObject>,
    /// Why each failed object failed, keyed by dataset path.
    pub errors: Vec<TransferError>,
    /// Human-readable summary.
    pub message: String,
}

impl PushResult {
    pub fn is_complete(&self) -> bool {
        self.failure.is_empty()
    }

    pub(crate) fn fail(&mut self, object: PushObject, error: crate::StorageError) {
        self.errors
            .push(TransferError::new(object.dataset_path.clone(), error));
        self.failure.push(object);
    }

    pub(crate) fn merge(&mut self, other: PushResult) {
        self.success.extend(other.success);
        self.failure.extend(other.failure);
        self.errors.extend(other.errors);
    }
}

/// Outcome of a pull. Every submitted object is in exactly one of
/// `success` and `failure`.
#[derive(Debug, Clone, Default)]
pub struct PullResult {
    pub success: Vec<PullObject>,
    pub failure: Vec<PullObject>,
    /// Why each failed object failed, keyed by dataset path.
    pub errors: Vec<TransferError>,
    /// Human-readable summary.
    pub message: String,
}

impl PullResult {
    pub fn is_complete(&self) -> bool {
        self.failure.is_empty()
    }

    pub(crate) fn fail(&mut self, object: PullObject, error: crate::StorageError) {
        self.errors
            .push(TransferError::new(object.dataset_path.clone(), error));
        self.failure.push(object);
    }
}

/// Progress update for transfer operations.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Current operation type.
    pub operation: OperationType,
    /// Dataset path of the object that just finished.
    pub current_key: String,
    /// Overall progress: objects completed.
    pub overall_completed: u64,
    /// Overall progress: total objects.
    pub overall_total: u64,
    /// Overall bytes transferred.
    pub overall_bytes: u64,
    /// Overall total bytes.
    pub overall_total_bytes: u64,
}

/// Type of operation in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Uploading,
    Downloading,
}

/// Static description of a storage backend type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMetadata {
    /// Registry key, e.g. `object_service_v1`.
    pub storage_type: String,
    pub name: String,
    pub description: String,
    /// This system owns writes to the remote.
    pub is_managed: bool,
    /// Identical contents are uploaded once rather than once per path.
    pub client_should_dedup_on_push: bool,
    /// The remote is authoritative and can be pulled into the dataset.
    pub can_update_from_remote: bool,
}

/// How a configuration parameter is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    String,
    /// Supplied at runtime and never written to disk.
    Secret,
}

/// A parameter a backend needs before it can be used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub parameter: String,
    pub description: String,
    pub kind: ParameterKind,
}

impl ParameterSpec {
    pub fn new(parameter: &str, description: &str, kind: ParameterKind) -> Self {
        Self {
            parameter: parameter.to_string(),
            description: description.to_string(),
            kind,
        }
    }
}
