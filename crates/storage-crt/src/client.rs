//! AWS SDK S3 client implementation.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use dataset_sync_storage::{ObjectInfo, S3Settings, StorageClient, StorageError};

use crate::error::CrtError;

/// StorageClient implementation using AWS SDK for Rust.
///
/// Listing pages through `ListObjectsV2`; downloads stream the body to disk.
pub struct CrtStorageClient {
    /// The underlying S3 client.
    s3_client: S3Client,
    /// Expected bucket owner for security validation.
    expected_bucket_owner: Option<String>,
}

impl CrtStorageClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `settings` - Region, optional static credentials, and whether to
    ///   send unsigned requests
    pub async fn new(settings: S3Settings) -> Result<Self, StorageError> {
        let config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()));

        let config_loader = if settings.anonymous {
            config_loader.no_credentials()
        } else if let Some(ref creds) = settings.credentials {
            let credentials = Credentials::new(
                &creds.access_key_id,
                &creds.secret_access_key,
                creds.session_token.clone(),
                None,
                "dataset-sync",
            );
            config_loader.credentials_provider(credentials)
        } else {
            config_loader
        };

        let sdk_config = config_loader.load().await;
        let s3_client = S3Client::new(&sdk_config);

        Ok(Self {
            s3_client,
            expected_bucket_owner: settings.expected_bucket_owner,
        })
    }

    /// Create a client from an existing S3Client (for testing).
    pub fn from_client(s3_client: S3Client, expected_bucket_owner: Option<String>) -> Self {
        Self {
            s3_client,
            expected_bucket_owner,
        }
    }

    async fn fetch(&self, bucket: &str, key: &str, file_path: &Path) -> Result<u64, CrtError> {
        let mut request = self.s3_client.get_object().bucket(bucket).key(key);

        if let Some(ref owner) = self.expected_bucket_owner {
            request = request.expected_bucket_owner(owner);
        }

        let response = request.send().await.map_err(|err| {
            let service_err = err.into_service_error();
            if service_err.is_no_such_key() {
                CrtError::NoSuchKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                CrtError::SdkError {
                    message: service_err.to_string(),
                    retryable: true,
                }
            }
        })?;

        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CrtError::io(parent, e))?;
        }

        let mut file = File::create(file_path)
            .await
            .map_err(|e| CrtError::io(file_path, e))?;

        let mut written: u64 = 0;
        let mut body = response.body;
        while let Some(chunk) = body.try_next().await.map_err(|e| CrtError::SdkError {
            message: e.to_string(),
            retryable: true,
        })? {
            file.write_all(&chunk)
                .await
                .map_err(|e| CrtError::io(file_path, e))?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| CrtError::io(file_path, e))?;
        Ok(written)
    }
}

#[async_trait]
impl StorageClient for CrtStorageClient {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut objects: Vec<ObjectInfo> = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .s3_client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);

            if let Some(ref owner) = self.expected_bucket_owner {
                request = request.expected_bucket_owner(owner);
            }

            if let Some(ref token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|err| CrtError::SdkError {
                message: err.to_string(),
                retryable: true,
            })?;

            for obj in response.contents() {
                let last_modified: Option<i64> = obj
                    .last_modified()
                    .and_then(|dt| dt.to_millis().ok())
                    .map(|ms| ms / 1000);

                objects.push(ObjectInfo {
                    key: obj.key().unwrap_or_default().to_string(),
                    size: obj.size().map(|s| s as u64).unwrap_or(0),
                    last_modified,
                    etag: obj.e_tag().map(|s| s.trim_matches('"').to_string()),
                });
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        log::debug!("Listed {} object(s) under s3://{}/{}", objects.len(), bucket, prefix);
        Ok(objects)
    }

    async fn get_object_to_file(
        &self,
        bucket: &str,
        key: &str,
        file_path: &Path,
    ) -> Result<(), StorageError> {
        let bytes: u64 = self.fetch(bucket, key, file_path).await?;
        log::debug!("Downloaded s3://{}/{} ({} bytes)", bucket, key, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crt_client_is_a_storage_client() {
        fn assert_storage_client<T: StorageClient>() {}
        assert_storage_client::<CrtStorageClient>();
    }

    #[tokio::test]
    async fn test_anonymous_client_builds_without_credentials() {
        let settings: S3Settings = S3Settings {
            region: "eu-west-1".into(),
            ..S3Settings::default()
        };
        let client: CrtStorageClient = CrtStorageClient::new(settings).await.unwrap();
        assert!(client.expected_bucket_owner.is_none());
        assert_eq!(
            client.s3_client.config().region().map(|r| r.as_ref()),
            Some("eu-west-1")
        );
    }
}
