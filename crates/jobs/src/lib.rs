//! Background hashing for large dataset uploads.
//!
//! This crate provides:
//! - `JobDispatcher` - Submission and polling of hashing jobs, with
//!   `LocalDispatcher` running them in-process
//! - `split_jobs_by_bytes()` - Byte-balanced sharding of changed files
//! - `complete_dataset_upload_transaction()` - Dispatch, retry and commit

pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod types;

pub use coordinator::{complete_dataset_upload_transaction, split_jobs_by_bytes, UploadTransactionResult};
pub use dispatcher::{JobDispatcher, LocalDispatcher};
pub use error::JobError;
pub use types::{HashingJob, JobHandle, JobMetadata, JobStatus, PendingFile};
