//! Job submission seam and an in-process implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dataset_sync_filesystem::{hash_keys, FileSystemError};

use crate::error::JobError;
use crate::types::{HashingJob, JobHandle, JobMetadata, JobStatus};

/// Submits hashing jobs to workers and reports on them.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Submit a job. The returned handle is polled with [`status`](Self::status).
    async fn dispatch(&self, job: HashingJob, metadata: JobMetadata) -> Result<JobHandle, JobError>;

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, JobError>;
}

type StatusTable = Arc<Mutex<HashMap<JobHandle, JobStatus>>>;

/// Runs each job on the tokio blocking pool of the current process.
#[derive(Clone)]
pub struct LocalDispatcher {
    concurrency: usize,
    jobs: StatusTable,
}

impl LocalDispatcher {
    /// # Arguments
    /// * `concurrency` - Files hashed at once within one job
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn set_status(jobs: &StatusTable, handle: &JobHandle, status: JobStatus) {
        let mut table = jobs.lock().unwrap_or_else(|e| e.into_inner());
        table.insert(handle.clone(), status);
    }
}

#[async_trait]
impl JobDispatcher for LocalDispatcher {
    async fn dispatch(&self, job: HashingJob, metadata: JobMetadata) -> Result<JobHandle, JobError> {
        let handle: JobHandle = JobHandle(uuid::Uuid::new_v4().to_string());
        Self::set_status(&self.jobs, &handle, JobStatus::Queued);
        log::debug!(
            "Dispatching hashing job {} for {} ({} files, {} bytes, attempt {})",
            job.job_id,
            metadata.dataset_id,
            job.keys.len(),
            job.total_bytes,
            metadata.attempt
        );

        let jobs: StatusTable = Arc::clone(&self.jobs);
        let task_handle: JobHandle = handle.clone();
        let concurrency: usize = self.concurrency;
        tokio::spawn(async move {
            Self::set_status(&jobs, &task_handle, JobStatus::Running);
            let results: Vec<Result<String, FileSystemError>> =
                hash_keys(&job.revision_dir, &job.keys, concurrency).await;

            let mut hashes: BTreeMap<String, String> = BTreeMap::new();
            let mut failure: Option<String> = None;
            for (key, result) in job.keys.iter().zip(results) {
                match result {
                    Ok(hash) => {
                        hashes.insert(key.clone(), hash);
                    }
                    Err(e) => {
                        failure = Some(format!("{}: {}", key, e));
                        break;
                    }
                }
            }
            let status: JobStatus = match failure {
                Some(message) => JobStatus::Failed(message),
                None => JobStatus::Finished(hashes),
            };
            Self::set_status(&jobs, &task_handle, status);
        });

        Ok(handle)
    }

    /// Current status of a job. A terminal status is reported once; the
    /// handle is unknown afterwards.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, JobError> {
        let mut table = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let status: JobStatus = table.get(handle).cloned().ok_or_else(|| JobError::UnknownJob {
            handle: handle.to_string(),
        })?;
        if status.is_terminal() {
            table.remove(handle);
        }
        Ok(status)
    }
}
