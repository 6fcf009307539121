//! Fan-out of content hashing for a large upload.
//!
//! The changed files of a revision are split into byte-balanced jobs, one
//! per hashing core. Jobs are polled until each one finishes or has failed
//! `max_hash_job_attempts` times; only then is the manifest updated, with
//! the files of exhausted jobs left out and reported back. The repository
//! lock is held from the status through the commit.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dataset_sync_common::{
    directory_hash, from_posix_path, is_directory_key, CountProgress, ProgressCallback,
    SyncSettings,
};
use dataset_sync_manifest::{
    ActivityRecord, DatasetRepository, Manifest, RepositoryLock, StatusResult,
};

use crate::dispatcher::JobDispatcher;
use crate::error::JobError;
use crate::types::{HashingJob, JobHandle, JobMetadata, JobStatus, PendingFile};

/// Outcome of [`complete_dataset_upload_transaction`].
#[derive(Debug, Clone, Default)]
pub struct UploadTransactionResult {
    /// Activity recorded for the committed changes, `None` if nothing was committed.
    pub record: Option<ActivityRecord>,
    /// Files left uncommitted because their job exhausted its attempts, sorted.
    pub failed_paths: Vec<String>,
    /// Jobs submitted, retries included.
    pub dispatched: usize,
}

/// Split files into at most `max_jobs` jobs of similar total size.
///
/// Files are placed largest first, each into the currently lightest job.
/// Empty jobs are dropped; keys within a job are sorted.
pub fn split_jobs_by_bytes(mut files: Vec<PendingFile>, max_jobs: usize) -> Vec<Vec<PendingFile>> {
    let bins: usize = max_jobs.max(1).min(files.len());
    files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.key.cmp(&b.key)));

    let mut jobs: Vec<(u64, Vec<PendingFile>)> = (0..bins).map(|_| (0, Vec::new())).collect();
    for file in files {
        // Lightest job, lowest index on ties.
        let target: usize = jobs
            .iter()
            .enumerate()
            .min_by_key(|(i, (bytes, _))| (*bytes, *i))
            .map(|(i, _)| i)
            .unwrap_or(0);
        jobs[target].0 += file.size;
        jobs[target].1.push(file);
    }

    jobs.into_iter()
        .filter(|(_, files)| !files.is_empty())
        .map(|(_, mut files)| {
            files.sort_by(|a, b| a.key.cmp(&b.key));
            files
        })
        .collect()
}

struct ActiveJob {
    job: HashingJob,
    attempt: u32,
    /// `Err` holds the dispatch failure.
    handle: Result<JobHandle, String>,
}

async fn submit(
    dispatcher: &dyn JobDispatcher,
    job: &HashingJob,
    metadata: JobMetadata,
) -> Result<JobHandle, String> {
    dispatcher
        .dispatch(job.clone(), metadata)
        .await
        .map_err(|e| e.to_string())
}

async fn poll(dispatcher: &dyn JobDispatcher, active: &ActiveJob) -> JobStatus {
    match &active.handle {
        Ok(handle) => match dispatcher.status(handle).await {
            Ok(status) => status,
            Err(e) => JobStatus::Failed(e.to_string()),
        },
        Err(message) => JobStatus::Failed(message.clone()),
    }
}

/// Hash a revision's changed files through background jobs, then commit.
///
/// Other writers of the dataset wait on the repository lock until the
/// transaction commits or fails.
///
/// # Arguments
/// * `manifest` - Manifest of the dataset whose working tree changed
/// * `dispatcher` - Where hashing jobs run
/// * `settings` - Job count, retry cap and poll interval
/// * `progress` - Files settled so far; returning `false` abandons the
///   transaction before anything is committed
///
/// # Errors
/// Returns `Cancelled` if progress asked to stop, and manifest errors from
/// computing the status or committing it.
pub async fn complete_dataset_upload_transaction(
    manifest: &mut Manifest,
    dispatcher: &dyn JobDispatcher,
    settings: &SyncSettings,
    progress: &dyn ProgressCallback<CountProgress>,
) -> Result<UploadTransactionResult, JobError> {
    let repository: Arc<dyn DatasetRepository> = Arc::clone(manifest.repository());
    let lock: RepositoryLock = repository.lock().await;
    manifest.refresh_revision().await?;
    let status: StatusResult = manifest.status().await?;
    if status.is_empty() {
        return Ok(UploadTransactionResult::default());
    }

    let revision_dir: PathBuf = manifest.current_revision_dir();
    let mut hashes: BTreeMap<String, String> = BTreeMap::new();
    let mut pending: Vec<PendingFile> = Vec::new();
    for key in status.unhashed() {
        if is_directory_key(&key) {
            hashes.insert(key, directory_hash());
        } else {
            let size: u64 = file_size(&revision_dir, &key)?;
            pending.push(PendingFile { key, size });
        }
    }

    let total: u64 = pending.len() as u64;
    let max_attempts: u32 = settings.max_hash_job_attempts.max(1);
    let mut result: UploadTransactionResult = UploadTransactionResult::default();
    let mut active: Vec<ActiveJob> = Vec::new();
    for (job_id, files) in split_jobs_by_bytes(pending, settings.hash_concurrency)
        .into_iter()
        .enumerate()
    {
        let job: HashingJob = HashingJob {
            job_id,
            revision_dir: revision_dir.clone(),
            total_bytes: files.iter().map(|f| f.size).sum(),
            keys: files.into_iter().map(|f| f.key).collect(),
        };
        let handle: Result<JobHandle, String> =
            submit(dispatcher, &job, job_metadata(manifest, 1)).await;
        result.dispatched += 1;
        active.push(ActiveJob {
            job,
            attempt: 1,
            handle,
        });
    }
    log::info!(
        "Hashing {} file(s) of {} in {} job(s)",
        total,
        manifest.dataset_id(),
        active.len()
    );

    let mut settled: u64 = 0;
    while !active.is_empty() {
        tokio::time::sleep(settings.job_poll_interval()).await;

        let mut still_active: Vec<ActiveJob> = Vec::with_capacity(active.len());
        for mut current in active {
            match poll(dispatcher, &current).await {
                JobStatus::Queued | JobStatus::Running => still_active.push(current),
                JobStatus::Finished(job_hashes) => {
                    for key in &current.job.keys {
                        match job_hashes.get(key) {
                            Some(hash) => {
                                hashes.insert(key.clone(), hash.clone());
                            }
                            None => {
                                log::warn!("Hashing job {} returned no hash for {}", current.job.job_id, key);
                                result.failed_paths.push(key.clone());
                            }
                        }
                    }
                    settled += current.job.keys.len() as u64;
                    report(progress, settled, total)?;
                }
                JobStatus::Failed(message) if current.attempt < max_attempts => {
                    log::warn!(
                        "Hashing job {} failed on attempt {}: {}",
                        current.job.job_id,
                        current.attempt,
                        message
                    );
                    current.attempt += 1;
                    current.handle = submit(
                        dispatcher,
                        &current.job,
                        job_metadata(manifest, current.attempt),
                    )
                    .await;
                    result.dispatched += 1;
                    still_active.push(current);
                }
                JobStatus::Failed(message) => {
                    log::error!(
                        "Hashing job {} gave up after {} attempts: {}",
                        current.job.job_id,
                        current.attempt,
                        message
                    );
                    settled += current.job.keys.len() as u64;
                    result.failed_paths.extend(current.job.keys);
                    report(progress, settled, total)?;
                }
            }
        }
        active = still_active;
    }

    result.failed_paths.sort();
    let commit: StatusResult = without_failed(&status, &hashes, &result.failed_paths);
    result.record = manifest.apply_status_locked(&lock, &commit, None).await?;
    if !result.failed_paths.is_empty() {
        log::warn!(
            "{} file(s) of {} were not committed because hashing failed",
            result.failed_paths.len(),
            manifest.dataset_id()
        );
    }
    Ok(result)
}

fn job_metadata(manifest: &Manifest, attempt: u32) -> JobMetadata {
    JobMetadata {
        dataset_id: manifest.dataset_id().to_string(),
        revision: manifest.revision().to_string(),
        attempt,
    }
}

fn file_size(revision_dir: &Path, key: &str) -> Result<u64, JobError> {
    let path: PathBuf = from_posix_path(key, revision_dir);
    std::fs::metadata(&path)
        .map(|m| m.len())
        .map_err(|e| JobError::io(&path, e))
}

fn report(
    progress: &dyn ProgressCallback<CountProgress>,
    completed: u64,
    total: u64,
) -> Result<(), JobError> {
    if progress.on_progress(&CountProgress::new(completed, total)) {
        Ok(())
    } else {
        Err(JobError::Cancelled)
    }
}

/// The status minus failed paths, with every remaining hash filled in.
fn without_failed(
    status: &StatusResult,
    hashes: &BTreeMap<String, String>,
    failed: &[String],
) -> StatusResult {
    let failed: HashSet<&str> = failed.iter().map(String::as_str).collect();
    let keep = |keys: &[String]| -> Vec<String> {
        keys.iter()
            .filter(|k| !failed.contains(k.as_str()))
            .cloned()
            .collect()
    };

    let mut commit: StatusResult = StatusResult::new(
        keep(&status.created),
        keep(&status.modified),
        status.deleted.clone(),
    );
    for key in commit.changed_paths() {
        let hash: Option<String> = status
            .hash_of(&key)
            .map(str::to_string)
            .or_else(|| hashes.get(&key).cloned());
        if let Some(hash) = hash {
            commit.set_hash(key, hash);
        }
    }
    commit
}
