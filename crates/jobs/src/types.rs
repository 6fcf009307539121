//! Jobs, their handles and their lifecycle.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A changed file waiting for its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    /// Manifest key.
    pub key: String,
    /// Size in bytes, used to balance jobs.
    pub size: u64,
}

/// One shard of hashing work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashingJob {
    /// Position of the job in its transaction.
    pub job_id: usize,
    /// Working tree the keys are relative to.
    pub revision_dir: PathBuf,
    /// Manifest keys to hash, sorted.
    pub keys: Vec<String>,
    /// Sum of the files' sizes.
    pub total_bytes: u64,
}

/// Context submitted with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub dataset_id: String,
    pub revision: String,
    /// 1 for the first submission, incremented on every retry.
    pub attempt: u32,
}

/// Opaque id returned by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a dispatched job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Submitted, not picked up yet.
    Queued,
    Running,
    /// Content hash per manifest key. Terminal.
    Finished(BTreeMap<String, String>),
    /// Terminal.
    Failed(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Failed(_))
    }
}
