//! Git-free repository for datasets managed on their own.
//!
//! Each activity record is appended to `<root>/.activity.jsonl` and starts a
//! new revision. Branches are snapshots of the `manifest/` directory kept
//! under `<root>/.branches/<name>/`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dataset_sync_common::MANIFEST_DIR_NAME;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityRecord;
use crate::context::{DatasetRepository, RepositoryLock};
use crate::error::ManifestError;

const STATE_FILE_NAME: &str = ".repository.json";
const ACTIVITY_LOG_NAME: &str = ".activity.jsonl";
const BRANCHES_DIR_NAME: &str = ".branches";
const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RepoState {
    branch: String,
    revision: String,
}

/// One line of the activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedActivity {
    /// Revision created by this record.
    pub revision: String,
    /// Branch the record was made on.
    pub branch: String,
    pub record: ActivityRecord,
}

/// A dataset repository backed by plain files.
pub struct StandaloneRepository {
    root_dir: PathBuf,
    cache_root: PathBuf,
    dataset_id: String,
    state: Mutex<RepoState>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl StandaloneRepository {
    /// Open a repository, creating it on first use.
    ///
    /// # Arguments
    /// * `root_dir` - Dataset root (holds `manifest/` and the activity log)
    /// * `cache_root` - Object store and revision working trees
    /// * `dataset_id` - Identifier used in cache keys and lock checks
    pub fn open(
        root_dir: impl Into<PathBuf>,
        cache_root: impl Into<PathBuf>,
        dataset_id: impl Into<String>,
    ) -> Result<Self, ManifestError> {
        let root_dir: PathBuf = root_dir.into();
        let cache_root: PathBuf = cache_root.into();
        let manifest_dir: PathBuf = root_dir.join(MANIFEST_DIR_NAME);
        std::fs::create_dir_all(&manifest_dir).map_err(|e| ManifestError::io(&manifest_dir, e))?;
        std::fs::create_dir_all(&cache_root).map_err(|e| ManifestError::io(&cache_root, e))?;

        let state_path: PathBuf = root_dir.join(STATE_FILE_NAME);
        let state: RepoState = match std::fs::read(&state_path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| ManifestError::corrupt(&state_path, e))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let fresh: RepoState = RepoState {
                    branch: DEFAULT_BRANCH.to_string(),
                    revision: new_revision_id(),
                };
                write_state(&state_path, &fresh)?;
                fresh
            }
            Err(e) => return Err(ManifestError::io(&state_path, e)),
        };

        Ok(Self {
            root_dir,
            cache_root,
            dataset_id: dataset_id.into(),
            state: Mutex::new(state),
            lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn current_branch(&self) -> String {
        self.state().branch.clone()
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root_dir.join(MANIFEST_DIR_NAME)
    }

    /// Names of every branch, sorted.
    pub fn branches(&self) -> Result<Vec<String>, ManifestError> {
        let dir: PathBuf = self.root_dir.join(BRANCHES_DIR_NAME);
        let mut names: Vec<String> = vec![self.current_branch()];
        if let Ok(read_dir) = std::fs::read_dir(&dir) {
            for item in read_dir {
                let item: std::fs::DirEntry = item.map_err(|e| ManifestError::io(&dir, e))?;
                names.push(item.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Create a branch at the current revision and switch to it.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the branch name is taken.
    pub fn create_branch(&self, name: &str) -> Result<(), ManifestError> {
        validate_branch_name(name)?;
        if self.branches()?.iter().any(|b: &String| b == name) {
            return Err(ManifestError::AlreadyExists {
                path: format!("branch {}", name),
            });
        }

        let mut state: MutexGuard<'_, RepoState> = self.state();
        self.snapshot(&state)?;
        state.branch = name.to_string();
        self.snapshot(&state)?;
        write_state(&self.root_dir.join(STATE_FILE_NAME), &state)?;
        log::info!("Created branch {} at revision {}", name, state.revision);
        Ok(())
    }

    /// Switch to an existing branch, restoring its manifest and revision.
    ///
    /// # Errors
    /// Returns `NotFound` if the branch does not exist.
    pub fn checkout(&self, name: &str) -> Result<(), ManifestError> {
        let mut state: MutexGuard<'_, RepoState> = self.state();
        if state.branch == name {
            return Ok(());
        }

        let branch_dir: PathBuf = self.branch_dir(name);
        let saved_state_path: PathBuf = branch_dir.join(STATE_FILE_NAME);
        let saved: RepoState = match std::fs::read(&saved_state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ManifestError::corrupt(&saved_state_path, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound {
                    path: format!("branch {}", name),
                })
            }
            Err(e) => return Err(ManifestError::io(&saved_state_path, e)),
        };

        self.snapshot(&state)?;
        replace_dir_contents(&branch_dir.join(MANIFEST_DIR_NAME), &self.manifest_dir())?;
        *state = saved;
        write_state(&self.root_dir.join(STATE_FILE_NAME), &state)?;
        log::info!("Checked out branch {} at revision {}", name, state.revision);
        Ok(())
    }

    /// Every activity record written so far, oldest first.
    pub fn activity_log(&self) -> Result<Vec<LoggedActivity>, ManifestError> {
        let path: PathBuf = self.root_dir.join(ACTIVITY_LOG_NAME);
        let text: String = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ManifestError::io(&path, e)),
        };

        let mut records: Vec<LoggedActivity> = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!(
                    "Skipping malformed activity record {} in {}: {}",
                    index + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }

    fn state(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn branch_dir(&self, name: &str) -> PathBuf {
        self.root_dir.join(BRANCHES_DIR_NAME).join(name)
    }

    fn snapshot(&self, state: &RepoState) -> Result<(), ManifestError> {
        let branch_dir: PathBuf = self.branch_dir(&state.branch);
        replace_dir_contents(&self.manifest_dir(), &branch_dir.join(MANIFEST_DIR_NAME))?;
        write_state(&branch_dir.join(STATE_FILE_NAME), state)
    }
}

#[async_trait]
impl DatasetRepository for StandaloneRepository {
    fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    fn revision(&self) -> String {
        self.state().revision.clone()
    }

    async fn lock(&self) -> RepositoryLock {
        let guard: tokio::sync::OwnedMutexGuard<()> = self.lock.clone().lock_owned().await;
        RepositoryLock::new(self.dataset_id.clone(), guard)
    }

    async fn create_activity_record(&self, record: &ActivityRecord) -> Result<String, ManifestError> {
        let mut state: MutexGuard<'_, RepoState> = self.state();
        let revision: String = new_revision_id();
        let logged: LoggedActivity = LoggedActivity {
            revision: revision.clone(),
            branch: state.branch.clone(),
            record: record.clone(),
        };

        let path: PathBuf = self.root_dir.join(ACTIVITY_LOG_NAME);
        let mut line: String =
            serde_json::to_string(&logged).map_err(|e| ManifestError::corrupt(&path, e))?;
        line.push('\n');
        let mut file: std::fs::File = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ManifestError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ManifestError::io(&path, e))?;

        state.revision = revision.clone();
        write_state(&self.root_dir.join(STATE_FILE_NAME), &state)?;
        log::debug!("Recorded activity on {}: {}", state.branch, record.message);
        Ok(revision)
    }
}

fn new_revision_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn validate_branch_name(name: &str) -> Result<(), ManifestError> {
    let valid: bool = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ManifestError::InvalidPath {
            path: name.to_string(),
            message: "branch names may only contain letters, digits, '-', '_' and '.'".into(),
        })
    }
}

fn write_state(path: &Path, state: &RepoState) -> Result<(), ManifestError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
    }
    let json: Vec<u8> = serde_json::to_vec(state).map_err(|e| ManifestError::corrupt(path, e))?;
    std::fs::write(path, json).map_err(|e| ManifestError::io(path, e))
}

/// Make `dst` hold exactly the regular files of `src`.
fn replace_dir_contents(src: &Path, dst: &Path) -> Result<(), ManifestError> {
    if dst.exists() {
        std::fs::remove_dir_all(dst).map_err(|e| ManifestError::io(dst, e))?;
    }
    std::fs::create_dir_all(dst).map_err(|e| ManifestError::io(dst, e))?;

    let read_dir = match std::fs::read_dir(src) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ManifestError::io(src, e)),
    };
    for item in read_dir {
        let item: std::fs::DirEntry = item.map_err(|e| ManifestError::io(src, e))?;
        if item.file_type().map(|t| t.is_file()).unwrap_or(false) {
            let target: PathBuf = dst.join(item.file_name());
            std::fs::copy(item.path(), &target).map_err(|e| ManifestError::io(&target, e))?;
        }
    }
    Ok(())
}
