//! Fingerprinting and content hashing for one revision directory.
//!
//! A fingerprint is the cheap string `key||size||mtime_ns`. It only tells
//! whether a file looks untouched since it was last fingerprinted; the
//! content hash is the BLAKE2b-512 digest of the file's bytes.
//!
//! Fingerprints persist in `<revision_dir>/.smarthash` as a JSON object
//! mapping manifest key to fingerprint.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use dataset_sync_common::{
    directory_hash, from_posix_path, hash_file, is_directory_key, FINGERPRINT_FILE_NAME,
};
use futures::stream::{self, StreamExt};

use crate::error::FileSystemError;

/// Outcome of hashing a batch where individual files may fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashBatchResult {
    /// Key to content hash for every file that hashed.
    pub hashes: BTreeMap<String, String>,
    /// Key to error message for every file that did not.
    pub failures: BTreeMap<String, String>,
}

impl HashBatchResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Fingerprint table and content hasher for a revision directory.
#[derive(Debug)]
pub struct SmartHash {
    revision_dir: PathBuf,
    fingerprints: HashMap<String, String>,
    concurrency: usize,
}

impl SmartHash {
    /// Open the fingerprint table for a revision directory.
    ///
    /// A missing or unreadable sidecar starts an empty table; every file
    /// then counts as changed until it is fingerprinted again.
    ///
    /// # Arguments
    /// * `revision_dir` - Working tree the manifest keys are relative to
    /// * `concurrency` - Files hashed at once by [`SmartHash::hash`]
    pub fn new(revision_dir: impl Into<PathBuf>, concurrency: usize) -> Self {
        let revision_dir: PathBuf = revision_dir.into();
        let fingerprints: HashMap<String, String> = load_fingerprints(&revision_dir);
        Self {
            revision_dir,
            fingerprints,
            concurrency: concurrency.max(1),
        }
    }

    pub fn revision_dir(&self) -> &Path {
        &self.revision_dir
    }

    /// Point at another revision directory and load its fingerprints.
    pub fn set_revision_dir(&mut self, revision_dir: impl Into<PathBuf>) {
        self.revision_dir = revision_dir.into();
        self.fingerprints = load_fingerprints(&self.revision_dir);
    }

    /// Location of the fingerprint sidecar.
    pub fn fingerprint_file(&self) -> PathBuf {
        self.revision_dir.join(FINGERPRINT_FILE_NAME)
    }

    /// Stored fingerprint for a key, if any.
    pub fn fingerprint(&self, key: &str) -> Option<&str> {
        self.fingerprints.get(key).map(String::as_str)
    }

    /// Compute fingerprints for `keys`, record them, and return them in order.
    ///
    /// # Arguments
    /// * `keys` - Manifest keys to fingerprint
    /// * `save` - Whether to write the table to the sidecar afterwards
    ///
    /// # Errors
    /// Returns error if a path cannot be stat'ed or the sidecar cannot be
    /// written.
    pub fn fast_hash(&mut self, keys: &[String], save: bool) -> Result<Vec<String>, FileSystemError> {
        let mut result: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            let fingerprint: String = compute_fingerprint(&self.revision_dir, key)?;
            self.fingerprints.insert(key.clone(), fingerprint.clone());
            result.push(fingerprint);
        }

        if save {
            self.save()?;
        }
        Ok(result)
    }

    /// Whether a file differs from its stored fingerprint.
    ///
    /// Anything that prevents a comparison, including a missing fingerprint
    /// or a failed stat, counts as changed.
    pub fn has_changed_fast(&self, key: &str) -> bool {
        let stored: &String = match self.fingerprints.get(key) {
            Some(f) => f,
            None => return true,
        };
        match compute_fingerprint(&self.revision_dir, key) {
            Ok(current) => &current != stored,
            Err(_) => true,
        }
    }

    /// Content hashes for `keys`, positionally aligned with the input.
    ///
    /// Files are hashed on blocking tasks, at most `concurrency` at a time.
    /// Directory keys hash the directory sentinel without touching disk.
    ///
    /// # Errors
    /// Returns the first failure; use [`SmartHash::hash_partial`] to keep
    /// going past unreadable files.
    pub async fn hash(&self, keys: &[String]) -> Result<Vec<String>, FileSystemError> {
        let results: Vec<Result<String, FileSystemError>> =
            hash_keys(&self.revision_dir, keys, self.concurrency).await;
        results.into_iter().collect()
    }

    /// Content hashes for `keys`, recording failures instead of stopping.
    pub async fn hash_partial(&self, keys: &[String]) -> HashBatchResult {
        let results: Vec<Result<String, FileSystemError>> =
            hash_keys(&self.revision_dir, keys, self.concurrency).await;

        let mut batch: HashBatchResult = HashBatchResult::default();
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(hash) => {
                    batch.hashes.insert(key.clone(), hash);
                }
                Err(e) => {
                    log::warn!("Failed to hash {}: {}", key, e);
                    batch.failures.insert(key.clone(), e.to_string());
                }
            }
        }
        batch
    }

    /// Previously fingerprinted keys that are absent from `current`, sorted.
    pub fn get_deleted_files(&self, current: &[String]) -> Vec<String> {
        let current: BTreeSet<&str> = current.iter().map(String::as_str).collect();
        let mut deleted: Vec<String> = self
            .fingerprints
            .keys()
            .filter(|key: &&String| !current.contains(key.as_str()))
            .cloned()
            .collect();
        deleted.sort();
        deleted
    }

    /// Drop fingerprints for keys that no longer exist.
    pub fn forget(&mut self, keys: &[String]) {
        for key in keys {
            self.fingerprints.remove(key);
        }
    }

    /// Number of fingerprinted keys.
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Write the fingerprint table to the sidecar.
    pub fn save(&self) -> Result<(), FileSystemError> {
        let path: PathBuf = self.fingerprint_file();
        let sorted: BTreeMap<&String, &String> = self.fingerprints.iter().collect();
        let json: String =
            serde_json::to_string(&sorted).map_err(|e| FileSystemError::FingerprintWrite {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        std::fs::create_dir_all(&self.revision_dir)
            .map_err(|e| FileSystemError::io(&self.revision_dir, e))?;
        let tmp: PathBuf = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| FileSystemError::io(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| FileSystemError::io(&path, e))?;
        Ok(())
    }
}

/// Content hashes for `keys` under `revision_dir`, order-preserving.
///
/// # Arguments
/// * `revision_dir` - Directory the keys are relative to
/// * `keys` - Manifest keys to hash
/// * `concurrency` - Maximum files hashed at once
pub async fn hash_keys(
    revision_dir: &Path,
    keys: &[String],
    concurrency: usize,
) -> Vec<Result<String, FileSystemError>> {
    stream::iter(keys.iter().cloned())
        .map(|key: String| {
            let path: PathBuf = from_posix_path(&key, revision_dir);
            async move { hash_one(key, path).await }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

async fn hash_one(key: String, path: PathBuf) -> Result<String, FileSystemError> {
    if is_directory_key(&key) {
        return Ok(directory_hash());
    }

    let display: String = path.display().to_string();
    let joined: Result<Result<String, std::io::Error>, tokio::task::JoinError> =
        tokio::task::spawn_blocking(move || hash_file(&path)).await;

    match joined {
        Ok(Ok(hash)) => Ok(hash),
        Ok(Err(source)) => Err(FileSystemError::IoError {
            path: display,
            source,
        }),
        Err(e) => Err(FileSystemError::HashTask {
            path: display,
            message: e.to_string(),
        }),
    }
}

fn compute_fingerprint(revision_dir: &Path, key: &str) -> Result<String, FileSystemError> {
    let path: PathBuf = from_posix_path(key, revision_dir);
    let metadata: std::fs::Metadata =
        std::fs::metadata(&path).map_err(|e| FileSystemError::io(&path, e))?;
    let size: u64 = if metadata.is_dir() { 0 } else { metadata.len() };
    let mtime_ns: u128 = metadata
        .modified()
        .map_err(|e| FileSystemError::io(&path, e))?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(format!("{}||{}||{}", key, size, mtime_ns))
}

fn load_fingerprints(revision_dir: &Path) -> HashMap<String, String> {
    let path: PathBuf = revision_dir.join(FINGERPRINT_FILE_NAME);
    let text: String = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to read fingerprint file {}: {}", path.display(), e);
            }
            return HashMap::new();
        }
    };
    match serde_json::from_str(&text) {
        Ok(map) => map,
        Err(e) => {
            log::warn!("Ignoring corrupt fingerprint file {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataset_sync_common::hash_bytes;
    use filetime::FileTime;
    use std::io::Write;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s: &&str| s.to_string()).collect()
    }

    #[test]
    fn test_fast_hash_format() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test1.txt"), b"asdfadfsdf").unwrap();
        filetime::set_file_mtime(
            dir.path().join("test1.txt"),
            FileTime::from_unix_time(1_700_000_000, 5),
        )
        .unwrap();

        let mut smarthash: SmartHash = SmartHash::new(dir.path(), 2);
        let result: Vec<String> = smarthash.fast_hash(&keys(&["test1.txt"]), false).unwrap();
        assert_eq!(result, vec!["test1.txt||10||1700000000000000005"]);
        assert!(!smarthash.fingerprint_file().exists());
    }

    #[test]
    fn test_has_changed_fast_lifecycle() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("a.txt");
        std::fs::write(&path, b"first").unwrap();

        let mut smarthash: SmartHash = SmartHash::new(dir.path(), 2);
        assert!(smarthash.has_changed_fast("a.txt"));

        smarthash.fast_hash(&keys(&["a.txt"]), true).unwrap();
        assert!(!smarthash.has_changed_fast("a.txt"));

        let mut file: std::fs::File = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b" more").unwrap();
        drop(file);
        assert!(smarthash.has_changed_fast("a.txt"));

        smarthash.fast_hash(&keys(&["a.txt"]), true).unwrap();
        assert!(!smarthash.has_changed_fast("a.txt"));

        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_000_000_000, 0)).unwrap();
        assert!(smarthash.has_changed_fast("a.txt"));
    }

    #[test]
    fn test_has_changed_fast_missing_file() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone.txt"), b"x").unwrap();
        let mut smarthash: SmartHash = SmartHash::new(dir.path(), 1);
        smarthash.fast_hash(&keys(&["gone.txt"]), false).unwrap();

        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();
        assert!(smarthash.has_changed_fast("gone.txt"));
    }

    #[test]
    fn test_fingerprints_survive_reload() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        {
            let mut smarthash: SmartHash = SmartHash::new(dir.path(), 1);
            smarthash.fast_hash(&keys(&["a.txt"]), true).unwrap();
        }

        let reloaded: SmartHash = SmartHash::new(dir.path(), 1);
        assert_eq!(reloaded.len(), 1);
        assert!(!reloaded.has_changed_fast("a.txt"));
    }

    #[test]
    fn test_corrupt_sidecar_starts_empty() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".smarthash"), b"{not json").unwrap();
        let smarthash: SmartHash = SmartHash::new(dir.path(), 1);
        assert!(smarthash.is_empty());
    }

    #[test]
    fn test_get_deleted_files_is_sorted_difference() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        for name in ["c.txt", "a.txt", "b.txt", "d.txt"] {
            std::fs::write(dir.path().join(name), name.as_bytes()).unwrap();
        }
        let mut smarthash: SmartHash = SmartHash::new(dir.path(), 1);
        smarthash
            .fast_hash(&keys(&["c.txt", "a.txt", "b.txt", "d.txt"]), false)
            .unwrap();

        assert_eq!(
            smarthash.get_deleted_files(&keys(&["b.txt", "new.txt"])),
            keys(&["a.txt", "c.txt", "d.txt"])
        );
        assert!(smarthash
            .get_deleted_files(&keys(&["a.txt", "b.txt", "c.txt", "d.txt"]))
            .is_empty());

        smarthash.forget(&keys(&["a.txt"]));
        assert_eq!(
            smarthash.get_deleted_files(&keys(&["b.txt"])),
            keys(&["c.txt", "d.txt"])
        );
    }

    #[tokio::test]
    async fn test_hash_matches_single_shot_and_keeps_order() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("other_dir")).unwrap();
        std::fs::write(dir.path().join("test1.txt"), b"asdfadfsdf").unwrap();

        let big: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i: usize| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("big.bin"), &big).unwrap();

        let smarthash: SmartHash = SmartHash::new(dir.path(), 3);
        let hashes: Vec<String> = smarthash
            .hash(&keys(&["big.bin", "other_dir/", "test1.txt"]))
            .await
            .unwrap();

        assert_eq!(hashes[0], hash_bytes(&big));
        assert_eq!(hashes[1], directory_hash());
        assert_eq!(hashes[2], hash_bytes(b"asdfadfsdf"));
    }

    #[tokio::test]
    async fn test_multi_chunk_files_match_single_shot() {
        let chunk: usize = dataset_sync_common::HASH_READ_BUFFER_SIZE;
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let sizes: [usize; 3] = [5 * chunk + 12_345, 4 * chunk, chunk - 1];
        let mut expected: Vec<String> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        for (n, size) in sizes.iter().enumerate() {
            let data: Vec<u8> = (0..*size).map(|i: usize| ((i * 7 + n) % 253) as u8).collect();
            let name: String = format!("chunked-{}.bin", n);
            std::fs::write(dir.path().join(&name), &data).unwrap();
            expected.push(hash_bytes(&data));
            names.push(name);
        }

        let smarthash: SmartHash = SmartHash::new(dir.path(), 2);
        assert_eq!(smarthash.hash(&names).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_hash_fails_fast_and_partial_keeps_going() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), b"ok").unwrap();

        let smarthash: SmartHash = SmartHash::new(dir.path(), 2);
        let input: Vec<String> = keys(&["ok.txt", "missing.txt"]);

        let result: Result<Vec<String>, FileSystemError> = smarthash.hash(&input).await;
        assert!(result.unwrap_err().is_not_found());

        let partial: HashBatchResult = smarthash.hash_partial(&input).await;
        assert_eq!(partial.hashes.get("ok.txt"), Some(&hash_bytes(b"ok")));
        assert!(partial.failures.contains_key("missing.txt"));
        assert!(!partial.is_complete());
    }
}
