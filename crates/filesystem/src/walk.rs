//! Revision directory walking.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dataset_sync_common::normalize_for_manifest;
use walkdir::WalkDir;

use crate::error::FileSystemError;
use crate::glob::GlobFilter;

/// One file or directory found under a revision directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Manifest key (POSIX, directories end with `/`).
    pub key: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// File size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
}

/// Walk a revision directory and return every tracked entry, sorted by key.
///
/// Ignored directories are pruned, so nothing beneath them is visited.
/// Symlinks are skipped with a warning since the working tree is built from
/// hard links only.
///
/// # Arguments
/// * `root` - Revision directory to walk
/// * `filter` - Exclusion filter applied to manifest keys
///
/// # Errors
/// Returns error if the directory tree cannot be read.
pub fn walk_revision_dir(root: &Path, filter: &GlobFilter) -> Result<Vec<WalkEntry>, FileSystemError> {
    let mut entries: Vec<WalkEntry> = Vec::new();

    if !root.exists() {
        return Ok(entries);
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry: &walkdir::DirEntry| {
            let is_dir: bool = entry.file_type().is_dir();
            match normalize_for_manifest(entry.path(), root, is_dir) {
                Ok(key) => filter.matches(&key),
                Err(_) => false,
            }
        });

    for entry in walker {
        let entry: walkdir::DirEntry = entry.map_err(|e| {
            let path: String = e
                .path()
                .map(|p: &Path| p.display().to_string())
                .unwrap_or_default();
            FileSystemError::IoError {
                path,
                source: e.into(),
            }
        })?;

        let file_type: std::fs::FileType = entry.file_type();
        if file_type.is_symlink() {
            log::warn!("Skipping symlink in revision directory: {}", entry.path().display());
            continue;
        }

        let is_dir: bool = file_type.is_dir();
        let key: String = normalize_for_manifest(entry.path(), root, is_dir)?;
        let metadata: std::fs::Metadata = entry
            .metadata()
            .map_err(|e| FileSystemError::IoError {
                path: entry.path().display().to_string(),
                source: e.into(),
            })?;

        entries.push(WalkEntry {
            path: entry.path().to_path_buf(),
            key,
            is_dir,
            size: if is_dir { 0 } else { metadata.len() },
            modified: metadata.modified().map_err(|e| FileSystemError::io(entry.path(), e))?,
        });
    }

    entries.sort_by(|a: &WalkEntry, b: &WalkEntry| a.key.cmp(&b.key));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_lists_files_and_directories() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"12345").unwrap();

        let entries: Vec<WalkEntry> = walk_revision_dir(dir.path(), &GlobFilter::new()).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e: &WalkEntry| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a/", "a/b/", "a/b/c.txt", "top.txt"]);

        let top: &WalkEntry = entries.iter().find(|e| e.key == "top.txt").unwrap();
        assert_eq!(top.size, 5);
        assert!(!top.is_dir);
    }

    #[test]
    fn test_walk_prunes_ignored_directories() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cache/deep")).unwrap();
        std::fs::write(dir.path().join("cache/deep/x.bin"), b"x").unwrap();
        std::fs::write(dir.path().join(".smarthash"), b"{}").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"k").unwrap();

        let filter: GlobFilter = GlobFilter::exclude(vec![
            ".smarthash".to_string(),
            "cache".to_string(),
        ])
        .unwrap();
        let entries: Vec<WalkEntry> = walk_revision_dir(dir.path(), &filter).unwrap();
        let keys: Vec<&str> = entries.iter().map(|e: &WalkEntry| e.key.as_str()).collect();
        assert_eq!(keys, vec!["keep.txt"]);
    }

    #[test]
    fn test_walk_missing_root_is_empty() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let entries: Vec<WalkEntry> =
            walk_revision_dir(&dir.path().join("missing"), &GlobFilter::new()).unwrap();
        assert!(entries.is_empty());
    }
}
