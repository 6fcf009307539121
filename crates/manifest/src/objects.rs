//! Content-addressed object store and revision working trees.
//!
//! Layout under a dataset's cache root:
//!
//! ```text
//! <cache_root>/objects/<h[0..8]>/<h[8..16]>/<h[16..]>   content objects
//! <cache_root>/objects/.push/<revision>/<hash>         pending uploads
//! <cache_root>/objects/.refcounts.json                 reference table
//! <cache_root>/<revision>/                             working tree
//! ```
//!
//! A push marker is a text file listing, one per line, the dataset paths
//! that reference the object in that revision. Its presence means the
//! object still needs uploading.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use dataset_sync_common::DIRECTORY_SENTINEL;

use crate::error::ManifestError;

const OBJECTS_DIR_NAME: &str = "objects";
const PUSH_DIR_NAME: &str = ".push";
const REFCOUNT_FILE_NAME: &str = ".refcounts.json";

/// Objects staged for upload in one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPush {
    /// Revision the object was staged in.
    pub revision: String,
    /// Content hash of the object.
    pub content_hash: String,
    /// Dataset paths that referenced it when staged.
    pub dataset_paths: Vec<String>,
}

/// Paths of one dataset's object store.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    cache_root: PathBuf,
}

impl ObjectStore {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.cache_root.join(OBJECTS_DIR_NAME)
    }

    pub fn refcount_file(&self) -> PathBuf {
        self.objects_dir().join(REFCOUNT_FILE_NAME)
    }

    /// Working tree for a revision.
    pub fn revision_dir(&self, revision: &str) -> PathBuf {
        self.cache_root.join(revision)
    }

    /// Where the object with `content_hash` lives.
    pub fn object_path(&self, content_hash: &str) -> PathBuf {
        let mut path: PathBuf = self.objects_dir();
        if content_hash.len() > 16 && content_hash.is_ascii() {
            path.push(&content_hash[..8]);
            path.push(&content_hash[8..16]);
            path.push(&content_hash[16..]);
        } else {
            path.push(content_hash);
        }
        path
    }

    pub fn has_object(&self, content_hash: &str) -> bool {
        self.object_path(content_hash).is_file()
    }

    /// Move a working-tree file into the store and leave a hard link behind.
    ///
    /// If the object already exists the working-tree file is replaced by a
    /// link to it. Rename falls back to copy across filesystems, and the
    /// link falls back to a copy where hard links are unsupported.
    ///
    /// # Arguments
    /// * `source` - Working-tree file whose contents hash to `content_hash`
    /// * `content_hash` - Hash of the file contents
    pub fn store_file(&self, source: &Path, content_hash: &str) -> Result<PathBuf, ManifestError> {
        let object: PathBuf = self.object_path(content_hash);
        if object.is_file() {
            if same_file(source, &object) {
                return Ok(object);
            }
            std::fs::remove_file(source).map_err(|e| ManifestError::io(source, e))?;
        } else {
            ensure_parent(&object)?;
            if std::fs::rename(source, &object).is_err() {
                std::fs::copy(source, &object).map_err(|e| ManifestError::io(&object, e))?;
                std::fs::remove_file(source).map_err(|e| ManifestError::io(source, e))?;
            }
        }
        link_or_copy(&object, source)?;
        Ok(object)
    }

    /// Write the shared directory object if it is missing.
    pub fn write_directory_object(&self, content_hash: &str) -> Result<PathBuf, ManifestError> {
        let object: PathBuf = self.object_path(content_hash);
        if !object.is_file() {
            ensure_parent(&object)?;
            std::fs::write(&object, DIRECTORY_SENTINEL).map_err(|e| ManifestError::io(&object, e))?;
        }
        Ok(object)
    }

    /// Place an existing object at `dest`, replacing whatever is there.
    pub fn link_into(&self, content_hash: &str, dest: &Path) -> Result<(), ManifestError> {
        let object: PathBuf = self.object_path(content_hash);
        if !object.is_file() {
            return Err(ManifestError::NotFound {
                path: object.display().to_string(),
            });
        }
        if dest.exists() {
            if same_file(&object, dest) {
                return Ok(());
            }
            std::fs::remove_file(dest).map_err(|e| ManifestError::io(dest, e))?;
        }
        ensure_parent(dest)?;
        link_or_copy(&object, dest)
    }

    /// Delete an object no manifest row references any more.
    pub fn delete_object(&self, content_hash: &str) -> Result<(), ManifestError> {
        let object: PathBuf = self.object_path(content_hash);
        match std::fs::remove_file(&object) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ManifestError::io(&object, e)),
        }
    }

    pub fn push_root(&self) -> PathBuf {
        self.objects_dir().join(PUSH_DIR_NAME)
    }

    pub fn push_dir(&self, revision: &str) -> PathBuf {
        self.push_root().join(revision)
    }

    pub fn push_marker(&self, revision: &str, content_hash: &str) -> PathBuf {
        self.push_dir(revision).join(content_hash)
    }

    /// Record that `dataset_path` needs `content_hash` uploaded.
    ///
    /// A hash staged under an earlier revision keeps its one marker and
    /// gains the path there.
    pub fn stage_push(
        &self,
        revision: &str,
        content_hash: &str,
        dataset_path: &str,
    ) -> Result<(), ManifestError> {
        let marker: PathBuf = match self.staged_marker(content_hash)? {
            Some(existing) => existing,
            None => self.push_marker(revision, content_hash),
        };
        let mut paths: BTreeSet<String> = read_marker(&marker)?;
        if !paths.insert(dataset_path.to_string()) {
            return Ok(());
        }
        write_marker(&marker, &paths)
    }

    /// Drop `dataset_path` from a marker; the marker goes once it is empty.
    pub fn unstage_push(
        &self,
        revision: &str,
        content_hash: &str,
        dataset_path: &str,
    ) -> Result<(), ManifestError> {
        let marker: PathBuf = self.push_marker(revision, content_hash);
        let mut paths: BTreeSet<String> = read_marker(&marker)?;
        if !paths.remove(dataset_path) {
            return Ok(());
        }
        if paths.is_empty() {
            remove_if_exists(&marker)
        } else {
            write_marker(&marker, &paths)
        }
    }

    /// Drop `dataset_path` from the markers of `content_hash` in every revision.
    pub fn unstage_path(&self, content_hash: &str, dataset_path: &str) -> Result<(), ManifestError> {
        for revision in self.staged_revisions()? {
            self.unstage_push(&revision, content_hash, dataset_path)?;
        }
        Ok(())
    }

    /// Marker staging `content_hash`, whichever revision staged it first.
    pub fn staged_marker(&self, content_hash: &str) -> Result<Option<PathBuf>, ManifestError> {
        for revision in self.staged_revisions()? {
            let marker: PathBuf = self.push_marker(&revision, content_hash);
            if marker.is_file() {
                return Ok(Some(marker));
            }
        }
        Ok(None)
    }

    pub fn is_staged(&self, content_hash: &str) -> Result<bool, ManifestError> {
        Ok(self.staged_marker(content_hash)?.is_some())
    }

    /// Mark an object uploaded for a revision.
    pub fn complete_push(&self, revision: &str, content_hash: &str) -> Result<(), ManifestError> {
        remove_if_exists(&self.push_marker(revision, content_hash))
    }

    /// Remove every marker for an object, in any revision.
    pub fn purge_push_markers(&self, content_hash: &str) -> Result<(), ManifestError> {
        for revision in self.staged_revisions()? {
            remove_if_exists(&self.push_marker(&revision, content_hash))?;
        }
        Ok(())
    }

    /// Every pending upload, sorted by revision then hash.
    pub fn staged_pushes(&self) -> Result<Vec<StagedPush>, ManifestError> {
        let mut staged: Vec<StagedPush> = Vec::new();
        for revision in self.staged_revisions()? {
            let dir: PathBuf = self.push_dir(&revision);
            for name in sorted_names(&dir)? {
                let paths: BTreeSet<String> = read_marker(&dir.join(&name))?;
                staged.push(StagedPush {
                    revision: revision.clone(),
                    content_hash: name,
                    dataset_paths: paths.into_iter().collect(),
                });
            }
        }
        Ok(staged)
    }

    fn staged_revisions(&self) -> Result<Vec<String>, ManifestError> {
        sorted_names(&self.push_root())
    }
}

fn sorted_names(dir: &Path) -> Result<Vec<String>, ManifestError> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ManifestError::io(dir, e)),
    };
    let mut names: Vec<String> = Vec::new();
    for item in read_dir {
        let item: std::fs::DirEntry = item.map_err(|e| ManifestError::io(dir, e))?;
        let name: String = item.file_name().to_string_lossy().into_owned();
        if !name.ends_with(".tmp") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn read_marker(marker: &Path) -> Result<BTreeSet<String>, ManifestError> {
    match std::fs::read_to_string(marker) {
        Ok(text) => Ok(text
            .lines()
            .filter(|l: &&str| !l.is_empty())
            .map(String::from)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(ManifestError::io(marker, e)),
    }
}

fn write_marker(marker: &Path, paths: &BTreeSet<String>) -> Result<(), ManifestError> {
    ensure_parent(marker)?;
    let mut text: String = String::new();
    for path in paths {
        text.push_str(path);
        text.push('\n');
    }
    std::fs::write(marker, text).map_err(|e| ManifestError::io(marker, e))
}

fn remove_if_exists(path: &Path) -> Result<(), ManifestError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ManifestError::io(path, e)),
    }
}

fn ensure_parent(path: &Path) -> Result<(), ManifestError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
    }
    Ok(())
}

fn link_or_copy(object: &Path, dest: &Path) -> Result<(), ManifestError> {
    if let Err(e) = std::fs::hard_link(object, dest) {
        log::debug!(
            "Hard link {} -> {} failed ({}), copying instead",
            object.display(),
            dest.display(),
            e
        );
        std::fs::copy(object, dest).map_err(|e| ManifestError::io(dest, e))?;
    }
    Ok(())
}

#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (std::fs::metadata(a), std::fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_a: &Path, _b: &Path) -> bool {
    false
}
