//! Reference counts for content objects.
//!
//! Each object records the `(revision, path)` pairs whose working tree holds
//! it. An object may only be deleted once that set is empty.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// `(revision, dataset path)` referencing an object.
pub type ObjectRef = (String, String);

/// Content hash to the references that keep it alive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCountTable {
    refs: BTreeMap<String, BTreeSet<ObjectRef>>,
}

impl RefCountTable {
    /// Load the table, or start empty if it does not exist yet.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ManifestError::corrupt(path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ManifestError::io(path, e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
        }
        let json: Vec<u8> = serde_json::to_vec(self).map_err(|e| ManifestError::corrupt(path, e))?;
        let tmp: PathBuf = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| ManifestError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| ManifestError::io(path, e))
    }

    /// Add a reference. Adding an existing reference changes nothing.
    pub fn add(&mut self, content_hash: &str, revision: &str, path: &str) {
        self.refs
            .entry(content_hash.to_string())
            .or_default()
            .insert((revision.to_string(), path.to_string()));
    }

    /// Remove a reference.
    ///
    /// # Returns
    /// `true` if the object has no references left and may be deleted.
    pub fn remove(&mut self, content_hash: &str, revision: &str, path: &str) -> bool {
        let now_empty: bool = match self.refs.get_mut(content_hash) {
            Some(set) => {
                set.remove(&(revision.to_string(), path.to_string()));
                set.is_empty()
            }
            None => return false,
        };
        if now_empty {
            self.refs.remove(content_hash);
        }
        now_empty
    }

    /// Remove every reference held by `revision`.
    ///
    /// # Returns
    /// Hashes left without any reference, sorted.
    pub fn drop_revision(&mut self, revision: &str) -> Vec<String> {
        let mut orphaned: Vec<String> = Vec::new();
        self.refs.retain(|hash: &String, set: &mut BTreeSet<ObjectRef>| {
            set.retain(|(rev, _)| rev != revision);
            if set.is_empty() {
                orphaned.push(hash.clone());
                false
            } else {
                true
            }
        });
        orphaned
    }

    pub fn count(&self, content_hash: &str) -> usize {
        self.refs.get(content_hash).map_or(0, BTreeSet::len)
    }

    pub fn references(&self, content_hash: &str) -> Vec<ObjectRef> {
        self.refs
            .get(content_hash)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of references across every object.
    pub fn total_refs(&self) -> usize {
        self.refs.values().map(BTreeSet::len).sum()
    }

    /// Number of objects with at least one reference.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_object_survives_one_delete() {
        let mut table: RefCountTable = RefCountTable::default();
        table.add("h", "r1", "a.txt");
        table.add("h", "r1", "copy.txt");
        table.add("h", "r1", "a.txt");
        assert_eq!(table.count("h"), 2);

        assert!(!table.remove("h", "r1", "a.txt"));
        assert_eq!(table.count("h"), 1);
        assert!(table.remove("h", "r1", "copy.txt"));
        assert_eq!(table.count("h"), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_other_revision_keeps_object() {
        let mut table: RefCountTable = RefCountTable::default();
        table.add("h", "r1", "a.txt");
        table.add("h", "r2", "a.txt");
        assert!(!table.remove("h", "r2", "a.txt"));
        assert_eq!(table.references("h"), vec![("r1".to_string(), "a.txt".to_string())]);
    }

    #[test]
    fn test_drop_revision_reports_orphans() {
        let mut table: RefCountTable = RefCountTable::default();
        table.add("kept", "r1", "a.txt");
        table.add("kept", "r2", "a.txt");
        table.add("gone", "r1", "old.txt");
        table.add("other", "r3", "c.txt");

        assert_eq!(table.drop_revision("r1"), vec!["gone".to_string()]);
        assert_eq!(table.references("kept"), vec![("r2".to_string(), "a.txt".to_string())]);
        assert_eq!(table.total_refs(), 2);
        assert!(table.drop_revision("missing").is_empty());
    }

    #[test]
    fn test_remove_unknown_hash() {
        let mut table: RefCountTable = RefCountTable::default();
        assert!(!table.remove("missing", "r", "p"));
    }

    #[test]
    fn test_save_and_load() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("objects/.refcounts.json");
        assert!(RefCountTable::load(&path).unwrap().is_empty());

        let mut table: RefCountTable = RefCountTable::default();
        table.add("h1", "r1", "a.txt");
        table.add("h2", "r1", "b/");
        table.save(&path).unwrap();

        let loaded: RefCountTable = RefCountTable::load(&path).unwrap();
        assert_eq!(loaded, table);
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_load_corrupt() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join(".refcounts.json");
        std::fs::write(&path, "[1,2").unwrap();
        assert!(matches!(
            RefCountTable::load(&path),
            Err(ManifestError::Corrupt { .. })
        ));
    }
}
