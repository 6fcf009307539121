//! Differences between a revision's working tree and its manifest.

use std::collections::HashMap;

/// Created, modified and deleted manifest keys, each sorted.
///
/// Content hashes computed while building the status travel with it, so
/// applying it does not hash the same file twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusResult {
    pub created: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    hashes: HashMap<String, String>,
    touched: Vec<String>,
}

impl StatusResult {
    pub fn new(created: Vec<String>, modified: Vec<String>, deleted: Vec<String>) -> Self {
        let mut status: StatusResult = Self {
            created,
            modified,
            deleted,
            hashes: HashMap::new(),
            touched: Vec::new(),
        };
        status.created.sort();
        status.modified.sort();
        status.deleted.sort();
        status
    }

    /// No path was created, modified or deleted.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Number of changed paths.
    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }

    /// Created and modified keys, sorted.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .created
            .iter()
            .chain(self.modified.iter())
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Changed keys whose content hash is not known yet.
    pub fn unhashed(&self) -> Vec<String> {
        self.changed_paths()
            .into_iter()
            .filter(|p: &String| !self.hashes.contains_key(p))
            .collect()
    }

    pub fn hash_of(&self, key: &str) -> Option<&str> {
        self.hashes.get(key).map(String::as_str)
    }

    pub fn set_hash(&mut self, key: impl Into<String>, content_hash: impl Into<String>) {
        self.hashes.insert(key.into(), content_hash.into());
    }

    /// Keys whose fingerprint changed while their contents did not.
    pub fn touched(&self) -> &[String] {
        &self.touched
    }

    pub(crate) fn push_touched(&mut self, key: String) {
        self.touched.push(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|i: &&str| i.to_string()).collect()
    }

    #[test]
    fn test_new_sorts_and_counts() {
        let status: StatusResult =
            StatusResult::new(s(&["b.txt", "a.txt"]), s(&["m.txt"]), s(&["z/", "y.txt"]));
        assert_eq!(status.created, s(&["a.txt", "b.txt"]));
        assert_eq!(status.deleted, s(&["y.txt", "z/"]));
        assert_eq!(status.len(), 5);
        assert!(!status.is_empty());
        assert!(StatusResult::default().is_empty());
    }

    #[test]
    fn test_unhashed_tracks_known_hashes() {
        let mut status: StatusResult = StatusResult::new(s(&["a.txt", "d/"]), s(&["m.txt"]), vec![]);
        status.set_hash("m.txt", "h-m");
        assert_eq!(status.unhashed(), s(&["a.txt", "d/"]));
        assert_eq!(status.hash_of("m.txt"), Some("h-m"));
        assert_eq!(status.changed_paths(), s(&["a.txt", "d/", "m.txt"]));
    }
}
