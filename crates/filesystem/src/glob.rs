//! Ignore patterns for dataset working trees.
//!
//! A dataset may carry a `.datasetignore` file at its root with one glob per
//! line. Blank lines and lines starting with `#` are skipped. The sync
//! engine's own bookkeeping files are always excluded, whether or not an
//! ignore file exists.
//!
//! Patterns are matched against manifest keys. A directory key is matched
//! with and without its trailing `/`, so `build` and `build/` both hide a
//! `build/` directory.

use std::path::Path;

use dataset_sync_common::{FINGERPRINT_FILE_NAME, IGNORE_FILE_NAME};
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::FileSystemError;

/// Exclusion filter applied to manifest keys during a tree walk.
#[derive(Debug, Clone, Default)]
pub struct GlobFilter {
    /// Patterns for keys to exclude.
    exclude: Vec<String>,
    /// Compiled exclude patterns.
    exclude_set: Option<GlobSet>,
}

impl GlobFilter {
    /// Create a filter that excludes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter from exclude patterns.
    ///
    /// # Arguments
    /// * `patterns` - Glob patterns for keys to exclude
    ///
    /// # Errors
    /// Returns error if any pattern is invalid.
    pub fn exclude(patterns: Vec<String>) -> Result<Self, FileSystemError> {
        let mut filter: GlobFilter = Self {
            exclude: patterns,
            exclude_set: None,
        };
        filter.compile()?;
        Ok(filter)
    }

    /// Built-in exclusions plus whatever `<root>/.datasetignore` lists.
    ///
    /// A missing ignore file is not an error.
    ///
    /// # Arguments
    /// * `root` - Dataset root holding the optional ignore file
    pub fn for_dataset(root: &Path) -> Result<Self, FileSystemError> {
        let mut patterns: Vec<String> = builtin_exclusions();

        let ignore_path: std::path::PathBuf = root.join(IGNORE_FILE_NAME);
        match std::fs::read_to_string(&ignore_path) {
            Ok(text) => patterns.extend(parse_ignore_lines(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FileSystemError::io(&ignore_path, e)),
        }

        Self::exclude(patterns)
    }

    /// Check if a manifest key passes the filter.
    ///
    /// # Returns
    /// `true` if the key should be tracked, `false` if it is ignored.
    pub fn matches(&self, key: &str) -> bool {
        let set: &GlobSet = match &self.exclude_set {
            Some(set) => set,
            None => return true,
        };
        let trimmed: &str = key.trim_end_matches('/');
        !(set.is_match(key) || set.is_match(trimmed))
    }

    /// Check if the filter has any patterns.
    pub fn is_empty(&self) -> bool {
        self.exclude.is_empty()
    }

    /// Get the exclude patterns.
    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude
    }

    fn compile(&mut self) -> Result<(), FileSystemError> {
        if self.exclude.is_empty() {
            self.exclude_set = None;
            return Ok(());
        }

        let mut builder: GlobSetBuilder = GlobSetBuilder::new();
        for pattern in &self.exclude {
            let glob: Glob = Glob::new(pattern).map_err(|e| FileSystemError::InvalidGlobPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        self.exclude_set = Some(builder.build().map_err(|e| {
            FileSystemError::InvalidGlobPattern {
                pattern: self.exclude.join(", "),
                reason: e.to_string(),
            }
        })?);
        Ok(())
    }
}

fn builtin_exclusions() -> Vec<String> {
    vec![
        FINGERPRINT_FILE_NAME.to_string(),
        IGNORE_FILE_NAME.to_string(),
    ]
}

fn parse_ignore_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|line: &&str| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
}
