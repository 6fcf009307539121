//! Conversions between host paths and manifest keys.
//!
//! Manifest keys are POSIX relative paths. Directory keys end with `/`,
//! file keys never do.

use std::path::{Component, Path, PathBuf};

use crate::error::PathError;

/// Convert a path to absolute without resolving symlinks.
///
/// # Arguments
/// * `path` - Path to convert (relative or absolute)
///
/// # Errors
/// Returns error if current directory cannot be determined.
pub fn to_absolute(path: &Path) -> Result<PathBuf, PathError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        std::env::current_dir()
            .map(|cwd: PathBuf| cwd.join(path))
            .map_err(|e: std::io::Error| PathError::from_io(path.display().to_string(), e))
    }
}

/// Lexical path normalization without filesystem access.
///
/// Removes `.` components and resolves `..` components lexically.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !components.is_empty()
                    && !matches!(
                        components.last(),
                        Some(Component::ParentDir) | Some(Component::RootDir)
                    )
                {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            _ => components.push(component),
        }
    }

    components.iter().collect()
}

/// Turn a host path under `root` into a manifest key.
///
/// # Arguments
/// * `path` - Path to normalize
/// * `root` - Revision directory the key is relative to
/// * `is_dir` - Whether the path names a directory (adds the trailing `/`)
///
/// # Errors
/// Returns `PathOutsideRoot` if the path escapes the root, and `InvalidPath`
/// if it names the root itself.
pub fn normalize_for_manifest(path: &Path, root: &Path, is_dir: bool) -> Result<String, PathError> {
    let normalized: PathBuf = lexical_normalize(&to_absolute(path)?);
    let normalized_root: PathBuf = lexical_normalize(&to_absolute(root)?);

    let relative: &Path = normalized
        .strip_prefix(&normalized_root)
        .map_err(|_| PathError::PathOutsideRoot {
            path: normalized.display().to_string(),
            root: normalized_root.display().to_string(),
        })?;

    let mut key: String = to_posix_path(relative);
    if key.is_empty() {
        return Err(PathError::InvalidPath {
            path: normalized.display().to_string(),
        });
    }
    if is_dir {
        key.push('/');
    }
    Ok(key)
}

/// Convert a path to a POSIX-style string (forward slashes).
pub fn to_posix_path(path: &Path) -> String {
    path.components()
        .map(|c: Component| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Convert a manifest key to a host path under `destination_root`.
///
/// Empty segments, including the one left by a directory key's trailing
/// slash, are skipped.
pub fn from_posix_path(manifest_path: &str, destination_root: &Path) -> PathBuf {
    let mut result: PathBuf = destination_root.to_path_buf();
    for component in manifest_path.split('/') {
        if !component.is_empty() {
            result.push(component);
        }
    }
    result
}

/// Check if a path is within a root directory, lexically.
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    let norm_path: PathBuf = lexical_normalize(path);
    let norm_root: PathBuf = lexical_normalize(root);
    norm_path.starts_with(&norm_root)
}

/// Whether a manifest key names a directory.
pub fn is_directory_key(key: &str) -> bool {
    key.ends_with('/')
}

/// All ancestor directory keys of a manifest key, outermost first.
///
/// `a/b/c.txt` yields `["a/", "a/b/"]`; `a/b/` yields `["a/"]`.
pub fn parent_directory_keys(key: &str) -> Vec<String> {
    let trimmed: &str = key.trim_end_matches('/');
    let mut parents: Vec<String> = Vec::new();
    let mut offset: usize = 0;
    while let Some(idx) = trimmed[offset..].find('/') {
        let end: usize = offset + idx + 1;
        parents.push(trimmed[..end].to_string());
        offset = end;
    }
    parents
}
