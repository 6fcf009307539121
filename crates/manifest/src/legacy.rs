//! Reader for the single-file MessagePack manifest (`manifest/manifest0`).
//!
//! The legacy file is never written. Once any of its entries is changed,
//! every legacy entry is migrated into the `manifest-legacy.json` shard and
//! the legacy file is ignored from then on.

use std::path::{Path, PathBuf};

use crate::entry::{ShardContents, LEGACY_MANIFEST_NAME, LEGACY_SHARD_NAME};
use crate::error::ManifestError;

/// Whether the legacy file still supplies entries for this manifest directory.
pub fn legacy_is_active(manifest_dir: &Path) -> bool {
    manifest_dir.join(LEGACY_MANIFEST_NAME).is_file()
        && !manifest_dir.join(LEGACY_SHARD_NAME).exists()
}

/// Read legacy entries if the legacy file is still active.
///
/// # Arguments
/// * `manifest_dir` - The dataset's `manifest/` directory
///
/// # Errors
/// Returns `Corrupt` if the file exists but does not decode.
pub fn read_legacy_manifest(manifest_dir: &Path) -> Result<Option<ShardContents>, ManifestError> {
    if !legacy_is_active(manifest_dir) {
        return Ok(None);
    }

    let path: PathBuf = manifest_dir.join(LEGACY_MANIFEST_NAME);
    let bytes: Vec<u8> = std::fs::read(&path).map_err(|e| ManifestError::io(&path, e))?;
    let contents: ShardContents =
        rmp_serde::from_slice(&bytes).map_err(|e| ManifestError::corrupt(&path, e))?;
    Ok(Some(contents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ShardRecord;

    fn legacy_contents() -> ShardContents {
        let mut contents: ShardContents = ShardContents::new();
        contents.insert(
            "old.txt".to_string(),
            ShardRecord {
                h: "cd".repeat(64),
                m: "2019-05-01T10:00:00.000000Z".to_string(),
                b: "3".to_string(),
            },
        );
        contents
    }

    #[test]
    fn test_missing_legacy_file() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        assert!(read_legacy_manifest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_reads_msgpack_map() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let bytes: Vec<u8> = rmp_serde::to_vec_named(&legacy_contents()).unwrap();
        std::fs::write(dir.path().join(LEGACY_MANIFEST_NAME), bytes).unwrap();

        let read: ShardContents = read_legacy_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(read, legacy_contents());
    }

    #[test]
    fn test_migrated_legacy_is_ignored() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let bytes: Vec<u8> = rmp_serde::to_vec_named(&legacy_contents()).unwrap();
        std::fs::write(dir.path().join(LEGACY_MANIFEST_NAME), bytes).unwrap();
        std::fs::write(dir.path().join(LEGACY_SHARD_NAME), "{}").unwrap();

        assert!(!legacy_is_active(dir.path()));
        assert!(read_legacy_manifest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_legacy_file() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LEGACY_MANIFEST_NAME), b"\xc1\xc1garbage").unwrap();

        let result: Result<Option<ShardContents>, ManifestError> = read_legacy_manifest(dir.path());
        assert!(matches!(result, Err(ManifestError::Corrupt { .. })));
    }
}
