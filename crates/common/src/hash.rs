//! Content hashing for dataset files and directories.
//!
//! Every manifest entry carries a BLAKE2b-512 digest encoded as 128 lowercase
//! hex characters. Directories have no contents, so they hash a fixed sentinel
//! and all directories share one object in the store.

use std::io::Read;
use std::path::Path;

use blake2::{Blake2b512, Digest};

use crate::constants::{DIRECTORY_SENTINEL, HASH_READ_BUFFER_SIZE};

/// Compute the BLAKE2b-512 hash of a byte slice.
///
/// # Arguments
/// * `data` - Bytes to hash
///
/// # Returns
/// 128-character lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher: Blake2bHasher = Blake2bHasher::new();
    hasher.update(data);
    hasher.finish_hex()
}

/// Compute the BLAKE2b-512 hash of a file's contents.
///
/// Reads the file in chunks so large files are never held in memory.
///
/// # Arguments
/// * `path` - Path to the file to hash
///
/// # Returns
/// 128-character lowercase hex string.
///
/// # Errors
/// Returns error if the file cannot be opened or read.
pub fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file: std::fs::File = std::fs::File::open(path)?;
    let mut hasher: Blake2bHasher = Blake2bHasher::new();
    let mut buffer: Vec<u8> = vec![0u8; HASH_READ_BUFFER_SIZE];

    loop {
        let bytes_read: usize = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish_hex())
}

/// Hash recorded for every directory entry.
pub fn directory_hash() -> String {
    hash_bytes(DIRECTORY_SENTINEL)
}

/// Check that a string looks like a content hash produced by this module.
pub fn is_content_hash(value: &str) -> bool {
    value.len() == crate::constants::CONTENT_HASH_HEX_LEN
        && value
            .bytes()
            .all(|b: u8| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Streaming BLAKE2b-512 hasher.
///
/// Used when data arrives incrementally, such as while copying a download
/// into place.
pub struct Blake2bHasher {
    inner: Blake2b512,
}

impl Blake2bHasher {
    /// Create a new streaming hasher.
    pub fn new() -> Self {
        Self {
            inner: Blake2b512::new(),
        }
    }

    /// Feed more bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize and return the hash as a 128-char hex string.
    pub fn finish_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

impl Default for Blake2bHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_bytes_length_and_charset() {
        let hash: String = hash_bytes(b"");
        assert_eq!(hash.len(), 128);
        assert!(is_content_hash(&hash));
    }

    #[test]
    fn test_hash_bytes_known_vector() {
        // BLAKE2b-512("abc") from RFC 7693 Appendix A
        let hash: String = hash_bytes(b"abc");
        assert!(hash.starts_with("ba80a53f981c4d0d6a2797b69f12f6e9"));
        assert!(hash.ends_with("d4009923"));
    }

    #[test]
    fn test_hash_bytes_different_inputs() {
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn test_incremental_matches_direct() {
        let mut hasher: Blake2bHasher = Blake2bHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finish_hex(), hash_bytes(b"hello world"));
    }

    #[test]
    fn test_hash_file_matches_bytes() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let file_path: std::path::PathBuf = dir.path().join("test1.txt");

        let mut file: std::fs::File = std::fs::File::create(&file_path).unwrap();
        file.write_all(b"asdfadfsdf").unwrap();
        drop(file);

        assert_eq!(hash_file(&file_path).unwrap(), hash_bytes(b"asdfadfsdf"));
    }

    #[test]
    fn test_hash_file_not_found() {
        let result: Result<String, std::io::Error> = hash_file(Path::new("/nonexistent/file.txt"));
        assert!(result.is_err());
    }

    #[test]
    fn test_directory_hash_is_stable_and_distinct() {
        assert_eq!(directory_hash(), directory_hash());
        assert_ne!(directory_hash(), hash_bytes(b""));
    }

    #[test]
    fn test_is_content_hash_rejects_uppercase() {
        let upper: String = hash_bytes(b"x").to_uppercase();
        assert!(!is_content_hash(&upper));
        assert!(!is_content_hash("abc"));
    }
}
