//! Shared constants used across dataset-sync crates.

/// Size recorded in the manifest for directory entries.
pub const DIRECTORY_NUM_BYTES: &str = "4096";

/// Bytes hashed in place of file contents for directory entries.
pub const DIRECTORY_SENTINEL: &[u8] = b"__dataset_directory__";

/// Length of a hex encoded content hash (BLAKE2b-512).
pub const CONTENT_HASH_HEX_LEN: usize = 128;

/// Read buffer used when hashing or copying file contents (1MB).
pub const HASH_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Name of the per-revision fingerprint sidecar file.
pub const FINGERPRINT_FILE_NAME: &str = ".smarthash";

/// Name of the dataset-level ignore file (one glob per line).
pub const IGNORE_FILE_NAME: &str = ".datasetignore";

/// Directory under the dataset root that holds manifest shard files.
pub const MANIFEST_DIR_NAME: &str = "manifest";

/// Default number of concurrent object uploads.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 4;

/// Default number of concurrent object downloads.
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 4;

/// Default number of objects handed to a backend per push batch.
pub const DEFAULT_PUSH_BATCH_SIZE: usize = 50;

/// Default TTL for the fast manifest cache, in seconds.
pub const DEFAULT_MANIFEST_CACHE_TTL_SECS: u64 = 3600;

/// Attempts a background hashing job gets before its files are reported as failed.
pub const DEFAULT_MAX_HASH_JOB_ATTEMPTS: u32 = 3;

/// Default interval between background job status polls, in milliseconds.
pub const DEFAULT_JOB_POLL_INTERVAL_MS: u64 = 250;
