//! Push and pull through the object service backend against an in-memory
//! transport.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dataset_sync_common::{hash_bytes, progress_fn, NoOpProgress, SyncSettings};
use dataset_sync_manifest::{Manifest, ManifestCache, ObjectStore, StandaloneRepository};
use dataset_sync_storage::{
    BackendConfig, IOManager, ManagedStorageBackend, ObjectServiceBackend, ObjectTransport, PresignedTarget, PullResult,
    PushObject, PushResult, StorageError, TransferProgress,
};

/// Object service kept in memory. Hashes in `reject` fail their upload
/// with a 500; hashes in `corrupt` download the wrong bytes.
#[derive(Default)]
struct MemoryTransport {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    reject: Mutex<HashSet<String>>,
    corrupt: Mutex<HashSet<String>>,
    downloads: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectTransport for MemoryTransport {
    async fn presign_upload(&self, content_hash: &str) -> Result<PresignedTarget, StorageError> {
        Ok(PresignedTarget {
            object_id: content_hash.to_string(),
            url: format!("mem://upload/{}", content_hash),
        })
    }

    async fn presign_download(&self, content_hash: &str) -> Result<PresignedTarget, StorageError> {
        if !self.objects.lock().unwrap().contains_key(content_hash) {
            return Err(StorageError::HttpStatus {
                key: content_hash.to_string(),
                status: 404,
            });
        }
        Ok(PresignedTarget {
            object_id: content_hash.to_string(),
            url: format!("mem://download/{}", content_hash),
        })
    }

    async fn upload(&self, target: &PresignedTarget, source: &Path) -> Result<(), StorageError> {
        if self.reject.lock().unwrap().contains(&target.object_id) {
            return Err(StorageError::HttpStatus {
                key: target.object_id.clone(),
                status: 500,
            });
        }
        let data: Vec<u8> = std::fs::read(source).map_err(|e| StorageError::io(source, e))?;
        self.objects
            .lock()
            .unwrap()
            .insert(target.object_id.clone(), data);
        Ok(())
    }

    async fn download(&self, target: &PresignedTarget, dest: &Path) -> Result<(), StorageError> {
        self.downloads.lock().unwrap().push(target.object_id.clone());
        let mut data: Vec<u8> = self
            .objects
            .lock()
            .unwrap()
            .get(&target.object_id)
            .cloned()
            .unwrap_or_default();
        if self.corrupt.lock().unwrap().contains(&target.object_id) {
            data.extend_from_slice(b"garbage");
        }
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(dest, data).map_err(|e| StorageError::io(dest, e))
    }

    async fn delete_dataset(&self) -> Result<(), StorageError> {
        self.objects.lock().unwrap().clear();
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    repo: Arc<StandaloneRepository>,
    manifest: Manifest,
    transport: Arc<MemoryTransport>,
    io: IOManager,
}

fn config() -> BackendConfig {
    let mut config: BackendConfig = BackendConfig::new();
    config.insert("server_url".to_string(), "https://objects.example.com".to_string());
    config.insert("namespace".to_string(), "alice".to_string());
    config.insert("dataset_name".to_string(), "scans".to_string());
    config.insert("access_token".to_string(), "token".to_string());
    config
}

async fn fixture_with(settings: SyncSettings) -> Fixture {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let repo: Arc<StandaloneRepository> = Arc::new(
        StandaloneRepository::open(dir.path().join("dataset"), dir.path().join("cache"), "ds")
            .unwrap(),
    );
    let manifest: Manifest = Manifest::open(
        repo.clone(),
        ManifestCache::in_memory(Duration::from_secs(60)),
        settings,
    )
    .await
    .unwrap();
    let transport: Arc<MemoryTransport> = Arc::new(MemoryTransport::default());
    let backend: ObjectServiceBackend =
        ObjectServiceBackend::with_transport(config(), transport.clone());
    Fixture {
        _dir: dir,
        repo,
        manifest,
        transport,
        io: IOManager::new(Box::new(backend)),
    }
}

async fn fixture() -> Fixture {
    fixture_with(SyncSettings::default()).await
}

fn write(manifest: &Manifest, key: &str, contents: &[u8]) {
    let path: PathBuf = manifest.current_revision_dir().join(key);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn paths(objects: &[PushObject]) -> Vec<&str> {
    objects.iter().map(|o| o.dataset_path.as_str()).collect()
}

#[tokio::test]
async fn test_create_hash_and_stage_round_trip() {
    let mut f: Fixture = fixture().await;
    write(&f.manifest, "test1.txt", b"asdfadfsdf");
    std::fs::create_dir_all(f.manifest.current_revision_dir().join("other_dir")).unwrap();
    f.manifest.sweep_all_changes(None).await.unwrap();

    let objects: Vec<PushObject> = f.io.objects_to_push(&mut f.manifest, false).await.unwrap();
    assert_eq!(paths(&objects), vec!["other_dir/", "test1.txt"]);

    let file: &PushObject = &objects[1];
    assert_eq!(file.content_hash, hash_bytes(b"asdfadfsdf"));
    assert_eq!(file.size, 10);
    assert_eq!(file.object_path, f.manifest.objects().object_path(&file.content_hash));
    assert!(file.object_path.is_file());
    assert_eq!(f.io.num_objects_to_push(&mut f.manifest, false).await.unwrap(), 2);
}

#[tokio::test]
async fn test_branch_isolation_of_push_frontier() {
    let mut f: Fixture = fixture().await;
    write(&f.manifest, "test1.txt", b"one");
    write(&f.manifest, "test2.txt", b"two");
    f.manifest.sweep_all_changes(None).await.unwrap();

    f.repo.create_branch("b").unwrap();
    write(&f.manifest, "test3.txt", b"three");
    f.manifest.sweep_all_changes(None).await.unwrap();
    let on_b: Vec<PushObject> = f.io.objects_to_push(&mut f.manifest, false).await.unwrap();
    assert_eq!(paths(&on_b), vec!["test1.txt", "test2.txt", "test3.txt"]);

    f.repo.checkout("main").unwrap();
    let on_main: Vec<PushObject> = f.io.objects_to_push(&mut f.manifest, false).await.unwrap();
    assert_eq!(paths(&on_main), vec!["test1.txt", "test2.txt"]);
}

#[tokio::test]
async fn test_push_failure_leaves_only_failed_object_staged() {
    let mut f: Fixture = fixture().await;
    write(&f.manifest, "a.txt", b"first object");
    write(&f.manifest, "b.txt", b"second object");
    f.manifest.sweep_all_changes(None).await.unwrap();

    let rejected: String = hash_bytes(b"second object");
    f.transport.reject.lock().unwrap().insert(rejected.clone());
    let staged_revision: String = f.io.objects_to_push(&mut f.manifest, false).await.unwrap()[0]
        .revision
        .clone();

    let result: PushResult = f.io.push_objects(&mut f.manifest, &NoOpProgress).await.unwrap();
    assert_eq!(paths(&result.success), vec!["a.txt"]);
    assert_eq!(paths(&result.failure), vec!["b.txt"]);
    assert!(matches!(
        result.errors[0].error,
        StorageError::HttpStatus { status: 500, .. }
    ));

    let store: &ObjectStore = f.manifest.objects();
    assert!(!store.push_marker(&staged_revision, &hash_bytes(b"first object")).exists());
    assert!(store.push_marker(&staged_revision, &rejected).exists());

    f.transport.reject.lock().unwrap().clear();
    let retry: PushResult = f.io.push_objects(&mut f.manifest, &NoOpProgress).await.unwrap();
    assert_eq!(paths(&retry.success), vec!["b.txt"]);
    assert!(f.io.objects_to_push(&mut f.manifest, false).await.unwrap().is_empty());

    let again: PushResult = f.io.push_objects(&mut f.manifest, &NoOpProgress).await.unwrap();
    assert!(again.success.is_empty() && again.failure.is_empty());
}

#[tokio::test]
async fn test_duplicate_contents_collapse_only_when_asked() {
    let mut f: Fixture = fixture().await;
    write(&f.manifest, "a/copy1.bin", b"same bytes");
    write(&f.manifest, "b/copy2.bin", b"same bytes");
    f.manifest.sweep_all_changes(None).await.unwrap();

    let shared: String = hash_bytes(b"same bytes");
    let per_path: Vec<PushObject> = f.io.objects_to_push(&mut f.manifest, false).await.unwrap();
    assert_eq!(
        per_path.iter().filter(|o| o.content_hash == shared).count(),
        2
    );

    let deduped: Vec<PushObject> = f.io.objects_to_push(&mut f.manifest, true).await.unwrap();
    let representatives: Vec<&PushObject> =
        deduped.iter().filter(|o| o.content_hash == shared).collect();
    assert_eq!(representatives.len(), 1);
    assert_eq!(representatives[0].dataset_path, "a/copy1.bin");

    // The object service dedups, so one upload clears both references.
    let result: PushResult = f.io.push_objects(&mut f.manifest, &NoOpProgress).await.unwrap();
    assert!(result.is_complete());
    assert!(f.io.objects_to_push(&mut f.manifest, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_push_accounts_for_every_object() {
    let mut f: Fixture = fixture_with(SyncSettings::default().with_push_batch_size(1)).await;
    for i in 0..4 {
        write(&f.manifest, &format!("f{}.txt", i), format!("contents {}", i).as_bytes());
    }
    f.manifest.sweep_all_changes(None).await.unwrap();

    let stop_after_first = progress_fn(|p: &TransferProgress| p.overall_completed < 1);
    let result: PushResult = f.io.push_objects(&mut f.manifest, &stop_after_first).await.unwrap();
    assert_eq!(result.success.len(), 1);
    assert_eq!(result.failure.len(), 3);
    assert!(result
        .errors
        .iter()
        .all(|e| matches!(e.error, StorageError::Cancelled)));
    assert_eq!(f.io.num_objects_to_push(&mut f.manifest, false).await.unwrap(), 3);
}

#[tokio::test]
async fn test_pull_reports_every_key_once_and_shares_downloads() {
    let mut f: Fixture = fixture().await;
    write(&f.manifest, "x/one.bin", b"shared payload");
    write(&f.manifest, "y/two.bin", b"shared payload");
    write(&f.manifest, "z.bin", b"unique payload");
    f.manifest.sweep_all_changes(None).await.unwrap();
    assert!(f
        .io
        .push_objects(&mut f.manifest, &NoOpProgress)
        .await
        .unwrap()
        .is_complete());

    // Simulate a fresh machine: drop the working tree files and objects.
    let revision_dir: PathBuf = f.manifest.current_revision_dir();
    for key in ["x/one.bin", "y/two.bin", "z.bin"] {
        std::fs::remove_file(revision_dir.join(key)).unwrap();
    }
    let store: ObjectStore = f.manifest.objects().clone();
    store.delete_object(&hash_bytes(b"shared payload")).unwrap();
    store.delete_object(&hash_bytes(b"unique payload")).unwrap();

    let keys: Vec<String> = vec![
        "x/one.bin".to_string(),
        "y/two.bin".to_string(),
        "z.bin".to_string(),
        "not/tracked.bin".to_string(),
    ];
    let result: PullResult = f
        .io
        .pull_objects(&mut f.manifest, &keys, &NoOpProgress)
        .await
        .unwrap();

    let mut reported: Vec<&str> = result
        .success
        .iter()
        .chain(result.failure.iter())
        .map(|o| o.dataset_path.as_str())
        .collect();
    reported.sort();
    assert_eq!(reported, vec!["not/tracked.bin", "x/one.bin", "y/two.bin", "z.bin"]);
    assert_eq!(result.failure.len(), 1);
    assert!(matches!(result.errors[0].error, StorageError::NotFound { .. }));

    assert_eq!(f.transport.downloads.lock().unwrap().len(), 2);
    assert_eq!(std::fs::read(revision_dir.join("y/two.bin")).unwrap(), b"shared payload");
    assert!(f.manifest.status().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pull_all_discards_corrupt_download() {
    let mut f: Fixture = fixture().await;
    write(&f.manifest, "good.bin", b"good");
    write(&f.manifest, "bad.bin", b"bad");
    f.manifest.sweep_all_changes(None).await.unwrap();
    f.io.push_objects(&mut f.manifest, &NoOpProgress).await.unwrap();

    let revision_dir: PathBuf = f.manifest.current_revision_dir();
    let store: ObjectStore = f.manifest.objects().clone();
    for (key, contents) in [("good.bin", b"good".as_slice()), ("bad.bin", b"bad".as_slice())] {
        std::fs::remove_file(revision_dir.join(key)).unwrap();
        store.delete_object(&hash_bytes(contents)).unwrap();
    }
    f.transport.corrupt.lock().unwrap().insert(hash_bytes(b"bad"));

    let result: PullResult = f.io.pull_all(&mut f.manifest, &NoOpProgress).await.unwrap();
    assert_eq!(result.success.len(), 1);
    assert_eq!(result.failure[0].dataset_path, "bad.bin");
    assert!(matches!(result.errors[0].error, StorageError::HashMismatch { .. }));
    assert!(!store.has_object(&hash_bytes(b"bad")));
    assert!(revision_dir.join("good.bin").is_file());
    assert!(!revision_dir.join("bad.bin").exists());
}

#[tokio::test]
async fn test_unconfigured_backend_refuses_to_push() {
    let mut f: Fixture = fixture().await;
    write(&f.manifest, "a.txt", b"a");
    f.manifest.sweep_all_changes(None).await.unwrap();

    let io: IOManager = IOManager::new(Box::new(
        ObjectServiceBackend::new(BackendConfig::new()).unwrap(),
    ));
    let err: StorageError = io.push_objects(&mut f.manifest, &NoOpProgress).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidConfig { .. }));
    assert_eq!(io.num_objects_to_push(&mut f.manifest, true).await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_contents_clears_remote() {
    let mut f: Fixture = fixture().await;
    write(&f.manifest, "a.txt", b"a");
    f.manifest.sweep_all_changes(None).await.unwrap();
    f.io.push_objects(&mut f.manifest, &NoOpProgress).await.unwrap();
    assert_eq!(f.transport.objects.lock().unwrap().len(), 1);

    let managed: &dyn ManagedStorageBackend = f.io.backend().as_managed().unwrap();
    managed.delete_contents(&f.manifest).await.unwrap();
    assert!(f.transport.objects.lock().unwrap().is_empty());
}
