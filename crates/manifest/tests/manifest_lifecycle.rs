//! End-to-end manifest behaviour across reopen, cache backends and recovery.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dataset_sync_common::{hash_bytes, SyncSettings, MANIFEST_DIR_NAME};
use dataset_sync_manifest::{
    shard_file_name, ActivityRecord, DatasetRepository, LoggedActivity, Manifest, ManifestCache,
    ManifestEntry, ShardContents, ShardRecord, SqliteManifestCache, StandaloneRepository,
    WalRecord, WriteAheadLog, LEGACY_MANIFEST_NAME, LEGACY_SHARD_NAME,
};

fn open_repo(dir: &tempfile::TempDir) -> Arc<StandaloneRepository> {
    Arc::new(
        StandaloneRepository::open(dir.path().join("dataset"), dir.path().join("cache"), "ds")
            .unwrap(),
    )
}

fn sqlite_cache(dir: &tempfile::TempDir) -> ManifestCache {
    let backend: SqliteManifestCache =
        SqliteManifestCache::open(&dir.path().join("manifest-cache.db")).unwrap();
    ManifestCache::new(Arc::new(backend), Duration::from_secs(3600))
}

async fn open_manifest(repo: &Arc<StandaloneRepository>, cache: ManifestCache) -> Manifest {
    Manifest::open(repo.clone(), cache, SyncSettings::default()).await.unwrap()
}

#[tokio::test]
async fn test_reopen_sees_committed_state() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let repo: Arc<StandaloneRepository> = open_repo(&dir);

    {
        let mut manifest: Manifest = open_manifest(&repo, sqlite_cache(&dir)).await;
        let rev_dir: PathBuf = manifest.current_revision_dir();
        std::fs::create_dir_all(rev_dir.join("raw")).unwrap();
        std::fs::write(rev_dir.join("raw/a.bin"), b"payload").unwrap();
        manifest.sweep_all_changes(Some("initial import")).await.unwrap();
    }

    let mut reopened: Manifest = open_manifest(&repo, sqlite_cache(&dir)).await;
    let entries: Vec<ManifestEntry> = reopened.list(0, 10).await.unwrap();
    let keys: Vec<&str> = entries.iter().map(|e| e.relative_path.as_str()).collect();
    assert_eq!(keys, vec!["raw/", "raw/a.bin"]);
    assert_eq!(entries[1].content_hash, hash_bytes(b"payload"));
    assert!(reopened.status().await.unwrap().is_empty());

    let log: Vec<LoggedActivity> = repo.activity_log().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].record.message, "initial import");
    assert_eq!(log[0].revision, repo.revision());
}

#[tokio::test]
async fn test_legacy_manifest_is_readable_and_migrates() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let repo: Arc<StandaloneRepository> = open_repo(&dir);

    let mut legacy: ShardContents = ShardContents::new();
    legacy.insert(
        "legacy.txt".to_string(),
        ShardRecord {
            h: hash_bytes(b"old"),
            m: "2019-05-01T00:00:00.000000Z".to_string(),
            b: "3".to_string(),
        },
    );
    let manifest_dir: PathBuf = repo.root_dir().join(MANIFEST_DIR_NAME);
    std::fs::write(
        manifest_dir.join(LEGACY_MANIFEST_NAME),
        rmp_serde::to_vec_named(&legacy).unwrap(),
    )
    .unwrap();

    let mut manifest: Manifest =
        open_manifest(&repo, ManifestCache::in_memory(Duration::from_secs(60))).await;
    let entry: ManifestEntry = manifest.get("legacy.txt").await.unwrap().unwrap();
    assert_eq!(entry.shard_file, LEGACY_SHARD_NAME);

    // The object was never pulled, so deleting the path only touches the manifest.
    let record: ActivityRecord = manifest.delete(&["legacy.txt".to_string()]).await.unwrap();
    assert_eq!(record.num_deleted, 1);

    let migrated: ShardContents =
        serde_json::from_slice(&std::fs::read(manifest_dir.join(LEGACY_SHARD_NAME)).unwrap())
            .unwrap();
    assert!(migrated.is_empty());
    assert!(manifest.get("legacy.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupted_persist_is_replayed_on_open() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let repo: Arc<StandaloneRepository> = open_repo(&dir);
    let revision: String = repo.revision();

    let mut shard: ShardContents = ShardContents::new();
    shard.insert(
        "recovered/".to_string(),
        ShardRecord {
            h: dataset_sync_common::directory_hash(),
            m: "2024-02-02T00:00:00.000000Z".to_string(),
            b: "4096".to_string(),
        },
    );
    let mut shards: BTreeMap<String, ShardContents> = BTreeMap::new();
    shards.insert(shard_file_name(&revision), shard);

    let wal: WriteAheadLog = WriteAheadLog::new(repo.cache_root());
    wal.write(&WalRecord {
        dataset_id: "ds".to_string(),
        revision: revision.clone(),
        shards,
    })
    .unwrap();

    let mut manifest: Manifest =
        open_manifest(&repo, ManifestCache::in_memory(Duration::from_secs(60))).await;
    assert!(manifest.get("recovered/").await.unwrap().is_some());
    assert!(!wal.path().exists());
}

#[tokio::test]
async fn test_branch_checkout_refreshes_manifest() {
    let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
    let repo: Arc<StandaloneRepository> = open_repo(&dir);
    let cache: ManifestCache = sqlite_cache(&dir);
    let mut manifest: Manifest = open_manifest(&repo, cache).await;

    std::fs::write(manifest.current_revision_dir().join("main.txt"), b"m").unwrap();
    manifest.sweep_all_changes(None).await.unwrap();

    repo.create_branch("side").unwrap();
    std::fs::write(manifest.current_revision_dir().join("side.txt"), b"s").unwrap();
    manifest.sweep_all_changes(None).await.unwrap();
    assert!(manifest.get("side.txt").await.unwrap().is_some());

    repo.checkout("main").unwrap();
    assert!(manifest.refresh_revision().await.unwrap());
    assert!(manifest.get("side.txt").await.unwrap().is_none());
    assert!(manifest.get("main.txt").await.unwrap().is_some());
    assert!(!manifest.refresh_revision().await.unwrap());
}
