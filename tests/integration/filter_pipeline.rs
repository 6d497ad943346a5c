//! Integration tests for the resolver's filter pipeline: files dropped by a
//! filter stage must never appear as rows in the state store.

use super::support::{FakeArchive, FixtureFile};
use archive_batch_downloader::downloader::{DownloadEngine, EngineConfig};
use archive_batch_downloader::store::{FileStatus, JobRecord, StateStore};
use std::io::Write;
use tempfile::TempDir;

async fn run_with_filters(
    archive: &FakeArchive,
    configure: impl FnOnce(&mut EngineConfig),
) -> (TempDir, String) {
    let out = TempDir::new().unwrap();
    let items = out.path().join("items.txt");
    let mut file = std::fs::File::create(&items).unwrap();
    writeln!(file, "item-a").unwrap();

    let mut config = EngineConfig::new(out.path());
    config.items_path = Some(items);
    config.endpoints = archive.endpoints();
    config.dynamic = false;
    config.worker_ceiling = 2;
    configure(&mut config);

    let handle = DownloadEngine::start(config).await.unwrap();
    handle.wait().await.unwrap();

    let job_id = JobRecord::derive_id(out.path());
    (out, job_id)
}

/// Extension whitelist: only matching files become rows at all.
#[tokio::test]
async fn test_extension_whitelist_limits_rows() {
    let archive = FakeArchive::start(vec![(
        "item-a",
        vec![
            FixtureFile::normal("a.mp3", b"mp3 bytes"),
            FixtureFile::normal("b.flac", b"flac bytes"),
            FixtureFile::normal("cover.jpg", b"jpg bytes"),
        ],
    )])
    .await;

    let (out, job_id) = run_with_filters(&archive, |config| {
        config.extension_whitelist = vec!["mp3".to_string()];
    })
    .await;

    let store = StateStore::open_in_root(out.path()).await.unwrap();
    let items = store.list_items(&job_id).await.unwrap();
    let files = store.list_files(items[0].id).await.unwrap();

    assert_eq!(files.len(), 1, "only a.mp3 should be persisted");
    assert_eq!(files[0].remote_name, "a.mp3");
    assert_eq!(files[0].status, FileStatus::Done);

    // The filtered-out files were never requested either.
    assert!(archive.hits_for("item-a", "b.flac").is_empty());
    assert!(archive.hits_for("item-a", "cover.jpg").is_empty());
}

/// Anti-clutter names are dropped before any other stage.
#[tokio::test]
async fn test_system_files_never_persisted() {
    let archive = FakeArchive::start(vec![(
        "item-a",
        vec![
            FixtureFile::normal("item-a_meta.xml", b"<xml/>"),
            FixtureFile::normal("item-a_files.xml", b"<xml/>"),
            FixtureFile::normal("item-a_thumb.jpg", b"jpg"),
            FixtureFile::normal("listing.txt", b"contents"),
        ],
    )])
    .await;

    let (out, job_id) = run_with_filters(&archive, |_| {}).await;

    let store = StateStore::open_in_root(out.path()).await.unwrap();
    let items = store.list_items(&job_id).await.unwrap();
    let files = store.list_files(items[0].id).await.unwrap();

    assert_eq!(files.len(), 1);
    assert_eq!(files[0].remote_name, "listing.txt");
}

/// Metadata-only mode keeps manifest/descriptive files only.
#[tokio::test]
async fn test_metadata_only_mode() {
    let archive = FakeArchive::start(vec![(
        "item-a",
        vec![
            FixtureFile::normal("notes.txt", b"notes"),
            FixtureFile::normal("record.json", b"{}"),
            FixtureFile::normal("side-a.mp3", b"audio"),
        ],
    )])
    .await;

    let (out, job_id) = run_with_filters(&archive, |config| {
        config.metadata_only = true;
    })
    .await;

    let store = StateStore::open_in_root(out.path()).await.unwrap();
    let items = store.list_items(&job_id).await.unwrap();
    let files = store.list_files(items[0].id).await.unwrap();

    let names: Vec<_> = files.iter().map(|f| f.remote_name.as_str()).collect();
    assert_eq!(names, vec!["notes.txt", "record.json"]);
}

/// Regex filter composes with the earlier stages.
#[tokio::test]
async fn test_regex_filter() {
    let archive = FakeArchive::start(vec![(
        "item-a",
        vec![
            FixtureFile::normal("disc1-side-a.mp3", b"one"),
            FixtureFile::normal("disc2-side-b.mp3", b"two"),
            FixtureFile::normal("bonus.mp3", b"three"),
        ],
    )])
    .await;

    let (out, job_id) = run_with_filters(&archive, |config| {
        config.name_regex = Some("^disc".to_string());
    })
    .await;

    let store = StateStore::open_in_root(out.path()).await.unwrap();
    let items = store.list_items(&job_id).await.unwrap();
    let files = store.list_files(items[0].id).await.unwrap();

    let names: Vec<_> = files.iter().map(|f| f.remote_name.as_str()).collect();
    assert_eq!(names, vec!["disc1-side-a.mp3", "disc2-side-b.mp3"]);
}
