//! Integration tests for the state store's concurrency invariants.

use archive_batch_downloader::store::{
    FileOutcome, FileStatus, JobRecord, StateStore, STATE_FILE_NAME,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn seeded_store(dir: &TempDir) -> (StateStore, String, i64) {
    let store = StateStore::open(&dir.path().join(STATE_FILE_NAME))
        .await
        .unwrap();
    let job = JobRecord {
        id: JobRecord::derive_id(dir.path()),
        output_root: dir.path().to_path_buf(),
        name_regex: None,
        extensions: vec![],
        metadata_only: false,
        sync_existing: false,
        dynamic_scaling: true,
        worker_ceiling: 4,
        bandwidth_ceiling_bps: 0,
    };
    store.upsert_job(&job).await.unwrap();
    let item_id = store.insert_item(&job.id, "item-a").await.unwrap();
    let file_id = store
        .insert_file(item_id, "track.mp3", 4096, Some("abcd"), dir.path())
        .await
        .unwrap();
    (store, job.id, file_id)
}

/// At most one worker may ever hold a file in progress: many concurrent
/// claims on the same row must yield exactly one winner.
#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let dir = TempDir::new().unwrap();
    let (store, _job_id, file_id) = seeded_store(&dir).await;
    let store = Arc::new(store);

    let mut handles = vec![];
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(
            async move { store.claim_file(file_id).await.unwrap() },
        ));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

/// Claims from a dead session are not authoritative: a restart reclaims
/// them to pending and the queue rebuild sees the file again.
#[tokio::test]
async fn test_restart_reclaims_stale_claims() {
    let dir = TempDir::new().unwrap();
    let (store, job_id, file_id) = seeded_store(&dir).await;

    assert!(store.claim_file(file_id).await.unwrap());
    store.checkpoint_bytes(file_id, 2048).await.unwrap();
    drop(store);

    // A new session over the same state file.
    let store = StateStore::open(&dir.path().join(STATE_FILE_NAME))
        .await
        .unwrap();
    assert_eq!(store.reclaim_in_progress(&job_id).await.unwrap(), 1);

    let file = store.load_file(file_id).await.unwrap();
    assert_eq!(file.status, FileStatus::Pending);
    // The checkpointed byte counter survives the restart.
    assert_eq!(file.bytes_downloaded, 2048);
    assert_eq!(store.pending_files(&job_id).await.unwrap(), vec![file_id]);
}

/// Status transitions persist across sessions byte for byte.
#[tokio::test]
async fn test_outcomes_survive_restart() {
    let dir = TempDir::new().unwrap();
    let (store, job_id, file_id) = seeded_store(&dir).await;

    assert!(store.claim_file(file_id).await.unwrap());
    store
        .release_file(
            file_id,
            &FileOutcome {
                status: FileStatus::Failed,
                bytes_downloaded: 1024,
                attempts: 5,
                last_error: Some("integrity".to_string()),
                http_status: None,
            },
        )
        .await
        .unwrap();
    drop(store);

    let store = StateStore::open(&dir.path().join(STATE_FILE_NAME))
        .await
        .unwrap();
    let file = store.load_file(file_id).await.unwrap();
    assert_eq!(file.status, FileStatus::Failed);
    assert_eq!(file.attempts, 5);

    let counts = store.progress_snapshot(&job_id).await.unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.bytes_downloaded, 1024);
    assert!(counts.is_drained());
}

/// A claimed file is invisible to the queue rebuild until released.
#[tokio::test]
async fn test_claimed_files_not_listed_as_pending() {
    let dir = TempDir::new().unwrap();
    let (store, job_id, file_id) = seeded_store(&dir).await;

    assert!(store.claim_file(file_id).await.unwrap());
    assert!(store.pending_files(&job_id).await.unwrap().is_empty());

    store
        .release_file(
            file_id,
            &FileOutcome {
                status: FileStatus::Pending,
                bytes_downloaded: 0,
                attempts: 1,
                last_error: None,
                http_status: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(store.pending_files(&job_id).await.unwrap(), vec![file_id]);
}
