//! Integration tests for the global backoff coordinator.

use archive_batch_downloader::downloader::backoff::{BACKOFF_MAX, BACKOFF_MIN};
use archive_batch_downloader::downloader::{BackoffCoordinator, CancelGate, TripReason};
use std::sync::Arc;
use std::time::Duration;

/// After a trip the quiet window sits inside the randomized 30-60s band.
#[test]
fn test_trip_window_randomized_in_band() {
    for _ in 0..8 {
        let coordinator = BackoffCoordinator::new();
        coordinator.trip(TripReason::Throttled);
        let remaining = coordinator.remaining().expect("gate closed after trip");
        assert!(remaining <= BACKOFF_MAX);
        assert!(remaining + Duration::from_millis(100) >= BACKOFF_MIN);
    }
}

/// Concurrent trips from many workers extend to the max, never stack.
#[tokio::test]
async fn test_concurrent_trips_take_max() {
    let coordinator = Arc::new(BackoffCoordinator::new());

    let mut handles = vec![];
    for i in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let reason = if i % 2 == 0 {
                TripReason::Throttled
            } else {
                TripReason::Overloaded
            };
            coordinator.trip(reason);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // However many trips landed, the window never exceeds one max interval.
    let remaining = coordinator.remaining().unwrap();
    assert!(remaining <= BACKOFF_MAX);
}

/// An idle gate admits workers immediately.
#[tokio::test]
async fn test_idle_gate_is_open() {
    let coordinator = BackoffCoordinator::new();
    let cancel = CancelGate::new();

    let started = std::time::Instant::now();
    assert!(coordinator.wait(&cancel).await);
    assert!(started.elapsed() < Duration::from_millis(100));
}

/// Cancellation aborts a blocked wait without sleeping out the window.
#[tokio::test]
async fn test_cancellation_aborts_wait() {
    let coordinator = Arc::new(BackoffCoordinator::new());
    let cancel = CancelGate::new();
    coordinator.trip(TripReason::Overloaded);

    let waiter = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.wait(&cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let admitted = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("wait must abort promptly on cancellation")
        .unwrap();
    assert!(!admitted);
    // The window itself is untouched by the aborted wait.
    assert!(coordinator.remaining().is_some());
}
