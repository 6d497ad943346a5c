//! Integration tests for the token-bucket bandwidth governor.

use archive_batch_downloader::downloader::{CancelGate, RateGovernor};
use std::time::{Duration, Instant};

/// Steady demand over a window never beats the configured rate by more
/// than one bucket of burst.
#[tokio::test]
async fn test_delivery_bounded_by_rate_plus_burst() {
    let rate = 20_480u64; // 20 KiB/s
    let governor = RateGovernor::new(rate);
    let cancel = CancelGate::new();

    let window = Duration::from_secs(2);
    let start = Instant::now();
    let mut delivered = 0u64;
    while start.elapsed() < window {
        assert!(governor.consume(1_024, &cancel).await);
        delivered += 1_024;
    }

    let ceiling = rate * window.as_secs() + rate; // window * rate + bucket
    assert!(
        delivered <= ceiling,
        "delivered {delivered} bytes, ceiling {ceiling}"
    );
}

/// A zero rate disables governing: demand is admitted instantly.
#[tokio::test]
async fn test_zero_rate_is_unlimited() {
    let governor = RateGovernor::new(0);
    let cancel = CancelGate::new();

    let start = Instant::now();
    let mut delivered = 0u64;
    for _ in 0..10_000 {
        assert!(governor.consume(131_072, &cancel).await);
        delivered += 131_072;
    }
    assert!(delivered > 1_000_000_000);
    assert!(start.elapsed() < Duration::from_secs(1));
}

/// A capped transfer takes at least `size / rate` seconds end to end.
#[tokio::test]
async fn test_transfer_time_floor_under_cap() {
    let governor = RateGovernor::new(16_384); // 16 KiB/s
    let cancel = CancelGate::new();

    // 48 KiB of demand in chunk-sized pieces.
    let start = Instant::now();
    for _ in 0..48 {
        assert!(governor.consume(1_024, &cancel).await);
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(2_500),
        "finished too fast: {elapsed:?}"
    );
    assert!(elapsed <= Duration::from_secs(6), "too slow: {elapsed:?}");
}
