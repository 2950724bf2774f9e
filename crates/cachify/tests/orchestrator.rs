//! End-to-end tests for the composite orchestrator.
//!
//! Logical expirations are driven by a manual clock; soft/hard timeouts run
//! on tokio's paused test time, which auto-advances whenever every task is
//! idle.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::macros::datetime;
use tokio::sync::Notify;

use cachify::{
    CacheConfig, CacheError, CacheStore, EntryOptions, GetOutcome, HybridCache, ManualClock,
    MemoryStore, ResilienceOptions, Result, StaleReason,
};

fn manual_clock() -> ManualClock {
    ManualClock::new(datetime!(2024-01-01 00:00:00 UTC))
}

fn config(fail_safe_secs: u64, default_ttl_secs: u64) -> CacheConfig {
    let mut config = CacheConfig::default();
    config.default_ttl = Duration::from_secs(default_ttl_secs);
    config.resilience =
        ResilienceOptions::default().fail_safe_max_duration(Duration::from_secs(fail_safe_secs));
    config
}

fn layered_cache(clock: &ManualClock, config: CacheConfig) -> (HybridCache, Arc<MemoryStore>) {
    let l2 = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let cache = HybridCache::builder()
        .clock(Arc::new(clock.clone()))
        .l2(l2.clone())
        .config(config)
        .build()
        .expect("build cache");
    (cache, l2)
}

/// L2 double whose every operation fails.
struct BrokenStore;

#[async_trait]
impl CacheStore for BrokenStore {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
        Err(CacheError::store("connection refused"))
    }

    async fn set(
        &self,
        _key: &str,
        _value: Bytes,
        _ttl: Option<Duration>,
        _sliding: Option<Duration>,
    ) -> Result<()> {
        Err(CacheError::store("connection refused"))
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Err(CacheError::store("connection refused"))
    }

    async fn is_available(&self) -> bool {
        false
    }
}

// =============================================================================
// Scenario 1: stale served within the fail-safe window
// =============================================================================

#[tokio::test]
async fn stale_served_within_fail_safe() {
    let clock = manual_clock();
    let (cache, _l2) = layered_cache(&clock, config(5, 10));

    cache.set("user:1", &b"cached"[..], None).await.unwrap();

    clock.advance(Duration::from_secs(11));
    match cache.get_with_state("user:1").await.unwrap() {
        GetOutcome::Stale { value, reason } => {
            assert_eq!(value.as_ref(), b"cached");
            assert_eq!(reason, StaleReason::Expired);
        }
        other => panic!("expected stale, got {other:?}"),
    }

    clock.advance(Duration::from_secs(5));
    assert!(cache.get("user:1").await.unwrap().is_none());
}

// =============================================================================
// Scenario 2: soft timeout + background refresh
// =============================================================================

#[tokio::test(start_paused = true)]
async fn soft_timeout_serves_stale_then_refresh_completes() {
    let clock = manual_clock();
    let mut config = config(5, 10);
    config.resilience = config
        .resilience
        .soft_timeout(Duration::from_secs(2))
        .hard_timeout(Duration::from_secs(10));
    let (cache, _l2) = layered_cache(&clock, config);

    cache.set("user:3", &b"stale"[..], None).await.unwrap();
    clock.advance(Duration::from_secs(11));

    let release = Arc::new(Notify::new());
    let gate = Arc::clone(&release);
    let value = cache
        .get_or_set(
            "user:3",
            move || {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok::<_, Infallible>(Bytes::from_static(b"fresh"))
                }
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(value.as_ref(), b"stale");

    // Let the still-running factory finish.
    release.notify_waiters();
    let mut refreshed = false;
    for _ in 0..200 {
        if cache.get("user:3").await.unwrap() == Some(Bytes::from_static(b"fresh")) {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(refreshed, "background refresh never landed");
}

// =============================================================================
// Scenario 3: hard timeout with no stale candidate
// =============================================================================

#[tokio::test(start_paused = true)]
async fn hard_timeout_without_stale_surfaces_error() {
    let clock = manual_clock();
    let mut config = config(0, 10);
    config.resilience = config.resilience.hard_timeout(Duration::from_secs(2));
    let (cache, _l2) = layered_cache(&clock, config);

    let err = cache
        .get_or_set(
            "user:4",
            || async {
                std::future::pending::<()>().await;
                Ok::<_, Infallible>(Bytes::new())
            },
            None,
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected hard timeout, got {err}");
}

// =============================================================================
// Scenario 4: stampede coalescing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_factory_run() {
    let clock = manual_clock();
    let (cache, _l2) = layered_cache(&clock, config(0, 10));

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut callers = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let invocations = Arc::clone(&invocations);
        callers.push(tokio::spawn(async move {
            cache
                .get_or_set(
                    "user:5",
                    move || {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok::<_, Infallible>(Bytes::from_static(b"computed"))
                        }
                    },
                    None,
                )
                .await
                .unwrap()
        }));
    }

    for caller in callers {
        assert_eq!(caller.await.unwrap().as_ref(), b"computed");
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Factory failure fallback
// =============================================================================

#[derive(Debug, thiserror::Error)]
#[error("backend down")]
struct BackendDown;

#[tokio::test]
async fn factory_error_with_stale_candidate_serves_stale() {
    let clock = manual_clock();
    let (cache, _l2) = layered_cache(&clock, config(5, 10));

    cache.set("user:6", &b"old"[..], None).await.unwrap();
    clock.advance(Duration::from_secs(11));

    let value = cache
        .get_or_set(
            "user:6",
            || async { Err::<Bytes, _>(BackendDown) },
            None,
        )
        .await
        .unwrap();
    assert_eq!(value.as_ref(), b"old");
}

#[tokio::test]
async fn factory_error_without_stale_propagates() {
    let clock = manual_clock();
    let (cache, _l2) = layered_cache(&clock, config(0, 10));

    let err = cache
        .get_or_set(
            "user:7",
            || async { Err::<Bytes, _>(BackendDown) },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Factory(_)));
    assert!(err.to_string().contains("backend down"));
}

// =============================================================================
// L2 failure semantics
// =============================================================================

#[tokio::test]
async fn l2_failure_with_l1_stale_serves_stale() {
    let clock = manual_clock();
    let l1 = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let cache = HybridCache::builder()
        .clock(Arc::new(clock.clone()))
        .l1(l1.clone())
        .l2(Arc::new(BrokenStore))
        .config(config(60, 10))
        .build()
        .unwrap();

    // Write goes through despite the broken L2 (fail_fast is off)...
    cache.set("user:8", &b"survivor"[..], None).await.unwrap();
    // ...and reads fall back to the stale L1 copy when L2 errors.
    clock.advance(Duration::from_secs(11));
    match cache.get_with_state("user:8").await.unwrap() {
        GetOutcome::Stale { value, reason } => {
            assert_eq!(value.as_ref(), b"survivor");
            assert_eq!(reason, StaleReason::L2Failure);
        }
        other => panic!("expected stale via fail-safe, got {other:?}"),
    }
}

#[tokio::test]
async fn l2_failure_without_stale_is_a_miss_by_default() {
    let clock = manual_clock();
    let cache = HybridCache::builder()
        .clock(Arc::new(clock.clone()))
        .l2(Arc::new(BrokenStore))
        .config(config(0, 10))
        .build()
        .unwrap();

    assert!(cache.get("user:9").await.unwrap().is_none());
}

#[tokio::test]
async fn l2_failure_without_stale_fails_fast_when_configured() {
    let clock = manual_clock();
    let mut config = config(0, 10);
    config.fail_fast_on_l2_errors = true;
    let cache = HybridCache::builder()
        .clock(Arc::new(clock.clone()))
        .l2(Arc::new(BrokenStore))
        .config(config)
        .build()
        .unwrap();

    let err = cache.get("user:10").await.unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
}

// =============================================================================
// Read/write laws and boundaries
// =============================================================================

#[tokio::test]
async fn set_then_get_returns_value_while_fresh() {
    let clock = manual_clock();
    let (cache, _l2) = layered_cache(&clock, config(5, 10));

    cache.set("law:1", &b"v"[..], None).await.unwrap();
    clock.advance(Duration::from_secs(10));
    assert_eq!(
        cache.get("law:1").await.unwrap(),
        Some(Bytes::from_static(b"v"))
    );
    assert!(!cache.get_with_state("law:1").await.unwrap().is_stale());
}

#[tokio::test]
async fn remove_deletes_payload_and_metadata_from_both_tiers() {
    let clock = manual_clock();
    let (cache, l2) = layered_cache(&clock, config(5, 10));

    cache.set("law:2", &b"v"[..], None).await.unwrap();
    assert!(l2.get("law:2").await.unwrap().is_some());
    assert!(l2.get("law:2:meta").await.unwrap().is_some());

    cache.remove("law:2").await.unwrap();
    assert!(cache.get("law:2").await.unwrap().is_none());
    assert!(l2.get("law:2").await.unwrap().is_none());
    assert!(l2.get("law:2:meta").await.unwrap().is_none());
}

#[tokio::test]
async fn zero_ttl_goes_stale_on_next_read() {
    let clock = manual_clock();
    let (cache, _l2) = layered_cache(&clock, config(5, 10));

    let options = EntryOptions::new().ttl(Duration::ZERO);
    cache.set("law:3", &b"v"[..], Some(&options)).await.unwrap();

    // TTLs are floored at one millisecond.
    clock.advance(Duration::from_millis(2));
    assert!(cache.get_with_state("law:3").await.unwrap().is_stale());
}

#[tokio::test]
async fn zero_ttl_without_fail_safe_is_a_miss() {
    let clock = manual_clock();
    let (cache, _l2) = layered_cache(&clock, config(0, 10));

    let options = EntryOptions::new().ttl(Duration::ZERO);
    cache.set("law:4", &b"v"[..], Some(&options)).await.unwrap();

    clock.advance(Duration::from_millis(2));
    assert!(cache.get("law:4").await.unwrap().is_none());
}

#[tokio::test]
async fn l2_hit_refills_l1() {
    let clock = manual_clock();
    let (cache, l2) = layered_cache(&clock, config(60, 100));

    cache.set("law:5", &b"v"[..], None).await.unwrap();

    // A second instance over the same L2 starts with a cold L1.
    let peer = HybridCache::builder()
        .clock(Arc::new(clock.clone()))
        .l2(l2)
        .config(config(60, 100))
        .build()
        .unwrap();

    assert_eq!(
        peer.get("law:5").await.unwrap(),
        Some(Bytes::from_static(b"v"))
    );
    // The refill landed in the peer's L1 (payload + metadata).
    assert_eq!(peer.stats().l1_entries, Some(2));
}

#[tokio::test]
async fn key_prefix_namespaces_entries() {
    let clock = manual_clock();
    let mut prefixed = config(0, 10);
    prefixed.key_prefix = Some("svc".to_string());
    let l2 = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
    let cache = HybridCache::builder()
        .clock(Arc::new(clock.clone()))
        .l2(l2.clone())
        .config(prefixed)
        .build()
        .unwrap();

    cache.set("user:1", &b"v"[..], None).await.unwrap();
    assert!(l2.get("svc:user:1").await.unwrap().is_some());
    assert!(l2.get("user:1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn negative_cache_ttl_applies_to_empty_values() {
    let clock = manual_clock();
    let (cache, _l2) = layered_cache(&clock, config(0, 100));

    let options = EntryOptions::new().negative_cache_ttl(Duration::from_secs(1));
    cache.set("law:6", Bytes::new(), Some(&options)).await.unwrap();

    clock.advance(Duration::from_millis(500));
    assert_eq!(cache.get("law:6").await.unwrap(), Some(Bytes::new()));

    clock.advance(Duration::from_secs(1));
    assert!(cache.get("law:6").await.unwrap().is_none());
}
