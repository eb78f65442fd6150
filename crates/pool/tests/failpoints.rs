#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Fail-point injection in the refill path.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p edek-pool --features failpoints --test failpoints
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use edek_kms::{KeyName, KmsError, MemoryKeyProvider, testutil::provider_with_keys};
use edek_pool::{EdekPool, EdekPoolConfig, FillOutcome, PoolError};

fn pool(kms: &MemoryKeyProvider) -> EdekPool {
    let config = EdekPoolConfig::builder().num_values(8).failure_threshold(100).build().unwrap();
    EdekPool::new(config, Arc::new(kms.clone())).unwrap()
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn generate_failpoint_fails_fill_and_clears() {
    let scenario = fail::FailScenario::setup();
    let kms = provider_with_keys(&["k1"]);
    let pool = pool(&kms);
    let key = KeyName::from("k1");

    fail::cfg("memory-kms-generate", "return").expect("failed to configure fail point");

    let err = pool.ensure_filled(&key).await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err.kms_error(), Some(KmsError::Connection { .. })));
    assert_eq!(pool.metrics().refill_errors, 1);
    assert_eq!(pool.size(&key), 0);

    fail::remove("memory-kms-generate");
    let outcome = pool.ensure_filled(&key).await.unwrap();
    assert_eq!(outcome, FillOutcome::Filled { requested: 8, accepted: 8 });

    pool.shutdown().await;
    scenario.teardown();
}

#[tokio::test]
async fn queued_edeks_are_served_while_kms_fails() {
    let scenario = fail::FailScenario::setup();
    let kms = provider_with_keys(&["k1"]);
    let pool = pool(&kms);
    let key = KeyName::from("k1");
    pool.ensure_filled(&key).await.unwrap();

    fail::cfg("memory-kms-generate", "return").expect("failed to configure fail point");

    for _ in 0..8 {
        assert!(pool.get_or_generate(&key).await.is_ok());
    }
    // Queue drained: the synchronous fallback now sees the failure.
    let err = pool.get_or_generate(&key).await.unwrap_err();
    assert!(matches!(err, PoolError::Kms { .. }));
    eventually("background refills to fail", || pool.metrics().refill_errors > 0).await;

    pool.shutdown().await;
    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_refill_coalesces_triggers() {
    let scenario = fail::FailScenario::setup();
    let kms = provider_with_keys(&["k1"]);
    let pool = pool(&kms);
    let key = KeyName::from("k1");

    fail::cfg("edek-pool-refill-before-fetch", "sleep(200)")
        .expect("failed to configure fail point");

    let started = Instant::now();
    assert!(pool.try_get(&key).is_none());
    assert!(started.elapsed() < Duration::from_millis(100));
    eventually("the refill to start", || pool.is_refilling(&key)).await;

    assert!(!pool.schedule_refill(&key));
    assert_eq!(pool.ensure_filled(&key).await.unwrap(), FillOutcome::Coalesced);

    eventually("the queue to fill", || pool.size(&key) == 8).await;
    assert_eq!(kms.generate_calls(), 1);

    fail::remove("edek-pool-refill-before-fetch");
    pool.shutdown().await;
    scenario.teardown();
}
