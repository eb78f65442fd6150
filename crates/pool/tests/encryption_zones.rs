//! End-to-end behavior of the pool behind a coordinator.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use edek_kms::{KeyName, MemoryKeyProvider, testutil::provider_with_keys};
use edek_pool::{
    Coordinator, CoordinatorConfig, EdekPool, EdekPoolConfig, EncryptionZone,
    EncryptionZoneRegistry, FillOutcome, MemoryZoneRegistry, PoolError, PoolResult, QueueWarmer,
    SyncGenerationPolicy, WarmupConfig,
};
use edek_tokens::{Credentials, DelegationTokenIssuer};

fn coordinator_config(num_values: usize) -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .service("nn1:8020")
        .pool(EdekPoolConfig::builder().num_values(num_values).build().unwrap())
        .warmup(WarmupConfig::builder().initial_delay(Duration::ZERO).build().unwrap())
        .build()
        .unwrap()
}

fn start(
    kms: &MemoryKeyProvider,
    zones: &Arc<MemoryZoneRegistry>,
    config: CoordinatorConfig,
) -> Coordinator {
    let issuer: Arc<dyn DelegationTokenIssuer> = Arc::new(kms.clone());
    Coordinator::start(config, Arc::new(kms.clone()), Arc::clone(zones), Some(issuer)).unwrap()
}

fn pool(kms: &MemoryKeyProvider, config: EdekPoolConfig) -> EdekPool {
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
async fn test_file_create_leaves_queue_populated() {
    let kms = provider_with_keys(&["k1"]);
    let zones = Arc::new(MemoryZoneRegistry::new());
    let coordinator = start(&kms, &zones, coordinator_config(10));
    let key = KeyName::from("k1");

    coordinator.create_encryption_zone("/zone", &key).await.unwrap();
    let info = coordinator.create_file("/zone/file").await.unwrap().unwrap();

    assert_eq!(info.edek.key_name, key);
    assert!(coordinator.key_queue_size(&key) > 0);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_restart_warms_existing_zones_without_file_creates() {
    let kms = provider_with_keys(&["k1"]);
    let zones = Arc::new(MemoryZoneRegistry::new());
    let key = KeyName::from("k1");

    let first = start(&kms, &zones, coordinator_config(10));
    first.create_encryption_zone("/zone", &key).await.unwrap();
    first.shutdown().await;
    assert_eq!(first.key_queue_size(&key), 0);

    let second = start(&kms, &zones, coordinator_config(10));
    eventually("warmup to fill the queue", || second.key_queue_size(&key) > 0).await;

    let report = second.wait_for_warmup().await.unwrap();
    assert_eq!(report.distinct_keys, 1);
    assert!(report.is_complete());
    assert_eq!(second.pool().metrics().warmup_runs, 1);
    second.shutdown().await;
}

#[tokio::test]
async fn test_delegation_tokens_are_not_duplicated() {
    let kms = provider_with_keys(&[]);
    let zones = Arc::new(MemoryZoneRegistry::new());
    let coordinator = start(&kms, &zones, coordinator_config(10));
    let mut creds = Credentials::new();

    let first = coordinator.add_delegation_tokens("JobTracker", &mut creds).await;
    assert_eq!(first.len(), 2);
    assert_eq!(creds.number_of_tokens(), 2);

    let second = coordinator.add_delegation_tokens("JobTracker", &mut creds).await;
    assert!(second.is_empty());
    assert_eq!(creds.number_of_tokens(), 2);
    assert_eq!(kms.tokens_issued(), 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_kms_token_failure_does_not_block_filesystem_token() {
    let kms = provider_with_keys(&[]);
    kms.set_unavailable(true);
    let zones = Arc::new(MemoryZoneRegistry::new());
    let coordinator = start(&kms, &zones, coordinator_config(10));
    let mut creds = Credentials::new();

    let collection = coordinator.collect_delegation_tokens("JobTracker", &mut creds).await;
    assert_eq!(collection.issued.len(), 1);
    assert_eq!(collection.failures.len(), 1);

    kms.set_unavailable(false);
    let retried = coordinator.add_delegation_tokens("JobTracker", &mut creds).await;
    assert_eq!(retried.len(), 1);
    assert_eq!(creds.number_of_tokens(), 2);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_decrypt_requires_kms_token_when_enforced() {
    let kms = provider_with_keys(&["k1"]).requiring_delegation_token();
    let zones = Arc::new(MemoryZoneRegistry::new());
    let coordinator = start(&kms, &zones, coordinator_config(10));
    coordinator.create_encryption_zone("/zone", &KeyName::from("k1")).await.unwrap();
    let info = coordinator.create_file("/zone/file").await.unwrap().unwrap();

    let mut creds = Credentials::new();
    assert!(coordinator.decrypt_file_key(&info, &creds).await.is_err());

    coordinator.add_delegation_tokens("JobTracker", &mut creds).await;
    let dek = coordinator.decrypt_file_key(&info, &creds).await.unwrap();
    assert_eq!(dek.key_version_name(), &info.edek.key_version_name);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_try_get_does_not_wait_on_stalled_kms() {
    let kms = provider_with_keys(&["k1"]);
    kms.stall();
    let pool = pool(&kms, EdekPoolConfig::builder().num_values(10).build().unwrap());
    let key = KeyName::from("k1");

    let started = Instant::now();
    assert!(pool.try_get(&key).is_none());
    assert!(pool.drain_for(&key, 5).is_empty());
    assert!(started.elapsed() < Duration::from_millis(100));

    eventually("background refill to reach the KMS", || kms.generate_calls() == 1).await;
    kms.release();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_sync_fallback_is_bounded_by_kms_timeout() {
    let kms = provider_with_keys(&["k1"]);
    kms.stall();
    let config = EdekPoolConfig::builder()
        .num_values(10)
        .kms_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let pool = pool(&kms, config);

    let started = Instant::now();
    let err = pool.get_or_generate(&KeyName::from("k1")).await.unwrap_err();

    assert!(matches!(err, PoolError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(2));
    kms.release();
    pool.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_triggers_issue_one_kms_request() {
    let kms = provider_with_keys(&["k1"]);
    kms.stall();
    let pool = Arc::new(pool(&kms, EdekPoolConfig::builder().num_values(10).build().unwrap()));
    let key = KeyName::from("k1");

    assert!(pool.schedule_refill(&key));
    assert!(!pool.schedule_refill(&key));
    assert!(pool.try_get(&key).is_none());
    eventually("the refill to reach the KMS", || kms.generate_calls() == 1).await;

    let direct = {
        let pool = Arc::clone(&pool);
        let key = key.clone();
        tokio::spawn(async move { pool.ensure_filled(&key).await })
    };
    assert_eq!(direct.await.unwrap().unwrap(), FillOutcome::Coalesced);

    kms.release();
    eventually("the queue to fill", || pool.size(&key) == 10).await;
    assert_eq!(kms.generate_calls(), 1);
    assert!(pool.metrics().coalesced_triggers >= 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_ensure_filled_coalesces() {
    let kms = provider_with_keys(&["k1"]);
    kms.set_latency(Duration::from_millis(50));
    let pool = pool(&kms, EdekPoolConfig::builder().num_values(10).build().unwrap());
    let key = KeyName::from("k1");

    let (a, b) = tokio::join!(pool.ensure_filled(&key), pool.ensure_filled(&key));
    let mut outcomes = [a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|outcome| matches!(outcome, FillOutcome::Coalesced));

    assert_eq!(outcomes[0], FillOutcome::Filled { requested: 10, accepted: 10 });
    assert_eq!(outcomes[1], FillOutcome::Coalesced);
    assert_eq!(kms.generate_calls(), 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_warmup_over_no_zones_makes_no_kms_calls() {
    let kms = provider_with_keys(&["k1"]);
    let zones = Arc::new(MemoryZoneRegistry::new());
    let coordinator = start(&kms, &zones, coordinator_config(10));

    let report = coordinator.wait_for_warmup().await.unwrap();

    assert_eq!(report.distinct_keys, 0);
    assert_eq!(kms.generate_calls(), 0);
    assert_eq!(kms.metadata_calls(), 0);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_repeated_failures_back_off_until_kms_recovers() {
    let kms = provider_with_keys(&["k1"]);
    kms.set_unavailable(true);
    let config = EdekPoolConfig::builder()
        .num_values(4)
        .failure_threshold(2)
        .failure_backoff(Duration::from_secs(30))
        .sync_generation_policy(SyncGenerationPolicy::One)
        .build()
        .unwrap();
    let pool = pool(&kms, config);
    let key = KeyName::from("k1");

    for failures in 1..=2 {
        assert!(pool.try_get(&key).is_none());
        eventually("the refill to fail", || {
            pool.metrics().refill_errors == failures && !pool.is_refilling(&key)
        })
        .await;
    }
    assert!(pool.backoff_remaining(&key).is_some());

    // Suspended: misses no longer reach the KMS.
    for _ in 0..5 {
        assert!(pool.try_get(&key).is_none());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(kms.generate_calls(), 2);
    assert!(matches!(pool.ensure_filled(&key).await, Err(PoolError::RefillBackoff { .. })));

    // The synchronous path still serves once the KMS is back, and clears the backoff.
    kms.set_unavailable(false);
    let edek = pool.get_or_generate(&key).await.unwrap();
    assert_eq!(edek.key_name, key);
    assert!(pool.backoff_remaining(&key).is_none());
    assert_eq!(kms.generate_calls(), 3);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_unknown_key_backs_off_immediately() {
    let kms = provider_with_keys(&[]);
    let pool = pool(&kms, EdekPoolConfig::builder().num_values(4).build().unwrap());
    let key = KeyName::from("ghost");

    assert!(pool.try_get(&key).is_none());
    eventually("the refill to fail", || pool.metrics().refill_errors == 1).await;
    assert!(pool.backoff_remaining(&key).is_some());

    let err = pool.get_or_generate(&key).await.unwrap_err();
    assert!(!err.is_transient());
    pool.shutdown().await;
}

#[tokio::test]
async fn test_warmup_of_zones_sharing_a_key_requests_once() {
    let kms = provider_with_keys(&["shared"]);
    let zones = Arc::new(MemoryZoneRegistry::new());
    zones.create_zone("/a", KeyName::from("shared")).unwrap();
    zones.create_zone("/b", KeyName::from("shared")).unwrap();

    let coordinator = start(&kms, &zones, coordinator_config(10));
    let report = coordinator.wait_for_warmup().await.unwrap();

    assert_eq!(report.distinct_keys, 1);
    assert_eq!(kms.generate_calls(), 1);
    assert_eq!(coordinator.key_queue_size(&KeyName::from("shared")), 10);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_expired_entries_are_not_handed_out() {
    let kms = provider_with_keys(&["k1"]);
    let config = EdekPoolConfig::builder()
        .num_values(4)
        .entry_ttl(Duration::from_millis(50))
        .build()
        .unwrap();
    let pool = pool(&kms, config);
    let key = KeyName::from("k1");

    pool.ensure_filled(&key).await.unwrap();
    assert_eq!(pool.size(&key), 4);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(pool.size(&key), 0);
    assert!(pool.try_get(&key).is_none());
    assert_eq!(pool.metrics().expired_discards, 4);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_rolled_key_queue_is_invalidated() {
    let kms = provider_with_keys(&["k1"]);
    let pool = pool(&kms, EdekPoolConfig::builder().num_values(4).build().unwrap());
    let key = KeyName::from("k1");
    pool.ensure_filled(&key).await.unwrap();

    let version = kms.roll_new_version(&key).unwrap();
    assert_eq!(pool.invalidate(&key), 4);

    pool.ensure_filled(&key).await.unwrap();
    assert_eq!(pool.try_get(&key).unwrap().key_version_name, version);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_no_kms_request_after_shutdown() {
    let kms = provider_with_keys(&["k1"]);
    kms.stall();
    let config = EdekPoolConfig::builder()
        .num_values(4)
        .kms_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let pool = pool(&kms, config);
    let key = KeyName::from("k1");

    // An in-flight refill is allowed to run into its timeout.
    assert!(pool.try_get(&key).is_none());
    eventually("the refill to reach the KMS", || kms.generate_calls() == 1).await;
    pool.shutdown().await;
    kms.release();

    assert!(pool.try_get(&key).is_none());
    assert!(pool.drain_for(&key, 3).is_empty());
    assert!(!pool.schedule_refill(&key));
    pool.initialize_queues([&key]);
    assert!(matches!(pool.ensure_filled(&key).await, Err(PoolError::ShuttingDown)));
    assert!(matches!(pool.get_or_generate(&key).await, Err(PoolError::ShuttingDown)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(kms.generate_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_never_share_an_edek() {
    let kms = provider_with_keys(&["k1"]);
    let config = EdekPoolConfig::builder()
        .num_values(64)
        .sync_generation_policy(SyncGenerationPolicy::One)
        .build()
        .unwrap();
    let pool = Arc::new(pool(&kms, config));
    let key = KeyName::from("k1");
    pool.ensure_filled(&key).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let mut ivs = Vec::new();
            for _ in 0..32 {
                ivs.push(pool.get_or_generate(&key).await.unwrap().iv);
            }
            ivs
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for iv in task.await.unwrap() {
            assert!(seen.insert(iv), "EDEK handed out twice");
        }
    }
    assert_eq!(seen.len(), 256);
    pool.shutdown().await;
}

struct UnreachableRegistry;

#[async_trait]
impl EncryptionZoneRegistry for UnreachableRegistry {
    async fn list_encryption_zones(&self) -> PoolResult<Vec<EncryptionZone>> {
        Err(PoolError::zone_registry("namespace not loaded"))
    }
}

#[tokio::test]
async fn test_warmup_reports_registry_failure() {
    let kms = provider_with_keys(&["k1"]);
    let pool = Arc::new(pool(&kms, EdekPoolConfig::default()));
    let warmer = QueueWarmer::new(
        Arc::clone(&pool),
        Arc::new(UnreachableRegistry),
        WarmupConfig::default(),
    );

    let err = warmer.warmup().await.unwrap_err();

    assert!(matches!(err, PoolError::ZoneRegistry { .. }));
    assert_eq!(kms.generate_calls(), 0);
    pool.shutdown().await;
}
