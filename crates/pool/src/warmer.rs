//! Startup warmup of key queues.
//!
//! The warmer reads the active encryption zones once, reduces them to the
//! set of distinct keys and fills each key's queue through
//! [`EdekPool::ensure_filled`], a bounded number of keys at a time. Keys
//! that fail are retried every `retry_interval` until they succeed,
//! `max_attempts` passes have run, or the pool shuts down. A key whose fill
//! coalesced into a refill already in flight counts as warmed only if that
//! refill left entries in the queue.

use std::{collections::BTreeSet, sync::Arc};

use edek_kms::KeyName;
use tokio::{
    sync::Semaphore,
    task::{JoinHandle, JoinSet},
};

use crate::{
    config::WarmupConfig,
    error::{PoolError, PoolResult},
    pool::EdekPool,
    refiller::FillOutcome,
    zones::EncryptionZoneRegistry,
};

/// Summary of one warmup run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Distinct keys across all zones.
    pub distinct_keys: usize,
    /// Keys whose queues hold entries (filled now, or already full).
    pub warmed: usize,
    /// Keys still failing when the run ended.
    pub failed: Vec<KeyName>,
    /// Passes made over the pending keys.
    pub attempts: u32,
}

impl WarmupReport {
    /// Returns `true` if every key was warmed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Primes the queues of every encryption zone key.
pub struct QueueWarmer {
    pool: Arc<EdekPool>,
    registry: Arc<dyn EncryptionZoneRegistry>,
    config: WarmupConfig,
}

impl std::fmt::Debug for QueueWarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWarmer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl QueueWarmer {
    /// Creates a warmer over `registry` that fills queues in `pool`.
    #[must_use]
    pub fn new(
        pool: Arc<EdekPool>,
        registry: Arc<dyn EncryptionZoneRegistry>,
        config: WarmupConfig,
    ) -> Self {
        Self { pool, registry, config }
    }

    /// Runs [`warmup`](Self::warmup) in the background after `initial_delay`.
    ///
    /// A disabled warmer resolves at once with an empty report. The task
    /// ends early with [`PoolError::ShuttingDown`] if the pool shuts down
    /// during the delay.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn spawn(self) -> JoinHandle<PoolResult<WarmupReport>> {
        tokio::spawn(async move {
            if !self.config.enabled() {
                tracing::info!("EDEK queue warmup disabled");
                return Ok(WarmupReport::default());
            }

            let cancel = self.pool.cancel_token().clone();
            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::ShuttingDown),
                _ = tokio::time::sleep(self.config.initial_delay()) => {}
            }
            self.warmup().await
        })
    }

    /// Fills the queue of every distinct zone key.
    ///
    /// Zones sharing a key cause one fill, and keys already full cause no KMS
    /// request, so running this twice does not over-request.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ZoneRegistry`] if the zones cannot be listed.
    /// Per-key failures are reported in [`WarmupReport::failed`].
    #[tracing::instrument(skip(self))]
    pub async fn warmup(&self) -> PoolResult<WarmupReport> {
        let zones = self.registry.list_encryption_zones().await?;
        let zone_count = zones.len();
        let keys: BTreeSet<KeyName> = zones.into_iter().map(|zone| zone.key_name).collect();

        let mut report = WarmupReport { distinct_keys: keys.len(), ..WarmupReport::default() };
        if keys.is_empty() {
            tracing::info!("no encryption zones, nothing to warm");
            return Ok(report);
        }

        self.pool.record_warmup_run();
        tracing::info!(zones = zone_count, keys = keys.len(), "warming EDEK queues");

        let cancel = self.pool.cancel_token().clone();
        let mut pending: Vec<KeyName> = keys.into_iter().collect();
        loop {
            report.attempts += 1;
            pending = self.warm_pass(pending).await;
            report.warmed = report.distinct_keys - pending.len();

            if pending.is_empty()
                || cancel.is_cancelled()
                || self.config.max_attempts().is_some_and(|max| report.attempts >= max)
            {
                break;
            }

            tracing::warn!(
                remaining = pending.len(),
                attempt = report.attempts,
                retry_ms = self.config.retry_interval().as_millis() as u64,
                "retrying keys that failed to warm",
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_interval()) => {}
            }
        }

        report.failed = pending;
        if report.is_complete() {
            tracing::info!(
                keys = report.distinct_keys,
                attempts = report.attempts,
                "EDEK warmup complete",
            );
        } else {
            tracing::warn!(
                warmed = report.warmed,
                failed = report.failed.len(),
                attempts = report.attempts,
                "EDEK warmup gave up on some keys",
            );
        }
        Ok(report)
    }

    /// Fills `keys` concurrently and returns the ones that failed.
    async fn warm_pass(&self, keys: Vec<KeyName>) -> Vec<KeyName> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency()));
        let mut tasks = JoinSet::new();

        for key in keys {
            let pool = Arc::clone(&self.pool);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (key, Err(PoolError::ShuttingDown));
                };
                let result = warm_key(&pool, &key).await;
                (key, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(Some(outcome)))) => {
                    tracing::debug!(key = %key, ?outcome, "warmed key queue");
                },
                Ok((key, Ok(None))) => {
                    tracing::warn!(key = %key, "concurrent refill left key queue empty");
                    failed.push(key);
                },
                Ok((key, Err(err))) => {
                    tracing::warn!(key = %key, error = %err, "failed to warm key queue");
                    failed.push(key);
                },
                Err(err) => {
                    tracing::warn!(error = %err, "warmup task panicked");
                },
            }
        }
        failed.sort();
        failed
    }
}

/// Fills the queue for `key`.
///
/// Returns `None` if another refill was in flight and the queue was still
/// empty once it finished, so the key is retried on the next pass.
async fn warm_key(pool: &EdekPool, key: &KeyName) -> PoolResult<Option<FillOutcome>> {
    match pool.ensure_filled(key).await? {
        FillOutcome::Coalesced => {
            pool.wait_for_refill(key).await;
            Ok((pool.size(key) > 0).then_some(FillOutcome::Coalesced))
        },
        outcome => Ok(Some(outcome)),
    }
}
