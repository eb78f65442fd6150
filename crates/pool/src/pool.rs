//! The EDEK pool: one [`KeyQueue`] per key, refilled in the background.
//!
//! # Locking
//!
//! - The key → queue map sits behind a `RwLock`. The write lock is taken only
//!   to insert a key seen for the first time.
//! - Each queue has its own mutex, held for one pop, drain or push.
//! - The in-flight set and the failure tracker have their own short-held
//!   mutexes. No lock is held across a KMS call.
//!
//! # Fast path
//!
//! [`EdekPool::try_get`] never awaits. It pops, and if the queue fell below
//! the low watermark it queues a refill job for the workers.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use edek_kms::{EncryptedKeyVersion, KeyName, KeyProvider, KmsError};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{EdekPoolConfig, SyncGenerationPolicy},
    error::{PoolError, PoolResult},
    metrics::{PoolMetrics, PoolMetricsSnapshot},
    queue::KeyQueue,
    refiller::{self, FailureTracker, FillOutcome, InFlight, RefillJob},
};

/// State shared between the pool handle and its background tasks.
pub(crate) struct PoolInner {
    pub(crate) config: EdekPoolConfig,
    pub(crate) provider: Arc<dyn KeyProvider>,
    pub(crate) in_flight: Arc<InFlight>,
    pub(crate) failures: FailureTracker,
    pub(crate) metrics: PoolMetrics,
    pub(crate) cancel: CancellationToken,
    pub(crate) jobs: mpsc::Sender<RefillJob>,
    queues: RwLock<HashMap<KeyName, Arc<KeyQueue>>>,
    threshold: usize,
}

impl PoolInner {
    fn existing(&self, key: &KeyName) -> Option<Arc<KeyQueue>> {
        self.queues.read().get(key).cloned()
    }

    fn queue(&self, key: &KeyName) -> Arc<KeyQueue> {
        if let Some(queue) = self.existing(key) {
            return queue;
        }
        let mut queues = self.queues.write();
        let queue = queues.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(key = %key, "creating key queue");
            Arc::new(KeyQueue::new(key.clone(), self.config.num_values(), self.config.entry_ttl()))
        });
        Arc::clone(queue)
    }

    fn snapshot_queues(&self) -> Vec<Arc<KeyQueue>> {
        self.queues.read().values().cloned().collect()
    }

    /// Schedules a refill for every queue below the low watermark.
    fn check_all(&self) -> usize {
        self.snapshot_queues()
            .iter()
            .filter(|queue| queue.len() < self.threshold)
            .filter(|queue| refiller::schedule(self, queue))
            .count()
    }
}

/// Per-key cache of pre-generated EDEKs.
///
/// Created with [`EdekPool::new`], which must run inside a Tokio runtime.
/// Shared as `Arc<EdekPool>`; dropping the last handle cancels the
/// background tasks, [`shutdown`](Self::shutdown) also waits for them.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use edek_kms::{KeyName, MemoryKeyProvider};
/// use edek_pool::{EdekPool, EdekPoolConfig};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let kms = Arc::new(MemoryKeyProvider::new());
/// kms.create_key(&KeyName::from("zone-key")).unwrap();
///
/// let config = EdekPoolConfig::builder().num_values(10).build().unwrap();
/// let pool = EdekPool::new(config, kms).unwrap();
///
/// let key = KeyName::from("zone-key");
/// pool.ensure_filled(&key).await.unwrap();
/// assert_eq!(pool.size(&key), 10);
///
/// let edek = pool.try_get(&key).unwrap();
/// assert_eq!(edek.key_name, key);
///
/// pool.shutdown().await;
/// # });
/// ```
pub struct EdekPool {
    inner: Arc<PoolInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for EdekPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdekPool")
            .field("config", &self.inner.config)
            .field("queues", &self.inner.queues.read().len())
            .field("shutdown", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl EdekPool {
    /// Creates a pool and starts its refill workers.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Config`] if `config` fails validation.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn new(config: EdekPoolConfig, provider: Arc<dyn KeyProvider>) -> PoolResult<Self> {
        config.validate()?;

        let (jobs, receiver) = mpsc::channel(config.refill_queue_depth());
        let inner = Arc::new(PoolInner {
            threshold: config.low_watermark_threshold(),
            failures: FailureTracker::new(config.failure_threshold(), config.failure_backoff()),
            in_flight: Arc::new(InFlight::default()),
            metrics: PoolMetrics::new(),
            cancel: CancellationToken::new(),
            queues: RwLock::new(HashMap::new()),
            jobs,
            provider,
            config,
        });

        let mut tasks = refiller::spawn_workers(&inner, receiver, inner.config.refill_workers());
        if let Some(interval) = inner.config.refill_check_interval() {
            tasks.push(spawn_refill_check(&inner, interval));
        }

        tracing::info!(
            num_values = inner.config.num_values(),
            low_watermark = inner.threshold,
            workers = inner.config.refill_workers(),
            "EDEK pool started",
        );
        Ok(Self { inner, tasks: Mutex::new(tasks) })
    }

    /// Pops the oldest live EDEK for `key` without waiting on the KMS.
    ///
    /// Creates the key's queue on first use. If the queue is left below the
    /// low watermark, a refill is queued in the background.
    #[tracing::instrument(level = "debug", skip(self), fields(key = %key))]
    pub fn try_get(&self, key: &KeyName) -> Option<EncryptedKeyVersion> {
        if self.inner.cancel.is_cancelled() {
            self.inner.metrics.record_miss();
            return None;
        }

        let queue = self.inner.queue(key);
        let popped = queue.pop();
        self.inner.metrics.record_expired(popped.expired);
        if popped.remaining < self.inner.threshold {
            refiller::schedule(&self.inner, &queue);
        }

        match popped.edek {
            Some(edek) => {
                self.inner.metrics.record_hit();
                tracing::debug!(remaining = popped.remaining, "EDEK cache hit");
                Some(edek)
            },
            None => {
                self.inner.metrics.record_miss();
                tracing::debug!("EDEK cache miss");
                None
            },
        }
    }

    /// Pops up to `count` EDEKs for `key`, oldest first.
    ///
    /// Returns what is queued without waiting; a shortfall triggers a refill.
    #[tracing::instrument(level = "debug", skip(self), fields(key = %key))]
    pub fn drain_for(&self, key: &KeyName, count: usize) -> Vec<EncryptedKeyVersion> {
        if self.inner.cancel.is_cancelled() {
            return Vec::new();
        }

        let queue = self.inner.queue(key);
        let drained = queue.drain(count);
        self.inner.metrics.record_expired(drained.expired);
        if drained.remaining < self.inner.threshold || drained.edeks.len() < count {
            refiller::schedule(&self.inner, &queue);
        }
        tracing::debug!(requested = count, returned = drained.edeks.len(), "drained EDEKs");
        drained.edeks
    }

    /// Returns an EDEK for `key`, asking the KMS directly on a cache miss.
    ///
    /// The batch size of the direct request follows
    /// [`SyncGenerationPolicy`]; the first key is returned and the rest are
    /// queued. This is the only pool operation through which KMS errors reach
    /// a caller.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Kms`] if the KMS rejects or fails the request
    /// - [`PoolError::Timeout`] if it takes longer than `kms_timeout`
    /// - [`PoolError::ShuttingDown`] after [`shutdown`](Self::shutdown)
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn get_or_generate(&self, key: &KeyName) -> PoolResult<EncryptedKeyVersion> {
        if let Some(edek) = self.try_get(key) {
            return Ok(edek);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let queue = self.inner.queue(key);
        let size = queue.len();
        let count = match self.inner.config.sync_generation_policy() {
            SyncGenerationPolicy::One => 1,
            SyncGenerationPolicy::LowWatermark => self.inner.threshold.saturating_sub(size).max(1),
            SyncGenerationPolicy::All => queue.capacity().saturating_sub(size).max(1),
        };

        self.inner.metrics.record_sync_fetch();
        let started = Instant::now();
        let mut edeks = refiller::fetch(&self.inner, key, count).await.inspect_err(|err| {
            tracing::debug!(requested = count, error = %err, "synchronous EDEK fetch failed");
        })?;
        if edeks.is_empty() {
            return Err(PoolError::kms(
                key.as_str(),
                KmsError::invalid_response(format!("no key generated for {key}")),
            ));
        }

        let edek = edeks.swap_remove(0);
        if !edeks.is_empty() {
            let pushed = queue.push(edeks);
            self.inner.metrics.record_expired(pushed.expired);
            self.inner.metrics.record_overflow(pushed.overflow);
            if pushed.overflow > 0 {
                tracing::warn!(
                    requested = count,
                    discarded = pushed.overflow,
                    "queue full, discarding surplus EDEKs",
                );
            }
        }
        self.inner.failures.record_success(key);
        tracing::debug!(
            requested = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "served EDEK from synchronous fetch",
        );
        Ok(edek)
    }

    /// Fills the queue for `key` up to `num_values` and waits for the result.
    ///
    /// Used at zone creation and by the warmer. If a refill for the key is
    /// already in flight this returns [`FillOutcome::Coalesced`] at once.
    ///
    /// # Errors
    ///
    /// - [`PoolError::RefillBackoff`] if refills for the key are suspended
    /// - [`PoolError::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`PoolError::Kms`] or [`PoolError::Timeout`] if the KMS call fails
    pub async fn ensure_filled(&self, key: &KeyName) -> PoolResult<FillOutcome> {
        if self.inner.cancel.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        if let Some(remaining) = self.inner.failures.suppressed(key, Instant::now()) {
            return Err(PoolError::RefillBackoff { key: key.to_string(), remaining });
        }

        let queue = self.inner.queue(key);
        let Some(_guard) = self.inner.in_flight.try_acquire(key) else {
            self.inner.metrics.record_coalesced();
            return Ok(FillOutcome::Coalesced);
        };
        refiller::refill(&self.inner, &queue).await
    }

    /// Queues a background refill for `key` if one can start.
    ///
    /// Returns `false` if the trigger was coalesced, suppressed by backoff,
    /// dropped because the job queue is full, or the pool is shut down.
    pub fn schedule_refill(&self, key: &KeyName) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        let queue = self.inner.queue(key);
        refiller::schedule(&self.inner, &queue)
    }

    /// Creates queues for `keys` and schedules a background fill of each.
    pub fn initialize_queues<'a>(&self, keys: impl IntoIterator<Item = &'a KeyName>) {
        for key in keys {
            self.schedule_refill(key);
        }
    }

    /// Discards every queued EDEK for `key`, returning how many were dropped.
    ///
    /// Call after rolling the key to a new version.
    #[tracing::instrument(skip(self), fields(key = %key))]
    pub fn invalidate(&self, key: &KeyName) -> usize {
        let dropped = self.inner.existing(key).map_or(0, |queue| queue.clear());
        tracing::info!(dropped, "invalidated key queue");
        dropped
    }

    /// Number of live EDEKs queued for `key`. Zero for a key never seen.
    #[must_use]
    pub fn size(&self, key: &KeyName) -> usize {
        self.inner.existing(key).map_or(0, |queue| queue.len())
    }

    /// Sizes of all queues, by key.
    #[must_use]
    pub fn queue_sizes(&self) -> BTreeMap<KeyName, usize> {
        self.inner
            .queues
            .read()
            .iter()
            .map(|(key, queue)| (key.clone(), queue.len()))
            .collect()
    }

    /// Returns `true` while a refill for `key` is between trigger and
    /// completion.
    #[must_use]
    pub fn is_refilling(&self, key: &KeyName) -> bool {
        self.inner.in_flight.contains(key)
    }

    /// Waits until no refill for `key` is in flight.
    ///
    /// Returns at once if none is. A refill ends within `kms_timeout`.
    pub async fn wait_for_refill(&self, key: &KeyName) {
        self.inner.in_flight.wait_idle(key).await;
    }

    /// Time left before background refills for `key` resume, if suspended.
    #[must_use]
    pub fn backoff_remaining(&self, key: &KeyName) -> Option<Duration> {
        self.inner.failures.suppressed(key, Instant::now())
    }

    /// Returns the pool configuration.
    #[must_use]
    pub fn config(&self) -> &EdekPoolConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the pool counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub(crate) fn record_warmup_run(&self) {
        self.inner.metrics.record_warmup_run();
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Returns the token cancelled on shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Stops the pool.
    ///
    /// No new KMS request starts after this is called. Refills already
    /// waiting on the KMS complete or hit `kms_timeout`, then the workers
    /// exit and every queue is discarded.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "EDEK pool background task panicked");
            }
        }

        let dropped: usize = self.inner.snapshot_queues().iter().map(|queue| queue.clear()).sum();
        self.inner.queues.write().clear();
        tracing::info!(dropped, "EDEK pool shut down");
    }
}

impl Drop for EdekPool {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

fn spawn_refill_check(inner: &Arc<PoolInner>, interval: Duration) -> JoinHandle<()> {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; consume it so the first check
        // happens one full interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    tracing::debug!("refill check task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let scheduled = inner.check_all();
                    if scheduled > 0 {
                        tracing::debug!(scheduled, "periodic check scheduled refills");
                    }
                }
            }
        }
    })
}
