//! Background refill of key queues.
//!
//! A refill trigger becomes a [`RefillJob`] on a bounded channel drained by
//! a fixed set of worker tasks. Each job carries an [`InFlightGuard`], so at
//! most one refill per key exists between the trigger and the end of its KMS
//! call; a second trigger for the same key is coalesced into a no-op.
//!
//! Repeated failures for a key suspend its asynchronous refills for
//! `failure_backoff` (see [`FailureTracker`]). While suspended the queue
//! stays empty and callers take the synchronous path.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use edek_kms::{EncryptedKeyVersion, KeyName, KmsError};
use fail::fail_point;
use parking_lot::Mutex;
use tokio::{
    sync::{
        Notify,
        mpsc::{self, error::TrySendError},
    },
    task::JoinHandle,
};

use crate::{
    error::{PoolError, PoolResult},
    pool::PoolInner,
    queue::KeyQueue,
};

/// What a fill attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// A batch was requested and queued.
    Filled {
        /// EDEKs requested from the KMS (the deficit at the time).
        requested: usize,
        /// EDEKs that fit into the queue.
        accepted: usize,
    },
    /// The queue was already at `num_values`; no KMS call was made.
    AlreadyFull,
    /// Another refill for the key was in flight; no KMS call was made.
    Coalesced,
}

/// Set of keys with a refill between trigger and completion.
///
/// Each entry carries a [`Notify`] woken when its guard drops, so callers
/// that lost the race can wait for the winning refill to finish.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    keys: Mutex<HashMap<KeyName, Arc<Notify>>>,
}

/// Marks a key as in flight until dropped.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    set: Arc<InFlight>,
    key: KeyName,
}

impl InFlight {
    /// Marks `key` as in flight, or returns `None` if it already is.
    pub(crate) fn try_acquire(self: &Arc<Self>, key: &KeyName) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock();
        if keys.contains_key(key) {
            return None;
        }
        keys.insert(key.clone(), Arc::new(Notify::new()));
        Some(InFlightGuard { set: Arc::clone(self), key: key.clone() })
    }

    pub(crate) fn contains(&self, key: &KeyName) -> bool {
        self.keys.lock().contains_key(key)
    }

    /// Waits until no refill for `key` is in flight.
    pub(crate) async fn wait_idle(&self, key: &KeyName) {
        let entry = self.keys.lock().get(key).map(Arc::clone);
        let Some(done) = entry else {
            return;
        };
        let notified = done.notified();
        // The guard removes its entry before notifying, so an entry still
        // present here has not notified yet.
        let still_running =
            self.keys.lock().get(key).is_some_and(|current| Arc::ptr_eq(current, &done));
        if still_running {
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let done = self.set.keys.lock().remove(&self.key);
        if let Some(done) = done {
            done.notify_waiters();
        }
    }
}

#[derive(Debug, Default)]
struct FailureState {
    consecutive: u32,
    suppressed_until: Option<Instant>,
}

/// Per-key consecutive refill failures and backoff deadlines.
#[derive(Debug)]
pub(crate) struct FailureTracker {
    threshold: u32,
    backoff: Duration,
    state: Mutex<HashMap<KeyName, FailureState>>,
}

impl FailureTracker {
    pub(crate) fn new(threshold: u32, backoff: Duration) -> Self {
        Self { threshold, backoff, state: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn record_success(&self, key: &KeyName) {
        self.state.lock().remove(key);
    }

    /// Counts a failure. Returns the backoff if refills are now suspended.
    ///
    /// A definitive failure suspends at once.
    pub(crate) fn record_failure(&self, key: &KeyName, definitive: bool) -> Option<Duration> {
        let mut state = self.state.lock();
        let entry = state.entry(key.clone()).or_default();
        entry.consecutive = entry.consecutive.saturating_add(1);
        if definitive || entry.consecutive >= self.threshold {
            entry.suppressed_until = Some(Instant::now() + self.backoff);
            Some(self.backoff)
        } else {
            None
        }
    }

    /// Time left before refills for `key` resume, if suspended.
    pub(crate) fn suppressed(&self, key: &KeyName, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .get(key)
            .and_then(|entry| entry.suppressed_until)
            .map(|until| until.saturating_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    pub(crate) fn consecutive_failures(&self, key: &KeyName) -> u32 {
        self.state.lock().get(key).map_or(0, |entry| entry.consecutive)
    }
}

/// One queued refill.
#[derive(Debug)]
pub(crate) struct RefillJob {
    queue: Arc<KeyQueue>,
    _guard: InFlightGuard,
}

/// Spawns `count` workers draining `jobs`.
///
/// Workers stop taking jobs once the pool's cancellation token fires; a job
/// already running finishes its KMS call (bounded by `kms_timeout`).
pub(crate) fn spawn_workers(
    inner: &Arc<PoolInner>,
    jobs: mpsc::Receiver<RefillJob>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let jobs = Arc::new(tokio::sync::Mutex::new(jobs));
    (0..count)
        .map(|worker| {
            let inner = Arc::clone(inner);
            let jobs = Arc::clone(&jobs);
            tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        job = async { jobs.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { break };
                    // Failures are logged and counted inside `refill`.
                    let _ = refill(&inner, &job.queue).await;
                }
                tracing::debug!(worker, "refill worker stopped");
            })
        })
        .collect()
}

/// Queues an asynchronous refill for `queue` without waiting for it.
///
/// Returns `false` if the pool is shutting down, the key is backing off, a
/// refill for the key is already in flight, or the job queue is full.
pub(crate) fn schedule(inner: &PoolInner, queue: &Arc<KeyQueue>) -> bool {
    if inner.cancel.is_cancelled() {
        return false;
    }
    let key = queue.key();
    if let Some(remaining) = inner.failures.suppressed(key, Instant::now()) {
        tracing::debug!(
            key = %key,
            remaining_ms = remaining.as_millis() as u64,
            "refill suppressed while backing off",
        );
        return false;
    }
    let Some(guard) = inner.in_flight.try_acquire(key) else {
        inner.metrics.record_coalesced();
        tracing::trace!(key = %key, "refill already in flight");
        return false;
    };

    match inner.jobs.try_send(RefillJob { queue: Arc::clone(queue), _guard: guard }) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!(key = %key, "refill job queue full, dropping trigger");
            false
        },
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Fetches the queue's deficit from the KMS and enqueues the result.
///
/// The caller must hold the key's [`InFlightGuard`].
#[tracing::instrument(skip(inner, queue), fields(key = %queue.key()))]
pub(crate) async fn refill(inner: &PoolInner, queue: &KeyQueue) -> PoolResult<FillOutcome> {
    let key = queue.key();
    let deficit = queue.deficit();
    if deficit == 0 {
        return Ok(FillOutcome::AlreadyFull);
    }
    if inner.cancel.is_cancelled() {
        return Err(PoolError::ShuttingDown);
    }

    let started = Instant::now();
    fail_point!("edek-pool-refill-before-fetch");

    match fetch(inner, key, deficit).await {
        Ok(edeks) => {
            let pushed = queue.push(edeks);
            inner.failures.record_success(key);
            inner.metrics.record_refill(pushed.accepted);
            inner.metrics.record_expired(pushed.expired);
            inner.metrics.record_overflow(pushed.overflow);
            if pushed.overflow > 0 {
                tracing::warn!(
                    requested = deficit,
                    discarded = pushed.overflow,
                    "queue full, discarding surplus EDEKs",
                );
            }
            tracing::info!(
                requested = deficit,
                accepted = pushed.accepted,
                size = pushed.size,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "refilled key queue",
            );
            Ok(FillOutcome::Filled { requested: deficit, accepted: pushed.accepted })
        },
        Err(err) => {
            inner.metrics.record_refill_error();
            let definitive = err.kms_error().is_some_and(KmsError::is_definitive);
            tracing::warn!(
                requested = deficit,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "EDEK refill failed",
            );
            if let Some(backoff) = inner.failures.record_failure(key, definitive) {
                tracing::warn!(
                    backoff_ms = backoff.as_millis() as u64,
                    consecutive = inner.failures.consecutive_failures(key),
                    "suspending refills for key",
                );
            }
            Err(err)
        },
    }
}

/// Requests `count` EDEKs, bounded by `kms_timeout`.
pub(crate) async fn fetch(
    inner: &PoolInner,
    key: &KeyName,
    count: usize,
) -> PoolResult<Vec<EncryptedKeyVersion>> {
    let timeout = inner.config.kms_timeout();
    match tokio::time::timeout(timeout, inner.provider.generate_encrypted_keys(key, count)).await {
        Ok(Ok(edeks)) => Ok(edeks),
        Ok(Err(err)) => Err(PoolError::kms(key.as_str(), err)),
        Err(_) => Err(PoolError::timeout(key.as_str(), timeout)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let set = Arc::new(InFlight::default());
        let key = KeyName::from("k1");

        let guard = set.try_acquire(&key).unwrap();
        assert!(set.contains(&key));
        assert!(set.try_acquire(&key).is_none());
        assert!(set.try_acquire(&KeyName::from("k2")).is_some());

        drop(guard);
        assert!(!set.contains(&key));
        assert!(set.try_acquire(&key).is_some());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_guard_drops() {
        let set = Arc::new(InFlight::default());
        let key = KeyName::from("k1");
        set.wait_idle(&key).await;

        let guard = set.try_acquire(&key).unwrap();
        let waiter = {
            let set = Arc::clone(&set);
            let key = key.clone();
            tokio::spawn(async move { set.wait_idle(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn test_failures_below_threshold_do_not_suppress() {
        let tracker = FailureTracker::new(3, Duration::from_secs(30));
        let key = KeyName::from("k1");

        assert_eq!(tracker.record_failure(&key, false), None);
        assert_eq!(tracker.record_failure(&key, false), None);
        assert!(tracker.suppressed(&key, Instant::now()).is_none());

        assert_eq!(tracker.record_failure(&key, false), Some(Duration::from_secs(30)));
        assert!(tracker.suppressed(&key, Instant::now()).is_some());
        assert_eq!(tracker.consecutive_failures(&key), 3);
    }

    #[test]
    fn test_definitive_failure_suppresses_at_once() {
        let tracker = FailureTracker::new(3, Duration::from_secs(30));
        let key = KeyName::from("k1");

        assert!(tracker.record_failure(&key, true).is_some());
        assert!(tracker.suppressed(&key, Instant::now()).is_some());
        assert!(tracker.suppressed(&KeyName::from("k2"), Instant::now()).is_none());
    }

    #[test]
    fn test_success_resets_and_backoff_expires() {
        let tracker = FailureTracker::new(1, Duration::from_millis(50));
        let key = KeyName::from("k1");

        tracker.record_failure(&key, false);
        let later = Instant::now() + Duration::from_millis(100);
        assert!(tracker.suppressed(&key, later).is_none());

        tracker.record_success(&key);
        assert_eq!(tracker.consecutive_failures(&key), 0);
        assert!(tracker.suppressed(&key, Instant::now()).is_none());
    }
}
