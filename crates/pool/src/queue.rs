//! Bounded FIFO queue of EDEKs for one key.
//!
//! Entries are stamped when enqueued and stamps are taken under the queue
//! lock, so the deque is ordered by age and every expired entry sits at the
//! front. Expired entries are purged before any pop, drain or push and are
//! never handed out.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use edek_kms::{EncryptedKeyVersion, KeyName};
use parking_lot::Mutex;

#[derive(Debug)]
struct QueuedKey {
    edek: EncryptedKeyVersion,
    enqueued_at: Instant,
}

/// Result of [`KeyQueue::pop`].
#[derive(Debug)]
pub(crate) struct Popped {
    pub(crate) edek: Option<EncryptedKeyVersion>,
    pub(crate) expired: usize,
    pub(crate) remaining: usize,
}

/// Result of [`KeyQueue::drain`].
#[derive(Debug)]
pub(crate) struct Drained {
    pub(crate) edeks: Vec<EncryptedKeyVersion>,
    pub(crate) expired: usize,
    pub(crate) remaining: usize,
}

/// Result of [`KeyQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pushed {
    pub(crate) accepted: usize,
    pub(crate) overflow: usize,
    pub(crate) expired: usize,
    pub(crate) size: usize,
}

/// Per-key EDEK queue. Size never exceeds `capacity`.
#[derive(Debug)]
pub(crate) struct KeyQueue {
    key: KeyName,
    capacity: usize,
    ttl: Duration,
    entries: Mutex<VecDeque<QueuedKey>>,
}

impl KeyQueue {
    pub(crate) fn new(key: KeyName, capacity: usize, ttl: Duration) -> Self {
        Self { key, capacity, ttl, entries: Mutex::new(VecDeque::new()) }
    }

    pub(crate) fn key(&self) -> &KeyName {
        &self.key
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes and returns the oldest live EDEK.
    pub(crate) fn pop(&self) -> Popped {
        let mut entries = self.entries.lock();
        let expired = self.purge_expired(&mut entries, Instant::now());
        let edek = entries.pop_front().map(|entry| entry.edek);
        Popped { edek, expired, remaining: entries.len() }
    }

    /// Removes and returns up to `count` live EDEKs, oldest first.
    pub(crate) fn drain(&self, count: usize) -> Drained {
        let mut entries = self.entries.lock();
        let expired = self.purge_expired(&mut entries, Instant::now());
        let take = count.min(entries.len());
        let edeks = entries.drain(..take).map(|entry| entry.edek).collect();
        Drained { edeks, expired, remaining: entries.len() }
    }

    /// Appends EDEKs up to capacity; the excess is dropped.
    pub(crate) fn push(&self, edeks: Vec<EncryptedKeyVersion>) -> Pushed {
        let delivered = edeks.len();
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired = self.purge_expired(&mut entries, now);

        let room = self.capacity.saturating_sub(entries.len());
        let accepted = delivered.min(room);
        entries.extend(
            edeks.into_iter().take(accepted).map(|edek| QueuedKey { edek, enqueued_at: now }),
        );
        Pushed { accepted, overflow: delivered - accepted, expired, size: entries.len() }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        let entries = self.entries.lock();
        let now = Instant::now();
        let expired = entries.partition_point(|entry| self.is_expired(entry, now));
        entries.len() - expired
    }

    /// Entries missing to reach capacity.
    pub(crate) fn deficit(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Discards everything, returning how many entries were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    fn is_expired(&self, entry: &QueuedKey, now: Instant) -> bool {
        now.saturating_duration_since(entry.enqueued_at) >= self.ttl
    }

    fn purge_expired(&self, entries: &mut VecDeque<QueuedKey>, now: Instant) -> usize {
        let expired = entries.partition_point(|entry| self.is_expired(entry, now));
        entries.drain(..expired);
        expired
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use edek_kms::testutil::synthetic_edeks;
    use proptest::prelude::*;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn queue(capacity: usize, ttl: Duration) -> KeyQueue {
        KeyQueue::new(KeyName::from("k1"), capacity, ttl)
    }

    fn ivs(edeks: &[EncryptedKeyVersion]) -> Vec<u8> {
        edeks.iter().map(|edek| edek.iv[3]).collect()
    }

    #[test]
    fn test_pop_is_fifo() {
        let q = queue(10, HOUR);
        q.push(synthetic_edeks("k1", 0, 3));

        let first = q.pop();
        assert_eq!(first.edek.unwrap().iv[3], 0);
        assert_eq!(first.remaining, 2);
        assert_eq!(q.pop().edek.unwrap().iv[3], 1);
        assert_eq!(q.pop().edek.unwrap().iv[3], 2);

        let empty = q.pop();
        assert!(empty.edek.is_none());
        assert_eq!(empty.remaining, 0);
    }

    #[test]
    fn test_push_caps_at_capacity() {
        let q = queue(4, HOUR);

        let pushed = q.push(synthetic_edeks("k1", 0, 3));
        assert_eq!(pushed, Pushed { accepted: 3, overflow: 0, expired: 0, size: 3 });

        let pushed = q.push(synthetic_edeks("k1", 3, 3));
        assert_eq!(pushed, Pushed { accepted: 1, overflow: 2, expired: 0, size: 4 });
        assert_eq!(q.len(), 4);
        assert_eq!(q.deficit(), 0);
    }

    #[test]
    fn test_drain_returns_what_exists() {
        let q = queue(10, HOUR);
        q.push(synthetic_edeks("k1", 0, 3));

        let drained = q.drain(2);
        assert_eq!(ivs(&drained.edeks), vec![0, 1]);
        assert_eq!(drained.remaining, 1);

        let drained = q.drain(5);
        assert_eq!(ivs(&drained.edeks), vec![2]);
        assert_eq!(drained.remaining, 0);
        assert_eq!(q.deficit(), 10);
    }

    #[test]
    fn test_expired_entries_are_never_returned() {
        let q = queue(10, Duration::from_millis(20));
        q.push(synthetic_edeks("k1", 0, 3));
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(q.len(), 0);
        let popped = q.pop();
        assert!(popped.edek.is_none());
        assert_eq!(popped.expired, 3);
    }

    #[test]
    fn test_push_purges_expired_before_capacity_check() {
        let q = queue(2, Duration::from_millis(20));
        q.push(synthetic_edeks("k1", 0, 2));
        std::thread::sleep(Duration::from_millis(40));

        let pushed = q.push(synthetic_edeks("k1", 2, 2));
        assert_eq!(pushed, Pushed { accepted: 2, overflow: 0, expired: 2, size: 2 });
        assert_eq!(q.pop().edek.unwrap().iv[3], 2);
    }

    #[test]
    fn test_clear() {
        let q = queue(10, HOUR);
        q.push(synthetic_edeks("k1", 0, 5));
        assert_eq!(q.clear(), 5);
        assert_eq!(q.len(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u32),
        Pop,
        Drain(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..20).prop_map(Op::Push),
            Just(Op::Pop),
            (0usize..20).prop_map(Op::Drain),
        ]
    }

    proptest! {
        #[test]
        fn prop_size_never_exceeds_capacity(
            capacity in 1usize..16,
            ops in proptest::collection::vec(op(), 0..64),
        ) {
            let q = queue(capacity, HOUR);
            let mut next = 0u32;
            let mut model: VecDeque<u32> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Push(n) => {
                        let pushed = q.push(synthetic_edeks("k1", next, n));
                        let room = capacity - model.len();
                        model.extend((next..next + n).take(room));
                        next += n;
                        prop_assert_eq!(pushed.accepted + pushed.overflow, n as usize);
                    }
                    Op::Pop => {
                        let popped = q.pop().edek.map(|edek| edek.iv[3]);
                        prop_assert_eq!(popped, model.pop_front().map(|i| i as u8));
                    }
                    Op::Drain(n) => {
                        let drained = q.drain(n);
                        let take = n.min(model.len());
                        let expected: Vec<u8> = model.drain(..take).map(|i| i as u8).collect();
                        prop_assert_eq!(ivs(&drained.edeks), expected);
                    }
                }
                prop_assert!(q.len() <= capacity);
                prop_assert_eq!(q.len(), model.len());
            }
        }
    }
}
