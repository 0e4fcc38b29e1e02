//! Double-buffer aggregator.
//!
//! Two shard maps and a selector: producers merge samples into whichever map
//! is currently active, while the drained map belongs exclusively to the
//! consumer. Draining swaps the roles, so producers are never stalled for
//! longer than the constant-time flip.
//!
//! The switch lock is held *shared* by producers and *exclusive* by the
//! flip. The selector is only ever mutated inside the exclusive section,
//! and the per-bucket locks inside each map give the cross-thread
//! happens-before between a producer's merge and the drain that observes it.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::sync::{Merge, RawRwSpinLock, ShardMap};

pub struct DoubleBuffer<K, V> {
    /// True while `map_a` is the producer target.
    front_is_a: AtomicBool,
    map_a: ShardMap<K, V>,
    map_b: ShardMap<K, V>,
    switch: RawRwSpinLock,
    /// Distinct keys in the active map since the last swap.
    entries: AtomicU64,
}

impl<K: Hash + Eq, V: Merge> DoubleBuffer<K, V> {
    pub fn with_buckets(bucket_count: usize) -> Self {
        Self {
            front_is_a: AtomicBool::new(true),
            map_a: ShardMap::with_buckets(bucket_count),
            map_b: ShardMap::with_buckets(bucket_count),
            switch: RawRwSpinLock::new(),
            entries: AtomicU64::new(0),
        }
    }

    /// Merge one sample into the active map.
    pub fn write(&self, key: K, value: V) {
        self.switch.lock_shared();
        let active = if self.front_is_a.load(Ordering::Acquire) {
            &self.map_a
        } else {
            &self.map_b
        };
        if active.insert_and_merge(key, value) {
            self.entries.fetch_add(1, Ordering::Relaxed);
        }
        self.switch.unlock_shared();
    }

    /// Distinct keys accumulated since the last swap.
    pub fn len(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap the maps and hand the previously-active one to the caller.
    ///
    /// Single-consumer: only one thread may drain. The returned map is
    /// quiescent until the next swap, so the caller may walk it at leisure.
    pub fn read_and_switch(&self) -> &ShardMap<K, V> {
        // Producers never touch the inactive side; clearing it races nothing.
        if self.front_is_a.load(Ordering::Acquire) {
            self.map_b.clear();
        } else {
            self.map_a.clear();
        }
        self.switch.lock_exclusive();
        let was_a = self.front_is_a.load(Ordering::Relaxed);
        self.front_is_a.store(!was_a, Ordering::Release);
        self.entries.store(0, Ordering::Relaxed);
        self.switch.unlock_exclusive();
        if was_a {
            &self.map_a
        } else {
            &self.map_b
        }
    }

    // Fork protocol. The switch lock is taken first so no producer is
    // mid-flight between reading the selector and touching a bucket.

    pub(crate) fn lock_switch_exclusive(&self) {
        self.switch.lock_exclusive();
    }

    pub(crate) fn unlock_switch_exclusive(&self) {
        self.switch.unlock_exclusive();
    }

    pub(crate) fn maps(&self) -> (&ShardMap<K, V>, &ShardMap<K, V>) {
        (&self.map_a, &self.map_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn collect(map: &ShardMap<u32, u64>) -> Vec<(u32, u64)> {
        let mut out = Vec::new();
        map.for_each(|k, v| out.push((*k, *v)));
        out.sort_unstable();
        out
    }

    #[test]
    fn swap_hands_back_accumulated_samples() {
        let pool: DoubleBuffer<u32, u64> = DoubleBuffer::with_buckets(17);
        pool.write(1, 10);
        pool.write(2, 20);
        pool.write(1, 5);
        assert_eq!(pool.len(), 2);

        let drained = pool.read_and_switch();
        assert_eq!(collect(drained), vec![(1, 15), (2, 20)]);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn swap_leaves_producers_on_an_empty_map() {
        let pool: DoubleBuffer<u32, u64> = DoubleBuffer::with_buckets(17);
        pool.write(1, 1);
        let _ = pool.read_and_switch();

        // New samples land on the other side.
        pool.write(2, 2);
        let drained = pool.read_and_switch();
        assert_eq!(collect(drained), vec![(2, 2)]);

        // And the side drained first is empty again by now.
        let drained = pool.read_and_switch();
        assert_eq!(collect(drained), vec![]);
    }

    #[test]
    fn entry_count_tracks_distinct_keys_not_samples() {
        let pool: DoubleBuffer<u32, u64> = DoubleBuffer::with_buckets(17);
        for _ in 0..100 {
            pool.write(7, 1);
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn concurrent_writers_and_drainer_lose_nothing() {
        let pool: Arc<DoubleBuffer<u32, u64>> = Arc::new(DoubleBuffer::with_buckets(31));
        let total_threads = 4;
        let per_thread = 10_000u64;

        let mut handles = Vec::new();
        for t in 0..total_threads {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..per_thread {
                    pool.write(t, 1);
                }
            }));
        }

        let mut drained_total = 0u64;
        loop {
            let done = handles.iter().all(|h| h.is_finished());
            let snapshot = pool.read_and_switch();
            snapshot.for_each(|_, v| drained_total += v);
            if done {
                break;
            }
            thread::yield_now();
        }
        for h in handles {
            h.join().unwrap();
        }
        // One more swap for anything written between the last two flips.
        let snapshot = pool.read_and_switch();
        snapshot.for_each(|_, v| drained_total += v);

        assert_eq!(drained_total, u64::from(total_threads) * per_thread);
    }
}
