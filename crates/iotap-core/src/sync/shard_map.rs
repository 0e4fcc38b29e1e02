//! Sharded concurrent map.
//!
//! A fixed array of buckets, each an independently spin-locked singly-linked
//! list, so writers to different buckets never contend. The bucket count is
//! prime by default, which spreads keys well for the modulo placement.
//!
//! Iteration (`for_each`) is meant for a quiescent map: the double-buffer
//! swap guarantees no producer touches the drained side. The walk still
//! takes each bucket's shared lock, which costs nothing uncontended and
//! keeps the walk memory-safe if the contract is ever violated.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

use super::spinlock::RwSpinLock;

/// Default shard count. Prime, so `hash % buckets` uses all the hash bits.
pub const DEFAULT_BUCKET_COUNT: usize = 1031;

/// Values that can absorb another instance of themselves in place.
///
/// `insert_and_merge` folds a delta into an existing value instead of
/// overwriting it; the operation must be associative and commutative, since
/// deltas arrive from many threads in no particular order.
pub trait Merge {
    fn merge(&mut self, other: Self);
}

/// Plain counters merge by saturating addition.
impl Merge for u64 {
    fn merge(&mut self, other: Self) {
        *self = self.saturating_add(other);
    }
}

type Link<K, V> = Option<Box<Node<K, V>>>;

struct Node<K, V> {
    key: K,
    value: V,
    next: Link<K, V>,
}

struct Bucket<K, V> {
    chain: RwSpinLock<Link<K, V>>,
}

impl<K, V> Bucket<K, V> {
    const fn new() -> Self {
        Self {
            chain: RwSpinLock::new(None),
        }
    }

    fn clear(&self) {
        let mut chain = self.chain.write();
        // Unlink iteratively so a long chain cannot recurse on drop.
        let mut node = chain.take();
        while let Some(mut n) = node {
            node = n.next.take();
        }
    }
}

impl<K, V> Drop for Bucket<K, V> {
    fn drop(&mut self) {
        let mut node = self.chain.get_mut().take();
        while let Some(mut n) = node {
            node = n.next.take();
        }
    }
}

impl<K: Eq, V> Bucket<K, V> {
    fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let chain = self.chain.read();
        let mut node = chain.as_deref();
        while let Some(n) = node {
            if n.key == *key {
                return Some(n.value.clone());
            }
            node = n.next.as_deref();
        }
        None
    }

    fn insert(&self, key: K, value: V) {
        let mut chain = self.chain.write();
        let mut link = &mut *chain;
        while link.as_ref().is_some_and(|n| n.key != key) {
            link = &mut link.as_mut().unwrap().next;
        }
        match link {
            Some(node) => node.value = value,
            None => {
                *link = Some(Box::new(Node {
                    key,
                    value,
                    next: None,
                }))
            }
        }
    }

    /// Returns true when the key was new to the bucket.
    fn insert_and_merge(&self, key: K, value: V) -> bool
    where
        V: Merge,
    {
        let mut chain = self.chain.write();
        let mut link = &mut *chain;
        while link.as_ref().is_some_and(|n| n.key != key) {
            link = &mut link.as_mut().unwrap().next;
        }
        match link {
            Some(node) => {
                node.value.merge(value);
                false
            }
            None => {
                *link = Some(Box::new(Node {
                    key,
                    value,
                    next: None,
                }));
                true
            }
        }
    }

    /// Returns true when the key was present.
    fn erase(&self, key: &K) -> bool {
        let mut chain = self.chain.write();
        let mut link = &mut *chain;
        while link.as_ref().is_some_and(|n| n.key != *key) {
            link = &mut link.as_mut().unwrap().next;
        }
        match link.take() {
            Some(node) => {
                *link = node.next;
                true
            }
            None => false,
        }
    }
}

pub struct ShardMap<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    hasher: RandomState,
}

impl<K: Hash + Eq, V> ShardMap<K, V> {
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKET_COUNT)
    }

    pub fn with_buckets(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            buckets: (0..bucket_count).map(|_| Bucket::new()).collect(),
            hasher: RandomState::new(),
        }
    }

    fn bucket(&self, key: &K) -> &Bucket<K, V> {
        let hash = self.hasher.hash_one(key);
        &self.buckets[(hash % self.buckets.len() as u64) as usize]
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.bucket(key).find(key)
    }

    /// Insert, overwriting any existing value for the key.
    pub fn insert(&self, key: K, value: V) {
        self.bucket(&key).insert(key, value);
    }

    /// Insert, or fold `value` into the existing entry. Returns true when
    /// the key was new.
    pub fn insert_and_merge(&self, key: K, value: V) -> bool
    where
        V: Merge,
    {
        self.bucket(&key).insert_and_merge(key, value)
    }

    /// Remove the key. Returns true when it was present.
    pub fn erase(&self, key: &K) -> bool {
        self.bucket(key).erase(key)
    }

    pub fn clear(&self) {
        for bucket in self.buckets.iter() {
            bucket.clear();
        }
    }

    /// Visit every entry, bucket by bucket, insertion order within a bucket.
    ///
    /// Intended for a quiescent map; see the module docs.
    pub fn for_each<F: FnMut(&K, &V)>(&self, mut f: F) {
        for bucket in self.buckets.iter() {
            let chain = bucket.chain.read();
            let mut node = chain.as_deref();
            while let Some(n) = node {
                f(&n.key, &n.value);
                node = n.next.as_deref();
            }
        }
    }

    /// Acquire every bucket lock exclusively. Part of the fork protocol;
    /// the matching release may happen in a different process image.
    pub(crate) fn lock_all_exclusive(&self) {
        for bucket in self.buckets.iter() {
            bucket.chain.raw().lock_exclusive();
        }
    }

    pub(crate) fn unlock_all_exclusive(&self) {
        for bucket in self.buckets.iter().rev() {
            bucket.chain.raw().unlock_exclusive();
        }
    }
}

impl<K: Hash + Eq, V> Default for ShardMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
