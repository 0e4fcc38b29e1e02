//! Reader-preferring ticket spinlock.
//!
//! Two 32-bit atomic cells, `head` and `tail`, each split into a 16-bit
//! shared half (high bits) and a 16-bit exclusive half (low bits). An
//! exclusive acquire takes a ticket from the whole of `tail` and waits for
//! `head` to catch up; a shared acquire only waits for the exclusive half,
//! so readers never wait on other readers. Waiters yield to the scheduler
//! instead of sleeping, which keeps the uncontended path at a handful of
//! atomic ops and makes the lock usable from fork handlers where blocking
//! primitives are off the table.
//!
//! Because waiters never sleep, the lock must not be held across anything
//! that can block or suspend the owning thread.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

const SHARED_STEP: u32 = 1 << 16;
const EXCLUSIVE_MASK: u32 = SHARED_STEP - 1;
const EXCLUSIVE_STEP: u32 = 1;

/// The bare lock: manual acquire/release, no owned data.
///
/// The raw form exists for the fork protocol, where the pre-fork handler
/// acquires in the parent and the post-fork handlers release in the parent
/// and the child. A guard-based lock cannot span those call sites.
pub struct RawRwSpinLock {
    head: AtomicU32,
    tail: AtomicU32,
}

impl RawRwSpinLock {
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    pub fn lock_exclusive(&self) {
        let ticket = self.tail.fetch_add(EXCLUSIVE_STEP, Ordering::Relaxed);
        while self.head.load(Ordering::Acquire) != ticket {
            std::thread::yield_now();
        }
    }

    /// Single CAS attempt; never spins.
    pub fn try_lock_exclusive(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        head == tail
            && self
                .tail
                .compare_exchange(
                    tail,
                    tail.wrapping_add(EXCLUSIVE_STEP),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    pub fn unlock_exclusive(&self) {
        let head = self.head.load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(EXCLUSIVE_STEP), Ordering::Release);
    }

    pub fn lock_shared(&self) {
        let ticket = self.tail.fetch_add(SHARED_STEP, Ordering::Relaxed) & EXCLUSIVE_MASK;
        while self.head.load(Ordering::Acquire) & EXCLUSIVE_MASK != ticket {
            std::thread::yield_now();
        }
    }

    /// Single CAS attempt; never spins.
    pub fn try_lock_shared(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        head & EXCLUSIVE_MASK == tail & EXCLUSIVE_MASK
            && self
                .tail
                .compare_exchange(
                    tail,
                    tail.wrapping_add(SHARED_STEP),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    pub fn unlock_shared(&self) {
        self.head.fetch_add(SHARED_STEP, Ordering::Release);
    }
}

impl Default for RawRwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Guarded wrapper owning the protected value.
pub struct RwSpinLock<T> {
    raw: RawRwSpinLock,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is mediated by the ticket lock; shared guards
// hand out &T, exclusive guards hand out &mut T.
unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawRwSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        self.raw.lock_shared();
        ReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        self.raw.try_lock_shared().then(|| ReadGuard { lock: self })
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        self.raw.lock_exclusive();
        WriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.raw.try_lock_exclusive().then(|| WriteGuard { lock: self })
    }

    /// The underlying raw lock, for callers that must acquire and release
    /// from different stack frames (the fork protocol).
    pub fn raw(&self) -> &RawRwSpinLock {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: shared lock held for the guard's lifetime.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_shared();
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive lock held for the guard's lifetime.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: exclusive lock held for the guard's lifetime.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_exclusive();
    }
}
