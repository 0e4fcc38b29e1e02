//! Cached thread-id lookup.
//!
//! The kernel thread id is fetched once per thread and cached in TLS, so the
//! ingest path never pays for the syscall twice.

use std::cell::Cell;

pub fn current_tid() -> u64 {
    thread_local! {
        static TID: Cell<u64> = const { Cell::new(0) };
    }
    // Hooked I/O can arrive after this thread's TLS was torn down; fall back
    // to the uncached lookup instead of panicking inside an interposer.
    TID.try_with(|slot| {
        let cached = slot.get();
        if cached != 0 {
            return cached;
        }
        let tid = os_tid();
        slot.set(tid);
        tid
    })
    .unwrap_or_else(|_| os_tid())
}

#[cfg(target_os = "linux")]
fn os_tid() -> u64 {
    // gettid(2) never fails.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(target_os = "macos")]
fn os_tid() -> u64 {
    let mut tid: u64 = 0;
    // Null thread means "the calling thread".
    unsafe { libc::pthread_threadid_np(0 as libc::pthread_t, &mut tid) };
    tid
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn os_tid() -> u64 {
    // No kernel tid available; a process-unique counter, handed out once per
    // thread, preserves the per-thread aggregation semantics.
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
