//! The collector façade.
//!
//! A process-wide coordinator behind the intercept layer: open/close calls
//! maintain the descriptor table, read/write calls are attributed to a
//! `(thread, path)` key and merged into the double-buffer, and a consumer
//! drains aggregated records on demand.
//!
//! Nothing here may perform I/O, and nothing raises to the caller: every
//! failure is an atomic counter bump. The teardown flag exists because the
//! runtime's own exit path calls the hooked `close` after user-level
//! teardown; once the flag is set every operation degrades to a no-op.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::config::{config, Config};
use crate::double_buffer::DoubleBuffer;
use crate::fd_table::FdTable;
use crate::sync::Merge;
use crate::{fork, tid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenCloseOp {
    Open,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwOp {
    Read,
    Write,
}

/// Aggregation key: which thread touched which file.
///
/// A struct key, hashed field-wise. Flattening `tid` and `path` into one
/// delimited string would make the key ambiguous for paths containing the
/// delimiter; the struct form is unambiguous for every path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IoKey {
    pub tid: u64,
    pub path: Arc<str>,
}

/// Byte totals for one key. Addition saturates at `u64::MAX`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteCounts {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl ByteCounts {
    pub fn read(bytes: u64) -> Self {
        Self {
            read_bytes: bytes,
            write_bytes: 0,
        }
    }

    pub fn write(bytes: u64) -> Self {
        Self {
            read_bytes: 0,
            write_bytes: bytes,
        }
    }
}

impl Merge for ByteCounts {
    fn merge(&mut self, other: Self) {
        self.read_bytes = self.read_bytes.saturating_add(other.read_bytes);
        self.write_bytes = self.write_bytes.saturating_add(other.write_bytes);
    }
}

/// One drained row. Produced at drain time, never retained by the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoRecord {
    pub tid: u64,
    pub path: String,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl IoRecord {
    pub fn total_bytes(&self) -> u64 {
        self.read_bytes.saturating_add(self.write_bytes)
    }
}

/// Health counters. Independent atomics; the only failure-reporting channel
/// the hot path is allowed.
pub struct CollectorStats {
    pub opens: AtomicU64,
    pub closes: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub open_close_param_errors: AtomicU64,
    pub rw_param_errors: AtomicU64,
    pub overflow_drops: AtomicU64,
    pub unknown_fd_drops: AtomicU64,
}

impl CollectorStats {
    pub const fn new() -> Self {
        Self {
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            open_close_param_errors: AtomicU64::new(0),
            rw_param_errors: AtomicU64::new(0),
            overflow_drops: AtomicU64::new(0),
            unknown_fd_drops: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            open_close_param_errors: self.open_close_param_errors.load(Ordering::Relaxed),
            rw_param_errors: self.rw_param_errors.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            unknown_fd_drops: self.unknown_fd_drops.load(Ordering::Relaxed),
        }
    }
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the health counters. Debug probe, not a stable API.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub opens: u64,
    pub closes: u64,
    pub reads: u64,
    pub writes: u64,
    pub open_close_param_errors: u64,
    pub rw_param_errors: u64,
    pub overflow_drops: u64,
    pub unknown_fd_drops: u64,
}

pub struct IoCollector {
    pool: DoubleBuffer<IoKey, ByteCounts>,
    fd_table: FdTable,
    stats: CollectorStats,
    max_pool_entries: u64,
    destructing: AtomicBool,
}

impl IoCollector {
    pub fn new(config: &Config) -> Self {
        Self {
            pool: DoubleBuffer::with_buckets(config.bucket_count),
            fd_table: FdTable::with_buckets(config.bucket_count),
            stats: CollectorStats::new(),
            max_pool_entries: config.max_pool_entries,
            destructing: AtomicBool::new(false),
        }
    }

    /// Open/close ingest. `path` is required for open and ignored for close.
    pub fn record_open_close(&self, op: OpenCloseOp, fd: RawFd, path: Option<&str>) {
        if self.destructing.load(Ordering::Acquire) {
            return;
        }
        if fd < 0 {
            self.stats
                .open_close_param_errors
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        match op {
            OpenCloseOp::Open => {
                let Some(path) = path.filter(|p| !p.is_empty()) else {
                    self.stats
                        .open_close_param_errors
                        .fetch_add(1, Ordering::Relaxed);
                    return;
                };
                self.stats.opens.fetch_add(1, Ordering::Relaxed);
                self.fd_table.insert(fd, Arc::from(path));
            }
            OpenCloseOp::Close => {
                self.stats.closes.fetch_add(1, Ordering::Relaxed);
                if !self.fd_table.erase(fd) {
                    // A close with no matching open is a counted anomaly.
                    self.stats.unknown_fd_drops.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Read/write ingest. `bytes` is the count the operation reported.
    pub fn record_rw(&self, op: RwOp, fd: RawFd, bytes: u64) {
        if self.destructing.load(Ordering::Acquire) {
            return;
        }
        if fd < 0 {
            self.stats.rw_param_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.pool.len() >= self.max_pool_entries {
            self.stats.overflow_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(path) = self.fd_table.find(fd) else {
            self.stats.unknown_fd_drops.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let counts = match op {
            RwOp::Read => {
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
                ByteCounts::read(bytes)
            }
            RwOp::Write => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                ByteCounts::write(bytes)
            }
        };
        self.pool.write(
            IoKey {
                tid: tid::current_tid(),
                path,
            },
            counts,
        );
    }

    pub fn on_open(&self, fd: RawFd, path: &str) {
        self.record_open_close(OpenCloseOp::Open, fd, Some(path));
    }

    pub fn on_close(&self, fd: RawFd) {
        self.record_open_close(OpenCloseOp::Close, fd, None);
    }

    pub fn on_read(&self, fd: RawFd, bytes: u64) {
        self.record_rw(RwOp::Read, fd, bytes);
    }

    pub fn on_write(&self, fd: RawFd, bytes: u64) {
        self.record_rw(RwOp::Write, fd, bytes);
    }

    /// Swap the aggregation buffers and return everything accumulated since
    /// the previous drain, heaviest consumers first.
    ///
    /// Single-consumer: concurrent drains are not supported.
    pub fn drain(&self) -> Vec<IoRecord> {
        if self.destructing.load(Ordering::Acquire) {
            return Vec::new();
        }
        let snapshot = self.pool.read_and_switch();
        let mut records = Vec::new();
        snapshot.for_each(|key, counts| {
            records.push(IoRecord {
                tid: key.tid,
                path: key.path.to_string(),
                read_bytes: counts.read_bytes,
                write_bytes: counts.write_bytes,
            });
        });
        records.sort_unstable_by(|a, b| b.total_bytes().cmp(&a.total_bytes()));
        // The drained side must be empty before the next swap makes it the
        // producer target again; it is quiescent, so clear it here.
        snapshot.clear();
        records
    }

    /// Flip the teardown guard: every later operation is a silent no-op.
    pub fn mark_destructing(&self) {
        self.destructing.store(true, Ordering::Release);
    }

    /// Debug probe over the health counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // Fork protocol. Lock order must be identical on every path: the switch
    // lock, then the descriptor table's buckets, then each pool map's
    // buckets. The releases run in reverse, once in the parent and once in
    // the child.

    pub fn prefork(&self) {
        self.pool.lock_switch_exclusive();
        self.fd_table.lock_all_exclusive();
        let (a, b) = self.pool.maps();
        a.lock_all_exclusive();
        b.lock_all_exclusive();
    }

    pub fn postfork_parent(&self) {
        self.release_fork_locks();
    }

    pub fn postfork_child(&self) {
        self.release_fork_locks();
    }

    fn release_fork_locks(&self) {
        let (a, b) = self.pool.maps();
        b.unlock_all_exclusive();
        a.unlock_all_exclusive();
        self.fd_table.unlock_all_exclusive();
        self.pool.unlock_switch_exclusive();
    }
}

static COLLECTOR: Lazy<IoCollector> = Lazy::new(|| {
    let collector = IoCollector::new(config());
    tracing::debug!(
        bucket_count = config().bucket_count,
        max_pool_entries = config().max_pool_entries,
        "iotap collector initialized"
    );
    if !fork::register_process_hooks() {
        // Without fork handlers the locks are not fork-safe; the collector
        // stays disabled for the rest of the process's life.
        tracing::warn!("fork/exit handler registration failed, disabling iotap");
        collector.mark_destructing();
    }
    collector
});

/// The process-wide collector, initialized on first use.
pub fn collector() -> &'static IoCollector {
    &COLLECTOR
}

/// The collector, but only if something already initialized it. Used by the
/// fork and exit callbacks, which must never trigger initialization.
pub(crate) fn collector_if_initialized() -> Option<&'static IoCollector> {
    Lazy::get(&COLLECTOR)
}
