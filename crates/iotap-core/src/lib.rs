//! # iotap-core
//!
//! Fork-safe aggregation core for in-process file-I/O telemetry.
//!
//! The intercept layer (`iotap-shim`) reports every successful open, close,
//! read, and write it sees; this crate attributes the bytes to a
//! `(thread, path)` key, accumulates them in a double-buffered pool of
//! sharded spin-locked maps, and hands a consumer the aggregate on demand:
//!
//! ```
//! use iotap_core::{Config, IoCollector};
//!
//! let collector = IoCollector::new(&Config::default());
//! collector.on_open(5, "/tmp/data");
//! collector.on_write(5, 13);
//! collector.on_close(5);
//!
//! let records = collector.drain();
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].path, "/tmp/data");
//! assert_eq!(records[0].write_bytes, 13);
//! ```
//!
//! Processes normally use the lazily-initialized singleton instead:
//! [`collector()`]. Its first use also registers the `pthread_atfork` and
//! `atexit` handlers that keep the locks fork-safe and turn late-lifetime
//! hook invocations into no-ops.
//!
//! Design constraints inherited from living inside an I/O interposer: no
//! operation performs I/O, no error propagates to the caller (failures are
//! atomic health counters, see [`IoCollector::stats`]), and no lock is held
//! across anything that can block.

pub mod collector;
pub mod config;
pub mod double_buffer;
pub mod fd_table;
mod fork;
pub mod sync;
mod tid;

pub use collector::{
    collector, ByteCounts, CollectorStats, IoCollector, IoKey, IoRecord, OpenCloseOp, RwOp,
    StatsSnapshot,
};
pub use config::{config, Config, ConfigError};
pub use sync::{Merge, RawRwSpinLock, RwSpinLock, ShardMap};
