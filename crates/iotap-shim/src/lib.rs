//! # iotap-shim
//!
//! LD_PRELOAD / DYLD_INSERT_LIBRARIES shim for iotap file-I/O telemetry.
//!
//! This shared library interposes the libc file-I/O entry points — the open
//! family, the read/write family, `close`, and their buffered-stream
//! counterparts — forwards every call to the real implementation, and on
//! success reports the descriptor, path, and byte count to `iotap-core`.
//! The interception itself is mechanical; everything interesting (per-thread
//! per-file aggregation, fork safety, teardown tolerance) lives in the core.
//!
//! ## Usage (Linux)
//!
//! ```bash
//! LD_PRELOAD=/path/to/libiotap_shim.so my_program
//! ```
//!
//! ## Usage (macOS)
//!
//! ```bash
//! DYLD_INSERT_LIBRARIES=/path/to/libiotap_shim.dylib my_program
//! ```
//!
//! ## Environment variables
//!
//! - `IOTAP_DEBUG`: install a stderr `tracing` subscriber (off by default —
//!   a telemetry shim must not write unless asked to)
//! - `IOTAP_BUCKET_COUNT`, `IOTAP_MAX_POOL_ENTRIES`: see `iotap-core`
//!
//! Hooks never panic and never perform I/O of their own beyond forwarding:
//! unwinding or recursing inside an interposer takes the host process down.

#![allow(clippy::missing_safety_doc)]

mod reals;

use std::ffi::CStr;
use std::sync::Once;

use iotap_core::{collector, OpenCloseOp};
use libc::{c_char, c_int, c_void, mode_t, off_t, size_t, ssize_t, FILE};

static LOG_INIT: Once = Once::new();

/// Install the debug subscriber on first open, when `IOTAP_DEBUG` asks for
/// it. Logging to stderr re-enters the hooked `write`; that re-entry is
/// bounded, the log write is merely counted.
fn init_debug_logging() {
    LOG_INIT.call_once(|| {
        if std::env::var_os("IOTAP_DEBUG").is_none() {
            return;
        }
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Report a successful open to the core. Non-UTF-8 paths are recorded
/// lossily rather than dropped.
fn report_open(fd: c_int, pathname: *const c_char) {
    init_debug_logging();
    if pathname.is_null() {
        collector().record_open_close(OpenCloseOp::Open, fd, None);
        return;
    }
    let path = unsafe { CStr::from_ptr(pathname) }.to_string_lossy();
    tracing::trace!(fd, path = %path, "open");
    collector().on_open(fd, &path);
}

// ============================================================================
// open family
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn open(pathname: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let Some(real_open) = reals::real_open() else {
        return -1;
    };
    let fd = real_open(pathname, flags, mode);
    if fd >= 0 {
        report_open(fd, pathname);
    }
    fd
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn open64(pathname: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let Some(real_open64) = reals::real_open64() else {
        return -1;
    };
    let fd = real_open64(pathname, flags, mode);
    if fd >= 0 {
        report_open(fd, pathname);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn creat(pathname: *const c_char, mode: mode_t) -> c_int {
    let Some(real_creat) = reals::real_creat() else {
        return -1;
    };
    let fd = real_creat(pathname, mode);
    if fd >= 0 {
        report_open(fd, pathname);
    }
    fd
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn creat64(pathname: *const c_char, mode: mode_t) -> c_int {
    let Some(real_creat64) = reals::real_creat64() else {
        return -1;
    };
    let fd = real_creat64(pathname, mode);
    if fd >= 0 {
        report_open(fd, pathname);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn openat(
    dirfd: c_int,
    pathname: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    let Some(real_openat) = reals::real_openat() else {
        return -1;
    };
    let fd = real_openat(dirfd, pathname, flags, mode);
    if fd >= 0 {
        report_open(fd, pathname);
    }
    fd
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    pathname: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    let Some(real_openat64) = reals::real_openat64() else {
        return -1;
    };
    let fd = real_openat64(dirfd, pathname, flags, mode);
    if fd >= 0 {
        report_open(fd, pathname);
    }
    fd
}

// ============================================================================
// read/write family
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let Some(real_read) = reals::real_read() else {
        return -1;
    };
    let n = real_read(fd, buf, count);
    if n >= 0 {
        collector().on_read(fd, n as u64);
    }
    n
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let Some(real_write) = reals::real_write() else {
        return -1;
    };
    let n = real_write(fd, buf, count);
    if n >= 0 {
        collector().on_write(fd, n as u64);
    }
    n
}

#[no_mangle]
pub unsafe extern "C" fn pread(fd: c_int, buf: *mut c_void, count: size_t, offset: off_t) -> ssize_t {
    let Some(real_pread) = reals::real_pread() else {
        return -1;
    };
    let n = real_pread(fd, buf, count, offset);
    if n >= 0 {
        collector().on_read(fd, n as u64);
    }
    n
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn pread64(
    fd: c_int,
    buf: *mut c_void,
    count: size_t,
    offset: libc::off64_t,
) -> ssize_t {
    let Some(real_pread64) = reals::real_pread64() else {
        return -1;
    };
    let n = real_pread64(fd, buf, count, offset);
    if n >= 0 {
        collector().on_read(fd, n as u64);
    }
    n
}

#[no_mangle]
pub unsafe extern "C" fn pwrite(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    offset: off_t,
) -> ssize_t {
    let Some(real_pwrite) = reals::real_pwrite() else {
        return -1;
    };
    let n = real_pwrite(fd, buf, count, offset);
    if n >= 0 {
        collector().on_write(fd, n as u64);
    }
    n
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn pwrite64(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    offset: libc::off64_t,
) -> ssize_t {
    let Some(real_pwrite64) = reals::real_pwrite64() else {
        return -1;
    };
    let n = real_pwrite64(fd, buf, count, offset);
    if n >= 0 {
        collector().on_write(fd, n as u64);
    }
    n
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let Some(real_close) = reals::real_close() else {
        return -1;
    };
    let ret = real_close(fd);
    if ret == 0 {
        collector().on_close(fd);
    }
    ret
}

// ============================================================================
// buffered streams
// ============================================================================
//
// Streams are attributed through their underlying descriptor (`fileno`), so
// stream and raw traffic on the same file aggregate under the same path.

#[no_mangle]
pub unsafe extern "C" fn fopen(filename: *const c_char, mode: *const c_char) -> *mut FILE {
    let Some(real_fopen) = reals::real_fopen() else {
        return std::ptr::null_mut();
    };
    let stream = real_fopen(filename, mode);
    if !stream.is_null() {
        let fd = libc::fileno(stream);
        if fd >= 0 {
            report_open(fd, filename);
        }
    }
    stream
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn fopen64(filename: *const c_char, mode: *const c_char) -> *mut FILE {
    let Some(real_fopen64) = reals::real_fopen64() else {
        return std::ptr::null_mut();
    };
    let stream = real_fopen64(filename, mode);
    if !stream.is_null() {
        let fd = libc::fileno(stream);
        if fd >= 0 {
            report_open(fd, filename);
        }
    }
    stream
}

#[no_mangle]
pub unsafe extern "C" fn freopen(
    pathname: *const c_char,
    mode: *const c_char,
    stream: *mut FILE,
) -> *mut FILE {
    let Some(real_freopen) = reals::real_freopen() else {
        return std::ptr::null_mut();
    };
    let new_stream = real_freopen(pathname, mode, stream);
    if !new_stream.is_null() {
        let fd = libc::fileno(new_stream);
        if fd >= 0 {
            report_open(fd, pathname);
        }
    }
    new_stream
}

#[no_mangle]
pub unsafe extern "C" fn fread(
    ptr: *mut c_void,
    size: size_t,
    nitems: size_t,
    stream: *mut FILE,
) -> size_t {
    let Some(real_fread) = reals::real_fread() else {
        return 0;
    };
    let nread = real_fread(ptr, size, nitems, stream);
    if nread > 0 {
        let fd = libc::fileno(stream);
        if fd >= 0 {
            collector().on_read(fd, (nread as u64).saturating_mul(size as u64));
        }
    }
    nread
}

#[no_mangle]
pub unsafe extern "C" fn fwrite(
    ptr: *const c_void,
    size: size_t,
    nitems: size_t,
    stream: *mut FILE,
) -> size_t {
    let Some(real_fwrite) = reals::real_fwrite() else {
        return 0;
    };
    let nwritten = real_fwrite(ptr, size, nitems, stream);
    if nwritten > 0 {
        let fd = libc::fileno(stream);
        if fd >= 0 {
            collector().on_write(fd, (nwritten as u64).saturating_mul(size as u64));
        }
    }
    nwritten
}

#[no_mangle]
pub unsafe extern "C" fn fclose(stream: *mut FILE) -> c_int {
    let Some(real_fclose) = reals::real_fclose() else {
        return -1;
    };
    // The descriptor is gone once the stream closes; grab it first.
    let fd = libc::fileno(stream);
    let ret = real_fclose(stream);
    if ret == 0 && fd >= 0 {
        collector().on_close(fd);
    }
    ret
}
