//! Fork and exit coordination.
//!
//! A fork while any thread holds one of the collector's locks would hand the
//! child an address space whose lock word says "held" with no owner to ever
//! release it. The pre-fork handler therefore acquires every lock (switch
//! lock first, then each map's buckets), so the duplicated image is
//! consistent; both post-fork handlers release in reverse order.
//!
//! The exit handler flips the teardown guard: the runtime closes open
//! streams during `exit`, which re-enters the hooked `close` after
//! user-level teardown has run.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::collector::collector_if_initialized;

static REGISTERED: AtomicBool = AtomicBool::new(false);

extern "C" fn prefork_cb() {
    if let Some(collector) = collector_if_initialized() {
        collector.prefork();
    }
}

extern "C" fn postfork_parent_cb() {
    if let Some(collector) = collector_if_initialized() {
        collector.postfork_parent();
    }
}

extern "C" fn postfork_child_cb() {
    if let Some(collector) = collector_if_initialized() {
        collector.postfork_child();
    }
}

extern "C" fn teardown_cb() {
    if let Some(collector) = collector_if_initialized() {
        collector.mark_destructing();
    }
}

/// Register the fork and exit callbacks. Called once from the collector's
/// lazy initializer; returns false when either registration fails, in which
/// case the caller disables the collector.
pub(crate) fn register_process_hooks() -> bool {
    if REGISTERED.swap(true, Ordering::AcqRel) {
        return true;
    }
    // Registration only stores function pointers; the callbacks cannot fire
    // re-entrantly while the collector is still initializing.
    let rc = unsafe {
        libc::pthread_atfork(
            Some(prefork_cb),
            Some(postfork_parent_cb),
            Some(postfork_child_cb),
        )
    };
    if rc != 0 {
        return false;
    }
    unsafe { libc::atexit(teardown_cb) == 0 }
}
