//! Fork safety: a fork taken while producer threads are mid-ingest must
//! leave the child with usable, unlocked state.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use iotap_core::{Config, IoCollector};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

#[test]
fn fork_with_active_ingest_does_not_deadlock() {
    let collector = Arc::new(IoCollector::new(&Config::default()));
    for fd in 0..4 {
        collector.on_open(fd, &format!("/scratch/{fd}"));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut producers = Vec::new();
    for _ in 0..3 {
        let collector = Arc::clone(&collector);
        let stop = Arc::clone(&stop);
        producers.push(thread::spawn(move || {
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                collector.on_write((i % 4) as i32, 1);
                i += 1;
            }
        }));
    }
    // Let the producers reach steady state before forking under them.
    thread::sleep(Duration::from_millis(10));

    collector.prefork();
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => {
            collector.postfork_child();
            // The child must be able to drain immediately; an inherited held
            // lock would hang right here and time the test out.
            let records = collector.drain();
            let well_formed = records
                .iter()
                .all(|r| r.read_bytes == 0 && r.path.starts_with("/scratch/"));
            unsafe { nix::libc::_exit(if well_formed { 0 } else { 1 }) };
        }
        ForkResult::Parent { child } => {
            collector.postfork_parent();
            // The parent carries on ingesting as if nothing happened.
            collector.on_write(0, 7);

            let status = waitpid(child, None).expect("waitpid");
            assert!(
                matches!(status, WaitStatus::Exited(_, 0)),
                "child saw malformed state: {status:?}"
            );

            stop.store(true, Ordering::Relaxed);
            for p in producers {
                p.join().unwrap();
            }
            let drained: u64 = collector.drain().iter().map(|r| r.write_bytes).sum();
            assert!(drained >= 7);
        }
    }
}
