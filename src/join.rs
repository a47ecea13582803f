//! Bounded joining of background threads.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a thread to finish.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait up to `timeout` for `handle` to finish, then join it.
///
/// Returns false if the thread was still running at the deadline; the
/// thread is then left detached and a warning is logged. Joining the
/// current thread is skipped and reported as not joined.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    if handle.thread().id() == thread::current().id() {
        log::debug!("Skipping self-join of {}", name);
        return false;
    }

    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() >= timeout {
            log::warn!("{} did not stop within {:?}, detaching", name, timeout);
            return false;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }

    if handle.join().is_err() {
        log::error!("{} panicked before stopping", name);
    }
    true
}
