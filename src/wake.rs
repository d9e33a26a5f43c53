// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Low-latency wake notification for worker pools.
//!
//! A two-tier scheme: an atomic flag for the lock-free fast path (a worker
//! already spinning sees new work immediately) and a condvar fallback for
//! workers that went to sleep waiting for the next signal. Multiple
//! `notify()` calls before a worker wakes collapse into a single wake, which
//! is exactly the "at-least-one wake, duplicates coalesce" guarantee
//! distilled spec §5 asks of pool signaling.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Coalescing wake notifier used by one worker pool's signaling channel.
#[derive(Debug)]
pub struct WakeNotifier {
    data_ready: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl WakeNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data_ready: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Publish a wake signal if room exists. Safe to call from any thread.
    #[inline]
    pub fn notify(&self) {
        self.data_ready.store(true, Ordering::Release);
        if *self.sleeping.lock() {
            self.condvar.notify_all();
        }
    }

    /// Check and clear the fast-path flag without blocking.
    #[inline]
    pub fn check_and_clear(&self) -> bool {
        self.data_ready.swap(false, Ordering::Acquire)
    }

    /// Block until notified or `timeout` elapses. Returns `true` if woken by
    /// a signal, `false` on timeout (the caller should re-scan regardless --
    /// this is used to bound idle sleep, not to prove no work exists).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.check_and_clear() {
            return true;
        }
        let mut sleeping = self.sleeping.lock();
        *sleeping = true;
        let result = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;
        !result.timed_out() || self.check_and_clear()
    }
}

impl Default for WakeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_wakes_sleeping_waiter() {
        let notifier = Arc::new(WakeNotifier::new());
        let waiter = Arc::clone(&notifier);
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        notifier.notify();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn duplicate_notifies_collapse_into_one_flag() {
        let notifier = WakeNotifier::new();
        notifier.notify();
        notifier.notify();
        assert!(notifier.check_and_clear());
        assert!(!notifier.check_and_clear());
    }
}
