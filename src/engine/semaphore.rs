//! Counting semaphore for worker thread wakeups
//!
//! The decode and collector threads block here with bounded timeouts.
//! Two posting paths exist: `notify()` takes the internal lock and wakes a
//! waiter immediately (controller and worker contexts), while `post()` is
//! lock-free (an atomic pending counter) and is the only form the render
//! callback may use; a lock-free post is observed no later than the
//! waiter's next timeout expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Semaphore {
    count: Mutex<u64>,
    cv: Condvar,
    /// Posts from contexts that must not lock
    pending: AtomicU64,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
            pending: AtomicU64::new(0),
        }
    }

    /// Lock-free post. Realtime-safe; pairs with the waiter's bounded
    /// timeout rather than an immediate wake.
    pub fn post(&self) {
        self.pending.fetch_add(1, Ordering::Release);
    }

    /// Post and wake one waiter. Not for the render path.
    pub fn notify(&self) {
        if let Ok(mut count) = self.count.lock() {
            *count += 1;
        }
        self.cv.notify_one();
    }

    /// Wait until a post arrives or `timeout` expires.
    ///
    /// Returns `true` if at least one post was consumed. All pending posts
    /// are consumed at once; callers treat a wake as "check for work", not
    /// as a work count.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.take_pending() {
            return true;
        }

        let Ok(mut count) = self.count.lock() else {
            // Poisoned: degrade to a plain sleep so worker loops keep
            // polling their shutdown flags.
            std::thread::sleep(timeout);
            return self.take_pending();
        };

        if *count == 0 {
            let (guard, _timed_out) = self
                .cv
                .wait_timeout(count, timeout)
                .unwrap_or_else(|p| p.into_inner());
            count = guard;
        }

        let woken = *count > 0;
        *count = 0;
        drop(count);

        self.take_pending() || woken
    }

    fn take_pending(&self) -> bool {
        self.pending.swap(0, Ordering::Acquire) > 0
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
