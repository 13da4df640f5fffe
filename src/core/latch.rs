//! The count-down latch used to signal task completion and to gate
//! dependency-ordered work.
//!
//! A latch starts with a number of outstanding notifications and counts
//! down to zero; waiters block until it gets there. Unlike a condition
//! variable on its own, a latch can be fired before anyone waits on it,
//! which is exactly what completing tasks need.

use std::time::{Duration, Instant};

use crate::core::sync::{Arc, Condvar, Mutex};

/// A count-down synchronization object shared between producers and waiters.
///
/// The counter only ever decreases. Notifying a latch that already reached
/// zero is a no-op, so over-notification can never underflow the counter or
/// wake a waiter twice.
pub struct Latch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Latch {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrement the counter, waking all waiters when it reaches zero.
    pub fn notify(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            drop(count);
            self.cond.notify_all();
        }
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    /// Returns whether the counter has already reached zero, without blocking.
    pub fn try_wait(&self) -> bool {
        *self.count.lock() == 0
    }

    /// Wait until the counter reaches zero or the timeout elapses.
    ///
    /// Returns true when the latch fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline),
            None => {
                self.wait();
                true
            }
        }
    }

    /// Wait until the counter reaches zero or the deadline passes.
    ///
    /// Returns true when the latch fired.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new(1)
    }
}

/// A cloneable handle to a [`Latch`], the form in which latches travel
/// through the scheduler: attached to tasks, returned from group helpers,
/// shared between helper workers.
#[derive(Clone)]
pub struct SharedLatch {
    inner: Arc<Latch>,
}

impl SharedLatch {
    pub fn new(count: usize) -> Self {
        SharedLatch {
            inner: Arc::new(Latch::new(count)),
        }
    }

    pub fn notify(&self) {
        self.inner.notify();
    }

    pub fn wait(&self) {
        self.inner.wait();
    }

    pub fn try_wait(&self) -> bool {
        self.inner.try_wait()
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.inner.wait_for(timeout)
    }

    pub fn wait_until(&self, deadline: Instant) -> bool {
        self.inner.wait_until(deadline)
    }

    /// Returns a guard that notifies this latch exactly once when dropped.
    ///
    /// This is how completion is signaled on every exit path: normal return,
    /// panic, and a task abandoned before it ever ran all drop the guard.
    pub fn notify_guard(&self) -> NotifyOnDrop {
        NotifyOnDrop {
            latch: self.clone(),
        }
    }
}

impl Default for SharedLatch {
    fn default() -> Self {
        SharedLatch::new(1)
    }
}

/// Notifies the wrapped latch when dropped.
pub struct NotifyOnDrop {
    latch: SharedLatch,
}

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.latch.notify();
    }
}

#[test]
fn latch_counts_down_to_zero() {
    let latch = Latch::new(3);
    assert!(!latch.try_wait());
    latch.notify();
    latch.notify();
    assert!(!latch.try_wait());
    latch.notify();
    assert!(latch.try_wait());

    // Beyond zero, notify is a no-op.
    latch.notify();
    assert!(latch.try_wait());
    latch.wait();
}

#[test]
fn latch_zero_count_is_born_fired() {
    let latch = Latch::new(0);
    assert!(latch.try_wait());
    latch.wait();
    assert!(latch.wait_for(Duration::from_millis(1)));
}

#[test]
fn latch_wakes_cross_thread_waiters() {
    use crate::core::sync::thread;

    let latch = Arc::new(Latch::new(2));
    let mut waiters = Vec::new();
    for _ in 0..4 {
        let latch = Arc::clone(&latch);
        waiters.push(thread::spawn(move || latch.wait()));
    }

    latch.notify();
    latch.notify();
    for waiter in waiters {
        waiter.join().unwrap();
    }
}

#[test]
fn latch_timed_wait_reports_timeout() {
    let latch = Latch::new(1);
    assert!(!latch.wait_for(Duration::from_millis(10)));
    latch.notify();
    assert!(latch.wait_for(Duration::from_millis(10)));
    assert!(latch.wait_until(Instant::now()));
}

#[test]
fn notify_guard_fires_on_panic() {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let latch = SharedLatch::new(1);
    let guard = latch.notify_guard();
    let result = catch_unwind(AssertUnwindSafe(move || {
        let _guard = guard;
        panic!("boom");
    }));
    assert!(result.is_err());
    assert!(latch.try_wait());
}
