//! The unit of work that flows through the scheduler's queues.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::core::latch::SharedLatch;

/// A nullary callable packaged with an optional companion latch.
///
/// The companion latch doubles as a readiness gate: a worker that pops a
/// task whose latch has not reached zero re-submits it instead of running
/// it. Notification of the latch happens in `Drop`, which is what makes it
/// exactly-once on every path: after a normal run, after a panicking run,
/// and when the task is thrown away without running (submission rejected,
/// queues drained during shutdown). A latch already at zero ignores the
/// extra notify.
pub(crate) struct Task {
    function: Option<Box<dyn FnOnce() + Send>>,
    latch: Option<SharedLatch>,
}

impl Task {
    pub fn new<F>(function: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            function: Some(Box::new(function)),
            latch: None,
        }
    }

    pub fn with_latch<F>(function: F, latch: SharedLatch) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            function: Some(Box::new(function)),
            latch: Some(latch),
        }
    }

    /// A task that does nothing. Used as the shutdown sentinel that unwedges
    /// blocking pops.
    pub fn noop() -> Self {
        Task::new(|| {})
    }

    /// True when the task has no companion latch or the latch already fired.
    pub fn is_ready(&self) -> bool {
        match &self.latch {
            Some(latch) => latch.try_wait(),
            None => true,
        }
    }

    /// Invoke the callable, catching a panic instead of unwinding into the
    /// worker. The companion latch fires when `self` drops on the way out.
    pub fn run(mut self) -> Result<(), Box<dyn Any + Send>> {
        match self.function.take() {
            Some(function) => catch_unwind(AssertUnwindSafe(function)),
            None => Ok(()),
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(latch) = self.latch.take() {
            latch.notify();
        }
    }
}

#[test]
fn task_without_latch_is_always_ready() {
    let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = ran.clone();
    let task = Task::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst));
    assert!(task.is_ready());
    task.run().unwrap();
    assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn task_readiness_follows_the_latch() {
    let gate = SharedLatch::new(1);
    let task = Task::with_latch(|| {}, gate.clone());
    assert!(!task.is_ready());
    gate.notify();
    assert!(task.is_ready());
    task.run().unwrap();
}

#[test]
fn dropping_an_unexecuted_task_notifies_its_latch() {
    let latch = SharedLatch::new(1);
    let task = Task::with_latch(|| panic!("never runs"), latch.clone());
    drop(task);
    assert!(latch.try_wait());
}

#[test]
fn a_panicking_task_still_notifies_once() {
    let latch = SharedLatch::new(1);
    let task = Task::with_latch(|| panic!("boom"), latch.clone());
    // The latch is at one, so the task reads as not ready; run it anyway to
    // exercise the panic path.
    assert!(task.run().is_err());
    assert!(latch.try_wait());
}
