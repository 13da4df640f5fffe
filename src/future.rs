//! Single-assignment future results with chainable continuations.
//!
//! A `FutureResult` is a one-shot cell resolved exactly once with either a
//! value or an error. Waiters block on an embedded latch; continuations
//! registered through [`next`](FutureResult::next) are handed to the
//! scheduler as fresh tasks when the cell resolves, which is what the
//! function-stream layer builds its pipelines out of.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::core::latch::Latch;
use crate::core::scheduler::{TaskScheduler, Waitable};
use crate::core::sync::{Arc, Mutex};
use crate::error::TaskError;

/// Outcome of a timed wait on a future result.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FutureStatus {
    Ready,
    Timeout,
}

type Continuation<T> = Box<dyn FnOnce(&TaskScheduler, &Result<T, TaskError>) + Send>;

enum State<T> {
    Pending { continuations: Vec<Continuation<T>> },
    Ready(Result<T, TaskError>),
}

struct FutureData<T> {
    latch: Latch,
    state: Mutex<State<T>>,
    scheduler: TaskScheduler,
}

/// A single-assignment result cell tied to a scheduler.
///
/// Clones share the same cell. The transition from pending to resolved
/// happens once and is irreversible; [`get`](FutureResult::get) observes the
/// same outcome on every call.
pub struct FutureResult<T> {
    data: Arc<FutureData<T>>,
}

impl<T> Clone for FutureResult<T> {
    fn clone(&self) -> Self {
        FutureResult {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: Send + 'static> FutureResult<T> {
    /// An unresolved future tied to `scheduler`.
    pub fn new(scheduler: &TaskScheduler) -> Self {
        FutureResult {
            data: Arc::new(FutureData {
                latch: Latch::new(1),
                state: Mutex::new(State::Pending {
                    continuations: Vec::new(),
                }),
                scheduler: scheduler.clone(),
            }),
        }
    }

    /// A future born resolved with `value`.
    pub fn resolved(scheduler: &TaskScheduler, value: T) -> Self {
        FutureResult {
            data: Arc::new(FutureData {
                latch: Latch::new(0),
                state: Mutex::new(State::Ready(Ok(value))),
                scheduler: scheduler.clone(),
            }),
        }
    }

    /// Run `function` on the pool and resolve the future with its return
    /// value, or with its panic as an error. A submission that is rejected,
    /// or accepted but abandoned by a shutdown, resolves the future with an
    /// error instead, so waiters never stall.
    pub fn from_code<F>(scheduler: &TaskScheduler, function: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let future = FutureResult::new(scheduler);
        let guard = ResolveOnAbandon::new(future.clone());
        let _ = scheduler.add_task(move || {
            let result = guard.take();
            match catch_unwind(AssertUnwindSafe(function)) {
                Ok(value) => result.set_value(value),
                Err(payload) => result.set_error(TaskError::from_panic(payload)),
            }
        });
        future
    }

    /// Resolve with a value.
    ///
    /// Panics when the future was already resolved; a cell only transitions
    /// once.
    pub fn set_value(&self, value: T) {
        self.resolve(Ok(value));
    }

    /// Resolve with an error.
    pub fn set_error(&self, error: impl Into<TaskError>) {
        self.resolve(Err(error.into()));
    }

    fn resolve(&self, result: Result<T, TaskError>) {
        // Store the result first, then fire the latch, then drain the
        // continuations in registration order.
        let continuations = {
            let mut state = self.data.state.lock();
            match &mut *state {
                State::Ready(_) => panic!("future result resolved twice"),
                State::Pending { continuations } => {
                    let continuations = std::mem::take(continuations);
                    *state = State::Ready(result);
                    continuations
                }
            }
        };
        self.data.latch.notify();

        if continuations.is_empty() {
            return;
        }
        let state = self.data.state.lock();
        if let State::Ready(result) = &*state {
            for continuation in continuations {
                continuation(&self.data.scheduler, result);
            }
        }
    }

    fn register(&self, continuation: Continuation<T>) {
        let mut state = self.data.state.lock();
        match &mut *state {
            State::Pending { continuations } => continuations.push(continuation),
            // Already resolved: schedule immediately.
            State::Ready(result) => continuation(&self.data.scheduler, result),
        }
    }

    /// Schedule `function` to run on the pool with this future's value once
    /// it resolves, yielding the future of its result.
    ///
    /// An error skips `function` entirely and becomes the successor's error;
    /// a panic inside `function` does too.
    pub fn next<F, U>(&self, function: F) -> FutureResult<U>
    where
        F: FnOnce(T) -> U + Send + 'static,
        T: Clone,
        U: Send + 'static,
    {
        let successor = FutureResult::new(&self.data.scheduler);
        let result = successor.clone();
        self.register(Box::new(move |scheduler, outcome| match outcome {
            Ok(value) => {
                let value = value.clone();
                let guard = ResolveOnAbandon::new(result);
                let _ = scheduler.add_task(move || {
                    let target = guard.take();
                    match catch_unwind(AssertUnwindSafe(|| function(value))) {
                        Ok(next_value) => target.set_value(next_value),
                        Err(payload) => target.set_error(TaskError::from_panic(payload)),
                    }
                });
            }
            Err(error) => result.set_error(error.clone()),
        }));
        successor
    }

    /// Block until the future resolves.
    pub fn wait(&self) {
        self.data.latch.wait();
    }

    /// Whether the future has already resolved, without blocking.
    pub fn try_wait(&self) -> bool {
        self.data.latch.try_wait()
    }

    pub fn wait_for(&self, timeout: Duration) -> FutureStatus {
        if self.data.latch.wait_for(timeout) {
            FutureStatus::Ready
        } else {
            FutureStatus::Timeout
        }
    }

    pub fn wait_until(&self, deadline: Instant) -> FutureStatus {
        if self.data.latch.wait_until(deadline) {
            FutureStatus::Ready
        } else {
            FutureStatus::Timeout
        }
    }

    /// Wait for resolution and return the stored outcome. Repeated calls
    /// return the same value or the same error.
    pub fn get(&self) -> Result<T, TaskError>
    where
        T: Clone,
    {
        self.wait();
        match &*self.data.state.lock() {
            State::Ready(result) => result.clone(),
            // The latch only fires after the state is stored.
            State::Pending { .. } => unreachable!("future latch fired while pending"),
        }
    }

    /// Wait for resolution and report whether an error is stored.
    pub fn is_error(&self) -> bool {
        self.wait();
        matches!(&*self.data.state.lock(), State::Ready(Err(_)))
    }
}

/// Resolves the wrapped future with a rejection error when dropped before
/// anyone claimed it. A scheduled producer task owns one of these; whether
/// the submission is rejected outright or the queued task is dropped by a
/// shutdown, the future resolves instead of stranding its waiters.
struct ResolveOnAbandon<T: Send + 'static> {
    future: Option<FutureResult<T>>,
}

impl<T: Send + 'static> ResolveOnAbandon<T> {
    fn new(future: FutureResult<T>) -> Self {
        ResolveOnAbandon {
            future: Some(future),
        }
    }

    /// Claim the future for a normal resolution, defusing the guard.
    fn take(mut self) -> FutureResult<T> {
        match self.future.take() {
            Some(future) => future,
            None => unreachable!("resolve guard claimed twice"),
        }
    }
}

impl<T: Send + 'static> Drop for ResolveOnAbandon<T> {
    fn drop(&mut self) {
        if let Some(future) = self.future.take() {
            future.set_error(TaskError::Rejected);
        }
    }
}

impl<T: Send + 'static> Waitable for FutureResult<T> {
    fn wait(&self) {
        FutureResult::wait(self)
    }
}

#[cfg(test)]
fn test_scheduler(num_threads: usize) -> TaskScheduler {
    let scheduler = TaskScheduler::new(num_threads, true);
    scheduler.start();
    scheduler
}

#[test]
fn chained_futures_compose() {
    let scheduler = test_scheduler(2);

    let future = FutureResult::from_code(&scheduler, || 2)
        .next(|value| value + 1)
        .next(|value| value.to_string());
    assert_eq!(future.get(), Ok("3".to_string()));

    scheduler.stop(true);
}

#[test]
fn get_is_idempotent() {
    let scheduler = test_scheduler(2);

    let future = FutureResult::from_code(&scheduler, || 7);
    assert_eq!(future.get(), Ok(7));
    assert_eq!(future.get(), Ok(7));
    assert!(future.try_wait());
    assert!(!future.is_error());

    scheduler.stop(true);
}

#[test]
fn a_panicking_producer_becomes_an_error() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let scheduler = test_scheduler(2);

    let future: FutureResult<i32> = FutureResult::from_code(&scheduler, || panic!("boom"));
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = invoked.clone();
    let successor = future.next(move |value| {
        flag.store(true, Ordering::SeqCst);
        value
    });

    assert_eq!(
        future.get(),
        Err(TaskError::Panic("boom".to_string()))
    );
    // The error propagates without invoking the successor's callable.
    assert_eq!(successor.get(), Err(TaskError::Panic("boom".to_string())));
    assert!(successor.is_error());
    assert!(!invoked.load(Ordering::SeqCst));

    scheduler.stop(true);
}

#[test]
fn set_error_reraises_on_get() {
    let scheduler = test_scheduler(1);

    let future: FutureResult<u32> = FutureResult::new(&scheduler);
    future.set_error("no input available");
    assert_eq!(
        future.get(),
        Err(TaskError::Message("no input available".to_string()))
    );

    scheduler.stop(true);
}

#[test]
fn timed_waits_observe_pending_and_ready() {
    let scheduler = test_scheduler(1);

    let future: FutureResult<u32> = FutureResult::new(&scheduler);
    assert_eq!(
        future.wait_for(Duration::from_millis(10)),
        FutureStatus::Timeout
    );
    assert_eq!(
        future.wait_until(Instant::now() + Duration::from_millis(10)),
        FutureStatus::Timeout
    );

    future.set_value(1);
    assert_eq!(
        future.wait_for(Duration::from_millis(10)),
        FutureStatus::Ready
    );
    assert_eq!(future.get(), Ok(1));

    scheduler.stop(true);
}

#[test]
fn continuations_are_scheduled_in_registration_order() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    // One worker, one queue: per-queue FIFO makes the scheduling order
    // observable as execution order.
    let scheduler = test_scheduler(1);

    let order = Arc::new(Mutex::new(Vec::new()));
    let future: FutureResult<u32> = FutureResult::new(&scheduler);

    let mut successors = Vec::new();
    for tag in 0..4usize {
        let order = order.clone();
        successors.push(future.next(move |value| {
            order.lock().push(tag);
            value
        }));
    }

    future.set_value(0);
    for successor in &successors {
        successor.wait();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);

    // Registering on a resolved future schedules immediately.
    let late = Arc::new(AtomicUsize::new(0));
    let counter = late.clone();
    future
        .next(move |_| counter.fetch_add(1, Ordering::SeqCst))
        .wait();
    assert_eq!(late.load(Ordering::SeqCst), 1);

    scheduler.stop(true);
}

#[test]
fn from_code_on_a_stopped_scheduler_fails_fast() {
    let scheduler = TaskScheduler::new(1, true);

    let future = FutureResult::from_code(&scheduler, || 3);
    assert_eq!(future.get(), Err(TaskError::Rejected));
}
