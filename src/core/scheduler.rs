//! The public face of the scheduler: a cloneable handle plus its builder.

use std::any::Any;

use crate::core::latch::{Latch, SharedLatch};
use crate::core::queue::DEFAULT_CAPACITY;
use crate::core::sync::{Arc, Weak};
use crate::core::Core;
use crate::error::SubmitError;

/// Called with the panic payload of a failed task. Installing one replaces
/// the default warning log.
pub type FaultHandler = Box<dyn Fn(&(dyn Any + Send)) + Send + Sync>;

pub(crate) type ThreadNameFn = Box<dyn Fn(usize) -> String + Send + Sync>;

/// Something a scheduler can block on through
/// [`wait_for`](TaskScheduler::wait_for).
pub trait Waitable {
    fn wait(&self);
}

impl Waitable for Latch {
    fn wait(&self) {
        Latch::wait(self)
    }
}

impl Waitable for SharedLatch {
    fn wait(&self) {
        SharedLatch::wait(self)
    }
}

/// A handle to a pool of worker threads running nullary tasks.
///
/// Cloning is cheap and every clone refers to the same pool. Worker threads
/// themselves only hold weak references, so when the last handle goes away
/// the pool stops with the configured blocking mode.
#[derive(Clone)]
pub struct TaskScheduler {
    // Declared before `core` so the owner guard drops first and can still
    // upgrade its weak reference while this handle keeps the core alive.
    pub(crate) owner: Arc<OwnerGuard>,
    pub(crate) core: Arc<Core>,
}

/// Shared by every clone of a scheduler handle. When the last clone drops,
/// the pool is stopped with its configured blocking mode. This is tracked
/// separately from the core's own reference count because worker threads
/// briefly upgrade their weak core references and would otherwise keep
/// postponing the teardown.
pub(crate) struct OwnerGuard {
    pub(crate) core: Weak<Core>,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.stop_on_destruction();
        }
    }
}

impl TaskScheduler {
    pub fn builder() -> TaskSchedulerBuilder {
        TaskSchedulerBuilder {
            num_threads: num_cpus::get().max(1),
            block_on_destruction: true,
            queue_capacity: DEFAULT_CAPACITY,
            name_handler: Box::new(|index| format!("task-worker-{index}")),
            stack_size: None,
            fault_handler: None,
        }
    }

    /// A scheduler with `num_threads` workers and otherwise default
    /// configuration. Call [`start`](TaskScheduler::start) before submitting.
    pub fn new(num_threads: usize, block_on_destruction: bool) -> Self {
        TaskScheduler::builder()
            .with_worker_threads(num_threads)
            .with_block_on_destruction(block_on_destruction)
            .build()
    }

    /// Spawn the workers and begin accepting tasks. Idempotent.
    pub fn start(&self) {
        self.core.start();
    }

    /// Stop accepting tasks, unwedge and (when `block`) join the workers,
    /// then drop whatever was still queued. Dropped tasks notify their
    /// companion latches, so nobody ends up waiting on abandoned work.
    /// Idempotent. Must not be called from inside a task running on this
    /// scheduler.
    pub fn stop(&self, block: bool) {
        self.core.stop(block);
    }

    pub fn started(&self) -> bool {
        self.core.is_running()
    }

    /// Number of worker threads (and queues).
    pub fn size(&self) -> usize {
        self.core.size()
    }

    /// Submit a task. Fails when the scheduler is not running or the target
    /// queue stayed full until the wait was abandoned.
    pub fn add_task<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.add_task(task)
    }

    /// Submit a task gated on `latch`: a worker that pops it before the
    /// latch fired puts it back instead of running it. The latch is also
    /// notified when the task is abandoned, so waiters cannot be stranded
    /// by a shutdown.
    pub fn add_task_with_latch<F>(&self, task: F, latch: SharedLatch) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.add_task_with_latch(task, latch)
    }

    /// Spawn `count` detached helper workers that process pool tasks until
    /// the returned latch fires.
    pub fn start_temp_task_runners(&self, count: usize) -> SharedLatch {
        self.core.start_temp_task_runners(count)
    }

    /// Run `function` with one temporary helper worker standing in for the
    /// current thread, so the function may block on pool work without
    /// deadlocking the pool, even from inside a task running on this very
    /// scheduler. The helper retires when the scope exits, normally or by
    /// panic.
    pub fn wait_for_scope<F, R>(&self, function: F) -> R
    where
        F: FnOnce() -> R,
    {
        let helpers = self.core.start_temp_task_runners(1);
        let _retire = helpers.notify_guard();
        function()
    }

    /// [`wait_for_scope`](TaskScheduler::wait_for_scope) specialized to
    /// waiting on a latch or future.
    pub fn wait_for<W>(&self, waitable: &W)
    where
        W: Waitable + ?Sized,
    {
        self.wait_for_scope(|| waitable.wait());
    }

    /// True when the calling thread is one of this scheduler's workers or
    /// live helpers.
    pub fn am_i_in_pool(&self) -> bool {
        self.core.am_i_in_pool()
    }
}

pub struct TaskSchedulerBuilder {
    pub(crate) num_threads: usize,
    pub(crate) block_on_destruction: bool,
    pub(crate) queue_capacity: usize,
    pub(crate) name_handler: ThreadNameFn,
    pub(crate) stack_size: Option<usize>,
    pub(crate) fault_handler: Option<FaultHandler>,
}

impl TaskSchedulerBuilder {
    pub fn with_worker_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    pub fn with_block_on_destruction(mut self, block: bool) -> Self {
        self.block_on_destruction = block;
        self
    }

    /// Capacity of each per-worker queue.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_thread_names<F>(mut self, handler: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.name_handler = Box::new(handler);
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Install a handler that receives the panic payload of every failed
    /// task. The default drops the payload after logging a warning.
    pub fn with_fault_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&(dyn Any + Send)) + Send + Sync + 'static,
    {
        self.fault_handler = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> TaskScheduler {
        crate::core::init(self)
    }
}

#[cfg(test)]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(test)]
use std::time::Duration;

#[test]
fn start_and_stop_are_idempotent() {
    for num_threads in 1..5 {
        let scheduler = TaskScheduler::new(num_threads, true);
        assert!(!scheduler.started());
        assert_eq!(scheduler.size(), num_threads);

        scheduler.start();
        scheduler.start();
        assert!(scheduler.started());

        scheduler.stop(true);
        scheduler.stop(true);
        assert!(!scheduler.started());
    }
}

#[test]
fn add_task_is_rejected_before_start() {
    let scheduler = TaskScheduler::new(1, true);
    assert_eq!(scheduler.add_task(|| {}), Err(SubmitError));
}

#[test]
fn submitted_tasks_all_run() {
    // A thousand tasks bumping one atomic, fanned out over the pool.
    let scheduler = TaskScheduler::builder()
        .with_worker_threads(4)
        .with_stack_size(8 * 1024 * 1024)
        .build();
    scheduler.start();

    let count = Arc::new(AtomicUsize::new(0));
    let done = SharedLatch::new(1024);
    for _ in 0..1024 {
        let count = count.clone();
        let guard = done.notify_guard();
        scheduler
            .add_task(move || {
                let _done = guard;
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    done.wait();
    assert_eq!(count.load(Ordering::SeqCst), 1024);
    scheduler.stop(true);
}

#[test]
fn latched_tasks_wait_for_their_gate() {
    let scheduler = TaskScheduler::new(2, true);
    scheduler.start();

    let gate = SharedLatch::new(1);
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    scheduler
        .add_task_with_latch(move || flag.store(true, Ordering::SeqCst), gate.clone())
        .unwrap();

    // The task circulates through the pool without running.
    std::thread::sleep(Duration::from_millis(100));
    assert!(!ran.load(Ordering::SeqCst));

    gate.notify();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !ran.load(Ordering::SeqCst) {
        assert!(std::time::Instant::now() < deadline, "gated task never ran");
        std::thread::sleep(Duration::from_millis(5));
    }

    scheduler.stop(true);
}

#[test]
fn pool_membership_is_visible_from_tasks() {
    let scheduler = TaskScheduler::new(2, true);
    scheduler.start();
    assert!(!scheduler.am_i_in_pool());

    let inside = Arc::new(AtomicBool::new(false));
    let done = SharedLatch::new(1);
    let flag = inside.clone();
    let pool = scheduler.clone();
    let guard = done.notify_guard();
    scheduler
        .add_task(move || {
            let _done = guard;
            flag.store(pool.am_i_in_pool(), Ordering::SeqCst);
        })
        .unwrap();

    done.wait();
    assert!(inside.load(Ordering::SeqCst));
    scheduler.stop(true);
}

#[test]
fn waiting_inside_a_task_does_not_deadlock() {
    // One worker: the outer task occupies the whole pool while it waits for
    // an inner group submitted to the same scheduler. Helpers must pick up
    // the slack.
    let scheduler = TaskScheduler::new(1, true);
    scheduler.start();

    let count = Arc::new(AtomicUsize::new(0));
    let done = SharedLatch::new(1);
    let pool = scheduler.clone();
    let inner_count = count.clone();
    let guard = done.notify_guard();
    scheduler
        .add_task(move || {
            let _done = guard;
            let inner = SharedLatch::new(5);
            for _ in 0..5 {
                let count = inner_count.clone();
                let guard = inner.notify_guard();
                pool.add_task(move || {
                    let _done = guard;
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
            pool.wait_for(&inner);
        })
        .unwrap();

    assert!(done.wait_for(Duration::from_secs(10)), "nested wait deadlocked");
    assert_eq!(count.load(Ordering::SeqCst), 5);
    scheduler.stop(true);
}

#[test]
fn stopping_under_load_releases_every_latch() {
    let scheduler = TaskScheduler::builder()
        .with_worker_threads(4)
        .with_stack_size(32 * 1024 * 1024)
        .build();
    scheduler.start();

    let executed = Arc::new(AtomicUsize::new(0));
    let group = SharedLatch::new(10_000);
    for _ in 0..10_000 {
        let executed = executed.clone();
        let guard = group.notify_guard();
        let submitted = scheduler.add_task(move || {
            let _done = guard;
            executed.fetch_add(1, Ordering::SeqCst);
        });
        // A rejected submission drops the closure, which fires the guard.
        let _ = submitted;
    }

    scheduler.stop(true);

    // Every task either ran or was abandoned with its latch notified.
    assert!(group.wait_for(Duration::from_secs(10)));
    assert!(executed.load(Ordering::SeqCst) <= 10_000);
}

#[test]
fn dropping_the_last_handle_stops_the_pool() {
    let group;
    {
        let scheduler = TaskScheduler::new(2, true);
        scheduler.start();

        let latch = SharedLatch::new(100);
        for _ in 0..100 {
            let guard = latch.notify_guard();
            let _ = scheduler.add_task(move || {
                let _done = guard;
            });
        }
        group = latch;
        // The scheduler handle goes out of scope here; destruction blocks
        // until the workers are gone and the queues are drained.
    }
    assert!(group.wait_for(Duration::from_secs(10)));
}

#[test]
fn fault_handler_sees_task_panics() {
    let seen = Arc::new(AtomicUsize::new(0));
    let observed = seen.clone();
    let scheduler = TaskScheduler::builder()
        .with_worker_threads(2)
        .with_fault_handler(move |payload| {
            assert_eq!(
                crate::error::panic_message(payload),
                "deliberate test panic"
            );
            observed.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    scheduler.start();

    let done = SharedLatch::new(1);
    let guard = done.notify_guard();
    scheduler
        .add_task(move || {
            let _done = guard;
            panic!("deliberate test panic");
        })
        .unwrap();

    done.wait();
    scheduler.stop(true);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
