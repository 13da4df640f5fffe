//! Free helpers layered over the scheduler core, plus the process-wide
//! default scheduler they are most convenient with.

use once_cell::sync::Lazy;

use crate::core::latch::SharedLatch;
use crate::core::scheduler::TaskScheduler;
use crate::error::SubmitError;
use crate::future::FutureResult;

static DEFAULT_SCHEDULER: Lazy<TaskScheduler> = Lazy::new(|| {
    let scheduler = TaskScheduler::builder().build();
    scheduler.start();
    scheduler
});

/// The process-wide scheduler, built with defaults and started on first
/// access. It lives until the process exits; worker threads hold weak
/// handles and park on bounded waits, so no teardown ordering is needed.
pub fn get_task_scheduler() -> TaskScheduler {
    DEFAULT_SCHEDULER.clone()
}

/// Submit `task` and notify `latch` when it has finished. The notification
/// happens on a normal return, on a panic, and even when the task is
/// rejected or later abandoned by a shutdown, so waiters on the latch can
/// never be stranded by a failed task.
pub fn schedule_task<F>(
    latch: SharedLatch,
    task: F,
    scheduler: &TaskScheduler,
) -> Result<(), SubmitError>
where
    F: FnOnce() + Send + 'static,
{
    let done = latch.notify_guard();
    // On rejection the closure is dropped unexecuted, which fires the guard.
    scheduler.add_task(move || {
        let _done = done;
        task();
    })
}

/// Submit `task` and return a latch that fires when it has finished.
pub fn create_waitable_task<F>(task: F, scheduler: &TaskScheduler) -> SharedLatch
where
    F: FnOnce() + Send + 'static,
{
    let latch = SharedLatch::new(1);
    let _ = schedule_task(latch.clone(), task, scheduler);
    latch
}

/// Submit every callable in `tasks` and return a latch that fires once all
/// of them have finished.
pub fn task_group<I>(scheduler: &TaskScheduler, tasks: I) -> SharedLatch
where
    I: IntoIterator,
    I::Item: FnOnce() + Send + 'static,
{
    let tasks: Vec<_> = tasks.into_iter().collect();
    let latch = SharedLatch::new(tasks.len());
    for task in tasks {
        let _ = schedule_task(latch.clone(), task, scheduler);
    }
    latch
}

/// Submit every callable in `tasks` and wait for all of them, with a helper
/// worker standing in for the calling thread while it blocks.
pub fn invoke_tasks<I>(scheduler: &TaskScheduler, tasks: I)
where
    I: IntoIterator,
    I::Item: FnOnce() + Send + 'static,
{
    let group = task_group(scheduler, tasks);
    scheduler.wait_for(&group);
}

/// Free-function form of
/// [`TaskScheduler::wait_for_scope`](TaskScheduler::wait_for_scope).
pub fn wait_for_scope<F, R>(scheduler: &TaskScheduler, function: F) -> R
where
    F: FnOnce() -> R,
{
    scheduler.wait_for_scope(function)
}

/// Run `function` on the pool and get a future of its result.
pub fn make_future_result<F, T>(scheduler: &TaskScheduler, function: F) -> FutureResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    FutureResult::from_code(scheduler, function)
}

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn test_scheduler(num_threads: usize) -> TaskScheduler {
    let scheduler = TaskScheduler::new(num_threads, true);
    scheduler.start();
    scheduler
}

#[test]
fn a_task_group_completes_and_every_effect_lands() {
    let scheduler = test_scheduler(3);

    let seen = Arc::new(AtomicUsize::new(0));
    let group = task_group(
        &scheduler,
        (0..5usize).map(|index| {
            let seen = seen.clone();
            move || {
                // Sum of indices 0..5 is observable once the latch fires.
                seen.fetch_add(index, Ordering::SeqCst);
            }
        }),
    );

    group.wait();
    assert_eq!(seen.load(Ordering::SeqCst), 0 + 1 + 2 + 3 + 4);
    scheduler.stop(true);
}

#[test]
fn invoke_tasks_returns_after_all_side_effects() {
    let scheduler = test_scheduler(2);

    let count = Arc::new(AtomicUsize::new(0));
    invoke_tasks(
        &scheduler,
        (0..5).map(|_| {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );

    assert_eq!(count.load(Ordering::SeqCst), 5);
    scheduler.stop(true);
}

#[test]
fn waitable_tasks_fire_their_latch() {
    let scheduler = test_scheduler(2);

    let ran = Arc::new(AtomicUsize::new(0));
    let count = ran.clone();
    let latch = create_waitable_task(
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        },
        &scheduler,
    );

    latch.wait();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    scheduler.stop(true);
}

#[test]
fn rejected_scheduling_still_fires_the_latch() {
    // Never started: every submission is rejected.
    let scheduler = TaskScheduler::new(1, true);

    let latch = SharedLatch::new(1);
    assert!(schedule_task(latch.clone(), || {}, &scheduler).is_err());
    assert!(latch.try_wait());

    let waitable = create_waitable_task(|| {}, &scheduler);
    assert!(waitable.wait_for(Duration::from_secs(1)));

    let group = task_group(&scheduler, (0..3).map(|_| || {}));
    assert!(group.wait_for(Duration::from_secs(1)));
}

#[test]
fn a_panicking_group_member_does_not_strand_waiters() {
    let scheduler = test_scheduler(2);

    let group = task_group(
        &scheduler,
        (0..4usize).map(|index| {
            move || {
                if index == 2 {
                    panic!("task {index} failed");
                }
            }
        }),
    );

    assert!(group.wait_for(Duration::from_secs(10)));
    scheduler.stop(true);
}

#[test]
fn the_default_scheduler_is_shared_and_started() {
    let first = get_task_scheduler();
    let second = get_task_scheduler();
    assert!(first.started());
    assert_eq!(first.size(), second.size());

    let done = create_waitable_task(|| {}, &first);
    done.wait();
}

#[test]
fn blocking_through_wait_for_scope_keeps_the_pool_live() {
    let scheduler = test_scheduler(1);

    let count = Arc::new(AtomicUsize::new(0));
    let total = count.clone();
    let inner = scheduler.clone();
    let result = wait_for_scope(&scheduler, move || {
        let group = task_group(
            &inner,
            (0..4).map(|_| {
                let count = total.clone();
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        group.wait();
        "done"
    });

    assert_eq!(result, "done");
    assert_eq!(count.load(Ordering::SeqCst), 4);
    scheduler.stop(true);
}
