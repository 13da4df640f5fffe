//! The bounded queue each worker uses as its mailbox.
//!
//! A fixed-capacity ring protected by one mutex with a condition variable
//! per direction. Contention is therefore per-queue; the steal loop in the
//! scheduler core only ever takes one of these locks at a time, with the
//! non-blocking operations backing off instead of queueing on a contended
//! lock.

use std::time::Duration;

use crate::core::sync::{Condvar, Mutex};
use crate::core::task::Task;

pub(crate) const DEFAULT_CAPACITY: usize = 1024;

pub(crate) struct TaskQueue {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Ring {
    slots: Box<[Option<Task>]>,
    head: usize,
    tail: usize,
    full: bool,
}

impl Ring {
    fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    fn store(&mut self, task: Task) {
        debug_assert!(!self.full);
        debug_assert!(self.slots[self.tail].is_none());
        self.slots[self.tail] = Some(task);
        self.tail = (self.tail + 1) % self.slots.len();
        self.full = self.head == self.tail;
    }

    fn take(&mut self) -> Option<Task> {
        if self.is_empty() {
            return None;
        }
        let task = self.slots[self.head].take();
        debug_assert!(task.is_some());
        self.head = (self.head + 1) % self.slots.len();
        self.full = false;
        task
    }
}

impl TaskQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        TaskQueue {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                head: 0,
                tail: 0,
                full: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Non-blocking push. Hands the task back when the lock is contended or
    /// the ring is full.
    pub fn try_push(&self, task: Task) -> Result<(), Task> {
        let mut ring = match self.ring.try_lock() {
            Some(ring) => ring,
            None => return Err(task),
        };
        if ring.full {
            return Err(task);
        }
        ring.store(task);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocking push. Re-checks `keep_going` on every wakeup and after every
    /// `wait_slice` of sleeping; the push only succeeds when there is space
    /// AND `keep_going` still holds. Hands the task back on abandonment.
    pub fn push(
        &self,
        task: Task,
        keep_going: impl Fn() -> bool,
        wait_slice: Duration,
    ) -> Result<(), Task> {
        let mut ring = self.ring.lock();
        loop {
            if !keep_going() {
                return Err(task);
            }
            if !ring.full {
                ring.store(task);
                drop(ring);
                self.not_empty.notify_one();
                return Ok(());
            }
            self.not_full.wait_for(&mut ring, wait_slice);
        }
    }

    /// Non-blocking pop. Returns `None` when the lock is contended or the
    /// ring is empty.
    pub fn try_pop(&self) -> Option<Task> {
        let mut ring = self.ring.try_lock()?;
        let task = ring.take()?;
        drop(ring);
        self.not_full.notify_one();
        Some(task)
    }

    /// Blocking pop, mirroring `push`: only returns a task while
    /// `keep_going` holds, `None` once the wait is abandoned.
    pub fn pop(&self, keep_going: impl Fn() -> bool, wait_slice: Duration) -> Option<Task> {
        let mut ring = self.ring.lock();
        loop {
            if !keep_going() {
                return None;
            }
            if let Some(task) = ring.take() {
                drop(ring);
                self.not_full.notify_one();
                return Some(task);
            }
            self.not_empty.wait_for(&mut ring, wait_slice);
        }
    }

    /// Wake every sleeper on both condition variables so they re-check their
    /// predicates. Called when the scheduler stops accepting work.
    pub fn close(&self) {
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Remove and drop every queued task, returning how many there were.
    /// Dropping a task fires its companion latch, so abandoned work still
    /// unblocks its waiters.
    pub fn drain(&self) -> usize {
        let mut ring = self.ring.lock();
        let mut dropped = 0;
        while let Some(task) = ring.take() {
            drop(task);
            dropped += 1;
        }
        drop(ring);
        self.not_full.notify_all();
        dropped
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

#[cfg(test)]
const TEST_SLICE: Duration = Duration::from_millis(10);

#[test]
fn queue_is_first_in_first_out() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let queue = TaskQueue::with_capacity(8);
    let seen = Arc::new(AtomicUsize::new(0));
    for index in 0..4usize {
        let seen = seen.clone();
        queue
            .try_push(Task::new(move || {
                // Each task asserts it runs in submission order.
                assert_eq!(seen.fetch_add(1, Ordering::SeqCst), index);
            }))
            .ok()
            .unwrap();
    }

    while let Some(task) = queue.try_pop() {
        task.run().unwrap();
    }
    assert_eq!(seen.load(Ordering::SeqCst), 4);
    assert!(queue.is_empty());
}

#[test]
fn try_push_reports_full() {
    let queue = TaskQueue::with_capacity(2);
    queue.try_push(Task::noop()).ok().unwrap();
    queue.try_push(Task::noop()).ok().unwrap();
    assert!(queue.try_push(Task::noop()).is_err());

    // Popping one frees a slot.
    queue.try_pop().unwrap().run().unwrap();
    queue.try_push(Task::noop()).ok().unwrap();
}

#[test]
fn blocking_push_abandons_when_told_to() {
    let queue = TaskQueue::with_capacity(1);
    queue.try_push(Task::noop()).ok().unwrap();

    let rejected = queue.push(Task::noop(), || false, TEST_SLICE);
    assert!(rejected.is_err());
}

#[test]
fn blocking_pop_abandons_when_told_to() {
    let queue = TaskQueue::with_capacity(1);
    assert!(queue.pop(|| false, TEST_SLICE).is_none());
}

#[test]
fn blocking_pop_sees_a_push_from_another_thread() {
    use crate::core::sync::{thread, Arc};

    let queue = Arc::new(TaskQueue::with_capacity(4));
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.pop(|| true, TEST_SLICE).is_some())
    };

    thread::sleep(Duration::from_millis(20));
    queue.try_push(Task::noop()).ok().unwrap();
    assert!(consumer.join().unwrap());
}

#[test]
fn drain_fires_companion_latches() {
    use crate::core::latch::SharedLatch;

    let queue = TaskQueue::with_capacity(4);
    let latch = SharedLatch::new(3);
    for _ in 0..3 {
        queue
            .try_push(Task::with_latch(|| {}, latch.clone()))
            .ok()
            .unwrap();
    }

    assert_eq!(queue.drain(), 3);
    assert!(latch.try_wait());
    assert!(queue.is_empty());
}
