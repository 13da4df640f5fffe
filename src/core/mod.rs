pub mod latch;
pub(crate) mod queue;
pub mod scheduler;
/// basic sync types re-exported here so the whole crate agrees on one set.
pub mod sync;
pub(crate) mod task;

use std::collections::HashMap;
use std::thread::ThreadId;
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};

use self::latch::SharedLatch;
use self::queue::TaskQueue;
use self::scheduler::{FaultHandler, OwnerGuard, TaskScheduler, TaskSchedulerBuilder, ThreadNameFn};
use self::sync::{thread, Arc, AtomicBool, AtomicUsize, Mutex, Ordering, Weak};
use self::task::Task;

use crate::error::{panic_message, SubmitError};

/// How long a blocked queue wait sleeps before re-checking its caller
/// predicate. Bounds how stale a worker's view of the running flag can get.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// State shared by every worker, helper and public handle of one scheduler.
///
/// Public handles hold this behind a strong `Arc`; worker and helper threads
/// only ever hold a `Weak` and upgrade it once per loop iteration, so a
/// scheduler whose last public handle is dropped can tear itself down
/// without waiting on its own threads to let go.
pub(crate) struct Core {
    /// One mailbox per worker. Padded so neighbouring queue locks don't
    /// share a cache line under the steal sweep.
    queues: Vec<CachePadded<TaskQueue>>,
    running: AtomicBool,
    /// Round-robin cursor for picking a submission target.
    next_queue: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Worker thread identity -> queue index.
    thread_map: Mutex<HashMap<ThreadId, usize>>,
    /// Live temporary helper threads. Helpers add themselves on entry and
    /// remove themselves on the way out.
    helper_threads: Mutex<Vec<ThreadId>>,
    fault_handler: Option<FaultHandler>,
    name_handler: ThreadNameFn,
    stack_size: Option<usize>,
    block_on_destruction: bool,
    weak_self: Weak<Core>,
}

pub(crate) fn init(params: TaskSchedulerBuilder) -> TaskScheduler {
    let num_threads = params.num_threads.max(1);

    let core = Arc::new_cyclic(|weak| Core {
        queues: (0..num_threads)
            .map(|_| CachePadded::new(TaskQueue::with_capacity(params.queue_capacity)))
            .collect(),
        running: AtomicBool::new(false),
        next_queue: AtomicUsize::new(0),
        threads: Mutex::new(Vec::with_capacity(num_threads)),
        thread_map: Mutex::new(HashMap::with_capacity(num_threads)),
        helper_threads: Mutex::new(Vec::new()),
        fault_handler: params.fault_handler,
        name_handler: params.name_handler,
        stack_size: params.stack_size,
        block_on_destruction: params.block_on_destruction,
        weak_self: weak.clone(),
    });

    TaskScheduler {
        owner: Arc::new(OwnerGuard {
            core: Arc::downgrade(&core),
        }),
        core,
    }
}

impl Core {
    fn handle(&self) -> Weak<Core> {
        self.weak_self.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    fn next_index(&self) -> usize {
        self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len()
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut threads = self.threads.lock();
        let mut thread_map = self.thread_map.lock();
        for index in 0..self.queues.len() {
            let worker = Worker {
                index,
                core: self.handle(),
            };

            let mut builder = thread::Builder::new().name((self.name_handler)(index));
            if let Some(stack_size) = self.stack_size {
                builder = builder.stack_size(stack_size);
            }

            match builder.spawn(move || worker.run()) {
                Ok(handle) => {
                    thread_map.insert(handle.thread().id(), index);
                    threads.push(handle);
                }
                Err(err) => {
                    // A partial pool is not supported.
                    log::error!("failed to spawn worker thread: {err}");
                    std::process::abort();
                }
            }
        }
    }

    pub fn stop(&self, block: bool) {
        self.running.store(false, Ordering::SeqCst);

        // One sentinel per queue unwedges blocking pops without waiting for
        // their timeout slice; close() catches the case where a full queue
        // had no room for the sentinel.
        for queue in &self.queues {
            let _ = queue.try_push(Task::noop());
            queue.close();
        }

        let workers = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                // A worker ended up running the teardown; it cannot join
                // itself, so its handle is dropped and the thread exits on
                // its next running-flag check.
                continue;
            }
            if block {
                let _ = handle.join();
            }
        }
        self.thread_map.lock().clear();

        let mut abandoned = 0;
        for queue in &self.queues {
            abandoned += queue.drain();
        }
        if abandoned > 0 {
            log::debug!("dropped {abandoned} queued tasks during shutdown");
        }
    }

    pub fn add_task<F>(&self, function: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(None, function)
    }

    pub fn add_task_with_latch<F>(&self, function: F, latch: SharedLatch) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Some(latch), function)
    }

    fn submit<F>(&self, latch: Option<SharedLatch>, function: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = self.next_index();
        let core = self.handle();

        // Once the user callable finishes, keep pulling ready tasks out of
        // the pool so a submission hotspot fans out instead of trickling
        // through one queue.
        let wrapped = move || {
            if let Some(core) = core.upgrade() {
                function();
                while core.is_running() && core.run_next_task(index) {}
            }
        };

        let task = match latch {
            Some(latch) => Task::with_latch(wrapped, latch),
            None => Task::new(wrapped),
        };
        self.send_task(task, index)
    }

    fn send_task(&self, task: Task, index: usize) -> Result<(), SubmitError> {
        if !self.is_running() {
            // Dropping the task fires its companion latch.
            return Err(SubmitError);
        }
        let queue = &self.queues[index];
        let task = match queue.try_push(task) {
            Ok(()) => return Ok(()),
            Err(task) => task,
        };
        match queue.push(task, || self.is_running(), WAIT_SLICE) {
            Ok(()) => Ok(()),
            // Dropping the handed-back task fires its companion latch.
            Err(_abandoned) => Err(SubmitError),
        }
    }

    /// Put a deferred task back into circulation, round-robin like any other
    /// submission. During shutdown the push can abandon; the dropped task
    /// then notifies its companion latch.
    fn resubmit(&self, task: Task) {
        let index = self.next_index();
        let queue = &self.queues[index];
        if let Err(task) = queue.try_push(task) {
            let _ = queue.push(task, || self.is_running(), WAIT_SLICE);
        }
    }

    /// One sweep over the pool: own queue first, then every other queue once.
    fn steal_task(&self, index: usize) -> Option<Task> {
        if let Some(task) = self.queues[index].try_pop() {
            return Some(task);
        }
        let count = self.queues.len();
        for offset in 1..count {
            if let Some(task) = self.queues[(index + offset) % count].try_pop() {
                return Some(task);
            }
        }
        None
    }

    /// Pop one task and run it if one can be found anywhere in the pool.
    pub(crate) fn run_next_task(&self, index: usize) -> bool {
        match self.steal_task(index) {
            Some(task) => {
                self.run_task(task);
                true
            }
            None => false,
        }
    }

    /// Sweep the pool, then fall back to a blocking pop on the own queue.
    fn wait_for_task_from_pool(
        &self,
        index: usize,
        keep_going: impl Fn() -> bool,
    ) -> Option<Task> {
        if let Some(task) = self.steal_task(index) {
            return Some(task);
        }
        self.queues[index].pop(keep_going, WAIT_SLICE)
    }

    /// Run one popped task. A task whose companion latch has not fired yet
    /// goes back into the pool instead of blocking this thread on a latch
    /// that may only be released by work queued behind it.
    ///
    /// Returns false when the task was deferred rather than run, so callers
    /// can back off instead of re-popping the same not-ready work in a tight
    /// loop.
    pub(crate) fn run_task(&self, task: Task) -> bool {
        if !task.is_ready() {
            self.resubmit(task);
            return false;
        }
        if let Err(payload) = task.run() {
            // A failed task must not take the worker down with it.
            match &self.fault_handler {
                Some(handler) => handler(payload.as_ref()),
                None => log::warn!("task panicked: {}", panic_message(payload.as_ref())),
            }
        }
        true
    }

    /// Spawn `count` detached helper threads that run pool tasks until the
    /// returned latch fires. This is what lets a pool thread block inside
    /// `wait_for_scope` without starving the pool: each helper stands in for
    /// one blocked thread and retires itself when the scope ends.
    pub fn start_temp_task_runners(&self, count: usize) -> SharedLatch {
        let scope = SharedLatch::new(count);
        for _ in 0..count {
            // A weakly random starting queue spreads the helpers' initial
            // steal targets across the pool.
            let index = fastrand::usize(..self.queues.len());
            let core = self.handle();
            let latch = scope.clone();
            let spawned = thread::Builder::new()
                .name("task-helper".to_string())
                .spawn(move || helper_runner(core, latch, index));
            match spawned {
                // Dropping the join handle detaches the helper; it retires
                // on the latch or when the core goes away.
                Ok(_handle) => {}
                Err(err) => {
                    log::error!("failed to spawn helper thread: {err}");
                    std::process::abort();
                }
            }
        }
        scope
    }

    pub fn am_i_in_pool(&self) -> bool {
        let id = thread::current().id();
        if self.thread_map.lock().contains_key(&id) {
            return true;
        }
        self.helper_threads.lock().contains(&id)
    }

    /// Stop with the blocking mode chosen at construction. Called when the
    /// last public handle goes away.
    pub(crate) fn stop_on_destruction(&self) {
        self.stop(self.block_on_destruction);
    }

    fn register_helper(&self, id: ThreadId) {
        self.helper_threads.lock().push(id);
    }

    fn unregister_helper(&self, id: ThreadId) {
        self.helper_threads.lock().retain(|helper| *helper != id);
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.stop(self.block_on_destruction);
    }
}

/// A permanent pool thread. Owns nothing but its queue index and a weak
/// handle to the core.
struct Worker {
    index: usize,
    core: Weak<Core>,
}

impl Worker {
    fn run(self) {
        log::trace!("worker {} starting", self.index);

        let mut backoff = Backoff::new();
        loop {
            let Some(core) = self.core.upgrade() else {
                break;
            };
            if !core.is_running() {
                break;
            }
            let task = core.wait_for_task_from_pool(self.index, || core.is_running());
            if let Some(task) = task {
                if core.run_task(task) {
                    backoff = Backoff::new();
                } else {
                    // Everything in sight is deferred; yield before sweeping
                    // again so a queue of not-ready tasks doesn't spin hot.
                    backoff.snooze();
                }
            }
        }

        log::trace!("worker {} exiting", self.index);
    }
}

/// Removes the helper's registry entry when the helper thread unwinds or
/// returns.
struct HelperRegistration {
    core: Weak<Core>,
    id: ThreadId,
}

impl Drop for HelperRegistration {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.unregister_helper(self.id);
        }
    }
}

fn helper_runner(core: Weak<Core>, scope: SharedLatch, index: usize) {
    let id = thread::current().id();
    match core.upgrade() {
        Some(strong) => strong.register_helper(id),
        None => return,
    }
    let _registration = HelperRegistration {
        core: core.clone(),
        id,
    };

    log::trace!("helper starting at queue {index}");

    let mut backoff = Backoff::new();
    while !scope.try_wait() {
        let Some(core) = core.upgrade() else {
            return;
        };
        if !core.is_running() {
            return;
        }
        let task =
            core.wait_for_task_from_pool(index, || core.is_running() && !scope.try_wait());
        if let Some(task) = task {
            if core.run_task(task) {
                backoff = Backoff::new();
            } else {
                backoff.snooze();
            }
        }
    }

    log::trace!("helper retiring");
}
