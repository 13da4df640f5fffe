//! A parallel task-execution engine built around three pieces: a
//! work-stealing scheduler over per-worker bounded queues, count-down
//! latches for completion signaling, and single-assignment future results
//! whose continuations chain into pipelined function streams.
//!
//! What it gives you:
//! - Submit argument-free callables to a fixed pool of workers; each worker
//!   owns a bounded queue and steals from the others when its own runs dry.
//! - Attach a shared latch to a group of tasks and wait for all of them;
//!   latches fire on every exit path, so a panicking or abandoned task can
//!   never strand its waiters.
//! - Block *inside* a pool task through [`TaskScheduler::wait_for_scope`]:
//!   a temporary helper worker stands in for the blocked thread, so waiting
//!   on work running in the same pool cannot deadlock it.
//! - Chain work through [`FutureResult::next`] or compose whole pipelines
//!   with [`make_function_stream`] and the `|` operator.
//!
//! ```
//! use taskstream::{get_task_scheduler, invoke_tasks, make_function_stream};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let scheduler = get_task_scheduler();
//!
//! let count = Arc::new(AtomicUsize::new(0));
//! invoke_tasks(&scheduler, (0..8).map(|_| {
//!     let count = count.clone();
//!     move || { count.fetch_add(1, Ordering::SeqCst); }
//! }));
//! assert_eq!(count.load(Ordering::SeqCst), 8);
//!
//! let pipeline = make_function_stream(&scheduler, |x: i32| x + 1) | (|x: i32| x * 2);
//! assert_eq!(pipeline.call(20).get(), Ok(42));
//! ```

mod core;
mod error;
mod future;
mod helpers;
mod stream;

pub use crate::core::latch::{Latch, NotifyOnDrop, SharedLatch};
pub use crate::core::scheduler::{
    FaultHandler, TaskScheduler, TaskSchedulerBuilder, Waitable,
};
pub use crate::core::sync;
pub use crate::error::{SubmitError, TaskError};
pub use crate::future::{FutureResult, FutureStatus};
pub use crate::helpers::{
    create_waitable_task, get_task_scheduler, invoke_tasks, make_future_result, schedule_task,
    task_group, wait_for_scope,
};
pub use crate::stream::{make_function_stream, FunctionStream};
