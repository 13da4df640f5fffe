//! Function streams: statically composed chains of callables whose stages
//! are connected by future continuations.
//!
//! Invoking a stream returns immediately with the future of the last
//! stage's result; every stage runs as its own pool task, chained on the
//! previous stage's future. Because each invocation materializes its own
//! chain, independent invocations pipeline: a slow second stage of one call
//! does not hold up the first stage of the next.

use std::ops::BitOr;

use crate::core::scheduler::TaskScheduler;
use crate::core::sync::Arc;
use crate::future::FutureResult;

type Launcher<In, Out> = Arc<dyn Fn(FutureResult<In>) -> FutureResult<Out> + Send + Sync>;

/// A reusable chain of stages `f1, …, fk` over a scheduler. Calling it with
/// `x` yields the future of `fk(…f1(x)…)`.
pub struct FunctionStream<In, Out> {
    scheduler: TaskScheduler,
    launch: Launcher<In, Out>,
}

impl<In, Out> Clone for FunctionStream<In, Out> {
    fn clone(&self) -> Self {
        FunctionStream {
            scheduler: self.scheduler.clone(),
            launch: Arc::clone(&self.launch),
        }
    }
}

impl<In, Out> FunctionStream<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// Append a stage, consuming the stream and yielding the longer one.
    pub fn then<G, Next>(self, stage: G) -> FunctionStream<In, Next>
    where
        G: Fn(Out) -> Next + Send + Sync + 'static,
        Out: Clone,
        Next: Send + 'static,
    {
        let launch = self.launch;
        let stage = Arc::new(stage);
        FunctionStream {
            scheduler: self.scheduler,
            launch: Arc::new(move |input| {
                let stage = Arc::clone(&stage);
                launch(input).next(move |value| stage(value))
            }),
        }
    }

    /// Start one invocation of the stream.
    pub fn call(&self, input: In) -> FutureResult<Out> {
        (self.launch)(FutureResult::resolved(&self.scheduler, input))
    }
}

/// Begin a stream with its first stage. Further stages attach through
/// [`then`](FunctionStream::then) or the `|` operator:
///
/// ```
/// use taskstream::{get_task_scheduler, make_function_stream};
///
/// let scheduler = get_task_scheduler();
/// let stream = make_function_stream(&scheduler, |x: i32| 2 * x)
///     | (|x: i32| 3 * x)
///     | (|x: i32| 4 * x);
/// assert_eq!(stream.call(3).get(), Ok(72));
/// ```
pub fn make_function_stream<F, In, Out>(
    scheduler: &TaskScheduler,
    first: F,
) -> FunctionStream<In, Out>
where
    F: Fn(In) -> Out + Send + Sync + 'static,
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    let first = Arc::new(first);
    FunctionStream {
        scheduler: scheduler.clone(),
        launch: Arc::new(move |input: FutureResult<In>| {
            let first = Arc::clone(&first);
            input.next(move |value| first(value))
        }),
    }
}

impl<In, Out, G, Next> BitOr<G> for FunctionStream<In, Out>
where
    G: Fn(Out) -> Next + Send + Sync + 'static,
    In: Send + 'static,
    Out: Clone + Send + 'static,
    Next: Send + 'static,
{
    type Output = FunctionStream<In, Next>;

    fn bitor(self, stage: G) -> FunctionStream<In, Next> {
        self.then(stage)
    }
}

/// The future-valued analog of [`task_group`](crate::task_group): starts
/// every callable on the pool at once and yields the tuple of their futures.
#[macro_export]
macro_rules! future_result_group {
    ($scheduler:expr, $($task:expr),+ $(,)?) => {
        ( $( $crate::make_future_result($scheduler, $task) ),+ , )
    };
}

#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn test_scheduler(num_threads: usize) -> TaskScheduler {
    let scheduler = TaskScheduler::new(num_threads, true);
    scheduler.start();
    scheduler
}

#[test]
fn stages_compose_left_to_right() {
    let scheduler = test_scheduler(2);

    let stream = make_function_stream(&scheduler, |x: i32| 2 * x)
        | (|x: i32| 3 * x)
        | (|x: i32| 4 * x);
    assert_eq!(stream.call(3).get(), Ok(72));

    scheduler.stop(true);
}

#[test]
fn a_stream_is_reusable_and_pipelines() {
    let scheduler = test_scheduler(4);

    let stream = make_function_stream(&scheduler, |x: u64| x + 1).then(|x: u64| {
        // A deliberately slow second stage; overlapping invocations must
        // still each see their own value.
        std::thread::sleep(Duration::from_millis(20));
        x * 10
    });

    let futures: Vec<_> = (0..8u64).map(|x| stream.call(x)).collect();
    for (x, future) in futures.iter().enumerate() {
        assert_eq!(future.get(), Ok((x as u64 + 1) * 10));
    }

    scheduler.stop(true);
}

#[test]
fn a_failing_stage_poisons_the_invocation() {
    use crate::error::TaskError;

    let scheduler = test_scheduler(2);

    let stream = make_function_stream(&scheduler, |x: i32| {
        if x < 0 {
            panic!("negative input");
        }
        x
    })
    .then(|x: i32| x + 1);

    assert_eq!(stream.call(1).get(), Ok(2));
    assert_eq!(
        stream.call(-1).get(),
        Err(TaskError::Panic("negative input".to_string()))
    );

    scheduler.stop(true);
}

#[test]
fn future_group_yields_a_tuple_of_results() {
    let scheduler = test_scheduler(2);

    let (doubled, greeting) = future_result_group!(
        &scheduler,
        || 2 * 21,
        || "hello".to_string(),
    );
    assert_eq!(doubled.get(), Ok(42));
    assert_eq!(greeting.get(), Ok("hello".to_string()));

    scheduler.stop(true);
}
