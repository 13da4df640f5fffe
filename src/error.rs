use std::any::Any;

use thiserror::Error;

/// Returned when the scheduler cannot accept a submission, either because it
/// is not running or because the target queue stayed full until the wait was
/// abandoned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("unable to add task: the scheduler is stopped or its queue is full")]
pub struct SubmitError;

/// An error stored in a [`FutureResult`](crate::FutureResult).
///
/// Cloneable so that repeated `get` calls observe the same error and so that
/// a chain of futures can propagate one failure to every successor.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The producing callable panicked; carries the panic message.
    #[error("task panicked: {0}")]
    Panic(String),
    /// An error value stored through `set_error`.
    #[error("{0}")]
    Message(String),
    /// A continuation could not be scheduled because the scheduler stopped.
    #[error("continuation rejected: the scheduler is stopped")]
    Rejected,
}

impl TaskError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        TaskError::Panic(panic_message(payload.as_ref()))
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::Message(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::Message(message.to_string())
    }
}

/// Best-effort extraction of the human-readable part of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("opaque panic payload")
    }
}

#[test]
fn task_error_from_panic_payloads() {
    let err = TaskError::from_panic(Box::new("static message"));
    assert_eq!(err, TaskError::Panic("static message".to_string()));

    let err = TaskError::from_panic(Box::new(String::from("owned message")));
    assert_eq!(err, TaskError::Panic("owned message".to_string()));

    let err = TaskError::from_panic(Box::new(42u32));
    assert_eq!(err, TaskError::Panic("opaque panic payload".to_string()));
}
