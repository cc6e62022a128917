//! Error taxonomy shared by the queue-based components
//!
//! - [`SubmitError`] - synchronous submission failures (never retried by the framework)
//! - [`ContextError`] - cooperative cancellation and deadline expiry
//! - [`TaskError`] - per-job / per-item failure delivered on result paths

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Submission was refused before any work happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The bounded queue has no free slot
    #[error("queue is full")]
    QueueFull,

    /// The component is stopping or stopped
    #[error("shutting down, not accepting submissions")]
    ShuttingDown,
}

/// A blocking wait ended because of the caller's context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The cancellation token fired
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Failure of a single job, batch item, or stage invocation
///
/// Clonable so one batch failure can be handed to every item in the batch.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The deadline elapsed; carries the time budget the work had, when known
    #[error("deadline exceeded{}", budget_suffix(.0))]
    DeadlineExceeded(Option<Duration>),

    /// The caller cancelled the work
    #[error("cancelled")]
    Cancelled,

    /// Caller-supplied code panicked; the worker survived
    #[error("panicked: {0}")]
    Panicked(String),

    /// Caller-supplied code returned an error
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    /// A batch processor returned fewer results than items and skipped this one
    #[error("batch processor returned no result for this item")]
    MissingResult,

    /// The work could not be enqueued
    #[error("rejected: {0}")]
    Rejected(#[from] SubmitError),
}

impl TaskError {
    /// Wrap an arbitrary error as a task failure
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    /// Whether this error came from a deadline
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}

impl From<ContextError> for TaskError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded(None),
        }
    }
}

fn budget_suffix(budget: &Option<Duration>) -> String {
    budget
        .map(|budget| format!(" after {budget:?}"))
        .unwrap_or_default()
}

/// Render a panic payload captured by `catch_unwind`
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display() {
        assert_eq!(
            TaskError::Rejected(SubmitError::QueueFull).to_string(),
            "rejected: queue is full"
        );
        assert_eq!(
            TaskError::failed(anyhow::anyhow!("boom")).to_string(),
            "boom"
        );
        assert!(TaskError::DeadlineExceeded(Some(Duration::from_millis(5))).is_deadline_exceeded());
        assert_eq!(
            TaskError::DeadlineExceeded(Some(Duration::from_millis(5))).to_string(),
            "deadline exceeded after 5ms"
        );
    }

    #[test]
    fn test_context_error_conversion() {
        assert!(matches!(
            TaskError::from(ContextError::Cancelled),
            TaskError::Cancelled
        ));
        let err = TaskError::from(ContextError::DeadlineExceeded);
        assert!(err.is_deadline_exceeded());
        assert_eq!(err.to_string(), "deadline exceeded");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
