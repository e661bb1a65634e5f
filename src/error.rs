use std::time::Duration;

use thiserror::Error;

/// Errors that can occur within the `workpool` pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Pool size must be greater than zero, got {0}")]
  InvalidSize(usize),

  #[error("Pool is closing or already closed, cannot accept new tasks")]
  PoolClosed,

  #[error("Task cancellation token was cancelled")]
  ContextCanceled,

  #[error("Task execution timed out after {0:?}")]
  TaskTimeout(Duration),

  #[error("Task must not be empty")]
  NilTask,

  #[error("Task must be a zero-argument callable returning nothing, a value, or a value-or-error result")]
  InvalidTask,

  #[error("Task returned an error: {0}")]
  TaskFailed(String),

  #[error("Task panicked: {0}")]
  TaskPanicked(String),

  #[error("Timed out after {0:?} waiting for the task result")]
  WaitTimeout(Duration),

  #[error("Task result already taken")]
  ResultUnavailable,

  #[error("Task result channel error (task was dropped or aborted before producing an outcome): {0}")]
  ResultChannelError(String),
}
