use crate::completion::Settle;
use crate::error::PoolError;

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

enum SlotState<T> {
  Pending,
  Ready(Result<T, PoolError>),
  Taken,
}

/// Shared one-shot outcome of a result-bearing task.
///
/// The first `resolve` wins; later calls are no-ops. `done` is cancelled once
/// the outcome is stored, which doubles as the completion signal for any
/// number of waiters.
pub(crate) struct ResultSlot<T> {
  state: Mutex<SlotState<T>>,
  done: CancellationToken,
}

impl<T: Send> ResultSlot<T> {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(SlotState::Pending),
      done: CancellationToken::new(),
    })
  }

  pub(crate) fn resolved(outcome: Result<T, PoolError>) -> Arc<Self> {
    let slot = Self::new();
    slot.resolve(outcome);
    slot
  }

  /// Stores the outcome if none was stored yet. Returns whether this call won.
  pub(crate) fn resolve(&self, outcome: Result<T, PoolError>) -> bool {
    {
      let mut state = self.state.lock();
      if !matches!(*state, SlotState::Pending) {
        return false;
      }
      *state = SlotState::Ready(outcome);
    }
    self.done.cancel();
    true
  }

  pub(crate) fn is_done(&self) -> bool {
    self.done.is_cancelled()
  }

  /// Moves a successful value out. Failures stay in the slot so every read
  /// reports the same error.
  fn take(&self) -> Result<T, PoolError> {
    let mut state = self.state.lock();
    match mem::replace(&mut *state, SlotState::Taken) {
      SlotState::Ready(Ok(value)) => Ok(value),
      SlotState::Ready(Err(error)) => {
        *state = SlotState::Ready(Err(error.clone()));
        Err(error)
      }
      SlotState::Taken => Err(PoolError::ResultUnavailable),
      SlotState::Pending => {
        *state = SlotState::Pending;
        Err(PoolError::ResultUnavailable)
      }
    }
  }
}

impl<T: Send> Settle for ResultSlot<T> {
  fn fail(&self, error: PoolError) {
    self.resolve(Err(error));
  }
}

/// A handle to the eventual outcome of a task submitted through
/// `WorkerPool::submit_func` and friends.
///
/// The handle is owned by the caller; the pool only keeps a reference to the
/// underlying slot until the task resolves it.
pub struct TaskFuture<T: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) slot: Arc<ResultSlot<T>>,
}

impl<T: Send + 'static> fmt::Debug for TaskFuture<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskFuture")
      .field("task_id", &self.task_id)
      .field("done", &self.is_done())
      .finish()
  }
}

impl<T: Send + 'static> TaskFuture<T> {
  pub(crate) fn pending(task_id: u64) -> Self {
    Self {
      task_id,
      slot: ResultSlot::new(),
    }
  }

  /// A future that is already resolved with `error`.
  pub(crate) fn failed(task_id: u64, error: PoolError) -> Self {
    Self {
      task_id,
      slot: ResultSlot::resolved(Err(error)),
    }
  }

  /// Returns the ID of the task this future is bound to.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// Non-blocking check whether the task has reached a terminal state.
  pub fn is_done(&self) -> bool {
    self.slot.is_done()
  }

  /// Waits for the task outcome, or until `token` is cancelled.
  ///
  /// # Errors
  /// Returns `PoolError::ContextCanceled` if `token` fires first; the outcome
  /// stays available for a later call.
  /// Returns `PoolError::ResultUnavailable` if a successful value was already
  /// taken. Otherwise returns the task's own error, on every call (`TaskFailed`, `TaskPanicked`,
  /// `TaskTimeout`, `ContextCanceled`, ...).
  pub async fn get(&mut self, token: &CancellationToken) -> Result<T, PoolError> {
    if !self.slot.is_done() {
      tokio::select! {
        biased;
        _ = self.slot.done.cancelled() => {}
        _ = token.cancelled() => {
          trace!(task_id = %self.task_id, "TaskFuture: get cancelled by caller token.");
          return Err(PoolError::ContextCanceled);
        }
      }
    }
    self.slot.take()
  }

  /// Like [`get`](Self::get), giving up with `PoolError::WaitTimeout` after `timeout`.
  pub async fn get_with_timeout(&mut self, timeout: Duration) -> Result<T, PoolError> {
    if !self.slot.is_done() && tokio::time::timeout(timeout, self.slot.done.cancelled()).await.is_err() {
      trace!(task_id = %self.task_id, ?timeout, "TaskFuture: get timed out.");
      return Err(PoolError::WaitTimeout(timeout));
    }
    self.slot.take()
  }

  /// Waits for the task outcome without a cancellation source.
  pub async fn await_result(mut self) -> Result<T, PoolError> {
    self.slot.done.cancelled().await;
    self.slot.take()
  }
}
