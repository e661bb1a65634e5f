use crate::completion::CompletionTicket;
use crate::error::PoolError;
use crate::handle::ResultSlot;
use crate::options::Priority;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Error type returned by submitted tasks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A type-erased task for `WorkerPool::submit_dyn`. It must box one of
/// [`UnitFn`], [`ValueFn`] or [`FallibleFn`]; anything else is rejected with
/// `PoolError::InvalidTask`.
pub type DynTask = Box<dyn Any + Send>;

/// The value produced by a type-erased task.
pub type DynValue = Box<dyn Any + Send>;

/// A type-erased callable with no result.
pub type UnitFn = Box<dyn FnOnce() + Send>;

/// A type-erased callable producing a single value.
pub type ValueFn = Box<dyn FnOnce() -> DynValue + Send>;

/// A type-erased callable producing a value or an error.
pub type FallibleFn = Box<dyn FnOnce() -> Result<DynValue, BoxError> + Send>;

/// Publishes a successful outcome. Runs on the worker after it has decided the
/// task finished on its own, so a timed-out task never publishes a value.
pub(crate) type Delivery = Box<dyn FnOnce() + Send>;

/// The unit of work a worker runs on the blocking pool.
pub(crate) type Job = Box<dyn FnOnce() -> Result<Delivery, PoolError> + Send>;

fn task_failed(error: BoxError) -> PoolError {
  PoolError::TaskFailed(error.to_string())
}

pub(crate) fn fire_and_forget_job<F>(task: F) -> Job
where
  F: FnOnce() -> Result<(), BoxError> + Send + 'static,
{
  Box::new(move || {
    task().map_err(task_failed)?;
    Ok(Box::new(|| {}) as Delivery)
  })
}

pub(crate) fn result_job<T, F>(task: F, slot: Arc<ResultSlot<T>>) -> Job
where
  T: Send + 'static,
  F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
  Box::new(move || {
    let value = task().map_err(task_failed)?;
    Ok(Box::new(move || {
      slot.resolve(Ok(value));
    }) as Delivery)
  })
}

/// Resolves a type-erased task into a fallible callable without invoking it.
pub(crate) fn classify_dyn(task: DynTask) -> Result<FallibleFn, PoolError> {
  let task = match task.downcast::<FallibleFn>() {
    Ok(f) => return Ok(*f),
    Err(other) => other,
  };
  let task = match task.downcast::<ValueFn>() {
    Ok(f) => {
      let f = *f;
      return Ok(Box::new(move || -> Result<DynValue, BoxError> { Ok(f()) }));
    }
    Err(other) => other,
  };
  match task.downcast::<UnitFn>() {
    Ok(f) => {
      let f = *f;
      Ok(Box::new(move || -> Result<DynValue, BoxError> {
        f();
        Ok(Box::new(()))
      }))
    }
    Err(_) => Err(PoolError::InvalidTask),
  }
}

/// Envelope binding a job to its scheduling and cancellation metadata.
pub(crate) struct TaskWrapper {
  pub(crate) task_id: u64,
  pub(crate) job: Job,
  pub(crate) token: CancellationToken,
  pub(crate) priority: Priority,
  pub(crate) timeout: Option<Duration>,
  pub(crate) submitted_at: Instant,
  pub(crate) ticket: CompletionTicket,
}

impl fmt::Debug for TaskWrapper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskWrapper")
      .field("task_id", &self.task_id)
      .field("priority", &self.priority)
      .field("timeout", &self.timeout)
      .field("cancelled", &self.token.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl TaskWrapper {
  /// Resolves the task as failed without running it. The ticket is dropped
  /// here, which releases the task's slot in the completion counter.
  pub(crate) fn reject(self, error: PoolError) {
    self.ticket.fail(error);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[test]
  fn test_classify_accepts_supported_shapes() {
    let fallible: FallibleFn = Box::new(|| -> Result<DynValue, BoxError> { Ok(Box::new(5u32)) });
    let value = classify_dyn(Box::new(fallible)).unwrap()().unwrap();
    assert_eq!(value.downcast_ref::<u32>(), Some(&5));

    let single: ValueFn = Box::new(|| Box::new("hello") as DynValue);
    let value = classify_dyn(Box::new(single)).unwrap()().unwrap();
    assert_eq!(value.downcast_ref::<&str>(), Some(&"hello"));

    let unit: UnitFn = Box::new(|| {});
    let value = classify_dyn(Box::new(unit)).unwrap()().unwrap();
    assert!(value.downcast_ref::<()>().is_some());
  }

  #[test]
  fn test_classify_propagates_task_error() {
    let fallible: FallibleFn = Box::new(|| -> Result<DynValue, BoxError> { Err("broken".into()) });
    let err = classify_dyn(Box::new(fallible)).unwrap()().unwrap_err();
    assert_eq!(err.to_string(), "broken");
  }

  #[test]
  fn test_classify_rejects_callable_with_argument_without_calling_it() {
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let with_arg: Box<dyn FnOnce(u32) -> DynValue + Send> = Box::new(move |x| {
      flag.store(true, Ordering::SeqCst);
      Box::new(x) as DynValue
    });
    assert_eq!(classify_dyn(Box::new(with_arg)).err(), Some(PoolError::InvalidTask));
    assert!(!called.load(Ordering::SeqCst));

    assert_eq!(classify_dyn(Box::new(42u64)).err(), Some(PoolError::InvalidTask));
  }

  #[test]
  fn test_result_job_delivers_only_when_delivery_runs() {
    let slot = ResultSlot::<u32>::new();
    let job = result_job(|| Ok(9), slot.clone());
    let delivery = job().unwrap();
    assert!(!slot.is_done());
    delivery();
    assert!(slot.is_done());
  }

  #[test]
  fn test_fire_and_forget_job_maps_error() {
    let job = fire_and_forget_job(|| Err("nope".into()));
    assert!(matches!(job(), Err(PoolError::TaskFailed(msg)) if msg == "nope"));
  }
}
