use crate::error::PoolError;
use crate::options::{panic_message, PanicHandler};
use crate::task::{Delivery, Job, TaskWrapper};
use crate::task_queue::QueueConsumer;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Aggregate counters shared between the pool facade and its workers.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
  running: AtomicUsize,
  completed: AtomicU64,
  timed_out: AtomicU64,
}

impl PoolCounters {
  pub(crate) fn running(&self) -> usize {
    self.running.load(Ordering::Acquire)
  }

  pub(crate) fn completed(&self) -> u64 {
    self.completed.load(Ordering::Acquire)
  }

  pub(crate) fn timed_out(&self) -> u64 {
    self.timed_out.load(Ordering::Acquire)
  }
}

/// Everything a worker needs to execute tasks.
pub(crate) struct WorkerContext {
  pub(crate) pool_name: Arc<String>,
  pub(crate) counters: PoolCounters,
  panic_handler: PanicHandler,
  tokio_handle: TokioHandle,
}

impl WorkerContext {
  pub(crate) fn new(pool_name: Arc<String>, panic_handler: PanicHandler, tokio_handle: TokioHandle) -> Self {
    Self {
      pool_name,
      counters: PoolCounters::default(),
      panic_handler,
      tokio_handle,
    }
  }
}

/// Where a worker pulls its next task from.
pub(crate) enum TaskSource {
  /// The bounded FIFO queue.
  Queue(Arc<QueueConsumer>),
  /// The dispatcher's routing channel. `idle` holds one permit per idle
  /// worker; the dispatcher takes one before routing a task and the worker
  /// hands it back once the task is done.
  Routed {
    rx: Arc<AsyncMutex<mpsc::Receiver<TaskWrapper>>>,
    idle: Arc<Semaphore>,
  },
}

impl TaskSource {
  async fn next(&self) -> Option<TaskWrapper> {
    match self {
      TaskSource::Queue(consumer) => consumer.recv().await,
      TaskSource::Routed { rx, .. } => rx.lock().await.recv().await,
    }
  }

  fn task_finished(&self) {
    if let TaskSource::Routed { idle, .. } = self {
      idle.add_permits(1);
    }
  }
}

pub(crate) async fn run_worker(worker_id: usize, context: Arc<WorkerContext>, source: TaskSource) {
  info!(pool_name = %*context.pool_name, worker_id, "Worker started.");

  while let Some(task) = source.next().await {
    execute(&context, task).await;
    source.task_finished();
  }

  info!(pool_name = %*context.pool_name, worker_id, "Task source closed and drained. Worker stopped.");
}

/// Runs the job, trapping panics. Executes on the blocking pool.
fn run_guarded(job: Job, panic_handler: &PanicHandler) -> Result<Delivery, PoolError> {
  match catch_unwind(AssertUnwindSafe(job)) {
    Ok(outcome) => outcome,
    Err(payload) => {
      panic_handler(&*payload);
      Err(PoolError::TaskPanicked(panic_message(&*payload)))
    }
  }
}

/// Resolves when the execution scope of a task ends early: the task's token
/// fired (`ContextCanceled`) or its deadline passed (`TaskTimeout`).
async fn interrupted(token: &CancellationToken, timeout: Option<Duration>) -> PoolError {
  let deadline = async {
    match timeout {
      Some(timeout) => tokio::time::sleep(timeout).await,
      None => std::future::pending::<()>().await,
    }
  };
  tokio::select! {
    _ = token.cancelled() => PoolError::ContextCanceled,
    _ = deadline => PoolError::TaskTimeout(timeout.unwrap_or_default()),
  }
}

async fn execute(context: &WorkerContext, task: TaskWrapper) {
  let pool_name = &*context.pool_name;
  let TaskWrapper {
    task_id,
    job,
    token,
    timeout,
    submitted_at,
    ticket,
    ..
  } = task;

  if token.is_cancelled() {
    debug!(pool_name = %pool_name, %task_id, "Dequeued task already cancelled. Skipping execution.");
    ticket.fail(PoolError::ContextCanceled);
    return;
  }

  let counters = &context.counters;
  counters.running.fetch_add(1, Ordering::AcqRel);
  trace!(pool_name = %pool_name, %task_id, queued_for = ?submitted_at.elapsed(), ?timeout, "Starting task.");

  let panic_handler = context.panic_handler.clone();
  let blocking = context
    .tokio_handle
    .spawn_blocking(move || run_guarded(job, &panic_handler));

  // A job that loses the race keeps running on the blocking pool; its late
  // outcome is dropped along with the join handle.
  let outcome = tokio::select! {
    biased;
    joined = blocking => match joined {
      Ok(outcome) => outcome,
      Err(join_error) if join_error.is_panic() => {
        Err(PoolError::TaskPanicked(panic_message(&*join_error.into_panic())))
      }
      Err(join_error) => Err(PoolError::ResultChannelError(join_error.to_string())),
    },
    cause = interrupted(&token, timeout) => Err(cause),
  };

  match outcome {
    Ok(delivery) => {
      delivery();
      counters.completed.fetch_add(1, Ordering::AcqRel);
      trace!(pool_name = %pool_name, %task_id, "Task executed successfully.");
    }
    Err(error) => {
      match &error {
        PoolError::TaskTimeout(after) => {
          counters.timed_out.fetch_add(1, Ordering::AcqRel);
          warn!(pool_name = %pool_name, %task_id, ?after, "Task timed out.");
        }
        PoolError::ContextCanceled => {
          debug!(pool_name = %pool_name, %task_id, "Task cancelled by its token during execution.");
        }
        PoolError::TaskFailed(_) | PoolError::TaskPanicked(_) => {
          counters.completed.fetch_add(1, Ordering::AcqRel);
          debug!(pool_name = %pool_name, %task_id, %error, "Task finished with an error.");
        }
        other => {
          warn!(pool_name = %pool_name, %task_id, error = %other, "Task did not produce an outcome.");
        }
      }
      ticket.fail(error);
    }
  }

  counters.running.fetch_sub(1, Ordering::AcqRel);
  drop(ticket);
}
