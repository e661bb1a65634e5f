use crate::completion::{CompletionCounter, CompletionTicket, Settle};
use crate::dispatcher::run_dispatcher;
use crate::error::PoolError;
use crate::handle::TaskFuture;
use crate::lifecycle::{Lifecycle, PoolState};
use crate::options::{PoolOptions, TaskOptions};
use crate::priority_queue::PriorityQueue;
use crate::task::{classify_dyn, fire_and_forget_job, result_job, BoxError, DynTask, DynValue, Job, TaskWrapper};
use crate::task_queue::{QueueProducer, TaskQueue};
use crate::worker::{run_worker, TaskSource, WorkerContext};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Point-in-time snapshot of a pool's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
  /// Maximum number of tasks executing at once.
  pub size: usize,
  pub running_tasks: usize,
  /// Tasks in the FIFO queue or the priority heap.
  pub waiting_tasks: usize,
  /// Tasks that ran to their own completion, including failed and panicked ones.
  pub completed_tasks: u64,
  pub timeout_tasks: u64,
}

enum Scheduling {
  Fifo(QueueProducer),
  Priority(Arc<PriorityQueue>),
}

struct PoolHandles {
  dispatcher: Option<JoinHandle<()>>,
  workers: Vec<JoinHandle<()>>,
}

/// A bounded worker pool.
///
/// `size` workers execute tasks on the Tokio blocking pool, one task per worker
/// at a time. Without priority scheduling, tasks wait in a bounded FIFO queue
/// and submitters are throttled when it is full. With priority scheduling,
/// tasks wait in an unbounded heap and a dispatcher routes the highest-priority,
/// earliest-submitted task to the next idle worker.
pub struct WorkerPool {
  pool_name: Arc<String>,
  size: usize,
  scheduling: Scheduling,
  lifecycle: Arc<Lifecycle>,
  completion: Arc<CompletionCounter>,
  context: Arc<WorkerContext>,
  next_task_id: AtomicU64,
  join_handles: Mutex<Option<PoolHandles>>,
}

impl fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.pool_name)
      .field("state", &self.state())
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}

fn spawn_worker(
  tokio_handle: &TokioHandle,
  worker_id: usize,
  context: &Arc<WorkerContext>,
  source: TaskSource,
) -> JoinHandle<()> {
  let span = info_span!("workpool_worker", pool_name = %*context.pool_name, worker_id);
  tokio_handle.spawn(run_worker(worker_id, context.clone(), source).instrument(span))
}

impl WorkerPool {
  /// Creates a pool of `size` workers spawned on `tokio_handle`.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidSize` if `size` is zero.
  pub fn new(size: usize, options: PoolOptions, tokio_handle: TokioHandle) -> Result<Arc<Self>, PoolError> {
    if size == 0 {
      return Err(PoolError::InvalidSize(size));
    }

    let pool_name = Arc::new(options.name.clone());
    let context = Arc::new(WorkerContext::new(
      pool_name.clone(),
      options.panic_handler.clone(),
      tokio_handle.clone(),
    ));
    let lifecycle = Arc::new(Lifecycle::default());
    let mut workers = Vec::with_capacity(size);

    let (scheduling, dispatcher) = if options.enable_priority {
      let queue = Arc::new(PriorityQueue::new());
      let (route_tx, route_rx) = mpsc::channel(size);
      let idle = Arc::new(Semaphore::new(size));

      let dispatcher = tokio_handle.spawn(
        run_dispatcher(pool_name.clone(), queue.clone(), lifecycle.clone(), route_tx, idle.clone())
          .instrument(info_span!("workpool_dispatcher", pool_name = %*pool_name)),
      );

      let route_rx = Arc::new(AsyncMutex::new(route_rx));
      for worker_id in 0..size {
        let source = TaskSource::Routed {
          rx: route_rx.clone(),
          idle: idle.clone(),
        };
        workers.push(spawn_worker(&tokio_handle, worker_id, &context, source));
      }
      (Scheduling::Priority(queue), Some(dispatcher))
    } else {
      let (producer, consumer) = TaskQueue::new(options.queue_capacity_for(size)).split();
      let consumer = Arc::new(consumer);
      for worker_id in 0..size {
        workers.push(spawn_worker(&tokio_handle, worker_id, &context, TaskSource::Queue(consumer.clone())));
      }
      (Scheduling::Fifo(producer), None)
    };

    info!(
      pool_name = %*pool_name,
      size,
      priority = options.enable_priority,
      queue_capacity = options.queue_capacity_for(size),
      "Worker pool started."
    );

    Ok(Arc::new(Self {
      pool_name,
      size,
      scheduling,
      lifecycle,
      completion: CompletionCounter::new(),
      context,
      next_task_id: AtomicU64::new(0),
      join_handles: Mutex::new(Some(PoolHandles { dispatcher, workers })),
    }))
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn size(&self) -> usize {
    self.size
  }

  /// Submits a task with normal priority, no timeout and no cancellation.
  ///
  /// Waits for a free queue slot when the FIFO queue is full.
  pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
  where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
  {
    self.submit_with_options(task, TaskOptions::default()).await
  }

  /// Submits a task bound to `token`. Cancelling the token before the task
  /// starts skips it; cancelling it while the task runs reports
  /// `ContextCanceled`.
  ///
  /// With priority scheduling, a task cancelled while queued stays in the heap
  /// (and in `waiting_tasks`) until the dispatcher pops it for an idle worker,
  /// and only then is it resolved as `ContextCanceled`.
  pub async fn submit_with_token<F>(&self, token: CancellationToken, task: F) -> Result<(), PoolError>
  where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
  {
    self
      .submit_with_options(task, TaskOptions::default().with_token(token))
      .await
  }

  pub async fn submit_with_options<F>(&self, task: F, options: TaskOptions) -> Result<(), PoolError>
  where
    F: FnOnce() -> Result<(), BoxError> + Send + 'static,
  {
    let task_id = self.next_task_id();
    self.enqueue(task_id, fire_and_forget_job(task), None, options).await
  }

  /// Submits a result-bearing task and returns a future for its outcome.
  ///
  /// Submission errors (`PoolClosed`, `ContextCanceled`) resolve the returned
  /// future instead of being returned.
  pub async fn submit_func<T, F>(&self, task: F) -> TaskFuture<T>
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
  {
    self.submit_func_with_options(task, TaskOptions::default()).await
  }

  pub async fn submit_func_with_token<T, F>(&self, token: CancellationToken, task: F) -> TaskFuture<T>
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
  {
    self
      .submit_func_with_options(task, TaskOptions::default().with_token(token))
      .await
  }

  pub async fn submit_func_with_options<T, F>(&self, task: F, options: TaskOptions) -> TaskFuture<T>
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
  {
    let task_id = self.next_task_id();
    self.submit_result(task_id, task, options).await
  }

  /// Submits a type-erased result-bearing task.
  ///
  /// `None` resolves the future with `PoolError::NilTask`; a task that is not
  /// one of the supported callable shapes resolves it with
  /// `PoolError::InvalidTask` without being invoked.
  pub async fn submit_dyn(&self, task: Option<DynTask>) -> TaskFuture<DynValue> {
    self.submit_dyn_with_options(task, TaskOptions::default()).await
  }

  pub async fn submit_dyn_with_options(&self, task: Option<DynTask>, options: TaskOptions) -> TaskFuture<DynValue> {
    let task_id = self.next_task_id();
    let Some(task) = task else {
      warn!(pool_name = %*self.pool_name, %task_id, "Submit: rejected empty task.");
      return TaskFuture::failed(task_id, PoolError::NilTask);
    };
    match classify_dyn(task) {
      Ok(callable) => self.submit_result(task_id, callable, options).await,
      Err(error) => {
        warn!(pool_name = %*self.pool_name, %task_id, %error, "Submit: rejected task with unsupported signature.");
        TaskFuture::failed(task_id, error)
      }
    }
  }

  /// Waits until every task submitted so far has reached a terminal state.
  pub async fn wait(&self) {
    self.completion.wait().await;
  }

  /// Number of accepted tasks that have not reached a terminal state yet.
  pub fn pending_tasks(&self) -> usize {
    self.completion.pending()
  }

  /// Stops accepting tasks, drains queued work and waits for the dispatcher
  /// and workers to exit.
  ///
  /// Idempotent. Only the first caller runs the shutdown sequence; concurrent
  /// callers return once shutdown has been initiated.
  pub async fn close(&self) {
    if self.begin_close() {
      info!(pool_name = %*self.pool_name, "Closing pool. Draining queued tasks.");
    } else {
      trace!(pool_name = %*self.pool_name, "Close already initiated by another call or Drop.");
    }

    // Take the handles out of the lock before awaiting them.
    let handles = self.join_handles.lock().take();
    let Some(handles) = handles else {
      trace!(pool_name = %*self.pool_name, "Join handles already taken by a concurrent close.");
      return;
    };

    if let Some(dispatcher) = handles.dispatcher {
      if let Err(join_error) = dispatcher.await {
        error!(pool_name = %*self.pool_name, "Error joining dispatcher during close: {:?}", join_error);
      }
    }
    for joined in futures::future::join_all(handles.workers).await {
      if let Err(join_error) = joined {
        error!(pool_name = %*self.pool_name, "Error joining worker during close: {:?}", join_error);
      }
    }

    self.lifecycle.mark_closed();
    info!(pool_name = %*self.pool_name, "Pool closed.");
  }

  /// Returns `true` once closing has begun.
  pub fn is_closed(&self) -> bool {
    self.lifecycle.is_closing()
  }

  pub fn state(&self) -> PoolState {
    self.lifecycle.state()
  }

  pub fn stats(&self) -> PoolStats {
    let counters = &self.context.counters;
    PoolStats {
      size: self.size,
      running_tasks: counters.running(),
      waiting_tasks: match &self.scheduling {
        Scheduling::Fifo(producer) => producer.len(),
        Scheduling::Priority(queue) => queue.len(),
      },
      completed_tasks: counters.completed(),
      timeout_tasks: counters.timed_out(),
    }
  }

  fn next_task_id(&self) -> u64 {
    self.next_task_id.fetch_add(1, AtomicOrdering::Relaxed)
  }

  /// Flips Open → Closing and signals the task source. Returns whether this
  /// call performed the transition.
  fn begin_close(&self) -> bool {
    if !self.lifecycle.begin_close() {
      return false;
    }
    match &self.scheduling {
      Scheduling::Fifo(producer) => producer.close(),
      Scheduling::Priority(queue) => queue.wake(),
    }
    true
  }

  async fn submit_result<T, F>(&self, task_id: u64, task: F, options: TaskOptions) -> TaskFuture<T>
  where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
  {
    let future = TaskFuture::pending(task_id);
    let job = result_job(task, future.slot.clone());
    let sink: Arc<dyn Settle> = future.slot.clone();
    if let Err(error) = self.enqueue(task_id, job, Some(sink), options).await {
      future.slot.resolve(Err(error));
    }
    future
  }

  async fn enqueue(
    &self,
    task_id: u64,
    job: Job,
    sink: Option<Arc<dyn Settle>>,
    options: TaskOptions,
  ) -> Result<(), PoolError> {
    if self.lifecycle.is_closing() {
      warn!(pool_name = %*self.pool_name, %task_id, "Submit: Attempted to submit task to a pool that is closing or closed.");
      return Err(PoolError::PoolClosed);
    }

    let token = options.token.unwrap_or_default();
    if token.is_cancelled() {
      debug!(pool_name = %*self.pool_name, %task_id, "Submit: task token already cancelled.");
      return Err(PoolError::ContextCanceled);
    }

    let task = TaskWrapper {
      task_id,
      job,
      token,
      priority: options.priority,
      timeout: options.timeout,
      submitted_at: Instant::now(),
      ticket: CompletionTicket::issue(&self.completion, sink),
    };
    debug!(
      pool_name = %*self.pool_name,
      %task_id,
      priority = ?task.priority,
      timeout = ?task.timeout,
      "Submitting task to queue."
    );

    let result = match &self.scheduling {
      Scheduling::Fifo(producer) => producer.send(task).await,
      Scheduling::Priority(queue) => queue.push(task, &self.lifecycle),
    };
    if let Err(error) = &result {
      warn!(pool_name = %*self.pool_name, %task_id, %error, "Submit: task rejected while enqueuing.");
    }
    result
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    // Signal shutdown without waiting; workers and the dispatcher finish the
    // queued work and exit on their own.
    if self.begin_close() {
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool dropped. Initiating implicit shutdown (no new tasks, draining queue)."
      );
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}
