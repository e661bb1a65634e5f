use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Scheduling priority of a task. Only honoured when the pool was built with
/// [`PoolOptions::with_priority`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
  Low = 1,
  #[default]
  Normal = 5,
  High = 10,
}

impl Priority {
  /// Numeric weight; a higher weight is dispatched first.
  pub fn weight(self) -> u8 {
    self as u8
  }
}

/// Callback invoked with the raw payload of a panic trapped inside a task.
pub type PanicHandler = Arc<dyn Fn(&(dyn Any + Send)) + Send + Sync + 'static>;

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

fn default_panic_handler() -> PanicHandler {
  Arc::new(|payload| {
    error!(panic = %panic_message(payload), "Task panicked; panic was trapped by the pool.");
  })
}

/// Pool-wide configuration.
#[derive(Clone)]
pub struct PoolOptions {
  pub(crate) name: String,
  pub(crate) queue_capacity: Option<usize>,
  pub(crate) enable_priority: bool,
  pub(crate) panic_handler: PanicHandler,
}

impl PoolOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Name used in log fields. Defaults to `"workpool"`.
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Capacity of the bounded FIFO queue. Defaults to ten times the pool size.
  /// Ignored in priority mode, whose heap is unbounded.
  pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = Some(capacity);
    self
  }

  /// Enables priority scheduling through a dispatcher.
  pub fn with_priority(mut self) -> Self {
    self.enable_priority = true;
    self
  }

  pub fn with_panic_handler(mut self, handler: impl Fn(&(dyn Any + Send)) + Send + Sync + 'static) -> Self {
    self.panic_handler = Arc::new(handler);
    self
  }

  /// Capacities beyond what the queue's semaphore can hold are clamped.
  pub(crate) fn queue_capacity_for(&self, size: usize) -> usize {
    self
      .queue_capacity
      .unwrap_or(size.saturating_mul(10))
      .clamp(1, Semaphore::MAX_PERMITS)
  }
}

impl Default for PoolOptions {
  fn default() -> Self {
    Self {
      name: "workpool".to_string(),
      queue_capacity: None,
      enable_priority: false,
      panic_handler: default_panic_handler(),
    }
  }
}

impl fmt::Debug for PoolOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PoolOptions")
      .field("name", &self.name)
      .field("queue_capacity", &self.queue_capacity)
      .field("enable_priority", &self.enable_priority)
      .finish_non_exhaustive()
  }
}

/// Per-task options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
  pub(crate) priority: Priority,
  pub(crate) timeout: Option<Duration>,
  pub(crate) token: Option<CancellationToken>,
}

impl TaskOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  /// Execution deadline, measured from the moment a worker starts the task.
  /// A zero duration means no timeout.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = (!timeout.is_zero()).then_some(timeout);
    self
  }

  pub fn with_token(mut self, token: CancellationToken) -> Self {
    self.token = Some(token);
    self
  }

  pub fn priority(&self) -> Priority {
    self.priority
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }
}
