//! A Tokio-backed bounded worker pool with optional priority scheduling,
//! per-task timeouts, cooperative cancellation, panic isolation and result
//! futures.

mod completion;
mod dispatcher;
mod error;
mod handle;
mod lifecycle;
mod manager;
mod options;
mod priority_queue;
mod task;
mod task_queue;
mod worker;

pub use error::PoolError;
pub use handle::TaskFuture;
pub use lifecycle::PoolState;
pub use manager::{PoolStats, WorkerPool};
pub use options::{panic_message, PanicHandler, PoolOptions, Priority, TaskOptions};
pub use task::{BoxError, DynTask, DynValue, FallibleFn, UnitFn, ValueFn};

pub use tokio_util::sync::CancellationToken;
