use rand::Rng;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info};
use workpool::{PoolOptions, TaskOptions, WorkerPool};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Timeout Pool Example ---");

  let pool = WorkerPool::new(4, PoolOptions::new().with_name("timeout_pool"), Handle::current())
    .expect("Failed to create pool");
  let timeout = Duration::from_millis(400);

  for id in 1..=12 {
    let work = Duration::from_millis(rand::rng().random_range(1..=5) * 100);
    let submitted = pool
      .submit_with_options(
        move || {
          info!("Task {} starting, expected to take {:?}", id, work);
          std::thread::sleep(work);
          info!("Task {} body returned after {:?}", id, work);
          Ok(())
        },
        TaskOptions::new().with_timeout(timeout),
      )
      .await;
    match submitted {
      Ok(()) => info!("Submitted task {} (work: {:?}, timeout: {:?})", id, work, timeout),
      Err(e) => error!("Failed to submit task {}: {}", id, e),
    }
  }

  pool.wait().await;

  let stats = pool.stats();
  info!(
    "Pool stats: running={}, waiting={}, completed={}, timed out={}",
    stats.running_tasks, stats.waiting_tasks, stats.completed_tasks, stats.timeout_tasks
  );

  pool.close().await;
  info!("--- Timeout Pool Example End ---");
}
