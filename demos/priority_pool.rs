use rand::seq::IndexedRandom;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info};
use workpool::{PoolOptions, Priority, TaskOptions, WorkerPool};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Priority Pool Example ---");

  let options = PoolOptions::new().with_name("priority_pool").with_priority();
  let pool = WorkerPool::new(3, options, Handle::current()).expect("Failed to create pool");
  let priorities = [Priority::Low, Priority::Normal, Priority::High];

  for id in 1..=15 {
    let priority = *priorities.choose(&mut rand::rng()).unwrap_or(&Priority::Normal);
    let submitted = pool
      .submit_with_options(
        move || {
          info!("Task {} ({:?}) starting", id, priority);
          std::thread::sleep(Duration::from_millis(200));
          info!("Task {} ({:?}) finished", id, priority);
          Ok(())
        },
        TaskOptions::new().with_priority(priority),
      )
      .await;
    match submitted {
      Ok(()) => info!("Submitted task {} with priority {:?}", id, priority),
      Err(e) => error!("Failed to submit task {} ({:?}): {}", id, priority, e),
    }
  }

  pool.wait().await;

  let stats = pool.stats();
  info!(
    "Pool stats: running={}, waiting={}, completed={}",
    stats.running_tasks, stats.waiting_tasks, stats.completed_tasks
  );

  pool.close().await;
  info!("--- Priority Pool Example End ---");
}
