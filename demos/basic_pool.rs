use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info};
use workpool::{PoolOptions, WorkerPool};

fn process_task(id: usize, work_ms: u64, counter: &AtomicUsize) {
  info!("Task {} starting, will work for {}ms", id, work_ms);
  std::thread::sleep(Duration::from_millis(work_ms));
  counter.fetch_add(1, Ordering::SeqCst);
  info!("Task {} finished after {}ms", id, work_ms);
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Pool Example ---");

  let pool = WorkerPool::new(5, PoolOptions::new().with_name("basic_pool"), Handle::current())
    .expect("Failed to create pool");
  let counter = Arc::new(AtomicUsize::new(0));

  for id in 1..=20 {
    let work_ms = rand::rng().random_range(100..=300);
    let counter = counter.clone();
    let submitted = pool
      .submit(move || {
        process_task(id, work_ms, &counter);
        Ok(())
      })
      .await;
    if let Err(e) = submitted {
      error!("Failed to submit task {}: {}", id, e);
    }
  }

  pool.wait().await;

  let stats = pool.stats();
  info!(
    "Pool stats: running={}, waiting={}, completed={}",
    stats.running_tasks, stats.waiting_tasks, stats.completed_tasks
  );

  pool.close().await;
  info!("All tasks done, processed {} in total.", counter.load(Ordering::SeqCst));
  info!("--- Basic Pool Example End ---");
}
