use rand::Rng;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info};
use workpool::{CancellationToken, PoolOptions, TaskFuture, WorkerPool};

#[derive(Debug)]
struct Computation {
  task_id: u64,
  value: u64,
  took: Duration,
}

fn calculate(task_id: u64) -> Computation {
  let took = Duration::from_millis(rand::rng().random_range(100..=400));
  info!("Task {} computing", task_id);
  std::thread::sleep(took);
  Computation {
    task_id,
    value: task_id * task_id,
    took,
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Result Pool Example ---");

  let pool = WorkerPool::new(3, PoolOptions::new().with_name("result_pool"), Handle::current())
    .expect("Failed to create pool");

  let mut futures: Vec<TaskFuture<Computation>> = Vec::new();
  for task_id in 1..=10 {
    futures.push(pool.submit_func(move || Ok(calculate(task_id))).await);
  }

  let token = CancellationToken::new();
  let mut total = 0;
  for mut future in futures {
    match future.get(&token).await {
      Ok(result) => {
        info!("Task {} result: value={}, took={:?}", result.task_id, result.value, result.took);
        total += result.value;
      }
      Err(e) => error!("Task {} failed: {}", future.id(), e),
    }
  }

  let stats = pool.stats();
  info!(
    "Pool stats: running={}, waiting={}, completed={}",
    stats.running_tasks, stats.waiting_tasks, stats.completed_tasks
  );

  pool.close().await;
  info!("All tasks done, sum of results: {}", total);
  info!("--- Result Pool Example End ---");
}
