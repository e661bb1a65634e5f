use crate::error::PoolError;
use crate::lifecycle::Lifecycle;
use crate::priority_queue::PriorityQueue;
use crate::task::TaskWrapper;

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, trace};

/// Pops the highest-priority task whose token has not fired. Cancelled tasks
/// met on the way are resolved without running.
fn next_live_task(pool_name: &str, queue: &PriorityQueue) -> Option<TaskWrapper> {
  while let Some(task) = queue.pop() {
    if task.token.is_cancelled() {
      debug!(pool_name = %pool_name, task_id = task.task_id, "Queued task cancelled before dispatch.");
      task.reject(PoolError::ContextCanceled);
      continue;
    }
    return Some(task);
  }
  None
}

/// Routes prioritized tasks to idle workers until the pool is closing and the
/// heap is drained.
///
/// A task is only popped after an idle worker has been reserved, so it is
/// handed off immediately and a higher-priority task submitted later is never
/// stuck behind one the dispatcher is holding.
pub(crate) async fn run_dispatcher(
  pool_name: Arc<String>,
  queue: Arc<PriorityQueue>,
  lifecycle: Arc<Lifecycle>,
  route_tx: mpsc::Sender<TaskWrapper>,
  idle: Arc<Semaphore>,
) {
  info!(pool_name = %*pool_name, "Dispatcher started.");

  while queue.wait_for_work(&lifecycle).await {
    let permit = match idle.acquire().await {
      Ok(permit) => permit,
      Err(_) => {
        error!(pool_name = %*pool_name, "Idle-worker semaphore closed. Dispatcher exiting.");
        break;
      }
    };

    let Some(task) = next_live_task(&pool_name, &queue) else {
      continue;
    };
    // The worker returns the permit once it has finished the task.
    permit.forget();

    let task_id = task.task_id;
    trace!(pool_name = %*pool_name, %task_id, priority = ?task.priority, "Dispatching task.");
    if let Err(mpsc::error::SendError(task)) = route_tx.send(task).await {
      error!(pool_name = %*pool_name, %task_id, "All workers are gone. Dispatcher exiting.");
      task.reject(PoolError::PoolClosed);
      break;
    }
  }

  // Only reachable with leftovers if the workers vanished.
  let leftovers = queue.drain();
  if !leftovers.is_empty() {
    error!(pool_name = %*pool_name, count = leftovers.len(), "Rejecting tasks left in the priority queue.");
    for task in leftovers {
      task.reject(PoolError::PoolClosed);
    }
  }

  info!(pool_name = %*pool_name, "Priority queue drained. Dispatcher stopped.");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::completion::{CompletionCounter, CompletionTicket};
  use crate::options::Priority;
  use crate::task::fire_and_forget_job;
  use std::time::{Duration, Instant};
  use tokio::sync::Mutex as AsyncMutex;
  use tokio_util::sync::CancellationToken;

  fn wrapper(counter: &Arc<CompletionCounter>, task_id: u64, priority: Priority) -> TaskWrapper {
    TaskWrapper {
      task_id,
      job: fire_and_forget_job(|| Ok(())),
      token: CancellationToken::new(),
      priority,
      timeout: None,
      submitted_at: Instant::now(),
      ticket: CompletionTicket::issue(counter, None),
    }
  }

  #[tokio::test]
  async fn test_dispatcher_routes_in_priority_order_and_skips_cancelled() {
    let counter = CompletionCounter::new();
    let lifecycle = Arc::new(Lifecycle::default());
    let queue = Arc::new(PriorityQueue::new());
    let idle = Arc::new(Semaphore::new(1));
    let (route_tx, route_rx) = mpsc::channel(1);
    let route_rx = Arc::new(AsyncMutex::new(route_rx));

    queue.push(wrapper(&counter, 1, Priority::Low), &lifecycle).unwrap();
    queue.push(wrapper(&counter, 2, Priority::High), &lifecycle).unwrap();
    let cancelled = wrapper(&counter, 3, Priority::High);
    cancelled.token.cancel();
    queue.push(cancelled, &lifecycle).unwrap();
    queue.push(wrapper(&counter, 4, Priority::Normal), &lifecycle).unwrap();

    let dispatcher = tokio::spawn(run_dispatcher(
      Arc::new("dispatcher_test".to_string()),
      queue.clone(),
      lifecycle.clone(),
      route_tx,
      idle.clone(),
    ));

    let mut order = Vec::new();
    for _ in 0..3 {
      let task = tokio::time::timeout(Duration::from_millis(200), async { route_rx.lock().await.recv().await })
        .await
        .expect("dispatcher should route the next task")
        .expect("routing channel open");
      order.push(task.task_id);
      // Act as a worker finishing the task.
      idle.add_permits(1);
    }
    assert_eq!(order, vec![2, 4, 1]);

    lifecycle.begin_close();
    queue.wake();
    tokio::time::timeout(Duration::from_millis(200), dispatcher)
      .await
      .expect("dispatcher should exit once closing and empty")
      .unwrap();
    assert!(route_rx.lock().await.recv().await.is_none());
    assert_eq!(counter.pending(), 0);
  }
}
