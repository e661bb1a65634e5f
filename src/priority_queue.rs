use crate::error::PoolError;
use crate::lifecycle::Lifecycle;
use crate::task::TaskWrapper;

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Heap entry ordered by priority weight, then by submission sequence so that
/// equal priorities pop in arrival order.
pub(crate) struct QueuedTask(TaskWrapper);

impl QueuedTask {
  fn key(&self) -> (u8, Reverse<u64>) {
    (self.0.priority.weight(), Reverse(self.0.task_id))
  }
}

impl PartialEq for QueuedTask {
  fn eq(&self, other: &Self) -> bool {
    self.key() == other.key()
  }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl Ord for QueuedTask {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    self.key().cmp(&other.key())
  }
}

/// Unbounded priority heap feeding the dispatcher.
///
/// One lock guards the heap for submitters, the dispatcher and stats readers.
/// Pushes re-check the pool lifecycle under that lock, so nothing can be
/// pushed after the dispatcher has observed "closing and empty" and exited.
#[derive(Default)]
pub(crate) struct PriorityQueue {
  heap: Mutex<BinaryHeap<QueuedTask>>,
  wake: Notify,
}

impl fmt::Debug for PriorityQueue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PriorityQueue")
      .field("len", &self.len())
      .finish_non_exhaustive()
  }
}

impl PriorityQueue {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn push(&self, task: TaskWrapper, lifecycle: &Lifecycle) -> Result<(), PoolError> {
    {
      let mut heap = self.heap.lock();
      if lifecycle.is_closing() {
        drop(heap);
        task.reject(PoolError::PoolClosed);
        return Err(PoolError::PoolClosed);
      }
      heap.push(QueuedTask(task));
    }
    self.wake.notify_one();
    Ok(())
  }

  pub(crate) fn pop(&self) -> Option<TaskWrapper> {
    self.heap.lock().pop().map(|queued| queued.0)
  }

  pub(crate) fn len(&self) -> usize {
    self.heap.lock().len()
  }

  /// Wakes the dispatcher so it re-evaluates the lifecycle.
  pub(crate) fn wake(&self) {
    self.wake.notify_one();
  }

  /// Waits until the heap holds work. Returns `false` once the pool is closing
  /// and the heap is empty, i.e. when the dispatcher should exit.
  pub(crate) async fn wait_for_work(&self, lifecycle: &Lifecycle) -> bool {
    loop {
      {
        let heap = self.heap.lock();
        if !heap.is_empty() {
          return true;
        }
        if lifecycle.is_closing() {
          return false;
        }
      }
      // `notify_one` stores a permit when nobody is waiting, so a push that
      // lands between the check above and this await is not lost.
      self.wake.notified().await;
    }
  }

  pub(crate) fn drain(&self) -> Vec<TaskWrapper> {
    self.heap.lock().drain().map(|queued| queued.0).collect()
  }
}
