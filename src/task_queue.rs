use crate::error::PoolError;
use crate::task::TaskWrapper;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};

/// An internal message type that pairs a task with the permit it holds.
///
/// The permit is released when the message is dropped, which happens as soon
/// as a worker has received it. A queue slot is therefore only freed once its
/// task has been fully dequeued.
pub(crate) struct QueueMessage {
  task: TaskWrapper,
  _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for QueueMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueMessage")
      .field("task_id", &self.task.task_id)
      .finish_non_exhaustive()
  }
}

/// A bounded FIFO queue for tasks.
///
/// A semaphore acts as the capacity gate on top of an unbounded channel. This
/// gives submitters backpressure while the channel itself never blocks.
#[derive(Debug)]
pub(crate) struct TaskQueue {
  tx: mpsc::UnboundedSender<QueueMessage>,
  rx: mpsc::UnboundedReceiver<QueueMessage>,
  gate: Arc<Semaphore>,
  capacity: usize,
}

impl TaskQueue {
  /// Creates a new `TaskQueue` with a specified capacity.
  pub(crate) fn new(capacity: usize) -> Self {
    let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      tx,
      rx,
      gate: Arc::new(Semaphore::new(capacity)),
      capacity,
    }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer, QueueConsumer) {
    (
      QueueProducer {
        tx: Mutex::new(Some(self.tx)),
        gate: self.gate,
        capacity: self.capacity,
      },
      QueueConsumer {
        rx: AsyncMutex::new(self.rx),
      },
    )
  }
}

/// The producer half, shared by every submission site of a pool.
pub(crate) struct QueueProducer {
  tx: Mutex<Option<mpsc::UnboundedSender<QueueMessage>>>,
  gate: Arc<Semaphore>,
  capacity: usize,
}

/// The consumer half, shared by all workers of a pool. Workers take turns
/// holding the receiver, which keeps dequeue order FIFO.
#[derive(Debug)]
pub(crate) struct QueueConsumer {
  rx: AsyncMutex<mpsc::UnboundedReceiver<QueueMessage>>,
}

impl fmt::Debug for QueueProducer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("capacity", &self.capacity)
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl QueueProducer {
  /// Sends a task into the queue.
  ///
  /// Waits for a free slot when the queue is full. Gives up with
  /// `ContextCanceled` if the task's token fires while waiting, or with
  /// `PoolClosed` if the queue is closed. On failure the task is rejected
  /// (its future failed, its completion ticket released) before returning.
  pub(crate) async fn send(&self, task: TaskWrapper) -> Result<(), PoolError> {
    let token = task.token.clone();
    let permit = tokio::select! {
      biased;
      _ = token.cancelled() => {
        task.reject(PoolError::ContextCanceled);
        return Err(PoolError::ContextCanceled);
      }
      acquired = self.gate.clone().acquire_owned() => match acquired {
        Ok(permit) => permit,
        Err(_) => {
          task.reject(PoolError::PoolClosed);
          return Err(PoolError::PoolClosed);
        }
      },
    };

    let message = QueueMessage { task, _permit: permit };
    let guard = self.tx.lock();
    let Some(tx) = guard.as_ref() else {
      drop(guard);
      message.task.reject(PoolError::PoolClosed);
      return Err(PoolError::PoolClosed);
    };
    tx.send(message).map_err(|rejected| {
      rejected.0.task.reject(PoolError::PoolClosed);
      PoolError::PoolClosed
    })
  }

  /// Closes the queue. Pending senders fail with `PoolClosed`; tasks already
  /// queued stay receivable, and the consumer sees the end of the queue once
  /// they are drained.
  pub(crate) fn close(&self) {
    self.gate.close();
    self.tx.lock().take();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.lock().is_none()
  }

  /// Returns the number of tasks waiting in the queue.
  pub(crate) fn len(&self) -> usize {
    self.capacity.saturating_sub(self.gate.available_permits())
  }
}

impl QueueConsumer {
  /// Receives the next task, or `None` once the queue is closed and drained.
  ///
  /// The permit inside the received message is dropped here, freeing a slot.
  pub(crate) async fn recv(&self) -> Option<TaskWrapper> {
    let mut rx = self.rx.lock().await;
    rx.recv().await.map(|message| message.task)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::completion::{CompletionCounter, CompletionTicket};
  use crate::options::Priority;
  use crate::task::fire_and_forget_job;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::{Duration, Instant};
  use tokio_util::sync::CancellationToken;

  // Helper to create a dummy TaskWrapper for testing the queue.
  fn dummy_task(counter: &Arc<CompletionCounter>, id: u64) -> TaskWrapper {
    TaskWrapper {
      task_id: id,
      job: fire_and_forget_job(|| Ok(())),
      token: CancellationToken::new(),
      priority: Priority::Normal,
      timeout: None,
      submitted_at: Instant::now(),
      ticket: CompletionTicket::issue(counter, None),
    }
  }

  #[tokio::test]
  async fn test_queue_send_recv() {
    let counter = CompletionCounter::new();
    let (producer, consumer) = TaskQueue::new(5).split();

    assert_eq!(producer.len(), 0);
    producer.send(dummy_task(&counter, 1)).await.unwrap();
    // Permit is now held by the message in the queue.
    assert_eq!(producer.len(), 1);

    let received_task = consumer.recv().await.unwrap();
    assert_eq!(received_task.task_id, 1);
    // After recv, the permit is released.
    assert_eq!(producer.len(), 0);
  }

  #[tokio::test]
  async fn test_queue_capacity_blocks_send() {
    let counter = CompletionCounter::new();
    let (producer, consumer) = TaskQueue::new(1).split();

    // Send one task, filling the queue capacity
    producer.send(dummy_task(&counter, 1)).await.unwrap();
    assert_eq!(producer.len(), 1);

    // The next send should block. We use `tokio::select!` to test this.
    let send_future = producer.send(dummy_task(&counter, 2));
    tokio::pin!(send_future);

    tokio::select! {
        _ = &mut send_future => {
            panic!("Send should have blocked because the queue is full.");
        },
        _ = tokio::time::sleep(Duration::from_millis(50)) => {
            // This is the expected outcome.
        }
    }

    // Now, receive a task, which should unblock the waiting send.
    let received_task = consumer.recv().await.unwrap();
    assert_eq!(received_task.task_id, 1);

    // The second send should now complete quickly.
    tokio::time::timeout(Duration::from_millis(50), send_future)
      .await
      .expect("Send did not complete after queue was drained.")
      .unwrap();
    assert_eq!(producer.len(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_queue_concurrent_sends() {
    let counter = CompletionCounter::new();
    let (producer, consumer) = TaskQueue::new(4).split();
    let producer = Arc::new(producer);
    let num_tasks: u64 = 20;
    let received_count = Arc::new(AtomicUsize::new(0));

    let producer_handle = {
      let producer = producer.clone();
      let counter = counter.clone();
      tokio::spawn(async move {
        let mut handles = Vec::new();
        for i in 0..num_tasks {
          let p = producer.clone();
          let task = dummy_task(&counter, i);
          handles.push(tokio::spawn(async move {
            p.send(task).await.unwrap();
          }));
        }
        for handle in handles {
          handle.await.unwrap();
        }
      })
    };

    let consumer_handle = {
      let received_count = received_count.clone();
      tokio::spawn(async move {
        for _ in 0..num_tasks {
          if consumer.recv().await.is_some() {
            received_count.fetch_add(1, Ordering::SeqCst);
          }
        }
      })
    };

    producer_handle.await.unwrap();
    consumer_handle.await.unwrap();

    assert_eq!(received_count.load(Ordering::SeqCst), num_tasks as usize);
    assert_eq!(producer.len(), 0);
    assert_eq!(counter.pending(), 0);
  }

  #[tokio::test]
  async fn test_send_respects_task_token() {
    let counter = CompletionCounter::new();
    let (producer, _consumer) = TaskQueue::new(1).split();

    producer.send(dummy_task(&counter, 1)).await.unwrap();

    let blocked = dummy_task(&counter, 2);
    let token = blocked.token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      token.cancel();
    });
    let result = producer.send(blocked).await;
    assert_eq!(result, Err(PoolError::ContextCanceled));
    assert_eq!(producer.len(), 1, "Permit should still be held by first task");
    assert_eq!(counter.pending(), 1, "Rejected task released its ticket");
  }

  #[tokio::test]
  async fn test_close_stops_consumer_after_drain() {
    let counter = CompletionCounter::new();
    let (producer, consumer) = TaskQueue::new(2).split();

    producer.send(dummy_task(&counter, 1)).await.unwrap();
    producer.close();
    assert!(producer.is_closed());

    let result = producer.send(dummy_task(&counter, 2)).await;
    assert_eq!(result, Err(PoolError::PoolClosed));

    assert_eq!(consumer.recv().await.unwrap().task_id, 1);
    assert!(consumer.recv().await.is_none());
  }
}
