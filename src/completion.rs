use crate::error::PoolError;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Something that can be failed once a task reaches a terminal state without
/// a value. Implemented by result slots behind a `TaskFuture`.
pub(crate) trait Settle: Send + Sync {
  fn fail(&self, error: PoolError);
}

/// Counts tasks that were accepted but have not yet reached a terminal state.
/// `wait` resolves each time the count drops to zero.
#[derive(Default)]
pub(crate) struct CompletionCounter {
  pending: AtomicUsize,
  zero: Notify,
}

impl fmt::Debug for CompletionCounter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionCounter")
      .field("pending", &self.pending())
      .finish()
  }
}

impl CompletionCounter {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub(crate) fn pending(&self) -> usize {
    self.pending.load(Ordering::Acquire)
  }

  fn add(&self) {
    self.pending.fetch_add(1, Ordering::AcqRel);
  }

  fn done(&self) {
    if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.zero.notify_waiters();
    }
  }

  pub(crate) async fn wait(&self) {
    loop {
      let notified = self.zero.notified();
      tokio::pin!(notified);
      // Register before checking so a concurrent `done` cannot be missed.
      notified.as_mut().enable();
      if self.pending() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// RAII token for one accepted task.
///
/// Dropping the ticket is the task's terminal transition: any attached result
/// sink that was never resolved is failed, then the completion counter is
/// decremented. Every path that disposes of a wrapper (execution, cancellation,
/// rejected enqueue) therefore keeps the counter balanced.
pub(crate) struct CompletionTicket {
  counter: Arc<CompletionCounter>,
  sink: Option<Arc<dyn Settle>>,
}

impl CompletionTicket {
  pub(crate) fn issue(counter: &Arc<CompletionCounter>, sink: Option<Arc<dyn Settle>>) -> Self {
    counter.add();
    Self {
      counter: counter.clone(),
      sink,
    }
  }

  /// Fails the attached sink, if any. A no-op when it was already resolved.
  pub(crate) fn fail(&self, error: PoolError) {
    if let Some(sink) = &self.sink {
      sink.fail(error);
    }
  }
}

impl fmt::Debug for CompletionTicket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionTicket")
      .field("has_sink", &self.sink.is_some())
      .finish()
  }
}

impl Drop for CompletionTicket {
  fn drop(&mut self) {
    self.fail(PoolError::ResultChannelError(
      "task was dropped before reaching a terminal state".to_string(),
    ));
    self.counter.done();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;
  use std::time::Duration;

  #[derive(Default)]
  struct RecordingSink {
    failures: Mutex<Vec<PoolError>>,
  }

  impl Settle for RecordingSink {
    fn fail(&self, error: PoolError) {
      self.failures.lock().push(error);
    }
  }

  #[tokio::test]
  async fn test_wait_returns_immediately_when_idle() {
    let counter = CompletionCounter::new();
    tokio::time::timeout(Duration::from_millis(50), counter.wait())
      .await
      .expect("wait on an idle counter should not block");
  }

  #[tokio::test]
  async fn test_wait_resolves_after_last_ticket_dropped() {
    let counter = CompletionCounter::new();
    let first = CompletionTicket::issue(&counter, None);
    let second = CompletionTicket::issue(&counter, None);
    assert_eq!(counter.pending(), 2);

    let waiter = {
      let counter = counter.clone();
      tokio::spawn(async move { counter.wait().await })
    };

    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished(), "one ticket is still outstanding");

    drop(second);
    tokio::time::timeout(Duration::from_millis(200), waiter)
      .await
      .expect("waiter should resolve once the counter hits zero")
      .unwrap();
    assert_eq!(counter.pending(), 0);
  }

  #[test]
  fn test_dropping_ticket_fails_sink_and_releases_counter() {
    let counter = CompletionCounter::new();
    let sink = Arc::new(RecordingSink::default());
    let ticket = CompletionTicket::issue(&counter, Some(sink.clone()));
    ticket.fail(PoolError::ContextCanceled);
    drop(ticket);

    let failures = sink.failures.lock();
    // The recording sink does not de-duplicate; real result slots keep the first.
    assert_eq!(failures[0], PoolError::ContextCanceled);
    assert!(matches!(failures[1], PoolError::ResultChannelError(_)));
    assert_eq!(counter.pending(), 0);
  }
}
