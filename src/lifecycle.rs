use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a `WorkerPool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
  /// Accepting submissions.
  Open,
  /// No new submissions; queued work is draining.
  Closing,
  /// Dispatcher and workers have exited.
  Closed,
}

impl PoolState {
  fn from_u8(raw: u8) -> Self {
    match raw {
      0 => PoolState::Open,
      1 => PoolState::Closing,
      _ => PoolState::Closed,
    }
  }
}

#[derive(Debug, Default)]
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
  pub(crate) fn state(&self) -> PoolState {
    PoolState::from_u8(self.0.load(Ordering::Acquire))
  }

  pub(crate) fn is_closing(&self) -> bool {
    self.state() != PoolState::Open
  }

  /// Moves Open → Closing. Only the caller that performed the transition gets `true`.
  pub(crate) fn begin_close(&self) -> bool {
    self
      .0
      .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  pub(crate) fn mark_closed(&self) {
    self.0.store(2, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_begin_close_is_won_once() {
    let lifecycle = Lifecycle::default();
    assert_eq!(lifecycle.state(), PoolState::Open);
    assert!(!lifecycle.is_closing());
    assert!(lifecycle.begin_close());
    assert!(!lifecycle.begin_close());
    assert_eq!(lifecycle.state(), PoolState::Closing);
    lifecycle.mark_closed();
    assert!(!lifecycle.begin_close());
    assert_eq!(lifecycle.state(), PoolState::Closed);
  }
}
