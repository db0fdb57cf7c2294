use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A lock-free counting gate bounding how many jobs a pool holds at once.
pub(crate) struct CapacityGate {
  capacity: usize,
  permits: AtomicUsize,
  waiters: AtomicUsize,
  notify: Notify,
}

impl fmt::Debug for CapacityGate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CapacityGate")
      .field("capacity", &self.capacity)
      .field("permits", &self.get_permits())
      .field("waiters", &self.waiters())
      .finish()
  }
}

impl CapacityGate {
  pub(crate) fn new(capacity: usize) -> Self {
    let capacity = capacity.max(1);
    Self {
      capacity,
      permits: AtomicUsize::new(capacity),
      waiters: AtomicUsize::new(0),
      notify: Notify::new(),
    }
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }

  pub(crate) fn get_permits(&self) -> usize {
    self.permits.load(Ordering::Acquire)
  }

  /// Number of callers currently parked in [`acquire`](Self::acquire).
  pub(crate) fn waiters(&self) -> usize {
    self.waiters.load(Ordering::Acquire)
  }

  pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
    self
      .permits
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |permits| permits.checked_sub(1))
      .ok()
      .map(|_| Permit { gate: self.clone() })
  }

  /// Waits for a permit. Cancel-safe: dropping the future never leaks a permit.
  pub(crate) async fn acquire(self: &Arc<Self>) -> Permit {
    if let Some(permit) = self.try_acquire() {
      return permit;
    }
    let _waiting = WaiterGuard::enter(&self.waiters);
    loop {
      let notified = self.notify.notified();
      if let Some(permit) = self.try_acquire() {
        return permit;
      }
      notified.await;
    }
  }

  fn release(&self) {
    self.permits.fetch_add(1, Ordering::AcqRel);
    self.notify.notify_one();
  }
}

struct WaiterGuard<'a> {
  waiters: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
  fn enter(waiters: &'a AtomicUsize) -> Self {
    waiters.fetch_add(1, Ordering::AcqRel);
    Self { waiters }
  }
}

impl Drop for WaiterGuard<'_> {
  fn drop(&mut self) {
    self.waiters.fetch_sub(1, Ordering::AcqRel);
  }
}

/// A permit acquired from the `CapacityGate`. Its `Drop` implementation returns the slot.
#[derive(Debug)]
pub(crate) struct Permit {
  gate: Arc<CapacityGate>,
}

impl Drop for Permit {
  fn drop(&mut self) {
    self.gate.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[test]
  fn test_try_acquire_respects_capacity() {
    let gate = Arc::new(CapacityGate::new(2));
    let first = gate.try_acquire().unwrap();
    let _second = gate.try_acquire().unwrap();
    assert!(gate.try_acquire().is_none());
    assert_eq!(gate.get_permits(), 0);

    drop(first);
    assert_eq!(gate.get_permits(), 1);
    assert!(gate.try_acquire().is_some());
    assert_eq!(gate.get_permits(), 1, "Dropped temporary permit should be returned");
    assert_eq!(gate.capacity(), 2);
  }

  #[test]
  fn test_zero_capacity_is_raised_to_one() {
    let gate = Arc::new(CapacityGate::new(0));
    assert_eq!(gate.capacity(), 1);
    let _only = gate.try_acquire().unwrap();
    assert!(gate.try_acquire().is_none());
  }

  #[tokio::test]
  async fn test_acquire_waits_for_release() {
    let gate = Arc::new(CapacityGate::new(1));
    let held = gate.acquire().await;

    let waiter = {
      let gate = gate.clone();
      tokio::spawn(async move {
        let _permit = gate.acquire().await;
      })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(gate.waiters(), 1);
    assert!(!waiter.is_finished());

    drop(held);
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("Waiter was not woken after release")
      .unwrap();
    assert_eq!(gate.waiters(), 0);
    assert_eq!(gate.get_permits(), 1);
  }

  #[tokio::test]
  async fn test_dropped_acquire_does_not_leak() {
    let gate = Arc::new(CapacityGate::new(1));
    let held = gate.acquire().await;
    let pending = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
    assert!(pending.is_err());
    assert_eq!(gate.waiters(), 0);

    drop(held);
    assert_eq!(gate.get_permits(), 1);
  }
}
