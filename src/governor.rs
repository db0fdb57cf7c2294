//! Process-wide admission control.
//!
//! Each application registers a [`Budget`] of task slots with the [`Governor`]. Every launch
//! path obtains a [`Grant`] before it runs and the grant hands the capacity back when it is
//! dropped, so the pairing holds on success, failure, early return and panic alike.

use crate::error::Error;
use crate::pool::PoolRegistry;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_GRANT_ID: AtomicU64 = AtomicU64::new(1);
}

/// How an allocation behaves when the budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionWait {
  /// Fail immediately with `PoolOverloaded`.
  #[default]
  NoWait,
  /// Wait until capacity frees up.
  Forever,
  /// Wait up to the given duration, then fail with `Timeout`.
  Timeout(Duration),
}

impl AdmissionWait {
  /// Maps a signed millisecond timeout: `0` never waits, negative waits forever.
  pub fn from_millis(millis: i64) -> Self {
    match millis {
      0 => AdmissionWait::NoWait,
      m if m < 0 => AdmissionWait::Forever,
      m => AdmissionWait::Timeout(Duration::from_millis(m.unsigned_abs())),
    }
  }
}

/// Whether a grant counts toward graceful-shutdown draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
  Tracked,
  /// Detached long-running work the shutdown sequence does not wait for.
  Ignored,
}

/// Diagnostic record of an outstanding grant.
#[derive(Debug, Clone)]
pub struct TaskRecord {
  pub id: u64,
  pub name: Arc<str>,
  pub size: usize,
  pub kind: GrantKind,
  pub since: Instant,
}

impl TaskRecord {
  pub fn is_ignored(&self) -> bool {
    self.kind == GrantKind::Ignored
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStats {
  pub budget: usize,
  /// Remaining capacity.
  pub allocated: usize,
  pub ignored: usize,
  pub outstanding: usize,
}

/// An application's capacity budget.
pub struct Budget {
  app: Arc<str>,
  total: usize,
  allocated: AtomicUsize,
  ignored: AtomicUsize,
  released: Notify,
  records: DashMap<u64, TaskRecord>,
  backoff: Duration,
  pub(crate) pools: PoolRegistry,
}

impl fmt::Debug for Budget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Budget")
      .field("app", &self.app)
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}

impl Budget {
  fn new(app: &str, total: usize, backoff: Duration) -> Self {
    Self {
      app: Arc::from(app),
      total,
      allocated: AtomicUsize::new(total),
      ignored: AtomicUsize::new(0),
      released: Notify::new(),
      records: DashMap::new(),
      backoff: backoff.max(Duration::from_millis(1)),
      pools: PoolRegistry::default(),
    }
  }

  pub fn app(&self) -> &str {
    &self.app
  }

  pub fn total(&self) -> usize {
    self.total
  }

  pub fn available(&self) -> usize {
    self.allocated.load(AtomicOrdering::Acquire)
  }

  pub fn ignored(&self) -> usize {
    self.ignored.load(AtomicOrdering::Acquire)
  }

  pub fn stats(&self) -> BudgetStats {
    let allocated = self.available();
    BudgetStats {
      budget: self.total,
      allocated,
      ignored: self.ignored(),
      outstanding: self.total.saturating_sub(allocated),
    }
  }

  /// Outstanding grants, oldest first.
  pub fn outstanding_tasks(&self) -> Vec<TaskRecord> {
    let mut records: Vec<TaskRecord> = self.records.iter().map(|entry| entry.value().clone()).collect();
    records.sort_by_key(|record| (record.since, record.id));
    records
  }

  fn try_take(&self, size: usize) -> bool {
    self
      .allocated
      .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |remaining| {
        remaining.checked_sub(size)
      })
      .is_ok()
  }

  fn overloaded(&self, size: usize) -> Error {
    Error::PoolOverloaded {
      app: self.app.to_string(),
      requested: size,
      available: self.available(),
    }
  }

  /// Takes `size` slots without waiting.
  pub fn try_allocate(self: &Arc<Self>, size: usize, kind: GrantKind, name: Option<Arc<str>>) -> Result<Grant, Error> {
    if self.try_take(size) {
      Ok(self.grant(size, kind, name))
    } else {
      debug!(app = %self.app, size, available = self.available(), "Admission denied: budget exhausted.");
      Err(self.overloaded(size))
    }
  }

  /// Takes `size` slots, waiting according to `wait` when the budget is exhausted.
  pub async fn allocate(
    self: &Arc<Self>,
    size: usize,
    wait: AdmissionWait,
    kind: GrantKind,
    name: Option<Arc<str>>,
  ) -> Result<Grant, Error> {
    if size > self.total {
      return Err(self.overloaded(size));
    }
    let deadline = match wait {
      AdmissionWait::Timeout(after) => Some((Instant::now() + after, after)),
      _ => None,
    };

    loop {
      // Register interest before re-checking so a release in between is not missed.
      let notified = self.released.notified();
      if self.try_take(size) {
        return Ok(self.grant(size, kind, name));
      }
      let step = match (wait, deadline) {
        (AdmissionWait::NoWait, _) => return self.try_allocate(size, kind, name),
        (_, Some((deadline, after))) => {
          let now = Instant::now();
          if now >= deadline {
            debug!(app = %self.app, size, ?after, "Admission timed out.");
            return Err(Error::Timeout {
              what: "admission",
              after,
            });
          }
          self.backoff.min(deadline - now)
        }
        _ => self.backoff,
      };
      trace!(app = %self.app, size, "Waiting for budget capacity.");
      let _ = tokio::time::timeout(step, notified).await;
    }
  }

  fn grant(self: &Arc<Self>, size: usize, kind: GrantKind, name: Option<Arc<str>>) -> Grant {
    let id = NEXT_GRANT_ID.fetch_add(1, AtomicOrdering::Relaxed);
    if kind == GrantKind::Ignored {
      self.ignored.fetch_add(size, AtomicOrdering::AcqRel);
    }
    let name = name.unwrap_or_else(|| Arc::from(format!("task-{id}")));
    self.records.insert(
      id,
      TaskRecord {
        id,
        name,
        size,
        kind,
        since: Instant::now(),
      },
    );
    trace!(app = %self.app, grant_id = %id, size, ?kind, "Capacity granted.");
    Grant {
      budget: self.clone(),
      id,
      size,
      kind,
      released: false,
    }
  }

  fn give_back(&self, id: u64, size: usize, kind: GrantKind) {
    self.records.remove(&id);
    if kind == GrantKind::Ignored {
      self.ignored.fetch_sub(size, AtomicOrdering::AcqRel);
    }
    self.allocated.fetch_add(size, AtomicOrdering::AcqRel);
    self.released.notify_waiters();
    trace!(app = %self.app, grant_id = %id, size, "Capacity released.");
  }
}

/// Capacity held by one task or pool. Returned to its budget exactly once, on
/// [`release`](Grant::release) or drop.
#[must_use = "dropping a grant releases its capacity immediately"]
pub struct Grant {
  budget: Arc<Budget>,
  id: u64,
  size: usize,
  kind: GrantKind,
  released: bool,
}

impl fmt::Debug for Grant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Grant")
      .field("app", &self.budget.app)
      .field("id", &self.id)
      .field("size", &self.size)
      .field("kind", &self.kind)
      .finish()
  }
}

impl Grant {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn kind(&self) -> GrantKind {
    self.kind
  }

  pub fn budget(&self) -> &Arc<Budget> {
    &self.budget
  }

  pub fn release(mut self) {
    self.release_inner();
  }

  fn release_inner(&mut self) {
    if !self.released {
      self.released = true;
      self.budget.give_back(self.id, self.size, self.kind);
    }
  }
}

impl Drop for Grant {
  fn drop(&mut self) {
    self.release_inner();
  }
}

/// The process-wide registry of application budgets.
///
/// Created once by the embedding application and shared with every [`Scope`](crate::Scope).
pub struct Governor {
  apps: DashMap<String, Arc<Budget>>,
}

impl fmt::Debug for Governor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Governor").field("apps", &self.apps.len()).finish()
  }
}

impl Default for Governor {
  fn default() -> Self {
    Self::new()
  }
}

impl Governor {
  pub fn new() -> Self {
    Self { apps: DashMap::new() }
  }

  /// Registers `app` with `budget` slots. An app that is already registered keeps its
  /// existing budget.
  pub fn register(&self, app: &str, budget: usize) -> Arc<Budget> {
    self.register_with_backoff(app, budget, Duration::from_millis(10))
  }

  pub(crate) fn register_with_backoff(&self, app: &str, budget: usize, backoff: Duration) -> Arc<Budget> {
    let entry = self
      .apps
      .entry(app.to_string())
      .or_insert_with(|| {
        info!(%app, budget, "Registered app budget.");
        Arc::new(Budget::new(app, budget, backoff))
      })
      .clone();
    if entry.total != budget {
      warn!(%app, requested = budget, existing = entry.total, "App already registered; keeping existing budget.");
    }
    entry
  }

  pub fn budget(&self, app: &str) -> Option<Arc<Budget>> {
    self.apps.get(app).map(|entry| entry.value().clone())
  }

  pub fn unregister(&self, app: &str) -> Option<Arc<Budget>> {
    let removed = self.apps.remove(app).map(|(_, budget)| budget);
    if removed.is_some() {
      info!(%app, "Unregistered app budget.");
    }
    removed
  }

  pub fn apps(&self) -> Vec<String> {
    self.apps.iter().map(|entry| entry.key().clone()).collect()
  }

  fn lookup(&self, app: &str) -> Result<Arc<Budget>, Error> {
    self.budget(app).ok_or_else(|| Error::UnknownApp { app: app.to_string() })
  }

  /// Allocates `size` slots from `app`'s budget.
  pub async fn allocate(&self, app: &str, size: usize, wait: AdmissionWait, kind: GrantKind) -> Result<Grant, Error> {
    self.lookup(app)?.allocate(size, wait, kind, None).await
  }

  /// Non-blocking form of [`allocate`](Self::allocate).
  pub fn try_allocate(&self, app: &str, size: usize, kind: GrantKind) -> Result<Grant, Error> {
    self.lookup(app)?.try_allocate(size, kind, None)
  }

  /// Returns `grant`'s capacity to its budget. Equivalent to dropping it.
  pub fn release(&self, grant: Grant) {
    grant.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn budget(total: usize) -> Arc<Budget> {
    Arc::new(Budget::new("unit", total, Duration::from_millis(5)))
  }

  #[test]
  fn test_counters_stay_paired() {
    let budget = budget(10);
    let first = budget.try_allocate(4, GrantKind::Tracked, None).unwrap();
    let second = budget.try_allocate(3, GrantKind::Ignored, Some(Arc::from("daemon"))).unwrap();

    let stats = budget.stats();
    assert_eq!(stats.allocated, 3);
    assert_eq!(stats.ignored, 3);
    assert_eq!(stats.allocated + stats.outstanding, stats.budget);
    assert_eq!(budget.outstanding_tasks().len(), 2);

    first.release();
    drop(second);
    let stats = budget.stats();
    assert_eq!(stats.allocated, 10);
    assert_eq!(stats.ignored, 0);
    assert!(budget.outstanding_tasks().is_empty());
  }

  #[test]
  fn test_try_allocate_does_not_partially_take() {
    let budget = budget(5);
    let _held = budget.try_allocate(4, GrantKind::Tracked, None).unwrap();
    let err = budget.try_allocate(2, GrantKind::Tracked, None).unwrap_err();
    assert!(matches!(err, Error::PoolOverloaded { requested: 2, available: 1, .. }));
    assert_eq!(budget.available(), 1);
  }

  #[test]
  fn test_from_millis() {
    assert_eq!(AdmissionWait::from_millis(0), AdmissionWait::NoWait);
    assert_eq!(AdmissionWait::from_millis(-1), AdmissionWait::Forever);
    assert_eq!(
      AdmissionWait::from_millis(250),
      AdmissionWait::Timeout(Duration::from_millis(250))
    );
  }

  #[tokio::test]
  async fn test_waiting_allocation_wakes_on_release() {
    let budget = budget(2);
    let held = budget.try_allocate(2, GrantKind::Tracked, None).unwrap();

    let waiter = {
      let budget = budget.clone();
      tokio::spawn(async move { budget.allocate(1, AdmissionWait::Forever, GrantKind::Tracked, None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    drop(held);
    let grant = tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("waiter was not woken")
      .unwrap()
      .unwrap();
    assert_eq!(grant.size(), 1);
    assert_eq!(budget.available(), 1);
  }

  #[tokio::test]
  async fn test_timed_allocation_fails_after_deadline() {
    let budget = budget(1);
    let _held = budget.try_allocate(1, GrantKind::Tracked, None).unwrap();
    let started = Instant::now();
    let err = budget
      .allocate(1, AdmissionWait::Timeout(Duration::from_millis(40)), GrantKind::Tracked, None)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Timeout { what: "admission", .. }));
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(budget.available(), 0);
  }
}
