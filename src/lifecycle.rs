//! Graceful shutdown of a [`Scope`].

use crate::governor::TaskRecord;
use crate::panic::CatchPanic;
use crate::scope::Scope;

use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

/// What a shutdown left behind.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
  /// Pools whose jobs had not finished within their release timeout.
  pub pools_timed_out: Vec<String>,
  /// Tracked tasks still holding capacity once the wait was over, oldest first.
  pub outstanding: Vec<TaskRecord>,
  pub elapsed: Duration,
}

impl ShutdownReport {
  pub fn is_clean(&self) -> bool {
    self.pools_timed_out.is_empty() && self.outstanding.is_empty()
  }
}

impl Scope {
  /// Shuts the application down.
  ///
  /// Releases every named pool, then waits up to `timeout` for tracked tasks, then logs any
  /// task still holding capacity. New launches fail with `ShuttingDown` from the first step on.
  /// Running it again returns an empty report.
  pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
    let started = Instant::now();
    let app = self.inner.app.clone();
    if self.inner.shutting_down.swap(true, AtomicOrdering::AcqRel) {
      info!(%app, "Shutdown already in progress or completed.");
      return ShutdownReport::default();
    }
    self.inner.closing.cancel();
    info!(%app, ?timeout, "Initiating scope shutdown.");

    let mut pools_timed_out = Vec::new();
    for pool in self.inner.budget.pools.live() {
      if let Err(err) = pool.release().await {
        warn!(%app, pool_name = %pool.name(), "Pool did not drain cleanly: {}", err);
        pools_timed_out.push(pool.name().to_string());
      }
    }

    self.inner.tracker.close();
    if tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_err() {
      warn!(%app, ?timeout, tasks = self.inner.tracker.len(), "Timed out waiting for tasks to finish.");
    }

    let stats = self.inner.budget.stats();
    let mut outstanding = Vec::new();
    if stats.allocated != stats.budget.saturating_sub(stats.ignored) {
      outstanding = self
        .inner
        .budget
        .outstanding_tasks()
        .into_iter()
        .filter(|record| !record.is_ignored())
        .collect();
      for record in &outstanding {
        warn!(
          %app,
          task_id = %record.id,
          name = %record.name,
          size = record.size,
          running_for = ?record.since.elapsed(),
          "Task still outstanding after shutdown."
        );
      }
    }

    self.inner.governor.unregister(&app);
    let report = ShutdownReport {
      pools_timed_out,
      outstanding,
      elapsed: started.elapsed(),
    };
    info!(%app, elapsed = ?report.elapsed, clean = report.is_clean(), "Scope shutdown completed.");
    report
  }

  /// A one-shot handle for the embedding application's lifecycle system.
  pub fn shutdown_hook(&self) -> ShutdownHook {
    ShutdownHook {
      scope: self.clone(),
      timeout: self.inner.config.shutdown_timeout,
    }
  }
}

/// Runs [`Scope::shutdown`] with the configured shutdown timeout.
pub struct ShutdownHook {
  scope: Scope,
  timeout: Duration,
}

impl fmt::Debug for ShutdownHook {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShutdownHook")
      .field("app", &self.scope.app())
      .field("timeout", &self.timeout)
      .finish()
  }
}

impl ShutdownHook {
  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub async fn run(self) -> ShutdownReport {
    let app = self.scope.app().to_string();
    match CatchPanic::new(self.scope.shutdown(self.timeout)).await {
      Ok(report) => report,
      Err(capture) => {
        error!(%app, "Shutdown panicked: {}", capture.message());
        ShutdownReport::default()
      }
    }
  }
}
