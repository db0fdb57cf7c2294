use crate::error::Error;
use crate::governor::AdmissionWait;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};

/// A failure that no caller observed before the last handle to its future was dropped.
#[derive(Debug, Clone)]
pub struct FailureReport {
  pub future_id: u64,
  pub name: Option<Arc<str>>,
  pub error: Error,
}

/// Receives unobserved failures in place of the default `warn!` log line.
pub type FailureHook = Arc<dyn Fn(&FailureReport) + Send + Sync + 'static>;

const fn default_max_routines() -> usize {
  10_000
}

const fn default_pool_release_timeout() -> Duration {
  Duration::from_secs(5)
}

const fn default_shutdown_timeout() -> Duration {
  Duration::from_secs(10)
}

const fn default_admission_backoff() -> Duration {
  Duration::from_millis(10)
}

/// Per-application settings, filled in by the embedding application's configuration loader.
#[serde_as]
#[derive(Clone, Deserialize)]
pub struct ScopeConfig {
  /// Total number of task slots the application may hold at once.
  #[serde(default = "default_max_routines")]
  pub max_routines: usize,

  /// Runs launched tasks and pool submissions inline on the caller. Meant for tests.
  #[serde(default)]
  pub force_sync: bool,

  #[serde_as(as = "DurationMilliSeconds<u64>")]
  #[serde(default = "default_pool_release_timeout")]
  pub pool_release_timeout: Duration,

  #[serde_as(as = "DurationMilliSeconds<u64>")]
  #[serde(default = "default_shutdown_timeout")]
  pub shutdown_timeout: Duration,

  /// Re-poll interval while waiting for capacity.
  #[serde_as(as = "DurationMilliSeconds<u64>")]
  #[serde(default = "default_admission_backoff")]
  pub admission_backoff: Duration,

  #[serde(skip)]
  failure_hook: Option<FailureHook>,
}

impl Default for ScopeConfig {
  fn default() -> Self {
    Self {
      max_routines: default_max_routines(),
      force_sync: false,
      pool_release_timeout: default_pool_release_timeout(),
      shutdown_timeout: default_shutdown_timeout(),
      admission_backoff: default_admission_backoff(),
      failure_hook: None,
    }
  }
}

impl fmt::Debug for ScopeConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ScopeConfig")
      .field("max_routines", &self.max_routines)
      .field("force_sync", &self.force_sync)
      .field("pool_release_timeout", &self.pool_release_timeout)
      .field("shutdown_timeout", &self.shutdown_timeout)
      .field("admission_backoff", &self.admission_backoff)
      .field("failure_hook", &self.failure_hook.is_some())
      .finish()
  }
}

impl ScopeConfig {
  pub fn with_max_routines(mut self, max_routines: usize) -> Self {
    self.max_routines = max_routines;
    self
  }

  pub fn with_force_sync(mut self, force_sync: bool) -> Self {
    self.force_sync = force_sync;
    self
  }

  pub fn with_pool_release_timeout(mut self, timeout: Duration) -> Self {
    self.pool_release_timeout = timeout;
    self
  }

  pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  pub fn with_admission_backoff(mut self, backoff: Duration) -> Self {
    self.admission_backoff = backoff;
    self
  }

  pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
    self.failure_hook = Some(hook);
    self
  }

  pub fn failure_hook(&self) -> Option<&FailureHook> {
    self.failure_hook.as_ref()
  }
}

/// Options for a single launch through [`Scope`](crate::Scope).
#[derive(Debug, Clone)]
pub struct LaunchOptions {
  pub(crate) name: Option<Arc<str>>,
  pub(crate) size: usize,
  pub(crate) admission: AdmissionWait,
}

impl Default for LaunchOptions {
  fn default() -> Self {
    Self {
      name: None,
      size: 1,
      admission: AdmissionWait::Forever,
    }
  }
}

impl LaunchOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Name reported in shutdown diagnostics and failure reports.
  pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Number of budget slots the task holds while running.
  pub fn size(mut self, size: usize) -> Self {
    self.size = size.max(1);
    self
  }

  pub fn admission(mut self, admission: AdmissionWait) -> Self {
    self.admission = admission;
    self
  }
}

/// Options for [`Scope::new_pool`](crate::Scope::new_pool).
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
  pub(crate) nonblocking: bool,
  pub(crate) max_blocking: usize,
  pub(crate) release_timeout: Option<Duration>,
  pub(crate) admission: AdmissionWait,
}

impl PoolOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fail submissions with `PoolOverloaded` instead of waiting when every worker is busy.
  pub fn nonblocking(mut self, nonblocking: bool) -> Self {
    self.nonblocking = nonblocking;
    self
  }

  /// Upper bound on submitters waiting for a free worker. `0` means unbounded.
  pub fn max_blocking(mut self, max_blocking: usize) -> Self {
    self.max_blocking = max_blocking;
    self
  }

  pub fn release_timeout(mut self, timeout: Duration) -> Self {
    self.release_timeout = Some(timeout);
    self
  }

  /// How pool creation waits for its capacity from the app budget.
  pub fn admission(mut self, admission: AdmissionWait) -> Self {
    self.admission = admission;
    self
  }
}
