use crate::combinator;
use crate::config::{LaunchOptions, PoolOptions, ScopeConfig};
use crate::error::Error;
use crate::future::Future;
use crate::governor::{AdmissionWait, Budget, BudgetStats, Grant, GrantKind, Governor};
use crate::outcome::TaskValue;
use crate::pool::{Pool, PoolRegistry, PoolSpec};
use crate::promise::Promise;
use crate::task::Task;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, Instrument};

/// Point-in-time view of an application's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeStats {
  pub budget: BudgetStats,
  /// Worker slots of named pools not running a job.
  pub idle: usize,
  pub pools: usize,
}

pub(crate) struct ScopeInner {
  pub(crate) app: Arc<str>,
  pub(crate) governor: Arc<Governor>,
  pub(crate) budget: Arc<Budget>,
  pub(crate) config: ScopeConfig,
  pub(crate) handle: TokioHandle,
  /// Joins every tracked task launched directly through the scope.
  pub(crate) tracker: TaskTracker,
  pub(crate) shutting_down: AtomicBool,
  /// Fired when shutdown begins; wakes launches parked in admission.
  pub(crate) closing: CancellationToken,
}

/// An application's entry point for launching governed work.
///
/// One scope per application; clones share the same budget, pools and shutdown state.
#[derive(Clone)]
pub struct Scope {
  pub(crate) inner: Arc<ScopeInner>,
}

impl fmt::Debug for Scope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scope")
      .field("app", &self.inner.app)
      .field("budget", &self.inner.budget.stats())
      .field("shutting_down", &self.is_shutting_down())
      .finish_non_exhaustive()
  }
}

impl Scope {
  /// Registers `app` with `governor` and returns its scope, bound to the current runtime.
  ///
  /// # Panics
  ///
  /// Panics when called outside of a Tokio runtime. Use [`with_handle`](Self::with_handle)
  /// there.
  pub fn new(governor: Arc<Governor>, app: &str, config: ScopeConfig) -> Self {
    Self::with_handle(governor, app, config, TokioHandle::current())
  }

  pub fn with_handle(governor: Arc<Governor>, app: &str, config: ScopeConfig, handle: TokioHandle) -> Self {
    let budget = governor.register_with_backoff(app, config.max_routines, config.admission_backoff);
    debug!(%app, ?config, "Scope created.");
    Self {
      inner: Arc::new(ScopeInner {
        app: Arc::from(app),
        governor,
        budget,
        config,
        handle,
        tracker: TaskTracker::new(),
        shutting_down: AtomicBool::new(false),
        closing: CancellationToken::new(),
      }),
    }
  }

  pub fn app(&self) -> &str {
    &self.inner.app
  }

  pub fn config(&self) -> &ScopeConfig {
    &self.inner.config
  }

  pub fn budget(&self) -> &Arc<Budget> {
    &self.inner.budget
  }

  pub fn is_shutting_down(&self) -> bool {
    self.inner.shutting_down.load(AtomicOrdering::Acquire)
  }

  fn ensure_running(&self) -> Result<(), Error> {
    if self.is_shutting_down() {
      return Err(Error::ShuttingDown {
        app: self.inner.app.to_string(),
      });
    }
    Ok(())
  }

  /// Waits for capacity unless shutdown begins first. A grant won after shutdown started is
  /// handed straight back.
  async fn admit(
    &self,
    size: usize,
    admission: AdmissionWait,
    kind: GrantKind,
    name: Option<Arc<str>>,
  ) -> Result<Grant, Error> {
    let grant = tokio::select! {
      biased;
      _ = self.inner.closing.cancelled() => None,
      grant = self.inner.budget.allocate(size, admission, kind, name) => Some(grant?),
    };
    match grant {
      Some(grant) if !self.is_shutting_down() => Ok(grant),
      _ => {
        debug!(app = %self.inner.app, size, "Admission abandoned: scope is shutting down.");
        Err(Error::ShuttingDown {
          app: self.inner.app.to_string(),
        })
      }
    }
  }

  /// A pending promise dispatching on this scope's runtime and reporting to its failure hook.
  pub fn new_promise<T: TaskValue>(&self) -> Promise<T> {
    self.scoped_promise(None)
  }

  fn scoped_promise<T: TaskValue>(&self, name: Option<Arc<str>>) -> Promise<T> {
    Promise::scoped(
      self.inner.handle.clone(),
      name,
      self.inner.config.failure_hook().cloned(),
    )
  }

  async fn launch<T: TaskValue>(
    &self,
    task: Task<T>,
    run_async: bool,
    options: LaunchOptions,
    kind: GrantKind,
  ) -> Result<Future<T>, Error> {
    self.ensure_running()?;
    let promise = self.scoped_promise(options.name.clone());
    let future = promise.future();
    let Some(task) = task.settle_if_ready(&promise) else {
      return Ok(future);
    };
    if !run_async {
      task.execute(&promise, false).await;
      return Ok(future);
    }

    let grant = self
      .admit(options.size, options.admission, kind, options.name.clone())
      .await?;
    let task_id = grant.id();
    let body = async move {
      let _grant = grant;
      task.execute(&promise, true).await;
    }
    .instrument(info_span!("scope_task", app = %self.inner.app, %task_id, ?kind));
    match kind {
      GrantKind::Tracked => {
        self.inner.tracker.spawn_on(body, &self.inner.handle);
      }
      GrantKind::Ignored => {
        self.inner.handle.spawn(body);
      }
    }
    Ok(future)
  }

  fn cancel_on<T: TaskValue>(&self, token: CancellationToken, future: &Future<T>) {
    if future.is_final() {
      return;
    }
    let watched = future.clone();
    self.inner.handle.spawn(async move {
      tokio::select! {
        _ = token.cancelled() => {
          if watched.cancel() {
            debug!(future_id = %watched.id(), "Future cancelled by its token.");
          }
        }
        _ = watched.wait() => {}
      }
    });
  }

  /// Launches `task`, on a governed slot when `run_async` is set and on the caller otherwise.
  pub async fn promise<T: TaskValue>(
    &self,
    task: Task<T>,
    run_async: bool,
    options: LaunchOptions,
  ) -> Result<Future<T>, Error> {
    let run_async = run_async && !self.inner.config.force_sync;
    self.launch(task, run_async, options, GrantKind::Tracked).await
  }

  /// Fire-and-forget launch, waited for at shutdown. A failure nobody observes is logged or
  /// sent to the failure hook.
  pub async fn go<T: TaskValue>(&self, task: Task<T>, options: LaunchOptions) -> Result<(), Error> {
    self.promise(task, true, options).await.map(drop)
  }

  /// Like [`go`](Self::go), and cancels the task's future once `token` fires.
  pub async fn goc<T: TaskValue>(
    &self,
    token: CancellationToken,
    task: Task<T>,
    options: LaunchOptions,
  ) -> Result<Future<T>, Error> {
    let future = self.promise(task, true, options).await?;
    self.cancel_on(token, &future);
    Ok(future)
  }

  /// Launches a detached daemon. Always asynchronous; shutdown does not wait for it.
  pub async fn go_loop<T: TaskValue>(&self, task: Task<T>, options: LaunchOptions) -> Result<Future<T>, Error> {
    self.launch(task, true, options, GrantKind::Ignored).await
  }

  pub async fn go_loopc<T: TaskValue>(
    &self,
    token: CancellationToken,
    task: Task<T>,
    options: LaunchOptions,
  ) -> Result<Future<T>, Error> {
    let future = self.go_loop(task, options).await?;
    self.cancel_on(token, &future);
    Ok(future)
  }

  async fn launch_all<T: TaskValue>(&self, tasks: Vec<Task<T>>) -> Result<Vec<Future<T>>, Error> {
    let mut futures = Vec::with_capacity(tasks.len());
    for task in tasks {
      match self.promise(task, true, LaunchOptions::default()).await {
        Ok(future) => futures.push(future),
        Err(err) => {
          for launched in &futures {
            launched.cancel();
          }
          return Err(err);
        }
      }
    }
    Ok(futures)
  }

  /// Launches every task and joins them with [`when_all`](crate::when_all).
  pub async fn when_all<T: TaskValue>(&self, tasks: Vec<Task<T>>) -> Result<Future<Vec<T>>, Error> {
    Ok(combinator::when_all(self.launch_all(tasks).await?))
  }

  pub async fn when_any<T: TaskValue>(&self, tasks: Vec<Task<T>>) -> Result<Future<T>, Error> {
    Ok(combinator::when_any(self.launch_all(tasks).await?))
  }

  pub async fn when_any_matched<T, P>(&self, predicate: P, tasks: Vec<Task<T>>) -> Result<Future<T>, Error>
  where
    T: TaskValue,
    P: Fn(&T) -> bool + Send + Sync + 'static,
  {
    Ok(combinator::when_any_matched(predicate, self.launch_all(tasks).await?))
  }

  /// Creates a named pool of `size` workers out of the app budget.
  pub async fn new_pool(&self, name: &str, size: usize, options: PoolOptions) -> Result<Pool, Error> {
    self.ensure_running()?;
    let reservation = PoolRegistry::reserve(&self.inner.budget, name)?;
    let grant = self
      .admit(
        size.max(1),
        options.admission,
        GrantKind::Tracked,
        Some(Arc::from(format!("pool:{name}"))),
      )
      .await?;
    Ok(Pool::start(PoolSpec {
      reservation,
      grant,
      options,
      force_sync: self.inner.config.force_sync,
      default_release_timeout: self.inner.config.pool_release_timeout,
      failure_hook: self.inner.config.failure_hook().cloned(),
      handle: self.inner.handle.clone(),
    }))
  }

  pub fn pool(&self, name: &str) -> Option<Pool> {
    self.inner.budget.pools.get(name)
  }

  pub fn pools(&self) -> Vec<Pool> {
    self.inner.budget.pools.live()
  }

  pub fn stats(&self) -> ScopeStats {
    let pools = self.pools();
    ScopeStats {
      budget: self.inner.budget.stats(),
      idle: pools.iter().map(Pool::free).sum(),
      pools: pools.len(),
    }
  }
}

impl Drop for ScopeInner {
  fn drop(&mut self) {
    if !self.shutting_down.load(AtomicOrdering::Acquire) {
      info!(app = %self.app, "Scope dropped without shutdown.");
    }
  }
}
