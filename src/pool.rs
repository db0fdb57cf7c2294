use crate::config::{FailureHook, PoolOptions};
use crate::error::Error;
use crate::future::Future;
use crate::governor::{Budget, Grant};
use crate::outcome::TaskValue;
use crate::panic::{self, CatchPanic};
use crate::promise::Promise;
use crate::task::Task;
use crate::task_queue::{Job, QueueConsumer, QueueError, QueueProducer, TaskQueue};

use std::collections::HashMap;
use std::fmt;
use std::future::Future as StdFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

enum PoolSlot {
  /// Name claimed by a `new_pool` call still waiting for its capacity.
  Reserved(u64),
  Live(Pool),
}

/// Named pools of one application. Names are unique per app.
#[derive(Default)]
pub(crate) struct PoolRegistry {
  pools: Mutex<HashMap<String, PoolSlot>>,
}

impl PoolRegistry {
  /// Claims `name`, failing fast if it is already taken.
  pub(crate) fn reserve(budget: &Arc<Budget>, name: &str) -> Result<PoolReservation, Error> {
    let mut pools = budget.pools.pools.lock();
    if pools.contains_key(name) {
      return Err(Error::DuplicatePoolName {
        app: budget.app().to_string(),
        name: name.to_string(),
      });
    }
    let id = NEXT_POOL_ID.fetch_add(1, AtomicOrdering::Relaxed);
    pools.insert(name.to_string(), PoolSlot::Reserved(id));
    Ok(PoolReservation {
      budget: budget.clone(),
      name: name.to_string(),
      id,
      committed: false,
    })
  }

  pub(crate) fn get(&self, name: &str) -> Option<Pool> {
    match self.pools.lock().get(name) {
      Some(PoolSlot::Live(pool)) => Some(pool.clone()),
      _ => None,
    }
  }

  /// Live pools, sorted by name.
  pub(crate) fn live(&self) -> Vec<Pool> {
    let mut pools: Vec<Pool> = self
      .pools
      .lock()
      .values()
      .filter_map(|slot| match slot {
        PoolSlot::Live(pool) => Some(pool.clone()),
        PoolSlot::Reserved(_) => None,
      })
      .collect();
    pools.sort_by(|a, b| a.name().cmp(b.name()));
    pools
  }

  /// Removes `name` only while it still refers to the pool or reservation `id`.
  fn remove(&self, name: &str, id: u64) -> bool {
    let mut pools = self.pools.lock();
    let same = match pools.get(name) {
      Some(PoolSlot::Reserved(reserved)) => *reserved == id,
      Some(PoolSlot::Live(pool)) => pool.inner.id == id,
      None => false,
    };
    if same {
      pools.remove(name);
    }
    same
  }
}

/// A claimed pool name. Dropping it without [`commit`](Self::commit) frees the name again.
pub(crate) struct PoolReservation {
  budget: Arc<Budget>,
  name: String,
  id: u64,
  committed: bool,
}

impl PoolReservation {
  fn commit(mut self, pool: Pool) {
    self.committed = true;
    self
      .budget
      .pools
      .pools
      .lock()
      .insert(self.name.clone(), PoolSlot::Live(pool));
  }
}

impl Drop for PoolReservation {
  fn drop(&mut self) {
    if !self.committed {
      self.budget.pools.remove(&self.name, self.id);
      trace!(app = %self.budget.app(), pool_name = %self.name, "Pool name reservation abandoned.");
    }
  }
}

/// Everything a pool needs at start-up.
pub(crate) struct PoolSpec {
  pub(crate) reservation: PoolReservation,
  pub(crate) grant: Grant,
  pub(crate) options: PoolOptions,
  pub(crate) force_sync: bool,
  pub(crate) default_release_timeout: Duration,
  pub(crate) failure_hook: Option<FailureHook>,
  pub(crate) handle: TokioHandle,
}

struct PoolInner {
  id: u64,
  app: Arc<str>,
  pool_name: Arc<String>,
  producer: QueueProducer,
  running: Arc<AtomicUsize>,
  closing: CancellationToken,
  released: AtomicBool,
  tracker: TaskTracker,
  worker_join_handle_internal: Mutex<Option<JoinHandle<()>>>,
  grant: Mutex<Option<Grant>>,
  budget: Arc<Budget>,
  options: PoolOptions,
  force_sync: bool,
  default_release_timeout: Duration,
  failure_hook: Option<FailureHook>,
  handle: TokioHandle,
}

/// A bounded worker pool carved out of an application's budget.
///
/// Obtained from [`Scope::new_pool`](crate::Scope::new_pool). Handles are cheap to clone.
#[derive(Clone)]
pub struct Pool {
  inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pool")
      .field("app", &self.inner.app)
      .field("name", &self.inner.pool_name)
      .field("cap", &self.cap())
      .field("running", &self.running())
      .field("waiting", &self.waiting())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl Pool {
  pub(crate) fn start(spec: PoolSpec) -> Pool {
    let PoolSpec {
      reservation,
      grant,
      options,
      force_sync,
      default_release_timeout,
      failure_hook,
      handle,
    } = spec;
    let capacity = grant.size().max(1);
    let pool_name = reservation.name.clone();
    let (producer, consumer) = TaskQueue::new(capacity).split();
    let tracker = TaskTracker::new();
    let running = Arc::new(AtomicUsize::new(0));

    let pool = Pool {
      inner: Arc::new(PoolInner {
        id: reservation.id,
        app: Arc::from(grant.budget().app()),
        pool_name: Arc::new(pool_name.clone()),
        producer,
        running: running.clone(),
        closing: CancellationToken::new(),
        released: AtomicBool::new(false),
        tracker: tracker.clone(),
        worker_join_handle_internal: Mutex::new(None),
        budget: grant.budget().clone(),
        grant: Mutex::new(Some(grant)),
        options,
        force_sync,
        default_release_timeout,
        failure_hook,
        handle: handle.clone(),
      }),
    };

    let worker_pool_name = pool.inner.pool_name.clone();
    let worker_tokio_handle = handle.clone();
    let worker_loop_join_handle = handle.spawn(
      async move {
        run_worker_loop(worker_pool_name, consumer, worker_tokio_handle, tracker, running).await;
      }
      .instrument(info_span!("pool_worker_loop", app = %pool.inner.app, name = %pool_name)),
    );
    *pool.inner.worker_join_handle_internal.lock() = Some(worker_loop_join_handle);

    reservation.commit(pool.clone());
    info!(app = %pool.inner.app, pool_name = %*pool.inner.pool_name, cap = capacity, "Pool started.");
    pool
  }

  pub fn name(&self) -> &str {
    &self.inner.pool_name
  }

  /// Jobs the pool holds at once, running or queued.
  pub fn cap(&self) -> usize {
    self.inner.producer.gate().capacity()
  }

  /// Jobs currently executing.
  pub fn running(&self) -> usize {
    self.inner.running.load(AtomicOrdering::Acquire)
  }

  /// Worker slots not running a job.
  pub fn free(&self) -> usize {
    self.cap().saturating_sub(self.running())
  }

  /// Jobs accepted but not yet started.
  pub fn waiting(&self) -> usize {
    self.inner.producer.len()
  }

  /// Submitters parked until the pool has room.
  pub fn blocked(&self) -> usize {
    self.inner.producer.gate().waiters()
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closing.is_cancelled()
  }

  fn closed_error(&self) -> Error {
    Error::PoolClosed {
      name: self.inner.pool_name.to_string(),
    }
  }

  fn overloaded_error(&self) -> Error {
    Error::PoolOverloaded {
      app: self.inner.app.to_string(),
      requested: 1,
      available: self.inner.producer.gate().get_permits(),
    }
  }

  /// Runs `job` on one of the pool's workers.
  ///
  /// Holds one of the pool's slots from submission until the job has finished.
  pub async fn submit<F>(&self, job: F) -> Result<(), Error>
  where
    F: StdFuture<Output = ()> + Send + 'static,
  {
    if self.is_closed() || self.inner.producer.is_closed() {
      warn!(pool_name = %self.inner.pool_name, "Submit: Attempted to submit a job to a released pool.");
      return Err(self.closed_error());
    }

    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    if self.inner.force_sync {
      debug!(pool_name = %self.inner.pool_name, %task_id, "Running job inline (forced synchronous mode).");
      run_job(&self.inner.pool_name, &self.inner.running, task_id, Box::pin(job)).await;
      return Ok(());
    }

    let job = Job {
      task_id,
      future: Box::pin(job),
    };
    let sent = if self.inner.options.nonblocking {
      self.inner.producer.try_send(job).await
    } else {
      let max_blocking = self.inner.options.max_blocking;
      if max_blocking > 0 && self.blocked() >= max_blocking && self.inner.producer.gate().get_permits() == 0 {
        debug!(pool_name = %self.inner.pool_name, %task_id, max_blocking, "Submit: Too many blocked submitters.");
        return Err(self.overloaded_error());
      }
      self.inner.producer.send(job, &self.inner.closing).await
    };

    match sent {
      Ok(()) => {
        trace!(pool_name = %self.inner.pool_name, %task_id, "Job queued.");
        Ok(())
      }
      Err(QueueError::Full) => {
        debug!(pool_name = %self.inner.pool_name, %task_id, "Submit: Pool is full (nonblocking).");
        Err(self.overloaded_error())
      }
      Err(QueueError::Closed) => Err(self.closed_error()),
    }
  }

  /// Runs a synchronous `job` on Tokio's blocking pool while holding one of this pool's slots.
  pub async fn submit_blocking<F>(&self, job: F) -> Result<(), Error>
  where
    F: FnOnce() + Send + 'static,
  {
    let pool_name = self.inner.pool_name.clone();
    self
      .submit(async move {
        match tokio::task::spawn_blocking(move || panic::catch(job)).await {
          Ok(Ok(())) => {}
          Ok(Err(capture)) => error!(pool_name = %*pool_name, "Blocking job panicked: {}", capture.message()),
          Err(join_err) => warn!(pool_name = %*pool_name, "Blocking job did not run: {}", join_err),
        }
      })
      .await
  }

  /// Runs `task` on the pool and returns its future.
  pub async fn submit_task<T: TaskValue>(&self, task: Task<T>) -> Result<Future<T>, Error> {
    let promise = Promise::scoped(self.inner.handle.clone(), None, self.inner.failure_hook.clone());
    let future = promise.future();
    let Some(task) = task.settle_if_ready(&promise) else {
      return Ok(future);
    };
    self
      .submit(async move {
        task.execute(&promise, true).await;
      })
      .await?;
    Ok(future)
  }

  /// Releases the pool using its configured release timeout.
  pub async fn release(&self) -> Result<(), Error> {
    let timeout = self
      .inner
      .options
      .release_timeout
      .unwrap_or(self.inner.default_release_timeout);
    self.release_timeout(timeout).await
  }

  /// Stops accepting jobs, lets queued and running jobs finish for up to `timeout`, then
  /// returns the pool's capacity and removes it from the registry.
  ///
  /// Returns `Err(Timeout)` if the jobs did not finish in time; the pool is released anyway.
  /// Calling it again is a no-op.
  pub async fn release_timeout(&self, timeout: Duration) -> Result<(), Error> {
    if self.inner.released.swap(true, AtomicOrdering::AcqRel) {
      trace!(pool_name = %self.inner.pool_name, "Release already in progress or completed.");
      return Ok(());
    }
    info!(pool_name = %self.inner.pool_name, ?timeout, "Releasing pool.");
    self.inner.closing.cancel();
    self.inner.producer.close();
    self.inner.tracker.close();

    let handle_to_await: Option<JoinHandle<()>> = self.inner.worker_join_handle_internal.lock().take();
    let tracker = self.inner.tracker.clone();
    let drained = tokio::time::timeout(timeout, async move {
      if let Some(handle) = handle_to_await {
        if let Err(join_error) = handle.await {
          error!("Error joining pool worker loop: {:?}", join_error);
        }
      }
      tracker.wait().await;
    })
    .await;

    self.inner.budget.pools.remove(&self.inner.pool_name, self.inner.id);
    if let Some(grant) = self.inner.grant.lock().take() {
      grant.release();
    }

    match drained {
      Ok(()) => {
        info!(pool_name = %self.inner.pool_name, "Pool released.");
        Ok(())
      }
      Err(_) => {
        warn!(
          pool_name = %self.inner.pool_name,
          ?timeout,
          running = self.running(),
          waiting = self.waiting(),
          "Pool jobs did not finish before the release timeout."
        );
        Err(Error::Timeout {
          what: "pool release",
          after: timeout,
        })
      }
    }
  }
}

impl Drop for PoolInner {
  fn drop(&mut self) {
    if !self.closing.is_cancelled() {
      debug!(pool_name = %*self.pool_name, "Pool dropped without release. Closing its queue.");
      self.closing.cancel();
      self.producer.close();
    }
  }
}

async fn run_worker_loop(
  pool_name: Arc<String>,
  consumer: QueueConsumer,
  tasks_tokio_handle: TokioHandle,
  tracker: TaskTracker,
  running: Arc<AtomicUsize>,
) {
  info!(name = %*pool_name, "Worker loop started.");

  loop {
    match consumer.recv().await {
      Ok((job, permit)) => {
        let task_id = job.task_id;
        debug!(name = %*pool_name, %task_id, "Dequeued job. Spawning with permit.");
        let pool_name_for_job = pool_name.clone();
        let running = running.clone();
        tracker.spawn_on(
          async move {
            let _local_permit_guard = permit;
            run_job(&pool_name_for_job, &running, task_id, job.future).await;
          }
          .instrument(info_span!("pool_job", pool_name = %*pool_name, %task_id)),
          &tasks_tokio_handle,
        );
      }
      Err(_) => {
        info!(name = %*pool_name, "Task queue closed and empty. Worker loop terminating.");
        break;
      }
    }
  }
}

async fn run_job(
  pool_name: &str,
  running: &AtomicUsize,
  task_id: u64,
  future: BoxFuture<'static, ()>,
) {
  running.fetch_add(1, AtomicOrdering::AcqRel);
  match CatchPanic::new(future).await {
    Ok(()) => trace!(%pool_name, %task_id, "Job finished."),
    Err(capture) => error!(%pool_name, %task_id, "Job panicked during execution: {}", capture.message()),
  }
  running.fetch_sub(1, AtomicOrdering::AcqRel);
}
