mod common;

use common::{eventually, setup_tracing_for_test, test_scope};
use promise_orchestra::{Error, PoolOptions, ScopeConfig, Task};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Tracks how many jobs run at once and the highest concurrency seen.
#[derive(Default)]
struct Concurrency {
  current: AtomicUsize,
  peak: AtomicUsize,
  completed: AtomicUsize,
}

impl Concurrency {
  fn job(self: &Arc<Self>, duration_ms: u64) -> impl std::future::Future<Output = ()> + Send + 'static {
    let tracker = self.clone();
    async move {
      let now = tracker.current.fetch_add(1, Ordering::SeqCst) + 1;
      tracker.peak.fetch_max(now, Ordering::SeqCst);
      sleep(Duration::from_millis(duration_ms)).await;
      tracker.current.fetch_sub(1, Ordering::SeqCst);
      tracker.completed.fetch_add(1, Ordering::SeqCst);
    }
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_bounds_concurrency() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-bounds", ScopeConfig::default().with_max_routines(20));
  let pool = scope.new_pool("io", 5, PoolOptions::new()).await.unwrap();
  assert_eq!(pool.cap(), 5);
  assert_eq!(scope.stats().budget.allocated, 15);

  let concurrency = Arc::new(Concurrency::default());
  for _ in 0..10 {
    let jitter = rand::rng().random_range(0..20);
    pool.submit(concurrency.job(80 + jitter)).await.unwrap();
    assert!(pool.running() + pool.waiting() <= pool.cap());
  }

  pool.release_timeout(Duration::from_secs(1)).await.unwrap();
  assert_eq!(concurrency.completed.load(Ordering::SeqCst), 10);
  let peak = concurrency.peak.load(Ordering::SeqCst);
  assert!(peak <= 5, "peak concurrency {peak} exceeded the pool size");
  assert!(peak >= 2, "jobs never overlapped (peak {peak})");

  assert!(pool.is_closed());
  assert!(scope.pool("io").is_none());
  assert_eq!(scope.stats().budget.allocated, 20);
}

#[tokio::test]
async fn test_duplicate_pool_names_fail_until_released() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-dupes", ScopeConfig::default().with_max_routines(10));
  let pool = scope.new_pool("io", 2, PoolOptions::new()).await.unwrap();

  let err = scope.new_pool("io", 1, PoolOptions::new()).await.unwrap_err();
  assert!(matches!(err, Error::DuplicatePoolName { ref name, .. } if name == "io"));
  assert_eq!(scope.stats().budget.allocated, 8);
  assert_eq!(scope.pools().len(), 1);

  pool.release().await.unwrap();
  let again = scope.new_pool("io", 3, PoolOptions::new()).await.unwrap();
  assert_eq!(again.cap(), 3);
  again.release().await.unwrap();
}

#[tokio::test]
async fn test_pool_larger_than_budget_frees_its_name() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-oversize", ScopeConfig::default().with_max_routines(4));

  let err = scope.new_pool("big", 5, PoolOptions::new()).await.unwrap_err();
  assert!(matches!(err, Error::PoolOverloaded { requested: 5, .. }));
  assert!(scope.pool("big").is_none());

  let pool = scope.new_pool("big", 4, PoolOptions::new()).await.unwrap();
  assert_eq!(scope.stats().budget.allocated, 0);
  pool.release().await.unwrap();
}

#[tokio::test]
async fn test_nonblocking_pool_rejects_when_full() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-nonblocking", ScopeConfig::default());
  let pool = scope
    .new_pool("single", 1, PoolOptions::new().nonblocking(true))
    .await
    .unwrap();

  pool.submit(sleep(Duration::from_millis(200))).await.unwrap();
  let err = pool.submit(async {}).await.unwrap_err();
  assert!(matches!(err, Error::PoolOverloaded { .. }));

  pool.release_timeout(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_blocking_caps_waiting_submitters() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-max-blocking", ScopeConfig::default());
  let pool = scope
    .new_pool("narrow", 1, PoolOptions::new().max_blocking(1))
    .await
    .unwrap();

  pool.submit(sleep(Duration::from_millis(300))).await.unwrap();
  let blocked_submitter = {
    let pool = pool.clone();
    tokio::spawn(async move { pool.submit(async {}).await })
  };
  assert!(eventually(Duration::from_secs(1), || pool.blocked() == 1).await);

  let err = pool.submit(async {}).await.unwrap_err();
  assert!(matches!(err, Error::PoolOverloaded { .. }));

  blocked_submitter.await.unwrap().unwrap();
  pool.release_timeout(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_force_sync_runs_jobs_inline() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-sync", ScopeConfig::default().with_force_sync(true));
  let pool = scope.new_pool("inline", 2, PoolOptions::new()).await.unwrap();

  let ran = Arc::new(AtomicBool::new(false));
  {
    let ran = ran.clone();
    pool
      .submit(async move {
        sleep(Duration::from_millis(10)).await;
        ran.store(true, Ordering::SeqCst);
      })
      .await
      .unwrap();
  }
  assert!(ran.load(Ordering::SeqCst), "job should have completed before submit returned");

  let future = pool.submit_task(Task::func(|| Ok::<_, Error>(5u8))).await.unwrap();
  assert_eq!(future.outcome().unwrap().into_result().unwrap(), 5);
  pool.release().await.unwrap();
}

#[tokio::test]
async fn test_panicking_job_keeps_pool_alive() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-panic", ScopeConfig::default().with_max_routines(6));
  let pool = scope.new_pool("fragile", 1, PoolOptions::new()).await.unwrap();

  pool.submit(async { panic!("job exploded") }).await.unwrap();
  pool
    .submit_blocking(|| panic!("blocking job exploded"))
    .await
    .unwrap();

  let after = Arc::new(AtomicBool::new(false));
  {
    let after = after.clone();
    pool.submit(async move { after.store(true, Ordering::SeqCst) }).await.unwrap();
  }
  let future = pool
    .submit_task(Task::<u32>::func(|| -> Result<u32, Error> { panic!("task in pool exploded") }))
    .await
    .unwrap();
  assert!(future.get().await.unwrap_err().is_panic());

  pool.release_timeout(Duration::from_secs(1)).await.unwrap();
  assert!(after.load(Ordering::SeqCst));
  assert_eq!(scope.stats().budget.allocated, 6);
}

#[tokio::test]
async fn test_submit_after_release_is_rejected() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-closed", ScopeConfig::default());
  let pool = scope.new_pool("gone", 2, PoolOptions::new()).await.unwrap();
  pool.release().await.unwrap();
  pool.release().await.unwrap();

  let err = pool.submit(async {}).await.unwrap_err();
  assert!(matches!(err, Error::PoolClosed { ref name } if name == "gone"));
  assert!(scope.pools().is_empty());
}

#[tokio::test]
async fn test_release_timeout_still_returns_capacity() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-slow", ScopeConfig::default().with_max_routines(10));
  let pool = scope.new_pool("slow", 4, PoolOptions::new()).await.unwrap();
  pool.submit(sleep(Duration::from_millis(500))).await.unwrap();
  assert!(eventually(Duration::from_secs(1), || pool.running() == 1).await);

  let err = pool.release_timeout(Duration::from_millis(50)).await.unwrap_err();
  assert!(matches!(err, Error::Timeout { what: "pool release", .. }));
  assert_eq!(scope.stats().budget.allocated, 10);
  assert!(scope.pool("slow").is_none());
}

#[tokio::test]
async fn test_submit_task_and_stats() {
  setup_tracing_for_test();
  let (_governor, scope) = test_scope("pool-tasks", ScopeConfig::default().with_max_routines(10));
  let pool = scope.new_pool("compute", 3, PoolOptions::new()).await.unwrap();

  let future = pool
    .submit_task(Task::future(async {
      sleep(Duration::from_millis(20)).await;
      Ok::<_, Error>("computed".to_string())
    }))
    .await
    .unwrap();
  assert_eq!(future.get().await.unwrap(), "computed");

  let ready = pool.submit_task(Task::value(3u8)).await.unwrap();
  assert_eq!(ready.get().await.unwrap(), 3);

  let stats = scope.stats();
  assert_eq!(stats.pools, 1);
  assert_eq!(stats.budget.allocated, 7);
  assert!(eventually(Duration::from_secs(1), || scope.stats().idle == 3).await);
  pool.release().await.unwrap();
}
