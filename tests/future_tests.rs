mod common;

use common::{eventually, setup_tracing_for_test, test_scope};
use promise_orchestra::{Error, FailureHook, FailureReport, Future, FutureState, Outcome, Pipe, Promise, ScopeConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
#[error("upstream refused: {0}")]
struct Refused(&'static str);

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_resolves_have_single_winner() {
  setup_tracing_for_test();
  let promise = Promise::<usize>::new();
  let winners = Arc::new(AtomicUsize::new(0));
  let losers = Arc::new(AtomicUsize::new(0));

  let mut handles = Vec::new();
  for i in 0..1000 {
    let promise = promise.clone();
    let winners = winners.clone();
    let losers = losers.clone();
    handles.push(tokio::spawn(async move {
      match promise.resolve(i) {
        Ok(()) => winners.fetch_add(1, Ordering::SeqCst),
        Err(Error::AlreadyCompleted) => losers.fetch_add(1, Ordering::SeqCst),
        Err(other) => panic!("unexpected settle error: {other:?}"),
      };
    }));
  }
  for handle in handles {
    handle.await.unwrap();
  }

  assert_eq!(winners.load(Ordering::SeqCst), 1);
  assert_eq!(losers.load(Ordering::SeqCst), 999);
  let first = promise.future().get().await.unwrap();
  assert_eq!(promise.future().get().await.unwrap(), first);
  assert!(!promise.future().cancel());
}

#[tokio::test]
async fn test_listeners_run_once_in_registration_order() {
  setup_tracing_for_test();
  let promise = Promise::<u32>::new();
  let future = promise.future();
  let seen = Arc::new(Mutex::new(Vec::new()));

  for tag in 1..=3 {
    let seen = seen.clone();
    future.on_success(move |value| seen.lock().unwrap().push((tag, value)));
  }
  let failures = Arc::new(AtomicUsize::new(0));
  {
    let failures = failures.clone();
    future.on_failure(move |_| {
      failures.fetch_add(1, Ordering::SeqCst);
    });
  }

  promise.resolve(9).unwrap();
  assert!(eventually(Duration::from_secs(1), || seen.lock().unwrap().len() == 3).await);
  assert_eq!(*seen.lock().unwrap(), vec![(1, 9), (2, 9), (3, 9)]);

  // Registered after completion: runs inline on the caller.
  let late = Arc::new(AtomicUsize::new(0));
  {
    let late = late.clone();
    future.on_complete(move |outcome| {
      assert!(outcome.is_success());
      late.fetch_add(1, Ordering::SeqCst);
    });
  }
  assert_eq!(late.load(Ordering::SeqCst), 1);

  tokio::time::sleep(Duration::from_millis(20)).await;
  assert_eq!(seen.lock().unwrap().len(), 3);
  assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_panicking_callback_does_not_affect_siblings() {
  setup_tracing_for_test();
  let promise = Promise::<&'static str>::new();
  let (tx, rx) = oneshot::channel();
  promise
    .future()
    .on_success(|_| panic!("listener blew up"))
    .on_success(move |value| {
      let _ = tx.send(value);
    });

  promise.resolve("delivered").unwrap();
  let value = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
  assert_eq!(value, "delivered");
}

#[tokio::test]
async fn test_get_is_idempotent_for_failures() {
  setup_tracing_for_test();
  let promise = Promise::<u8>::new();
  promise.reject(Error::task(Refused("quota"))).unwrap();
  let future = promise.future();

  let first = future.get().await.unwrap_err();
  let second = future.get().await.unwrap_err();
  assert_eq!(first.to_string(), "upstream refused: quota");
  assert_eq!(first.to_string(), second.to_string());
  assert_eq!(future.state(), FutureState::Rejected);
  assert!(matches!(future.outcome(), Some(Outcome::Failure(_))));
  assert!(matches!(promise.resolve(1), Err(Error::AlreadyCompleted)));
}

#[tokio::test]
async fn test_cancel_is_a_terminal_transition() {
  setup_tracing_for_test();
  let promise = Promise::<u8>::new();
  let canceller = promise.canceller();
  let cancelled_cb = Arc::new(AtomicUsize::new(0));
  {
    let cancelled_cb = cancelled_cb.clone();
    promise.future().on_cancel(move || {
      cancelled_cb.fetch_add(1, Ordering::SeqCst);
    });
  }

  assert!(canceller.cancel());
  assert!(!canceller.cancel());
  tokio::time::timeout(Duration::from_secs(1), canceller.cancelled()).await.unwrap();
  assert!(promise.is_cancelled());
  assert!(matches!(promise.resolve(3), Err(Error::AlreadyCompleted)));
  assert!(matches!(promise.future().get().await, Err(Error::Cancelled)));
  assert!(eventually(Duration::from_secs(1), || cancelled_cb.load(Ordering::SeqCst) == 1).await);

  let resolved = Future::resolved(5u8);
  assert!(!resolved.cancel());
  assert_eq!(resolved.state(), FutureState::Resolved);
}

#[tokio::test]
async fn test_get_timeout_and_set_timeout() {
  setup_tracing_for_test();
  let promise = Promise::<u8>::new();
  let future = promise.future();
  assert!(future.get_timeout(Duration::from_millis(20)).await.is_none());
  assert!(!future.is_final());

  future.set_timeout(Duration::from_millis(30));
  assert!(matches!(future.get().await, Err(Error::Cancelled)));

  let quick = Promise::<u8>::new();
  quick.future().set_timeout(Duration::from_millis(200));
  quick.resolve(4).unwrap();
  tokio::time::sleep(Duration::from_millis(250)).await;
  assert_eq!(quick.future().get_timeout(Duration::from_millis(10)).await.unwrap().unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_get_blocking_from_plain_thread() {
  setup_tracing_for_test();
  let promise = Promise::<String>::new();
  let future = promise.future();
  let reader = std::thread::spawn(move || future.get_blocking());

  tokio::time::sleep(Duration::from_millis(20)).await;
  promise.resolve("from the runtime".to_string()).unwrap();
  assert_eq!(reader.join().unwrap().unwrap(), "from the runtime");
}

#[tokio::test]
async fn test_then_and_map_chain_on_pending_source() {
  setup_tracing_for_test();
  let promise = Promise::<u32>::new();
  let chained = promise
    .future()
    .map(|value| value * 2)
    .then(|value| Future::resolved(format!("value={value}")));

  promise.resolve(21).unwrap();
  assert_eq!(chained.get().await.unwrap(), "value=42");
}

#[tokio::test]
async fn test_pipe_propagation_rules() {
  setup_tracing_for_test();
  assert!(Future::resolved(1u8).pipe(Pipe::<u8, u8>::new()).is_none());

  // Failure with no rejection continuation propagates unchanged.
  let failed = Promise::<u8>::new();
  let piped = failed
    .future()
    .pipe(Pipe::new().on_resolved(|v: u8| Future::resolved(v + 1)))
    .unwrap();
  failed.reject(Error::task(Refused("pipe"))).unwrap();
  assert_eq!(piped.get().await.unwrap_err().to_string(), "upstream refused: pipe");

  // Cancellation propagates as cancellation.
  let cancelled = Promise::<u8>::new();
  let piped = cancelled
    .future()
    .pipe(Pipe::new().on_resolved(|v: u8| Future::resolved(v + 1)))
    .unwrap();
  cancelled.cancel().unwrap();
  assert!(piped.get().await.unwrap_err().is_cancelled());

  // Success with only a rejection continuation has nothing to run.
  let piped = Future::resolved(3u8)
    .pipe(Pipe::<u8, u8>::new().on_rejected(|_| Future::resolved(0)))
    .unwrap();
  assert!(matches!(piped.get().await, Err(Error::NoContinuation)));

  // A continuation that panics rejects the dependent future.
  let piped = Future::resolved(3u8).then(|_| -> Future<u8> { panic!("continuation failed") });
  assert!(piped.get().await.unwrap_err().is_panic());
}

#[tokio::test]
async fn test_catch_recovers_and_success_passes_through() {
  setup_tracing_for_test();
  let recovered = Future::<u32>::rejected(Error::task(Refused("catch"))).catch(|err| {
    assert_eq!(err.to_string(), "upstream refused: catch");
    Future::resolved(0)
  });
  assert_eq!(recovered.get().await.unwrap(), 0);

  let passed = Future::resolved(8u32).catch(|_| Future::resolved(0));
  assert_eq!(passed.get().await.unwrap(), 8);
}

#[tokio::test]
async fn test_unobserved_failure_goes_to_hook() {
  setup_tracing_for_test();
  let reports: Arc<Mutex<Vec<FailureReport>>> = Arc::new(Mutex::new(Vec::new()));
  let hook: FailureHook = {
    let reports = reports.clone();
    Arc::new(move |report: &FailureReport| reports.lock().unwrap().push(report.clone()))
  };
  let (_governor, scope) = test_scope("future-hook", ScopeConfig::default().with_failure_hook(hook));

  let ignored = scope.new_promise::<u8>();
  ignored.reject(Error::task(Refused("nobody listened"))).unwrap();
  let ignored_id = ignored.future().id();
  drop(ignored);

  let observed = scope.new_promise::<u8>();
  observed.reject(Error::task(Refused("someone listened"))).unwrap();
  assert!(observed.future().get().await.is_err());
  drop(observed);

  let inspected = scope.new_promise::<u8>();
  inspected.reject(Error::task(Refused("state was checked"))).unwrap();
  assert!(!inspected.is_cancelled());
  assert_eq!(inspected.future().state(), FutureState::Rejected);
  drop(inspected);

  let resolved = scope.new_promise::<u8>();
  resolved.resolve(1).unwrap();
  drop(resolved);

  let reports = reports.lock().unwrap();
  assert_eq!(reports.len(), 1);
  assert_eq!(reports[0].future_id, ignored_id);
  assert_eq!(reports[0].error.to_string(), "upstream refused: nobody listened");
}
