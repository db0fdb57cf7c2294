//! The read side of the promise engine.
//!
//! A [`Future`] owns an atomically swappable pointer to an immutable [`Snapshot`]. Listener
//! registration and settlement both build a new snapshot from the current one and install it
//! with a compare-and-swap; the loser re-reads and retries. Once a snapshot carries an
//! outcome it is never replaced, which gives every future at most one terminal transition.

use crate::config::{FailureHook, FailureReport};
use crate::error::Error;
use crate::outcome::{FutureState, Outcome, TaskValue};
use crate::panic;
use crate::promise::Promise;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, Guard};
use futures_intrusive::sync::ManualResetEvent;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);
}

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
  Success,
  Failure,
  Complete,
  Cancel,
  Pipe,
}

impl ListenerKind {
  fn observes_failure(self) -> bool {
    matches!(self, ListenerKind::Failure | ListenerKind::Complete | ListenerKind::Pipe)
  }
}

/// A registered callback. The slot is shared by every snapshot that links the listener, so a
/// CAS retry never loses the callback and dispatch runs it at most once.
struct Listener<T> {
  kind: ListenerKind,
  slot: Arc<Mutex<Option<Callback<T>>>>,
}

impl<T> Clone for Listener<T> {
  fn clone(&self) -> Self {
    Self {
      kind: self.kind,
      slot: self.slot.clone(),
    }
  }
}

impl<T> Listener<T> {
  fn fire(&self, future_id: u64, outcome: &Outcome<T>) {
    let Some(callback) = self.slot.lock().take() else {
      return;
    };
    if let Err(capture) = panic::catch(|| callback(outcome)) {
      error!(
        %future_id,
        kind = ?self.kind,
        "Future callback panicked: {}",
        capture.message()
      );
    }
  }
}

/// Persistent cons list of listeners, newest first.
struct ListenerNode<T> {
  listener: Listener<T>,
  next: Option<Arc<ListenerNode<T>>>,
}

struct Snapshot<T> {
  outcome: Option<Arc<Outcome<T>>>,
  listeners: Option<Arc<ListenerNode<T>>>,
}

impl<T> Snapshot<T> {
  fn pending() -> Self {
    Self {
      outcome: None,
      listeners: None,
    }
  }

  /// Listeners in registration order.
  fn listeners_in_order(&self) -> Vec<Listener<T>> {
    let mut ordered = Vec::new();
    let mut node = self.listeners.as_ref();
    while let Some(current) = node {
      ordered.push(current.listener.clone());
      node = current.next.as_ref();
    }
    ordered.reverse();
    ordered
  }
}

struct Inner<T> {
  id: u64,
  state: ArcSwap<Snapshot<T>>,
  final_signal: ManualResetEvent,
  cancel_token: CancellationToken,
  handle: Option<TokioHandle>,
  name: Option<Arc<str>>,
  failure_hook: Option<FailureHook>,
  observed: AtomicBool,
}

impl<T> Drop for Inner<T> {
  fn drop(&mut self) {
    if self.observed.load(AtomicOrdering::Acquire) {
      return;
    }
    let snapshot = self.state.load();
    let Some(outcome) = snapshot.outcome.as_deref() else {
      return;
    };
    if let Outcome::Failure(err) = outcome {
      let report = FailureReport {
        future_id: self.id,
        name: self.name.clone(),
        error: err.clone(),
      };
      match &self.failure_hook {
        Some(hook) => {
          if let Err(capture) = panic::catch(|| hook(&report)) {
            error!(future_id = %self.id, "Failure hook panicked: {}", capture.message());
          }
        }
        None => warn!(
          future_id = %self.id,
          name = ?self.name,
          "Future failed and its failure was never observed: {}",
          err
        ),
      }
    }
  }
}

/// Read-only handle to an eventually available [`Outcome`].
///
/// Handles are cheap to clone; all clones observe the same state.
pub struct Future<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> fmt::Debug for Future<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match self.inner.state.load().outcome.as_deref() {
      None => FutureState::Pending,
      Some(outcome) => outcome.state(),
    };
    f.debug_struct("Future")
      .field("id", &self.inner.id)
      .field("name", &self.inner.name)
      .field("state", &state)
      .finish_non_exhaustive()
  }
}

impl<T: TaskValue> Future<T> {
  pub(crate) fn pending(
    handle: Option<TokioHandle>,
    name: Option<Arc<str>>,
    failure_hook: Option<FailureHook>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        id: NEXT_FUTURE_ID.fetch_add(1, AtomicOrdering::Relaxed),
        state: ArcSwap::from_pointee(Snapshot::pending()),
        final_signal: ManualResetEvent::new(false),
        cancel_token: CancellationToken::new(),
        handle,
        name,
        failure_hook,
        observed: AtomicBool::new(false),
      }),
    }
  }

  /// A future already resolved with `value`.
  pub fn resolved(value: T) -> Self {
    Self::settled(Outcome::Success(value))
  }

  /// A future already rejected with `err`.
  pub fn rejected(err: Error) -> Self {
    Self::settled(Outcome::Failure(err))
  }

  /// A future already cancelled.
  pub fn cancelled() -> Self {
    Self::settled(Outcome::Cancelled)
  }

  fn settled(outcome: Outcome<T>) -> Self {
    let future = Self::pending(TokioHandle::try_current().ok(), None, None);
    // A fresh future cannot already be completed.
    let _ = future.settle(outcome);
    future
  }

  /// Process-wide unique id of this future.
  pub fn id(&self) -> u64 {
    self.inner.id
  }

  /// The launch name, when the future came from a named task.
  pub fn name(&self) -> Option<&str> {
    self.inner.name.as_deref()
  }

  /// Current state. Seeing `Rejected` here counts as observing the failure.
  pub fn state(&self) -> FutureState {
    let state = self.peek_state();
    if state == FutureState::Rejected {
      self.inner.observed.store(true, AtomicOrdering::Release);
    }
    state
  }

  fn peek_state(&self) -> FutureState {
    match self.inner.state.load().outcome.as_deref() {
      None => FutureState::Pending,
      Some(outcome) => outcome.state(),
    }
  }

  /// True once the future has settled, whichever way.
  pub fn is_final(&self) -> bool {
    self.inner.state.load().outcome.is_some()
  }

  pub fn is_cancelled(&self) -> bool {
    self.peek_state() == FutureState::Cancelled
  }

  /// Returns the outcome if the future has settled. Counts as observing a failure.
  pub fn outcome(&self) -> Option<Outcome<T>> {
    let outcome = self.inner.state.load().outcome.clone()?;
    self.inner.observed.store(true, AtomicOrdering::Release);
    Some((*outcome).clone())
  }

  pub(crate) fn handle(&self) -> Option<&TokioHandle> {
    self.inner.handle.as_ref()
  }

  pub(crate) fn cancel_token(&self) -> &CancellationToken {
    &self.inner.cancel_token
  }

  /// Installs the terminal outcome. Only the first caller succeeds.
  pub(crate) fn settle(&self, outcome: Outcome<T>) -> Result<(), Error> {
    let outcome = Arc::new(outcome);
    let mut current = self.inner.state.load_full();
    loop {
      if current.outcome.is_some() {
        return Err(Error::AlreadyCompleted);
      }
      let next = Arc::new(Snapshot {
        outcome: Some(outcome.clone()),
        listeners: None,
      });
      let previous = self.inner.state.compare_and_swap(&current, next);
      if Arc::ptr_eq(&*previous, &current) {
        break;
      }
      current = Guard::into_inner(previous);
    }

    trace!(future_id = %self.inner.id, state = ?outcome.state(), "Future settled.");
    if outcome.is_cancelled() {
      self.inner.cancel_token.cancel();
    }
    self.inner.final_signal.set();

    let listeners = current.listeners_in_order();
    if !listeners.is_empty() {
      self.dispatch(outcome, listeners);
    }
    Ok(())
  }

  /// Runs the listeners that were registered before settlement, off the settling caller's
  /// stack.
  fn dispatch(&self, outcome: Arc<Outcome<T>>, listeners: Vec<Listener<T>>) {
    let future_id = self.inner.id;
    debug!(%future_id, listeners = listeners.len(), "Dispatching future listeners.");
    let run = move || {
      for listener in &listeners {
        listener.fire(future_id, &outcome);
      }
    };
    spawn_detached(self.inner.handle.as_ref(), async move { run() });
  }

  fn register(&self, kind: ListenerKind, callback: Callback<T>) {
    if kind.observes_failure() {
      self.inner.observed.store(true, AtomicOrdering::Release);
    }
    let listener = Listener {
      kind,
      slot: Arc::new(Mutex::new(Some(callback))),
    };
    let mut current = self.inner.state.load_full();
    loop {
      if let Some(outcome) = current.outcome.as_deref() {
        // Already final: no race is possible, run on the caller.
        listener.fire(self.inner.id, outcome);
        return;
      }
      let next = Arc::new(Snapshot {
        outcome: None,
        listeners: Some(Arc::new(ListenerNode {
          listener: listener.clone(),
          next: current.listeners.clone(),
        })),
      });
      let previous = self.inner.state.compare_and_swap(&current, next);
      if Arc::ptr_eq(&*previous, &current) {
        return;
      }
      current = Guard::into_inner(previous);
    }
  }

  /// Calls `callback` with the value if the future resolves. Runs inline when already settled.
  pub fn on_success<F>(&self, callback: F) -> &Self
  where
    F: FnOnce(T) + Send + 'static,
  {
    self.register(
      ListenerKind::Success,
      Box::new(move |outcome: &Outcome<T>| {
        if let Outcome::Success(value) = outcome {
          callback(value.clone());
        }
      }),
    );
    self
  }

  /// Calls `callback` with the error if the future is rejected. Counts as observing the failure.
  pub fn on_failure<F>(&self, callback: F) -> &Self
  where
    F: FnOnce(Error) + Send + 'static,
  {
    self.register(
      ListenerKind::Failure,
      Box::new(move |outcome: &Outcome<T>| {
        if let Outcome::Failure(err) = outcome {
          callback(err.clone());
        }
      }),
    );
    self
  }

  /// Calls `callback` with the outcome, whatever it is.
  pub fn on_complete<F>(&self, callback: F) -> &Self
  where
    F: FnOnce(Outcome<T>) + Send + 'static,
  {
    self.register(ListenerKind::Complete, Box::new(move |outcome: &Outcome<T>| callback(outcome.clone())));
    self
  }

  /// Calls `callback` if the future is cancelled.
  pub fn on_cancel<F>(&self, callback: F) -> &Self
  where
    F: FnOnce() + Send + 'static,
  {
    self.register(
      ListenerKind::Cancel,
      Box::new(move |outcome: &Outcome<T>| {
        if outcome.is_cancelled() {
          callback();
        }
      }),
    );
    self
  }

  /// Waits until the future has settled, without reading the outcome.
  pub async fn wait(&self) {
    self.inner.final_signal.wait().await;
  }

  /// Waits for the outcome. Cancellation is reported as [`Error::Cancelled`].
  pub async fn get(&self) -> Result<T, Error> {
    loop {
      if let Some(outcome) = self.outcome() {
        return outcome.into_result();
      }
      self.inner.final_signal.wait().await;
    }
  }

  /// Like [`get`](Self::get), but gives up after `timeout`. `None` means the wait timed out.
  pub async fn get_timeout(&self, timeout: Duration) -> Option<Result<T, Error>> {
    tokio::time::timeout(timeout, self.get()).await.ok()
  }

  /// Blocks the calling thread until the outcome is available.
  ///
  /// Must not be called from inside an async context driven by a single-threaded runtime.
  pub fn get_blocking(&self) -> Result<T, Error> {
    futures::executor::block_on(self.get())
  }

  /// Attempts the cancelled transition. Returns `false` if the future had already settled.
  pub fn cancel(&self) -> bool {
    self.settle(Outcome::Cancelled).is_ok()
  }

  /// Cancels the future if it has not completed within `timeout`.
  pub fn set_timeout(&self, timeout: Duration) -> &Self {
    let future = self.clone();
    let handle = self.inner.handle.clone().or_else(|| TokioHandle::try_current().ok());
    match handle {
      Some(handle) => {
        handle.spawn(async move {
          tokio::select! {
            _ = future.wait() => {}
            _ = tokio::time::sleep(timeout) => future.cancel_on_timeout(timeout),
          }
        });
      }
      None => {
        let spawned = std::thread::Builder::new()
          .name("promise-timeout".to_string())
          .spawn(move || {
            std::thread::sleep(timeout);
            future.cancel_on_timeout(timeout);
          });
        if let Err(err) = spawned {
          error!(future_id = %self.inner.id, "Failed to spawn future timeout thread: {}", err);
        }
      }
    }
    self
  }

  fn cancel_on_timeout(&self, timeout: Duration) {
    if self.cancel() {
      debug!(future_id = %self.inner.id, ?timeout, "Future cancelled by its timeout.");
    }
  }

  /// Chains continuations onto this future.
  ///
  /// Returns `None` only when `pipe` carries neither continuation. When the source settles with
  /// no matching continuation, a failure propagates unchanged, cancellation propagates as
  /// cancellation, and a success rejects the dependent future with [`Error::NoContinuation`].
  pub fn pipe<U: TaskValue>(&self, pipe: Pipe<T, U>) -> Option<Future<U>> {
    if pipe.is_empty() {
      return None;
    }
    if let Some(outcome) = self.outcome() {
      return Some(pipe.run(outcome));
    }
    let dependent = Promise::<U>::from_future(Future::pending(self.inner.handle.clone(), None, None));
    let future = dependent.future();
    self.register(
      ListenerKind::Pipe,
      Box::new(move |outcome: &Outcome<T>| pipe.run(outcome.clone()).relay_to(dependent)),
    );
    Some(future)
  }

  /// Continues with `f` on success; failures and cancellation propagate.
  pub fn then<U, F>(&self, f: F) -> Future<U>
  where
    U: TaskValue,
    F: FnOnce(T) -> Future<U> + Send + 'static,
  {
    self.pipe_checked(Pipe::new().on_resolved(f))
  }

  /// Maps the resolved value; failures and cancellation propagate.
  pub fn map<U, F>(&self, f: F) -> Future<U>
  where
    U: TaskValue,
    F: FnOnce(T) -> U + Send + 'static,
  {
    self.then(move |value| Future::resolved(f(value)))
  }

  /// Recovers from a rejection with `f`; a success passes through.
  pub fn catch<F>(&self, f: F) -> Future<T>
  where
    F: FnOnce(Error) -> Future<T> + Send + 'static,
  {
    self.pipe_checked(Pipe::new().on_resolved(Future::resolved).on_rejected(f))
  }

  fn pipe_checked<U: TaskValue>(&self, pipe: Pipe<T, U>) -> Future<U> {
    match self.pipe(pipe) {
      Some(future) => future,
      None => Future::rejected(Error::NoContinuation),
    }
  }

  /// Settles `promise` with this future's outcome once it is known.
  pub(crate) fn relay_to(&self, promise: Promise<T>) {
    self.on_complete(move |outcome| {
      let _ = promise.settle(outcome);
    });
  }
}

type ResolvedContinuation<T, U> = Box<dyn FnOnce(T) -> Future<U> + Send + 'static>;
type RejectedContinuation<U> = Box<dyn FnOnce(Error) -> Future<U> + Send + 'static>;

/// Continuations for [`Future::pipe`].
pub struct Pipe<T, U> {
  on_resolved: Option<ResolvedContinuation<T, U>>,
  on_rejected: Option<RejectedContinuation<U>>,
}

impl<T, U> Default for Pipe<T, U> {
  fn default() -> Self {
    Self {
      on_resolved: None,
      on_rejected: None,
    }
  }
}

impl<T: TaskValue, U: TaskValue> Pipe<T, U> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_resolved<F>(mut self, f: F) -> Self
  where
    F: FnOnce(T) -> Future<U> + Send + 'static,
  {
    self.on_resolved = Some(Box::new(f));
    self
  }

  pub fn on_rejected<F>(mut self, f: F) -> Self
  where
    F: FnOnce(Error) -> Future<U> + Send + 'static,
  {
    self.on_rejected = Some(Box::new(f));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.on_resolved.is_none() && self.on_rejected.is_none()
  }

  /// Runs the continuation matching `outcome` and returns the future to adopt.
  fn run(self, outcome: Outcome<T>) -> Future<U> {
    let continued = match outcome {
      Outcome::Success(value) => match self.on_resolved {
        Some(f) => panic::catch(move || f(value)),
        None => return Future::rejected(Error::NoContinuation),
      },
      Outcome::Failure(err) => match self.on_rejected {
        Some(f) => panic::catch(move || f(err)),
        None => return Future::rejected(err),
      },
      Outcome::Cancelled => return Future::cancelled(),
    };
    continued.unwrap_or_else(|capture| Future::rejected(capture.into_error()))
  }
}

/// Spawns `task` on `handle`, the current runtime, or a helper thread when no runtime exists.
pub(crate) fn spawn_detached<F>(handle: Option<&TokioHandle>, task: F)
where
  F: std::future::Future<Output = ()> + Send + 'static,
{
  if let Some(handle) = handle {
    handle.spawn(task);
    return;
  }
  if let Ok(handle) = TokioHandle::try_current() {
    handle.spawn(task);
    return;
  }
  let spawned = std::thread::Builder::new()
    .name("promise-dispatch".to_string())
    .spawn(move || futures::executor::block_on(task));
  if let Err(err) = spawned {
    error!("Failed to spawn promise dispatch thread: {}", err);
  }
}
