use crate::config::FailureHook;
use crate::error::Error;
use crate::future::Future;
use crate::outcome::{Outcome, TaskValue};

use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Write capability that settles a [`Future`] exactly once.
///
/// Every settle attempt after the first returns [`Error::AlreadyCompleted`], however many
/// clones of the promise race for it.
pub struct Promise<T> {
  future: Future<T>,
}

impl<T> Clone for Promise<T> {
  fn clone(&self) -> Self {
    Self {
      future: self.future.clone(),
    }
  }
}

impl<T> fmt::Debug for Promise<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Promise").field("future", &self.future).finish()
  }
}

impl<T: TaskValue> Default for Promise<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: TaskValue> Promise<T> {
  /// Creates a pending promise. Listeners are dispatched on the current Tokio runtime, if any.
  pub fn new() -> Self {
    Self::from_future(Future::pending(TokioHandle::try_current().ok(), None, None))
  }

  /// Creates a pending promise whose listeners are dispatched on `handle`.
  pub fn with_handle(handle: TokioHandle) -> Self {
    Self::from_future(Future::pending(Some(handle), None, None))
  }

  pub(crate) fn scoped(handle: TokioHandle, name: Option<Arc<str>>, failure_hook: Option<FailureHook>) -> Self {
    Self::from_future(Future::pending(Some(handle), name, failure_hook))
  }

  pub(crate) fn from_future(future: Future<T>) -> Self {
    Self { future }
  }

  /// A read handle to the promised future.
  pub fn future(&self) -> Future<T> {
    self.future.clone()
  }

  /// Settles the future with `value`. Fails with `AlreadyCompleted` if it already settled.
  pub fn resolve(&self, value: T) -> Result<(), Error> {
    self.future.settle(Outcome::Success(value))
  }

  /// Settles the future with `err`. Fails with `AlreadyCompleted` if it already settled.
  pub fn reject(&self, err: Error) -> Result<(), Error> {
    self.future.settle(Outcome::Failure(err))
  }

  /// Cancels the future and fires its cancellation token.
  pub fn cancel(&self) -> Result<(), Error> {
    self.future.settle(Outcome::Cancelled)
  }

  pub fn settle(&self, outcome: Outcome<T>) -> Result<(), Error> {
    self.future.settle(outcome)
  }

  pub fn is_cancelled(&self) -> bool {
    self.future.is_cancelled()
  }

  /// Hands out the cancel-only capability for this promise's future.
  pub fn canceller(&self) -> Canceller {
    Canceller {
      target: Arc::new(self.future.clone()),
      token: self.future.cancel_token().clone(),
    }
  }
}

trait CancelTarget: Send + Sync {
  fn cancel(&self) -> bool;
  fn is_cancelled(&self) -> bool;
}

impl<T: TaskValue> CancelTarget for Future<T> {
  fn cancel(&self) -> bool {
    Future::cancel(self)
  }

  fn is_cancelled(&self) -> bool {
    Future::is_cancelled(self)
  }
}

/// Lets a running task body observe or request cancellation of its own future, without the
/// right to resolve it.
#[derive(Clone)]
pub struct Canceller {
  target: Arc<dyn CancelTarget>,
  token: CancellationToken,
}

impl fmt::Debug for Canceller {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Canceller")
      .field("cancelled", &self.is_cancelled())
      .finish()
  }
}

impl Canceller {
  /// Requests cancellation. Returns `false` if the future had already settled.
  pub fn cancel(&self) -> bool {
    self.target.cancel()
  }

  pub fn is_cancelled(&self) -> bool {
    self.target.is_cancelled()
  }

  /// Completes once the future has been cancelled. Never completes if it settles otherwise.
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }

  /// A token that fires when the future is cancelled, for handing to cancellation-aware APIs.
  pub fn token(&self) -> CancellationToken {
    self.token.clone()
  }
}
