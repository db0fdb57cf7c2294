use crate::error::{BoxError, Error};
use crate::outcome::{Outcome, TaskValue};
use crate::panic::{self, CatchPanic, PanicCapture};
use crate::promise::{Canceller, Promise};

use std::fmt;
use std::future::Future as StdFuture;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::trace;

type SyncBody<T> = Box<dyn FnOnce(&Canceller) -> Result<T, Error> + Send + 'static>;
type AsyncBody<T> = Box<dyn FnOnce(Canceller) -> BoxFuture<'static, Result<T, Error>> + Send + 'static>;

enum Body<T> {
  Ready(Outcome<T>),
  Sync(SyncBody<T>),
  Async(AsyncBody<T>),
}

/// A unit of work for the launcher, normalised to `(canceller) -> Result<T, Error>`.
///
/// User errors may be anything convertible into a boxed error; an [`Error`] passed this way is
/// kept as is rather than wrapped again.
pub struct Task<T> {
  body: Body<T>,
}

impl<T> fmt::Debug for Task<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match &self.body {
      Body::Ready(_) => "ready",
      Body::Sync(_) => "sync",
      Body::Async(_) => "async",
    };
    f.debug_struct("Task").field("kind", &kind).finish()
  }
}

impl Task<()> {
  pub fn procedure<F>(f: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    Self::sync(move |_| {
      f();
      Ok(())
    })
  }

  pub fn procedure_cancellable<F>(f: F) -> Self
  where
    F: FnOnce(&Canceller) + Send + 'static,
  {
    Self::sync(move |canceller| {
      f(canceller);
      Ok(())
    })
  }

  pub fn fallible<F, E>(f: F) -> Self
  where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: Into<BoxError>,
  {
    Self::sync(move |_| f().map_err(Error::task))
  }

  pub fn fallible_cancellable<F, E>(f: F) -> Self
  where
    F: FnOnce(&Canceller) -> Result<(), E> + Send + 'static,
    E: Into<BoxError>,
  {
    Self::sync(move |canceller| f(canceller).map_err(Error::task))
  }
}

impl<T: TaskValue> Task<T> {
  fn sync<F>(f: F) -> Self
  where
    F: FnOnce(&Canceller) -> Result<T, Error> + Send + 'static,
  {
    Self {
      body: Body::Sync(Box::new(f)),
    }
  }

  pub fn func<F, E>(f: F) -> Self
  where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    E: Into<BoxError>,
  {
    Self::sync(move |_| f().map_err(Error::task))
  }

  pub fn func_cancellable<F, E>(f: F) -> Self
  where
    F: FnOnce(&Canceller) -> Result<T, E> + Send + 'static,
    E: Into<BoxError>,
  {
    Self::sync(move |canceller| f(canceller).map_err(Error::task))
  }

  /// An async body. Launched synchronously it is awaited on the caller's task.
  pub fn future<Fut, E>(fut: Fut) -> Self
  where
    Fut: StdFuture<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    Self {
      body: Body::Async(Box::new(move |_: Canceller| fut.map(|result| result.map_err(Error::task)).boxed())),
    }
  }

  pub fn future_cancellable<F, Fut, E>(f: F) -> Self
  where
    F: FnOnce(Canceller) -> Fut + Send + 'static,
    Fut: StdFuture<Output = Result<T, E>> + Send + 'static,
    E: Into<BoxError>,
  {
    Self {
      body: Body::Async(Box::new(move |canceller: Canceller| {
        f(canceller).map(|result| result.map_err(Error::task)).boxed()
      })),
    }
  }

  /// A task whose result is already known. Never scheduled.
  pub fn value(value: T) -> Self {
    Self {
      body: Body::Ready(Outcome::Success(value)),
    }
  }

  pub fn error(err: Error) -> Self {
    Self {
      body: Body::Ready(Outcome::Failure(err)),
    }
  }

  pub fn is_ready(&self) -> bool {
    matches!(self.body, Body::Ready(_))
  }

  /// Settles `promise` right away when the result is pre-known. Hands the task back otherwise.
  pub(crate) fn settle_if_ready(self, promise: &Promise<T>) -> Option<Self> {
    match self.body {
      Body::Ready(outcome) => {
        let _ = promise.settle(outcome);
        None
      }
      body => Some(Self { body }),
    }
  }

  /// Runs the body to completion and settles `promise` with its result.
  ///
  /// With `offload_sync` set, synchronous bodies run on Tokio's blocking pool instead of the
  /// current task. Panics are recovered into [`Error::Panicked`]. A cancel that lands while the
  /// body is running wins over its late result.
  pub(crate) async fn execute(self, promise: &Promise<T>, offload_sync: bool) {
    let canceller = promise.canceller();
    let result = match self.body {
      Body::Ready(outcome) => {
        let _ = promise.settle(outcome);
        return;
      }
      Body::Sync(f) if offload_sync => {
        match tokio::task::spawn_blocking(move || panic::catch(move || f(&canceller))).await {
          Ok(result) => result,
          Err(join_err) => {
            // The blocking pool refused or dropped the job, which only happens on runtime shutdown.
            trace!(future_id = %promise.future().id(), "Blocking task did not run: {}", join_err);
            let _ = promise.cancel();
            return;
          }
        }
      }
      Body::Sync(f) => panic::catch(move || f(&canceller)),
      Body::Async(f) => match panic::catch(move || f(canceller)) {
        Ok(fut) => CatchPanic::new(fut).await,
        Err(capture) => Err(capture),
      },
    };
    complete(promise, result);
  }
}

fn complete<T: TaskValue>(promise: &Promise<T>, result: Result<Result<T, Error>, PanicCapture>) {
  if promise.is_cancelled() {
    trace!(future_id = %promise.future().id(), "Task finished after cancellation; result discarded.");
    return;
  }
  let outcome = match result {
    Ok(result) => Outcome::from_result(result),
    Err(capture) => Outcome::Failure(capture.into_error()),
  };
  let _ = promise.settle(outcome);
}
