use crate::error::Error;

/// Bounds shared by every value carried through a [`Future`](crate::Future).
///
/// Values are cloned out to each reader, so a settled future can be read any number of times.
pub trait TaskValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> TaskValue for T {}

/// The terminal value of a future. Never mutated once constructed.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
  Success(T),
  Failure(Error),
  Cancelled,
}

/// Observable state of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
  Pending,
  Resolved,
  Rejected,
  Cancelled,
}

impl<T> Outcome<T> {
  pub(crate) fn from_result(result: Result<T, Error>) -> Self {
    match result {
      Ok(value) => Outcome::Success(value),
      // A body that bails out with the cancellation sentinel is reported as cancelled.
      Err(Error::Cancelled) => Outcome::Cancelled,
      Err(err) => Outcome::Failure(err),
    }
  }

  pub fn state(&self) -> FutureState {
    match self {
      Outcome::Success(_) => FutureState::Resolved,
      Outcome::Failure(_) => FutureState::Rejected,
      Outcome::Cancelled => FutureState::Cancelled,
    }
  }

  pub fn is_success(&self) -> bool {
    matches!(self, Outcome::Success(_))
  }

  pub fn is_failure(&self) -> bool {
    matches!(self, Outcome::Failure(_))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Outcome::Cancelled)
  }

  /// Classifies the outcome the way `Future::get` reports it.
  pub fn into_result(self) -> Result<T, Error> {
    match self {
      Outcome::Success(value) => Ok(value),
      Outcome::Failure(err) => Err(err),
      Outcome::Cancelled => Err(Error::Cancelled),
    }
  }
}
