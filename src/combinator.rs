//! Join and race combinators over [`Future`]s.
//!
//! Inputs report through `on_complete` listeners, so completions are handled in arrival order
//! and the first settle attempt on the combined promise wins. Losing inputs are cancelled
//! best-effort; the combinator never waits for them.

use crate::error::{BranchOutcome, Error};
use crate::future::Future;
use crate::outcome::{Outcome, TaskValue};
use crate::panic;
use crate::promise::Promise;

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tracing::trace;

fn combined_promise<T: TaskValue, U: TaskValue>(inputs: &[Future<U>]) -> Promise<T> {
  let handle = inputs
    .iter()
    .find_map(|input| input.handle().cloned())
    .or_else(|| TokioHandle::try_current().ok());
  Promise::from_future(Future::pending(handle, None, None))
}

/// Inputs still worth cancelling once the combination is decided.
struct Losers<T> {
  inputs: Mutex<Option<Vec<Future<T>>>>,
}

impl<T: TaskValue> Losers<T> {
  fn new(inputs: &[Future<T>]) -> Self {
    Self {
      inputs: Mutex::new(Some(inputs.to_vec())),
    }
  }

  fn cancel_except(&self, winner: Option<usize>) {
    let Some(inputs) = self.inputs.lock().take() else {
      return;
    };
    for (index, input) in inputs.iter().enumerate() {
      if Some(index) != winner && input.cancel() {
        trace!(future_id = %input.id(), "Cancelled losing combinator input.");
      }
    }
  }

  fn forget(&self) {
    self.inputs.lock().take();
  }
}

struct AllState<T> {
  values: Mutex<Vec<Option<T>>>,
  remaining: AtomicUsize,
  losers: Losers<T>,
}

/// Resolves with every value, in input order, once all inputs succeed.
///
/// The first input that does not succeed decides: a failure at index `i` rejects with
/// [`Error::Aggregate`] carrying `i`, a cancellation cancels the combination. Empty input
/// resolves with an empty vector.
pub fn when_all<T: TaskValue>(futures: Vec<Future<T>>) -> Future<Vec<T>> {
  let promise = combined_promise::<Vec<T>, T>(&futures);
  let combined = promise.future();
  if futures.is_empty() {
    let _ = promise.resolve(Vec::new());
    return combined;
  }

  let state = Arc::new(AllState {
    values: Mutex::new(vec![None; futures.len()]),
    remaining: AtomicUsize::new(futures.len()),
    losers: Losers::new(&futures),
  });
  {
    let state = state.clone();
    combined.on_cancel(move || state.losers.cancel_except(None));
  }

  for (index, input) in futures.iter().enumerate() {
    let state = state.clone();
    let promise = promise.clone();
    input.on_complete(move |outcome| match outcome {
      Outcome::Success(value) => {
        let mut values = state.values.lock();
        values[index] = Some(value);
        if state.remaining.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
          let collected: Option<Vec<T>> = values.drain(..).collect();
          drop(values);
          state.losers.forget();
          if let Some(collected) = collected {
            let _ = promise.resolve(collected);
          }
        }
      }
      Outcome::Failure(err) => {
        let aggregate = Error::Aggregate {
          index,
          source: Box::new(err),
        };
        if promise.reject(aggregate).is_ok() {
          state.losers.cancel_except(Some(index));
        }
      }
      Outcome::Cancelled => {
        if promise.cancel().is_ok() {
          state.losers.cancel_except(Some(index));
        }
      }
    });
  }
  combined
}

/// Resolves with the first successful value; see [`when_any_matched`].
pub fn when_any<T: TaskValue>(futures: Vec<Future<T>>) -> Future<T> {
  when_any_matched(|_: &T| true, futures)
}

struct AnyState<T> {
  outcomes: Mutex<Vec<Option<BranchOutcome>>>,
  remaining: AtomicUsize,
  losers: Losers<T>,
}

/// Resolves with the first successful value accepted by `predicate` and cancels the rest.
///
/// When every input settles without a match the combination is cancelled if all inputs were
/// cancelled, and otherwise rejected with [`Error::NoMatched`] listing each input's outcome in
/// input order. Empty input rejects with an empty list. A panicking predicate counts as a
/// failure of that input.
pub fn when_any_matched<T, P>(predicate: P, futures: Vec<Future<T>>) -> Future<T>
where
  T: TaskValue,
  P: Fn(&T) -> bool + Send + Sync + 'static,
{
  let promise = combined_promise::<T, T>(&futures);
  let combined = promise.future();
  if futures.is_empty() {
    let _ = promise.reject(Error::NoMatched { outcomes: Vec::new() });
    return combined;
  }

  let predicate = Arc::new(predicate);
  let state = Arc::new(AnyState {
    outcomes: Mutex::new(vec![None; futures.len()]),
    remaining: AtomicUsize::new(futures.len()),
    losers: Losers::new(&futures),
  });
  {
    let state = state.clone();
    combined.on_cancel(move || state.losers.cancel_except(None));
  }

  for (index, input) in futures.iter().enumerate() {
    let state = state.clone();
    let promise = promise.clone();
    let predicate = predicate.clone();
    input.on_complete(move |outcome| {
      let branch = match outcome {
        Outcome::Success(value) => match panic::catch(|| predicate(&value)) {
          Ok(true) => {
            if promise.resolve(value).is_ok() {
              state.losers.cancel_except(Some(index));
            }
            None
          }
          Ok(false) => Some(BranchOutcome::Unmatched),
          Err(capture) => Some(BranchOutcome::Failed(capture.into_error())),
        },
        Outcome::Failure(err) => Some(BranchOutcome::Failed(err)),
        Outcome::Cancelled => Some(BranchOutcome::Cancelled),
      };

      let mut outcomes = state.outcomes.lock();
      if let Some(branch) = branch {
        outcomes[index] = Some(branch);
      }
      if state.remaining.fetch_sub(1, AtomicOrdering::AcqRel) != 1 {
        return;
      }
      let outcomes: Vec<BranchOutcome> = outcomes
        .drain(..)
        .map(|branch| branch.unwrap_or(BranchOutcome::Unmatched))
        .collect();
      state.losers.forget();
      if outcomes.iter().all(|branch| matches!(branch, BranchOutcome::Cancelled)) {
        let _ = promise.cancel();
      } else {
        let _ = promise.reject(Error::NoMatched { outcomes });
      }
    });
  }
  combined
}
