use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error accepted from task bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by futures, launchers, the governor and named pools.
///
/// `Error` is cheaply cloneable so that every reader of a settled [`Future`](crate::Future)
/// observes the very same failure.
#[derive(Error, Debug, Clone)]
pub enum Error {
  #[error("Future was already completed")]
  AlreadyCompleted,

  #[error("Future was cancelled")]
  Cancelled,

  #[error("Pool overloaded: '{app}' requested {requested} slot(s) but only {available} available")]
  PoolOverloaded {
    app: String,
    requested: usize,
    available: usize,
  },

  #[error("Timed out after {after:?} waiting for {what}")]
  Timeout { what: &'static str, after: Duration },

  #[error("A pool named '{name}' is already registered for app '{app}'")]
  DuplicatePoolName { app: String, name: String },

  #[error("Pool '{name}' has been released and no longer accepts tasks")]
  PoolClosed { name: String },

  #[error("App '{app}' is shutting down, cannot launch new tasks")]
  ShuttingDown { app: String },

  #[error("App '{app}' has no registered budget")]
  UnknownApp { app: String },

  #[error("Task at index {index} failed: {source}")]
  Aggregate {
    index: usize,
    #[source]
    source: Box<Error>,
  },

  #[error("No task matched: {}", summarize(.outcomes))]
  NoMatched { outcomes: Vec<BranchOutcome> },

  #[error("No continuation was registered for the resolved value")]
  NoContinuation,

  #[error("Task panicked: {message}")]
  Panicked {
    message: String,
    stack: Arc<Backtrace>,
  },

  #[error(transparent)]
  Task(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
  /// Wraps an arbitrary task error.
  ///
  /// An `Error` that was boxed on its way out of a task body is unwrapped instead of being
  /// nested inside `Error::Task`.
  pub fn task<E: Into<BoxError>>(err: E) -> Self {
    let boxed: BoxError = err.into();
    match boxed.downcast::<Error>() {
      Ok(own) => *own,
      Err(other) => Error::Task(Arc::from(other)),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Error::Cancelled)
  }

  pub fn is_panic(&self) -> bool {
    matches!(self, Error::Panicked { .. })
  }

  /// Returns the stack captured at the panic point, for `Error::Panicked`.
  pub fn backtrace(&self) -> Option<&Backtrace> {
    match self {
      Error::Panicked { stack, .. } => Some(stack.as_ref()),
      _ => None,
    }
  }
}

/// Per-input outcome recorded by [`when_any_matched`](crate::when_any_matched) when no input
/// produced a matching value.
#[derive(Debug, Clone)]
pub enum BranchOutcome {
  /// Succeeded, but the predicate rejected the value.
  Unmatched,
  Failed(Error),
  Cancelled,
}

impl fmt::Display for BranchOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BranchOutcome::Unmatched => f.write_str("unmatched"),
      BranchOutcome::Failed(err) => write!(f, "failed ({err})"),
      BranchOutcome::Cancelled => f.write_str("cancelled"),
    }
  }
}

fn summarize(outcomes: &[BranchOutcome]) -> String {
  if outcomes.is_empty() {
    return "no inputs".to_string();
  }
  outcomes
    .iter()
    .enumerate()
    .map(|(index, outcome)| format!("#{index} {outcome}"))
    .collect::<Vec<_>>()
    .join(", ")
}
