//! A Tokio-based promise engine with admission-controlled task launching, named worker pools,
//! join/race combinators and graceful shutdown.

mod capacity_gate;
mod combinator;
mod config;
mod error;
mod future;
mod governor;
mod lifecycle;
mod outcome;
mod panic;
mod pool;
mod promise;
mod scope;
mod task;
mod task_queue;

pub use combinator::{when_all, when_any, when_any_matched};
pub use config::{FailureHook, FailureReport, LaunchOptions, PoolOptions, ScopeConfig};
pub use error::{BoxError, BranchOutcome, Error};
pub use future::{Future, Pipe};
pub use governor::{AdmissionWait, Budget, BudgetStats, Governor, Grant, GrantKind, TaskRecord};
pub use lifecycle::{ShutdownHook, ShutdownReport};
pub use outcome::{FutureState, Outcome, TaskValue};
pub use pool::Pool;
pub use promise::{Canceller, Promise};
pub use scope::{Scope, ScopeStats};
pub use task::Task;
