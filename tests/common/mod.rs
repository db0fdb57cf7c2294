#![allow(dead_code)]

use promise_orchestra::{Governor, Scope, ScopeConfig};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

static TRACING_INIT: Once = Once::new();

// Installs a test-writer subscriber once per test binary.
pub fn setup_tracing_for_test() {
  use tracing_subscriber::{fmt, EnvFilter};

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,promise_orchestra=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

pub fn test_scope(app: &str, config: ScopeConfig) -> (Arc<Governor>, Scope) {
  let governor = Arc::new(Governor::new());
  let scope = Scope::new(governor.clone(), app, config);
  (governor, scope)
}

/// Polls `condition` every few milliseconds until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + within;
  loop {
    if condition() {
      return true;
    }
    if Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
}
