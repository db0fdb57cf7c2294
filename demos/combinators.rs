use promise_orchestra::{Error, Future, Governor, Scope, ScopeConfig, Task};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn replica(name: &'static str, latency_ms: u64, healthy: bool) -> Task<&'static str> {
  Task::future(async move {
    tokio::time::sleep(Duration::from_millis(latency_ms)).await;
    if healthy {
      Ok(name)
    } else {
      Err(Error::task(format!("{name} is down")))
    }
  })
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();
  info!("--- Combinators Example ---");

  let governor = Arc::new(Governor::new());
  let scope = Scope::new(governor, "replicas", ScopeConfig::default());

  let all = scope
    .when_all(vec![replica("a", 30, true), replica("b", 10, true), replica("c", 20, true)])
    .await?;
  info!("when_all: {:?}", all.get().await?);

  let fastest_healthy = scope
    .when_any(vec![replica("slow", 200, true), replica("broken", 5, false), replica("fast", 40, true)])
    .await?;
  info!("when_any: {}", fastest_healthy.get().await?);

  let none = scope
    .when_any_matched(|name: &&'static str| name.starts_with('z'), vec![replica("x", 5, true), replica("y", 5, false)])
    .await?;
  match none.get().await {
    Err(err) => info!("when_any_matched: {}", err),
    Ok(name) => info!("when_any_matched unexpectedly picked {}", name),
  }

  let failed = scope
    .when_all(vec![replica("ok", 10, true), replica("bad", 5, false)])
    .await?
    .catch(|err| {
      info!("Recovering from: {}", err);
      Future::resolved(vec!["fallback"])
    });
  info!("when_all with recovery: {:?}", failed.get().await?);

  scope.shutdown(Duration::from_secs(1)).await;
  Ok(())
}
