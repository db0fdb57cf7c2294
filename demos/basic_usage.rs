use promise_orchestra::{Error, Governor, LaunchOptions, PoolOptions, Scope, ScopeConfig, Task};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

async fn fetch_quote(id: u32) -> Result<String, Error> {
  tokio::time::sleep(Duration::from_millis(50 * id as u64)).await;
  Ok(format!("quote #{id}"))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();
  info!("--- Basic Usage Example ---");

  let governor = Arc::new(Governor::new());
  let scope = Scope::new(governor, "quotes", ScopeConfig::default().with_max_routines(16));

  // A promise resolved by hand.
  let promise = scope.new_promise::<u32>();
  let doubled = promise.future().map(|value| value * 2);
  promise.resolve(21)?;
  info!("Doubled value: {}", doubled.get().await?);

  // A task launched on a governed slot.
  let quote = scope
    .promise(Task::future(fetch_quote(3)), true, LaunchOptions::new().named("fetch-quote"))
    .await?;
  quote.on_success(|text| info!("Callback saw: {}", text));
  info!("Awaited: {}", quote.get().await?);

  // A named pool of two workers.
  let pool = scope.new_pool("io", 2, PoolOptions::new()).await?;
  for id in 1..=4 {
    let future = pool.submit_task(Task::future(fetch_quote(id))).await?;
    future.on_complete(move |outcome| info!("Pool job {} finished: {:?}", id, outcome.into_result()));
  }
  info!("Pool stats: running={}, waiting={}, free={}", pool.running(), pool.waiting(), pool.free());

  let report = scope.shutdown(Duration::from_secs(5)).await;
  info!("Shutdown report: {:?}", report);
  Ok(())
}
