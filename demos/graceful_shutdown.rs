use promise_orchestra::{Canceller, Error, Governor, LaunchOptions, Scope, ScopeConfig, Task};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn work(id: usize, duration_ms: u64) -> Task<()> {
  Task::future(async move {
    info!("Task {} starting (will run for {}ms)", id, duration_ms);
    tokio::time::sleep(Duration::from_millis(duration_ms)).await;
    info!("Task {} finished", id);
    Ok::<(), Error>(())
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Graceful Shutdown Example ---");

  let governor = Arc::new(Governor::new());
  let config = ScopeConfig::default()
    .with_max_routines(8)
    .with_shutdown_timeout(Duration::from_millis(1500));
  let scope = Scope::new(governor, "shutdown-demo", config);

  // A heartbeat daemon; shutdown does not wait for it.
  let heartbeat = scope
    .go_loop(
      Task::future_cancellable(|canceller: Canceller| async move {
        let mut ticks = 0u64;
        while !canceller.is_cancelled() {
          ticks += 1;
          tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok::<u64, Error>(ticks)
      }),
      LaunchOptions::new().named("heartbeat"),
    )
    .await
    .expect("heartbeat launch");

  for i in 0..4 {
    let task_name = format!("worker-{i}");
    if let Err(e) = scope.go(work(i, 500), LaunchOptions::new().named(task_name)).await {
      tracing::error!("Failed to launch task {}: {}", i, e);
    }
  }
  // This one outlives the shutdown timeout and shows up in the report.
  let _ = scope.go(work(99, 5000), LaunchOptions::new().named("straggler")).await;

  tokio::time::sleep(Duration::from_millis(100)).await;
  info!("Stats before shutdown: {:?}", scope.stats());

  let report = scope.shutdown_hook().run().await;
  for record in &report.outstanding {
    info!("Still running after shutdown: {} (id {})", record.name, record.id);
  }
  info!("Shutdown took {:?}", report.elapsed);

  match scope.go(work(100, 10), LaunchOptions::new()).await {
    Err(e) => info!("Late launch rejected as expected: {}", e),
    Ok(()) => tracing::error!("Late launch was accepted after shutdown"),
  }
  heartbeat.cancel();
}
