use std::{sync::Arc, time::Duration};

use cyclerate::{
    Activity, ActivityDef, BoxError, CycleStatus, Reporter, ScenarioController, SharedAction,
    report::StdoutReporter,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let controller = ScenarioController::default();
    controller.register("noop", |_: &ActivityDef| -> Result<Arc<dyn Activity>, BoxError> {
        // Whatever is expensive belongs here, not in the action
        Ok(Arc::new(SharedAction::new(|cycle: u64| {
            if cycle % 1000 == 999 {
                CycleStatus::Done(1)
            } else {
                CycleStatus::OK
            }
        })))
    });

    // Start slow, then speed up and widen while it runs
    let executor = controller
        .start_str("alias=noop_demo;threads=2;cycles=20K;cyclerate=2000")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    controller.modify("noop_demo", "cyclerate", "10000").await.unwrap();
    controller.modify("noop_demo", "threads", "4").await.unwrap();

    executor.await_finish(Duration::from_secs(30)).await.unwrap();
    StdoutReporter.report(executor.report().await).await.unwrap();
}
