use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use askql_connectors::SchemaDriftMonitor;

/// Rebuild every datasource's retrieval index, then run one drift check.
/// Failures are logged per datasource and never stop the pass.
pub async fn startup_pass(monitor: &SchemaDriftMonitor, datasource_ids: &[String]) {
    for id in datasource_ids {
        match monitor.rebuild_index(id).await {
            Ok(count) => info!(datasource = %id, documents = count, "retrieval index ready"),
            Err(e) => warn!(target: "errors", datasource = %id, error = %e, "index rebuild failed"),
        }
        if let Err(e) = monitor.check(id, false).await {
            warn!(target: "errors", datasource = %id, error = %e, "schema check failed");
        }
    }
}

/// Spawn the startup pass followed by a check of every datasource each
/// `poll` interval. With `watch` off only the startup pass runs.
pub fn spawn_drift_loop(
    monitor: Arc<SchemaDriftMonitor>,
    datasource_ids: Vec<String>,
    poll: Duration,
    watch: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        startup_pass(&monitor, &datasource_ids).await;
        if !watch {
            return;
        }

        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup pass covered it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            monitor.run_all().await;
        }
    })
}
