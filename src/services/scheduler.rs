use std::time::Duration;

use tokio::time::sleep;

use crate::state::AppState;

/// Spawn the background scheduler that runs periodic jobs.
///
/// Each job runs in its own `tokio::spawn` so a failure in one job never
/// crashes the scheduler loop.
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!("Background scheduler started");

    let pool = match state.db_pool.as_ref() {
        Some(p) => p.clone(),
        None => {
            tracing::warn!("Scheduler: no database pool configured, exiting");
            return;
        }
    };

    // Snapshot rows carry expires_at; this sweep is what actually enforces it.
    let sweep_interval =
        Duration::from_secs(state.config.report_sweep_interval_seconds.max(3600));

    let mut last_sweep_run: Option<tokio::time::Instant> = None;

    loop {
        let due = match last_sweep_run {
            None => true,
            Some(last) => tokio::time::Instant::now().duration_since(last) >= sweep_interval,
        };

        if due {
            last_sweep_run = Some(tokio::time::Instant::now());
            let pool = pool.clone();
            tokio::spawn(async move {
                match crate::services::report_store::purge_expired(&pool).await {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!(deleted, "Scheduler: expired report snapshots purged");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(error = %error, "Scheduler: snapshot purge failed");
                    }
                }
            });
        }

        sleep(Duration::from_secs(60)).await;
    }
}
