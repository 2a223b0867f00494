//! Periodic purge of finished jobs.
//!
//! Keeps the most recent `keep_completed` completed and `keep_failed` failed
//! root jobs; older ones are deleted together with their flow children.

use std::sync::Arc;
use std::time::Duration;

use hireflow_core::settings::RetentionPolicy;
use hireflow_db::store::JobStore;
use tokio_util::sync::CancellationToken;

/// Run the retention loop until `cancel` is triggered.
pub async fn run(
    store: Arc<dyn JobStore>,
    policy: RetentionPolicy,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        keep_completed = policy.keep_completed,
        keep_failed = policy.keep_failed,
        interval_secs = every.as_secs(),
        "Job retention started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention stopping");
                break;
            }
            _ = interval.tick() => {
                match store.purge_retained(policy).await {
                    Ok(purged) if purged > 0 => {
                        tracing::info!(purged, "Job retention: purged finished jobs");
                    }
                    Ok(_) => tracing::debug!("Job retention: nothing to purge"),
                    Err(e) => tracing::error!(error = %e, "Job retention: purge failed"),
                }
            }
        }
    }
}
