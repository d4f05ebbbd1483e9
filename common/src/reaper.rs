use std::sync::Arc;

use chrono::Utc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::{
    storage::{db::SurrealDbClient, types::job::Job},
    utils::config::AppConfig,
};

/// Coordinator-side background loop that requeues jobs whose runner stopped
/// reporting. Runs forever; errors back off and retry rather than abort.
pub async fn run_reaper_loop(db: Arc<SurrealDbClient>, config: AppConfig) {
    let interval = Duration::from_secs(config.reap_interval_secs.max(1));
    let lease_timeout_secs = config.lease_timeout_secs;

    loop {
        match Job::reap_expired(&db, Utc::now(), lease_timeout_secs).await {
            Ok(reaped) if reaped.is_empty() => {}
            Ok(reaped) => {
                for job in &reaped {
                    warn!(
                        job_id = %job.id,
                        retry_count = job.retry_count,
                        status = %job.status.as_str(),
                        "reaped expired lease"
                    );
                }
                info!(count = reaped.len(), "requeued jobs with expired leases");
            }
            Err(err) => {
                error!(error = %err, "lease reaper scan failed");
            }
        }

        sleep(interval).await;
    }
}
