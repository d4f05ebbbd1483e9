#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pipeline;
pub mod utils;

use chrono::Utc;
use common::storage::{db::SurrealDbClient, types::job::Job};
pub use pipeline::TranscriptionPipeline;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    pipeline: Arc<TranscriptionPipeline>,
) -> Result<(), Box<dyn std::error::Error>> {
    let runner_id = format!("transcription-runner-{}", Uuid::new_v4());
    let idle_backoff = Duration::from_millis(500);

    loop {
        match Job::claim_next_pending(&db, &runner_id, Utc::now()).await {
            Ok(Some(job)) => {
                let job_id = job.id.clone();
                info!(
                    %runner_id,
                    %job_id,
                    attempt = job.retry_count,
                    "claimed transcription job"
                );
                if let Err(err) = pipeline.process_job(job, &runner_id).await {
                    error!(%runner_id, %job_id, error = %err, "transcription job failed");
                }
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%runner_id, error = %err, "failed to claim transcription job");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
