use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, info_span, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::job::{ArtifactRefs, Job, JobStage, JobStatus},
    },
    utils::config::AppConfig,
};

use crate::utils::{
    audio_transcription::transcribe_audio, summarization::summarize_transcript,
};

/// Outcome of driving a claimed job through its remaining stages.
#[derive(Debug, PartialEq, Eq)]
enum StageOutcome {
    Completed,
    /// A lease-guarded update matched nothing: the lease was reaped and the
    /// job may already belong to another runner. The job is abandoned without
    /// touching it further.
    LeaseLost,
}

pub struct TranscriptionPipeline {
    db: Arc<SurrealDbClient>,
    openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    storage: StorageManager,
    config: AppConfig,
}

impl TranscriptionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        openai_client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        storage: StorageManager,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            openai_client,
            storage,
            config,
        }
    }

    pub async fn process_job(&self, job: Job, runner_id: &str) -> Result<(), AppError> {
        let job_id = job.id.clone();
        let attempt = job.retry_count;
        let span = info_span!(
            "transcription_job",
            %job_id,
            %runner_id,
            attempt,
            stage = %job.stage.as_str()
        );
        let _enter = span.enter();

        let Some(lease_started) = job.started_at else {
            warn!(%job_id, "claimed job carries no lease start; abandoning");
            return Ok(());
        };

        match self.run_stages(&job, runner_id, lease_started).await {
            Ok(StageOutcome::Completed) => {
                info!(%job_id, attempt, "transcription job succeeded");
                Ok(())
            }
            Ok(StageOutcome::LeaseLost) => {
                warn!(%job_id, "lease no longer held; abandoning job");
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                match job
                    .mark_failed(runner_id, lease_started, reason.clone(), &self.db)
                    .await?
                {
                    Some(updated) if updated.status == JobStatus::Pending => {
                        warn!(
                            %job_id,
                            retry_count = updated.retry_count,
                            max_retries = updated.max_retries,
                            "transcription job failed; requeued for retry"
                        );
                    }
                    Some(updated) => {
                        warn!(
                            %job_id,
                            retry_count = updated.retry_count,
                            "transcription job failed; retries exhausted"
                        );
                    }
                    None => {
                        warn!(%job_id, "failure report ignored; lease no longer held");
                    }
                }

                Err(AppError::Processing(reason))
            }
        }
    }

    /// Drives the job from its claimed stage to completion. A job claimed at
    /// `summarizing` with a stored transcript resumes there instead of
    /// re-running speech-to-text.
    async fn run_stages(
        &self,
        job: &Job,
        runner_id: &str,
        lease_started: chrono::DateTime<chrono::Utc>,
    ) -> Result<StageOutcome, AppError> {
        let transcript = match (&job.stage, job.storage_path.as_deref()) {
            (JobStage::Summarizing, Some(location)) => {
                info!(%location, "resuming from stored transcript");
                let bytes = self.storage.get(location).await?;
                String::from_utf8(bytes.to_vec()).map_err(|e| {
                    AppError::Processing(format!("Stored transcript is not valid UTF-8: {}", e))
                })?
            }
            (JobStage::Summarizing, None) => {
                return Err(AppError::Processing(
                    "Job is in summarizing stage without a stored transcript".to_string(),
                ));
            }
            _ => match self.transcribe_stage(job, runner_id, lease_started).await? {
                Some(text) => text,
                None => return Ok(StageOutcome::LeaseLost),
            },
        };

        let summary = summarize_transcript(
            &self.openai_client,
            &self.config.summary_model,
            &job.audio_file_name,
            &transcript,
        )
        .await?;

        let summary_location = StorageManager::summary_location(&job.id);
        self.storage
            .put(&summary_location, Bytes::from(summary))
            .await?;

        match job
            .mark_completed(runner_id, lease_started, Some(summary_location), &self.db)
            .await?
        {
            Some(_) => Ok(StageOutcome::Completed),
            None => Ok(StageOutcome::LeaseLost),
        }
    }

    /// Runs speech-to-text and persists the transcript artifacts. Returns the
    /// transcript text, or `None` when the lease was lost along the way.
    async fn transcribe_stage(
        &self,
        job: &Job,
        runner_id: &str,
        lease_started: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<String>, AppError> {
        let Some(job) = job
            .advance_stage(runner_id, lease_started, JobStage::Transcribing, None, &self.db)
            .await?
        else {
            return Ok(None);
        };

        let audio = self.storage.get(&job.audio_path).await?;
        let transcription = transcribe_audio(
            &self.openai_client,
            &self.config.transcription_model,
            &job.audio_file_name,
            audio,
        )
        .await?;

        let transcript_location = StorageManager::transcript_location(&job.id);
        let segments_location = StorageManager::segments_location(&job.id);

        self.storage
            .put(
                &transcript_location,
                Bytes::from(transcription.text.clone()),
            )
            .await?;
        let segments_json = serde_json::to_vec(&transcription.segments)
            .map_err(|e| AppError::Processing(format!("Failed to encode segments: {}", e)))?;
        self.storage
            .put(&segments_location, Bytes::from(segments_json))
            .await?;

        let advanced = job
            .advance_stage(
                runner_id,
                lease_started,
                JobStage::Summarizing,
                Some(ArtifactRefs {
                    storage_path: Some(transcript_location),
                    segments_path: Some(segments_location),
                }),
                &self.db,
            )
            .await?;

        if advanced.is_none() {
            return Ok(None);
        }

        Ok(Some(transcription.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn test_pipeline() -> (TranscriptionPipeline, Arc<SurrealDbClient>) {
        let db = Arc::new(
            SurrealDbClient::memory("test", &uuid::Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("initialized");

        let config = AppConfig::default();
        let storage = StorageManager::new(&config)
            .await
            .expect("memory storage backend");
        let openai_client = Arc::new(async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        ));

        (
            TranscriptionPipeline::new(db.clone(), openai_client, storage, config),
            db,
        )
    }

    #[tokio::test]
    async fn unclaimed_job_is_abandoned_as_lease_lost() {
        let (pipeline, db) = test_pipeline().await;

        // Stored but never claimed: no lease exists for this runner, so the
        // first lease-guarded update matches nothing.
        let job = Job::create_and_store(
            "owner".into(),
            "audio/j/clip.wav".into(),
            "clip.wav".into(),
            "audio/x-wav".into(),
            3,
            &db,
        )
        .await
        .expect("job stored");

        let outcome = pipeline
            .run_stages(&job, "runner-without-lease", Utc::now())
            .await
            .expect("no error for lost lease");
        assert_eq!(outcome, StageOutcome::LeaseLost);

        let unchanged: Job = db.get_item(&job.id).await.expect("query").expect("row");
        assert_eq!(unchanged.status, JobStatus::Pending);
        assert_eq!(unchanged.stage, JobStage::Uploading);
    }

    #[tokio::test]
    async fn summarizing_job_without_transcript_errors() {
        let (pipeline, db) = test_pipeline().await;

        let job = Job::create_and_store(
            "owner".into(),
            "audio/j/clip.wav".into(),
            "clip.wav".into(),
            "audio/x-wav".into(),
            3,
            &db,
        )
        .await
        .expect("job stored");
        let claimed = Job::claim_next_pending(&db, "runner-1", Utc::now())
            .await
            .expect("claim query")
            .expect("job claimed");
        let mut claimed = claimed;
        claimed.stage = JobStage::Summarizing;
        claimed.storage_path = None;
        let lease = claimed.started_at.expect("claimed job has a lease start");

        let err = pipeline
            .run_stages(&claimed, "runner-1", lease)
            .await
            .expect_err("missing transcript is an error");
        assert!(matches!(err, AppError::Processing(_)));
        assert_eq!(job.id, claimed.id);
    }
}
