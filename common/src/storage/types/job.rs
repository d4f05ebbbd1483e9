use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Pipeline position of a job's content. Advances forward only; `Failed` is
/// terminal and reached exclusively through retry exhaustion.
#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    #[default]
    Uploading,
    Transcribing,
    Summarizing,
    Completed,
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Uploading => "uploading",
            JobStage::Transcribing => "transcribing",
            JobStage::Summarizing => "summarizing",
            JobStage::Completed => "completed",
            JobStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Completed | JobStage::Failed)
    }

    /// Position in the pipeline order, for monotonicity checks.
    pub fn pipeline_index(&self) -> u8 {
        match self {
            JobStage::Uploading => 0,
            JobStage::Transcribing => 1,
            JobStage::Summarizing => 2,
            JobStage::Completed => 3,
            JobStage::Failed => 4,
        }
    }

    /// Stages a job may be in when advancing to `self`. Re-entering the same
    /// stage is legal so a retried attempt can resume at the boundary it
    /// failed in.
    fn advance_sources(&self) -> Option<Vec<&'static str>> {
        match self {
            JobStage::Transcribing => Some(vec![
                JobStage::Uploading.as_str(),
                JobStage::Transcribing.as_str(),
            ]),
            JobStage::Summarizing => Some(vec![
                JobStage::Transcribing.as_str(),
                JobStage::Summarizing.as_str(),
            ]),
            // `completed` and `failed` are only reached through the
            // complete/fail transitions, never a plain stage advance.
            _ => None,
        }
    }
}

/// Claim/ownership state of a job, independent of `stage`.
#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Artifact locations reported by a runner alongside a stage advance.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ArtifactRefs {
    pub storage_path: Option<String>,
    pub segments_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum StatusTransition {
    Claim,
    Complete,
    Retry,
    Exhaust,
}

impl StatusTransition {
    fn as_str(&self) -> &'static str {
        match self {
            StatusTransition::Claim => "claim",
            StatusTransition::Complete => "complete",
            StatusTransition::Retry => "retry",
            StatusTransition::Exhaust => "exhaust",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobStatusMachine,
        initial: Pending,
        states: [Pending, Processing, Completed, Failed],
        events {
            claim {
                transition: { from: Pending, to: Processing }
            }
            complete {
                transition: { from: Processing, to: Completed }
            }
            retry {
                transition: { from: Processing, to: Pending }
            }
            exhaust {
                transition: { from: Processing, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> JobStatusMachine<(), Pending> {
        JobStatusMachine::new(())
    }

    pub(super) fn processing() -> JobStatusMachine<(), Processing> {
        pending()
            .claim()
            .expect("claim transition from Pending should exist")
    }
}

fn invalid_transition(status: &JobStatus, event: StatusTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid job transition: {} -> {}",
        status.as_str(),
        event.as_str()
    ))
}

fn compute_next_status(
    status: &JobStatus,
    event: StatusTransition,
) -> Result<JobStatus, AppError> {
    use lifecycle::*;
    match (status, event) {
        (JobStatus::Pending, StatusTransition::Claim) => pending()
            .claim()
            .map(|_| JobStatus::Processing)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Processing, StatusTransition::Complete) => processing()
            .complete()
            .map(|_| JobStatus::Completed)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Processing, StatusTransition::Retry) => processing()
            .retry()
            .map(|_| JobStatus::Pending)
            .map_err(|_| invalid_transition(status, event)),
        (JobStatus::Processing, StatusTransition::Exhaust) => processing()
            .exhaust()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(status, event)),
        _ => Err(invalid_transition(status, event)),
    }
}

stored_object!(Job, "job", {
    stage: JobStage,
    status: JobStatus,
    owner_id: String,
    runner_id: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    retry_count: u32,
    max_retries: u32,
    processing_time_seconds: i64,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    audio_path: String,
    audio_file_name: String,
    audio_mime_type: String,
    storage_path: Option<String>,
    segments_path: Option<String>,
    summary_path: Option<String>
});

impl Job {
    pub fn new(
        owner_id: String,
        audio_path: String,
        audio_file_name: String,
        audio_mime_type: String,
        max_retries: u32,
    ) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            stage: JobStage::Uploading,
            status: JobStatus::Pending,
            owner_id,
            runner_id: None,
            started_at: None,
            retry_count: 0,
            max_retries,
            processing_time_seconds: 0,
            error_message: None,
            completed_at: None,
            audio_path,
            audio_file_name,
            audio_mime_type,
            storage_path: None,
            segments_path: None,
            summary_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Insert the job row. The caller must have persisted the audio bytes to
    /// storage first so a claimable job always has retrievable audio.
    pub async fn create_and_store(
        owner_id: String,
        audio_path: String,
        audio_file_name: String,
        audio_mime_type: String,
        max_retries: u32,
        db: &SurrealDbClient,
    ) -> Result<Job, AppError> {
        let job = Self::new(
            owner_id,
            audio_path,
            audio_file_name,
            audio_mime_type,
            max_retries,
        );
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    /// Atomically claim the oldest pending job for `runner_id`.
    ///
    /// The select and the status flip happen inside one conditional update,
    /// so concurrent callers can never both see `pending` and both win; the
    /// loser gets `None`, never an error.
    pub async fn claim_next_pending(
        db: &SurrealDbClient,
        runner_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Job>, AppError> {
        debug_assert!(compute_next_status(&JobStatus::Pending, StatusTransition::Claim).is_ok());

        const CLAIM_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE status = $pending
                ORDER BY created_at ASC
                LIMIT 1
            )
            SET status = $processing,
                runner_id = $runner_id,
                started_at = $now,
                updated_at = $now
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(CLAIM_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("pending", JobStatus::Pending.as_str()))
            .bind(("processing", JobStatus::Processing.as_str()))
            .bind(("runner_id", runner_id.to_string()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let job: Option<Job> = result.take(0)?;
        Ok(job)
    }

    /// Advance the pipeline stage, optionally recording artifact locations.
    ///
    /// Guarded by the lease token (`runner_id` + `started_at` +
    /// `status = processing`) and by the legal source stages for `next`.
    /// Requiring the claim's `started_at` means a late report from a reaped
    /// lease misses even when the same runner id has since reclaimed the job.
    /// Returns `Ok(None)` when the lease was lost; the caller abandons the
    /// job.
    pub async fn advance_stage(
        &self,
        runner_id: &str,
        lease_started: chrono::DateTime<chrono::Utc>,
        next: JobStage,
        artifacts: Option<ArtifactRefs>,
        db: &SurrealDbClient,
    ) -> Result<Option<Job>, AppError> {
        let from_stages = next.advance_sources().ok_or_else(|| {
            AppError::Validation(format!(
                "Stage {} is not reachable by a stage advance",
                next.as_str()
            ))
        })?;

        const ADVANCE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET stage = $next_stage,
                storage_path = if $storage_path != NONE THEN $storage_path ELSE storage_path END,
                segments_path = if $segments_path != NONE THEN $segments_path ELSE segments_path END,
                updated_at = $now
            WHERE status = $processing
              AND runner_id = $runner_id
              AND started_at = $lease_started
              AND stage IN $from_stages
            RETURN *;
        "#;

        let artifacts = artifacts.unwrap_or_default();
        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(ADVANCE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("next_stage", next.as_str()))
            .bind(("storage_path", artifacts.storage_path))
            .bind(("segments_path", artifacts.segments_path))
            .bind(("processing", JobStatus::Processing.as_str()))
            .bind(("runner_id", runner_id.to_string()))
            .bind(("lease_started", SurrealDatetime::from(lease_started)))
            .bind(("from_stages", from_stages))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<Job> = result.take(0)?;
        Ok(updated)
    }

    /// Terminal success. Idempotent: a duplicate delivery or a report from a
    /// reaped lease matches no row and returns `Ok(None)` without touching
    /// the newer owner's state. `completed_at` is therefore set exactly once.
    pub async fn mark_completed(
        &self,
        runner_id: &str,
        lease_started: chrono::DateTime<chrono::Utc>,
        summary_path: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<Option<Job>, AppError> {
        let next = compute_next_status(&JobStatus::Processing, StatusTransition::Complete)?;
        debug_assert_eq!(next, JobStatus::Completed);

        const COMPLETE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET stage = $completed_stage,
                status = $completed_status,
                completed_at = $now,
                summary_path = if $summary_path != NONE THEN $summary_path ELSE summary_path END,
                processing_time_seconds = processing_time_seconds
                    + (time::unix($now) - time::unix(started_at)),
                error_message = NONE,
                runner_id = NONE,
                started_at = NONE,
                updated_at = $now
            WHERE status = $processing
              AND runner_id = $runner_id
              AND started_at = $lease_started
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(COMPLETE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("completed_stage", JobStage::Completed.as_str()))
            .bind(("completed_status", JobStatus::Completed.as_str()))
            .bind(("summary_path", summary_path))
            .bind(("processing", JobStatus::Processing.as_str()))
            .bind(("runner_id", runner_id.to_string()))
            .bind(("lease_started", SurrealDatetime::from(lease_started)))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<Job> = result.take(0)?;
        Ok(updated)
    }

    /// Failure report. Below the retry bound the job returns to `pending`
    /// with `stage` untouched, so a later attempt resumes from the last
    /// completed stage boundary. At the bound both `stage` and `status`
    /// become terminal `failed`. Stale reports return `Ok(None)`.
    pub async fn mark_failed(
        &self,
        runner_id: &str,
        lease_started: chrono::DateTime<chrono::Utc>,
        error_message: String,
        db: &SurrealDbClient,
    ) -> Result<Option<Job>, AppError> {
        debug_assert!(compute_next_status(&JobStatus::Processing, StatusTransition::Retry).is_ok());
        debug_assert!(
            compute_next_status(&JobStatus::Processing, StatusTransition::Exhaust).is_ok()
        );

        const FAIL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = if retry_count + 1 >= max_retries THEN $failed_status ELSE $pending_status END,
                stage = if retry_count + 1 >= max_retries THEN $failed_stage ELSE stage END,
                retry_count = retry_count + 1,
                error_message = $error_message,
                processing_time_seconds = processing_time_seconds
                    + (time::unix($now) - time::unix(started_at)),
                runner_id = NONE,
                started_at = NONE,
                updated_at = $now
            WHERE status = $processing
              AND runner_id = $runner_id
              AND started_at = $lease_started
            RETURN *;
        "#;

        let now = chrono::Utc::now();
        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed_status", JobStatus::Failed.as_str()))
            .bind(("pending_status", JobStatus::Pending.as_str()))
            .bind(("failed_stage", JobStage::Failed.as_str()))
            .bind(("error_message", error_message))
            .bind(("processing", JobStatus::Processing.as_str()))
            .bind(("runner_id", runner_id.to_string()))
            .bind(("lease_started", SurrealDatetime::from(lease_started)))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<Job> = result.take(0)?;
        Ok(updated)
    }

    /// Requeue every `processing` job whose lease expired, applying exactly
    /// the fail transition. This is the only mutation that happens without a
    /// direct runner call. Returns the reaped jobs.
    pub async fn reap_expired(
        db: &SurrealDbClient,
        now: chrono::DateTime<chrono::Utc>,
        lease_timeout_secs: i64,
    ) -> Result<Vec<Job>, AppError> {
        const REAP_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE status = $processing
                  AND started_at != NONE
                  AND time::unix($now) - time::unix(started_at) >= $timeout_secs
            )
            SET status = if retry_count + 1 >= max_retries THEN $failed_status ELSE $pending_status END,
                stage = if retry_count + 1 >= max_retries THEN $failed_stage ELSE stage END,
                retry_count = retry_count + 1,
                error_message = $error_message,
                processing_time_seconds = processing_time_seconds
                    + (time::unix($now) - time::unix(started_at)),
                runner_id = NONE,
                started_at = NONE,
                updated_at = $now
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(REAP_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("processing", JobStatus::Processing.as_str()))
            .bind(("timeout_secs", lease_timeout_secs))
            .bind(("failed_status", JobStatus::Failed.as_str()))
            .bind(("pending_status", JobStatus::Pending.as_str()))
            .bind(("failed_stage", JobStage::Failed.as_str()))
            .bind((
                "error_message",
                "lease expired before the runner reported".to_string(),
            ))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let reaped: Vec<Job> = result.take(0)?;
        Ok(reaped)
    }

    /// Owner-scoped read used by the job view endpoint.
    pub async fn find_for_owner(
        db: &SurrealDbClient,
        id: &str,
        owner_id: &str,
    ) -> Result<Option<Job>, AppError> {
        let job: Option<Job> = db.get_item::<Job>(id).await?;
        Ok(job.filter(|j| j.owner_id == owner_id))
    }

    pub async fn list_for_owner(
        db: &SurrealDbClient,
        owner_id: &str,
    ) -> Result<Vec<Job>, AppError> {
        let jobs: Vec<Job> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE owner_id = $owner_id
                 ORDER BY created_at DESC",
            )
            .bind(("table", Self::table_name()))
            .bind(("owner_id", owner_id.to_string()))
            .await?
            .take(0)?;

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = Uuid::new_v4().to_string();
        SurrealDbClient::memory(namespace, &database)
            .await
            .expect("in-memory surrealdb")
    }

    async fn store_job(db: &SurrealDbClient, owner: &str) -> Job {
        Job::create_and_store(
            owner.to_string(),
            format!("audio/{owner}/meeting.wav"),
            "meeting.wav".to_string(),
            "audio/wav".to_string(),
            DEFAULT_MAX_RETRIES,
            db,
        )
        .await
        .expect("store job")
    }

    fn lease_start(job: &Job) -> chrono::DateTime<chrono::Utc> {
        job.started_at.expect("claimed job carries a lease start")
    }

    #[test]
    fn test_stage_order_is_monotonic() {
        assert!(JobStage::Uploading.pipeline_index() < JobStage::Transcribing.pipeline_index());
        assert!(JobStage::Transcribing.pipeline_index() < JobStage::Summarizing.pipeline_index());
        assert!(JobStage::Summarizing.pipeline_index() < JobStage::Completed.pipeline_index());
        assert!(JobStage::Completed.is_terminal());
        assert!(JobStage::Failed.is_terminal());
    }

    #[test]
    fn test_status_machine_rejects_illegal_transitions() {
        assert!(compute_next_status(&JobStatus::Pending, StatusTransition::Complete).is_err());
        assert!(compute_next_status(&JobStatus::Completed, StatusTransition::Claim).is_err());
        assert!(compute_next_status(&JobStatus::Failed, StatusTransition::Retry).is_err());
        assert_eq!(
            compute_next_status(&JobStatus::Pending, StatusTransition::Claim).expect("claim"),
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_new_job_defaults() {
        let job = Job::new(
            "user123".into(),
            "audio/user123/a.wav".into(),
            "a.wav".into(),
            "audio/wav".into(),
            DEFAULT_MAX_RETRIES,
        );

        assert_eq!(job.stage, JobStage::Uploading);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert!(job.runner_id.is_none());
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.storage_path.is_none());
        assert!(job.segments_path.is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let db = memory_db().await;
        let job = store_job(&db, "user123").await;

        let first = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
            .await
            .expect("claim");
        let first = first.expect("job claimed");
        assert_eq!(first.id, job.id);
        assert_eq!(first.status, JobStatus::Processing);
        assert_eq!(first.runner_id.as_deref(), Some("runner-1"));
        assert!(first.started_at.is_some());

        // Nothing left to claim while the lease is held.
        let second = Job::claim_next_pending(&db, "runner-2", chrono::Utc::now())
            .await
            .expect("claim");
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_single_winner() {
        let db = memory_db().await;
        store_job(&db, "user123").await;

        let now = chrono::Utc::now();
        let (a, b) = tokio::join!(
            Job::claim_next_pending(&db, "r1", now),
            Job::claim_next_pending(&db, "r2", now),
        );
        let a = a.expect("claim a");
        let b = b.expect("claim b");

        assert!(
            a.is_some() ^ b.is_some(),
            "exactly one concurrent claim must win, got a={:?} b={:?}",
            a.map(|j| j.runner_id),
            b.map(|j| j.runner_id)
        );
    }

    #[tokio::test]
    async fn test_claims_are_fifo() {
        let db = memory_db().await;
        let older = Job::new(
            "user123".into(),
            "audio/1.wav".into(),
            "1.wav".into(),
            "audio/wav".into(),
            DEFAULT_MAX_RETRIES,
        );
        let mut newer = Job::new(
            "user123".into(),
            "audio/2.wav".into(),
            "2.wav".into(),
            "audio/wav".into(),
            DEFAULT_MAX_RETRIES,
        );
        newer.created_at = older.created_at + chrono::Duration::seconds(5);
        db.store_item(older.clone()).await.expect("store older");
        db.store_item(newer).await.expect("store newer");

        let claimed = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("job claimed");
        assert_eq!(claimed.id, older.id, "oldest pending job is served first");
    }

    #[tokio::test]
    async fn test_stage_advance_records_artifacts() {
        let db = memory_db().await;
        store_job(&db, "user123").await;

        let claimed = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimed");

        let lease = lease_start(&claimed);
        let transcribing = claimed
            .advance_stage("runner-1", lease, JobStage::Transcribing, None, &db)
            .await
            .expect("advance")
            .expect("lease held");
        assert_eq!(transcribing.stage, JobStage::Transcribing);
        assert_eq!(transcribing.status, JobStatus::Processing);

        let artifacts = ArtifactRefs {
            storage_path: Some("transcripts/j/transcript.txt".into()),
            segments_path: Some("transcripts/j/segments.json".into()),
        };
        let summarizing = transcribing
            .advance_stage("runner-1", lease, JobStage::Summarizing, Some(artifacts), &db)
            .await
            .expect("advance")
            .expect("lease held");
        assert_eq!(summarizing.stage, JobStage::Summarizing);
        assert_eq!(
            summarizing.storage_path.as_deref(),
            Some("transcripts/j/transcript.txt")
        );
        assert_eq!(
            summarizing.segments_path.as_deref(),
            Some("transcripts/j/segments.json")
        );
    }

    #[tokio::test]
    async fn test_stage_cannot_regress() {
        let db = memory_db().await;
        store_job(&db, "user123").await;

        let claimed = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimed");
        let lease = lease_start(&claimed);
        let summarizing = claimed
            .advance_stage("runner-1", lease, JobStage::Transcribing, None, &db)
            .await
            .expect("advance")
            .expect("lease held")
            .advance_stage("runner-1", lease, JobStage::Summarizing, None, &db)
            .await
            .expect("advance")
            .expect("lease held");

        // A summarizing job is past the transcribing boundary.
        let regressed = summarizing
            .advance_stage("runner-1", lease, JobStage::Transcribing, None, &db)
            .await
            .expect("advance call");
        assert!(regressed.is_none());

        // Terminal stages are unreachable via plain advances.
        assert!(summarizing
            .advance_stage("runner-1", lease, JobStage::Completed, None, &db)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_complete_sets_terminal_state_once() {
        let db = memory_db().await;
        store_job(&db, "user123").await;

        let claimed = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimed");

        let lease = lease_start(&claimed);
        let completed = claimed
            .mark_completed(
                "runner-1",
                lease,
                Some("transcripts/j/summary.md".into()),
                &db,
            )
            .await
            .expect("complete")
            .expect("lease held");
        assert_eq!(completed.stage, JobStage::Completed);
        assert_eq!(completed.status, JobStatus::Completed);
        assert!(completed.completed_at.is_some());
        assert!(completed.runner_id.is_none());
        assert!(completed.started_at.is_none());
        assert!(completed.error_message.is_none());
        assert_eq!(
            completed.summary_path.as_deref(),
            Some("transcripts/j/summary.md")
        );

        // Duplicate delivery is a no-op.
        let duplicate = claimed
            .mark_completed("runner-1", lease, None, &db)
            .await
            .expect("duplicate complete call");
        assert!(duplicate.is_none());

        let stored: Job = db
            .get_item::<Job>(&completed.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.completed_at, completed.completed_at);
    }

    #[tokio::test]
    async fn test_fail_requeues_and_preserves_stage() {
        let db = memory_db().await;
        store_job(&db, "user123").await;

        let claimed = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimed");
        let lease = lease_start(&claimed);
        let summarizing = claimed
            .advance_stage("runner-1", lease, JobStage::Transcribing, None, &db)
            .await
            .expect("advance")
            .expect("lease held")
            .advance_stage(
                "runner-1",
                lease,
                JobStage::Summarizing,
                Some(ArtifactRefs {
                    storage_path: Some("transcripts/j/transcript.txt".into()),
                    segments_path: None,
                }),
                &db,
            )
            .await
            .expect("advance")
            .expect("lease held");

        let failed = summarizing
            .mark_failed("runner-1", lease, "model timeout".into(), &db)
            .await
            .expect("fail")
            .expect("lease held");
        assert_eq!(failed.status, JobStatus::Pending);
        assert_eq!(failed.stage, JobStage::Summarizing, "stage survives retry");
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("model timeout"));
        assert!(failed.runner_id.is_none());
        assert!(failed.started_at.is_none());
        assert_eq!(
            failed.storage_path.as_deref(),
            Some("transcripts/j/transcript.txt"),
            "transcript reference survives for the next attempt"
        );
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let db = memory_db().await;
        let job = Job::create_and_store(
            "user123".into(),
            "audio/a.wav".into(),
            "a.wav".into(),
            "audio/wav".into(),
            2,
            &db,
        )
        .await
        .expect("store");

        for attempt in 1..=2u32 {
            let claimed = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
                .await
                .expect("claim")
                .expect("claimable");
            let failed = claimed
                .mark_failed("runner-1", lease_start(&claimed), "transient".into(), &db)
                .await
                .expect("fail")
                .expect("lease held");
            assert_eq!(failed.retry_count, attempt);
            if attempt < 2 {
                assert_eq!(failed.status, JobStatus::Pending);
            } else {
                assert_eq!(failed.status, JobStatus::Failed);
                assert_eq!(failed.stage, JobStage::Failed);
            }
        }

        // Terminal jobs are no longer claimable.
        let post = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
            .await
            .expect("claim");
        assert!(post.is_none());

        let stored: Job = db
            .get_item::<Job>(&job.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.retry_count, stored.max_retries);
    }

    #[tokio::test]
    async fn test_reap_requeues_expired_lease_and_ignores_stale_report() {
        let db = memory_db().await;
        store_job(&db, "user123").await;

        let claim_time = chrono::Utc::now() - chrono::Duration::seconds(600);
        let claimed = Job::claim_next_pending(&db, "runner-dead", claim_time)
            .await
            .expect("claim")
            .expect("claimed");

        // A fresh lease is left alone.
        let untouched = Job::reap_expired(&db, claim_time, 300)
            .await
            .expect("reap");
        assert!(untouched.is_empty());

        let reaped = Job::reap_expired(&db, chrono::Utc::now(), 300)
            .await
            .expect("reap");
        assert_eq!(reaped.len(), 1);
        let reaped_job = reaped.into_iter().next().expect("reaped job");
        assert_eq!(reaped_job.status, JobStatus::Pending);
        assert_eq!(reaped_job.retry_count, 1);
        assert!(reaped_job.runner_id.is_none());

        // The original runner finally reports; the lease token no longer
        // matches, so the report changes nothing.
        let stale = claimed
            .mark_completed("runner-dead", lease_start(&claimed), None, &db)
            .await
            .expect("stale complete call");
        assert!(stale.is_none());

        // The job is claimable by someone else.
        let reclaimed = Job::claim_next_pending(&db, "runner-2", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimable after reap");
        assert_eq!(reclaimed.runner_id.as_deref(), Some("runner-2"));
    }

    #[tokio::test]
    async fn test_reclaim_by_same_runner_rejects_old_lease_report() {
        let db = memory_db().await;
        store_job(&db, "user123").await;

        let old_start = chrono::Utc::now() - chrono::Duration::seconds(600);
        let first_attempt = Job::claim_next_pending(&db, "runner-1", old_start)
            .await
            .expect("claim")
            .expect("claimed");

        let reaped = Job::reap_expired(&db, chrono::Utc::now(), 300)
            .await
            .expect("reap");
        assert_eq!(reaped.len(), 1);

        // The same runner id picks the requeued job up under a fresh lease.
        let second_attempt = Job::claim_next_pending(&db, "runner-1", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimable after reap");
        assert_eq!(second_attempt.retry_count, 1);

        // The reaped attempt finally reports failure. Its runner id matches
        // the live lease but its `started_at` does not, so the report must
        // not requeue the job out from under the second attempt.
        let stale = first_attempt
            .mark_failed(
                "runner-1",
                lease_start(&first_attempt),
                "slow stt backend".into(),
                &db,
            )
            .await
            .expect("stale fail call");
        assert!(stale.is_none());

        let stored: Job = db
            .get_item::<Job>(&second_attempt.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.runner_id.as_deref(), Some("runner-1"));
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.started_at, second_attempt.started_at);
    }

    #[tokio::test]
    async fn test_example_scenario_race_fail_reclaim_complete() {
        let db = memory_db().await;
        let job = store_job(&db, "user123").await;

        // Two runners race; exactly one wins.
        let now = chrono::Utc::now();
        let (a, b) = tokio::join!(
            Job::claim_next_pending(&db, "r1", now),
            Job::claim_next_pending(&db, "r2", now),
        );
        let a = a.expect("claim a");
        let b = b.expect("claim b");
        assert!(a.is_some() ^ b.is_some());
        let winner = a.or(b).expect("winner");
        assert_eq!(winner.id, job.id);
        let winner_runner = winner.runner_id.clone().expect("winner holds the lease");

        // The winner hits a transient error.
        let failed = winner
            .mark_failed(
                &winner_runner,
                lease_start(&winner),
                "transient stt error".into(),
                &db,
            )
            .await
            .expect("fail")
            .expect("lease held");
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.status, JobStatus::Pending);

        // The other runner picks it up and completes it.
        let second = Job::claim_next_pending(&db, "r2", chrono::Utc::now())
            .await
            .expect("claim")
            .expect("claimable");
        assert_eq!(second.id, job.id);

        let lease = lease_start(&second);
        let done = second
            .advance_stage("r2", lease, JobStage::Transcribing, None, &db)
            .await
            .expect("advance")
            .expect("lease held")
            .advance_stage("r2", lease, JobStage::Summarizing, None, &db)
            .await
            .expect("advance")
            .expect("lease held")
            .mark_completed("r2", lease, None, &db)
            .await
            .expect("complete")
            .expect("lease held");

        assert_eq!(done.stage, JobStage::Completed);
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.retry_count, 1);
    }

    #[tokio::test]
    async fn test_owner_scoped_reads() {
        let db = memory_db().await;
        let job = store_job(&db, "alice").await;
        store_job(&db, "bob").await;

        let found = Job::find_for_owner(&db, &job.id, "alice")
            .await
            .expect("find");
        assert_eq!(found.map(|j| j.id), Some(job.id.clone()));

        let hidden = Job::find_for_owner(&db, &job.id, "bob").await.expect("find");
        assert!(hidden.is_none());

        let alice_jobs = Job::list_for_owner(&db, "alice").await.expect("list");
        assert_eq!(alice_jobs.len(), 1);
    }
}
