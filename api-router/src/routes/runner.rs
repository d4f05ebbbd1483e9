use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use common::storage::types::job::{ArtifactRefs, Job, JobStage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct ClaimParams {
    pub runner_id: String,
}

/// Everything a runner needs to process the job it just claimed. The
/// `started_at` timestamp is the lease token alongside the runner id and
/// must be echoed back verbatim in every report for this attempt.
#[derive(Debug, Serialize)]
pub struct ClaimedJob {
    pub id: String,
    pub stage: JobStage,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub audio_path: String,
    pub audio_file_name: String,
    pub audio_mime_type: String,
    pub storage_path: Option<String>,
    pub segments_path: Option<String>,
}

impl ClaimedJob {
    fn new(job: Job, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            id: job.id,
            stage: job.stage,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            started_at,
            audio_path: job.audio_path,
            audio_file_name: job.audio_file_name,
            audio_mime_type: job.audio_mime_type,
            storage_path: job.storage_path,
            segments_path: job.segments_path,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProgressParams {
    pub runner_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub stage: JobStage,
    pub storage_path: Option<String>,
    pub segments_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteParams {
    pub runner_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub summary_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FailParams {
    pub runner_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub error_message: String,
}

pub async fn claim_job(
    State(state): State<ApiState>,
    Json(params): Json<ClaimParams>,
) -> Result<impl IntoResponse, ApiError> {
    if params.runner_id.trim().is_empty() {
        return Err(ApiError::ValidationError(
            "runner_id must not be empty".to_string(),
        ));
    }

    let now = chrono::Utc::now();
    match Job::claim_next_pending(&state.db, &params.runner_id, now).await? {
        Some(job) => {
            info!(
                job_id = %job.id,
                runner_id = %params.runner_id,
                stage = %job.stage.as_str(),
                retry_count = job.retry_count,
                "Runner claimed job"
            );
            Ok((StatusCode::OK, Json(ClaimedJob::new(job, now))).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn report_progress(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(params): Json<ProgressParams>,
) -> Result<impl IntoResponse, ApiError> {
    let job = load_job(&state, &id).await?;

    let artifacts = if params.storage_path.is_some() || params.segments_path.is_some() {
        Some(ArtifactRefs {
            storage_path: params.storage_path,
            segments_path: params.segments_path,
        })
    } else {
        None
    };

    match job
        .advance_stage(
            &params.runner_id,
            params.started_at,
            params.stage,
            artifacts,
            &state.db,
        )
        .await?
    {
        Some(updated) => {
            info!(
                job_id = %updated.id,
                runner_id = %params.runner_id,
                stage = %updated.stage.as_str(),
                "Recorded stage progress"
            );
            Ok((StatusCode::OK, Json(json!({ "status": "ok" }))))
        }
        None => Ok(stale_report(&id, &params.runner_id, "progress")),
    }
}

pub async fn complete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(params): Json<CompleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    let job = load_job(&state, &id).await?;

    match job
        .mark_completed(
            &params.runner_id,
            params.started_at,
            params.summary_path,
            &state.db,
        )
        .await?
    {
        Some(updated) => {
            info!(
                job_id = %updated.id,
                runner_id = %params.runner_id,
                processing_time_seconds = updated.processing_time_seconds,
                "Job completed"
            );
            Ok((StatusCode::OK, Json(json!({ "status": "ok" }))))
        }
        None => Ok(stale_report(&id, &params.runner_id, "complete")),
    }
}

pub async fn fail_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(params): Json<FailParams>,
) -> Result<impl IntoResponse, ApiError> {
    let job = load_job(&state, &id).await?;

    match job
        .mark_failed(
            &params.runner_id,
            params.started_at,
            params.error_message,
            &state.db,
        )
        .await?
    {
        Some(updated) => {
            info!(
                job_id = %updated.id,
                runner_id = %params.runner_id,
                status = %updated.status.as_str(),
                retry_count = updated.retry_count,
                "Job failure recorded"
            );
            Ok((StatusCode::OK, Json(json!({ "status": "ok" }))))
        }
        None => Ok(stale_report(&id, &params.runner_id, "fail")),
    }
}

async fn load_job(state: &ApiState, id: &str) -> Result<Job, ApiError> {
    let job: Option<Job> = state
        .db
        .get_item::<Job>(id)
        .await
        .map_err(common::error::AppError::from)?;
    job.ok_or_else(|| ApiError::NotFound(format!("Job {id} not found")))
}

/// A report that no longer matches the lease is a no-op, not an error. The
/// reporting runner lost its lease and another runner may already own the job.
fn stale_report(job_id: &str, runner_id: &str, action: &str) -> (StatusCode, Json<serde_json::Value>) {
    warn!(
        job_id = %job_id,
        runner_id = %runner_id,
        action,
        "Ignoring stale runner report"
    );
    (StatusCode::OK, Json(json!({ "status": "stale" })))
}
