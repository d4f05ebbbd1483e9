use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        store::StorageManager,
        types::{
            job::{Job, JobStage, JobStatus},
            user::User,
        },
    },
};
use mime_guess::from_path;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, TryFromMultipart)]
pub struct SubmitJobParams {
    // The surrounding DefaultBodyLimit governs the upload size.
    #[form_data(limit = "unlimited")]
    pub audio: FieldData<Bytes>,
}

/// Client-facing view of a job. Runner lease internals stay out of it.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub stage: JobStage,
    pub status: JobStatus,
    pub audio_file_name: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub processing_time_seconds: i64,
    pub error_message: Option<String>,
    pub storage_path: Option<String>,
    pub segments_path: Option<String>,
    pub summary_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            stage: job.stage,
            status: job.status,
            audio_file_name: job.audio_file_name,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            processing_time_seconds: job.processing_time_seconds,
            error_message: job.error_message,
            storage_path: job.storage_path,
            segments_path: job.segments_path,
            summary_path: job.summary_path,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

pub async fn submit_job(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    TypedMultipart(input): TypedMultipart<SubmitJobParams>,
) -> Result<impl IntoResponse, ApiError> {
    let file_name = input
        .audio
        .metadata
        .file_name
        .as_deref()
        .ok_or_else(|| ApiError::ValidationError("Audio file name is required".to_string()))?;
    let file_name = sanitize_file_name(file_name);

    if input.audio.contents.is_empty() {
        return Err(ApiError::ValidationError(
            "Audio file must not be empty".to_string(),
        ));
    }

    let mime_type = input
        .audio
        .metadata
        .content_type
        .clone()
        .unwrap_or_else(|| guess_mime_type(&file_name));

    // The audio bytes are persisted before the job row exists, so any job a
    // runner can claim always has retrievable audio.
    let job_id = Uuid::new_v4().to_string();
    let audio_path = StorageManager::audio_location(&job_id, &file_name);
    state
        .storage
        .put(&audio_path, input.audio.contents)
        .await
        .map_err(AppError::from)?;

    // The retry bound is a deployment knob, never client input.
    let mut job = Job::new(
        user.id.clone(),
        audio_path,
        file_name,
        mime_type,
        state.config.max_retries,
    );
    job.id = job_id;

    let stored = state
        .db
        .store_item(job)
        .await
        .map_err(AppError::from)?
        .ok_or_else(|| ApiError::InternalError("Failed to persist job".to_string()))?;

    info!(
        job_id = %stored.id,
        owner_id = %stored.owner_id,
        file_name = %stored.audio_file_name,
        "Accepted transcription job"
    );

    Ok((StatusCode::CREATED, Json(JobView::from(stored))))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = Job::find_for_owner(&state.db, &id, &user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {id} not found")))?;

    Ok(Json(JobView::from(job)))
}

/// Remove a finished job together with its stored audio and artifacts. Jobs
/// under an active lease cannot be deleted out from under their runner.
pub async fn delete_job(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = Job::find_for_owner(&state.db, &id, &user.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {id} not found")))?;

    if job.status == JobStatus::Processing {
        return Err(ApiError::ValidationError(
            "Job is currently processing; wait for it to finish or fail".to_string(),
        ));
    }

    state
        .storage
        .delete_prefix(&format!("audio/{id}/"))
        .await
        .map_err(AppError::from)?;
    state
        .storage
        .delete_prefix(&format!("transcripts/{id}/"))
        .await
        .map_err(AppError::from)?;
    let _removed = state
        .db
        .delete_item::<Job>(&id)
        .await
        .map_err(AppError::from)?;

    info!(job_id = %id, owner_id = %user.id, "Deleted job and artifacts");

    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let jobs = Job::list_for_owner(&state.db, &user.id).await?;

    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}

fn guess_mime_type(file_name: &str) -> String {
    from_path(file_name)
        .first_or(mime::APPLICATION_OCTET_STREAM)
        .to_string()
}

/// Replaces everything but ASCII alphanumerics and '_' in both the stem and
/// the extension with underscores, keeping a single '.' separator, so file
/// names cannot traverse out of the job's audio prefix.
fn sanitize_file_name(file_name: &str) -> String {
    fn sanitize_part(part: &str) -> String {
        part.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    match file_name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}.{}", sanitize_part(stem), sanitize_part(ext)),
        None => sanitize_part(file_name),
    }
}
