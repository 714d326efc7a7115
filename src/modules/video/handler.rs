use super::dto::{
    CancelJobResponse, JobListResponse, JobStatusResponse, ListJobsQuery, UploadAcceptedResponse,
};
use super::service::VideoService;
use crate::common::error::AppError;
use crate::common::response::{ApiResponse, ApiSuccess};
use crate::common::upload::{SavedUpload, stream_to_disk};
use crate::middleware::auth::{Caller, TokenClaims};
use crate::state::AppState;
use axum::{
    Extension,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use std::path::Path as FsPath;
use uuid::Uuid;
use validator::Validate;

/// Upload a lesson video for transcoding
#[utoipa::path(
    post,
    path = "/api/v1/video/upload",
    request_body(content = String, content_type = "multipart/form-data", description = "Fields: lessonId (UUID), video (file)"),
    responses(
        (status = 202, description = "Upload accepted, transcoding queued", body = ApiResponse<UploadAcceptedResponse>),
        (status = 400, description = "Missing lesson id or video file"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Lesson not found"),
        (status = 503, description = "Transcode queue is full")
    ),
    tag = "Video",
    security(("bearer_auth" = []))
)]
pub async fn upload_video(
    State(state): State<AppState>,
    Extension(claims): Extension<TokenClaims>,
    multipart: Multipart,
) -> impl IntoResponse {
    let (lesson_id, upload) = match read_upload_form(multipart, &state.config.upload_dir).await {
        Ok(form) => form,
        Err(e) => return e.into_response(),
    };

    match VideoService::ingest(&state, claims.sub, lesson_id, upload).await {
        Ok(accepted) => ApiSuccess(
            ApiResponse::success(accepted, "Video accepted for transcoding"),
            StatusCode::ACCEPTED,
        )
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Reads the `lessonId` and `video` fields in any order. The video is
/// streamed to `dir`; if reading the rest of the form fails it is removed.
async fn read_upload_form(
    mut multipart: Multipart,
    dir: &FsPath,
) -> Result<(Option<String>, Option<SavedUpload>), AppError> {
    let mut lesson_id = None;
    let mut upload: Option<SavedUpload> = None;

    let outcome = async {
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
        {
            let name = field.name().unwrap_or("").to_string();
            match name.as_str() {
                "lessonId" => {
                    let text = field.text().await.map_err(|e| {
                        AppError::BadRequest(format!("Unreadable lessonId field: {}", e))
                    })?;
                    lesson_id = Some(text);
                }
                "video" => {
                    if upload.is_some() {
                        return Err(AppError::BadRequest(
                            "Only one video file may be uploaded".to_string(),
                        ));
                    }
                    let saved = stream_to_disk(field, dir)
                        .await
                        .map_err(|e| AppError::BadRequest(format!("Upload failed: {}", e)))?;
                    upload = Some(saved);
                }
                _ => {}
            }
        }
        Ok::<(), AppError>(())
    }
    .await;

    if let Err(e) = outcome {
        if let Some(upload) = &upload {
            upload.discard().await;
        }
        return Err(e);
    }
    Ok((lesson_id, upload))
}

/// Get transcode job status
#[utoipa::path(
    get,
    path = "/api/v1/video/job/{jobId}",
    params(
        ("jobId" = Uuid, Path, description = "Transcode job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = ApiResponse<JobStatusResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "No access to the lesson"),
        (status = 404, description = "Job not found")
    ),
    tag = "Video",
    security(("bearer_auth" = []))
)]
pub async fn get_job_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(job_id): Path<Uuid>,
) -> impl IntoResponse {
    match VideoService::get_job(&state, &caller, job_id).await {
        Ok(job) => ApiSuccess(
            ApiResponse::success(job, "Job retrieved successfully"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// List transcode jobs
#[utoipa::path(
    get,
    path = "/api/v1/video/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs, newest first", body = ApiResponse<JobListResponse>),
        (status = 400, description = "Bad Request"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden")
    ),
    tag = "Video",
    security(("bearer_auth" = []))
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> impl IntoResponse {
    if let Err(e) = query.validate() {
        return AppError::BadRequest(e.to_string()).into_response();
    }

    match VideoService::list_jobs(&state, query).await {
        Ok(jobs) => ApiSuccess(
            ApiResponse::success(jobs, "Jobs retrieved successfully"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Cancel a pending or running transcode job
#[utoipa::path(
    delete,
    path = "/api/v1/video/job/{jobId}/cancel",
    params(
        ("jobId" = Uuid, Path, description = "Transcode job ID")
    ),
    responses(
        (status = 200, description = "Cancellation accepted", body = ApiResponse<CancelJobResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job already finished")
    ),
    tag = "Video",
    security(("bearer_auth" = []))
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    Extension(claims): Extension<TokenClaims>,
    Path(job_id): Path<Uuid>,
) -> impl IntoResponse {
    match VideoService::cancel_job(&state, claims.sub, job_id).await {
        Ok(cancelled) => ApiSuccess(
            ApiResponse::success(cancelled, "Cancellation requested"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => e.into_response(),
    }
}
