use super::dto::{
    CancelJobResponse, DEFAULT_PER_PAGE, EstimatedCompletion, JobListResponse, JobStatusResponse,
    ListJobsQuery, UploadAcceptedResponse,
};
use super::model::{AuditEntry, JobStatus};
use super::repository::JobFilter;
use super::store::StoreError;
use crate::common::error::AppError;
use crate::common::upload::{SavedUpload, remove_quietly};
use crate::middleware::auth::Caller;
use crate::state::AppState;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

/// Rough wall-clock window for a job: a fixed setup cost plus a per-MiB
/// encode cost, multiplied by the number of queue waves ahead of it.
pub fn estimate_completion(size_bytes: u64, queued_ahead: usize, workers: usize) -> EstimatedCompletion {
    let mib = size_bytes.div_ceil(MIB);
    let waves = (queued_ahead / workers.max(1)) as u64 + 1;

    EstimatedCompletion {
        min_seconds: (30 + mib) * waves,
        max_seconds: (60 + mib * 3) * waves,
    }
}

pub struct VideoService;

impl VideoService {
    /// Validates an upload, creates its job and queues it. The saved file is
    /// removed whenever the upload is rejected.
    pub async fn ingest(
        state: &AppState,
        actor: Uuid,
        lesson_id: Option<String>,
        upload: Option<SavedUpload>,
    ) -> Result<UploadAcceptedResponse, AppError> {
        let result = Self::accept(state, actor, lesson_id, upload.as_ref()).await;
        if result.is_err() {
            if let Some(upload) = &upload {
                upload.discard().await;
            }
        }
        result
    }

    async fn accept(
        state: &AppState,
        actor: Uuid,
        lesson_id: Option<String>,
        upload: Option<&SavedUpload>,
    ) -> Result<UploadAcceptedResponse, AppError> {
        let lesson_id = lesson_id
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .ok_or_else(|| AppError::BadRequest("lessonId is required".to_string()))?;
        let lesson_id = Uuid::parse_str(&lesson_id)
            .map_err(|_| AppError::BadRequest("lessonId must be a UUID".to_string()))?;

        let upload = upload
            .filter(|u| u.size_bytes > 0)
            .ok_or_else(|| AppError::BadRequest("A video file is required".to_string()))?;

        if !state.repos.catalog.lesson_exists(lesson_id).await? {
            return Err(AppError::NotFound("Lesson not found".to_string()));
        }

        if state.queue.is_full() {
            warn!("⚠️ Rejecting upload for lesson {}: transcode queue is full", lesson_id);
            return Err(AppError::ServiceUnavailable(
                "Transcode queue is full, try again later".to_string(),
            ));
        }

        let queued_ahead = state.queue.depth();
        let job = state
            .jobs
            .create(lesson_id, upload.path.clone(), actor)
            .await?;

        if let Err(e) = state.queue.submit(job.id) {
            let reason = e.to_string();
            if let Err(e) = state
                .jobs
                .update(job.id, |j| j.fail(OffsetDateTime::now_utc(), reason.clone()))
                .await
            {
                warn!("⚠️ Could not fail unqueued job {}: {}", job.id, e);
            }
            return Err(AppError::ServiceUnavailable(
                "Transcode queue is full, try again later".to_string(),
            ));
        }

        info!(
            "📥 Accepted {} ({} bytes) for lesson {} as job {}",
            upload.original_name, upload.size_bytes, lesson_id, job.id
        );
        state
            .repos
            .audit(AuditEntry::job(
                Some(actor),
                "video.upload",
                job.id,
                json!({
                    "lessonId": lesson_id,
                    "fileName": upload.original_name,
                    "sizeBytes": upload.size_bytes,
                }),
            ))
            .await;

        Ok(UploadAcceptedResponse {
            job_id: job.id,
            lesson_id,
            status: job.status(),
            estimated_completion: estimate_completion(
                upload.size_bytes,
                queued_ahead,
                state.queue.workers(),
            ),
        })
    }

    pub async fn get_job(
        state: &AppState,
        caller: &Caller,
        job_id: Uuid,
    ) -> Result<JobStatusResponse, AppError> {
        let job = state
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Job not found".to_string()))?;

        Self::ensure_lesson_access(state, caller, job.lesson_id).await?;

        Ok(JobStatusResponse::from(&job))
    }

    pub async fn list_jobs(
        state: &AppState,
        query: ListJobsQuery,
    ) -> Result<JobListResponse, AppError> {
        let filter = JobFilter {
            status: query.status,
            page: query.page.unwrap_or(1),
            per_page: query.per_page.unwrap_or(DEFAULT_PER_PAGE),
        };
        let page = state.jobs.list(&filter).await?;

        Ok(JobListResponse {
            jobs: page.jobs.iter().map(JobStatusResponse::from).collect(),
            page: filter.page,
            per_page: filter.per_page,
            total: page.total,
        })
    }

    /// Cancels a queued or running job. A job still waiting in the queue is
    /// cancelled on the spot; a running one stops at its next checkpoint.
    pub async fn cancel_job(
        state: &AppState,
        actor: Uuid,
        job_id: Uuid,
    ) -> Result<CancelJobResponse, AppError> {
        let job = state
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Job not found".to_string()))?;

        if job.is_terminal() {
            return Err(AppError::Conflict(format!("Job is already {}", job.status())));
        }

        state.queue.cancel(job_id);

        let mut status = job.status();
        if status == JobStatus::Pending {
            match state
                .jobs
                .update(job_id, |j| j.cancel(OffsetDateTime::now_utc()))
                .await
            {
                Ok(cancelled) => {
                    remove_quietly(&cancelled.source_path).await;
                    status = cancelled.status();
                }
                // A worker started it in the meantime; the token stops it.
                Err(StoreError::Transition(_)) => status = JobStatus::Processing,
                Err(e @ StoreError::NotCached(_)) => {
                    return Err(AppError::Internal(anyhow::anyhow!(e)));
                }
            }
        }

        info!("🛑 Cancellation of job {} requested by {}", job_id, actor);
        state
            .repos
            .audit(AuditEntry::job(
                Some(actor),
                "video.cancel",
                job_id,
                json!({ "lessonId": job.lesson_id, "status": status }),
            ))
            .await;

        Ok(CancelJobResponse {
            job_id,
            status,
            cancellation_pending: status != JobStatus::Cancelled,
        })
    }

    /// Admins see everything. Everyone else needs a free course or a
    /// completed purchase of the lesson's course.
    pub async fn ensure_lesson_access(
        state: &AppState,
        caller: &Caller,
        lesson_id: Uuid,
    ) -> Result<(), AppError> {
        if caller.is_admin() {
            return Ok(());
        }

        let course = state
            .repos
            .catalog
            .lesson_course(lesson_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Lesson not found".to_string()))?;

        if course.is_free {
            return Ok(());
        }

        let user_id = caller.user_id().ok_or_else(|| {
            AppError::Forbidden("Sign in and purchase this course to watch it".to_string())
        })?;

        if state
            .repos
            .entitlements
            .has_purchase(user_id, course.course_id)
            .await?
        {
            Ok(())
        } else {
            Err(AppError::Forbidden(
                "You have not purchased this course".to_string(),
            ))
        }
    }
}
