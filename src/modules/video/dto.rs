use super::model::{JobStatus, Quality, TranscodeJob, stream_url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_PER_PAGE: u32 = 20;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EstimatedCompletion {
    pub min_seconds: u64,
    pub max_seconds: u64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadAcceptedResponse {
    pub job_id: Uuid,
    pub lesson_id: Uuid,
    pub status: JobStatus,
    pub estimated_completion: EstimatedCompletion,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub lesson_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    /// Quality to stream URL. Empty until the job completes.
    pub renditions: BTreeMap<Quality, String>,
    pub error: Option<String>,
    pub is_complete: bool,
    pub is_failed: bool,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl From<&TranscodeJob> for JobStatusResponse {
    fn from(job: &TranscodeJob) -> Self {
        let renditions = job
            .final_renditions()
            .map(|r| r.iter().map(|(q, id)| (*q, stream_url(id))).collect())
            .unwrap_or_default();
        let status = job.status();

        Self {
            job_id: job.id,
            lesson_id: job.lesson_id,
            status,
            progress: job.progress(),
            renditions,
            error: job.error().map(str::to_string),
            is_complete: status == JobStatus::Completed,
            is_failed: status == JobStatus::Failed,
            created_by: job.created_by,
            created_at: job.created_at,
            started_at: job.started_at(),
            finished_at: job.finished_at(),
        }
    }
}

#[derive(Debug, Deserialize, Validate, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    #[validate(range(min = 1, message = "page starts at 1"))]
    pub page: Option<u32>,
    #[validate(range(min = 1, max = 100, message = "perPage must be between 1 and 100"))]
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub jobs: Vec<JobStatusResponse>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// False when the job was already cancelled before any worker picked it up.
    pub cancellation_pending: bool,
}
