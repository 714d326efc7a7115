use super::model::{AuditEntry, CourseAccess, JobStatus, LessonMedia, TranscodeJob};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
}

impl JobFilter {
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.per_page)
    }
}

#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<TranscodeJob>,
    pub total: i64,
}

/// Durable job records.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &TranscodeJob) -> Result<()>;

    async fn save(&self, job: &TranscodeJob) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<TranscodeJob>>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter) -> Result<JobPage>;

    /// Marks every pending or processing job as failed and returns them.
    async fn fail_unfinished(&self, error: &str, at: OffsetDateTime) -> Result<Vec<TranscodeJob>>;
}

#[async_trait]
pub trait MediaRepository: Send + Sync {
    async fn find_lesson_media(&self, lesson_id: Uuid) -> Result<Option<LessonMedia>>;

    /// Creates the lesson's media record or replaces one from an older
    /// upload. Returns false, writing nothing, when the stored record comes
    /// from the same or a newer upload.
    async fn upsert_lesson_media(&self, media: &LessonMedia) -> Result<bool>;

    async fn set_primary_video_url(&self, lesson_id: Uuid, url: &str) -> Result<()>;
}

#[async_trait]
pub trait LessonCatalog: Send + Sync {
    async fn lesson_exists(&self, lesson_id: Uuid) -> Result<bool>;

    /// The course a lesson belongs to, `None` for unknown lessons.
    async fn lesson_course(&self, lesson_id: Uuid) -> Result<Option<CourseAccess>>;
}

#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    /// Whether the user holds a completed purchase of the course.
    async fn has_purchase(&self, user_id: Uuid, course_id: Uuid) -> Result<bool>;
}

/// Best-effort audit sink.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// The collaborators the video pipeline is wired against.
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub media: Arc<dyn MediaRepository>,
    pub catalog: Arc<dyn LessonCatalog>,
    pub entitlements: Arc<dyn EntitlementChecker>,
    pub audit: Arc<dyn AuditLog>,
}

impl Repositories {
    /// Uses one value for every seam.
    pub fn from_shared<T>(repo: Arc<T>) -> Self
    where
        T: JobRepository
            + MediaRepository
            + LessonCatalog
            + EntitlementChecker
            + AuditLog
            + 'static,
    {
        Self {
            jobs: repo.clone(),
            media: repo.clone(),
            catalog: repo.clone(),
            entitlements: repo.clone(),
            audit: repo,
        }
    }

    /// Records an audit entry; failures are logged and swallowed.
    pub async fn audit(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.audit.record(entry).await {
            tracing::warn!("Audit log write for '{}' failed: {:#}", action, e);
        }
    }
}
