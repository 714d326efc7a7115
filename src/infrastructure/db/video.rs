use super::pool::DbPool;
use crate::modules::video::model::{
    AuditEntry, CourseAccess, JobRecord, JobStatus, LessonMedia, Quality, RenditionMap,
    TranscodeJob,
};
use crate::modules::video::repository::{
    AuditLog, EntitlementChecker, JobFilter, JobPage, JobRepository, LessonCatalog,
    MediaRepository,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sqlx::FromRow;
use sqlx::types::Json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use time::OffsetDateTime;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, lesson_id, status, progress, source_path, renditions, \
     encoding_rendition, error, created_by, created_at, started_at, completed_at, failed_at, cancelled_at";

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    lesson_id: Uuid,
    status: String,
    progress: i16,
    source_path: String,
    renditions: Json<RenditionMap>,
    encoding_rendition: Option<String>,
    error: Option<String>,
    created_by: Uuid,
    created_at: OffsetDateTime,
    started_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    failed_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
}

impl TryFrom<JobRow> for TranscodeJob {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = row.status.parse::<JobStatus>().map_err(|e| anyhow!(e))?;
        let record = JobRecord {
            status,
            progress: row.progress.clamp(0, 100) as u8,
            renditions: row.renditions.0,
            encoding: row.encoding_rendition,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            cancelled_at: row.cancelled_at,
        };
        let state = record
            .into_state()
            .map_err(|e| anyhow!("corrupt transcode job {}: {}", row.id, e))?;

        Ok(TranscodeJob {
            id: row.id,
            lesson_id: row.lesson_id,
            source_path: PathBuf::from(row.source_path),
            created_by: row.created_by,
            created_at: row.created_at,
            state,
        })
    }
}

#[derive(Debug, FromRow)]
struct LessonMediaRow {
    lesson_id: Uuid,
    job_id: Uuid,
    job_created_at: OffsetDateTime,
    renditions: Json<BTreeMap<Quality, String>>,
    duration_seconds: f64,
    size_bytes: i64,
    uploaded_at: OffsetDateTime,
}

impl From<LessonMediaRow> for LessonMedia {
    fn from(row: LessonMediaRow) -> Self {
        Self {
            lesson_id: row.lesson_id,
            job_id: row.job_id,
            job_created_at: row.job_created_at,
            renditions: row.renditions.0,
            duration_seconds: row.duration_seconds,
            size_bytes: row.size_bytes,
            uploaded_at: row.uploaded_at,
        }
    }
}

/// Postgres-backed video repositories.
#[derive(Clone)]
pub struct PgVideoRepository {
    pool: DbPool,
}

impl PgVideoRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn write_job(&self, sql: &str, job: &TranscodeJob) -> Result<()> {
        let record = JobRecord::from_job(job);
        sqlx::query(sql)
            .bind(job.id)
            .bind(job.lesson_id)
            .bind(record.status.as_str())
            .bind(i16::from(record.progress))
            .bind(job.source_path.to_string_lossy().into_owned())
            .bind(Json(&record.renditions))
            .bind(record.encoding.as_deref())
            .bind(record.error.as_deref())
            .bind(job.created_by)
            .bind(job.created_at)
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(record.failed_at)
            .bind(record.cancelled_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for PgVideoRepository {
    async fn insert(&self, job: &TranscodeJob) -> Result<()> {
        self.write_job(
            r#"
            INSERT INTO transcode_jobs
                (id, lesson_id, status, progress, source_path, renditions, encoding_rendition,
                 error, created_by, created_at, started_at, completed_at, failed_at, cancelled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
            job,
        )
        .await
        .map_err(|e| anyhow!("Failed to insert transcode job {}: {}", job.id, e))
    }

    async fn save(&self, job: &TranscodeJob) -> Result<()> {
        self.write_job(
            r#"
            INSERT INTO transcode_jobs
                (id, lesson_id, status, progress, source_path, renditions, encoding_rendition,
                 error, created_by, created_at, started_at, completed_at, failed_at, cancelled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                progress = EXCLUDED.progress,
                renditions = EXCLUDED.renditions,
                encoding_rendition = EXCLUDED.encoding_rendition,
                error = EXCLUDED.error,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                failed_at = EXCLUDED.failed_at,
                cancelled_at = EXCLUDED.cancelled_at,
                updated_at = NOW()
            "#,
            job,
        )
        .await
        .map_err(|e| anyhow!("Failed to save transcode job {}: {}", job.id, e))
    }

    async fn find(&self, id: Uuid) -> Result<Option<TranscodeJob>> {
        let sql = format!("SELECT {} FROM transcode_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TranscodeJob::try_from).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let status = filter.status.map(|s| s.as_str());

        let sql = format!(
            r#"
            SELECT {} FROM transcode_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(status)
            .bind(i64::from(filter.per_page))
            .bind(filter.offset())
            .fetch_all(&self.pool)
            .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transcode_jobs WHERE ($1::text IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let jobs = rows
            .into_iter()
            .map(TranscodeJob::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(JobPage { jobs, total })
    }

    async fn fail_unfinished(&self, error: &str, at: OffsetDateTime) -> Result<Vec<TranscodeJob>> {
        let sql = format!(
            r#"
            WITH interrupted AS (
                SELECT {} FROM transcode_jobs
                WHERE status IN ('pending', 'processing')
                FOR UPDATE
            )
            UPDATE transcode_jobs t
            SET status = 'failed', error = $1, failed_at = $2, progress = 0,
                renditions = '{{}}'::jsonb, encoding_rendition = NULL, updated_at = NOW()
            FROM interrupted i
            WHERE t.id = i.id
            RETURNING i.*
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(error)
            .bind(at)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TranscodeJob::try_from).collect()
    }
}

#[async_trait]
impl MediaRepository for PgVideoRepository {
    async fn find_lesson_media(&self, lesson_id: Uuid) -> Result<Option<LessonMedia>> {
        let row = sqlx::query_as::<_, LessonMediaRow>(
            r#"
            SELECT lesson_id, job_id, job_created_at, renditions, duration_seconds,
                   size_bytes, uploaded_at
            FROM lesson_media
            WHERE lesson_id = $1
            "#,
        )
        .bind(lesson_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LessonMedia::from))
    }

    async fn upsert_lesson_media(&self, media: &LessonMedia) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO lesson_media
                (lesson_id, job_id, job_created_at, renditions, duration_seconds, size_bytes,
                 uploaded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (lesson_id) DO UPDATE SET
                job_id = EXCLUDED.job_id,
                job_created_at = EXCLUDED.job_created_at,
                renditions = EXCLUDED.renditions,
                duration_seconds = EXCLUDED.duration_seconds,
                size_bytes = EXCLUDED.size_bytes,
                uploaded_at = EXCLUDED.uploaded_at,
                updated_at = NOW()
            WHERE (lesson_media.job_created_at, lesson_media.job_id)
                < (EXCLUDED.job_created_at, EXCLUDED.job_id)
            "#,
        )
        .bind(media.lesson_id)
        .bind(media.job_id)
        .bind(media.job_created_at)
        .bind(Json(&media.renditions))
        .bind(media.duration_seconds)
        .bind(media.size_bytes)
        .bind(media.uploaded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!("Failed to upsert media for lesson {}: {}", media.lesson_id, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_primary_video_url(&self, lesson_id: Uuid, url: &str) -> Result<()> {
        sqlx::query("UPDATE lessons SET video_url = $1, updated_at = NOW() WHERE id = $2")
            .bind(url)
            .bind(lesson_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LessonCatalog for PgVideoRepository {
    async fn lesson_exists(&self, lesson_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM lessons WHERE id = $1)")
            .bind(lesson_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn lesson_course(&self, lesson_id: Uuid) -> Result<Option<CourseAccess>> {
        let row: Option<(Uuid, bool)> = sqlx::query_as(
            r#"
            SELECT c.id, c.is_free
            FROM lessons l
            JOIN courses c ON c.id = l.course_id
            WHERE l.id = $1
            "#,
        )
        .bind(lesson_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(course_id, is_free)| CourseAccess { course_id, is_free }))
    }
}

#[async_trait]
impl EntitlementChecker for PgVideoRepository {
    async fn has_purchase(&self, user_id: Uuid, course_id: Uuid) -> Result<bool> {
        let purchased: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM purchases
                WHERE user_id = $1 AND course_id = $2 AND status = 'completed'
            )
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(purchased)
    }
}

#[async_trait]
impl AuditLog for PgVideoRepository {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (actor_id, action, target_type, target_id, details)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.actor_id)
        .bind(&entry.action)
        .bind(&entry.target_type)
        .bind(entry.target_id)
        .bind(Json(&entry.details))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
