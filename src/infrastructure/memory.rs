//! In-memory implementations of the video repositories.
//!
//! Backs the integration tests and lets the pipeline run without Postgres.

use crate::modules::video::model::{AuditEntry, CourseAccess, LessonMedia, TranscodeJob};
use crate::modules::video::repository::{
    AuditLog, EntitlementChecker, JobFilter, JobPage, JobRepository, LessonCatalog,
    MediaRepository,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryRepository {
    jobs: Mutex<HashMap<Uuid, TranscodeJob>>,
    lessons: Mutex<HashMap<Uuid, CourseAccess>>,
    purchases: Mutex<HashSet<(Uuid, Uuid)>>,
    media: Mutex<HashMap<Uuid, LessonMedia>>,
    primary_urls: Mutex<HashMap<Uuid, String>>,
    audit: Mutex<Vec<AuditEntry>>,
    failing_saves: AtomicUsize,
    failing_media: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_lesson(&self, lesson_id: Uuid, course_id: Uuid, is_free: bool) {
        self.lessons
            .lock()
            .await
            .insert(lesson_id, CourseAccess { course_id, is_free });
    }

    pub async fn grant_purchase(&self, user_id: Uuid, course_id: Uuid) {
        self.purchases.lock().await.insert((user_id, course_id));
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().await.clone()
    }

    pub async fn lesson_media(&self, lesson_id: Uuid) -> Option<LessonMedia> {
        self.media.lock().await.get(&lesson_id).cloned()
    }

    pub async fn primary_url(&self, lesson_id: Uuid) -> Option<String> {
        self.primary_urls.lock().await.get(&lesson_id).cloned()
    }

    /// Makes the next `n` job saves fail, simulating a lagging database.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    pub fn fail_media_writes(&self, fail: bool) {
        self.failing_media.store(fail, Ordering::SeqCst);
    }

    fn take_save_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl JobRepository for InMemoryRepository {
    async fn insert(&self, job: &TranscodeJob) -> Result<()> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn save(&self, job: &TranscodeJob) -> Result<()> {
        if self.take_save_failure() {
            return Err(anyhow!("simulated save failure"));
        }
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<TranscodeJob>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<TranscodeJob> = jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status() == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let jobs = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.per_page as usize)
            .collect();
        Ok(JobPage { jobs, total })
    }

    async fn fail_unfinished(&self, error: &str, at: OffsetDateTime) -> Result<Vec<TranscodeJob>> {
        let mut jobs = self.jobs.lock().await;
        let mut interrupted = Vec::new();
        for job in jobs.values_mut().filter(|j| !j.is_terminal()) {
            interrupted.push(job.clone());
            job.fail(at, error.to_string())?;
        }
        Ok(interrupted)
    }
}

#[async_trait]
impl MediaRepository for InMemoryRepository {
    async fn find_lesson_media(&self, lesson_id: Uuid) -> Result<Option<LessonMedia>> {
        Ok(self.media.lock().await.get(&lesson_id).cloned())
    }

    async fn upsert_lesson_media(&self, media: &LessonMedia) -> Result<bool> {
        if self.failing_media.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated lesson media write failure"));
        }
        let mut stored = self.media.lock().await;
        if let Some(current) = stored.get(&media.lesson_id) {
            if !media.supersedes(current) {
                return Ok(false);
            }
        }
        stored.insert(media.lesson_id, media.clone());
        Ok(true)
    }

    async fn set_primary_video_url(&self, lesson_id: Uuid, url: &str) -> Result<()> {
        self.primary_urls
            .lock()
            .await
            .insert(lesson_id, url.to_string());
        Ok(())
    }
}

#[async_trait]
impl LessonCatalog for InMemoryRepository {
    async fn lesson_exists(&self, lesson_id: Uuid) -> Result<bool> {
        Ok(self.lessons.lock().await.contains_key(&lesson_id))
    }

    async fn lesson_course(&self, lesson_id: Uuid) -> Result<Option<CourseAccess>> {
        Ok(self.lessons.lock().await.get(&lesson_id).copied())
    }
}

#[async_trait]
impl EntitlementChecker for InMemoryRepository {
    async fn has_purchase(&self, user_id: Uuid, course_id: Uuid) -> Result<bool> {
        Ok(self.purchases.lock().await.contains(&(user_id, course_id)))
    }
}

#[async_trait]
impl AuditLog for InMemoryRepository {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.audit.lock().await.push(entry);
        Ok(())
    }
}
