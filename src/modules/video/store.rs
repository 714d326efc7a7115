use super::model::{TranscodeJob, TransitionError};
use super::repository::{JobFilter, JobPage, JobRepository};
use anyhow::Result;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} is not tracked by this process")]
    NotCached(Uuid),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Transcode jobs, held in an in-process cache with a durable record behind it.
///
/// The cache is authoritative for every job it holds. Writes land in the cache
/// first and are then saved durably; a failed durable save is logged and does
/// not undo the cached state.
#[derive(Clone)]
pub struct JobStore {
    cache: Arc<DashMap<Uuid, TranscodeJob>>,
    repo: Arc<dyn JobRepository>,
}

impl JobStore {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self {
            cache: Arc::new(DashMap::new()),
            repo,
        }
    }

    pub async fn create(
        &self,
        lesson_id: Uuid,
        source_path: PathBuf,
        created_by: Uuid,
    ) -> Result<TranscodeJob> {
        let job = TranscodeJob::new(lesson_id, source_path, created_by);
        self.cache.insert(job.id, job.clone());

        if let Err(e) = self.repo.insert(&job).await {
            self.cache.remove(&job.id);
            return Err(e.context("failed to persist new transcode job"));
        }

        Ok(job)
    }

    /// Cache first, then the durable record. Jobs read back from the durable
    /// record are not re-cached; after a restart their fine-grained progress is
    /// whatever was last saved.
    pub async fn get(&self, id: Uuid) -> Result<Option<TranscodeJob>> {
        if let Some(job) = self.cache.get(&id) {
            return Ok(Some(job.value().clone()));
        }
        self.repo.find(id).await
    }

    /// Applies `mutate` to the cached job, then saves the result durably.
    pub async fn update<F>(&self, id: Uuid, mutate: F) -> Result<TranscodeJob, StoreError>
    where
        F: FnOnce(&mut TranscodeJob) -> Result<(), TransitionError>,
    {
        let snapshot = {
            let mut entry = self.cache.get_mut(&id).ok_or(StoreError::NotCached(id))?;
            mutate(entry.value_mut())?;
            entry.value().clone()
        };

        if let Err(e) = self.repo.save(&snapshot).await {
            warn!(
                "Durable save of job {} ({}) failed, cache remains authoritative: {:#}",
                id,
                snapshot.status(),
                e
            );
        }

        Ok(snapshot)
    }

    /// Durable listing with newer cached state laid over it.
    pub async fn list(&self, filter: &JobFilter) -> Result<JobPage> {
        let mut page = self.repo.list(filter).await?;
        for job in page.jobs.iter_mut() {
            if let Some(cached) = self.cache.get(&job.id) {
                *job = cached.value().clone();
            }
        }
        Ok(page)
    }

    /// Drops terminal jobs that finished more than `ttl` ago from the cache.
    pub fn prune_terminal(&self, ttl: Duration) -> usize {
        let cutoff = OffsetDateTime::now_utc() - ttl;
        let before = self.cache.len();
        self.cache.retain(|_, job| match job.finished_at() {
            Some(finished) => finished > cutoff,
            None => true,
        });
        before.saturating_sub(self.cache.len())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repo
    }
}
