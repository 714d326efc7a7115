use crate::common::upload::remove_quietly;
use crate::infrastructure::encoder::{Encoder, ProbeInfo};
use crate::modules::video::model::{
    AuditEntry, ENCODED_PROGRESS, INITIAL_PROGRESS, LessonMedia, RenditionId, RenditionMap,
    TranscodeJob, stream_url,
};
use crate::modules::video::planner;
use crate::modules::video::repository::Repositories;
use crate::modules::video::store::JobStore;
use anyhow::{Context, Result};
use async_channel::{Receiver, Sender, TrySendError};
use dashmap::DashMap;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const INTERRUPTED_ERROR: &str = "interrupted by server restart";
pub const CRASHED_ERROR: &str = "transcoder crashed";
pub const SUPERSEDED_ERROR: &str = "superseded by a newer upload for this lesson";

/// One cancellation token per queued or running job.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
}

impl CancelRegistry {
    pub fn token(&self, job_id: Uuid) -> CancellationToken {
        self.tokens
            .entry(job_id)
            .or_insert_with(CancellationToken::new)
            .value()
            .clone()
    }

    /// Fires the job's token. Returns false when the job holds none.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.tokens.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: Uuid) {
        self.tokens.remove(&job_id);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("transcode queue is full")]
    Full,
    #[error("transcode queue is closed")]
    Closed,
}

/// Producer side of the bounded job queue.
#[derive(Clone)]
pub struct TranscodeQueue {
    sender: Sender<Uuid>,
    cancels: Arc<CancelRegistry>,
    workers: usize,
}

impl TranscodeQueue {
    pub fn bounded(capacity: usize, workers: usize) -> (Self, Receiver<Uuid>) {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        let queue = Self {
            sender,
            cancels: Arc::new(CancelRegistry::default()),
            workers: workers.max(1),
        };
        (queue, receiver)
    }

    /// Enqueues without waiting; a full queue is reported, never awaited.
    pub fn submit(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.cancels.token(job_id);
        match self.sender.try_send(job_id) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cancels.remove(job_id);
                Err(match e {
                    TrySendError::Full(_) => QueueError::Full,
                    TrySendError::Closed(_) => QueueError::Closed,
                })
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.sender.is_full()
    }

    pub fn depth(&self) -> usize {
        self.sender.len()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancel(&self, job_id: Uuid) -> bool {
        self.cancels.cancel(job_id)
    }

    pub fn registry(&self) -> Arc<CancelRegistry> {
        self.cancels.clone()
    }
}

enum Outcome {
    Encoded(ProbeInfo, RenditionMap),
    Cancelled,
}

enum Persisted {
    Stored,
    /// The lesson already holds media from a newer upload.
    Superseded,
}

/// Drives transcode jobs from `pending` to a terminal state.
#[derive(Clone)]
pub struct Transcoder {
    jobs: JobStore,
    repos: Repositories,
    encoder: Arc<dyn Encoder>,
    media_dir: PathBuf,
    cancels: Arc<CancelRegistry>,
    /// Serialises media persistence per lesson.
    lesson_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Transcoder {
    pub fn new(
        jobs: JobStore,
        repos: Repositories,
        encoder: Arc<dyn Encoder>,
        media_dir: PathBuf,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            jobs,
            repos,
            encoder,
            media_dir,
            cancels,
            lesson_locks: Arc::new(DashMap::new()),
        }
    }

    pub async fn run(&self, job_id: Uuid) {
        let token = self.cancels.token(job_id);
        match self.jobs.get(job_id).await {
            Ok(Some(job)) => self.process(job, &token).await,
            Ok(None) => warn!("⚠️ Queued job {} no longer exists", job_id),
            Err(e) => error!("❌ Failed to load job {}: {:#}", job_id, e),
        }
        self.cancels.remove(job_id);
    }

    async fn process(&self, job: TranscodeJob, token: &CancellationToken) {
        if job.is_terminal() {
            info!("⏭️ Job {} is already {}, skipping", job.id, job.status());
            remove_quietly(&job.source_path).await;
            return;
        }

        if token.is_cancelled() {
            self.finish_cancelled(&job, &[]).await;
            return;
        }

        if let Err(e) = self.jobs.update(job.id, |j| j.start(now())).await {
            // Lost a race with a cancel request.
            info!("⏭️ Job {} not started: {}", job.id, e);
            remove_quietly(&job.source_path).await;
            return;
        }

        info!("🎬 Transcoding job {} for lesson {}", job.id, job.lesson_id);
        self.repos
            .audit(AuditEntry::job(
                Some(job.created_by),
                "video.transcode.start",
                job.id,
                json!({ "lessonId": job.lesson_id }),
            ))
            .await;

        let mut produced = Vec::new();
        match self.encode_all(&job, token, &mut produced).await {
            Ok(Outcome::Encoded(_, _)) if token.is_cancelled() => {
                self.finish_cancelled(&job, &produced).await;
            }
            Ok(Outcome::Encoded(probe, renditions)) => {
                match self.persist_media(&job, &probe, &renditions).await {
                    Ok(Persisted::Stored) => self.finish_completed(&job, &renditions).await,
                    Ok(Persisted::Superseded) => {
                        self.finish_failed(&job, &produced, SUPERSEDED_ERROR.to_string())
                            .await
                    }
                    Err(e) => self.finish_failed(&job, &produced, format!("{:#}", e)).await,
                }
            }
            Ok(Outcome::Cancelled) => self.finish_cancelled(&job, &produced).await,
            Err(e) => self.finish_failed(&job, &produced, e).await,
        }
    }

    /// Probes, plans and encodes every rendition in ladder order, checking for
    /// cancellation before each encode.
    async fn encode_all(
        &self,
        job: &TranscodeJob,
        token: &CancellationToken,
        produced: &mut Vec<PathBuf>,
    ) -> Result<Outcome, String> {
        let probe = self
            .encoder
            .probe(&job.source_path)
            .await
            .map_err(|e| e.to_string())?;

        let plan = planner::plan(probe.width, probe.height);
        info!(
            "📐 Job {}: source {}x{}, {:.1}s, planned {:?}",
            job.id,
            probe.width,
            probe.height,
            probe.duration_seconds,
            plan.iter().map(|t| t.quality.as_str()).collect::<Vec<_>>()
        );

        fs::create_dir_all(&self.media_dir)
            .await
            .map_err(|e| format!("cannot create media directory: {}", e))?;

        let total = plan.len();
        let span = usize::from(ENCODED_PROGRESS - INITIAL_PROGRESS);
        let mut renditions = RenditionMap::new();

        for (done, target) in plan.iter().enumerate() {
            if token.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let id = RenditionId::new(job.lesson_id, target.quality, now()).to_string();
            let output = self.media_dir.join(&id);
            produced.push(output.clone());
            self.jobs
                .update(job.id, |j| j.begin_rendition(id.clone()))
                .await
                .map_err(|e| e.to_string())?;

            self.encoder
                .encode(&job.source_path, &output, target)
                .await
                .map_err(|e| format!("{} rendition: {}", target.quality, e))?;

            let progress = INITIAL_PROGRESS + ((done + 1) * span / total) as u8;
            self.jobs
                .update(job.id, |j| j.record_rendition(target.quality, id.clone(), progress))
                .await
                .map_err(|e| e.to_string())?;
            renditions.insert(target.quality, id);

            info!("✅ Job {}: {} ready ({}%)", job.id, target.quality, progress);
        }

        Ok(Outcome::Encoded(probe, renditions))
    }

    /// Upserts the lesson's media record and primary URL, then removes files
    /// of the record it replaced. Media from an older upload never replaces
    /// media from a newer one.
    async fn persist_media(
        &self,
        job: &TranscodeJob,
        probe: &ProbeInfo,
        renditions: &RenditionMap,
    ) -> Result<Persisted> {
        let lock = self
            .lesson_locks
            .entry(job.lesson_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = lock.lock().await;

        let previous = self
            .repos
            .media
            .find_lesson_media(job.lesson_id)
            .await
            .context("failed to read existing lesson media")?;

        let urls: BTreeMap<_, _> = renditions
            .iter()
            .map(|(quality, id)| (*quality, stream_url(id)))
            .collect();

        let media = LessonMedia {
            lesson_id: job.lesson_id,
            job_id: job.id,
            job_created_at: job.created_at,
            renditions: urls,
            duration_seconds: probe.duration_seconds,
            size_bytes: i64::try_from(probe.size_bytes).unwrap_or(i64::MAX),
            uploaded_at: now(),
        };
        if previous.as_ref().is_some_and(|p| !media.supersedes(p)) {
            return Ok(Persisted::Superseded);
        }
        let stored = self
            .repos
            .media
            .upsert_lesson_media(&media)
            .await
            .context("failed to save lesson media")?;
        if !stored {
            return Ok(Persisted::Superseded);
        }

        if let Some(quality) = planner::primary_quality(media.renditions.keys()) {
            let url = &media.renditions[&quality];
            if let Err(e) = self.repos.media.set_primary_video_url(job.lesson_id, url).await {
                warn!(
                    "⚠️ Failed to set primary video of lesson {}: {:#}",
                    job.lesson_id, e
                );
            }
        }

        if let Some(previous) = previous {
            for url in previous.renditions.values() {
                if media.renditions.values().any(|u| u == url) {
                    continue;
                }
                if let Some(old) = RenditionId::from_url(url) {
                    remove_quietly(&self.media_dir.join(old.to_string())).await;
                }
            }
        }

        Ok(Persisted::Stored)
    }

    // Finishers clean up and audit before the terminal transition: once a job
    // reads as terminal its source is gone.

    async fn finish_completed(&self, job: &TranscodeJob, renditions: &RenditionMap) {
        remove_quietly(&job.source_path).await;
        self.repos
            .audit(AuditEntry::job(
                Some(job.created_by),
                "video.transcode.complete",
                job.id,
                json!({
                    "lessonId": job.lesson_id,
                    "qualities": renditions.keys().map(|q| q.as_str()).collect::<Vec<_>>(),
                }),
            ))
            .await;

        match self.jobs.update(job.id, |j| j.complete(now())).await {
            Ok(_) => info!("🎉 Job {} completed with {} rendition(s)", job.id, renditions.len()),
            Err(e) => error!("❌ Job {} could not be completed: {}", job.id, e),
        }
    }

    async fn finish_failed(&self, job: &TranscodeJob, produced: &[PathBuf], reason: String) {
        error!("❌ Job {} failed: {}", job.id, reason);
        remove_all(produced).await;
        remove_quietly(&job.source_path).await;
        self.repos
            .audit(AuditEntry::job(
                Some(job.created_by),
                "video.transcode.fail",
                job.id,
                json!({ "lessonId": job.lesson_id, "error": reason }),
            ))
            .await;

        if let Err(e) = self.jobs.update(job.id, |j| j.fail(now(), reason)).await {
            error!("❌ Job {} could not be marked failed: {}", job.id, e);
        }
    }

    async fn finish_cancelled(&self, job: &TranscodeJob, produced: &[PathBuf]) {
        remove_all(produced).await;
        remove_quietly(&job.source_path).await;
        self.repos
            .audit(AuditEntry::job(
                None,
                "video.transcode.cancel",
                job.id,
                json!({ "lessonId": job.lesson_id, "discarded": produced.len() }),
            ))
            .await;

        // The cancel request may already have moved a pending job.
        match self.jobs.update(job.id, |j| j.cancel(now())).await {
            Ok(_) => info!("🛑 Job {} cancelled", job.id),
            Err(e) => info!("🛑 Job {} cancellation observed: {}", job.id, e),
        }
    }

    /// Called when the task running `job_id` panicked.
    pub async fn recover_crashed(&self, job_id: Uuid) {
        self.cancels.remove(job_id);
        let job = match self.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            _ => return,
        };
        remove_quietly(&job.source_path).await;
        if job.is_terminal() {
            return;
        }
        self.remove_renditions(&job).await;
        if let Err(e) = self
            .jobs
            .update(job_id, |j| j.fail(now(), CRASHED_ERROR.to_string()))
            .await
        {
            error!("❌ Crashed job {} could not be marked failed: {}", job_id, e);
        }
    }

    /// Fails every job left unfinished by a previous process and removes its
    /// files.
    pub async fn reconcile_interrupted(&self) -> Result<usize> {
        let interrupted = self
            .jobs
            .repository()
            .fail_unfinished(INTERRUPTED_ERROR, now())
            .await?;

        for job in &interrupted {
            warn!(
                "⚠️ Job {} for lesson {} was {} at shutdown, marked failed",
                job.id,
                job.lesson_id,
                job.status()
            );
            self.remove_renditions(job).await;
            remove_quietly(&job.source_path).await;
        }
        Ok(interrupted.len())
    }

    async fn remove_renditions(&self, job: &TranscodeJob) {
        for id in job.rendition_files() {
            remove_quietly(&self.media_dir.join(id)).await;
        }
    }
}

async fn remove_all(paths: &[PathBuf]) {
    for path in paths {
        remove_quietly(path).await;
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Spawns `workers` consumers of the job queue. Each job runs in its own task
/// so a panic fails that job instead of taking the worker down.
pub fn start_transcoder_workers(
    transcoder: Transcoder,
    receiver: Receiver<Uuid>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let transcoder = transcoder.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                info!("🎥 Transcode worker {} listening", worker);
                while let Ok(job_id) = receiver.recv().await {
                    let task = tokio::spawn({
                        let transcoder = transcoder.clone();
                        async move { transcoder.run(job_id).await }
                    });
                    if let Err(e) = task.await {
                        error!("💥 Transcode task for job {} died: {}", job_id, e);
                        transcoder.recover_crashed(job_id).await;
                    }
                }
                info!("🎥 Transcode worker {} stopped", worker);
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::encoder::{EncoderError, RenditionTarget};
    use crate::infrastructure::memory::InMemoryRepository;
    use crate::modules::video::model::{JobStatus, Quality};
    use crate::modules::video::repository::JobRepository;
    use async_trait::async_trait;
    use std::path::Path;

    async fn dir_is_empty(dir: &Path) -> bool {
        match fs::read_dir(dir).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
            Err(_) => true,
        }
    }

    struct FakeEncoder {
        width: u32,
        height: u32,
        fail_on: Option<Quality>,
        /// Writes part of this rendition, then panics.
        panic_on: Option<Quality>,
    }

    impl FakeEncoder {
        fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                fail_on: None,
                panic_on: None,
            }
        }
    }

    #[async_trait]
    impl Encoder for FakeEncoder {
        async fn probe(&self, source: &Path) -> Result<ProbeInfo, EncoderError> {
            let meta = fs::metadata(source)
                .await
                .map_err(|e| EncoderError::Probe(e.to_string()))?;
            Ok(ProbeInfo {
                duration_seconds: 12.5,
                width: self.width,
                height: self.height,
                size_bytes: meta.len(),
            })
        }

        async fn encode(
            &self,
            _source: &Path,
            output: &Path,
            target: &RenditionTarget,
        ) -> Result<(), EncoderError> {
            fs::write(output, target.quality.as_str()).await?;
            if self.panic_on == Some(target.quality) {
                panic!("encoder crashed mid-write");
            }
            if self.fail_on == Some(target.quality) {
                return Err(EncoderError::Encode("boom".into()));
            }
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        media_dir: PathBuf,
        upload_dir: PathBuf,
        repo: Arc<InMemoryRepository>,
        store: JobStore,
        cancels: Arc<CancelRegistry>,
        transcoder: Transcoder,
        lesson_id: Uuid,
    }

    async fn harness(encoder: FakeEncoder) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("videos");
        let upload_dir = dir.path().join("uploads");
        std::fs::create_dir_all(&upload_dir).unwrap();

        let repo = Arc::new(InMemoryRepository::new());
        let lesson_id = Uuid::new_v4();
        repo.add_lesson(lesson_id, Uuid::new_v4(), false).await;

        let store = JobStore::new(repo.clone());
        let cancels = Arc::new(CancelRegistry::default());
        let transcoder = Transcoder::new(
            store.clone(),
            Repositories::from_shared(repo.clone()),
            Arc::new(encoder),
            media_dir.clone(),
            cancels.clone(),
        );

        Harness {
            _dir: dir,
            media_dir,
            upload_dir,
            repo,
            store,
            cancels,
            transcoder,
            lesson_id,
        }
    }

    impl Harness {
        async fn job(&self) -> TranscodeJob {
            self.job_for(self.lesson_id).await
        }

        async fn job_for(&self, lesson_id: Uuid) -> TranscodeJob {
            let source = self.upload_dir.join(format!("{}.mp4", Uuid::new_v4().simple()));
            fs::write(&source, vec![0u8; 2048]).await.unwrap();
            self.store
                .create(lesson_id, source, Uuid::new_v4())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn full_ladder_completes_and_prefers_720p() {
        let h = harness(FakeEncoder::new(1920, 1080)).await;
        let job = h.job().await;

        h.transcoder.run(job.id).await;

        let done = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status(), JobStatus::Completed);
        assert_eq!(done.progress(), 100);
        let renditions = done.final_renditions().unwrap();
        assert_eq!(
            renditions.keys().copied().collect::<Vec<_>>(),
            vec![Quality::P480, Quality::P720, Quality::P1080]
        );
        for id in renditions.values() {
            assert!(h.media_dir.join(id).exists());
        }
        assert!(!job.source_path.exists());

        let media = h.repo.lesson_media(h.lesson_id).await.unwrap();
        assert_eq!(media.size_bytes, 2048);
        let primary = h.repo.primary_url(h.lesson_id).await.unwrap();
        assert_eq!(primary, media.renditions[&Quality::P720]);

        let actions: Vec<_> = h
            .repo
            .audit_entries()
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["video.transcode.start", "video.transcode.complete"]);
    }

    #[tokio::test]
    async fn small_source_gets_single_original_rendition() {
        let h = harness(FakeEncoder::new(640, 360)).await;
        let job = h.job().await;

        h.transcoder.run(job.id).await;

        let done = h.store.get(job.id).await.unwrap().unwrap();
        let renditions = done.final_renditions().unwrap();
        assert_eq!(renditions.len(), 1);
        let id = &renditions[&Quality::Original];
        assert_eq!(
            h.repo.primary_url(h.lesson_id).await.unwrap(),
            stream_url(id)
        );
    }

    #[tokio::test]
    async fn encode_failure_fails_job_and_discards_outputs() {
        let mut encoder = FakeEncoder::new(1280, 720);
        encoder.fail_on = Some(Quality::P720);
        let h = harness(encoder).await;
        let job = h.job().await;

        h.transcoder.run(job.id).await;

        let failed = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert!(failed.error().unwrap().contains("720p"));
        assert!(failed.final_renditions().is_none());
        assert!(!job.source_path.exists());
        assert!(dir_is_empty(&h.media_dir).await);
        assert!(h.repo.lesson_media(h.lesson_id).await.is_none());
    }

    #[tokio::test]
    async fn probe_failure_fails_job() {
        let h = harness(FakeEncoder::new(1280, 720)).await;
        let job = h.job().await;
        fs::remove_file(&job.source_path).await.unwrap();

        h.transcoder.run(job.id).await;

        let failed = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert!(failed.error().unwrap().starts_with("probe failed"));
    }

    #[tokio::test]
    async fn cancellation_before_start_is_observed() {
        let h = harness(FakeEncoder::new(1920, 1080)).await;
        let job = h.job().await;
        h.cancels.token(job.id);
        assert!(h.cancels.cancel(job.id));

        h.transcoder.run(job.id).await;

        let cancelled = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status(), JobStatus::Cancelled);
        assert!(cancelled.started_at().is_none());
        assert!(!job.source_path.exists());
        assert!(dir_is_empty(&h.media_dir).await);
    }

    #[tokio::test]
    async fn job_cancelled_while_queued_is_skipped() {
        let h = harness(FakeEncoder::new(1920, 1080)).await;
        let job = h.job().await;
        h.store
            .update(job.id, |j| j.cancel(now()))
            .await
            .unwrap();

        h.transcoder.run(job.id).await;

        assert_eq!(
            h.store.get(job.id).await.unwrap().unwrap().status(),
            JobStatus::Cancelled
        );
        assert!(!job.source_path.exists());
    }

    #[tokio::test]
    async fn media_write_failure_fails_job() {
        let h = harness(FakeEncoder::new(854, 480)).await;
        h.repo.fail_media_writes(true);
        let job = h.job().await;

        h.transcoder.run(job.id).await;

        let failed = h.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert!(failed.error().unwrap().contains("lesson media"));
        assert!(dir_is_empty(&h.media_dir).await);
        assert!(h.repo.primary_url(h.lesson_id).await.is_none());
    }

    #[tokio::test]
    async fn second_upload_replaces_previous_files() {
        let h = harness(FakeEncoder::new(854, 480)).await;
        let first = h.job().await;
        h.transcoder.run(first.id).await;
        let old_id = h
            .store
            .get(first.id)
            .await
            .unwrap()
            .unwrap()
            .final_renditions()
            .unwrap()[&Quality::P480]
            .clone();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = h.job().await;
        h.transcoder.run(second.id).await;

        let new_id = h
            .store
            .get(second.id)
            .await
            .unwrap()
            .unwrap()
            .final_renditions()
            .unwrap()[&Quality::P480]
            .clone();
        assert_ne!(old_id, new_id);
        assert!(!h.media_dir.join(&old_id).exists());
        assert!(h.media_dir.join(&new_id).exists());
        assert_eq!(
            h.repo.primary_url(h.lesson_id).await.unwrap(),
            stream_url(&new_id)
        );
    }

    #[tokio::test]
    async fn older_upload_finishing_last_does_not_replace_newer_media() {
        let h = harness(FakeEncoder::new(854, 480)).await;
        let older = h.job().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = h.job().await;

        h.transcoder.run(newer.id).await;
        h.transcoder.run(older.id).await;

        let newer_done = h.store.get(newer.id).await.unwrap().unwrap();
        assert_eq!(newer_done.status(), JobStatus::Completed);
        let newer_id = newer_done.final_renditions().unwrap()[&Quality::P480].clone();
        assert!(h.media_dir.join(&newer_id).exists());

        let older_done = h.store.get(older.id).await.unwrap().unwrap();
        assert_eq!(older_done.status(), JobStatus::Failed);
        assert_eq!(older_done.error(), Some(SUPERSEDED_ERROR));
        assert!(!older.source_path.exists());

        let media = h.repo.lesson_media(h.lesson_id).await.unwrap();
        assert_eq!(media.job_id, newer.id);
        assert_eq!(
            h.repo.primary_url(h.lesson_id).await.unwrap(),
            stream_url(&newer_id)
        );
        let remaining: Vec<_> = std::fs::read_dir(&h.media_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(remaining, vec![newer_id]);
    }

    #[tokio::test]
    async fn concurrent_uploads_for_one_lesson_keep_only_the_newest() {
        let h = harness(FakeEncoder::new(854, 480)).await;
        let older = h.job().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = h.job().await;

        tokio::join!(h.transcoder.run(older.id), h.transcoder.run(newer.id));

        let media = h.repo.lesson_media(h.lesson_id).await.unwrap();
        assert_eq!(media.job_id, newer.id);
        let newer_done = h.store.get(newer.id).await.unwrap().unwrap();
        assert_eq!(newer_done.status(), JobStatus::Completed);

        let remaining: Vec<_> = std::fs::read_dir(&h.media_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(
            remaining,
            vec![newer_done.final_renditions().unwrap()[&Quality::P480].clone()]
        );
    }

    #[tokio::test]
    async fn crashed_task_fails_job_and_removes_partial_output() {
        let mut encoder = FakeEncoder::new(1280, 720);
        encoder.panic_on = Some(Quality::P720);
        let h = harness(FakeEncoder::new(854, 480)).await;
        let (queue, receiver) = TranscodeQueue::bounded(4, 1);
        let transcoder = Transcoder::new(
            h.store.clone(),
            Repositories::from_shared(h.repo.clone()),
            Arc::new(encoder),
            h.media_dir.clone(),
            queue.registry(),
        );
        start_transcoder_workers(transcoder, receiver, 1);

        let job = h.job().await;
        queue.submit(job.id).unwrap();

        let mut crashed = None;
        for _ in 0..200 {
            let current = h.store.get(job.id).await.unwrap().unwrap();
            if current.is_terminal() {
                crashed = Some(current);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let crashed = crashed.unwrap();

        assert_eq!(crashed.status(), JobStatus::Failed);
        assert_eq!(crashed.error(), Some(CRASHED_ERROR));
        assert!(!job.source_path.exists());
        assert!(dir_is_empty(&h.media_dir).await);
    }

    #[tokio::test]
    async fn reconcile_removes_output_of_interrupted_encode() {
        let h = harness(FakeEncoder::new(854, 480)).await;
        let job = h.job().await;
        let finished = RenditionId::new(h.lesson_id, Quality::P480, now()).to_string();
        let partial = RenditionId::new(h.lesson_id, Quality::P720, now()).to_string();
        h.store
            .update(job.id, |j| {
                j.start(now())?;
                j.record_rendition(Quality::P480, finished.clone(), 50)?;
                j.begin_rendition(partial.clone())
            })
            .await
            .unwrap();
        fs::create_dir_all(&h.media_dir).await.unwrap();
        fs::write(h.media_dir.join(&finished), b"480p").await.unwrap();
        fs::write(h.media_dir.join(&partial), b"72").await.unwrap();

        assert_eq!(h.transcoder.reconcile_interrupted().await.unwrap(), 1);

        assert!(dir_is_empty(&h.media_dir).await);
        assert!(!job.source_path.exists());
    }

    #[tokio::test]
    async fn lagging_database_does_not_stop_the_job() {
        let h = harness(FakeEncoder::new(854, 480)).await;
        let job = h.job().await;
        h.repo.fail_next_saves(2);

        h.transcoder.run(job.id).await;

        assert_eq!(
            h.store.get(job.id).await.unwrap().unwrap().status(),
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn reconcile_fails_unfinished_jobs_and_removes_sources() {
        let h = harness(FakeEncoder::new(854, 480)).await;
        let pending = h.job().await;
        let finished = h.job().await;
        h.transcoder.run(finished.id).await;

        let reconciled = h.transcoder.reconcile_interrupted().await.unwrap();

        assert_eq!(reconciled, 1);
        let durable = h.repo.find(pending.id).await.unwrap().unwrap();
        assert_eq!(durable.status(), JobStatus::Failed);
        assert_eq!(durable.error(), Some(INTERRUPTED_ERROR));
        assert!(!pending.source_path.exists());
        assert_eq!(
            h.repo.find(finished.id).await.unwrap().unwrap().status(),
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn queue_rejects_past_capacity() {
        let (queue, receiver) = TranscodeQueue::bounded(1, 1);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(queue.submit(first), Ok(()));
        assert!(queue.is_full());
        assert_eq!(queue.submit(second), Err(QueueError::Full));
        assert!(!queue.cancel(second));
        assert!(queue.cancel(first));

        assert_eq!(receiver.recv().await.unwrap(), first);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let h = harness(FakeEncoder::new(854, 480)).await;
        let (queue, receiver) = TranscodeQueue::bounded(4, 2);
        let transcoder = Transcoder::new(
            h.store.clone(),
            Repositories::from_shared(h.repo.clone()),
            Arc::new(FakeEncoder::new(854, 480)),
            h.media_dir.clone(),
            queue.registry(),
        );
        let handles = start_transcoder_workers(transcoder, receiver.clone(), 2);

        let other_lesson = Uuid::new_v4();
        h.repo.add_lesson(other_lesson, Uuid::new_v4(), false).await;
        let a = h.job().await;
        let b = h.job_for(other_lesson).await;
        queue.submit(a.id).unwrap();
        queue.submit(b.id).unwrap();

        for _ in 0..200 {
            let a_done = h.store.get(a.id).await.unwrap().unwrap().is_terminal();
            let b_done = h.store.get(b.id).await.unwrap().unwrap().is_terminal();
            if a_done && b_done {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.store.get(a.id).await.unwrap().unwrap().status(),
            JobStatus::Completed
        );
        assert_eq!(
            h.store.get(b.id).await.unwrap().unwrap().status(),
            JobStatus::Completed
        );

        receiver.close();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
