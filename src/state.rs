use crate::config::settings::AppConfig;
use crate::infrastructure::encoder::Encoder;
use crate::modules::video::repository::Repositories;
use crate::modules::video::store::JobStore;
use crate::workers::transcoder::{TranscodeQueue, Transcoder};
use async_channel::Receiver;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub repos: Repositories,
    pub jobs: JobStore,
    pub queue: TranscodeQueue,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        repos: Repositories,
        jobs: JobStore,
        queue: TranscodeQueue,
    ) -> Self {
        Self {
            config,
            repos,
            jobs,
            queue,
        }
    }

    /// Wires the job store, queue and transcoder around one set of
    /// repositories. The caller starts workers on the returned receiver.
    pub fn assemble(
        config: AppConfig,
        repos: Repositories,
        encoder: Arc<dyn Encoder>,
    ) -> (Self, Transcoder, Receiver<Uuid>) {
        let jobs = JobStore::new(repos.jobs.clone());
        let (queue, receiver) =
            TranscodeQueue::bounded(config.transcode_queue_capacity, config.transcode_workers);
        let transcoder = Transcoder::new(
            jobs.clone(),
            repos.clone(),
            encoder,
            config.media_dir.clone(),
            queue.registry(),
        );

        (Self::new(config, repos, jobs, queue), transcoder, receiver)
    }
}
