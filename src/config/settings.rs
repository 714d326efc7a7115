use crate::config::env::{self, EnvKey};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_UPLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub media_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub transcode_workers: usize,
    pub transcode_queue_capacity: usize,
    /// Zero disables the per-rendition encoder timeout.
    pub encode_timeout_secs: u64,
    pub max_upload_bytes: u64,
    pub job_cache_ttl_secs: u64,
}

impl AppConfig {
    pub fn new() -> Result<Self, std::env::VarError> {
        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            database_url: env::get(EnvKey::DatabaseUrl)?,
            jwt_secret: env::get(EnvKey::JwtSecret)?,
            media_dir: env::get_or(EnvKey::MediaDir, "./storage/videos").into(),
            upload_dir: env::get_or(EnvKey::UploadDir, "./storage/uploads").into(),
            ffmpeg_path: env::get_or(EnvKey::FfmpegPath, "ffmpeg").into(),
            ffprobe_path: env::get_or(EnvKey::FfprobePath, "ffprobe").into(),
            transcode_workers: env::get_parsed(EnvKey::TranscodeWorkers, 2usize).max(1),
            transcode_queue_capacity: env::get_parsed(EnvKey::TranscodeQueueCapacity, 16usize)
                .max(1),
            encode_timeout_secs: env::get_parsed(EnvKey::EncodeTimeoutSecs, 3600),
            max_upload_bytes: env::get_parsed(EnvKey::MaxUploadBytes, DEFAULT_MAX_UPLOAD_BYTES),
            job_cache_ttl_secs: env::get_parsed(EnvKey::JobCacheTtlSecs, 3600),
        })
    }

    pub fn encode_timeout(&self) -> Option<Duration> {
        match self.encode_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn job_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.job_cache_ttl_secs)
    }

    /// Configuration rooted in `base`, used by tests and local tooling that
    /// never touch the process environment.
    pub fn for_dirs(base: &std::path::Path, jwt_secret: &str) -> Self {
        Self {
            server_port: 0,
            database_url: String::new(),
            jwt_secret: jwt_secret.to_string(),
            media_dir: base.join("videos"),
            upload_dir: base.join("uploads"),
            ffmpeg_path: "ffmpeg".into(),
            ffprobe_path: "ffprobe".into(),
            transcode_workers: 1,
            transcode_queue_capacity: 4,
            encode_timeout_secs: 0,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            job_cache_ttl_secs: 3600,
        }
    }
}
