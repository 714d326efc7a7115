use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    JwtSecret,
    MediaDir,
    UploadDir,
    FfmpegPath,
    FfprobePath,
    TranscodeWorkers,
    TranscodeQueueCapacity,
    EncodeTimeoutSecs,
    MaxUploadBytes,
    JobCacheTtlSecs,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::JwtSecret => "JWT_SECRET",
            EnvKey::MediaDir => "MEDIA_DIR",
            EnvKey::UploadDir => "UPLOAD_DIR",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::FfprobePath => "FFPROBE_PATH",
            EnvKey::TranscodeWorkers => "TRANSCODE_WORKERS",
            EnvKey::TranscodeQueueCapacity => "TRANSCODE_QUEUE_CAPACITY",
            EnvKey::EncodeTimeoutSecs => "ENCODE_TIMEOUT_SECS",
            EnvKey::MaxUploadBytes => "MAX_UPLOAD_BYTES",
            EnvKey::JobCacheTtlSecs => "JOB_CACHE_TTL_SECS",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
