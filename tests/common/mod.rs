//! Shared harness for integration tests.
//!
//! [`TestApp`] builds the full router against [`InMemoryRepository`] and a
//! [`FakeEncoder`], with media and upload directories in a temp dir. Workers
//! are not started until a test asks for them, so jobs can be inspected while
//! still queued.

#![allow(dead_code)]

use async_channel::Receiver;
use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode, header};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use lectern::app::create_app;
use lectern::config::settings::AppConfig;
use lectern::infrastructure::encoder::{Encoder, EncoderError, ProbeInfo, RenditionTarget};
use lectern::infrastructure::memory::InMemoryRepository;
use lectern::middleware::auth::TokenClaims;
use lectern::modules::video::model::{Quality, TranscodeJob};
use lectern::modules::video::repository::Repositories;
use lectern::state::AppState;
use lectern::workers::transcoder::{Transcoder, start_transcoder_workers};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tower::ServiceExt;
use uuid::Uuid;

pub const SECRET: &str = "integration-test-secret";

/// Encoder double: reports a fixed resolution and writes the quality label as
/// the rendition's bytes.
pub struct FakeEncoder {
    pub width: u32,
    pub height: u32,
    pub fail_on: Option<Quality>,
    /// When set, every encode waits for a permit before finishing.
    pub gate: Option<Arc<Notify>>,
}

impl FakeEncoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fail_on: None,
            gate: None,
        }
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn probe(&self, source: &Path) -> Result<ProbeInfo, EncoderError> {
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| EncoderError::Probe(e.to_string()))?;
        Ok(ProbeInfo {
            duration_seconds: 42.0,
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
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        tokio::fs::write(output, target.quality.as_str()).await?;
        if self.fail_on == Some(target.quality) {
            return Err(EncoderError::Encode("simulated encoder crash".into()));
        }
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub repo: Arc<InMemoryRepository>,
    transcoder: Option<Transcoder>,
    receiver: Receiver<Uuid>,
    pub dir: tempfile::TempDir,
}

impl TestApp {
    pub async fn new(encoder: FakeEncoder) -> Self {
        Self::with_capacity(encoder, 4).await
    }

    pub async fn with_capacity(encoder: FakeEncoder, queue_capacity: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_dirs(dir.path(), SECRET);
        config.transcode_queue_capacity = queue_capacity;

        let repo = Arc::new(InMemoryRepository::new());
        let (state, transcoder, receiver) = AppState::assemble(
            config,
            Repositories::from_shared(repo.clone()),
            Arc::new(encoder),
        );
        let router = create_app(state.clone()).await;

        Self {
            router,
            state,
            repo,
            transcoder: Some(transcoder),
            receiver,
            dir,
        }
    }

    pub fn start_workers(&mut self) {
        if let Some(transcoder) = self.transcoder.take() {
            start_transcoder_workers(transcoder, self.receiver.clone(), 1);
        }
    }

    pub async fn paid_lesson(&self) -> (Uuid, Uuid) {
        let (lesson, course) = (Uuid::new_v4(), Uuid::new_v4());
        self.repo.add_lesson(lesson, course, false).await;
        (lesson, course)
    }

    pub async fn free_lesson(&self) -> Uuid {
        let lesson = Uuid::new_v4();
        self.repo.add_lesson(lesson, Uuid::new_v4(), true).await;
        lesson
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    pub async fn send_json(&self, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, _, body) = self.send(req).await;
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    pub async fn upload(&self, token: &str, lesson_id: Uuid, bytes: &[u8]) -> (StatusCode, serde_json::Value) {
        let (content_type, body) = multipart_body(Some(&lesson_id.to_string()), Some(bytes));
        self.send_json(
            Request::post("/api/v1/video/upload")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    pub async fn job(&self, job_id: Uuid) -> TranscodeJob {
        self.state.jobs.get(job_id).await.unwrap().unwrap()
    }

    pub async fn wait_until<F>(&self, job_id: Uuid, done: F) -> TranscodeJob
    where
        F: Fn(&TranscodeJob) -> bool,
    {
        for _ in 0..500 {
            let job = self.job(job_id).await;
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not reach the expected state", job_id);
    }

    pub async fn wait_for_terminal(&self, job_id: Uuid) -> TranscodeJob {
        self.wait_until(job_id, |j| j.is_terminal()).await
    }

    pub fn upload_dir(&self) -> std::path::PathBuf {
        self.state.config.upload_dir.clone()
    }

    pub fn media_dir(&self) -> std::path::PathBuf {
        self.state.config.media_dir.clone()
    }
}

pub fn token(user_id: Uuid, role: &str) -> String {
    let now = time::OffsetDateTime::now_utc().unix_timestamp() as usize;
    let claims = TokenClaims {
        sub: user_id,
        role: role.to_string(),
        exp: now + 3600,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

pub fn admin_token() -> String {
    token(Uuid::new_v4(), "ADMIN")
}

const BOUNDARY: &str = "lectern-test-boundary";

/// Builds a `multipart/form-data` body with optional `lessonId` and `video`
/// parts.
pub fn multipart_body(lesson_id: Option<&str>, video: Option<&[u8]>) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    if let Some(lesson_id) = lesson_id {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"lessonId\"\r\n\r\n{lesson_id}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(video) = video {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"video\"; filename=\"lecture.mp4\"\r\nContent-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(video);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={BOUNDARY}"), body)
}

pub fn dir_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
