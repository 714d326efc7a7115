use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// Progress reported as soon as a job starts, before any encode finishes.
pub const INITIAL_PROGRESS: u8 = 10;
/// Progress ceiling while encodes run; the rest is reserved for persistence.
pub const ENCODED_PROGRESS: u8 = 90;

/// Rendition quality. Ordering follows the encoding ladder.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
pub enum Quality {
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "original")]
    Original,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::P480 => "480p",
            Quality::P720 => "720p",
            Quality::P1080 => "1080p",
            Quality::Original => "original",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "480p" => Ok(Quality::P480),
            "720p" => Ok(Quality::P720),
            "1080p" => Ok(Quality::P1080),
            "original" => Ok(Quality::Original),
            _ => Err(()),
        }
    }
}

/// Flat status label, as stored and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Quality label to rendition id (the file name under the media directory).
pub type RenditionMap = BTreeMap<Quality, String>;

/// Lifecycle state with the fields each state requires.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Processing {
        started_at: OffsetDateTime,
        progress: u8,
        /// Renditions finished so far; not final until the job completes.
        renditions: RenditionMap,
        /// Rendition whose encode is in flight.
        encoding: Option<String>,
    },
    Completed {
        started_at: OffsetDateTime,
        completed_at: OffsetDateTime,
        renditions: RenditionMap,
    },
    Failed {
        started_at: Option<OffsetDateTime>,
        failed_at: OffsetDateTime,
        error: String,
    },
    Cancelled {
        started_at: Option<OffsetDateTime>,
        cancelled_at: OffsetDateTime,
    },
}

#[derive(Debug, Error, PartialEq)]
#[error("cannot {action} a job that is {from}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub action: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeJob {
    pub id: Uuid,
    pub lesson_id: Uuid,
    pub source_path: PathBuf,
    pub created_by: Uuid,
    pub created_at: OffsetDateTime,
    pub state: JobState,
}

impl TranscodeJob {
    pub fn new(lesson_id: Uuid, source_path: PathBuf, created_by: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            lesson_id,
            source_path,
            created_by,
            created_at: OffsetDateTime::now_utc(),
            state: JobState::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
            JobState::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn progress(&self) -> u8 {
        match &self.state {
            JobState::Pending | JobState::Cancelled { .. } => 0,
            JobState::Processing { progress, .. } => *progress,
            JobState::Completed { .. } => 100,
            JobState::Failed { .. } => 0,
        }
    }

    /// Final renditions; empty unless the job completed.
    pub fn final_renditions(&self) -> Option<&RenditionMap> {
        match &self.state {
            JobState::Completed { renditions, .. } => Some(renditions),
            _ => None,
        }
    }

    /// Every rendition file this job currently owns, final or partial.
    pub fn produced_renditions(&self) -> Option<&RenditionMap> {
        match &self.state {
            JobState::Processing { renditions, .. } | JobState::Completed { renditions, .. } => {
                Some(renditions)
            }
            _ => None,
        }
    }

    /// Rendition currently being written, if an encode is in flight.
    pub fn encoding(&self) -> Option<&str> {
        match &self.state {
            JobState::Processing { encoding, .. } => encoding.as_deref(),
            _ => None,
        }
    }

    /// File names of every rendition the job may have left on disk, including
    /// a partial one from an interrupted encode.
    pub fn rendition_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .produced_renditions()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        if let Some(id) = self.encoding() {
            files.push(id.to_string());
        }
        files
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn started_at(&self) -> Option<OffsetDateTime> {
        match &self.state {
            JobState::Pending => None,
            JobState::Processing { started_at, .. } | JobState::Completed { started_at, .. } => {
                Some(*started_at)
            }
            JobState::Failed { started_at, .. } | JobState::Cancelled { started_at, .. } => {
                *started_at
            }
        }
    }

    pub fn completed_at(&self) -> Option<OffsetDateTime> {
        match &self.state {
            JobState::Completed { completed_at, .. } => Some(*completed_at),
            _ => None,
        }
    }

    pub fn failed_at(&self) -> Option<OffsetDateTime> {
        match &self.state {
            JobState::Failed { failed_at, .. } => Some(*failed_at),
            _ => None,
        }
    }

    pub fn cancelled_at(&self) -> Option<OffsetDateTime> {
        match &self.state {
            JobState::Cancelled { cancelled_at, .. } => Some(*cancelled_at),
            _ => None,
        }
    }

    /// The one terminal timestamp, if any.
    pub fn finished_at(&self) -> Option<OffsetDateTime> {
        self.completed_at()
            .or_else(|| self.failed_at())
            .or_else(|| self.cancelled_at())
    }

    pub fn start(&mut self, now: OffsetDateTime) -> Result<(), TransitionError> {
        match self.state {
            JobState::Pending => {
                self.state = JobState::Processing {
                    started_at: now,
                    progress: INITIAL_PROGRESS,
                    renditions: RenditionMap::new(),
                    encoding: None,
                };
                Ok(())
            }
            _ => Err(self.refuse("start")),
        }
    }

    /// Marks `rendition_id` as being encoded.
    pub fn begin_rendition(&mut self, rendition_id: String) -> Result<(), TransitionError> {
        match &mut self.state {
            JobState::Processing { encoding, .. } => {
                *encoding = Some(rendition_id);
                Ok(())
            }
            _ => Err(self.refuse("begin a rendition on")),
        }
    }

    /// Records a finished rendition. Progress never moves backwards.
    pub fn record_rendition(
        &mut self,
        quality: Quality,
        rendition_id: String,
        new_progress: u8,
    ) -> Result<(), TransitionError> {
        match &mut self.state {
            JobState::Processing {
                progress,
                renditions,
                encoding,
                ..
            } => {
                if encoding.as_deref() == Some(rendition_id.as_str()) {
                    *encoding = None;
                }
                renditions.insert(quality, rendition_id);
                *progress = (*progress).max(new_progress.min(ENCODED_PROGRESS));
                Ok(())
            }
            _ => Err(self.refuse("record a rendition on")),
        }
    }

    pub fn complete(&mut self, now: OffsetDateTime) -> Result<(), TransitionError> {
        match &mut self.state {
            JobState::Processing {
                started_at,
                renditions,
                ..
            } if !renditions.is_empty() => {
                self.state = JobState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                    renditions: std::mem::take(renditions),
                };
                Ok(())
            }
            _ => Err(self.refuse("complete")),
        }
    }

    pub fn fail(&mut self, now: OffsetDateTime, error: String) -> Result<(), TransitionError> {
        match self.state {
            JobState::Pending | JobState::Processing { .. } => {
                self.state = JobState::Failed {
                    started_at: self.started_at(),
                    failed_at: now,
                    error,
                };
                Ok(())
            }
            _ => Err(self.refuse("fail")),
        }
    }

    pub fn cancel(&mut self, now: OffsetDateTime) -> Result<(), TransitionError> {
        match self.state {
            JobState::Pending | JobState::Processing { .. } => {
                self.state = JobState::Cancelled {
                    started_at: self.started_at(),
                    cancelled_at: now,
                };
                Ok(())
            }
            _ => Err(self.refuse("cancel")),
        }
    }

    fn refuse(&self, action: &'static str) -> TransitionError {
        TransitionError {
            from: self.status(),
            action,
        }
    }
}

/// Flattened columns of a job, as stored durably.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub status: JobStatus,
    pub progress: u8,
    pub renditions: RenditionMap,
    pub encoding: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
}

impl JobRecord {
    pub fn from_job(job: &TranscodeJob) -> Self {
        Self {
            status: job.status(),
            progress: job.progress(),
            renditions: job.produced_renditions().cloned().unwrap_or_default(),
            encoding: job.encoding().map(str::to_string),
            error: job.error().map(str::to_string),
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            failed_at: job.failed_at(),
            cancelled_at: job.cancelled_at(),
        }
    }

    /// Rebuilds the tagged state, rejecting rows that violate its invariants.
    pub fn into_state(self) -> Result<JobState, String> {
        let missing = |field: &str| format!("{} job without {}", self.status, field);
        Ok(match self.status {
            JobStatus::Pending => JobState::Pending,
            JobStatus::Processing => JobState::Processing {
                started_at: self.started_at.ok_or_else(|| missing("started_at"))?,
                progress: self.progress.min(ENCODED_PROGRESS),
                renditions: self.renditions,
                encoding: self.encoding,
            },
            JobStatus::Completed => {
                if self.renditions.is_empty() {
                    return Err(missing("renditions"));
                }
                JobState::Completed {
                    started_at: self.started_at.ok_or_else(|| missing("started_at"))?,
                    completed_at: self.completed_at.ok_or_else(|| missing("completed_at"))?,
                    renditions: self.renditions,
                }
            }
            JobStatus::Failed => JobState::Failed {
                started_at: self.started_at,
                failed_at: self.failed_at.ok_or_else(|| missing("failed_at"))?,
                error: self.error.unwrap_or_else(|| "unknown error".to_string()),
            },
            JobStatus::Cancelled => JobState::Cancelled {
                started_at: self.started_at,
                cancelled_at: self.cancelled_at.ok_or_else(|| missing("cancelled_at"))?,
            },
        })
    }
}

/// File name of a rendition: `{lessonId}_{quality}_{millis}.{ext}`.
///
/// The lesson owning a rendition is recoverable from the name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionId {
    pub lesson_id: Uuid,
    pub quality: Quality,
    pub timestamp_ms: i64,
    pub ext: String,
}

const RENDITION_EXTENSIONS: [&str; 4] = ["mp4", "webm", "mkv", "mov"];

/// Last timestamp handed out, so ids minted in the same millisecond differ.
static LAST_RENDITION_MS: AtomicI64 = AtomicI64::new(0);

impl RenditionId {
    /// A fresh id stamped no earlier than `at`. Timestamps are strictly
    /// increasing within the process, so two encodes never share a file.
    pub fn new(lesson_id: Uuid, quality: Quality, at: OffsetDateTime) -> Self {
        let millis = (at.unix_timestamp_nanos() / 1_000_000) as i64;
        let previous = LAST_RENDITION_MS
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(millis.max(last + 1))
            })
            .unwrap_or(millis);
        Self {
            lesson_id,
            quality,
            timestamp_ms: millis.max(previous + 1),
            ext: "mp4".to_string(),
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        let (stem, ext) = id.rsplit_once('.')?;
        if !RENDITION_EXTENSIONS.contains(&ext) {
            return None;
        }

        let mut parts = stem.splitn(3, '_');
        let lesson_id = Uuid::parse_str(parts.next()?).ok()?;
        let quality = parts.next()?.parse::<Quality>().ok()?;
        let timestamp = parts.next()?;
        if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            lesson_id,
            quality,
            timestamp_ms: timestamp.parse().ok()?,
            ext: ext.to_string(),
        })
    }

    /// The id is the last path segment of a stream URL.
    pub fn from_url(url: &str) -> Option<Self> {
        Self::parse(url.rsplit('/').next()?)
    }

    pub fn stream_url(&self) -> String {
        stream_url(&self.to_string())
    }
}

impl fmt::Display for RenditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}.{}",
            self.lesson_id.hyphenated(),
            self.quality,
            self.timestamp_ms,
            self.ext
        )
    }
}

pub fn stream_url(rendition_id: &str) -> String {
    format!("/api/v1/video/stream/{}", rendition_id)
}

/// Persisted media of a lesson, one per lesson.
#[derive(Debug, Clone, PartialEq)]
pub struct LessonMedia {
    pub lesson_id: Uuid,
    /// Job whose upload produced these renditions.
    pub job_id: Uuid,
    /// Creation time of that job. A record is only replaced by a newer upload.
    pub job_created_at: OffsetDateTime,
    /// Quality label to stream URL.
    pub renditions: BTreeMap<Quality, String>,
    pub duration_seconds: f64,
    pub size_bytes: i64,
    pub uploaded_at: OffsetDateTime,
}

impl LessonMedia {
    /// Whether `self` comes from a later upload than `other`.
    pub fn supersedes(&self, other: &LessonMedia) -> bool {
        (self.job_created_at, self.job_id) > (other.job_created_at, other.job_id)
    }
}

/// Course facts needed to gate access to a lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CourseAccess {
    pub course_id: Uuid,
    pub is_free: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub actor_id: Option<Uuid>,
    pub action: String,
    pub target_type: String,
    pub target_id: Uuid,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn job(actor_id: Option<Uuid>, action: &str, job_id: Uuid, details: serde_json::Value) -> Self {
        Self {
            actor_id,
            action: action.to_string(),
            target_type: "transcode_job".to_string(),
            target_id: job_id,
            details,
        }
    }
}
