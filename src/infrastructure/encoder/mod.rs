//! Media encoder capability.
//!
//! The transcoder only talks to [`Encoder`]; the real implementation shells out
//! to ffmpeg/ffprobe and tests substitute a fake.

pub mod ffmpeg;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::modules::video::model::Quality;

pub use ffmpeg::FfmpegEncoder;

/// Facts about a source file needed to plan renditions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeInfo {
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
}

/// One rendition to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenditionTarget {
    pub quality: Quality,
    pub width: u32,
    pub height: u32,
    /// `None` means quality-based rate control at source resolution.
    pub bitrate_kbps: Option<u32>,
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("encoder timed out after {0}s")]
    Timeout(u64),
    #[error("encoder could not be started: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Reads duration, resolution and size of a source file.
    async fn probe(&self, source: &Path) -> Result<ProbeInfo, EncoderError>;

    /// Writes exactly one web-playable file at `output`. Partial output left
    /// behind on failure is the caller's to remove.
    async fn encode(
        &self,
        source: &Path,
        output: &Path,
        target: &RenditionTarget,
    ) -> Result<(), EncoderError>;
}
