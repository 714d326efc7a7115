use super::{Encoder, EncoderError, ProbeInfo, RenditionTarget};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Keeps the tail of ffmpeg's stderr, which is where the actual error lives.
const DIAGNOSTIC_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Option<Duration>,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            timeout,
        }
    }

    async fn run(&self, mut cmd: Command) -> Result<Output, EncoderError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| EncoderError::Timeout(limit.as_secs()))?
                .map_err(EncoderError::from),
            None => cmd.output().await.map_err(EncoderError::from),
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn probe(&self, source: &Path) -> Result<ProbeInfo, EncoderError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(source);

        let output = self.run(cmd).await?;
        if !output.status.success() {
            return Err(EncoderError::Probe(diagnostic(&output.stderr)));
        }

        let mut info = parse_probe_output(&output.stdout)?;
        if info.size_bytes == 0 {
            info.size_bytes = tokio::fs::metadata(source).await?.len();
        }
        Ok(info)
    }

    async fn encode(
        &self,
        source: &Path,
        output: &Path,
        target: &RenditionTarget,
    ) -> Result<(), EncoderError> {
        let args = encode_args(source, output, target);
        debug!("FFmpeg args: {:?}", args);

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(&args);

        let result = self.run(cmd).await?;
        if !result.status.success() {
            return Err(EncoderError::Encode(diagnostic(&result.stderr)));
        }
        Ok(())
    }
}

/// Builds the ffmpeg argument list for one rendition: H.264 in an MP4 with the
/// index moved to the front, yuv420p so every browser can decode it.
pub fn encode_args(source: &Path, output: &Path, target: &RenditionTarget) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        // stderr is buffered whole; keep it to real errors
        "-nostats".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "fast".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ];

    match target.bitrate_kbps {
        Some(kbps) => {
            args.extend([
                "-vf".into(),
                format!("scale=-2:{}", target.height),
                "-b:v".into(),
                format!("{}k", kbps),
                "-maxrate".into(),
                format!("{}k", kbps + kbps / 2),
                "-bufsize".into(),
                format!("{}k", kbps * 2),
            ]);
        }
        None => {
            // x264 rejects odd dimensions with yuv420p
            args.extend([
                "-vf".into(),
                "scale=trunc(iw/2)*2:trunc(ih/2)*2".into(),
                "-crf".into(),
                "23".into(),
            ]);
        }
    }

    args.extend([
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-ac".into(),
        "2".into(),
        "-movflags".into(),
        "+faststart".into(),
        output.to_string_lossy().into_owned(),
    ]);

    args
}

fn diagnostic(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.is_empty() {
        return "encoder exited without diagnostics".to_string();
    }
    let start = text
        .char_indices()
        .rev()
        .nth(DIAGNOSTIC_TAIL.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

pub(crate) fn parse_probe_output(stdout: &[u8]) -> Result<ProbeInfo, EncoderError> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| EncoderError::Probe(format!("ffprobe JSON parse error: {}", e)))?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| EncoderError::Probe("no video stream found".to_string()))?;

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(EncoderError::Probe(
                "video stream has no resolution".to_string(),
            ));
        }
    };

    let format = parsed.format.as_ref();
    let duration_seconds = format
        .and_then(|f| f.duration.as_deref())
        .or(video.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let size_bytes = format
        .and_then(|f| f.size.as_deref())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ProbeInfo {
        duration_seconds,
        width,
        height,
        size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::video::model::Quality;

    #[test]
    fn parses_ffprobe_json() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080}
            ],
            "format": {"duration": "63.250000", "size": "10485760", "format_name": "mov,mp4"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert_eq!(info.size_bytes, 10_485_760);
        assert!((info.duration_seconds - 63.25).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_audio_only_sources() {
        let json = br#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "3.0"}}"#;
        assert!(matches!(
            parse_probe_output(json),
            Err(EncoderError::Probe(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_probe_output(b"not json"),
            Err(EncoderError::Probe(_))
        ));
    }

    #[test]
    fn ladder_rendition_scales_and_caps_bitrate() {
        let target = RenditionTarget {
            quality: Quality::P720,
            width: 1280,
            height: 720,
            bitrate_kbps: Some(2500),
        };
        let args = encode_args(Path::new("/in.mkv"), Path::new("/out.mp4"), &target);
        let joined = args.join(" ");
        assert!(joined.contains("-vf scale=-2:720"));
        assert!(joined.contains("-b:v 2500k"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.contains("-nostats -loglevel error"));
        assert_eq!(args.last().map(String::as_str), Some("/out.mp4"));
    }

    #[test]
    fn original_rendition_uses_crf() {
        let target = RenditionTarget {
            quality: Quality::Original,
            width: 641,
            height: 361,
            bitrate_kbps: None,
        };
        let args = encode_args(Path::new("/in.mkv"), Path::new("/out.mp4"), &target);
        assert!(args.iter().any(|a| a == "-crf"));
        assert!(!args.iter().any(|a| a == "-b:v"));
    }

    #[test]
    fn diagnostic_keeps_the_tail() {
        let long = "x".repeat(DIAGNOSTIC_TAIL * 2) + "final error";
        let kept = diagnostic(long.as_bytes());
        assert!(kept.ends_with("final error"));
        assert_eq!(kept.chars().count(), DIAGNOSTIC_TAIL);
        assert_eq!(diagnostic(b"  "), "encoder exited without diagnostics");
    }
}
