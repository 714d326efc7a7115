use anyhow::{Result, anyhow};
use axum::extract::multipart::Field;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{error, info};
use uuid::Uuid;

/// An upload that has been fully written to local disk.
#[derive(Debug, Clone)]
pub struct SavedUpload {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub original_name: String,
}

impl SavedUpload {
    /// Removes the file; missing files are not an error.
    pub async fn discard(&self) {
        remove_quietly(&self.path).await;
    }
}

pub async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Upload file names are salted with a random id and a millisecond timestamp
/// so concurrent uploads of the same file never share a path.
fn upload_file_name(original: &str) -> String {
    let ext = Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("bin")
        .to_ascii_lowercase();
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    format!("{}_{}.{}", Uuid::new_v4().simple(), millis, ext)
}

/// Streams a multipart field chunk by chunk into `dir`.
///
/// Only `video/*` content is accepted. On a mid-stream error the partially
/// written file is removed before the error is returned.
pub async fn stream_to_disk(mut field: Field<'_>, dir: &Path) -> Result<SavedUpload> {
    let content_type = field
        .content_type()
        .unwrap_or("application/octet-stream")
        .to_string();

    if !content_type.starts_with("video/") {
        return Err(anyhow!("Invalid content type: only video/* allowed"));
    }

    let original_name = field.file_name().unwrap_or("video.mp4").to_string();
    fs::create_dir_all(dir).await?;
    let path = dir.join(upload_file_name(&original_name));

    let mut file = File::create(&path).await?;
    let mut size_bytes = 0u64;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                error!("Upload stream error: {}", e);
                drop(file);
                remove_quietly(&path).await;
                return Err(anyhow!("Stream interrupted"));
            }
        };

        if let Err(e) = file.write_all(&chunk).await {
            error!("Upload write error: {}", e);
            drop(file);
            remove_quietly(&path).await;
            return Err(e.into());
        }
        size_bytes += chunk.len() as u64;
    }

    flush_or_discard(file, &path).await?;
    info!("Saved upload {} ({} bytes) to {}", original_name, size_bytes, path.display());

    Ok(SavedUpload {
        path,
        size_bytes,
        original_name,
    })
}

/// Flushes a finished upload; the file at `path` is removed if that fails.
async fn flush_or_discard<W: AsyncWrite + Unpin>(mut file: W, path: &Path) -> Result<()> {
    if let Err(e) = file.flush().await {
        error!("Upload flush error: {}", e);
        drop(file);
        remove_quietly(path).await;
        return Err(e.into());
    }
    Ok(())
}
