use super::model::RenditionId;
use super::service::VideoService;
use crate::common::error::AppError;
use crate::middleware::auth::Caller;
use crate::state::AppState;
use axum::{
    Extension,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

const NO_STORE: &str = "no-store, no-cache, must-revalidate";

/// Stream a rendition with support for Range requests
#[utoipa::path(
    get,
    path = "/api/v1/video/stream/{renditionId}",
    params(
        ("renditionId" = String, Path, description = "Rendition file name: {lessonId}_{quality}_{millis}.{ext}"),
        ("token" = Option<String>, Query, description = "JWT for players that cannot send headers")
    ),
    responses(
        (status = 200, description = "Full file"),
        (status = 206, description = "Partial Content"),
        (status = 401, description = "Invalid token"),
        (status = 403, description = "Course not purchased"),
        (status = 404, description = "Not Found")
    ),
    tag = "Video"
)]
pub async fn stream_video(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(rendition_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match serve_rendition(&state, &caller, &rendition_id, &headers).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn serve_rendition(
    state: &AppState,
    caller: &Caller,
    rendition_id: &str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let not_found = || AppError::NotFound("Video not found".to_string());

    // The grammar admits no path separators, so the id is safe to join.
    let id = RenditionId::parse(rendition_id).ok_or_else(not_found)?;

    VideoService::ensure_lesson_access(state, caller, id.lesson_id).await?;

    let path = state.config.media_dir.join(rendition_id);
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(AppError::Internal(e.into())),
    };
    let total = file
        .metadata()
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .len();

    let content_type = mime_guess::from_ext(&id.ext)
        .first_raw()
        .unwrap_or("video/mp4");

    let range = headers
        .get(header::RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| parse_range(h, total));

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE))
        .header(header::PRAGMA, "no-cache");

    let response = match range {
        Some((start, end)) => {
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
            let stream = ReaderStream::new(file.take(length));

            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))
                .header(header::CONTENT_LENGTH, length)
                .body(Body::from_stream(stream))
        }
        None => {
            let stream = ReaderStream::new(file);

            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, total)
                .body(Body::from_stream(stream))
        }
    };

    response.map_err(|e| AppError::Internal(e.into()))
}

/// Parses a single `bytes=` range into inclusive offsets. `None` means the
/// header should be ignored and the whole file served.
fn parse_range(header: &str, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    let bytes = header.trim().strip_prefix("bytes=")?;
    let (start, end) = bytes.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        // bytes=-500
        (true, false) => {
            let suffix: u64 = end.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            Some((total.saturating_sub(suffix), total - 1))
        }
        // bytes=500-
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            (start < total).then_some((start, total - 1))
        }
        // bytes=0-499
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse::<u64>().ok()?.min(total - 1);
            (start <= end).then_some((start, end))
        }
        (true, true) => None,
    }
}
