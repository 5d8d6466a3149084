use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::error::ApiResult;
use crate::error::FinderError;
use crate::service::{FinderStats, MusicFinder};
use crate::sources::VideoSummary;

const MAX_TITLE_CHARS: usize = 120;

const FALLBACK_PAGE: &str = r#"<html>
  <head><meta charset="utf-8"><title>Music Finder</title></head>
  <body>
    <h3>Music Finder</h3>
    <p>Service is running. Please add <code>static/index.html</code>.</p>
  </body>
</html>
"#;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResultResponse {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub duration: u64,
    pub thumbnail: String,
    pub url: String,
}

impl From<VideoSummary> for SearchResultResponse {
    fn from(summary: VideoSummary) -> Self {
        let url = summary.watch_url();
        Self {
            id: summary.id,
            title: summary.title,
            artist: summary
                .artist
                .unwrap_or_else(|| "Unknown Artist".to_string()),
            duration: summary.duration_seconds,
            thumbnail: summary.thumbnail_url,
            url,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub total_results: usize,
    pub results: Vec<SearchResultResponse>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    pub video_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub downloads_dir: String,
    pub stats: FinderStats,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /
///
/// Serves `STATIC_DIR/index.html`, or a placeholder page when it is missing.
pub async fn index(State(finder): State<Arc<MusicFinder>>) -> Html<String> {
    let index_path = finder.config().static_dir.join("index.html");
    match tokio::fs::read_to_string(&index_path).await {
        Ok(content) => Html(content),
        Err(e) => {
            debug!("No index page at {}: {}", index_path.display(), e);
            Html(FALLBACK_PAGE.to_string())
        }
    }
}

/// GET /favicon.ico
pub async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// GET /health
pub async fn health(State(finder): State<Arc<MusicFinder>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        downloads_dir: finder.config().downloads_dir.display().to_string(),
        stats: finder.stats().await,
    })
}

/// POST /search
pub async fn search(
    State(finder): State<Arc<MusicFinder>>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> ApiResult<Json<SearchResponse>> {
    let Json(request) = body?;
    let results = finder.search(&request.query, request.limit).await?;

    Ok(Json(SearchResponse {
        query: request.query,
        total_results: results.len(),
        results: results.into_iter().map(Into::into).collect(),
        timestamp: Utc::now(),
    }))
}

/// POST /download
///
/// Streams the MP3 once the shared conversion job for the id resolves.
pub async fn download(
    State(finder): State<Arc<MusicFinder>>,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body?;
    let converted = finder.download(&request.video_id).await?;

    let file = File::open(&converted.path)
        .await
        .map_err(|e| FinderError::storage(&converted.path, e))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| FinderError::storage(&converted.path, e))?
        .len();

    let title = request.title.as_deref().unwrap_or(&request.video_id);
    let filename = format!("{}.mp3", safe_title(title));
    info!("📤 Sending {} as {}", converted.path.display(), filename);

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/mpeg"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&filename));

    Ok(response)
}

// ============================================================================
// Helpers
// ============================================================================

/// Reduces a title to a filename-safe stem: alphanumerics, space, `-` and
/// `_` survive, at most 120 characters, spaces become underscores.
pub fn safe_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let trimmed: String = kept.trim_end().chars().take(MAX_TITLE_CHARS).collect();
    let trimmed = trimmed.trim();

    if trimmed.is_empty() {
        "track".to_string()
    } else {
        trimmed.replace(' ', "_")
    }
}

/// `attachment` header with an ASCII fallback name plus the RFC 5987 form.
fn content_disposition(filename: &str) -> HeaderValue {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(filename)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
