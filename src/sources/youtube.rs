use async_process::Command;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
    time::Duration,
};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::{remove_matching, remove_stem_siblings, AudioExtractor, AudioSearcher, VideoSummary};
use crate::config::Config;
use crate::error::{ExtractError, SearchError};

static VIDEO_ID_IN_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[?&]v=|youtu\.be/|/embed/|/shorts/|/v/)([A-Za-z0-9_-]{11})")
        .expect("valid video id regex")
});

static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(https?://)?(www\.|m\.)?(youtube\.com/(watch\?|embed/|v/|shorts/)|youtu\.be/|music\.youtube\.com/)",
    )
    .expect("valid youtube url regex")
});

pub fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

const MAX_CONCURRENT_SEARCHES: usize = 4;
const MAX_CONCURRENT_EXTRACTIONS: usize = 4;

/// yt-dlp backed search and extraction.
pub struct YtDlpClient {
    binary: String,
    temp_dir: PathBuf,
    socket_timeout: Duration,
    // Separate pools so long conversions never hold up searches.
    search_limiter: Arc<Semaphore>,
    extract_limiter: Arc<Semaphore>,
}

/// One line of `--dump-json --flat-playlist` output.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: String,
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

impl YtDlpClient {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.ytdlp_path.clone(),
            temp_dir: config.temp_dir.clone(),
            socket_timeout: config.ytdlp_socket_timeout,
            search_limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_SEARCHES)),
            extract_limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_EXTRACTIONS)),
        }
    }

    /// Checks that yt-dlp and ffmpeg can be executed.
    pub async fn verify_dependencies(&self) -> anyhow::Result<()> {
        let ytdlp = Command::new(&self.binary).arg("--version").output().await;
        match ytdlp {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp version: {}", version.trim());
            }
            _ => {
                error!("❌ yt-dlp not found at {:?}", self.binary);
                anyhow::bail!("yt-dlp not available");
            }
        }

        let ffmpeg = Command::new("ffmpeg").arg("-version").output().await;
        match ffmpeg {
            Ok(output) if output.status.success() => info!("✅ ffmpeg available"),
            _ => {
                error!("❌ ffmpeg not found in PATH");
                anyhow::bail!("ffmpeg not available");
            }
        }

        Ok(())
    }

    /// Whether `url` points at YouTube or YouTube Music.
    pub fn is_youtube_url(url: &str) -> bool {
        YOUTUBE_URL.is_match(url)
    }

    /// Pulls the 11-character video id out of a YouTube URL.
    pub fn extract_video_id(url: &str) -> Option<String> {
        if !Self::is_youtube_url(url) {
            return None;
        }
        VIDEO_ID_IN_URL
            .captures(url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn search_args(&self, query: &str, limit: usize) -> Vec<String> {
        vec![
            "--dump-json".into(),
            "--flat-playlist".into(),
            "--skip-download".into(),
            "--no-warnings".into(),
            "--quiet".into(),
            "--socket-timeout".into(),
            self.socket_timeout.as_secs().max(1).to_string(),
            format!("ytsearch{}:{}", limit, query),
        ]
    }

    fn extract_args(&self, id: &str, output_path: &Path, bitrate_kbps: u32) -> Vec<String> {
        let home = output_path.parent().unwrap_or_else(|| Path::new("."));
        let stem = output_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(id);

        vec![
            "--no-playlist".into(),
            "--format".into(),
            "bestaudio/best".into(),
            "--extract-audio".into(),
            "--audio-format".into(),
            "mp3".into(),
            "--audio-quality".into(),
            format!("{}K", bitrate_kbps),
            "--paths".into(),
            format!("home:{}", home.display()),
            "--paths".into(),
            format!("temp:{}", self.temp_dir.display()),
            "--output".into(),
            format!("{}.%(ext)s", stem),
            "--socket-timeout".into(),
            self.socket_timeout.as_secs().max(1).to_string(),
            "--retries".into(),
            "15".into(),
            "--fragment-retries".into(),
            "15".into(),
            "--concurrent-fragments".into(),
            "4".into(),
            "--geo-bypass".into(),
            "--no-check-certificates".into(),
            "--extractor-args".into(),
            "youtube:player_client=android,web".into(),
            "--quiet".into(),
            "--no-warnings".into(),
            "--no-progress".into(),
            watch_url(id),
        ]
    }
}

#[async_trait]
impl AudioSearcher for YtDlpClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<VideoSummary>, SearchError> {
        let _permit = self
            .search_limiter
            .acquire()
            .await
            .map_err(|_| SearchError::new("search limiter closed"))?;

        info!("🔍 Searching YouTube: {}", query);

        let output = Command::new(&self.binary)
            .args(self.search_args(query, limit))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SearchError::new(format!("failed to run yt-dlp: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("yt-dlp search failed: {}", stderr.trim());
            return Err(SearchError::new(format!("yt-dlp error: {}", stderr.trim())));
        }

        let results = parse_search_output(&String::from_utf8_lossy(&output.stdout), limit);
        info!("🔍 Found {} results for: {}", results.len(), query);
        Ok(results)
    }

    fn source_name(&self) -> &'static str {
        "YouTube"
    }
}

#[async_trait]
impl AudioExtractor for YtDlpClient {
    async fn extract_audio(
        &self,
        id: &str,
        output_path: &Path,
        bitrate_kbps: u32,
    ) -> Result<u64, ExtractError> {
        let _permit = self
            .extract_limiter
            .acquire()
            .await
            .map_err(|_| ExtractError::Conversion("extraction limiter closed".into()))?;

        info!("🎵 Extracting audio for {} -> {}", id, output_path.display());

        let output = Command::new(&self.binary)
            .args(self.extract_args(id, output_path, bitrate_kbps))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExtractError::Conversion(format!("failed to run yt-dlp: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("yt-dlp extraction failed for {}: {}", id, stderr.trim());
            return Err(classify_failure(&stderr));
        }

        match tokio::fs::metadata(output_path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) => {
                warn!("MP3 missing after conversion for {}: {}", id, e);
                Err(ExtractError::Conversion(
                    "MP3 file not found after download/conversion".into(),
                ))
            }
        }
    }

    async fn discard_partial(&self, output_path: &Path) {
        remove_stem_siblings(output_path).await;
        if let Some(stem) = output_path.file_stem().and_then(|s| s.to_str()) {
            remove_matching(&self.temp_dir, stem).await;
        }
    }
}

/// Parses `--dump-json` output, one JSON object per line. Lines that do not
/// describe a video are skipped.
fn parse_search_output(stdout: &str, limit: usize) -> Vec<VideoSummary> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<YtDlpInfo>(line) {
            Ok(info) => Some(info_to_summary(info)),
            Err(e) => {
                debug!("Skipping unparseable yt-dlp line: {}", e);
                None
            }
        })
        .take(limit)
        .collect()
}

fn info_to_summary(info: YtDlpInfo) -> VideoSummary {
    let thumbnail_url = info
        .thumbnail
        .or_else(|| info.thumbnails.into_iter().last().map(|t| t.url))
        .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", info.id));

    VideoSummary {
        title: info.title.unwrap_or_else(|| "Unknown".to_string()),
        artist: info.uploader.or(info.channel),
        duration_seconds: info.duration.map_or(0, |d| d.max(0.0).round() as u64),
        thumbnail_url,
        id: info.id,
    }
}

/// Maps yt-dlp stderr onto the extraction error taxonomy.
fn classify_failure(stderr: &str) -> ExtractError {
    let lower = stderr.to_lowercase();
    let message = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("yt-dlp failed")
        .trim()
        .to_string();

    const NOT_FOUND: &[&str] = &[
        "video unavailable",
        "this video is not available",
        "private video",
        "does not exist",
        "has been removed",
        "incomplete youtube id",
        "http error 404",
    ];
    const NETWORK: &[&str] = &[
        "unable to download webpage",
        "timed out",
        "connection reset",
        "temporary failure in name resolution",
        "network is unreachable",
        "urlopen error",
        "http error 5",
        "http error 429",
    ];

    if NOT_FOUND.iter().any(|needle| lower.contains(needle)) {
        ExtractError::NotFound(message)
    } else if NETWORK.iter().any(|needle| lower.contains(needle)) {
        ExtractError::Network(message)
    } else {
        ExtractError::Conversion(message)
    }
}
