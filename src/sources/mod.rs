pub mod youtube;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ExtractError, SearchError};

pub use youtube::YtDlpClient;

/// One search result, in the provider's relevance order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    /// Uploader or channel name, when the provider reports one.
    pub artist: Option<String>,
    pub duration_seconds: u64,
    pub thumbnail_url: String,
}

impl VideoSummary {
    pub fn watch_url(&self) -> String {
        youtube::watch_url(&self.id)
    }
}

/// Search collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSearcher: Send + Sync {
    /// Returns up to `limit` results for `query`, most relevant first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<VideoSummary>, SearchError>;

    /// Display name of the provider.
    fn source_name(&self) -> &'static str;
}

/// Extraction and conversion collaborator.
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Downloads the audio for `id` and writes it as MP3 to `output_path`.
    ///
    /// Returns the size of the written file in bytes.
    async fn extract_audio(
        &self,
        id: &str,
        output_path: &Path,
        bitrate_kbps: u32,
    ) -> Result<u64, ExtractError>;

    /// Removes whatever an interrupted or rejected extraction left behind.
    ///
    /// The default removes `output_path` and any sibling named `{stem}.*`.
    async fn discard_partial(&self, output_path: &Path) {
        remove_stem_siblings(output_path).await;
    }
}

/// Deletes `path` and every file in its directory whose name starts with
/// `{stem}.`. Missing files are ignored.
pub(crate) async fn remove_stem_siblings(path: &Path) {
    let (Some(dir), Some(stem)) = (path.parent(), path.file_stem().and_then(|s| s.to_str()))
    else {
        return;
    };
    remove_matching(dir, stem).await;
}

/// Deletes every file in `dir` named `{stem}.*`.
pub(crate) async fn remove_matching(dir: &Path, stem: &str) {
    let prefix = format!("{stem}.");
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list {}: {}", dir.display(), e);
            return;
        }
    };

    let mut doomed: Vec<PathBuf> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            doomed.push(entry.path());
        }
    }

    for path in doomed {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("🗑️ Removed partial file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
        }
    }
}
