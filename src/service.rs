//! `MusicFinder`: search and download orchestration.
//!
//! Wires the search cache, the job registry and the storage janitor to the
//! collaborators. Constructed once at startup and shared behind an `Arc`.

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheMetrics, SearchCache},
    config::Config,
    error::{FinderError, JobFailure, SearchError},
    jobs::{ConvertedFile, JobOutcome, JobRegistry},
    sources::{AudioExtractor, AudioSearcher, VideoSummary, YtDlpClient},
    storage::{Janitor, RetentionPolicy, StorageStats},
};

pub const MAX_QUERY_CHARS: usize = 200;

static VIDEO_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid video id regex"));

pub struct MusicFinder {
    config: Arc<Config>,
    searcher: Arc<dyn AudioSearcher>,
    extractor: Arc<dyn AudioExtractor>,
    cache: SearchCache,
    jobs: JobRegistry,
    janitor: Arc<Janitor>,
}

/// Snapshot exposed on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct FinderStats {
    pub cache: CacheMetrics,
    pub cache_hit_rate: f64,
    pub cached_queries: usize,
    pub active_jobs: usize,
    pub storage: StorageStats,
}

impl MusicFinder {
    pub fn new(
        config: Arc<Config>,
        searcher: Arc<dyn AudioSearcher>,
        extractor: Arc<dyn AudioExtractor>,
    ) -> Self {
        let cache = SearchCache::new(config.search_cache_capacity, config.search_cache_ttl);
        let jobs = JobRegistry::new(config.job_grace_period);
        let janitor = Arc::new(Janitor::new(
            config.downloads_dir.clone(),
            RetentionPolicy {
                max_total_size: config.max_total_size,
                max_age: config.max_age,
            },
        ));

        Self {
            config,
            searcher,
            extractor,
            cache,
            jobs,
            janitor,
        }
    }

    /// Uses one yt-dlp client as both search and extraction collaborator.
    pub fn with_ytdlp(config: Arc<Config>) -> Self {
        let client = Arc::new(YtDlpClient::new(&config));
        Self::new(config, client.clone(), client)
    }

    /// Adopts files left in the downloads directory by a previous run and
    /// applies the retention policy to them.
    pub async fn init(&self) -> Result<usize> {
        let adopted = self.janitor.adopt_existing().await?;
        info!(
            "✅ MusicFinder ready ({} searcher, {} existing downloads)",
            self.searcher.source_name(),
            adopted
        );
        Ok(adopted)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[allow(dead_code)]
    pub fn cache(&self) -> &SearchCache {
        &self.cache
    }

    pub fn janitor(&self) -> &Arc<Janitor> {
        &self.janitor
    }

    /// Cache-backed search. `limit` defaults to `DEFAULT_SEARCH_LIMIT`.
    ///
    /// A miss runs the collaborator on its own task, so the cache is still
    /// populated if the caller goes away mid-search.
    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<VideoSummary>, FinderError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(FinderError::invalid("query must not be empty"));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(FinderError::invalid(format!(
                "query must be at most {MAX_QUERY_CHARS} characters"
            )));
        }

        let limit = limit.unwrap_or(self.config.default_search_limit);
        if limit == 0 || limit > self.config.max_search_limit {
            return Err(FinderError::invalid(format!(
                "limit must be between 1 and {}",
                self.config.max_search_limit
            )));
        }

        if let Some(results) = self.cache.lookup_page(query, limit) {
            return Ok(results);
        }

        info!("🔍 Searching {}: '{}' (limit {})", self.searcher.source_name(), query, limit);

        let searcher = Arc::clone(&self.searcher);
        let cache = self.cache.clone();
        let owned_query = query.to_string();
        let task = tokio::spawn(async move {
            let mut results = searcher.search(&owned_query, limit).await?;
            results.truncate(limit);
            cache.store_page(&owned_query, limit, results.clone());
            Ok::<_, SearchError>(results)
        });

        let results = task
            .await
            .map_err(|e| SearchError::new(format!("search task aborted: {e}")))??;

        debug!("Found {} results for '{}'", results.len(), query);
        Ok(results)
    }

    /// Resolves a video id (or YouTube URL) to a ready MP3 on disk.
    ///
    /// Reuses a tracked `{id}.mp3` when present; otherwise attaches to the
    /// conversion job for the id, starting one if none is registered.
    pub async fn download(&self, id_or_url: &str) -> Result<ConvertedFile, FinderError> {
        let id = resolve_video_id(id_or_url)?;
        let path = self.output_path(&id);

        if let Some(file) = self.reusable_file(&path).await {
            info!("♻️ Serving existing download for {}", id);
            return Ok(file);
        }

        let conversion = Conversion {
            extractor: Arc::clone(&self.extractor),
            janitor: Arc::clone(&self.janitor),
            max_file_size: self.config.max_file_size,
            bitrate_kbps: self.config.audio_bitrate_kbps,
        };
        let job_id = id.clone();
        let handle = self
            .jobs
            .get_or_start(&id, move || conversion.run(job_id, path));
        if !handle.started_job() {
            info!("🔗 Waiting on running conversion for {}", id);
        }

        Ok(handle.wait().await?)
    }

    /// Path of the MP3 for `id`. Ids are validated before reaching here.
    pub fn output_path(&self, id: &str) -> PathBuf {
        self.config.downloads_dir.join(format!("{id}.mp3"))
    }

    async fn reusable_file(&self, path: &Path) -> Option<ConvertedFile> {
        self.janitor.tracked(path).await?;

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Some(ConvertedFile {
                path: path.to_path_buf(),
                size_bytes: meta.len(),
            }),
            _ => {
                debug!("Tracked file vanished: {}", path.display());
                self.janitor.forget(path).await;
                None
            }
        }
    }

    pub async fn stats(&self) -> FinderStats {
        FinderStats {
            cache: self.cache.metrics(),
            cache_hit_rate: self.cache.metrics().hit_rate(),
            cached_queries: self.cache.len(),
            active_jobs: self.jobs.active_jobs(),
            storage: self.janitor.stats().await,
        }
    }

    /// Starts the periodic sweep: janitor enforcement plus expired cache
    /// purge every `CLEANUP_INTERVAL`.
    pub fn spawn_maintenance(&self) -> MaintenanceHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let janitor = Arc::clone(&self.janitor);
        let cache = self.cache.clone();
        let period = self.config.cleanup_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; init already enforced once.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => run_maintenance(&janitor, &cache).await,
                }
            }
            debug!("Maintenance task stopped");
        });

        info!("⏰ Maintenance scheduled every {}", humantime::format_duration(period));
        MaintenanceHandle { token, task }
    }
}

async fn run_maintenance(janitor: &Janitor, cache: &SearchCache) {
    let report = janitor.enforce().await;
    let purged = cache.purge_expired();

    for (path, e) in &report.failed {
        warn!("Retrying deletion of {} on next sweep: {}", path.display(), e);
    }

    info!(
        "🧹 Maintenance completed: {} files removed, {} cache entries purged",
        report.removed.len(),
        purged
    );
}

/// Handle to the periodic maintenance task.
pub struct MaintenanceHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    #[allow(dead_code)]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancels the task and waits for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Maintenance task ended abnormally: {}", e);
        }
    }
}

/// The work a conversion job performs.
struct Conversion {
    extractor: Arc<dyn AudioExtractor>,
    janitor: Arc<Janitor>,
    max_file_size: u64,
    bitrate_kbps: u32,
}

impl Conversion {
    async fn run(self, id: String, path: PathBuf) -> JobOutcome {
        let size_bytes = match self
            .extractor
            .extract_audio(&id, &path, self.bitrate_kbps)
            .await
        {
            Ok(size) => size,
            Err(e) => {
                warn!("❌ Conversion failed for {}: {}", id, e);
                self.extractor.discard_partial(&path).await;
                return Err(e.into());
            }
        };

        if size_bytes > self.max_file_size {
            warn!(
                "⚠️ {} exceeds size limit ({} > {} bytes)",
                id, size_bytes, self.max_file_size
            );
            self.extractor.discard_partial(&path).await;
            return Err(JobFailure::TooLarge {
                size_bytes,
                limit_bytes: self.max_file_size,
            });
        }

        self.janitor
            .record_new_file(path.clone(), size_bytes, Utc::now())
            .await;
        info!("✅ Converted {} ({} bytes)", id, size_bytes);

        Ok(ConvertedFile { path, size_bytes })
    }
}

/// Accepts a bare video id or a YouTube URL.
pub fn resolve_video_id(id_or_url: &str) -> Result<String, FinderError> {
    let candidate = id_or_url.trim();
    if VIDEO_ID.is_match(candidate) {
        return Ok(candidate.to_string());
    }
    YtDlpClient::extract_video_id(candidate)
        .ok_or_else(|| FinderError::invalid(format!("invalid video id: {candidate:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use crate::sources::MockAudioSearcher;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    enum Behavior {
        Write(u64),
        WriteThenFail(ExtractError),
    }

    /// Writes a small MP3 placeholder and reports a configurable size.
    struct FakeExtractor {
        calls: AtomicUsize,
        delay: Duration,
        behavior: Behavior,
    }

    impl FakeExtractor {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(30),
                behavior,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AudioExtractor for FakeExtractor {
        async fn extract_audio(
            &self,
            _id: &str,
            output_path: &Path,
            _bitrate_kbps: u32,
        ) -> Result<u64, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            tokio::fs::write(output_path, b"ID3").await.unwrap();
            match &self.behavior {
                Behavior::Write(size) => Ok(*size),
                Behavior::WriteThenFail(e) => {
                    let part = output_path.with_extension("webm.part");
                    tokio::fs::write(part, b"partial").await.unwrap();
                    Err(e.clone())
                }
            }
        }
    }

    fn summary(id: &str) -> VideoSummary {
        VideoSummary {
            id: id.to_string(),
            title: format!("Song {id}"),
            artist: Some("Artist".to_string()),
            duration_seconds: 200,
            thumbnail_url: format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"),
        }
    }

    fn test_config(dir: &Path) -> Arc<Config> {
        Arc::new(Config {
            downloads_dir: dir.join("downloads"),
            temp_dir: dir.join("temp"),
            max_file_size: 1_000,
            job_grace_period: Duration::ZERO,
            ..Config::default()
        })
    }

    fn finder(
        dir: &Path,
        searcher: MockAudioSearcher,
        extractor: Arc<FakeExtractor>,
    ) -> MusicFinder {
        let config = test_config(dir);
        std::fs::create_dir_all(&config.downloads_dir).unwrap();
        std::fs::create_dir_all(&config.temp_dir).unwrap();
        MusicFinder::new(config, Arc::new(searcher), extractor)
    }

    fn idle_searcher() -> MockAudioSearcher {
        let mut searcher = MockAudioSearcher::new();
        searcher.expect_source_name().return_const("Mock");
        searcher
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn repeated_search_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut searcher = idle_searcher();
        searcher
            .expect_search()
            .times(1)
            .returning(|_, limit| Ok((0..limit).map(|i| summary(&format!("id{i}"))).collect()));

        let finder = finder(dir.path(), searcher, FakeExtractor::new(Behavior::Write(10)));

        let first = finder.search("Daft Punk", Some(3)).await.unwrap();
        let second = finder.search("  daft   PUNK ", Some(3)).await.unwrap();
        let smaller = finder.search("daft punk", Some(2)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(smaller, first[..2].to_vec());
        assert_eq!(finder.stats().await.cache.hits, 2);
    }

    #[tokio::test]
    async fn failed_search_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut searcher = idle_searcher();
        let mut seq = mockall::Sequence::new();
        searcher
            .expect_search()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(SearchError::new("timeout")));
        searcher
            .expect_search()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec![summary("abc")]));

        let finder = finder(dir.path(), searcher, FakeExtractor::new(Behavior::Write(10)));

        let err = finder.search("lofi", None).await.unwrap_err();
        assert!(matches!(err, FinderError::Search(_)));
        assert!(err.is_retryable());

        let results = finder.search("lofi", None).await.unwrap();
        assert_eq!(results, vec![summary("abc")]);
    }

    #[tokio::test]
    async fn search_rejects_bad_input_without_calling_collaborator() {
        let dir = tempfile::tempdir().unwrap();
        let mut searcher = idle_searcher();
        searcher.expect_search().never();
        let finder = finder(dir.path(), searcher, FakeExtractor::new(Behavior::Write(10)));

        for (query, limit) in [("   ", None), ("ok", Some(0)), ("ok", Some(51))] {
            let err = finder.search(query, limit).await.unwrap_err();
            assert!(matches!(err, FinderError::InvalidRequest(_)), "{query:?} {limit:?}");
        }
        let long = "x".repeat(MAX_QUERY_CHARS + 1);
        assert!(finder.search(&long, None).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_downloads_share_one_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::new(Behavior::Write(500));
        let finder = finder(dir.path(), idle_searcher(), extractor.clone());

        let (a, b) = tokio::join!(finder.download("abc123"), finder.download("abc123"));

        let a = a.unwrap();
        assert_eq!(a, b.unwrap());
        assert_eq!(a.size_bytes, 500);
        assert_eq!(a.path, finder.output_path("abc123"));
        assert_eq!(extractor.calls(), 1);
        assert_eq!(finder.janitor().stats().await.tracked_files, 1);
    }

    #[tokio::test]
    async fn tracked_file_on_disk_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::new(Behavior::Write(500));
        let finder = finder(dir.path(), idle_searcher(), extractor.clone());

        let first = finder.download("abc123").await.unwrap();
        let again = finder.download("abc123").await.unwrap();
        assert_eq!(extractor.calls(), 1);
        assert_eq!(again.path, first.path);

        std::fs::remove_file(&first.path).unwrap();
        finder.download("abc123").await.unwrap();
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test]
    async fn oversized_result_fails_and_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::new(Behavior::Write(5_000));
        let finder = finder(dir.path(), idle_searcher(), extractor);

        let (a, b) = tokio::join!(finder.download("big"), finder.download("big"));

        let expected = FinderError::Job(JobFailure::TooLarge {
            size_bytes: 5_000,
            limit_bytes: 1_000,
        });
        for outcome in [a, b] {
            let err = outcome.unwrap_err();
            assert_eq!(err.to_string(), expected.to_string());
            assert!(!err.is_retryable());
        }
        assert!(files_in(&finder.config().downloads_dir).is_empty());
        assert_eq!(finder.janitor().stats().await.tracked_files, 0);
    }

    #[tokio::test]
    async fn conversion_error_removes_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::new(Behavior::WriteThenFail(ExtractError::Conversion(
            "ffmpeg crashed".into(),
        )));
        let finder = finder(dir.path(), idle_searcher(), extractor);
        std::fs::write(finder.config().downloads_dir.join("keep.mp3"), b"x").unwrap();

        let err = finder.download("broken").await.unwrap_err();
        assert!(matches!(err, FinderError::Job(JobFailure::Conversion(_))));
        assert!(err.is_retryable());
        assert_eq!(files_in(&finder.config().downloads_dir), vec!["keep.mp3"]);
    }

    #[tokio::test]
    async fn not_found_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let extractor =
            FakeExtractor::new(Behavior::WriteThenFail(ExtractError::NotFound("gone".into())));
        let finder = finder(dir.path(), idle_searcher(), extractor);

        let err = finder.download("missing").await.unwrap_err();
        assert!(matches!(err, FinderError::Job(JobFailure::NotFound(_))));
        assert!(!err.is_retryable());
    }

    #[test]
    fn video_ids_are_validated() {
        assert_eq!(resolve_video_id("dQw4w9WgXcQ").unwrap(), "dQw4w9WgXcQ");
        assert_eq!(
            resolve_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=3").unwrap(),
            "dQw4w9WgXcQ"
        );
        for bad in ["", "../etc/passwd", "a b", "x".repeat(65).as_str()] {
            assert!(resolve_video_id(bad).is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn init_adopts_existing_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let finder = finder(dir.path(), idle_searcher(), FakeExtractor::new(Behavior::Write(1)));
        std::fs::write(finder.output_path("old"), b"abc").unwrap();

        assert_eq!(finder.init().await.unwrap(), 1);
        let reused = finder.download("old").await.unwrap();
        assert_eq!(reused.size_bytes, 3);
    }

    #[tokio::test]
    async fn maintenance_purges_expired_cache_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            downloads_dir: dir.path().to_path_buf(),
            search_cache_ttl: Duration::from_millis(10),
            cleanup_interval: Duration::from_millis(20),
            ..Config::default()
        });
        let finder = MusicFinder::new(
            config,
            Arc::new(idle_searcher()),
            FakeExtractor::new(Behavior::Write(1)),
        );
        finder.cache().store_page("query", 1, vec![summary("a")]);

        let handle = finder.spawn_maintenance();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(finder.cache().len(), 0);
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test]
    async fn maintenance_deletes_files_past_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            downloads_dir: dir.path().to_path_buf(),
            max_age: Some(Duration::from_millis(50)),
            cleanup_interval: Duration::from_millis(20),
            ..Config::default()
        });
        let finder = MusicFinder::new(
            config,
            Arc::new(idle_searcher()),
            FakeExtractor::new(Behavior::Write(1)),
        );
        let path = dir.path().join("aaaaaaaaaaa.mp3");
        std::fs::write(&path, b"mp3").unwrap();
        finder
            .janitor()
            .record_new_file(path.clone(), 3, Utc::now())
            .await;
        assert!(path.exists());

        let handle = finder.spawn_maintenance();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!path.exists());
        assert_eq!(finder.janitor().stats().await.tracked_files, 0);
        handle.stop().await;
    }
}
