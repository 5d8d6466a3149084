use anyhow::Result;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

/// An MP3 tracked by the janitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// Registration order; breaks ties between equal `created_at`.
    seq: u64,
}

/// Retention limits for the downloads directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_total_size: Option<u64>,
    pub max_age: Option<Duration>,
}

/// What one enforcement pass did.
#[derive(Debug, Default)]
pub struct EnforceReport {
    pub removed: Vec<FileRecord>,
    /// Files that could not be deleted; still tracked, retried next sweep.
    pub failed: Vec<(PathBuf, std::io::Error)>,
    pub remaining_bytes: u64,
}

impl EnforceReport {
    pub fn freed_bytes(&self) -> u64 {
        self.removed.iter().map(|r| r.size_bytes).sum()
    }
}

#[derive(Debug, Default)]
struct Ledger {
    /// Oldest first: ordered by `(created_at, seq)`.
    records: Vec<FileRecord>,
    total_bytes: u64,
    next_seq: u64,
}

impl Ledger {
    fn insert(&mut self, path: PathBuf, size_bytes: u64, created_at: DateTime<Utc>) {
        self.forget(&path);

        let record = FileRecord {
            path,
            size_bytes,
            created_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let at = self
            .records
            .partition_point(|r| r.created_at <= record.created_at);
        self.total_bytes += record.size_bytes;
        self.records.insert(at, record);
    }

    fn forget(&mut self, path: &Path) -> Option<FileRecord> {
        let index = self.records.iter().position(|r| r.path == path)?;
        let record = self.records.remove(index);
        self.total_bytes -= record.size_bytes;
        Some(record)
    }
}

/// Enforces the size and age budget of the downloads directory.
///
/// Only files registered through [`Janitor::record_new_file`] (or adopted at
/// startup) are ever deleted.
pub struct Janitor {
    downloads_dir: PathBuf,
    policy: RetentionPolicy,
    ledger: Mutex<Ledger>,
}

const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "temp", "tmp"];
const INTERMEDIATE_EXTENSIONS: &[&str] = &["webm", "m4a", "opus", "mp4"];

/// Whether `path` looks like something yt-dlp leaves behind when a
/// conversion is interrupted: a partial download, or an intermediate media
/// file named after a video id.
fn is_conversion_leftover(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.contains(".part-Frag") {
        return true;
    }
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    if PARTIAL_EXTENSIONS.contains(&ext.as_str()) {
        return true;
    }
    INTERMEDIATE_EXTENSIONS.contains(&ext.as_str())
        && !stem.is_empty()
        && stem.len() <= 64
        && stem
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Janitor {
    pub fn new(downloads_dir: PathBuf, policy: RetentionPolicy) -> Self {
        Self {
            downloads_dir,
            policy,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Registers MP3 files already present in the downloads directory and
    /// deletes leftovers of interrupted conversions, then enforces the policy.
    ///
    /// Returns how many files were adopted.
    pub async fn adopt_existing(&self) -> Result<usize> {
        fs::create_dir_all(&self.downloads_dir).await?;

        let mut entries = fs::read_dir(&self.downloads_dir).await?;
        let mut found: Vec<(DateTime<Utc>, PathBuf, u64)> = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };

            if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("mp3")) {
                let created_at = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                found.push((created_at, path, metadata.len()));
            } else if is_conversion_leftover(&path) {
                match fs::remove_file(&path).await {
                    Ok(()) => info!("🗑️ Removed leftover file: {}", path.display()),
                    Err(e) => warn!("Failed to remove leftover {}: {}", path.display(), e),
                }
            } else {
                debug!("Leaving unrelated file alone: {}", path.display());
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let adopted = found.len();
        {
            let mut ledger = self.ledger.lock().await;
            for (created_at, path, size) in found {
                ledger.insert(path, size, created_at);
            }
        }

        if adopted > 0 {
            info!("📂 Adopted {} existing downloads", adopted);
        }
        self.enforce().await;
        Ok(adopted)
    }

    /// Registers a completed download and enforces the policy immediately.
    pub async fn record_new_file(
        &self,
        path: PathBuf,
        size_bytes: u64,
        created_at: DateTime<Utc>,
    ) -> EnforceReport {
        debug!("📝 Tracking {} ({} bytes)", path.display(), size_bytes);
        self.ledger.lock().await.insert(path, size_bytes, created_at);
        self.enforce().await
    }

    pub async fn enforce(&self) -> EnforceReport {
        self.enforce_at(Utc::now()).await
    }

    /// Evicts oldest records until the total fits the budget and no record is
    /// older than the maximum age, as of `now`.
    pub async fn enforce_at(&self, now: DateTime<Utc>) -> EnforceReport {
        let max_age = self
            .policy
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok());

        let mut ledger = self.ledger.lock().await;
        let mut report = EnforceReport::default();
        let mut index = 0;

        while index < ledger.records.len() {
            let over_budget = self
                .policy
                .max_total_size
                .is_some_and(|max| ledger.total_bytes > max);
            let record = &ledger.records[index];
            let expired = max_age.is_some_and(|age| now.signed_duration_since(record.created_at) > age);

            // Records are oldest first, so nothing further along can be expired.
            if !over_budget && !expired {
                break;
            }

            match fs::remove_file(&record.path).await {
                Ok(()) => {
                    info!(
                        "🧹 Evicted {} ({} bytes, {})",
                        record.path.display(),
                        record.size_bytes,
                        if expired { "expired" } else { "over budget" }
                    );
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("Already gone: {}", record.path.display());
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", record.path.display(), e);
                    report.failed.push((record.path.clone(), e));
                    index += 1;
                    continue;
                }
            }

            let record = ledger.records.remove(index);
            ledger.total_bytes -= record.size_bytes;
            report.removed.push(record);
        }

        report.remaining_bytes = ledger.total_bytes;
        if !report.removed.is_empty() {
            info!(
                "🧹 Storage cleanup: removed {} files, freed {:.2} MB",
                report.removed.len(),
                report.freed_bytes() as f64 / 1024.0 / 1024.0
            );
        }
        report
    }

    /// The tracked record for `path`, if any.
    pub async fn tracked(&self, path: &Path) -> Option<FileRecord> {
        let ledger = self.ledger.lock().await;
        ledger.records.iter().find(|r| r.path == path).cloned()
    }

    /// Stops tracking `path` without touching the disk.
    pub async fn forget(&self, path: &Path) -> Option<FileRecord> {
        self.ledger.lock().await.forget(path)
    }

    /// Explicit cleanup of one tracked file: deletes it and stops tracking it.
    #[allow(dead_code)]
    pub async fn remove(&self, path: &Path) -> std::io::Result<Option<FileRecord>> {
        let mut ledger = self.ledger.lock().await;
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(ledger.forget(path))
    }

    /// Tracked paths, oldest first.
    #[allow(dead_code)]
    pub async fn records(&self) -> Vec<FileRecord> {
        self.ledger.lock().await.records.clone()
    }

    pub async fn stats(&self) -> StorageStats {
        let ledger = self.ledger.lock().await;
        StorageStats {
            tracked_files: ledger.records.len(),
            total_size_bytes: ledger.total_bytes,
            max_total_size: self.policy.max_total_size,
            downloads_dir: self.downloads_dir.clone(),
        }
    }
}

/// Storage statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    pub tracked_files: usize,
    pub total_size_bytes: u64,
    pub max_total_size: Option<u64>,
    pub downloads_dir: PathBuf,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Storage Stats:\n\
             📁 Downloads Directory: {}\n\
             🎵 Tracked Files: {}\n\
             📦 Total Size: {} bytes ({:.2} MB)\n\
             📏 Budget: {}",
            self.downloads_dir.display(),
            self.tracked_files,
            self.total_size_bytes,
            self.total_size_bytes as f64 / 1024.0 / 1024.0,
            self.max_total_size
                .map_or("unlimited".to_string(), |b| format!("{} bytes", b)),
        )
    }
}
