use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,

    // Paths
    pub downloads_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub static_dir: PathBuf,

    // Storage limits
    pub max_file_size: u64,
    pub max_total_size: Option<u64>,
    pub max_age: Option<Duration>,

    // Search cache
    pub search_cache_ttl: Duration,
    pub search_cache_capacity: usize,

    // Jobs and maintenance
    pub job_grace_period: Duration,
    pub cleanup_interval: Duration,

    // Audio
    pub audio_bitrate_kbps: u32,

    // Search
    pub default_search_limit: usize,
    pub max_search_limit: usize,

    // yt-dlp
    pub ytdlp_path: String,
    pub ytdlp_socket_timeout: Duration,
}

impl Config {
    /// Loads configuration from the process environment (and `.env`, if any),
    /// validates it and creates the working directories.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.downloads_dir)
            .with_context(|| format!("creating {}", config.downloads_dir.display()))?;
        std::fs::create_dir_all(&config.temp_dir)
            .with_context(|| format!("creating {}", config.temp_dir.display()))?;

        Ok(config)
    }

    /// Builds a configuration from an arbitrary variable source.
    ///
    /// Unset and blank variables fall back to defaults. The result is
    /// validated before returning.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: match var("PORT") {
                Some(val) => val.trim().parse().context("PORT")?,
                None => defaults.port,
            },

            downloads_dir: var("DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.downloads_dir),
            temp_dir: var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            static_dir: var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),

            max_file_size: match var("MAX_FILE_SIZE") {
                Some(val) => val.trim().parse().context("MAX_FILE_SIZE")?,
                None => defaults.max_file_size,
            },
            max_total_size: match var("MAX_TOTAL_SIZE") {
                Some(val) => Some(val.trim().parse().context("MAX_TOTAL_SIZE")?),
                None => defaults.max_total_size,
            },
            max_age: match var("MAX_AGE") {
                Some(val) => parse_optional_duration(&val).context("MAX_AGE")?,
                None => defaults.max_age,
            },

            search_cache_ttl: match var("SEARCH_CACHE_TTL") {
                Some(val) => parse_duration(&val).context("SEARCH_CACHE_TTL")?,
                None => defaults.search_cache_ttl,
            },
            search_cache_capacity: match var("SEARCH_CACHE_CAPACITY") {
                Some(val) => val.trim().parse().context("SEARCH_CACHE_CAPACITY")?,
                None => defaults.search_cache_capacity,
            },

            job_grace_period: match var("JOB_GRACE_PERIOD") {
                Some(val) => parse_duration(&val).context("JOB_GRACE_PERIOD")?,
                None => defaults.job_grace_period,
            },
            cleanup_interval: match var("CLEANUP_INTERVAL") {
                Some(val) => parse_duration(&val).context("CLEANUP_INTERVAL")?,
                None => defaults.cleanup_interval,
            },

            audio_bitrate_kbps: match var("AUDIO_BITRATE_KBPS") {
                Some(val) => val.trim().parse().context("AUDIO_BITRATE_KBPS")?,
                None => defaults.audio_bitrate_kbps,
            },

            default_search_limit: match var("DEFAULT_SEARCH_LIMIT") {
                Some(val) => val.trim().parse().context("DEFAULT_SEARCH_LIMIT")?,
                None => defaults.default_search_limit,
            },
            max_search_limit: match var("MAX_SEARCH_LIMIT") {
                Some(val) => val.trim().parse().context("MAX_SEARCH_LIMIT")?,
                None => defaults.max_search_limit,
            },

            ytdlp_path: var("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            ytdlp_socket_timeout: match var("YTDLP_SOCKET_TIMEOUT") {
                Some(val) => parse_duration(&val).context("YTDLP_SOCKET_TIMEOUT")?,
                None => defaults.ytdlp_socket_timeout,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - `MAX_FILE_SIZE` must be positive
    /// - `MAX_TOTAL_SIZE`, when set, must hold at least one file of
    ///   `MAX_FILE_SIZE` bytes
    /// - Bitrate must be a valid MP3 bitrate (32..=320 kbps)
    /// - Search limits must satisfy `1 <= default <= max`
    pub fn validate(&self) -> Result<()> {
        if self.max_file_size == 0 {
            anyhow::bail!("MAX_FILE_SIZE must be greater than 0");
        }

        if let Some(total) = self.max_total_size {
            if total < self.max_file_size {
                anyhow::bail!(
                    "MAX_TOTAL_SIZE ({}) must be at least MAX_FILE_SIZE ({})",
                    total,
                    self.max_file_size
                );
            }
        }

        if !(32..=320).contains(&self.audio_bitrate_kbps) {
            anyhow::bail!(
                "Audio bitrate must be between 32 and 320 kbps, got: {}",
                self.audio_bitrate_kbps
            );
        }

        if self.search_cache_capacity == 0 {
            anyhow::bail!("Search cache capacity must be greater than 0");
        }

        if self.default_search_limit == 0 || self.default_search_limit > self.max_search_limit {
            anyhow::bail!(
                "Search limits must satisfy 1 <= DEFAULT_SEARCH_LIMIT ({}) <= MAX_SEARCH_LIMIT ({})",
                self.default_search_limit,
                self.max_search_limit
            );
        }

        if self.cleanup_interval.is_zero() {
            anyhow::bail!("CLEANUP_INTERVAL must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Server: {}:{}\n  \
            Storage: {} (max file {:.1} MB, budget {}, max age {})\n  \
            Search cache: ttl {}, capacity {}\n  \
            Jobs: grace {}, cleanup every {}\n  \
            Audio: {}kbps via {}",
            self.host,
            self.port,
            self.downloads_dir.display(),
            self.max_file_size as f64 / 1024.0 / 1024.0,
            self.max_total_size
                .map_or("unlimited".to_string(), |b| format!("{:.1} MB", b as f64 / 1024.0 / 1024.0)),
            self.max_age
                .map_or("unlimited".to_string(), |d| humantime::format_duration(d).to_string()),
            humantime::format_duration(self.search_cache_ttl),
            self.search_cache_capacity,
            humantime::format_duration(self.job_grace_period),
            humantime::format_duration(self.cleanup_interval),
            self.audio_bitrate_kbps,
            self.ytdlp_path,
        )
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,

            downloads_dir: "./downloads".into(),
            temp_dir: "./temp".into(),
            static_dir: "./static".into(),

            max_file_size: 150 * 1024 * 1024,
            max_total_size: None,
            max_age: Some(Duration::from_secs(24 * 3600)),

            search_cache_ttl: Duration::from_secs(600),
            search_cache_capacity: 500,

            job_grace_period: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(3600),

            audio_bitrate_kbps: 192,

            default_search_limit: 10,
            max_search_limit: 50,

            ytdlp_path: "yt-dlp".to_string(),
            ytdlp_socket_timeout: Duration::from_secs(30),
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    // Bare numbers are seconds.
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    Ok(humantime::parse_duration(value)?)
}

/// `0`, `off` and `none` disable the limit.
fn parse_optional_duration(value: &str) -> Result<Option<Duration>> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" | "none" => Ok(None),
        other => {
            let duration = parse_duration(other)?;
            Ok((!duration.is_zero()).then_some(duration))
        }
    }
}
