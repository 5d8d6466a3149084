use std::path::PathBuf;
use thiserror::Error;

/// The search collaborator could not produce results.
///
/// Always treated as retryable; a failed search never populates the cache.
#[derive(Debug, Clone, Error)]
#[error("search failed: {reason}")]
pub struct SearchError {
    pub reason: String,
}

impl SearchError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors reported by the audio extraction collaborator.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// The identifier has no corresponding media.
    #[error("video not found: {0}")]
    NotFound(String),

    /// Transport-level failure talking to the media host.
    #[error("network error: {0}")]
    Network(String),

    /// Extraction or transcoding failed.
    #[error("conversion failed: {0}")]
    Conversion(String),
}

/// Terminal failure of a conversion job.
///
/// Cloned to every waiter attached to the job, so all of them observe the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobFailure {
    #[error("video not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("file too large ({:.2} MB, limit {:.2} MB)", mib(*.size_bytes), mib(*.limit_bytes))]
    TooLarge { size_bytes: u64, limit_bytes: u64 },
}

impl JobFailure {
    /// Whether a later attempt for the same identifier may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Conversion(_))
    }
}

impl From<ExtractError> for JobFailure {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::NotFound(msg) => Self::NotFound(msg),
            ExtractError::Network(msg) => Self::Network(msg),
            ExtractError::Conversion(msg) => Self::Conversion(msg),
        }
    }
}

/// Errors surfaced by [`crate::service::MusicFinder`] to the request layer.
#[derive(Debug, Error)]
pub enum FinderError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Job(#[from] JobFailure),

    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FinderError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidRequest(_) => false,
            Self::Search(_) => true,
            Self::Job(failure) => failure.is_retryable(),
            Self::Storage { .. } => true,
        }
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}
