use std::path::PathBuf;
use std::time::Instant;

use thiserror::Error;

/// Failure of a single network fetch against the asset origin.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl FetchError {
    /// Status code of the response, when the origin answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors surfaced by the asset cache.
///
/// Cloneable so a single fetch outcome can be handed to every caller
/// waiting on the same key.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("network error for {key}: {source}")]
    Network {
        key: String,
        #[source]
        source: FetchError,
    },

    #[error(
        "retry for {key} not eligible for another {}ms",
        .eligible_at.saturating_duration_since(Instant::now()).as_millis()
    )]
    RetryNotEligible { key: String, eligible_at: Instant },

    #[error("retries exhausted for {key} after {attempts} attempts")]
    RetryExhausted { key: String, attempts: u32 },

    #[error("handle for {key} has already been released")]
    HandleReleased { key: String },

    #[error("cache was cleared while {key} was loading")]
    Invalidated { key: String },

    #[error("fetch task for {key} failed: {reason}")]
    TaskFailed { key: String, reason: String },
}

impl CacheError {
    /// Key the error relates to.
    pub fn key(&self) -> &str {
        match self {
            CacheError::Network { key, .. }
            | CacheError::RetryNotEligible { key, .. }
            | CacheError::RetryExhausted { key, .. }
            | CacheError::HandleReleased { key }
            | CacheError::Invalidated { key }
            | CacheError::TaskFailed { key, .. } => key,
        }
    }

    /// Whether waiting (without an explicit reset) can make a later attempt
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Network { .. }
                | CacheError::RetryNotEligible { .. }
                | CacheError::Invalidated { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised while loading or validating [`crate::config::CacheConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid asset origin '{origin}'")]
    InvalidOrigin {
        origin: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to build HTTP client")]
    HttpClient(#[source] FetchError),

    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}
