//! Cache configuration.
//!
//! Precedence, lowest first: built-in defaults, a TOML file, then
//! `BLOBCACHE_*` environment variables (optionally seeded from a `.env`
//! file).

use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::eviction::EvictionConfig;
use crate::monitor::MonitorConfig;
use crate::priority::{PriorityConfig, Variant};
use crate::retry::RetryPolicy;

pub const DEFAULT_ORIGIN: &str = "https://imagedelivery.net/DsjSNgDb-WbLxvpVXBuSVg";

pub const ENV_ORIGIN: &str = "BLOBCACHE_ORIGIN";
pub const ENV_DEFAULT_VARIANT: &str = "BLOBCACHE_DEFAULT_VARIANT";
pub const ENV_MONITOR_INTERVAL_MS: &str = "BLOBCACHE_MONITOR_INTERVAL_MS";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "BLOBCACHE_RETRY_MAX_ATTEMPTS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "BLOBCACHE_REQUEST_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Asset-delivery origin; assets live at `{origin}/{key}/{variant}`.
    pub origin: String,
    pub default_variant: String,
    /// Transport timeout for a single HTTP request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Buffer size of the change-event channel.
    pub events_capacity: usize,
    pub retry: RetryPolicy,
    pub priority: PriorityConfig,
    pub eviction: EvictionConfig,
    pub monitor: MonitorConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            default_variant: Variant::DEFAULT.to_string(),
            request_timeout_ms: Some(30_000),
            events_capacity: 256,
            retry: RetryPolicy::default(),
            priority: PriorityConfig::default(),
            eviction: EvictionConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Load the effective configuration and validate it.
    pub fn load(
        path: Option<&Path>,
        env_file: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        if let Some(env_file) = env_file {
            dotenvy::from_path(env_file)?;
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Self::parse(contents, Path::new("<inline>"))
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from(path),
            source,
        })
    }

    /// Overlay `BLOBCACHE_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(origin) = lookup(ENV_ORIGIN) {
            self.origin = origin;
        }
        if let Some(variant) = lookup(ENV_DEFAULT_VARIANT) {
            self.default_variant = variant;
        }
        if let Some(value) = lookup(ENV_MONITOR_INTERVAL_MS) {
            self.monitor.interval_ms = parse_number(ENV_MONITOR_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_RETRY_MAX_ATTEMPTS) {
            self.retry.max_attempts = parse_number(ENV_RETRY_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            let timeout: u64 = parse_number(ENV_REQUEST_TIMEOUT_MS, &value)?;
            self.request_timeout_ms = (timeout > 0).then_some(timeout);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let origin = self.origin_url()?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(invalid(
                "origin",
                format!("unsupported scheme '{}'", origin.scheme()),
            ));
        }
        if self.default_variant.trim().is_empty() {
            return Err(invalid("default_variant", "must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.events_capacity == 0 {
            return Err(invalid("events_capacity", "must be at least 1"));
        }

        let capacity = &self.eviction.capacity;
        let all_limits = capacity
            .tiers
            .iter()
            .map(|tier| tier.limits)
            .chain([capacity.baseline, capacity.no_signal]);
        for limits in all_limits {
            if limits.max_entries == 0 || limits.cleanup_batch == 0 {
                return Err(invalid(
                    "eviction.capacity",
                    "max_entries and cleanup_batch must be at least 1",
                ));
            }
        }
        for tier in &capacity.tiers {
            check_ratio("eviction.capacity.tiers.above", tier.above)?;
        }

        let monitor = &self.monitor;
        if monitor.interval_ms == 0 {
            return Err(invalid("monitor.interval_ms", "must be at least 1"));
        }
        check_ratio("monitor.aggressive_threshold", monitor.aggressive_threshold)?;
        check_ratio("monitor.normal_threshold", monitor.normal_threshold)?;
        check_ratio("monitor.aggressive_fraction", monitor.aggressive_fraction)?;
        check_ratio("monitor.normal_fraction", monitor.normal_fraction)?;
        check_ratio("monitor.optimize_fraction", monitor.optimize_fraction)?;
        check_ratio("monitor.pressure_threshold", monitor.pressure_threshold)?;
        Ok(())
    }

    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(self.origin.trim()).map_err(|source| ConfigError::InvalidOrigin {
            origin: self.origin.clone(),
            source,
        })
    }

    pub fn default_variant(&self) -> Variant {
        Variant::new(self.default_variant.trim())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

fn check_ratio(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is outside 0..=1")))
    }
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    value: &str,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| invalid(field, format!("'{value}': {e}")))
}
