//! Periodic cache maintenance.
//!
//! The monitor never touches store internals; every removal goes through
//! [`AssetCache::remove`] or [`AssetCache::clear`], so handles are released
//! the same way eviction releases them.

use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::memory::PressureLevel;
use crate::store::{AssetCache, EntryInfo};

/// Number of entries listed in each half of a [`CacheAnalysis`].
const REPORT_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sweep interval used when the monitor is started from config.
    pub interval_ms: u64,
    /// Pressure above which the sweep removes `aggressive_fraction` of the
    /// entries.
    pub aggressive_threshold: f64,
    pub aggressive_fraction: f64,
    pub normal_threshold: f64,
    pub normal_fraction: f64,
    /// Share of least-used entries that [`CacheMonitor::optimize`] inspects.
    pub optimize_fraction: f64,
    /// Entries at or below this access count are dropped by `optimize`.
    pub optimize_max_access: u64,
    pub pressure_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            aggressive_threshold: 0.85,
            aggressive_fraction: 0.5,
            normal_threshold: 0.7,
            normal_fraction: 0.2,
            optimize_fraction: 0.3,
            optimize_max_access: 1,
            pressure_threshold: 0.7,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// What a single sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// No pressure signal, or pressure below the cleanup thresholds.
    Idle,
    Normal { removed: usize },
    Aggressive { removed: usize },
}

impl SweepOutcome {
    pub fn removed(&self) -> usize {
        match self {
            SweepOutcome::Idle => 0,
            SweepOutcome::Normal { removed } | SweepOutcome::Aggressive { removed } => *removed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheAnalysis {
    pub total_count: usize,
    pub memory_usage_mib: f64,
    pub most_used: Vec<EntryInfo>,
    pub least_used: Vec<EntryInfo>,
    pub pressure: PressureLevel,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Drives periodic sweeps over an [`AssetCache`] and exposes on-demand
/// maintenance.
pub struct CacheMonitor {
    cache: AssetCache,
    config: MonitorConfig,
    task: Mutex<Option<MonitorTask>>,
}

impl std::fmt::Debug for CacheMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl CacheMonitor {
    pub fn new(cache: AssetCache, config: MonitorConfig) -> Self {
        Self {
            cache,
            config,
            task: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start sweeping every `interval`, replacing any running schedule.
    /// The first sweep happens one interval from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_monitoring(&self, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();

        let handle = {
            let cache = self.cache.clone();
            let config = self.config.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            log::debug!("Cache monitor shutting down");
                            break;
                        }
                        _ = ticker.tick() => {
                            log_stats(&cache);
                            sweep(&cache, &config);
                        }
                    }
                }
            })
        };

        let previous = self.task.lock().replace(MonitorTask { cancel, handle });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            log::debug!("Replaced running cache monitor");
        }
        log::info!("Cache monitor started, sweeping every {:?}", interval);
    }

    /// Stop the periodic sweep. Returns whether one was running.
    pub fn stop_monitoring(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                task.cancel.cancel();
                log::info!("Cache monitor stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Run one pressure check now.
    pub fn sweep(&self) -> SweepOutcome {
        sweep(&self.cache, &self.config)
    }

    pub fn log_stats(&self) {
        log_stats(&self.cache);
    }

    pub fn clear_cache(&self) -> usize {
        let released = self.cache.clear();
        log::info!("Cache cleared manually");
        released
    }

    /// Remove every entry whose key matches `pattern`.
    pub fn remove_by_pattern(&self, pattern: &Regex) -> usize {
        let removed = self
            .cache
            .keys()
            .iter()
            .filter(|key| pattern.is_match(key))
            .filter(|key| self.cache.remove(key))
            .count();
        log::info!(
            "Removed {} assets matching pattern: {}",
            removed,
            pattern.as_str()
        );
        removed
    }

    /// Remove entries not accessed within `max_age`.
    pub fn remove_older_than(&self, max_age: Duration) -> usize {
        let removed = self
            .cache
            .entries()
            .iter()
            .filter(|entry| entry.idle > max_age)
            .filter(|entry| self.cache.remove(&entry.key))
            .count();
        log::info!("Removed {} assets idle longer than {:?}", removed, max_age);
        removed
    }

    /// Drop rarely used entries from the least-used share of the cache.
    pub fn optimize(&self) -> usize {
        let inspect = fraction_of(self.cache.len(), self.config.optimize_fraction);
        let removed = self
            .cache
            .least_used(inspect)
            .iter()
            .filter(|entry| entry.access_count <= self.config.optimize_max_access)
            .filter(|entry| self.cache.remove(&entry.key))
            .count();
        log::info!("Cache optimization: removed {} low-use assets", removed);
        removed
    }

    pub fn analysis(&self) -> CacheAnalysis {
        let stats = self.cache.stats();
        CacheAnalysis {
            total_count: stats.count,
            memory_usage_mib: stats.total_bytes.as_mib_rounded(),
            most_used: self.cache.most_used(REPORT_SIZE),
            least_used: self.cache.least_used(REPORT_SIZE),
            pressure: PressureLevel::from_ratio(stats.memory_pressure),
        }
    }

    pub fn is_under_memory_pressure(&self) -> bool {
        self.cache
            .memory_pressure()
            .is_some_and(|ratio| ratio > self.config.pressure_threshold)
    }

    /// Run [`optimize`](Self::optimize) if memory is under pressure.
    /// Returns whether it ran.
    pub fn force_cleanup(&self) -> bool {
        if !self.is_under_memory_pressure() {
            return false;
        }
        log::warn!("Memory pressure detected, forcing cache cleanup");
        self.optimize();
        true
    }
}

impl Drop for CacheMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

fn fraction_of(count: usize, fraction: f64) -> usize {
    (count as f64 * fraction).floor() as usize
}

fn log_stats(cache: &AssetCache) {
    let stats = cache.stats();
    log::info!(
        "Asset cache stats: {} assets, {} MB, avg access {}, loading {}, errors {}, limit {}",
        stats.count,
        stats.total_bytes.as_mib_rounded(),
        stats.avg_access_count,
        stats.loading_count,
        stats.error_count,
        stats.limits.max_entries
    );
}

fn remove_least_used(cache: &AssetCache, fraction: f64) -> usize {
    let count = fraction_of(cache.len(), fraction);
    cache
        .least_used(count)
        .iter()
        .filter(|entry| cache.remove(&entry.key))
        .count()
}

fn sweep(cache: &AssetCache, config: &MonitorConfig) -> SweepOutcome {
    let Some(ratio) = cache.memory_pressure() else {
        return SweepOutcome::Idle;
    };

    if ratio > config.aggressive_threshold {
        log::warn!("High memory pressure ({:.2}), running aggressive cleanup", ratio);
        let removed = remove_least_used(cache, config.aggressive_fraction);
        log::info!("Aggressive cleanup: removed {} assets", removed);
        SweepOutcome::Aggressive { removed }
    } else if ratio > config.normal_threshold {
        log::warn!("Moderate memory pressure ({:.2}), running cleanup", ratio);
        let removed = remove_least_used(cache, config.normal_fraction);
        log::info!("Normal cleanup: removed {} assets", removed);
        SweepOutcome::Normal { removed }
    } else {
        SweepOutcome::Idle
    }
}
