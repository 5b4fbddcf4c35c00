//! The bounded asset store.
//!
//! All map mutations happen under one `parking_lot` mutex that is never held
//! across an `.await`. A fetch for a key runs as a spawned task whose result
//! is shared with every caller that asks for the same key while it is in
//! flight, so a key has at most one network request outstanding and callers
//! that give up waiting do not cancel it.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared, join_all};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::CacheConfig;
use crate::error::{CacheError, ConfigError, Result};
use crate::events::CacheEvent;
use crate::eviction::{Candidate, CapacityLimits, EvictionConfig, select_victims};
use crate::fetcher::{AssetFetcher, HttpAssetFetcher};
use crate::handle::AssetHandle;
use crate::memory::MemoryPressureProvider;
use crate::priority::{PriorityModel, Variant};
use crate::retry::{RetryController, RetryPhase};
use crate::units::ByteSize;

type SharedFetch = Shared<BoxFuture<'static, Result<AssetHandle>>>;

#[derive(Debug)]
struct CacheEntry {
    handle: AssetHandle,
    variant: Variant,
    inserted_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    size: ByteSize,
    priority: u32,
    seq: u64,
}

impl CacheEntry {
    fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count = self.access_count.saturating_add(1);
    }

    fn info(&self, key: &str, now: Instant) -> EntryInfo {
        EntryInfo {
            key: key.to_string(),
            variant: self.variant.clone(),
            access_count: self.access_count,
            size: self.size,
            priority: self.priority,
            idle: now.saturating_duration_since(self.last_accessed),
            age: now.saturating_duration_since(self.inserted_at),
        }
    }
}

struct PendingFetch {
    id: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingFetch>,
    errors: HashMap<String, String>,
    next_seq: u64,
}

impl StoreState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Release the entry's handle, then drop it from the map.
    fn remove_entry(&mut self, key: &str) -> Option<ByteSize> {
        let entry = self.entries.get(key)?;
        if let Err(err) = entry.handle.release() {
            log::error!("Releasing evicted asset failed: {}", err);
        }
        self.entries.remove(key).map(|entry| entry.size)
    }
}

/// Metadata snapshot of one cached entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub variant: Variant,
    pub access_count: u64,
    pub size: ByteSize,
    pub priority: u32,
    /// Time since the last tracked access.
    pub idle: Duration,
    /// Time since the entry was inserted.
    pub age: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub total_bytes: ByteSize,
    pub avg_access_count: f64,
    pub loading_count: usize,
    pub error_count: usize,
    pub retry_tracked: usize,
    pub limits: CapacityLimits,
    pub memory_pressure: Option<f64>,
}

/// Outcome of [`AssetCache::preload`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreloadReport {
    pub requested: usize,
    pub loaded: usize,
    pub failed: usize,
}

struct Inner {
    state: Mutex<StoreState>,
    retry: RetryController,
    priority: PriorityModel,
    eviction: EvictionConfig,
    default_variant: Variant,
    fetcher: Arc<dyn AssetFetcher>,
    pressure: Arc<dyn MemoryPressureProvider>,
    events: broadcast::Sender<CacheEvent>,
}

/// Bounded, priority-aware cache of fetched assets.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AssetCache")
            .field("entries", &state.entries.len())
            .field("pending", &state.pending.len())
            .field("errors", &state.errors.len())
            .field("pressure", &self.inner.pressure)
            .finish_non_exhaustive()
    }
}

impl AssetCache {
    pub fn new(
        config: &CacheConfig,
        fetcher: Arc<dyn AssetFetcher>,
        pressure: Arc<dyn MemoryPressureProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.events_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState::default()),
                retry: RetryController::new(config.retry.clone()),
                priority: PriorityModel::new(config.priority.clone()),
                eviction: config.eviction.clone(),
                default_variant: config.default_variant(),
                fetcher,
                pressure,
                events,
            }),
        }
    }

    /// Build a cache that fetches from the configured HTTP origin.
    pub fn from_config(
        config: &CacheConfig,
        pressure: Arc<dyn MemoryPressureProvider>,
    ) -> std::result::Result<Self, ConfigError> {
        let fetcher = HttpAssetFetcher::new(config.origin_url()?, config.request_timeout())
            .map_err(ConfigError::HttpClient)?;
        Ok(Self::new(config, Arc::new(fetcher), pressure))
    }

    pub fn default_variant(&self) -> &Variant {
        &self.inner.default_variant
    }

    /// Untracked read, safe to call from derived or render-only contexts.
    pub fn get(&self, key: &str) -> Option<AssetHandle> {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.handle.clone())
    }

    /// Read that counts as a use for eviction scoring.
    pub fn get_tracked(&self, key: &str) -> Option<AssetHandle> {
        let mut state = self.inner.state.lock();
        let entry = state.entries.get_mut(key)?;
        entry.touch(Instant::now());
        Some(entry.handle.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }

    pub fn is_loading(&self, key: &str) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }

    /// Message of the last failed fetch for `key`, until it next succeeds or
    /// is removed.
    pub fn error(&self, key: &str) -> Option<String> {
        self.inner.state.lock().errors.get(key).cloned()
    }

    pub fn retry_phase(&self, key: &str) -> RetryPhase {
        self.inner.retry.phase(key)
    }

    pub fn is_retry_eligible(&self, key: &str) -> bool {
        self.inner.retry.is_eligible(key, Instant::now())
    }

    /// User-initiated retry: clears backoff and exhaustion for `key`.
    pub fn reset_retry(&self, key: &str) -> bool {
        let mut state = self.inner.state.lock();
        state.errors.remove(key);
        self.inner.retry.reset(key)
    }

    /// Fetch with the configured default variant.
    pub async fn fetch(&self, key: &str) -> Result<AssetHandle> {
        let variant = self.inner.default_variant.clone();
        self.fetch_or_load(key, &variant).await
    }

    /// Return the cached handle for `key`, joining or starting a fetch on a
    /// miss.
    pub async fn fetch_or_load(
        &self,
        key: &str,
        variant: &Variant,
    ) -> Result<AssetHandle> {
        let (fetch, started) = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();

            if let Some(entry) = state.entries.get_mut(key) {
                entry.touch(now);
                return Ok(entry.handle.clone());
            }

            match state.pending.get(key) {
                Some(pending) => (pending.fetch.clone(), false),
                None => {
                    self.inner.retry.check(key, now)?;
                    (self.start_fetch(&mut state, key, variant), true)
                }
            }
        };

        if started {
            return fetch.await;
        }

        let handle = fetch.await?;
        // State may have moved on while we waited; only count the access if
        // the entry we were handed is still the live one.
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.get_mut(key)
            && entry.handle.same_as(&handle)
        {
            entry.touch(Instant::now());
        }
        Ok(handle)
    }

    fn start_fetch(
        &self,
        state: &mut StoreState,
        key: &str,
        variant: &Variant,
    ) -> SharedFetch {
        let id = state.next_seq();
        let task = {
            let cache = self.clone();
            let key = key.to_string();
            let variant = variant.clone();
            tokio::spawn(async move {
                let _pending = PendingGuard {
                    inner: cache.inner.clone(),
                    key: key.clone(),
                    id,
                };
                cache.load(key, variant, id).await
            })
        };

        let task_key = key.to_string();
        let fetch = async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    log::error!("Fetch task for {} failed: {}", task_key, join_error);
                    Err(CacheError::TaskFailed {
                        key: task_key,
                        reason: join_error.to_string(),
                    })
                }
            }
        }
        .boxed()
        .shared();

        state.errors.remove(key);
        state.pending.insert(
            key.to_string(),
            PendingFetch {
                id,
                fetch: fetch.clone(),
            },
        );
        log::debug!("Started fetch for {} ({})", key, variant);
        self.emit(CacheEvent::Loading {
            key: key.to_string(),
        });
        fetch
    }

    async fn load(&self, key: String, variant: Variant, id: u64) -> Result<AssetHandle> {
        let outcome = self.inner.fetcher.fetch(&key, &variant).await;
        let now = Instant::now();

        let mut state = self.inner.state.lock();
        let still_pending = state
            .pending
            .get(&key)
            .is_some_and(|pending| pending.id == id);
        if !still_pending {
            drop(state);
            log::debug!("Discarding fetch result for {}: cache was cleared", key);
            return Err(CacheError::Invalidated { key });
        }
        state.pending.remove(&key);

        match outcome {
            Ok(asset) => {
                let priority = self.inner.priority.score(&key, &variant);
                let evicted = self.make_room(&mut state, now);

                let handle = AssetHandle::new(key.clone(), asset.payload);
                let seq = state.next_seq();
                let entry = CacheEntry {
                    handle: handle.clone(),
                    variant,
                    inserted_at: now,
                    last_accessed: now,
                    access_count: 1,
                    size: handle.size(),
                    priority,
                    seq,
                };
                if state.entries.contains_key(&key) {
                    state.remove_entry(&key);
                }
                state.entries.insert(key.clone(), entry);
                state.errors.remove(&key);
                self.inner.retry.record_success(&key);
                drop(state);

                log::debug!(
                    "Cached {} ({}, priority {})",
                    key,
                    handle.size(),
                    priority
                );
                for evicted_key in evicted {
                    self.emit(CacheEvent::Evicted { key: evicted_key });
                }
                self.emit(CacheEvent::Loaded { key });
                Ok(handle)
            }
            Err(source) => {
                let message = source.to_string();
                state.errors.insert(key.clone(), message.clone());
                self.inner.retry.record_failure(&key, now);
                drop(state);

                log::warn!("Failed to fetch asset {}: {}", key, message);
                self.emit(CacheEvent::Failed {
                    key: key.clone(),
                    error: message,
                });
                Err(CacheError::Network { key, source })
            }
        }
    }

    /// Evict enough low-scoring entries that one more insert stays within
    /// the current capacity.
    fn make_room(&self, state: &mut StoreState, now: Instant) -> Vec<String> {
        let limits = self.limits();
        let count = state.entries.len();
        if count < limits.max_entries {
            return Vec::new();
        }

        let overflow = count + 1 - limits.max_entries;
        let batch = limits.cleanup_batch.max(overflow);
        let candidates = state
            .entries
            .iter()
            .map(|(key, entry)| Candidate {
                key,
                access_count: entry.access_count,
                priority: entry.priority,
                idle: now.saturating_duration_since(entry.last_accessed),
                seq: entry.seq,
            })
            .collect();
        let victims = select_victims(candidates, &self.inner.eviction.weights, batch);

        for key in &victims {
            state.remove_entry(key);
            state.errors.remove(key);
        }
        log::info!(
            "Cleaned up {} assets. Remaining: {} (limit {})",
            victims.len(),
            state.entries.len(),
            limits.max_entries
        );
        victims
    }

    /// Release and drop `key`, along with its retry and error state.
    /// Returns whether an entry was removed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.remove_entry(key).is_some();
            state.errors.remove(key);
            self.inner.retry.reset(key);
            removed
        };
        if removed {
            self.emit(CacheEvent::Removed {
                key: key.to_string(),
            });
        }
        removed
    }

    /// Release every handle and forget all state, including in-flight
    /// fetches, whose results will be discarded.
    pub fn clear(&self) -> usize {
        let released = {
            let mut state = self.inner.state.lock();
            let keys: Vec<String> = state.entries.keys().cloned().collect();
            let released = keys
                .iter()
                .filter(|key| state.remove_entry(key).is_some())
                .count();
            state.entries.clear();
            state.pending.clear();
            state.errors.clear();
            self.inner.retry.clear();
            released
        };
        log::info!("Asset cache cleared, released {} handles", released);
        self.emit(CacheEvent::Cleared { released });
        released
    }

    /// Current capacity limits for the observed memory pressure.
    pub fn limits(&self) -> CapacityLimits {
        self.inner
            .eviction
            .capacity
            .limits_for(self.inner.pressure.ratio())
    }

    pub fn memory_pressure(&self) -> Option<f64> {
        self.inner.pressure.ratio()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> ByteSize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .map(|entry| entry.size)
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        let pressure = self.inner.pressure.ratio();
        let limits = self.inner.eviction.capacity.limits_for(pressure);
        let state = self.inner.state.lock();

        let count = state.entries.len();
        let total_bytes: ByteSize = state.entries.values().map(|entry| entry.size).sum();
        let avg_access_count = if count == 0 {
            0.0
        } else {
            let total: u64 = state.entries.values().map(|e| e.access_count).sum();
            (total as f64 / count as f64 * 100.0).round() / 100.0
        };

        CacheStats {
            count,
            total_bytes,
            avg_access_count,
            loading_count: state.pending.len(),
            error_count: state.errors.len(),
            retry_tracked: self.inner.retry.len(),
            limits,
            memory_pressure: pressure,
        }
    }

    /// Snapshot of every entry, in insertion order.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let mut entries: Vec<(u64, EntryInfo)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.seq, entry.info(key, now)))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|info| info.key).collect()
    }

    /// Up to `n` entries with the lowest access counts.
    pub fn least_used(&self, n: usize) -> Vec<EntryInfo> {
        let mut entries = self.entries();
        entries.sort_by_key(|info| info.access_count);
        entries.truncate(n);
        entries
    }

    /// Up to `n` entries with the highest access counts.
    pub fn most_used(&self, n: usize) -> Vec<EntryInfo> {
        let mut entries = self.entries();
        entries.sort_by_key(|info| Reverse(info.access_count));
        entries.truncate(n);
        entries
    }

    /// Fetch `keys` in the background, highest priority first. Keys already
    /// cached or loading are skipped; failures are logged and counted.
    pub async fn preload<K: AsRef<str>>(
        &self,
        keys: &[K],
        variant: &Variant,
    ) -> PreloadReport {
        let mut seen = HashSet::new();
        let mut targets: Vec<&str> = keys
            .iter()
            .map(AsRef::as_ref)
            .filter(|key| !key.is_empty() && seen.insert(*key))
            .filter(|key| !self.has(key) && !self.is_loading(key))
            .collect();
        targets.sort_by_key(|key| Reverse(self.inner.priority.score(key, variant)));

        let results = join_all(
            targets
                .iter()
                .map(|key| self.fetch_or_load(key, variant)),
        )
        .await;

        let mut report = PreloadReport {
            requested: targets.len(),
            ..PreloadReport::default()
        };
        for (key, result) in targets.iter().zip(results) {
            match result {
                Ok(_) => report.loaded += 1,
                Err(err) => {
                    report.failed += 1;
                    log::warn!("Failed to preload asset {}: {}", key, err);
                }
            }
        }
        report
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers is the common case.
        let _ = self.inner.events.send(event);
    }
}

/// Clears the pending marker if the fetch task ends without doing so itself
/// (e.g. it panicked).
struct PendingGuard {
    inner: Arc<Inner>,
    key: String,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if state
            .pending
            .get(&self.key)
            .is_some_and(|pending| pending.id == self.id)
        {
            state.pending.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::FetchError;
    use crate::eviction::CapacityPolicy;
    use crate::fetcher::{FetchedAsset, MockAssetFetcher};
    use crate::memory::{ManualPressure, NoPressureSignal};
    use crate::retry::RetryPolicy;

    /// Counts calls and serves a fixed payload.
    #[derive(Debug, Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AssetFetcher for CountingFetcher {
        async fn fetch(
            &self,
            key: &str,
            _variant: &Variant,
        ) -> std::result::Result<FetchedAsset, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedAsset::new(key.as_bytes().to_vec()))
        }
    }

    /// Blocks every fetch until the test opens the gate.
    #[derive(Debug, Default)]
    struct GatedFetcher {
        calls: AtomicUsize,
        started: Notify,
        gate: Notify,
        fail: bool,
    }

    #[async_trait]
    impl AssetFetcher for GatedFetcher {
        async fn fetch(
            &self,
            key: &str,
            _variant: &Variant,
        ) -> std::result::Result<FetchedAsset, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.gate.notified().await;
            if self.fail {
                Err(FetchError::Status {
                    status: 503,
                    url: format!("https://assets.test/{key}"),
                })
            } else {
                Ok(FetchedAsset::new(vec![7; 16]))
            }
        }
    }

    fn config_with(capacity: CapacityPolicy) -> CacheConfig {
        let mut config = CacheConfig::default();
        config.eviction.capacity = capacity;
        config
    }

    fn instant_retry_config() -> CacheConfig {
        let mut config = CacheConfig::default();
        config.retry = RetryPolicy {
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ms: 0,
            max_attempts: 3,
        };
        config
    }

    fn cache_with(config: &CacheConfig, fetcher: Arc<dyn AssetFetcher>) -> AssetCache {
        AssetCache::new(config, fetcher, Arc::new(NoPressureSignal))
    }

    fn backdate(cache: &AssetCache, key: &str, access_count: u64, idle: Duration) {
        let mut state = cache.inner.state.lock();
        let entry = state.entries.get_mut(key).unwrap();
        entry.access_count = access_count;
        entry.last_accessed = Instant::now()
            .checked_sub(idle)
            .unwrap_or(entry.last_accessed);
    }

    #[tokio::test]
    async fn hit_returns_same_handle_without_refetch() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = cache_with(&CacheConfig::default(), fetcher.clone());

        let first = cache.fetch("poster-1").await.unwrap();
        let second = cache.fetch("poster-1").await.unwrap();

        assert!(first.same_as(&second));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(&*first.bytes().unwrap(), b"poster-1");
        assert_eq!(cache.most_used(1)[0].access_count, 2);
    }

    #[tokio::test]
    async fn untracked_reads_leave_stats_alone() {
        let cache = cache_with(
            &CacheConfig::default(),
            Arc::new(CountingFetcher::default()),
        );
        cache.fetch("a").await.unwrap();

        assert!(cache.get("a").is_some());
        assert!(cache.has("a"));
        assert_eq!(cache.entries()[0].access_count, 1);

        assert!(cache.get_tracked("a").is_some());
        assert_eq!(cache.entries()[0].access_count, 2);

        assert!(cache.get("missing").is_none());
        assert!(cache.get_tracked("missing").is_none());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let fetcher = Arc::new(GatedFetcher::default());
        let cache = cache_with(&CacheConfig::default(), fetcher.clone());

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.fetch_or_load("hero", &Variant::default()).await
                })
            })
            .collect();

        fetcher.started.notified().await;
        assert!(cache.is_loading("hero"));
        fetcher.gate.notify_one();

        let handles: Vec<AssetHandle> = join_all(callers)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| h.same_as(&handles[0])));
        assert!(!cache.is_loading("hero"));
        assert_eq!(cache.entries()[0].access_count, 8);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let fetcher = Arc::new(GatedFetcher {
            fail: true,
            ..GatedFetcher::default()
        });
        let cache = cache_with(&CacheConfig::default(), fetcher.clone());

        let callers: Vec<_> = (0..5)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.fetch_or_load("broken", &Variant::default()).await
                })
            })
            .collect();

        fetcher.started.notified().await;
        tokio::task::yield_now().await;
        fetcher.gate.notify_one();

        for joined in join_all(callers).await {
            match joined.unwrap() {
                Err(CacheError::Network { key, source }) => {
                    assert_eq!(key, "broken");
                    assert_eq!(source.status(), Some(503));
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!cache.has("broken"));
        assert!(cache.error("broken").unwrap().contains("503"));
        assert!(matches!(
            cache.retry_phase("broken"),
            RetryPhase::Backoff { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn exhausted_key_makes_no_network_call() {
        let mut fetcher = MockAssetFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|key, _| key == "img1")
            .times(3)
            .returning(|key, _| {
                Err(FetchError::Status {
                    status: 500,
                    url: format!("https://assets.test/{key}/public"),
                })
            });
        let cache = cache_with(&instant_retry_config(), Arc::new(fetcher));

        for _ in 0..3 {
            assert!(matches!(
                cache.fetch("img1").await,
                Err(CacheError::Network { .. })
            ));
        }

        assert!(matches!(
            cache.fetch("img1").await,
            Err(CacheError::RetryExhausted { attempts: 3, .. })
        ));
        assert_eq!(cache.retry_phase("img1"), RetryPhase::Exhausted { attempts: 3 });
    }

    #[tokio::test]
    async fn backoff_window_blocks_immediate_retry() {
        let mut fetcher = MockAssetFetcher::new();
        fetcher.expect_fetch().times(1).returning(|_, _| {
            Err(FetchError::Transport {
                url: "https://assets.test/a/public".to_string(),
                message: "connection reset".to_string(),
            })
        });
        let cache = cache_with(&CacheConfig::default(), Arc::new(fetcher));

        assert!(cache.fetch("a").await.is_err());
        assert!(matches!(
            cache.fetch("a").await,
            Err(CacheError::RetryNotEligible { .. })
        ));
        assert!(!cache.is_retry_eligible("a"));
    }

    #[tokio::test]
    async fn reset_retry_allows_immediate_attempt() {
        let mut fetcher = MockAssetFetcher::new();
        let mut seq = mockall::Sequence::new();
        fetcher
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(FetchError::Client("offline".to_string())));
        fetcher
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(FetchedAsset::new(vec![1, 2, 3])));
        let cache = cache_with(&CacheConfig::default(), Arc::new(fetcher));

        assert!(cache.fetch("a").await.is_err());
        assert!(cache.error("a").is_some());
        assert!(cache.reset_retry("a"));
        assert!(cache.error("a").is_none());

        let handle = cache.fetch("a").await.unwrap();
        assert_eq!(handle.size(), ByteSize::from_bytes(3));
        assert_eq!(cache.retry_phase("a"), RetryPhase::Fresh);
    }

    #[tokio::test]
    async fn capacity_never_exceeds_current_limit() {
        let pressure = Arc::new(ManualPressure::with_ratio(0.9));
        let cache = AssetCache::new(
            &CacheConfig::default(),
            Arc::new(CountingFetcher::default()),
            pressure.clone(),
        );

        for i in 0..120 {
            cache.fetch(&format!("asset-{i}")).await.unwrap();
            assert!(cache.len() <= cache.limits().max_entries);
        }
        assert_eq!(cache.limits(), CapacityLimits::new(50, 20));

        // Pressure drops, then spikes again with more entries than the
        // tightest tier allows.
        pressure.set_ratio(0.1);
        for i in 120..250 {
            cache.fetch(&format!("asset-{i}")).await.unwrap();
        }
        assert!(cache.len() > 50);
        pressure.set_ratio(0.95);
        cache.fetch("one-more").await.unwrap();
        assert!(cache.len() <= 50);
    }

    #[tokio::test]
    async fn eviction_keeps_the_valuable_entry() {
        let config = config_with(CapacityPolicy {
            tiers: Vec::new(),
            baseline: CapacityLimits::new(2, 1),
            no_signal: CapacityLimits::new(2, 1),
        });
        let cache = cache_with(&config, Arc::new(CountingFetcher::default()));

        let a = cache.fetch_or_load("a", &Variant::from("thumbnail")).await.unwrap();
        let b = cache.fetch_or_load("b", &Variant::from("size3")).await.unwrap();
        backdate(&cache, "a", 10, Duration::from_secs(5));
        backdate(&cache, "b", 1, Duration::from_secs(500));

        let mut events = cache.subscribe();
        cache.fetch("c").await.unwrap();

        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
        assert!(!a.is_released());
        assert!(b.is_released());
        let mut evicted = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CacheEvent::Evicted { key } = event {
                evicted.push(key);
            }
        }
        assert_eq!(evicted, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn remove_releases_once_and_is_idempotent() {
        let cache = cache_with(
            &CacheConfig::default(),
            Arc::new(CountingFetcher::default()),
        );
        let handle = cache.fetch("a").await.unwrap();

        assert!(cache.remove("a"));
        assert!(handle.is_released());
        assert!(cache.get("a").is_none());
        assert!(!cache.remove("a"));
        assert!(matches!(
            handle.bytes(),
            Err(CacheError::HandleReleased { .. })
        ));
    }

    #[tokio::test]
    async fn clear_invalidates_everything() {
        let cache = cache_with(
            &CacheConfig::default(),
            Arc::new(CountingFetcher::default()),
        );
        let handles = vec![
            cache.fetch("a").await.unwrap(),
            cache.fetch("b").await.unwrap(),
        ];

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.stats().count, 0);
        assert_eq!(cache.total_bytes(), ByteSize::ZERO);
        assert!(handles.iter().all(AssetHandle::is_released));
    }

    #[tokio::test]
    async fn clear_discards_in_flight_results() {
        let fetcher = Arc::new(GatedFetcher::default());
        let cache = cache_with(&CacheConfig::default(), fetcher.clone());

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch("session-a").await })
        };
        fetcher.started.notified().await;
        cache.clear();
        fetcher.gate.notify_one();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(CacheError::Invalidated { .. })
        ));
        assert!(!cache.has("session-a"));
        assert!(!cache.is_loading("session-a"));
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_cancel_fetch() {
        let fetcher = Arc::new(GatedFetcher::default());
        let cache = cache_with(&CacheConfig::default(), fetcher.clone());

        let caller = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch("poster").await })
        };
        fetcher.started.notified().await;
        caller.abort();
        fetcher.gate.notify_one();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !cache.has("poster") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("fetch should complete without its caller");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stats_and_usage_rankings() {
        let cache = cache_with(
            &CacheConfig::default(),
            Arc::new(CountingFetcher::default()),
        );
        for key in ["a", "bb", "ccc"] {
            cache.fetch(key).await.unwrap();
        }
        for _ in 0..4 {
            cache.get_tracked("ccc");
        }
        cache.get_tracked("bb");

        let stats = cache.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_bytes, ByteSize::from_bytes(6));
        assert_eq!(stats.avg_access_count, 2.67);
        assert_eq!(stats.loading_count, 0);
        assert_eq!(stats.limits, CapacityLimits::new(150, 40));
        assert_eq!(stats.memory_pressure, None);

        let least: Vec<_> = cache.least_used(2).into_iter().map(|e| e.key).collect();
        let most: Vec<_> = cache.most_used(2).into_iter().map(|e| e.key).collect();
        assert_eq!(least, vec!["a", "bb"]);
        assert_eq!(most, vec!["ccc", "bb"]);
        assert_eq!(cache.least_used(10).len(), 3);
    }

    #[tokio::test]
    async fn cached_size_is_the_fetched_payload_size() {
        let mut fetcher = MockAssetFetcher::new();
        fetcher.expect_fetch().returning(|key, variant| {
            let len = if variant.as_str() == "thumbnail" { 3 } else { 1500 };
            Ok(FetchedAsset::new(vec![key.len() as u8; len]))
        });
        let cache = cache_with(&CacheConfig::default(), Arc::new(fetcher));

        let thumb = cache
            .fetch_or_load("hero-1", &Variant::from("thumbnail"))
            .await
            .unwrap();
        let full = cache.fetch_or_load("hero-2", &Variant::default()).await.unwrap();

        let expected = FetchedAsset::new(vec![0; 1500]).size();
        assert_eq!(full.size(), expected);
        assert_eq!(thumb.size(), ByteSize::from_bytes(3));
        assert_eq!(cache.total_bytes(), ByteSize::from_bytes(1503));

        let sizes: Vec<_> = cache.most_used(2).into_iter().map(|e| e.size).collect();
        assert!(sizes.contains(&expected));
        assert!(sizes.contains(&ByteSize::from_bytes(3)));
    }

    #[tokio::test]
    async fn preload_orders_by_priority_and_skips_cached() {
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = cache_with(&CacheConfig::default(), fetcher.clone());
        cache.fetch("already").await.unwrap();

        let report = cache
            .preload(&["already", "plain", "featured-1", "plain", ""][..], &Variant::default())
            .await;

        assert_eq!(
            report,
            PreloadReport {
                requested: 2,
                loaded: 2,
                failed: 0
            }
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        let keys = cache.keys();
        assert_eq!(keys, vec!["already", "featured-1", "plain"]);
    }
}
