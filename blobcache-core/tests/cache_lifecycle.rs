use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use blobcache_core::{
    AssetCache, AssetFetcher, AuthState, CacheConfig, CacheEvent, CacheMonitor, FetchError,
    FetchedAsset, ManualPressure, RetryPhase, SweepOutcome, Variant, spawn_session_guard,
};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Serves payloads sized by variant and fails keys starting with `bad-`.
#[derive(Debug, Default)]
struct CatalogFetcher {
    requests: Mutex<HashMap<String, usize>>,
}

impl CatalogFetcher {
    fn requests_for(&self, key: &str) -> usize {
        self.requests.lock().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AssetFetcher for CatalogFetcher {
    async fn fetch(&self, key: &str, variant: &Variant) -> Result<FetchedAsset, FetchError> {
        *self.requests.lock().entry(key.to_string()).or_default() += 1;
        if key.starts_with("bad-") {
            return Err(FetchError::Status {
                status: 500,
                url: format!("https://origin.test/{key}/{variant}"),
            });
        }
        let size = match variant.as_str() {
            "thumbnail" => 256,
            _ => 4096,
        };
        Ok(FetchedAsset::new(vec![0xAB; size]))
    }
}

fn setup(ratio: f64) -> (AssetCache, Arc<CatalogFetcher>, Arc<ManualPressure>) {
    let fetcher = Arc::new(CatalogFetcher::default());
    let pressure = Arc::new(ManualPressure::with_ratio(ratio));
    let cache = AssetCache::new(&CacheConfig::default(), fetcher.clone(), pressure.clone());
    (cache, fetcher, pressure)
}

#[tokio::test]
async fn browse_session_then_sign_out() {
    let (cache, fetcher, _) = setup(0.3);
    let (auth_tx, auth_rx) = watch::channel(AuthState::SignedIn {
        user_id: "viewer".into(),
    });
    let guard = spawn_session_guard(cache.clone(), auth_rx);
    let mut events = cache.subscribe();

    let keys: Vec<String> = (0..20).map(|i| format!("movie-{i}")).collect();
    let report = cache.preload(keys.as_slice(), &Variant::from("thumbnail")).await;
    assert_eq!(report.loaded, 20);
    assert_eq!(cache.total_bytes().as_bytes(), 20 * 256);

    let poster = cache.fetch("movie-3").await.unwrap();
    assert_eq!(fetcher.requests_for("movie-3"), 1);
    assert_eq!(poster.size().as_bytes(), 256);

    assert!(cache.fetch("bad-cover").await.is_err());
    assert!(matches!(
        cache.retry_phase("bad-cover"),
        RetryPhase::Backoff { attempts: 1, .. }
    ));
    assert_eq!(cache.stats().error_count, 1);

    auth_tx
        .send(AuthState::SignedIn {
            user_id: "someone-else".into(),
        })
        .unwrap();

    let released = loop {
        if let CacheEvent::Cleared { released } = events.recv().await.unwrap() {
            break released;
        }
    };
    assert_eq!(released, 20);
    assert!(poster.is_released());
    assert_eq!(cache.stats().count, 0);
    assert_eq!(cache.stats().error_count, 0);
    assert_eq!(cache.retry_phase("bad-cover"), RetryPhase::Fresh);

    drop(auth_tx);
    guard.await.unwrap();
}

#[tokio::test]
async fn monitor_trims_under_pressure() {
    let (cache, _, pressure) = setup(0.2);
    for i in 0..40 {
        cache.fetch(&format!("show-{i}")).await.unwrap();
    }
    for i in 0..10 {
        for _ in 0..3 {
            cache.get_tracked(&format!("show-{i}"));
        }
    }
    let monitor = CacheMonitor::new(cache.clone(), CacheConfig::default().monitor);

    assert_eq!(monitor.sweep(), SweepOutcome::Idle);

    pressure.set_ratio(0.9);
    assert_eq!(monitor.sweep(), SweepOutcome::Aggressive { removed: 20 });
    for i in 0..10 {
        assert!(cache.has(&format!("show-{i}")), "show-{i} was heavily used");
    }

    let analysis = monitor.analysis();
    assert_eq!(analysis.total_count, 20);
    assert_eq!(analysis.most_used[0].access_count, 4);

    // New inserts respect the tightened capacity.
    assert_eq!(cache.limits().max_entries, 50);
    for i in 0..60 {
        cache.fetch(&format!("extra-{i}")).await.unwrap();
        assert!(cache.len() <= 50);
    }
}
