//! Bounded, adaptive, priority-aware in-memory cache for remotely fetched
//! image assets.
//!
//! [`AssetCache`] maps asset ids to [`AssetHandle`]s holding the fetched
//! bytes. Concurrent requests for the same id share one network fetch,
//! failures back off exponentially with jitter, and capacity shrinks as the
//! host reports memory pressure. [`CacheMonitor`] runs the periodic
//! pressure sweep and on-demand maintenance on top of the store's public
//! API.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use blobcache_core::{AssetCache, ByteSize, CacheConfig, ProcessMemoryProvider};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::load(None, None)?;
//! let budget = ByteSize::from_bytes(512 * 1024 * 1024);
//! let cache = AssetCache::from_config(&config, Arc::new(ProcessMemoryProvider::new(budget)))?;
//! let handle = cache.fetch("2cdc28f0-017a-49c4-9ed7-87056c83901f").await?;
//! println!("{} bytes", handle.bytes()?.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod eviction;
pub mod fetcher;
pub mod handle;
pub mod memory;
pub mod monitor;
pub mod priority;
pub mod retry;
pub mod session;
pub mod store;
pub mod units;

pub use config::CacheConfig;
pub use error::{CacheError, ConfigError, FetchError, Result};
pub use events::CacheEvent;
pub use eviction::{CapacityLimits, CapacityPolicy, EvictionConfig, ScoreWeights};
pub use fetcher::{AssetFetcher, FetchedAsset, HttpAssetFetcher};
pub use handle::AssetHandle;
pub use memory::{
    HostMemoryProvider, ManualPressure, MemoryPressureProvider, MemorySnapshot, NoPressureSignal,
    PressureLevel, ProcessMemoryProvider,
};
pub use monitor::{CacheAnalysis, CacheMonitor, MonitorConfig, SweepOutcome};
pub use priority::{PriorityConfig, PriorityModel, Variant};
pub use retry::{RetryController, RetryPhase, RetryPolicy, RetryState};
pub use session::{AuthState, spawn_session_guard};
pub use store::{AssetCache, CacheStats, EntryInfo, PreloadReport};
pub use units::ByteSize;
