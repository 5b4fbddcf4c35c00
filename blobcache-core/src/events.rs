/// Change notifications published by [`crate::store::AssetCache`].
///
/// Delivery is best effort: slow subscribers lag and miss events rather than
/// slowing the cache down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A network fetch started for the key.
    Loading { key: String },
    Loaded { key: String },
    Failed { key: String, error: String },
    /// Removed by the capacity check to make room for a new entry.
    Evicted { key: String },
    /// Removed explicitly (directly or by the monitor).
    Removed { key: String },
    Cleared { released: usize },
}

impl CacheEvent {
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Loading { key }
            | CacheEvent::Loaded { key }
            | CacheEvent::Failed { key, .. }
            | CacheEvent::Evicted { key }
            | CacheEvent::Removed { key } => Some(key),
            CacheEvent::Cleared { .. } => None,
        }
    }
}
