//! Scoring and capacity rules behind the store's smart cleanup.
//!
//! An entry's value is `access_count * frequency + priority * priority_w -
//! idle_seconds * age`. Higher is kept. Cleanup evicts the lowest scores
//! first, breaking ties by insertion order so older entries go first.

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub frequency: f64,
    pub priority: f64,
    pub age: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            frequency: 10.0,
            priority: 5.0,
            age: 1.0,
        }
    }
}

impl ScoreWeights {
    pub fn score(&self, access_count: u64, priority: u32, idle: Duration) -> f64 {
        access_count as f64 * self.frequency + f64::from(priority) * self.priority
            - idle.as_secs_f64() * self.age
    }
}

/// How many entries the store may hold and how many one cleanup pass evicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLimits {
    pub max_entries: usize,
    pub cleanup_batch: usize,
}

impl CapacityLimits {
    pub const fn new(max_entries: usize, cleanup_batch: usize) -> Self {
        Self {
            max_entries,
            cleanup_batch,
        }
    }
}

/// Limits applied once the pressure ratio is strictly above `above`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureTier {
    pub above: f64,
    #[serde(flatten)]
    pub limits: CapacityLimits,
}

/// Maps a memory-pressure ratio onto [`CapacityLimits`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityPolicy {
    pub tiers: Vec<PressureTier>,
    /// Used when a signal exists but no tier matches.
    pub baseline: CapacityLimits,
    /// Used when the host exposes no memory signal.
    pub no_signal: CapacityLimits,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            tiers: vec![
                PressureTier {
                    above: 0.8,
                    limits: CapacityLimits::new(50, 20),
                },
                PressureTier {
                    above: 0.6,
                    limits: CapacityLimits::new(100, 30),
                },
            ],
            baseline: CapacityLimits::new(200, 50),
            no_signal: CapacityLimits::new(150, 40),
        }
    }
}

impl CapacityPolicy {
    pub fn limits_for(&self, pressure: Option<f64>) -> CapacityLimits {
        let Some(ratio) = pressure else {
            return self.no_signal;
        };

        self.tiers
            .iter()
            .filter(|tier| ratio > tier.above)
            .max_by(|a, b| a.above.total_cmp(&b.above))
            .map(|tier| tier.limits)
            .unwrap_or(self.baseline)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub weights: ScoreWeights,
    pub capacity: CapacityPolicy,
}

/// Snapshot of one entry as seen by the scorer.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub key: &'a str,
    pub access_count: u64,
    pub priority: u32,
    pub idle: Duration,
    pub seq: u64,
}

/// Keys of the `count` lowest-scoring candidates, lowest first.
pub fn select_victims(
    mut candidates: Vec<Candidate<'_>>,
    weights: &ScoreWeights,
    count: usize,
) -> Vec<String> {
    if count == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(f64, Candidate<'_>)> = candidates
        .drain(..)
        .map(|c| (weights.score(c.access_count, c.priority, c.idle), c))
        .collect();

    scored.sort_by(|(score_a, a), (score_b, b)| {
        match score_a.total_cmp(score_b) {
            Ordering::Equal => a.seq.cmp(&b.seq),
            other => other,
        }
    });

    scored
        .into_iter()
        .take(count)
        .map(|(_, c)| c.key.to_string())
        .collect()
}
