//! Per-key retry bookkeeping with exponential backoff and jitter.
//!
//! A key with no record is `Fresh`. Each failed fetch bumps the attempt
//! counter and pushes the next eligible instant out by
//! `min(base * 2^(attempts - 1), max) + jitter`. Once the counter reaches
//! `max_attempts` the key stays ineligible until [`RetryController::reset`]
//! is called.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter_ms: 1_000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the delay after `attempts` consecutive failures.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    fn jitter(&self) -> Duration {
        if self.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=self.jitter_ms))
    }

    /// Full delay including a fresh jitter sample.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.backoff_delay(attempts) + self.jitter()
    }
}

/// Failure history for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub last_attempt: Instant,
    pub next_eligible: Instant,
}

/// Where a key sits in the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Fresh,
    Backoff { attempts: u32, next_eligible: Instant },
    Exhausted { attempts: u32 },
}

#[derive(Debug)]
pub struct RetryController {
    policy: RetryPolicy,
    states: DashMap<String, RetryState>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            states: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn phase(&self, key: &str) -> RetryPhase {
        match self.states.get(key) {
            None => RetryPhase::Fresh,
            Some(state) if state.attempts >= self.policy.max_attempts => {
                RetryPhase::Exhausted {
                    attempts: state.attempts,
                }
            }
            Some(state) => RetryPhase::Backoff {
                attempts: state.attempts,
                next_eligible: state.next_eligible,
            },
        }
    }

    pub fn state(&self, key: &str) -> Option<RetryState> {
        self.states.get(key).map(|state| *state)
    }

    pub fn is_eligible(&self, key: &str, now: Instant) -> bool {
        self.check(key, now).is_ok()
    }

    /// Gate a fetch attempt for `key` at `now`.
    pub fn check(&self, key: &str, now: Instant) -> Result<(), CacheError> {
        match self.phase(key) {
            RetryPhase::Fresh => Ok(()),
            RetryPhase::Exhausted { attempts } => {
                Err(CacheError::RetryExhausted {
                    key: key.to_string(),
                    attempts,
                })
            }
            RetryPhase::Backoff { next_eligible, .. } if now < next_eligible => {
                Err(CacheError::RetryNotEligible {
                    key: key.to_string(),
                    eligible_at: next_eligible,
                })
            }
            RetryPhase::Backoff { .. } => Ok(()),
        }
    }

    /// Record a failed fetch and return the updated state.
    pub fn record_failure(&self, key: &str, now: Instant) -> RetryState {
        let max = self.policy.max_attempts.max(1);
        let mut entry = self
            .states
            .entry(key.to_string())
            .and_modify(|state| {
                state.attempts = state.attempts.saturating_add(1).min(max);
            })
            .or_insert(RetryState {
                attempts: 1,
                last_attempt: now,
                next_eligible: now,
            });

        let delay = self.policy.delay_for(entry.attempts);
        entry.last_attempt = now;
        entry.next_eligible = entry.next_eligible.max(now + delay);
        let state = *entry;
        drop(entry);

        if state.attempts >= max {
            log::warn!(
                "Retries exhausted for {} after {} attempts",
                key,
                state.attempts
            );
        } else {
            log::debug!(
                "Fetch for {} failed (attempt {}/{}), next retry in {:?}",
                key,
                state.attempts,
                max,
                state.next_eligible.saturating_duration_since(now)
            );
        }
        state
    }

    pub fn record_success(&self, key: &str) {
        self.states.remove(key);
    }

    /// User-initiated retry: forget the failure history so the next fetch
    /// is allowed immediately.
    pub fn reset(&self, key: &str) -> bool {
        self.states.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
