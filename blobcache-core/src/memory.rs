//! Host memory-pressure signals.
//!
//! The store and monitor only ever see a `used / limit` ratio. Hosts without
//! introspection use [`NoPressureSignal`], which makes the store fall back to
//! fixed capacity limits. [`ProcessMemoryProvider`] compares this process's
//! resident memory to a budget; [`HostMemoryProvider`] reports the whole
//! machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

use crate::units::ByteSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub used: ByteSize,
    pub limit: ByteSize,
}

impl MemorySnapshot {
    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            used: ByteSize::from_bytes(used_bytes),
            limit: ByteSize::from_bytes(limit_bytes),
        }
    }

    /// `used / limit`, or `None` when the limit is unknown (zero).
    pub fn ratio(&self) -> Option<f64> {
        if self.limit.as_bytes() == 0 {
            return None;
        }
        Some(self.used.as_bytes() as f64 / self.limit.as_bytes() as f64)
    }
}

/// Source of memory-pressure snapshots.
pub trait MemoryPressureProvider: Send + Sync + fmt::Debug {
    fn snapshot(&self) -> Option<MemorySnapshot>;

    fn ratio(&self) -> Option<f64> {
        self.snapshot().and_then(|snapshot| snapshot.ratio())
    }
}

/// Provider for hosts that expose no memory introspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPressureSignal;

impl MemoryPressureProvider for NoPressureSignal {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        None
    }
}

/// Whole-host RAM usage (`used / total`) read through `sysinfo`.
///
/// Reflects every process on the machine, so a busy host tightens the cache
/// even when this process is small. Prefer [`ProcessMemoryProvider`] when a
/// memory budget for the process is known.
pub struct HostMemoryProvider {
    system: Mutex<System>,
}

impl HostMemoryProvider {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for HostMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostMemoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemoryProvider").finish_non_exhaustive()
    }
}

impl MemoryPressureProvider for HostMemoryProvider {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some(MemorySnapshot::new(system.used_memory(), total))
    }
}

/// Resident memory of the current process measured against a fixed budget.
pub struct ProcessMemoryProvider {
    budget: ByteSize,
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProvider {
    /// A zero budget disables the signal.
    pub fn new(budget: ByteSize) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Process memory signal unavailable: {e}");
                None
            }
        };
        Self {
            budget,
            pid,
            system: Mutex::new(System::new_with_specifics(RefreshKind::nothing())),
        }
    }

    pub fn budget(&self) -> ByteSize {
        self.budget
    }

    /// Current resident set size, if the platform reports one.
    pub fn resident(&self) -> Option<ByteSize> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system
            .process(pid)
            .map(Process::memory)
            .map(ByteSize::from_bytes)
    }
}

impl fmt::Debug for ProcessMemoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessMemoryProvider")
            .field("budget", &self.budget)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl MemoryPressureProvider for ProcessMemoryProvider {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        if self.budget == ByteSize::ZERO {
            return None;
        }
        let resident = self.resident()?;
        Some(MemorySnapshot {
            used: resident,
            limit: self.budget,
        })
    }
}

/// Settable provider for embedding hosts that measure memory themselves,
/// and for exercising the pressure tiers in tests.
#[derive(Debug, Default)]
pub struct ManualPressure {
    used: AtomicU64,
    // 0 means "no signal"
    limit: AtomicU64,
}

impl ManualPressure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ratio(ratio: f64) -> Self {
        let provider = Self::new();
        provider.set_ratio(ratio);
        provider
    }

    pub fn set(&self, snapshot: MemorySnapshot) {
        self.used.store(snapshot.used.as_bytes(), Ordering::SeqCst);
        self.limit.store(snapshot.limit.as_bytes(), Ordering::SeqCst);
    }

    /// Express `ratio` against a nominal 1 GiB limit.
    pub fn set_ratio(&self, ratio: f64) {
        const NOMINAL_LIMIT: u64 = 1 << 30;
        let used = (ratio.clamp(0.0, 1.0) * NOMINAL_LIMIT as f64).round() as u64;
        self.set(MemorySnapshot::new(used, NOMINAL_LIMIT));
    }

    pub fn clear(&self) {
        self.limit.store(0, Ordering::SeqCst);
        self.used.store(0, Ordering::SeqCst);
    }
}

impl MemoryPressureProvider for ManualPressure {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        let limit = self.limit.load(Ordering::SeqCst);
        if limit == 0 {
            return None;
        }
        Some(MemorySnapshot::new(self.used.load(Ordering::SeqCst), limit))
    }
}

/// Coarse pressure classification used in cache reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
}

impl PressureLevel {
    pub fn from_ratio(ratio: Option<f64>) -> Self {
        match ratio {
            Some(r) if r > 0.8 => PressureLevel::High,
            Some(r) if r > 0.6 => PressureLevel::Medium,
            _ => PressureLevel::Low,
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_signal_reports_nothing() {
        assert_eq!(NoPressureSignal.ratio(), None);
    }

    #[test]
    fn manual_pressure_round_trips_ratio() {
        let provider = ManualPressure::new();
        assert_eq!(provider.ratio(), None);

        provider.set_ratio(0.75);
        let ratio = provider.ratio().unwrap();
        assert!((ratio - 0.75).abs() < 1e-6);

        provider.clear();
        assert_eq!(provider.ratio(), None);
    }

    #[test]
    fn zero_limit_has_no_ratio() {
        assert_eq!(MemorySnapshot::new(10, 0).ratio(), None);
    }

    #[test]
    fn process_signal_measures_this_process() {
        let provider = ProcessMemoryProvider::new(ByteSize::from_bytes(1 << 40));
        let Some(snapshot) = provider.snapshot() else {
            // Platform without per-process memory figures.
            return;
        };
        assert_eq!(snapshot.limit, ByteSize::from_bytes(1 << 40));
        assert!(snapshot.used > ByteSize::ZERO);
        // A test binary is nowhere near a 1 TiB budget, whatever the host
        // is doing.
        assert!(snapshot.ratio().unwrap() < 0.5);
    }

    #[test]
    fn zero_budget_process_signal_is_disabled() {
        let provider = ProcessMemoryProvider::new(ByteSize::ZERO);
        assert_eq!(provider.snapshot(), None);
        assert_eq!(provider.ratio(), None);
    }

    #[test]
    fn tiny_budget_reads_as_high_pressure() {
        let provider = ProcessMemoryProvider::new(ByteSize::from_bytes(1));
        if let Some(ratio) = provider.ratio() {
            assert_eq!(PressureLevel::from_ratio(Some(ratio)), PressureLevel::High);
        }
    }

    #[test]
    fn pressure_levels() {
        assert_eq!(PressureLevel::from_ratio(None), PressureLevel::Low);
        assert_eq!(PressureLevel::from_ratio(Some(0.6)), PressureLevel::Low);
        assert_eq!(PressureLevel::from_ratio(Some(0.7)), PressureLevel::Medium);
        assert_eq!(PressureLevel::from_ratio(Some(0.81)), PressureLevel::High);
    }
}
