use std::fmt;
use std::iter::Sum;

use serde::{Deserialize, Serialize};

/// Size of a cached payload, in bytes.
///
/// Formatting is base-2 (KiB, MiB) since payload sizes are compared against
/// host memory figures.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    pub const ZERO: Self = Self(0);
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn from_usize(bytes: usize) -> Self {
        Self(u64::try_from(bytes).unwrap_or(u64::MAX))
    }

    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    pub const fn as_mib(self) -> f64 {
        self.0 as f64 / Self::MIB
    }

    /// MiB rounded to two decimals, the unit the cache reports use.
    pub fn as_mib_rounded(self) -> f64 {
        (self.as_mib() * 100.0).round() / 100.0
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl Sum for ByteSize {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0 as f64;
        if bytes >= Self::GIB {
            write!(f, "{:.2} GiB", bytes / Self::GIB)
        } else if bytes >= Self::MIB {
            write!(f, "{:.1} MiB", bytes / Self::MIB)
        } else if bytes >= Self::KIB {
            write!(f, "{:.1} KiB", bytes / Self::KIB)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}
