//! Monotonic acquisition timestamps
//!
//! Devices report sample times as fractional seconds; the pipeline keeps
//! them as integer nanoseconds so ordering and watermark checks are exact.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Acquisition timestamp with nanosecond resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp {
    /// Nanoseconds since the producer's epoch
    nanos: u64,
}

impl Timestamp {
    /// Zero timestamp
    pub const ZERO: Timestamp = Timestamp { nanos: 0 };

    /// Create a timestamp from nanoseconds
    #[inline]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Create a timestamp from microseconds
    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Self {
            nanos: micros * 1_000,
        }
    }

    /// Create a timestamp from milliseconds
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    /// Create a timestamp from fractional seconds.
    ///
    /// Negative and non-finite inputs saturate to zero.
    #[inline]
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::ZERO;
        }
        Self {
            nanos: (secs * 1_000_000_000.0).round() as u64,
        }
    }

    /// Nanoseconds since the producer's epoch
    #[inline]
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Fractional seconds since the producer's epoch
    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.nanos as f64 / 1_000_000_000.0
    }

    /// Duration since an earlier timestamp, `None` if `earlier` is later
    #[inline]
    pub fn checked_duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.nanos.checked_sub(earlier.nanos).map(Duration::from_nanos)
    }

    /// Step back by `duration`, stopping at zero
    #[inline]
    pub fn saturating_sub(&self, duration: Duration) -> Timestamp {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Timestamp::from_nanos(self.nanos.saturating_sub(nanos))
    }

    /// Step forward by `duration`, stopping at the maximum
    #[inline]
    pub fn saturating_add(&self, duration: Duration) -> Timestamp {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Timestamp::from_nanos(self.nanos.saturating_add(nanos))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.nanos / 1_000_000_000;
        let subsec_nanos = self.nanos % 1_000_000_000;
        write!(f, "{}.{:09}", secs, subsec_nanos)
    }
}
