//! Sample: one reading of one channel at one acquisition instant

use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// A single timestamped reading for one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Channel index (0..N-1)
    pub channel: usize,
    /// Measured value (device units, typically µV)
    pub value: f64,
    /// Acquisition time
    pub timestamp: Timestamp,
}

impl Sample {
    /// Create a new sample
    pub fn new(channel: usize, value: f64, timestamp: Timestamp) -> Self {
        Self {
            channel,
            value,
            timestamp,
        }
    }

    /// Create a sample from a timestamp given in fractional seconds,
    /// the form most acquisition SDKs report
    pub fn at_secs(channel: usize, value: f64, secs: f64) -> Self {
        Self::new(channel, value, Timestamp::from_secs_f64(secs))
    }

    /// Timestamp as fractional seconds
    #[inline]
    pub fn secs(&self) -> f64 {
        self.timestamp.as_secs_f64()
    }
}

impl From<(usize, f64, Timestamp)> for Sample {
    fn from((channel, value, timestamp): (usize, f64, Timestamp)) -> Self {
        Sample::new(channel, value, timestamp)
    }
}
