//! Per-cycle frames produced by the resampler and the spectral transform.
//!
//! Neither type is retained by the pipeline beyond the cycle that produced
//! it, except the last spectral frame per channel which is kept so a cycle
//! with too few samples can re-emit it.

use serde::{Deserialize, Serialize};

/// One synthesized sample of one channel on the uniform tick grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResampledPoint {
    /// Grid index: the tick's time is `tick / target_rate`
    pub tick: i64,
    /// Tick time in seconds
    pub timestamp: f64,
    /// Interpolated value
    pub value: f64,
}

/// All channels' values at one synthesized tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResampledFrame {
    /// Grid index shared by every channel in the frame
    pub tick: i64,
    /// Tick time in seconds
    pub timestamp: f64,
    /// Value per channel index; `None` where the channel had no bracketing samples
    pub values: Vec<Option<f64>>,
}

impl ResampledFrame {
    /// Create an empty frame for `channel_count` channels
    pub fn empty(tick: i64, timestamp: f64, channel_count: usize) -> Self {
        Self {
            tick,
            timestamp,
            values: vec![None; channel_count],
        }
    }

    /// Value of one channel, if valid at this tick
    pub fn value(&self, channel: usize) -> Option<f64> {
        self.values.get(channel).copied().flatten()
    }

    /// Number of channels with a valid value
    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// One frequency bin of a magnitude spectrum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralBin {
    /// Bin centre frequency in Hz
    pub frequency: f64,
    /// Raw, unnormalized modulus of the transform at this bin
    pub magnitude: f64,
}

/// Magnitude spectrum of one channel's trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralFrame {
    /// Channel the spectrum was computed for
    pub channel: usize,
    /// Number of time-domain samples transformed
    pub window_length: usize,
    /// Sample rate of the transformed samples (Hz)
    pub sample_rate: f64,
    /// Bins from DC up to Nyquist, `window_length / 2 + 1` entries
    pub bins: Vec<SpectralBin>,
}

impl SpectralFrame {
    /// Frequency spacing between adjacent bins (Hz)
    pub fn resolution(&self) -> f64 {
        if self.window_length == 0 {
            0.0
        } else {
            self.sample_rate / self.window_length as f64
        }
    }

    /// Bin with the largest magnitude, DC excluded
    pub fn peak(&self) -> Option<SpectralBin> {
        self.bins
            .iter()
            .skip(1)
            .copied()
            .max_by(|a, b| a.magnitude.total_cmp(&b.magnitude))
    }

    /// Number of bins
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// Whether the frame has no bins
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_values() {
        let mut frame = ResampledFrame::empty(10, 0.04, 4);
        frame.values[2] = Some(1.5);
        assert_eq!(frame.value(2), Some(1.5));
        assert_eq!(frame.value(0), None);
        assert_eq!(frame.value(9), None);
        assert_eq!(frame.valid_count(), 1);
    }

    #[test]
    fn test_spectral_peak_skips_dc() {
        let frame = SpectralFrame {
            channel: 0,
            window_length: 4,
            sample_rate: 4.0,
            bins: vec![
                SpectralBin { frequency: 0.0, magnitude: 100.0 },
                SpectralBin { frequency: 1.0, magnitude: 3.0 },
                SpectralBin { frequency: 2.0, magnitude: 1.0 },
            ],
        };
        assert_eq!(frame.resolution(), 1.0);
        assert_eq!(frame.peak().map(|b| b.frequency), Some(1.0));
    }
}
