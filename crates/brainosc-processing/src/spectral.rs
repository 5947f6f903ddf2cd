//! Magnitude spectra of each channel's trailing filtered window
//!
//! Real-input FFT over the last `window_length` samples, returning the
//! unnormalized modulus of bins `0..=window_length / 2`. FFT plans and
//! scratch buffers are cached across cycles and dropped by [`reclaim`].
//!
//! [`reclaim`]: SpectralTransform::reclaim

use brainosc_core::{config_error, SpectralBin, SpectralFrame, StreamError, StreamResult};
use num_complex::Complex;
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

/// Window applied to the samples before transforming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Taper {
    /// No taper (all ones)
    #[default]
    Rectangular,
    /// Raised cosine reaching zero at both ends
    Hann,
    /// Raised cosine with 0.08 at both ends
    Hamming,
}

impl Taper {
    /// Symmetric coefficients for a window of `len` samples
    pub fn coefficients(&self, len: usize) -> Vec<f64> {
        if len < 2 {
            return vec![1.0; len];
        }
        let denominator = (len - 1) as f64;
        (0..len)
            .map(|i| {
                let phase = 2.0 * PI * i as f64 / denominator;
                match self {
                    Taper::Rectangular => 1.0,
                    Taper::Hann => 0.5 - 0.5 * phase.cos(),
                    Taper::Hamming => 0.54 - 0.46 * phase.cos(),
                }
            })
            .collect()
    }
}

/// Real-input FFT with cached plan and buffers
pub struct SpectralTransform {
    window_length: usize,
    taper: Taper,
    coefficients: Vec<f64>,
    planner: RealFftPlanner<f64>,
    input: Vec<f64>,
    spectrum: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectralTransform {
    /// Create a transform over `window_length` samples
    pub fn new(window_length: usize, taper: Taper) -> StreamResult<Self> {
        if window_length < 2 {
            return Err(config_error!(
                "fft.window_length must be at least 2, got {}",
                window_length
            ));
        }
        Ok(Self {
            window_length,
            taper,
            coefficients: taper.coefficients(window_length),
            planner: RealFftPlanner::new(),
            input: Vec::new(),
            spectrum: Vec::new(),
            scratch: Vec::new(),
        })
    }

    /// Number of samples transformed
    pub fn window_length(&self) -> usize {
        self.window_length
    }

    /// Taper in use
    pub fn taper(&self) -> Taper {
        self.taper
    }

    /// Number of bins every frame carries
    pub fn bin_count(&self) -> usize {
        self.window_length / 2 + 1
    }

    /// Transform the trailing `window_length` entries of `samples`, taken
    /// at `sample_rate` Hz, into a spectral frame for `channel`
    pub fn transform(
        &mut self,
        channel: usize,
        samples: &[f64],
        sample_rate: f64,
    ) -> StreamResult<SpectralFrame> {
        let n = self.window_length;
        if samples.len() < n {
            return Err(StreamError::InsufficientWindow {
                required: n,
                available: samples.len(),
            });
        }

        let fft = self.planner.plan_fft_forward(n);
        if self.input.len() != n {
            self.input = fft.make_input_vec();
            self.spectrum = fft.make_output_vec();
            self.scratch = fft.make_scratch_vec();
        }

        let tail = &samples[samples.len() - n..];
        for ((slot, &value), &weight) in self.input.iter_mut().zip(tail).zip(&self.coefficients) {
            *slot = value * weight;
        }

        fft.process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .map_err(|e| {
                debug!(channel, error = %e, "FFT buffer mismatch");
                StreamError::InsufficientWindow {
                    required: n,
                    available: self.input.len(),
                }
            })?;

        let resolution = sample_rate / n as f64;
        let bins = self
            .spectrum
            .iter()
            .enumerate()
            .map(|(k, c)| SpectralBin {
                frequency: k as f64 * resolution,
                magnitude: c.norm(),
            })
            .collect();

        Ok(SpectralFrame {
            channel,
            window_length: n,
            sample_rate,
            bins,
        })
    }

    /// Drop cached plans and scratch buffers; the next transform rebuilds them
    pub fn reclaim(&mut self) {
        self.planner = RealFftPlanner::new();
        self.input = Vec::new();
        self.spectrum = Vec::new();
        self.scratch = Vec::new();
    }
}

impl std::fmt::Debug for SpectralTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectralTransform")
            .field("window_length", &self.window_length)
            .field("taper", &self.taper)
            .finish_non_exhaustive()
    }
}

/// Result of asking the bank for one channel's spectrum this cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpectralOutput<'a> {
    /// Computed from this cycle's window
    Fresh(&'a SpectralFrame),
    /// Too few samples this cycle; the channel's previous frame
    Retained(&'a SpectralFrame),
    /// Too few samples and nothing computed yet
    NoData,
}

impl<'a> SpectralOutput<'a> {
    /// Frame to send, fresh or retained
    pub fn frame(&self) -> Option<&'a SpectralFrame> {
        match *self {
            SpectralOutput::Fresh(frame) | SpectralOutput::Retained(frame) => Some(frame),
            SpectralOutput::NoData => None,
        }
    }

    /// Whether the frame was computed this cycle
    pub fn is_fresh(&self) -> bool {
        matches!(self, SpectralOutput::Fresh(_))
    }
}

/// One transform shared by all channels, plus each channel's last frame
#[derive(Debug)]
pub struct SpectralBank {
    transform: SpectralTransform,
    frames: Vec<Option<SpectralFrame>>,
}

impl SpectralBank {
    /// Create a bank for `channel_count` channels
    pub fn new(channel_count: usize, window_length: usize, taper: Taper) -> StreamResult<Self> {
        Ok(Self {
            transform: SpectralTransform::new(window_length, taper)?,
            frames: vec![None; channel_count],
        })
    }

    /// Compute `channel`'s spectrum from its filtered history, falling back
    /// to the last frame when the history is shorter than the window
    pub fn update(&mut self, channel: usize, history: &[f64], sample_rate: f64) -> SpectralOutput<'_> {
        if channel >= self.frames.len() {
            return SpectralOutput::NoData;
        }

        match self.transform.transform(channel, history, sample_rate) {
            Ok(frame) => {
                self.frames[channel] = Some(frame);
                self.frames[channel]
                    .as_ref()
                    .map_or(SpectralOutput::NoData, SpectralOutput::Fresh)
            }
            Err(_) => self.frames[channel]
                .as_ref()
                .map_or(SpectralOutput::NoData, SpectralOutput::Retained),
        }
    }

    /// Last frame computed for `channel`
    pub fn frame(&self, channel: usize) -> Option<&SpectralFrame> {
        self.frames.get(channel).and_then(Option::as_ref)
    }

    /// Forget `channel`'s last frame
    pub fn forget(&mut self, channel: usize) {
        if let Some(slot) = self.frames.get_mut(channel) {
            *slot = None;
        }
    }

    /// Apply a new channel count, window length or taper. Changing the
    /// window or taper discards every retained frame.
    pub fn reconfigure(&mut self, channel_count: usize, window_length: usize, taper: Taper) -> StreamResult<()> {
        if window_length != self.transform.window_length() || taper != self.transform.taper() {
            self.transform = SpectralTransform::new(window_length, taper)?;
            self.frames.iter_mut().for_each(|f| *f = None);
        }
        self.frames.resize(channel_count, None);
        Ok(())
    }

    /// Samples each transform consumes
    pub fn window_length(&self) -> usize {
        self.transform.window_length()
    }

    /// Release cached plans and buffers
    pub fn reclaim(&mut self) {
        self.transform.reclaim();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn sine(len: usize, rate: f64, frequency: f64, amplitude: f64) -> Vec<f64> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * frequency * i as f64 / rate).sin())
            .collect()
    }

    #[test]
    fn test_spectrum_length_and_peak() {
        let mut transform = SpectralTransform::new(256, Taper::Rectangular).unwrap();
        let samples = sine(256, 256.0, 10.0, 2.0);
        let frame = transform.transform(3, &samples, 256.0).unwrap();

        assert_eq!(frame.len(), 129);
        assert_eq!(frame.channel, 3);
        let peak = frame.peak().unwrap();
        assert_relative_eq!(peak.frequency, 10.0);
        // Unnormalized: amplitude × N / 2
        assert_relative_eq!(peak.magnitude, 256.0, epsilon = 1e-6);
        assert_relative_eq!(frame.bins[128].frequency, 128.0);
    }

    #[test]
    fn test_odd_window_length() {
        let mut transform = SpectralTransform::new(7, Taper::Hann).unwrap();
        let frame = transform.transform(0, &[1.0; 7], 7.0).unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(transform.bin_count(), 4);
    }

    #[test]
    fn test_uses_trailing_window() {
        let mut transform = SpectralTransform::new(4, Taper::Rectangular).unwrap();
        let frame = transform
            .transform(0, &[100.0, 100.0, 1.0, 1.0, 1.0, 1.0], 4.0)
            .unwrap();
        assert_relative_eq!(frame.bins[0].magnitude, 4.0, epsilon = 1e-9);
        assert_relative_eq!(frame.bins[1].magnitude, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_insufficient_window() {
        let mut transform = SpectralTransform::new(64, Taper::Rectangular).unwrap();
        let result = transform.transform(0, &[0.0; 10], 250.0);
        assert_eq!(
            result,
            Err(StreamError::InsufficientWindow {
                required: 64,
                available: 10
            })
        );
        assert!(SpectralTransform::new(1, Taper::Hann).is_err());
    }

    #[test]
    fn test_taper_coefficients() {
        let hann = Taper::Hann.coefficients(5);
        assert_relative_eq!(hann[0], 0.0);
        assert_relative_eq!(hann[2], 1.0);
        assert_relative_eq!(hann[4], 0.0, epsilon = 1e-12);

        let hamming = Taper::Hamming.coefficients(5);
        assert_relative_eq!(hamming[0], 0.08, epsilon = 1e-12);
        assert!(Taper::Rectangular.coefficients(8).iter().all(|&c| c == 1.0));
    }

    #[test]
    fn test_bank_retains_last_frame() {
        let mut bank = SpectralBank::new(2, 8, Taper::Rectangular).unwrap();

        assert_eq!(bank.update(0, &[1.0; 4], 8.0), SpectralOutput::NoData);

        let fresh = bank.update(0, &[1.0; 8], 8.0);
        assert!(fresh.is_fresh());
        let first = fresh.frame().cloned().unwrap();

        match bank.update(0, &[1.0; 3], 8.0) {
            SpectralOutput::Retained(frame) => assert_eq!(frame, &first),
            other => panic!("expected retained frame, got {:?}", other),
        }

        bank.forget(0);
        assert!(bank.frame(0).is_none());
        assert_eq!(bank.update(9, &[1.0; 8], 8.0), SpectralOutput::NoData);
    }

    #[test]
    fn test_bank_reconfigure_and_reclaim() {
        let mut bank = SpectralBank::new(1, 8, Taper::Rectangular).unwrap();
        bank.update(0, &[1.0; 8], 8.0);
        assert!(bank.frame(0).is_some());

        bank.reclaim();
        assert!(bank.update(0, &[1.0; 8], 8.0).is_fresh());

        bank.reconfigure(2, 16, Taper::Hann).unwrap();
        assert!(bank.frame(0).is_none());
        assert_eq!(bank.window_length(), 16);
        assert!(bank.update(1, &[1.0; 16], 16.0).is_fresh());
    }

    proptest! {
        #[test]
        fn prop_parseval_and_bin_count(
            samples in prop::collection::vec(-100.0f64..100.0, 2..128),
        ) {
            let n = samples.len();
            let mut transform = SpectralTransform::new(n, Taper::Rectangular).unwrap();
            let frame = transform.transform(0, &samples, 100.0).unwrap();

            prop_assert_eq!(frame.len(), n / 2 + 1);

            // Parseval for a real signal: full-spectrum energy from the half spectrum
            let time_energy: f64 = samples.iter().map(|x| x * x).sum();
            let mut freq_energy = 0.0;
            for (k, bin) in frame.bins.iter().enumerate() {
                let mirrored = k != 0 && !(n % 2 == 0 && k == n / 2);
                let weight = if mirrored { 2.0 } else { 1.0 };
                freq_energy += weight * bin.magnitude * bin.magnitude;
            }
            prop_assert!((freq_energy / n as f64 - time_energy).abs() <= 1e-6 * time_energy.max(1.0));
        }
    }
}
