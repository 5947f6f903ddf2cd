//! Synthetic EEG acquisition board
//!
//! Produces multi-channel samples with realistic noise, mains interference,
//! occasional blink artifacts and slightly irregular timestamps, so the
//! pipeline can be exercised without hardware.

use crate::signal_patterns::SignalPattern;
use brainosc_core::{config_error, Sample, SampleSource, StreamResult, Timestamp};
use rand::prelude::*;
use rand_distr::{Normal, Uniform};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Synthetic board configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    /// Nominal sampling rate in Hz
    pub sampling_rate: f64,
    /// Number of electrodes
    pub channel_count: usize,
    /// Rhythm shared by every channel
    pub pattern: SignalPattern,
    /// Noise and artifacts
    pub noise: NoiseConfig,
    /// Timestamp jitter as a fraction of the sample period, below 0.5
    pub jitter: f64,
    /// Random seed for reproducible runs
    pub seed: Option<u64>,
}

/// Noise characteristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Standard deviation of white noise, µV
    pub gaussian_std: f64,
    /// Mains interference amplitude, µV
    pub powerline_amplitude: f64,
    /// Mains frequency (50 or 60 Hz)
    pub powerline_frequency: f64,
    /// Probability per sample frame of starting a blink artifact
    pub blink_probability: f64,
    /// Peak blink amplitude, µV
    pub blink_amplitude: f64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 250.0,
            channel_count: 4,
            pattern: SignalPattern::default(),
            noise: NoiseConfig::default(),
            jitter: 0.1,
            seed: None,
        }
    }
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            gaussian_std: 2.0,
            powerline_amplitude: 1.0,
            powerline_frequency: 50.0,
            blink_probability: 0.0005,
            blink_amplitude: 80.0,
        }
    }
}

impl BoardConfig {
    /// Check rates and counts before building a board
    pub fn validate(&self) -> StreamResult<()> {
        if !(self.sampling_rate.is_finite() && self.sampling_rate > 0.0) {
            return Err(config_error!("sampling_rate must be positive, got {}", self.sampling_rate));
        }
        if self.channel_count == 0 {
            return Err(config_error!("channel_count must be at least 1"));
        }
        if !(0.0..0.5).contains(&self.jitter) {
            return Err(config_error!("jitter must be in [0, 0.5), got {}", self.jitter));
        }
        if !(self.noise.gaussian_std.is_finite() && self.noise.gaussian_std >= 0.0) {
            return Err(config_error!("gaussian_std must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.noise.blink_probability) {
            return Err(config_error!("blink_probability must be in [0, 1]"));
        }
        Ok(())
    }
}

/// How many samples a pull produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// Whatever the wall clock says has been acquired since the last pull
    RealTime,
    /// A fixed number of sample frames per pull, independent of time
    FixedStep { frames_per_pull: usize },
}

/// Blink duration in seconds
const BLINK_DURATION: f64 = 0.3;

/// Simulated EEG board
pub struct SyntheticBoard {
    config: BoardConfig,
    pacing: Pacing,
    rng: StdRng,
    noise: Normal<f64>,
    jitter: Uniform<f64>,
    /// Index of the next sample frame
    next_frame: u64,
    /// Wall-clock reference for real-time pacing
    started: Option<Instant>,
    connected: bool,
    /// Start time of the current blink, seconds
    blink_start: Option<f64>,
}

impl SyntheticBoard {
    /// Create a board producing frames as fast as the wall clock allows
    pub fn new(config: BoardConfig) -> StreamResult<Self> {
        Self::with_pacing(config, Pacing::RealTime)
    }

    /// Create a board with explicit pacing
    pub fn with_pacing(config: BoardConfig, pacing: Pacing) -> StreamResult<Self> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let noise = Normal::new(0.0, config.noise.gaussian_std)
            .map_err(|e| config_error!("invalid noise distribution: {}", e))?;

        info!(
            channels = config.channel_count,
            rate = config.sampling_rate,
            pattern = config.pattern.description(),
            "synthetic board ready"
        );

        Ok(Self {
            config,
            pacing,
            rng,
            noise,
            jitter: Uniform::new_inclusive(-1.0, 1.0),
            next_frame: 0,
            started: None,
            connected: true,
            blink_start: None,
        })
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Change pacing; the acquisition clock carries over
    pub fn set_pacing(&mut self, pacing: Pacing) {
        self.pacing = pacing;
        // Anchor the wall clock so real-time pacing resumes at the next frame
        self.started = Instant::now().checked_sub(Duration::from_secs_f64(self.current_time()));
    }

    /// Acquisition time of the next frame, without jitter
    pub fn current_time(&self) -> f64 {
        self.next_frame as f64 / self.config.sampling_rate
    }

    /// Frames generated so far, including those skipped while disconnected
    pub fn frames_generated(&self) -> u64 {
        self.next_frame
    }

    /// Generate `frames` sample frames, one sample per channel each.
    ///
    /// Samples are ordered by frame, then by channel.
    pub fn generate(&mut self, frames: usize) -> Vec<Sample> {
        let channels = self.config.channel_count;
        let period = 1.0 / self.config.sampling_rate;
        let mut samples = Vec::with_capacity(frames * channels);

        for _ in 0..frames {
            let nominal = self.next_frame as f64 * period;
            let offset = if self.config.jitter > 0.0 {
                self.config.jitter * period * self.jitter.sample(&mut self.rng)
            } else {
                0.0
            };
            let timestamp = Timestamp::from_secs_f64(nominal + offset);

            self.update_blink(nominal);
            let blink = self.blink_at(nominal);
            let mains = self.config.noise.powerline_amplitude
                * (2.0 * PI * self.config.noise.powerline_frequency * nominal).sin();

            for channel in 0..channels {
                let mut value = self.config.pattern.value_at(nominal, channel) + mains;
                // Frontal electrodes see the blink strongest
                value += blink / (channel + 1) as f64;
                if self.config.noise.gaussian_std > 0.0 {
                    value += self.noise.sample(&mut self.rng);
                }
                samples.push(Sample::new(channel, value, timestamp));
            }

            self.next_frame += 1;
        }

        samples
    }

    fn update_blink(&mut self, time: f64) {
        if let Some(start) = self.blink_start {
            if time - start >= BLINK_DURATION {
                self.blink_start = None;
            }
        }
        if self.blink_start.is_none()
            && self.config.noise.blink_probability > 0.0
            && self.rng.gen_bool(self.config.noise.blink_probability)
        {
            self.blink_start = Some(time);
        }
    }

    fn blink_at(&self, time: f64) -> f64 {
        match self.blink_start {
            Some(start) => {
                let position = (time - start) / BLINK_DURATION;
                self.config.noise.blink_amplitude * (PI * position).sin().max(0.0)
            }
            None => 0.0,
        }
    }

    /// Frames the wall clock says are due but not yet generated
    fn due_frames(&mut self) -> usize {
        let started = *self.started.get_or_insert_with(Instant::now);
        let elapsed = started.elapsed().as_secs_f64();
        let due = (elapsed * self.config.sampling_rate).floor() as u64;
        due.saturating_sub(self.next_frame) as usize
    }

    /// Simulate the device dropping off; pulls return nothing until reconnected
    pub fn disconnect(&mut self) {
        if self.connected {
            info!(frame = self.next_frame, "synthetic board disconnected");
        }
        self.connected = false;
    }

    /// Reconnect. In real-time pacing the frames missed while disconnected
    /// are skipped, leaving a gap in the timestamps as a real device would.
    pub fn connect(&mut self) {
        if self.connected {
            return;
        }
        if self.pacing == Pacing::RealTime && self.started.is_some() {
            let skipped = self.due_frames();
            self.next_frame += skipped as u64;
            debug!(skipped, "frames lost while disconnected");
        }
        self.connected = true;
        info!(frame = self.next_frame, "synthetic board reconnected");
    }

    /// Replace the rhythm without touching the clock
    pub fn set_pattern(&mut self, pattern: SignalPattern) {
        self.config.pattern = pattern;
    }

    /// Replace the configuration.
    ///
    /// A changed sampling rate keeps the clock running: the next frame is
    /// the first one on the new grid at or after the current time.
    pub fn update_config(&mut self, config: BoardConfig) -> StreamResult<()> {
        config.validate()?;
        self.noise = Normal::new(0.0, config.noise.gaussian_std)
            .map_err(|e| config_error!("invalid noise distribution: {}", e))?;
        if let Some(seed) = config.seed {
            if self.config.seed != Some(seed) {
                self.rng = StdRng::seed_from_u64(seed);
            }
        }
        let now = self.current_time();
        let rate_changed = config.sampling_rate != self.config.sampling_rate;
        self.config = config;
        if rate_changed {
            self.next_frame = (now * self.config.sampling_rate).ceil() as u64;
            if self.started.is_some() {
                self.started = Instant::now().checked_sub(Duration::from_secs_f64(self.current_time()));
            }
            debug!(rate = self.config.sampling_rate, time = now, "sampling rate changed");
        }
        Ok(())
    }
}

impl SampleSource for SyntheticBoard {
    fn pull(&mut self) -> Vec<Sample> {
        if !self.connected {
            return Vec::new();
        }
        let frames = match self.pacing {
            Pacing::RealTime => self.due_frames(),
            Pacing::FixedStep { frames_per_pull } => frames_per_pull,
        };
        self.generate(frames)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn channel_count(&self) -> usize {
        self.config.channel_count
    }
}

impl std::fmt::Debug for SyntheticBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticBoard")
            .field("config", &self.config)
            .field("pacing", &self.pacing)
            .field("next_frame", &self.next_frame)
            .field("connected", &self.connected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> BoardConfig {
        BoardConfig {
            seed: Some(42),
            noise: NoiseConfig {
                gaussian_std: 0.0,
                powerline_amplitude: 0.0,
                blink_probability: 0.0,
                ..Default::default()
            },
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_frames() {
        let mut board = SyntheticBoard::new(BoardConfig {
            seed: Some(1),
            ..Default::default()
        })
        .unwrap();

        let samples = board.generate(250);
        assert_eq!(samples.len(), 250 * 4);
        assert_eq!(board.frames_generated(), 250);
        assert!((board.current_time() - 1.0).abs() < 1e-12);
        assert!(samples.iter().all(|s| s.channel < 4 && s.value.is_finite()));
    }

    #[test]
    fn test_seed_is_reproducible() {
        let config = BoardConfig {
            seed: Some(7),
            ..Default::default()
        };
        let a = SyntheticBoard::new(config.clone()).unwrap().generate(100);
        let b = SyntheticBoard::new(config).unwrap().generate(100);
        assert_eq!(a, b);
    }

    #[test]
    fn test_timestamps_increase_per_channel_under_jitter() {
        let mut board = SyntheticBoard::new(BoardConfig {
            seed: Some(3),
            jitter: 0.45,
            ..Default::default()
        })
        .unwrap();

        let samples = board.generate(1000);
        for channel in 0..4 {
            let times: Vec<u64> = samples
                .iter()
                .filter(|s| s.channel == channel)
                .map(|s| s.timestamp.as_nanos())
                .collect();
            assert!(times.windows(2).all(|w| w[0] < w[1]), "channel {}", channel);
        }
    }

    #[test]
    fn test_quiet_board_follows_pattern() {
        let mut config = quiet_config();
        config.pattern = SignalPattern::Constant { level: 12.5 };
        let mut board = SyntheticBoard::new(config).unwrap();
        assert!(board.generate(50).iter().all(|s| s.value == 12.5));
    }

    #[test]
    fn test_fixed_step_pacing() {
        let mut board =
            SyntheticBoard::with_pacing(quiet_config(), Pacing::FixedStep { frames_per_pull: 10 }).unwrap();
        assert_eq!(board.pull().len(), 40);
        assert_eq!(board.pull().len(), 40);
        assert_eq!(board.frames_generated(), 20);
    }

    #[test]
    fn test_disconnected_board_yields_nothing() {
        let mut board =
            SyntheticBoard::with_pacing(quiet_config(), Pacing::FixedStep { frames_per_pull: 5 }).unwrap();
        board.disconnect();
        assert!(!board.is_connected());
        assert!(board.pull().is_empty());

        board.connect();
        assert!(board.is_connected());
        assert_eq!(board.pull().len(), 20);
    }

    #[test]
    fn test_real_time_pacing_follows_clock() {
        let mut board = SyntheticBoard::new(quiet_config()).unwrap();
        assert!(board.pull().is_empty());

        std::thread::sleep(Duration::from_millis(100));
        let frames = board.pull().len() / 4;
        // ~25 frames at 250 Hz; generous bounds for slow CI machines
        assert!((20..=100).contains(&frames), "got {} frames", frames);
    }

    #[test]
    fn test_rate_change_keeps_clock_running() {
        let mut board = SyntheticBoard::new(quiet_config()).unwrap();
        let before = board.generate(100);

        let mut config = board.config().clone();
        config.pattern = SignalPattern::Constant { level: 1.0 };
        board.update_config(config.clone()).unwrap();
        assert_eq!(board.frames_generated(), 100);

        config.sampling_rate = 500.0;
        board.update_config(config).unwrap();
        assert_eq!(board.frames_generated(), 200);
        assert!((board.current_time() - 0.4).abs() < 1e-9);

        let after = board.generate(10);
        let last_before = before.last().unwrap().timestamp;
        assert!(after.iter().all(|s| s.timestamp >= last_before));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BoardConfig {
            jitter: 0.5,
            ..Default::default()
        };
        assert!(SyntheticBoard::new(config).is_err());

        let config = BoardConfig {
            channel_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
