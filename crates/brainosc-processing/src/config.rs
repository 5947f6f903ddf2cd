//! Configuration management for the signal pipeline
//!
//! A [`PipelineConfig`] is a plain value: the orchestrator owns one and never
//! reads any other mid-cycle. External actors stage replacements through a
//! [`ConfigHandle`]; the orchestrator swaps a staged snapshot in at the next
//! cycle boundary.

use crate::dispatch::{DispatchMode, PathTemplate};
use crate::kalman::KalmanParams;
use crate::selection::ChannelSelection;
use crate::spectral::Taper;
use brainosc_core::{config_error, SampleBuffer, StreamResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Most channels a pipeline accepts
pub const MAX_CHANNELS: usize = 1024;

/// Ceiling on buffered samples across all channels
pub const MAX_BUFFER_SAMPLES: usize = 1 << 24;

/// Longest spectral window
pub const MAX_FFT_WINDOW: usize = 1 << 16;

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Configuration name/profile
    pub name: String,
    /// Channels delivered by the upstream producer
    pub channel_count: usize,
    /// Uniform output rate of the resampler (Hz)
    pub target_rate: f64,
    /// Upper bound accepted for `target_rate` (Hz)
    pub max_target_rate: f64,
    /// Highest device rate expected, used to size the sample buffer (Hz)
    pub max_expected_rate: f64,
    /// Length of the active processing window (seconds)
    pub window_duration: f64,
    /// Adaptive filter settings
    pub kalman: KalmanConfig,
    /// Spectral transform settings
    pub fft: FftConfig,
    /// Channel routing
    pub channels: ChannelConfig,
    /// Outbound OSC settings
    pub osc: OscConfig,
    /// Periodic maintenance
    pub maintenance: MaintenanceConfig,
    /// Fault thresholds
    pub faults: FaultConfig,
}

/// Kalman filter bank settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Apply the filter; when off, resampled values pass through unchanged
    pub enabled: bool,
    /// Variance added by each predict step
    pub process_noise: f64,
    /// Assumed variance of each measurement
    pub measurement_noise: f64,
    /// Estimate a fresh filter starts from
    pub initial_estimate: f64,
    /// Variance a fresh filter starts from
    pub initial_covariance: f64,
    /// Lower clamp for the estimate variance
    pub variance_floor: f64,
    /// Magnitude beyond which estimate or variance count as diverged
    pub divergence_limit: f64,
}

/// Spectral transform settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FftConfig {
    /// Run the transform every cycle
    pub enabled: bool,
    /// Number of trailing filtered samples transformed
    pub window_length: usize,
    /// Taper applied before transforming
    pub taper: Taper,
}

/// Channel routing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channels fed through the filter bank
    pub selected: BTreeSet<usize>,
    /// Channels fed through the spectral transform; defaults to `selected`
    pub fft: Option<BTreeSet<usize>>,
}

/// Outbound OSC settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    /// Receiver host
    pub address: String,
    /// Receiver UDP port
    pub port: u16,
    /// Per-channel address template with `{n}` and `{domain}` placeholders
    pub path_template: String,
    /// Outbound channel expression: `*` or names like `chan1 fft_chan2`
    pub channels: String,
    /// One message per channel and domain, or one bundled message per cycle
    pub mode: DispatchMode,
    /// Address used in bundled mode
    pub bundle_address: String,
}

/// Periodic maintenance settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Run buffer and transform reclamation every this many cycles
    pub reclaim_every_cycles: u64,
}

/// Thresholds that move the orchestrator to `Faulted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Consecutive cycles in which every send failed
    pub max_transport_failure_cycles: u32,
    /// Consecutive cycles with no new samples
    pub max_acquisition_gap_cycles: u32,
}

impl PipelineConfig {
    /// EEG streaming defaults: 4 channels at 250 Hz, per-channel OSC messages
    pub fn eeg_default() -> Self {
        PipelineConfig {
            name: "EEG default".to_string(),
            channel_count: 4,
            target_rate: 250.0,
            max_target_rate: 2_000.0,
            max_expected_rate: 250.0,
            window_duration: 1.0,
            kalman: KalmanConfig::default(),
            fft: FftConfig::default(),
            channels: ChannelConfig::all(4),
            osc: OscConfig::default(),
            maintenance: MaintenanceConfig::default(),
            faults: FaultConfig::default(),
        }
    }

    /// Wekinator-style output: unfiltered values bundled into a single
    /// `/wek/inputs` message on port 6448
    pub fn wekinator() -> Self {
        let mut config = Self::eeg_default();
        config.name = "Wekinator".to_string();
        config.kalman.enabled = false;
        config.osc.mode = DispatchMode::Bundled;
        config.osc.port = 6448;
        config.osc.bundle_address = "/wek/inputs".to_string();
        config
    }

    /// Validate entire configuration
    pub fn validate(&self) -> StreamResult<()> {
        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(config_error!(
                "channel_count must be in 1..={}, got {}",
                MAX_CHANNELS,
                self.channel_count
            ));
        }

        require_positive("max_target_rate", self.max_target_rate)?;
        require_positive("target_rate", self.target_rate)?;
        if self.target_rate > self.max_target_rate {
            return Err(config_error!(
                "target_rate {} Hz exceeds max_target_rate {} Hz",
                self.target_rate,
                self.max_target_rate
            ));
        }
        require_positive("max_expected_rate", self.max_expected_rate)?;
        require_positive("window_duration", self.window_duration)?;
        let buffered = (self.window_duration * self.max_expected_rate).ceil() * self.channel_count as f64;
        if buffered > MAX_BUFFER_SAMPLES as f64 {
            return Err(config_error!(
                "window_duration × max_expected_rate × channel_count is {} samples, above the limit of {}",
                buffered,
                MAX_BUFFER_SAMPLES
            ));
        }

        self.kalman.params().validate()?;

        if !(2..=MAX_FFT_WINDOW).contains(&self.fft.window_length) {
            return Err(config_error!(
                "fft.window_length must be in 2..={}, got {}",
                MAX_FFT_WINDOW,
                self.fft.window_length
            ));
        }

        if self.maintenance.reclaim_every_cycles == 0 {
            return Err(config_error!("maintenance.reclaim_every_cycles must be greater than 0"));
        }
        if self.faults.max_transport_failure_cycles == 0 || self.faults.max_acquisition_gap_cycles == 0 {
            return Err(config_error!("fault thresholds must be greater than 0"));
        }

        self.osc.validate()?;
        self.selection()?;

        Ok(())
    }

    /// Resolve the channel routing this configuration describes
    pub fn selection(&self) -> StreamResult<ChannelSelection> {
        ChannelSelection::resolve(
            self.channel_count,
            &self.channels.selected,
            self.channels.fft.as_ref(),
            &self.osc.channels,
            self.fft.enabled,
        )
    }

    /// Filter parameters
    pub fn kalman_params(&self) -> KalmanParams {
        self.kalman.params()
    }

    /// Per-channel ring capacity: `ceil(window_duration × max_expected_rate)`
    pub fn buffer_capacity(&self) -> usize {
        SampleBuffer::capacity_for(self.window_duration, self.max_expected_rate)
    }

    /// Active window as a duration
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_duration)
    }

    /// Export configuration to JSON
    pub fn to_json(&self) -> StreamResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| config_error!("Failed to serialize configuration: {}", e))
    }

    /// Import configuration from JSON; missing keys take their defaults
    pub fn from_json(json: &str) -> StreamResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| config_error!("Failed to deserialize configuration: {}", e))
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| config_error!("Failed to read {}: {}", path.display(), e))?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> StreamResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .map_err(|e| config_error!("Failed to write {}: {}", path.display(), e))
    }
}

fn require_positive(name: &str, value: f64) -> StreamResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(config_error!("{} must be a positive number, got {}", name, value))
    }
}

impl KalmanConfig {
    /// Numeric filter parameters
    pub fn params(&self) -> KalmanParams {
        KalmanParams {
            process_noise: self.process_noise,
            measurement_noise: self.measurement_noise,
            initial_estimate: self.initial_estimate,
            initial_covariance: self.initial_covariance,
            variance_floor: self.variance_floor,
            divergence_limit: self.divergence_limit,
        }
    }
}

impl ChannelConfig {
    /// Select channels `0..channel_count`
    pub fn all(channel_count: usize) -> Self {
        Self {
            selected: (0..channel_count).collect(),
            fft: None,
        }
    }
}

impl OscConfig {
    /// Check address, port and templates
    pub fn validate(&self) -> StreamResult<()> {
        if self.address.trim().is_empty() {
            return Err(config_error!("osc.address must not be empty"));
        }
        if self.port == 0 {
            return Err(config_error!("osc.port must be greater than 0"));
        }
        PathTemplate::parse(&self.path_template)?;
        if self.mode == DispatchMode::Bundled && !self.bundle_address.starts_with('/') {
            return Err(config_error!(
                "osc.bundle_address must start with '/', got '{}'",
                self.bundle_address
            ));
        }
        Ok(())
    }

    /// `host:port` target string
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::eeg_default()
    }
}

impl Default for KalmanConfig {
    fn default() -> Self {
        let params = KalmanParams::default();
        KalmanConfig {
            enabled: true,
            process_noise: params.process_noise,
            measurement_noise: params.measurement_noise,
            initial_estimate: params.initial_estimate,
            initial_covariance: params.initial_covariance,
            variance_floor: params.variance_floor,
            divergence_limit: params.divergence_limit,
        }
    }
}

impl Default for FftConfig {
    fn default() -> Self {
        FftConfig {
            enabled: false,
            window_length: 256,
            taper: Taper::Rectangular,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::all(4)
    }
}

impl Default for OscConfig {
    fn default() -> Self {
        OscConfig {
            address: "127.0.0.1".to_string(),
            port: 9000,
            path_template: "/eeg/ch{n}/{domain}".to_string(),
            channels: "*".to_string(),
            mode: DispatchMode::PerChannel,
            bundle_address: "/wek/inputs".to_string(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        // 24 s at the bridge's 25 Hz cycle clock
        MaintenanceConfig {
            reclaim_every_cycles: 600,
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        FaultConfig {
            max_transport_failure_cycles: 50,
            max_acquisition_gap_cycles: 500,
        }
    }
}

#[derive(Debug)]
struct StagedConfig {
    active: PipelineConfig,
    pending: Option<PipelineConfig>,
}

/// Cloneable handle for staging configuration updates from outside the
/// cycle. Submissions are validated immediately; invalid ones are rejected
/// and leave both the active and any already-staged configuration untouched.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    shared: Arc<Mutex<StagedConfig>>,
}

impl ConfigHandle {
    pub(crate) fn new(active: PipelineConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(StagedConfig {
                active,
                pending: None,
            })),
        }
    }

    /// Stage a complete replacement configuration
    pub fn submit(&self, config: PipelineConfig) -> StreamResult<()> {
        config.validate()?;
        let mut staged = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        staged.pending = Some(config);
        Ok(())
    }

    /// Stage a modification of the most recent configuration (staged or
    /// active), e.g. retuning a single parameter
    pub fn modify<F>(&self, change: F) -> StreamResult<()>
    where
        F: FnOnce(&mut PipelineConfig),
    {
        let mut staged = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = staged.pending.clone().unwrap_or_else(|| staged.active.clone());
        change(&mut next);
        next.validate()?;
        staged.pending = Some(next);
        Ok(())
    }

    /// Most recent configuration, staged or active
    pub fn current(&self) -> PipelineConfig {
        let staged = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        staged.pending.clone().unwrap_or_else(|| staged.active.clone())
    }

    /// Configuration the pipeline is currently running with
    pub fn active(&self) -> PipelineConfig {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
            .clone()
    }

    /// Whether a snapshot is waiting for the next cycle boundary
    pub fn has_pending(&self) -> bool {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .is_some()
    }

    /// Take the staged snapshot without blocking. Returns `None` when nothing
    /// is staged or the handle is momentarily held by a submitter.
    ///
    /// A snapshot that passes validation becomes the active one in the same
    /// critical section.
    pub(crate) fn try_take(&self) -> Option<StreamResult<PipelineConfig>> {
        let mut staged = match self.shared.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        let candidate = staged.pending.take()?;
        Some(match candidate.validate() {
            Ok(()) => {
                staged.active = candidate.clone();
                Ok(candidate)
            }
            Err(e) => Err(e),
        })
    }

    /// Restore the active snapshot after a failed apply
    pub(crate) fn restore_active(&self, config: PipelineConfig) {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner).active = config;
    }
}
