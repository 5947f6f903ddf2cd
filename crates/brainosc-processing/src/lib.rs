//! brainosc-processing: Real-time streaming pipeline for biosignals
//!
//! Resampling onto a uniform grid, per-channel Kalman smoothing, magnitude
//! spectra and OSC delivery, driven one cycle at a time by the
//! [`CycleOrchestrator`].

pub mod config;
pub mod dispatch;
pub mod kalman;
pub mod orchestrator;
pub mod resampler;
pub mod selection;
pub mod spectral;
pub mod status;

pub use config::{
    ChannelConfig, ConfigHandle, FaultConfig, FftConfig, KalmanConfig, MaintenanceConfig,
    OscConfig, PipelineConfig,
};
pub use dispatch::{
    DispatchMode, DispatchReport, Dispatcher, Domain, OscTransport, OutboundMessage, PathTemplate,
    Payload, Transport,
};
pub use kalman::{FilterState, KalmanFilterBank, KalmanParams};
pub use orchestrator::CycleOrchestrator;
pub use resampler::Resampler;
pub use selection::ChannelSelection;
pub use spectral::{SpectralBank, SpectralOutput, SpectralTransform, Taper};
pub use status::{CycleReport, ErrorCounters, PipelineState, PipelineStatus, StageTimings};
