//! Pipeline state, per-cycle reports and running counters

use crate::dispatch::DispatchReport;
use brainosc_core::{BufferStats, StreamError};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    /// Not streaming; cycles are no-ops
    Idle,
    /// Running every stage each cycle
    Streaming,
    /// Applying a staged configuration at a cycle boundary
    Reconfiguring,
    /// Buffering only; processing and sending are suspended until reset
    Faulted,
}

impl PipelineState {
    /// Whether processing stages run in this state
    pub fn is_processing(&self) -> bool {
        matches!(self, PipelineState::Streaming)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Streaming => "streaming",
            PipelineState::Reconfiguring => "reconfiguring",
            PipelineState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Running count of every contained error, by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounters {
    pub configuration: u64,
    pub acquisition_gap: u64,
    pub insufficient_window: u64,
    pub transport: u64,
    pub filter_divergence: u64,
    pub channel_out_of_range: u64,
    pub stale_sample: u64,
    /// Cycles that panicked and were contained
    pub panics: u64,
}

impl ErrorCounters {
    /// Count one error under its kind
    pub fn record(&mut self, error: &StreamError) {
        match error {
            StreamError::Configuration { .. } => self.configuration += 1,
            StreamError::AcquisitionGap { .. } => self.acquisition_gap += 1,
            StreamError::InsufficientWindow { .. } => self.insufficient_window += 1,
            StreamError::Transport { .. } => self.transport += 1,
            StreamError::FilterDivergence { .. } => self.filter_divergence += 1,
            StreamError::ChannelOutOfRange { .. } => self.channel_out_of_range += 1,
            StreamError::StaleSample { .. } => self.stale_sample += 1,
        }
    }

    /// Sum over every kind
    pub fn total(&self) -> u64 {
        self.configuration
            + self.acquisition_gap
            + self.insufficient_window
            + self.transport
            + self.filter_divergence
            + self.channel_out_of_range
            + self.stale_sample
            + self.panics
    }
}

/// Wall-clock time spent in each stage of one cycle, in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub ingest_us: u64,
    pub resample_filter_us: u64,
    pub spectral_us: u64,
    pub dispatch_us: u64,
    pub total_us: u64,
}

/// Helper for timing stages of a cycle
pub(crate) struct StageTimer {
    cycle_start: Instant,
    stage_start: Instant,
}

impl StageTimer {
    pub(crate) fn start() -> Self {
        let now = Instant::now();
        Self {
            cycle_start: now,
            stage_start: now,
        }
    }

    /// Microseconds since the previous lap
    pub(crate) fn lap(&mut self) -> u64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.stage_start).as_micros() as u64;
        self.stage_start = now;
        elapsed
    }

    /// Microseconds since the cycle started
    pub(crate) fn total(&self) -> u64 {
        self.cycle_start.elapsed().as_micros() as u64
    }
}

/// What one call to `run_cycle` did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Cycle sequence number, starting at 1
    pub cycle: u64,
    /// State at the end of the cycle
    pub state: PipelineState,
    /// Samples accepted into the buffer
    pub ingested: usize,
    /// Samples the buffer rejected
    pub rejected: usize,
    /// Resampled ticks folded into the filters, summed over channels
    pub new_ticks: usize,
    /// Latest output per filtered channel, ascending by channel
    pub filtered: Vec<(usize, f64)>,
    /// Spectra computed this cycle
    pub fresh_spectra: usize,
    /// No new samples arrived; outputs are re-sent from the previous cycle
    pub stale: bool,
    /// A staged configuration was applied at the start of this cycle
    pub reconfigured: bool,
    /// Samples dropped by periodic reclamation, when it ran
    pub reclaimed: Option<usize>,
    /// Delivery summary
    pub dispatch: DispatchReport,
    /// Errors contained during the cycle
    pub errors: Vec<StreamError>,
    /// Stage timings
    pub timings: StageTimings,
}

impl CycleReport {
    pub(crate) fn new(cycle: u64, state: PipelineState) -> Self {
        Self {
            cycle,
            state,
            ingested: 0,
            rejected: 0,
            new_ticks: 0,
            filtered: Vec::new(),
            fresh_spectra: 0,
            stale: false,
            reconfigured: false,
            reclaimed: None,
            dispatch: DispatchReport::default(),
            errors: Vec::new(),
            timings: StageTimings::default(),
        }
    }

    /// Filtered output of one channel, if produced
    pub fn filtered_value(&self, channel: usize) -> Option<f64> {
        self.filtered
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|&(_, value)| value)
    }
}

/// Snapshot of the orchestrator's health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Identifies this orchestrator instance in logs
    pub session_id: Uuid,
    pub state: PipelineState,
    /// Why the orchestrator is faulted, if it is
    pub fault_reason: Option<String>,
    /// Cycles run
    pub cycles: u64,
    /// Messages delivered
    pub messages_sent: u64,
    /// Current run of cycles without new samples
    pub consecutive_gaps: u32,
    /// Current run of cycles in which every send failed
    pub consecutive_transport_failures: u32,
    /// Configurations applied since creation
    pub reconfigurations: u64,
    pub source_connected: bool,
    pub errors: ErrorCounters,
    pub buffer: BufferStats,
    /// Timings of the most recent cycle
    pub last_cycle: StageTimings,
}

impl PipelineStatus {
    pub(crate) fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            state: PipelineState::Idle,
            fault_reason: None,
            cycles: 0,
            messages_sent: 0,
            consecutive_gaps: 0,
            consecutive_transport_failures: 0,
            reconfigurations: 0,
            source_connected: false,
            errors: ErrorCounters::default(),
            buffer: BufferStats::default(),
            last_cycle: StageTimings::default(),
        }
    }

    /// Whether the orchestrator needs a reset to resume processing
    pub fn is_faulted(&self) -> bool {
        self.state == PipelineState::Faulted
    }
}
