//! Per-cycle orchestration of the streaming pipeline
//!
//! One call to [`CycleOrchestrator::run_cycle`] performs, in order:
//!
//! 1. apply a staged configuration, if one is waiting
//! 2. pull and ingest new samples
//! 3. resample the active window and filter ticks not seen before
//! 4. transform each spectral channel's filtered history
//! 5. send the cycle's messages
//! 6. every `reclaim_every_cycles` cycles, reclaim buffer and FFT memory
//!
//! Every failure inside a cycle is contained and counted. A panic in any
//! stage is caught, so `run_cycle` always returns a report and the next
//! cycle runs normally.
//!
//! While `Faulted`, cycles keep ingesting and reclaiming but skip
//! processing and sending until [`CycleOrchestrator::reset`].

use crate::config::{ConfigHandle, PipelineConfig};
use crate::dispatch::{Dispatcher, Transport};
use crate::kalman::{FilterState, KalmanFilterBank};
use crate::resampler::Resampler;
use crate::selection::ChannelSelection;
use crate::spectral::{SpectralBank, SpectralOutput};
use crate::status::{CycleReport, ErrorCounters, PipelineState, PipelineStatus, StageTimer};
use brainosc_core::{SampleBuffer, SampleSource, SpectralFrame, StreamError, StreamResult};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors kept on a single report; counters are never capped
const MAX_REPORTED_ERRORS: usize = 64;

/// Progress and output history of one channel
#[derive(Debug, Clone, Default)]
struct ChannelTrack {
    /// Highest tick already folded into the filter
    last_tick: Option<i64>,
    /// Trailing filtered outputs for the spectral transform
    history: VecDeque<f64>,
    /// Most recent output
    latest: Option<f64>,
}

impl ChannelTrack {
    fn push(&mut self, tick: i64, value: f64, history_len: usize) {
        self.last_tick = Some(tick);
        self.latest = Some(value);
        if history_len == 0 {
            return;
        }
        if self.history.len() >= history_len {
            self.history.pop_front();
        }
        self.history.push_back(value);
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Drives the pipeline one cycle at a time
pub struct CycleOrchestrator<S, T> {
    config: PipelineConfig,
    selection: ChannelSelection,
    handle: ConfigHandle,
    source: S,
    transport: T,
    buffer: SampleBuffer,
    resampler: Resampler,
    filters: KalmanFilterBank,
    spectra: SpectralBank,
    dispatcher: Dispatcher,
    tracks: Vec<ChannelTrack>,
    state: PipelineState,
    status: PipelineStatus,
    cycle: u64,
}

impl<S: SampleSource, T: Transport> CycleOrchestrator<S, T> {
    /// Build an idle orchestrator. Fails only if `config` is invalid.
    pub fn new(config: PipelineConfig, source: S, transport: T) -> StreamResult<Self> {
        config.validate()?;

        let channel_count = config.channel_count;
        let selection = config.selection()?;
        let mut filters = KalmanFilterBank::new(channel_count, config.kalman_params());
        if config.kalman.enabled {
            filters.sync_selection(&selection.filtered);
        }

        if source.channel_count() != channel_count {
            warn!(
                source_channels = source.channel_count(),
                configured = channel_count,
                "source channel count differs from configuration"
            );
        }

        let session_id = Uuid::new_v4();
        info!(
            session = %session_id,
            profile = %config.name,
            channels = channel_count,
            target_rate = config.target_rate,
            "pipeline created"
        );

        Ok(Self {
            buffer: SampleBuffer::new(channel_count, config.buffer_capacity()),
            resampler: Resampler::new(config.target_rate)?,
            spectra: SpectralBank::new(channel_count, config.fft.window_length, config.fft.taper)?,
            dispatcher: Dispatcher::from_config(&config.osc)?,
            tracks: vec![ChannelTrack::default(); channel_count],
            handle: ConfigHandle::new(config.clone()),
            status: PipelineStatus::new(session_id),
            state: PipelineState::Idle,
            cycle: 0,
            filters,
            selection,
            config,
            source,
            transport,
        })
    }

    /// Begin streaming. Has no effect while faulted; use [`reset`](Self::reset).
    pub fn start(&mut self) {
        match self.state {
            PipelineState::Idle => {
                self.state = PipelineState::Streaming;
                info!(session = %self.status.session_id, "streaming started");
            }
            PipelineState::Faulted => {
                warn!("start ignored while faulted; reset first");
            }
            PipelineState::Streaming | PipelineState::Reconfiguring => {}
        }
    }

    /// Stop streaming from any state
    pub fn stop(&mut self) {
        if self.state != PipelineState::Idle {
            info!(session = %self.status.session_id, cycles = self.cycle, "streaming stopped");
        }
        self.state = PipelineState::Idle;
        self.status.fault_reason = None;
        self.status.consecutive_gaps = 0;
        self.status.consecutive_transport_failures = 0;
    }

    /// Leave `Faulted` and resume streaming
    pub fn reset(&mut self) {
        if self.state == PipelineState::Faulted {
            info!(
                reason = self.status.fault_reason.as_deref().unwrap_or(""),
                "fault cleared, streaming resumed"
            );
            self.state = PipelineState::Streaming;
            self.status.fault_reason = None;
            self.status.consecutive_gaps = 0;
            self.status.consecutive_transport_failures = 0;
        }
    }

    /// Run one cycle. Never panics; every failure ends up in the report
    /// and the status counters.
    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let mut timer = StageTimer::start();
        let mut report = CycleReport::new(self.cycle, self.state);
        report.reconfigured = self.apply_pending_config();

        if self.state != PipelineState::Idle {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                self.run_stages(&mut report, &mut timer)
            }));
            if let Err(payload) = outcome {
                self.status.errors.panics += 1;
                error!(
                    cycle = self.cycle,
                    panic = %panic_message(payload.as_ref()),
                    "cycle panicked; contained"
                );
            }

            if self.cycle % self.config.maintenance.reclaim_every_cycles == 0 {
                report.reclaimed = Some(self.reclaim());
            }
        }

        report.timings.total_us = timer.total();
        report.state = self.state;
        self.status.cycles = self.cycle;
        self.status.last_cycle = report.timings;
        report
    }

    /// Apply a staged configuration now. `run_cycle` calls this at its
    /// start; calling it between cycles is equivalent. Returns whether a
    /// new configuration took effect.
    pub fn apply_pending_config(&mut self) -> bool {
        let Some(staged) = self.handle.try_take() else {
            return false;
        };

        let previous = self.state;
        self.state = PipelineState::Reconfiguring;
        let outcome = staged.and_then(|config| self.apply_config(config));
        self.state = previous;

        match outcome {
            Ok(()) => {
                self.status.reconfigurations += 1;
                info!(
                    profile = %self.config.name,
                    target_rate = self.config.target_rate,
                    "configuration applied"
                );
                true
            }
            Err(e) => {
                self.handle.restore_active(self.config.clone());
                self.status.errors.record(&e);
                warn!(error = %e, "configuration rejected; previous configuration kept");
                false
            }
        }
    }

    fn apply_config(&mut self, config: PipelineConfig) -> StreamResult<()> {
        // Build every fallible piece before touching live state
        let selection = config.selection()?;
        let dispatcher = Dispatcher::from_config(&config.osc)?;
        let resampler = Resampler::new(config.target_rate)?;
        if config.osc.address != self.config.osc.address || config.osc.port != self.config.osc.port {
            self.transport.reconfigure(&config.osc)?;
        }

        let channel_count = config.channel_count;
        self.spectra
            .reconfigure(channel_count, config.fft.window_length, config.fft.taper)?;

        let capacity = config.buffer_capacity();
        if channel_count != self.buffer.channel_count() || capacity != self.buffer.capacity() {
            self.buffer.resize(channel_count, capacity);
        }

        self.filters.resize(channel_count);
        self.filters.set_params(config.kalman_params());
        let created = if config.kalman.enabled {
            self.filters.sync_selection(&selection.filtered)
        } else {
            self.filters.clear();
            Vec::new()
        };
        if !created.is_empty() {
            debug!(channels = ?created, "filter state initialized");
        }

        // Tick indices are only comparable on the same grid
        let grid_changed = resampler != self.resampler;
        let window_changed = config.fft.window_length != self.config.fft.window_length;
        let resampled = selection.resampled();
        self.tracks.resize_with(channel_count, ChannelTrack::default);
        for (channel, track) in self.tracks.iter_mut().enumerate() {
            if grid_changed || !resampled.contains(&channel) {
                track.clear();
            } else if window_changed || !selection.fft.contains(&channel) {
                track.history.clear();
            }
        }
        for channel in 0..channel_count {
            if !selection.fft.contains(&channel) {
                self.spectra.forget(channel);
            }
        }

        self.resampler = resampler;
        self.dispatcher = dispatcher;
        self.selection = selection;
        self.config = config;
        Ok(())
    }

    fn run_stages(&mut self, report: &mut CycleReport, timer: &mut StageTimer) {
        self.ingest(report);
        report.timings.ingest_us = timer.lap();

        if self.state != PipelineState::Streaming {
            return;
        }

        if !report.stale {
            self.resample_and_filter(report);
            report.timings.resample_filter_us = timer.lap();
            self.update_spectra(report);
            report.timings.spectral_us = timer.lap();
        }

        self.dispatch(report);
        report.timings.dispatch_us = timer.lap();
    }

    fn ingest(&mut self, report: &mut CycleReport) {
        let connected = self.source.is_connected();
        self.status.source_connected = connected;
        let samples = if connected { self.source.pull() } else { Vec::new() };

        for sample in samples {
            match self.buffer.ingest(sample) {
                Ok(_) => report.ingested += 1,
                Err(e) => {
                    report.rejected += 1;
                    note(&mut self.status.errors, report, e);
                }
            }
        }
        if report.rejected > 0 {
            debug!(rejected = report.rejected, "samples rejected by buffer");
        }
        self.status.buffer = self.buffer.stats();

        if report.ingested > 0 {
            self.status.consecutive_gaps = 0;
            return;
        }

        self.status.consecutive_gaps += 1;
        report.stale = true;
        let consecutive = self.status.consecutive_gaps;
        note(
            &mut self.status.errors,
            report,
            StreamError::AcquisitionGap { consecutive },
        );
        if consecutive == 1 {
            debug!(connected, "no new samples");
        }
        if consecutive >= self.config.faults.max_acquisition_gap_cycles {
            self.fault(format!("no samples for {} consecutive cycles", consecutive));
        }
    }

    fn resample_and_filter(&mut self, report: &mut CycleReport) {
        let channels = self.selection.resampled();
        let frames = self
            .resampler
            .resample_frames(&self.buffer, &channels, self.config.window());

        if frames.is_empty() && !channels.is_empty() {
            let available = channels.iter().map(|&c| self.buffer.len(c)).max().unwrap_or(0);
            note(
                &mut self.status.errors,
                report,
                StreamError::InsufficientWindow {
                    required: 2,
                    available,
                },
            );
            return;
        }

        let filtering = self.config.kalman.enabled;
        let history_len = self.config.fft.window_length;

        for frame in &frames {
            for &channel in &channels {
                let Some(value) = frame.value(channel) else {
                    continue;
                };
                let track = &mut self.tracks[channel];
                if track.last_tick.is_some_and(|last| frame.tick <= last) {
                    continue;
                }

                let output = if filtering && self.selection.filtered.contains(&channel) {
                    match self.filters.filter(channel, value) {
                        Ok(estimate) => estimate,
                        Err(e) => {
                            warn!(channel, error = %e, "filter diverged; channel reset");
                            track.last_tick = Some(frame.tick);
                            note(&mut self.status.errors, report, e);
                            continue;
                        }
                    }
                } else {
                    value
                };

                let keep = if self.selection.fft.contains(&channel) { history_len } else { 0 };
                track.push(frame.tick, output, keep);
                report.new_ticks += 1;
            }
        }
    }

    fn update_spectra(&mut self, report: &mut CycleReport) {
        let rate = self.resampler.target_rate();
        let required = self.spectra.window_length();

        for &channel in &self.selection.fft {
            let Some(track) = self.tracks.get_mut(channel) else {
                continue;
            };
            let history = track.history.make_contiguous();
            let available = history.len();

            match self.spectra.update(channel, history, rate) {
                SpectralOutput::Fresh(_) => report.fresh_spectra += 1,
                SpectralOutput::Retained(_) | SpectralOutput::NoData => note(
                    &mut self.status.errors,
                    report,
                    StreamError::InsufficientWindow {
                        required,
                        available,
                    },
                ),
            }
        }
    }

    fn dispatch(&mut self, report: &mut CycleReport) {
        report.filtered = self
            .selection
            .resampled()
            .into_iter()
            .filter_map(|c| self.tracks.get(c)?.latest.map(|v| (c, v)))
            .collect();

        let filtered: BTreeMap<usize, f64> = report
            .filtered
            .iter()
            .copied()
            .filter(|(c, _)| self.selection.outbound_time.contains(c))
            .collect();
        let spectra: BTreeMap<usize, &SpectralFrame> = self
            .selection
            .outbound_fft
            .iter()
            .filter_map(|&c| self.spectra.frame(c).map(|frame| (c, frame)))
            .collect();

        let dispatch = self
            .dispatcher
            .dispatch(&mut self.transport, &self.selection, &filtered, &spectra);

        self.status.messages_sent += dispatch.delivered as u64;
        for failure in &dispatch.failures {
            note(&mut self.status.errors, report, failure.clone());
        }

        if dispatch.all_failed() {
            self.status.consecutive_transport_failures += 1;
            let consecutive = self.status.consecutive_transport_failures;
            if consecutive == 1 {
                warn!(attempted = dispatch.attempted, "every send failed this cycle");
            }
            if consecutive >= self.config.faults.max_transport_failure_cycles {
                self.fault(format!("every send failed for {} consecutive cycles", consecutive));
            }
        } else if dispatch.attempted > 0 {
            if !dispatch.failures.is_empty() {
                debug!(
                    failed = dispatch.failures.len(),
                    delivered = dispatch.delivered,
                    "partial delivery"
                );
            }
            self.status.consecutive_transport_failures = 0;
        }

        report.dispatch = dispatch;
    }

    /// Drop samples older than the window and release FFT plans. Returns the
    /// number of samples dropped.
    pub fn reclaim(&mut self) -> usize {
        let dropped = self.buffer.reclaim(self.config.window());
        self.spectra.reclaim();
        for track in &mut self.tracks {
            track.history.shrink_to_fit();
        }
        self.status.buffer = self.buffer.stats();
        debug!(dropped, "memory reclaimed");
        dropped
    }

    fn fault(&mut self, reason: String) {
        if self.state == PipelineState::Faulted {
            return;
        }
        error!(%reason, "pipeline faulted; processing suspended until reset");
        self.state = PipelineState::Faulted;
        self.status.fault_reason = Some(reason);
    }

    /// Health snapshot
    pub fn status(&self) -> PipelineStatus {
        let mut status = self.status.clone();
        status.state = self.state;
        status.buffer = self.buffer.stats();
        status
    }

    /// Current lifecycle state
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Handle for staging configuration updates from other threads or tasks
    pub fn config_handle(&self) -> ConfigHandle {
        self.handle.clone()
    }

    /// Configuration in effect
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Channel routing in effect
    pub fn selection(&self) -> &ChannelSelection {
        &self.selection
    }

    /// Filter state of one channel, if it is being filtered
    pub fn filter_state(&self, channel: usize) -> Option<&FilterState> {
        self.filters.state(channel)
    }

    /// Most recent spectrum of one channel
    pub fn spectral_frame(&self, channel: usize) -> Option<&SpectralFrame> {
        self.spectra.frame(channel)
    }

    /// Most recent output of one channel
    pub fn latest_output(&self, channel: usize) -> Option<f64> {
        self.tracks.get(channel).and_then(|t| t.latest)
    }

    /// Sample buffer
    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Upstream producer
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Upstream producer, mutably
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Outbound transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Outbound transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Cycles run so far
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Identifier of this orchestrator instance
    pub fn session_id(&self) -> Uuid {
        self.status.session_id
    }
}

fn note(counters: &mut ErrorCounters, report: &mut CycleReport, error: StreamError) {
    counters.record(&error);
    if report.errors.len() < MAX_REPORTED_ERRORS {
        report.errors.push(error);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OscConfig;
    use crate::dispatch::Payload;
    use brainosc_core::{Sample, ScriptedSource, Timestamp};

    #[derive(Default)]
    struct Sink {
        sent: Vec<String>,
    }

    impl Transport for Sink {
        fn send(&mut self, address: &str, _payload: &Payload) -> StreamResult<()> {
            self.sent.push(address.to_string());
            Ok(())
        }
    }

    /// Refuses to follow a host or port change
    #[derive(Default)]
    struct PinnedSink;

    impl Transport for PinnedSink {
        fn send(&mut self, _address: &str, _payload: &Payload) -> StreamResult<()> {
            Ok(())
        }

        fn reconfigure(&mut self, osc: &OscConfig) -> StreamResult<()> {
            Err(StreamError::Transport {
                address: osc.target(),
                reason: "cannot rebind".to_string(),
            })
        }
    }

    struct PanickingSource;

    impl SampleSource for PanickingSource {
        fn pull(&mut self) -> Vec<Sample> {
            panic!("driver fault");
        }

        fn channel_count(&self) -> usize {
            1
        }
    }

    fn one_channel_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.channel_count = 1;
        config.channels.selected = [0].into_iter().collect();
        config
    }

    fn ramp(start_ms: u64, count: u64) -> Vec<Sample> {
        (0..count)
            .map(|i| {
                let ms = start_ms + i * 4;
                Sample::new(0, ms as f64, Timestamp::from_millis(ms))
            })
            .collect()
    }

    #[test]
    fn test_idle_cycles_do_nothing() {
        let mut source = ScriptedSource::new(1);
        source.push_batch(ramp(0, 10));
        let mut pipeline = CycleOrchestrator::new(one_channel_config(), source, Sink::default()).unwrap();

        let report = pipeline.run_cycle();
        assert_eq!(report.state, PipelineState::Idle);
        assert_eq!(report.ingested, 0);
        assert_eq!(pipeline.source().remaining(), 1);
    }

    #[test]
    fn test_streaming_filters_new_ticks_once() {
        let mut source = ScriptedSource::new(1);
        source.push_batch(ramp(0, 25));
        source.push_batch(ramp(100, 25));
        let mut pipeline = CycleOrchestrator::new(one_channel_config(), source, Sink::default()).unwrap();
        pipeline.start();

        let first = pipeline.run_cycle();
        assert_eq!(first.ingested, 25);
        // Samples at 0..=96 ms give ticks 0..=24
        assert_eq!(first.new_ticks, 25);
        assert_eq!(pipeline.filter_state(0).unwrap().updates, 25);

        let second = pipeline.run_cycle();
        assert_eq!(second.new_ticks, 25);
        assert_eq!(pipeline.filter_state(0).unwrap().updates, 50);
        assert_eq!(pipeline.transport().sent, vec!["/eeg/ch0/time"; 2]);
    }

    #[test]
    fn test_panicking_stage_is_contained() {
        let mut pipeline =
            CycleOrchestrator::new(one_channel_config(), PanickingSource, Sink::default()).unwrap();
        pipeline.start();

        let report = pipeline.run_cycle();
        assert_eq!(report.state, PipelineState::Streaming);
        let report = pipeline.run_cycle();
        assert_eq!(report.cycle, 2);
        assert_eq!(pipeline.status().errors.panics, 2);
    }

    #[test]
    fn test_gap_fault_and_reset() {
        let mut config = one_channel_config();
        config.faults.max_acquisition_gap_cycles = 3;
        let mut pipeline = CycleOrchestrator::new(config, ScriptedSource::new(1), Sink::default()).unwrap();
        pipeline.start();

        for _ in 0..2 {
            assert_eq!(pipeline.run_cycle().state, PipelineState::Streaming);
        }
        assert_eq!(pipeline.run_cycle().state, PipelineState::Faulted);
        assert!(pipeline.status().fault_reason.is_some());

        pipeline.start();
        assert_eq!(pipeline.state(), PipelineState::Faulted);

        pipeline.reset();
        assert_eq!(pipeline.state(), PipelineState::Streaming);
        assert_eq!(pipeline.status().consecutive_gaps, 0);

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_faulted_keeps_buffering() {
        let mut config = one_channel_config();
        config.faults.max_acquisition_gap_cycles = 1;
        let mut source = ScriptedSource::new(1);
        source.push_batch(Vec::new());
        source.push_batch(ramp(0, 10));
        let mut pipeline = CycleOrchestrator::new(config, source, Sink::default()).unwrap();
        pipeline.start();

        assert_eq!(pipeline.run_cycle().state, PipelineState::Faulted);
        let report = pipeline.run_cycle();
        assert_eq!(report.ingested, 10);
        assert_eq!(report.new_ticks, 0);
        assert_eq!(report.dispatch.attempted, 0);
        assert_eq!(pipeline.buffer().len(0), 10);
    }

    #[test]
    fn test_periodic_reclaim() {
        let mut config = one_channel_config();
        config.maintenance.reclaim_every_cycles = 2;
        config.window_duration = 0.1;
        config.max_expected_rate = 1_000.0;
        let mut source = ScriptedSource::new(1);
        source.push_batch(ramp(0, 50));
        let mut pipeline = CycleOrchestrator::new(config, source, Sink::default()).unwrap();
        pipeline.start();

        assert!(pipeline.run_cycle().reclaimed.is_none());
        let report = pipeline.run_cycle();
        // 0..=196 ms held; only 96..=196 ms survive a 100 ms window
        assert_eq!(report.reclaimed, Some(24));
        assert_eq!(pipeline.buffer().len(0), 26);
    }

    #[test]
    fn test_invalid_staged_config_keeps_previous() {
        let mut pipeline =
            CycleOrchestrator::new(one_channel_config(), ScriptedSource::new(1), Sink::default()).unwrap();
        let handle = pipeline.config_handle();

        let mut bad = one_channel_config();
        bad.target_rate = -5.0;
        assert!(handle.submit(bad).is_err());
        assert!(!pipeline.apply_pending_config());
        assert_eq!(pipeline.config().target_rate, 250.0);

        handle.modify(|c| c.target_rate = 128.0).unwrap();
        assert!(pipeline.apply_pending_config());
        assert_eq!(pipeline.config().target_rate, 128.0);
        assert_eq!(handle.active().target_rate, 128.0);
        assert_eq!(pipeline.status().reconfigurations, 1);
    }

    #[test]
    fn test_failed_apply_restores_active_config() {
        let source = ScriptedSource::new(1);
        let mut pipeline = CycleOrchestrator::new(one_channel_config(), source, PinnedSink).unwrap();
        let handle = pipeline.config_handle();

        handle.modify(|c| c.osc.port = 9100).unwrap();
        assert!(!pipeline.apply_pending_config());

        assert_eq!(handle.active().osc.port, 9000);
        assert_eq!(pipeline.config().osc.port, 9000);
        assert!(!handle.has_pending());
        assert_eq!(pipeline.status().errors.transport, 1);
    }
}
