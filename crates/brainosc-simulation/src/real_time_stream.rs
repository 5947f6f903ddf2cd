//! Real-time synthetic acquisition on a background task
//!
//! The board is driven by a tokio interval and its sample batches are
//! handed over an unbounded channel to a [`StreamSource`], which the
//! pipeline drains without blocking.

use crate::signal_patterns::SignalPattern;
use crate::synthetic_board::{BoardConfig, Pacing, SyntheticBoard};
use brainosc_core::{config_error, Sample, SampleSource, StreamResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for real-time streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Board simulation configuration
    pub board: BoardConfig,
    /// Chunk duration in seconds (e.g. 0.04 for 40 ms chunks)
    pub chunk_duration: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            board: BoardConfig::default(),
            chunk_duration: 0.04,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> StreamResult<()> {
        self.board.validate()?;
        if !(self.chunk_duration.is_finite() && self.chunk_duration > 0.0) {
            return Err(config_error!("chunk_duration must be positive"));
        }
        if self.frames_per_chunk() == 0 {
            return Err(config_error!(
                "chunk_duration {}s holds no frame at {} Hz",
                self.chunk_duration,
                self.board.sampling_rate
            ));
        }
        Ok(())
    }

    /// Sample frames produced per chunk
    pub fn frames_per_chunk(&self) -> usize {
        (self.chunk_duration * self.board.sampling_rate).round() as usize
    }

    fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_duration)
    }
}

/// Commands for controlling the stream
#[derive(Debug, Clone)]
pub enum StreamCommand {
    Start,
    Pause,
    Resume,
    /// Change rate, noise or chunking; the channel count is fixed
    UpdateConfig(StreamConfig),
    UpdatePattern(SignalPattern),
    /// Simulate the device dropping off; frames produced meanwhile are lost
    Disconnect,
    Reconnect,
}

/// Stream statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStats {
    pub is_running: bool,
    pub connected: bool,
    pub chunks_sent: u64,
    pub samples_sent: u64,
    /// Frames generated while disconnected and never delivered
    pub frames_lost: u64,
    /// Acquisition time of the next frame, seconds
    pub stream_time: f64,
    /// Generation time of the last chunk, microseconds
    pub last_chunk_us: u64,
}

/// Background producer driving a [`SyntheticBoard`]
pub struct RealTimeBoardStream {
    config: StreamConfig,
    board: SyntheticBoard,
    data_sender: mpsc::UnboundedSender<Vec<Sample>>,
    control_receiver: mpsc::Receiver<StreamCommand>,
    connected: Arc<AtomicBool>,
    stats: watch::Sender<StreamStats>,
    running: bool,
}

/// Pipeline-facing end of a [`RealTimeBoardStream`]
#[derive(Debug)]
pub struct StreamSource {
    receiver: mpsc::UnboundedReceiver<Vec<Sample>>,
    connected: Arc<AtomicBool>,
    channel_count: usize,
}

/// Handles returned by [`start_board_stream`]
pub struct StreamHandles {
    pub source: StreamSource,
    pub control: mpsc::Sender<StreamCommand>,
    pub stats: watch::Receiver<StreamStats>,
    pub task: JoinHandle<()>,
}

impl RealTimeBoardStream {
    /// Build the stream and the source that drains it
    pub fn new(
        config: StreamConfig,
    ) -> StreamResult<(Self, StreamSource, mpsc::Sender<StreamCommand>, watch::Receiver<StreamStats>)> {
        config.validate()?;
        let board = SyntheticBoard::with_pacing(
            config.board.clone(),
            Pacing::FixedStep {
                frames_per_pull: config.frames_per_chunk(),
            },
        )?;

        let (data_sender, receiver) = mpsc::unbounded_channel();
        let (control_sender, control_receiver) = mpsc::channel(32);
        let (stats, stats_receiver) = watch::channel(StreamStats {
            connected: true,
            ..Default::default()
        });
        let connected = Arc::new(AtomicBool::new(true));

        let source = StreamSource {
            receiver,
            connected: connected.clone(),
            channel_count: config.board.channel_count,
        };

        let stream = Self {
            config,
            board,
            data_sender,
            control_receiver,
            connected,
            stats,
            running: false,
        };

        Ok((stream, source, control_sender, stats_receiver))
    }

    /// Run until the control channel closes or the source is dropped
    pub async fn run(mut self) {
        let mut ticker = interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            rate = self.config.board.sampling_rate,
            chunk_ms = self.config.chunk_duration * 1000.0,
            "board stream ready"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.running && !self.produce_chunk() {
                        info!("stream source dropped, stopping board stream");
                        break;
                    }
                }

                command = self.control_receiver.recv() => {
                    match command {
                        Some(command) => {
                            if let Some(period) = self.handle(command) {
                                ticker = interval(period);
                                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            }
                        }
                        None => {
                            debug!("board stream control channel closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Generate one chunk; returns false once nobody is listening
    fn produce_chunk(&mut self) -> bool {
        let started = Instant::now();
        let frames = self.config.frames_per_chunk();

        if !self.board.is_connected() {
            self.board.generate(frames);
            let stream_time = self.board.current_time();
            self.stats.send_modify(|s| {
                s.frames_lost += frames as u64;
                s.stream_time = stream_time;
            });
            return true;
        }

        let batch = self.board.pull();
        let count = batch.len() as u64;
        if self.data_sender.send(batch).is_err() {
            return false;
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.tick_period() {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                chunk_ms = self.config.chunk_duration * 1000.0,
                "chunk generation slower than real time"
            );
        }

        let stream_time = self.board.current_time();
        self.stats.send_modify(|s| {
            s.chunks_sent += 1;
            s.samples_sent += count;
            s.stream_time = stream_time;
            s.last_chunk_us = elapsed.as_micros() as u64;
        });
        true
    }

    /// Apply a command; returns a new tick period when it changed
    fn handle(&mut self, command: StreamCommand) -> Option<Duration> {
        match command {
            StreamCommand::Start | StreamCommand::Resume => {
                self.running = true;
                info!("board stream running");
            }
            StreamCommand::Pause => {
                self.running = false;
                info!("board stream paused");
            }
            StreamCommand::UpdateConfig(config) => {
                if let Err(e) = config.validate() {
                    warn!(error = %e, "rejected board stream configuration");
                    return None;
                }
                if config.board.channel_count != self.config.board.channel_count {
                    warn!(
                        current = self.config.board.channel_count,
                        requested = config.board.channel_count,
                        "board channel count cannot change while streaming"
                    );
                    return None;
                }
                if let Err(e) = self.board.update_config(config.board.clone()) {
                    warn!(error = %e, "rejected board configuration");
                    return None;
                }
                let period_changed = config.chunk_duration != self.config.chunk_duration
                    || config.frames_per_chunk() != self.config.frames_per_chunk();
                self.board.set_pacing(Pacing::FixedStep {
                    frames_per_pull: config.frames_per_chunk(),
                });
                self.config = config;
                info!(
                    rate = self.config.board.sampling_rate,
                    chunk_ms = self.config.chunk_duration * 1000.0,
                    "board stream configuration updated"
                );
                if period_changed {
                    return Some(self.config.tick_period());
                }
            }
            StreamCommand::UpdatePattern(pattern) => {
                info!(pattern = pattern.description(), "board stream pattern updated");
                self.board.set_pattern(pattern);
                self.config.board.pattern = pattern;
            }
            StreamCommand::Disconnect => {
                self.board.disconnect();
                self.connected.store(false, Ordering::Release);
            }
            StreamCommand::Reconnect => {
                self.board.connect();
                self.connected.store(true, Ordering::Release);
            }
        }

        let running = self.running;
        let connected = self.board.is_connected();
        self.stats.send_modify(|s| {
            s.is_running = running;
            s.connected = connected;
        });
        None
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl SampleSource for StreamSource {
    fn pull(&mut self) -> Vec<Sample> {
        let mut samples = Vec::new();
        while let Ok(batch) = self.receiver.try_recv() {
            samples.extend(batch);
        }
        samples
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn channel_count(&self) -> usize {
        self.channel_count
    }
}

/// Create a stream and spawn it on the current runtime
pub fn start_board_stream(config: StreamConfig) -> StreamResult<StreamHandles> {
    let (stream, source, control, stats) = RealTimeBoardStream::new(config)?;
    let task = tokio::spawn(stream.run());
    Ok(StreamHandles {
        source,
        control,
        stats,
        task,
    })
}
