//! brainosc-bridge: stream EEG as OSC
//!
//! Hosts the cycle orchestrator on a fixed-rate clock, feeds it from the
//! synthetic board running on its own task, and sends the smoothed values
//! and spectra to an OSC receiver over UDP. The configuration file, when
//! given, is watched and reapplied on every save.

mod console;
mod service;
mod watcher;

use anyhow::{anyhow, Context, Result};
use brainosc_processing::{CycleOrchestrator, OscTransport, PipelineConfig};
use brainosc_simulation::{start_board_stream, BoardConfig, StreamCommand, StreamConfig};
use clap::{Parser, ValueEnum};
use service::{BridgeService, ServiceCommand, ServiceSettings};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use watcher::ConfigWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Preset {
    /// Per-channel messages under /eeg/ch{n}/{domain}, port 9000
    Eeg,
    /// One bundled /wek/inputs message per cycle, port 6448
    Wekinator,
}

#[derive(Parser, Debug)]
#[command(name = "brainosc-bridge", version)]
#[command(about = "Resample, smooth and transform EEG channels and send them as OSC", long_about = None)]
struct Cli {
    /// JSON configuration file; reapplied whenever it changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Built-in profile used when no configuration file is given
    #[arg(long, value_enum, default_value_t = Preset::Eeg, conflicts_with = "config")]
    preset: Preset,

    /// OSC receiver host
    #[arg(long)]
    host: Option<String>,

    /// OSC receiver port
    #[arg(short, long)]
    port: Option<u16>,

    /// Outbound channels, e.g. '*' or 'chan1 chan2 fft_chan1'
    #[arg(long)]
    channels: Option<String>,

    /// Processing cycles per second
    #[arg(long, default_value_t = 25.0)]
    cycle_rate: f64,

    /// Seconds between status log lines
    #[arg(long, default_value_t = 5)]
    status_interval: u64,

    /// Synthetic board sampling rate in Hz
    #[arg(long, default_value_t = 250.0)]
    board_rate: f64,

    /// Synthetic board rhythm; type 'patterns' on the console for the list
    #[arg(long, default_value = "eyes closed")]
    pattern: String,

    /// Seed for reproducible synthetic data
    #[arg(long)]
    seed: Option<u64>,

    /// Start idle; type 'start' to begin streaming
    #[arg(long)]
    idle: bool,

    /// Do not read commands from stdin
    #[arg(long)]
    no_console: bool,

    /// Write the resolved configuration to this file and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

impl Cli {
    /// Configuration file or preset, with command line overrides applied
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("cannot load configuration {}", path.display()))?,
            None => match self.preset {
                Preset::Eeg => PipelineConfig::eeg_default(),
                Preset::Wekinator => PipelineConfig::wekinator(),
            },
        };

        if let Some(host) = &self.host {
            config.osc.address = host.clone();
        }
        if let Some(port) = self.port {
            config.osc.port = port;
        }
        if let Some(channels) = &self.channels {
            config.osc.channels = channels.clone();
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn stream_config(&self, config: &PipelineConfig) -> Result<StreamConfig> {
        let pattern = console::find_pattern(&self.pattern)
            .ok_or_else(|| anyhow!("unknown pattern '{}'; try 'eyes closed' or 'focused'", self.pattern))?;
        let stream = StreamConfig {
            board: BoardConfig {
                sampling_rate: self.board_rate,
                channel_count: config.channel_count,
                pattern,
                seed: self.seed,
                ..Default::default()
            },
            ..Default::default()
        };
        stream.validate().context("invalid synthetic board settings")?;
        Ok(stream)
    }

    fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            cycle_rate: self.cycle_rate,
            status_interval: Duration::from_secs(self.status_interval.max(1)),
            autostart: !self.idle,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.pipeline_config()?;

    if let Some(path) = &cli.write_config {
        config
            .save(path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(path = %path.display(), profile = %config.name, "configuration written");
        return Ok(());
    }

    let stream_config = cli.stream_config(&config)?;
    let stream = start_board_stream(stream_config.clone())?;
    stream.control.send(StreamCommand::Start).await?;

    let transport = OscTransport::from_config(&config.osc)?;
    let orchestrator = CycleOrchestrator::new(config, stream.source, transport)?;
    let service = BridgeService::new(orchestrator, cli.service_settings())?;
    let commands = service.command_handle();

    if let Some(path) = &cli.config {
        let watcher = ConfigWatcher::new(path)?;
        tokio::spawn(watcher.run(commands.clone()));
    }

    if !cli.no_console {
        let settings = console::BoardSettings::new(stream_config);
        console::spawn(commands.clone(), stream.control.clone(), settings)
            .context("cannot start console")?;
        info!("{}", console::HELP);
    }

    let interrupt = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = interrupt.send(ServiceCommand::Shutdown).await;
        }
    });

    let status = service.run().await;
    stream.task.abort();

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
