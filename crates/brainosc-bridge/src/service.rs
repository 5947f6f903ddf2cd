//! Fixed-rate host for the cycle orchestrator

use anyhow::{bail, Result};
use brainosc_core::SampleSource;
use brainosc_processing::{
    CycleOrchestrator, CycleReport, PipelineConfig, PipelineState, PipelineStatus, Transport,
};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Commands for controlling the service
#[derive(Debug, Clone)]
pub enum ServiceCommand {
    Start,
    Stop,
    /// Leave `Faulted`
    Reset,
    /// Log a status line now
    Status,
    /// Stage a configuration for the next cycle boundary
    UpdateConfig(PipelineConfig),
    /// Change the outbound channel expression (`*`, `chan1 fft_chan2`, ...)
    SetOutbound(String),
    /// Change the resampler's output rate
    SetTargetRate(f64),
    Shutdown,
}

/// Timing of the service loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceSettings {
    /// Cycles per second
    pub cycle_rate: f64,
    /// Period of the status log line
    pub status_interval: Duration,
    /// Start streaming immediately
    pub autostart: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cycle_rate: 25.0,
            status_interval: Duration::from_secs(5),
            autostart: true,
        }
    }
}

impl ServiceSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.cycle_rate.is_finite() && self.cycle_rate > 0.0 && self.cycle_rate <= 1_000.0) {
            bail!("cycle rate must be in (0, 1000] Hz, got {}", self.cycle_rate);
        }
        if self.status_interval.is_zero() {
            bail!("status interval must be positive");
        }
        Ok(())
    }

    fn cycle_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.cycle_rate)
    }
}

/// Runs cycles on a tokio interval and reacts to commands between them
pub struct BridgeService<S, T> {
    orchestrator: CycleOrchestrator<S, T>,
    settings: ServiceSettings,
    command_receiver: mpsc::Receiver<ServiceCommand>,
    command_sender: mpsc::Sender<ServiceCommand>,
    status_sender: watch::Sender<PipelineStatus>,
    last_state: PipelineState,
    /// Messages delivered at the last status line
    last_reported_messages: u64,
}

impl<S: SampleSource, T: Transport> BridgeService<S, T> {
    pub fn new(orchestrator: CycleOrchestrator<S, T>, settings: ServiceSettings) -> Result<Self> {
        settings.validate()?;
        let (command_sender, command_receiver) = mpsc::channel(32);
        let status = orchestrator.status();
        let last_state = status.state;
        let (status_sender, _) = watch::channel(status);

        Ok(Self {
            orchestrator,
            settings,
            command_receiver,
            command_sender,
            status_sender,
            last_state,
            last_reported_messages: 0,
        })
    }

    /// Get command sender for controlling the service
    pub fn command_handle(&self) -> mpsc::Sender<ServiceCommand> {
        self.command_sender.clone()
    }

    /// Status after every cycle
    pub fn subscribe_status(&self) -> watch::Receiver<PipelineStatus> {
        self.status_sender.subscribe()
    }

    /// Run until `Shutdown`; returns the final status
    pub async fn run(mut self) -> PipelineStatus {
        let mut cycle_timer = interval(self.settings.cycle_period());
        cycle_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status_timer = interval_at(
            Instant::now() + self.settings.status_interval,
            self.settings.status_interval,
        );

        info!(
            session = %self.orchestrator.session_id(),
            cycle_rate = self.settings.cycle_rate,
            target = %self.orchestrator.config().osc.target(),
            "bridge service started"
        );
        if self.settings.autostart {
            self.orchestrator.start();
        }

        loop {
            tokio::select! {
                _ = cycle_timer.tick() => {
                    let report = self.orchestrator.run_cycle();
                    self.observe(&report);
                }

                _ = status_timer.tick() => {
                    self.log_status();
                }

                command = self.command_receiver.recv() => {
                    match command {
                        Some(ServiceCommand::Shutdown) | None => break,
                        Some(command) => self.handle(command),
                    }
                }
            }
        }

        self.orchestrator.stop();
        let status = self.orchestrator.status();
        info!(
            cycles = status.cycles,
            messages = status.messages_sent,
            errors = status.errors.total(),
            "bridge service stopped"
        );
        status
    }

    fn handle(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::Start => self.orchestrator.start(),
            ServiceCommand::Stop => self.orchestrator.stop(),
            ServiceCommand::Reset => self.orchestrator.reset(),
            ServiceCommand::Status => self.log_status(),
            ServiceCommand::UpdateConfig(config) => {
                let profile = config.name.clone();
                match self.orchestrator.config_handle().submit(config) {
                    Ok(()) => info!(profile = %profile, "configuration staged"),
                    Err(e) => warn!(error = %e, "configuration rejected"),
                }
            }
            ServiceCommand::SetOutbound(expression) => {
                self.stage(|config| config.osc.channels = expression);
            }
            ServiceCommand::SetTargetRate(rate) => {
                self.stage(|config| config.target_rate = rate);
            }
            ServiceCommand::Shutdown => {}
        }
        self.publish();
    }

    fn stage<F: FnOnce(&mut PipelineConfig)>(&self, change: F) {
        match self.orchestrator.config_handle().modify(change) {
            Ok(()) => info!("configuration change staged"),
            Err(e) => warn!(error = %e, "configuration change rejected"),
        }
    }

    fn observe(&mut self, report: &CycleReport) {
        if report.reconfigured {
            info!(cycle = report.cycle, "configuration applied");
        }
        if !report.errors.is_empty() {
            debug!(
                cycle = report.cycle,
                errors = report.errors.len(),
                first = %report.errors[0],
                "cycle contained errors"
            );
        }
        self.publish();
    }

    fn publish(&mut self) {
        let status = self.orchestrator.status();
        if status.state != self.last_state {
            match status.state {
                PipelineState::Faulted => error!(
                    reason = status.fault_reason.as_deref().unwrap_or("unknown"),
                    "pipeline faulted; send 'reset' to resume"
                ),
                state => info!(from = %self.last_state, to = %state, "pipeline state changed"),
            }
            self.last_state = status.state;
        }
        self.status_sender.send_replace(status);
    }

    fn log_status(&mut self) {
        let status = self.orchestrator.status();
        let sent = status.messages_sent.saturating_sub(self.last_reported_messages);
        self.last_reported_messages = status.messages_sent;
        info!(
            state = %status.state,
            cycles = status.cycles,
            sent_since_last = sent,
            errors = status.errors.total(),
            transport_errors = status.errors.transport,
            gaps = status.consecutive_gaps,
            source_connected = status.source_connected,
            ingested = status.buffer.ingested,
            rejected = status.buffer.rejected(),
            last_cycle_us = status.last_cycle.total_us,
            "status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brainosc_core::StreamResult;
    use brainosc_processing::Payload;
    use brainosc_simulation::{BoardConfig, Pacing, SyntheticBoard};

    #[derive(Default)]
    struct CountingTransport {
        sent: usize,
    }

    impl Transport for CountingTransport {
        fn send(&mut self, _address: &str, _payload: &Payload) -> StreamResult<()> {
            self.sent += 1;
            Ok(())
        }
    }

    fn service(autostart: bool) -> BridgeService<SyntheticBoard, CountingTransport> {
        let board = SyntheticBoard::with_pacing(
            BoardConfig {
                seed: Some(5),
                ..Default::default()
            },
            Pacing::FixedStep { frames_per_pull: 10 },
        )
        .unwrap();
        let orchestrator =
            CycleOrchestrator::new(PipelineConfig::eeg_default(), board, CountingTransport::default())
                .unwrap();
        BridgeService::new(
            orchestrator,
            ServiceSettings {
                cycle_rate: 200.0,
                status_interval: Duration::from_millis(50),
                autostart,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_service_runs_cycles_until_shutdown() {
        let service = service(true);
        let commands = service.command_handle();
        let mut status = service.subscribe_status();
        let task = tokio::spawn(async move { service.run().await.cycles });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(status.borrow_and_update().state, PipelineState::Streaming);
        assert!(status.borrow().messages_sent > 0);

        commands.send(ServiceCommand::Shutdown).await.unwrap();
        let cycles = task.await.unwrap();
        assert!(cycles > 5, "only {} cycles", cycles);
    }

    #[tokio::test]
    async fn test_start_stop_commands() {
        let service = service(false);
        let commands = service.command_handle();
        let status = service.subscribe_status();
        let task = tokio::spawn(service.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status.borrow().state, PipelineState::Idle);
        assert_eq!(status.borrow().messages_sent, 0);

        commands.send(ServiceCommand::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(status.borrow().state, PipelineState::Streaming);

        commands.send(ServiceCommand::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(status.borrow().state, PipelineState::Idle);

        commands.send(ServiceCommand::Shutdown).await.unwrap();
        let final_status = task.await.unwrap();
        assert!(final_status.messages_sent > 0);
    }

    #[tokio::test]
    async fn test_staged_config_is_applied() {
        let service = service(true);
        let commands = service.command_handle();
        let status = service.subscribe_status();
        let task = tokio::spawn(service.run());

        let mut config = PipelineConfig::eeg_default();
        config.target_rate = 125.0;
        commands.send(ServiceCommand::UpdateConfig(config)).await.unwrap();

        let mut invalid = PipelineConfig::eeg_default();
        invalid.channel_count = 0;
        commands.send(ServiceCommand::UpdateConfig(invalid)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(status.borrow().reconfigurations, 1);

        commands.send(ServiceCommand::SetOutbound("chan1 fft_chan1".into())).await.unwrap();
        commands.send(ServiceCommand::SetOutbound("chan9".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(status.borrow().reconfigurations, 2);

        commands.send(ServiceCommand::Shutdown).await.unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_settings_validation() {
        assert!(ServiceSettings::default().validate().is_ok());
        let settings = ServiceSettings {
            cycle_rate: 0.0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
