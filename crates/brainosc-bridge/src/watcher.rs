//! Configuration file hot-reload
//!
//! Watches the directory holding the JSON configuration, since editors
//! usually replace the file rather than writing it in place. Every change
//! to the file is reloaded, validated and staged on the orchestrator's
//! configuration handle; invalid files are logged and ignored.

use crate::service::ServiceCommand;
use anyhow::{anyhow, Context, Result};
use brainosc_processing::PipelineConfig;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Quiet period after a change before the file is read
const DEBOUNCE: Duration = Duration::from_millis(150);

/// Watches one configuration file for changes
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
}

impl ConfigWatcher {
    /// Start watching `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path
            .as_ref()
            .canonicalize()
            .with_context(|| format!("cannot watch {}", path.as_ref().display()))?;
        let directory = path
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?
            .to_path_buf();

        let (tx, events) = mpsc::channel(64);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Dropped events are fine: any later event triggers the same reload
            let _ = tx.try_send(res);
        })?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        info!(path = %path.display(), "watching configuration for changes");
        Ok(Self {
            path,
            _watcher: watcher,
            events,
        })
    }

    fn concerns_config(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
            && event.paths.iter().any(|p| p.file_name() == self.path.file_name())
    }

    /// Wait for the next change to the file. Returns `None` once the
    /// underlying watcher stops.
    pub async fn changed(&mut self) -> Option<()> {
        loop {
            match self.events.recv().await? {
                Ok(event) if self.concerns_config(&event) => break,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "configuration watcher error"),
            }
        }

        // Collapse the burst of events a single save produces
        tokio::time::sleep(DEBOUNCE).await;
        while self.events.try_recv().is_ok() {}
        Some(())
    }

    /// Read and validate the file
    pub fn reload(&self) -> Result<PipelineConfig> {
        PipelineConfig::load(&self.path)
            .with_context(|| format!("cannot reload {}", self.path.display()))
    }

    /// Forward every valid change to the service until either side stops
    pub async fn run(mut self, commands: mpsc::Sender<ServiceCommand>) {
        while self.changed().await.is_some() {
            match self.reload() {
                Ok(config) => {
                    debug!(profile = %config.name, "configuration file changed");
                    if commands.send(ServiceCommand::UpdateConfig(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %format!("{:#}", e), "keeping previous configuration"),
            }
        }
        debug!("configuration watcher stopped");
    }
}
