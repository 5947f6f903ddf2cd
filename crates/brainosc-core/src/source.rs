//! Upstream producer interface
//!
//! Device discovery, connection and streaming live behind this trait. The
//! pipeline only ever asks for whatever samples are ready right now.

use crate::sample::Sample;

/// Non-blocking producer of timestamped samples
pub trait SampleSource: Send {
    /// Drain every sample that became available since the last pull.
    ///
    /// Must not block; returns an empty vector when nothing is ready.
    fn pull(&mut self) -> Vec<Sample>;

    /// Whether the device is currently delivering data.
    ///
    /// A disconnected source is treated as "no new samples", never as a
    /// pipeline failure.
    fn is_connected(&self) -> bool {
        true
    }

    /// Number of channels the device delivers
    fn channel_count(&self) -> usize;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn pull(&mut self) -> Vec<Sample> {
        (**self).pull()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn channel_count(&self) -> usize {
        (**self).channel_count()
    }
}

/// Source backed by a fixed list of samples, handed out in batches.
///
/// Useful for replaying a recording or scripting a test scenario.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    batches: std::collections::VecDeque<Vec<Sample>>,
    channel_count: usize,
}

impl ScriptedSource {
    /// Create an empty scripted source
    pub fn new(channel_count: usize) -> Self {
        Self {
            batches: Default::default(),
            channel_count,
        }
    }

    /// Queue one batch to be returned by a future `pull`
    pub fn push_batch(&mut self, batch: Vec<Sample>) {
        self.batches.push_back(batch);
    }

    /// Number of batches not yet pulled
    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

impl SampleSource for ScriptedSource {
    fn pull(&mut self) -> Vec<Sample> {
        self.batches.pop_front().unwrap_or_default()
    }

    fn channel_count(&self) -> usize {
        self.channel_count
    }
}
