//! Fixed-capacity per-channel sample store
//!
//! Each channel owns a FIFO ring of at most `capacity` samples. Ingest evicts
//! the oldest entry when a ring is full; periodic reclamation additionally
//! drops everything older than the active window so memory stays bounded by
//! the window, not by the device's burst rate.

use crate::error::{StreamError, StreamResult};
use crate::sample::Sample;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::vec_deque;
use std::collections::VecDeque;
use std::time::Duration;

/// Outcome of a successful ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Sample appended without eviction
    Stored,
    /// Sample appended and the channel's oldest sample evicted
    Evicted,
}

/// Running counters for the sample buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    /// Samples accepted
    pub ingested: u64,
    /// Samples evicted because a ring was full
    pub evicted: u64,
    /// Samples addressed to a channel outside the configured range
    pub rejected_out_of_range: u64,
    /// Samples older than their channel's watermark
    pub rejected_stale: u64,
    /// Samples dropped by reclamation
    pub reclaimed: u64,
}

impl BufferStats {
    /// All rejected samples
    pub fn rejected(&self) -> u64 {
        self.rejected_out_of_range + self.rejected_stale
    }
}

#[derive(Debug, Clone, Default)]
struct ChannelBuffer {
    samples: VecDeque<Sample>,
    watermark: Option<Timestamp>,
}

impl ChannelBuffer {
    /// Index of the first sample at or after `cutoff`
    fn first_at_or_after(&self, cutoff: Timestamp) -> usize {
        self.samples.partition_point(|s| s.timestamp < cutoff)
    }
}

/// Per-channel ring store for incoming samples
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    channels: Vec<ChannelBuffer>,
    capacity: usize,
    latest: Option<Timestamp>,
    stats: BufferStats,
}

impl SampleBuffer {
    /// Create a buffer for `channel_count` channels of `capacity` samples each.
    /// Rings grow on demand up to `capacity`; nothing is preallocated.
    pub fn new(channel_count: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            channels: vec![ChannelBuffer::default(); channel_count],
            capacity,
            latest: None,
            stats: BufferStats::default(),
        }
    }

    /// Ring capacity needed to hold `window_duration` seconds at `max_rate` Hz
    pub fn capacity_for(window_duration: f64, max_rate: f64) -> usize {
        let samples = (window_duration * max_rate).ceil();
        if samples.is_finite() && samples >= 1.0 {
            samples as usize
        } else {
            1
        }
    }

    /// Append a sample to its channel's ring.
    ///
    /// Out-of-range and stale samples are counted and returned as errors;
    /// neither is fatal to the buffer.
    pub fn ingest(&mut self, sample: Sample) -> StreamResult<IngestOutcome> {
        let channel_count = self.channels.len();
        let Some(channel) = self.channels.get_mut(sample.channel) else {
            self.stats.rejected_out_of_range += 1;
            return Err(StreamError::ChannelOutOfRange {
                channel: sample.channel,
                channel_count,
            });
        };

        if let Some(watermark) = channel.watermark {
            if sample.timestamp < watermark {
                self.stats.rejected_stale += 1;
                return Err(StreamError::StaleSample {
                    channel: sample.channel,
                    timestamp_ns: sample.timestamp.as_nanos(),
                    watermark_ns: watermark.as_nanos(),
                });
            }
        }

        let outcome = if channel.samples.len() >= self.capacity {
            channel.samples.pop_front();
            self.stats.evicted += 1;
            IngestOutcome::Evicted
        } else {
            IngestOutcome::Stored
        };

        channel.samples.push_back(sample);
        channel.watermark = Some(sample.timestamp);
        self.latest = Some(self.latest.map_or(sample.timestamp, |t| t.max(sample.timestamp)));
        self.stats.ingested += 1;

        Ok(outcome)
    }

    /// Chronological view of one channel's samples no older than `max_age`
    /// relative to the latest ingested timestamp.
    ///
    /// The returned iterator is lazy and can be restarted by cloning it.
    /// Unknown channels yield an empty snapshot.
    pub fn snapshot(&self, channel: usize, max_age: Duration) -> Snapshot<'_> {
        let (Some(buffer), Some(latest)) = (self.channels.get(channel), self.latest) else {
            return Snapshot { inner: None };
        };
        let start = buffer.first_at_or_after(latest.saturating_sub(max_age));
        Snapshot {
            inner: Some(buffer.samples.range(start..)),
        }
    }

    /// Drop every sample older than `window` relative to the latest
    /// timestamp, regardless of how full the rings are. Returns the number
    /// of samples dropped.
    pub fn reclaim(&mut self, window: Duration) -> usize {
        let Some(latest) = self.latest else {
            return 0;
        };
        let cutoff = latest.saturating_sub(window);
        let mut dropped = 0;

        for channel in &mut self.channels {
            let stale = channel.first_at_or_after(cutoff);
            channel.samples.drain(..stale);
            dropped += stale;

            // Give back ring storage left over from a larger capacity
            if channel.samples.capacity() > self.capacity * 2 {
                channel.samples.shrink_to(self.capacity);
            }
        }

        self.stats.reclaimed += dropped as u64;
        dropped
    }

    /// Change channel count and ring capacity, keeping the newest samples
    /// that still fit
    pub fn resize(&mut self, channel_count: usize, capacity: usize) {
        let capacity = capacity.max(1);
        self.channels
            .resize_with(channel_count, ChannelBuffer::default);

        for channel in &mut self.channels {
            let excess = channel.samples.len().saturating_sub(capacity);
            channel.samples.drain(..excess);
            self.stats.evicted += excess as u64;
        }
        self.capacity = capacity;
    }

    /// Drop all samples and watermarks, keeping counters
    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.samples.clear();
            channel.watermark = None;
        }
        self.latest = None;
    }

    /// Number of samples currently held for `channel`
    pub fn len(&self, channel: usize) -> usize {
        self.channels.get(channel).map_or(0, |c| c.samples.len())
    }

    /// Number of samples across all channels
    pub fn total_len(&self) -> usize {
        self.channels.iter().map(|c| c.samples.len()).sum()
    }

    /// Whether no channel holds any sample
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Latest accepted timestamp on `channel`
    pub fn watermark(&self, channel: usize) -> Option<Timestamp> {
        self.channels.get(channel).and_then(|c| c.watermark)
    }

    /// Latest accepted timestamp across all channels
    pub fn latest(&self) -> Option<Timestamp> {
        self.latest
    }

    /// Per-channel ring capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured number of channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Running counters
    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}

/// Lazy, restartable view over one channel's recent samples
#[derive(Debug, Clone)]
pub struct Snapshot<'a> {
    inner: Option<vec_deque::Iter<'a, Sample>>,
}

impl<'a> Iterator for Snapshot<'a> {
    type Item = &'a Sample;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.as_mut()?.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner
            .as_ref()
            .map_or((0, Some(0)), |inner| inner.size_hint())
    }
}

impl ExactSizeIterator for Snapshot<'_> {}
