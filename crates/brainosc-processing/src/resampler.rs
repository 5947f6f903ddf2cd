//! Linear resampling onto a uniform tick grid
//!
//! Ticks sit on the absolute grid `k / target_rate` seconds, so the same
//! instant always maps to the same tick index no matter which cycle sees it.
//! A tick is produced only when two raw samples bracket it.

use brainosc_core::{
    config_error, ResampledFrame, ResampledPoint, Sample, SampleBuffer, StreamResult,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Uniform-rate linear resampler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resampler {
    target_rate: f64,
}

impl Resampler {
    /// Create a resampler emitting `target_rate` ticks per second
    pub fn new(target_rate: f64) -> StreamResult<Self> {
        if !(target_rate.is_finite() && target_rate > 0.0) {
            return Err(config_error!(
                "target_rate must be a positive number, got {}",
                target_rate
            ));
        }
        Ok(Self { target_rate })
    }

    /// Output rate in Hz
    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    /// Tick spacing in seconds
    pub fn period(&self) -> f64 {
        1.0 / self.target_rate
    }

    /// Time of tick `k` in seconds
    #[inline]
    pub fn tick_time(&self, tick: i64) -> f64 {
        tick as f64 / self.target_rate
    }

    /// Resample one channel's chronological samples.
    ///
    /// Produces every grid tick in `[first, last]` of the input. Fewer than
    /// two samples yield nothing. A tick is never produced twice, even when
    /// samples share a timestamp.
    pub fn resample<'a, I>(&self, samples: I) -> Vec<ResampledPoint>
    where
        I: IntoIterator<Item = &'a Sample>,
    {
        let mut samples = samples.into_iter();
        let Some(first) = samples.next() else {
            return Vec::new();
        };

        let mut points = Vec::new();
        let mut previous = first;
        // One tick early so a rounding error in the product cannot skip the
        // tick that coincides with the first sample
        let mut tick = (first.secs() * self.target_rate).ceil() as i64 - 1;

        for next in samples {
            let (t0, t1) = (previous.secs(), next.secs());
            loop {
                let time = self.tick_time(tick);
                if time > t1 {
                    break;
                }
                if time >= t0 {
                    points.push(ResampledPoint {
                        tick,
                        timestamp: time,
                        value: interpolate(previous, next, time),
                    });
                }
                tick += 1;
            }
            previous = next;
        }

        points
    }

    /// Resample several channels of `buffer` over the trailing `max_age`
    /// and group the results by tick, in ascending tick order
    pub fn resample_frames(
        &self,
        buffer: &SampleBuffer,
        channels: &BTreeSet<usize>,
        max_age: Duration,
    ) -> Vec<ResampledFrame> {
        let channel_count = buffer.channel_count();
        let mut frames: BTreeMap<i64, ResampledFrame> = BTreeMap::new();

        for &channel in channels.iter().filter(|&&c| c < channel_count) {
            for point in self.resample(buffer.snapshot(channel, max_age)) {
                frames
                    .entry(point.tick)
                    .or_insert_with(|| {
                        ResampledFrame::empty(point.tick, point.timestamp, channel_count)
                    })
                    .values[channel] = Some(point.value);
            }
        }

        frames.into_values().collect()
    }
}

fn interpolate(a: &Sample, b: &Sample, time: f64) -> f64 {
    let (t0, t1) = (a.secs(), b.secs());
    let span = t1 - t0;
    if span <= 0.0 {
        return b.value;
    }
    let fraction = (time - t0) / span;
    a.value + (b.value - a.value) * fraction
}
