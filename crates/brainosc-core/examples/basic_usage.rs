//! Basic usage of the sample buffer
//!
//! Feeds a scripted source into a buffer, shows how stale and out-of-range
//! samples are rejected, takes a windowed snapshot and reclaims memory.

use brainosc_core::{
    IngestOutcome, Sample, SampleBuffer, SampleSource, ScriptedSource, StreamError, StreamResult,
    Timestamp,
};
use std::time::Duration;

const CHANNELS: usize = 2;
const RATE: f64 = 250.0;

fn main() -> StreamResult<()> {
    println!("=== brainosc-core buffer walkthrough ===\n");

    // One second of window at 250 Hz per channel
    let capacity = SampleBuffer::capacity_for(1.0, RATE);
    let mut buffer = SampleBuffer::new(CHANNELS, capacity);
    println!("capacity per channel: {}", buffer.capacity());

    let mut source = ScriptedSource::new(CHANNELS);
    for batch in 0..12 {
        source.push_batch(batch_of(batch, 25));
    }

    let mut evictions = 0;
    while source.remaining() > 0 {
        for sample in source.pull() {
            if buffer.ingest(sample)? == IngestOutcome::Evicted {
                evictions += 1;
            }
        }
    }
    println!("ingested 12 batches, {} evictions", evictions);

    // Late and misaddressed samples are rejected but not fatal
    match buffer.ingest(Sample::at_secs(0, 1.0, 0.5)) {
        Err(StreamError::StaleSample { .. }) => println!("stale sample rejected"),
        other => println!("unexpected: {:?}", other),
    }
    match buffer.ingest(Sample::at_secs(7, 1.0, 2.0)) {
        Err(e) => println!("{} ({})", e, e.kind()),
        Ok(_) => println!("unexpected acceptance"),
    }

    // The last 200 ms of channel 0
    let recent: Vec<f64> = buffer
        .snapshot(0, Duration::from_millis(200))
        .map(|s| s.value)
        .collect();
    println!("last 200 ms of channel 0: {} samples", recent.len());

    let dropped = buffer.reclaim(Duration::from_millis(500));
    println!("reclaimed {} samples outside a 500 ms window", dropped);

    if let Some(latest) = buffer.latest() {
        println!("latest timestamp: {}", latest);
    }
    println!("stats: {:?}", buffer.stats());
    Ok(())
}

/// `frames` frames of a 10 Hz sine starting at frame `batch * frames`
fn batch_of(batch: usize, frames: usize) -> Vec<Sample> {
    (0..frames)
        .flat_map(|i| {
            let frame = batch * frames + i;
            let secs = frame as f64 / RATE;
            let timestamp = Timestamp::from_secs_f64(secs);
            let value = (2.0 * std::f64::consts::PI * 10.0 * secs).sin();
            (0..CHANNELS).map(move |channel| Sample::new(channel, value, timestamp))
        })
        .collect()
}
