//! brainosc-core: Foundation types for the real-time biosignal pipeline
//!
//! Samples, timestamps, per-cycle frames, the per-channel sample buffer and
//! the upstream producer trait.

pub mod buffer;
pub mod error;
pub mod frames;
pub mod sample;
pub mod source;
pub mod timestamp;

pub use buffer::{BufferStats, IngestOutcome, SampleBuffer, Snapshot};
pub use error::{StreamError, StreamResult};
pub use frames::{ResampledFrame, ResampledPoint, SpectralBin, SpectralFrame};
pub use sample::Sample;
pub use source::{SampleSource, ScriptedSource};
pub use timestamp::Timestamp;
