//! brainosc-simulation: synthetic EEG acquisition
//!
//! A seeded multi-channel board with realistic noise and timestamp jitter,
//! usable directly as a [`brainosc_core::SampleSource`] or driven in real
//! time on a tokio task.

pub mod real_time_stream;
pub mod signal_patterns;
pub mod synthetic_board;

pub use real_time_stream::*;
pub use signal_patterns::*;
pub use synthetic_board::*;
