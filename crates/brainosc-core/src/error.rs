//! Error handling for the brainosc pipeline
//!
//! Every per-stage and per-channel failure the pipeline can observe has a
//! variant here. The orchestrator contains all of them inside a cycle and
//! surfaces them as counters; only configuration errors are returned to the
//! caller directly.

use thiserror::Error;

/// Result type alias for brainosc operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Error taxonomy for the real-time signal pipeline
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    /// A configuration value was rejected; the previous configuration stays active
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the rejected value
        message: String,
    },

    /// The upstream producer returned no new samples this cycle
    #[error("Acquisition gap: no new samples ({consecutive} consecutive cycles)")]
    AcquisitionGap {
        /// Length of the current run of empty pulls
        consecutive: u32,
    },

    /// Not enough samples to run a stage
    #[error("Insufficient window: need {required} samples, have {available}")]
    InsufficientWindow {
        /// Samples the stage needs
        required: usize,
        /// Samples actually available
        available: usize,
    },

    /// An outbound message could not be delivered
    #[error("Transport error sending to {address}: {reason}")]
    Transport {
        /// Address pattern of the failed message
        address: String,
        /// Transport-level reason
        reason: String,
    },

    /// Filter estimate or variance left the sane numeric range
    #[error("Filter divergence on channel {channel}: estimate {estimate}, variance {variance}")]
    FilterDivergence {
        /// Channel whose state was reset
        channel: usize,
        /// Offending estimate
        estimate: f64,
        /// Offending variance
        variance: f64,
    },

    /// Sample addressed a channel outside the configured range
    #[error("Channel {channel} out of range (channel count {channel_count})")]
    ChannelOutOfRange {
        /// Requested channel
        channel: usize,
        /// Configured channel count
        channel_count: usize,
    },

    /// Sample is older than its channel's watermark
    #[error("Stale sample on channel {channel}: {timestamp_ns}ns is before watermark {watermark_ns}ns")]
    StaleSample {
        /// Channel of the rejected sample
        channel: usize,
        /// Timestamp of the rejected sample
        timestamp_ns: u64,
        /// Latest accepted timestamp on that channel
        watermark_ns: u64,
    },
}

impl StreamError {
    /// Shorthand for a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        StreamError::Configuration {
            message: message.into(),
        }
    }

    /// Shorthand for a transport error
    pub fn transport(address: impl Into<String>, reason: impl Into<String>) -> Self {
        StreamError::Transport {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Short, stable name of the error kind, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::Configuration { .. } => "configuration",
            StreamError::AcquisitionGap { .. } => "acquisition_gap",
            StreamError::InsufficientWindow { .. } => "insufficient_window",
            StreamError::Transport { .. } => "transport",
            StreamError::FilterDivergence { .. } => "filter_divergence",
            StreamError::ChannelOutOfRange { .. } => "channel_out_of_range",
            StreamError::StaleSample { .. } => "stale_sample",
        }
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::StreamError::Configuration {
            message: format!($($arg)*),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StreamError::ChannelOutOfRange {
            channel: 12,
            channel_count: 8,
        };
        let display = format!("{}", error);
        assert!(display.contains("out of range"));
        assert!(display.contains("12"));
        assert!(display.contains("8"));
    }

    #[test]
    fn test_config_error_macro() {
        let error = config_error!("target_rate must be positive, got {}", -1.0);
        assert_eq!(error.kind(), "configuration");
        assert!(error.to_string().contains("-1"));
    }

    #[test]
    fn test_error_equality() {
        let error1 = StreamError::transport("/eeg/ch0/time", "refused");
        let error2 = StreamError::transport("/eeg/ch0/time", "refused");
        assert_eq!(error1, error2);
    }
}
