//! Pre-defined EEG rhythm patterns for synthetic acquisition

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Deterministic part of a synthetic EEG channel, in microvolts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPattern {
    /// Flat line at a fixed level
    Constant { level: f64 },
    /// Single sustained rhythm
    Rhythm { frequency: f64, amplitude: f64 },
    /// Rhythm that waxes and wanes (alpha bursts, sleep spindles)
    Bursts {
        frequency: f64,
        amplitude: f64,
        on_duration: f64,
        off_duration: f64,
    },
    /// Linear frequency sweep, repeating every `duration` seconds
    Sweep {
        start_frequency: f64,
        end_frequency: f64,
        duration: f64,
        amplitude: f64,
    },
    /// Two rhythms superimposed
    Dual {
        low_frequency: f64,
        low_amplitude: f64,
        high_frequency: f64,
        high_amplitude: f64,
    },
}

impl SignalPattern {
    /// Value at `time` seconds for `channel`; channels are phase shifted
    /// so they are not identical copies
    pub fn value_at(&self, time: f64, channel: usize) -> f64 {
        let phase = channel as f64 * PI / 4.0;
        match *self {
            SignalPattern::Constant { level } => level,

            SignalPattern::Rhythm { frequency, amplitude } => {
                amplitude * (2.0 * PI * frequency * time + phase).sin()
            }

            SignalPattern::Bursts { frequency, amplitude, on_duration, off_duration } => {
                let period = on_duration + off_duration;
                if period <= 0.0 {
                    return 0.0;
                }
                let position = time.rem_euclid(period);
                if position >= on_duration {
                    return 0.0;
                }
                // Smooth envelope so bursts do not start with a step
                let envelope = (PI * position / on_duration).sin();
                amplitude * envelope * (2.0 * PI * frequency * time + phase).sin()
            }

            SignalPattern::Sweep { start_frequency, end_frequency, duration, amplitude } => {
                if duration <= 0.0 {
                    return 0.0;
                }
                let t = time.rem_euclid(duration);
                let rate = (end_frequency - start_frequency) / duration;
                let instantaneous_phase = 2.0 * PI * (start_frequency * t + 0.5 * rate * t * t);
                amplitude * (instantaneous_phase + phase).sin()
            }

            SignalPattern::Dual { low_frequency, low_amplitude, high_frequency, high_amplitude } => {
                low_amplitude * (2.0 * PI * low_frequency * time + phase).sin()
                    + high_amplitude * (2.0 * PI * high_frequency * time + phase).sin()
            }
        }
    }

    /// Frequency carrying most of the pattern's power at `time`, if any
    pub fn dominant_frequency(&self, time: f64) -> Option<f64> {
        match *self {
            SignalPattern::Constant { .. } => None,
            SignalPattern::Rhythm { frequency, .. } | SignalPattern::Bursts { frequency, .. } => Some(frequency),
            SignalPattern::Sweep { start_frequency, end_frequency, duration, .. } => {
                if duration <= 0.0 {
                    return None;
                }
                let t = time.rem_euclid(duration);
                Some(start_frequency + (end_frequency - start_frequency) * t / duration)
            }
            SignalPattern::Dual { low_frequency, low_amplitude, high_frequency, high_amplitude } => {
                Some(if high_amplitude > low_amplitude { high_frequency } else { low_frequency })
            }
        }
    }

    /// Get pattern description
    pub fn description(&self) -> &'static str {
        match self {
            SignalPattern::Constant { .. } => "Flat line",
            SignalPattern::Rhythm { .. } => "Sustained rhythm",
            SignalPattern::Bursts { .. } => "Waxing and waning rhythm",
            SignalPattern::Sweep { .. } => "Frequency sweep",
            SignalPattern::Dual { .. } => "Two superimposed rhythms",
        }
    }

    /// Common preset patterns
    pub fn presets() -> Vec<(&'static str, SignalPattern)> {
        vec![
            ("Flat", SignalPattern::Constant { level: 0.0 }),
            ("Eyes Closed", SignalPattern::Bursts {
                frequency: 10.0, amplitude: 40.0, on_duration: 2.0, off_duration: 0.5
            }),
            ("Focused", SignalPattern::Rhythm { frequency: 20.0, amplitude: 10.0 }),
            ("Drowsy", SignalPattern::Dual {
                low_frequency: 6.0, low_amplitude: 30.0, high_frequency: 10.0, high_amplitude: 10.0
            }),
            ("Sleep Spindles", SignalPattern::Bursts {
                frequency: 13.0, amplitude: 25.0, on_duration: 1.0, off_duration: 4.0
            }),
            ("Sweep 1-40 Hz", SignalPattern::Sweep {
                start_frequency: 1.0, end_frequency: 40.0, duration: 10.0, amplitude: 20.0
            }),
        ]
    }
}

impl Default for SignalPattern {
    fn default() -> Self {
        SignalPattern::Bursts {
            frequency: 10.0,
            amplitude: 40.0,
            on_duration: 2.0,
            off_duration: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rhythm_amplitude_bound() {
        let pattern = SignalPattern::Rhythm { frequency: 10.0, amplitude: 5.0 };
        for i in 0..1000 {
            assert!(pattern.value_at(i as f64 * 0.001, 2).abs() <= 5.0 + 1e-12);
        }
        assert_eq!(pattern.dominant_frequency(3.0), Some(10.0));
    }

    #[test]
    fn test_bursts_are_silent_between_bursts() {
        let pattern = SignalPattern::Bursts {
            frequency: 10.0,
            amplitude: 1.0,
            on_duration: 1.0,
            off_duration: 1.0,
        };
        assert_eq!(pattern.value_at(1.5, 0), 0.0);
        assert_eq!(pattern.value_at(3.25, 1), 0.0);
        assert!(pattern.value_at(0.525, 0).abs() > 0.5);
    }

    #[test]
    fn test_sweep_frequency_progresses() {
        let pattern = SignalPattern::Sweep {
            start_frequency: 1.0,
            end_frequency: 41.0,
            duration: 10.0,
            amplitude: 1.0,
        };
        assert_eq!(pattern.dominant_frequency(0.0), Some(1.0));
        assert_eq!(pattern.dominant_frequency(5.0), Some(21.0));
        assert_eq!(pattern.dominant_frequency(15.0), Some(21.0));
    }

    #[test]
    fn test_presets_serialize() {
        for (name, pattern) in SignalPattern::presets() {
            let json = serde_json::to_string(&pattern).unwrap();
            let back: SignalPattern = serde_json::from_str(&json).unwrap();
            assert_eq!(back, pattern, "preset {}", name);
        }
    }
}
