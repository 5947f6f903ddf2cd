//! Scalar Kalman filter bank
//!
//! One random-walk filter per selected channel. Each resampled tick runs a
//! predict step (`P += Q`) followed by an update against the measurement:
//!
//! ```text
//! K = P / (P + R)
//! x = x + K (z - x)
//! P = (1 - K) P
//! ```
//!
//! Retuning `Q` or `R` never resets state; only deselecting a channel (or a
//! numeric divergence) does.

use brainosc_core::{config_error, StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tunable filter parameters, shared by every channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KalmanParams {
    /// Process noise variance `Q`
    pub process_noise: f64,
    /// Measurement noise variance `R`
    pub measurement_noise: f64,
    /// Estimate of a freshly created filter
    pub initial_estimate: f64,
    /// Variance of a freshly created filter
    pub initial_covariance: f64,
    /// Variance never drops below this
    pub variance_floor: f64,
    /// Estimate or variance magnitudes above this count as divergence
    pub divergence_limit: f64,
}

impl KalmanParams {
    /// Check every parameter is usable
    pub fn validate(&self) -> StreamResult<()> {
        if !(self.process_noise.is_finite() && self.process_noise > 0.0) {
            return Err(config_error!(
                "kalman.process_noise must be positive, got {}",
                self.process_noise
            ));
        }
        if !(self.measurement_noise.is_finite() && self.measurement_noise > 0.0) {
            return Err(config_error!(
                "kalman.measurement_noise must be positive, got {}",
                self.measurement_noise
            ));
        }
        if !self.initial_estimate.is_finite() {
            return Err(config_error!("kalman.initial_estimate must be finite"));
        }
        if !(self.variance_floor.is_finite() && self.variance_floor > 0.0) {
            return Err(config_error!(
                "kalman.variance_floor must be positive, got {}",
                self.variance_floor
            ));
        }
        if !(self.initial_covariance.is_finite() && self.initial_covariance >= self.variance_floor) {
            return Err(config_error!(
                "kalman.initial_covariance must be at least the variance floor, got {}",
                self.initial_covariance
            ));
        }
        if !(self.divergence_limit.is_finite()
            && self.divergence_limit > self.initial_covariance
            && self.divergence_limit > self.initial_estimate.abs())
        {
            return Err(config_error!(
                "kalman.divergence_limit must exceed the initial state, got {}",
                self.divergence_limit
            ));
        }
        Ok(())
    }
}

impl Default for KalmanParams {
    fn default() -> Self {
        Self {
            process_noise: 0.01,
            measurement_noise: 0.1,
            initial_estimate: 0.0,
            initial_covariance: 1.0,
            variance_floor: 1e-9,
            divergence_limit: 1e12,
        }
    }
}

/// Estimate and variance of one channel's filter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterState {
    /// Current estimate `x`
    pub estimate: f64,
    /// Current estimate variance `P`
    pub variance: f64,
    /// Measurements folded in since creation
    pub updates: u64,
}

impl FilterState {
    /// Fresh state from the initial parameters
    pub fn initial(params: &KalmanParams) -> Self {
        Self {
            estimate: params.initial_estimate,
            variance: params.initial_covariance.max(params.variance_floor),
            updates: 0,
        }
    }

    /// Predict step: `P += Q`
    #[inline]
    pub fn predict(&mut self, process_noise: f64) {
        self.variance += process_noise;
    }

    /// Update step against measurement `z`; returns the gain used
    #[inline]
    pub fn update(&mut self, measurement: f64, params: &KalmanParams) -> f64 {
        let gain = self.variance / (self.variance + params.measurement_noise);
        self.estimate += gain * (measurement - self.estimate);
        self.variance = ((1.0 - gain) * self.variance).max(params.variance_floor);
        self.updates += 1;
        gain
    }

    fn is_sane(&self, limit: f64) -> bool {
        self.estimate.is_finite()
            && self.variance.is_finite()
            && self.estimate.abs() <= limit
            && self.variance <= limit
    }
}

/// Per-channel filter states with shared parameters
#[derive(Debug, Clone)]
pub struct KalmanFilterBank {
    states: Vec<Option<FilterState>>,
    params: KalmanParams,
    divergences: u64,
}

impl KalmanFilterBank {
    /// Create a bank for `channel_count` channels, all unselected
    pub fn new(channel_count: usize, params: KalmanParams) -> Self {
        Self {
            states: vec![None; channel_count],
            params,
            divergences: 0,
        }
    }

    /// Filter one measurement for `channel`, creating its state on first use.
    ///
    /// A non-finite or out-of-range result resets that channel alone and is
    /// reported as [`StreamError::FilterDivergence`].
    pub fn filter(&mut self, channel: usize, measurement: f64) -> StreamResult<f64> {
        let params = self.params;
        let channel_count = self.states.len();
        let slot = self
            .states
            .get_mut(channel)
            .ok_or(StreamError::ChannelOutOfRange {
                channel,
                channel_count,
            })?;
        let state = slot.get_or_insert_with(|| FilterState::initial(&params));

        state.predict(params.process_noise);
        state.update(measurement, &params);

        if state.is_sane(params.divergence_limit) {
            return Ok(state.estimate);
        }

        let error = StreamError::FilterDivergence {
            channel,
            estimate: state.estimate,
            variance: state.variance,
        };
        *state = FilterState::initial(&params);
        self.divergences += 1;
        Err(error)
    }

    /// Replace the parameters; existing states keep their estimate and variance
    pub fn set_params(&mut self, params: KalmanParams) {
        self.params = params;
    }

    /// Current parameters
    pub fn params(&self) -> &KalmanParams {
        &self.params
    }

    /// Change the number of channels; states of dropped channels are discarded
    pub fn resize(&mut self, channel_count: usize) {
        self.states.resize(channel_count, None);
    }

    /// Create fresh states for newly selected channels and discard the
    /// states of deselected ones. Returns the channels that were created.
    pub fn sync_selection(&mut self, selected: &BTreeSet<usize>) -> Vec<usize> {
        let params = self.params;
        let mut created = Vec::new();
        for (channel, slot) in self.states.iter_mut().enumerate() {
            match (selected.contains(&channel), slot.is_some()) {
                (true, false) => {
                    *slot = Some(FilterState::initial(&params));
                    created.push(channel);
                }
                (false, true) => *slot = None,
                _ => {}
            }
        }
        created
    }

    /// Return one channel to its initial state
    pub fn reset(&mut self, channel: usize) {
        let params = self.params;
        if let Some(Some(state)) = self.states.get_mut(channel) {
            *state = FilterState::initial(&params);
        }
    }

    /// Discard every state
    pub fn clear(&mut self) {
        self.states.iter_mut().for_each(|s| *s = None);
    }

    /// State of one channel, if it is being filtered
    pub fn state(&self, channel: usize) -> Option<&FilterState> {
        self.states.get(channel).and_then(Option::as_ref)
    }

    /// Current estimate of one channel
    pub fn estimate(&self, channel: usize) -> Option<f64> {
        self.state(channel).map(|s| s.estimate)
    }

    /// Channels with a live state
    pub fn active_channels(&self) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(channel, s)| s.as_ref().map(|_| channel))
    }

    /// Divergence resets since creation
    pub fn divergences(&self) -> u64 {
        self.divergences
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn selected(channels: &[usize]) -> BTreeSet<usize> {
        channels.iter().copied().collect()
    }

    #[test]
    fn test_single_step_matches_equations() {
        let params = KalmanParams {
            process_noise: 0.5,
            measurement_noise: 1.5,
            initial_estimate: 0.0,
            initial_covariance: 1.0,
            ..KalmanParams::default()
        };
        let mut bank = KalmanFilterBank::new(1, params);

        // P = 1.5, K = 0.5, x = 2.0, P = 0.75
        let estimate = bank.filter(0, 4.0).unwrap();
        assert_relative_eq!(estimate, 2.0);
        assert_relative_eq!(bank.state(0).unwrap().variance, 0.75);
        assert_eq!(bank.state(0).unwrap().updates, 1);
    }

    #[test]
    fn test_converges_to_constant() {
        let mut bank = KalmanFilterBank::new(1, KalmanParams::default());
        let mut estimate = 0.0;
        for _ in 0..500 {
            estimate = bank.filter(0, 10.0).unwrap();
        }
        assert_relative_eq!(estimate, 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_retune_keeps_state() {
        let mut bank = KalmanFilterBank::new(2, KalmanParams::default());
        bank.sync_selection(&selected(&[0, 1]));
        for i in 0..20 {
            bank.filter(0, i as f64).unwrap();
        }
        let before = *bank.state(0).unwrap();

        bank.set_params(KalmanParams {
            measurement_noise: 4.0,
            ..KalmanParams::default()
        });
        assert_eq!(bank.state(0), Some(&before));
        assert_eq!(bank.params().measurement_noise, 4.0);
    }

    #[test]
    fn test_deselect_then_reselect_resets() {
        let params = KalmanParams::default();
        let mut bank = KalmanFilterBank::new(3, params);
        bank.sync_selection(&selected(&[0, 1, 2]));
        for _ in 0..10 {
            bank.filter(2, 5.0).unwrap();
        }

        bank.sync_selection(&selected(&[0, 1]));
        assert!(bank.state(2).is_none());

        let created = bank.sync_selection(&selected(&[0, 1, 2]));
        assert_eq!(created, vec![2]);
        assert_eq!(bank.state(2), Some(&FilterState::initial(&params)));
        assert_eq!(bank.active_channels().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_divergence_resets_one_channel() {
        let mut bank = KalmanFilterBank::new(2, KalmanParams::default());
        bank.filter(0, 1.0).unwrap();
        bank.filter(1, 1.0).unwrap();
        let healthy = *bank.state(1).unwrap();

        let result = bank.filter(0, f64::NAN);
        assert!(matches!(result, Err(StreamError::FilterDivergence { channel: 0, .. })));
        assert_eq!(bank.state(0), Some(&FilterState::initial(bank.params())));
        assert_eq!(bank.state(1), Some(&healthy));
        assert_eq!(bank.divergences(), 1);

        assert!(bank.filter(0, 1e300).is_err());
        assert!(bank.filter(0, 2.0).is_ok());
    }

    #[test]
    fn test_out_of_range_channel() {
        let mut bank = KalmanFilterBank::new(2, KalmanParams::default());
        assert!(matches!(
            bank.filter(4, 1.0),
            Err(StreamError::ChannelOutOfRange { channel: 4, channel_count: 2 })
        ));
    }

    #[test]
    fn test_params_validation() {
        assert!(KalmanParams::default().validate().is_ok());
        let bad_r = KalmanParams {
            measurement_noise: 0.0,
            ..KalmanParams::default()
        };
        assert!(bad_r.validate().is_err());
        let bad_q = KalmanParams {
            process_noise: -0.1,
            ..KalmanParams::default()
        };
        assert!(bad_q.validate().is_err());
        let frozen = KalmanParams {
            process_noise: 0.0,
            ..KalmanParams::default()
        };
        assert!(frozen.validate().is_err());

        let bad_floor = KalmanParams {
            variance_floor: 0.0,
            ..KalmanParams::default()
        };
        assert!(bad_floor.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_variance_bounded_after_update(
            q in 1e-6f64..10.0,
            r in 0.001f64..100.0,
            p0 in 0.001f64..100.0,
            measurements in prop::collection::vec(-1e3f64..1e3, 1..100),
        ) {
            let params = KalmanParams {
                process_noise: q,
                measurement_noise: r,
                initial_covariance: p0,
                ..KalmanParams::default()
            };
            let mut state = FilterState::initial(&params);
            for z in measurements {
                state.predict(params.process_noise);
                let predicted = state.variance;
                state.update(z, &params);
                prop_assert!(state.variance <= predicted);
                prop_assert!(state.variance >= params.variance_floor);
                prop_assert!(state.estimate.is_finite());
            }
        }
    }
}
