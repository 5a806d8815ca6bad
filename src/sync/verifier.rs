//! Decides whether a swap source is swapping regularly enough to be trusted.
//!
//! Four independent tests can be enabled:
//!
//! * **intervals** - each of the last N-1 inter-swap intervals is within the
//!   nominal period ± tolerance
//! * **stored predictions** - predictions recorded with
//!   [`SyncVerifier::store_prediction`] match the swaps that followed
//! * **model slope** - the fitted time per swap is within tolerance of the
//!   nominal period
//! * **model predictions** - a model fitted on the N swaps preceding each of
//!   the most recent swaps predicted that swap within tolerance
//!
//! The result is cached until the container or the stored predictions change.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::time::Time;
use crate::sync::linear_model::fit_ols;
use crate::sync::swap_data::{SwapData, SwapDataContainer};

/// Number of recent swaps checked against retro-fitted model predictions.
const MODEL_PREDICTION_CHECKS: usize = 3;

/// Which verifier tests are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifierTests {
    pub intervals: bool,
    pub stored_predictions: bool,
    pub model_slope: bool,
    pub model_predictions: bool,
}

impl VerifierTests {
    pub fn any(&self) -> bool {
        self.intervals || self.stored_predictions || self.model_slope || self.model_predictions
    }
}

impl Default for VerifierTests {
    fn default() -> Self {
        Self {
            intervals: true,
            stored_predictions: false,
            model_slope: true,
            model_predictions: true,
        }
    }
}

/// Verifier parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncVerifierConfig {
    /// N: number of swaps the tests look at.
    pub required_swaps: usize,
    /// P: expected time between two swaps.
    pub nominal_period: Time,
    /// r: allowed deviation as a fraction of P.
    pub period_tolerance: f64,
    pub tests: VerifierTests,
}

impl SyncVerifierConfig {
    /// Allowed absolute deviation, `P * r`.
    pub fn allowed_error(&self) -> Time {
        self.nominal_period * self.period_tolerance
    }
}

/// Evaluates the enabled tests over a swap data container.
#[derive(Debug)]
pub struct SyncVerifier {
    config: SyncVerifierConfig,
    container: Arc<SwapDataContainer>,
    predictions: VecDeque<SwapData>,
    cached: Option<(u64, bool)>,
}

impl SyncVerifier {
    pub fn new(container: Arc<SwapDataContainer>, mut config: SyncVerifierConfig) -> Self {
        if !config.tests.any() {
            warn!("No sync verifier test enabled, enabling the interval test");
            config.tests.intervals = true;
        }
        if config.required_swaps < 2 {
            config.required_swaps = 2;
        }
        Self {
            config,
            container,
            predictions: VecDeque::new(),
            cached: None,
        }
    }

    pub fn config(&self) -> &SyncVerifierConfig {
        &self.config
    }

    /// Record a prediction for the stored-predictions test.
    pub fn store_prediction(&mut self, unit: u64, time: Time) {
        if self.predictions.len() == self.config.required_swaps {
            self.predictions.pop_front();
        }
        self.predictions.push_back(SwapData::new(unit, time));
        self.cached = None;
    }

    /// Whether all enabled tests pass on the current data.
    pub fn is_synchronized(&mut self) -> bool {
        let sequence = self.container.sequence();
        if let Some((cached_sequence, result)) = self.cached {
            if cached_sequence == sequence {
                return result;
            }
        }
        let result = self.evaluate();
        self.cached = Some((sequence, result));
        result
    }

    fn evaluate(&self) -> bool {
        let n = self.config.required_swaps;
        let window = if self.config.tests.model_predictions {
            n + MODEL_PREDICTION_CHECKS
        } else {
            n
        };
        let (data, _) = self.container.recent(window);
        if data.len() < n {
            return false;
        }
        let tests = self.config.tests;
        let recent = &data[data.len() - n..];

        if tests.intervals && !self.intervals_ok(recent) {
            debug!("Sync verifier: interval test failed");
            return false;
        }
        if tests.stored_predictions && !self.stored_predictions_ok(&data) {
            debug!("Sync verifier: stored prediction test failed");
            return false;
        }
        if tests.model_slope && !self.slope_ok(recent) {
            debug!("Sync verifier: model slope test failed");
            return false;
        }
        if tests.model_predictions && !self.model_predictions_ok(&data) {
            debug!("Sync verifier: model prediction test failed");
            return false;
        }
        true
    }

    fn intervals_ok(&self, recent: &[SwapData]) -> bool {
        let period = self.config.nominal_period;
        let allowed = self.config.allowed_error();
        recent
            .windows(2)
            .all(|w| ((w[1].time - w[0].time) - period).abs() <= allowed)
    }

    fn stored_predictions_ok(&self, data: &[SwapData]) -> bool {
        let allowed = self.config.allowed_error();
        let mut compared = 0usize;
        for prediction in &self.predictions {
            if let Some(actual) = data.iter().find(|d| d.unit == prediction.unit) {
                if (actual.time - prediction.time).abs() > allowed {
                    return false;
                }
                compared += 1;
            }
        }
        compared > 0
    }

    fn slope_ok(&self, recent: &[SwapData]) -> bool {
        let Some(fit) = fit_ols(recent) else {
            return false;
        };
        let per_swap = fit.slope() * self.container.swap_advances_units() as f64;
        let period = self.config.nominal_period.as_nanos_f64();
        (per_swap - period).abs() <= self.config.allowed_error().as_nanos_f64()
    }

    fn model_predictions_ok(&self, data: &[SwapData]) -> bool {
        let n = self.config.required_swaps;
        if data.len() <= n {
            return false;
        }
        let allowed = self.config.allowed_error();
        (n..data.len()).all(|i| match fit_ols(&data[i - n..i]) {
            Some(fit) => (fit.y(data[i].unit) - data[i].time).abs() <= allowed,
            None => false,
        })
    }
}
