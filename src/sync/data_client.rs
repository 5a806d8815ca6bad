//! A synchronization participant: one swap data source, its linear model and
//! its verifier.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use crate::core::time::Time;
use crate::sync::linear_model::SwapLinearModel;
use crate::sync::swap_data::{SwapData, SwapDataContainer};
use crate::sync::verifier::{SyncVerifier, SyncVerifierConfig, VerifierTests};

/// Parameters of a data client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataClientConfig {
    /// How much swapping history the model and verifier look at.
    pub collection_duration: Time,
    /// Allowed deviation from the nominal period, as a fraction of it.
    pub tolerance: f64,
    pub tests: VerifierTests,
}

impl Default for DataClientConfig {
    fn default() -> Self {
        Self {
            collection_duration: Time::from_millis(500),
            tolerance: 0.25,
            tests: VerifierTests::default(),
        }
    }
}

#[derive(Debug)]
struct ClientState {
    model: SwapLinearModel,
    verifier: SyncVerifier,
    autoupdate: bool,
}

/// Model and verifier bound to one swap data container.
///
/// # Thread Safety
///
/// Internally locked; the model refits lazily whenever the container has new
/// data and a prediction is requested.
#[derive(Debug)]
pub struct DataClient {
    container: Arc<SwapDataContainer>,
    nominal_period: Time,
    required_swaps: usize,
    state: Mutex<ClientState>,
}

impl DataClient {
    /// Create a client over `container`.
    ///
    /// # Arguments
    ///
    /// * `nominal_period` - Expected time between two swaps of the source.
    /// * `config` - Collection duration and tolerance. The number of required
    ///   swaps is `ceil(collection_duration / nominal_period)`, at least 2.
    pub fn new(container: Arc<SwapDataContainer>, nominal_period: Time, config: DataClientConfig) -> Self {
        let required_swaps = required_swaps(config.collection_duration, nominal_period);
        let verifier = SyncVerifier::new(
            container.clone(),
            SyncVerifierConfig {
                required_swaps,
                nominal_period,
                period_tolerance: config.tolerance,
                tests: config.tests,
            },
        );
        Self {
            state: Mutex::new(ClientState {
                model: SwapLinearModel::new(container.clone(), required_swaps),
                verifier,
                autoupdate: true,
            }),
            container,
            nominal_period,
            required_swaps,
        }
    }

    pub fn container(&self) -> &Arc<SwapDataContainer> {
        &self.container
    }

    pub fn nominal_period(&self) -> Time {
        self.nominal_period
    }

    pub fn required_swaps(&self) -> usize {
        self.required_swaps
    }

    /// When disabled, predictions use the last fit even if newer data exist.
    pub fn set_autoupdate(&self, autoupdate: bool) {
        self.state.lock().autoupdate = autoupdate;
    }

    /// Refit the model on the current data.
    pub fn update(&self) -> bool {
        self.state.lock().model.update()
    }

    /// Whether the verifier accepts the current data.
    pub fn all_ready(&self) -> bool {
        let mut state = self.state.lock();
        if state.autoupdate {
            state.model.update();
        }
        state.verifier.is_synchronized()
    }

    /// Whether the model is fitted on enough samples and up to date.
    pub fn model_usable(&self) -> bool {
        let mut state = self.state.lock();
        if state.autoupdate {
            state.model.update();
        }
        state.model.is_usable()
    }

    pub fn store_prediction(&self, unit: u64, time: Time) {
        self.state.lock().verifier.store_prediction(unit, time);
    }

    /// Predicted time at which `unit` is reached.
    ///
    /// Asking for the last observed unit returns the observed time itself.
    pub fn predict_time_at(&self, unit: u64) -> Option<Time> {
        if let Some(last) = self.container.last_swap_data() {
            if last.unit == unit {
                return Some(last.time);
            }
        }
        let mut state = self.state.lock();
        if state.autoupdate {
            state.model.update();
        }
        state.model.y(unit)
    }

    /// Predicted fractional unit reached at `time`.
    pub fn predict_unit_at(&self, time: Time) -> Option<f64> {
        let mut state = self.state.lock();
        if state.autoupdate {
            state.model.update();
        }
        state.model.x(time)
    }

    /// Predicted time of the next swap.
    pub fn predict_next_swap_time(&self) -> Option<Time> {
        self.predict_time_at(self.container.next_swap_unit())
    }

    /// Predicted time from `now` until the next swap. Negative when overdue.
    pub fn predict_time_to_next_swap(&self, now: Time) -> Option<Time> {
        self.predict_next_swap_time().map(|t| t - now)
    }

    pub fn last_swap_data(&self) -> Option<SwapData> {
        self.container.last_swap_data()
    }
}

fn required_swaps(duration: Time, period: Time) -> usize {
    if period <= Time::ZERO {
        return 2;
    }
    let swaps = (duration / period).ceil();
    if swaps < 2.0 {
        info!(
            "Collection duration {} covers fewer than 2 swaps of {}, using 2",
            duration, period
        );
        return 2;
    }
    swaps as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Time = Time::from_micros(16_667);

    fn client_with(count: u64) -> DataClient {
        let container = SwapDataContainer::shared(100, 1);
        for k in 1..=count {
            container.store(k, Time::from_secs(1) + PERIOD * k as i64);
        }
        DataClient::new(
            container,
            PERIOD,
            DataClientConfig {
                collection_duration: PERIOD * 5,
                ..DataClientConfig::default()
            },
        )
    }

    #[test]
    fn test_required_swaps() {
        assert_eq!(required_swaps(Time::from_millis(100), PERIOD), 6);
        assert_eq!(required_swaps(Time::from_millis(1), PERIOD), 2);
        assert_eq!(required_swaps(Time::ZERO, PERIOD), 2);
    }

    #[test]
    fn test_ready_and_predictions() {
        let client = client_with(12);
        assert_eq!(client.required_swaps(), 5);
        assert!(client.all_ready());
        assert!(client.model_usable());
        let next = client.predict_next_swap_time().unwrap();
        assert!((next - (Time::from_secs(1) + PERIOD * 13)).abs() < Time::from_micros(1));
        let now = Time::from_secs(1) + PERIOD * 12 + Time::from_millis(10);
        let to_next = client.predict_time_to_next_swap(now).unwrap();
        assert!((to_next - (PERIOD - Time::from_millis(10))).abs() < Time::from_micros(1));
        let unit = client.predict_unit_at(Time::from_secs(1) + PERIOD * 20).unwrap();
        assert!((unit - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_last_observed_unit_returns_observed_time() {
        let container = SwapDataContainer::shared(100, 1);
        for k in 1..=10u64 {
            // jitter so the fit does not pass exactly through the last point
            let jitter = if k % 2 == 0 { 300 } else { -300 };
            container.store(k, PERIOD * k as i64 + Time::from_micros(jitter));
        }
        let client = DataClient::new(container, PERIOD, DataClientConfig::default());
        assert_eq!(client.predict_time_at(10), Some(PERIOD * 10 + Time::from_micros(300)));
    }

    #[test]
    fn test_not_ready_without_data() {
        let client = client_with(0);
        assert!(!client.all_ready());
        assert!(!client.model_usable());
        assert_eq!(client.predict_next_swap_time(), None);
    }

    #[test]
    fn test_autoupdate_off_keeps_last_fit() {
        let client = client_with(6);
        assert!(client.model_usable());
        client.set_autoupdate(false);
        client.container().store(7, Time::from_secs(1) + PERIOD * 7);
        assert!(!client.model_usable());
        assert!(client.update());
        assert!(client.model_usable());
    }
}
