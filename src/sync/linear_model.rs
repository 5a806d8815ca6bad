//! Ordinary least squares model of swap time as a function of swap unit.
//!
//! `time = slope * unit + intercept`, fitted over the most recent N swaps of a
//! container. Units and times are re-centred on the first sample before the
//! fit so the sums stay well conditioned for large unit counts.

use std::sync::Arc;

use crate::core::time::Time;
use crate::sync::swap_data::{SwapData, SwapDataContainer};

/// Linear fit of swap times against swap units.
#[derive(Debug)]
pub struct SwapLinearModel {
    container: Arc<SwapDataContainer>,
    required_samples: usize,
    fit: Option<Fit>,
    fitted_sequence: Option<u64>,
}

/// Least squares line expressed relative to an origin sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Fit {
    origin_unit: u64,
    origin_nanos: f64,
    /// Nanoseconds per unit.
    slope: f64,
    /// Nanoseconds at `origin_unit`, relative to `origin_nanos`.
    offset: f64,
}

impl SwapLinearModel {
    pub fn new(container: Arc<SwapDataContainer>, required_samples: usize) -> Self {
        Self {
            container,
            required_samples: required_samples.max(2),
            fit: None,
            fitted_sequence: None,
        }
    }

    pub fn required_samples(&self) -> usize {
        self.required_samples
    }

    pub fn set_required_samples(&mut self, n: usize) {
        self.required_samples = n.max(2);
        self.fitted_sequence = None;
    }

    /// Refit if the container changed since the last fit.
    ///
    /// Returns whether a usable fit exists afterwards.
    pub fn update(&mut self) -> bool {
        let sequence = self.container.sequence();
        if self.fitted_sequence == Some(sequence) {
            return self.fit.is_some();
        }
        let (data, sequence) = self.container.recent(self.required_samples);
        self.fit = if data.len() >= self.required_samples {
            fit_ols(&data)
        } else {
            None
        };
        self.fitted_sequence = Some(sequence);
        self.fit.is_some()
    }

    /// Whether the model is fitted on enough samples and up to date.
    pub fn is_usable(&self) -> bool {
        self.fit.is_some() && self.fitted_sequence == Some(self.container.sequence())
    }

    /// Whether a fit exists, regardless of staleness.
    pub fn has_fit(&self) -> bool {
        self.fit.is_some()
    }

    /// Time per unit.
    pub fn slope(&self) -> Option<f64> {
        self.fit.map(|f| f.slope)
    }

    /// Predicted time of unit zero, in nanoseconds.
    pub fn intercept(&self) -> Option<f64> {
        self.fit
            .map(|f| f.origin_nanos + f.offset - f.slope * f.origin_unit as f64)
    }

    /// Predicted time of `unit`.
    pub fn y(&self, unit: u64) -> Option<Time> {
        self.fit.map(|f| f.y(unit))
    }

    /// Predicted (fractional) unit reached at `time`.
    pub fn x(&self, time: Time) -> Option<f64> {
        self.fit.and_then(|f| {
            if f.slope == 0.0 {
                return None;
            }
            let dt = time.as_nanos_f64() - f.origin_nanos - f.offset;
            Some(f.origin_unit as f64 + dt / f.slope)
        })
    }

    pub fn container(&self) -> &Arc<SwapDataContainer> {
        &self.container
    }
}

impl Fit {
    pub(crate) fn slope(&self) -> f64 {
        self.slope
    }

    pub(crate) fn y(&self, unit: u64) -> Time {
        let du = unit as f64 - self.origin_unit as f64;
        Time::from_nanos_f64(self.origin_nanos + self.offset + self.slope * du)
    }
}

/// Fit `data` by ordinary least squares. Needs at least two distinct units.
pub(crate) fn fit_ols(data: &[SwapData]) -> Option<Fit> {
    let first = data.first()?;
    let origin_unit = first.unit;
    let origin_nanos = first.time.as_nanos_f64();
    let n = data.len() as f64;

    let xs = data.iter().map(|d| (d.unit - origin_unit) as f64);
    let ys = data.iter().map(|d| d.time.as_nanos_f64() - origin_nanos);
    let mean_x = xs.clone().sum::<f64>() / n;
    let mean_y = ys.clone().sum::<f64>() / n;

    let (sxx, sxy) = xs.zip(ys).fold((0.0, 0.0), |(sxx, sxy), (x, y)| {
        let dx = x - mean_x;
        (sxx + dx * dx, sxy + dx * (y - mean_y))
    });
    if sxx == 0.0 {
        return None;
    }
    let slope = sxy / sxx;
    Some(Fit {
        origin_unit,
        origin_nanos,
        slope,
        offset: mean_y - slope * mean_x,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_with(points: &[(u64, i64)]) -> Arc<SwapDataContainer> {
        let container = SwapDataContainer::shared(100, 1);
        for &(unit, micros) in points {
            container.store(unit, Time::from_micros(micros));
        }
        container
    }

    #[test]
    fn test_not_ready_below_required_samples() {
        let container = container_with(&[(1, 0), (2, 16_667)]);
        let mut model = SwapLinearModel::new(container, 3);
        assert!(!model.update());
        assert!(!model.is_usable());
        assert_eq!(model.y(3), None);
    }

    #[test]
    fn test_exact_line() {
        let points: Vec<(u64, i64)> = (0..10).map(|k| (100 + k, 5_000 + 16_000 * k as i64)).collect();
        let container = container_with(&points);
        let mut model = SwapLinearModel::new(container, 10);
        assert!(model.update());
        assert!((model.slope().unwrap() - 16_000_000.0).abs() < 1e-3);
        assert!((model.intercept().unwrap() - (5_000_000.0 - 100.0 * 16_000_000.0)).abs() < 1.0);
        assert_eq!(model.y(110), Some(Time::from_micros(5_000 + 16_000 * 10)));
        let x = model.x(Time::from_micros(5_000 + 16_000 * 4)).unwrap();
        assert!((x - 104.0).abs() < 1e-9);
    }

    #[test]
    fn test_fits_last_n_only() {
        // an early outlier falls out of the window
        let mut points = vec![(1u64, 0i64), (2, 90_000)];
        points.extend((3..8).map(|u| (u as u64, 100_000 + 10_000 * (u as i64 - 3))));
        let container = container_with(&points);
        let mut model = SwapLinearModel::new(container, 5);
        assert!(model.update());
        assert!((model.slope().unwrap() - 10_000_000.0).abs() < 1e-3);
    }

    #[test]
    fn test_staleness() {
        let container = container_with(&[(1, 0), (2, 10_000), (3, 20_000)]);
        let mut model = SwapLinearModel::new(container.clone(), 3);
        assert!(model.update());
        assert!(model.is_usable());
        container.store(4, Time::from_micros(30_000));
        assert!(!model.is_usable());
        assert!(model.has_fit());
        assert!(model.update());
        assert!(model.is_usable());
    }

    #[test]
    fn test_large_units_stay_precise() {
        let base = 48_000u64 * 3_600 * 10;
        let points: Vec<(u64, i64)> = (0..8).map(|k| (base + 256 * k, 36_000_000_000 + 5_333 * k as i64)).collect();
        let container = container_with(&points);
        let mut model = SwapLinearModel::new(container, 8);
        assert!(model.update());
        let predicted = model.y(base + 256 * 8).unwrap();
        assert!((predicted - Time::from_micros(36_000_000_000 + 5_333 * 8)).abs() < Time::from_nanos(10));
    }
}
