//! Time representation using nanoseconds.
//!
//! Every timestamp and duration in the crate is a [`Time`]: a signed 64-bit
//! count of nanoseconds. Integer constructors are exact; floating point
//! accessors are provided for statistics and display.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Time constants for conversions
pub mod constants {
    pub const NANOS_PER_HOUR: i64 = 3_600_000_000_000;
    pub const NANOS_PER_MINUTE: i64 = 60_000_000_000;
    pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
    pub const NANOS_PER_MILLI: i64 = 1_000_000;
    pub const NANOS_PER_MICRO: i64 = 1_000;
}

use constants::*;

/// Signed time quantity in nanoseconds.
///
/// Used both as a point on a monotonic clock and as a duration. Ordering,
/// addition and subtraction are plain integer operations on the nanosecond
/// count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Time = Time(0);
    /// Sentinel used for open-ended durations.
    pub const MAX: Time = Time(i64::MAX);
    pub const MIN: Time = Time(i64::MIN);

    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Time(nanos)
    }

    #[inline]
    pub const fn from_micros(micros: i64) -> Self {
        Time(micros * NANOS_PER_MICRO)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Time(millis * NANOS_PER_MILLI)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Time(secs * NANOS_PER_SECOND)
    }

    #[inline]
    pub const fn from_minutes(minutes: i64) -> Self {
        Time(minutes * NANOS_PER_MINUTE)
    }

    #[inline]
    pub const fn from_hours(hours: i64) -> Self {
        Time(hours * NANOS_PER_HOUR)
    }

    /// Convert floating seconds, rounding to the nearest nanosecond.
    #[inline]
    pub fn from_secs_f64(seconds: f64) -> Self {
        Time((seconds * NANOS_PER_SECOND as f64).round() as i64)
    }

    /// Convert floating milliseconds, rounding to the nearest nanosecond.
    #[inline]
    pub fn from_millis_f64(millis: f64) -> Self {
        Time((millis * NANOS_PER_MILLI as f64).round() as i64)
    }

    /// Convert floating nanoseconds, rounding to the nearest nanosecond.
    #[inline]
    pub fn from_nanos_f64(nanos: f64) -> Self {
        Time(nanos.round() as i64)
    }

    #[inline]
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Whole microseconds, truncated toward zero.
    #[inline]
    pub const fn as_micros(self) -> i64 {
        self.0 / NANOS_PER_MICRO
    }

    /// Whole milliseconds, truncated toward zero.
    #[inline]
    pub const fn as_millis(self) -> i64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Whole seconds, truncated toward zero.
    #[inline]
    pub const fn as_secs(self) -> i64 {
        self.0 / NANOS_PER_SECOND
    }

    #[inline]
    pub fn as_nanos_f64(self) -> f64 {
        self.0 as f64
    }

    #[inline]
    pub fn as_micros_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_MICRO as f64
    }

    #[inline]
    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_MILLI as f64
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SECOND as f64
    }

    #[inline]
    pub fn as_minutes_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_MINUTE as f64
    }

    #[inline]
    pub fn as_hours_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_HOUR as f64
    }

    #[inline]
    pub const fn abs(self) -> Self {
        Time(self.0.abs())
    }

    #[inline]
    pub fn min(self, other: Time) -> Time {
        Ord::min(self, other)
    }

    #[inline]
    pub fn max(self, other: Time) -> Time {
        Ord::max(self, other)
    }

    #[inline]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Addition that clamps at the sentinels instead of overflowing.
    #[inline]
    pub const fn saturating_add(self, other: Time) -> Time {
        Time(self.0.saturating_add(other.0))
    }

    #[inline]
    pub const fn saturating_sub(self, other: Time) -> Time {
        Time(self.0.saturating_sub(other.0))
    }

    /// Convert to a `std::time::Duration`, clamping negatives to zero.
    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.max(0) as u64)
    }

    /// Convert from a `std::time::Duration`, clamping at `Time::MAX`.
    pub fn from_std(duration: std::time::Duration) -> Self {
        Time(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }

    /// Sample standard deviation (n - 1 denominator) of a set of times.
    ///
    /// Returns zero for fewer than two samples.
    pub fn std_dev(samples: &[Time]) -> Time {
        if samples.len() < 2 {
            return Time::ZERO;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().map(|t| t.as_nanos_f64()).sum::<f64>() / n;
        let var = samples
            .iter()
            .map(|t| {
                let d = t.as_nanos_f64() - mean;
                d * d
            })
            .sum::<f64>()
            / (n - 1.0);
        Time::from_nanos_f64(var.sqrt())
    }
}

impl Add for Time {
    type Output = Time;

    #[inline]
    fn add(self, rhs: Time) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl AddAssign for Time {
    #[inline]
    fn add_assign(&mut self, rhs: Time) {
        self.0 += rhs.0;
    }
}

impl Sub for Time {
    type Output = Time;

    #[inline]
    fn sub(self, rhs: Time) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl SubAssign for Time {
    #[inline]
    fn sub_assign(&mut self, rhs: Time) {
        self.0 -= rhs.0;
    }
}

impl Neg for Time {
    type Output = Time;

    #[inline]
    fn neg(self) -> Time {
        Time(-self.0)
    }
}

/// Scale by a real factor, rounding to the nearest nanosecond.
impl Mul<f64> for Time {
    type Output = Time;

    #[inline]
    fn mul(self, rhs: f64) -> Time {
        Time::from_nanos_f64(self.0 as f64 * rhs)
    }
}

impl Mul<i64> for Time {
    type Output = Time;

    #[inline]
    fn mul(self, rhs: i64) -> Time {
        Time(self.0 * rhs)
    }
}

/// Ratio of two durations.
impl Div for Time {
    type Output = f64;

    #[inline]
    fn div(self, rhs: Time) -> f64 {
        self.0 as f64 / rhs.0 as f64
    }
}

impl Div<f64> for Time {
    type Output = Time;

    #[inline]
    fn div(self, rhs: f64) -> Time {
        Time::from_nanos_f64(self.0 as f64 / rhs)
    }
}

impl Sum for Time {
    fn sum<I: Iterator<Item = Time>>(iter: I) -> Time {
        iter.fold(Time::ZERO, |acc, t| acc + t)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f64())
    }
}

/// Format time as HH:MM:SS.mmm
pub fn format_time(time: Time) -> String {
    let sign = if time.is_negative() { "-" } else { "" };
    let nanos = time.as_nanos().unsigned_abs();
    let hours = nanos / NANOS_PER_HOUR as u64;
    let minutes = (nanos % NANOS_PER_HOUR as u64) / NANOS_PER_MINUTE as u64;
    let seconds = (nanos % NANOS_PER_MINUTE as u64) / NANOS_PER_SECOND as u64;
    let millis = (nanos % NANOS_PER_SECOND as u64) / NANOS_PER_MILLI as u64;

    format!("{}{:02}:{:02}:{:02}.{:03}", sign, hours, minutes, seconds, millis)
}

/// Serde adapter storing a [`Time`] as floating milliseconds.
///
/// Configuration files express durations in milliseconds:
///
/// ```toml
/// pre_swap_safety_buffer = 2.5
/// ```
pub mod serde_millis {
    use super::*;

    pub fn serialize<S: Serializer>(time: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        time.as_millis_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        Ok(Time::from_millis_f64(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_constructors_are_exact() {
        assert_eq!(Time::from_hours(1).as_nanos(), 3_600_000_000_000);
        assert_eq!(Time::from_minutes(2), Time::from_secs(120));
        assert_eq!(Time::from_secs(3), Time::from_millis(3000));
        assert_eq!(Time::from_millis(7), Time::from_micros(7000));
        assert_eq!(Time::from_micros(9), Time::from_nanos(9000));
    }

    #[test]
    fn test_hours_round_trip_through_micros() {
        for hours in [-3, 0, 1, 5, 24, 1000] {
            let micros = Time::from_hours(hours).as_micros();
            let back = Time::from_micros(micros);
            assert_eq!(back, Time::from_hours(hours));
            assert_eq!(back.as_hours_f64(), hours as f64);
        }
    }

    #[test]
    fn test_seconds_conversion() {
        let time = Time::from_secs_f64(1.5);
        assert_eq!(time.as_nanos(), 1_500_000_000);
        assert!((time.as_secs_f64() - 1.5).abs() < 1e-9);
        assert_eq!(time.as_millis(), 1500);
        assert_eq!(time.as_micros(), 1_500_000);
    }

    #[test]
    fn test_arithmetic() {
        let t1 = Time::from_millis(1500);
        let t2 = Time::from_millis(2500);
        assert_eq!(t1 + t2, Time::from_secs(4));
        assert_eq!(t2 - t1, Time::from_secs(1));
        assert_eq!(-t1, Time::from_millis(-1500));
        assert_eq!(t1 * 2.0, Time::from_secs(3));
        assert_eq!(t1 * 3, Time::from_millis(4500));
        assert!((t2 / t1 - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(Time::from_millis(-3).abs(), Time::from_millis(3));
        assert_eq!(t1.min(t2), t1);
        assert_eq!(t1.max(t2), t2);
    }

    #[test]
    fn test_std_dev() {
        let samples: Vec<Time> = [2, 4, 4, 4, 5, 5, 7, 9].iter().map(|&n| Time::from_millis(n)).collect();
        // sample variance of the classic set is 32/7
        let expected = (32.0f64 / 7.0).sqrt();
        assert!((Time::std_dev(&samples).as_millis_f64() - expected).abs() < 1e-6);
        assert_eq!(Time::std_dev(&samples[..1]), Time::ZERO);
    }

    #[test]
    fn test_format_time() {
        let time = Time::from_hours(1) + Time::from_minutes(1) + Time::from_millis(1500);
        assert_eq!(format_time(time), "01:01:01.500");
        assert_eq!(format_time(-Time::from_millis(250)), "-00:00:00.250");
    }

    #[test]
    fn test_saturating_sentinels() {
        assert_eq!(Time::MAX.saturating_add(Time::from_secs(1)), Time::MAX);
        assert_eq!(Time::MIN.saturating_sub(Time::from_secs(1)), Time::MIN);
    }

    #[test]
    fn test_std_duration_round_trip() {
        let time = Time::from_micros(16_667);
        assert_eq!(Time::from_std(time.to_std()), time);
        assert_eq!(Time::from_millis(-5).to_std(), std::time::Duration::ZERO);
    }
}
