//! Core types: time, clocks and severity-based reporting.

pub mod clock;
pub mod log;
pub mod time;

pub use clock::{Clock, ManualClock, SystemClock};
pub use log::{LogPolicy, Severity};
pub use time::Time;
