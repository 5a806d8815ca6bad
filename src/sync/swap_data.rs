//! Swap data: (unit, time) observations published by a swapping source.
//!
//! A display publishes one datum per buffer swap, an audio stream one per
//! processed buffer. Consumers either read the container directly or keep a
//! [`PolledSwapListener`] that notices new data by comparing sequence numbers.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::core::time::Time;

/// Default number of observations retained by a container.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One swap observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwapData {
    /// Swap unit reached by this swap (frame number or sample frame).
    pub unit: u64,
    /// Clock time at which the swap was observed.
    pub time: Time,
}

impl SwapData {
    pub fn new(unit: u64, time: Time) -> Self {
        Self { unit, time }
    }
}

#[derive(Debug)]
struct ContainerState {
    data: VecDeque<SwapData>,
    sequence: u64,
}

/// Bounded history of swap observations.
///
/// # Thread Safety
///
/// All access goes through one mutex. Writers are the swapping thread (display
/// thread, main thread or audio callback); readers are the synchronizers.
#[derive(Debug)]
pub struct SwapDataContainer {
    state: Mutex<ContainerState>,
    capacity: usize,
    swap_advances_units: u64,
}

impl SwapDataContainer {
    /// Create a container keeping at most `capacity` observations.
    ///
    /// # Arguments
    ///
    /// * `swap_advances_units` - Units a single nominal swap advances: 1 for a
    ///   display, the buffer size for an audio stream.
    pub fn new(capacity: usize, swap_advances_units: u64) -> Self {
        Self {
            state: Mutex::new(ContainerState {
                data: VecDeque::with_capacity(capacity.max(1)),
                sequence: 0,
            }),
            capacity: capacity.max(1),
            swap_advances_units: swap_advances_units.max(1),
        }
    }

    pub fn shared(capacity: usize, swap_advances_units: u64) -> Arc<Self> {
        Arc::new(Self::new(capacity, swap_advances_units))
    }

    /// Append an observation, dropping the oldest beyond capacity.
    ///
    /// Returns false (and logs) if the observation would break monotonicity:
    /// units must strictly increase and times must not decrease.
    pub fn store(&self, unit: u64, time: Time) -> bool {
        let mut state = self.state.lock();
        if let Some(last) = state.data.back() {
            if unit <= last.unit || time < last.time {
                warn!(
                    "Rejected non-monotonic swap data ({}, {}) after ({}, {})",
                    unit, time, last.unit, last.time
                );
                return false;
            }
        }
        if state.data.len() == self.capacity {
            state.data.pop_front();
        }
        state.data.push_back(SwapData { unit, time });
        state.sequence += 1;
        true
    }

    pub fn last_swap_data(&self) -> Option<SwapData> {
        self.state.lock().data.back().copied()
    }

    /// Unit of the most recent swap, or 0 if nothing has been stored.
    pub fn last_swap_unit(&self) -> u64 {
        self.last_swap_data().map(|d| d.unit).unwrap_or(0)
    }

    /// Time of the most recent swap, or zero if nothing has been stored.
    pub fn last_swap_time(&self) -> Time {
        self.last_swap_data().map(|d| d.time).unwrap_or(Time::ZERO)
    }

    /// Unit the next nominal swap will reach.
    pub fn next_swap_unit(&self) -> u64 {
        self.last_swap_unit() + self.swap_advances_units
    }

    pub fn swap_advances_units(&self) -> u64 {
        self.swap_advances_units
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().data.is_empty()
    }

    /// Monotonic counter incremented by every accepted store.
    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    /// Snapshot of the stored observations, oldest first.
    pub fn data(&self) -> Vec<SwapData> {
        self.state.lock().data.iter().copied().collect()
    }

    /// Snapshot of the most recent `n` observations together with the sequence
    /// number they correspond to.
    pub fn recent(&self, n: usize) -> (Vec<SwapData>, u64) {
        let state = self.state.lock();
        let skip = state.data.len().saturating_sub(n);
        (state.data.iter().skip(skip).copied().collect(), state.sequence)
    }

    /// Drop all observations. The sequence number still advances so listeners
    /// notice the change.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.data.clear();
        state.sequence += 1;
    }
}

/// Detects new swaps by polling a container's sequence number.
#[derive(Debug)]
pub struct PolledSwapListener {
    container: Arc<SwapDataContainer>,
    seen: u64,
}

impl PolledSwapListener {
    /// Create a listener that considers everything stored so far as seen.
    pub fn new(container: Arc<SwapDataContainer>) -> Self {
        let seen = container.sequence();
        Self { container, seen }
    }

    /// Whether a swap has been stored since the last reset.
    ///
    /// When `reset` is true the current sequence is marked as seen.
    pub fn has_swapped(&mut self, reset: bool) -> bool {
        let sequence = self.container.sequence();
        let swapped = sequence != self.seen;
        if reset {
            self.seen = sequence;
        }
        swapped
    }

    /// Spin (yielding) until a swap is observed or `timeout` elapses.
    ///
    /// Returns whether a swap was observed.
    pub fn wait_for_swap(&mut self, timeout: Duration, reset_on_return: bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_swapped(false) {
                if reset_on_return {
                    self.reset();
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
    }

    pub fn reset(&mut self) {
        self.seen = self.container.sequence();
    }

    pub fn container(&self) -> &Arc<SwapDataContainer> {
        &self.container
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_bounds() {
        let container = SwapDataContainer::new(3, 1);
        for unit in 1..=5u64 {
            assert!(container.store(unit, Time::from_millis(unit as i64 * 16)));
        }
        assert_eq!(container.len(), 3);
        assert_eq!(container.data()[0].unit, 3);
        assert_eq!(container.last_swap_unit(), 5);
        assert_eq!(container.last_swap_time(), Time::from_millis(80));
        assert_eq!(container.next_swap_unit(), 6);
        assert_eq!(container.sequence(), 5);
    }

    #[test]
    fn test_rejects_non_monotonic_data() {
        let container = SwapDataContainer::new(10, 256);
        assert!(container.store(256, Time::from_millis(5)));
        assert!(!container.store(256, Time::from_millis(6)));
        assert!(!container.store(512, Time::from_millis(4)));
        assert_eq!(container.len(), 1);
        assert_eq!(container.next_swap_unit(), 512);
    }

    #[test]
    fn test_empty_container_defaults() {
        let container = SwapDataContainer::new(10, 1);
        assert!(container.is_empty());
        assert_eq!(container.last_swap_data(), None);
        assert_eq!(container.last_swap_unit(), 0);
        assert_eq!(container.next_swap_unit(), 1);
    }

    #[test]
    fn test_polled_listener() {
        let container = SwapDataContainer::shared(10, 1);
        container.store(1, Time::ZERO);
        let mut listener = PolledSwapListener::new(container.clone());
        assert!(!listener.has_swapped(true));
        container.store(2, Time::from_millis(16));
        assert!(listener.has_swapped(false));
        assert!(listener.has_swapped(true));
        assert!(!listener.has_swapped(true));
    }

    #[test]
    fn test_wait_for_swap_across_threads() {
        let container = SwapDataContainer::shared(10, 1);
        let mut listener = PolledSwapListener::new(container.clone());
        let writer = {
            let container = container.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                container.store(1, Time::from_millis(5));
            })
        };
        assert!(listener.wait_for_swap(Duration::from_secs(2), true));
        assert!(!listener.has_swapped(false));
        writer.join().unwrap();
        assert!(!listener.wait_for_swap(Duration::from_millis(5), true));
    }
}
