//! When to call a blocking buffer swap.
//!
//! Swapping blocks until the next refresh. Calling it only when the next
//! refresh is imminent keeps the caller free for rendering in between.

use std::sync::Arc;

use crate::core::time::Time;
use crate::sync::data_client::{DataClient, DataClientConfig};
use crate::sync::swap_data::SwapDataContainer;

/// Default margin before the predicted swap at which swapping starts.
pub const DEFAULT_PRE_SWAP_SAFETY_BUFFER: Time = Time::from_millis(3);

/// Swap decision based on the predicted time to the next swap.
#[derive(Debug)]
pub struct SwapTiming {
    client: DataClient,
    pre_swap_safety_buffer: Time,
}

impl SwapTiming {
    pub fn new(
        swap_data: Arc<SwapDataContainer>,
        frame_period: Time,
        config: DataClientConfig,
        pre_swap_safety_buffer: Time,
    ) -> Self {
        Self {
            client: DataClient::new(swap_data, frame_period, config),
            pre_swap_safety_buffer,
        }
    }

    pub fn pre_swap_safety_buffer(&self) -> Time {
        self.pre_swap_safety_buffer
    }

    pub fn set_pre_swap_safety_buffer(&mut self, buffer: Time) {
        self.pre_swap_safety_buffer = buffer;
    }

    /// Predicted time from `now` to the next swap, if the model is usable.
    pub fn time_to_next_swap(&self, now: Time) -> Option<Time> {
        if !self.client.model_usable() {
            return None;
        }
        self.client.predict_time_to_next_swap(now)
    }

    /// Whether a swap issued at `now` is due.
    ///
    /// Without a usable model the answer is always yes, so the display keeps
    /// swapping and the model gets its data.
    pub fn should_swap(&self, now: Time) -> bool {
        match self.time_to_next_swap(now) {
            Some(remaining) => remaining <= self.pre_swap_safety_buffer,
            None => true,
        }
    }

    pub fn client(&self) -> &DataClient {
        &self.client
    }
}
