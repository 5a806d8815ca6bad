//! Joint synchronization of several swap sources.
//!
//! A sync point is a moment `T` at which every client reaches an integer unit:
//! the reference client's unit is chosen by the caller, every other client's
//! unit is the rounded inversion of its model at `T`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::time::Time;
use crate::sync::data_client::DataClient;

/// Where one client is predicted to be at the sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSyncPoint {
    pub predicted_unit: u64,
    pub predicted_time: Time,
}

/// A jointly predicted moment across all clients.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncPoint {
    pub valid: bool,
    pub time: Time,
    pub clients: BTreeMap<String, ClientSyncPoint>,
}

impl SyncPoint {
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn client(&self, name: &str) -> Option<&ClientSyncPoint> {
        self.clients.get(name)
    }
}

/// Set of named data clients.
#[derive(Debug, Default)]
pub struct DomainSynchronizer {
    clients: BTreeMap<String, Arc<DataClient>>,
}

impl DomainSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` under `name`, replacing any previous client of that name.
    pub fn add_client(&mut self, name: impl Into<String>, client: Arc<DataClient>) {
        self.clients.insert(name.into(), client);
    }

    pub fn remove_client(&mut self, name: &str) -> Option<Arc<DataClient>> {
        self.clients.remove(name)
    }

    pub fn client(&self, name: &str) -> Option<&Arc<DataClient>> {
        self.clients.get(name)
    }

    pub fn client_names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    /// Whether every client's verifier accepts its data.
    pub fn all_ready(&self) -> bool {
        !self.clients.is_empty() && self.clients.values().all(|c| c.all_ready())
    }

    /// Spin (yielding) until all clients are ready or `timeout` elapses.
    pub fn wait_until_all_ready(&self, timeout: Duration) -> bool {
        self.wait_until_all_ready_with(timeout, || {})
    }

    /// Like [`wait_until_all_ready`](Self::wait_until_all_ready), calling `idle`
    /// between polls. Used when the waiting thread is also the one driving a
    /// swap source.
    pub fn wait_until_all_ready_with(&self, timeout: Duration, mut idle: impl FnMut()) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.all_ready() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            idle();
            std::thread::yield_now();
        }
    }

    /// Compute the sync point at which `reference` reaches `reference_unit`.
    ///
    /// The result is invalid if the reference is unknown, any client is not
    /// ready, or any model is unusable.
    pub fn sync_point(&self, reference: &str, reference_unit: u64) -> SyncPoint {
        let Some(reference_client) = self.clients.get(reference) else {
            warn!("Sync point requested for unknown client '{}'", reference);
            return SyncPoint::invalid();
        };
        if !self.all_ready() {
            debug!("Sync point requested before all clients were ready");
            return SyncPoint::invalid();
        }
        if !self.clients.values().all(|c| c.model_usable()) {
            debug!("Sync point requested with an unusable model");
            return SyncPoint::invalid();
        }
        let Some(time) = reference_client.predict_time_at(reference_unit) else {
            return SyncPoint::invalid();
        };

        let mut clients = BTreeMap::new();
        clients.insert(
            reference.to_string(),
            ClientSyncPoint {
                predicted_unit: reference_unit,
                predicted_time: time,
            },
        );
        for (name, client) in &self.clients {
            if name == reference {
                continue;
            }
            let Some(unit) = client.predict_unit_at(time) else {
                return SyncPoint::invalid();
            };
            if unit < 0.0 {
                warn!("Client '{}' predicts a negative unit at the sync point", name);
                return SyncPoint::invalid();
            }
            let predicted_unit = unit.round() as u64;
            let Some(predicted_time) = client.predict_time_at(predicted_unit) else {
                return SyncPoint::invalid();
            };
            clients.insert(
                name.clone(),
                ClientSyncPoint {
                    predicted_unit,
                    predicted_time,
                },
            );
        }
        SyncPoint {
            valid: true,
            time,
            clients,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::data_client::DataClientConfig;
    use crate::sync::swap_data::SwapDataContainer;

    const FRAME: Time = Time::from_nanos(16_666_667);
    const SAMPLE_RATE: i64 = 48_000;
    const BUFFER: u64 = 256;

    /// Display swapping at exactly 60 Hz with frame N at N/60 s.
    fn display_client(last_frame: u64) -> Arc<DataClient> {
        let container = SwapDataContainer::shared(1000, 1);
        for frame in (last_frame - 59)..=last_frame {
            container.store(frame, Time::from_nanos_f64(frame as f64 * 1e9 / 60.0));
        }
        Arc::new(DataClient::new(
            container,
            FRAME,
            DataClientConfig {
                collection_duration: Time::from_millis(200),
                ..DataClientConfig::default()
            },
        ))
    }

    /// Audio stream with sample frame S at S/48000 s, one datum per buffer.
    fn audio_client(last_buffer: u64) -> Arc<DataClient> {
        let container = SwapDataContainer::shared(1000, BUFFER);
        for buffer in (last_buffer - 99)..=last_buffer {
            let unit = buffer * BUFFER;
            container.store(unit, Time::from_nanos(unit as i64 * 1_000_000_000 / SAMPLE_RATE));
        }
        Arc::new(DataClient::new(
            container,
            Time::from_nanos(BUFFER as i64 * 1_000_000_000 / SAMPLE_RATE),
            DataClientConfig {
                collection_duration: Time::from_millis(100),
                ..DataClientConfig::default()
            },
        ))
    }

    #[test]
    fn test_sync_point_across_display_and_audio() {
        let mut sync = DomainSynchronizer::new();
        sync.add_client("disp", display_client(590));
        sync.add_client("ss", audio_client(1870));
        assert!(sync.all_ready());

        let point = sync.sync_point("disp", 600);
        assert!(point.valid);
        assert!((point.time - Time::from_secs(10)).abs() < Time::from_micros(1));
        let audio = point.client("ss").unwrap();
        assert_eq!(audio.predicted_unit, 480_000);
        assert!((audio.predicted_time - Time::from_secs(10)).abs() < Time::from_micros(1));
        assert_eq!(point.client("disp").unwrap().predicted_unit, 600);
    }

    #[test]
    fn test_invalid_when_not_ready() {
        let mut sync = DomainSynchronizer::new();
        sync.add_client("disp", display_client(590));
        let empty = Arc::new(DataClient::new(SwapDataContainer::shared(10, 1), FRAME, DataClientConfig::default()));
        sync.add_client("other", empty);
        assert!(!sync.all_ready());
        assert!(!sync.sync_point("disp", 600).valid);
        assert!(!sync.wait_until_all_ready(Duration::from_millis(5)));
    }

    #[test]
    fn test_unknown_reference() {
        let mut sync = DomainSynchronizer::new();
        sync.add_client("disp", display_client(590));
        assert!(!sync.sync_point("nope", 600).valid);
    }

    #[test]
    fn test_reference_at_last_unit_uses_observed_time() {
        let mut sync = DomainSynchronizer::new();
        let client = display_client(590);
        let last = client.last_swap_data().unwrap();
        sync.add_client("disp", client);
        let point = sync.sync_point("disp", 590);
        assert!(point.valid);
        assert_eq!(point.time, last.time);
    }

    #[test]
    fn test_empty_synchronizer_is_not_ready() {
        assert!(!DomainSynchronizer::new().all_ready());
    }
}
