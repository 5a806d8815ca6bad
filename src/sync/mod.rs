//! Swap synchronization: swap data, linear models, verifiers and sync points.

pub mod data_client;
pub mod domain;
pub mod linear_model;
pub mod swap_data;
pub mod verifier;

pub use data_client::{DataClient, DataClientConfig};
pub use domain::{ClientSyncPoint, DomainSynchronizer, SyncPoint};
pub use linear_model::SwapLinearModel;
pub use swap_data::{PolledSwapListener, SwapData, SwapDataContainer};
pub use verifier::{SyncVerifier, SyncVerifierConfig, VerifierTests};
