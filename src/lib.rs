//! Beacon Node Library
//!
//! A randomness beacon: once per period it publishes a signed random value
//! chained to every earlier one, with skip-list anchors for short audits.
//!
//! ## Modules
//!
//! - `types` - Pulse data model and its byte serialization
//! - `crypto` - SHA-512 hashing, certificates and signers
//! - `entropy` - Local entropy sources
//! - `skiplist` - Skip-list anchors and audit paths
//! - `chain` - Pulse construction and the continuity guard
//! - `scheduler` - Real-time generate/release loop
//! - `storage` - Persistent pulse store
//! - `transport` - Command transport to a remote store
//! - `api` - HTTP read API and live feed
//! - `verifier` - Client-side verification
//! - `config` - Command line configuration

pub mod types;
pub mod crypto;
pub mod entropy;
pub mod skiplist;
pub mod chain;
pub mod scheduler;
pub mod storage;
pub mod transport;
pub mod api;
pub mod verifier;
pub mod config;

pub use types::*;
pub use chain::PulseChainBuilder;
pub use config::BeaconConfig;
pub use crypto::{KeypairSigner, RemoteSigner, Signer};
pub use scheduler::{Scheduler, Timings};
pub use skiplist::SkipLayers;
pub use storage::{PulseSink, PulseStore};
