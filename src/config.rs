//! Beacon configuration.
//!
//! Command line arguments and environment variables, parsed once at startup
//! with clap and validated before anything else runs.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::chain::PulseChainBuilder;
use crate::scheduler::{Timings, TimingError};
use crate::skiplist::{SkipLayers, SkipListError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid timing: {0}")]
    Timing(#[from] TimingError),
    #[error("Invalid skip list geometry: {0}")]
    SkipList(#[from] SkipListError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Generator, local store and read API in one process
    Standalone,
    /// Generator sending pulses to a remote storage server
    Generator,
    /// Storage server: command transport and read API
    Storage,
}

/// Beacon node - signed, hash-chained randomness beacon
#[derive(Parser, Debug, Clone)]
#[command(name = "beacon-node")]
#[command(about = "Randomness beacon generator and pulse store")]
pub struct BeaconConfig {
    /// What this process runs
    #[arg(long, env = "BEACON_MODE", value_enum, default_value = "standalone")]
    pub mode: Mode,

    /// Data directory for the pulse store and the signing key
    #[arg(long, env = "BEACON_DATA_DIR", default_value = "./beacon-data")]
    pub data_dir: PathBuf,

    /// Read API port
    #[arg(long, env = "BEACON_API_PORT", default_value = "8080")]
    pub api_port: u16,

    /// Command transport port (storage mode)
    #[arg(long, env = "BEACON_COMMAND_PORT", default_value = "7070")]
    pub command_port: u16,

    /// Storage server address (generator mode)
    #[arg(long, env = "BEACON_STORAGE_ADDR", default_value = "127.0.0.1:7070")]
    pub storage_addr: String,

    /// Pulse period π in milliseconds
    #[arg(long, env = "BEACON_PERIOD_MS", default_value = "10000")]
    pub period_ms: u32,

    /// Anticipation Δ in milliseconds
    #[arg(long, env = "BEACON_ANTICIPATION_MS", default_value = "1000")]
    pub anticipation_ms: u32,

    /// Maximum release delay δ in milliseconds
    #[arg(long, env = "BEACON_DELAY_MS", default_value = "1000")]
    pub delay_ms: u32,

    /// Clock skew ahead bound σ+ in milliseconds
    #[arg(long, env = "BEACON_SKEW_AHEAD_MS", default_value = "500")]
    pub skew_ahead_ms: u32,

    /// Clock skew behind bound σ− in milliseconds
    #[arg(long, env = "BEACON_SKEW_BEHIND_MS", default_value = "500")]
    pub skew_behind_ms: u32,

    /// Skip list layer size n
    #[arg(long, env = "BEACON_LAYER_SIZE", default_value = "27")]
    pub layer_size: u32,

    /// Skip list layer count L
    #[arg(long, env = "BEACON_NUM_LAYERS", default_value = "5")]
    pub num_layers: u32,

    /// Prefix of every pulse URI
    #[arg(long, env = "BEACON_URI_PREFIX", default_value = "http://localhost:8080/beacon")]
    pub uri_prefix: String,

    /// Pulse format version
    #[arg(long, env = "BEACON_VERSION", default_value = "2.0")]
    pub version: String,

    /// HSM connector URL; signs with a local key file when unset
    #[arg(long, env = "BEACON_SIGNER_URL")]
    pub signer_url: Option<String>,

    /// Local signing key file (default: <data-dir>/signing.key)
    #[arg(long, env = "BEACON_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Signing timeout in milliseconds
    #[arg(long, env = "BEACON_SIGNING_TIMEOUT_MS", default_value = "2000")]
    pub signing_timeout_ms: u64,
}

impl BeaconConfig {
    /// Check every derived value; the process must not start otherwise.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timings()?;
        self.layers()?;
        if self.signing_timeout_ms == 0 {
            return Err(ConfigError::Invalid("signing timeout must be positive".into()));
        }
        if self.version.is_empty() {
            return Err(ConfigError::Invalid("version must not be empty".into()));
        }
        Ok(())
    }

    pub fn timings(&self) -> Result<Timings, TimingError> {
        Timings::from_millis(
            self.period_ms,
            self.anticipation_ms,
            self.delay_ms,
            self.skew_ahead_ms,
            self.skew_behind_ms,
        )
    }

    pub fn layers(&self) -> Result<SkipLayers, SkipListError> {
        SkipLayers::new(self.layer_size, self.num_layers)
    }

    pub fn builder(&self) -> Result<PulseChainBuilder, ConfigError> {
        Ok(PulseChainBuilder::new(
            self.uri_prefix.clone(),
            self.version.clone(),
            self.period_ms,
            self.layers()?,
        ))
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("signing.key"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("pulses")
    }

    pub fn signing_timeout(&self) -> Duration {
        Duration::from_millis(self.signing_timeout_ms)
    }

    pub fn api_addr(&self) -> String {
        format!("0.0.0.0:{}", self.api_port)
    }

    pub fn command_addr(&self) -> String {
        format!("0.0.0.0:{}", self.command_port)
    }
}
