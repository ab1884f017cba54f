//! Pulse chain construction.
//!
//! A pulse is built in two steps. [`PulseChainBuilder::init`] creates a
//! provisional pulse at the start of a cycle, with every hash and signature
//! field empty. [`PulseChainBuilder::finalize`] fills them in once the next
//! cycle's local random value exists, since the precommitment covers it.

pub mod continuity;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{sha512, hash_value, CryptoError, Signer, CYPHER_SUITE};
use crate::skiplist::SkipLayers;
use crate::types::{ByteHash, Pulse, StatusCode};

pub use continuity::assert_next_in_chain;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain mismatch: previous pulse is on chain {previous}, requested chain {requested}")]
    ChainMismatch { previous: u64, requested: u64 },
    #[error("Chain continuity violated: {0}")]
    Continuity(String),
    #[error("Skip list geometry mismatch: expected {expected} anchors, previous pulse has {got}")]
    GeometryMismatch { expected: usize, got: usize },
    #[error("Pulse {0} is already finalized")]
    AlreadyFinalized(u64),
    #[error("Signing failed: {0}")]
    Signing(#[from] CryptoError),
}

/// Hash over every field preceding `outputValue`.
pub fn compute_output_value(pulse: &Pulse) -> ByteHash {
    sha512(&pulse.output_bytes())
}

/// Builds and finalizes the pulses of one generator.
#[derive(Debug, Clone)]
pub struct PulseChainBuilder {
    uri_prefix: String,
    version: String,
    period_ms: u32,
    layers: SkipLayers,
}

impl PulseChainBuilder {
    pub fn new(
        uri_prefix: impl Into<String>,
        version: impl Into<String>,
        period_ms: u32,
        layers: SkipLayers,
    ) -> Self {
        Self {
            uri_prefix: uri_prefix.into().trim_end_matches('/').to_string(),
            version: version.into(),
            period_ms,
            layers,
        }
    }

    pub fn layers(&self) -> &SkipLayers {
        &self.layers
    }

    pub fn period(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.period_ms as i64)
    }

    /// Public address of a pulse.
    pub fn uri(&self, chain_index: u64, pulse_index: u64) -> String {
        format!(
            "{}/{}/chain/{}/pulse/{}",
            self.uri_prefix, self.version, chain_index, pulse_index
        )
    }

    /// Provisional pulse following `previous` on chain `chain_index`.
    ///
    /// The first pulse of a chain is stamped with `now` (truncated to
    /// milliseconds) and flagged as a chain start; later pulses are stamped
    /// one period after their predecessor.
    pub fn init(
        &self,
        signer: &dyn Signer,
        chain_index: u64,
        local_random_value: ByteHash,
        previous: Option<&Pulse>,
        now: DateTime<Utc>,
    ) -> Result<Pulse, ChainError> {
        let mut status = StatusCode::OK;

        let (pulse_index, time_stamp) = match previous {
            Some(prev) => {
                if prev.chain_index != chain_index {
                    return Err(ChainError::ChainMismatch {
                        previous: prev.chain_index,
                        requested: chain_index,
                    });
                }
                if &prev.certificate_id != signer.certificate_id() {
                    status.insert(StatusCode::CERTIFICATE_CHANGED);
                }
                (prev.pulse_index + 1, prev.time_stamp + self.period())
            }
            None => {
                status.insert(StatusCode::CHAIN_START);
                (0, now.trunc_subsecs(3))
            }
        };

        Ok(Pulse {
            uri: self.uri(chain_index, pulse_index),
            version: self.version.clone(),
            cypher_suite: CYPHER_SUITE,
            period: self.period_ms,
            certificate_id: signer.certificate_id().clone(),
            chain_index,
            pulse_index,
            time_stamp,
            local_random_value,
            skip_list_layer_size: self.layers.layer_size(),
            skip_list_num_layers: self.layers.num_layers(),
            skip_list_anchors: Vec::new(),
            precommitment_value: ByteHash::default(),
            status_code: status,
            signature_value: ByteHash::default(),
            output_value: ByteHash::default(),
        })
    }

    /// Fill in anchors, precommitment, signature and output value.
    ///
    /// `previous` must be the pulse `init` was given. Status flags set after
    /// `init` (the gap bit) are covered by the signature.
    pub async fn finalize(
        &self,
        signer: &dyn Signer,
        pulse: &mut Pulse,
        previous: Option<&Pulse>,
        next_local_random_value: &ByteHash,
    ) -> Result<(), ChainError> {
        if pulse.is_finalized() {
            return Err(ChainError::AlreadyFinalized(pulse.pulse_index));
        }

        pulse.skip_list_anchors = match previous {
            Some(prev) => {
                if prev.chain_index != pulse.chain_index {
                    return Err(ChainError::ChainMismatch {
                        previous: prev.chain_index,
                        requested: pulse.chain_index,
                    });
                }
                let expected = self.layers.num_layers() as usize;
                if prev.skip_list_anchors.len() != expected {
                    return Err(ChainError::GeometryMismatch {
                        expected,
                        got: prev.skip_list_anchors.len(),
                    });
                }
                self.layers.next_anchors(
                    prev.pulse_index,
                    &prev.output_value,
                    &prev.skip_list_anchors,
                )
            }
            None => self.layers.sentinel_anchors(),
        };

        pulse.precommitment_value = hash_value(next_local_random_value);
        pulse.signature_value = signer.sign(&pulse.signing_bytes()).await?;
        pulse.output_value = compute_output_value(pulse);

        debug!(
            chain = pulse.chain_index,
            pulse = pulse.pulse_index,
            output = %pulse.output_value.short(),
            "pulse finalized"
        );
        Ok(())
    }
}
