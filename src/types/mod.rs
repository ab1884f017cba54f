//! Core data types for the randomness beacon.

pub mod encoding;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Length in bytes of every hash produced by the beacon (SHA-512).
pub const HASH_LEN: usize = 64;

/// Arbitrary byte value carried by a pulse (hashes, signatures).
/// Travels as lowercase hex in JSON.
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ByteHash(Vec<u8>);

impl ByteHash {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The all-zero sentinel used for the anchors of a chain's first pulse.
    pub fn zero() -> Self {
        Self(vec![0u8; HASH_LEN])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|b| *b == 0)
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        let hex = self.to_hex();
        hex.chars().take(16).collect()
    }
}

impl fmt::Debug for ByteHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteHash({})", self.to_hex())
    }
}

impl fmt::Display for ByteHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<Vec<u8>> for ByteHash {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ByteHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for ByteHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ByteHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ByteHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Bitmask of non-fatal conditions. Flags accumulate and are never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(u32);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(0);
    /// First pulse of a chain: there is no prior precommitment to check against.
    pub const CHAIN_START: StatusCode = StatusCode(0x1);
    /// The pulse was released after its deadline.
    pub const GAP: StatusCode = StatusCode(0x2);
    /// The signing certificate differs from the previous pulse's.
    pub const CERTIFICATE_CHANGED: StatusCode = StatusCode(0x4);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn insert(&mut self, flag: StatusCode) {
        self.0 |= flag.0;
    }

    pub fn contains(self, flag: StatusCode) -> bool {
        self.0 & flag.0 == flag.0
    }
}

/// Canonical text form of a pulse timestamp: RFC 3339, millisecond precision, `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp in any RFC 3339 form and truncate it to millisecond precision.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let parsed = DateTime::parse_from_rfc3339(s)?;
    Ok(parsed.with_timezone(&Utc).trunc_subsecs(3))
}

mod timestamp_format {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_timestamp(&s).map_err(serde::de::Error::custom)
    }
}

/// One period's signed, chained random-value record.
///
/// Field order is significant: the signature covers every field before
/// `signature_value`, the output value covers every field before itself.
/// The JSON form (camelCase keys) is the plain field map exchanged with
/// storage and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pulse {
    pub uri: String,
    pub version: String,
    pub cypher_suite: u32,
    /// Nominal pulse interval in milliseconds
    pub period: u32,
    pub certificate_id: ByteHash,
    pub chain_index: u64,
    pub pulse_index: u64,
    #[serde(with = "timestamp_format")]
    pub time_stamp: DateTime<Utc>,
    pub local_random_value: ByteHash,
    pub skip_list_layer_size: u32,
    pub skip_list_num_layers: u32,
    pub skip_list_anchors: Vec<ByteHash>,
    pub precommitment_value: ByteHash,
    pub status_code: StatusCode,
    pub signature_value: ByteHash,
    pub output_value: ByteHash,
}

impl Pulse {
    /// A pulse is provisional until finalization fills its hash and signature fields.
    pub fn is_finalized(&self) -> bool {
        !self.signature_value.is_empty() && !self.output_value.is_empty()
    }

    /// Key identifying the pulse inside the beacon: (chain, pulse).
    pub fn position(&self) -> (u64, u64) {
        (self.chain_index, self.pulse_index)
    }
}

/// Certificate registered with the store so clients can verify signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub certificate_id: ByteHash,
    pub certificate: ByteHash,
}
