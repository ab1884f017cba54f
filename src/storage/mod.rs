//! Persistent pulse storage using the sled embedded database.
//!
//! Trees:
//! - `pulses`: `(chain, pulse)` big-endian key → stored pulse row
//! - `by_time`: `(timestamp ms, chain, pulse)` → `(chain, pulse)` key
//! - `certificates`: certificate id → certificate
//! - `metadata`: position of the latest appended pulse
//!
//! Appends go through the continuity guard inside one transaction over all
//! trees, so the guard always sees the row it is checked against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::chain::{assert_next_in_chain, ChainError};
use crate::types::{format_timestamp, parse_timestamp, ByteHash, CertificateRecord, Pulse, StatusCode};

const LATEST_KEY: &[u8] = b"latest";
const ANCHOR_DELIMITER: char = ':';
const FEED_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Rejected append: {0}")]
    Continuity(#[from] ChainError),
    #[error("Pulse {pulse} of chain {chain} not found")]
    PulseNotFound { chain: u64, pulse: u64 },
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Remote storage error: {0}")]
    Remote(String),
}

/// Where the scheduler sends finished pulses: the local store, or a storage
/// server reached over the command transport.
#[async_trait]
pub trait PulseSink: Send + Sync {
    async fn latest_pulse(&self) -> Result<Option<Pulse>, StorageError>;
    async fn append(&self, pulse: &Pulse) -> Result<(), StorageError>;
    async fn register_certificate(&self, record: &CertificateRecord) -> Result<(), StorageError>;
}

/// Row layout: every pulse field, anchors joined as one delimited hex string.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPulse {
    uri: String,
    version: String,
    cypher_suite: u32,
    period: u32,
    certificate_id: ByteHash,
    chain_index: u64,
    pulse_index: u64,
    time_stamp: String,
    local_random_value: ByteHash,
    skip_list_layer_size: u32,
    skip_list_num_layers: u32,
    skip_list_anchors: String,
    precommitment_value: ByteHash,
    status_code: u32,
    signature_value: ByteHash,
    output_value: ByteHash,
}

impl From<&Pulse> for StoredPulse {
    fn from(p: &Pulse) -> Self {
        let anchors: Vec<String> = p.skip_list_anchors.iter().map(|a| a.to_hex()).collect();
        Self {
            uri: p.uri.clone(),
            version: p.version.clone(),
            cypher_suite: p.cypher_suite,
            period: p.period,
            certificate_id: p.certificate_id.clone(),
            chain_index: p.chain_index,
            pulse_index: p.pulse_index,
            time_stamp: format_timestamp(&p.time_stamp),
            local_random_value: p.local_random_value.clone(),
            skip_list_layer_size: p.skip_list_layer_size,
            skip_list_num_layers: p.skip_list_num_layers,
            skip_list_anchors: anchors.join(&ANCHOR_DELIMITER.to_string()),
            precommitment_value: p.precommitment_value.clone(),
            status_code: p.status_code.bits(),
            signature_value: p.signature_value.clone(),
            output_value: p.output_value.clone(),
        }
    }
}

impl TryFrom<StoredPulse> for Pulse {
    type Error = StorageError;

    fn try_from(row: StoredPulse) -> Result<Self, Self::Error> {
        let time_stamp = parse_timestamp(&row.time_stamp)
            .map_err(|e| StorageError::Corrupt(format!("timestamp {}: {}", row.time_stamp, e)))?;
        let skip_list_anchors = if row.skip_list_anchors.is_empty() {
            Vec::new()
        } else {
            row.skip_list_anchors
                .split(ANCHOR_DELIMITER)
                .map(ByteHash::from_hex)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StorageError::Corrupt(format!("anchors: {}", e)))?
        };

        Ok(Pulse {
            uri: row.uri,
            version: row.version,
            cypher_suite: row.cypher_suite,
            period: row.period,
            certificate_id: row.certificate_id,
            chain_index: row.chain_index,
            pulse_index: row.pulse_index,
            time_stamp,
            local_random_value: row.local_random_value,
            skip_list_layer_size: row.skip_list_layer_size,
            skip_list_num_layers: row.skip_list_num_layers,
            skip_list_anchors,
            precommitment_value: row.precommitment_value,
            status_code: StatusCode::from_bits(row.status_code),
            signature_value: row.signature_value,
            output_value: row.output_value,
        })
    }
}

fn position_key(chain_index: u64, pulse_index: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&chain_index.to_be_bytes());
    key[8..].copy_from_slice(&pulse_index.to_be_bytes());
    key
}

/// Big-endian millis with the sign bit flipped so byte order matches time order.
fn time_prefix(ts: &DateTime<Utc>) -> [u8; 8] {
    ((ts.timestamp_millis() as u64) ^ (1 << 63)).to_be_bytes()
}

fn time_key(pulse: &Pulse) -> Vec<u8> {
    let mut key = time_prefix(&pulse.time_stamp).to_vec();
    key.extend_from_slice(&position_key(pulse.chain_index, pulse.pulse_index));
    key
}

fn encode_row(pulse: &Pulse) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(&StoredPulse::from(pulse))?)
}

fn decode_row(bytes: &[u8]) -> Result<Pulse, StorageError> {
    let row: StoredPulse = serde_json::from_slice(bytes)?;
    Pulse::try_from(row)
}

/// Append-only pulse store.
pub struct PulseStore {
    db: Db,
    pulses: Tree,
    by_time: Tree,
    certificates: Tree,
    metadata: Tree,
    feed: broadcast::Sender<Pulse>,
}

impl PulseStore {
    /// Open or create storage at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let pulses = db.open_tree("pulses")?;
        let by_time = db.open_tree("by_time")?;
        let certificates = db.open_tree("certificates")?;
        let metadata = db.open_tree("metadata")?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);

        info!("💾 Pulse store opened ({} pulses)", pulses.len());

        Ok(Self { db, pulses, by_time, certificates, metadata, feed })
    }

    /// Receiver of every pulse appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Pulse> {
        self.feed.subscribe()
    }

    /// Check continuity against the latest stored pulse and append.
    pub fn append(&self, pulse: &Pulse) -> Result<(), StorageError> {
        let row = encode_row(pulse)?;
        let key = position_key(pulse.chain_index, pulse.pulse_index);
        let time_key = time_key(pulse);

        let result: TransactionResult<(), StorageError> = (&self.pulses, &self.by_time, &self.metadata).transaction(
            |(pulses, by_time, metadata)| {
                let last = match metadata.get(LATEST_KEY)? {
                    Some(latest) => match pulses.get(&latest)? {
                        Some(bytes) => Some(
                            decode_row(&bytes).map_err(ConflictableTransactionError::Abort)?,
                        ),
                        None => {
                            return Err(ConflictableTransactionError::Abort(
                                StorageError::Corrupt("latest pulse row missing".into()),
                            ))
                        }
                    },
                    None => None,
                };

                assert_next_in_chain(last.as_ref(), pulse)
                    .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;

                pulses.insert(&key[..], row.as_slice())?;
                by_time.insert(time_key.as_slice(), &key[..])?;
                metadata.insert(LATEST_KEY, &key[..])?;
                Ok(())
            },
        );

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        }
        self.db.flush()?;

        debug!(chain = pulse.chain_index, pulse = pulse.pulse_index, "pulse stored");
        // no subscribers is fine
        let _ = self.feed.send(pulse.clone());
        Ok(())
    }

    pub fn get(&self, chain_index: u64, pulse_index: u64) -> Result<Option<Pulse>, StorageError> {
        match self.pulses.get(position_key(chain_index, pulse_index))? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Latest appended pulse across all chains.
    pub fn latest(&self) -> Result<Option<Pulse>, StorageError> {
        match self.metadata.get(LATEST_KEY)? {
            Some(key) => match self.pulses.get(key)? {
                Some(bytes) => Ok(Some(decode_row(&bytes)?)),
                None => Err(StorageError::Corrupt("latest pulse row missing".into())),
            },
            None => Ok(None),
        }
    }

    pub fn latest_in_chain(&self, chain_index: u64) -> Result<Option<Pulse>, StorageError> {
        match self.pulses.scan_prefix(chain_index.to_be_bytes()).next_back() {
            Some(entry) => {
                let (_, bytes) = entry?;
                Ok(Some(decode_row(&bytes)?))
            }
            None => Ok(None),
        }
    }

    /// Pulses of one chain at the given indices, in the order given.
    pub fn pulses_in_chain(&self, chain_index: u64, indices: &[u64]) -> Result<Vec<Pulse>, StorageError> {
        indices
            .iter()
            .map(|&pulse| {
                self.get(chain_index, pulse)?
                    .ok_or(StorageError::PulseNotFound { chain: chain_index, pulse })
            })
            .collect()
    }

    /// Latest pulse stamped at or before `ts`.
    pub fn at(&self, ts: &DateTime<Utc>) -> Result<Option<Pulse>, StorageError> {
        let end = time_prefix(&(*ts + chrono::TimeDelta::milliseconds(1)));
        self.resolve_time_entry(self.by_time.range(..end).next_back())
    }

    /// First pulse stamped strictly after `ts`.
    pub fn after(&self, ts: &DateTime<Utc>) -> Result<Option<Pulse>, StorageError> {
        let start = time_prefix(&(*ts + chrono::TimeDelta::milliseconds(1)));
        self.resolve_time_entry(self.by_time.range(start..).next())
    }

    /// Latest pulse stamped strictly before `ts`.
    pub fn before(&self, ts: &DateTime<Utc>) -> Result<Option<Pulse>, StorageError> {
        let end = time_prefix(ts);
        self.resolve_time_entry(self.by_time.range(..end).next_back())
    }

    fn resolve_time_entry(
        &self,
        entry: Option<sled::Result<(sled::IVec, sled::IVec)>>,
    ) -> Result<Option<Pulse>, StorageError> {
        match entry {
            Some(entry) => {
                let (_, key) = entry?;
                match self.pulses.get(&key)? {
                    Some(bytes) => Ok(Some(decode_row(&bytes)?)),
                    None => Err(StorageError::Corrupt("time index points at a missing pulse".into())),
                }
            }
            None => Ok(None),
        }
    }

    pub fn register_certificate(&self, record: &CertificateRecord) -> Result<(), StorageError> {
        self.certificates
            .insert(record.certificate_id.as_bytes(), record.certificate.as_bytes())?;
        info!("📜 Certificate {}... registered", record.certificate_id.short());
        Ok(())
    }

    pub fn certificate(&self, certificate_id: &ByteHash) -> Result<Option<CertificateRecord>, StorageError> {
        Ok(self.certificates.get(certificate_id.as_bytes())?.map(|bytes| CertificateRecord {
            certificate_id: certificate_id.clone(),
            certificate: ByteHash::new(bytes.to_vec()),
        }))
    }

    pub fn len(&self) -> usize {
        self.pulses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pulses.is_empty()
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl PulseSink for PulseStore {
    async fn latest_pulse(&self) -> Result<Option<Pulse>, StorageError> {
        self.latest()
    }

    async fn append(&self, pulse: &Pulse) -> Result<(), StorageError> {
        PulseStore::append(self, pulse)
    }

    async fn register_certificate(&self, record: &CertificateRecord) -> Result<(), StorageError> {
        PulseStore::register_certificate(self, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PulseChainBuilder;
    use crate::crypto::{KeypairSigner, Signer};
    use crate::skiplist::SkipLayers;
    use chrono::TimeDelta;
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        parse_timestamp(s).unwrap()
    }

    /// Finalized chain stamped one minute apart from `start`.
    fn build_chain(signer: &KeypairSigner, chain_index: u64, len: usize, start: &str) -> Vec<Pulse> {
        let b = PulseChainBuilder::new("http://beacon.test", "2.0", 60_000, SkipLayers::new(3, 3).unwrap());
        tokio_test::block_on(async {
            let mut out: Vec<Pulse> = Vec::new();
            for i in 0..len {
                let value = ByteHash::new(vec![i as u8; 64]);
                let mut p = b.init(signer, chain_index, value, out.last(), ts(start)).unwrap();
                let next = ByteHash::new(vec![i as u8 + 1; 64]);
                b.finalize(signer, &mut p, out.last(), &next).await.unwrap();
                out.push(p);
            }
            out
        })
    }

    #[test]
    fn test_storage_roundtrip() {
        let dir = tempdir().unwrap();
        let store = PulseStore::open(dir.path()).unwrap();
        let signer = KeypairSigner::generate();
        let chain = build_chain(&signer, 0, 3, "2024-01-01T00:00:00Z");

        assert!(store.latest().unwrap().is_none());
        for p in &chain {
            store.append(p).unwrap();
        }

        assert_eq!(store.len(), 3);
        assert_eq!(store.get(0, 1).unwrap().as_ref(), Some(&chain[1]));
        assert_eq!(store.latest().unwrap().as_ref(), Some(&chain[2]));
        assert_eq!(store.latest_in_chain(0).unwrap().as_ref(), Some(&chain[2]));
        assert!(store.get(0, 7).unwrap().is_none());
        assert!(store.latest_in_chain(1).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_pulses() {
        let dir = tempdir().unwrap();
        let signer = KeypairSigner::generate();
        let chain = build_chain(&signer, 0, 2, "2024-01-01T00:00:00Z");
        {
            let store = PulseStore::open(dir.path()).unwrap();
            store.append(&chain[0]).unwrap();
            store.append(&chain[1]).unwrap();
        }
        let store = PulseStore::open(dir.path()).unwrap();
        assert_eq!(store.latest().unwrap().as_ref(), Some(&chain[1]));
    }

    #[test]
    fn test_append_guard() {
        let dir = tempdir().unwrap();
        let store = PulseStore::open(dir.path()).unwrap();
        let signer = KeypairSigner::generate();
        let chain = build_chain(&signer, 0, 3, "2024-01-01T00:00:00Z");

        // must open with pulse 0
        assert!(matches!(store.append(&chain[1]), Err(StorageError::Continuity(_))));
        store.append(&chain[0]).unwrap();

        // duplicate
        assert!(matches!(store.append(&chain[0]), Err(StorageError::Continuity(_))));

        let mut forged = chain[1].clone();
        forged.skip_list_anchors[0] = ByteHash::new(vec![0xaa; 64]);
        assert!(matches!(store.append(&forged), Err(StorageError::Continuity(_))));

        // rejected appends leave nothing behind
        assert_eq!(store.len(), 1);
        store.append(&chain[1]).unwrap();
        store.append(&chain[2]).unwrap();
    }

    #[test]
    fn test_new_chain_after_restart() {
        let dir = tempdir().unwrap();
        let store = PulseStore::open(dir.path()).unwrap();
        let signer = KeypairSigner::generate();
        let old = build_chain(&signer, 0, 2, "2024-01-01T00:00:00Z");
        let new = build_chain(&signer, 1, 2, "2024-01-01T01:00:00Z");

        store.append(&old[0]).unwrap();
        store.append(&old[1]).unwrap();
        store.append(&new[0]).unwrap();
        store.append(&new[1]).unwrap();

        assert_eq!(store.latest().unwrap().unwrap().position(), (1, 1));
        assert_eq!(store.latest_in_chain(0).unwrap().unwrap().position(), (0, 1));
        assert!(matches!(
            store.pulses_in_chain(1, &[0, 1, 2]),
            Err(StorageError::PulseNotFound { chain: 1, pulse: 2 })
        ));
        assert_eq!(store.pulses_in_chain(0, &[1, 0]).unwrap(), vec![old[1].clone(), old[0].clone()]);
    }

    #[test]
    fn test_time_queries() {
        let dir = tempdir().unwrap();
        let store = PulseStore::open(dir.path()).unwrap();
        let signer = KeypairSigner::generate();
        // stamped 00:00, 00:01, 00:02
        let chain = build_chain(&signer, 0, 3, "2024-01-01T00:00:00Z");
        for p in &chain {
            store.append(p).unwrap();
        }
        let t1 = chain[1].time_stamp;

        assert_eq!(store.at(&t1).unwrap().unwrap().pulse_index, 1);
        assert_eq!(store.at(&(t1 + TimeDelta::seconds(30))).unwrap().unwrap().pulse_index, 1);
        assert_eq!(store.after(&t1).unwrap().unwrap().pulse_index, 2);
        assert_eq!(store.before(&t1).unwrap().unwrap().pulse_index, 0);

        assert!(store.at(&ts("2023-12-31T23:59:59Z")).unwrap().is_none());
        assert!(store.before(&chain[0].time_stamp).unwrap().is_none());
        assert!(store.after(&chain[2].time_stamp).unwrap().is_none());
    }

    #[test]
    fn test_anchor_row_format() {
        let signer = KeypairSigner::generate();
        let chain = build_chain(&signer, 0, 2, "2024-01-01T00:00:00Z");
        let row = StoredPulse::from(&chain[1]);

        let parts: Vec<&str> = row.skip_list_anchors.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], chain[0].output_value.to_hex());
        assert_eq!(Pulse::try_from(row).unwrap(), chain[1]);
    }

    #[test]
    fn test_certificates_and_feed() {
        let dir = tempdir().unwrap();
        let store = PulseStore::open(dir.path()).unwrap();
        let signer = KeypairSigner::generate();
        let record = signer.certificate().record();

        assert!(store.certificate(&record.certificate_id).unwrap().is_none());
        store.register_certificate(&record).unwrap();
        assert_eq!(store.certificate(&record.certificate_id).unwrap(), Some(record));

        let mut feed = store.subscribe();
        let chain = build_chain(&signer, 0, 1, "2024-01-01T00:00:00Z");
        store.append(&chain[0]).unwrap();
        assert_eq!(feed.try_recv().unwrap(), chain[0]);
    }
}
