//! Client-side pulse verification.
//!
//! [`validate_pulse`] and [`validate_skiplist_segment`] are pure checks over
//! pulses a client already holds. [`BeaconClient`] fetches pulses and
//! certificates from a beacon's read API and runs them.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::api::ApiResponse;
use crate::chain::compute_output_value;
use crate::crypto::{verify_signature, Certificate, CryptoError};
use crate::types::{ByteHash, CertificateRecord, Pulse};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Invalid signature on pulse {pulse} of chain {chain}")]
    InvalidSignature { chain: u64, pulse: u64 },
    #[error("Output value of pulse {pulse} of chain {chain} does not match its fields")]
    OutputMismatch { chain: u64, pulse: u64 },
    #[error("Certificate {0} does not match the pulse's certificate id")]
    CertificateMismatch(String),
    #[error("Skip list broken between pulses {from} and {to}")]
    SkipListBroken { from: u64, to: u64 },
    #[error("Returned path does not span pulses {from} to {to} of chain {chain}")]
    SegmentMismatch { chain: u64, from: u64, to: u64 },
    #[error("Certificate error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Beacon API error: {0}")]
    Api(String),
}

/// Check a pulse's signature and output value against `certificate`.
pub fn validate_pulse(pulse: &Pulse, certificate: &Certificate) -> Result<(), VerifyError> {
    if certificate.id() != &pulse.certificate_id {
        return Err(VerifyError::CertificateMismatch(certificate.id().short()));
    }
    verify_signature(certificate, &pulse.signing_bytes(), &pulse.signature_value).map_err(|_| {
        VerifyError::InvalidSignature { chain: pulse.chain_index, pulse: pulse.pulse_index }
    })?;
    if compute_output_value(pulse) != pulse.output_value {
        return Err(VerifyError::OutputMismatch { chain: pulse.chain_index, pulse: pulse.pulse_index });
    }
    Ok(())
}

/// Check an audit path: every pulse validates and each one anchors the
/// output value of the pulse before it.
///
/// `certificate_for` resolves a certificate id to its certificate.
pub fn validate_skiplist_segment<F>(path: &[Pulse], mut certificate_for: F) -> Result<(), VerifyError>
where
    F: FnMut(&ByteHash) -> Result<Certificate, VerifyError>,
{
    if let Some(first) = path.first() {
        validate_pulse(first, &certificate_for(&first.certificate_id)?)?;
    }

    for pair in path.windows(2) {
        let (prev, pulse) = (&pair[0], &pair[1]);
        validate_pulse(pulse, &certificate_for(&pulse.certificate_id)?)?;

        let linked = prev.chain_index == pulse.chain_index
            && prev.pulse_index < pulse.pulse_index
            && pulse.skip_list_anchors.contains(&prev.output_value);
        if !linked {
            return Err(VerifyError::SkipListBroken { from: prev.pulse_index, to: pulse.pulse_index });
        }
    }
    Ok(())
}

/// HTTP client for a beacon's read API.
pub struct BeaconClient {
    http: reqwest::Client,
    base_url: String,
    certificates: Mutex<HashMap<ByteHash, Certificate>>,
}

impl BeaconClient {
    pub fn new(base_url: &str) -> Result<Self, VerifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            certificates: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T, VerifyError> {
        let response: ApiResponse<T> = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?
            .json()
            .await?;
        match response.data {
            Some(data) if response.success => Ok(data),
            _ => Err(VerifyError::Api(response.error.unwrap_or_else(|| "empty response".into()))),
        }
    }

    pub async fn latest_pulse(&self) -> Result<Pulse, VerifyError> {
        self.fetch("/pulse/last").await
    }

    pub async fn pulse(&self, chain_index: u64, pulse_index: u64) -> Result<Pulse, VerifyError> {
        self.fetch(&format!("/chain/{}/pulse/{}", chain_index, pulse_index)).await
    }

    pub async fn skiplist(&self, chain_index: u64, from: u64, to: u64) -> Result<Vec<Pulse>, VerifyError> {
        self.fetch(&format!("/chain/{}/skiplist/{}/{}", chain_index, from, to)).await
    }

    /// Certificate for `certificate_id`, fetched once and cached.
    pub async fn certificate(&self, certificate_id: &ByteHash) -> Result<Certificate, VerifyError> {
        if let Some(cert) = self.certificates.lock().await.get(certificate_id) {
            return Ok(cert.clone());
        }

        let record: CertificateRecord = self
            .fetch(&format!("/certificate/{}", certificate_id.to_hex()))
            .await?;
        let cert = Certificate::from_public_key(record.certificate.as_bytes().to_vec())?;
        if cert.id() != certificate_id {
            return Err(VerifyError::CertificateMismatch(cert.id().short()));
        }
        debug!("certificate {}... cached", certificate_id.short());
        self.certificates.lock().await.insert(certificate_id.clone(), cert.clone());
        Ok(cert)
    }

    pub async fn verify_pulse(&self, pulse: &Pulse) -> Result<(), VerifyError> {
        let cert = self.certificate(&pulse.certificate_id).await?;
        validate_pulse(pulse, &cert)
    }

    /// Fetch and validate the audit path from `from` to `to`.
    pub async fn verify_segment(&self, chain_index: u64, from: u64, to: u64) -> Result<Vec<Pulse>, VerifyError> {
        let path = self.skiplist(chain_index, from, to).await?;
        let spans = matches!(
            (path.first(), path.last()),
            (Some(first), Some(last)) if first.pulse_index == from && last.pulse_index == to
        );
        if !spans || path.iter().any(|p| p.chain_index != chain_index) {
            return Err(VerifyError::SegmentMismatch { chain: chain_index, from, to });
        }

        let mut certs = HashMap::new();
        for pulse in &path {
            if !certs.contains_key(&pulse.certificate_id) {
                let cert = self.certificate(&pulse.certificate_id).await?;
                certs.insert(pulse.certificate_id.clone(), cert);
            }
        }
        validate_skiplist_segment(&path, |id| {
            certs
                .get(id)
                .cloned()
                .ok_or_else(|| VerifyError::CertificateMismatch(id.short()))
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PulseChainBuilder;
    use crate::crypto::{KeypairSigner, Signer};
    use crate::skiplist::SkipLayers;
    use crate::types::parse_timestamp;

    async fn chain(signer: &KeypairSigner, len: usize) -> Vec<Pulse> {
        let b = PulseChainBuilder::new("http://beacon.test", "2.0", 60_000, SkipLayers::new(3, 3).unwrap());
        let now = parse_timestamp("2024-02-02T02:02:02Z").unwrap();
        let mut out: Vec<Pulse> = Vec::new();
        for i in 0..len {
            let mut p = b.init(signer, 0, ByteHash::new(vec![i as u8; 64]), out.last(), now).unwrap();
            b.finalize(signer, &mut p, out.last(), &ByteHash::new(vec![i as u8 + 1; 64])).await.unwrap();
            out.push(p);
        }
        out
    }

    fn path_of(pulses: &[Pulse], indices: &[u64]) -> Vec<Pulse> {
        indices.iter().map(|&i| pulses[i as usize].clone()).collect()
    }

    #[tokio::test]
    async fn test_validate_pulse() {
        let signer = KeypairSigner::generate();
        let pulses = chain(&signer, 2).await;
        assert!(validate_pulse(&pulses[1], signer.certificate()).is_ok());

        let other = KeypairSigner::generate();
        assert!(matches!(
            validate_pulse(&pulses[1], other.certificate()),
            Err(VerifyError::CertificateMismatch(_))
        ));

        let mut forged = pulses[1].clone();
        forged.status_code = crate::types::StatusCode::OK;
        forged.local_random_value = ByteHash::new(vec![0xff; 64]);
        assert!(matches!(
            validate_pulse(&forged, signer.certificate()),
            Err(VerifyError::InvalidSignature { chain: 0, pulse: 1 })
        ));

        let mut relinked = pulses[1].clone();
        relinked.output_value = ByteHash::new(vec![0; 64]);
        assert!(matches!(
            validate_pulse(&relinked, signer.certificate()),
            Err(VerifyError::OutputMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_skiplist_segment() {
        let signer = KeypairSigner::generate();
        let pulses = chain(&signer, 20).await;
        let layers = SkipLayers::new(3, 3).unwrap();
        let cert = signer.certificate().clone();
        let lookup = |_: &ByteHash| -> Result<Certificate, VerifyError> { Ok(cert.clone()) };

        for (src, dst) in [(0, 19), (1, 18), (5, 6), (9, 9)] {
            let mut indices = layers.path(src, dst).unwrap();
            if indices.is_empty() {
                indices.push(src);
            }
            let path = path_of(&pulses, &indices);
            assert!(validate_skiplist_segment(&path, lookup).is_ok(), "{} -> {}", src, dst);
        }
    }

    #[tokio::test]
    async fn test_broken_segment() {
        let signer = KeypairSigner::generate();
        let pulses = chain(&signer, 12).await;
        let cert = signer.certificate().clone();
        let lookup = |_: &ByteHash| -> Result<Certificate, VerifyError> { Ok(cert.clone()) };

        // 1 -> 5 is not a skip hop: 5 does not anchor 1
        let path = path_of(&pulses, &[0, 1, 5]);
        assert!(matches!(
            validate_skiplist_segment(&path, lookup),
            Err(VerifyError::SkipListBroken { from: 1, to: 5 })
        ));

        // a substituted pulse fails its own validation
        let mut path = path_of(&pulses, &[0, 1, 2, 3]);
        path[2].local_random_value = ByteHash::new(vec![0xee; 64]);
        assert!(validate_skiplist_segment(&path, lookup).is_err());
    }
}
