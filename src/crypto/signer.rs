//! Signing capability used by the pulse chain builder.
//!
//! The builder and scheduler only see the [`Signer`] trait. Two backends are
//! chosen between at startup: an in-process secp256k1 key ([`KeypairSigner`])
//! and a hardware module reached through its HTTP connector ([`RemoteSigner`]).

use async_trait::async_trait;
use k256::{
    ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey},
    SecretKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use super::{verify_digest, Certificate, CryptoError};
use crate::types::ByteHash;

#[async_trait]
pub trait Signer: Send + Sync {
    /// Deterministic signature over `data` (the serialized signing input).
    async fn sign(&self, data: &[u8]) -> Result<ByteHash, CryptoError>;

    /// Certificate clients use to verify signatures from this signer.
    fn certificate(&self) -> &Certificate;

    fn certificate_id(&self) -> &ByteHash {
        self.certificate().id()
    }
}

/// Software signing key held in process memory.
#[derive(Clone)]
pub struct KeypairSigner {
    signing_key: SigningKey,
    certificate: Certificate,
}

impl KeypairSigner {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Create keypair from private key hex
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim())?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_signing_key(SigningKey::from(secret_key)))
    }

    /// Load the key stored at `path`, or generate one and write it there.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        if path.exists() {
            let hex_key = std::fs::read_to_string(path)?;
            let signer = Self::from_private_key_hex(&hex_key)?;
            info!("🔑 Loaded signing key from {}", path.display());
            return Ok(signer);
        }

        let signer = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, signer.private_key_hex())?;
        info!("🔑 Generated new signing key at {}", path.display());
        Ok(signer)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let certificate = Certificate::from_verifying_key(signing_key.verifying_key());
        Self { signing_key, certificate }
    }

    /// Get private key as hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Signature over an already computed SHA-512 digest.
    pub fn sign_digest(&self, digest: &[u8]) -> Result<ByteHash, CryptoError> {
        let signature: Signature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(ByteHash::new(signature.to_bytes().to_vec()))
    }
}

#[async_trait]
impl Signer for KeypairSigner {
    async fn sign(&self, data: &[u8]) -> Result<ByteHash, CryptoError> {
        self.sign_digest(&Sha512::digest(data))
    }

    fn certificate(&self) -> &Certificate {
        &self.certificate
    }
}

#[derive(Deserialize)]
struct CertificateResponse {
    certificate: String,
}

#[derive(Serialize)]
struct SignRequest {
    digest: String,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

/// Key held by a hardware security module behind an HTTP connector.
///
/// The connector exposes `GET /certificate` and `POST /sign` taking the
/// hex SHA-512 digest of the signing input. Every signature it returns is
/// checked against its certificate before being handed to the builder.
pub struct RemoteSigner {
    client: reqwest::Client,
    base_url: String,
    certificate: Certificate,
}

impl RemoteSigner {
    /// Connect to the connector at `base_url` and fetch its certificate.
    pub async fn connect(base_url: &str, timeout: Duration) -> Result<Self, CryptoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let response: CertificateResponse = client
            .get(format!("{}/certificate", base_url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CryptoError::Signing(format!("certificate fetch failed: {}", e)))?
            .json()
            .await
            .map_err(|e| CryptoError::Signing(format!("bad certificate response: {}", e)))?;

        let certificate = Certificate::from_hex(&response.certificate)?;
        info!(
            "🔐 Remote signer at {} (certificate {}...)",
            base_url,
            certificate.id().short()
        );

        Ok(Self { client, base_url, certificate })
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    async fn sign(&self, data: &[u8]) -> Result<ByteHash, CryptoError> {
        let digest = Sha512::digest(data);
        let response: SignResponse = self
            .client
            .post(format!("{}/sign", self.base_url))
            .json(&SignRequest { digest: hex::encode(digest) })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CryptoError::Signing(e.to_string()))?
            .json()
            .await
            .map_err(|e| CryptoError::Signing(format!("bad sign response: {}", e)))?;

        let signature = ByteHash::from_hex(&response.signature)?;
        if let Err(e) = verify_digest(&self.certificate, &digest, &signature) {
            warn!("Remote signer returned a signature that does not verify");
            return Err(CryptoError::Signing(e.to_string()));
        }
        Ok(signature)
    }

    fn certificate(&self) -> &Certificate {
        &self.certificate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_signature;

    #[tokio::test]
    async fn test_sign_and_verify() {
        let signer = KeypairSigner::generate();
        let data = b"serialized pulse fields";
        let signature = signer.sign(data).await.unwrap();

        assert!(verify_signature(signer.certificate(), data, &signature).is_ok());
    }

    #[tokio::test]
    async fn test_signature_is_deterministic() {
        let signer = KeypairSigner::generate();
        let first = signer.sign(b"same input").await.unwrap();
        let second = signer.sign(b"same input").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let signer1 = KeypairSigner::generate();
        let signer2 = KeypairSigner::generate();
        let signature = signer1.sign(b"test data").await.unwrap();

        assert!(matches!(
            verify_signature(signer2.certificate(), b"test data", &signature),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("signing.key");

        let created = KeypairSigner::load_or_generate(&path).unwrap();
        let loaded = KeypairSigner::load_or_generate(&path).unwrap();

        assert_eq!(created.certificate_id(), loaded.certificate_id());
        assert_eq!(created.private_key_hex(), loaded.private_key_hex());

        let signature = tokio_test::block_on(loaded.sign(b"after reload")).unwrap();
        assert!(verify_signature(created.certificate(), b"after reload", &signature).is_ok());
    }

    #[tokio::test]
    async fn test_remote_signer_unreachable() {
        let result = RemoteSigner::connect("http://127.0.0.1:9", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(CryptoError::Signing(_))));
    }
}
