//! Cryptographic operations for the beacon.
//! SHA-512 hashing and secp256k1 ECDSA over SHA-512 digests (cypher suite 1).

pub mod signer;

use k256::ecdsa::{signature::hazmat::PrehashVerifier, Signature, VerifyingKey};
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::types::encoding::serialize_bytes;
use crate::types::ByteHash;

pub use signer::{KeypairSigner, RemoteSigner, Signer};

/// Cypher suite 1: SHA-512 hashing, deterministic ECDSA/secp256k1 signatures.
pub const CYPHER_SUITE: u32 = 1;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Hex decode error: {0}")]
    HexError(#[from] hex::FromHexError),
    #[error("Key file error: {0}")]
    Io(#[from] std::io::Error),
}

/// SHA-512 of raw bytes.
pub fn sha512(data: &[u8]) -> ByteHash {
    ByteHash::new(Sha512::digest(data).to_vec())
}

/// SHA-512 of the length-prefixed encoding of a single byte value.
pub fn hash_value(value: &ByteHash) -> ByteHash {
    sha512(&serialize_bytes(value.as_bytes()))
}

/// SHA-512 over the length-prefixed encodings of several byte values in order.
pub fn hash_many<'a, I>(values: I) -> ByteHash
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha512::new();
    for value in values {
        hasher.update(serialize_bytes(value));
    }
    ByteHash::new(hasher.finalize().to_vec())
}

/// Public half of a signing key, identified by the hash of its encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// SEC1 compressed public key
    public_key: Vec<u8>,
    id: ByteHash,
}

impl Certificate {
    pub fn from_public_key(public_key: Vec<u8>) -> Result<Self, CryptoError> {
        VerifyingKey::from_sec1_bytes(&public_key).map_err(|_| CryptoError::InvalidPublicKey)?;
        let id = hash_value(&ByteHash::new(public_key.clone()));
        Ok(Self { public_key, id })
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let public_key = key.to_sec1_bytes().to_vec();
        let id = hash_value(&ByteHash::new(public_key.clone()));
        Self { public_key, id }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        Self::from_public_key(hex::decode(hex_key)?)
    }

    pub fn id(&self) -> &ByteHash {
        &self.id
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    pub fn record(&self) -> crate::types::CertificateRecord {
        crate::types::CertificateRecord {
            certificate_id: self.id.clone(),
            certificate: ByteHash::new(self.public_key.clone()),
        }
    }
}

/// Verify `signature` over the SHA-512 digest of `data`.
pub fn verify_signature(
    certificate: &Certificate,
    data: &[u8],
    signature: &ByteHash,
) -> Result<(), CryptoError> {
    let digest = Sha512::digest(data);
    verify_digest(certificate, &digest, signature)
}

/// Verify `signature` over an already computed digest.
pub fn verify_digest(
    certificate: &Certificate,
    digest: &[u8],
    signature: &ByteHash,
) -> Result<(), CryptoError> {
    let verifying_key = VerifyingKey::from_sec1_bytes(certificate.public_key())
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let signature = Signature::from_slice(signature.as_bytes())
        .map_err(|_| CryptoError::InvalidSignature)?;

    verifying_key
        .verify_prehash(digest, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
