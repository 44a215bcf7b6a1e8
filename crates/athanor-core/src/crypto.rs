//! Digest and signature computation over canonical event bytes.
//!
//! Keys are parsed once at construction and held for the lifetime of the
//! service; they are shared read-only across workers and never logged.
//! Verification failure is a `false` return, not an error — the caller
//! (the integrity verifier) classifies it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::config::CryptoConfig;
use crate::error::{AthanorError, Result};

/// Digest algorithm for event hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "sha512")]
    Sha512,
}

/// Signature algorithm over the canonical payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    #[default]
    #[serde(rename = "RSA-SHA256")]
    RsaSha256,
    #[serde(rename = "RSA-SHA512")]
    RsaSha512,
}

enum KeyPair {
    Sha256 {
        signing: SigningKey<Sha256>,
        verifying: VerifyingKey<Sha256>,
    },
    Sha512 {
        signing: SigningKey<Sha512>,
        verifying: VerifyingKey<Sha512>,
    },
}

/// Holds the configured algorithms and keypair.
pub struct CryptoService {
    hash: HashAlgorithm,
    keys: KeyPair,
}

impl std::fmt::Debug for CryptoService {
    // Key material must never leak through Debug output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoService")
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

impl CryptoService {
    pub fn from_config(config: &CryptoConfig) -> Result<Self> {
        let private = parse_private_key(&config.private_key)?;
        let public = parse_public_key(&config.public_key)?;

        let keys = match config.algorithm {
            SigningAlgorithm::RsaSha256 => KeyPair::Sha256 {
                signing: SigningKey::new(private),
                verifying: VerifyingKey::new(public),
            },
            SigningAlgorithm::RsaSha512 => KeyPair::Sha512 {
                signing: SigningKey::new(private),
                verifying: VerifyingKey::new(public),
            },
        };

        Ok(Self {
            hash: config.hash_algorithm,
            keys,
        })
    }

    /// Digest of `bytes` with the configured hash, as lowercase hex.
    pub fn digest(&self, bytes: &[u8]) -> String {
        match self.hash {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }

    /// Sign `bytes` with the private key; returns a base64 signature.
    pub fn sign(&self, bytes: &[u8]) -> Result<String> {
        let signature = match &self.keys {
            KeyPair::Sha256 { signing, .. } => signing
                .try_sign(bytes)
                .map(|s| s.to_vec())
                .map_err(|e| AthanorError::Crypto(format!("signing failed: {e}")))?,
            KeyPair::Sha512 { signing, .. } => signing
                .try_sign(bytes)
                .map(|s| s.to_vec())
                .map_err(|e| AthanorError::Crypto(format!("signing failed: {e}")))?,
        };
        Ok(BASE64.encode(signature))
    }

    /// Verify a base64 signature over `bytes` with the public key.
    ///
    /// Any decode or verification failure returns `false`.
    pub fn verify(&self, bytes: &[u8], signature_b64: &str) -> bool {
        let Ok(raw) = BASE64.decode(signature_b64) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(raw.as_slice()) else {
            return false;
        };
        match &self.keys {
            KeyPair::Sha256 { verifying, .. } => verifying.verify(bytes, &signature).is_ok(),
            KeyPair::Sha512 { verifying, .. } => verifying.verify(bytes, &signature).is_ok(),
        }
    }
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    match RsaPrivateKey::from_pkcs8_pem(pem) {
        Ok(key) => Ok(key),
        Err(_) => RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| {
            AthanorError::InvalidConfiguration(format!("unreadable private key: {e}"))
        }),
    }
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    match RsaPublicKey::from_public_key_pem(pem) {
        Ok(key) => Ok(key),
        Err(_) => RsaPublicKey::from_pkcs1_pem(pem)
            .map_err(|e| AthanorError::InvalidConfiguration(format!("unreadable public key: {e}"))),
    }
}
