//! SSH host keys (RFC 4253 Section 6.6).
//!
//! Key objects are opaque to the transport: it asks them for a public wire
//! blob and a signature, and hands blobs it receives to
//! [`verify_host_signature`]. The same [`HostKey`] trait is used for the
//! client's key in `publickey` authentication.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519` - sign and verify
//! - `rsa-sha2-256`, `rsa-sha2-512`, `ssh-rsa` - verify only
//!
//! # Example
//!
//! ```rust
//! use conch_proto::ssh::hostkey::{verify_host_signature, Ed25519HostKey, HostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hostkey = Ed25519HostKey::generate();
//! let blob = hostkey.public_key_blob();
//! let signature = hostkey.sign(b"data to sign")?;
//! assert!(verify_host_signature(&blob, b"data to sign", &signature)?);
//! assert!(hostkey.fingerprint().starts_with("SHA256:"));
//! # Ok(())
//! # }
//! ```

use crate::ssh::wire::{SshBufMut, WireReader};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use conch_platform::{ConchError, ConchResult};
use rand::rngs::OsRng;
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// A private key able to prove identity.
pub trait HostKey: Send + Sync {
    /// Algorithm name as negotiated (e.g. "ssh-ed25519").
    fn algorithm(&self) -> &str;

    /// Public key in SSH wire format (string algorithm, then key data).
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning the wire signature (string algorithm, string signature).
    fn sign(&self, data: &[u8]) -> ConchResult<Vec<u8>>;

    /// `SHA256:` fingerprint of the public blob.
    fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_blob())
    }
}

/// OpenSSH-style fingerprint of a public key blob.
pub fn fingerprint(key_blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key_blob)))
}

/// Ed25519 host key (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519HostKey {
    signing_key: SigningKey,
}

impl Ed25519HostKey {
    /// Generates a new key pair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Creates from a 32-byte secret key.
    pub fn from_bytes(secret_bytes: &[u8]) -> ConchResult<Self> {
        let key_bytes: [u8; 32] = secret_bytes.try_into().map_err(|_| {
            ConchError::Security("Ed25519 secret key must be 32 bytes".to_string())
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&key_bytes),
        })
    }

    /// Secret key bytes.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Public half.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl HostKey for Ed25519HostKey {
    fn algorithm(&self) -> &str {
        "ssh-ed25519"
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(51);
        blob.put_ssh_string(b"ssh-ed25519");
        blob.put_ssh_string(self.signing_key.verifying_key().as_bytes());
        blob
    }

    fn sign(&self, data: &[u8]) -> ConchResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        let mut blob = Vec::with_capacity(83);
        blob.put_ssh_string(b"ssh-ed25519");
        blob.put_ssh_string(&signature.to_bytes());
        Ok(blob)
    }
}

impl std::fmt::Debug for Ed25519HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519HostKey")
            .field("algorithm", &"ssh-ed25519")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Key type named inside a public key blob.
pub fn key_type(key_blob: &[u8]) -> ConchResult<String> {
    WireReader::new(key_blob).read_utf8()
}

/// Signature algorithm named inside a signature blob.
pub fn signature_algorithm(sig_blob: &[u8]) -> ConchResult<String> {
    WireReader::new(sig_blob).read_utf8()
}

/// Key type a negotiated host key algorithm corresponds to.
pub fn key_type_for_algorithm(algorithm: &str) -> &str {
    match algorithm {
        "rsa-sha2-256" | "rsa-sha2-512" => "ssh-rsa",
        other => other,
    }
}

/// Verifies a wire-format signature against a wire-format public key.
///
/// Returns `Ok(false)` for a well-formed but wrong signature and an error for
/// malformed blobs or unsupported algorithms.
pub fn verify_host_signature(key_blob: &[u8], data: &[u8], sig_blob: &[u8]) -> ConchResult<bool> {
    let mut key = WireReader::new(key_blob);
    let key_type = key.read_utf8()?;

    let mut sig = WireReader::new(sig_blob);
    let sig_algorithm = sig.read_utf8()?;
    let sig_bytes = sig.read_string()?;

    if key_type_for_algorithm(&sig_algorithm) != key_type {
        return Ok(false);
    }

    match sig_algorithm.as_str() {
        "ssh-ed25519" => {
            let public: [u8; 32] = key.read_string()?.try_into().map_err(|_| {
                ConchError::Protocol("Ed25519 public key must be 32 bytes".to_string())
            })?;
            let signature: [u8; 64] = sig_bytes.try_into().map_err(|_| {
                ConchError::Protocol("Ed25519 signature must be 64 bytes".to_string())
            })?;
            let verifying_key = VerifyingKey::from_bytes(&public)
                .map_err(|e| ConchError::Protocol(format!("Invalid Ed25519 public key: {}", e)))?;
            Ok(verifying_key
                .verify(data, &Signature::from_bytes(&signature))
                .is_ok())
        }
        "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => {
            let e = key.read_string()?;
            let n = key.read_string()?;
            let components = RsaPublicKeyComponents { n, e };
            let params = match sig_algorithm.as_str() {
                "rsa-sha2-256" => &RSA_PKCS1_2048_8192_SHA256,
                "rsa-sha2-512" => &RSA_PKCS1_2048_8192_SHA512,
                _ => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            };
            Ok(components.verify(params, data, sig_bytes).is_ok())
        }
        other => Err(ConchError::Protocol(format!(
            "Unsupported signature algorithm: {}",
            other
        ))),
    }
}

/// Policy deciding whether a server's (already signature-checked) host key is trusted.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns `true` to accept the key.
    fn verify(&self, algorithm: &str, key_blob: &[u8]) -> bool;
}

/// Accepts every host key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, _algorithm: &str, _key_blob: &[u8]) -> bool {
        true
    }
}

/// Accepts only keys whose blob is in a fixed set.
#[derive(Debug, Clone, Default)]
pub struct PinnedHostKeys {
    keys: Vec<Vec<u8>>,
}

impl PinnedHostKeys {
    /// Creates a policy trusting exactly `keys`.
    pub fn new(keys: Vec<Vec<u8>>) -> Self {
        Self { keys }
    }

    /// Adds a trusted key blob.
    pub fn add(&mut self, key_blob: Vec<u8>) {
        self.keys.push(key_blob);
    }
}

impl HostKeyVerifier for PinnedHostKeys {
    fn verify(&self, _algorithm: &str, key_blob: &[u8]) -> bool {
        self.keys.iter().any(|k| k == key_blob)
    }
}
