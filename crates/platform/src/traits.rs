//! Cryptographic capability traits.
//!
//! The protocol engine never implements primitives itself. Everything it needs
//! (randomness, digests, HMAC, symmetric ciphers, modular exponentiation) is
//! reached through a [`CryptoBackend`] handle that is passed in when a session
//! is constructed.

use crate::error::ConchResult;
use num_bigint::BigUint;

/// Message digest algorithms the engine asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    /// SHA-1 (20-byte output)
    Sha1,
    /// SHA-256 (32-byte output)
    Sha256,
    /// SHA-512 (64-byte output)
    Sha512,
}

impl DigestAlgorithm {
    /// Output size in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha512 => 64,
        }
    }
}

/// Block cipher chaining mode.
///
/// The key size is implied by the key handed to [`CryptoBackend::block_cipher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMode {
    /// AES in counter mode
    AesCtr,
    /// AES in cipher block chaining mode
    AesCbc,
}

/// Whether a cipher instance encrypts or decrypts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Outbound traffic
    Encrypt,
    /// Inbound traffic
    Decrypt,
}

/// A keyed, stateful cipher transforming data in place.
///
/// Successive calls continue the same keystream / chaining state, so the
/// packet layer can decrypt the first block of a frame before the rest.
pub trait BlockTransform: Send {
    /// Transforms `data` in place. `data.len()` must be a multiple of the block size.
    fn apply(&mut self, data: &mut [u8]) -> ConchResult<()>;

    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;
}

/// Capability set the transport is polymorphic over.
///
/// Implementations must be safe to share between the reader task and callers.
pub trait CryptoBackend: Send + Sync {
    /// Fills `buf` from a secure random source.
    fn fill_random(&self, buf: &mut [u8]);

    /// Hashes the concatenation of `parts`.
    fn digest(&self, algorithm: DigestAlgorithm, parts: &[&[u8]]) -> Vec<u8>;

    /// Computes HMAC over the concatenation of `parts`.
    fn hmac(&self, algorithm: DigestAlgorithm, key: &[u8], parts: &[&[u8]]) -> Vec<u8>;

    /// Creates a cipher keyed with `key` and initialized with `iv`.
    fn block_cipher(
        &self,
        mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        direction: CipherDirection,
    ) -> ConchResult<Box<dyn BlockTransform>>;

    /// Computes `base^exponent mod modulus`.
    fn modpow(&self, base: &BigUint, exponent: &BigUint, modulus: &BigUint) -> BigUint;
}
