//! Symmetric algorithms and the software cryptographic backend.
//!
//! # Supported Algorithms
//!
//! ## Ciphers
//! - aes128-ctr, aes192-ctr, aes256-ctr (RFC 4344)
//! - aes128-cbc, aes256-cbc (RFC 4253)
//!
//! ## MAC Algorithms
//! - hmac-sha2-256, hmac-sha2-512 (RFC 6668)
//! - hmac-sha1, hmac-sha1-96 (RFC 4253)
//!
//! ## Compression
//! - none
//!
//! The transport only ever talks to primitives through
//! [`CryptoBackend`](conch_platform::CryptoBackend); [`SoftwareBackend`] is the
//! default implementation built on the RustCrypto crates.

use aes::{Aes128, Aes192, Aes256};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use conch_platform::{
    BlockTransform, CipherDirection, CipherMode, ConchError, ConchResult, CryptoBackend,
    DigestAlgorithm,
};
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Negotiable cipher algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-128 in counter mode
    Aes128Ctr,
    /// AES-192 in counter mode
    Aes192Ctr,
    /// AES-256 in counter mode
    Aes256Ctr,
    /// AES-128 in CBC mode
    Aes128Cbc,
    /// AES-256 in CBC mode
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Ctr => 24,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Cbc => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        16
    }

    /// Returns the cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        16
    }

    /// Returns the chaining mode handed to the backend.
    pub fn mode(&self) -> CipherMode {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes192Ctr | CipherAlgorithm::Aes256Ctr => {
                CipherMode::AesCtr
            }
            CipherAlgorithm::Aes128Cbc | CipherAlgorithm::Aes256Cbc => CipherMode::AesCbc,
        }
    }

    /// Parses from algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes192-ctr" => Some(CipherAlgorithm::Aes192Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            _ => None,
        }
    }
}

/// Negotiable MAC algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA1 truncated to 96 bits
    HmacSha1_96,
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha1_96 => "hmac-sha1-96",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Underlying digest.
    pub fn digest(&self) -> DigestAlgorithm {
        match self {
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1_96 => DigestAlgorithm::Sha1,
            MacAlgorithm::HmacSha256 => DigestAlgorithm::Sha256,
            MacAlgorithm::HmacSha512 => DigestAlgorithm::Sha512,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.digest().output_len()
    }

    /// Returns the transmitted tag size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1_96 => 12,
            _ => self.digest().output_len(),
        }
    }

    /// Parses from algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha1-96" => Some(MacAlgorithm::HmacSha1_96),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

/// Negotiable compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        "none"
    }

    /// Parses from algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            _ => None,
        }
    }
}

/// MAC key bound to one direction.
///
/// The sequence number is owned by the packet layer and passed in, so a key
/// change never disturbs the running count.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> ConchResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(ConchError::Security(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Computes the tag over `sequence || packet_data`.
    pub fn compute(&self, backend: &dyn CryptoBackend, sequence: u32, packet_data: &[u8]) -> Vec<u8> {
        let mut tag = backend.hmac(
            self.algorithm.digest(),
            &self.key,
            &[&sequence.to_be_bytes(), packet_data],
        );
        tag.truncate(self.algorithm.mac_size());
        tag
    }

    /// Verifies a received tag in constant time.
    pub fn verify(
        &self,
        backend: &dyn CryptoBackend,
        sequence: u32,
        packet_data: &[u8],
        received_mac: &[u8],
    ) -> ConchResult<()> {
        let computed = self.compute(backend, sequence, packet_data);

        if computed.len() == received_mac.len() && bool::from(computed.ct_eq(received_mac)) {
            Ok(())
        } else {
            Err(ConchError::Integrity(format!(
                "MAC verification failed for packet {}",
                sequence
            )))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Backend built on `rand`, `sha1`/`sha2`, `hmac`, `aes`/`ctr`/`cbc` and `num-bigint`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareBackend;

impl SoftwareBackend {
    /// Creates a new software backend.
    pub fn new() -> Self {
        Self
    }
}

fn hmac_parts<M: Mac + hmac::digest::KeyInit>(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match <M as hmac::digest::KeyInit>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn digest_parts<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

impl CryptoBackend for SoftwareBackend {
    fn fill_random(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    fn digest(&self, algorithm: DigestAlgorithm, parts: &[&[u8]]) -> Vec<u8> {
        match algorithm {
            DigestAlgorithm::Sha1 => digest_parts::<Sha1>(parts),
            DigestAlgorithm::Sha256 => digest_parts::<Sha256>(parts),
            DigestAlgorithm::Sha512 => digest_parts::<Sha512>(parts),
        }
    }

    fn hmac(&self, algorithm: DigestAlgorithm, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        match algorithm {
            DigestAlgorithm::Sha1 => hmac_parts::<Hmac<Sha1>>(key, parts),
            DigestAlgorithm::Sha256 => hmac_parts::<Hmac<Sha256>>(key, parts),
            DigestAlgorithm::Sha512 => hmac_parts::<Hmac<Sha512>>(key, parts),
        }
    }

    fn block_cipher(
        &self,
        mode: CipherMode,
        key: &[u8],
        iv: &[u8],
        direction: CipherDirection,
    ) -> ConchResult<Box<dyn BlockTransform>> {
        let bad_key = |_| {
            ConchError::Security(format!(
                "Invalid key/IV length for {:?}: key {} bytes, iv {} bytes",
                mode,
                key.len(),
                iv.len()
            ))
        };

        let transform: Box<dyn BlockTransform> = match (mode, key.len(), direction) {
            (CipherMode::AesCtr, 16, _) => {
                Box::new(CtrTransform(Aes128Ctr::new_from_slices(key, iv).map_err(bad_key)?))
            }
            (CipherMode::AesCtr, 24, _) => {
                Box::new(CtrTransform(Aes192Ctr::new_from_slices(key, iv).map_err(bad_key)?))
            }
            (CipherMode::AesCtr, 32, _) => {
                Box::new(CtrTransform(Aes256Ctr::new_from_slices(key, iv).map_err(bad_key)?))
            }
            (CipherMode::AesCbc, 16, CipherDirection::Encrypt) => Box::new(CbcEncrypt(
                cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            (CipherMode::AesCbc, 16, CipherDirection::Decrypt) => Box::new(CbcDecrypt(
                cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            (CipherMode::AesCbc, 32, CipherDirection::Encrypt) => Box::new(CbcEncrypt(
                cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            (CipherMode::AesCbc, 32, CipherDirection::Decrypt) => Box::new(CbcDecrypt(
                cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map_err(bad_key)?,
            )),
            (mode, len, _) => {
                return Err(ConchError::Security(format!(
                    "Unsupported cipher {:?} with {}-byte key",
                    mode, len
                )))
            }
        };

        Ok(transform)
    }

    fn modpow(&self, base: &BigUint, exponent: &BigUint, modulus: &BigUint) -> BigUint {
        base.modpow(exponent, modulus)
    }
}

fn check_block_multiple(data: &[u8], block_size: usize) -> ConchResult<()> {
    if data.len() % block_size != 0 {
        return Err(ConchError::Framing(format!(
            "Cipher input of {} bytes is not a multiple of the {}-byte block size",
            data.len(),
            block_size
        )));
    }
    Ok(())
}

struct CtrTransform<C>(C);

impl<C: StreamCipher + Send> BlockTransform for CtrTransform<C> {
    fn apply(&mut self, data: &mut [u8]) -> ConchResult<()> {
        check_block_multiple(data, 16)?;
        self.0.apply_keystream(data);
        Ok(())
    }

    fn block_size(&self) -> usize {
        16
    }
}

struct CbcEncrypt<C>(C);

impl<C: BlockEncryptMut + Send> BlockTransform for CbcEncrypt<C> {
    fn apply(&mut self, data: &mut [u8]) -> ConchResult<()> {
        let block_size = C::block_size();
        check_block_multiple(data, block_size)?;
        for chunk in data.chunks_exact_mut(block_size) {
            self.0
                .encrypt_block_mut(cipher::Block::<C>::from_mut_slice(chunk));
        }
        Ok(())
    }

    fn block_size(&self) -> usize {
        C::block_size()
    }
}

struct CbcDecrypt<C>(C);

impl<C: BlockDecryptMut + Send> BlockTransform for CbcDecrypt<C> {
    fn apply(&mut self, data: &mut [u8]) -> ConchResult<()> {
        let block_size = C::block_size();
        check_block_multiple(data, block_size)?;
        for chunk in data.chunks_exact_mut(block_size) {
            self.0
                .decrypt_block_mut(cipher::Block::<C>::from_mut_slice(chunk));
        }
        Ok(())
    }

    fn block_size(&self) -> usize {
        C::block_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_algorithm_properties() {
        let aes = CipherAlgorithm::Aes192Ctr;
        assert_eq!(aes.name(), "aes192-ctr");
        assert_eq!(aes.key_size(), 24);
        assert_eq!(aes.block_size(), 16);
        assert_eq!(aes.mode(), CipherMode::AesCtr);
        assert_eq!(CipherAlgorithm::from_name("aes256-cbc"), Some(CipherAlgorithm::Aes256Cbc));
        assert_eq!(CipherAlgorithm::from_name("3des-cbc"), None);
    }

    #[test]
    fn test_mac_algorithm_properties() {
        assert_eq!(MacAlgorithm::HmacSha1_96.key_size(), 20);
        assert_eq!(MacAlgorithm::HmacSha1_96.mac_size(), 12);
        assert_eq!(MacAlgorithm::HmacSha512.mac_size(), 64);
        assert_eq!(MacAlgorithm::from_name("hmac-sha2-256"), Some(MacAlgorithm::HmacSha256));
    }

    #[test]
    fn test_sha1_digest() {
        let backend = SoftwareBackend::new();
        let digest = backend.digest(DigestAlgorithm::Sha1, &[b"ab", b"c"]);
        assert_eq!(hex::encode(digest), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        let backend = SoftwareBackend::new();
        let tag = backend.hmac(
            DigestAlgorithm::Sha256,
            b"Jefe",
            &[b"what do ya want ", b"for nothing?"],
        );
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_ctr_round_trip_across_calls() {
        let backend = SoftwareBackend::new();
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut enc = backend
            .block_cipher(CipherMode::AesCtr, &key, &iv, CipherDirection::Encrypt)
            .unwrap();
        let mut dec = backend
            .block_cipher(CipherMode::AesCtr, &key, &iv, CipherDirection::Decrypt)
            .unwrap();

        let original = vec![0x42u8; 64];
        let mut data = original.clone();
        enc.apply(&mut data).unwrap();
        assert_ne!(data, original);

        // Decrypting in two pieces continues the same keystream
        let (first, rest) = data.split_at_mut(16);
        dec.apply(first).unwrap();
        dec.apply(rest).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_cbc_round_trip() {
        let backend = SoftwareBackend::new();
        let key = [1u8; 32];
        let iv = [2u8; 16];
        let mut enc = backend
            .block_cipher(CipherMode::AesCbc, &key, &iv, CipherDirection::Encrypt)
            .unwrap();
        let mut dec = backend
            .block_cipher(CipherMode::AesCbc, &key, &iv, CipherDirection::Decrypt)
            .unwrap();

        let original: Vec<u8> = (0..48).collect();
        let mut data = original.clone();
        enc.apply(&mut data).unwrap();
        dec.apply(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_cipher_rejects_partial_block() {
        let backend = SoftwareBackend::new();
        let mut enc = backend
            .block_cipher(CipherMode::AesCtr, &[0u8; 16], &[0u8; 16], CipherDirection::Encrypt)
            .unwrap();
        let mut data = vec![0u8; 15];
        assert!(enc.apply(&mut data).is_err());
    }

    #[test]
    fn test_invalid_key_length() {
        let backend = SoftwareBackend::new();
        let result =
            backend.block_cipher(CipherMode::AesCbc, &[0u8; 24], &[0u8; 16], CipherDirection::Encrypt);
        assert!(matches!(result, Err(ConchError::Security(_))));
    }

    #[test]
    fn test_mac_sequence_bound() {
        let backend = SoftwareBackend::new();
        let key = MacKey::new(MacAlgorithm::HmacSha256, &[3u8; 40]).unwrap();
        let tag = key.compute(&backend, 5, b"frame");
        assert_eq!(tag.len(), 32);
        assert!(key.verify(&backend, 5, b"frame", &tag).is_ok());
        assert!(matches!(
            key.verify(&backend, 6, b"frame", &tag),
            Err(ConchError::Integrity(_))
        ));
    }

    #[test]
    fn test_modpow() {
        let backend = SoftwareBackend::new();
        let r = backend.modpow(&BigUint::from(4u32), &BigUint::from(13u32), &BigUint::from(497u32));
        assert_eq!(r, BigUint::from(445u32));
    }
}
