//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include `mac` or the length field itself
//! - `padding_length` is between 4 and 255, the smallest value that makes
//!   `packet_length + 4` a multiple of the cipher block size (8 with no cipher)
//! - The MAC covers `sequence_number || unencrypted frame` and is sent in clear
//! - `packet_length` of zero or above the configured maximum is a framing error
//!
//! Each direction owns one [`CipherState`]. A key exchange builds the next state
//! and the direction swaps it in with [`CipherState::install`]; the sequence
//! number carries over and is never reset.
//!
//! # Example
//!
//! ```rust
//! use conch_proto::ssh::crypto::SoftwareBackend;
//! use conch_proto::ssh::packet::CipherState;
//!
//! let backend = SoftwareBackend::new();
//! let mut outbound = CipherState::plaintext();
//! let mut inbound = CipherState::plaintext();
//!
//! let frame = outbound.seal(&backend, b"payload", 256 * 1024).unwrap();
//! assert_eq!(frame.len() % 8, 0);
//!
//! let payload = inbound.open(&backend, &frame, 256 * 1024).unwrap();
//! assert_eq!(payload, b"payload");
//! ```

use crate::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm, MacKey};
use bytes::{BufMut, BytesMut};
use conch_platform::{BlockTransform, CipherDirection, ConchError, ConchResult, CryptoBackend};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use zeroize::Zeroize;

/// Default upper bound on `packet_length`.
pub const DEFAULT_MAX_PACKET_LEN: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// Block size used for alignment before any cipher is negotiated.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Thresholds after which a direction asks for a new key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyLimits {
    /// Bytes transferred under one set of keys
    pub bytes: u64,
    /// Packets transferred under one set of keys
    pub packets: u64,
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            bytes: 1 << 30,
            packets: 1 << 31,
        }
    }
}

/// Key material for one direction, as produced by a key exchange.
pub struct DirectionKeys {
    /// Negotiated cipher
    pub cipher: CipherAlgorithm,
    /// Negotiated MAC
    pub mac: MacAlgorithm,
    /// Negotiated compression
    pub compression: CompressionAlgorithm,
    /// Initial IV
    pub iv: Vec<u8>,
    /// Encryption key
    pub key: Vec<u8>,
    /// Integrity key
    pub mac_key: Vec<u8>,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl Drop for DirectionKeys {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.key.zeroize();
        self.mac_key.zeroize();
    }
}

/// Cryptographic state of one traffic direction.
pub struct CipherState {
    cipher: Option<Box<dyn BlockTransform>>,
    block_size: usize,
    mac: Option<MacKey>,
    compression: CompressionAlgorithm,
    sequence: u32,
    bytes: u64,
    packets: u64,
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("encrypted", &self.cipher.is_some())
            .field("block_size", &self.block_size)
            .field("mac", &self.mac.as_ref().map(|m| m.algorithm()))
            .field("sequence", &self.sequence)
            .field("bytes", &self.bytes)
            .field("packets", &self.packets)
            .finish()
    }
}

/// Smallest padding >= 4 that aligns the whole frame to `block_size`.
pub fn padding_len(payload_len: usize, block_size: usize) -> usize {
    let unpadded = 5 + payload_len;
    let mut padding = block_size - (unpadded % block_size);
    if padding < MIN_PADDING_LEN {
        padding += block_size;
    }
    padding
}

impl CipherState {
    /// State before the first NEWKEYS: no cipher, no MAC, no compression.
    pub fn plaintext() -> Self {
        Self {
            cipher: None,
            block_size: MIN_BLOCK_SIZE,
            mac: None,
            compression: CompressionAlgorithm::None,
            sequence: 0,
            bytes: 0,
            packets: 0,
        }
    }

    /// Builds keyed state for one direction.
    pub fn from_keys(
        backend: &dyn CryptoBackend,
        keys: &DirectionKeys,
        direction: CipherDirection,
    ) -> ConchResult<Self> {
        let cipher = backend.block_cipher(keys.cipher.mode(), &keys.key, &keys.iv, direction)?;
        let block_size = cipher.block_size().max(MIN_BLOCK_SIZE);
        Ok(Self {
            cipher: Some(cipher),
            block_size,
            mac: Some(MacKey::new(keys.mac, &keys.mac_key)?),
            compression: keys.compression,
            sequence: 0,
            bytes: 0,
            packets: 0,
        })
    }

    /// Swaps in freshly derived state. The sequence number keeps running and
    /// the rekey counters start over.
    pub fn install(&mut self, next: CipherState) {
        self.cipher = next.cipher;
        self.block_size = next.block_size;
        self.mac = next.mac;
        self.compression = next.compression;
        self.bytes = 0;
        self.packets = 0;
    }

    /// Sequence number of the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Bytes transferred since keys were last installed.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Packets transferred since keys were last installed.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Active block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Length of the MAC trailer.
    pub fn mac_len(&self) -> usize {
        self.mac.as_ref().map_or(0, |m| m.algorithm().mac_size())
    }

    /// Active compression.
    pub fn compression(&self) -> CompressionAlgorithm {
        self.compression
    }

    /// Whether a cipher is active.
    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Whether either counter has passed its threshold.
    pub fn exceeds(&self, limits: &RekeyLimits) -> bool {
        self.bytes >= limits.bytes || self.packets >= limits.packets
    }

    fn advance(&mut self, frame_len: usize) {
        self.sequence = self.sequence.wrapping_add(1);
        self.bytes += frame_len as u64;
        self.packets += 1;
    }

    /// Frames, MACs and encrypts one payload.
    pub fn seal(
        &mut self,
        backend: &dyn CryptoBackend,
        payload: &[u8],
        max_packet_len: usize,
    ) -> ConchResult<Vec<u8>> {
        let padding = padding_len(payload.len(), self.block_size);
        let packet_length = 1 + payload.len() + padding;
        if packet_length > max_packet_len {
            return Err(ConchError::Framing(format!(
                "Outgoing packet too large: {} bytes (maximum {})",
                packet_length, max_packet_len
            )));
        }

        let mut pad = vec![0u8; padding];
        backend.fill_random(&mut pad);

        let mut frame = BytesMut::with_capacity(4 + packet_length + self.mac_len());
        frame.put_u32(packet_length as u32);
        frame.put_u8(padding as u8);
        frame.put_slice(payload);
        frame.put_slice(&pad);
        let mut frame = frame.to_vec();

        let tag = self
            .mac
            .as_ref()
            .map(|mac| mac.compute(backend, self.sequence, &frame));

        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut frame)?;
        }
        if let Some(tag) = tag {
            frame.extend_from_slice(&tag);
        }

        trace!(
            "Sealed packet seq={} len={} pad={}",
            self.sequence,
            packet_length,
            padding
        );
        self.advance(4 + packet_length);
        Ok(frame)
    }

    /// Decrypts the first block and validates the length field.
    ///
    /// Returns how many more bytes (rest of frame plus MAC) must be read.
    pub fn open_first_block(&mut self, block: &mut [u8], max_packet_len: usize) -> ConchResult<usize> {
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(block)?;
        }

        let packet_length = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
        if packet_length == 0 {
            return Err(ConchError::Framing("Zero packet length".to_string()));
        }
        if packet_length > max_packet_len {
            return Err(ConchError::Framing(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, max_packet_len
            )));
        }
        let total = packet_length + 4;
        if total < block.len() || total % self.block_size != 0 {
            return Err(ConchError::Framing(format!(
                "Packet length {} not aligned to block size {}",
                packet_length, self.block_size
            )));
        }

        Ok(total - block.len() + self.mac_len())
    }

    /// Decrypts the remainder of a frame, checks the MAC and extracts the payload.
    ///
    /// `first_block` is the plaintext returned through [`open_first_block`](Self::open_first_block);
    /// `rest` holds the remaining ciphertext followed by the MAC.
    pub fn open_rest(
        &mut self,
        backend: &dyn CryptoBackend,
        first_block: &[u8],
        rest: &mut [u8],
    ) -> ConchResult<Vec<u8>> {
        let mac_len = self.mac_len();
        let body_len = rest.len() - mac_len;
        let (body, received_mac) = rest.split_at_mut(body_len);

        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(body)?;
        }

        let mut frame = Vec::with_capacity(first_block.len() + body.len());
        frame.extend_from_slice(first_block);
        frame.extend_from_slice(body);

        if let Some(mac) = self.mac.as_ref() {
            mac.verify(backend, self.sequence, &frame, received_mac)?;
        }

        let packet_length = frame.len() - 4;
        let padding = frame[4] as usize;
        if padding < MIN_PADDING_LEN || padding + 1 > packet_length {
            return Err(ConchError::Framing(format!(
                "Invalid padding length {} for packet length {}",
                padding, packet_length
            )));
        }
        let payload = frame[5..frame.len() - padding].to_vec();

        trace!(
            "Opened packet seq={} len={} pad={}",
            self.sequence,
            packet_length,
            padding
        );
        self.advance(frame.len());
        Ok(payload)
    }

    /// Opens one complete frame held in memory.
    pub fn open(
        &mut self,
        backend: &dyn CryptoBackend,
        data: &[u8],
        max_packet_len: usize,
    ) -> ConchResult<Vec<u8>> {
        let block_size = self.block_size;
        if data.len() < block_size {
            return Err(ConchError::Framing(format!(
                "Frame too short: {} bytes",
                data.len()
            )));
        }
        let mut first = data[..block_size].to_vec();
        let remaining = self.open_first_block(&mut first, max_packet_len)?;
        if data.len() != block_size + remaining {
            return Err(ConchError::Framing(format!(
                "Frame length mismatch: expected {} bytes, got {}",
                block_size + remaining,
                data.len()
            )));
        }
        let mut rest = data[block_size..].to_vec();
        self.open_rest(backend, &first, &mut rest)
    }
}

fn eof_to_closed(err: std::io::Error) -> ConchError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ConchError::TransportClosed("Peer closed the connection".to_string())
    } else {
        ConchError::Io(err)
    }
}

/// Inbound half of the packetizer.
pub struct PacketReader<R> {
    stream: R,
    state: CipherState,
    backend: Arc<dyn CryptoBackend>,
    max_packet_len: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Wraps the read half of a connection.
    pub fn new(stream: R, backend: Arc<dyn CryptoBackend>, max_packet_len: usize) -> Self {
        Self {
            stream,
            state: CipherState::plaintext(),
            backend,
            max_packet_len,
        }
    }

    /// Reads and authenticates the next packet, returning its payload.
    pub async fn read_packet(&mut self) -> ConchResult<Vec<u8>> {
        let mut first = vec![0u8; self.state.block_size()];
        self.stream
            .read_exact(&mut first)
            .await
            .map_err(eof_to_closed)?;

        let remaining = self.state.open_first_block(&mut first, self.max_packet_len)?;
        let mut rest = vec![0u8; remaining];
        self.stream
            .read_exact(&mut rest)
            .await
            .map_err(eof_to_closed)?;

        self.state.open_rest(self.backend.as_ref(), &first, &mut rest)
    }

    /// Inbound cipher state.
    pub fn state(&self) -> &CipherState {
        &self.state
    }

    /// Switches inbound keys (on receipt of NEWKEYS).
    pub fn install(&mut self, next: CipherState) {
        self.state.install(next);
    }
}

/// Outbound half of the packetizer.
pub struct PacketWriter<W> {
    stream: W,
    state: CipherState,
    backend: Arc<dyn CryptoBackend>,
    max_packet_len: usize,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Wraps the write half of a connection.
    pub fn new(stream: W, backend: Arc<dyn CryptoBackend>, max_packet_len: usize) -> Self {
        Self {
            stream,
            state: CipherState::plaintext(),
            backend,
            max_packet_len,
        }
    }

    /// Seals and sends one payload.
    pub async fn write_packet(&mut self, payload: &[u8]) -> ConchResult<()> {
        let frame = self
            .state
            .seal(self.backend.as_ref(), payload, self.max_packet_len)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Outbound cipher state.
    pub fn state(&self) -> &CipherState {
        &self.state
    }

    /// Switches outbound keys (right after sending NEWKEYS).
    pub fn install(&mut self, next: CipherState) {
        self.state.install(next);
    }

    /// Shuts down the write half.
    pub async fn shutdown(&mut self) -> ConchResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::SoftwareBackend;

    fn keys(cipher: CipherAlgorithm, mac: MacAlgorithm) -> DirectionKeys {
        DirectionKeys {
            cipher,
            mac,
            compression: CompressionAlgorithm::None,
            iv: vec![0x11; cipher.iv_size()],
            key: vec![0x22; cipher.key_size()],
            mac_key: vec![0x33; mac.key_size()],
        }
    }

    fn keyed_pair(cipher: CipherAlgorithm, mac: MacAlgorithm) -> (CipherState, CipherState) {
        let backend = SoftwareBackend::new();
        let k = keys(cipher, mac);
        let mut tx = CipherState::plaintext();
        let mut rx = CipherState::plaintext();
        tx.install(CipherState::from_keys(&backend, &k, CipherDirection::Encrypt).unwrap());
        rx.install(CipherState::from_keys(&backend, &k, CipherDirection::Decrypt).unwrap());
        (tx, rx)
    }

    #[test]
    fn test_padding_len() {
        assert_eq!(padding_len(0, 8), 11);
        assert_eq!(padding_len(3, 8), 8);
        assert_eq!(padding_len(7, 8), 4);
        assert_eq!(padding_len(11, 16), 16);
        for len in 0..200 {
            for bs in [8usize, 16] {
                let pad = padding_len(len, bs);
                assert!((MIN_PADDING_LEN..=MAX_PADDING_LEN).contains(&pad));
                assert_eq!((5 + len + pad) % bs, 0);
            }
        }
    }

    #[test]
    fn test_plaintext_frame_layout() {
        let backend = SoftwareBackend::new();
        let mut tx = CipherState::plaintext();
        let frame = tx.seal(&backend, b"\x05hello", DEFAULT_MAX_PACKET_LEN).unwrap();

        let packet_length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(packet_length + 4, frame.len());
        assert_eq!(frame.len() % 8, 0);
        assert!(frame[4] as usize >= MIN_PADDING_LEN);
        assert_eq!(&frame[5..11], b"\x05hello");
        assert_eq!(tx.sequence(), 1);
    }

    #[test]
    fn test_encrypted_round_trip_all_algorithms() {
        let backend = SoftwareBackend::new();
        let ciphers = [
            CipherAlgorithm::Aes128Ctr,
            CipherAlgorithm::Aes192Ctr,
            CipherAlgorithm::Aes256Ctr,
            CipherAlgorithm::Aes128Cbc,
            CipherAlgorithm::Aes256Cbc,
        ];
        let macs = [
            MacAlgorithm::HmacSha1,
            MacAlgorithm::HmacSha1_96,
            MacAlgorithm::HmacSha256,
            MacAlgorithm::HmacSha512,
        ];
        for cipher in ciphers {
            for mac in macs {
                let (mut tx, mut rx) = keyed_pair(cipher, mac);
                for len in [0usize, 1, 15, 16, 17, 1000] {
                    let payload = vec![len as u8; len];
                    let frame = tx.seal(&backend, &payload, DEFAULT_MAX_PACKET_LEN).unwrap();
                    assert_eq!((frame.len() - mac.mac_size()) % 16, 0);
                    let opened = rx.open(&backend, &frame, DEFAULT_MAX_PACKET_LEN).unwrap();
                    assert_eq!(opened, payload, "{} / {}", cipher.name(), mac.name());
                }
            }
        }
    }

    #[test]
    fn test_single_byte_corruption_fails_mac() {
        let backend = SoftwareBackend::new();
        let (mut tx, _) = keyed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256);
        let frame = tx.seal(&backend, b"important data", DEFAULT_MAX_PACKET_LEN).unwrap();

        // Skip the first block: flipping it garbles the length and fails earlier as framing
        for i in 16..frame.len() {
            let (_, mut rx) = keyed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256);
            let mut corrupted = frame.clone();
            corrupted[i] ^= 0x01;
            let result = rx.open(&backend, &corrupted, DEFAULT_MAX_PACKET_LEN);
            assert!(
                matches!(result, Err(ConchError::Integrity(_))),
                "byte {} corruption not detected",
                i
            );
        }
    }

    #[test]
    fn test_sequence_numbers_participate_in_mac() {
        let backend = SoftwareBackend::new();
        let (mut tx, mut rx) = keyed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha1);

        let first = tx.seal(&backend, b"one", DEFAULT_MAX_PACKET_LEN).unwrap();
        let second = tx.seal(&backend, b"two", DEFAULT_MAX_PACKET_LEN).unwrap();
        assert_eq!(tx.sequence(), 2);

        // A dropped packet desynchronizes the sequence number and the keystream
        let result = rx.open(&backend, &second, DEFAULT_MAX_PACKET_LEN);
        assert!(result.is_err());
        drop(first);
    }

    #[test]
    fn test_sequence_survives_install_and_wraps() {
        let backend = SoftwareBackend::new();
        let mut tx = CipherState::plaintext();
        tx.sequence = u32::MAX;
        tx.seal(&backend, b"x", DEFAULT_MAX_PACKET_LEN).unwrap();
        assert_eq!(tx.sequence(), 0);

        tx.seal(&backend, b"y", DEFAULT_MAX_PACKET_LEN).unwrap();
        let k = keys(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256);
        tx.install(CipherState::from_keys(&backend, &k, CipherDirection::Encrypt).unwrap());
        assert_eq!(tx.sequence(), 1);
        assert_eq!(tx.packets(), 0);
        assert_eq!(tx.bytes(), 0);
    }

    #[test]
    fn test_zero_length_is_framing_error() {
        let backend = SoftwareBackend::new();
        let mut rx = CipherState::plaintext();
        let frame = [0u8; 16];
        assert!(matches!(
            rx.open(&backend, &frame, DEFAULT_MAX_PACKET_LEN),
            Err(ConchError::Framing(_))
        ));
    }

    #[test]
    fn test_oversized_length_is_framing_error() {
        let backend = SoftwareBackend::new();
        let mut rx = CipherState::plaintext();
        let mut frame = vec![0u8; 16];
        frame[..4].copy_from_slice(&((DEFAULT_MAX_PACKET_LEN + 4) as u32).to_be_bytes());
        assert!(matches!(
            rx.open(&backend, &frame, DEFAULT_MAX_PACKET_LEN),
            Err(ConchError::Framing(_))
        ));

        let mut tx = CipherState::plaintext();
        assert!(tx.seal(&backend, &vec![0u8; 1024], 512).is_err());
    }

    #[test]
    fn test_rekey_counters() {
        let backend = SoftwareBackend::new();
        let mut tx = CipherState::plaintext();
        let limits = RekeyLimits {
            bytes: u64::MAX,
            packets: 3,
        };
        for _ in 0..2 {
            tx.seal(&backend, b"ping", DEFAULT_MAX_PACKET_LEN).unwrap();
        }
        assert!(!tx.exceeds(&limits));
        tx.seal(&backend, b"ping", DEFAULT_MAX_PACKET_LEN).unwrap();
        assert!(tx.exceeds(&limits));
        assert_eq!(tx.bytes(), 48);
    }

    #[tokio::test]
    async fn test_reader_writer_over_duplex() {
        let backend: Arc<dyn CryptoBackend> = Arc::new(SoftwareBackend::new());
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = PacketWriter::new(a, backend.clone(), DEFAULT_MAX_PACKET_LEN);
        let mut reader = PacketReader::new(b, backend.clone(), DEFAULT_MAX_PACKET_LEN);

        writer.write_packet(b"first").await.unwrap();
        let k = keys(CipherAlgorithm::Aes256Ctr, MacAlgorithm::HmacSha512);
        writer.install(CipherState::from_keys(backend.as_ref(), &k, CipherDirection::Encrypt).unwrap());
        writer.write_packet(b"second").await.unwrap();

        assert_eq!(reader.read_packet().await.unwrap(), b"first");
        reader.install(CipherState::from_keys(backend.as_ref(), &k, CipherDirection::Decrypt).unwrap());
        assert_eq!(reader.read_packet().await.unwrap(), b"second");
        assert_eq!(reader.state().sequence(), 2);
    }

    #[tokio::test]
    async fn test_reader_eof_is_transport_closed() {
        let backend: Arc<dyn CryptoBackend> = Arc::new(SoftwareBackend::new());
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut reader = PacketReader::new(b, backend, DEFAULT_MAX_PACKET_LEN);
        assert!(matches!(
            reader.read_packet().await,
            Err(ConchError::TransportClosed(_))
        ));
    }
}
