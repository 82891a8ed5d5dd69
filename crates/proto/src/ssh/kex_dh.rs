//! Diffie-Hellman key exchange (RFC 4253 Section 8, RFC 4419, RFC 8268).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 and diffie-hellman-group14-sha1/sha256 (fixed group)
//! - diffie-hellman-group-exchange-sha1/sha256 (negotiated group)
//! - Exchange hash computation and session key derivation
//!
//! Both variants are [`KexStrategy`] values driven by the transport through
//! [`KexStrategy::deliver`]. They never touch the socket: the transport hands
//! over `(message_type, body)` pairs and sends whatever the strategy returns.
//!
//! # Security
//!
//! - Private exponents are drawn in `1 < x < (p-1)/2` and zeroized on drop
//! - Peer public values outside `1 < v < p-1` are rejected
//! - Host-key signature checks on the client leg are done by the transport
//!   before any derived key is installed
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use conch_proto::ssh::crypto::SoftwareBackend;
//! use conch_proto::ssh::kex::ConnectionIdentity;
//! use conch_proto::ssh::kex_dh::{GexRequest, KexMethod, KexStrategy};
//!
//! let identity = ConnectionIdentity {
//!     client_version: "SSH-2.0-conch_0.1".into(),
//!     server_version: "SSH-2.0-peer".into(),
//!     client_kexinit: vec![20],
//!     server_kexinit: vec![20],
//! };
//! let mut kex = KexStrategy::client(
//!     KexMethod::Group14Sha256,
//!     Arc::new(SoftwareBackend::new()),
//!     identity,
//!     GexRequest::default(),
//! );
//! let first = kex.start().unwrap();
//! assert_eq!(first.unwrap()[0], 30);
//! assert_eq!(kex.expected(), &[31]);
//! ```

use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::HostKey;
use crate::ssh::kex::{ConnectionIdentity, NegotiatedAlgorithms};
use crate::ssh::message::kex_codes;
use crate::ssh::packet::DirectionKeys;
use crate::ssh::wire::{mpint_bytes, SshBufMut, WireReader};
use bytes::{BufMut, BytesMut};
use conch_platform::{ConchError, ConchResult, CryptoBackend, DigestAlgorithm};
use num_bigint::BigUint;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Oakley Group 2 prime (RFC 2409 Section 6.2), 1024 bits.
const GROUP1_PRIME: [u8; 128] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11,
    0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE6, 0x53, 0x81,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// MODP Group 14 prime (RFC 3526 Section 3), 2048 bits.
const GROUP14_PRIME: [u8; 256] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11,
    0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE4, 0x5B, 0x3D,
    0xC2, 0x00, 0x7C, 0xB8, 0xA1, 0x63, 0xBF, 0x05, 0x98, 0xDA, 0x48, 0x36,
    0x1C, 0x55, 0xD3, 0x9A, 0x69, 0x16, 0x3F, 0xA8, 0xFD, 0x24, 0xCF, 0x5F,
    0x83, 0x65, 0x5D, 0x23, 0xDC, 0xA3, 0xAD, 0x96, 0x1C, 0x62, 0xF3, 0x56,
    0x20, 0x85, 0x52, 0xBB, 0x9E, 0xD5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6D,
    0x67, 0x0C, 0x35, 0x4E, 0x4A, 0xBC, 0x98, 0x04, 0xF1, 0x74, 0x6C, 0x08,
    0xCA, 0x18, 0x21, 0x7C, 0x32, 0x90, 0x5E, 0x46, 0x2E, 0x36, 0xCE, 0x3B,
    0xE3, 0x9E, 0x77, 0x2C, 0x18, 0x0E, 0x86, 0x03, 0x9B, 0x27, 0x83, 0xA2,
    0xEC, 0x07, 0xA2, 0x8F, 0xB5, 0xC5, 0x5D, 0xF0, 0x6F, 0x4C, 0x52, 0xC9,
    0xDE, 0x2B, 0xCB, 0xF6, 0x95, 0x58, 0x17, 0x18, 0x39, 0x95, 0x49, 0x7C,
    0xEA, 0x95, 0x6A, 0xE5, 0x15, 0xD2, 0x26, 0x18, 0x98, 0xFA, 0x05, 0x10,
    0x15, 0x72, 0x8E, 0x5A, 0x8A, 0xAC, 0xAA, 0x68, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF,
];

/// Key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexMethod {
    /// diffie-hellman-group1-sha1
    Group1Sha1,
    /// diffie-hellman-group14-sha1
    Group14Sha1,
    /// diffie-hellman-group14-sha256
    Group14Sha256,
    /// diffie-hellman-group-exchange-sha1
    GexSha1,
    /// diffie-hellman-group-exchange-sha256
    GexSha256,
}

impl KexMethod {
    /// Parses a negotiated method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "diffie-hellman-group1-sha1" => Some(Self::Group1Sha1),
            "diffie-hellman-group14-sha1" => Some(Self::Group14Sha1),
            "diffie-hellman-group14-sha256" => Some(Self::Group14Sha256),
            "diffie-hellman-group-exchange-sha1" => Some(Self::GexSha1),
            "diffie-hellman-group-exchange-sha256" => Some(Self::GexSha256),
            _ => None,
        }
    }

    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Group1Sha1 => "diffie-hellman-group1-sha1",
            Self::Group14Sha1 => "diffie-hellman-group14-sha1",
            Self::Group14Sha256 => "diffie-hellman-group14-sha256",
            Self::GexSha1 => "diffie-hellman-group-exchange-sha1",
            Self::GexSha256 => "diffie-hellman-group-exchange-sha256",
        }
    }

    /// Hash used for H and key derivation.
    pub fn digest(&self) -> DigestAlgorithm {
        match self {
            Self::Group1Sha1 | Self::Group14Sha1 | Self::GexSha1 => DigestAlgorithm::Sha1,
            Self::Group14Sha256 | Self::GexSha256 => DigestAlgorithm::Sha256,
        }
    }

    /// Whether the group is negotiated with the server.
    pub fn is_group_exchange(&self) -> bool {
        matches!(self, Self::GexSha1 | Self::GexSha256)
    }

    fn fixed_group(&self) -> Option<DhGroup> {
        match self {
            Self::Group1Sha1 => Some(DhGroup::group1()),
            Self::Group14Sha1 | Self::Group14Sha256 => Some(DhGroup::group14()),
            Self::GexSha1 | Self::GexSha256 => None,
        }
    }
}

/// A Diffie-Hellman group: safe prime `p` and generator `g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    /// Prime modulus
    pub p: BigUint,
    /// Generator
    pub g: BigUint,
}

impl DhGroup {
    /// Creates a group from its parameters.
    pub fn new(p: BigUint, g: BigUint) -> Self {
        Self { p, g }
    }

    /// The 1024-bit Oakley Group 2 (`diffie-hellman-group1-sha1`).
    pub fn group1() -> Self {
        Self::new(BigUint::from_bytes_be(&GROUP1_PRIME), BigUint::from(2u32))
    }

    /// The 2048-bit MODP Group 14 (RFC 3526).
    pub fn group14() -> Self {
        Self::new(BigUint::from_bytes_be(&GROUP14_PRIME), BigUint::from(2u32))
    }

    /// Size of `p` in bits.
    pub fn bits(&self) -> u64 {
        self.p.bits()
    }

    fn check_peer_value(&self, value: &BigUint) -> ConchResult<()> {
        let one = BigUint::from(1u32);
        if *value <= one || *value >= &self.p - &one {
            return Err(ConchError::Protocol(
                "Diffie-Hellman public value out of range".to_string(),
            ));
        }
        Ok(())
    }
}

/// Groups a server offers for group exchange.
#[derive(Debug, Clone, Default)]
pub struct ModulusPool {
    groups: Vec<DhGroup>,
}

impl ModulusPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool holding the well-known groups 1 and 14.
    pub fn with_defaults() -> Self {
        Self {
            groups: vec![DhGroup::group1(), DhGroup::group14()],
        }
    }

    /// Adds a group.
    pub fn add(&mut self, group: DhGroup) {
        self.groups.push(group);
    }

    /// Whether the pool holds no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Picks the group whose size lies in `[min, max]` and is closest to `preferred`.
    pub fn select(&self, min: u32, preferred: u32, max: u32) -> Option<&DhGroup> {
        self.groups
            .iter()
            .filter(|g| g.bits() >= u64::from(min) && g.bits() <= u64::from(max))
            .min_by_key(|g| g.bits().abs_diff(u64::from(preferred)))
    }
}

/// Group size request a client sends for group exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GexRequest {
    /// SSH_MSG_KEX_DH_GEX_REQUEST (min, preferred, max)
    Range {
        /// Minimal acceptable size
        min: u32,
        /// Preferred size
        preferred: u32,
        /// Maximal acceptable size
        max: u32,
    },
    /// SSH_MSG_KEX_DH_GEX_REQUEST_OLD (preferred only)
    Legacy {
        /// Preferred size
        preferred: u32,
    },
}

impl Default for GexRequest {
    fn default() -> Self {
        Self::Range {
            min: 1024,
            preferred: 2048,
            max: 8192,
        }
    }
}

impl GexRequest {
    /// Bounds used when selecting a group.
    pub fn bounds(&self) -> (u32, u32, u32) {
        match *self {
            Self::Range { min, preferred, max } => (min, preferred, max),
            Self::Legacy { preferred } => (preferred.min(1024), preferred, preferred.max(8192)),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13);
        match *self {
            Self::Range { min, preferred, max } => {
                buf.put_u8(kex_codes::KEX_DH_GEX_REQUEST);
                buf.put_u32(min);
                buf.put_u32(preferred);
                buf.put_u32(max);
            }
            Self::Legacy { preferred } => {
                buf.put_u8(kex_codes::KEX_DH_GEX_REQUEST_OLD);
                buf.put_u32(preferred);
            }
        }
        buf.to_vec()
    }

    fn hash_into(&self, buf: &mut BytesMut) {
        match *self {
            Self::Range { min, preferred, max } => {
                buf.put_u32(min);
                buf.put_u32(preferred);
                buf.put_u32(max);
            }
            Self::Legacy { preferred } => buf.put_u32(preferred),
        }
    }
}

/// Which end of the exchange this strategy plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator
    Client,
    /// Responder
    Server,
}

/// Outcome of one completed exchange.
pub struct KexResult {
    /// Shared secret K
    pub k: BigUint,
    /// Exchange hash H
    pub h: Vec<u8>,
    /// Server host key blob
    pub host_key: Vec<u8>,
    /// Server signature over H
    pub signature: Vec<u8>,
    /// Hash algorithm of the method
    pub digest: DigestAlgorithm,
}

impl std::fmt::Debug for KexResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexResult")
            .field("h", &hex::encode(&self.h))
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// Result of feeding one message to a strategy.
#[derive(Debug)]
pub enum KexProgress {
    /// More messages are expected; send the payload if one is given.
    NeedMore(Option<Vec<u8>>),
    /// Exchange finished; send `reply` if given, then NEWKEYS.
    Done {
        /// Final message to send (server role)
        reply: Option<Vec<u8>>,
        /// Shared secret and exchange hash
        result: KexResult,
    },
}

/// Shared Diffie-Hellman machinery of both variants.
struct DhCore {
    role: Role,
    method: KexMethod,
    backend: Arc<dyn CryptoBackend>,
    identity: ConnectionIdentity,
    host_key: Option<Arc<dyn HostKey>>,
    secret: Option<Zeroizing<Vec<u8>>>,
    public: Option<BigUint>,
}

impl DhCore {
    /// Draws `x` with `1 < x < (p-1)/2` and returns `g^x mod p`.
    fn generate(&mut self, group: &DhGroup) -> BigUint {
        let q: BigUint = (&group.p - 1u32) >> 1;
        let q_bytes = q.to_bytes_be();
        let top_bits = 8 - q_bytes[0].leading_zeros();
        let mask = ((1u16 << top_bits) - 1) as u8;
        let one = BigUint::from(1u32);

        let mut buf = Zeroizing::new(vec![0u8; q_bytes.len()]);
        let x = loop {
            self.backend.fill_random(&mut buf);
            buf[0] &= mask;
            let candidate = BigUint::from_bytes_be(&buf);
            if candidate > one && candidate < q {
                break candidate;
            }
        };
        let public = self.backend.modpow(&group.g, &x, &group.p);
        self.secret = Some(Zeroizing::new(x.to_bytes_be()));
        self.public = Some(public.clone());
        public
    }

    fn shared_secret(&self, group: &DhGroup, peer: &BigUint) -> ConchResult<BigUint> {
        group.check_peer_value(peer)?;
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| ConchError::Protocol("Private exponent not generated".to_string()))?;
        let x = BigUint::from_bytes_be(secret);
        Ok(self.backend.modpow(peer, &x, &group.p))
    }

    /// H over the identity, host key, optional group-exchange fields, e, f and K.
    fn exchange_hash(
        &self,
        host_key: &[u8],
        gex: Option<(&GexRequest, &DhGroup)>,
        e: &BigUint,
        f: &BigUint,
        k: &BigUint,
    ) -> Vec<u8> {
        let id = &self.identity;
        let mut buf = BytesMut::with_capacity(2048);
        buf.put_ssh_string(id.client_version.as_bytes());
        buf.put_ssh_string(id.server_version.as_bytes());
        buf.put_ssh_string(&id.client_kexinit);
        buf.put_ssh_string(&id.server_kexinit);
        buf.put_ssh_string(host_key);
        if let Some((request, group)) = gex {
            request.hash_into(&mut buf);
            buf.put_mpint(&group.p);
            buf.put_mpint(&group.g);
        }
        buf.put_mpint(e);
        buf.put_mpint(f);
        buf.put_mpint(k);
        self.backend.digest(self.method.digest(), &[&buf[..]])
    }

    /// Client leg: parse the reply, compute K and H.
    fn finish_client(
        &mut self,
        group: &DhGroup,
        gex: Option<&GexRequest>,
        body: &[u8],
    ) -> ConchResult<KexProgress> {
        let mut r = WireReader::new(body);
        let host_key = r.read_string()?.to_vec();
        let f = r.read_mpint()?;
        let signature = r.read_string()?.to_vec();

        let k = self.shared_secret(group, &f)?;
        let e = self
            .public
            .clone()
            .ok_or_else(|| ConchError::Protocol("Public value not generated".to_string()))?;
        let h = self.exchange_hash(&host_key, gex.map(|req| (req, group)), &e, &f, &k);

        Ok(KexProgress::Done {
            reply: None,
            result: KexResult {
                k,
                h,
                host_key,
                signature,
                digest: self.method.digest(),
            },
        })
    }

    /// Server leg: answer e with f and a signature over H.
    fn finish_server(
        &mut self,
        group: &DhGroup,
        gex: Option<&GexRequest>,
        reply_type: u8,
        body: &[u8],
    ) -> ConchResult<KexProgress> {
        let e = WireReader::new(body).read_mpint()?;
        group.check_peer_value(&e)?;
        let f = self.generate(group);
        let k = self.shared_secret(group, &e)?;

        let host_key = self
            .host_key
            .clone()
            .ok_or_else(|| ConchError::Config("No host key for the server role".to_string()))?;
        let blob = host_key.public_key_blob();
        let h = self.exchange_hash(&blob, gex.map(|req| (req, group)), &e, &f, &k);
        let signature = host_key.sign(&h)?;

        let mut reply = BytesMut::with_capacity(blob.len() + signature.len() + 600);
        reply.put_u8(reply_type);
        reply.put_ssh_string(&blob);
        reply.put_mpint(&f);
        reply.put_ssh_string(&signature);

        Ok(KexProgress::Done {
            reply: Some(reply.to_vec()),
            result: KexResult {
                k,
                h,
                host_key: blob,
                signature,
                digest: self.method.digest(),
            },
        })
    }
}

fn unexpected(msg_type: u8, expected: &[u8]) -> ConchError {
    ConchError::Protocol(format!(
        "Unexpected key exchange message {} (expected {:?})",
        msg_type, expected
    ))
}

/// Fixed-group exchange (group1, group14).
pub struct FixedGroupExchange {
    core: DhCore,
    group: DhGroup,
    done: bool,
}

impl FixedGroupExchange {
    fn start(&mut self) -> Option<Vec<u8>> {
        match self.core.role {
            Role::Client => {
                let e = self.core.generate(&self.group);
                let mut msg = BytesMut::with_capacity(self.group.p.bits() as usize / 8 + 10);
                msg.put_u8(kex_codes::KEXDH_INIT);
                msg.put_mpint(&e);
                Some(msg.to_vec())
            }
            Role::Server => None,
        }
    }

    fn expected(&self) -> &'static [u8] {
        match (self.done, self.core.role) {
            (true, _) => &[],
            (false, Role::Client) => &[kex_codes::KEXDH_REPLY],
            (false, Role::Server) => &[kex_codes::KEXDH_INIT],
        }
    }

    fn deliver(&mut self, msg_type: u8, body: &[u8]) -> ConchResult<KexProgress> {
        if !self.expected().contains(&msg_type) {
            return Err(unexpected(msg_type, self.expected()));
        }
        self.done = true;
        match self.core.role {
            Role::Client => self.core.finish_client(&self.group, None, body),
            Role::Server => {
                self.core
                    .finish_server(&self.group, None, kex_codes::KEXDH_REPLY, body)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GexStep {
    AwaitRequest,
    AwaitGroup,
    AwaitInit,
    AwaitReply,
    Done,
}

/// Negotiated-group exchange (RFC 4419).
pub struct GroupExchange {
    core: DhCore,
    step: GexStep,
    request: GexRequest,
    group: Option<DhGroup>,
    pool: Arc<ModulusPool>,
}

impl GroupExchange {
    fn start(&mut self) -> Option<Vec<u8>> {
        match self.core.role {
            Role::Client => {
                self.step = GexStep::AwaitGroup;
                Some(self.request.encode())
            }
            Role::Server => None,
        }
    }

    fn expected(&self) -> &'static [u8] {
        match self.step {
            GexStep::AwaitRequest => &[
                kex_codes::KEX_DH_GEX_REQUEST,
                kex_codes::KEX_DH_GEX_REQUEST_OLD,
            ],
            GexStep::AwaitGroup => &[kex_codes::KEX_DH_GEX_GROUP],
            GexStep::AwaitInit => &[kex_codes::KEX_DH_GEX_INIT],
            GexStep::AwaitReply => &[kex_codes::KEX_DH_GEX_REPLY],
            GexStep::Done => &[],
        }
    }

    fn deliver(&mut self, msg_type: u8, body: &[u8]) -> ConchResult<KexProgress> {
        if !self.expected().contains(&msg_type) {
            return Err(unexpected(msg_type, self.expected()));
        }
        match self.step {
            GexStep::AwaitRequest => self.on_request(msg_type, body),
            GexStep::AwaitGroup => self.on_group(body),
            GexStep::AwaitInit | GexStep::AwaitReply => {
                self.step = GexStep::Done;
                let group = self
                    .group
                    .clone()
                    .ok_or_else(|| ConchError::Protocol("No group negotiated".to_string()))?;
                match self.core.role {
                    Role::Client => self.core.finish_client(&group, Some(&self.request), body),
                    Role::Server => self.core.finish_server(
                        &group,
                        Some(&self.request),
                        kex_codes::KEX_DH_GEX_REPLY,
                        body,
                    ),
                }
            }
            GexStep::Done => Err(unexpected(msg_type, &[])),
        }
    }

    fn on_request(&mut self, msg_type: u8, body: &[u8]) -> ConchResult<KexProgress> {
        let mut r = WireReader::new(body);
        self.request = if msg_type == kex_codes::KEX_DH_GEX_REQUEST_OLD {
            GexRequest::Legacy {
                preferred: r.read_u32()?,
            }
        } else {
            GexRequest::Range {
                min: r.read_u32()?,
                preferred: r.read_u32()?,
                max: r.read_u32()?,
            }
        };

        let (min, preferred, max) = self.request.bounds();
        if min > preferred || preferred > max {
            return Err(ConchError::Protocol(format!(
                "Invalid group exchange range: {}/{}/{}",
                min, preferred, max
            )));
        }
        let group = self.pool.select(min, preferred, max).cloned().ok_or_else(|| {
            ConchError::Protocol(format!(
                "No group in range {}..{} bits for group exchange",
                min, max
            ))
        })?;
        debug!("Group exchange: selected {}-bit group", group.bits());

        let mut msg = BytesMut::with_capacity(group.p.bits() as usize / 8 + 16);
        msg.put_u8(kex_codes::KEX_DH_GEX_GROUP);
        msg.put_mpint(&group.p);
        msg.put_mpint(&group.g);

        self.group = Some(group);
        self.step = GexStep::AwaitInit;
        Ok(KexProgress::NeedMore(Some(msg.to_vec())))
    }

    fn on_group(&mut self, body: &[u8]) -> ConchResult<KexProgress> {
        let mut r = WireReader::new(body);
        let group = DhGroup::new(r.read_mpint()?, r.read_mpint()?);

        let (min, _, max) = match self.request {
            GexRequest::Range { min, preferred, max } => (min, preferred, max),
            GexRequest::Legacy { preferred } => (1024, preferred, u32::MAX),
        };
        let bits = group.bits();
        if bits < u64::from(min) || bits > u64::from(max) {
            return Err(ConchError::Protocol(format!(
                "Server sent a {}-bit group outside {}..{}",
                bits, min, max
            )));
        }
        group.check_peer_value(&group.g)?;

        let e = self.core.generate(&group);
        let mut msg = BytesMut::with_capacity(group.p.bits() as usize / 8 + 10);
        msg.put_u8(kex_codes::KEX_DH_GEX_INIT);
        msg.put_mpint(&e);

        self.group = Some(group);
        self.step = GexStep::AwaitReply;
        Ok(KexProgress::NeedMore(Some(msg.to_vec())))
    }
}

/// One key exchange round in progress.
pub enum KexStrategy {
    /// group1 / group14
    FixedGroup(FixedGroupExchange),
    /// group exchange
    GroupExchange(GroupExchange),
}

impl KexStrategy {
    /// Initiator side.
    pub fn client(
        method: KexMethod,
        backend: Arc<dyn CryptoBackend>,
        identity: ConnectionIdentity,
        gex_request: GexRequest,
    ) -> Self {
        Self::build(
            method,
            Role::Client,
            backend,
            identity,
            None,
            gex_request,
            Arc::new(ModulusPool::new()),
        )
    }

    /// Responder side, signing with `host_key`.
    pub fn server(
        method: KexMethod,
        backend: Arc<dyn CryptoBackend>,
        identity: ConnectionIdentity,
        host_key: Arc<dyn HostKey>,
        pool: Arc<ModulusPool>,
    ) -> Self {
        Self::build(
            method,
            Role::Server,
            backend,
            identity,
            Some(host_key),
            GexRequest::default(),
            pool,
        )
    }

    fn build(
        method: KexMethod,
        role: Role,
        backend: Arc<dyn CryptoBackend>,
        identity: ConnectionIdentity,
        host_key: Option<Arc<dyn HostKey>>,
        request: GexRequest,
        pool: Arc<ModulusPool>,
    ) -> Self {
        let core = DhCore {
            role,
            method,
            backend,
            identity,
            host_key,
            secret: None,
            public: None,
        };
        match method.fixed_group() {
            Some(group) => Self::FixedGroup(FixedGroupExchange {
                core,
                group,
                done: false,
            }),
            None => Self::GroupExchange(GroupExchange {
                core,
                step: match role {
                    Role::Client => GexStep::AwaitGroup,
                    Role::Server => GexStep::AwaitRequest,
                },
                request,
                group: None,
                pool,
            }),
        }
    }

    /// Method this round runs.
    pub fn method(&self) -> KexMethod {
        self.core().method
    }

    /// Role this strategy plays.
    pub fn role(&self) -> Role {
        self.core().role
    }

    fn core(&self) -> &DhCore {
        match self {
            Self::FixedGroup(x) => &x.core,
            Self::GroupExchange(x) => &x.core,
        }
    }

    /// Message the initiator sends first; the responder sends nothing until it hears from the peer.
    pub fn start(&mut self) -> ConchResult<Option<Vec<u8>>> {
        Ok(match self {
            Self::FixedGroup(x) => x.start(),
            Self::GroupExchange(x) => x.start(),
        })
    }

    /// Message types acceptable at the current step.
    pub fn expected(&self) -> &'static [u8] {
        match self {
            Self::FixedGroup(x) => x.expected(),
            Self::GroupExchange(x) => x.expected(),
        }
    }

    /// Feeds one message (type byte stripped from `body`).
    pub fn deliver(&mut self, msg_type: u8, body: &[u8]) -> ConchResult<KexProgress> {
        match self {
            Self::FixedGroup(x) => x.deliver(msg_type, body),
            Self::GroupExchange(x) => x.deliver(msg_type, body),
        }
    }
}

/// Derives one secret: `HASH(K || H || letter || session_id)`, extended with
/// `HASH(K || H || output so far)` until `len` bytes are available.
///
/// # Example
///
/// ```rust
/// use conch_platform::DigestAlgorithm;
/// use conch_proto::ssh::crypto::SoftwareBackend;
/// use conch_proto::ssh::kex_dh::derive_key;
/// use num_bigint::BigUint;
///
/// let backend = SoftwareBackend::new();
/// let k = BigUint::from(42u32);
/// let key = derive_key(&backend, DigestAlgorithm::Sha1, &k, &[1; 20], b'C', &[2; 20], 32);
/// assert_eq!(key.len(), 32);
/// ```
pub fn derive_key(
    backend: &dyn CryptoBackend,
    digest: DigestAlgorithm,
    k: &BigUint,
    h: &[u8],
    letter: u8,
    session_id: &[u8],
    len: usize,
) -> Vec<u8> {
    let k_mpint = Zeroizing::new(mpint_bytes(k));
    let mut out = backend.digest(digest, &[k_mpint.as_slice(), h, &[letter][..], session_id]);
    while out.len() < len {
        let more = backend.digest(digest, &[k_mpint.as_slice(), h, out.as_slice()]);
        out.extend_from_slice(&more);
    }
    out.truncate(len);
    out
}

/// Keys for both directions after one exchange.
#[derive(Debug)]
pub struct SessionKeys {
    /// Client to server
    pub client_to_server: DirectionKeys,
    /// Server to client
    pub server_to_client: DirectionKeys,
}

impl SessionKeys {
    /// Derives the six secrets (letters A-F) for the negotiated algorithms.
    pub fn derive(
        backend: &dyn CryptoBackend,
        algorithms: &NegotiatedAlgorithms,
        result: &KexResult,
        session_id: &[u8],
    ) -> Self {
        let derive = |letter: u8, len: usize| {
            derive_key(backend, result.digest, &result.k, &result.h, letter, session_id, len)
        };
        let direction = |cipher: CipherAlgorithm, mac: MacAlgorithm, letters: [u8; 3], compression| {
            DirectionKeys {
                cipher,
                mac,
                compression,
                iv: derive(letters[0], cipher.iv_size()),
                key: derive(letters[1], cipher.key_size()),
                mac_key: derive(letters[2], mac.key_size()),
            }
        };

        Self {
            client_to_server: direction(
                algorithms.cipher_client_to_server,
                algorithms.mac_client_to_server,
                [b'A', b'C', b'E'],
                algorithms.compression_client_to_server,
            ),
            server_to_client: direction(
                algorithms.cipher_server_to_client,
                algorithms.mac_server_to_client,
                [b'B', b'D', b'F'],
                algorithms.compression_server_to_client,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::SoftwareBackend;
    use conch_platform::{BlockTransform, CipherDirection, CipherMode};

    /// Software backend whose random source always yields 0xCC.
    struct FixedRandom(SoftwareBackend);

    impl CryptoBackend for FixedRandom {
        fn fill_random(&self, buf: &mut [u8]) {
            buf.fill(0xCC);
        }
        fn digest(&self, alg: DigestAlgorithm, parts: &[&[u8]]) -> Vec<u8> {
            self.0.digest(alg, parts)
        }
        fn hmac(&self, alg: DigestAlgorithm, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
            self.0.hmac(alg, key, parts)
        }
        fn block_cipher(
            &self,
            mode: CipherMode,
            key: &[u8],
            iv: &[u8],
            direction: CipherDirection,
        ) -> ConchResult<Box<dyn BlockTransform>> {
            self.0.block_cipher(mode, key, iv, direction)
        }
        fn modpow(&self, base: &BigUint, exp: &BigUint, modulus: &BigUint) -> BigUint {
            self.0.modpow(base, exp, modulus)
        }
    }

    struct FakeHostKey;

    impl HostKey for FakeHostKey {
        fn algorithm(&self) -> &str {
            "ssh-fake"
        }
        fn public_key_blob(&self) -> Vec<u8> {
            b"fake-host-key".to_vec()
        }
        fn sign(&self, _data: &[u8]) -> ConchResult<Vec<u8>> {
            Ok(b"fake-sig".to_vec())
        }
    }

    const E_HEX: &str = "000000807E2DDB1743F3487D6545F04F1C8476092FB912B013626AB5BCEB764257D88BBA64243B9F348DF7B41B8C814A995E00299913503456983FFB9178D3CD79EB6D55522418A8ABF65375872E55938AB99A84A0B5FC8A1ECC66A7C3766E7E0F80B7CE2C9225FC2DD683F4764244B72963BBB383F529DCF0C5D17740B8A2ADBE9208D4";
    const K_DEC: &str = "14730343317708716439807310032871972459448364195094179797249681733965528989482751523943515690110179031004049109375612685505881911274101441415545039654102474376472240501616988799699744135291070488314748284283496055223852115360852283821334858541043710301057312858051901453919067023103730011648890038847384890504";

    fn backend() -> Arc<dyn CryptoBackend> {
        Arc::new(FixedRandom(SoftwareBackend::new()))
    }

    /// Client view: local init is the client's.
    fn client_identity() -> ConnectionIdentity {
        ConnectionIdentity {
            client_version: "SSH-2.0-conch_0.1".into(),
            server_version: "SSH-2.0-lame".into(),
            client_kexinit: b"local-kex-init".to_vec(),
            server_kexinit: b"remote-kex-init".to_vec(),
        }
    }

    /// Server view: local init is the server's.
    fn server_identity() -> ConnectionIdentity {
        ConnectionIdentity {
            client_kexinit: b"remote-kex-init".to_vec(),
            server_kexinit: b"local-kex-init".to_vec(),
            ..client_identity()
        }
    }

    /// KEXDH_REPLY / GEX_REPLY body carrying f = 69.
    fn reply_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.put_ssh_string(b"fake-host-key");
        body.put_mpint(&BigUint::from(69u32));
        body.put_ssh_string(b"fake-sig");
        body
    }

    fn peer_e_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.put_mpint(&BigUint::from(69u32));
        body
    }

    fn group1_pool() -> Arc<ModulusPool> {
        let mut pool = ModulusPool::new();
        pool.add(DhGroup::group1());
        Arc::new(pool)
    }

    fn expect_done(progress: KexProgress) -> (Option<Vec<u8>>, KexResult) {
        match progress {
            KexProgress::Done { reply, result } => (reply, result),
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    fn expect_more(progress: KexProgress) -> Vec<u8> {
        match progress {
            KexProgress::NeedMore(Some(msg)) => msg,
            other => panic!("Expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_group_sizes() {
        assert_eq!(DhGroup::group1().bits(), 1024);
        assert_eq!(DhGroup::group14().bits(), 2048);
    }

    #[test]
    fn test_group1_client_vectors() {
        let mut kex =
            KexStrategy::client(KexMethod::Group1Sha1, backend(), client_identity(), GexRequest::default());
        let init = kex.start().unwrap().unwrap();
        assert_eq!(hex::encode_upper(&init), format!("1E{}", E_HEX));
        assert_eq!(kex.expected(), &[31]);

        let (reply, result) = expect_done(kex.deliver(31, &reply_body()).unwrap());
        assert!(reply.is_none());
        assert_eq!(result.k.to_string(), K_DEC);
        assert_eq!(
            hex::encode_upper(&result.h),
            "E8D305637431DF7175F0BEF0CF333A1D90A4C9F8"
        );
        assert_eq!(result.host_key, b"fake-host-key");
        assert_eq!(result.signature, b"fake-sig");
        assert!(kex.expected().is_empty());
    }

    #[test]
    fn test_group1_client_hash_covers_client_version() {
        let identity = ConnectionIdentity {
            client_version: "SSH-2.0-paramiko_1.0".into(),
            ..client_identity()
        };
        let mut kex =
            KexStrategy::client(KexMethod::Group1Sha1, backend(), identity, GexRequest::default());
        kex.start().unwrap().unwrap();

        let (_, result) = expect_done(kex.deliver(31, &reply_body()).unwrap());
        assert_eq!(result.k.to_string(), K_DEC);
        assert_eq!(
            hex::encode_upper(&result.h),
            "03079780F3D3AD0B3C6DB30C8D21685F367A86D2"
        );
    }

    #[test]
    fn test_group1_server_vectors() {
        let mut kex = KexStrategy::server(
            KexMethod::Group1Sha1,
            backend(),
            server_identity(),
            Arc::new(FakeHostKey),
            Arc::new(ModulusPool::new()),
        );
        assert!(kex.start().unwrap().is_none());
        assert_eq!(kex.expected(), &[30]);

        let (reply, result) = expect_done(kex.deliver(30, &peer_e_body()).unwrap());
        let reply = reply.unwrap();
        assert_eq!(
            hex::encode_upper(&reply),
            format!(
                "1F0000000D66616B652D686F73742D6B6579{}0000000866616B652D736967",
                E_HEX
            )
        );
        assert_eq!(result.k.to_string(), K_DEC);
        assert_eq!(
            hex::encode_upper(&result.h),
            "736B559B617C40D084954B57D90BEBD0E7A592D8"
        );
    }

    #[test]
    fn test_gex_client_vectors() {
        let mut kex =
            KexStrategy::client(KexMethod::GexSha1, backend(), client_identity(), GexRequest::default());
        let request = kex.start().unwrap().unwrap();
        assert_eq!(hex::encode_upper(&request), "22000004000000080000002000");
        assert_eq!(kex.expected(), &[31]);

        let mut group = Vec::new();
        group.put_mpint(&DhGroup::group1().p);
        group.put_mpint(&BigUint::from(2u32));
        let init = expect_more(kex.deliver(31, &group).unwrap());
        assert_eq!(hex::encode_upper(&init), format!("20{}", E_HEX));
        assert_eq!(kex.expected(), &[33]);

        let (_, result) = expect_done(kex.deliver(33, &reply_body()).unwrap());
        assert_eq!(result.k.to_string(), K_DEC);
        assert_eq!(
            hex::encode_upper(&result.h),
            "B56A0C5ADB5F9CA218C1D8E6A01A29D935763551"
        );
    }

    #[test]
    fn test_gex_client_legacy_vectors() {
        let mut kex = KexStrategy::client(
            KexMethod::GexSha1,
            backend(),
            client_identity(),
            GexRequest::Legacy { preferred: 2048 },
        );
        let request = kex.start().unwrap().unwrap();
        assert_eq!(hex::encode_upper(&request), "1E00000800");

        let mut group = Vec::new();
        group.put_mpint(&DhGroup::group1().p);
        group.put_mpint(&BigUint::from(2u32));
        expect_more(kex.deliver(31, &group).unwrap());

        let (_, result) = expect_done(kex.deliver(33, &reply_body()).unwrap());
        assert_eq!(
            hex::encode_upper(&result.h),
            "0B46062D602710165710DA82DB2C97D13255F245"
        );
    }

    #[test]
    fn test_gex_server_vectors() {
        let mut kex = KexStrategy::server(
            KexMethod::GexSha1,
            backend(),
            server_identity(),
            Arc::new(FakeHostKey),
            group1_pool(),
        );
        assert!(kex.start().unwrap().is_none());
        assert_eq!(kex.expected(), &[34, 30]);

        let mut request = Vec::new();
        request.put_u32(1024);
        request.put_u32(2048);
        request.put_u32(4096);
        let group = expect_more(kex.deliver(34, &request).unwrap());
        assert!(hex::encode_upper(&group).starts_with("1F0000008100FFFFFFFFFFFFFFFFC90F"));
        assert!(hex::encode_upper(&group).ends_with("FFFFFFFFFFFFFFFF0000000102"));
        assert_eq!(kex.expected(), &[32]);

        let (reply, result) = expect_done(kex.deliver(32, &peer_e_body()).unwrap());
        assert_eq!(reply.unwrap()[0], 33);
        assert_eq!(
            hex::encode_upper(&result.h),
            "C6F7821FA8E44A37838C3764B3F72A75E5A79210"
        );
    }

    #[test]
    fn test_gex_server_legacy_vectors() {
        let mut kex = KexStrategy::server(
            KexMethod::GexSha1,
            backend(),
            server_identity(),
            Arc::new(FakeHostKey),
            group1_pool(),
        );
        let mut request = Vec::new();
        request.put_u32(1234);
        expect_more(kex.deliver(30, &request).unwrap());

        let (_, result) = expect_done(kex.deliver(32, &peer_e_body()).unwrap());
        assert_eq!(
            hex::encode_upper(&result.h),
            "F7E6495E0C6AB7A9A03344DA47F45B71D7AE855D"
        );
    }

    #[test]
    fn test_unexpected_message_is_protocol_error() {
        let mut kex =
            KexStrategy::client(KexMethod::Group1Sha1, backend(), client_identity(), GexRequest::default());
        kex.start().unwrap();
        assert!(matches!(
            kex.deliver(33, &reply_body()),
            Err(ConchError::Protocol(_))
        ));
    }

    #[test]
    fn test_peer_value_range() {
        let mut kex = KexStrategy::server(
            KexMethod::Group1Sha1,
            backend(),
            server_identity(),
            Arc::new(FakeHostKey),
            Arc::new(ModulusPool::new()),
        );
        let mut body = Vec::new();
        body.put_mpint(&BigUint::from(1u32));
        assert!(matches!(kex.deliver(30, &body), Err(ConchError::Protocol(_))));
    }

    #[test]
    fn test_gex_server_rejects_unsatisfiable_range() {
        let mut kex = KexStrategy::server(
            KexMethod::GexSha256,
            backend(),
            server_identity(),
            Arc::new(FakeHostKey),
            group1_pool(),
        );
        let mut request = Vec::new();
        request.put_u32(4096);
        request.put_u32(4096);
        request.put_u32(8192);
        assert!(kex.deliver(34, &request).is_err());
    }

    #[test]
    fn test_modulus_pool_select() {
        let pool = ModulusPool::with_defaults();
        assert_eq!(pool.select(1024, 2048, 8192).unwrap().bits(), 2048);
        assert_eq!(pool.select(1024, 1024, 8192).unwrap().bits(), 1024);
        assert_eq!(pool.select(1024, 1500, 1800).unwrap().bits(), 1024);
        assert!(pool.select(3000, 4096, 8192).is_none());
        assert_eq!(GexRequest::Legacy { preferred: 1234 }.bounds(), (1024, 1234, 8192));
    }

    #[test]
    fn test_derive_key_vector() {
        let b = SoftwareBackend::new();
        let k: BigUint = K_DEC.parse().unwrap();
        let h = hex::decode("E8D305637431DF7175F0BEF0CF333A1D90A4C9F8").unwrap();
        let key = derive_key(&b, DigestAlgorithm::Sha1, &k, &h, b'A', &h, 40);
        assert_eq!(
            hex::encode(&key),
            "ce10ad326333c3c5049b5d5dd379395f1590337e9523cfd5bacfb1ab6dbcc666bd9ff81da1aee5f0"
        );
    }

    #[test]
    fn test_real_exchange_agrees() {
        let b: Arc<dyn CryptoBackend> = Arc::new(SoftwareBackend::new());
        let host = Arc::new(crate::ssh::hostkey::Ed25519HostKey::generate());
        let mut client =
            KexStrategy::client(KexMethod::Group14Sha256, b.clone(), client_identity(), GexRequest::default());
        let mut server = KexStrategy::server(
            KexMethod::Group14Sha256,
            b,
            client_identity(),
            host,
            Arc::new(ModulusPool::new()),
        );

        let init = client.start().unwrap().unwrap();
        let (reply, server_result) = expect_done(server.deliver(init[0], &init[1..]).unwrap());
        let reply = reply.unwrap();
        let (_, client_result) = expect_done(client.deliver(reply[0], &reply[1..]).unwrap());

        assert_eq!(client_result.k, server_result.k);
        assert_eq!(client_result.h, server_result.h);
        assert_eq!(client_result.h.len(), 32);
        assert!(crate::ssh::hostkey::verify_host_signature(
            &client_result.host_key,
            &client_result.h,
            &client_result.signature
        )
        .unwrap());
    }
}
