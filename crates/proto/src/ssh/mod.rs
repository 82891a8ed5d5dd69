//! SSH (Secure Shell) protocol implementation.
//!
//! This module implements the SSH protocol according to RFC 4251-4254.
//!
//! # Architecture
//!
//! The SSH implementation is layered:
//!
//! 1. **Packet Layer** ([`packet`]) - Binary packet protocol, per-direction cipher state (RFC 4253 Section 6)
//! 2. **Key Exchange** ([`kex`], [`kex_dh`]) - Negotiation, Diffie-Hellman, key derivation (RFC 4253, RFC 4419)
//! 3. **Transport Layer** ([`transport`]) - Session, rekeying, message dispatch (RFC 4253)
//! 4. **Authentication Layer** ([`auth`]) - User authentication (RFC 4252, RFC 4256)
//! 5. **Connection Layer** ([`connection`], [`channel`]) - Channels and requests (RFC 4254)
//! 6. **Client/Server APIs** ([`client`], [`server`])
//!
//! # Security Considerations
//!
//! - **Input Validation**: Packet lengths, padding and name-lists are checked before use
//! - **Constant-Time Operations**: MAC checks and password comparisons use `subtle`
//! - **Memory Safety**: Secrets are zeroized on drop using [`zeroize`]
//! - **Pluggable Crypto**: Primitives come from a [`CryptoBackend`](conch_platform::CryptoBackend) handle
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust
//! use conch_proto::ssh::{CipherState, SoftwareBackend, DEFAULT_MAX_PACKET_LEN};
//!
//! let backend = SoftwareBackend::new();
//! let mut sender = CipherState::plaintext();
//! let mut receiver = CipherState::plaintext();
//!
//! let frame = sender.seal(&backend, b"payload", DEFAULT_MAX_PACKET_LEN).unwrap();
//! let payload = receiver.open(&backend, &frame, DEFAULT_MAX_PACKET_LEN).unwrap();
//! assert_eq!(payload, b"payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 4256](https://datatracker.ietf.org/doc/html/rfc4256) - Keyboard-Interactive Authentication
//! - [RFC 4419](https://datatracker.ietf.org/doc/html/rfc4419) - Diffie-Hellman Group Exchange

pub mod auth;
pub mod channel;
pub mod client;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod known_hosts;
pub mod message;
pub mod packet;
pub mod server;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{
    constant_time_eq, AuthFailure, AuthMethod, AuthRequest, AuthResult, AuthSession,
    InteractiveQuery, InteractiveReply, Prompt, PromptHandler, ServerAuth,
};
pub use channel::{Channel, ChannelConfig, ChannelManager, ExitSignal};
pub use client::{ClientConfig, SshClient};
pub use connection::{
    ChannelMessage, ChannelOpenFailureReason, ChannelRequestType, ChannelType, GlobalMessage,
};
pub use crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm, SoftwareBackend};
pub use hostkey::{
    fingerprint, verify_host_signature, AcceptAnyHostKey, Ed25519HostKey, HostKey,
    HostKeyVerifier, PinnedHostKeys,
};
pub use kex::{negotiate, AlgorithmPreferences, KexInit, NegotiatedAlgorithms};
pub use kex_dh::{DhGroup, GexRequest, KexMethod, ModulusPool, Role};
pub use known_hosts::{HostKeyStatus, KnownHostVerifier, KnownHosts, StrictHostKeyChecking};
pub use message::MessageType;
pub use packet::{CipherState, PacketReader, PacketWriter, RekeyLimits, DEFAULT_MAX_PACKET_LEN};
pub use server::{ServerConfig, ServerHandler, ServerSession, SshServer};
pub use transport::{Transport, TransportConfig};
pub use version::Version;
