//! SSH-2 protocol engine for the conch remote-shell stack.
//!
//! This crate provides an SSH-2 implementation usable from both ends of a connection:
//!
//! - **Packetizer** - binary packet framing, encryption and MAC per direction
//! - **Key exchange** - fixed-group and group-exchange Diffie-Hellman, rekeying
//! - **Authentication** - none, password, public key and keyboard-interactive
//! - **Channels** - flow-controlled session channels multiplexed over one transport
//!
//! # Features
//!
//! - `ssh` (default) - SSH protocol support (client + server)
//!
//! # Example
//!
//! ```rust,no_run
//! use conch_proto::ssh::{ClientConfig, SshClient};
//!
//! # #[tokio::main]
//! # async fn main() -> conch_platform::ConchResult<()> {
//! let client = SshClient::connect("127.0.0.1:22", ClientConfig::new("alice")).await?;
//! client.auth_password("secret").await?;
//! let (stdout, _stderr, status) = client.execute("uptime").await?;
//! println!("{} (exit {})", String::from_utf8_lossy(&stdout), status);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted libraries (`ring`, RustCrypto, `dalek`)
//!   behind a [`CryptoBackend`](conch_platform::CryptoBackend) handle
//! - Constant-time MAC and password comparison
//! - Secure memory handling with `zeroize`
//! - Frame decoding is fuzzed
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
