//! Algorithm negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT encoding and parsing
//! - SSH_MSG_NEWKEYS
//! - Algorithm negotiation (first client entry the server also supports)
//! - The per-round connection identity that feeds the exchange hash
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first match wins)
//! 3. Diffie-Hellman exchange (see [`kex_dh`](super::kex_dh))
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Each direction switches to the new keys on its own NEWKEYS
//!
//! # Example
//!
//! ```rust
//! use conch_proto::ssh::kex::{negotiate, AlgorithmPreferences, KexInit};
//!
//! let prefs = AlgorithmPreferences::default();
//! let client = KexInit::from_preferences(&prefs, [1u8; 16]);
//! let server = KexInit::from_preferences(&prefs, [2u8; 16]);
//! let algorithms = negotiate(&client, &server).unwrap();
//! assert_eq!(algorithms.kex, prefs.kex[0]);
//! ```

use crate::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{SshBufMut, WireReader};
use bytes::{BufMut, BytesMut};
use conch_platform::{ConchError, ConchResult};

/// Key exchange algorithm names this crate implements.
pub const SUPPORTED_KEX: &[&str] = &[
    "diffie-hellman-group-exchange-sha256",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group-exchange-sha1",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group1-sha1",
];

/// Host key algorithm names this crate can verify.
pub const SUPPORTED_HOST_KEYS: &[&str] = &["ssh-ed25519", "rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"];

/// Ordered algorithm preferences (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers (both directions)
    pub ciphers: Vec<String>,
    /// MACs (both directions)
    pub macs: Vec<String>,
    /// Compression (both directions)
    pub compression: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self {
            kex: names(SUPPORTED_KEX),
            host_key: names(SUPPORTED_HOST_KEYS),
            ciphers: names(&["aes256-ctr", "aes192-ctr", "aes128-ctr", "aes256-cbc", "aes128-cbc"]),
            macs: names(&["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1", "hmac-sha1-96"]),
            compression: names(&["none"]),
        }
    }
}

impl AlgorithmPreferences {
    /// Rejects empty lists and names this crate does not implement.
    pub fn validate(&self) -> ConchResult<()> {
        let checks: [(&str, &Vec<String>, fn(&str) -> bool); 5] = [
            ("kex", &self.kex, |n| SUPPORTED_KEX.contains(&n)),
            ("host key", &self.host_key, |n| SUPPORTED_HOST_KEYS.contains(&n)),
            ("cipher", &self.ciphers, |n| CipherAlgorithm::from_name(n).is_some()),
            ("mac", &self.macs, |n| MacAlgorithm::from_name(n).is_some()),
            ("compression", &self.compression, |n| {
                CompressionAlgorithm::from_name(n).is_some()
            }),
        ];
        for (category, list, known) in checks {
            if list.is_empty() {
                return Err(ConchError::Config(format!("Empty {} algorithm list", category)));
            }
            if let Some(unknown) = list.iter().find(|n| !known(n)) {
                return Err(ConchError::Config(format!(
                    "Unsupported {} algorithm: {}",
                    category, unknown
                )));
            }
        }
        Ok(())
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    /// Key exchange algorithms
    kex_algorithms: Vec<String>,
    /// Server host key algorithms
    server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    languages_server_to_client: Vec<String>,
    /// First KEX packet follows
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT from local preferences with the given cookie.
    pub fn from_preferences(prefs: &AlgorithmPreferences, cookie: [u8; 16]) -> Self {
        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_client_to_server: prefs.ciphers.clone(),
            encryption_server_to_client: prefs.ciphers.clone(),
            mac_client_to_server: prefs.macs.clone(),
            mac_server_to_client: prefs.macs.clone(),
            compression_client_to_server: prefs.compression.clone(),
            compression_server_to_client: prefs.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes to a message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(512);

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_client_to_server);
        buf.put_name_list(&self.encryption_server_to_client);
        buf.put_name_list(&self.mac_client_to_server);
        buf.put_name_list(&self.mac_server_to_client);
        buf.put_name_list(&self.compression_client_to_server);
        buf.put_name_list(&self.compression_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);

        buf.put_ssh_bool(self.first_kex_packet_follows);
        // reserved
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT payload (including the message type byte).
    pub fn from_bytes(data: &[u8]) -> ConchResult<Self> {
        let mut r = WireReader::new(data);
        let msg_type = r.read_u8()?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(ConchError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg_type
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kex = Self {
            cookie,
            kex_algorithms: r.read_name_list()?,
            server_host_key_algorithms: r.read_name_list()?,
            encryption_client_to_server: r.read_name_list()?,
            encryption_server_to_client: r.read_name_list()?,
            mac_client_to_server: r.read_name_list()?,
            mac_server_to_client: r.read_name_list()?,
            compression_client_to_server: r.read_name_list()?,
            compression_server_to_client: r.read_name_list()?,
            languages_client_to_server: r.read_name_list()?,
            languages_server_to_client: r.read_name_list()?,
            first_kex_packet_follows: r.read_bool()?,
        };
        // reserved
        r.read_u32()?;

        Ok(kex)
    }
}

/// SSH_MSG_NEWKEYS payload.
pub fn new_keys_message() -> Vec<u8> {
    vec![MessageType::NewKeys as u8]
}

/// Algorithms agreed for one key exchange round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: String,
    /// Host key algorithm
    pub host_key: String,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server
    pub mac_client_to_server: MacAlgorithm,
    /// MAC server to client
    pub mac_server_to_client: MacAlgorithm,
    /// Compression client to server
    pub compression_client_to_server: CompressionAlgorithm,
    /// Compression server to client
    pub compression_server_to_client: CompressionAlgorithm,
}

/// Negotiates one category: the first client algorithm the server also lists.
///
/// # Example
///
/// ```rust
/// use conch_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
/// assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes256-ctr");
/// ```
pub fn negotiate_algorithm(
    category: &str,
    client_algorithms: &[String],
    server_algorithms: &[String],
) -> ConchResult<String> {
    client_algorithms
        .iter()
        .find(|alg| server_algorithms.contains(alg))
        .cloned()
        .ok_or_else(|| {
            ConchError::Protocol(format!(
                "No common {} algorithm: client={:?}, server={:?}",
                category, client_algorithms, server_algorithms
            ))
        })
}

fn parse_named<T>(name: String, parse: fn(&str) -> Option<T>) -> ConchResult<T> {
    parse(&name).ok_or_else(|| {
        ConchError::Protocol(format!("Negotiated unsupported algorithm: {}", name))
    })
}

/// Negotiates every category of a key exchange round.
pub fn negotiate(client: &KexInit, server: &KexInit) -> ConchResult<NegotiatedAlgorithms> {
    Ok(NegotiatedAlgorithms {
        kex: negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?,
        host_key: negotiate_algorithm(
            "host key",
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?,
        cipher_client_to_server: parse_named(
            negotiate_algorithm(
                "cipher",
                &client.encryption_client_to_server,
                &server.encryption_client_to_server,
            )?,
            CipherAlgorithm::from_name,
        )?,
        cipher_server_to_client: parse_named(
            negotiate_algorithm(
                "cipher",
                &client.encryption_server_to_client,
                &server.encryption_server_to_client,
            )?,
            CipherAlgorithm::from_name,
        )?,
        mac_client_to_server: parse_named(
            negotiate_algorithm("mac", &client.mac_client_to_server, &server.mac_client_to_server)?,
            MacAlgorithm::from_name,
        )?,
        mac_server_to_client: parse_named(
            negotiate_algorithm("mac", &client.mac_server_to_client, &server.mac_server_to_client)?,
            MacAlgorithm::from_name,
        )?,
        compression_client_to_server: parse_named(
            negotiate_algorithm(
                "compression",
                &client.compression_client_to_server,
                &server.compression_client_to_server,
            )?,
            CompressionAlgorithm::from_name,
        )?,
        compression_server_to_client: parse_named(
            negotiate_algorithm(
                "compression",
                &client.compression_server_to_client,
                &server.compression_server_to_client,
            )?,
            CompressionAlgorithm::from_name,
        )?,
    })
}

/// Whether the peer's guessed first kex packet used the algorithms we agreed on
/// (RFC 4253 Section 7: both preferred kex and host key algorithms must match).
pub fn guess_was_correct(client: &KexInit, server: &KexInit) -> bool {
    client.kex_algorithms.first() == server.kex_algorithms.first()
        && client.server_host_key_algorithms.first() == server.server_host_key_algorithms.first()
}

/// Inputs to the exchange hash that identify both parties for one round.
///
/// Replaced wholesale on every key exchange round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    /// Client identification line (without CR LF)
    pub client_version: String,
    /// Server identification line (without CR LF)
    pub server_version: String,
    /// Client KEXINIT payload, verbatim
    pub client_kexinit: Vec<u8>,
    /// Server KEXINIT payload, verbatim
    pub server_kexinit: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KexInit {
        KexInit::from_preferences(&AlgorithmPreferences::default(), [0xAB; 16])
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = sample();
        let bytes = original.to_bytes();
        assert_eq!(bytes[0], 20);
        assert_eq!(&bytes[1..17], &[0xAB; 16]);

        let parsed = KexInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_parse_invalid_type() {
        let mut bytes = sample().to_bytes();
        bytes[0] = 21;
        match KexInit::from_bytes(&bytes) {
            Err(ConchError::Protocol(msg)) => assert!(msg.contains("expected 20")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_kexinit_parse_truncated() {
        let bytes = sample().to_bytes();
        assert!(KexInit::from_bytes(&bytes[..bytes.len() - 3]).is_err());
        assert!(KexInit::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_negotiate_prefers_client_order() {
        let client = KexInit::from_preferences(
            &AlgorithmPreferences {
                ciphers: vec!["aes128-ctr".into(), "aes256-ctr".into()],
                ..Default::default()
            },
            [0; 16],
        );
        let server = KexInit::from_preferences(
            &AlgorithmPreferences {
                ciphers: vec!["aes256-ctr".into(), "aes128-ctr".into()],
                kex: vec!["diffie-hellman-group1-sha1".into()],
                ..Default::default()
            },
            [0; 16],
        );
        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.kex, "diffie-hellman-group1-sha1");
        assert_eq!(negotiated.cipher_client_to_server, CipherAlgorithm::Aes128Ctr);
        assert_eq!(negotiated.mac_server_to_client, MacAlgorithm::HmacSha256);
    }

    #[test]
    fn test_negotiate_algorithm_no_match() {
        let client = vec!["aes256-ctr".to_string()];
        let server = vec!["aes128-cbc".to_string()];
        match negotiate_algorithm("cipher", &client, &server) {
            Err(ConchError::Protocol(msg)) => assert!(msg.contains("No common cipher")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_guess_check() {
        let a = sample();
        let mut b = sample();
        assert!(guess_was_correct(&a, &b));
        b.kex_algorithms.reverse();
        assert!(!guess_was_correct(&a, &b));
    }

    #[test]
    fn test_preferences_validate() {
        assert!(AlgorithmPreferences::default().validate().is_ok());

        let prefs = AlgorithmPreferences {
            ciphers: vec![],
            ..Default::default()
        };
        assert!(matches!(prefs.validate(), Err(ConchError::Config(_))));

        let prefs = AlgorithmPreferences {
            macs: vec!["hmac-md5".into()],
            ..Default::default()
        };
        assert!(matches!(prefs.validate(), Err(ConchError::Config(_))));
    }

    #[test]
    fn test_newkeys_message() {
        assert_eq!(new_keys_message(), vec![21]);
    }
}
