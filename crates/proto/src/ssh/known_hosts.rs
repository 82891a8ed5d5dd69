//! Known-hosts trust store.
//!
//! The transport only verifies that the server holds the private half of the
//! key it presented. Whether that key belongs to the host the caller meant to
//! reach is decided here, from entries in the OpenSSH `known_hosts` layout:
//!
//! ```text
//! host1,[host2]:2222,*.example.com,!bad.example.com ssh-ed25519 AAAAC3Nz... comment
//! |1|<base64 salt>|<base64 HMAC-SHA1(salt, host)> ssh-ed25519 AAAAC3Nz...
//! ```
//!
//! [`KnownHosts::verifier`] turns a store into a [`HostKeyVerifier`] for one
//! destination, which is what [`ClientConfig`](crate::ssh::client::ClientConfig)
//! consumes.
//!
//! # Example
//!
//! ```rust
//! use conch_proto::ssh::hostkey::{Ed25519HostKey, HostKey, HostKeyVerifier};
//! use conch_proto::ssh::known_hosts::{HostKeyStatus, KnownHosts, StrictHostKeyChecking};
//!
//! let key = Ed25519HostKey::generate();
//! let mut hosts = KnownHosts::new();
//! hosts.add_hashed("build.example.com", 22, &key.public_key_blob());
//!
//! assert_eq!(
//!     hosts.check("build.example.com", 22, &key.public_key_blob()),
//!     HostKeyStatus::Known
//! );
//! let verifier = hosts.verifier("build.example.com", 22, StrictHostKeyChecking::Strict);
//! assert!(verifier.verify("ssh-ed25519", &key.public_key_blob()));
//! ```

use crate::ssh::hostkey::{fingerprint, key_type, key_type_for_algorithm, HostKeyVerifier};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use conch_platform::{ConchError, ConchResult};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use std::path::Path;
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;

const HASH_MAGIC: &str = "|1|";
const SALT_LEN: usize = 20;

/// One line of a known-hosts file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostEntry {
    patterns: String,
    key_type: String,
    key_blob: Vec<u8>,
    comment: Option<String>,
}

impl KnownHostEntry {
    /// Entry for `patterns` (comma separated) trusting `key_blob`.
    pub fn new(patterns: &str, key_blob: Vec<u8>) -> ConchResult<Self> {
        Ok(Self {
            patterns: patterns.to_string(),
            key_type: key_type(&key_blob)?,
            key_blob,
            comment: None,
        })
    }

    /// Parses `patterns keytype base64 [comment]`.
    pub fn parse(line: &str) -> ConchResult<Self> {
        let mut fields = line.split_whitespace();
        let (patterns, declared, encoded) = match (fields.next(), fields.next(), fields.next()) {
            (Some(p), Some(t), Some(k)) => (p, t, k),
            _ => {
                return Err(ConchError::Config(format!(
                    "known_hosts line needs host, key type and key: {:?}",
                    line
                )))
            }
        };
        if patterns.starts_with('@') {
            return Err(ConchError::Config(format!(
                "known_hosts markers are not supported: {}",
                patterns
            )));
        }

        let key_blob = STANDARD
            .decode(encoded)
            .map_err(|e| ConchError::Config(format!("Invalid base64 host key: {}", e)))?;
        let embedded = key_type(&key_blob)?;
        if embedded != declared {
            return Err(ConchError::Config(format!(
                "known_hosts key type {} does not match key blob ({})",
                declared, embedded
            )));
        }

        let comment: Vec<&str> = fields.collect();
        Ok(Self {
            patterns: patterns.to_string(),
            key_type: embedded,
            key_blob,
            comment: (!comment.is_empty()).then(|| comment.join(" ")),
        })
    }

    pub fn patterns(&self) -> &str {
        &self.patterns
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn key_blob(&self) -> &[u8] {
        &self.key_blob
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// Whether the entry names `host` on `port`.
    ///
    /// A matching negated pattern (`!host`) excludes the host even when another
    /// pattern of the same entry matches.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        let name = host_key_name(host, port);
        let mut matched = false;
        for pattern in self.patterns.split(',') {
            if let Some(negated) = pattern.strip_prefix('!') {
                if pattern_matches(negated, &name) {
                    return false;
                }
            } else if pattern_matches(pattern, &name) {
                matched = true;
            }
        }
        matched
    }

    /// The entry rendered as a known-hosts line.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.patterns,
            self.key_type,
            STANDARD.encode(&self.key_blob)
        );
        if let Some(comment) = &self.comment {
            line.push(' ');
            line.push_str(comment);
        }
        line
    }
}

/// Outcome of looking a host key up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// An entry for the host lists exactly this key.
    Known,
    /// The host has entries of the same key type, none listing this key.
    Changed {
        /// Fingerprint of the first recorded key.
        recorded: String,
    },
    /// No entry of this key type names the host.
    Unknown,
}

/// What a [`KnownHostVerifier`] does with a host it has no entry for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictHostKeyChecking {
    /// Reject unknown hosts.
    #[default]
    Strict,
    /// Accept and remember the first key of an unknown host.
    AcceptNew,
}

/// Set of trusted host keys.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a known-hosts document. Malformed lines are skipped with a warning.
    pub fn parse(content: &str) -> Self {
        let mut entries = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match KnownHostEntry::parse(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping known_hosts line {}: {}", number + 1, e),
            }
        }
        Self { entries }
    }

    /// Reads a known-hosts file. A missing file is an empty store.
    pub fn load(path: impl AsRef<Path>) -> ConchResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No known_hosts at {}", path.display());
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the store to `path`, replacing it.
    pub fn save(&self, path: impl AsRef<Path>) -> ConchResult<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.to_string())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn entries(&self) -> &[KnownHostEntry] {
        &self.entries
    }

    pub fn push(&mut self, entry: KnownHostEntry) {
        self.entries.push(entry);
    }

    /// Records `key_blob` for `host` in plain form.
    pub fn add(&mut self, host: &str, port: u16, key_blob: &[u8]) -> ConchResult<()> {
        let entry = KnownHostEntry::new(&host_key_name(host, port), key_blob.to_vec())?;
        self.entries.push(entry);
        Ok(())
    }

    /// Records `key_blob` for `host` with the host name hashed under a fresh salt.
    pub fn add_hashed(&mut self, host: &str, port: u16, key_blob: &[u8]) {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let pattern = hash_host_name(&host_key_name(host, port), &salt);
        let key_type = key_type(key_blob).unwrap_or_default();
        self.entries.push(KnownHostEntry {
            patterns: pattern,
            key_type,
            key_blob: key_blob.to_vec(),
            comment: None,
        });
    }

    /// Drops every entry naming `host`, returning how many were removed.
    pub fn remove(&mut self, host: &str, port: u16) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.matches(host, port));
        before - self.entries.len()
    }

    /// Looks `key_blob` up for `host`.
    ///
    /// Only entries of the key's own type take part, so a host with a recorded
    /// RSA key that now presents an Ed25519 key is `Unknown`, not `Changed`.
    pub fn check(&self, host: &str, port: u16, key_blob: &[u8]) -> HostKeyStatus {
        let presented = match key_type(key_blob) {
            Ok(t) => t,
            Err(_) => return HostKeyStatus::Unknown,
        };
        let mut recorded = None;
        for entry in self
            .entries
            .iter()
            .filter(|e| e.key_type == presented && e.matches(host, port))
        {
            if entry.key_blob == key_blob {
                return HostKeyStatus::Known;
            }
            recorded.get_or_insert_with(|| fingerprint(&entry.key_blob));
        }
        match recorded {
            Some(recorded) => HostKeyStatus::Changed { recorded },
            None => HostKeyStatus::Unknown,
        }
    }

    /// Policy object checking keys presented by `host`.
    pub fn verifier(&self, host: &str, port: u16, policy: StrictHostKeyChecking) -> KnownHostVerifier {
        KnownHostVerifier {
            hosts: Mutex::new(self.clone()),
            host: host.to_string(),
            port,
            policy,
        }
    }
}

impl std::fmt::Display for KnownHosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry.to_line())?;
        }
        Ok(())
    }
}

/// [`HostKeyVerifier`] backed by a [`KnownHosts`] snapshot for one destination.
///
/// A changed key is always rejected.
#[derive(Debug)]
pub struct KnownHostVerifier {
    hosts: Mutex<KnownHosts>,
    host: String,
    port: u16,
    policy: StrictHostKeyChecking,
}

impl KnownHostVerifier {
    /// The store including anything learned under [`StrictHostKeyChecking::AcceptNew`].
    pub fn known_hosts(&self) -> KnownHosts {
        match self.hosts.lock() {
            Ok(hosts) => hosts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl HostKeyVerifier for KnownHostVerifier {
    fn verify(&self, algorithm: &str, key_blob: &[u8]) -> bool {
        let mut hosts = match self.hosts.lock() {
            Ok(hosts) => hosts,
            Err(poisoned) => poisoned.into_inner(),
        };
        if key_type(key_blob).ok().as_deref() != Some(key_type_for_algorithm(algorithm)) {
            warn!("Host key blob does not match algorithm {}", algorithm);
            return false;
        }
        match hosts.check(&self.host, self.port, key_blob) {
            HostKeyStatus::Known => true,
            HostKeyStatus::Changed { recorded } => {
                warn!(
                    "Host key for {} changed: recorded {}, presented {}",
                    self.host,
                    recorded,
                    fingerprint(key_blob)
                );
                false
            }
            HostKeyStatus::Unknown => match self.policy {
                StrictHostKeyChecking::Strict => {
                    warn!(
                        "No known host key for {} ({})",
                        self.host,
                        fingerprint(key_blob)
                    );
                    false
                }
                StrictHostKeyChecking::AcceptNew => {
                    debug!("Learning host key {} for {}", fingerprint(key_blob), self.host);
                    hosts.add(&self.host, self.port, key_blob).is_ok()
                }
            },
        }
    }
}

/// Name under which a host is recorded: `host` on port 22, `[host]:port` otherwise.
pub fn host_key_name(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Hashed host pattern `|1|salt|HMAC-SHA1(salt, name)`.
pub fn hash_host_name(name: &str, salt: &[u8]) -> String {
    format!(
        "{}{}|{}",
        HASH_MAGIC,
        STANDARD.encode(salt),
        STANDARD.encode(host_name_mac(name, salt))
    )
}

fn host_name_mac(name: &str, salt: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha1::new_from_slice(salt) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(name.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if let Some(hashed) = pattern.strip_prefix(HASH_MAGIC) {
        let Some((salt, digest)) = hashed.split_once('|') else {
            return false;
        };
        return match (STANDARD.decode(salt), STANDARD.decode(digest)) {
            (Ok(salt), Ok(digest)) => host_name_mac(name, &salt).ct_eq(&digest).into(),
            _ => false,
        };
    }
    glob_match(pattern.as_bytes(), name.as_bytes())
}

/// `*` and `?` wildcard match, ASCII case-insensitive like host names.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(&b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c.eq_ignore_ascii_case(&text[t]) => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, consumed)) => {
                    p = star + 1;
                    t = consumed + 1;
                    backtrack = Some((star, consumed + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
