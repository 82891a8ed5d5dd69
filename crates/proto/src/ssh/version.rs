//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both sides send an
//! identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification string; clients
//! skip them. The line is kept verbatim (without CR LF) because it is an
//! input to the exchange hash.
//!
//! - Maximum line length: 255 characters
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use conch_proto::ssh::version::Version;
//!
//! let version = Version::new("conch_0.1", Some("test build"));
//! assert_eq!(version.to_string(), "SSH-2.0-conch_0.1 test build");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use conch_platform::{ConchError, ConchResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of non-identification lines a client tolerates before the banner.
pub const MAX_PRE_BANNER_LINES: usize = 1024;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "OpenSSH_8.9")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
    /// The identification line exactly as sent or received, without CR LF
    line: String,
}

impl Version {
    /// Creates a new SSH version string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use conch_proto::ssh::version::Version;
    ///
    /// let version = Version::new("conch_0.1", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-conch_0.1");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        let line = match comments {
            Some(c) => format!("SSH-2.0-{} {}", software, c),
            None => format!("SSH-2.0-{}", software),
        };
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
            line,
        }
    }

    /// Default identification for this library.
    pub fn default_conch() -> Self {
        Self::new(&format!("conch_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH version string.
    ///
    /// # Errors
    ///
    /// Returns [`ConchError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    ///
    /// # Example
    ///
    /// ```rust
    /// use conch_proto::ssh::version::Version;
    ///
    /// let version = Version::parse("SSH-1.99-OpenSSH_8.9\r\n").unwrap();
    /// assert_eq!(version.software(), "OpenSSH_8.9");
    /// assert_eq!(version.as_str(), "SSH-1.99-OpenSSH_8.9");
    /// ```
    pub fn parse(line: &str) -> ConchResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(ConchError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(ConchError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(ConchError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        // SSH-protoversion-softwareversion[ comments]
        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(ConchError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(ConchError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.find(' ') {
            Some(space_pos) => (
                rest[..space_pos].to_string(),
                Some(rest[space_pos + 1..].trim().to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
            line: line.to_string(),
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_8.9").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The verbatim identification line (exchange hash input).
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self.line).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.line)
    }
}

/// Sends our identification line.
pub async fn write_identification<W>(stream: &mut W, ours: &Version) -> ConchResult<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&ours.to_wire_format()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the peer's identification line.
///
/// With `allow_preamble` (client side) lines that do not start with `SSH-` are
/// skipped. The stream is read one byte at a time so nothing past the line is
/// consumed.
pub async fn read_identification<R>(stream: &mut R, allow_preamble: bool) -> ConchResult<Version>
where
    R: AsyncRead + Unpin,
{
    for _ in 0..MAX_PRE_BANNER_LINES {
        let line = read_line(stream).await?;
        if line.starts_with("SSH-") {
            let version = Version::parse(&line)?;
            debug!("Remote identification: {}", version);
            return Ok(version);
        }
        if !allow_preamble {
            return Err(ConchError::Protocol(format!(
                "Expected identification string, got '{}'",
                line.trim_end()
            )));
        }
        trace!("Skipping pre-banner line: {}", line.trim_end());
    }
    Err(ConchError::Protocol(
        "No identification string received".to_string(),
    ))
}

async fn read_line<R>(stream: &mut R) -> ConchResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if stream.read(&mut byte).await? == 0 {
            return Err(ConchError::TransportClosed(
                "Connection closed during version exchange".to_string(),
            ));
        }
        buffer.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if buffer.len() > MAX_VERSION_LENGTH {
            return Err(ConchError::Protocol("Version string too long".to_string()));
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
