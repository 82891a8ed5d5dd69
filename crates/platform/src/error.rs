//! Error types for conch

use std::fmt;

/// Unified error type for all conch operations
#[derive(Debug)]
pub enum ConchError {
    /// I/O error on the underlying byte stream
    Io(std::io::Error),

    /// Invalid local configuration
    Config(String),

    /// Malformed frame (bad packet length or padding)
    Framing(String),

    /// MAC verification failed
    Integrity(String),

    /// Malformed message or message out of sequence
    Protocol(String),

    /// Remote host identity could not be trusted
    Trust(String),

    /// Local key material or primitive failure
    Security(String),

    /// Authentication attempt rejected.
    ///
    /// `allowed` holds the methods the server still accepts; `partial` is set when
    /// the attempted method succeeded but another factor is still required.
    AuthFailed {
        /// Methods that can continue
        allowed: Vec<String>,
        /// Partial success flag
        partial: bool,
    },

    /// The requested method is not in the server's advertised set
    AuthMethodNotAllowed {
        /// Method that was requested
        method: String,
        /// Methods the server advertised
        allowed: Vec<String>,
    },

    /// No authentication methods left to try
    AuthExhausted,

    /// Channel open refused by the peer
    ChannelOpen {
        /// Reason code (1 = prohibited, 2 = connect failed, 3 = unknown type, 4 = resource shortage)
        reason: u32,
        /// Human-readable description from the peer
        description: String,
    },

    /// Channel already closed
    ChannelClosed,

    /// A channel or global request was answered with failure
    RequestFailed(String),

    /// A blocking wait expired
    Timeout(String),

    /// The transport is gone; every waiter gets this once a fatal error occurred
    TransportClosed(String),

    /// Peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// Disconnect reason code
        reason: u32,
        /// Description sent by the peer
        description: String,
    },
}

impl ConchError {
    /// Returns `true` when this error tears down the whole transport.
    ///
    /// Authentication, channel-scoped and timeout errors leave the transport usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConchError::Io(_)
                | ConchError::Framing(_)
                | ConchError::Integrity(_)
                | ConchError::Protocol(_)
                | ConchError::Trust(_)
                | ConchError::TransportClosed(_)
                | ConchError::Disconnected { .. }
        )
    }
}

impl fmt::Display for ConchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConchError::Io(e) => write!(f, "IO error: {}", e),
            ConchError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ConchError::Framing(msg) => write!(f, "Framing error: {}", msg),
            ConchError::Integrity(msg) => write!(f, "Integrity error: {}", msg),
            ConchError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ConchError::Trust(msg) => write!(f, "Host key not trusted: {}", msg),
            ConchError::Security(msg) => write!(f, "Security error: {}", msg),
            ConchError::AuthFailed { allowed, partial } => write!(
                f,
                "Authentication failed (partial success: {}), allowed methods: {}",
                partial,
                allowed.join(",")
            ),
            ConchError::AuthMethodNotAllowed { method, allowed } => write!(
                f,
                "Authentication method '{}' not allowed, allowed methods: {}",
                method,
                allowed.join(",")
            ),
            ConchError::AuthExhausted => write!(f, "No authentication methods left"),
            ConchError::ChannelOpen {
                reason,
                description,
            } => write!(f, "Channel open failed (reason {}): {}", reason, description),
            ConchError::ChannelClosed => write!(f, "Channel closed"),
            ConchError::RequestFailed(name) => write!(f, "Request '{}' refused by peer", name),
            ConchError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            ConchError::TransportClosed(msg) => write!(f, "Transport closed: {}", msg),
            ConchError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected by peer (reason {}): {}", reason, description),
        }
    }
}

impl std::error::Error for ConchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConchError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConchError {
    fn from(err: std::io::Error) -> Self {
        ConchError::Io(err)
    }
}

/// Result type for conch operations
pub type ConchResult<T> = Result<T, ConchError>;
