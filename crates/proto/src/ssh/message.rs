//! SSH protocol message numbers (RFC 4250 Section 4.1).
//!
//! Codes 30-49 belong to the negotiated key-exchange method and codes 60-79 to the
//! authentication method in use, so the same number means different things
//! depending on context. Those live as plain constants in [`kex_codes`] and
//! [`auth_codes`]; everything with a single meaning is a [`MessageType`].
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use conch_proto::ssh::message::{MessageCategory, MessageType};
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(MessageCategory::of(94), MessageCategory::Connection);
//! ```

/// SSH message types with a context-free meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to an unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

/// Key-exchange method message numbers (30-49).
pub mod kex_codes {
    /// SSH_MSG_KEXDH_INIT (fixed-group DH)
    pub const KEXDH_INIT: u8 = 30;
    /// SSH_MSG_KEXDH_REPLY (fixed-group DH)
    pub const KEXDH_REPLY: u8 = 31;
    /// SSH_MSG_KEX_DH_GEX_REQUEST_OLD (legacy single-value size request)
    pub const KEX_DH_GEX_REQUEST_OLD: u8 = 30;
    /// SSH_MSG_KEX_DH_GEX_GROUP
    pub const KEX_DH_GEX_GROUP: u8 = 31;
    /// SSH_MSG_KEX_DH_GEX_INIT
    pub const KEX_DH_GEX_INIT: u8 = 32;
    /// SSH_MSG_KEX_DH_GEX_REPLY
    pub const KEX_DH_GEX_REPLY: u8 = 33;
    /// SSH_MSG_KEX_DH_GEX_REQUEST
    pub const KEX_DH_GEX_REQUEST: u8 = 34;
}

/// Authentication method message numbers (60-79).
pub mod auth_codes {
    /// SSH_MSG_USERAUTH_PK_OK (publickey)
    pub const USERAUTH_PK_OK: u8 = 60;
    /// SSH_MSG_USERAUTH_PASSWD_CHANGEREQ (password)
    pub const USERAUTH_PASSWD_CHANGEREQ: u8 = 60;
    /// SSH_MSG_USERAUTH_INFO_REQUEST (keyboard-interactive)
    pub const USERAUTH_INFO_REQUEST: u8 = 60;
    /// SSH_MSG_USERAUTH_INFO_RESPONSE (keyboard-interactive)
    pub const USERAUTH_INFO_RESPONSE: u8 = 61;
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
pub mod disconnect {
    /// Host not allowed to connect
    pub const HOST_NOT_ALLOWED_TO_CONNECT: u32 = 1;
    /// Protocol error
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// MAC error
    pub const MAC_ERROR: u32 = 5;
    /// Service not available
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
    /// Host key not verifiable
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    /// Connection lost
    pub const CONNECTION_LOST: u32 = 10;
    /// Disconnect by application
    pub const BY_APPLICATION: u32 = 11;
    /// No more authentication methods available
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}

/// Subsystem that owns a message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// Disconnect, ignore, unimplemented, debug
    TransportGeneric,
    /// Service request/accept
    Service,
    /// KEXINIT, NEWKEYS and method-specific key exchange messages
    KeyExchange,
    /// User authentication
    Authentication,
    /// Global requests and channel messages
    Connection,
    /// Reserved or local-extension numbers
    Unknown,
}

impl MessageCategory {
    /// Classifies a raw message number.
    pub fn of(byte: u8) -> Self {
        match byte {
            1..=4 => MessageCategory::TransportGeneric,
            5..=6 => MessageCategory::Service,
            20..=49 => MessageCategory::KeyExchange,
            50..=79 => MessageCategory::Authentication,
            80..=127 => MessageCategory::Connection,
            _ => MessageCategory::Unknown,
        }
    }
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// Returns `None` for unknown numbers and for the context-dependent ranges.
    ///
    /// # Example
    ///
    /// ```rust
    /// use conch_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(31), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use conch_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::KexInit.name(), "SSH_MSG_KEXINIT");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Human-readable name for any message number, for logging.
pub fn describe(byte: u8) -> String {
    match MessageType::from_u8(byte) {
        Some(t) => t.to_string(),
        None => format!("SSH_MSG_{}", byte),
    }
}
