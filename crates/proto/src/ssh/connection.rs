//! SSH connection protocol messages (RFC 4254).
//!
//! Wire codecs for everything the channel multiplexer exchanges:
//! - Channel lifecycle: open, confirmation, failure, EOF, close
//! - Flow control: window adjust
//! - Data: normal and extended (stderr)
//! - Channel requests: pty-req, env, exec, shell, subsystem, window-change,
//!   signal, exit-status, exit-signal
//! - Global requests
//!
//! The state behind these messages lives in [`channel`](super::channel).
//!
//! # Security
//!
//! - **Window size limits** - Prevents memory exhaustion attacks
//! - **Maximum packet size** - Prevents buffer overflow attacks
//! - Unknown request types are kept as opaque data so they can be refused
//!
//! # Example
//!
//! ```rust
//! use conch_proto::ssh::connection::{ChannelMessage, ChannelType};
//!
//! let open = ChannelMessage::Open {
//!     channel_type: ChannelType::Session,
//!     sender_channel: 0,
//!     initial_window_size: 2 * 1024 * 1024,
//!     maximum_packet_size: 32768,
//! };
//! let bytes = open.to_bytes();
//! assert_eq!(ChannelMessage::from_bytes(&bytes).unwrap(), open);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{message, SshBufMut, WireReader};
use bytes::BufMut;
use conch_platform::{ConchError, ConchResult};

/// Maximum window size (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum packet size (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Terminal mode list terminator (RFC 4254 Section 8).
pub const TTY_OP_END: u8 = 0;

/// Channel type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Session channel (interactive shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (reverse port forwarding).
    ForwardedTcpip {
        /// Connected address
        connected_address: String,
        /// Connected port
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Any other type, with its type-specific data left opaque.
    Other {
        /// Type name
        name: String,
        /// Remaining bytes of the open message
        data: Vec<u8>,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelType::Other { name, .. } => name,
        }
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// Extended data type codes (RFC 4254 Section 5.2).
pub mod extended_data {
    /// SSH_EXTENDED_DATA_STDERR
    pub const STDERR: u32 = 1;
}

/// Channel request payloads (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// PTY request (pseudoterminal allocation)
    PtyReq {
        /// Terminal type (e.g., "xterm")
        term: String,
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
        /// Encoded terminal modes
        modes: Vec<u8>,
    },
    /// Environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute command
    Exec {
        /// Command to execute
        command: String,
    },
    /// Start interactive shell
    Shell,
    /// Start subsystem (e.g., "sftp")
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Terminal dimensions changed
    WindowChange {
        /// Terminal width in characters
        width_chars: u32,
        /// Terminal height in rows
        height_rows: u32,
        /// Terminal width in pixels
        width_pixels: u32,
        /// Terminal height in pixels
        height_pixels: u32,
    },
    /// Deliver a signal (name without the "SIG" prefix)
    Signal {
        /// Signal name
        signal_name: String,
    },
    /// Exit status
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Exit signal
    ExitSignal {
        /// Signal name
        signal_name: String,
        /// Core dumped flag
        core_dumped: bool,
        /// Error message
        error_message: String,
        /// Language tag
        language_tag: String,
    },
    /// A request this crate does not interpret.
    Unknown {
        /// Request name
        name: String,
        /// Type-specific data
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq { .. } => "pty-req",
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::WindowChange { .. } => "window-change",
            ChannelRequestType::Signal { .. } => "signal",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Unknown { name, .. } => name,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ChannelRequestType::PtyReq {
                term,
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
                modes,
            } => {
                buf.put_ssh_string(term.as_bytes());
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
                buf.put_ssh_string(modes);
            }
            ChannelRequestType::Env { name, value } => {
                buf.put_ssh_string(name.as_bytes());
                buf.put_ssh_string(value.as_bytes());
            }
            ChannelRequestType::Exec { command } => buf.put_ssh_string(command.as_bytes()),
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => buf.put_ssh_string(name.as_bytes()),
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels,
                height_pixels,
            } => {
                buf.put_u32(*width_chars);
                buf.put_u32(*height_rows);
                buf.put_u32(*width_pixels);
                buf.put_u32(*height_pixels);
            }
            ChannelRequestType::Signal { signal_name } => {
                buf.put_ssh_string(signal_name.as_bytes())
            }
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                language_tag,
            } => {
                buf.put_ssh_string(signal_name.as_bytes());
                buf.put_ssh_bool(*core_dumped);
                buf.put_ssh_string(error_message.as_bytes());
                buf.put_ssh_string(language_tag.as_bytes());
            }
            ChannelRequestType::Unknown { data, .. } => buf.put_slice(data),
        }
    }

    fn decode(name: String, r: &mut WireReader<'_>) -> ConchResult<Self> {
        Ok(match name.as_str() {
            "pty-req" => ChannelRequestType::PtyReq {
                term: r.read_utf8()?,
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
                modes: r.read_string()?.to_vec(),
            },
            "env" => ChannelRequestType::Env {
                name: r.read_utf8()?,
                value: r.read_utf8()?,
            },
            "exec" => ChannelRequestType::Exec {
                command: r.read_utf8()?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: r.read_utf8()?,
            },
            "window-change" => ChannelRequestType::WindowChange {
                width_chars: r.read_u32()?,
                height_rows: r.read_u32()?,
                width_pixels: r.read_u32()?,
                height_pixels: r.read_u32()?,
            },
            "signal" => ChannelRequestType::Signal {
                signal_name: r.read_utf8()?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: r.read_u32()?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: r.read_utf8()?,
                core_dumped: r.read_bool()?,
                error_message: r.read_utf8()?,
                language_tag: r.read_utf8()?,
            },
            _ => {
                let data = r.rest().to_vec();
                r.read_raw(data.len())?;
                ChannelRequestType::Unknown { name, data }
            }
        })
    }
}

/// Encodes terminal modes as opcode/uint32 pairs followed by TTY_OP_END.
///
/// # Example
///
/// ```rust
/// use conch_proto::ssh::connection::{decode_terminal_modes, encode_terminal_modes};
///
/// // VINTR = 3 (Ctrl-C), ECHO = 1
/// let modes = encode_terminal_modes(&[(1, 3), (53, 1)]);
/// assert_eq!(decode_terminal_modes(&modes).unwrap(), vec![(1, 3), (53, 1)]);
/// ```
pub fn encode_terminal_modes(modes: &[(u8, u32)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(modes.len() * 5 + 1);
    for (opcode, value) in modes {
        buf.put_u8(*opcode);
        buf.put_u32(*value);
    }
    buf.put_u8(TTY_OP_END);
    buf
}

/// Decodes an encoded terminal mode list.
///
/// Opcodes 160 and above carry no value this crate understands and end decoding.
pub fn decode_terminal_modes(data: &[u8]) -> ConchResult<Vec<(u8, u32)>> {
    let mut r = WireReader::new(data);
    let mut modes = Vec::new();
    while r.remaining() > 0 {
        let opcode = r.read_u8()?;
        if opcode == TTY_OP_END || opcode >= 160 {
            break;
        }
        modes.push((opcode, r.read_u32()?));
    }
    Ok(modes)
}

/// Connection protocol message addressed to (or opening) a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// SSH_MSG_CHANNEL_OPEN
    Open {
        /// Channel type and its data
        channel_type: ChannelType,
        /// Sender's local id
        sender_channel: u32,
        /// Initial window
        initial_window_size: u32,
        /// Largest data packet the sender accepts
        maximum_packet_size: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    OpenConfirmation {
        /// Opener's id
        recipient_channel: u32,
        /// Confirmer's id
        sender_channel: u32,
        /// Initial window
        initial_window_size: u32,
        /// Largest data packet the confirmer accepts
        maximum_packet_size: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    OpenFailure {
        /// Opener's id
        recipient_channel: u32,
        /// Reason code (see [`ChannelOpenFailureReason`])
        reason_code: u32,
        /// Human-readable description
        description: String,
        /// Language tag
        language_tag: String,
    },
    /// SSH_MSG_CHANNEL_WINDOW_ADJUST
    WindowAdjust {
        /// Recipient id
        recipient_channel: u32,
        /// Bytes added to the window
        bytes_to_add: u32,
    },
    /// SSH_MSG_CHANNEL_DATA
    Data {
        /// Recipient id
        recipient_channel: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EXTENDED_DATA
    ExtendedData {
        /// Recipient id
        recipient_channel: u32,
        /// Stream code (1 is stderr)
        data_type_code: u32,
        /// Payload
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_EOF
    Eof {
        /// Recipient id
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_CLOSE
    Close {
        /// Recipient id
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_REQUEST
    Request {
        /// Recipient id
        recipient_channel: u32,
        /// Whether SUCCESS/FAILURE is expected
        want_reply: bool,
        /// Request payload
        request: ChannelRequestType,
    },
    /// SSH_MSG_CHANNEL_SUCCESS
    Success {
        /// Recipient id
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_FAILURE
    Failure {
        /// Recipient id
        recipient_channel: u32,
    },
}

impl ChannelMessage {
    /// Channel id the message is addressed to (`None` for an open request).
    pub fn recipient_channel(&self) -> Option<u32> {
        match self {
            ChannelMessage::Open { .. } => None,
            ChannelMessage::OpenConfirmation { recipient_channel, .. }
            | ChannelMessage::OpenFailure { recipient_channel, .. }
            | ChannelMessage::WindowAdjust { recipient_channel, .. }
            | ChannelMessage::Data { recipient_channel, .. }
            | ChannelMessage::ExtendedData { recipient_channel, .. }
            | ChannelMessage::Eof { recipient_channel }
            | ChannelMessage::Close { recipient_channel }
            | ChannelMessage::Request { recipient_channel, .. }
            | ChannelMessage::Success { recipient_channel }
            | ChannelMessage::Failure { recipient_channel } => Some(*recipient_channel),
        }
    }

    /// Message type byte.
    pub fn message_type(&self) -> MessageType {
        match self {
            ChannelMessage::Open { .. } => MessageType::ChannelOpen,
            ChannelMessage::OpenConfirmation { .. } => MessageType::ChannelOpenConfirmation,
            ChannelMessage::OpenFailure { .. } => MessageType::ChannelOpenFailure,
            ChannelMessage::WindowAdjust { .. } => MessageType::ChannelWindowAdjust,
            ChannelMessage::Data { .. } => MessageType::ChannelData,
            ChannelMessage::ExtendedData { .. } => MessageType::ChannelExtendedData,
            ChannelMessage::Eof { .. } => MessageType::ChannelEof,
            ChannelMessage::Close { .. } => MessageType::ChannelClose,
            ChannelMessage::Request { .. } => MessageType::ChannelRequest,
            ChannelMessage::Success { .. } => MessageType::ChannelSuccess,
            ChannelMessage::Failure { .. } => MessageType::ChannelFailure,
        }
    }

    /// Serializes to a message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(self.message_type() as u8).to_vec();
        match self {
            ChannelMessage::Open {
                channel_type,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => {
                buf.put_ssh_string(channel_type.name().as_bytes());
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window_size);
                buf.put_u32(*maximum_packet_size);
                match channel_type {
                    ChannelType::Session => {}
                    ChannelType::DirectTcpip {
                        host,
                        port,
                        originator_address,
                        originator_port,
                    } => {
                        buf.put_ssh_string(host.as_bytes());
                        buf.put_u32(*port);
                        buf.put_ssh_string(originator_address.as_bytes());
                        buf.put_u32(*originator_port);
                    }
                    ChannelType::ForwardedTcpip {
                        connected_address,
                        connected_port,
                        originator_address,
                        originator_port,
                    } => {
                        buf.put_ssh_string(connected_address.as_bytes());
                        buf.put_u32(*connected_port);
                        buf.put_ssh_string(originator_address.as_bytes());
                        buf.put_u32(*originator_port);
                    }
                    ChannelType::Other { data, .. } => buf.put_slice(data),
                }
            }
            ChannelMessage::OpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window_size);
                buf.put_u32(*maximum_packet_size);
            }
            ChannelMessage::OpenFailure {
                recipient_channel,
                reason_code,
                description,
                language_tag,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*reason_code);
                buf.put_ssh_string(description.as_bytes());
                buf.put_ssh_string(language_tag.as_bytes());
            }
            ChannelMessage::WindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*bytes_to_add);
            }
            ChannelMessage::Data {
                recipient_channel,
                data,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_ssh_string(data);
            }
            ChannelMessage::ExtendedData {
                recipient_channel,
                data_type_code,
                data,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*data_type_code);
                buf.put_ssh_string(data);
            }
            ChannelMessage::Eof { recipient_channel }
            | ChannelMessage::Close { recipient_channel }
            | ChannelMessage::Success { recipient_channel }
            | ChannelMessage::Failure { recipient_channel } => buf.put_u32(*recipient_channel),
            ChannelMessage::Request {
                recipient_channel,
                want_reply,
                request,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_ssh_string(request.name().as_bytes());
                buf.put_ssh_bool(*want_reply);
                request.encode(&mut buf);
            }
        }
        buf
    }

    /// Parses a message payload (including the type byte).
    pub fn from_bytes(data: &[u8]) -> ConchResult<Self> {
        let mut r = WireReader::new(data);
        let msg_type = r.read_u8()?;
        let msg = match MessageType::from_u8(msg_type) {
            Some(MessageType::ChannelOpen) => {
                let name = r.read_utf8()?;
                let sender_channel = r.read_u32()?;
                let initial_window_size = r.read_u32()?;
                let maximum_packet_size = r.read_u32()?;
                let channel_type = match name.as_str() {
                    "session" => ChannelType::Session,
                    "direct-tcpip" => ChannelType::DirectTcpip {
                        host: r.read_utf8()?,
                        port: r.read_u32()?,
                        originator_address: r.read_utf8()?,
                        originator_port: r.read_u32()?,
                    },
                    "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                        connected_address: r.read_utf8()?,
                        connected_port: r.read_u32()?,
                        originator_address: r.read_utf8()?,
                        originator_port: r.read_u32()?,
                    },
                    _ => {
                        let data = r.rest().to_vec();
                        r.read_raw(data.len())?;
                        ChannelType::Other { name, data }
                    }
                };
                ChannelMessage::Open {
                    channel_type,
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                }
            }
            Some(MessageType::ChannelOpenConfirmation) => ChannelMessage::OpenConfirmation {
                recipient_channel: r.read_u32()?,
                sender_channel: r.read_u32()?,
                initial_window_size: r.read_u32()?,
                maximum_packet_size: r.read_u32()?,
            },
            Some(MessageType::ChannelOpenFailure) => ChannelMessage::OpenFailure {
                recipient_channel: r.read_u32()?,
                reason_code: r.read_u32()?,
                description: r.read_utf8()?,
                // Some peers omit the language tag
                language_tag: if r.remaining() > 0 {
                    r.read_utf8()?
                } else {
                    String::new()
                },
            },
            Some(MessageType::ChannelWindowAdjust) => ChannelMessage::WindowAdjust {
                recipient_channel: r.read_u32()?,
                bytes_to_add: r.read_u32()?,
            },
            Some(MessageType::ChannelData) => ChannelMessage::Data {
                recipient_channel: r.read_u32()?,
                data: r.read_string()?.to_vec(),
            },
            Some(MessageType::ChannelExtendedData) => ChannelMessage::ExtendedData {
                recipient_channel: r.read_u32()?,
                data_type_code: r.read_u32()?,
                data: r.read_string()?.to_vec(),
            },
            Some(MessageType::ChannelEof) => ChannelMessage::Eof {
                recipient_channel: r.read_u32()?,
            },
            Some(MessageType::ChannelClose) => ChannelMessage::Close {
                recipient_channel: r.read_u32()?,
            },
            Some(MessageType::ChannelRequest) => {
                let recipient_channel = r.read_u32()?;
                let name = r.read_utf8()?;
                let want_reply = r.read_bool()?;
                ChannelMessage::Request {
                    recipient_channel,
                    want_reply,
                    request: ChannelRequestType::decode(name, &mut r)?,
                }
            }
            Some(MessageType::ChannelSuccess) => ChannelMessage::Success {
                recipient_channel: r.read_u32()?,
            },
            Some(MessageType::ChannelFailure) => ChannelMessage::Failure {
                recipient_channel: r.read_u32()?,
            },
            _ => {
                return Err(ConchError::Protocol(format!(
                    "Not a channel message: type {}",
                    msg_type
                )))
            }
        };
        Ok(msg)
    }
}

/// Connection-wide requests (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalMessage {
    /// SSH_MSG_GLOBAL_REQUEST
    Request {
        /// Request name
        name: String,
        /// Whether a reply is expected
        want_reply: bool,
        /// Request-specific data
        data: Vec<u8>,
    },
    /// SSH_MSG_REQUEST_SUCCESS
    Success {
        /// Response-specific data
        data: Vec<u8>,
    },
    /// SSH_MSG_REQUEST_FAILURE
    Failure,
}

impl GlobalMessage {
    /// Serializes to a message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            GlobalMessage::Request {
                name,
                want_reply,
                data,
            } => {
                let mut buf = message(MessageType::GlobalRequest as u8);
                buf.put_ssh_string(name.as_bytes());
                buf.put_ssh_bool(*want_reply);
                buf.put_slice(data);
                buf.to_vec()
            }
            GlobalMessage::Success { data } => {
                let mut buf = message(MessageType::RequestSuccess as u8);
                buf.put_slice(data);
                buf.to_vec()
            }
            GlobalMessage::Failure => vec![MessageType::RequestFailure as u8],
        }
    }

    /// Parses a message payload (including the type byte).
    pub fn from_bytes(data: &[u8]) -> ConchResult<Self> {
        let mut r = WireReader::new(data);
        let msg_type = r.read_u8()?;
        match MessageType::from_u8(msg_type) {
            Some(MessageType::GlobalRequest) => Ok(GlobalMessage::Request {
                name: r.read_utf8()?,
                want_reply: r.read_bool()?,
                data: r.rest().to_vec(),
            }),
            Some(MessageType::RequestSuccess) => Ok(GlobalMessage::Success {
                data: r.rest().to_vec(),
            }),
            Some(MessageType::RequestFailure) => Ok(GlobalMessage::Failure),
            _ => Err(ConchError::Protocol(format!(
                "Not a global request message: type {}",
                msg_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_session() {
        let open = ChannelMessage::Open {
            channel_type: ChannelType::Session,
            sender_channel: 7,
            initial_window_size: 1024,
            maximum_packet_size: 512,
        };
        let bytes = open.to_bytes();
        assert_eq!(bytes[0], 90);
        assert_eq!(&bytes[1..12], b"\x00\x00\x00\x07session");
        assert_eq!(ChannelMessage::from_bytes(&bytes).unwrap(), open);
        assert_eq!(open.recipient_channel(), None);
    }

    #[test]
    fn test_channel_open_unknown_type_kept() {
        let open = ChannelMessage::Open {
            channel_type: ChannelType::Other {
                name: "x11".into(),
                data: vec![0, 0, 0, 0, 0, 0, 0, 1],
            },
            sender_channel: 1,
            initial_window_size: 10,
            maximum_packet_size: 10,
        };
        let parsed = ChannelMessage::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_open_failure_without_language() {
        let mut bytes = vec![92];
        bytes.put_u32(3);
        bytes.put_u32(ChannelOpenFailureReason::ResourceShortage as u32);
        bytes.put_ssh_string(b"too many");
        match ChannelMessage::from_bytes(&bytes).unwrap() {
            ChannelMessage::OpenFailure {
                recipient_channel,
                reason_code,
                description,
                language_tag,
            } => {
                assert_eq!(recipient_channel, 3);
                assert_eq!(reason_code, 4);
                assert_eq!(description, "too many");
                assert!(language_tag.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_messages() {
        let data = ChannelMessage::Data {
            recipient_channel: 2,
            data: b"Hello there.".to_vec(),
        };
        assert_eq!(data.recipient_channel(), Some(2));
        assert_eq!(ChannelMessage::from_bytes(&data.to_bytes()).unwrap(), data);

        let stderr = ChannelMessage::ExtendedData {
            recipient_channel: 2,
            data_type_code: extended_data::STDERR,
            data: b"oops".to_vec(),
        };
        assert_eq!(ChannelMessage::from_bytes(&stderr.to_bytes()).unwrap(), stderr);
    }

    #[test]
    fn test_requests() {
        let requests = vec![
            ChannelRequestType::PtyReq {
                term: "vt100".into(),
                width_chars: 80,
                height_rows: 25,
                width_pixels: 0,
                height_pixels: 0,
                modes: encode_terminal_modes(&[(53, 0)]),
            },
            ChannelRequestType::Exec {
                command: "yes".into(),
            },
            ChannelRequestType::Shell,
            ChannelRequestType::WindowChange {
                width_chars: 120,
                height_rows: 40,
                width_pixels: 0,
                height_pixels: 0,
            },
            ChannelRequestType::Signal {
                signal_name: "INT".into(),
            },
            ChannelRequestType::ExitStatus { exit_status: 23 },
            ChannelRequestType::ExitSignal {
                signal_name: "KILL".into(),
                core_dumped: true,
                error_message: "killed".into(),
                language_tag: String::new(),
            },
        ];
        for request in requests {
            let msg = ChannelMessage::Request {
                recipient_channel: 5,
                want_reply: true,
                request,
            };
            assert_eq!(ChannelMessage::from_bytes(&msg.to_bytes()).unwrap(), msg);
        }
    }

    #[test]
    fn test_unknown_request_is_opaque() {
        let msg = ChannelMessage::Request {
            recipient_channel: 1,
            want_reply: true,
            request: ChannelRequestType::Unknown {
                name: "keepalive@openssh.com".into(),
                data: vec![],
            },
        };
        let parsed = ChannelMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_truncated_message() {
        let msg = ChannelMessage::WindowAdjust {
            recipient_channel: 1,
            bytes_to_add: 100,
        };
        let bytes = msg.to_bytes();
        assert!(matches!(
            ChannelMessage::from_bytes(&bytes[..6]),
            Err(ConchError::Protocol(_))
        ));
    }

    #[test]
    fn test_not_a_channel_message() {
        assert!(ChannelMessage::from_bytes(&[80, 0]).is_err());
    }

    #[test]
    fn test_global_messages() {
        let request = GlobalMessage::Request {
            name: "keepalive@openssh.com".into(),
            want_reply: true,
            data: vec![],
        };
        assert_eq!(GlobalMessage::from_bytes(&request.to_bytes()).unwrap(), request);
        assert_eq!(GlobalMessage::Failure.to_bytes(), vec![82]);
    }

    #[test]
    fn test_terminal_modes_end() {
        let mut modes = encode_terminal_modes(&[(1, 3)]);
        modes.extend_from_slice(&[53, 0, 0, 0, 1]);
        // Anything after TTY_OP_END is ignored
        assert_eq!(decode_terminal_modes(&modes).unwrap(), vec![(1, 3)]);
    }
}
