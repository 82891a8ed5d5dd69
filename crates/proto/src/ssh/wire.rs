//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Readers and writers for `byte`, `boolean`, `uint32`, `string`, `mpint` and
//! `name-list`. Every message codec in this crate is built on these.

use bytes::{BufMut, BytesMut};
use conch_platform::{ConchError, ConchResult};
use num_bigint::BigUint;

/// Cursor over an SSH-encoded message body.
///
/// Every read is bounds-checked and fails with a protocol error instead of
/// panicking on truncated input.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current offset into the underlying buffer.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns the unread tail without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    fn take(&mut self, len: usize, what: &str) -> ConchResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ConchError::Protocol(format!(
                "Truncated {} at offset {}: need {} bytes, have {}",
                what,
                self.offset,
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> ConchResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a boolean (any non-zero byte is true).
    pub fn read_bool(&mut self) -> ConchResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> ConchResult<u32> {
        let b = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> ConchResult<&'a [u8]> {
        self.take(len, "raw bytes")
    }

    /// Reads a length-prefixed byte string.
    pub fn read_string(&mut self) -> ConchResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_utf8(&mut self) -> ConchResult<String> {
        let bytes = self.read_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ConchError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads a non-negative multiple precision integer.
    pub fn read_mpint(&mut self) -> ConchResult<BigUint> {
        let bytes = self.read_string()?;
        if let Some(&first) = bytes.first() {
            if first & 0x80 != 0 {
                return Err(ConchError::Protocol(
                    "Negative mpint where a positive value is required".to_string(),
                ));
            }
        }
        Ok(BigUint::from_bytes_be(bytes))
    }

    /// Reads a comma-separated name-list.
    pub fn read_name_list(&mut self) -> ConchResult<Vec<String>> {
        let list = self.read_utf8()?;
        if list.is_empty() {
            return Ok(Vec::new());
        }
        Ok(list.split(',').map(str::to_string).collect())
    }
}

/// SSH encodings on top of [`BufMut`].
pub trait SshBufMut: BufMut {
    /// Writes a boolean as a single byte.
    fn put_ssh_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Writes a length-prefixed byte string.
    fn put_ssh_string(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.put_slice(value);
    }

    /// Writes an mpint (two's complement, minimal, leading zero if the high bit is set).
    fn put_mpint(&mut self, value: &BigUint) {
        if value.bits() == 0 {
            self.put_u32(0);
            return;
        }
        let bytes = value.to_bytes_be();
        if bytes[0] & 0x80 != 0 {
            self.put_u32(bytes.len() as u32 + 1);
            self.put_u8(0);
        } else {
            self.put_u32(bytes.len() as u32);
        }
        self.put_slice(&bytes);
    }

    /// Writes a comma-separated name-list.
    fn put_name_list<S: AsRef<str>>(&mut self, names: &[S]) {
        let joined = names
            .iter()
            .map(|n| n.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        self.put_ssh_string(joined.as_bytes());
    }
}

impl<B: BufMut> SshBufMut for B {}

/// Starts a message payload with its type byte.
pub fn message(msg_type: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(msg_type);
    buf
}

/// Encodes an mpint as a standalone buffer.
pub fn mpint_bytes(value: &BigUint) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_mpint(value);
    buf
}
