//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Every message codec in this crate writes through the `write_*` helpers and
//! reads through [`WireReader`], which tracks an offset into the payload and
//! reports truncation as a protocol error.

use bytes::{BufMut, BytesMut};
use strand_platform::{StrandError, StrandResult};

/// Writes an SSH `string` from UTF-8 text.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Writes an SSH `string` from raw bytes.
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes an SSH `name-list`.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    write_string(buf, &names.join(","));
}

/// Writes an SSH `boolean`.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Encodes a big-endian unsigned magnitude as an SSH `mpint`.
///
/// Leading zero bytes are stripped and a zero byte is prepended when the
/// high bit is set, so the value is never read back as negative.
pub fn encode_mpint(value: &[u8]) -> Vec<u8> {
    let start = value.iter().position(|&b| b != 0).unwrap_or(value.len());
    let trimmed = &value[start..];

    let mut out = Vec::with_capacity(trimmed.len() + 5);
    if trimmed.is_empty() {
        out.extend_from_slice(&0u32.to_be_bytes());
        return out;
    }

    let pad = trimmed[0] & 0x80 != 0;
    let len = trimmed.len() + usize::from(pad);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Cursor over an SSH message payload.
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

    /// Creates a reader that first checks the message id byte.
    pub fn for_message(data: &'a [u8], expected: u8, name: &str) -> StrandResult<Self> {
        match data.first() {
            None => Err(StrandError::Protocol(format!("{} message is empty", name))),
            Some(&id) if id != expected => Err(StrandError::Protocol(format!(
                "Invalid message type: expected {} ({}), got {}",
                expected, name, id
            ))),
            Some(_) => Ok(Self { data, offset: 1 }),
        }
    }

    /// Current offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns the unread tail and moves to the end.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }

    fn take(&mut self, len: usize, what: &str) -> StrandResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(StrandError::Protocol(format!(
                "Cannot read {} at offset {}",
                what, self.offset
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a `byte`.
    pub fn read_u8(&mut self) -> StrandResult<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a `boolean`.
    pub fn read_bool(&mut self) -> StrandResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `uint32`.
    pub fn read_u32(&mut self) -> StrandResult<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> StrandResult<&'a [u8]> {
        self.take(len, "raw bytes")
    }

    /// Reads an SSH `string` as raw bytes.
    pub fn read_bytes(&mut self) -> StrandResult<&'a [u8]> {
        let length = self.read_u32()? as usize;
        if self.remaining() < length {
            return Err(StrandError::Protocol(format!(
                "Data truncated: expected {} bytes at offset {}",
                length, self.offset
            )));
        }
        self.take(length, "string")
    }

    /// Reads an SSH `string` as UTF-8 text.
    pub fn read_string(&mut self) -> StrandResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StrandError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads an SSH `name-list`.
    pub fn read_name_list(&mut self) -> StrandResult<Vec<String>> {
        let s = self.read_string()?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        Ok(s.split(',').map(String::from).collect())
    }

    /// Reads an SSH `mpint` and returns its magnitude without sign padding.
    pub fn read_mpint(&mut self) -> StrandResult<&'a [u8]> {
        let raw = self.read_bytes()?;
        if raw.first().map_or(false, |b| b & 0x80 != 0) {
            return Err(StrandError::Protocol("Negative mpint".to_string()));
        }
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        Ok(&raw[start..])
    }
}
