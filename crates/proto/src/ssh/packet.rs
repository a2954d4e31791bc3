//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac or authentication tag
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does not include `mac` or the length field itself
//! - `padding_length` is between 4 and 255 bytes
//! - The padded packet is a multiple of the cipher block size (8 without a
//!   cipher). AEAD ciphers leave the length field out of the alignment
//!   because it travels in clear.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::Packet;
//!
//! let payload = b"SSH-MSG-KEXINIT payload";
//! let packet = Packet::new(payload.to_vec()).unwrap();
//!
//! let bytes = packet.to_bytes();
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), payload);
//! ```

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use strand_platform::{StrandError, StrandResult};

/// Largest `packet_length` accepted by default.
///
/// Leaves room for a 256 KiB channel packet plus message framing.
pub const MAX_PACKET_LENGTH: usize = 256 * 1024 + 1024;

/// Minimum packet size in bytes, including the length field.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Block size used before any cipher is active.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

/// SSH binary packet.
///
/// # Invariants
///
/// - Padding length is between 4 and 255 bytes
/// - The packet is aligned to the block size it was built for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
    mac: Option<Vec<u8>>,
}

impl Packet {
    /// Creates a packet padded to the default 8-byte block size.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] if the payload exceeds
    /// [`MAX_PACKET_LENGTH`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use strand_proto::ssh::Packet;
    ///
    /// let packet = Packet::new(b"Hello, SSH!".to_vec()).unwrap();
    /// assert_eq!(packet.payload(), b"Hello, SSH!");
    /// ```
    pub fn new(payload: Vec<u8>) -> StrandResult<Self> {
        Self::with_alignment(payload, DEFAULT_BLOCK_SIZE, false)
    }

    /// Creates a packet padded to `block_size`.
    ///
    /// When `length_in_clear` is set the 4-byte length field is excluded from
    /// the alignment, as AEAD ciphers require.
    pub fn with_alignment(
        payload: Vec<u8>,
        block_size: usize,
        length_in_clear: bool,
    ) -> StrandResult<Self> {
        let block_size = block_size.max(DEFAULT_BLOCK_SIZE);
        let header_len = if length_in_clear { 1 } else { 5 };
        let unpadded_len = header_len + payload.len();

        let mut padding_len = MIN_PADDING_LEN as usize;
        while (unpadded_len + padding_len) % block_size != 0 {
            padding_len += 1;
        }

        let packet_length = 1 + payload.len() + padding_len;
        if packet_length > MAX_PACKET_LENGTH {
            return Err(StrandError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                packet_length, MAX_PACKET_LENGTH
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self {
            payload,
            padding,
            mac: None,
        })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet and returns its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Returns the MAC of this packet (if present).
    pub fn mac(&self) -> Option<&[u8]> {
        self.mac.as_deref()
    }

    /// Sets the MAC for this packet.
    pub fn set_mac(&mut self, mac: Vec<u8>) {
        self.mac = Some(mac);
    }

    /// Value of the `packet_length` field.
    pub fn packet_length(&self) -> usize {
        1 + self.payload.len() + self.padding.len()
    }

    /// Serializes this packet to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = self.packet_length();
        let mut buf =
            BytesMut::with_capacity(4 + packet_length + self.mac.as_ref().map_or(0, |m| m.len()));

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        if let Some(mac) = &self.mac {
            buf.put_slice(mac);
        }

        buf.to_vec()
    }

    /// Parses a plaintext packet from wire format.
    ///
    /// Bytes after the declared packet are taken as the MAC.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] if:
    /// - Data is too short (< 5 bytes for header)
    /// - Packet size exceeds [`MAX_PACKET_LENGTH`]
    /// - Padding length is invalid
    /// - Data length doesn't match declared packet_length
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        if data.len() < 5 {
            return Err(StrandError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        check_packet_length(packet_length, MAX_PACKET_LENGTH)?;

        if buf.len() < packet_length {
            return Err(StrandError::Protocol(format!(
                "Incomplete packet: expected {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let (payload, padding) = split_body(&buf[..packet_length])?;
        buf.advance(packet_length);

        let mac = if !buf.is_empty() {
            Some(buf.to_vec())
        } else {
            None
        };

        Ok(Self {
            payload,
            padding,
            mac,
        })
    }

    /// Extracts the payload from a decrypted packet body.
    ///
    /// `body` starts at the `padding_length` byte and ends after the padding.
    pub fn parse_body(body: &[u8]) -> StrandResult<Vec<u8>> {
        split_body(body).map(|(payload, _)| payload)
    }
}

/// Validates a received `packet_length` field.
pub fn check_packet_length(packet_length: usize, max: usize) -> StrandResult<()> {
    if packet_length > max {
        return Err(StrandError::Protocol(format!(
            "Packet too large: {} bytes (maximum {})",
            packet_length, max
        )));
    }
    if packet_length < 5 {
        return Err(StrandError::Protocol(format!(
            "Packet too small: {} bytes (minimum 5 for padding_length + min padding + payload)",
            packet_length
        )));
    }
    Ok(())
}

fn split_body(body: &[u8]) -> StrandResult<(Vec<u8>, Vec<u8>)> {
    let Some((&padding_length, rest)) = body.split_first() else {
        return Err(StrandError::Protocol("Empty packet body".to_string()));
    };
    let padding_length = padding_length as usize;

    if padding_length < MIN_PADDING_LEN as usize {
        return Err(StrandError::Protocol(format!(
            "Padding too short: {} bytes (minimum {})",
            padding_length, MIN_PADDING_LEN
        )));
    }

    if rest.len() < padding_length {
        return Err(StrandError::Protocol(format!(
            "Invalid packet: packet_length ({}) too small for padding_length field (1) + padding ({})",
            body.len(),
            padding_length
        )));
    }

    let payload_length = rest.len() - padding_length;
    Ok((
        rest[..payload_length].to_vec(),
        rest[payload_length..].to_vec(),
    ))
}
