//! SSH connection protocol messages (RFC 4254).
//!
//! Codecs for the channel and global request messages the multiplexer
//! exchanges. Type-specific data (channel open parameters, request
//! arguments) is carried as an opaque trailing payload; interpreting it is
//! left to channel handlers.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::connection::ChannelOpen;
//!
//! let open = ChannelOpen::new("session", 0, 1_024_000, 32_768, Vec::new());
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed.channel_type(), "session");
//! ```

use bytes::{BufMut, BytesMut};
use strand_platform::{StrandError, StrandResult};

use super::message::MessageType;
use super::wire::{write_bool, write_bytes, write_string, WireReader};

/// Maximum window size accepted in configuration (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum channel packet size accepted in configuration (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Returns the recipient channel of a channel message (ids 91-100).
pub fn recipient_channel(data: &[u8]) -> StrandResult<u32> {
    let mut r = WireReader::new(data);
    r.read_u8()?;
    r.read_u32()
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: String,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
    payload: Vec<u8>,
}

impl ChannelOpen {
    /// Creates a channel open message.
    pub fn new(
        channel_type: impl Into<String>,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            channel_type: channel_type.into(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            payload,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Returns the channel type specific data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes to bytes.
    ///
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        write_string(&mut buf, &self.channel_type);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 90, "SSH_MSG_CHANNEL_OPEN")?;
        Ok(Self {
            channel_type: r.read_string()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
            payload: r.read_rest().to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
    payload: Vec<u8>,
}

impl ChannelOpenConfirmation {
    /// Creates a confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
            payload,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Returns the channel type specific data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 91, "SSH_MSG_CHANNEL_OPEN_CONFIRMATION")?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
            payload: r.read_rest().to_vec(),
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: u32,
    description: String,
    language_tag: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the reason's default description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self::with_description(recipient_channel, reason, reason.as_str())
    }

    /// Creates a failure with a custom description.
    pub fn with_description(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: impl Into<String>,
    ) -> Self {
        Self::with_reason_code(recipient_channel, reason as u32, description)
    }

    /// Creates a failure with a raw reason code.
    pub fn with_reason_code(
        recipient_channel: u32,
        reason_code: u32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code,
            description: description.into(),
            language_tag: String::new(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the raw reason code. Peers may send codes outside RFC 4254.
    pub fn reason_code(&self) -> u32 {
        self.reason_code
    }

    /// Returns the reason, if it is a known code.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes. The language tag is optional.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 92, "SSH_MSG_CHANNEL_OPEN_FAILURE")?;
        let recipient_channel = r.read_u32()?;
        let reason_code = r.read_u32()?;
        let description = r.read_string()?;
        let language_tag = if r.remaining() > 0 {
            r.read_string()?
        } else {
            String::new()
        };

        Ok(Self {
            recipient_channel,
            reason_code,
            description,
            language_tag,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the number of bytes to add.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 93, "SSH_MSG_CHANNEL_WINDOW_ADJUST")?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            bytes_to_add: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encodes a data message directly from a borrowed slice.
    pub fn encode(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(recipient_channel);
        write_bytes(&mut buf, data);
        buf.to_vec()
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        Self::encode(self.recipient_channel, &self.data)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 94, "SSH_MSG_CHANNEL_DATA")?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data: r.read_bytes()?.to_vec(),
        })
    }
}

/// Extended data type codes (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExtendedDataType {
    /// Standard error
    Stderr = 1,
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: u32,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates an extended data message.
    pub fn new(recipient_channel: u32, data_type_code: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code.
    pub fn data_type_code(&self) -> u32 {
        self.data_type_code
    }

    /// Returns the data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encodes an extended data message directly from a borrowed slice.
    pub fn encode(recipient_channel: u32, data_type_code: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(recipient_channel);
        buf.put_u32(data_type_code);
        write_bytes(&mut buf, data);
        buf.to_vec()
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        Self::encode(self.recipient_channel, self.data_type_code, &self.data)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 95, "SSH_MSG_CHANNEL_EXTENDED_DATA")?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data_type_code: r.read_u32()?,
            data: r.read_bytes()?.to_vec(),
        })
    }
}

/// Encodes a message that carries only a recipient channel (EOF, CLOSE,
/// SUCCESS, FAILURE).
fn recipient_only(msg_type: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(msg_type as u8);
    buf.put_u32(recipient_channel);
    buf.to_vec()
}

macro_rules! recipient_only_message {
    ($(#[$doc:meta])* $name:ident, $msg_type:expr, $id:expr, $label:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            recipient_channel: u32,
        }

        impl $name {
            /// Creates the message.
            pub fn new(recipient_channel: u32) -> Self {
                Self { recipient_channel }
            }

            /// Returns the recipient channel number.
            pub fn recipient_channel(&self) -> u32 {
                self.recipient_channel
            }

            /// Serializes to bytes.
            pub fn to_bytes(&self) -> Vec<u8> {
                recipient_only($msg_type, self.recipient_channel)
            }

            /// Parses from bytes.
            pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
                let mut r = WireReader::for_message(data, $id, $label)?;
                Ok(Self {
                    recipient_channel: r.read_u32()?,
                })
            }
        }
    };
}

recipient_only_message!(
    /// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
    ChannelEof,
    MessageType::ChannelEof,
    96,
    "SSH_MSG_CHANNEL_EOF"
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
    ChannelClose,
    MessageType::ChannelClose,
    97,
    "SSH_MSG_CHANNEL_CLOSE"
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_SUCCESS message (RFC 4254 Section 5.4).
    ChannelSuccess,
    MessageType::ChannelSuccess,
    99,
    "SSH_MSG_CHANNEL_SUCCESS"
);

recipient_only_message!(
    /// SSH_MSG_CHANNEL_FAILURE message (RFC 4254 Section 5.4).
    ChannelFailure,
    MessageType::ChannelFailure,
    100,
    "SSH_MSG_CHANNEL_FAILURE"
);

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: String,
    want_reply: bool,
    payload: Vec<u8>,
}

impl ChannelRequest {
    /// Creates a channel request.
    pub fn new(
        recipient_channel: u32,
        request_type: impl Into<String>,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            recipient_channel,
            request_type: request_type.into(),
            want_reply,
            payload,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Returns the type specific data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        write_string(&mut buf, &self.request_type);
        write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 98, "SSH_MSG_CHANNEL_REQUEST")?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            request_type: r.read_string()?,
            want_reply: r.read_bool()?,
            payload: r.read_rest().to_vec(),
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    request_name: String,
    want_reply: bool,
    payload: Vec<u8>,
}

impl GlobalRequest {
    /// Creates a global request.
    pub fn new(request_name: impl Into<String>, want_reply: bool, payload: Vec<u8>) -> Self {
        Self {
            request_name: request_name.into(),
            want_reply,
            payload,
        }
    }

    /// Returns the request name.
    pub fn request_name(&self) -> &str {
        &self.request_name
    }

    /// Returns whether a reply is wanted.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Returns the request specific data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        write_string(&mut buf, &self.request_name);
        write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> StrandResult<Self> {
        let mut r = WireReader::for_message(data, 80, "SSH_MSG_GLOBAL_REQUEST")?;
        Ok(Self {
            request_name: r.read_string()?,
            want_reply: r.read_bool()?,
            payload: r.read_rest().to_vec(),
        })
    }
}

/// Encodes SSH_MSG_REQUEST_SUCCESS with optional response data.
pub fn request_success(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(MessageType::RequestSuccess as u8);
    buf.extend_from_slice(payload);
    buf
}

/// Encodes SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

/// Validates the packet size a peer advertises in an open or confirmation.
pub fn check_remote_packet_size(maximum_packet_size: u32) -> StrandResult<()> {
    if maximum_packet_size == 0 {
        return Err(StrandError::Protocol(
            "Maximum packet size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_with_payload() {
        let open = ChannelOpen::new("direct-tcpip", 3, 2_097_152, 32_768, vec![0, 0, 0, 1, b'h']);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
        assert_eq!(parsed, open);
        assert_eq!(parsed.payload(), &[0, 0, 0, 1, b'h']);
    }

    #[test]
    fn test_channel_open_truncated() {
        let bytes = ChannelOpen::new("session", 0, 1, 1, vec![]).to_bytes();
        match ChannelOpen::from_bytes(&bytes[..bytes.len() - 2]) {
            Err(StrandError::Protocol(_)) => {}
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_open_confirmation() {
        let confirm = ChannelOpenConfirmation::new(0, 7, 1_024_000, 32_768, vec![]);
        let parsed = ChannelOpenConfirmation::from_bytes(&confirm.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 0);
        assert_eq!(parsed.sender_channel(), 7);
        assert_eq!(parsed.initial_window_size(), 1_024_000);
        assert_eq!(parsed.maximum_packet_size(), 32_768);
    }

    #[test]
    fn test_channel_open_failure() {
        let failure = ChannelOpenFailure::new(4, ChannelOpenFailureReason::UnknownChannelType);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 4);
        assert_eq!(parsed.reason(), Some(ChannelOpenFailureReason::UnknownChannelType));
        assert_eq!(parsed.description(), "unknown channel type");
    }

    #[test]
    fn test_channel_open_failure_without_language() {
        let mut bytes = vec![92, 0, 0, 0, 1, 0, 0, 0, 9];
        bytes.extend_from_slice(&[0, 0, 0, 2, b'n', b'o']);
        let parsed = ChannelOpenFailure::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.reason_code(), 9);
        assert_eq!(parsed.reason(), None);
        assert_eq!(parsed.description(), "no");
    }

    #[test]
    fn test_channel_data_encode() {
        let bytes = ChannelData::encode(5, b"Hello, SSH!");
        let parsed = ChannelData::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.recipient_channel(), 5);
        assert_eq!(parsed.data(), b"Hello, SSH!");
        assert_eq!(recipient_channel(&bytes).unwrap(), 5);
    }

    #[test]
    fn test_channel_extended_data() {
        let data = ChannelExtendedData::new(0, ExtendedDataType::Stderr as u32, b"Error!".to_vec());
        let parsed = ChannelExtendedData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(parsed.data_type_code(), 1);
        assert_eq!(parsed.data(), b"Error!");
    }

    #[test]
    fn test_recipient_only_messages() {
        assert_eq!(ChannelEof::new(2).to_bytes(), vec![96, 0, 0, 0, 2]);
        assert_eq!(ChannelClose::from_bytes(&[97, 0, 0, 1, 0]).unwrap().recipient_channel(), 256);
        assert!(ChannelSuccess::from_bytes(&[100, 0, 0, 0, 1]).is_err());
        assert_eq!(ChannelFailure::new(9).to_bytes()[0], 100);
    }

    #[test]
    fn test_channel_request() {
        let request = ChannelRequest::new(1, "exec", true, vec![0, 0, 0, 2, b'l', b's']);
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed.request_type(), "exec");
        assert!(parsed.want_reply());
        assert_eq!(parsed.payload().len(), 6);
    }

    #[test]
    fn test_global_request() {
        let request = GlobalRequest::new("keepalive@openssh.com", true, vec![]);
        let parsed = GlobalRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(request_success(&[1, 2]), vec![81, 1, 2]);
        assert_eq!(request_failure(), vec![82]);
    }

    #[test]
    fn test_remote_packet_size() {
        assert!(check_remote_packet_size(1).is_ok());
        assert!(check_remote_packet_size(0).is_err());
    }
}
