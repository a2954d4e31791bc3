//! SSH-2 secure session transport.
//!
//! This module implements the transport layer (RFC 4253) and the connection
//! protocol's channel multiplexing (RFC 4254).
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Packet Layer** ([`packet`], [`crypto`]) - Binary packet protocol and
//!    packet protection
//! 2. **Transport Layer** ([`transport`], [`kex`], [`kex_dh`]) - Identification,
//!    algorithm negotiation, key exchange, re-keying and services
//! 3. **I/O Driver** ([`driver`]) - One reactor task per connection owning the
//!    transport engine and the socket
//! 4. **Connection Layer** ([`connection`], [`multiplexer`], [`channel`],
//!    [`stream`]) - Channels, flow control windows, global requests and the
//!    byte-stream adapter
//! 5. **Client/Server APIs** ([`client`], [`server`], [`connection_mgr`])
//!
//! # Security Considerations
//!
//! - **Input Validation**: Packet lengths are bounded before any allocation
//! - **Constant-Time Operations**: MAC comparison goes through [`subtle`]
//! - **Memory Safety**: Secrets are zeroized on drop using [`zeroize`]
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::Packet;
//!
//! // Create a packet
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec()).unwrap();
//!
//! // Serialize to wire format
//! let bytes = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod cache;
pub mod channel;
pub mod client;
pub mod connection;
pub mod connection_mgr;
pub mod crypto;
pub mod data_window;
pub mod driver;
pub mod future;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod multiplexer;
pub mod packet;
pub mod server;
pub mod stream;
pub mod transport;
pub mod version;
mod wire;

// Re-export main types
pub use cache::CachingBuffer;
pub use channel::{
    Channel, ChannelConfig, ChannelEventListener, ChannelHandler, ChannelOpenError, ChannelState,
    DefaultChannelHandler,
};
pub use client::{SshClient, SshClientConfig};
pub use connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelSuccess, ChannelWindowAdjust, GlobalRequest, MAX_PACKET_SIZE, MAX_WINDOW_SIZE,
};
pub use connection_mgr::{
    ConnectionEvent, ConnectionListener, ConnectionManager, DisconnectInfo, SshConnection,
};
pub use crypto::{CipherAlgorithm, MacAlgorithm, PacketOpener, PacketSealer};
pub use data_window::DataWindow;
pub use driver::{is_driver_task, DriverCommand, OutboundQueue};
pub use future::RequestFuture;
pub use hostkey::{
    AcceptAnyHostKey, EcdsaP256HostKey, Ed25519HostKey, FingerprintVerifier, HostKey,
    HostKeyAlgorithm, HostKeyVerifier, RejectAllHostKeys,
};
pub use kex::{
    AlgorithmPreferences, KexInit, KexRegistry, KeyExchange, NegotiatedAlgorithms, NewKeys,
};
pub use kex_dh::{Curve25519Kex, DhGroup14Kex};
pub use message::{DisconnectReason, MessageType};
pub use multiplexer::{ChannelFactory, GlobalRequestHandler, GlobalRequestResult, Multiplexer};
pub use packet::Packet;
pub use server::{SshServer, SshServerConfig};
pub use stream::ChannelStream;
pub use transport::{Role, State, TransportConfig, TransportEngine, TransportEvent};
pub use version::Version;
