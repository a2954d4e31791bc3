//! SSH Transport Layer engine (RFC 4253).
//!
//! [`TransportEngine`] is a sans-I/O state machine. The I/O driver feeds it
//! received bytes, drains [`TransportEvent`]s and writes whatever
//! [`take_output`](TransportEngine::take_output) returns. The engine never
//! touches a socket or a clock of its own.
//!
//! # Transport States
//!
//! ```text
//! AwaitingIdentification -> KeyExchangeInit -> KeyExchangeInProgress -> Keyed -> ServiceActive
//!                                 ^                                        |          |
//!                                 +------------------ rekey ---------------+----------+
//! ```
//!
//! A re-key returns to the state it left. `Disconnecting` and `Disconnected`
//! are reachable from every state.
//!
//! # Rekeying
//!
//! A new exchange starts on [`request_rekey`](TransportEngine::request_rekey),
//! on a peer KEXINIT, or when [`needs_rekey`](TransportEngine::needs_rekey)
//! reports that the byte (1 GB) or time (1 hour) limit has been reached. The
//! session identifier never changes.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::transport::{State, TransportConfig, TransportEngine};
//! use std::sync::Arc;
//! use strand_proto::ssh::hostkey::AcceptAnyHostKey;
//!
//! let mut engine = TransportEngine::client(
//!     TransportConfig::default(),
//!     Arc::new(AcceptAnyHostKey),
//!     "example.com",
//! ).unwrap();
//! engine.start();
//!
//! assert_eq!(engine.state(), State::AwaitingIdentification);
//! let ident = engine.take_output();
//! assert!(ident[0].data.starts_with(b"SSH-2.0-"));
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use strand_platform::{StrandError, StrandResult};
use tracing::{debug, info, trace, warn};

use super::crypto::{CipherAlgorithm, DirectionKeys, MacAlgorithm, PacketOpener, PacketSealer};
use super::driver::SentNotifier;
use super::hostkey::{fingerprint, key_algorithm, verify_signature, HostKey, HostKeyVerifier};
use super::kex::{
    AlgorithmPreferences, KexContext, KexInit, KexRegistry, KeyExchange, NegotiatedAlgorithms,
    NewKeys,
};
use super::message::{
    is_connection_message, is_kex_message, is_kex_method_message, message_name,
    parse_service_message, parse_unimplemented, service_message, unimplemented_message,
    DebugMessage, DisconnectMessage, DisconnectReason, MessageType,
};
use super::packet::MAX_PACKET_LENGTH;
use super::version::{IdentificationReader, Version};

/// Smallest `max_packet_length` accepted (RFC 4253 Section 6.1).
pub const MIN_PACKET_LENGTH_LIMIT: usize = 35_000;

/// Service started by clients once the first key exchange completes.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// SSH transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Identification lines are being exchanged.
    AwaitingIdentification,

    /// KEXINIT sent or awaited.
    KeyExchangeInit,

    /// Key exchange method running.
    KeyExchangeInProgress,

    /// Keys in place, no service active yet.
    Keyed,

    /// A service is running on top of the transport.
    ServiceActive,

    /// DISCONNECT sent; no further messages are accepted.
    Disconnecting,

    /// Peer disconnected or the connection is gone.
    Disconnected,
}

/// Which side of the connection the engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator.
    Client,
    /// Responder.
    Server,
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification.
    pub version: Version,

    /// Algorithm preferences advertised in KEXINIT.
    pub preferences: AlgorithmPreferences,

    /// Bytes in both directions before an automatic rekey (default: 1 GB).
    pub rekey_bytes_limit: u64,

    /// Time before an automatic rekey (default: 1 hour).
    pub rekey_time_limit: Duration,

    /// Largest `packet_length` accepted from the peer.
    pub max_packet_length: usize,

    /// Services a server accepts.
    pub services: Vec<String>,

    /// Server only: offer only the first mutually supported algorithm per
    /// category so the server's order decides the outcome.
    pub force_server_preferences: bool,

    /// Interval for SSH_MSG_IGNORE keepalives, `None` to disable.
    pub keepalive_interval: Option<Duration>,
}

impl TransportConfig {
    /// Creates the default configuration.
    ///
    /// # Example
    ///
    /// ```rust
    /// use strand_proto::ssh::transport::TransportConfig;
    ///
    /// let config = TransportConfig::new();
    /// assert_eq!(config.rekey_bytes_limit, 1_000_000_000);
    /// ```
    pub fn new() -> Self {
        Self {
            version: Version::default_strand(),
            preferences: AlgorithmPreferences::default(),
            rekey_bytes_limit: 1_000_000_000,
            rekey_time_limit: Duration::from_secs(3600),
            max_packet_length: MAX_PACKET_LENGTH,
            services: vec![CONNECTION_SERVICE.to_string()],
            force_server_preferences: false,
            keepalive_interval: None,
        }
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> StrandResult<()> {
        let prefs = &self.preferences;
        for (what, list) in [
            ("kex", &prefs.kex),
            ("host key", &prefs.host_key),
            ("cipher", &prefs.cipher),
            ("compression", &prefs.compression),
        ] {
            if list.is_empty() {
                return Err(StrandError::Config(format!(
                    "At least one {} algorithm must be configured",
                    what
                )));
            }
        }
        if prefs.cipher.iter().any(|c| CipherAlgorithm::from_name(c).is_none()) {
            return Err(StrandError::Config(format!(
                "Unsupported cipher in {:?}",
                prefs.cipher
            )));
        }
        if prefs.mac.iter().any(|m| MacAlgorithm::from_name(m).is_none()) {
            return Err(StrandError::Config(format!("Unsupported MAC in {:?}", prefs.mac)));
        }
        if let Some(name) = prefs.compression.iter().find(|c| c.as_str() != "none") {
            return Err(StrandError::Config(format!(
                "Unsupported compression algorithm: {}",
                name
            )));
        }
        if self.max_packet_length < MIN_PACKET_LENGTH_LIMIT {
            return Err(StrandError::Config(format!(
                "max_packet_length {} is below the minimum of {}",
                self.max_packet_length, MIN_PACKET_LENGTH_LIMIT
            )));
        }
        if self.rekey_bytes_limit == 0 || self.rekey_time_limit.is_zero() {
            return Err(StrandError::Config(
                "Rekey limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Something the driver must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The server host key was accepted (client only).
    HostKeyAccepted {
        /// `SHA256:` fingerprint of the key.
        fingerprint: String,
    },
    /// The server host key was rejected (client only).
    HostKeyRejected {
        /// `SHA256:` fingerprint of the key.
        fingerprint: String,
    },
    /// Both NEWKEYS have been exchanged.
    KeysExchanged {
        /// True for the first exchange of the connection.
        first: bool,
    },
    /// A service became active.
    ServiceStarted(String),
    /// A connection-layer message for the active service.
    Message(Vec<u8>),
    /// The peer sent DISCONNECT.
    Disconnected {
        /// Reason code.
        code: u32,
        /// Description.
        description: String,
    },
}

/// Bytes ready for the socket.
#[derive(Debug)]
pub struct OutboundChunk {
    /// Wire bytes.
    pub data: Vec<u8>,
    /// Completed once `data` has been written.
    pub sent: Option<SentNotifier>,
}

/// Exchange state that exists only between KEXINIT and NEWKEYS.
struct Exchange {
    local_kexinit: Option<Vec<u8>>,
    remote_kexinit: Option<Vec<u8>>,
    method: Option<Box<dyn KeyExchange>>,
    pending_opener: Option<PacketOpener>,
    ignore_next_kex_packet: bool,
    completed: bool,
    newkeys_sent: bool,
    newkeys_received: bool,
}

impl Exchange {
    fn new() -> Self {
        Self {
            local_kexinit: None,
            remote_kexinit: None,
            method: None,
            pending_opener: None,
            ignore_next_kex_packet: false,
            completed: false,
            newkeys_sent: false,
            newkeys_received: false,
        }
    }
}

/// Sans-I/O SSH transport.
pub struct TransportEngine {
    role: Role,
    config: TransportConfig,
    state: State,
    resume_state: State,
    registry: KexRegistry,
    host_keys: Vec<Arc<dyn HostKey>>,
    verifier: Option<Arc<dyn HostKeyVerifier>>,
    host_label: String,
    local_ident: String,
    remote_ident: Option<String>,
    ident_reader: IdentificationReader,
    ident_sent: bool,
    inbuf: BytesMut,
    sealer: PacketSealer,
    opener: PacketOpener,
    send_seq: u32,
    recv_seq: u32,
    session_id: Option<Vec<u8>>,
    last_exchange_hash: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    first_kex_done: bool,
    exchange: Option<Exchange>,
    held: VecDeque<(Vec<u8>, Option<SentNotifier>)>,
    output: Vec<OutboundChunk>,
    events: VecDeque<TransportEvent>,
    pending_service: Option<String>,
    active_service: Option<String>,
    bytes_since_kex: u64,
    last_kex: Instant,
}

impl TransportEngine {
    fn new(role: Role, config: TransportConfig) -> StrandResult<Self> {
        config.validate()?;
        let local_ident = config.version.to_string();
        Ok(Self {
            role,
            state: State::AwaitingIdentification,
            resume_state: State::Keyed,
            registry: KexRegistry::default(),
            host_keys: Vec::new(),
            verifier: None,
            host_label: String::new(),
            local_ident,
            remote_ident: None,
            ident_reader: IdentificationReader::new(role == Role::Client),
            ident_sent: false,
            inbuf: BytesMut::new(),
            sealer: PacketSealer::clear(),
            opener: PacketOpener::clear(),
            send_seq: 0,
            recv_seq: 0,
            session_id: None,
            last_exchange_hash: None,
            negotiated: None,
            first_kex_done: false,
            exchange: None,
            held: VecDeque::new(),
            output: Vec::new(),
            events: VecDeque::new(),
            pending_service: None,
            active_service: None,
            bytes_since_kex: 0,
            last_kex: Instant::now(),
            config,
        })
    }

    /// Creates a client engine. `host_label` is what the verifier is asked
    /// about (see [`host_label`](super::hostkey::host_label)).
    pub fn client(
        config: TransportConfig,
        verifier: Arc<dyn HostKeyVerifier>,
        host_label: impl Into<String>,
    ) -> StrandResult<Self> {
        let mut engine = Self::new(Role::Client, config)?;
        engine.verifier = Some(verifier);
        engine.host_label = host_label.into();
        Ok(engine)
    }

    /// Creates a server engine signing with `host_keys`.
    pub fn server(config: TransportConfig, host_keys: Vec<Arc<dyn HostKey>>) -> StrandResult<Self> {
        if host_keys.is_empty() {
            return Err(StrandError::Config("A server needs at least one host key".to_string()));
        }
        let mut engine = Self::new(Role::Server, config)?;
        engine.host_keys = host_keys;
        if engine.offered_host_keys().is_empty() {
            return Err(StrandError::Config(
                "No configured host key matches the host key preferences".to_string(),
            ));
        }
        Ok(engine)
    }

    /// Replaces the key exchange registry.
    pub fn with_kex_registry(mut self, registry: KexRegistry) -> Self {
        self.registry = registry;
        self
    }

    // ---- accessors ----

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Session identifier, fixed by the first exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Exchange hash of the most recent exchange.
    pub fn last_exchange_hash(&self) -> Option<&[u8]> {
        self.last_exchange_hash.as_deref()
    }

    /// Our identification without CR LF.
    pub fn local_identification(&self) -> &str {
        &self.local_ident
    }

    /// Peer identification without CR LF.
    pub fn remote_identification(&self) -> Option<&str> {
        self.remote_ident.as_deref()
    }

    /// Algorithms of the most recent negotiation.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Active service name.
    pub fn active_service(&self) -> Option<&str> {
        self.active_service.as_deref()
    }

    /// True once the first exchange has completed.
    pub fn is_first_kex_complete(&self) -> bool {
        self.first_kex_done
    }

    /// True while a key exchange is running.
    pub fn is_kex_in_progress(&self) -> bool {
        self.exchange.is_some()
    }

    /// Sequence number of the next packet sent.
    pub fn send_sequence(&self) -> u32 {
        self.send_seq
    }

    /// Sequence number of the next packet received.
    pub fn recv_sequence(&self) -> u32 {
        self.recv_seq
    }

    /// Messages held until the running exchange finishes.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// True once DISCONNECT has been sent or received.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Disconnecting | State::Disconnected)
    }

    // ---- state machine ----

    /// Transitions to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] for transitions the state machine
    /// does not allow.
    pub fn transition(&mut self, next: State) -> StrandResult<()> {
        let valid = match (self.state, next) {
            (State::AwaitingIdentification, State::KeyExchangeInit) => true,
            (State::KeyExchangeInit, State::KeyExchangeInProgress) => true,
            (State::KeyExchangeInProgress, State::Keyed) => true,
            (State::KeyExchangeInProgress, State::ServiceActive) => self.first_kex_done,
            (State::Keyed, State::ServiceActive) => true,
            // Rekey
            (State::Keyed | State::ServiceActive, State::KeyExchangeInit) => true,
            (State::Disconnected, _) => false,
            (_, State::Disconnecting | State::Disconnected) => true,
            (s1, s2) if s1 == s2 => true,
            _ => false,
        };

        if !valid {
            return Err(StrandError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }

        trace!(from = ?self.state, to = ?next, "Transport state");
        self.state = next;
        Ok(())
    }

    // ---- output ----

    /// Queues our identification line. Call once before feeding data.
    pub fn start(&mut self) {
        if self.ident_sent {
            return;
        }
        self.ident_sent = true;
        self.output.push(OutboundChunk {
            data: self.config.version.to_wire_format(),
            sent: None,
        });
        debug!(ident = %self.local_ident, "Sent identification");
    }

    /// Takes everything ready for the socket, in wire order.
    pub fn take_output(&mut self) -> Vec<OutboundChunk> {
        std::mem::take(&mut self.output)
    }

    /// Next pending event.
    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn write_packet(&mut self, payload: Vec<u8>, sent: Option<SentNotifier>) -> StrandResult<()> {
        let id = payload.first().copied().unwrap_or(0);
        let data = self.sealer.seal(self.send_seq, payload)?;
        trace!(seq = self.send_seq, message = %message_name(id), len = data.len(), "Sealed packet");
        self.send_seq = self.send_seq.wrapping_add(1);
        self.bytes_since_kex += data.len() as u64;
        self.output.push(OutboundChunk { data, sent });
        Ok(())
    }

    fn outbound_rekeying(&self) -> bool {
        match &self.exchange {
            Some(exchange) => !exchange.newkeys_sent,
            None => !self.first_kex_done,
        }
    }

    /// Queues a message payload.
    ///
    /// While a key exchange runs, everything except transport-generic and
    /// key exchange messages is held and sent after NEWKEYS.
    pub fn send_message(&mut self, payload: Vec<u8>, sent: Option<SentNotifier>) -> StrandResult<()> {
        if self.is_closed() {
            return Err(StrandError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Connection is closed",
            )));
        }
        let Some(&id) = payload.first() else {
            return Err(StrandError::Protocol("Empty message".to_string()));
        };

        let allowed_during_kex = (1..=4).contains(&id) || is_kex_message(id);
        if self.outbound_rekeying() && !allowed_during_kex {
            trace!(message = %message_name(id), "Holding message during key exchange");
            self.held.push_back((payload, sent));
            return Ok(());
        }
        self.write_packet(payload, sent)
    }

    fn flush_held(&mut self) -> StrandResult<()> {
        while let Some((payload, sent)) = self.held.pop_front() {
            self.write_packet(payload, sent)?;
        }
        Ok(())
    }

    /// Sends DISCONNECT and enters `Disconnecting`. Has no effect once closed.
    pub fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        if self.is_closed() {
            return;
        }
        info!(reason = ?reason, description, "Disconnecting");
        let payload = DisconnectMessage::new(reason, description).to_bytes();
        if let Err(e) = self.write_packet(payload, None) {
            debug!(error = %e, "DISCONNECT could not be sealed");
        }
        self.state = State::Disconnecting;
        self.held.clear();
    }

    /// Marks the transport as gone without sending anything.
    pub fn mark_disconnected(&mut self) {
        self.state = State::Disconnected;
        self.held.clear();
    }

    fn fatal(&mut self, reason: DisconnectReason, error: StrandError) -> StrandError {
        self.disconnect(reason, &error.to_string());
        error
    }

    // ---- rekey and services ----

    /// Starts a key re-exchange. Ignored while one is already running or
    /// before the first exchange.
    pub fn request_rekey(&mut self) -> StrandResult<()> {
        if !matches!(self.state, State::Keyed | State::ServiceActive) {
            return Ok(());
        }
        info!("Starting key re-exchange");
        self.begin_exchange()?;
        // The client already accepted the current algorithms; offering only
        // those keeps the server's earlier choice.
        let restricted = if self.decides_algorithms() {
            self.negotiated.as_ref().map(KexInit::restricted_to)
        } else {
            None
        };
        match restricted {
            Some(kexinit) => self.send_kexinit_message(kexinit),
            None => self.send_kexinit(),
        }
    }

    /// True when a byte or time limit calls for a re-key.
    pub fn needs_rekey(&self, now: Instant) -> bool {
        if !matches!(self.state, State::Keyed | State::ServiceActive) {
            return false;
        }
        self.bytes_since_kex >= self.config.rekey_bytes_limit
            || now.saturating_duration_since(self.last_kex) >= self.config.rekey_time_limit
    }

    /// Requests a service (client side). The matching SERVICE_ACCEPT emits
    /// [`TransportEvent::ServiceStarted`].
    pub fn request_service(&mut self, name: &str) -> StrandResult<()> {
        if !self.first_kex_done {
            return Err(StrandError::IllegalState(
                "Services can only be requested after the first key exchange".to_string(),
            ));
        }
        debug!(service = name, "Requesting service");
        self.pending_service = Some(name.to_string());
        self.send_message(service_message(MessageType::ServiceRequest, name), None)
    }

    // ---- input ----

    /// Processes received bytes.
    ///
    /// # Errors
    ///
    /// Any error is fatal: DISCONNECT with the matching reason has been
    /// queued and the engine is `Disconnecting`.
    pub fn feed(&mut self, data: &[u8]) -> StrandResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.inbuf.extend_from_slice(data);
        self.bytes_since_kex += data.len() as u64;

        self.process_input().map_err(|e| {
            if self.is_closed() {
                return e;
            }
            let reason = match &e {
                StrandError::Security(_) => DisconnectReason::MacError,
                StrandError::HostKeyRejected(_) => DisconnectReason::HostKeyNotVerifiable,
                _ => DisconnectReason::ProtocolError,
            };
            self.fatal(reason, e)
        })
    }

    fn process_input(&mut self) -> StrandResult<()> {
        if self.remote_ident.is_none() {
            let Some(line) = self.ident_reader.poll(&mut self.inbuf)? else {
                return Ok(());
            };
            Version::parse(&line).map_err(|e| {
                self.fatal(DisconnectReason::ProtocolVersionNotSupported, e)
            })?;
            debug!(ident = %line, "Received identification");
            self.remote_ident = Some(line);
            self.transition(State::KeyExchangeInit)?;
            self.exchange = Some(Exchange::new());
            if !self.decides_algorithms() {
                self.send_kexinit()?;
            }
        }

        while !self.is_closed() {
            let packet = self
                .opener
                .open(self.recv_seq, &mut self.inbuf, self.config.max_packet_length)?;
            let Some(payload) = packet else {
                break;
            };
            let seq = self.recv_seq;
            self.recv_seq = self.recv_seq.wrapping_add(1);
            self.dispatch(seq, payload)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, seq: u32, payload: Vec<u8>) -> StrandResult<()> {
        let Some(&id) = payload.first() else {
            return Err(StrandError::Protocol("Empty message".to_string()));
        };
        trace!(seq, message = %message_name(id), "Received packet");

        match MessageType::from_u8(id) {
            Some(MessageType::Disconnect) => {
                let msg = DisconnectMessage::from_bytes(&payload)?;
                info!(code = msg.reason_code, description = %msg.description, "Peer disconnected");
                self.mark_disconnected();
                self.events.push_back(TransportEvent::Disconnected {
                    code: msg.reason_code,
                    description: msg.description,
                });
                Ok(())
            }
            Some(MessageType::Ignore) => Ok(()),
            Some(MessageType::Debug) => {
                let msg = DebugMessage::from_bytes(&payload)?;
                debug!(message = %msg.message, "Peer debug message");
                Ok(())
            }
            Some(MessageType::Unimplemented) => {
                let rejected = parse_unimplemented(&payload)?;
                warn!(seq = rejected, "Peer did not implement a message we sent");
                Ok(())
            }
            Some(MessageType::KexInit) => self.handle_kexinit(payload),
            Some(MessageType::NewKeys) => self.handle_newkeys(&payload),
            _ if is_kex_method_message(id) => self.handle_kex_method(&payload),
            _ if !self.first_kex_done => Err(StrandError::Protocol(format!(
                "Unexpected {} before key exchange completed",
                message_name(id)
            ))),
            Some(MessageType::ServiceRequest) => self.handle_service_request(&payload),
            Some(MessageType::ServiceAccept) => self.handle_service_accept(&payload),
            _ if is_connection_message(id) => {
                if self.active_service.is_none() {
                    return Err(StrandError::Protocol(format!(
                        "Unexpected {} before the {} service started",
                        message_name(id),
                        CONNECTION_SERVICE
                    )));
                }
                self.events.push_back(TransportEvent::Message(payload));
                Ok(())
            }
            _ => {
                debug!(seq, message = %message_name(id), "Replying UNIMPLEMENTED");
                self.send_message(unimplemented_message(seq), None)
            }
        }
    }

    // ---- key exchange ----

    fn begin_exchange(&mut self) -> StrandResult<()> {
        self.resume_state = if self.first_kex_done {
            self.state
        } else {
            State::Keyed
        };
        if self.state != State::KeyExchangeInit {
            self.transition(State::KeyExchangeInit)?;
        }
        if self.exchange.is_none() {
            self.exchange = Some(Exchange::new());
        }
        Ok(())
    }

    fn offered_host_keys(&self) -> Vec<String> {
        self.config
            .preferences
            .host_key
            .iter()
            .filter(|name| self.host_keys.iter().any(|k| k.algorithm_name() == name.as_str()))
            .cloned()
            .collect()
    }

    fn local_kexinit(&self) -> KexInit {
        let mut prefs = self.config.preferences.clone();
        prefs.kex.retain(|name| self.registry.contains(name));
        if self.role == Role::Server {
            prefs.host_key = self.offered_host_keys();
        }
        KexInit::from_preferences(&prefs)
    }

    /// Server forcing its own preferences: KEXINIT waits for the client's
    /// and offers only the algorithms chosen from it.
    fn decides_algorithms(&self) -> bool {
        self.role == Role::Server && self.config.force_server_preferences
    }

    fn send_kexinit(&mut self) -> StrandResult<()> {
        let kexinit = self.local_kexinit();
        self.send_kexinit_message(kexinit)
    }

    fn send_kexinit_message(&mut self, kexinit: KexInit) -> StrandResult<()> {
        let payload = kexinit.to_bytes();
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.local_kexinit = Some(payload.clone());
        }
        debug!(kex = ?kexinit.kex_algorithms(), "Sending KEXINIT");
        self.write_packet(payload, None)
    }

    fn handle_kexinit(&mut self, payload: Vec<u8>) -> StrandResult<()> {
        match self.state {
            State::Keyed | State::ServiceActive => {
                debug!("Peer started key re-exchange");
                self.begin_exchange()?;
                if !self.decides_algorithms() {
                    self.send_kexinit()?;
                }
            }
            State::KeyExchangeInit => {}
            other => {
                return Err(StrandError::Protocol(format!(
                    "Unexpected KEXINIT in state {:?}",
                    other
                )))
            }
        }

        let remote = KexInit::from_bytes(&payload)?;
        let Some(exchange) = self.exchange.as_mut() else {
            return Err(StrandError::Protocol("KEXINIT outside key exchange".to_string()));
        };
        if exchange.remote_kexinit.is_some() {
            return Err(StrandError::Protocol("Duplicate KEXINIT".to_string()));
        }
        exchange.remote_kexinit = Some(payload);
        let is_client = self.role == Role::Client;

        if exchange.local_kexinit.is_none() {
            // Server deciding the outcome: our first choice the client supports
            let local = self.local_kexinit();
            let decided = NegotiatedAlgorithms::negotiate(&local, &remote, true)
                .map_err(|e| self.fatal(DisconnectReason::KeyExchangeFailed, e))?;
            self.send_kexinit_message(KexInit::restricted_to(&decided))?;
        }

        let local_bytes = self
            .exchange
            .as_ref()
            .and_then(|x| x.local_kexinit.clone())
            .unwrap_or_default();
        let local = KexInit::from_bytes(&local_bytes)?;
        let negotiated = NegotiatedAlgorithms::negotiate(&local, &remote, is_client)
            .map_err(|e| self.fatal(DisconnectReason::KeyExchangeFailed, e))?;
        info!(
            kex = %negotiated.kex,
            host_key = %negotiated.host_key,
            cipher_c2s = %negotiated.cipher_c2s,
            cipher_s2c = %negotiated.cipher_s2c,
            "Negotiated algorithms"
        );

        let mut method = self
            .registry
            .create(&negotiated.kex)
            .map_err(|e| self.fatal(DisconnectReason::KeyExchangeFailed, e))?;

        let host_key = if is_client {
            None
        } else {
            let key = self
                .host_keys
                .iter()
                .find(|k| k.algorithm_name() == negotiated.host_key)
                .cloned();
            if key.is_none() {
                return Err(self.fatal(
                    DisconnectReason::KeyExchangeFailed,
                    StrandError::Config(format!("No host key for {}", negotiated.host_key)),
                ));
            }
            key
        };

        let (client_kexinit, server_kexinit) = if is_client {
            (local_bytes, self.remote_kexinit_bytes())
        } else {
            (self.remote_kexinit_bytes(), local_bytes)
        };
        let (client_ident, server_ident) = {
            let remote = self.remote_ident.clone().unwrap_or_default().into_bytes();
            let local = self.local_ident.clone().into_bytes();
            if is_client {
                (local, remote)
            } else {
                (remote, local)
            }
        };

        let ctx = KexContext {
            is_client,
            client_ident,
            server_ident,
            client_kexinit,
            server_kexinit,
            negotiated: negotiated.clone(),
            host_key,
        };

        let mut out = Vec::new();
        method
            .init(ctx, &mut out)
            .map_err(|e| self.fatal(DisconnectReason::KeyExchangeFailed, e))?;

        if let Some(exchange) = self.exchange.as_mut() {
            exchange.ignore_next_kex_packet = negotiated.guess_was_wrong(&remote);
            exchange.method = Some(method);
        }
        self.negotiated = Some(negotiated);
        self.transition(State::KeyExchangeInProgress)?;

        for message in out {
            self.write_packet(message, None)?;
        }
        self.check_kex_complete()
    }

    fn remote_kexinit_bytes(&self) -> Vec<u8> {
        self.exchange
            .as_ref()
            .and_then(|x| x.remote_kexinit.clone())
            .unwrap_or_default()
    }

    fn handle_kex_method(&mut self, payload: &[u8]) -> StrandResult<()> {
        if self.state != State::KeyExchangeInProgress {
            return Err(StrandError::Protocol(format!(
                "Unexpected {} in state {:?}",
                message_name(payload[0]),
                self.state
            )));
        }
        let Some(exchange) = self.exchange.as_mut() else {
            return Err(StrandError::Protocol("No key exchange running".to_string()));
        };
        if exchange.ignore_next_kex_packet {
            exchange.ignore_next_kex_packet = false;
            debug!("Ignoring wrongly guessed key exchange packet");
            return Ok(());
        }
        let Some(method) = exchange.method.as_mut() else {
            return Err(StrandError::Protocol("No key exchange method".to_string()));
        };

        let mut out = Vec::new();
        let consumed = method
            .process(payload, &mut out)
            .map_err(|e| self.fatal(DisconnectReason::KeyExchangeFailed, e))?;
        if !consumed {
            return Err(StrandError::Protocol(format!(
                "Unexpected {} during key exchange",
                message_name(payload[0])
            )));
        }
        for message in out {
            self.write_packet(message, None)?;
        }
        self.check_kex_complete()
    }

    fn check_kex_complete(&mut self) -> StrandResult<()> {
        let done = self.exchange.as_ref().map_or(false, |x| {
            !x.completed && x.method.as_ref().map_or(false, |m| m.is_complete())
        });
        if done {
            self.complete_kex()?;
        }
        Ok(())
    }

    fn verify_server(&mut self, key_blob: &[u8], exchange_hash: &[u8], signature: &[u8]) -> StrandResult<()> {
        let expected = self
            .negotiated
            .as_ref()
            .map(|n| n.host_key.clone())
            .unwrap_or_default();
        let algorithm = key_algorithm(key_blob)?;
        if algorithm != expected {
            return Err(self.fatal(
                DisconnectReason::HostKeyNotVerifiable,
                StrandError::HostKeyRejected(format!(
                    "Host key algorithm {} does not match negotiated {}",
                    algorithm, expected
                )),
            ));
        }

        let fingerprint = fingerprint(key_blob);
        let accepted = self
            .verifier
            .as_ref()
            .map_or(false, |v| v.verify_host(&self.host_label, key_blob));
        if !accepted {
            warn!(host = %self.host_label, %fingerprint, "Host key rejected");
            self.events
                .push_back(TransportEvent::HostKeyRejected { fingerprint });
            return Err(self.fatal(
                DisconnectReason::HostKeyNotVerifiable,
                StrandError::HostKeyRejected("Host key not accepted".to_string()),
            ));
        }

        if !verify_signature(key_blob, exchange_hash, signature)? {
            return Err(self.fatal(
                DisconnectReason::HostKeyNotVerifiable,
                StrandError::HostKeyRejected("Invalid host key signature".to_string()),
            ));
        }
        debug!(host = %self.host_label, %fingerprint, "Host key accepted");
        self.events
            .push_back(TransportEvent::HostKeyAccepted { fingerprint });
        Ok(())
    }

    fn complete_kex(&mut self) -> StrandResult<()> {
        let Some(mut exchange) = self.exchange.take() else {
            return Ok(());
        };
        let result = self.install_keys(&mut exchange);
        self.exchange = Some(exchange);
        result?;

        debug!("Sent NEWKEYS");
        self.flush_held()?;
        self.finish_exchange()
    }

    fn install_keys(&mut self, exchange: &mut Exchange) -> StrandResult<()> {
        let Some(method) = exchange.method.as_ref() else {
            return Err(StrandError::Protocol("No key exchange method".to_string()));
        };
        let exchange_hash = method
            .exchange_hash()
            .ok_or_else(|| StrandError::Protocol("Missing exchange hash".to_string()))?
            .to_vec();

        if self.role == Role::Client {
            let key_blob = method.host_key().unwrap_or_default().to_vec();
            let signature = method.signature().unwrap_or_default().to_vec();
            self.verify_server(&key_blob, &exchange_hash, &signature)?;
        }

        let session_id = self.session_id.get_or_insert_with(|| exchange_hash.clone()).clone();
        let negotiated = self.negotiated.clone().unwrap_or_default();

        let c2s = direction_keys(
            &**method,
            &session_id,
            &negotiated.cipher_c2s,
            &negotiated.mac_c2s,
            [b'A', b'C', b'E'],
        )?;
        let s2c = direction_keys(
            &**method,
            &session_id,
            &negotiated.cipher_s2c,
            &negotiated.mac_s2c,
            [b'B', b'D', b'F'],
        )?;
        let (outbound, inbound) = match self.role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };

        let sealer = PacketSealer::new(&outbound)?;
        exchange.pending_opener = Some(PacketOpener::new(&inbound)?);
        exchange.completed = true;
        self.last_exchange_hash = Some(exchange_hash);

        // NEWKEYS itself goes out under the old keys
        self.write_packet(NewKeys::new().to_bytes(), None)?;
        exchange.newkeys_sent = true;
        self.sealer = sealer;
        Ok(())
    }

    fn handle_newkeys(&mut self, payload: &[u8]) -> StrandResult<()> {
        NewKeys::from_bytes(payload)?;
        let Some(exchange) = self.exchange.as_mut() else {
            return Err(StrandError::Protocol(
                "NEWKEYS received outside key exchange".to_string(),
            ));
        };
        if !exchange.completed {
            return Err(StrandError::Protocol(
                "NEWKEYS received before key exchange completed".to_string(),
            ));
        }
        if let Some(opener) = exchange.pending_opener.take() {
            self.opener = opener;
        }
        exchange.newkeys_received = true;
        debug!("Received NEWKEYS");
        self.finish_exchange()
    }

    fn finish_exchange(&mut self) -> StrandResult<()> {
        let done = self
            .exchange
            .as_ref()
            .map_or(false, |x| x.newkeys_sent && x.newkeys_received);
        if !done {
            return Ok(());
        }

        self.exchange = None;
        let first = !self.first_kex_done;
        self.first_kex_done = true;
        self.bytes_since_kex = 0;
        self.last_kex = Instant::now();
        let next = self.resume_state;
        self.transition(next)?;
        info!(first, "Key exchange complete");
        self.events.push_back(TransportEvent::KeysExchanged { first });
        Ok(())
    }

    // ---- services ----

    fn activate_service(&mut self, name: String) -> StrandResult<()> {
        info!(service = %name, "Service started");
        self.active_service = Some(name.clone());
        if self.exchange.is_some() {
            self.resume_state = State::ServiceActive;
        } else {
            self.transition(State::ServiceActive)?;
        }
        self.events.push_back(TransportEvent::ServiceStarted(name));
        Ok(())
    }

    fn handle_service_request(&mut self, payload: &[u8]) -> StrandResult<()> {
        let name = parse_service_message(payload, MessageType::ServiceRequest)?;
        if self.role != Role::Server || !self.config.services.contains(&name) {
            return Err(self.fatal(
                DisconnectReason::ServiceNotAvailable,
                StrandError::Protocol(format!("Service not available: {}", name)),
            ));
        }
        self.send_message(service_message(MessageType::ServiceAccept, &name), None)?;
        self.activate_service(name)
    }

    fn handle_service_accept(&mut self, payload: &[u8]) -> StrandResult<()> {
        let name = parse_service_message(payload, MessageType::ServiceAccept)?;
        match self.pending_service.take() {
            Some(pending) if pending == name => self.activate_service(name),
            other => {
                warn!(service = %name, pending = ?other, "Ignoring unexpected SERVICE_ACCEPT");
                self.pending_service = other;
                Ok(())
            }
        }
    }
}

fn direction_keys(
    method: &dyn KeyExchange,
    session_id: &[u8],
    cipher: &str,
    mac: &str,
    letters: [u8; 3],
) -> StrandResult<DirectionKeys> {
    let algorithm = CipherAlgorithm::from_name(cipher)
        .ok_or_else(|| StrandError::Protocol(format!("Unsupported cipher: {}", cipher)))?;
    let mac_len = if algorithm.is_aead() || mac == "none" {
        0
    } else {
        MacAlgorithm::from_name(mac)
            .ok_or_else(|| StrandError::Protocol(format!("Unsupported MAC: {}", mac)))?
            .key_size()
    };
    let derive = |letter: u8, len: usize| {
        if len == 0 {
            Ok(Vec::new())
        } else {
            method.derive_key(session_id, letter, len)
        }
    };

    Ok(DirectionKeys {
        cipher: cipher.to_string(),
        mac: mac.to_string(),
        iv: derive(letters[0], algorithm.iv_size())?,
        key: derive(letters[1], algorithm.key_size())?,
        mac_key: derive(letters[2], mac_len)?,
    })
}

impl fmt::Debug for TransportEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEngine")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("remote_ident", &self.remote_ident)
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .field("active_service", &self.active_service)
            .finish_non_exhaustive()
    }
}
