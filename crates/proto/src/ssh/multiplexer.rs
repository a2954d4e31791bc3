//! Connection protocol multiplexer (RFC 4254).
//!
//! Owns the channel table of one connection, allocates local channel ids,
//! routes inbound connection-layer messages (80-100) and tracks outbound
//! global requests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use strand_platform::{StrandError, StrandResult};
use tracing::{debug, trace, warn};

use super::channel::{Channel, ChannelConfig, ChannelHandler, ChannelOpenError};
use super::connection::{
    check_remote_packet_size, recipient_channel, request_failure, request_success,
    ChannelExtendedData, ChannelData, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelOpenFailureReason, ChannelRequest, ChannelWindowAdjust, GlobalRequest,
};
use super::driver::OutboundQueue;
use super::future::RequestFuture;
use super::message::{message_name, MessageType};

/// Creates handlers for channels the peer opens.
pub trait ChannelFactory: Send + Sync {
    /// Returns a handler for `channel_type`, or the reason to refuse it.
    fn create(
        &self,
        channel_type: &str,
        payload: &[u8],
    ) -> Result<Arc<dyn ChannelHandler>, ChannelOpenError>;
}

/// Outcome of a global request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestResult {
    /// Accepted, with optional response data.
    Success(Vec<u8>),
    /// Refused.
    Failure,
}

/// Handles a named global request.
pub trait GlobalRequestHandler: Send + Sync {
    /// Processes the request.
    fn process(&self, name: &str, want_reply: bool, payload: &[u8]) -> GlobalRequestResult;
}

/// Channel table and connection-layer router.
pub struct Multiplexer {
    channels: DashMap<u32, Arc<Channel>>,
    next_id: AtomicU32,
    outbound: OutboundQueue,
    channel_config: ChannelConfig,
    factory: RwLock<Option<Arc<dyn ChannelFactory>>>,
    global_handlers: RwLock<HashMap<String, Arc<dyn GlobalRequestHandler>>>,
    global_requests: Mutex<VecDeque<RequestFuture>>,
    self_ref: Weak<Multiplexer>,
}

impl Multiplexer {
    /// Creates a multiplexer sending through `outbound`.
    pub fn new(outbound: OutboundQueue, channel_config: ChannelConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            channels: DashMap::new(),
            next_id: AtomicU32::new(0),
            outbound,
            channel_config,
            factory: RwLock::new(None),
            global_handlers: RwLock::new(HashMap::new()),
            global_requests: Mutex::new(VecDeque::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Sets the factory consulted for inbound channel opens.
    pub fn set_channel_factory(&self, factory: Arc<dyn ChannelFactory>) {
        *self.factory.write() = Some(factory);
    }

    /// Registers a global request handler by request name.
    pub fn register_global_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn GlobalRequestHandler>,
    ) {
        self.global_handlers.write().insert(name.into(), handler);
    }

    /// Configuration applied to new channels.
    pub fn channel_config(&self) -> &ChannelConfig {
        &self.channel_config
    }

    fn allocate(&self, channel_type: &str, handler: Arc<dyn ChannelHandler>) -> Arc<Channel> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(Channel::new(
            id,
            channel_type,
            self.channel_config.clone(),
            handler,
            self.self_ref.clone(),
            self.outbound.clone(),
        ));
        self.channels.insert(id, channel.clone());
        channel
    }

    /// Opens a channel of the handler's type. The returned channel's open
    /// future resolves when the peer confirms or refuses.
    pub fn open_channel(&self, handler: Arc<dyn ChannelHandler>) -> StrandResult<Arc<Channel>> {
        let channel_type = handler.channel_type().to_string();
        let channel = self.allocate(&channel_type, handler.clone());

        let payload = match handler.create_channel(&channel) {
            Ok(payload) => payload,
            Err(e) => {
                self.free_channel(channel.local_id());
                return Err(e);
            }
        };

        let open = ChannelOpen::new(
            channel_type.as_str(),
            channel.local_id(),
            self.channel_config.initial_window,
            self.channel_config.max_packet_size,
            payload,
        );
        if let Err(e) = self.outbound.send(open.to_bytes()) {
            self.free_channel(channel.local_id());
            return Err(e);
        }
        debug!(channel = channel.local_id(), channel_type = %channel_type, "Opening channel");
        Ok(channel)
    }

    /// Routes one connection-layer message.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] for malformed messages and window
    /// violations; both are fatal to the transport.
    pub fn handle_message(&self, payload: &[u8]) -> StrandResult<()> {
        let Some(&id) = payload.first() else {
            return Err(StrandError::Protocol("Empty message".to_string()));
        };
        let Some(kind) = MessageType::from_u8(id) else {
            warn!(message = id, "Discarding unsupported connection message");
            return Ok(());
        };

        match kind {
            MessageType::GlobalRequest => self.handle_global_request(payload),
            MessageType::RequestSuccess => {
                self.handle_global_reply(true, &payload[1..]);
                Ok(())
            }
            MessageType::RequestFailure => {
                self.handle_global_reply(false, &[]);
                Ok(())
            }
            MessageType::ChannelOpen => self.handle_channel_open(payload),
            _ => self.route_to_channel(kind, payload),
        }
    }

    fn route_to_channel(&self, kind: MessageType, payload: &[u8]) -> StrandResult<()> {
        let recipient = recipient_channel(payload)?;
        let Some(channel) = self.channel(recipient) else {
            warn!(
                channel = recipient,
                message = %message_name(payload[0]),
                "Discarding message for unknown channel"
            );
            return Ok(());
        };
        trace!(channel = recipient, message = kind.name(), "Routing channel message");

        match kind {
            MessageType::ChannelOpenConfirmation => {
                let confirm = ChannelOpenConfirmation::from_bytes(payload)?;
                check_remote_packet_size(confirm.maximum_packet_size())?;
                channel.confirm_open(Some(&confirm))?;
            }
            MessageType::ChannelOpenFailure => {
                let failure = ChannelOpenFailure::from_bytes(payload)?;
                if channel.remote_id().is_some() {
                    return Err(StrandError::Protocol(format!(
                        "Unexpected open failure for channel {}",
                        recipient
                    )));
                }
                channel.fail(&ChannelOpenError {
                    reason_code: failure.reason_code(),
                    description: failure.description().to_string(),
                });
            }
            MessageType::ChannelWindowAdjust => {
                let adjust = ChannelWindowAdjust::from_bytes(payload)?;
                channel.handle_window_adjust(adjust.bytes_to_add());
            }
            MessageType::ChannelData => {
                let data = ChannelData::from_bytes(payload)?;
                channel.handle_data(data.data())?;
            }
            MessageType::ChannelExtendedData => {
                let data = ChannelExtendedData::from_bytes(payload)?;
                channel.handle_extended_data(data.data_type_code(), data.data())?;
            }
            MessageType::ChannelEof => channel.handle_eof(),
            MessageType::ChannelClose => channel.handle_close(),
            MessageType::ChannelRequest => {
                let request = ChannelRequest::from_bytes(payload)?;
                channel.handle_request(
                    request.request_type(),
                    request.want_reply(),
                    request.payload(),
                )?;
            }
            MessageType::ChannelSuccess => channel.handle_request_reply(true),
            MessageType::ChannelFailure => channel.handle_request_reply(false),
            other => warn!(message = other.name(), "Discarding non-connection message"),
        }
        Ok(())
    }

    fn handle_channel_open(&self, payload: &[u8]) -> StrandResult<()> {
        let open = ChannelOpen::from_bytes(payload)?;
        check_remote_packet_size(open.maximum_packet_size())?;
        debug!(
            channel_type = open.channel_type(),
            remote = open.sender_channel(),
            "Peer opening channel"
        );

        let factory = self.factory.read().clone();
        let created = match factory {
            Some(factory) => factory.create(open.channel_type(), open.payload()),
            None => Err(ChannelOpenError::new(
                ChannelOpenFailureReason::UnknownChannelType,
            )),
        };

        let handler = match created {
            Ok(handler) => handler,
            Err(e) => {
                debug!(channel_type = open.channel_type(), error = %e, "Refusing channel open");
                let failure = ChannelOpenFailure::with_reason_code(
                    open.sender_channel(),
                    e.reason_code,
                    e.description,
                );
                return self.outbound.send(failure.to_bytes());
            }
        };

        let channel = self.allocate(open.channel_type(), handler);
        match channel.open(
            open.sender_channel(),
            open.maximum_packet_size(),
            open.initial_window_size(),
            open.payload(),
        ) {
            Ok(confirmation_payload) => {
                let confirm = ChannelOpenConfirmation::new(
                    open.sender_channel(),
                    channel.local_id(),
                    self.channel_config.initial_window,
                    self.channel_config.max_packet_size,
                    confirmation_payload,
                );
                self.outbound.send(confirm.to_bytes())?;
                channel.confirm_open(None)?;
            }
            Err(e) => {
                let failure = ChannelOpenFailure::with_reason_code(
                    open.sender_channel(),
                    e.reason_code,
                    e.description.clone(),
                );
                self.outbound.send(failure.to_bytes())?;
                channel.fail(&e);
            }
        }
        Ok(())
    }

    fn handle_global_request(&self, payload: &[u8]) -> StrandResult<()> {
        let request = GlobalRequest::from_bytes(payload)?;
        let handler = self
            .global_handlers
            .read()
            .get(request.request_name())
            .cloned();

        let result = match handler {
            Some(handler) => handler.process(
                request.request_name(),
                request.want_reply(),
                request.payload(),
            ),
            None => GlobalRequestResult::Failure,
        };
        debug!(name = request.request_name(), result = ?result, "Global request");

        if request.want_reply() {
            let reply = match result {
                GlobalRequestResult::Success(data) => request_success(&data),
                GlobalRequestResult::Failure => request_failure(),
            };
            self.outbound.send(reply)?;
        }
        Ok(())
    }

    fn handle_global_reply(&self, success: bool, data: &[u8]) {
        match self.global_requests.lock().pop_front() {
            Some(future) => {
                future.done_with_data(success, data.to_vec());
            }
            None => warn!(success, "Global request reply without a pending request"),
        }
    }

    /// Sends a global request. With `want_reply` the future resolves from the
    /// matching REQUEST_SUCCESS/FAILURE in request order; otherwise it is
    /// already successful.
    pub fn send_global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> StrandResult<RequestFuture> {
        let future = RequestFuture::new(format!("global request {}", name));
        let frame = GlobalRequest::new(name, want_reply, payload).to_bytes();

        if !want_reply {
            self.outbound.send(frame)?;
            future.done(true);
            return Ok(future);
        }

        let mut pending = self.global_requests.lock();
        self.outbound.send(frame)?;
        pending.push_back(future.clone());
        Ok(future)
    }

    /// Removes a channel from the table. Returns false if it was not present.
    pub fn free_channel(&self, id: u32) -> bool {
        let removed = self.channels.remove(&id).is_some();
        if removed {
            debug!(channel = id, "Channel freed");
        }
        removed
    }

    /// Force-closes every channel and fails pending global requests.
    pub fn close_all(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.iter().map(|e| e.value().clone()).collect();
        for channel in channels {
            channel.force_close();
        }
        // Channels still waiting on the peer's confirmation are dropped too.
        self.channels.clear();
        let pending: Vec<RequestFuture> = self.global_requests.lock().drain(..).collect();
        for future in pending {
            future.fail("Connection closed");
        }
    }

    /// Looks up a channel by local id.
    pub fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.channels.get(&id).map(|e| e.value().clone())
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Local ids of live channels, ascending.
    pub fn channel_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.channels.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("channels", &self.channel_ids())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
