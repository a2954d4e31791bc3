//! SSH channels (RFC 4254 Section 5).
//!
//! A [`Channel`] is one multiplexed stream on a connection. It owns both
//! flow-control windows, the optional receive cache, the FIFO queue of
//! pending channel requests and the open/close futures.
//!
//! Channel behavior is supplied by a [`ChannelHandler`]; every hook has a
//! default, so a handler only overrides what its channel type needs. Hooks
//! and listeners are always invoked outside the channel's internal locks.
//!
//! # Close sequence
//!
//! ```text
//! close() / force_close()
//!   -> CHANNEL_CLOSE sent (once)
//!   -> peer CHANNEL_CLOSE received, or forced
//!   -> completion: pending futures fail, observers fire once,
//!      the channel leaves the multiplexer table
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use strand_platform::{StrandError, StrandResult};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::cache::CachingBuffer;
use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure,
    ChannelOpenConfirmation, ChannelOpenFailureReason, ChannelRequest, ChannelSuccess,
    ChannelWindowAdjust, MAX_PACKET_SIZE, MAX_WINDOW_SIZE,
};
use super::data_window::DataWindow;
use super::driver::{is_driver_task, OutboundQueue};
use super::future::RequestFuture;
use super::multiplexer::Multiplexer;

/// Interval at which a sender blocked on the remote window re-checks it.
const WINDOW_RECHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Channel flow-control and timing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Largest data packet accepted from the peer.
    pub max_packet_size: u32,
    /// Local window advertised at open.
    pub initial_window: u32,
    /// Local window restored by adjustments.
    pub max_window: u32,
    /// Local space at or below which a WINDOW_ADJUST is sent.
    pub min_window: u32,
    /// Buffer received data for [`Channel::read`]. When false, data is only
    /// delivered to hooks and listeners.
    pub cache_incoming: bool,
    /// Bound on a [`Channel::read`] wait; `None` waits indefinitely.
    pub read_timeout: Option<Duration>,
    /// Bound on a wait for remote window space; `None` waits indefinitely.
    pub window_timeout: Option<Duration>,
    /// Bound on the wait for the last segment of a send to reach the socket.
    pub send_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 32_768,
            initial_window: 1_024_000,
            max_window: 1_024_000,
            min_window: 65_536,
            cache_incoming: true,
            read_timeout: None,
            window_timeout: None,
            send_timeout: Duration::from_secs(120),
        }
    }
}

impl ChannelConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Config`] describing the first problem found.
    pub fn validate(&self) -> StrandResult<()> {
        if self.max_packet_size == 0 {
            return Err(StrandError::Config(
                "max_packet_size must be greater than zero".to_string(),
            ));
        }
        if self.max_packet_size > MAX_PACKET_SIZE {
            return Err(StrandError::Config(format!(
                "max_packet_size {} exceeds maximum {}",
                self.max_packet_size, MAX_PACKET_SIZE
            )));
        }
        if self.max_window > MAX_WINDOW_SIZE {
            return Err(StrandError::Config(format!(
                "max_window {} exceeds maximum {}",
                self.max_window, MAX_WINDOW_SIZE
            )));
        }
        if self.min_window > self.max_window {
            return Err(StrandError::Config(format!(
                "min_window {} exceeds max_window {}",
                self.min_window, self.max_window
            )));
        }
        if self.initial_window > self.max_window {
            return Err(StrandError::Config(format!(
                "initial_window {} exceeds max_window {}",
                self.initial_window, self.max_window
            )));
        }
        Ok(())
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Created, open not yet confirmed.
    Uninitialized = 0,
    /// Open and usable.
    Open = 1,
    /// Closed; terminal.
    Closed = 2,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Reason a channel open was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenError {
    /// Raw reason code sent on the wire.
    pub reason_code: u32,
    /// Human-readable description.
    pub description: String,
}

impl ChannelOpenError {
    /// Creates an error with the reason's default description.
    pub fn new(reason: ChannelOpenFailureReason) -> Self {
        Self::with_description(reason, reason.as_str())
    }

    /// Creates an error with a custom description.
    pub fn with_description(reason: ChannelOpenFailureReason, description: impl Into<String>) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.into(),
        }
    }
}

impl fmt::Display for ChannelOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (reason {})", self.description, self.reason_code)
    }
}

/// Channel behavior hooks.
///
/// Hooks run on the I/O driver task for inbound events, so they must not
/// block or call [`Channel::send_data`]; spawn a task for that instead.
pub trait ChannelHandler: Send + Sync {
    /// Channel type opened by this handler.
    fn channel_type(&self) -> &str {
        "session"
    }

    /// Type-specific data for an outbound CHANNEL_OPEN.
    fn create_channel(&self, _channel: &Channel) -> StrandResult<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Accepts an inbound open. Returns confirmation type-specific data.
    fn open_channel(&self, _channel: &Channel, _payload: &[u8]) -> Result<Vec<u8>, ChannelOpenError> {
        Ok(Vec::new())
    }

    /// Outbound open confirmed by the peer.
    fn on_open_confirmation(&self, _channel: &Channel, _payload: &[u8]) {}

    /// Outbound open refused by the peer.
    fn on_open_failure(&self, _channel: &Channel, _error: &ChannelOpenError) {}

    /// Channel became open (both directions).
    fn on_channel_open(&self, _channel: &Channel) {}

    /// Data received.
    fn on_data(&self, _channel: &Channel, _data: &[u8]) -> StrandResult<()> {
        Ok(())
    }

    /// Extended data received.
    fn on_extended_data(&self, _channel: &Channel, _type_code: u32, _data: &[u8]) -> StrandResult<()> {
        Ok(())
    }

    /// Channel request received. The return value is the reply.
    fn on_channel_request(&self, _channel: &Channel, _request_type: &str, _payload: &[u8]) -> bool {
        false
    }

    /// Peer sent EOF.
    fn on_remote_eof(&self, channel: &Channel) {
        channel.close();
    }

    /// Local EOF sent.
    fn on_local_eof(&self, _channel: &Channel) {}

    /// Peer sent CHANNEL_CLOSE.
    fn on_remote_close(&self, channel: &Channel) {
        channel.close();
    }

    /// Consulted before a graceful close.
    fn can_close(&self, _channel: &Channel) -> bool {
        true
    }

    /// Close started.
    fn on_channel_closing(&self, _channel: &Channel) {}

    /// Close completed.
    fn on_channel_closed(&self, _channel: &Channel) {}

    /// Channel left the multiplexer table.
    fn on_channel_free(&self, _channel: &Channel) {}

    /// A hook failed or the channel was forced closed.
    fn on_channel_error(&self, _channel: &Channel, _error: &StrandError) {}
}

/// Handler with every hook at its default.
#[derive(Debug, Default, Clone)]
pub struct DefaultChannelHandler;

impl ChannelHandler for DefaultChannelHandler {}

/// Observer of channel events.
pub trait ChannelEventListener: Send + Sync {
    /// Channel became open.
    fn on_channel_open(&self, _channel: &Channel) {}

    /// Data received.
    fn on_data(&self, _channel: &Channel, _data: &[u8]) {}

    /// Extended data received.
    fn on_extended_data(&self, _channel: &Channel, _type_code: u32, _data: &[u8]) {}

    /// Peer sent EOF.
    fn on_remote_eof(&self, _channel: &Channel) {}

    /// Close started.
    fn on_channel_closing(&self, _channel: &Channel) {}

    /// Close completed.
    fn on_channel_close(&self, _channel: &Channel) {}

    /// Peer granted more window; `remote_space` is the space now available.
    fn on_window_adjust(&self, _channel: &Channel, _remote_space: u32) {}

    /// A hook failed or the channel was forced closed.
    fn on_channel_error(&self, _channel: &Channel, _error: &StrandError) {}
}

/// State guarded by the channel lock.
#[derive(Debug)]
struct ChannelIo {
    local: DataWindow,
    remote: Option<DataWindow>,
    remote_id: Option<u32>,
    cache: Option<CachingBuffer>,
}

/// Multiplexed channel.
pub struct Channel {
    local_id: u32,
    channel_type: String,
    config: ChannelConfig,
    state: AtomicU8,
    remote_packet_size: AtomicU32,
    local_eof: AtomicBool,
    remote_eof: AtomicBool,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    close_completed: AtomicBool,
    incoming_halted: AtomicBool,
    inbound: AtomicBool,
    // Closed before the peer confirmed the open; the id stays in the table
    // until the peer's side is closed too.
    orphaned: AtomicBool,
    io: Mutex<ChannelIo>,
    requests: Mutex<VecDeque<RequestFuture>>,
    open_future: RequestFuture,
    close_future: RequestFuture,
    listeners: RwLock<Vec<Arc<dyn ChannelEventListener>>>,
    handler: Arc<dyn ChannelHandler>,
    multiplexer: Weak<Multiplexer>,
    outbound: OutboundQueue,
    window_notify: Notify,
    read_notify: Notify,
}

impl Channel {
    /// Creates a channel. Only the multiplexer constructs channels outside tests.
    pub(crate) fn new(
        local_id: u32,
        channel_type: impl Into<String>,
        config: ChannelConfig,
        handler: Arc<dyn ChannelHandler>,
        multiplexer: Weak<Multiplexer>,
        outbound: OutboundQueue,
    ) -> Self {
        let local = DataWindow::new(
            config.initial_window,
            config.max_window,
            config.min_window,
            config.max_packet_size,
        );
        let cache = config
            .cache_incoming
            .then(|| CachingBuffer::new(config.max_window as usize));

        Self {
            local_id,
            channel_type: channel_type.into(),
            state: AtomicU8::new(ChannelState::Uninitialized as u8),
            remote_packet_size: AtomicU32::new(0),
            local_eof: AtomicBool::new(false),
            remote_eof: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            close_completed: AtomicBool::new(false),
            incoming_halted: AtomicBool::new(false),
            inbound: AtomicBool::new(false),
            orphaned: AtomicBool::new(false),
            io: Mutex::new(ChannelIo {
                local,
                remote: None,
                remote_id: None,
                cache,
            }),
            requests: Mutex::new(VecDeque::new()),
            open_future: RequestFuture::new(format!("channel {} open", local_id)),
            close_future: RequestFuture::new(format!("channel {} close", local_id)),
            listeners: RwLock::new(Vec::new()),
            handler,
            multiplexer,
            outbound,
            window_notify: Notify::new(),
            read_notify: Notify::new(),
            config,
        }
    }

    // ---- accessors ----

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Remote channel id, known once the open is confirmed.
    pub fn remote_id(&self) -> Option<u32> {
        self.io.lock().remote_id
    }

    /// Channel type name.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True while open.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Local EOF has been sent.
    pub fn is_local_eof(&self) -> bool {
        self.local_eof.load(Ordering::Acquire)
    }

    /// Peer EOF has been received.
    pub fn is_remote_eof(&self) -> bool {
        self.remote_eof.load(Ordering::Acquire)
    }

    /// CHANNEL_CLOSE has been sent (or close started without a peer).
    pub fn is_close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    /// Peer CHANNEL_CLOSE has been received.
    pub fn is_close_received(&self) -> bool {
        self.close_received.load(Ordering::Acquire)
    }

    /// Close sequence has completed.
    pub fn is_close_completed(&self) -> bool {
        self.close_completed.load(Ordering::Acquire)
    }

    /// Incoming data is halted.
    pub fn is_incoming_halted(&self) -> bool {
        self.incoming_halted.load(Ordering::Acquire)
    }

    /// Local window space.
    pub fn local_window_space(&self) -> u32 {
        self.io.lock().local.space()
    }

    /// Remote window space, zero before the remote window exists.
    pub fn remote_window_space(&self) -> u32 {
        self.io.lock().remote.as_ref().map_or(0, DataWindow::space)
    }

    /// Largest data packet the peer accepts.
    pub fn remote_packet_size(&self) -> u32 {
        self.remote_packet_size.load(Ordering::Acquire)
    }

    /// Bytes waiting in the receive cache.
    pub fn cached_bytes(&self) -> usize {
        self.io.lock().cache.as_ref().map_or(0, CachingBuffer::remaining)
    }

    /// Future resolved when the open completes.
    pub fn open_future(&self) -> &RequestFuture {
        &self.open_future
    }

    /// Future resolved when the close completes.
    pub fn close_future(&self) -> &RequestFuture {
        &self.close_future
    }

    /// Channel requests awaiting a reply.
    pub fn pending_request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Registers an event listener.
    pub fn add_listener(&self, listener: Arc<dyn ChannelEventListener>) {
        self.listeners.write().push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn ChannelEventListener>> {
        self.listeners.read().clone()
    }

    fn wake_all(&self) {
        self.window_notify.notify_waiters();
        self.read_notify.notify_waiters();
    }

    // ---- open ----

    /// Accepts an inbound open: records the peer's parameters and runs the
    /// handler's `open_channel` hook.
    pub fn open(
        &self,
        remote_id: u32,
        remote_packet_size: u32,
        remote_window: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, ChannelOpenError> {
        self.inbound.store(true, Ordering::Release);
        self.set_remote(remote_id, remote_packet_size, remote_window);
        self.handler.open_channel(self, payload)
    }

    fn set_remote(&self, remote_id: u32, remote_packet_size: u32, remote_window: u32) {
        let mut io = self.io.lock();
        io.remote_id = Some(remote_id);
        io.remote = Some(DataWindow::new(
            remote_window,
            remote_window,
            0,
            remote_packet_size,
        ));
        self.remote_packet_size
            .store(remote_packet_size, Ordering::Release);
    }

    /// Marks the channel open. Outbound opens pass the peer's confirmation.
    ///
    /// A confirmation for a channel closed while its open was pending is
    /// answered with CHANNEL_CLOSE.
    ///
    /// # Errors
    ///
    /// - [`StrandError::Protocol`] if the peer confirms a channel it opened
    ///   or one that is already confirmed
    /// - [`StrandError::IllegalState`] if an inbound channel is opened twice
    pub fn confirm_open(&self, confirmation: Option<&ChannelOpenConfirmation>) -> StrandResult<()> {
        match confirmation {
            Some(confirm) => {
                if self.inbound.load(Ordering::Acquire) || self.remote_id().is_some() {
                    return Err(StrandError::Protocol(format!(
                        "Unexpected open confirmation for channel {}",
                        self.local_id
                    )));
                }
                if self.orphaned.load(Ordering::Acquire) {
                    return self.close_orphan(confirm.sender_channel());
                }
            }
            None => {
                if self.state() == ChannelState::Open {
                    return Err(StrandError::IllegalState(format!(
                        "Channel {} is already open",
                        self.local_id
                    )));
                }
            }
        }
        if self.is_closed() {
            return Ok(());
        }
        if let Some(confirm) = confirmation {
            self.set_remote(
                confirm.sender_channel(),
                confirm.maximum_packet_size(),
                confirm.initial_window_size(),
            );
        }

        self.set_state(ChannelState::Open);
        debug!(
            channel = self.local_id,
            remote = ?self.remote_id(),
            "Channel open"
        );

        if let Some(confirm) = confirmation {
            self.handler.on_open_confirmation(self, confirm.payload());
        }
        self.open_future.done(true);
        self.handler.on_channel_open(self);
        for listener in self.listeners() {
            listener.on_channel_open(self);
        }
        Ok(())
    }

    fn close_orphan(&self, remote_id: u32) -> StrandResult<()> {
        self.io.lock().remote_id = Some(remote_id);
        debug!(channel = self.local_id, remote = remote_id, "Closing channel confirmed after local close");
        if self.outbound.is_connected() {
            self.outbound.send(ChannelClose::new(remote_id).to_bytes())?;
        } else {
            self.release();
        }
        Ok(())
    }

    /// Fails an open: the open future fails and the channel is released
    /// without sending anything.
    pub fn fail(&self, error: &ChannelOpenError) {
        debug!(channel = self.local_id, %error, "Channel open failed");
        self.open_future.fail(error.description.clone());
        self.handler.on_open_failure(self, error);
        self.close_sent.store(true, Ordering::Release);
        self.set_state(ChannelState::Closed);
        self.complete_close();
        self.release();
    }

    // ---- outbound data ----

    fn closed_error() -> StrandError {
        StrandError::Channel("Channel has been closed".to_string())
    }

    fn check_writable(&self) -> StrandResult<()> {
        if self.is_closed() || self.is_close_sent() || self.is_local_eof() {
            return Err(Self::closed_error());
        }
        Ok(())
    }

    /// Sends data, splitting it to fit the remote packet size and window.
    ///
    /// Returns once the last segment has been written to the socket.
    ///
    /// # Errors
    ///
    /// - [`StrandError::IllegalState`] when called from the I/O driver task
    /// - [`StrandError::Channel`] if the channel is closed or EOF was sent
    /// - [`StrandError::Timeout`] if `window_timeout` elapses
    /// - [`StrandError::Io`] (`TimedOut`) if `send_timeout` elapses before
    ///   the data is written; the channel is left as it was
    pub async fn send_data(&self, data: &[u8]) -> StrandResult<()> {
        self.send_segments(data, None).await
    }

    /// Sends extended data (for example stderr, type code 1).
    pub async fn send_extended_data(&self, data: &[u8], type_code: u32) -> StrandResult<()> {
        self.send_segments(data, Some(type_code)).await
    }

    async fn send_segments(&self, data: &[u8], type_code: Option<u32>) -> StrandResult<()> {
        if is_driver_task() {
            return Err(StrandError::IllegalState(
                "Channel data cannot be sent from the I/O driver task".to_string(),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut offset = 0;
        let mut last_sent = None;

        while offset < data.len() {
            self.check_writable()?;

            let notified = self.window_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let written = {
                let mut io = self.io.lock();
                let remote_id = io.remote_id;
                let (Some(remote), Some(remote_id)) = (io.remote.as_mut(), remote_id) else {
                    return Err(StrandError::IllegalState("Channel is not open".to_string()));
                };

                let len = (remote.packet_size() as usize)
                    .min(remote.space() as usize)
                    .min(data.len() - offset);
                if len > 0 {
                    remote.consume(len)?;
                    let segment = &data[offset..offset + len];
                    let frame = match type_code {
                        None => ChannelData::encode(remote_id, segment),
                        Some(code) => ChannelExtendedData::encode(remote_id, code, segment),
                    };
                    last_sent = Some(self.outbound.send_notified(frame)?);
                    trace!(channel = self.local_id, len, "Queued channel data");
                }
                len
            };

            if written > 0 {
                offset += written;
                continue;
            }

            trace!(channel = self.local_id, "Waiting for remote window space");
            match self.config.window_timeout {
                Some(timeout) => tokio::time::timeout(timeout, notified).await.map_err(|_| {
                    StrandError::Timeout(
                        "Timed out waiting for remote window space".to_string(),
                    )
                })?,
                None => {
                    let _ = tokio::time::timeout(WINDOW_RECHECK_INTERVAL, notified).await;
                }
            }
        }

        let Some(sent) = last_sent else {
            return Ok(());
        };
        match tokio::time::timeout(self.config.send_timeout, sent).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StrandError::Channel(
                "Connection closed before data was sent".to_string(),
            )),
            Err(_) => Err(StrandError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Timeout waiting for data to be sent on channel",
            ))),
        }
    }

    /// Sends a channel request.
    ///
    /// Without a reply the returned future is already successful. With a
    /// reply it resolves from the matching CHANNEL_SUCCESS/FAILURE; replies
    /// are matched in request order.
    pub fn send_channel_request(
        &self,
        request_type: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> StrandResult<RequestFuture> {
        self.check_writable()?;
        let remote_id = self
            .remote_id()
            .ok_or_else(|| StrandError::IllegalState("Channel is not open".to_string()))?;
        let future = RequestFuture::new(format!("channel {} {}", self.local_id, request_type));
        let frame = ChannelRequest::new(remote_id, request_type, want_reply, payload).to_bytes();

        if !want_reply {
            self.outbound.send(frame)?;
            future.done(true);
            return Ok(future);
        }

        let mut pending = self.requests.lock();
        self.outbound.send(frame)?;
        pending.push_back(future.clone());
        Ok(future)
    }

    /// Sends EOF once. Has no effect unless the channel is open and neither
    /// EOF nor CLOSE has been sent.
    pub fn send_eof(&self) -> StrandResult<()> {
        if !self.is_open() || self.is_close_sent() {
            return Ok(());
        }
        if self.local_eof.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let remote_id = {
            let mut io = self.io.lock();
            if let Some(remote) = io.remote.as_mut() {
                remote.close();
            }
            io.remote_id
        };
        self.window_notify.notify_waiters();

        if let Some(remote_id) = remote_id {
            debug!(channel = self.local_id, "Sending EOF");
            self.outbound.send(ChannelEof::new(remote_id).to_bytes())?;
        }
        self.handler.on_local_eof(self);
        Ok(())
    }

    // ---- close ----

    /// Starts a graceful close.
    pub fn close(&self) {
        self.close_internal(false);
    }

    /// Closes immediately, failing everything pending on the channel.
    pub fn force_close(&self) {
        self.close_internal(true);
    }

    fn close_internal(&self, forced: bool) {
        if self.is_close_completed() {
            return;
        }

        if (forced || self.handler.can_close(self)) && !self.close_sent.swap(true, Ordering::AcqRel) {
            debug!(channel = self.local_id, forced, "Closing channel");
            for listener in self.listeners() {
                listener.on_channel_closing(self);
            }
            self.handler.on_channel_closing(self);

            self.set_state(ChannelState::Closed);
            self.wake_all();

            if let Some(remote_id) = self.remote_id() {
                if self.outbound.is_connected() {
                    if let Err(e) = self.outbound.send(ChannelClose::new(remote_id).to_bytes()) {
                        debug!(channel = self.local_id, error = %e, "CHANNEL_CLOSE not sent");
                    }
                }
            }
        }

        let awaiting_confirmation = !self.inbound.load(Ordering::Acquire) && self.remote_id().is_none();
        if awaiting_confirmation && self.outbound.is_connected() {
            debug!(channel = self.local_id, "Channel closed before open confirmation");
            self.orphaned.store(true, Ordering::Release);
        }

        if forced || !self.outbound.is_connected() || awaiting_confirmation {
            if forced {
                self.report_error(&StrandError::Channel(
                    "Channel has been forced to close".to_string(),
                ));
            }
            self.complete_close();
        } else if self.is_close_sent() && self.is_close_received() {
            self.complete_close();
        }
    }

    fn complete_close(&self) {
        if self.close_completed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ChannelState::Closed);

        let pending: Vec<RequestFuture> = self.requests.lock().drain(..).collect();
        for future in pending {
            future.fail("Channel closed");
        }
        if !self.open_future.is_done() {
            self.open_future.fail("Channel closed before open completed");
        }

        {
            let mut io = self.io.lock();
            if let Some(cache) = io.cache.as_mut() {
                cache.close();
            }
            if let Some(remote) = io.remote.as_mut() {
                remote.close();
            }
        }
        self.wake_all();

        let listeners = self.listeners();
        for listener in &listeners {
            listener.on_channel_close(self);
        }
        self.handler.on_channel_closed(self);
        self.close_future.done(true);

        if !self.orphaned.load(Ordering::Acquire) {
            self.free();
        }
        self.listeners.write().clear();
        debug!(channel = self.local_id, "Channel closed");
    }

    fn free(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.free_channel(self.local_id);
        }
        self.handler.on_channel_free(self);
    }

    /// Frees an orphaned channel once the peer's side is gone.
    fn release(&self) {
        if self.orphaned.swap(false, Ordering::AcqRel) {
            self.free();
        }
    }

    /// Whether the channel was closed before the peer confirmed it and is
    /// still waiting for the peer's side to close.
    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    fn report_error(&self, error: &StrandError) {
        for listener in self.listeners() {
            listener.on_channel_error(self, error);
        }
        self.handler.on_channel_error(self, error);
    }

    // ---- inbound ----

    fn receive(&self, data: &[u8]) -> StrandResult<()> {
        if data.len() > self.config.max_packet_size as usize {
            return Err(StrandError::Protocol(format!(
                "Data length of {} bytes exceeded maximum packet size of {} bytes on channel {}",
                data.len(),
                self.config.max_packet_size,
                self.local_id
            )));
        }
        self.io.lock().local.consume(data.len())
    }

    fn after_hook(&self, result: StrandResult<()>) {
        if let Err(e) = result {
            warn!(channel = self.local_id, error = %e, "Channel handler failed");
            self.report_error(&e);
            self.close();
        }
    }

    /// Processes CHANNEL_DATA.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] if the data exceeds the local packet
    /// size or window; the transport treats that as fatal.
    pub fn handle_data(&self, data: &[u8]) -> StrandResult<()> {
        self.receive(data)?;
        if self.is_close_completed() {
            return Ok(());
        }
        trace!(channel = self.local_id, len = data.len(), "Received channel data");

        for listener in self.listeners() {
            listener.on_data(self, data);
        }
        let result = self.handler.on_data(self, data);

        {
            let mut io = self.io.lock();
            if let Some(cache) = io.cache.as_mut() {
                if !cache.is_closed() {
                    cache.put(data)?;
                }
            }
        }
        self.read_notify.notify_waiters();

        self.after_hook(result);
        self.evaluate_window()
    }

    /// Processes CHANNEL_EXTENDED_DATA. Extended data is never cached.
    pub fn handle_extended_data(&self, type_code: u32, data: &[u8]) -> StrandResult<()> {
        self.receive(data)?;
        if self.is_close_completed() {
            return Ok(());
        }

        for listener in self.listeners() {
            listener.on_extended_data(self, type_code, data);
        }
        let result = self.handler.on_extended_data(self, type_code, data);
        self.after_hook(result);
        self.evaluate_window()
    }

    /// Sends a WINDOW_ADJUST if local space plus cached bytes has dropped to
    /// the minimum, restoring the window to its maximum.
    pub fn evaluate_window(&self) -> StrandResult<()> {
        if !self.is_open() || self.is_incoming_halted() {
            return Ok(());
        }

        let adjust = {
            let mut io = self.io.lock();
            let cached = io.cache.as_ref().map_or(0, CachingBuffer::remaining) as u32;
            let space = io.local.space();
            let total = space.saturating_add(cached);
            if io.local.is_closed() || total > io.local.minimum() {
                None
            } else {
                let count = io.local.maximum().saturating_sub(total);
                io.local.adjust(count);
                io.remote_id.filter(|_| count > 0).map(|id| (id, count))
            }
        };

        if let Some((remote_id, count)) = adjust {
            debug!(channel = self.local_id, count, "Sending window adjust");
            self.outbound
                .send(ChannelWindowAdjust::new(remote_id, count).to_bytes())?;
        }
        Ok(())
    }

    /// Processes CHANNEL_WINDOW_ADJUST.
    pub fn handle_window_adjust(&self, count: u32) {
        let space = {
            let mut io = self.io.lock();
            match io.remote.as_mut() {
                Some(remote) => {
                    remote.adjust(count);
                    remote.space()
                }
                None => 0,
            }
        };
        trace!(channel = self.local_id, count, space, "Remote window adjusted");
        self.window_notify.notify_waiters();
        for listener in self.listeners() {
            listener.on_window_adjust(self, space);
        }
    }

    /// Processes CHANNEL_EOF.
    pub fn handle_eof(&self) {
        if self.remote_eof.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(channel = self.local_id, "Received EOF");
        self.read_notify.notify_waiters();
        for listener in self.listeners() {
            listener.on_remote_eof(self);
        }
        self.handler.on_remote_eof(self);
    }

    /// Processes CHANNEL_CLOSE.
    pub fn handle_close(&self) {
        if self.close_received.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(channel = self.local_id, "Received CLOSE");
        if self.is_close_completed() {
            self.release();
            return;
        }
        self.wake_all();
        self.handler.on_remote_close(self);
        if self.is_close_sent() {
            self.complete_close();
        }
    }

    /// Processes CHANNEL_REQUEST.
    pub fn handle_request(&self, request_type: &str, want_reply: bool, payload: &[u8]) -> StrandResult<()> {
        let success = self.handler.on_channel_request(self, request_type, payload);
        debug!(channel = self.local_id, request_type, success, "Channel request");

        if want_reply && !self.is_close_sent() {
            if let Some(remote_id) = self.remote_id() {
                let reply = if success {
                    ChannelSuccess::new(remote_id).to_bytes()
                } else {
                    ChannelFailure::new(remote_id).to_bytes()
                };
                self.outbound.send(reply)?;
            }
        }
        Ok(())
    }

    /// Processes CHANNEL_SUCCESS / CHANNEL_FAILURE for the oldest request.
    pub fn handle_request_reply(&self, success: bool) {
        match self.requests.lock().pop_front() {
            Some(future) => {
                future.done(success);
            }
            None => warn!(
                channel = self.local_id,
                success, "Channel request reply without a pending request"
            ),
        }
    }

    // ---- backpressure and reading ----

    /// Stops sending window adjustments.
    pub fn halt_incoming_data(&self) {
        self.incoming_halted.store(true, Ordering::Release);
    }

    /// Resumes window adjustments and re-evaluates the window at once.
    pub fn resume_incoming_data(&self) -> StrandResult<()> {
        self.incoming_halted.store(false, Ordering::Release);
        self.evaluate_window()
    }

    /// Reads buffered data into `buf`.
    ///
    /// Returns 0 at end of stream: the cache is closed, EOF was received and
    /// the cache is drained, or the channel is closed.
    ///
    /// # Errors
    ///
    /// - [`StrandError::IllegalState`] if the channel does not cache data
    /// - [`StrandError::Timeout`] if `read_timeout` elapses with no data
    pub async fn read(&self, buf: &mut [u8]) -> StrandResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let notified = self.read_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let read = {
                let mut io = self.io.lock();
                let Some(cache) = io.cache.as_mut() else {
                    return Err(StrandError::IllegalState(
                        "Channel is not caching incoming data".to_string(),
                    ));
                };
                if cache.has_remaining() {
                    Some(cache.get(buf))
                } else if cache.is_closed() || self.is_remote_eof() || self.is_closed() {
                    return Ok(0);
                } else {
                    None
                }
            };

            if let Some(n) = read {
                self.evaluate_window()?;
                return Ok(n);
            }

            match self.config.read_timeout {
                Some(timeout) => tokio::time::timeout(timeout, notified).await.map_err(|_| {
                    StrandError::Timeout(
                        "No data received within the timeout threshold".to_string(),
                    )
                })?,
                None => notified.await,
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("channel_type", &self.channel_type)
            .field("state", &self.state())
            .field("remote_id", &self.remote_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::ssh::connection::{ChannelRequest as ChannelRequestMessage, ChannelWindowAdjust as Adjust};
    use crate::ssh::driver::DriverCommand;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn channel_with(
        config: ChannelConfig,
        handler: Arc<dyn ChannelHandler>,
    ) -> (Arc<Channel>, UnboundedReceiver<DriverCommand>) {
        let (outbound, rx) = OutboundQueue::new();
        let channel = Arc::new(Channel::new(0, "session", config, handler, Weak::new(), outbound));
        (channel, rx)
    }

    fn open_channel(config: ChannelConfig) -> (Arc<Channel>, UnboundedReceiver<DriverCommand>) {
        let (channel, rx) = channel_with(config, Arc::new(DefaultChannelHandler));
        channel.confirm_open(Some(&ChannelOpenConfirmation::new(0, 9, 100_000, 1_000, vec![]))).unwrap();
        (channel, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<DriverCommand>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let DriverCommand::Send { payload, sent } = command {
                if let Some(sent) = sent {
                    let _ = sent.send(Ok(()));
                }
                frames.push(payload);
            }
        }
        frames
    }

    #[derive(Default)]
    struct CountingListener {
        closes: AtomicUsize,
        data: AtomicUsize,
        adjusts: Mutex<Vec<u32>>,
        errors: Mutex<Vec<String>>,
    }

    impl ChannelEventListener for CountingListener {
        fn on_data(&self, _channel: &Channel, data: &[u8]) {
            self.data.fetch_add(data.len(), Ordering::SeqCst);
        }

        fn on_channel_close(&self, _channel: &Channel) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_window_adjust(&self, _channel: &Channel, remote_space: u32) {
            self.adjusts.lock().push(remote_space);
        }

        fn on_channel_error(&self, _channel: &Channel, error: &StrandError) {
            self.errors.lock().push(error.to_string());
        }
    }

    #[test]
    fn test_config_validate() {
        assert!(ChannelConfig::default().validate().is_ok());

        let mut config = ChannelConfig::default();
        config.max_packet_size = 0;
        assert!(matches!(config.validate(), Err(StrandError::Config(_))));

        let mut config = ChannelConfig::default();
        config.min_window = config.max_window + 1;
        assert!(config.validate().is_err());

        let mut config = ChannelConfig::default();
        config.initial_window = config.max_window + 1;
        assert!(config.validate().is_err());

        let mut config = ChannelConfig::default();
        config.max_window = MAX_WINDOW_SIZE + 1;
        config.initial_window = config.max_window;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confirm_open_sets_remote() {
        let (channel, _rx) = open_channel(ChannelConfig::default());
        assert!(channel.is_open());
        assert_eq!(channel.remote_id(), Some(9));
        assert_eq!(channel.remote_window_space(), 100_000);
        assert_eq!(channel.remote_packet_size(), 1_000);
        assert!(channel.open_future().is_success());
    }

    #[tokio::test]
    async fn test_send_segments_respect_packet_size() {
        let (channel, mut rx) = open_channel(ChannelConfig::default());
        let data = vec![7u8; 2_500];

        let sender = channel.clone();
        let task = tokio::spawn(async move { sender.send_data(&data).await });

        let mut sizes = Vec::new();
        while sizes.iter().sum::<usize>() < 2_500 {
            for frame in drain(&mut rx) {
                let parsed = ChannelData::from_bytes(&frame).unwrap();
                assert_eq!(parsed.recipient_channel(), 9);
                sizes.push(parsed.data().len());
            }
            tokio::task::yield_now().await;
        }

        task.await.unwrap().unwrap();
        assert_eq!(sizes, vec![1_000, 1_000, 500]);
        assert_eq!(channel.remote_window_space(), 97_500);
    }

    #[tokio::test]
    async fn test_send_waits_for_window_adjust() {
        let (channel, mut rx) = channel_with(ChannelConfig::default(), Arc::new(DefaultChannelHandler));
        channel.confirm_open(Some(&ChannelOpenConfirmation::new(0, 1, 100, 64, vec![]))).unwrap();

        let sender = channel.clone();
        let task = tokio::spawn(async move { sender.send_data(&[1u8; 150]).await });

        while channel.remote_window_space() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(drain(&mut rx).len(), 2);

        channel.handle_window_adjust(100);
        task.await.unwrap().unwrap();
        drain(&mut rx);
        assert_eq!(channel.remote_window_space(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_keeps_state() {
        let mut config = ChannelConfig::default();
        config.send_timeout = Duration::from_secs(2);
        let (channel, _rx) = open_channel(config);

        match channel.send_data(b"never written").await {
            Err(StrandError::Io(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::TimedOut);
                assert_eq!(e.to_string(), "Timeout waiting for data to be sent on channel");
            }
            other => panic!("Expected Io timeout, got {:?}", other),
        }
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_send_on_closed_channel() {
        let (channel, _rx) = open_channel(ChannelConfig::default());
        channel.force_close();
        match channel.send_data(b"x").await {
            Err(StrandError::Channel(msg)) => assert_eq!(msg, "Channel has been closed"),
            other => panic!("Expected Channel error, got {:?}", other),
        }
        assert!(channel.send_data(b"").await.is_ok());
    }

    #[tokio::test]
    async fn test_send_rejected_on_driver_task() {
        let (channel, _rx) = open_channel(ChannelConfig::default());
        let result = crate::ssh::driver::run_as_driver(channel.send_data(b"x")).await;
        assert!(matches!(result, Err(StrandError::IllegalState(_))));
    }

    #[test]
    fn test_window_adjust_once() {
        let mut config = ChannelConfig::default();
        config.cache_incoming = false;
        config.initial_window = 10_000;
        config.max_window = 10_000;
        config.min_window = 4_000;
        config.max_packet_size = 4_000;
        let (channel, mut rx) = open_channel(config);

        channel.handle_data(&[0u8; 4_000]).unwrap();
        assert!(drain(&mut rx).is_empty());

        channel.handle_data(&[0u8; 2_000]).unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let adjust = Adjust::from_bytes(&frames[0]).unwrap();
        assert_eq!(adjust.bytes_to_add(), 6_000);
        assert_eq!(channel.local_window_space(), 10_000);

        channel.evaluate_window().unwrap();
        channel.evaluate_window().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_data_over_window_is_protocol_error() {
        let mut config = ChannelConfig::default();
        config.initial_window = 100;
        config.max_window = 100;
        config.min_window = 10;
        let (channel, _rx) = open_channel(config);

        channel.handle_data(&[0u8; 60]).unwrap();
        match channel.handle_data(&[0u8; 60]) {
            Err(StrandError::Protocol(msg)) => {
                assert!(msg.contains("exceeded available window space of 40 bytes"))
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_data_over_packet_size_is_protocol_error() {
        let (channel, _rx) = open_channel(ChannelConfig::default());
        assert!(matches!(
            channel.handle_data(&vec![0u8; 32_769]),
            Err(StrandError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_cached_data_and_eof() {
        let (channel, _rx) = open_channel(ChannelConfig::default());
        channel.handle_data(b"hello").unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"hel");

        let reader = channel.clone();
        let task = tokio::spawn(async move {
            let mut rest = Vec::new();
            let mut buf = [0u8; 16];
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    return rest;
                }
                rest.extend_from_slice(&buf[..n]);
            }
        });

        tokio::task::yield_now().await;
        channel.handle_data(b" world").unwrap();
        tokio::task::yield_now().await;
        channel.handle_eof();
        assert_eq!(task.await.unwrap(), b"lo world");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let mut config = ChannelConfig::default();
        config.read_timeout = Some(Duration::from_millis(500));
        let (channel, _rx) = open_channel(config);

        let mut buf = [0u8; 4];
        match channel.read(&mut buf).await {
            Err(StrandError::Timeout(msg)) => {
                assert_eq!(msg, "No data received within the timeout threshold")
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_on_non_caching_channel() {
        let mut config = ChannelConfig::default();
        config.cache_incoming = false;
        let (channel, _rx) = open_channel(config);
        let mut buf = [0u8; 4];
        assert!(matches!(
            channel.read(&mut buf).await,
            Err(StrandError::IllegalState(_))
        ));
    }

    #[test]
    fn test_cached_data_holds_back_adjust() {
        let mut config = ChannelConfig::default();
        config.initial_window = 1_000;
        config.max_window = 1_000;
        config.min_window = 200;
        config.max_packet_size = 1_000;
        let (channel, mut rx) = open_channel(config);

        channel.handle_data(&[0u8; 900]).unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(channel.cached_bytes(), 900);
    }

    #[tokio::test]
    async fn test_halt_and_resume() {
        let mut config = ChannelConfig::default();
        config.initial_window = 1_000;
        config.max_window = 1_000;
        config.min_window = 200;
        config.max_packet_size = 1_000;
        let (channel, mut rx) = open_channel(config);

        channel.handle_data(&[0u8; 900]).unwrap();
        channel.halt_incoming_data();

        let mut buf = [0u8; 1_000];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 900);
        assert!(drain(&mut rx).is_empty());

        channel.resume_incoming_data().unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(Adjust::from_bytes(&frames[0]).unwrap().bytes_to_add(), 900);
    }

    #[test]
    fn test_requests_resolve_in_order() {
        let (channel, mut rx) = open_channel(ChannelConfig::default());
        let a = channel.send_channel_request("a", true, vec![]).unwrap();
        let b = channel.send_channel_request("b", true, vec![]).unwrap();
        let quiet = channel.send_channel_request("quiet", false, vec![]).unwrap();
        let c = channel.send_channel_request("c", true, vec![]).unwrap();
        assert!(quiet.is_success());
        assert_eq!(channel.pending_request_count(), 3);

        let frames = drain(&mut rx);
        let names: Vec<String> = frames
            .iter()
            .map(|f| ChannelRequestMessage::from_bytes(f).unwrap().request_type().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "quiet", "c"]);

        channel.handle_request_reply(true);
        channel.handle_data(b"interleaved").unwrap();
        channel.handle_request_reply(false);
        channel.handle_request_reply(true);
        channel.handle_request_reply(true);

        assert!(a.is_success());
        assert!(b.is_done() && !b.is_success());
        assert!(c.is_success());
    }

    #[test]
    fn test_inbound_request_reply() {
        struct Exec;
        impl ChannelHandler for Exec {
            fn on_channel_request(&self, _channel: &Channel, request_type: &str, _payload: &[u8]) -> bool {
                request_type == "exec"
            }
        }

        let (channel, mut rx) = channel_with(ChannelConfig::default(), Arc::new(Exec));
        channel.confirm_open(Some(&ChannelOpenConfirmation::new(0, 4, 1_000, 100, vec![]))).unwrap();

        channel.handle_request("exec", true, &[]).unwrap();
        channel.handle_request("shell", true, &[]).unwrap();
        channel.handle_request("env", false, &[]).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames, vec![vec![99, 0, 0, 0, 4], vec![100, 0, 0, 0, 4]]);
    }

    #[test]
    fn test_graceful_close_waits_for_peer() {
        let (channel, mut rx) = open_channel(ChannelConfig::default());
        let listener = Arc::new(CountingListener::default());
        channel.add_listener(listener.clone());
        let pending = channel.send_channel_request("x", true, vec![]).unwrap();

        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(!channel.is_close_completed());
        let frames = drain(&mut rx);
        assert_eq!(frames.iter().filter(|f| f[0] == 97).count(), 1);

        channel.handle_close();
        assert!(channel.is_close_completed());
        assert!(channel.close_future().is_success());
        assert!(pending.is_done() && !pending.is_success());

        channel.force_close();
        assert_eq!(listener.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remote_close_triggers_close() {
        let (channel, mut rx) = open_channel(ChannelConfig::default());
        channel.handle_close();
        assert!(channel.is_close_completed());
        assert_eq!(drain(&mut rx), vec![vec![97, 0, 0, 0, 9]]);
    }

    #[test]
    fn test_forced_close_reports_error() {
        #[derive(Default)]
        struct Recorder {
            errors: Mutex<Vec<String>>,
        }
        impl ChannelHandler for Recorder {
            fn on_channel_error(&self, _channel: &Channel, error: &StrandError) {
                self.errors.lock().push(error.to_string());
            }
        }

        let handler = Arc::new(Recorder::default());
        let (channel, _rx) = channel_with(ChannelConfig::default(), handler.clone());
        channel.confirm_open(Some(&ChannelOpenConfirmation::new(0, 1, 10, 10, vec![]))).unwrap();

        channel.force_close();
        channel.force_close();
        assert!(channel.is_close_completed());
        assert_eq!(
            *handler.errors.lock(),
            vec!["Channel error: Channel has been forced to close".to_string()]
        );
    }

    #[test]
    fn test_listener_sees_window_adjust_and_errors() {
        let (channel, _rx) = open_channel(ChannelConfig::default());
        let listener = Arc::new(CountingListener::default());
        channel.add_listener(listener.clone());
        if let Some(remote) = channel.io.lock().remote.as_mut() {
            remote.consume(1_000).unwrap();
        }

        channel.handle_window_adjust(500);
        channel.handle_window_adjust(250);
        channel.handle_window_adjust(10_000);
        assert_eq!(*listener.adjusts.lock(), vec![99_500, 99_750, 100_000]);

        channel.force_close();
        assert_eq!(
            *listener.errors.lock(),
            vec!["Channel error: Channel has been forced to close".to_string()]
        );
        assert_eq!(listener.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_confirm_open_twice_is_rejected() {
        let (channel, _rx) = open_channel(ChannelConfig::default());

        let again = ChannelOpenConfirmation::new(0, 77, 5_000_000, 1_000, vec![]);
        assert!(matches!(
            channel.confirm_open(Some(&again)),
            Err(StrandError::Protocol(_))
        ));
        assert_eq!(channel.remote_id(), Some(9));
        assert_eq!(channel.remote_window_space(), 100_000);
        assert!(matches!(
            channel.confirm_open(None),
            Err(StrandError::IllegalState(_))
        ));
    }

    #[test]
    fn test_close_before_confirmation_sends_close_late() {
        let (channel, mut rx) = channel_with(ChannelConfig::default(), Arc::new(DefaultChannelHandler));
        channel.close();
        assert!(channel.is_close_completed());
        assert!(channel.is_orphaned());
        assert!(channel.open_future().is_done() && !channel.open_future().is_success());
        assert!(drain(&mut rx).is_empty());

        channel
            .confirm_open(Some(&ChannelOpenConfirmation::new(0, 31, 1_000, 100, vec![])))
            .unwrap();
        assert!(channel.is_closed());
        assert_eq!(drain(&mut rx), vec![vec![97, 0, 0, 0, 31]]);

        channel.handle_close();
        assert!(!channel.is_orphaned());
    }

    #[test]
    fn test_eof_once() {
        let (channel, mut rx) = open_channel(ChannelConfig::default());
        channel.send_eof().unwrap();
        channel.send_eof().unwrap();
        assert!(channel.is_local_eof());
        assert_eq!(drain(&mut rx), vec![vec![96, 0, 0, 0, 9]]);
        assert_eq!(channel.remote_window_space(), 0);
    }

    #[test]
    fn test_fail_open() {
        let (channel, mut rx) = channel_with(ChannelConfig::default(), Arc::new(DefaultChannelHandler));
        channel.fail(&ChannelOpenError::new(ChannelOpenFailureReason::ConnectFailed));
        assert!(channel.is_close_completed());
        assert_eq!(channel.open_future().failure_reason().as_deref(), Some("connect failed"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_listener_sees_data() {
        let (channel, _rx) = open_channel(ChannelConfig::default());
        let listener = Arc::new(CountingListener::default());
        channel.add_listener(listener.clone());
        channel.handle_data(b"12345").unwrap();
        channel.handle_extended_data(1, b"678").unwrap();
        assert_eq!(listener.data.load(Ordering::SeqCst), 5);
    }
}
