//! SSH connections and the connection registry.
//!
//! An [`SshConnection`] is the application's handle on one transport. The
//! socket and the [`TransportEngine`](super::transport::TransportEngine) live
//! in the connection's I/O driver task; the connection talks to it only
//! through its [`OutboundQueue`] and receives transport events from it.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};
use strand_platform::{StrandError, StrandResult};
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument, Span};

use super::channel::{Channel, ChannelConfig, ChannelHandler};
use super::driver::{DriverCommand, OutboundQueue};
use super::future::RequestFuture;
use super::kex::NegotiatedAlgorithms;
use super::message::DisconnectReason;
use super::multiplexer::{ChannelFactory, GlobalRequestHandler, Multiplexer};
use super::transport::{Role, TransportEngine, TransportEvent, CONNECTION_SERVICE};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

static GLOBAL_MANAGER: Lazy<Arc<ConnectionManager>> =
    Lazy::new(|| Arc::new(ConnectionManager::new()));

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The server host key was accepted.
    HostKeyAccepted {
        /// `SHA256:` fingerprint.
        fingerprint: String,
    },
    /// The server host key was rejected.
    HostKeyRejected {
        /// `SHA256:` fingerprint.
        fingerprint: String,
    },
    /// A key exchange completed.
    KeysExchanged {
        /// True for the first exchange.
        first: bool,
    },
    /// A service started.
    ServiceStarted(String),
    /// The connection is gone. Fired once.
    Disconnected {
        /// Disconnect reason code.
        reason: u32,
        /// Description.
        description: String,
    },
}

/// Observer of connection events.
pub trait ConnectionListener: Send + Sync {
    /// Called for every event, on the I/O driver task.
    fn on_event(&self, connection: &SshConnection, event: &ConnectionEvent);
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    /// Disconnect reason code.
    pub code: u32,
    /// Description.
    pub description: String,
    /// True if the host key or its signature was rejected.
    pub host_key_rejected: bool,
}

impl DisconnectInfo {
    /// Creates the record for `reason`.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            code: reason.code(),
            description: description.into(),
            host_key_rejected: false,
        }
    }

    /// Classifies a fatal error.
    pub fn from_error(error: &StrandError) -> Self {
        let (reason, rejected) = match error {
            StrandError::HostKeyRejected(_) => (DisconnectReason::HostKeyNotVerifiable, true),
            StrandError::Security(_) => (DisconnectReason::MacError, false),
            StrandError::Disconnected { code, description } => {
                return Self {
                    code: *code,
                    description: description.clone(),
                    host_key_rejected: false,
                }
            }
            StrandError::Io(_) => (DisconnectReason::ConnectionLost, false),
            _ => (DisconnectReason::ProtocolError, false),
        };
        let description = match error {
            StrandError::HostKeyRejected(msg) => msg.clone(),
            other => other.to_string(),
        };
        Self {
            code: reason.code(),
            description,
            host_key_rejected: rejected,
        }
    }

    /// Error surfaced to waiters.
    pub fn to_error(&self) -> StrandError {
        if self.host_key_rejected {
            StrandError::HostKeyRejected(self.description.clone())
        } else {
            StrandError::Disconnected {
                code: self.code,
                description: self.description.clone(),
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TransportInfo {
    session_id: Option<Vec<u8>>,
    local_identification: String,
    remote_identification: Option<String>,
    negotiated: Option<NegotiatedAlgorithms>,
}

/// Settings a client or server hands to each new connection.
#[derive(Clone)]
pub(crate) struct ConnectionSettings {
    pub(crate) role: Role,
    pub(crate) channel_config: ChannelConfig,
    pub(crate) open_timeout: Duration,
    pub(crate) factory: Option<Arc<dyn ChannelFactory>>,
    pub(crate) global_handlers: HashMap<String, Arc<dyn GlobalRequestHandler>>,
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) listeners: Vec<Arc<dyn ConnectionListener>>,
    pub(crate) username: Option<String>,
}

/// One SSH connection.
pub struct SshConnection {
    id: u64,
    role: Role,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    start_time: SystemTime,
    span: Span,
    outbound: OutboundQueue,
    channel_config: ChannelConfig,
    open_timeout: Duration,
    factory: Option<Arc<dyn ChannelFactory>>,
    global_handlers: HashMap<String, Arc<dyn GlobalRequestHandler>>,
    multiplexer: OnceCell<Arc<Multiplexer>>,
    properties: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    username: RwLock<Option<String>>,
    authenticated: AtomicBool,
    transport: RwLock<TransportInfo>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    connect_future: RequestFuture,
    pending_services: Mutex<VecDeque<(String, RequestFuture)>>,
    close_future: RequestFuture,
    disconnect_info: Mutex<Option<DisconnectInfo>>,
    closed: AtomicBool,
    manager: Arc<ConnectionManager>,
}

impl SshConnection {
    pub(crate) fn new(
        settings: ConnectionSettings,
        outbound: OutboundQueue,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Arc<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("connection", id, role = ?settings.role, peer = %remote_addr);
        let connection = Arc::new(Self {
            id,
            role: settings.role,
            remote_addr,
            local_addr,
            start_time: SystemTime::now(),
            span,
            outbound,
            channel_config: settings.channel_config,
            open_timeout: settings.open_timeout,
            factory: settings.factory,
            global_handlers: settings.global_handlers,
            multiplexer: OnceCell::new(),
            properties: RwLock::new(HashMap::new()),
            username: RwLock::new(settings.username),
            authenticated: AtomicBool::new(false),
            transport: RwLock::new(TransportInfo::default()),
            listeners: RwLock::new(settings.listeners),
            connect_future: RequestFuture::new(format!("connection {} key exchange", id)),
            pending_services: Mutex::new(VecDeque::new()),
            close_future: RequestFuture::new(format!("connection {} close", id)),
            disconnect_info: Mutex::new(None),
            closed: AtomicBool::new(false),
            manager: settings.manager,
        });
        connection.manager.register(connection.clone());
        connection
    }

    // ---- identity ----

    /// Connection id, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Client or server side.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// When the socket was established.
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Tracing span carrying the connection id.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Username associated with the connection.
    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    /// Sets the username.
    pub fn set_username(&self, username: impl Into<String>) {
        *self.username.write() = Some(username.into());
    }

    /// True once the connection protocol service runs.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// True until the connection tears down.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.outbound.is_connected()
    }

    /// Session identifier.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.transport.read().session_id.clone()
    }

    /// Our identification line.
    pub fn local_identification(&self) -> String {
        self.transport.read().local_identification.clone()
    }

    /// Peer identification line.
    pub fn remote_identification(&self) -> Option<String> {
        self.transport.read().remote_identification.clone()
    }

    /// Algorithms of the most recent key exchange.
    pub fn negotiated_algorithms(&self) -> Option<NegotiatedAlgorithms> {
        self.transport.read().negotiated.clone()
    }

    fn negotiated_field(&self, pick: impl Fn(&NegotiatedAlgorithms) -> &String) -> Option<String> {
        self.transport.read().negotiated.as_ref().map(|n| pick(n).clone())
    }

    fn outgoing_is_c2s(&self) -> bool {
        self.role == Role::Client
    }

    /// Cipher protecting received packets.
    pub fn cipher_in(&self) -> Option<String> {
        if self.outgoing_is_c2s() {
            self.negotiated_field(|n| &n.cipher_s2c)
        } else {
            self.negotiated_field(|n| &n.cipher_c2s)
        }
    }

    /// Cipher protecting sent packets.
    pub fn cipher_out(&self) -> Option<String> {
        if self.outgoing_is_c2s() {
            self.negotiated_field(|n| &n.cipher_c2s)
        } else {
            self.negotiated_field(|n| &n.cipher_s2c)
        }
    }

    /// MAC for received packets.
    pub fn mac_in(&self) -> Option<String> {
        if self.outgoing_is_c2s() {
            self.negotiated_field(|n| &n.mac_s2c)
        } else {
            self.negotiated_field(|n| &n.mac_c2s)
        }
    }

    /// MAC for sent packets.
    pub fn mac_out(&self) -> Option<String> {
        if self.outgoing_is_c2s() {
            self.negotiated_field(|n| &n.mac_c2s)
        } else {
            self.negotiated_field(|n| &n.mac_s2c)
        }
    }

    /// Compression for received packets.
    pub fn compression_in(&self) -> Option<String> {
        if self.outgoing_is_c2s() {
            self.negotiated_field(|n| &n.compression_s2c)
        } else {
            self.negotiated_field(|n| &n.compression_c2s)
        }
    }

    /// Compression for sent packets.
    pub fn compression_out(&self) -> Option<String> {
        if self.outgoing_is_c2s() {
            self.negotiated_field(|n| &n.compression_c2s)
        } else {
            self.negotiated_field(|n| &n.compression_s2c)
        }
    }

    /// Negotiated host key algorithm.
    pub fn host_key_algorithm(&self) -> Option<String> {
        self.negotiated_field(|n| &n.host_key)
    }

    /// Negotiated key exchange method.
    pub fn kex_algorithm(&self) -> Option<String> {
        self.negotiated_field(|n| &n.kex)
    }

    /// Why the connection ended, once it has.
    pub fn disconnect_info(&self) -> Option<DisconnectInfo> {
        self.disconnect_info.lock().clone()
    }

    // ---- properties ----

    /// Stores a shared value under `key`.
    pub fn set_property(&self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.properties.write().insert(key.into(), value);
    }

    /// Returns the value under `key` if it has type `T`.
    pub fn property<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.properties.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Removes the value under `key`.
    pub fn remove_property(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.properties.write().remove(key)
    }

    // ---- listeners ----

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    fn fire(&self, event: ConnectionEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(self, &event);
        }
    }

    // ---- operations ----

    /// Multiplexer, available once `ssh-connection` has started.
    pub fn multiplexer(&self) -> StrandResult<&Arc<Multiplexer>> {
        self.multiplexer.get().ok_or_else(|| {
            StrandError::IllegalState("The ssh-connection service has not started".to_string())
        })
    }

    /// Opens a channel and waits for the peer to confirm it.
    ///
    /// # Errors
    ///
    /// - [`StrandError::Timeout`] if no answer arrives within the open
    ///   timeout; the channel is force-closed
    /// - [`StrandError::Channel`] if the peer refuses the open
    pub async fn open_channel(&self, handler: Arc<dyn ChannelHandler>) -> StrandResult<Arc<Channel>> {
        let channel = self.multiplexer()?.open_channel(handler)?;
        match channel.open_future().wait_timeout(self.open_timeout).await {
            Ok(true) => Ok(channel),
            Ok(false) => Err(StrandError::Channel(format!(
                "Channel open failed: {}",
                channel
                    .open_future()
                    .failure_reason()
                    .unwrap_or_else(|| "unknown reason".to_string())
            ))),
            Err(e) => {
                channel.force_close();
                Err(e)
            }
        }
    }

    /// Sends a global request.
    pub fn send_global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> StrandResult<RequestFuture> {
        self.multiplexer()?.send_global_request(name, want_reply, payload)
    }

    /// Requests a transport service. The future resolves on acceptance.
    pub fn start_service(&self, name: &str) -> StrandResult<RequestFuture> {
        let future = RequestFuture::new(format!("service {}", name));
        self.outbound.command(DriverCommand::RequestService {
            name: name.to_string(),
            future: future.clone(),
        })?;
        Ok(future)
    }

    /// Starts a key re-exchange.
    pub fn request_rekey(&self) -> StrandResult<()> {
        self.outbound.command(DriverCommand::Rekey)
    }

    /// Sends DISCONNECT and shuts the connection down.
    pub fn disconnect(&self, reason: DisconnectReason, description: &str) {
        let command = DriverCommand::Disconnect {
            reason,
            description: description.to_string(),
        };
        if self.outbound.command(command).is_err() {
            debug!(connection = self.id, "Disconnect on a closed connection");
        }
    }

    /// Waits until the connection has torn down.
    pub async fn wait_for_close(&self) {
        self.close_future.wait().await;
    }

    /// Future resolved by the first key exchange.
    pub fn connect_future(&self) -> &RequestFuture {
        &self.connect_future
    }

    /// Runs `future` on the runtime inside the connection's span.
    pub fn spawn_task<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(future.instrument(self.span.clone()))
    }

    // ---- driver side ----

    pub(crate) fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub(crate) fn push_service_request(&self, name: String, future: RequestFuture) {
        self.pending_services.lock().push_back((name, future));
    }

    pub(crate) fn update_transport_info(&self, engine: &TransportEngine) {
        let mut info = self.transport.write();
        info.session_id = engine.session_id().map(<[u8]>::to_vec);
        info.local_identification = engine.local_identification().to_string();
        info.remote_identification = engine.remote_identification().map(str::to_string);
        info.negotiated = engine.negotiated().cloned();
    }

    fn start_connection_service(&self) -> &Arc<Multiplexer> {
        self.multiplexer.get_or_init(|| {
            let multiplexer = Multiplexer::new(self.outbound.clone(), self.channel_config.clone());
            if let Some(factory) = &self.factory {
                multiplexer.set_channel_factory(factory.clone());
            }
            for (name, handler) in &self.global_handlers {
                multiplexer.register_global_handler(name.clone(), handler.clone());
            }
            multiplexer
        })
    }

    /// Applies one transport event. Errors are fatal to the transport.
    pub(crate) fn handle_event(&self, event: TransportEvent) -> StrandResult<()> {
        match event {
            TransportEvent::Message(payload) => match self.multiplexer.get() {
                Some(multiplexer) => multiplexer.handle_message(&payload),
                None => Err(StrandError::Protocol(
                    "Connection message before ssh-connection started".to_string(),
                )),
            },
            TransportEvent::HostKeyAccepted { fingerprint } => {
                self.fire(ConnectionEvent::HostKeyAccepted { fingerprint });
                Ok(())
            }
            TransportEvent::HostKeyRejected { fingerprint } => {
                self.fire(ConnectionEvent::HostKeyRejected { fingerprint });
                Ok(())
            }
            TransportEvent::KeysExchanged { first } => {
                if first {
                    info!(connection = self.id, "Connection established");
                    self.connect_future.done(true);
                }
                self.fire(ConnectionEvent::KeysExchanged { first });
                Ok(())
            }
            TransportEvent::ServiceStarted(name) => {
                if name == CONNECTION_SERVICE {
                    self.start_connection_service();
                    self.authenticated.store(true, Ordering::Release);
                }
                let matched = {
                    let mut pending = self.pending_services.lock();
                    match pending.iter().position(|(n, _)| *n == name) {
                        Some(index) => pending.remove(index),
                        None => None,
                    }
                };
                if let Some((_, future)) = matched {
                    future.done(true);
                }
                self.fire(ConnectionEvent::ServiceStarted(name));
                Ok(())
            }
            TransportEvent::Disconnected { code, description } => {
                self.teardown(DisconnectInfo {
                    code,
                    description,
                    host_key_rejected: false,
                });
                Ok(())
            }
        }
    }

    /// Leaves the manager ahead of teardown, for setups abandoned by the caller.
    pub(crate) fn unregister(&self) {
        self.manager.unregister(self.id);
    }

    /// Tears the connection down once.
    pub(crate) fn teardown(&self, info: DisconnectInfo) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            connection = self.id,
            code = info.code,
            description = %info.description,
            "Connection closed"
        );
        self.outbound.mark_disconnected();
        *self.disconnect_info.lock() = Some(info.clone());

        self.connect_future.fail(info.description.clone());
        let pending: Vec<(String, RequestFuture)> = self.pending_services.lock().drain(..).collect();
        for (_, future) in pending {
            future.fail(info.description.clone());
        }
        if let Some(multiplexer) = self.multiplexer.get() {
            multiplexer.close_all();
        }

        self.fire(ConnectionEvent::Disconnected {
            reason: info.code,
            description: info.description,
        });
        self.listeners.write().clear();
        self.properties.write().clear();
        self.manager.unregister(self.id);
        self.close_future.done(true);
    }
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<u64, Arc<SshConnection>>,
}

impl ConnectionManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used when none is injected.
    pub fn global() -> Arc<ConnectionManager> {
        GLOBAL_MANAGER.clone()
    }

    /// Adds a connection.
    pub fn register(&self, connection: Arc<SshConnection>) {
        self.connections.insert(connection.id(), connection);
    }

    /// Removes a connection.
    pub fn unregister(&self, id: u64) -> Option<Arc<SshConnection>> {
        self.connections.remove(&id).map(|(_, c)| c)
    }

    /// Looks up a connection.
    pub fn get(&self, id: u64) -> Option<Arc<SshConnection>> {
        self.connections.get(&id).map(|e| e.value().clone())
    }

    /// All live connections.
    pub fn connections(&self) -> Vec<Arc<SshConnection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::channel::DefaultChannelHandler;
    use crate::ssh::connection::ChannelOpenConfirmation;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ConnectionEvent>>,
    }

    impl ConnectionListener for Recorder {
        fn on_event(&self, _connection: &SshConnection, event: &ConnectionEvent) {
            self.events.lock().push(event.clone());
        }
    }

    fn settings(manager: Arc<ConnectionManager>) -> ConnectionSettings {
        ConnectionSettings {
            role: Role::Client,
            channel_config: ChannelConfig::default(),
            open_timeout: Duration::from_secs(1),
            factory: None,
            global_handlers: HashMap::new(),
            manager,
            listeners: Vec::new(),
            username: Some("alice".to_string()),
        }
    }

    fn connection(
        manager: Arc<ConnectionManager>,
    ) -> (Arc<SshConnection>, tokio::sync::mpsc::UnboundedReceiver<DriverCommand>) {
        let (outbound, rx) = OutboundQueue::new();
        let addr: SocketAddr = "127.0.0.1:22".parse().unwrap();
        (SshConnection::new(settings(manager), outbound, addr, addr), rx)
    }

    #[test]
    fn test_properties() {
        let (conn, _rx) = connection(Arc::new(ConnectionManager::new()));
        conn.set_property("count", Arc::new(42u32));
        assert_eq!(conn.property::<u32>("count").as_deref(), Some(&42));
        assert!(conn.property::<String>("count").is_none());
        assert!(conn.remove_property("count").is_some());
        assert!(conn.property::<u32>("count").is_none());
    }

    #[test]
    fn test_manager_registration() {
        let manager = Arc::new(ConnectionManager::new());
        let (conn, _rx) = connection(manager.clone());
        assert_eq!(manager.len(), 1);
        assert!(manager.get(conn.id()).is_some());

        conn.teardown(DisconnectInfo::new(DisconnectReason::ByApplication, "done"));
        assert!(manager.is_empty());
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_channel_open_requires_service() {
        let (conn, _rx) = connection(Arc::new(ConnectionManager::new()));
        assert!(matches!(conn.multiplexer(), Err(StrandError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_service_start_creates_multiplexer() {
        let (conn, mut rx) = connection(Arc::new(ConnectionManager::new()));
        let future = conn.start_service("ssh-connection").unwrap();
        match rx.recv().await {
            Some(DriverCommand::RequestService { name, future }) => {
                assert_eq!(name, "ssh-connection");
                conn.push_service_request(name, future);
            }
            other => panic!("Expected RequestService, got {:?}", other),
        }

        conn.handle_event(TransportEvent::ServiceStarted("ssh-connection".to_string()))
            .unwrap();
        assert!(future.wait().await);
        assert!(conn.is_authenticated());
        assert!(conn.multiplexer().is_ok());
    }

    #[tokio::test]
    async fn test_teardown_closes_everything_once() {
        let manager = Arc::new(ConnectionManager::new());
        let (conn, _rx) = connection(manager.clone());
        let recorder = Arc::new(Recorder::default());
        conn.add_listener(recorder.clone());
        conn.set_property("k", Arc::new(1u8));

        conn.handle_event(TransportEvent::ServiceStarted("ssh-connection".to_string()))
            .unwrap();
        let mux = conn.multiplexer().unwrap().clone();
        let channel = mux.open_channel(Arc::new(DefaultChannelHandler)).unwrap();
        mux.handle_message(&ChannelOpenConfirmation::new(0, 0, 100, 100, vec![]).to_bytes())
            .unwrap();

        let info = DisconnectInfo::new(DisconnectReason::ConnectionLost, "eof");
        conn.teardown(info.clone());
        conn.teardown(info.clone());

        assert!(channel.is_close_completed());
        assert_eq!(mux.channel_count(), 0);
        assert!(conn.property::<u8>("k").is_none());
        assert!(conn.connect_future().is_done());
        assert_eq!(conn.disconnect_info(), Some(info));
        conn.wait_for_close().await;

        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                ConnectionEvent::ServiceStarted("ssh-connection".to_string()),
                ConnectionEvent::Disconnected {
                    reason: 10,
                    description: "eof".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_disconnect_info_classification() {
        let info = DisconnectInfo::from_error(&StrandError::HostKeyRejected(
            "Host key not accepted".to_string(),
        ));
        assert_eq!(info.code, 9);
        assert!(matches!(info.to_error(), StrandError::HostKeyRejected(msg) if msg == "Host key not accepted"));

        let info = DisconnectInfo::from_error(&StrandError::Protocol("desync".to_string()));
        assert_eq!(info.code, 2);
        assert!(matches!(info.to_error(), StrandError::Disconnected { code: 2, .. }));
    }

    #[test]
    fn test_global_manager_is_shared() {
        assert!(Arc::ptr_eq(&ConnectionManager::global(), &ConnectionManager::global()));
    }
}
