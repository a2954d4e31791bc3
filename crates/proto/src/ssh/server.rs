//! SSH server.
//!
//! # Example
//!
//! ```rust,no_run
//! use strand_proto::ssh::hostkey::{Ed25519HostKey, HostKey};
//! use strand_proto::ssh::server::{SshServer, SshServerConfig};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate()?);
//! let config = SshServerConfig::new(vec![host_key]);
//! let server = SshServer::bind("127.0.0.1:2222", config).await?;
//!
//! loop {
//!     let connection = server.accept().await?;
//!     println!("Accepted {}", connection.remote_addr());
//! }
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use strand_platform::{StrandError, StrandResult};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::channel::ChannelConfig;
use super::connection_mgr::{
    ConnectionListener, ConnectionManager, ConnectionSettings, SshConnection,
};
use super::driver::{self, OutboundQueue};
use super::hostkey::HostKey;
use super::message::DisconnectReason;
use super::multiplexer::{ChannelFactory, GlobalRequestHandler};
use super::transport::{Role, TransportConfig, TransportEngine};

/// SSH server configuration.
#[derive(Clone)]
pub struct SshServerConfig {
    /// Transport settings.
    pub transport: TransportConfig,
    /// Keys the server signs exchanges with.
    pub host_keys: Vec<Arc<dyn HostKey>>,
    /// Bound on the first key exchange of an accepted connection.
    pub accept_timeout: Duration,
    /// Bound on channel open confirmation for server-opened channels.
    pub open_timeout: Duration,
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// Settings for channels on accepted connections.
    pub channel: ChannelConfig,
    /// Factory for channels clients open.
    pub factory: Option<Arc<dyn ChannelFactory>>,
    /// Global request handlers by request name.
    pub global_handlers: HashMap<String, Arc<dyn GlobalRequestHandler>>,
    /// Registry accepted connections join. The process-wide registry when unset.
    pub manager: Option<Arc<ConnectionManager>>,
    /// Listeners installed on every accepted connection.
    pub listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl SshServerConfig {
    /// Creates a configuration signing with `host_keys`.
    pub fn new(host_keys: Vec<Arc<dyn HostKey>>) -> Self {
        Self {
            transport: TransportConfig::default(),
            host_keys,
            accept_timeout: Duration::from_secs(120),
            open_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
            channel: ChannelConfig::default(),
            factory: None,
            global_handlers: HashMap::new(),
            manager: None,
            listeners: Vec::new(),
        }
    }

    /// Checks the configuration.
    pub fn validate(&self) -> StrandResult<()> {
        self.transport.validate()?;
        self.channel.validate()?;
        if self.host_keys.is_empty() {
            return Err(StrandError::Config("A server needs at least one host key".to_string()));
        }
        if self.accept_timeout.is_zero() {
            return Err(StrandError::Config("accept_timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    fn settings(&self, manager: Arc<ConnectionManager>) -> ConnectionSettings {
        ConnectionSettings {
            role: Role::Server,
            channel_config: self.channel.clone(),
            open_timeout: self.open_timeout,
            factory: self.factory.clone(),
            global_handlers: self.global_handlers.clone(),
            manager,
            listeners: self.listeners.clone(),
            username: None,
        }
    }
}

/// Listening SSH server.
pub struct SshServer {
    listener: TcpListener,
    config: SshServerConfig,
    manager: Arc<ConnectionManager>,
}

impl SshServer {
    /// Binds to `addr`.
    pub async fn bind(addr: &str, config: SshServerConfig) -> StrandResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        let manager = config.manager.clone().unwrap_or_else(ConnectionManager::global);
        info!(addr = %listener.local_addr()?, "SSH server listening");
        Ok(Self {
            listener,
            config,
            manager,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> StrandResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Registry of accepted connections.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Accepts one connection and waits for its first key exchange.
    ///
    /// # Errors
    ///
    /// - [`StrandError::Io`] if accepting the socket fails
    /// - [`StrandError::Timeout`] if the exchange exceeds `accept_timeout`
    /// - [`StrandError::Disconnected`] if the exchange fails
    pub async fn accept(&self) -> StrandResult<Arc<SshConnection>> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(self.config.tcp_nodelay)?;
        let local = stream.local_addr()?;
        debug!(%remote, "Accepted TCP connection");

        let engine = TransportEngine::server(self.config.transport.clone(), self.config.host_keys.clone())?;
        let (outbound, commands) = OutboundQueue::new();
        let connection = SshConnection::new(self.config.settings(self.manager.clone()), outbound, remote, local);
        driver::spawn(stream, engine, commands, connection.clone());

        match tokio::time::timeout(self.config.accept_timeout, connection.connect_future().wait()).await {
            Ok(true) => {
                info!(connection = connection.id(), %remote, "Server connection established");
                Ok(connection)
            }
            Ok(false) => Err(match connection.disconnect_info() {
                Some(info) => info.to_error(),
                None => StrandError::Protocol("Key exchange failed".to_string()),
            }),
            Err(_) => {
                warn!(%remote, "Key exchange timed out");
                connection.disconnect(DisconnectReason::ByApplication, "Key exchange timed out");
                connection.unregister();
                Err(StrandError::Timeout(format!(
                    "Key exchange with {} took longer than {:?}",
                    remote, self.config.accept_timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;

    fn config() -> SshServerConfig {
        let key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate().unwrap());
        SshServerConfig::new(vec![key])
    }

    #[test]
    fn test_config_requires_host_key() {
        match SshServerConfig::new(Vec::new()).validate() {
            Err(StrandError::Config(msg)) => assert!(msg.contains("host key")),
            other => panic!("Expected Config error, got {:?}", other),
        }
        assert!(config().validate().is_ok());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let manager = Arc::new(ConnectionManager::new());
        let mut config = config();
        config.manager = Some(manager.clone());
        let server = SshServer::bind("127.0.0.1:0", config).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(Arc::ptr_eq(server.manager(), &manager));
    }

    #[tokio::test]
    async fn test_accept_times_out_on_silent_peer() {
        let mut config = config();
        config.accept_timeout = Duration::from_millis(200);
        config.manager = Some(Arc::new(ConnectionManager::new()));
        let server = SshServer::bind("127.0.0.1:0", config).await.unwrap();
        let addr = server.local_addr().unwrap();

        let _peer = tokio::net::TcpStream::connect(addr).await.unwrap();
        match server.accept().await {
            Err(e) => assert!(e.is_timeout()),
            Ok(_) => panic!("Expected a timeout"),
        }
        assert!(server.manager().is_empty());
    }
}
