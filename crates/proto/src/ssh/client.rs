//! SSH client.
//!
//! # Example
//!
//! ```rust,no_run
//! use strand_proto::ssh::channel::DefaultChannelHandler;
//! use strand_proto::ssh::client::{SshClient, SshClientConfig};
//! use strand_proto::ssh::hostkey::FingerprintVerifier;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let verifier = FingerprintVerifier::new();
//! verifier.add_fingerprint("[127.0.0.1]:2222", "SHA256:...");
//!
//! let mut config = SshClientConfig::default();
//! config.verifier = Arc::new(verifier);
//!
//! let connection = SshClient::connect("127.0.0.1:2222", config).await?;
//! let channel = connection.open_channel(Arc::new(DefaultChannelHandler)).await?;
//! channel.send_data(b"hello").await?;
//! channel.close();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use strand_platform::{StrandError, StrandResult};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::channel::ChannelConfig;
use super::connection_mgr::{
    ConnectionListener, ConnectionManager, ConnectionSettings, SshConnection,
};
use super::driver::{self, OutboundQueue};
use super::hostkey::{host_label, AcceptAnyHostKey, HostKeyVerifier};
use super::message::DisconnectReason;
use super::multiplexer::{ChannelFactory, GlobalRequestHandler};
use super::transport::{Role, TransportConfig, TransportEngine, CONNECTION_SERVICE};

/// SSH client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// Transport settings.
    pub transport: TransportConfig,
    /// Host key verifier. Defaults to accepting any key.
    pub verifier: Arc<dyn HostKeyVerifier>,
    /// Username recorded on the connection.
    pub username: Option<String>,
    /// Bound on TCP connect plus the first key exchange and service start.
    pub connect_timeout: Duration,
    /// Bound on channel open confirmation.
    pub open_timeout: Duration,
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// Settings for channels on this connection.
    pub channel: ChannelConfig,
    /// Factory for channels the server opens.
    pub factory: Option<Arc<dyn ChannelFactory>>,
    /// Global request handlers by request name.
    pub global_handlers: HashMap<String, Arc<dyn GlobalRequestHandler>>,
    /// Registry the connection joins. The process-wide registry when unset.
    pub manager: Option<Arc<ConnectionManager>>,
    /// Listeners installed before the transport starts.
    pub listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            verifier: Arc::new(AcceptAnyHostKey),
            username: None,
            connect_timeout: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
            channel: ChannelConfig::default(),
            factory: None,
            global_handlers: HashMap::new(),
            manager: None,
            listeners: Vec::new(),
        }
    }
}

impl SshClientConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the configuration.
    pub fn validate(&self) -> StrandResult<()> {
        self.transport.validate()?;
        self.channel.validate()?;
        if self.connect_timeout.is_zero() {
            return Err(StrandError::Config("connect_timeout must be non-zero".to_string()));
        }
        if self.open_timeout.is_zero() {
            return Err(StrandError::Config("open_timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            role: Role::Client,
            channel_config: self.channel.clone(),
            open_timeout: self.open_timeout,
            factory: self.factory.clone(),
            global_handlers: self.global_handlers.clone(),
            manager: self.manager.clone().unwrap_or_else(ConnectionManager::global),
            listeners: self.listeners.clone(),
            username: self.username.clone(),
        }
    }
}

/// SSH client entry point.
pub struct SshClient;

impl SshClient {
    /// Connects to `addr`, completes the first key exchange and starts the
    /// `ssh-connection` service.
    ///
    /// # Errors
    ///
    /// - [`StrandError::Timeout`] if `connect_timeout` elapses
    /// - [`StrandError::HostKeyRejected`] if the verifier or the signature
    ///   check refuses the server
    /// - [`StrandError::Disconnected`] if the transport fails otherwise
    pub async fn connect(addr: &str, config: SshClientConfig) -> StrandResult<Arc<SshConnection>> {
        config.validate()?;
        let deadline = Instant::now() + config.connect_timeout;
        let elapsed = || {
            StrandError::Timeout(format!(
                "Connecting to {} took longer than {:?}",
                addr, config.connect_timeout
            ))
        };

        let connection = match timeout_at(deadline, Self::establish(addr, &config)).await {
            Ok(result) => result?,
            Err(_) => return Err(elapsed()),
        };

        match timeout_at(deadline, Self::handshake(&connection)).await {
            Ok(Ok(())) => {
                info!(connection = connection.id(), remote = %connection.remote_addr(), "Client connected");
                Ok(connection)
            }
            Ok(Err(e)) => {
                connection.disconnect(DisconnectReason::ByApplication, "Connection setup failed");
                Err(e)
            }
            Err(_) => {
                warn!(connection = connection.id(), "Connection setup timed out");
                connection.disconnect(DisconnectReason::ByApplication, "Connection setup timed out");
                connection.unregister();
                Err(elapsed())
            }
        }
    }

    /// Opens the socket and starts the driver. The connection is registered
    /// before any protocol exchange.
    async fn establish(addr: &str, config: &SshClientConfig) -> StrandResult<Arc<SshConnection>> {
        let remote: SocketAddr = lookup_host(addr).await?.next().ok_or_else(|| {
            StrandError::Config(format!("Address {} did not resolve", addr))
        })?;
        let stream = TcpStream::connect(remote).await?;
        stream.set_nodelay(config.tcp_nodelay)?;
        let local = stream.local_addr()?;
        debug!(%remote, %local, "TCP connection established");

        let label = host_label(&remote.ip().to_string(), remote.port());
        let engine = TransportEngine::client(config.transport.clone(), config.verifier.clone(), label)?;

        let (outbound, commands) = OutboundQueue::new();
        let connection = SshConnection::new(config.settings(), outbound, remote, local);
        driver::spawn(stream, engine, commands, connection.clone());
        Ok(connection)
    }

    async fn handshake(connection: &Arc<SshConnection>) -> StrandResult<()> {
        if !connection.connect_future().wait().await {
            return Err(Self::failure(connection, "Key exchange failed"));
        }
        let service = connection.start_service(CONNECTION_SERVICE)?;
        if !service.wait().await {
            return Err(Self::failure(connection, "Service request failed"));
        }
        Ok(())
    }

    fn failure(connection: &SshConnection, fallback: &str) -> StrandError {
        match connection.disconnect_info() {
            Some(info) => info.to_error(),
            None => StrandError::Protocol(fallback.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SshClientConfig::new();
        assert!(config.validate().is_ok());
        assert!(config.tcp_nodelay);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.manager.is_none());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = SshClientConfig {
            open_timeout: Duration::ZERO,
            ..SshClientConfig::default()
        };
        match config.validate() {
            Err(StrandError::Config(msg)) => assert!(msg.contains("open_timeout")),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = SshClient::connect(&addr.to_string(), SshClientConfig::default()).await;
        assert!(matches!(result, Err(StrandError::Io(_))));
    }

    #[tokio::test]
    async fn test_connect_timeout_releases_connection() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts and never answers; returns what it saw once the client hangs up.
        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            socket.read_to_end(&mut seen).await.unwrap();
            seen
        });

        let manager = Arc::new(ConnectionManager::new());
        let config = SshClientConfig {
            connect_timeout: Duration::from_millis(300),
            manager: Some(manager.clone()),
            ..SshClientConfig::default()
        };
        match SshClient::connect(&addr.to_string(), config).await {
            Err(e) => assert!(e.is_timeout()),
            Ok(_) => panic!("Expected a timeout"),
        }
        assert!(manager.is_empty());

        let seen = tokio::time::timeout(Duration::from_secs(5), peer)
            .await
            .unwrap()
            .unwrap();
        assert!(seen.starts_with(b"SSH-2.0-"));
    }
}
