//! SSH integration tests.
//!
//! These tests run a real client against a real server over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strand_platform::{StrandError, StrandResult};
use strand_proto::ssh::hostkey::fingerprint;
use strand_proto::ssh::{
    Channel, ChannelConfig, ChannelFactory, ChannelHandler, ChannelOpenError, ConnectionEvent,
    ConnectionListener, ConnectionManager, DefaultChannelHandler, Ed25519HostKey,
    FingerprintVerifier, GlobalRequestHandler, GlobalRequestResult, HostKey, RejectAllHostKeys,
    SshClient, SshClientConfig, SshConnection, SshServer, SshServerConfig, Version,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records everything the server side of a channel receives.
#[derive(Default)]
struct SinkHandler {
    received: Mutex<Vec<u8>>,
    frames: Mutex<Vec<usize>>,
}

impl ChannelHandler for SinkHandler {
    fn on_data(&self, _channel: &Channel, data: &[u8]) -> StrandResult<()> {
        self.received.lock().extend_from_slice(data);
        self.frames.lock().push(data.len());
        Ok(())
    }

    fn on_channel_request(&self, _channel: &Channel, request_type: &str, _payload: &[u8]) -> bool {
        request_type != "deny"
    }
}

struct SinkFactory {
    handler: Arc<SinkHandler>,
}

impl ChannelFactory for SinkFactory {
    fn create(
        &self,
        channel_type: &str,
        _payload: &[u8],
    ) -> Result<Arc<dyn ChannelHandler>, ChannelOpenError> {
        if channel_type != "session" {
            return Err(ChannelOpenError::new(
                strand_proto::ssh::ChannelOpenFailureReason::UnknownChannelType,
            ));
        }
        Ok(self.handler.clone())
    }
}

struct Echo;

impl GlobalRequestHandler for Echo {
    fn process(&self, _name: &str, _want_reply: bool, payload: &[u8]) -> GlobalRequestResult {
        GlobalRequestResult::Success(payload.to_vec())
    }
}

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<ConnectionEvent>>,
}

impl ConnectionListener for EventLog {
    fn on_event(&self, _connection: &SshConnection, event: &ConnectionEvent) {
        self.events.lock().push(event.clone());
    }
}

struct Fixture {
    server: SshServer,
    host_key_blob: Vec<u8>,
    sink: Arc<SinkHandler>,
}

async fn start_server() -> Fixture {
    let key = Ed25519HostKey::generate().unwrap();
    let host_key_blob = key.public_key_bytes();
    let host_key: Arc<dyn HostKey> = Arc::new(key);
    let sink = Arc::new(SinkHandler::default());

    let mut config = SshServerConfig::new(vec![host_key]);
    config.transport.version = Version::new("y", None);
    config.manager = Some(Arc::new(ConnectionManager::new()));
    config.channel = ChannelConfig {
        cache_incoming: false,
        ..ChannelConfig::default()
    };
    config.factory = Some(Arc::new(SinkFactory { handler: sink.clone() }));
    config
        .global_handlers
        .insert("echo@strand".to_string(), Arc::new(Echo));

    let server = SshServer::bind("127.0.0.1:0", config).await.unwrap();
    Fixture {
        server,
        host_key_blob,
        sink,
    }
}

fn client_config(fixture: &Fixture) -> SshClientConfig {
    let port = fixture.server.local_addr().unwrap().port();
    let verifier = FingerprintVerifier::new();
    verifier.add_fingerprint(
        format!("[127.0.0.1]:{}", port),
        fingerprint(&fixture.host_key_blob),
    );

    let mut config = SshClientConfig::default();
    config.transport.version = Version::new("x", None);
    config.verifier = Arc::new(verifier);
    config.username = Some("tester".to_string());
    config.manager = Some(Arc::new(ConnectionManager::new()));
    config
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_end_to_end_transfer() {
    init_tracing();
    let fixture = start_server().await;
    let addr = fixture.server.local_addr().unwrap().to_string();
    let events = Arc::new(EventLog::default());
    let mut config = client_config(&fixture);
    config.listeners.push(events.clone());

    let (client, server) = timeout(TEST_TIMEOUT, async {
        tokio::join!(SshClient::connect(&addr, config), fixture.server.accept())
    })
    .await
    .unwrap();
    let client = client.unwrap();
    let server = server.unwrap();

    assert_eq!(client.remote_identification().as_deref(), Some("SSH-2.0-y"));
    assert_eq!(server.remote_identification().as_deref(), Some("SSH-2.0-x"));
    assert_eq!(client.session_id(), server.session_id());
    assert_eq!(client.cipher_out(), server.cipher_in());
    assert_eq!(client.kex_algorithm(), server.kex_algorithm());
    assert_eq!(client.username().as_deref(), Some("tester"));
    assert!(client.is_authenticated());
    assert!(events
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, ConnectionEvent::HostKeyAccepted { fingerprint: fp } if *fp == fingerprint(&fixture.host_key_blob))));

    let channel = client
        .open_channel(Arc::new(DefaultChannelHandler))
        .await
        .unwrap();
    assert!(channel.is_open());
    assert_eq!(channel.remote_packet_size(), 32_768);
    assert_eq!(channel.remote_window_space(), 1_024_000);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    timeout(TEST_TIMEOUT, channel.send_data(&payload))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.remote_window_space(), 1_024_000 - 100_000);

    let sink = fixture.sink.clone();
    wait_until(|| sink.received.lock().len() == payload.len()).await;
    assert_eq!(*fixture.sink.received.lock(), payload);
    let frames = fixture.sink.frames.lock().clone();
    assert!(frames.len() >= 4);
    assert!(frames.iter().all(|len| *len <= 32_768));
    assert_eq!(frames.iter().sum::<usize>(), 100_000);

    // EOF makes the server close its side; the close completes on both ends.
    channel.send_eof().unwrap();
    assert!(timeout(TEST_TIMEOUT, channel.close_future().wait()).await.unwrap());
    assert!(channel.is_close_completed());

    let client_mux = client.multiplexer().unwrap().clone();
    assert_eq!(client_mux.channel_count(), 0);
    wait_until(|| server.multiplexer().map(|m| m.channel_count() == 0).unwrap_or(false)).await;

    client.disconnect(
        strand_proto::ssh::DisconnectReason::ByApplication,
        "test complete",
    );
    timeout(TEST_TIMEOUT, client.wait_for_close()).await.unwrap();
    timeout(TEST_TIMEOUT, server.wait_for_close()).await.unwrap();
    assert!(!client.is_connected());
    assert_eq!(server.disconnect_info().map(|i| i.code), Some(11));
    assert!(fixture.server.manager().is_empty());
}

#[tokio::test]
async fn test_channel_requests_and_global_requests() {
    init_tracing();
    let fixture = start_server().await;
    let addr = fixture.server.local_addr().unwrap().to_string();
    let config = client_config(&fixture);

    let (client, server) = timeout(TEST_TIMEOUT, async {
        tokio::join!(SshClient::connect(&addr, config), fixture.server.accept())
    })
    .await
    .unwrap();
    let client = client.unwrap();
    let _server = server.unwrap();

    let channel = client
        .open_channel(Arc::new(DefaultChannelHandler))
        .await
        .unwrap();

    let a = channel.send_channel_request("env", true, Vec::new()).unwrap();
    let b = channel.send_channel_request("deny", true, Vec::new()).unwrap();
    let c = channel.send_channel_request("exec", true, Vec::new()).unwrap();
    assert!(timeout(TEST_TIMEOUT, a.wait()).await.unwrap());
    assert!(!timeout(TEST_TIMEOUT, b.wait()).await.unwrap());
    assert!(timeout(TEST_TIMEOUT, c.wait()).await.unwrap());

    let reply = client
        .send_global_request("echo@strand", true, b"ping".to_vec())
        .unwrap();
    assert!(timeout(TEST_TIMEOUT, reply.wait()).await.unwrap());
    assert_eq!(reply.data().as_deref(), Some(&b"ping"[..]));

    let refused = client
        .send_global_request("unknown@strand", true, Vec::new())
        .unwrap();
    assert!(!timeout(TEST_TIMEOUT, refused.wait()).await.unwrap());

    channel.close();
    assert!(timeout(TEST_TIMEOUT, channel.close_future().wait()).await.unwrap());
}

#[tokio::test]
async fn test_rekey_keeps_session_id() {
    init_tracing();
    let fixture = start_server().await;
    let addr = fixture.server.local_addr().unwrap().to_string();
    let events = Arc::new(EventLog::default());
    let mut config = client_config(&fixture);
    config.listeners.push(events.clone());

    let (client, server) = timeout(TEST_TIMEOUT, async {
        tokio::join!(SshClient::connect(&addr, config), fixture.server.accept())
    })
    .await
    .unwrap();
    let client = client.unwrap();
    let server = server.unwrap();
    let session_id = client.session_id();

    client.request_rekey().unwrap();
    let log = events.clone();
    wait_until(|| {
        log.events
            .lock()
            .iter()
            .any(|e| *e == ConnectionEvent::KeysExchanged { first: false })
    })
    .await;

    // Traffic still flows under the new keys.
    let channel = client
        .open_channel(Arc::new(DefaultChannelHandler))
        .await
        .unwrap();
    channel.send_data(b"after rekey").await.unwrap();
    let sink = fixture.sink.clone();
    wait_until(|| sink.received.lock().ends_with(b"after rekey")).await;

    assert_eq!(client.session_id(), session_id);
    assert_eq!(server.session_id(), session_id);
}

#[tokio::test]
async fn test_host_key_rejection() {
    init_tracing();
    let fixture = start_server().await;
    let addr = fixture.server.local_addr().unwrap().to_string();
    let events = Arc::new(EventLog::default());
    let mut config = client_config(&fixture);
    config.verifier = Arc::new(RejectAllHostKeys);
    config.listeners.push(events.clone());

    let (client, server) = timeout(TEST_TIMEOUT, async {
        tokio::join!(SshClient::connect(&addr, config), fixture.server.accept())
    })
    .await
    .unwrap();

    match client {
        Err(StrandError::HostKeyRejected(msg)) => assert!(msg.contains("Host key not accepted")),
        other => panic!("Expected HostKeyRejected, got {:?}", other),
    }
    match server {
        Err(StrandError::Disconnected { code, .. }) => assert_eq!(code, 9),
        other => panic!("Expected the server to see a disconnect, got {:?}", other),
    }

    let events = events.events.lock().clone();
    assert!(events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::HostKeyRejected { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::Disconnected { reason: 9, .. })));
}
