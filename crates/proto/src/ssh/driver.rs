//! Per-connection I/O driver.
//!
//! One reactor task owns the [`TransportEngine`](super::transport::TransportEngine)
//! and the read half of the socket; one writer task owns the write half.
//! Every other task talks to the connection through the [`OutboundQueue`],
//! whose enqueue order is the wire order.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use strand_platform::{StrandError, StrandResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn, Instrument};

use super::connection_mgr::{DisconnectInfo, SshConnection};
use super::future::RequestFuture;
use super::message::{ignore_message, DisconnectReason};
use super::transport::{OutboundChunk, TransportEngine, TransportEvent};

tokio::task_local! {
    static DRIVER_TASK: ();
}

/// True when called from a connection's reactor task.
pub fn is_driver_task() -> bool {
    DRIVER_TASK.try_with(|_| ()).is_ok()
}

/// Runs `future` marked as a reactor task.
pub(crate) async fn run_as_driver<F: std::future::Future>(future: F) -> F::Output {
    DRIVER_TASK.scope((), future).await
}

/// Notifier completed once a message has been written to the socket.
pub type SentNotifier = oneshot::Sender<StrandResult<()>>;

/// Work handed to the reactor task.
#[derive(Debug)]
pub enum DriverCommand {
    /// Encode, protect and write a message payload.
    Send {
        /// Message payload starting with the message id.
        payload: Vec<u8>,
        /// Completed after the payload reached the socket.
        sent: Option<SentNotifier>,
    },
    /// Start a key re-exchange.
    Rekey,
    /// Request a transport service.
    RequestService {
        /// Service name.
        name: String,
        /// Resolved when the service is accepted.
        future: RequestFuture,
    },
    /// Send DISCONNECT and shut down.
    Disconnect {
        /// Reason code.
        reason: DisconnectReason,
        /// Human-readable description.
        description: String,
    },
}

/// Handle for enqueueing work on a connection's reactor.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<DriverCommand>,
    connected: Arc<AtomicBool>,
}

impl OutboundQueue {
    /// Creates a queue and the receiver the reactor drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DriverCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                connected: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    fn closed_error() -> StrandError {
        StrandError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "Connection is closed",
        ))
    }

    /// Enqueues a command.
    pub fn command(&self, command: DriverCommand) -> StrandResult<()> {
        if !self.is_connected() {
            return Err(Self::closed_error());
        }
        self.tx.send(command).map_err(|_| Self::closed_error())
    }

    /// Enqueues a message payload.
    pub fn send(&self, payload: Vec<u8>) -> StrandResult<()> {
        self.command(DriverCommand::Send {
            payload,
            sent: None,
        })
    }

    /// Enqueues a message payload and returns a receiver completed once it
    /// has been written.
    pub fn send_notified(
        &self,
        payload: Vec<u8>,
    ) -> StrandResult<oneshot::Receiver<StrandResult<()>>> {
        let (tx, rx) = oneshot::channel();
        self.command(DriverCommand::Send {
            payload,
            sent: Some(tx),
        })?;
        Ok(rx)
    }

    /// Whether the connection still accepts messages.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Marks the connection as gone; later enqueues fail.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

const READ_BUFFER_SIZE: usize = 32 * 1024;
const REKEY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the reactor and writer tasks for one connection.
pub(crate) fn spawn<S>(
    stream: S,
    engine: TransportEngine,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    connection: Arc<SshConnection>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let span = connection.span().clone();
    tokio::spawn(run_as_driver(run(stream, engine, commands, connection)).instrument(span))
}

async fn write_loop<W>(mut writer: W, mut chunks: mpsc::UnboundedReceiver<OutboundChunk>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = chunks.recv().await {
        let result = async {
            writer.write_all(&chunk.data).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                if let Some(sent) = chunk.sent {
                    let _ = sent.send(Ok(()));
                }
            }
            Err(e) => {
                debug!(error = %e, "Socket write failed");
                if let Some(sent) = chunk.sent {
                    let _ = sent.send(Err(StrandError::Io(e)));
                }
                break;
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        trace!(error = %e, "Socket shutdown failed");
    }
}

struct Reactor {
    engine: TransportEngine,
    connection: Arc<SshConnection>,
    writer: mpsc::UnboundedSender<OutboundChunk>,
    outcome: Option<DisconnectInfo>,
}

impl Reactor {
    /// Applies pending engine events and forwards pending output.
    fn pump(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            if let TransportEvent::KeysExchanged { .. } = &event {
                self.connection.update_transport_info(&self.engine);
            }
            if let TransportEvent::Disconnected { code, description } = &event {
                self.outcome.get_or_insert(DisconnectInfo {
                    code: *code,
                    description: description.clone(),
                    host_key_rejected: false,
                });
                continue;
            }
            if let TransportEvent::HostKeyRejected { .. } = &event {
                self.outcome.get_or_insert(DisconnectInfo {
                    code: DisconnectReason::HostKeyNotVerifiable.code(),
                    description: "Host key not accepted".to_string(),
                    host_key_rejected: true,
                });
            }
            if let Err(e) = self.connection.handle_event(event) {
                warn!(error = %e, "Connection message handling failed");
                self.fail(DisconnectInfo::from_error(&e), DisconnectReason::ProtocolError, &e);
            }
        }
        for chunk in self.engine.take_output() {
            if let Err(mpsc::error::SendError(chunk)) = self.writer.send(chunk) {
                if let Some(sent) = chunk.sent {
                    let _ = sent.send(Err(StrandError::Channel(
                        "Connection closed before data was sent".to_string(),
                    )));
                }
            }
        }
    }

    fn fail(&mut self, info: DisconnectInfo, reason: DisconnectReason, error: &StrandError) {
        self.engine.disconnect(reason, &error.to_string());
        self.outcome.get_or_insert(info);
    }

    fn is_done(&self) -> bool {
        self.engine.is_closed()
    }

    fn on_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Send { payload, sent } => {
                // A refused payload drops its notifier; the waiter sees the
                // connection as closed.
                if let Err(e) = self.engine.send_message(payload, sent) {
                    debug!(error = %e, "Message dropped");
                }
            }
            DriverCommand::Rekey => {
                if let Err(e) = self.engine.request_rekey() {
                    warn!(error = %e, "Re-key failed");
                    self.fail(DisconnectInfo::from_error(&e), DisconnectReason::KeyExchangeFailed, &e);
                }
            }
            DriverCommand::RequestService { name, future } => {
                match self.engine.request_service(&name) {
                    Ok(()) => self.connection.push_service_request(name, future),
                    Err(e) => {
                        future.fail(e.to_string());
                    }
                }
            }
            DriverCommand::Disconnect {
                reason,
                description,
            } => {
                self.outcome
                    .get_or_insert(DisconnectInfo::new(reason, description.clone()));
                self.engine.disconnect(reason, &description);
            }
        }
    }
}

async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run<S>(
    stream: S,
    engine: TransportEngine,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    connection: Arc<SshConnection>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, chunk_rx));

    let keepalive_period = engine.config().keepalive_interval;
    let mut reactor = Reactor {
        engine,
        connection: connection.clone(),
        writer: chunk_tx,
        outcome: None,
    };
    reactor.engine.start();
    reactor.pump();

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut rekey_tick = interval(REKEY_CHECK_INTERVAL);
    rekey_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive = keepalive_period.map(|period| {
        let mut timer = interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });

    while !reactor.is_done() {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Peer closed the socket");
                    reactor.engine.mark_disconnected();
                    reactor.outcome.get_or_insert(DisconnectInfo::new(
                        DisconnectReason::ConnectionLost,
                        "Connection closed by peer",
                    ));
                }
                Ok(n) => {
                    trace!(bytes = n, "Received");
                    if let Err(e) = reactor.engine.feed(&buf[..n]) {
                        warn!(error = %e, "Transport failed");
                        reactor.outcome.get_or_insert(DisconnectInfo::from_error(&e));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Socket read failed");
                    reactor.engine.mark_disconnected();
                    reactor.outcome.get_or_insert(DisconnectInfo::new(
                        DisconnectReason::ConnectionLost,
                        e.to_string(),
                    ));
                }
            },
            command = commands.recv() => match command {
                Some(command) => reactor.on_command(command),
                None => {
                    reactor.outcome.get_or_insert(DisconnectInfo::new(
                        DisconnectReason::ByApplication,
                        "Connection dropped",
                    ));
                    reactor.engine.disconnect(DisconnectReason::ByApplication, "Connection dropped");
                }
            },
            _ = rekey_tick.tick() => {
                if reactor.engine.needs_rekey(Instant::now()) {
                    if let Err(e) = reactor.engine.request_rekey() {
                        reactor.fail(DisconnectInfo::from_error(&e), DisconnectReason::KeyExchangeFailed, &e);
                    }
                }
            },
            _ = next_tick(keepalive.as_mut()), if reactor.engine.is_first_kex_complete() => {
                let mut noise = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut noise);
                if let Err(e) = reactor.engine.send_message(ignore_message(&noise), None) {
                    debug!(error = %e, "Keepalive not sent");
                }
            },
        }
        reactor.pump();
    }

    connection.outbound().mark_disconnected();
    let Reactor { outcome, writer, .. } = reactor;
    drop(writer);
    if let Err(e) = writer_task.await {
        debug!(error = %e, "Writer task failed");
    }
    connection.teardown(outcome.unwrap_or_else(|| {
        DisconnectInfo::new(DisconnectReason::ConnectionLost, "Connection closed")
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_driver_task_marker() {
        assert!(!is_driver_task());
        assert!(run_as_driver(async { is_driver_task() }).await);
    }

    #[tokio::test]
    async fn test_queue_preserves_order() {
        let (queue, mut rx) = OutboundQueue::new();
        queue.send(vec![94, 1]).unwrap();
        queue.command(DriverCommand::Rekey).unwrap();
        queue.send(vec![94, 2]).unwrap();

        assert!(matches!(rx.recv().await, Some(DriverCommand::Send { payload, .. }) if payload == vec![94, 1]));
        assert!(matches!(rx.recv().await, Some(DriverCommand::Rekey)));
        assert!(matches!(rx.recv().await, Some(DriverCommand::Send { payload, .. }) if payload == vec![94, 2]));
    }

    #[test]
    fn test_queue_rejects_after_disconnect() {
        let (queue, _rx) = OutboundQueue::new();
        queue.mark_disconnected();
        assert!(!queue.is_connected());
        match queue.send(vec![2]) {
            Err(StrandError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("Expected BrokenPipe, got {:?}", other),
        }
    }

    #[test]
    fn test_queue_rejects_without_reactor() {
        let (queue, rx) = OutboundQueue::new();
        drop(rx);
        assert!(!queue.is_connected());
        assert!(queue.send(vec![2]).is_err());
    }

    #[tokio::test]
    async fn test_writer_completes_notifiers() {
        let socket = tokio_test::io::Builder::new()
            .write(b"hello")
            .write(b"world")
            .build();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(socket, rx));

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        tx.send(OutboundChunk {
            data: b"hello".to_vec(),
            sent: Some(first_tx),
        })
        .unwrap();
        tx.send(OutboundChunk {
            data: b"world".to_vec(),
            sent: Some(second_tx),
        })
        .unwrap();
        assert!(first_rx.await.unwrap().is_ok());
        assert!(second_rx.await.unwrap().is_ok());

        drop(tx);
        task.await.unwrap();
    }
}
