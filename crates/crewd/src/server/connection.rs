//! Connection handler for individual consumer connections.
//!
//! Each connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages and routes them to the registry
//! - Owns a bounded outbound queue drained by a dedicated writer task
//! - On subscribe, starts a forwarder that moves deltas into that queue
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crew_protocol::{
    ClientMessage, DaemonMessage, MessageType, ProtocolVersion, ReplayEntry, VersionError,
};

use crate::registry::{RegistryError, RegistryHandle, SubscribeStart};
use crate::stats::Transport;

/// A subscribed consumer.
pub struct Subscriber {
    /// Task moving deltas into the consumer's queue.
    pub forwarder: AbortHandle,
}

/// Subscribed consumers, keyed by client id.
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum number of concurrently subscribed consumers.
const MAX_SUBSCRIBERS: usize = 32;

/// Outbound messages queued per consumer.
const OUTBOUND_BUFFER: usize = 512;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single consumer.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    outbound: mpsc::Sender<DaemonMessage>,
    /// Taken by `run` to start the writer task.
    pending_writer: Option<(BufWriter<OwnedWriteHalf>, mpsc::Receiver<DaemonMessage>)>,
    registry: RegistryHandle,
    subscribers: SubscribersMap,
    cancel: CancellationToken,
    /// Assigned after handshake.
    client_id: Option<String>,
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        registry: RegistryHandle,
        subscribers: SubscribersMap,
        cancel: CancellationToken,
        connection_number: u64,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        Self {
            reader: BufReader::new(reader),
            outbound,
            pending_writer: Some((BufWriter::new(writer), outbound_rx)),
            registry,
            subscribers,
            cancel,
            client_id: None,
            connection_number,
        }
    }

    /// Performs the handshake, then processes messages until the
    /// connection closes.
    pub async fn run(mut self) {
        debug!(connection = self.connection_number, "New client connected");

        if let Some((writer, rx)) = self.pending_writer.take() {
            tokio::spawn(write_loop(writer, rx, self.connection_number));
        }

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return;
            }
        }

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        self.unsubscribe().await;
        info!(client_id = ?self.client_id, "Client disconnected");
    }

    /// Expects `connect`, checks the protocol version and answers with
    /// `connected` or `rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        if let Err(e) = ProtocolVersion::CURRENT.check(&msg.protocol_version) {
            warn!(
                client_version = %msg.protocol_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(e.to_string()))
                .await?;
            return Err(e.into());
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let cancel = self.cancel.clone();
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = timeout(READ_TIMEOUT, self.read_message()) => read,
            };

            let msg = match read {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => return Ok(()),
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // One garbled line does not end the connection.
                    self.send_message(DaemonMessage::error_with_code(e, "parse_error"))
                        .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ConnectionError::Timeout),
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(ConnectionError::Registry(RegistryError::Invalid(e))) => {
                    self.send_message(DaemonMessage::error_with_code(
                        e.to_string(),
                        "invalid_payload",
                    ))
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected"))
                    .await?;
            }

            MessageType::HookEvent { data } => {
                self.registry.ingest(data, Transport::Socket).await?;
                self.send_message(DaemonMessage::HookAccepted).await?;
            }

            MessageType::ListSessions => {
                let sessions = self.registry.get_all_sessions().await;
                self.send_message(DaemonMessage::SessionList { sessions })
                    .await?;
            }

            MessageType::ListTeams => {
                let teams = self.registry.get_teams().await;
                self.send_message(DaemonMessage::TeamList { teams }).await?;
            }

            MessageType::Subscribe { last_seq } => {
                self.subscribe(last_seq).await?;
            }

            MessageType::Unsubscribe => {
                self.unsubscribe().await;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::Pong { seq }).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Sends the catch-up (replay or snapshot) and starts forwarding.
    async fn subscribe(&mut self, last_seq: Option<u64>) -> Result<(), ConnectionError> {
        let Some(client_id) = self.client_id.clone() else {
            return Ok(());
        };

        {
            let subs = self.subscribers.read().await;
            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                drop(subs);
                self.send_message(DaemonMessage::error_with_code(
                    format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                    "too_many_subscribers",
                ))
                .await?;
                return Ok(());
            }
        }

        // A re-subscribe restarts from the new position.
        self.unsubscribe().await;

        let subscription = self.registry.subscribe(last_seq).await?;
        match subscription.start {
            SubscribeStart::Replay(entries) => {
                debug!(client_id = %client_id, replayed = entries.len(), "Replaying missed deltas");
                for entry in entries {
                    self.send_message(DaemonMessage::delta(entry)).await?;
                }
            }
            SubscribeStart::Snapshot {
                sessions,
                teams,
                seq,
            } => {
                debug!(client_id = %client_id, seq, "Sending snapshot");
                self.send_message(DaemonMessage::Snapshot {
                    sessions,
                    teams,
                    seq,
                })
                .await?;
            }
        }

        let forwarder = tokio::spawn(forward_deltas(
            subscription.receiver,
            self.outbound.clone(),
            client_id.clone(),
        ))
        .abort_handle();

        self.subscribers
            .write()
            .await
            .insert(client_id.clone(), Subscriber { forwarder });
        debug!(client_id = %client_id, ?last_seq, "Client subscribed");
        Ok(())
    }

    async fn unsubscribe(&mut self) {
        let Some(ref client_id) = self.client_id else {
            return;
        };
        if let Some(sub) = self.subscribers.write().await.remove(client_id) {
            sub.forwarder.abort();
            debug!(client_id = %client_id, "Client unsubscribed");
        }
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))
    }

    /// Queues a direct reply. Waits for queue space, unlike delta
    /// forwarding.
    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Moves live deltas into a consumer's queue until either side goes away.
async fn forward_deltas(
    mut receiver: broadcast::Receiver<ReplayEntry>,
    outbound: mpsc::Sender<DaemonMessage>,
    client_id: String,
) {
    let mut dropped: u64 = 0;
    loop {
        let msg = match receiver.recv().await {
            Ok(entry) => DaemonMessage::delta(entry),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(client_id = %client_id, skipped, "Subscriber lagged behind the registry");
                DaemonMessage::error_with_code(
                    format!("missed {skipped} deltas; resubscribe with last_seq"),
                    "lagged",
                )
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match outbound.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    warn!(client_id = %client_id, dropped, "Subscriber queue full; dropping deltas");
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!(client_id = %client_id, dropped, "Delta forwarder stopped");
}

/// Drains a consumer's queue onto the socket.
async fn write_loop(
    mut writer: BufWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<DaemonMessage>,
    connection_number: u64,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &msg).await {
            debug!(connection = connection_number, error = %e, "Writer stopped");
            break;
        }
    }
}

async fn write_message(
    writer: &mut BufWriter<OwnedWriteHalf>,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json = serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: {0}")]
    VersionMismatch(#[from] VersionError),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    /// The writer task is gone.
    #[error("Outbound queue closed")]
    Closed,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crew_protocol::Delta;
    use crew_core::SessionId;

    fn entry(seq: u64) -> ReplayEntry {
        ReplayEntry {
            seq,
            delta: Delta::SessionRemoved {
                session_id: SessionId::new("s1"),
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_connection_error_display() {
        let err: ConnectionError = VersionError::Incompatible {
            ours: ProtocolVersion::new(2, 0),
            theirs: ProtocolVersion::new(1, 0),
        }
        .into();
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }

    #[tokio::test]
    async fn test_forwarder_drops_when_queue_full() {
        let (delta_tx, delta_rx) = broadcast::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(2);
        let task = tokio::spawn(forward_deltas(delta_rx, out_tx, "c1".to_string()));

        for seq in 1..=5 {
            delta_tx.send(entry(seq)).unwrap();
        }
        drop(delta_tx);
        task.await.unwrap();

        let mut received = Vec::new();
        while let Ok(msg) = out_rx.try_recv() {
            if let DaemonMessage::Delta { entry } = msg {
                received.push(entry.seq);
            }
        }
        assert_eq!(received, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_forwarder_reports_lag() {
        let (delta_tx, delta_rx) = broadcast::channel(2);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        for seq in 1..=4 {
            delta_tx.send(entry(seq)).unwrap();
        }
        drop(delta_tx);
        forward_deltas(delta_rx, out_tx, "c1".to_string()).await;

        match out_rx.recv().await {
            Some(DaemonMessage::Error { code, .. }) => assert_eq!(code.as_deref(), Some("lagged")),
            other => panic!("expected lag error, got {other:?}"),
        }
        let mut seqs = Vec::new();
        while let Ok(DaemonMessage::Delta { entry }) = out_rx.try_recv() {
            seqs.push(entry.seq);
        }
        assert_eq!(seqs, vec![3, 4]);
    }
}
