//! Unix socket server for delta consumers.
//!
//! One [`ConnectionHandler`] task per connection; subscribed consumers are
//! tracked with their forwarding task so shutdown can stop them all.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  subscribe   ┌─────────────────┐
//! │ConnectionHandler│─────────────▶│  RegistryHandle │
//! │  (per consumer) │              └────────┬────────┘
//! └───────┬─────────┘                       │ broadcast::Receiver
//!         │ bounded mpsc                    ▼
//!         ▼                        ┌─────────────────┐
//! ┌─────────────────┐   try_send   │    forwarder    │
//! │  writer task    │◀─────────────│  (per consumer) │
//! └─────────────────┘              └─────────────────┘
//! ```
//!
//! A slow consumer only ever fills its own queue; its forwarder drops
//! deltas it cannot queue and the registry never waits on it.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept failures are logged and the loop keeps serving
//! - A missing socket file at cleanup is not an error

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, Subscriber, SubscribersMap};

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::RegistryHandle;

pub use crate::config::DEFAULT_SOCKET_PATH;

/// Accepts delta consumers and local hook scripts on a Unix socket.
pub struct DaemonServer {
    socket_path: PathBuf,
    registry: RegistryHandle,
    shutdown: CancellationToken,
    next_connection: AtomicU64,
    subscribers: SubscribersMap,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        registry: RegistryHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            registry,
            shutdown,
            next_connection: AtomicU64::new(0),
            subscribers: SubscribersMap::default(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serves until the shutdown token fires, then drops every subscriber
    /// and removes the socket file.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = bind_socket(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "Accepting consumers");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let number = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    self.spawn_handler(stream, number);
                }
                Err(e) => error!(error = %e, "Accept failed"),
            }
        }

        info!("Socket server shutting down");
        self.cleanup().await;
        Ok(())
    }

    fn spawn_handler(&self, stream: UnixStream, number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.registry.clone(),
            Arc::clone(&self.subscribers),
            self.shutdown.child_token(),
            number,
        );
        tokio::spawn(handler.run());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn cleanup(&self) {
        for (client_id, subscriber) in self.subscribers.write().await.drain() {
            subscriber.forwarder.abort();
            debug!(client_id = %client_id, "Subscriber dropped at shutdown");
        }

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                socket = %self.socket_path.display(),
                error = %e,
                "Could not remove socket file"
            ),
        }
    }
}

/// Binds `path`, replacing a socket left behind by an earlier run.
fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    let setup = |e: std::io::Error| ServerError::SocketSetup {
        path: path.to_path_buf(),
        error: e.to_string(),
    };

    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(setup(e)),
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(setup)?;
    }
    UnixListener::bind(path).map_err(setup)
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot listen on {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("cannot bind HTTP API to {addr}: {error}")]
    HttpBind { addr: SocketAddr, error: String },

    #[error("HTTP API failed: {0}")]
    HttpServe(String),
}
