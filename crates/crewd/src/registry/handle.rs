//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` is a cheap-to-clone sender wrapper shared by every
//! transport (HTTP, file queue, socket).
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`
//! - Read-only queries degrade to `None` or empty results

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crew_core::{Session, SessionId, Team};
use crew_protocol::ReplayEntry;

use super::commands::{
    IngestOutcome, RegistryCommand, RegistryError, SessionPatch, Subscription,
};
use crate::stats::{StatsSnapshot, Transport};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// ```ignore
/// let outcome = handle.ingest(payload, Transport::Http).await?;
/// let sub = handle.subscribe(None).await?;
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Sends a request built around a fresh reply channel and awaits it.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Validates, resolves and applies one hook payload.
    ///
    /// # Errors
    ///
    /// - `RegistryError::Invalid` if the payload fails validation
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn ingest(
        &self,
        payload: Value,
        transport: Transport,
    ) -> Result<IngestOutcome, RegistryError> {
        let received_at = Utc::now();
        self.request(|respond_to| RegistryCommand::Ingest {
            payload,
            transport,
            received_at,
            respond_to,
        })
        .await?
    }

    pub async fn get_session(&self, session_id: SessionId) -> Option<Session> {
        self.request(|respond_to| RegistryCommand::GetSession {
            session_id,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// All sessions, oldest first. Empty if the actor is gone.
    pub async fn get_all_sessions(&self) -> Vec<Session> {
        self.request(|respond_to| RegistryCommand::GetAllSessions { respond_to })
            .await
            .unwrap_or_default()
    }

    pub async fn get_teams(&self) -> Vec<Team> {
        self.request(|respond_to| RegistryCommand::GetTeams { respond_to })
            .await
            .unwrap_or_default()
    }

    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> Result<Session, RegistryError> {
        self.request(|respond_to| RegistryCommand::UpdateSession {
            session_id,
            patch,
            respond_to,
        })
        .await?
    }

    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    /// - `RegistryError::NotResumable` if the session has not ended
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn request_resume(
        &self,
        session_id: SessionId,
        terminal_id: String,
    ) -> Result<Session, RegistryError> {
        self.request(|respond_to| RegistryCommand::RequestResume {
            session_id,
            terminal_id,
            respond_to,
        })
        .await?
    }

    pub async fn create_placeholder(
        &self,
        terminal_id: String,
        cwd: Option<String>,
    ) -> Result<Session, RegistryError> {
        self.request(|respond_to| RegistryCommand::CreatePlaceholder {
            terminal_id,
            cwd,
            respond_to,
        })
        .await
    }

    /// Returns the session that was bound to the terminal, if any.
    pub async fn terminal_closed(
        &self,
        terminal_id: String,
    ) -> Result<Option<SessionId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::TerminalClosed {
            terminal_id,
            respond_to,
        })
        .await
    }

    /// Registers a delta consumer.
    ///
    /// With `last_seq`, the start is a replay of what the consumer missed
    /// if the buffer still covers it, and a full snapshot otherwise.
    pub async fn subscribe(&self, last_seq: Option<u64>) -> Result<Subscription, RegistryError> {
        self.request(|respond_to| RegistryCommand::Subscribe {
            last_seq,
            respond_to,
        })
        .await
    }

    /// Entries after `after`; `Ok(None)` if the buffer no longer covers it.
    pub async fn replay_since(
        &self,
        after: u64,
    ) -> Result<Option<Vec<ReplayEntry>>, RegistryError> {
        self.request(|respond_to| RegistryCommand::ReplaySince { after, respond_to })
            .await
    }

    pub async fn stats(&self) -> Result<StatsSnapshot, RegistryError> {
        self.request(|respond_to| RegistryCommand::GetStats { respond_to })
            .await
    }

    // ------------------------------------------------------------------------
    // Fire-and-forget: send errors mean the actor is shutting down.
    // ------------------------------------------------------------------------

    pub async fn check_liveness(&self) {
        let _ = self.sender.send(RegistryCommand::CheckLiveness).await;
    }

    pub async fn auto_idle_sweep(&self) {
        let _ = self.sender.send(RegistryCommand::AutoIdleSweep).await;
    }

    pub async fn expire_resumes(&self) {
        let _ = self.sender.send(RegistryCommand::ExpireResumes).await;
    }

    /// Returns `true` while the actor is accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_core::{SessionSource, SessionStatus};
    use serde_json::json;

    use crate::registry::commands::Resolution;

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        (RegistryHandle::new(cmd_tx), cmd_rx)
    }

    #[tokio::test]
    async fn test_ingest_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Ingest {
                payload,
                transport,
                respond_to,
                ..
            }) = rx.recv().await
            {
                assert_eq!(payload["session_id"], "s1");
                assert_eq!(transport, Transport::FileQueue);
                let _ = respond_to.send(Ok(IngestOutcome {
                    session_id: SessionId::new("s1"),
                    resolution: Resolution::Created,
                    status: SessionStatus::Idle,
                }));
                return true;
            }
            false
        });

        let outcome = handle
            .ingest(json!({"session_id": "s1"}), Transport::FileQueue)
            .await
            .unwrap();
        assert_eq!(outcome.resolution, Resolution::Created);
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_ingest_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle.ingest(json!({}), Transport::Http).await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_dropped_reply_is_channel_closed() {
        let (handle, mut rx) = create_test_handle();
        tokio::spawn(async move {
            // Receive and drop the command without replying.
            let _ = rx.recv().await;
        });

        let result = handle
            .update_session(SessionId::new("s1"), SessionPatch::default())
            .await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_queries_degrade_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.get_session(SessionId::new("s1")).await.is_none());
        assert!(handle.get_all_sessions().await.is_empty());
        assert!(handle.get_teams().await.is_empty());
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_get_session_reply() {
        let (handle, mut rx) = create_test_handle();
        tokio::spawn(async move {
            if let Some(RegistryCommand::GetSession {
                session_id,
                respond_to,
            }) = rx.recv().await
            {
                let session = Session::new(session_id, SessionSource::Terminal, Utc::now());
                let _ = respond_to.send(Some(session));
            }
        });

        let session = handle.get_session(SessionId::new("s1")).await.unwrap();
        assert_eq!(session.session_id.as_str(), "s1");
    }

    #[tokio::test]
    async fn test_sweeps_are_fire_and_forget() {
        let (handle, mut rx) = create_test_handle();
        handle.check_liveness().await;
        handle.auto_idle_sweep().await;
        handle.expire_resumes().await;

        assert!(matches!(rx.recv().await, Some(RegistryCommand::CheckLiveness)));
        assert!(matches!(rx.recv().await, Some(RegistryCommand::AutoIdleSweep)));
        assert!(matches!(rx.recv().await, Some(RegistryCommand::ExpireResumes)));

        drop(rx);
        // Must not panic once the actor is gone.
        handle.check_liveness().await;
    }
}
