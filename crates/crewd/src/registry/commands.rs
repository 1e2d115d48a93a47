//! Registry actor commands, errors and reply types.
//!
//! - `RegistryCommand`: everything the actor can be asked to do
//! - `RegistryError`: why a request failed
//! - reply types for ingest, subscribe and session edits
//!
//! Commands carrying a `respond_to` are requests; the rest are fired by
//! the actor's own timers and sweep tickers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

use crew_core::{Session, SessionId, SessionStatus, Team, ToolTimeouts};
use crew_protocol::{ReplayEntry, ValidationError};

use crate::config::IdleConfig;
use crate::stats::{StatsSnapshot, Transport};

// ============================================================================
// Registry Commands
// ============================================================================

#[derive(Debug)]
pub enum RegistryCommand {
    /// Validate, resolve and apply one hook payload.
    Ingest {
        payload: Value,
        transport: Transport,
        received_at: DateTime<Utc>,
        respond_to: oneshot::Sender<Result<IngestOutcome, RegistryError>>,
    },

    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<Session>>,
    },

    GetAllSessions {
        respond_to: oneshot::Sender<Vec<Session>>,
    },

    GetTeams {
        respond_to: oneshot::Sender<Vec<Team>>,
    },

    /// Apply user edits (title, label, archive flag, queue count).
    UpdateSession {
        session_id: SessionId,
        patch: SessionPatch,
        respond_to: oneshot::Sender<Result<Session, RegistryError>>,
    },

    /// Arm a resume: the next `session-start` in `terminal_id` (or in the
    /// session's directory) takes over this ended session's record.
    RequestResume {
        session_id: SessionId,
        terminal_id: String,
        respond_to: oneshot::Sender<Result<Session, RegistryError>>,
    },

    /// Show a `connecting` placeholder for a freshly provisioned terminal.
    CreatePlaceholder {
        terminal_id: String,
        cwd: Option<String>,
        respond_to: oneshot::Sender<Session>,
    },

    /// The terminal manager closed a terminal.
    TerminalClosed {
        terminal_id: String,
        respond_to: oneshot::Sender<Option<SessionId>>,
    },

    /// Register a delta consumer; see [`Subscription`].
    Subscribe {
        last_seq: Option<u64>,
        respond_to: oneshot::Sender<Subscription>,
    },

    /// Entries after `after`, or `None` if the gap can no longer be closed.
    ReplaySince {
        after: u64,
        respond_to: oneshot::Sender<Option<Vec<ReplayEntry>>>,
    },

    GetStats {
        respond_to: oneshot::Sender<StatsSnapshot>,
    },

    // ------------------------------------------------------------------------
    // Internal: fired by timers and background lookups
    // ------------------------------------------------------------------------
    /// A tool call outlived its category timeout.
    ToolTimeout {
        session_id: SessionId,
        tool: String,
        generation: u64,
        /// Set when the agent process had children at fire time.
        children_running: bool,
    },

    /// Background PID lookup found the agent process.
    ClaimPid { session_id: SessionId, pid: u32 },

    RemoveEnded {
        session_id: SessionId,
        generation: u64,
    },

    TeamCleanup { team_id: String, generation: u64 },

    CheckLiveness,

    AutoIdleSweep,

    ExpireResumes,
}

// ============================================================================
// Replies
// ============================================================================

/// Which step of identity resolution matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The session id was already tracked.
    Known,
    /// A pending resume claimed the event.
    Resumed,
    /// The event carried the terminal id of a placeholder.
    TerminalLink,
    /// A terminal awaiting its first hook in this directory.
    CwdLink,
    /// A placeholder with the same project path.
    PathScan,
    /// The agent process descends from a known terminal shell.
    ProcessAncestry,
    /// Nothing matched; a new session was created.
    Created,
}

impl Resolution {
    /// Whether resolution produced a record that did not exist under this id.
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::Known)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub session_id: SessionId,
    pub resolution: Resolution,
    pub status: SessionStatus,
}

/// User-editable session fields; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub archived: Option<bool>,
    #[serde(default)]
    pub queue_count: Option<u32>,
}

impl SessionPatch {
    /// Applies the patch. Empty strings clear `title`/`label`.
    pub fn apply(&self, session: &mut Session) {
        if let Some(ref title) = self.title {
            session.title = Some(title.trim().to_string()).filter(|t| !t.is_empty());
        }
        if let Some(ref label) = self.label {
            session.label = Some(label.trim().to_string()).filter(|l| !l.is_empty());
        }
        if let Some(archived) = self.archived {
            session.archived = archived;
        }
        if let Some(queue_count) = self.queue_count {
            session.queue_count = queue_count;
        }
    }
}

/// How a new consumer catches up before following live deltas.
#[derive(Debug)]
pub enum SubscribeStart {
    /// Everything after the consumer's `last_seq`.
    Replay(Vec<ReplayEntry>),
    /// Full state as of `seq`; live deltas continue from `seq + 1`.
    Snapshot {
        sessions: Vec<Session>,
        teams: Vec<Team>,
        seq: u64,
    },
}

/// A consumer's starting point plus its live feed.
///
/// Both are taken in the same actor turn, so no delta falls between them.
#[derive(Debug)]
pub struct Subscription {
    pub start: SubscribeStart,
    pub receiver: broadcast::Receiver<ReplayEntry>,
}

// ============================================================================
// Registry Config
// ============================================================================

/// Timing knobs of the registry actor.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub tool_timeouts: ToolTimeouts,
    pub idle: IdleConfig,
    pub liveness_interval: Duration,
    pub auto_idle_interval: Duration,
    pub resume_expiry_interval: Duration,
    /// Grace period before an ended, non-resumable session disappears.
    pub removal_delay: Duration,
    /// Grace period before a finished team is dissolved.
    pub team_cleanup_delay: Duration,
    /// How long a requested resume waits for its `session-start`.
    pub resume_ttl: Duration,
    pub subagent_ttl: Duration,
    /// Used while the parent is inside a Task/Agent tool call.
    pub subagent_ttl_extended: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tool_timeouts: ToolTimeouts::default(),
            idle: IdleConfig::default(),
            liveness_interval: Duration::from_secs(15),
            auto_idle_interval: Duration::from_secs(10),
            resume_expiry_interval: Duration::from_secs(10),
            removal_delay: Duration::from_secs(10),
            team_cleanup_delay: Duration::from_secs(15),
            resume_ttl: Duration::from_secs(120),
            subagent_ttl: Duration::from_secs(10),
            subagent_ttl_extended: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Registry Errors
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The payload failed validation and was not applied.
    #[error("invalid payload: {0}")]
    Invalid(#[from] ValidationError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {session_id} cannot be resumed while {status}")]
    NotResumable {
        session_id: SessionId,
        status: SessionStatus,
    },

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_core::SessionSource;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::SessionNotFound(SessionId::new("test-123"));
        assert_eq!(err.to_string(), "session not found: test-123");

        let err = RegistryError::NotResumable {
            session_id: SessionId::new("s1"),
            status: SessionStatus::Working,
        };
        assert_eq!(err.to_string(), "session s1 cannot be resumed while working");

        let err: RegistryError = ValidationError::MissingSessionId.into();
        assert_eq!(err.to_string(), "invalid payload: missing session_id");
    }

    #[test]
    fn test_patch_applies_only_present_fields() {
        let mut session = Session::new(SessionId::new("s1"), SessionSource::Terminal, Utc::now());
        session.title = Some("keep".to_string());

        let patch: SessionPatch =
            serde_json::from_str(r#"{"label":" review ","queueCount":3}"#).unwrap();
        patch.apply(&mut session);

        assert_eq!(session.title.as_deref(), Some("keep"));
        assert_eq!(session.label.as_deref(), Some("review"));
        assert_eq!(session.queue_count, 3);
        assert!(!session.archived);
    }

    #[test]
    fn test_patch_empty_title_clears() {
        let mut session = Session::new(SessionId::new("s1"), SessionSource::Terminal, Utc::now());
        session.title = Some("old".to_string());
        SessionPatch {
            title: Some(String::new()),
            ..SessionPatch::default()
        }
        .apply(&mut session);
        assert!(session.title.is_none());
    }

    #[test]
    fn test_resolution_is_new() {
        assert!(!Resolution::Known.is_new());
        assert!(Resolution::Created.is_new());
        assert!(Resolution::TerminalLink.is_new());
    }
}
