//! Newline-delimited JSON messages on the consumer socket.

use crate::delta::ReplayEntry;
use crate::version::ProtocolVersion;
use crew_core::{Session, Team};
use serde::{Deserialize, Serialize};

/// Requests a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// A raw hook payload from a local script.
    HookEvent { data: serde_json::Value },

    ListSessions,

    ListTeams,

    /// Start receiving deltas.
    ///
    /// With `last_seq`, the daemon replays everything after it when the
    /// replay buffer still covers the gap; otherwise it sends a snapshot.
    Subscribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seq: Option<u64>,
    },

    Unsubscribe,

    Ping { seq: u64 },

    Disconnect,
}

/// Envelope for client requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn hook_event(data: serde_json::Value) -> Self {
        Self::new(MessageType::HookEvent { data })
    }

    pub fn subscribe(last_seq: Option<u64>) -> Self {
        Self::new(MessageType::Subscribe { last_seq })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }
}

/// Messages the daemon sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    SessionList { sessions: Vec<Session> },

    TeamList { teams: Vec<Team> },

    /// Full state, sent when replay cannot cover a consumer's gap.
    Snapshot {
        sessions: Vec<Session>,
        teams: Vec<Team>,
        /// Sequence number the snapshot is consistent with.
        seq: u64,
    },

    Delta { entry: ReplayEntry },

    /// A `hook_event` was validated and applied.
    HookAccepted,

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn delta(entry: ReplayEntry) -> Self {
        Self::Delta { entry }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: &str) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_without_last_seq() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"protocol_version":{"major":2,"minor":0},"type":"subscribe"}"#,
        )
        .unwrap();
        assert!(matches!(msg.message, MessageType::Subscribe { last_seq: None }));
    }

    #[test]
    fn test_missing_version_defaults_to_current() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping","seq":3}"#).unwrap();
        assert_eq!(msg.protocol_version, ProtocolVersion::CURRENT);
        assert!(matches!(msg.message, MessageType::Ping { seq: 3 }));
    }

    #[test]
    fn test_snapshot_shape() {
        let msg = DaemonMessage::Snapshot {
            sessions: Vec::new(),
            teams: Vec::new(),
            seq: 12,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"snapshot\""));
        assert!(json.contains("\"seq\":12"));
    }

    #[test]
    fn test_error_code_omitted_when_absent() {
        let json = serde_json::to_string(&DaemonMessage::error("bad")).unwrap();
        assert!(!json.contains("code"));
    }
}
