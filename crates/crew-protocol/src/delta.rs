//! Deltas: the unit of change pushed to consumers and kept for replay.

use chrono::{DateTime, Utc};
use crew_core::{Session, SessionId, Team};
use serde::{Deserialize, Serialize};

/// One change to the live model.
///
/// A `Session` delta always carries the full current record; consumers
/// replace rather than merge. A record that was re-keyed carries its old id
/// in `replacesId` on exactly one delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Delta {
    Session { session: Box<Session> },
    SessionRemoved { session_id: SessionId },
    Team { team: Team },
    TeamRemoved { team_id: String },
}

impl Delta {
    pub fn session(session: Session) -> Self {
        Self::Session {
            session: Box::new(session),
        }
    }

    /// Session the delta is about, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Session { session } => Some(&session.session_id),
            Self::SessionRemoved { session_id } => Some(session_id),
            Self::Team { .. } | Self::TeamRemoved { .. } => None,
        }
    }
}

/// A delta with its global sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub delta: Delta,
    pub timestamp: DateTime<Utc>,
}
