//! Supervisor/subagent team record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::session::SessionId;

/// Prefix of every team id; the rest is the parent session id.
pub const TEAM_ID_PREFIX: &str = "team-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Leader,
    Member,
}

/// A parent session and the subagent sessions it spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub team_id: String,
    pub parent_session_id: SessionId,
    pub child_session_ids: BTreeSet<SessionId>,
    pub team_name: String,
    pub created_at: DateTime<Utc>,
}

impl Team {
    /// Derives the team id from the parent, so relinking is idempotent.
    pub fn id_for(parent: &SessionId) -> String {
        format!("{TEAM_ID_PREFIX}{parent}")
    }

    pub fn new(parent: SessionId, team_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            team_id: Self::id_for(&parent),
            parent_session_id: parent,
            child_session_ids: BTreeSet::new(),
            team_name: team_name.into(),
            created_at: now,
        }
    }

    /// Adds a child. Returns false if it was already a member.
    pub fn add_child(&mut self, child: SessionId) -> bool {
        self.child_session_ids.insert(child)
    }

    pub fn remove_child(&mut self, child: &SessionId) -> bool {
        self.child_session_ids.remove(child)
    }

    pub fn has_member(&self, id: &SessionId) -> bool {
        self.parent_session_id == *id || self.child_session_ids.contains(id)
    }

    /// Follows a member through a re-key.
    pub fn rename_member(&mut self, old: &SessionId, new: &SessionId) {
        if self.parent_session_id == *old {
            self.parent_session_id = new.clone();
        }
        if self.child_session_ids.remove(old) {
            self.child_session_ids.insert(new.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_id_is_derived_from_parent() {
        let team = Team::new(SessionId::new("p1"), "proj", Utc::now());
        assert_eq!(team.team_id, "team-p1");
        assert_eq!(Team::id_for(&SessionId::new("p1")), team.team_id);
    }

    #[test]
    fn test_membership() {
        let mut team = Team::new(SessionId::new("p1"), "proj", Utc::now());
        assert!(team.add_child(SessionId::new("c1")));
        assert!(!team.add_child(SessionId::new("c1")));
        assert!(team.has_member(&SessionId::new("p1")));
        assert!(team.has_member(&SessionId::new("c1")));
        assert!(team.remove_child(&SessionId::new("c1")));
        assert!(!team.has_member(&SessionId::new("c1")));
    }

    #[test]
    fn test_rename_member_keeps_team_id() {
        let mut team = Team::new(SessionId::new("p1"), "proj", Utc::now());
        team.add_child(SessionId::new("c1"));
        team.rename_member(&SessionId::new("c1"), &SessionId::new("c2"));
        team.rename_member(&SessionId::new("p1"), &SessionId::new("p2"));
        assert!(team.has_member(&SessionId::new("c2")));
        assert_eq!(team.parent_session_id.as_str(), "p2");
        assert_eq!(team.team_id, "team-p1");
    }
}
