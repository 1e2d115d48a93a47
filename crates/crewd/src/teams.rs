//! Parent/subagent team correlation.
//!
//! Subagents are separate CLI processes that start their own sessions. A
//! parent announces one with `subagent-start`; the tracker remembers that
//! announcement for a short while and hands it to the first new session
//! whose working directory is related to the parent's.
//!
//! Owned by the registry actor, so nothing here locks or spawns.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crew_core::{normalize_path, paths_related, SessionId, Team};

/// A `subagent-start` still waiting for its child session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubagent {
    pub parent_session_id: SessionId,
    /// Normalized working directory of the parent.
    pub parent_cwd: String,
    pub agent_type: Option<String>,
    pub agent_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl PendingSubagent {
    pub fn new(
        parent_session_id: SessionId,
        parent_cwd: &str,
        agent_type: Option<String>,
        agent_id: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            parent_session_id,
            parent_cwd: normalize_path(parent_cwd),
            agent_type,
            agent_id,
            expires_at: now + ttl,
        }
    }
}

#[derive(Debug, Default)]
pub struct TeamTracker {
    teams: BTreeMap<String, Team>,
    /// Oldest first.
    pending: VecDeque<PendingSubagent>,
}

impl TeamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Pending Subagents
    // ========================================================================

    pub fn register_pending(&mut self, entry: PendingSubagent) {
        debug!(
            parent = %entry.parent_session_id,
            agent_type = ?entry.agent_type,
            "Subagent pending"
        );
        self.pending.push_back(entry);
    }

    /// Drops the oldest pending entry of `parent` after its `subagent-stop`.
    ///
    /// When both sides carry an agent id, only that entry is dropped.
    pub fn consume_pending(
        &mut self,
        parent: &SessionId,
        agent_id: Option<&str>,
    ) -> Option<PendingSubagent> {
        let index = self.pending.iter().position(|p| {
            p.parent_session_id == *parent
                && match (agent_id, p.agent_id.as_deref()) {
                    (Some(wanted), Some(have)) => wanted == have,
                    _ => true,
                }
        })?;
        self.pending.remove(index)
    }

    /// Claims the oldest live pending entry related to `child_cwd`.
    pub fn take_match(
        &mut self,
        child: &SessionId,
        child_cwd: &str,
        now: DateTime<Utc>,
    ) -> Option<PendingSubagent> {
        self.prune(now);
        let cwd = normalize_path(child_cwd);
        let index = self
            .pending
            .iter()
            .position(|p| p.parent_session_id != *child && paths_related(&p.parent_cwd, &cwd))?;
        self.pending.remove(index)
    }

    /// Discards expired entries.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.pending.retain(|p| p.expires_at > now);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // ========================================================================
    // Teams
    // ========================================================================

    /// Adds `child` to the team led by `parent`, creating it if needed.
    ///
    /// Returns the team as it stands afterwards.
    pub fn link(
        &mut self,
        parent: &SessionId,
        child: &SessionId,
        team_name: &str,
        now: DateTime<Utc>,
    ) -> Team {
        let team_id = self
            .team_led_by(parent)
            .map(|team| team.team_id.clone())
            .unwrap_or_else(|| Team::id_for(parent));

        let team = self
            .teams
            .entry(team_id)
            .or_insert_with(|| Team::new(parent.clone(), team_name, now));
        team.add_child(child.clone());
        team.clone()
    }

    /// The team whose parent is `parent`. Team ids survive a parent re-key,
    /// so this looks at membership rather than deriving the id.
    pub fn team_led_by(&self, parent: &SessionId) -> Option<&Team> {
        self.teams
            .values()
            .find(|team| team.parent_session_id == *parent)
    }

    /// The team `child` belongs to as a subagent.
    pub fn team_of_child(&self, child: &SessionId) -> Option<&Team> {
        self.teams
            .values()
            .find(|team| team.child_session_ids.contains(child))
    }

    /// Removes `child` from its team and returns the updated team.
    pub fn remove_child(&mut self, child: &SessionId) -> Option<Team> {
        let team = self
            .teams
            .values_mut()
            .find(|team| team.child_session_ids.contains(child))?;
        team.remove_child(child);
        Some(team.clone())
    }

    pub fn remove_team(&mut self, team_id: &str) -> Option<Team> {
        self.teams.remove(team_id)
    }

    /// Follows a re-keyed session; returns the teams that changed.
    pub fn rename_member(&mut self, old: &SessionId, new: &SessionId) -> Vec<Team> {
        for entry in self.pending.iter_mut() {
            if entry.parent_session_id == *old {
                entry.parent_session_id = new.clone();
            }
        }

        self.teams
            .values_mut()
            .filter(|team| team.has_member(old))
            .map(|team| {
                team.rename_member(old, new);
                team.clone()
            })
            .collect()
    }

    pub fn get(&self, team_id: &str) -> Option<&Team> {
        self.teams.get(team_id)
    }

    pub fn list(&self) -> Vec<Team> {
        self.teams.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }
}
