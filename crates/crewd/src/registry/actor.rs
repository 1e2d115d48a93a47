//! Registry actor - owns all session state and processes commands.
//!
//! The actor is the single writer of sessions, teams, PID claims, pending
//! resumes and the replay buffer. Every hook, timer fire and sweep is a
//! command handled to completion before the next one, so the whole
//! pipeline is observed in ingest order.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Broadcast send failures (no subscribers) are ignored, reply send
//!   failures (caller went away) likewise

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc::WeakSender;
use tokio::sync::{broadcast, mpsc};
use tokio::task::spawn_blocking;
use tracing::{debug, info, trace, warn};

use crew_core::{HookEventKind, Session, SessionId, SessionStatus, TeamRole, ToolCategory};
use crew_protocol::{Delta, HookPayload, ReplayEntry};

use super::commands::{
    IngestOutcome, RegistryCommand, RegistryConfig, RegistryError, SessionPatch, SubscribeStart,
    Subscription,
};
use super::timers::TimerSet;
use crate::monitor::{lookup_pid, ProcessProbe};
use crate::replay::ReplayBuffer;
use crate::stats::{HookStats, StatsSnapshot, Transport};
use crate::teams::{PendingSubagent, TeamTracker};
use crate::terminal::TerminalDirectory;

/// Tools whose subagents may take a while to send their first hook.
const SUBAGENT_TOOLS: [&str; 2] = ["Task", "Agent"];

/// A resume waiting for its `session-start`, keyed by terminal id.
#[derive(Debug, Clone)]
pub(super) struct PendingResume {
    pub(super) session_id: SessionId,
    pub(super) requested_at: DateTime<Utc>,
}

// ============================================================================
// Registry Actor
// ============================================================================

pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Handed to timers and background lookups so they can report back
    /// without keeping the actor alive.
    pub(super) sender: WeakSender<RegistryCommand>,

    pub(super) sessions: HashMap<SessionId, Session>,

    /// Which session currently owns each agent PID. A PID has one owner.
    pub(super) pid_owners: HashMap<u32, SessionId>,

    pub(super) pending_resumes: HashMap<String, PendingResume>,

    pub(super) teams: TeamTracker,
    pub(super) timers: TimerSet,
    replay: ReplayBuffer,
    stats: HookStats,

    delta_publisher: broadcast::Sender<ReplayEntry>,

    pub(super) probe: Arc<dyn ProcessProbe>,
    pub(super) terminals: Arc<dyn TerminalDirectory>,
    pub(super) config: RegistryConfig,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        sender: WeakSender<RegistryCommand>,
        delta_publisher: broadcast::Sender<ReplayEntry>,
        probe: Arc<dyn ProcessProbe>,
        terminals: Arc<dyn TerminalDirectory>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            receiver,
            sender,
            sessions: HashMap::new(),
            pid_owners: HashMap::new(),
            pending_resumes: HashMap::new(),
            teams: TeamTracker::new(),
            timers: TimerSet::new(),
            replay: ReplayBuffer::new(),
            stats: HookStats::new(),
            delta_publisher,
            probe,
            terminals,
            config,
        }
    }

    /// Processes commands until every sender is dropped.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            sessions = self.sessions.len(),
            teams = self.teams.len(),
            last_seq = self.replay.last_seq(),
            "Registry actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        let now = Utc::now();
        match cmd {
            RegistryCommand::Ingest {
                payload,
                transport,
                received_at,
                respond_to,
            } => {
                let result = self.handle_ingest(payload, transport, received_at);
                let _ = respond_to.send(result);
            }
            RegistryCommand::GetSession {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.sessions.get(&session_id).cloned());
            }
            RegistryCommand::GetAllSessions { respond_to } => {
                let _ = respond_to.send(self.all_sessions());
            }
            RegistryCommand::GetTeams { respond_to } => {
                let _ = respond_to.send(self.teams.list());
            }
            RegistryCommand::UpdateSession {
                session_id,
                patch,
                respond_to,
            } => {
                let result = self.handle_update_session(&session_id, &patch, now);
                let _ = respond_to.send(result);
            }
            RegistryCommand::RequestResume {
                session_id,
                terminal_id,
                respond_to,
            } => {
                let result = self.handle_request_resume(&session_id, terminal_id, now);
                let _ = respond_to.send(result);
            }
            RegistryCommand::CreatePlaceholder {
                terminal_id,
                cwd,
                respond_to,
            } => {
                let session = self.handle_create_placeholder(&terminal_id, cwd.as_deref(), now);
                let _ = respond_to.send(session);
            }
            RegistryCommand::TerminalClosed {
                terminal_id,
                respond_to,
            } => {
                let result = self.handle_terminal_closed(&terminal_id, now);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Subscribe {
                last_seq,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_subscribe(last_seq));
            }
            RegistryCommand::ReplaySince { after, respond_to } => {
                let _ = respond_to.send(self.replay.since(after));
            }
            RegistryCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats_snapshot(now));
            }
            RegistryCommand::ToolTimeout {
                session_id,
                tool,
                generation,
                children_running,
            } => {
                self.handle_tool_timeout(&session_id, &tool, generation, children_running, now);
            }
            RegistryCommand::ClaimPid { session_id, pid } => {
                self.handle_claim_pid(&session_id, pid, now);
            }
            RegistryCommand::RemoveEnded {
                session_id,
                generation,
            } => {
                self.handle_remove_ended(&session_id, generation, now);
            }
            RegistryCommand::TeamCleanup {
                team_id,
                generation,
            } => {
                self.handle_team_cleanup(&team_id, generation, now);
            }
            RegistryCommand::CheckLiveness => self.check_liveness(now),
            RegistryCommand::AutoIdleSweep => self.auto_idle_sweep(now),
            RegistryCommand::ExpireResumes => self.expire_resumes(now),
        }
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    fn handle_ingest(
        &mut self,
        payload: Value,
        transport: Transport,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, RegistryError> {
        let payload = match HookPayload::decode(payload) {
            Ok(payload) => payload,
            Err(err) => {
                self.stats.record_rejected(transport);
                warn!(%transport, error = %err, "Rejected hook payload");
                return Err(err.into());
            }
        };
        self.stats
            .record(payload.kind, transport, payload.sent_at_ms(), received_at);

        let now = received_at;
        let kind = payload.kind;
        let (session_id, resolution) = self.resolve(&payload, now);

        if let Some(pid) = payload.pid() {
            self.claim_pid(&session_id, pid, now);
        }
        if kind != HookEventKind::SessionEnd {
            self.timers.cancel_removal(&session_id);
        }
        if resolution.is_new() || kind == HookEventKind::SessionStart {
            self.try_join_team(&session_id, &payload, now);
        }

        let input = payload.event_input();
        let transition = {
            let session = self
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
            if kind == HookEventKind::SessionStart && session.agent_type.is_none() {
                session.agent_type = payload.fields.agent_type.clone();
            }
            session.apply_event(kind, &input, now)
        };

        debug!(
            session_id = %session_id,
            event = %kind,
            ?resolution,
            from = %transition.from,
            to = %transition.to,
            "Applied hook event"
        );

        self.apply_side_effects(&session_id, &payload, now);
        self.publish_session(&session_id, now);

        Ok(IngestOutcome {
            session_id,
            resolution,
            status: transition.to,
        })
    }

    /// Timers, subagent bookkeeping and PID lookup driven by the event kind.
    fn apply_side_effects(&mut self, session_id: &SessionId, payload: &HookPayload, now: DateTime<Utc>) {
        match payload.kind {
            HookEventKind::PreToolUse => {
                self.arm_tool_timer(session_id, payload.fields.tool_name.as_deref());
            }
            HookEventKind::SessionEnd => {
                self.after_session_ended(session_id, now);
            }
            HookEventKind::SessionStart => {
                self.timers.cancel_tool(session_id);
                self.spawn_pid_lookup(session_id);
            }
            HookEventKind::SubagentStart => {
                self.register_pending_subagent(session_id, payload, now);
            }
            HookEventKind::SubagentStop => {
                self.teams
                    .consume_pending(session_id, payload.fields.agent_id.as_deref());
            }
            kind if kind.settles_tool() || kind == HookEventKind::UserPromptSubmit => {
                self.timers.cancel_tool(session_id);
            }
            _ => {}
        }
    }

    // ========================================================================
    // Tool Timeouts
    // ========================================================================

    fn arm_tool_timer(&mut self, session_id: &SessionId, tool: Option<&str>) {
        let Some((tool, category)) = tool.and_then(|t| ToolCategory::classify(t).map(|c| (t, c)))
        else {
            // Tools without a completion guarantee never escalate.
            self.timers.cancel_tool(session_id);
            return;
        };

        let delay = self.config.tool_timeouts.for_category(category);
        let child_check = if category.checks_child_processes() {
            self.sessions
                .get(session_id)
                .and_then(|s| s.cached_pid)
                .map(|pid| (pid, Arc::clone(&self.probe)))
        } else {
            None
        };

        self.timers
            .arm_tool(&self.sender, session_id, tool, delay, child_check);
        trace!(session_id = %session_id, tool, ?category, ?delay, "Armed tool timer");
    }

    fn handle_tool_timeout(
        &mut self,
        session_id: &SessionId,
        tool: &str,
        generation: u64,
        children_running: bool,
        now: DateTime<Utc>,
    ) {
        if !self.timers.take_tool(session_id, generation) {
            return;
        }
        if children_running {
            debug!(session_id = %session_id, tool, "Tool has running child processes, not escalating");
            return;
        }
        let Some(category) = ToolCategory::classify(tool) else {
            return;
        };

        let target = category.escalates_to();
        let escalated = self
            .sessions
            .get_mut(session_id)
            .is_some_and(|session| session.escalate(tool, target, now));
        if escalated {
            info!(session_id = %session_id, tool, status = %target, "Tool call stalled, escalated");
            self.publish_session(session_id, now);
        }
    }

    // ========================================================================
    // PID Claims
    // ========================================================================

    /// Gives `pid` to `session_id`, taking it away from any previous owner.
    fn claim_pid(&mut self, session_id: &SessionId, pid: u32, now: DateTime<Utc>) {
        if let Some(previous) = self.pid_owners.insert(pid, session_id.clone()) {
            if previous != *session_id {
                if let Some(other) = self.sessions.get_mut(&previous) {
                    if other.cached_pid == Some(pid) {
                        other.cached_pid = None;
                    }
                }
                debug!(pid, from = %previous, to = %session_id, "PID reassigned");
                self.publish_session(&previous, now);
            }
        }

        if let Some(session) = self.sessions.get_mut(session_id) {
            if let Some(old) = session.cached_pid.replace(pid) {
                if old != pid && self.pid_owners.get(&old) == Some(session_id) {
                    self.pid_owners.remove(&old);
                }
            }
        }
    }

    fn release_pid(&mut self, session_id: &SessionId) {
        let Some(pid) = self
            .sessions
            .get_mut(session_id)
            .and_then(|s| s.cached_pid.take())
        else {
            return;
        };
        if self.pid_owners.get(&pid) == Some(session_id) {
            self.pid_owners.remove(&pid);
        }
    }

    /// Looks for the agent process off the actor task.
    fn spawn_pid_lookup(&self, session_id: &SessionId) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if session.cached_pid.is_some() {
            return;
        }

        let cwd = session.project_path.clone();
        let claimed: HashSet<u32> = self.pid_owners.keys().copied().collect();
        let probe = Arc::clone(&self.probe);
        let sender = self.sender.clone();
        let session_id = session_id.clone();

        tokio::spawn(async move {
            let found = spawn_blocking(move || {
                lookup_pid(probe.as_ref(), None, cwd.as_deref(), &claimed)
            })
            .await
            .ok()
            .flatten();

            let Some(pid) = found else {
                trace!(session_id = %session_id, "No agent process found");
                return;
            };
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(RegistryCommand::ClaimPid { session_id, pid }).await;
            }
        });
    }

    fn handle_claim_pid(&mut self, session_id: &SessionId, pid: u32, now: DateTime<Utc>) {
        let eligible = self
            .sessions
            .get(session_id)
            .is_some_and(|s| !s.status.is_ended() && s.cached_pid.is_none());
        let owned_elsewhere = self
            .pid_owners
            .get(&pid)
            .is_some_and(|owner| owner != session_id);
        if !eligible || owned_elsewhere {
            debug!(session_id = %session_id, pid, "Discarding background PID match");
            return;
        }

        self.claim_pid(session_id, pid, now);
        info!(session_id = %session_id, pid, "Found agent process");
        self.publish_session(session_id, now);
    }

    // ========================================================================
    // Teams
    // ========================================================================

    fn register_pending_subagent(
        &mut self,
        parent_id: &SessionId,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) {
        let Some(parent) = self.sessions.get(parent_id) else {
            return;
        };
        let Some(cwd) = parent
            .project_path
            .clone()
            .or_else(|| payload.cwd().map(str::to_string))
        else {
            debug!(session_id = %parent_id, "Subagent start without a working directory");
            return;
        };

        let spawning = parent
            .pending_tool
            .as_deref()
            .is_some_and(|tool| SUBAGENT_TOOLS.contains(&tool));
        let ttl = if spawning {
            self.config.subagent_ttl_extended
        } else {
            self.config.subagent_ttl
        };

        self.teams.register_pending(PendingSubagent::new(
            parent_id.clone(),
            &cwd,
            payload.fields.agent_type.clone(),
            payload.fields.agent_id.clone(),
            now,
            to_chrono(ttl),
        ));
    }

    /// Links a session to its parent's team, explicitly or by directory.
    fn try_join_team(&mut self, child_id: &SessionId, payload: &HookPayload, now: DateTime<Utc>) {
        let Some(child) = self.sessions.get(child_id) else {
            return;
        };
        if child.team_id.is_some() {
            return;
        }
        let child_cwd = child
            .project_path
            .clone()
            .or_else(|| payload.cwd().map(str::to_string));

        let explicit = payload
            .parent_session_id()
            .filter(|parent| parent != child_id && self.sessions.contains_key(parent));
        let (parent_id, agent_type) = match explicit {
            Some(parent) => (parent, payload.fields.agent_type.clone()),
            None => {
                let Some(cwd) = child_cwd else {
                    return;
                };
                let Some(pending) = self.teams.take_match(child_id, &cwd, now) else {
                    return;
                };
                if !self.sessions.contains_key(&pending.parent_session_id) {
                    return;
                }
                (pending.parent_session_id, pending.agent_type)
            }
        };

        let team_name = payload
            .fields
            .team_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| self.sessions.get(&parent_id).map(|p| p.project_name.clone()))
            .unwrap_or_else(|| "team".to_string());

        let team = self.teams.link(&parent_id, child_id, &team_name, now);
        self.timers.cancel_team_cleanup(&team.team_id);

        if let Some(parent) = self.sessions.get_mut(&parent_id) {
            if parent.team_id.is_none() {
                parent.team_id = Some(team.team_id.clone());
                parent.team_role = Some(TeamRole::Leader);
            }
        }
        if let Some(child) = self.sessions.get_mut(child_id) {
            child.team_id = Some(team.team_id.clone());
            child.team_role = Some(TeamRole::Member);
            if child.agent_type.is_none() {
                child.agent_type = agent_type;
            }
        }

        info!(
            team_id = %team.team_id,
            parent = %parent_id,
            child = %child_id,
            "Subagent joined team"
        );
        self.publish_session(&parent_id, now);
        self.publish(Delta::Team { team }, now);
    }

    /// A team is finished once its parent and all remaining children ended.
    fn team_finished(&self, team_id: &str) -> bool {
        let Some(team) = self.teams.get(team_id) else {
            return false;
        };
        let gone = |id: &SessionId| self.sessions.get(id).map_or(true, |s| s.status.is_ended());
        gone(&team.parent_session_id) && team.child_session_ids.iter().all(gone)
    }

    fn schedule_team_cleanup(&mut self, team_id: &str) {
        if self.team_finished(team_id) {
            debug!(team_id, "Team finished, scheduling cleanup");
            self.timers
                .arm_team_cleanup(&self.sender, team_id, self.config.team_cleanup_delay);
        }
    }

    fn handle_team_cleanup(&mut self, team_id: &str, generation: u64, now: DateTime<Utc>) {
        if !self.timers.take_team_cleanup(team_id, generation) || !self.team_finished(team_id) {
            return;
        }
        let Some(team) = self.teams.remove_team(team_id) else {
            return;
        };

        let members: Vec<SessionId> = std::iter::once(team.parent_session_id.clone())
            .chain(team.child_session_ids.iter().cloned())
            .collect();
        for member in &members {
            let cleared = match self.sessions.get_mut(member) {
                Some(session) if session.team_id.as_deref() == Some(team_id) => {
                    session.team_id = None;
                    session.team_role = None;
                    true
                }
                _ => false,
            };
            if cleared {
                self.publish_session(member, now);
            }
        }

        info!(team_id, "Team dissolved");
        self.publish(
            Delta::TeamRemoved {
                team_id: team_id.to_string(),
            },
            now,
        );
    }

    // ========================================================================
    // Session End And Removal
    // ========================================================================

    /// Bookkeeping shared by `session-end`, process exit and terminal close.
    fn after_session_ended(&mut self, session_id: &SessionId, now: DateTime<Utc>) {
        self.timers.cancel_tool(session_id);
        self.release_pid(session_id);

        if let Some(team) = self.teams.remove_child(session_id) {
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.team_id = None;
                session.team_role = None;
            }
            let team_id = team.team_id.clone();
            self.publish(Delta::Team { team }, now);
            self.schedule_team_cleanup(&team_id);
        }
        if let Some(team_id) = self
            .teams
            .team_led_by(session_id)
            .map(|team| team.team_id.clone())
        {
            self.schedule_team_cleanup(&team_id);
        }

        let removable = self
            .sessions
            .get(session_id)
            .is_some_and(|s| !s.terminal_backed);
        if removable {
            self.timers
                .arm_removal(&self.sender, session_id, self.config.removal_delay);
        }
    }

    /// Ends a session on behalf of a monitor.
    fn end_session(&mut self, session_id: &SessionId, kind: &str, reason: &str, now: DateTime<Utc>) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let transition = session.force_end(kind, reason, now);
        info!(session_id = %session_id, from = %transition.from, reason, "Session ended");

        self.after_session_ended(session_id, now);
        self.publish_session(session_id, now);
    }

    fn handle_remove_ended(&mut self, session_id: &SessionId, generation: u64, now: DateTime<Utc>) {
        if !self.timers.take_removal(session_id, generation) {
            return;
        }
        let still_ended = self
            .sessions
            .get(session_id)
            .is_some_and(|s| s.status.is_ended() && !s.terminal_backed);
        if still_ended {
            self.remove_session(session_id, now);
        }
    }

    fn remove_session(&mut self, session_id: &SessionId, now: DateTime<Utc>) {
        self.release_pid(session_id);
        self.timers.cancel_session(session_id);
        if self.sessions.remove(session_id).is_none() {
            return;
        }
        self.pending_resumes.retain(|_, p| p.session_id != *session_id);
        if let Some(team) = self.teams.remove_child(session_id) {
            self.publish(Delta::Team { team }, now);
        }

        info!(session_id = %session_id, "Session removed");
        self.publish(
            Delta::SessionRemoved {
                session_id: session_id.clone(),
            },
            now,
        );
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Ends sessions whose agent process is gone.
    ///
    /// An attached terminal is authoritative: its sessions are never ended
    /// on PID evidence alone.
    fn check_liveness(&mut self, now: DateTime<Utc>) {
        let dead: Vec<(SessionId, u32)> = self
            .sessions
            .values()
            .filter(|s| !s.status.is_ended())
            .filter(|s| {
                !s.last_terminal_id
                    .as_deref()
                    .is_some_and(|tid| self.terminals.is_attached(tid))
            })
            .filter_map(|s| {
                s.cached_pid
                    .filter(|pid| !self.probe.is_alive(*pid))
                    .map(|pid| (s.session_id.clone(), pid))
            })
            .collect();

        for (session_id, pid) in dead {
            warn!(session_id = %session_id, pid, "Agent process exited without session end");
            self.end_session(&session_id, "process-exit", "agent process exited", now);
        }
    }

    fn auto_idle_sweep(&mut self, now: DateTime<Utc>) {
        let idle = self.config.idle;
        let stale: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| {
                idle.threshold(s.status)
                    .is_some_and(|limit| elapsed(s.last_activity_at, now) >= limit)
            })
            .map(|s| s.session_id.clone())
            .collect();

        for session_id in stale {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                let transition = session.fall_idle(now);
                debug!(session_id = %session_id, from = %transition.from, "Session auto-idled");
            }
            self.timers.cancel_tool(&session_id);
            self.publish_session(&session_id, now);
        }
    }

    fn expire_resumes(&mut self, now: DateTime<Utc>) {
        let ttl = self.config.resume_ttl;
        let expired: Vec<String> = self
            .pending_resumes
            .iter()
            .filter(|(_, pending)| elapsed(pending.requested_at, now) >= ttl)
            .map(|(terminal_id, _)| terminal_id.clone())
            .collect();

        for terminal_id in expired {
            if let Some(pending) = self.pending_resumes.remove(&terminal_id) {
                info!(session_id = %pending.session_id, terminal_id, "Resume expired");
                self.abandon_resume(&pending.session_id, now);
            }
        }
    }

    fn abandon_resume(&mut self, session_id: &SessionId, now: DateTime<Utc>) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if !session.expire_resume(now) {
            return;
        }
        if !session.terminal_backed {
            self.timers
                .arm_removal(&self.sender, session_id, self.config.removal_delay);
        }
        self.publish_session(session_id, now);
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn all_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    fn handle_update_session(
        &mut self,
        session_id: &SessionId,
        patch: &SessionPatch,
        now: DateTime<Utc>,
    ) -> Result<Session, RegistryError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
        patch.apply(session);
        let updated = session.clone();
        self.publish_session(session_id, now);
        Ok(updated)
    }

    fn handle_request_resume(
        &mut self,
        session_id: &SessionId,
        terminal_id: String,
        now: DateTime<Utc>,
    ) -> Result<Session, RegistryError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
        if !session.status.is_ended() {
            return Err(RegistryError::NotResumable {
                session_id: session_id.clone(),
                status: session.status,
            });
        }
        session.begin_resume(now);
        let updated = session.clone();

        self.timers.cancel_removal(session_id);
        self.pending_resumes.retain(|_, p| p.session_id != *session_id);
        self.pending_resumes.insert(
            terminal_id.clone(),
            PendingResume {
                session_id: session_id.clone(),
                requested_at: now,
            },
        );

        info!(session_id = %session_id, terminal_id, "Resume requested");
        self.publish_session(session_id, now);
        Ok(updated)
    }

    fn handle_create_placeholder(
        &mut self,
        terminal_id: &str,
        cwd: Option<&str>,
        now: DateTime<Utc>,
    ) -> Session {
        let session_id = SessionId::new(terminal_id);
        if let Some(existing) = self.sessions.get(&session_id) {
            return existing.clone();
        }

        let session = Session::placeholder(terminal_id, cwd, now);
        self.sessions.insert(session_id.clone(), session.clone());
        info!(terminal_id, cwd = ?cwd, "Placeholder created");
        self.publish_session(&session_id, now);
        session
    }

    /// Ends whatever runs in a closed terminal.
    fn handle_terminal_closed(&mut self, terminal_id: &str, now: DateTime<Utc>) -> Option<SessionId> {
        if let Some(pending) = self.pending_resumes.remove(terminal_id) {
            self.abandon_resume(&pending.session_id, now);
        }

        let (session_id, status) = self
            .sessions
            .values()
            .find(|s| s.last_terminal_id.as_deref() == Some(terminal_id) && !s.status.is_ended())
            .map(|s| (s.session_id.clone(), s.status))?;

        if status == SessionStatus::Connecting {
            // Nothing ever ran in it.
            self.remove_session(&session_id, now);
        } else {
            self.end_session(&session_id, "terminal-closed", "terminal closed", now);
        }
        Some(session_id)
    }

    fn handle_subscribe(&mut self, last_seq: Option<u64>) -> Subscription {
        let receiver = self.delta_publisher.subscribe();
        let start = match last_seq.and_then(|seq| self.replay.since(seq)) {
            Some(entries) => SubscribeStart::Replay(entries),
            None => SubscribeStart::Snapshot {
                sessions: self.all_sessions(),
                teams: self.teams.list(),
                seq: self.replay.last_seq(),
            },
        };
        Subscription { start, receiver }
    }

    fn stats_snapshot(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot(now);
        snapshot.live_sessions = self
            .sessions
            .values()
            .filter(|s| !s.status.is_ended())
            .count();
        snapshot.teams = self.teams.len();
        snapshot.replay_seq = self.replay.last_seq();
        snapshot
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    pub(super) fn publish(&mut self, delta: Delta, now: DateTime<Utc>) {
        let entry = self.replay.push(delta, now);
        // No subscribers is normal; the replay buffer still has the entry.
        let _ = self.delta_publisher.send(entry);
    }

    /// Publishes the full record; `replaces_id` rides on this delta only.
    pub(super) fn publish_session(&mut self, session_id: &SessionId, now: DateTime<Utc>) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        let snapshot = session.clone();
        session.take_replaces_id();
        self.publish(Delta::session(snapshot), now);
    }

    /// Moves a record to a new id, carrying team membership along.
    pub(super) fn rekey(&mut self, old: &SessionId, new: &SessionId, now: DateTime<Utc>) -> bool {
        let Some(mut session) = self.sessions.remove(old) else {
            return false;
        };
        self.timers.cancel_session(old);
        self.pid_owners.retain(|_, owner| owner != old);
        self.pending_resumes.retain(|_, p| p.session_id != *old);

        session.rekey(new.clone(), now);
        self.sessions.insert(new.clone(), session);

        for team in self.teams.rename_member(old, new) {
            self.publish(Delta::Team { team }, now);
        }
        info!(from = %old, to = %new, "Session re-keyed");
        true
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
