//! Session domain entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::event::{EventInput, HookEventKind};
use crate::path::{normalize_path, project_name};
use crate::ring::BoundedLog;
use crate::status::{AnimationState, Emote, SessionSource, SessionStatus};
use crate::team::TeamRole;
use crate::text::{excerpt, prompt_summary};
use crate::tool::tool_detail;

// ============================================================================
// Limits
// ============================================================================

pub const MAX_PROMPT_HISTORY: usize = 50;
pub const MAX_TOOL_LOG: usize = 200;
pub const MAX_RESPONSE_LOG: usize = 50;
pub const MAX_EVENT_LOG: usize = 50;
pub const MAX_PREVIOUS_SESSIONS: usize = 5;

/// Tool calls in one turn above which the turn counts as heavy.
///
/// Only changes the completion animation.
pub const HEAVY_TURN_TOOL_CALLS: u32 = 10;

const MAX_PROMPT_CHARS: usize = 2_000;
const MAX_RESPONSE_CHARS: usize = 500;
const MAX_ERROR_CHARS: usize = 200;
const MAX_LOG_DETAIL_CHARS: usize = 80;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Opaque identifier assigned to a session by the agent CLI.
///
/// Not stable across a resume: the CLI mints a new one and the resolver
/// re-keys the old record under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Log Entries
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptEntry {
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLogEntry {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEntry {
    pub text: String,
    pub at: DateTime<Utc>,
}

/// One line of the per-session activity log.
///
/// `kind` is a canonical event name or a synthetic marker such as
/// `resumed`, `approval-timeout` or `process-exit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub kind: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Summary of a prior run kept across resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviousSession {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub prompt_count: usize,
    pub tool_calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
}

/// Status change produced by applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

// ============================================================================
// Session
// ============================================================================

/// Live model of one agent session.
///
/// Owned by the registry actor; every mutation goes through the methods
/// below so that each one appends exactly one event-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    // identity
    pub session_id: SessionId,
    /// Previous id after a re-key; cleared once a delta has carried it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_terminal_id: Option<String>,

    // classification
    pub status: SessionStatus,
    pub animation_state: AnimationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emote: Option<Emote>,
    pub source: SessionSource,
    /// Provisioned by the terminal manager; retained after it ends.
    #[serde(default)]
    pub terminal_backed: bool,
    #[serde(default)]
    pub resumable: bool,

    // project context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,

    // bookkeeping
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
    /// OS process backing this session. Claimed through the registry's
    /// PID table, which guarantees no two sessions share one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_pid: Option<u32>,
    #[serde(default)]
    pub queue_count: u32,

    // bounded logs
    pub prompt_history: BoundedLog<PromptEntry, MAX_PROMPT_HISTORY>,
    pub tool_log: BoundedLog<ToolLogEntry, MAX_TOOL_LOG>,
    pub response_log: BoundedLog<ResponseEntry, MAX_RESPONSE_LOG>,
    pub events: BoundedLog<EventLogEntry, MAX_EVENT_LOG>,

    // aggregates
    pub tool_usage: BTreeMap<String, u32>,
    /// Tool calls in the current turn.
    pub total_tool_calls: u32,
    pub subagent_count: u32,

    // pending interaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_tool_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_detail: Option<String>,

    // team
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_role: Option<TeamRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,

    // history chain, survives re-keying
    pub previous_sessions: BoundedLog<PreviousSession, MAX_PREVIOUS_SESSIONS>,
}

impl Session {
    /// Creates a fresh session in `idle`.
    pub fn new(session_id: SessionId, source: SessionSource, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            replaces_id: None,
            last_terminal_id: None,
            status: SessionStatus::Idle,
            animation_state: AnimationState::Idle,
            emote: None,
            source,
            terminal_backed: false,
            resumable: false,
            project_path: None,
            project_name: "unknown".to_string(),
            model: None,
            title: None,
            label: None,
            transcript_path: None,
            permission_mode: None,
            started_at: now,
            last_activity_at: now,
            ended_at: None,
            archived: false,
            cached_pid: None,
            queue_count: 0,
            prompt_history: BoundedLog::new(),
            tool_log: BoundedLog::new(),
            response_log: BoundedLog::new(),
            events: BoundedLog::new(),
            tool_usage: BTreeMap::new(),
            total_tool_calls: 0,
            subagent_count: 0,
            pending_tool: None,
            pending_tool_detail: None,
            waiting_detail: None,
            team_id: None,
            team_role: None,
            agent_type: None,
            agent_name: None,
            previous_sessions: BoundedLog::new(),
        }
    }

    /// Creates the `connecting` placeholder for a freshly provisioned terminal.
    ///
    /// The placeholder is keyed by the terminal id until its first hook
    /// re-keys it under the agent's session id.
    pub fn placeholder(terminal_id: &str, cwd: Option<&str>, now: DateTime<Utc>) -> Self {
        let mut session = Self::new(SessionId::new(terminal_id), SessionSource::Ssh, now);
        session.status = SessionStatus::Connecting;
        session.terminal_backed = true;
        session.last_terminal_id = Some(terminal_id.to_string());
        if let Some(cwd) = cwd {
            session.set_project_path(cwd);
        }
        session.note("connecting", format!("terminal {terminal_id} provisioned"), now);
        session
    }

    /// Records the working directory and derives the project name.
    pub fn set_project_path(&mut self, cwd: &str) {
        let normalized = normalize_path(cwd);
        if normalized.is_empty() {
            return;
        }
        self.project_name = project_name(&normalized);
        self.project_path = Some(normalized);
    }

    /// Appends an entry to the event log.
    pub fn note(&mut self, kind: &str, detail: impl Into<String>, now: DateTime<Utc>) {
        self.events.push(EventLogEntry {
            kind: kind.to_string(),
            detail: detail.into(),
            at: now,
        });
    }

    // ========================================================================
    // State Machine
    // ========================================================================

    /// Applies a hook event and returns the resulting status change.
    ///
    /// Timers, PID claims and team bookkeeping are side effects the caller
    /// performs based on `kind`; this method only touches the record.
    pub fn apply_event(
        &mut self,
        kind: HookEventKind,
        input: &EventInput,
        now: DateTime<Utc>,
    ) -> Transition {
        let from = self.status;
        self.last_activity_at = now;
        self.absorb_hints(input);

        let tool = input.tool_name.clone();
        let tool_label = tool.as_deref().unwrap_or("tool");

        let detail = match kind {
            HookEventKind::SessionStart => {
                self.status = SessionStatus::Idle;
                self.animation_state = AnimationState::Idle;
                self.emote = Some(Emote::Wave);
                self.ended_at = None;
                self.resumable = false;
                self.clear_pending();
                format!("session started in {}", self.project_name)
            }
            HookEventKind::UserPromptSubmit => {
                self.status = SessionStatus::Prompting;
                self.animation_state = AnimationState::Walking;
                self.emote = None;
                self.clear_pending();
                let prompt = input.prompt.as_deref().unwrap_or("");
                if !prompt.trim().is_empty() {
                    self.prompt_history.push(PromptEntry {
                        text: excerpt(prompt, MAX_PROMPT_CHARS),
                        at: now,
                    });
                    if self.title.is_none() {
                        self.title = Some(self.generate_title(prompt));
                    }
                }
                excerpt(prompt, MAX_LOG_DETAIL_CHARS)
            }
            HookEventKind::PreToolUse => {
                self.status = SessionStatus::Working;
                self.animation_state = AnimationState::Running;
                self.emote = None;
                let detail = input.tool_input.as_ref().and_then(tool_detail);
                *self.tool_usage.entry(tool_label.to_string()).or_insert(0) += 1;
                self.total_tool_calls = self.total_tool_calls.saturating_add(1);
                self.tool_log.push(ToolLogEntry {
                    tool: tool_label.to_string(),
                    detail: detail.clone(),
                    at: now,
                    failed: false,
                    error: None,
                });
                self.pending_tool = Some(tool_label.to_string());
                self.pending_tool_detail = detail.clone();
                self.waiting_detail = None;
                match detail {
                    Some(d) => format!("{tool_label}: {d}"),
                    None => tool_label.to_string(),
                }
            }
            HookEventKind::PostToolUse => {
                self.status = SessionStatus::Working;
                self.animation_state = AnimationState::Running;
                self.clear_pending();
                tool_label.to_string()
            }
            HookEventKind::PostToolUseFailure => {
                self.status = SessionStatus::Working;
                self.animation_state = AnimationState::Running;
                self.clear_pending();
                let error = input
                    .error
                    .as_deref()
                    .map(|e| excerpt(e, MAX_ERROR_CHARS));
                self.mark_tool_failed(tool.as_deref(), error.clone());
                match error {
                    Some(e) => format!("{tool_label} failed: {e}"),
                    None => format!("{tool_label} failed"),
                }
            }
            HookEventKind::PermissionRequest => {
                self.status = SessionStatus::Approval;
                self.animation_state = AnimationState::Waiting;
                self.emote = Some(Emote::Question);
                if let Some(ref name) = tool {
                    self.pending_tool = Some(name.clone());
                }
                let waiting = self.describe_pending(tool_label);
                self.waiting_detail = Some(format!("Waiting for approval: {waiting}"));
                format!("{tool_label} needs permission")
            }
            HookEventKind::Stop => {
                let calls = self.total_tool_calls;
                self.status = SessionStatus::Waiting;
                if calls > HEAVY_TURN_TOOL_CALLS {
                    self.animation_state = AnimationState::Dance;
                    self.emote = Some(Emote::Celebrate);
                } else {
                    self.animation_state = AnimationState::Idle;
                    self.emote = Some(Emote::ThumbsUp);
                }
                self.total_tool_calls = 0;
                self.clear_pending();
                if let Some(response) = input.response.as_deref().filter(|r| !r.trim().is_empty()) {
                    self.response_log.push(ResponseEntry {
                        text: excerpt(response, MAX_RESPONSE_CHARS),
                        at: now,
                    });
                }
                format!("turn finished after {calls} tool calls")
            }
            HookEventKind::SubagentStart => {
                self.subagent_count = self.subagent_count.saturating_add(1);
                input
                    .agent_type
                    .clone()
                    .unwrap_or_else(|| "subagent".to_string())
            }
            HookEventKind::SubagentStop => {
                self.subagent_count = self.subagent_count.saturating_sub(1);
                input
                    .agent_type
                    .clone()
                    .unwrap_or_else(|| "subagent".to_string())
            }
            HookEventKind::TaskCompleted => {
                self.emote = Some(Emote::ThumbsUp);
                input
                    .message
                    .as_deref()
                    .map(|m| excerpt(m, MAX_LOG_DETAIL_CHARS))
                    .unwrap_or_default()
            }
            HookEventKind::TeammateIdle | HookEventKind::PreCompact | HookEventKind::Notification => {
                input
                    .message
                    .as_deref()
                    .map(|m| excerpt(m, MAX_LOG_DETAIL_CHARS))
                    .unwrap_or_default()
            }
            HookEventKind::SessionEnd => {
                self.end(now);
                "session ended".to_string()
            }
        };

        self.note(kind.as_str(), detail, now);
        Transition {
            from,
            to: self.status,
        }
    }

    /// Escalates a stalled tool call to `approval` or `input`.
    ///
    /// Only takes effect while the session is still `working` on the same
    /// tool; otherwise a completion already moved it on and this is a no-op.
    pub fn escalate(&mut self, tool: &str, to: SessionStatus, now: DateTime<Utc>) -> bool {
        if self.status != SessionStatus::Working || self.pending_tool.as_deref() != Some(tool) {
            return false;
        }

        let what = self.describe_pending(tool);
        let (waiting, kind) = match to {
            SessionStatus::Input => (format!("Waiting for input: {what}"), "input-timeout"),
            _ => (format!("Waiting for approval: {what}"), "approval-timeout"),
        };

        self.status = to;
        self.animation_state = AnimationState::Waiting;
        self.emote = Some(Emote::Question);
        self.waiting_detail = Some(waiting.clone());
        self.note(kind, waiting, now);
        true
    }

    /// Ends the session on behalf of a monitor rather than the CLI.
    pub fn force_end(&mut self, kind: &str, reason: &str, now: DateTime<Utc>) -> Transition {
        let from = self.status;
        self.end(now);
        self.note(kind, reason, now);
        Transition {
            from,
            to: self.status,
        }
    }

    /// Drops an inactive session back to `idle`.
    pub fn fall_idle(&mut self, now: DateTime<Utc>) -> Transition {
        let from = self.status;
        self.status = SessionStatus::Idle;
        self.animation_state = AnimationState::Idle;
        self.emote = None;
        self.clear_pending();
        self.note("auto-idle", format!("no activity while {from}"), now);
        Transition {
            from,
            to: self.status,
        }
    }

    /// Marks an ended session as waiting for its resumed run to start.
    pub fn begin_resume(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::Connecting;
        self.animation_state = AnimationState::Idle;
        self.last_activity_at = now;
        self.note("resume-pending", "waiting for resumed session to start", now);
    }

    /// Reverts an abandoned resume. Returns false if the session moved on.
    pub fn expire_resume(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != SessionStatus::Connecting {
            return false;
        }
        self.status = SessionStatus::Ended;
        self.animation_state = AnimationState::Death;
        self.note("resume-expired", "no session start arrived", now);
        true
    }

    /// Moves this record under a new identifier.
    ///
    /// Everything describing the old run is reset; `previous_sessions`
    /// keeps a summary of it so the history chain survives.
    pub fn rekey(&mut self, new_id: SessionId, now: DateTime<Utc>) {
        if self.has_activity() {
            let summary = self.summarize();
            self.previous_sessions.push(summary);
        }

        let old_id = std::mem::replace(&mut self.session_id, new_id);

        self.status = SessionStatus::Idle;
        self.animation_state = AnimationState::Idle;
        self.emote = None;
        self.title = None;
        self.started_at = now;
        self.last_activity_at = now;
        self.ended_at = None;
        self.resumable = false;
        self.cached_pid = None;
        self.queue_count = 0;
        self.prompt_history.clear();
        self.tool_log.clear();
        self.response_log.clear();
        self.events.clear();
        self.tool_usage.clear();
        self.total_tool_calls = 0;
        self.subagent_count = 0;
        self.clear_pending();

        self.note("resumed", format!("resumed from {old_id}"), now);
        self.replaces_id = Some(old_id);
    }

    /// Takes the one-shot `replaces_id` after a delta has carried it.
    pub fn take_replaces_id(&mut self) -> Option<SessionId> {
        self.replaces_id.take()
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn end(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::Ended;
        self.animation_state = AnimationState::Death;
        self.emote = None;
        self.ended_at = Some(now);
        self.clear_pending();
        if self.terminal_backed {
            self.resumable = true;
            self.last_terminal_id = None;
        }
    }

    fn absorb_hints(&mut self, input: &EventInput) {
        if self.project_path.is_none() {
            if let Some(cwd) = input.cwd.as_deref() {
                self.set_project_path(cwd);
            }
        }
        if let Some(ref model) = input.model {
            self.model = Some(model.clone());
        }
        if let Some(ref path) = input.transcript_path {
            self.transcript_path = Some(path.clone());
        }
        if let Some(ref mode) = input.permission_mode {
            self.permission_mode = Some(mode.clone());
        }
        if self.agent_name.is_none() {
            self.agent_name = input.agent_name.clone();
        }
    }

    fn clear_pending(&mut self) {
        self.pending_tool = None;
        self.pending_tool_detail = None;
        self.waiting_detail = None;
    }

    fn describe_pending(&self, tool: &str) -> String {
        match self.pending_tool_detail {
            Some(ref detail) => format!("{tool} ({detail})"),
            None => tool.to_string(),
        }
    }

    /// Marks the most recent unfailed entry for `tool` as failed.
    fn mark_tool_failed(&mut self, tool: Option<&str>, error: Option<String>) {
        let entry = self
            .tool_log
            .iter_mut()
            .rev()
            .find(|e| !e.failed && tool.map_or(true, |t| e.tool == t));
        if let Some(entry) = entry {
            entry.failed = true;
            entry.error = error;
        }
    }

    fn generate_title(&self, prompt: &str) -> String {
        let summary = prompt_summary(prompt);
        if summary.is_empty() {
            self.project_name.clone()
        } else {
            format!("{} - {}", self.project_name, summary)
        }
    }

    fn has_activity(&self) -> bool {
        !self.prompt_history.is_empty() || !self.tool_log.is_empty() || self.ended_at.is_some()
    }

    fn summarize(&self) -> PreviousSession {
        PreviousSession {
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            title: self.title.clone(),
            prompt_count: self.prompt_history.len(),
            tool_calls: self.tool_usage.values().sum(),
            last_prompt: self.prompt_history.last().map(|p| p.text.clone()),
        }
    }
}
