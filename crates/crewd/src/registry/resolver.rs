//! Identity resolution: which record does an inbound hook belong to?
//!
//! Steps run in a fixed order and the first match wins:
//!
//! 1. the session id is already tracked
//! 2. (`session-start` only) a pending resume, by terminal id and then by
//!    working directory
//! 3. the payload's terminal id names a `connecting` placeholder
//! 4. a terminal awaiting its first hook in the payload's directory
//! 5. a `connecting` placeholder with the same project path
//! 6. the agent PID descends from a known terminal's shell
//! 7. otherwise a new session is created
//!
//! Steps 2 to 6 re-key an existing record where one exists, so a terminal
//! never shows two cards for one agent.

use chrono::{DateTime, Utc};
use tracing::debug;

use crew_core::{normalize_path, HookEventKind, Session, SessionId, SessionSource, SessionStatus};
use crew_protocol::HookPayload;

use super::actor::RegistryActor;
use super::commands::Resolution;

impl RegistryActor {
    pub(super) fn resolve(
        &mut self,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) -> (SessionId, Resolution) {
        let id = payload.session_id();
        if self.sessions.contains_key(&id) {
            return (id, Resolution::Known);
        }

        let resolution = if let Some(r) = self.resume_on_start(&id, payload, now) {
            r
        } else if let Some(r) = self.link_by_terminal_id(&id, payload, now) {
            r
        } else if let Some(r) = self.link_by_pending_cwd(&id, payload, now) {
            r
        } else if let Some(r) = self.link_by_project_path(&id, payload, now) {
            r
        } else if let Some(r) = self.link_by_process(&id, payload, now) {
            r
        } else {
            self.create(&id, payload, now);
            Resolution::Created
        };

        debug!(session_id = %id, ?resolution, "Resolved session identity");
        (id, resolution)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    fn resume_on_start(
        &mut self,
        id: &SessionId,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        if payload.kind != HookEventKind::SessionStart || self.pending_resumes.is_empty() {
            return None;
        }

        let by_terminal = payload
            .terminal_id()
            .filter(|tid| self.pending_resumes.contains_key(*tid))
            .map(str::to_string);
        let terminal_id = match by_terminal {
            Some(tid) => tid,
            None => {
                let cwd = normalize_path(payload.cwd()?);
                self.pending_resumes
                    .iter()
                    .find(|(_, pending)| {
                        self.sessions
                            .get(&pending.session_id)
                            .and_then(|s| s.project_path.as_deref())
                            == Some(cwd.as_str())
                    })
                    .map(|(tid, _)| tid.clone())?
            }
        };

        let pending = self.pending_resumes.remove(&terminal_id)?;
        if !self.rekey(&pending.session_id, id, now) {
            return None;
        }
        if let Some(session) = self.sessions.get_mut(id) {
            session.last_terminal_id = Some(terminal_id.clone());
        }
        self.terminals.link(&terminal_id, id);
        Some(Resolution::Resumed)
    }

    fn link_by_terminal_id(
        &mut self,
        id: &SessionId,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        let terminal_id = payload.terminal_id()?.to_string();
        let placeholder = self.placeholder_for(&terminal_id)?;
        if !self.rekey(&placeholder, id, now) {
            return None;
        }
        self.terminals.link(&terminal_id, id);
        Some(Resolution::TerminalLink)
    }

    fn link_by_pending_cwd(
        &mut self,
        id: &SessionId,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        let cwd = payload.cwd()?;
        let terminal_id = self.terminals.take_pending_link(cwd)?;
        self.adopt_terminal(id, &terminal_id, payload, now);
        Some(Resolution::CwdLink)
    }

    fn link_by_project_path(
        &mut self,
        id: &SessionId,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        let cwd = normalize_path(payload.cwd()?);
        let (placeholder, terminal_id) = self
            .sessions
            .values()
            .find(|s| {
                self.is_placeholder(s) && s.project_path.as_deref() == Some(cwd.as_str())
            })
            .map(|s| (s.session_id.clone(), s.last_terminal_id.clone()))?;

        if !self.rekey(&placeholder, id, now) {
            return None;
        }
        if let Some(tid) = terminal_id {
            self.terminals.link(&tid, id);
        }
        Some(Resolution::PathScan)
    }

    fn link_by_process(
        &mut self,
        id: &SessionId,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) -> Option<Resolution> {
        let pid = payload.pid()?;
        let terminal_id = self.terminals.terminal_for_process(pid)?;
        // Subagents descend from the same shell as their parent; only the
        // first agent in a terminal belongs to it.
        if self.terminal_in_use(&terminal_id) {
            return None;
        }
        self.adopt_terminal(id, &terminal_id, payload, now);
        Some(Resolution::ProcessAncestry)
    }

    fn create(&mut self, id: &SessionId, payload: &HookPayload, now: DateTime<Utc>) {
        let source = SessionSource::infer(&payload.env_hints());
        let mut session = Session::new(id.clone(), source, now);
        if let Some(cwd) = payload.cwd() {
            session.set_project_path(cwd);
        }
        self.sessions.insert(id.clone(), session);
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Re-keys the terminal's placeholder, or starts a terminal-backed
    /// session when there is none.
    fn adopt_terminal(
        &mut self,
        id: &SessionId,
        terminal_id: &str,
        payload: &HookPayload,
        now: DateTime<Utc>,
    ) {
        let rekeyed = match self.placeholder_for(terminal_id) {
            Some(placeholder) => self.rekey(&placeholder, id, now),
            None => false,
        };
        if !rekeyed {
            let mut session = Session::new(id.clone(), SessionSource::Ssh, now);
            session.terminal_backed = true;
            session.last_terminal_id = Some(terminal_id.to_string());
            if let Some(cwd) = payload.cwd() {
                session.set_project_path(cwd);
            }
            self.sessions.insert(id.clone(), session);
        }
        self.terminals.link(terminal_id, id);
    }

    /// A `connecting` record that is not waiting on a resume.
    fn is_placeholder(&self, session: &Session) -> bool {
        session.status == SessionStatus::Connecting
            && !self
                .pending_resumes
                .values()
                .any(|p| p.session_id == session.session_id)
    }

    fn placeholder_for(&self, terminal_id: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| {
                self.is_placeholder(s) && s.last_terminal_id.as_deref() == Some(terminal_id)
            })
            .map(|s| s.session_id.clone())
    }

    /// Whether a live, already-linked session runs in the terminal.
    fn terminal_in_use(&self, terminal_id: &str) -> bool {
        self.sessions.values().any(|s| {
            !s.status.is_ended()
                && s.status != SessionStatus::Connecting
                && s.last_terminal_id.as_deref() == Some(terminal_id)
        })
    }
}
