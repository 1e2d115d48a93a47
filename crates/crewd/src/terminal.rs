//! Terminal collaborator seam.
//!
//! Terminals are provisioned by an external SSH/PTY manager. The registry
//! asks it three things while resolving a hook: is a terminal waiting for
//! its first hook in this directory, does this PID descend from a known
//! terminal's shell, and is a terminal still attached. [`LocalTerminals`]
//! answers them from records the manager pushes over the HTTP API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crew_core::{normalize_path, SessionId};

use crate::monitor::{find_ancestor, ProcessProbe};

/// What the registry needs from the terminal manager.
pub trait TerminalDirectory: Send + Sync {
    /// Claims the terminal awaiting its first hook in `cwd`, if any.
    fn take_pending_link(&self, cwd: &str) -> Option<String>;

    /// Terminal whose shell is `pid` or one of its ancestors.
    fn terminal_for_process(&self, pid: u32) -> Option<String>;

    /// Records that `session_id` runs in `terminal_id`.
    fn link(&self, terminal_id: &str, session_id: &SessionId);

    /// Whether the terminal is still open. Authoritative over PID probes.
    fn is_attached(&self, terminal_id: &str) -> bool;
}

/// A terminal as announced by the manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSpec {
    pub terminal_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub shell_pid: Option<u32>,
    /// Link the first hook seen in `cwd` to this terminal.
    #[serde(default = "default_true")]
    pub await_link: bool,
    /// Show a `connecting` placeholder until that hook arrives.
    #[serde(default = "default_true")]
    pub placeholder: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRecord {
    pub terminal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub provisioned_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    terminals: HashMap<String, TerminalRecord>,
    /// (normalized cwd, terminal id), oldest first.
    pending_links: Vec<(String, String)>,
}

/// In-process terminal directory.
///
/// Cloning shares the same records.
#[derive(Clone)]
pub struct LocalTerminals {
    inner: Arc<Mutex<Inner>>,
    probe: Arc<dyn ProcessProbe>,
}

impl LocalTerminals {
    pub fn new(probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            probe,
        }
    }

    /// Records a newly provisioned terminal. Re-provisioning replaces it.
    pub fn provision(&self, spec: &TerminalSpec) -> TerminalRecord {
        let cwd = spec.cwd.as_deref().map(normalize_path).filter(|c| !c.is_empty());
        let record = TerminalRecord {
            terminal_id: spec.terminal_id.clone(),
            cwd: cwd.clone(),
            shell_pid: spec.shell_pid,
            session_id: None,
            provisioned_at: Utc::now(),
        };

        let mut inner = self.lock();
        inner.pending_links.retain(|(_, id)| *id != spec.terminal_id);
        if let (true, Some(cwd)) = (spec.await_link, cwd) {
            inner.pending_links.push((cwd, spec.terminal_id.clone()));
        }
        inner
            .terminals
            .insert(spec.terminal_id.clone(), record.clone());

        info!(terminal_id = %spec.terminal_id, shell_pid = ?spec.shell_pid, "Terminal provisioned");
        record
    }

    /// Forgets a closed terminal.
    pub fn close(&self, terminal_id: &str) -> Option<TerminalRecord> {
        let mut inner = self.lock();
        inner.pending_links.retain(|(_, id)| id != terminal_id);
        let removed = inner.terminals.remove(terminal_id);
        if removed.is_some() {
            info!(terminal_id, "Terminal closed");
        }
        removed
    }

    pub fn list(&self) -> Vec<TerminalRecord> {
        let mut records: Vec<TerminalRecord> = self.lock().terminals.values().cloned().collect();
        records.sort_by(|a, b| a.provisioned_at.cmp(&b.provisioned_at));
        records
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-update;
        // the records themselves are still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TerminalDirectory for LocalTerminals {
    fn take_pending_link(&self, cwd: &str) -> Option<String> {
        let cwd = normalize_path(cwd);
        let mut inner = self.lock();
        let index = inner.pending_links.iter().position(|(dir, _)| *dir == cwd)?;
        let (_, terminal_id) = inner.pending_links.remove(index);
        debug!(terminal_id = %terminal_id, cwd = %cwd, "Claimed pending terminal link");
        Some(terminal_id)
    }

    fn terminal_for_process(&self, pid: u32) -> Option<String> {
        let shells: HashMap<u32, String> = self
            .lock()
            .terminals
            .values()
            .filter_map(|t| t.shell_pid.map(|shell| (shell, t.terminal_id.clone())))
            .collect();
        if shells.is_empty() {
            return None;
        }

        let shell = find_ancestor(self.probe.as_ref(), pid, |candidate| {
            shells.contains_key(&candidate)
        })?;
        shells.get(&shell).cloned()
    }

    fn link(&self, terminal_id: &str, session_id: &SessionId) {
        let mut inner = self.lock();
        inner.pending_links.retain(|(_, id)| id != terminal_id);
        if let Some(record) = inner.terminals.get_mut(terminal_id) {
            record.session_id = Some(session_id.clone());
        }
    }

    fn is_attached(&self, terminal_id: &str) -> bool {
        self.lock().terminals.contains_key(terminal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::fake::FakeProbe;

    fn spec(id: &str, cwd: &str, shell_pid: Option<u32>) -> TerminalSpec {
        TerminalSpec {
            terminal_id: id.to_string(),
            cwd: Some(cwd.to_string()),
            shell_pid,
            await_link: true,
            placeholder: true,
        }
    }

    fn terminals() -> (LocalTerminals, Arc<FakeProbe>) {
        let probe = Arc::new(FakeProbe::new());
        (LocalTerminals::new(probe.clone()), probe)
    }

    #[test]
    fn test_pending_link_is_claimed_once() {
        let (terminals, _) = terminals();
        terminals.provision(&spec("t1", "/work/", None));

        assert_eq!(terminals.take_pending_link("/work"), Some("t1".to_string()));
        assert_eq!(terminals.take_pending_link("/work"), None);
        assert!(terminals.is_attached("t1"));
    }

    #[test]
    fn test_oldest_pending_link_wins() {
        let (terminals, _) = terminals();
        terminals.provision(&spec("t1", "/work", None));
        terminals.provision(&spec("t2", "/work", None));
        assert_eq!(terminals.take_pending_link("/work"), Some("t1".to_string()));
        assert_eq!(terminals.take_pending_link("/work"), Some("t2".to_string()));
    }

    #[test]
    fn test_terminal_for_descendant_process() {
        let (terminals, probe) = terminals();
        terminals.provision(&spec("t1", "/work", Some(500)));
        probe.parents.lock().unwrap().extend([(900, 800), (800, 500)]);

        assert_eq!(terminals.terminal_for_process(900), Some("t1".to_string()));
        assert_eq!(terminals.terminal_for_process(500), Some("t1".to_string()));
        assert_eq!(terminals.terminal_for_process(123), None);
    }

    #[test]
    fn test_close_detaches_and_drops_pending_link() {
        let (terminals, _) = terminals();
        terminals.provision(&spec("t1", "/work", None));
        assert!(terminals.close("t1").is_some());
        assert!(!terminals.is_attached("t1"));
        assert_eq!(terminals.take_pending_link("/work"), None);
    }

    #[test]
    fn test_link_records_session() {
        let (terminals, _) = terminals();
        terminals.provision(&spec("t1", "/work", None));
        terminals.link("t1", &SessionId::new("s1"));

        let records = terminals.list();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].session_id.as_ref().map(SessionId::as_str), Some("s1"));
        assert_eq!(terminals.take_pending_link("/work"), None);
    }

    #[test]
    fn test_spec_defaults() {
        let spec: TerminalSpec = serde_json::from_str(r#"{"terminalId":"t9"}"#).unwrap();
        assert!(spec.await_link);
        assert!(spec.placeholder);
        assert!(spec.cwd.is_none());
    }
}
