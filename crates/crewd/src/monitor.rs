//! OS process probing for the liveness monitor and PID lookup.
//!
//! The registry only talks to [`ProcessProbe`]; [`SystemProbe`] is the real
//! implementation. Everything here is blocking and cheap except the process
//! scans, which callers run via `spawn_blocking`.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A probe that cannot read process state answers "not alive" / "none";
//!   failing to observe a process is treated as evidence that it is gone

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use sysinfo::{Pid, System};
use tracing::{debug, trace};

use crew_core::normalize_path;

/// Executable names of the agent CLIs whose hooks we ingest.
pub const AGENT_BINARIES: [&str; 3] = ["claude", "gemini", "codex"];

/// Upper bound on parent-chain walks.
pub const MAX_PARENT_DEPTH: u32 = 20;

/// A running agent CLI process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProcess {
    pub pid: u32,
    pub cwd: Option<String>,
    /// Whether stdin is a terminal device.
    pub attached_tty: bool,
}

/// Read-only view of the process table.
pub trait ProcessProbe: Send + Sync {
    /// Non-destructive liveness check (signal 0 semantics).
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether `pid` currently has any child process.
    fn has_children(&self, pid: u32) -> bool;

    /// All running agent CLI processes.
    fn agent_processes(&self) -> Vec<AgentProcess>;

    fn parent_of(&self, pid: u32) -> Option<u32>;
}

// ============================================================================
// System Probe
// ============================================================================

/// Probe backed by `kill(2)`, `/proc` and `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs permission and existence checks only.
        let rc = unsafe { libc::kill(raw, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn has_children(&self, pid: u32) -> bool {
        let system = System::new_all();
        let parent = Pid::from_u32(pid);
        let found = system
            .processes()
            .values()
            .any(|process| process.parent() == Some(parent));
        trace!(pid, found, "Checked for child processes");
        found
    }

    fn agent_processes(&self) -> Vec<AgentProcess> {
        let system = System::new_all();
        let processes: Vec<AgentProcess> = system
            .processes()
            .iter()
            .filter(|(_, process)| {
                process.exe().is_some_and(is_agent_binary)
                    || is_agent_binary(Path::new(process.name()))
                    || process
                        .cmd()
                        .iter()
                        .take(2)
                        .any(|arg| is_agent_binary(Path::new(arg)))
            })
            .map(|(pid, process)| AgentProcess {
                pid: pid.as_u32(),
                cwd: process
                    .cwd()
                    .map(|cwd| cwd.to_string_lossy().into_owned()),
                attached_tty: stdin_is_tty(pid.as_u32()),
            })
            .collect();
        debug!(count = processes.len(), "Scanned for agent processes");
        processes
    }

    fn parent_of(&self, pid: u32) -> Option<u32> {
        read_parent_pid(pid)
    }
}

/// Matches `claude`, `/usr/bin/gemini`, `~/.local/share/claude/versions/1.2.3`.
fn is_agent_binary(path: &Path) -> bool {
    let as_text = path.to_string_lossy();
    if as_text.contains("claude/versions/") {
        return true;
    }
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| AGENT_BINARIES.contains(&name))
}

/// Reads the parent PID from `/proc/<pid>/stat` (field 4).
fn read_parent_pid(pid: u32) -> Option<u32> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let close_paren = stat.rfind(')')?;
    let rest = stat.get(close_paren + 1..)?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

fn stdin_is_tty(pid: u32) -> bool {
    fs::read_link(format!("/proc/{pid}/fd/0"))
        .map(|target| {
            let target = target.to_string_lossy();
            target.starts_with("/dev/pts/") || target.starts_with("/dev/tty")
        })
        .unwrap_or(false)
}

// ============================================================================
// PID Lookup
// ============================================================================

/// Walks up from `pid` until `matches` accepts an ancestor (or `pid` itself).
pub fn find_ancestor<F>(probe: &dyn ProcessProbe, pid: u32, mut matches: F) -> Option<u32>
where
    F: FnMut(u32) -> bool,
{
    let mut current = pid;
    for _ in 0..MAX_PARENT_DEPTH {
        if matches(current) {
            return Some(current);
        }
        match probe.parent_of(current) {
            Some(parent) if parent > 1 => current = parent,
            _ => break,
        }
    }
    None
}

/// Picks the agent process most likely to back a session.
///
/// Exact working-directory match wins (a terminal-attached one among several);
/// without one, a single unclaimed terminal-attached process is accepted.
/// PIDs in `claimed` belong to other sessions and are never returned.
pub fn select_agent_pid(
    candidates: &[AgentProcess],
    cwd: Option<&str>,
    claimed: &HashSet<u32>,
) -> Option<u32> {
    let free: Vec<&AgentProcess> = candidates
        .iter()
        .filter(|c| !claimed.contains(&c.pid))
        .collect();

    if let Some(cwd) = cwd.map(normalize_path) {
        let same_dir: Vec<&AgentProcess> = free
            .iter()
            .copied()
            .filter(|c| c.cwd.as_deref().map(normalize_path).as_deref() == Some(cwd.as_str()))
            .collect();
        if let Some(best) = same_dir
            .iter()
            .find(|c| c.attached_tty)
            .or_else(|| same_dir.first())
        {
            return Some(best.pid);
        }
    }

    let mut attached = free.iter().filter(|c| c.attached_tty);
    match (attached.next(), attached.next()) {
        (Some(only), None) => Some(only.pid),
        _ => None,
    }
}

/// Resolves a session's PID: a still-live cached one, else a process scan.
pub fn lookup_pid(
    probe: &dyn ProcessProbe,
    cached: Option<u32>,
    cwd: Option<&str>,
    claimed: &HashSet<u32>,
) -> Option<u32> {
    if let Some(pid) = cached {
        if probe.is_alive(pid) {
            return Some(pid);
        }
        debug!(pid, "Cached PID is gone, scanning for agent processes");
    }
    select_agent_pid(&probe.agent_processes(), cwd, claimed)
}
