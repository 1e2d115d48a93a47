//! One-shot timers owned by the registry actor.
//!
//! A timer is a spawned task that sleeps and then sends a command back to
//! the actor. It only holds a weak sender, so pending timers never keep a
//! stopped registry alive. Each armed timer carries a generation number;
//! the actor ignores a fire whose generation is no longer current, which
//! covers the race between a fire already in the channel and a cancel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::WeakSender;
use tokio::task::{spawn_blocking, AbortHandle};
use tokio::time::sleep;
use tracing::trace;

use crew_core::SessionId;

use super::commands::RegistryCommand;
use crate::monitor::ProcessProbe;

#[derive(Debug)]
struct Armed {
    generation: u64,
    handle: AbortHandle,
}

/// Per-session tool and removal timers plus per-team cleanup timers.
#[derive(Debug, Default)]
pub struct TimerSet {
    tool: HashMap<SessionId, Armed>,
    removal: HashMap<SessionId, Armed>,
    team_cleanup: HashMap<String, Armed>,
    next_generation: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    // ========================================================================
    // Tool Timers
    // ========================================================================

    /// Arms the approval/input timer for `tool`, replacing any previous one.
    ///
    /// With `child_check`, the probe is consulted when the timer fires and
    /// the result travels with the command.
    pub fn arm_tool(
        &mut self,
        sender: &WeakSender<RegistryCommand>,
        session_id: &SessionId,
        tool: &str,
        delay: Duration,
        child_check: Option<(u32, Arc<dyn ProcessProbe>)>,
    ) -> u64 {
        self.cancel_tool(session_id);
        let generation = self.next_generation();
        let sender = sender.clone();
        let id = session_id.clone();
        let tool = tool.to_string();

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let children_running = match child_check {
                Some((pid, probe)) => spawn_blocking(move || probe.has_children(pid))
                    .await
                    .unwrap_or(false),
                None => false,
            };
            if let Some(tx) = sender.upgrade() {
                let _ = tx
                    .send(RegistryCommand::ToolTimeout {
                        session_id: id,
                        tool,
                        generation,
                        children_running,
                    })
                    .await;
            }
        })
        .abort_handle();

        self.tool.insert(
            session_id.clone(),
            Armed {
                generation,
                handle,
            },
        );
        generation
    }

    /// Returns true if a timer was actually pending.
    pub fn cancel_tool(&mut self, session_id: &SessionId) -> bool {
        cancel(&mut self.tool, session_id)
    }

    /// Consumes the tool timer if `generation` is still the armed one.
    pub fn take_tool(&mut self, session_id: &SessionId, generation: u64) -> bool {
        take(&mut self.tool, session_id, generation)
    }

    pub fn has_tool(&self, session_id: &SessionId) -> bool {
        self.tool.contains_key(session_id)
    }

    // ========================================================================
    // Removal Timers
    // ========================================================================

    pub fn arm_removal(
        &mut self,
        sender: &WeakSender<RegistryCommand>,
        session_id: &SessionId,
        delay: Duration,
    ) -> u64 {
        cancel(&mut self.removal, session_id);
        let generation = self.next_generation();
        let id = session_id.clone();
        let handle = fire_after(sender, delay, move || RegistryCommand::RemoveEnded {
            session_id: id,
            generation,
        });
        self.removal.insert(
            session_id.clone(),
            Armed {
                generation,
                handle,
            },
        );
        generation
    }

    pub fn cancel_removal(&mut self, session_id: &SessionId) -> bool {
        cancel(&mut self.removal, session_id)
    }

    pub fn take_removal(&mut self, session_id: &SessionId, generation: u64) -> bool {
        take(&mut self.removal, session_id, generation)
    }

    // ========================================================================
    // Team Cleanup Timers
    // ========================================================================

    /// Arms the cleanup timer unless one is already pending; returns the
    /// generation of whichever timer is armed afterwards.
    pub fn arm_team_cleanup(
        &mut self,
        sender: &WeakSender<RegistryCommand>,
        team_id: &str,
        delay: Duration,
    ) -> u64 {
        if let Some(armed) = self.team_cleanup.get(team_id) {
            return armed.generation;
        }
        let generation = self.next_generation();
        let id = team_id.to_string();
        let handle = fire_after(sender, delay, move || RegistryCommand::TeamCleanup {
            team_id: id,
            generation,
        });
        self.team_cleanup.insert(
            team_id.to_string(),
            Armed {
                generation,
                handle,
            },
        );
        generation
    }

    pub fn cancel_team_cleanup(&mut self, team_id: &str) -> bool {
        cancel(&mut self.team_cleanup, team_id)
    }

    pub fn take_team_cleanup(&mut self, team_id: &str, generation: u64) -> bool {
        take(&mut self.team_cleanup, team_id, generation)
    }

    /// Cancels every per-session timer of `session_id`.
    pub fn cancel_session(&mut self, session_id: &SessionId) {
        self.cancel_tool(session_id);
        self.cancel_removal(session_id);
    }

    pub fn pending(&self) -> usize {
        self.tool.len() + self.removal.len() + self.team_cleanup.len()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for armed in self
            .tool
            .values()
            .chain(self.removal.values())
            .chain(self.team_cleanup.values())
        {
            armed.handle.abort();
        }
    }
}

fn fire_after<F>(sender: &WeakSender<RegistryCommand>, delay: Duration, make: F) -> AbortHandle
where
    F: FnOnce() -> RegistryCommand + Send + 'static,
{
    let sender = sender.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        if let Some(tx) = sender.upgrade() {
            let _ = tx.send(make()).await;
        }
    })
    .abort_handle()
}

fn cancel<K, Q>(map: &mut HashMap<K, Armed>, key: &Q) -> bool
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    match map.remove(key) {
        Some(armed) => {
            armed.handle.abort();
            true
        }
        None => false,
    }
}

fn take<K, Q>(map: &mut HashMap<K, Armed>, key: &Q, generation: u64) -> bool
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if map.get(key).is_some_and(|armed| armed.generation == generation) {
        map.remove(key);
        true
    } else {
        trace!(generation, "Ignoring stale timer fire");
        false
    }
}
