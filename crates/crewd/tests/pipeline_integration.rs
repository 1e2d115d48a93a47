//! End-to-end tests of the hook pipeline through the public registry API.
//!
//! Timers run on real time with millisecond delays, so every assertion on
//! a timer effect polls until a deadline instead of sleeping a fixed time.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use crew_core::{Session, SessionId, SessionStatus, ToolTimeouts};
use crew_protocol::Delta;
use crewd::monitor::{AgentProcess, ProcessProbe};
use crewd::registry::{
    spawn_registry, RegistryConfig, RegistryError, RegistryHandle, Resolution, SubscribeStart,
};
use crewd::stats::Transport;
use crewd::terminal::{LocalTerminals, TerminalSpec};

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT_DEADLINE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Process table the tests script by hand.
#[derive(Default)]
struct ScriptedProbe {
    alive: Mutex<HashSet<u32>>,
    children: Mutex<HashSet<u32>>,
    parents: Mutex<HashMap<u32, u32>>,
}

impl ScriptedProbe {
    fn spawn(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    fn kill(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

impl ProcessProbe for ScriptedProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn has_children(&self, pid: u32) -> bool {
        self.children.lock().unwrap().contains(&pid)
    }

    fn agent_processes(&self) -> Vec<AgentProcess> {
        Vec::new()
    }

    fn parent_of(&self, pid: u32) -> Option<u32> {
        self.parents.lock().unwrap().get(&pid).copied()
    }
}

struct Pipeline {
    registry: RegistryHandle,
    terminals: LocalTerminals,
    probe: Arc<ScriptedProbe>,
}

fn fast_config() -> RegistryConfig {
    RegistryConfig {
        tool_timeouts: ToolTimeouts {
            fast: Duration::from_millis(40),
            input: Duration::from_millis(40),
            medium: Duration::from_millis(80),
            slow: Duration::from_millis(80),
        },
        removal_delay: Duration::from_millis(200),
        team_cleanup_delay: Duration::from_millis(50),
        ..RegistryConfig::default()
    }
}

fn pipeline(config: RegistryConfig) -> Pipeline {
    let probe = Arc::new(ScriptedProbe::default());
    let terminals = LocalTerminals::new(probe.clone());
    let registry = spawn_registry(config, probe.clone(), Arc::new(terminals.clone()));
    Pipeline {
        registry,
        terminals,
        probe,
    }
}

fn hook(id: &str, event: &str) -> Value {
    json!({"session_id": id, "hook_event_name": event, "cwd": "/work/app"})
}

fn hook_with(id: &str, event: &str, extra: Value) -> Value {
    let mut payload = hook(id, event);
    if let (Some(target), Some(fields)) = (payload.as_object_mut(), extra.as_object()) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
    payload
}

impl Pipeline {
    async fn send(&self, payload: Value) -> Resolution {
        self.registry
            .ingest(payload, Transport::Http)
            .await
            .expect("hook accepted")
            .resolution
    }

    async fn session(&self, id: &str) -> Session {
        self.registry
            .get_session(SessionId::new(id))
            .await
            .unwrap_or_else(|| panic!("no session {id}"))
    }

    /// Polls until the session satisfies `check` or the deadline passes.
    async fn wait_for<F>(&self, id: &str, check: F) -> Option<Session>
    where
        F: Fn(Option<&Session>) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
        loop {
            let session = self.registry.get_session(SessionId::new(id)).await;
            if check(session.as_ref()) {
                return session;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("condition on {id} not met within {WAIT_DEADLINE:?}");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

// ============================================================================
// State Machine
// ============================================================================

#[tokio::test]
async fn test_full_turn_lifecycle() {
    let p = pipeline(fast_config());

    assert_eq!(p.send(hook("s1", "SessionStart")).await, Resolution::Created);
    assert_eq!(p.session("s1").await.status, SessionStatus::Idle);

    p.send(hook_with("s1", "UserPromptSubmit", json!({"prompt": "fix the login bug"})))
        .await;
    let session = p.session("s1").await;
    assert_eq!(session.status, SessionStatus::Prompting);
    assert_eq!(session.title.as_deref(), Some("app - fix the login bug"));

    p.send(hook_with("s1", "PreToolUse", json!({"tool_name": "Task"})))
        .await;
    assert_eq!(p.session("s1").await.status, SessionStatus::Working);

    p.send(hook_with("s1", "PostToolUse", json!({"tool_name": "Task"})))
        .await;
    p.send(hook("s1", "Stop")).await;
    assert_eq!(p.session("s1").await.status, SessionStatus::Waiting);

    p.send(hook("s1", "SessionEnd")).await;
    assert_eq!(p.session("s1").await.status, SessionStatus::Ended);
}

#[tokio::test]
async fn test_vendor_event_names_are_normalized() {
    let p = pipeline(fast_config());

    p.send(hook("g1", "SessionStart")).await;
    p.send(hook("g1", "BeforeAgent")).await;
    assert_eq!(p.session("g1").await.status, SessionStatus::Prompting);

    p.send(hook_with("g1", "BeforeTool", json!({"tool_name": "web_fetch"})))
        .await;
    assert_eq!(p.session("g1").await.status, SessionStatus::Working);

    p.send(hook("g1", "AfterAgent")).await;
    assert_eq!(p.session("g1").await.status, SessionStatus::Waiting);
}

#[tokio::test]
async fn test_invalid_payloads_are_rejected_and_counted() {
    let p = pipeline(fast_config());

    let missing_id = p
        .registry
        .ingest(json!({"hook_event_name": "Stop"}), Transport::Http)
        .await;
    assert!(matches!(missing_id, Err(RegistryError::Invalid(_))));

    let unknown_event = p
        .registry
        .ingest(hook("s1", "Teleport"), Transport::FileQueue)
        .await;
    assert!(matches!(unknown_event, Err(RegistryError::Invalid(_))));

    assert!(p.registry.get_all_sessions().await.is_empty());
    let stats = p.registry.stats().await.unwrap();
    assert_eq!(stats.total_rejected, 2);
    assert_eq!(stats.total_accepted, 0);
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_stalled_fast_tool_escalates_to_approval() {
    let p = pipeline(fast_config());
    p.send(hook("s1", "SessionStart")).await;
    p.send(hook_with("s1", "PreToolUse", json!({"tool_name": "Edit"})))
        .await;

    let session = p
        .wait_for("s1", |s| {
            s.is_some_and(|s| s.status == SessionStatus::Approval)
        })
        .await
        .unwrap();
    assert_eq!(session.pending_tool.as_deref(), Some("Edit"));
    assert!(session.waiting_detail.unwrap().contains("Edit"));
}

#[tokio::test]
async fn test_failed_shell_call_stays_working() {
    let p = pipeline(fast_config());
    p.send(hook("s1", "SessionStart")).await;
    p.send(hook_with("s1", "PreToolUse", json!({"tool_name": "Bash"})))
        .await;
    p.send(hook_with(
        "s1",
        "PostToolUseFailure",
        json!({"tool_name": "Bash", "error": "exit status 1"}),
    ))
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let session = p.session("s1").await;
    assert_eq!(session.status, SessionStatus::Working);
    assert!(session.tool_log.iter().any(|entry| entry.failed));
}

#[tokio::test]
async fn test_question_tool_escalates_to_input() {
    let p = pipeline(fast_config());
    p.send(hook("s1", "SessionStart")).await;
    p.send(hook_with("s1", "PreToolUse", json!({"tool_name": "AskUserQuestion"})))
        .await;

    p.wait_for("s1", |s| s.is_some_and(|s| s.status == SessionStatus::Input))
        .await;
}

#[tokio::test]
async fn test_completed_tool_never_escalates() {
    let p = pipeline(fast_config());
    p.send(hook("s1", "SessionStart")).await;
    p.send(hook_with("s1", "PreToolUse", json!({"tool_name": "Read"})))
        .await;
    p.send(hook_with("s1", "PostToolUse", json!({"tool_name": "Read"})))
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(p.session("s1").await.status, SessionStatus::Working);
}

#[tokio::test]
async fn test_shell_with_running_children_is_not_escalated() {
    let p = pipeline(fast_config());
    p.probe.spawn(4242);
    p.probe.children.lock().unwrap().insert(4242);

    p.send(hook_with("s1", "SessionStart", json!({"pid": 4242})))
        .await;
    p.send(hook_with("s1", "PreToolUse", json!({"tool_name": "Bash", "pid": 4242})))
        .await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(p.session("s1").await.status, SessionStatus::Working);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_ended_session_is_removed_after_grace_period() {
    let p = pipeline(fast_config());
    p.send(hook("s1", "SessionStart")).await;
    p.send(hook("s1", "SessionEnd")).await;

    p.wait_for("s1", |s| s.is_none()).await;
}

#[tokio::test]
async fn test_pid_is_owned_by_latest_session() {
    let p = pipeline(fast_config());
    p.probe.spawn(100);

    p.send(hook_with("a", "SessionStart", json!({"pid": 100})))
        .await;
    p.send(hook_with("b", "SessionStart", json!({"pid": 100})))
        .await;

    assert_eq!(p.session("a").await.cached_pid, None);
    assert_eq!(p.session("b").await.cached_pid, Some(100));
}

#[tokio::test]
async fn test_liveness_sweep_ends_dead_session() {
    let p = pipeline(fast_config());
    p.probe.spawn(777);
    p.send(hook_with("s1", "SessionStart", json!({"pid": 777})))
        .await;
    p.probe.kill(777);

    p.registry.check_liveness().await;
    let session = p
        .wait_for("s1", |s| s.map_or(true, |s| s.status.is_ended()))
        .await;
    if let Some(session) = session {
        assert!(session.cached_pid.is_none());
    }
}

// ============================================================================
// Identity Resolution
// ============================================================================

#[tokio::test]
async fn test_provisioned_terminal_links_first_hook() {
    let p = pipeline(fast_config());
    p.terminals.provision(&TerminalSpec {
        terminal_id: "term-1".to_string(),
        cwd: Some("/work/app".to_string()),
        shell_pid: None,
        await_link: true,
        placeholder: true,
    });
    p.registry
        .create_placeholder("term-1".to_string(), Some("/work/app".to_string()))
        .await
        .unwrap();
    assert_eq!(p.session("term-1").await.status, SessionStatus::Connecting);

    let mut sub = p.registry.subscribe(None).await.unwrap();
    assert_eq!(p.send(hook("real-1", "SessionStart")).await, Resolution::CwdLink);

    assert!(p.registry.get_session(SessionId::new("term-1")).await.is_none());
    let session = p.session("real-1").await;
    assert!(session.terminal_backed);
    assert_eq!(session.last_terminal_id.as_deref(), Some("term-1"));

    let entry = sub.receiver.recv().await.unwrap();
    match entry.delta {
        Delta::Session { session } => {
            assert_eq!(session.replaces_id, Some(SessionId::new("term-1")));
        }
        other => panic!("expected session delta, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resume_in_same_terminal_reuses_record() {
    let p = pipeline(fast_config());
    p.terminals.provision(&TerminalSpec {
        terminal_id: "term-2".to_string(),
        cwd: Some("/work/app".to_string()),
        shell_pid: None,
        await_link: true,
        placeholder: false,
    });
    p.send(hook("old", "SessionStart")).await;
    p.send(hook_with("old", "UserPromptSubmit", json!({"prompt": "first task"})))
        .await;
    p.send(hook("old", "SessionEnd")).await;

    let pending = p
        .registry
        .request_resume(SessionId::new("old"), "term-2".to_string())
        .await
        .unwrap();
    assert_eq!(pending.status, SessionStatus::Connecting);

    let resolution = p
        .send(hook_with("new", "SessionStart", json!({"terminal_id": "term-2"})))
        .await;
    assert_eq!(resolution, Resolution::Resumed);

    assert!(p.registry.get_session(SessionId::new("old")).await.is_none());
    let session = p.session("new").await;
    assert_eq!(session.status, SessionStatus::Idle);
    assert_eq!(session.prompt_history.len(), 1);
}

#[tokio::test]
async fn test_resume_requires_ended_session() {
    let p = pipeline(fast_config());
    p.send(hook("live", "SessionStart")).await;

    let err = p
        .registry
        .request_resume(SessionId::new("live"), "term-3".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotResumable { .. }));
}

// ============================================================================
// Teams
// ============================================================================

#[tokio::test]
async fn test_subagent_forms_team_with_parent() {
    let p = pipeline(fast_config());
    p.send(hook("lead", "SessionStart")).await;
    p.send(hook_with("lead", "PreToolUse", json!({"tool_name": "Task"})))
        .await;
    p.send(hook_with(
        "lead",
        "SubagentStart",
        json!({"agent_type": "reviewer"}),
    ))
    .await;
    p.send(hook("worker", "SessionStart")).await;

    let teams = p.registry.get_teams().await;
    assert_eq!(teams.len(), 1);
    let worker = p.session("worker").await;
    assert_eq!(worker.team_id.as_deref(), Some(teams[0].team_id.as_str()));
}

// ============================================================================
// Fan-out
// ============================================================================

#[tokio::test]
async fn test_late_subscriber_catches_up_by_replay() {
    let p = pipeline(fast_config());
    p.send(hook("s1", "SessionStart")).await;
    let seen = p.registry.stats().await.unwrap().replay_seq;

    p.send(hook("s1", "UserPromptSubmit")).await;
    p.send(hook("s1", "Stop")).await;

    let sub = p.registry.subscribe(Some(seen)).await.unwrap();
    match sub.start {
        SubscribeStart::Replay(entries) => {
            let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
            assert_eq!(seqs, vec![seen + 1, seen + 2]);
        }
        SubscribeStart::Snapshot { .. } => panic!("expected replay"),
    }
}

#[tokio::test]
async fn test_fresh_subscriber_gets_snapshot() {
    let p = pipeline(fast_config());
    p.send(hook("s1", "SessionStart")).await;

    let sub = p.registry.subscribe(None).await.unwrap();
    match sub.start {
        SubscribeStart::Snapshot { sessions, seq, .. } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(seq, 1);
        }
        SubscribeStart::Replay(_) => panic!("expected snapshot"),
    }
}
