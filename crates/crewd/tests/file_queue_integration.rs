//! Integration tests for the NDJSON file-queue transport.
//!
//! A short poll interval keeps these independent of whether file
//! notifications are delivered in the test environment.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crew_core::{SessionId, SessionStatus};
use crewd::config::QueueConfig;
use crewd::monitor::{AgentProcess, ProcessProbe};
use crewd::queue::{QueueCounters, QueueReader, QueueWatcher};
use crewd::registry::{spawn_registry, RegistryConfig, RegistryHandle};
use crewd::stats::Transport;
use crewd::terminal::LocalTerminals;

// ============================================================================
// Test Helpers
// ============================================================================

/// A process table with nothing in it, so background PID lookups never
/// publish extra deltas.
struct NoProcesses;

impl ProcessProbe for NoProcesses {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn has_children(&self, _pid: u32) -> bool {
        false
    }

    fn agent_processes(&self) -> Vec<AgentProcess> {
        Vec::new()
    }

    fn parent_of(&self, _pid: u32) -> Option<u32> {
        None
    }
}

const WAIT_DEADLINE: Duration = Duration::from_secs(3);

fn queue_config() -> QueueConfig {
    QueueConfig {
        poll_ms: 20,
        debounce_ms: 5,
        health_secs: 1,
        truncate_bytes: 1_048_576,
    }
}

struct QueueHarness {
    _dir: TempDir,
    path: PathBuf,
    registry: RegistryHandle,
    counters: Arc<QueueCounters>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

fn line(id: &str, event: &str) -> String {
    format!("{{\"session_id\":\"{id}\",\"hook_event_name\":\"{event}\",\"cwd\":\"/work/queue\"}}\n")
}

/// Starts a registry and a watcher on a queue file seeded with `existing`.
fn start(existing: &str, config: QueueConfig) -> QueueHarness {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("hooks.ndjson");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, existing).unwrap();

    let probe = Arc::new(NoProcesses);
    let terminals = LocalTerminals::new(probe.clone());
    let registry = spawn_registry(RegistryConfig::default(), probe, Arc::new(terminals));

    let reader = QueueReader::open(&path, None, config.truncate_bytes).unwrap();
    let cancel = CancellationToken::new();
    let watcher = QueueWatcher::new(reader, config, registry.clone(), cancel.clone());
    let counters = watcher.counters();
    let task = tokio::spawn(watcher.run());

    QueueHarness {
        _dir: dir,
        path,
        registry,
        counters,
        cancel,
        task,
    }
}

impl QueueHarness {
    async fn wait_for_status(&self, id: &str, status: SessionStatus) {
        let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
        loop {
            let current = self
                .registry
                .get_session(SessionId::new(id))
                .await
                .map(|s| s.status);
            if current == Some(status) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{id} never reached {status}, last seen {current:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_processed(&self, lines: u64) {
        let deadline = tokio::time::Instant::now() + WAIT_DEADLINE;
        while self.counters.snapshot().lines_processed < lines {
            assert!(
                tokio::time::Instant::now() < deadline,
                "only {} lines processed",
                self.counters.snapshot().lines_processed
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("watcher stops on cancel")
            .expect("watcher task did not panic");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_appended_records_reach_registry() {
    let q = start("", queue_config());

    append(&q.path, &line("q1", "SessionStart"));
    append(&q.path, &line("q1", "UserPromptSubmit"));

    q.wait_for_status("q1", SessionStatus::Prompting).await;

    let stats = q.registry.stats().await.unwrap();
    let queue_transport = stats.transports.get(&Transport::FileQueue).unwrap();
    assert_eq!(queue_transport.accepted, 2);
    q.stop().await;
}

#[tokio::test]
async fn test_existing_backlog_is_not_replayed() {
    let q = start(&line("old", "SessionStart"), queue_config());

    append(&q.path, &line("new", "SessionStart"));
    q.wait_for_status("new", SessionStatus::Idle).await;

    assert!(q.registry.get_session(SessionId::new("old")).await.is_none());
    q.stop().await;
}

#[tokio::test]
async fn test_record_split_across_writes_is_reassembled() {
    let q = start("", queue_config());
    let full = line("split", "SessionStart");
    let (head, tail) = full.split_at(20);

    append(&q.path, head);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(q.counters.snapshot().partial_held);
    assert!(q.registry.get_session(SessionId::new("split")).await.is_none());

    append(&q.path, tail);
    q.wait_for_status("split", SessionStatus::Idle).await;
    assert!(!q.counters.snapshot().partial_held);
    q.stop().await;
}

#[tokio::test]
async fn test_garbage_lines_are_skipped() {
    let q = start("", queue_config());

    append(&q.path, "not json at all\n");
    append(&q.path, &line("ok", "SessionStart"));

    q.wait_for_status("ok", SessionStatus::Idle).await;
    let snapshot = q.counters.snapshot();
    assert_eq!(snapshot.lines_errored, 1);
    assert_eq!(snapshot.lines_processed, 1);
    q.stop().await;
}

#[tokio::test]
async fn test_queue_self_truncates_past_threshold() {
    let config = QueueConfig {
        truncate_bytes: 256,
        ..queue_config()
    };
    let q = start("", config);

    let mut batch = String::new();
    for i in 0..5 {
        batch.push_str(&line(&format!("t{i}"), "SessionStart"));
    }
    append(&q.path, &batch);
    q.wait_for_processed(5).await;

    let snapshot = q.counters.snapshot();
    assert_eq!(snapshot.truncations, 1);
    assert_eq!(snapshot.offset, 0);
    assert_eq!(fs::metadata(&q.path).unwrap().len(), 0);

    append(&q.path, &line("after", "SessionStart"));
    q.wait_for_status("after", SessionStatus::Idle).await;
    q.stop().await;
}
