//! Hook throughput and delivery-latency counters.
//!
//! Owned by the registry actor, so no locking. Latency is the gap between a
//! producer's `hook_sent_at` and the moment the daemon received the payload;
//! payloads without `hook_sent_at` count toward throughput only.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crew_core::HookEventKind;

/// Latency samples kept per event kind.
pub const LATENCY_WINDOW: usize = 1_000;

/// Window over which the event rate is computed.
pub const RATE_WINDOW_SECS: i64 = 60;

/// How a payload reached the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Http,
    FileQueue,
    Socket,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::FileQueue => "file_queue",
            Self::Socket => "socket",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct EventCounter {
    count: u64,
    recent: VecDeque<DateTime<Utc>>,
    latencies_ms: VecDeque<u64>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TransportStats {
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub count: u64,
    /// Events in the last minute.
    pub per_minute: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p50_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p95_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p99_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_accepted: u64,
    pub total_rejected: u64,
    pub events: BTreeMap<&'static str, EventStats>,
    pub transports: BTreeMap<Transport, TransportStats>,
    pub live_sessions: usize,
    pub teams: usize,
    pub replay_seq: u64,
}

#[derive(Debug, Default)]
pub struct HookStats {
    events: BTreeMap<HookEventKind, EventCounter>,
    transports: BTreeMap<Transport, TransportStats>,
}

impl HookStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted payload.
    pub fn record(
        &mut self,
        kind: HookEventKind,
        transport: Transport,
        sent_at_ms: Option<i64>,
        received: DateTime<Utc>,
    ) {
        self.transports.entry(transport).or_default().accepted += 1;

        let counter = self.events.entry(kind).or_default();
        counter.count += 1;
        counter.recent.push_back(received);
        prune_before(&mut counter.recent, received - Duration::seconds(RATE_WINDOW_SECS));

        if let Some(sent) = sent_at_ms {
            // Clock skew between producer and daemon can make this negative.
            let latency = received.timestamp_millis().saturating_sub(sent).max(0) as u64;
            counter.latencies_ms.push_back(latency);
            while counter.latencies_ms.len() > LATENCY_WINDOW {
                counter.latencies_ms.pop_front();
            }
        }
    }

    pub fn record_rejected(&mut self, transport: Transport) {
        self.transports.entry(transport).or_default().rejected += 1;
    }

    pub fn total_accepted(&self) -> u64 {
        self.transports.values().map(|t| t.accepted).sum()
    }

    pub fn total_rejected(&self) -> u64 {
        self.transports.values().map(|t| t.rejected).sum()
    }

    pub fn count(&self, kind: HookEventKind) -> u64 {
        self.events.get(&kind).map_or(0, |c| c.count)
    }

    pub fn transport(&self, transport: Transport) -> TransportStats {
        self.transports.get(&transport).copied().unwrap_or_default()
    }

    /// Builds a read-only view; registry-wide figures are filled by the caller.
    pub fn snapshot(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        let events = self
            .events
            .iter()
            .map(|(kind, counter)| {
                let mut sorted: Vec<u64> = counter.latencies_ms.iter().copied().collect();
                sorted.sort_unstable();
                let stats = EventStats {
                    count: counter.count,
                    per_minute: counter.recent.iter().filter(|t| **t >= cutoff).count(),
                    p50_ms: percentile(&sorted, 50),
                    p95_ms: percentile(&sorted, 95),
                    p99_ms: percentile(&sorted, 99),
                };
                (kind.as_str(), stats)
            })
            .collect();

        StatsSnapshot {
            total_accepted: self.total_accepted(),
            total_rejected: self.total_rejected(),
            events,
            transports: self.transports.clone(),
            live_sessions: 0,
            teams: 0,
            replay_seq: 0,
        }
    }
}

fn prune_before(times: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while times.front().is_some_and(|t| *t < cutoff) {
        times.pop_front();
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[u64], pct: usize) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted.get(rank - 1).copied()
}
