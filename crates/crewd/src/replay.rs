//! Sequenced log of recently emitted deltas.
//!
//! Every delta gets the next global sequence number and is kept in a ring of
//! [`REPLAY_CAPACITY`] entries. A reconnecting consumer hands back the last
//! sequence number it saw and receives everything newer, or learns that the
//! gap is too old to close and must take a snapshot instead.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use crew_protocol::{Delta, ReplayEntry};

pub const REPLAY_CAPACITY: usize = 500;

#[derive(Debug)]
pub struct ReplayBuffer {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
    /// Sequence number of the most recent entry; 0 before the first push.
    last_seq: u64,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::with_capacity(REPLAY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(REPLAY_CAPACITY)),
            capacity: capacity.max(1),
            last_seq: 0,
        }
    }

    /// Appends a delta and returns the sequenced entry.
    pub fn push(&mut self, delta: Delta, now: DateTime<Utc>) -> ReplayEntry {
        self.last_seq += 1;
        let entry = ReplayEntry {
            seq: self.last_seq,
            delta,
            timestamp: now,
        };
        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        entry
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with `seq > after`, oldest first.
    ///
    /// Returns `None` when entries the caller has not seen were already
    /// evicted, or when `after` is ahead of anything issued (a consumer
    /// from a previous daemon run).
    pub fn since(&self, after: u64) -> Option<Vec<ReplayEntry>> {
        if after > self.last_seq {
            return None;
        }
        if after == self.last_seq {
            return Some(Vec::new());
        }

        let oldest = self.entries.front().map(|e| e.seq)?;
        if after + 1 < oldest {
            return None;
        }

        Some(
            self.entries
                .iter()
                .filter(|e| e.seq > after)
                .cloned()
                .collect(),
        )
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_core::SessionId;

    fn removed(id: &str) -> Delta {
        Delta::SessionRemoved {
            session_id: SessionId::new(id),
        }
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let mut buffer = ReplayBuffer::new();
        let a = buffer.push(removed("a"), Utc::now());
        let b = buffer.push(removed("b"), Utc::now());
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(buffer.last_seq(), 2);
    }

    #[test]
    fn test_since_returns_newer_entries() {
        let mut buffer = ReplayBuffer::new();
        for i in 0..5 {
            buffer.push(removed(&format!("s{i}")), Utc::now());
        }
        let replay = buffer.since(3).unwrap();
        let seqs: Vec<u64> = replay.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(buffer.since(5).unwrap().len(), 0);
        assert_eq!(buffer.since(0).unwrap().len(), 5);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = ReplayBuffer::new();
        for i in 0..(REPLAY_CAPACITY + 20) {
            buffer.push(removed(&format!("s{i}")), Utc::now());
        }
        assert_eq!(buffer.len(), REPLAY_CAPACITY);
        assert_eq!(buffer.last_seq(), (REPLAY_CAPACITY + 20) as u64);
    }

    #[test]
    fn test_gap_beyond_buffer_needs_snapshot() {
        let mut buffer = ReplayBuffer::with_capacity(3);
        for i in 0..6 {
            buffer.push(removed(&format!("s{i}")), Utc::now());
        }
        // Buffer holds 4..=6.
        assert!(buffer.since(1).is_none());
        assert_eq!(buffer.since(3).unwrap().len(), 3);
    }

    #[test]
    fn test_future_seq_needs_snapshot() {
        let mut buffer = ReplayBuffer::new();
        buffer.push(removed("a"), Utc::now());
        assert!(buffer.since(40).is_none());
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = ReplayBuffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.since(0), Some(Vec::new()));
    }
}
