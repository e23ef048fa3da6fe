//! Bounded, sequence-numbered message log owned by one harness instance.
//!
//! Every entry gets a monotonically increasing `seq` that survives eviction.
//! A mark is a sequence boundary: entries with `seq < mark` are stale for
//! the purpose of waiting, no matter how close in time they were recorded.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::protocol::{Direction, MessageType};

/// One recorded message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub direction: Direction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
    /// Monotonic receive time; only meaningful inside the live process.
    #[serde(skip)]
    pub received: Option<Instant>,
}

#[derive(Debug)]
pub struct BridgeLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
    mark: u64,
    evicted: u64,
}

impl BridgeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_seq: 0,
            mark: 0,
            evicted: 0,
        }
    }

    /// Append a message and return its sequence number.
    pub fn record(
        &mut self,
        kind: MessageType,
        direction: Direction,
        payload: Option<serde_json::Value>,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(LogEntry {
            seq,
            kind,
            direction,
            payload,
            at: Utc::now(),
            received: Some(Instant::now()),
        });
        seq
    }

    /// Move the mark to the current end of the log and return it.
    pub fn mark(&mut self) -> u64 {
        self.mark = self.next_seq;
        self.mark
    }

    pub fn current_mark(&self) -> u64 {
        self.mark
    }

    /// First inbound entry of `kind` at or after the mark that was received
    /// no later than `deadline`.
    pub fn find_after_mark(&self, kind: MessageType, deadline: Instant) -> Option<&LogEntry> {
        self.entries.iter().find(|e| {
            e.seq >= self.mark
                && e.kind == kind
                && e.direction == Direction::Inbound
                && e.received.map_or(true, |r| r <= deadline)
        })
    }

    /// Drop all entries and reset the mark. Sequence numbers keep counting
    /// so nothing recorded before the clear can ever satisfy a later wait.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.mark = self.next_seq;
        self.evicted = 0;
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_future() -> Instant {
        Instant::now() + std::time::Duration::from_secs(3600)
    }

    #[test]
    fn test_sequence_survives_eviction() {
        let mut log = BridgeLog::new(2);
        for _ in 0..5 {
            log.record(MessageType::State, Direction::Inbound, None);
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.evicted(), 3);
        let seqs: Vec<u64> = log.entries().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn test_stale_entries_before_mark_are_ignored() {
        let mut log = BridgeLog::new(16);
        log.record(MessageType::Ready, Direction::Inbound, None);
        log.mark();
        assert!(log.find_after_mark(MessageType::Ready, far_future()).is_none());

        let seq = log.record(MessageType::Ready, Direction::Inbound, None);
        assert_eq!(log.find_after_mark(MessageType::Ready, far_future()).unwrap().seq, seq);
    }

    #[test]
    fn test_outbound_entries_never_match() {
        let mut log = BridgeLog::new(16);
        log.record(MessageType::Init, Direction::Outbound, None);
        assert!(log.find_after_mark(MessageType::Init, far_future()).is_none());
    }

    #[test]
    fn test_clear_keeps_counting() {
        let mut log = BridgeLog::new(16);
        log.record(MessageType::Ready, Direction::Inbound, None);
        log.clear();
        assert!(log.is_empty());
        let seq = log.record(MessageType::Ready, Direction::Inbound, None);
        assert_eq!(seq, 1);
        assert_eq!(log.current_mark(), 1);
    }
}
