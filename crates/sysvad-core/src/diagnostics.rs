//! Miniport diagnostic event history
//!
//! Keeps a bounded history of stream events (state changes, completed
//! buffers, glitches) with running totals. The history is pre-allocated so
//! recording from the timer path never allocates.

use crate::wavert::KsState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Kind of diagnostic event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MiniportEventKind {
    /// Stream moved to a new KS state
    PinState(KsState),
    /// A notification interval completed
    BufferComplete,
    /// Client did not advance the write position in time
    GlitchReport { underrun: bool },
    /// Packets completed without the client reading them
    DroppedPackets(u32),
    /// The end-of-stream position was reached
    LastBufferRendered,
}

/// A single recorded event
#[derive(Debug, Clone, Serialize)]
pub struct MiniportEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: MiniportEventKind,
    /// Linear buffer position at the time of the event (bytes)
    pub linear_position: u64,
    /// Write offset within the buffer at the time of the event (bytes)
    pub write_position: u64,
}

/// Running totals over the stream's lifetime
#[derive(Debug, Default, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub state_changes: u64,
    pub buffers_completed: u64,
    pub underruns: u64,
    pub dropped_packets: u64,
    pub last_buffer_rendered: bool,
    /// Events evicted from the bounded history
    pub events_evicted: u64,
}

/// Bounded history of miniport events
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<MiniportEvent>,
    max_size: usize,
    totals: DiagnosticsSnapshot,
}

impl EventLog {
    /// Create a log keeping at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        let max_size = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(max_size),
            max_size,
            totals: DiagnosticsSnapshot::default(),
        }
    }

    /// Record an event
    ///
    /// # Arguments
    /// * `kind` - What happened
    /// * `linear_position` - Linear byte position when it happened
    /// * `write_position` - Write offset when it happened
    pub fn record(&mut self, kind: MiniportEventKind, linear_position: u64, write_position: u64) {
        match kind {
            MiniportEventKind::PinState(_) => self.totals.state_changes += 1,
            MiniportEventKind::BufferComplete => self.totals.buffers_completed += 1,
            MiniportEventKind::GlitchReport { underrun } => {
                if underrun {
                    self.totals.underruns += 1;
                }
            }
            MiniportEventKind::DroppedPackets(n) => self.totals.dropped_packets += n as u64,
            MiniportEventKind::LastBufferRendered => self.totals.last_buffer_rendered = true,
        }

        if self.events.len() >= self.max_size {
            self.events.pop_front();
            self.totals.events_evicted += 1;
        }
        self.events.push_back(MiniportEvent {
            timestamp: Utc::now(),
            kind,
            linear_position,
            write_position,
        });
    }

    /// Recorded events, oldest first
    pub fn events(&self) -> impl Iterator<Item = &MiniportEvent> {
        self.events.iter()
    }

    /// Number of events currently held
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Count held events matching a predicate
    pub fn count_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&MiniportEventKind) -> bool,
    {
        self.events.iter().filter(|e| pred(&e.kind)).count()
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.totals.clone()
    }

    /// Clear history and totals
    pub fn clear(&mut self) {
        self.events.clear();
        self.totals = DiagnosticsSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_updates_totals() {
        let mut log = EventLog::new(16);
        log.record(MiniportEventKind::PinState(KsState::Run), 0, 0);
        log.record(MiniportEventKind::BufferComplete, 1024, 1024);
        log.record(MiniportEventKind::GlitchReport { underrun: true }, 2048, 1024);
        log.record(MiniportEventKind::DroppedPackets(3), 4096, 0);

        let snap = log.snapshot();
        assert_eq!(snap.state_changes, 1);
        assert_eq!(snap.buffers_completed, 1);
        assert_eq!(snap.underruns, 1);
        assert_eq!(snap.dropped_packets, 3);
        assert!(!snap.last_buffer_rendered);
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_bounded_history() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            log.record(MiniportEventKind::BufferComplete, i, i);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.snapshot().events_evicted, 2);
        assert_eq!(log.snapshot().buffers_completed, 5);
        let first = log.events().next().unwrap();
        assert_eq!(first.linear_position, 2, "oldest entries should be evicted first");
    }

    #[test]
    fn test_count_where_and_clear() {
        let mut log = EventLog::new(8);
        log.record(MiniportEventKind::BufferComplete, 0, 0);
        log.record(MiniportEventKind::LastBufferRendered, 10, 10);
        assert_eq!(
            log.count_where(|k| matches!(k, MiniportEventKind::LastBufferRendered)),
            1
        );
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.snapshot().buffers_completed, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut log = EventLog::new(2);
        log.record(MiniportEventKind::BufferComplete, 0, 0);
        let json = serde_json::to_string(&log.snapshot()).unwrap();
        assert!(json.contains("\"buffers_completed\":1"));
    }
}
