//! Bounded history of received delta batches
//!
//! After a resync the client loads an authoritative snapshot tagged with a
//! tick sequence. Batches that arrived before the resync finished but
//! describe later ticks must still be applied, in order, or structural
//! changes are lost. The buffer keeps recent batches for exactly that replay.

use shared::{DeltaBatch, DeltaEvent};
use std::collections::VecDeque;

pub const DEFAULT_MAX_BATCHES: usize = 256;
pub const DEFAULT_MAX_AGE_MS: f64 = 10_000.0;

/// A batch and the local time it arrived
#[derive(Debug, Clone)]
pub struct BufferedBatch {
    pub batch: DeltaBatch,
    pub received_at_ms: f64,
}

/// Arrival-ordered ring of batches, capped by count and by age
#[derive(Debug)]
pub struct DeltaBuffer {
    entries: VecDeque<BufferedBatch>,
    max_batches: usize,
    max_age_ms: f64,
}

impl Default for DeltaBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCHES, DEFAULT_MAX_AGE_MS)
    }
}

impl DeltaBuffer {
    pub fn new(max_batches: usize, max_age_ms: f64) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_batches.min(1024)),
            max_batches: max_batches.max(1),
            max_age_ms,
        }
    }

    /// Appends a batch, then evicts from the front while over the count cap
    /// or while the oldest entry is past the age cap.
    pub fn push(&mut self, batch: DeltaBatch, now_ms: f64) {
        self.entries.push_back(BufferedBatch {
            batch,
            received_at_ms: now_ms,
        });

        while let Some(oldest) = self.entries.front() {
            let over_count = self.entries.len() > self.max_batches;
            let over_age = now_ms - oldest.received_at_ms > self.max_age_ms;
            if !(over_count || over_age) {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// Buffered batches whose tick sequence is greater than `tick_seq`, in
    /// arrival order.
    pub fn newer_than(&self, tick_seq: u64) -> impl Iterator<Item = &BufferedBatch> {
        self.entries
            .iter()
            .filter(move |entry| entry.batch.tick_seq > tick_seq)
    }

    /// Calls `apply` for every event of every buffered batch whose tick
    /// sequence is greater than `tick_seq`, in arrival order.
    ///
    /// Returns the number of batches replayed.
    pub fn replay_newer_than<F>(&self, tick_seq: u64, mut apply: F) -> usize
    where
        F: FnMut(u64, &DeltaEvent),
    {
        let mut replayed = 0;
        for entry in self.newer_than(tick_seq) {
            for event in &entry.batch.events {
                apply(entry.batch.tick_seq, event);
            }
            replayed += 1;
        }
        replayed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn newest_tick_seq(&self) -> Option<u64> {
        self.entries.back().map(|entry| entry.batch.tick_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(tick_seq: u64, events: usize) -> DeltaBatch {
        let mut batch = DeltaBatch::new(tick_seq, 1);
        for index in 0..events {
            batch
                .events
                .push(DeltaEvent::Opaque(json!({"type": "marker", "index": index})));
        }
        batch
    }

    /// Tests replay skips batches at or below the tick
    #[test]
    fn test_replay_skips_old_batches() {
        let mut buffer = DeltaBuffer::default();
        buffer.push(batch(10, 1), 0.0);
        buffer.push(batch(20, 1), 1.0);
        buffer.push(batch(30, 1), 2.0);

        let mut seen = Vec::new();
        let replayed = buffer.replay_newer_than(15, |tick_seq, _| seen.push(tick_seq));

        assert_eq!(seen, vec![20, 30]);
        assert_eq!(replayed, 2);
    }

    /// Tests replay visits each event once in order
    #[test]
    fn test_replay_invokes_once_per_event_in_order() {
        let mut buffer = DeltaBuffer::default();
        buffer.push(batch(5, 3), 0.0);
        buffer.push(batch(6, 2), 0.0);

        let mut seen = Vec::new();
        buffer.replay_newer_than(0, |tick_seq, event| {
            let index = match event {
                DeltaEvent::Opaque(value) => value["index"].as_u64().unwrap(),
                _ => panic!("Unexpected event"),
            };
            seen.push((tick_seq, index));
        });

        assert_eq!(seen, vec![(5, 0), (5, 1), (5, 2), (6, 0), (6, 1)]);
    }

    /// Tests replay follows arrival order over tick order
    #[test]
    fn test_replay_is_arrival_ordered() {
        let mut buffer = DeltaBuffer::default();
        buffer.push(batch(30, 1), 0.0);
        buffer.push(batch(20, 1), 1.0);

        let mut seen = Vec::new();
        buffer.replay_newer_than(0, |tick_seq, _| seen.push(tick_seq));
        assert_eq!(seen, vec![30, 20]);
    }

    /// Tests the count cap
    #[test]
    fn test_count_cap_evicts_oldest_first() {
        let mut buffer = DeltaBuffer::new(4, 60_000.0);
        for tick_seq in 1..=10 {
            buffer.push(batch(tick_seq, 1), tick_seq as f64);
        }

        assert_eq!(buffer.len(), 4);
        let mut seen = Vec::new();
        let replayed = buffer.replay_newer_than(0, |tick_seq, _| seen.push(tick_seq));
        assert_eq!(replayed, 4);
        assert_eq!(seen, vec![7, 8, 9, 10]);
    }

    /// Tests the age cap
    #[test]
    fn test_age_cap_evicts_stale_entries() {
        let mut buffer = DeltaBuffer::new(100, 1_000.0);
        buffer.push(batch(1, 1), 0.0);
        buffer.push(batch(2, 1), 500.0);
        buffer.push(batch(3, 1), 1_200.0);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.newest_tick_seq(), Some(3));

        buffer.push(batch(4, 1), 5_000.0);
        assert_eq!(buffer.len(), 1);
    }

    /// Tests filtered iteration keeps receive times
    #[test]
    fn test_newer_than_keeps_receive_times() {
        let mut buffer = DeltaBuffer::default();
        buffer.push(batch(1, 1), 10.0);
        buffer.push(batch(2, 1), 20.0);
        buffer.push(batch(3, 1), 30.0);

        let seen: Vec<(u64, f64)> = buffer
            .newer_than(1)
            .map(|entry| (entry.batch.tick_seq, entry.received_at_ms))
            .collect();
        assert_eq!(seen, vec![(2, 20.0), (3, 30.0)]);
    }

    /// Tests clearing the buffer
    #[test]
    fn test_clear() {
        let mut buffer = DeltaBuffer::default();
        buffer.push(batch(1, 1), 0.0);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.replay_newer_than(0, |_, _| panic!("empty")), 0);
    }
}
