//! Accumulation of chunked full snapshots
//!
//! A replace-the-entire-set message can be split across `chunk_count` parts.
//! The union of ids is only authoritative once every chunk index of the same
//! snapshot id has arrived; anything less is thrown away rather than applied.

use shared::ChunkInfo;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// A chunk of a different snapshot arrived mid-accumulation
    Superseded,
    /// The final chunk arrived but some indices were missing
    Incomplete,
    /// The accumulation sat unfinished for longer than the timeout
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Pending,
    /// Every chunk arrived; the union of ids is the authoritative set.
    Complete(HashSet<u32>),
    /// The chunk metadata itself is invalid and was ignored.
    Rejected,
}

#[derive(Debug)]
struct Accumulation {
    snapshot_id: u64,
    chunk_count: u32,
    seen: Vec<bool>,
    ids: HashSet<u32>,
    started_at_ms: f64,
}

impl Accumulation {
    fn is_complete(&self) -> bool {
        self.seen.iter().all(|seen| *seen)
    }
}

#[derive(Debug)]
pub struct SnapshotAccumulator {
    current: Option<Accumulation>,
    timeout_ms: f64,
    discarded: Vec<DiscardReason>,
}

impl SnapshotAccumulator {
    pub fn new(timeout_ms: f64) -> Self {
        Self {
            current: None,
            timeout_ms,
            discarded: Vec::new(),
        }
    }

    /// Adds one chunk's ids to the accumulation for its snapshot id.
    pub fn accept<I>(&mut self, chunk: ChunkInfo, ids: I, now_ms: f64) -> ChunkOutcome
    where
        I: IntoIterator<Item = u32>,
    {
        if chunk.chunk_count == 0 || chunk.chunk_index >= chunk.chunk_count {
            return ChunkOutcome::Rejected;
        }

        self.expire(now_ms);

        let restart = match &self.current {
            Some(current) => {
                current.snapshot_id != chunk.snapshot_id
                    || current.chunk_count != chunk.chunk_count
            }
            None => true,
        };
        if restart {
            if self.current.take().is_some() {
                self.discarded.push(DiscardReason::Superseded);
            }
            self.current = Some(Accumulation {
                snapshot_id: chunk.snapshot_id,
                chunk_count: chunk.chunk_count,
                seen: vec![false; chunk.chunk_count as usize],
                ids: HashSet::new(),
                started_at_ms: now_ms,
            });
        }

        let Some(current) = self.current.as_mut() else {
            return ChunkOutcome::Rejected;
        };
        current.ids.extend(ids);
        current.seen[chunk.chunk_index as usize] = true;

        if current.is_complete() {
            let done = self.current.take().map(|acc| acc.ids).unwrap_or_default();
            return ChunkOutcome::Complete(done);
        }

        if chunk.chunk_index + 1 == chunk.chunk_count {
            self.current = None;
            self.discarded.push(DiscardReason::Incomplete);
        }
        ChunkOutcome::Pending
    }

    /// Drops an accumulation that has been pending longer than the timeout.
    pub fn expire(&mut self, now_ms: f64) {
        if self
            .current
            .as_ref()
            .is_some_and(|current| now_ms - current.started_at_ms > self.timeout_ms)
        {
            self.current = None;
            self.discarded.push(DiscardReason::TimedOut);
        }
    }

    pub fn is_accumulating(&self) -> bool {
        self.current.is_some()
    }

    /// Discards recorded since the last call.
    pub fn take_discarded(&mut self) -> Vec<DiscardReason> {
        std::mem::take(&mut self.discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(snapshot_id: u64, chunk_index: u32, chunk_count: u32) -> ChunkInfo {
        ChunkInfo {
            snapshot_id,
            chunk_index,
            chunk_count,
        }
    }

    /// Tests completion yields the union of chunk ids
    #[test]
    fn test_all_chunks_complete_with_union() {
        let mut acc = SnapshotAccumulator::new(5_000.0);
        assert_eq!(acc.accept(chunk(1, 0, 3), [1, 2], 0.0), ChunkOutcome::Pending);
        assert_eq!(acc.accept(chunk(1, 1, 3), [3], 1.0), ChunkOutcome::Pending);
        assert_eq!(
            acc.accept(chunk(1, 2, 3), [4], 2.0),
            ChunkOutcome::Complete(HashSet::from([1, 2, 3, 4]))
        );
        assert!(!acc.is_accumulating());
        assert!(acc.take_discarded().is_empty());
    }

    /// Tests an incomplete final chunk discards
    #[test]
    fn test_final_chunk_without_coverage_discards() {
        let mut acc = SnapshotAccumulator::new(5_000.0);
        acc.accept(chunk(1, 0, 3), [1], 0.0);
        assert_eq!(acc.accept(chunk(1, 2, 3), [3], 1.0), ChunkOutcome::Pending);
        assert!(!acc.is_accumulating());
        assert_eq!(acc.take_discarded(), vec![DiscardReason::Incomplete]);

        // The late middle chunk starts a fresh accumulation, not a completion.
        assert_eq!(acc.accept(chunk(1, 1, 3), [2], 2.0), ChunkOutcome::Pending);
    }

    /// Tests a newer snapshot id supersedes
    #[test]
    fn test_new_snapshot_id_supersedes() {
        let mut acc = SnapshotAccumulator::new(5_000.0);
        acc.accept(chunk(1, 0, 2), [1], 0.0);
        acc.accept(chunk(2, 0, 2), [5], 1.0);
        assert_eq!(acc.take_discarded(), vec![DiscardReason::Superseded]);
        assert_eq!(
            acc.accept(chunk(2, 1, 2), [6], 2.0),
            ChunkOutcome::Complete(HashSet::from([5, 6]))
        );
    }

    /// Tests out-of-order chunks still complete
    #[test]
    fn test_out_of_order_chunks_before_final_still_complete() {
        let mut acc = SnapshotAccumulator::new(5_000.0);
        acc.accept(chunk(3, 1, 3), [2], 0.0);
        acc.accept(chunk(3, 0, 3), [1], 0.0);
        assert_eq!(
            acc.accept(chunk(3, 2, 3), [3], 0.0),
            ChunkOutcome::Complete(HashSet::from([1, 2, 3]))
        );
    }

    /// Tests accumulation timeout
    #[test]
    fn test_timeout_discards() {
        let mut acc = SnapshotAccumulator::new(1_000.0);
        acc.accept(chunk(1, 0, 2), [1], 0.0);
        acc.expire(1_001.0);
        assert!(!acc.is_accumulating());
        assert_eq!(acc.take_discarded(), vec![DiscardReason::TimedOut]);
    }

    /// Tests invalid chunk metadata is rejected
    #[test]
    fn test_invalid_chunk_metadata_rejected() {
        let mut acc = SnapshotAccumulator::new(1_000.0);
        assert_eq!(acc.accept(chunk(1, 0, 0), [1], 0.0), ChunkOutcome::Rejected);
        assert_eq!(acc.accept(chunk(1, 3, 3), [1], 0.0), ChunkOutcome::Rejected);
        assert!(!acc.is_accumulating());
    }
}
