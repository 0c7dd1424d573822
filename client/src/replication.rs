//! Per-frame draining of inbound delta batches
//!
//! Batches may be queued from any transport callback but are only applied
//! from `flush`, once per frame, in receipt order. Within one flush every
//! `resyncRequired` signal is handled before any other event so a reset is
//! never overtaken by stale structural deltas from the same drain.

use crate::delta_buffer::DeltaBuffer;
use crate::mob_sync::{MobSync, SyncConfig};
use log::{debug, info, warn};
use serde_json::Value;
use shared::{DeltaBatch, DeltaEvent, ResyncSnapshot};
use std::collections::VecDeque;

/// What one `flush` did
#[derive(Debug, Default, PartialEq)]
pub struct FlushReport {
    pub batches: usize,
    pub entity_deltas_applied: usize,
    /// Structural deltas skipped because a resync is pending or they are
    /// already covered by the loaded snapshot
    pub entity_deltas_skipped: usize,
    pub resync_requested: bool,
    pub unreadable_events: usize,
    /// Events this crate does not interpret, in receipt order, tagged with
    /// their batch's tick sequence
    pub opaque: Vec<(u64, Value)>,
}

#[derive(Debug)]
pub struct ReplicationClient {
    inbound: VecDeque<(DeltaBatch, f64)>,
    buffer: DeltaBuffer,
    mobs: MobSync,
    resync_pending: Option<String>,
    snapshot_tick_seq: Option<u64>,
    last_tick_seq: Option<u64>,
}

impl Default for ReplicationClient {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl ReplicationClient {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            inbound: VecDeque::new(),
            buffer: DeltaBuffer::new(config.buffer_max_batches, config.buffer_max_age_ms),
            mobs: MobSync::new(config),
            resync_pending: None,
            snapshot_tick_seq: None,
            last_tick_seq: None,
        }
    }

    pub fn mobs(&self) -> &MobSync {
        &self.mobs
    }

    pub fn mobs_mut(&mut self) -> &mut MobSync {
        &mut self.mobs
    }

    pub fn buffer(&self) -> &DeltaBuffer {
        &self.buffer
    }

    /// Queues a batch received at local time `now_ms`.
    pub fn enqueue(&mut self, batch: DeltaBatch, now_ms: f64) {
        self.inbound.push_back((batch, now_ms));
    }

    pub fn queued(&self) -> usize {
        self.inbound.len()
    }

    /// Whether the server asked for a resync that has not been served yet.
    pub fn resync_pending(&self) -> bool {
        self.resync_pending.is_some()
    }

    pub fn resync_reason(&self) -> Option<&str> {
        self.resync_pending.as_deref()
    }

    pub fn snapshot_tick_seq(&self) -> Option<u64> {
        self.snapshot_tick_seq
    }

    pub fn last_tick_seq(&self) -> Option<u64> {
        self.last_tick_seq
    }

    /// Drains every queued batch and advances the mob state to `now_ms`.
    pub fn flush(&mut self, now_ms: f64) -> FlushReport {
        let drained: Vec<(DeltaBatch, f64)> = self.inbound.drain(..).collect();
        let mut report = FlushReport {
            batches: drained.len(),
            ..Default::default()
        };

        for (batch, _) in &drained {
            for event in &batch.events {
                if let DeltaEvent::ResyncRequired { reason } = event {
                    info!("Resync required at tick {}: {}", batch.tick_seq, reason);
                    self.buffer.clear();
                    self.resync_pending = Some(reason.clone());
                    report.resync_requested = true;
                }
            }
        }

        for (batch, received_at_ms) in drained {
            let tick_seq = batch.tick_seq;
            self.last_tick_seq = Some(
                self.last_tick_seq
                    .map_or(tick_seq, |last| last.max(tick_seq)),
            );

            for event in &batch.events {
                match event {
                    DeltaEvent::EntityDelta(delta) => {
                        if self.accepts_structural(tick_seq) {
                            self.mobs.apply_entity_delta(delta, received_at_ms);
                            report.entity_deltas_applied += 1;
                        } else {
                            report.entity_deltas_skipped += 1;
                        }
                    }
                    DeltaEvent::ResyncRequired { .. } => {}
                    DeltaEvent::Opaque(value) => report.opaque.push((tick_seq, value.clone())),
                    DeltaEvent::Unreadable { type_tag, error, .. } => {
                        warn!(
                            "Skipping unreadable {} event at tick {}: {}",
                            type_tag, tick_seq, error
                        );
                        report.unreadable_events += 1;
                    }
                }
            }
            self.buffer.push(batch, received_at_ms);
        }

        self.mobs.update_frame(now_ms);
        report
    }

    fn accepts_structural(&self, tick_seq: u64) -> bool {
        if self.resync_pending.is_some() {
            return false;
        }
        self.snapshot_tick_seq.map_or(true, |snapshot| tick_seq > snapshot)
    }

    /// Loads an authoritative snapshot, then replays buffered batches that
    /// describe later ticks. Returns the number of batches replayed.
    pub fn apply_resync(&mut self, snapshot: &ResyncSnapshot, now_ms: f64) -> usize {
        self.mobs.load_snapshot(snapshot, now_ms);
        self.snapshot_tick_seq = Some(snapshot.tick_seq);
        self.resync_pending = None;

        let mut replayed = 0;
        for entry in self.buffer.newer_than(snapshot.tick_seq) {
            for event in &entry.batch.events {
                if let DeltaEvent::EntityDelta(delta) = event {
                    self.mobs.replay_entity_delta(delta, entry.received_at_ms);
                }
            }
            replayed += 1;
        }
        debug!(
            "Resync loaded {} mobs at tick {}, replayed {} batches",
            self.mobs.len(),
            snapshot.tick_seq,
            replayed
        );
        replayed
    }
}
