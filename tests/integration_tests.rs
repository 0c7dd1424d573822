//! Integration tests for the replication core
//!
//! These tests drive the server tick loop against a shared in-process store,
//! ship what it produces over the JSON wire format and feed it to the client.

use assert_approx_eq::assert_approx_eq;
use client::replication::ReplicationClient;
use serde_json::json;
use server::clock::{Clock, ManualClock};
use server::election::{self, HeartbeatConfig};
use server::lock;
use server::store::{CoordinationStore, MemoryStore, OpCounts};
use server::tick_loop::{
    FollowerConfig, RunExit, TickContext, TickHandler, TickLoopConfig, TickLoopRunner, TickOutcome,
};
use shared::{
    decode_batch, encode_batch, ChunkInfo, DeltaBatch, DeltaEvent, EntityDelta, MobPool, MobSample,
};
use std::collections::HashSet;

const START: u64 = 1_700_000_000_000;
const LOCK_KEY: &str = "sim:leader";
const SEQ_KEY: &str = "sim:tickSeq";

fn heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        key: "sim:heartbeat".to_string(),
        ttl_seconds: 60,
        stale_ms: 1_500,
    }
}

fn config(window_ms: u64) -> TickLoopConfig {
    TickLoopConfig {
        lock_key: LOCK_KEY.to_string(),
        window_ms,
        tick_interval_ms: 100,
        lock_ttl_seconds: 5,
        lock_refresh_interval_ticks: 5,
        heartbeat: Some(heartbeat()),
        follower: None,
    }
}

fn mob(id: u32, x: f32) -> MobSample {
    MobSample {
        id,
        pos_x: x,
        pos_z: 0.0,
        vel_x: 5.0,
        vel_z: 0.0,
        hp: 20,
        max_hp: Some(20),
    }
}

fn pool_of(ids: &[u32], x: f32) -> MobPool {
    let mut pool = MobPool::default();
    for id in ids {
        pool.push(&mob(*id, x));
    }
    pool
}

/// A simulation that moves a fixed set of mobs and records every encoded
/// batch. At `snapshot_at` it emits a full snapshot of `survivors`, one chunk
/// per mob; from then on only survivors are sent.
struct Emitter {
    store: MemoryStore<ManualClock>,
    ids: Vec<u32>,
    survivors: Vec<u32>,
    snapshot_at: Option<u64>,
    lines: Vec<String>,
}

impl Emitter {
    fn new(store: MemoryStore<ManualClock>) -> Self {
        Self {
            store,
            ids: vec![1, 2, 3, 4],
            survivors: vec![1, 2],
            snapshot_at: None,
            lines: Vec::new(),
        }
    }

    fn first_tick_seq(&self) -> Option<u64> {
        self.lines
            .first()
            .and_then(|line| decode_batch(line.as_bytes()).ok())
            .map(|batch| batch.tick_seq)
    }
}

impl TickHandler for Emitter {
    type State = u64;
    type Error = String;

    async fn on_init(&mut self) -> Result<u64, String> {
        let stored = self.store.get(SEQ_KEY).await.map_err(|e| e.to_string())?;
        Ok(stored.and_then(|value| value.parse().ok()).unwrap_or(0))
    }

    async fn on_tick(
        &mut self,
        tick_seq: &mut u64,
        ctx: TickContext,
    ) -> Result<TickOutcome, String> {
        *tick_seq += 1;
        let x = *tick_seq as f32 * 0.5;
        let past_snapshot = self.snapshot_at.is_some_and(|at| *tick_seq >= at);
        let alive = if past_snapshot { &self.survivors } else { &self.ids };

        let mut batch = DeltaBatch::new(*tick_seq, 1);
        if self.snapshot_at == Some(*tick_seq) {
            let chunk_count = alive.len() as u32;
            for (index, id) in alive.iter().enumerate() {
                batch.events.push(DeltaEvent::EntityDelta(EntityDelta {
                    server_time_ms: ctx.now_ms,
                    mobs: Some(pool_of(&[*id], x)),
                    full_snapshot: true,
                    chunk: Some(ChunkInfo {
                        snapshot_id: *tick_seq,
                        chunk_index: index as u32,
                        chunk_count,
                    }),
                    ..Default::default()
                }));
            }
        } else {
            batch.events.push(DeltaEvent::EntityDelta(EntityDelta {
                server_time_ms: ctx.now_ms,
                mobs: Some(pool_of(alive, x)),
                ..Default::default()
            }));
        }

        self.lines.push(encode_batch(&batch).map_err(|e| e.to_string())?);
        Ok(TickOutcome {
            tick_seq: *tick_seq,
            command_count: 0,
            delta_count: batch.events.len(),
        })
    }

    async fn on_teardown(&mut self, tick_seq: u64) -> Result<(), String> {
        self.store
            .set(SEQ_KEY, &tick_seq.to_string(), 3_600)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Feeds encoded batches to a client, one flush per batch, arriving `latency`
/// after their server time on a local clock that starts at zero.
fn replay(client: &mut ReplicationClient, lines: &[String], latency_ms: f64) -> f64 {
    let mut now = 0.0;
    for line in lines {
        let batch = decode_batch(line.as_bytes()).unwrap();
        let server_time = batch
            .events
            .iter()
            .find_map(|event| match event {
                DeltaEvent::EntityDelta(delta) => Some(delta.server_time_ms),
                _ => None,
            })
            .unwrap_or(START);
        now = (server_time - START) as f64 + latency_ms;
        client.enqueue(batch, now);
        client.flush(now);
    }
    now
}

/// END-TO-END REPLICATION TESTS
mod replication_tests {
    use super::*;

    /// Tests leader output replicated to a client over JSON
    #[tokio::test]
    async fn leader_output_drives_client_state() {
        let clock = ManualClock::new(START);
        let store = MemoryStore::new(clock.clone());
        let runner = TickLoopRunner::new(store.clone(), clock.clone(), config(1_000));
        let mut emitter = Emitter {
            snapshot_at: Some(8),
            ..Emitter::new(store.clone())
        };

        let report = runner.run(&mut emitter).await;
        assert_eq!(report.exit, RunExit::WindowElapsed);
        assert_eq!(report.ticks_processed, 10);
        assert_eq!(emitter.lines.len(), 10);

        let mut client = ReplicationClient::default();
        let now = replay(&mut client, &emitter.lines, 40.0);

        // Mobs 3 and 4 vanished from the server; the chunked snapshot removes them.
        assert_eq!(client.mobs().ids(), HashSet::from([1, 2]));
        assert_eq!(client.mobs().stats().snapshots_applied, 1);
        assert_eq!(client.mobs().stats().reconciled_removed, 2);
        assert_eq!(client.last_tick_seq(), Some(10));

        // Rendering lags by the backtime: 60ms after the last arrival the
        // render instant sits 60ms into the window from tick 9 (x=4.5) to
        // tick 10 (x=5.0).
        client.flush(now + 60.0);
        let rendered = client.mobs().render_positions();
        assert_eq!(rendered.len(), 2);
        for mob in &rendered {
            assert_approx_eq!(mob.x, 4.8, 1e-3);
        }
        assert!(now > 900.0);
        assert_eq!(store.get(SEQ_KEY).await.unwrap().as_deref(), Some("10"));
    }

    /// Tests a dropped snapshot chunk keeps every client mob
    #[tokio::test]
    async fn missing_chunk_keeps_every_mob() {
        let clock = ManualClock::new(START);
        let store = MemoryStore::new(clock.clone());
        let runner = TickLoopRunner::new(store.clone(), clock.clone(), config(1_000));
        let mut emitter = Emitter {
            snapshot_at: Some(8),
            survivors: vec![1, 2, 3],
            ..Emitter::new(store)
        };
        runner.run(&mut emitter).await;

        // Drop the middle chunk of the three-chunk snapshot at tick 8.
        let mut lines = emitter.lines.clone();
        let mut batch = decode_batch(lines[7].as_bytes()).unwrap();
        assert_eq!(batch.events.len(), 3);
        batch.events.remove(1);
        lines[7] = encode_batch(&batch).unwrap();

        let mut client = ReplicationClient::default();
        replay(&mut client, &lines[..8], 40.0);

        assert_eq!(client.mobs().ids(), HashSet::from([1, 2, 3, 4]));
        assert_eq!(client.mobs().stats().snapshots_discarded, 1);
        assert_eq!(client.mobs().stats().reconciled_removed, 0);
    }

    /// Tests resync from an exported pool over the wire
    #[tokio::test]
    async fn resync_over_the_wire() {
        let mob = |id: u32, x: i32| {
            json!({"ids": [id], "posX": [x], "posZ": [0], "velX": [0], "velZ": [0], "hp": [5]})
        };
        let raw = [
            json!({"tickSeq": 1, "worldVersion": 1, "events": [
                {"type": "entityDelta", "serverTimeMs": 1000, "mobs": mob(1, 0)}
            ]}),
            json!({"tickSeq": 2, "worldVersion": 1, "events": [
                {"type": "waveStarted", "wave": 3},
                {"type": "resyncRequired", "reason": "gap"}
            ]}),
            json!({"tickSeq": 4, "worldVersion": 1, "events": [
                {"type": "entityDelta", "serverTimeMs": 1400, "mobs": mob(8, 100)}
            ]}),
        ];
        let mut client = ReplicationClient::default();
        for (index, value) in raw.iter().enumerate() {
            let line = value.to_string();
            client.enqueue(decode_batch(line.as_bytes()).unwrap(), index as f64 * 100.0);
        }
        let report = client.flush(300.0);

        assert!(report.resync_requested);
        assert_eq!(report.opaque.len(), 1);
        assert_eq!(report.opaque[0].0, 2);
        assert!(client.resync_pending());
        assert!(!client.mobs().contains(8));

        let snapshot = shared::ResyncSnapshot {
            tick_seq: 3,
            world_version: 1,
            server_time_ms: 1_300,
            mobs: pool_of(&[2], 0.0),
        };
        assert_eq!(client.apply_resync(&snapshot, 310.0), 1);
        assert_eq!(client.mobs().ids(), HashSet::from([2, 8]));
    }
}

/// LEADERSHIP TESTS
mod leadership_tests {
    use super::*;

    /// Tests a contended invocation runs no callbacks
    #[test]
    fn contended_invocation_runs_nothing() {
        tokio_test::block_on(async {
            let clock = ManualClock::new(START);
            let store = MemoryStore::new(clock.clone());
            assert!(lock::acquire(&store, LOCK_KEY, "leader:0:holder00", 30).await.unwrap());

            let runner = TickLoopRunner::new(store.clone(), clock.clone(), config(1_000));
            let mut emitter = Emitter::new(store.clone());
            let report = runner.run(&mut emitter).await;

            assert_eq!(report.exit, RunExit::NotLeader);
            assert_eq!(report.ticks_processed, 0);
            assert!(emitter.lines.is_empty());
            assert!(store.get(SEQ_KEY).await.unwrap().is_none());
            assert!(lock::verify(&store, LOCK_KEY, "leader:0:holder00").await.unwrap());
            assert_eq!(OpCounts::read(&store.op_counts().delete_if_equals), 0);
        });
    }

    /// Tests successive leaders continue the tick sequence
    #[tokio::test]
    async fn successive_leaders_continue_the_sequence() {
        let clock = ManualClock::new(START);
        let store = MemoryStore::new(clock.clone());

        let first = TickLoopRunner::new(store.clone(), clock.clone(), config(500));
        let mut emitter = Emitter::new(store.clone());
        let report = first.run(&mut emitter).await;
        assert_eq!(report.ticks_processed, 5);

        let second = TickLoopRunner::new(store.clone(), clock.clone(), config(500));
        let mut emitter = Emitter::new(store.clone());
        second.run(&mut emitter).await;

        assert_eq!(emitter.first_tick_seq(), Some(6));
        assert_eq!(store.get(SEQ_KEY).await.unwrap().as_deref(), Some("10"));
    }

    /// Tests a follower takes over from a crashed leader
    #[tokio::test]
    async fn follower_takes_over_from_crashed_leader() {
        let clock = ManualClock::new(START);
        let store = MemoryStore::new(clock.clone());
        store.set(SEQ_KEY, "41", 3_600).await.unwrap();

        // A leader that took the lock, heartbeated once and died.
        let crashed = election::generate_owner_token(clock.now_ms());
        assert!(lock::acquire(&store, LOCK_KEY, &crashed, 60).await.unwrap());
        election::write_heartbeat(&store, &clock, &heartbeat()).await.unwrap();

        let mut cfg = config(3_000);
        cfg.follower = Some(FollowerConfig {
            wait_ms: 2_500,
            poll_interval_ms: 250,
            aggressive_poll: None,
            gate: None,
        });
        let runner = TickLoopRunner::new(store.clone(), clock.clone(), cfg);
        let mut emitter = Emitter::new(store.clone());
        let report = runner.run(&mut emitter).await;

        assert_eq!(report.exit, RunExit::WindowElapsed);
        assert!(report.waited_ms > 1_500 && report.waited_ms < 2_500);
        assert_eq!(report.ticks_processed, (3_000 - report.waited_ms).div_ceil(100));
        assert_eq!(emitter.first_tick_seq(), Some(42));
        assert!(!lock::verify(&store, LOCK_KEY, &crashed).await.unwrap());
        assert!(store.get(LOCK_KEY).await.unwrap().is_none());
    }
}
