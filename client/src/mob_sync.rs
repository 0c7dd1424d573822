//! Client-side mob reconciliation
//!
//! Every mob id tracks three pieces of state, each in its own map and each
//! drawn from its own pool: the rendered entity, the last authoritative
//! sample, and the interpolation window between the previous sample and that
//! one. Rendering runs `interpolation_backtime_ms` behind the local clock so
//! two real samples almost always bracket the render instant.
//!
//! Entities that stop receiving updates are evicted in tiers. A dead mob is
//! forgiven for a shorter time than a live one, and the live cap depends on
//! whether a wave is running.

use crate::clock_sync::ServerClock;
use crate::pool::{Pool, Reset};
use crate::snapshot::{ChunkOutcome, SnapshotAccumulator};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use shared::{EntityDelta, MobPool, MobSample, ResyncSnapshot};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Server tick duration, used to fake a previous sample for new mobs
    pub nominal_tick_ms: f64,
    pub interpolation_backtime_ms: f64,
    pub max_extrapolation_live_ms: f64,
    pub max_extrapolation_down_ms: f64,
    /// Without a batch for this long the connection is treated as down
    pub liveness_threshold_ms: f64,
    pub hard_stale_ms: f64,
    pub dead_stale_ms: f64,
    pub wave_active_stale_ms: f64,
    pub post_wave_stale_ms: f64,
    pub snapshot_timeout_ms: f64,
    pub buffer_max_batches: usize,
    pub buffer_max_age_ms: f64,
    pub pool_max_free: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            nominal_tick_ms: 100.0,
            interpolation_backtime_ms: 100.0,
            max_extrapolation_live_ms: 250.0,
            max_extrapolation_down_ms: 100.0,
            liveness_threshold_ms: 1_000.0,
            hard_stale_ms: 15_000.0,
            dead_stale_ms: 1_500.0,
            wave_active_stale_ms: 5_000.0,
            post_wave_stale_ms: 8_000.0,
            snapshot_timeout_ms: 3_000.0,
            buffer_max_batches: crate::delta_buffer::DEFAULT_MAX_BATCHES,
            buffer_max_age_ms: crate::delta_buffer::DEFAULT_MAX_AGE_MS,
            pool_max_free: 512,
        }
    }
}

/// The renderable state of one mob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MobEntity {
    pub id: u32,
    pub x: f32,
    pub z: f32,
    pub vel_x: f32,
    pub vel_z: f32,
    pub hp: i32,
    pub max_hp: Option<i32>,
}

impl Reset for MobEntity {
    fn reset(&mut self) {
        *self = MobEntity::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct InterpolationEntry {
    pub from_x: f32,
    pub from_z: f32,
    pub to_x: f32,
    pub to_z: f32,
    /// Local-clock bounds of the window
    pub t0: f64,
    pub t1: f64,
}

impl Reset for InterpolationEntry {
    fn reset(&mut self) {
        *self = InterpolationEntry::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct SampleEntry {
    pub x: f32,
    pub z: f32,
    pub vel_x: f32,
    pub vel_z: f32,
    pub hp: i32,
    pub max_hp: Option<i32>,
    pub server_time_ms: u64,
    pub received_at_ms: f64,
}

impl SampleEntry {
    fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.z.is_finite()
            && self.vel_x.is_finite()
            && self.vel_z.is_finite()
            && self.received_at_ms.is_finite()
    }
}

impl Reset for SampleEntry {
    fn reset(&mut self) {
        *self = SampleEntry::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionTier {
    NonFinite,
    Hard,
    Dead,
    WaveActive,
    PostWave,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub samples_applied: u64,
    pub samples_dropped_stale: u64,
    pub records_malformed: u64,
    pub despawned: u64,
    pub evicted_non_finite: u64,
    pub evicted_hard: u64,
    pub evicted_dead: u64,
    pub evicted_wave_active: u64,
    pub evicted_post_wave: u64,
    pub reconciled_removed: u64,
    pub snapshots_applied: u64,
    pub snapshots_discarded: u64,
    pub snapshots_loaded: u64,
}

impl SyncStats {
    fn record_eviction(&mut self, tier: EvictionTier) {
        let counter = match tier {
            EvictionTier::NonFinite => &mut self.evicted_non_finite,
            EvictionTier::Hard => &mut self.evicted_hard,
            EvictionTier::Dead => &mut self.evicted_dead,
            EvictionTier::WaveActive => &mut self.evicted_wave_active,
            EvictionTier::PostWave => &mut self.evicted_post_wave,
        };
        *counter += 1;
    }
}

/// A mob as handed to the renderer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderedMob {
    pub id: u32,
    pub x: f32,
    pub z: f32,
    pub hp: i32,
    pub max_hp: Option<i32>,
}

#[derive(Debug)]
pub struct MobSync {
    config: SyncConfig,
    clock: ServerClock,
    entities: HashMap<u32, MobEntity>,
    samples: HashMap<u32, SampleEntry>,
    interpolations: HashMap<u32, InterpolationEntry>,
    entity_pool: Pool<MobEntity>,
    sample_pool: Pool<SampleEntry>,
    interpolation_pool: Pool<InterpolationEntry>,
    accumulator: SnapshotAccumulator,
    wave_active: bool,
    last_batch_at_ms: Option<f64>,
    stats: SyncStats,
}

impl Default for MobSync {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl MobSync {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            clock: ServerClock::new(),
            entities: HashMap::new(),
            samples: HashMap::new(),
            interpolations: HashMap::new(),
            entity_pool: Pool::new(config.pool_max_free),
            sample_pool: Pool::new(config.pool_max_free),
            interpolation_pool: Pool::new(config.pool_max_free),
            accumulator: SnapshotAccumulator::new(config.snapshot_timeout_ms),
            wave_active: false,
            last_batch_at_ms: None,
            stats: SyncStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn server_clock(&self) -> &ServerClock {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn entity(&self, id: u32) -> Option<&MobEntity> {
        self.entities.get(&id)
    }

    pub fn interpolation(&self, id: u32) -> Option<&InterpolationEntry> {
        self.interpolations.get(&id)
    }

    pub fn ids(&self) -> HashSet<u32> {
        self.entities.keys().copied().collect()
    }

    pub fn set_wave_active(&mut self, active: bool) {
        self.wave_active = active;
    }

    pub fn is_wave_active(&self) -> bool {
        self.wave_active
    }

    /// Records that a batch arrived and folds its server time into the
    /// clock estimate.
    pub fn observe_batch(&mut self, server_time_ms: u64, now_ms: f64) {
        self.clock.observe(server_time_ms, now_ms);
        self.last_batch_at_ms = Some(now_ms);
    }

    /// Whether a batch arrived within the liveness threshold.
    pub fn is_live(&self, now_ms: f64) -> bool {
        self.last_batch_at_ms
            .is_some_and(|last| now_ms - last <= self.config.liveness_threshold_ms)
    }

    /// Applies one structural delta: samples, despawns and, for full
    /// snapshots, removal of every mob the snapshot does not mention.
    pub fn apply_entity_delta(&mut self, delta: &EntityDelta, now_ms: f64) {
        self.observe_batch(delta.server_time_ms, now_ms);
        self.apply_structural(delta, now_ms);
    }

    /// Applies a delta that was buffered earlier and received at
    /// `received_at_ms`. The clock estimate is left alone, since the delta's
    /// server time no longer pairs with the current local time.
    pub fn replay_entity_delta(&mut self, delta: &EntityDelta, received_at_ms: f64) {
        self.apply_structural(delta, received_at_ms);
    }

    fn apply_structural(&mut self, delta: &EntityDelta, now_ms: f64) {
        let mut seen = Vec::new();
        if let Some(pool) = &delta.mobs {
            seen.reserve(pool.len());
            for index in 0..pool.len() {
                match pool.get(index) {
                    Some(sample) => {
                        seen.push(sample.id);
                        self.apply_sample(&sample, delta.server_time_ms, now_ms);
                    }
                    None => {
                        warn!("Skipping mob record {} with missing columns", index);
                        self.stats.records_malformed += 1;
                        // The id is still listed, so a snapshot must not treat it as absent.
                        if let Some(id) = pool.ids.get(index) {
                            seen.push(*id);
                        }
                    }
                }
            }
        }

        for id in &delta.despawned {
            if self.remove(*id) {
                self.stats.despawned += 1;
            }
        }

        if delta.full_snapshot {
            self.apply_full_snapshot(delta, seen, now_ms);
        }
    }

    fn apply_full_snapshot(&mut self, delta: &EntityDelta, seen: Vec<u32>, now_ms: f64) {
        let chunk = match delta.chunk {
            Some(chunk) if chunk.chunk_count > 1 => chunk,
            _ => {
                let ids: HashSet<u32> = seen.into_iter().collect();
                self.reconcile(&ids);
                self.stats.snapshots_applied += 1;
                return;
            }
        };

        match self.accumulator.accept(chunk, seen, now_ms) {
            ChunkOutcome::Complete(ids) => {
                self.reconcile(&ids);
                self.stats.snapshots_applied += 1;
            }
            ChunkOutcome::Rejected => {
                warn!(
                    "Ignoring snapshot chunk {}/{} of snapshot {}",
                    chunk.chunk_index, chunk.chunk_count, chunk.snapshot_id
                );
                self.stats.records_malformed += 1;
            }
            ChunkOutcome::Pending => {}
        }
        self.collect_discards();
    }

    fn collect_discards(&mut self) {
        for reason in self.accumulator.take_discarded() {
            debug!("Discarded partial snapshot: {:?}", reason);
            self.stats.snapshots_discarded += 1;
        }
    }

    /// Applies one authoritative sample taken at `server_time_ms`.
    ///
    /// Returns false when the sample was dropped, either because a sample at
    /// the same or a later server time is already stored or because it
    /// carries non-finite values.
    pub fn apply_sample(&mut self, sample: &MobSample, server_time_ms: u64, now_ms: f64) -> bool {
        let finite = sample.pos_x.is_finite()
            && sample.pos_z.is_finite()
            && sample.vel_x.is_finite()
            && sample.vel_z.is_finite();
        if !finite {
            warn!("Skipping non-finite sample for mob {}", sample.id);
            self.stats.records_malformed += 1;
            return false;
        }

        let previous = self
            .samples
            .get(&sample.id)
            .map(|stored| (stored.server_time_ms, stored.x, stored.z));
        if let Some((stored_time, _, _)) = previous {
            if stored_time >= server_time_ms {
                self.stats.samples_dropped_stale += 1;
                return false;
            }
        }

        let backstep_s = (self.config.nominal_tick_ms / 1000.0) as f32;
        let t1 = self.clock.to_local(server_time_ms);
        let (from_x, from_z, t0) = match previous {
            Some((stored_time, x, z)) => (x, z, self.clock.to_local(stored_time)),
            None => (
                sample.pos_x - sample.vel_x * backstep_s,
                sample.pos_z - sample.vel_z * backstep_s,
                t1 - self.config.nominal_tick_ms,
            ),
        };

        if !self.entities.contains_key(&sample.id) {
            let mut entity = self.entity_pool.acquire(MobEntity::default);
            entity.id = sample.id;
            entity.x = from_x;
            entity.z = from_z;
            self.entities.insert(sample.id, entity);
        }
        if let Some(entity) = self.entities.get_mut(&sample.id) {
            entity.vel_x = sample.vel_x;
            entity.vel_z = sample.vel_z;
            entity.hp = sample.hp;
            entity.max_hp = sample.max_hp;
        }

        let sample_pool = &mut self.sample_pool;
        let stored = self
            .samples
            .entry(sample.id)
            .or_insert_with(|| sample_pool.acquire(SampleEntry::default));
        stored.x = sample.pos_x;
        stored.z = sample.pos_z;
        stored.vel_x = sample.vel_x;
        stored.vel_z = sample.vel_z;
        stored.hp = sample.hp;
        stored.max_hp = sample.max_hp;
        stored.server_time_ms = server_time_ms;
        stored.received_at_ms = now_ms;

        let interpolation_pool = &mut self.interpolation_pool;
        let window = self
            .interpolations
            .entry(sample.id)
            .or_insert_with(|| interpolation_pool.acquire(InterpolationEntry::default));
        window.from_x = from_x;
        window.from_z = from_z;
        window.to_x = sample.pos_x;
        window.to_z = sample.pos_z;
        window.t0 = t0;
        window.t1 = t1;

        self.stats.samples_applied += 1;
        true
    }

    /// Removes a mob, returning its pooled objects. Returns whether it existed.
    pub fn remove(&mut self, id: u32) -> bool {
        if let Some(window) = self.interpolations.remove(&id) {
            self.interpolation_pool.release(window);
        }
        if let Some(sample) = self.samples.remove(&id) {
            self.sample_pool.release(sample);
        }
        match self.entities.remove(&id) {
            Some(entity) => {
                self.entity_pool.release(entity);
                true
            }
            None => false,
        }
    }

    /// Removes every tracked mob absent from `ids`. Returns how many went.
    pub fn reconcile(&mut self, ids: &HashSet<u32>) -> usize {
        let absent: Vec<u32> = self
            .entities
            .keys()
            .filter(|id| !ids.contains(id))
            .copied()
            .collect();
        for id in &absent {
            self.remove(*id);
        }
        if !absent.is_empty() {
            debug!("Snapshot reconciliation removed {} mobs", absent.len());
        }
        self.stats.reconciled_removed += absent.len() as u64;
        absent.len()
    }

    /// Replaces the entire mob set with an authoritative snapshot.
    pub fn load_snapshot(&mut self, snapshot: &ResyncSnapshot, now_ms: f64) {
        let ids: Vec<u32> = self.entities.keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
        self.accumulator = SnapshotAccumulator::new(self.config.snapshot_timeout_ms);
        self.observe_batch(snapshot.server_time_ms, now_ms);

        for index in 0..snapshot.mobs.len() {
            match snapshot.mobs.get(index) {
                Some(sample) => {
                    self.apply_sample(&sample, snapshot.server_time_ms, now_ms);
                }
                None => {
                    warn!("Skipping snapshot mob record {} with missing columns", index);
                    self.stats.records_malformed += 1;
                }
            }
        }
        self.stats.snapshots_loaded += 1;
    }

    /// Evicts stale mobs, then moves every survivor to its render position.
    pub fn update_frame(&mut self, now_ms: f64) {
        self.accumulator.expire(now_ms);
        self.collect_discards();
        self.evict_stale(now_ms);

        let render_now = now_ms - self.config.interpolation_backtime_ms;
        let max_extrapolation_ms = if self.is_live(now_ms) {
            self.config.max_extrapolation_live_ms
        } else {
            self.config.max_extrapolation_down_ms
        };

        for (id, entity) in self.entities.iter_mut() {
            let Some(window) = self.interpolations.get(id) else {
                continue;
            };

            if render_now <= window.t1 {
                let span = window.t1 - window.t0;
                let alpha = if span > 0.0 {
                    ((render_now - window.t0) / span).clamp(0.0, 1.0) as f32
                } else {
                    1.0
                };
                entity.x = window.from_x + (window.to_x - window.from_x) * alpha;
                entity.z = window.from_z + (window.to_z - window.from_z) * alpha;
            } else {
                let ahead_s = ((render_now - window.t1).min(max_extrapolation_ms) / 1000.0) as f32;
                entity.x = window.to_x + entity.vel_x * ahead_s;
                entity.z = window.to_z + entity.vel_z * ahead_s;
            }
        }
    }

    fn stale_tier(&self, sample: &SampleEntry, now_ms: f64) -> Option<EvictionTier> {
        if !sample.is_finite() {
            return Some(EvictionTier::NonFinite);
        }
        let age = now_ms - sample.received_at_ms;
        if age > self.config.hard_stale_ms {
            return Some(EvictionTier::Hard);
        }
        if sample.hp <= 0 && age > self.config.dead_stale_ms {
            return Some(EvictionTier::Dead);
        }
        if self.wave_active {
            (age > self.config.wave_active_stale_ms).then_some(EvictionTier::WaveActive)
        } else {
            (age > self.config.post_wave_stale_ms).then_some(EvictionTier::PostWave)
        }
    }

    fn evict_stale(&mut self, now_ms: f64) {
        let mut stale = Vec::new();
        for id in self.entities.keys() {
            let tier = match self.samples.get(id) {
                Some(sample) => self.stale_tier(sample, now_ms),
                None => Some(EvictionTier::NonFinite),
            };
            if let Some(tier) = tier {
                stale.push((*id, tier));
            }
        }

        for (id, tier) in stale {
            debug!("Evicting mob {} ({:?})", id, tier);
            self.remove(id);
            self.stats.record_eviction(tier);
        }
    }

    /// Current render state, ordered by id.
    pub fn render_positions(&self) -> Vec<RenderedMob> {
        let mut rendered: Vec<RenderedMob> = self
            .entities
            .values()
            .map(|entity| RenderedMob {
                id: entity.id,
                x: entity.x,
                z: entity.z,
                hp: entity.hp,
                max_hp: entity.max_hp,
            })
            .collect();
        rendered.sort_by_key(|mob| mob.id);
        rendered
    }

    /// Packs the last authoritative samples into a wire pool, ordered by id.
    pub fn export_pool(&self) -> MobPool {
        let mut ids: Vec<u32> = self.samples.keys().copied().collect();
        ids.sort_unstable();

        let mut pool = MobPool::default();
        for id in ids {
            if let Some(sample) = self.samples.get(&id) {
                pool.push(&MobSample {
                    id,
                    pos_x: sample.x,
                    pos_z: sample.z,
                    vel_x: sample.vel_x,
                    vel_z: sample.vel_z,
                    hp: sample.hp,
                    max_hp: sample.max_hp,
                });
            }
        }
        pool
    }

    /// Pooled objects currently available for reuse, as
    /// `(entities, samples, interpolations)`.
    pub fn pool_free_lens(&self) -> (usize, usize, usize) {
        (
            self.entity_pool.free_len(),
            self.sample_pool.free_len(),
            self.interpolation_pool.free_len(),
        )
    }
}
