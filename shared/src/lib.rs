use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Quantized position units per world unit (centimetre precision).
pub const POSITION_SCALE: f32 = 100.0;
/// Quantized velocity units per world unit per second.
pub const VELOCITY_SCALE: f32 = 100.0;

pub const EVENT_ENTITY_DELTA: &str = "entityDelta";
pub const EVENT_RESYNC_REQUIRED: &str = "resyncRequired";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Failed to decode delta batch: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Failed to encode delta batch: {0}")]
    Encode(#[source] serde_json::Error),
}

/// One sequence-numbered unit of replicated state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaBatch {
    pub tick_seq: u64,
    pub world_version: u64,
    #[serde(default)]
    pub events: Vec<DeltaEvent>,
}

impl DeltaBatch {
    pub fn new(tick_seq: u64, world_version: u64) -> Self {
        Self {
            tick_seq,
            world_version,
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event: DeltaEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// A tagged event inside a batch.
///
/// Only the tags this crate understands are typed. Anything else is carried
/// through untouched as `Opaque` so presentation layers can consume it, and a
/// recognised tag whose body fails to parse becomes `Unreadable` instead of
/// failing the whole batch. `Unreadable` keeps the event as received so it
/// encodes back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum DeltaEvent {
    EntityDelta(EntityDelta),
    ResyncRequired { reason: String },
    Opaque(Value),
    Unreadable {
        type_tag: String,
        error: String,
        raw: Value,
    },
}

impl DeltaEvent {
    pub fn type_tag(&self) -> &str {
        match self {
            DeltaEvent::EntityDelta(_) => EVENT_ENTITY_DELTA,
            DeltaEvent::ResyncRequired { .. } => EVENT_RESYNC_REQUIRED,
            DeltaEvent::Opaque(value) => value.get("type").and_then(Value::as_str).unwrap_or(""),
            DeltaEvent::Unreadable { type_tag, .. } => type_tag,
        }
    }

    pub fn is_resync_required(&self) -> bool {
        matches!(self, DeltaEvent::ResyncRequired { .. })
    }
}

#[derive(Deserialize)]
struct ResyncBody {
    #[serde(default)]
    reason: String,
}

impl From<Value> for DeltaEvent {
    fn from(value: Value) -> Self {
        let type_tag = match value.get("type").and_then(Value::as_str) {
            Some(tag) => tag.to_string(),
            None => return DeltaEvent::Opaque(value),
        };

        match type_tag.as_str() {
            EVENT_ENTITY_DELTA => match serde_json::from_value::<EntityDelta>(value.clone()) {
                Ok(delta) => DeltaEvent::EntityDelta(delta),
                Err(e) => DeltaEvent::Unreadable {
                    type_tag,
                    error: e.to_string(),
                    raw: value,
                },
            },
            EVENT_RESYNC_REQUIRED => match serde_json::from_value::<ResyncBody>(value.clone()) {
                Ok(body) => DeltaEvent::ResyncRequired {
                    reason: body.reason,
                },
                Err(e) => DeltaEvent::Unreadable {
                    type_tag,
                    error: e.to_string(),
                    raw: value,
                },
            },
            _ => DeltaEvent::Opaque(value),
        }
    }
}

fn tagged(tag: &str, body: Value) -> Value {
    let mut map = match body {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("type".to_string(), Value::String(tag.to_string()));
    Value::Object(map)
}

impl From<DeltaEvent> for Value {
    fn from(event: DeltaEvent) -> Self {
        match event {
            DeltaEvent::EntityDelta(delta) => tagged(
                EVENT_ENTITY_DELTA,
                serde_json::to_value(delta).unwrap_or_default(),
            ),
            DeltaEvent::ResyncRequired { reason } => {
                let mut body = Map::new();
                body.insert("reason".to_string(), Value::String(reason));
                tagged(EVENT_RESYNC_REQUIRED, Value::Object(body))
            }
            DeltaEvent::Opaque(value) => value,
            DeltaEvent::Unreadable { raw, .. } => raw,
        }
    }
}

/// Structural change to the replicated mob set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDelta {
    pub server_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobs: Option<MobPool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub despawned: Vec<u32>,
    /// When set, the mob ids in this delta (together with any sibling chunks)
    /// are the complete authoritative set.
    #[serde(default)]
    pub full_snapshot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInfo {
    pub snapshot_id: u64,
    pub chunk_index: u32,
    pub chunk_count: u32,
}

/// Struct-of-arrays quantized mob pool. Every array is indexed by the same
/// position as `ids`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MobPool {
    pub ids: Vec<u32>,
    pub pos_x: Vec<i32>,
    pub pos_z: Vec<i32>,
    pub vel_x: Vec<i32>,
    pub vel_z: Vec<i32>,
    pub hp: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hp: Option<Vec<i32>>,
}

/// A dequantized mob record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MobSample {
    pub id: u32,
    pub pos_x: f32,
    pub pos_z: f32,
    pub vel_x: f32,
    pub vel_z: f32,
    pub hp: i32,
    pub max_hp: Option<i32>,
}

impl MobPool {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn push(&mut self, sample: &MobSample) {
        self.ids.push(sample.id);
        self.pos_x.push(quantize(sample.pos_x, POSITION_SCALE));
        self.pos_z.push(quantize(sample.pos_z, POSITION_SCALE));
        self.vel_x.push(quantize(sample.vel_x, VELOCITY_SCALE));
        self.vel_z.push(quantize(sample.vel_z, VELOCITY_SCALE));
        self.hp.push(sample.hp);
        if let Some(max_hp) = sample.max_hp {
            // Backfill so earlier entries stay aligned.
            let column = self
                .max_hp
                .get_or_insert_with(|| vec![0; self.ids.len() - 1]);
            column.push(max_hp);
        } else if let Some(column) = self.max_hp.as_mut() {
            column.push(0);
        }
    }

    /// Dequantizes the record at `index`.
    ///
    /// Returns `None` when any required column is too short for `index`,
    /// which is how a sender's array-length mismatch surfaces.
    pub fn get(&self, index: usize) -> Option<MobSample> {
        Some(MobSample {
            id: *self.ids.get(index)?,
            pos_x: dequantize(*self.pos_x.get(index)?, POSITION_SCALE),
            pos_z: dequantize(*self.pos_z.get(index)?, POSITION_SCALE),
            vel_x: dequantize(*self.vel_x.get(index)?, VELOCITY_SCALE),
            vel_z: dequantize(*self.vel_z.get(index)?, VELOCITY_SCALE),
            hp: *self.hp.get(index)?,
            max_hp: self
                .max_hp
                .as_ref()
                .and_then(|column| column.get(index).copied()),
        })
    }
}

/// Authoritative full state returned by the out-of-band resync exchange.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncSnapshot {
    pub tick_seq: u64,
    pub world_version: u64,
    pub server_time_ms: u64,
    pub mobs: MobPool,
}

pub fn quantize(value: f32, scale: f32) -> i32 {
    (value * scale).round() as i32
}

pub fn dequantize(value: i32, scale: f32) -> f32 {
    value as f32 / scale
}

pub fn encode_batch(batch: &DeltaBatch) -> Result<String, WireError> {
    serde_json::to_string(batch).map_err(WireError::Encode)
}

pub fn decode_batch(data: &[u8]) -> Result<DeltaBatch, WireError> {
    serde_json::from_slice(data).map_err(WireError::Decode)
}

// Get current timestamp in milliseconds
pub fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
