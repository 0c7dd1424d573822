//! # Replication Client Library
//!
//! This library is the client half of the tick-leader replication core. It
//! consumes sequence-numbered delta batches produced by whichever server
//! invocation currently holds leadership and turns them into a smoothly
//! rendered, self-healing set of mobs.
//!
//! ## Architecture Overview
//!
//! Batches may arrive from an asynchronous transport at any time, but they are
//! only applied on the render timeline, once per frame, in receipt order. There
//! is exactly one consumer of the sync state, so no locking is involved.
//!
//! ### Interpolation
//! Rendering deliberately lags the local clock by a small backtime so that two
//! real samples almost always bracket the render instant. Past the newest
//! sample the client extrapolates along the last known velocity, for a shorter
//! time when the connection appears down than when it appears live.
//!
//! ### Desync Recovery
//! Missed deltas are not treated as errors. Entities that stop receiving
//! updates are evicted by tiered staleness caps, and periodic full snapshots
//! (optionally split into chunks) remove any entity the server no longer
//! knows about. A `resyncRequired` signal clears the delta buffer and blocks
//! structural deltas until an authoritative snapshot is loaded, after which
//! buffered batches for later ticks are replayed.
//!
//! ## Module Organization
//!
//! ### Replication Module (`replication`)
//! The per-frame driver:
//! - Inbound batch queue and per-frame flush
//! - `resyncRequired` handling ahead of other events
//! - Resync application and buffered replay
//! - Pass-through of events this crate does not interpret
//!
//! ### Mob Sync Module (`mob_sync`)
//! Per-entity reconciliation:
//! - Monotonic sample application
//! - Interpolation windows on the local clock
//! - Staleness eviction tiers
//! - Full-snapshot reconciliation
//!
//! ### Supporting Modules
//! - `delta_buffer`: bounded history of received batches for replay
//! - `snapshot`: chunked full-snapshot accumulation
//! - `clock_sync`: server-to-local time offset estimate
//! - `pool`: free lists for per-entity objects
//!
//! ## Usage Example
//!
//! ```rust
//! use client::replication::ReplicationClient;
//! use shared::decode_batch;
//!
//! let mut client = ReplicationClient::default();
//! let line = br#"{"tickSeq":1,"worldVersion":1,"events":[]}"#;
//! client.enqueue(decode_batch(line).unwrap(), 0.0);
//!
//! let report = client.flush(16.0);
//! assert_eq!(report.batches, 1);
//! for mob in client.mobs().render_positions() {
//!     println!("{} at ({}, {})", mob.id, mob.x, mob.z);
//! }
//! ```

pub mod clock_sync;
pub mod delta_buffer;
pub mod mob_sync;
pub mod pool;
pub mod replication;
pub mod snapshot;
