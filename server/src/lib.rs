//! # Tick Leader Server Library
//!
//! This library lets a fleet of short-lived, possibly concurrent invocations
//! agree on a single process that produces simulation ticks. The only shared
//! resource is a key-value coordination store; there is no in-process
//! coordination and no long-lived server.
//!
//! ## Core Responsibilities
//!
//! ### Mutual Exclusion
//! A lock is one store key holding the owner's token, created with an atomic
//! set-if-absent and kept alive with TTL refreshes. A holder only ever
//! refreshes or deletes the key after checking the token still matches, so a
//! process that lost its lock cannot disturb the next leader.
//!
//! ### Leader Election
//! Processes that lose the initial race can wait as followers:
//! - Only the most recently registered follower keeps polling (follower gate)
//! - Polling sleeps coarsely while the current leader is predicted to still be
//!   inside its budget, then polls finely near the predicted release
//! - A leader whose heartbeat has gone stale has its lock broken
//!
//! ### Bounded Tick Loop
//! The leader runs a caller-supplied simulation step at a fixed cadence for
//! the rest of its invocation window, re-verifying and refreshing the lock
//! every few ticks, and always tears down and releases on the way out.
//!
//! ## Module Organization
//!
//! ### Clock Module (`clock`)
//! Epoch-millisecond time and sleeping behind a trait, with a virtual clock
//! for tests.
//!
//! ### Store Module (`store`)
//! The coordination store contract and an in-process implementation with
//! TTLs and fault injection.
//!
//! ### Lock Module (`lock`)
//! Acquire, verify, refresh, release and forced deletion. Single round trips,
//! no retries.
//!
//! ### Election Module (`election`)
//! Owner tokens, heartbeats, the follower gate and the leadership poll loop.
//!
//! ### Tick Loop Module (`tick_loop`)
//! The invocation state machine, the [`tick_loop::TickHandler`] trait and the
//! [`tick_loop::RunReport`] every run produces.
//!
//! ## Failure Model
//!
//! ### Contention
//! Failing to acquire or refresh is routine. The invocation gives up
//! leadership and reports it; nothing is logged as an error.
//!
//! ### Split Brain
//! A short window of dual leadership is tolerated. Lock TTLs bound it, every
//! mutating action re-checks ownership, and clients reconcile idempotently
//! using tick sequence numbers.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::clock::SystemClock;
//! use server::store::MemoryStore;
//! use server::tick_loop::{TickContext, TickHandler, TickLoopConfig, TickLoopRunner, TickOutcome};
//!
//! struct Counter;
//!
//! impl TickHandler for Counter {
//!     type State = u64;
//!     type Error = String;
//!
//!     async fn on_init(&mut self) -> Result<u64, String> {
//!         Ok(0)
//!     }
//!
//!     async fn on_tick(
//!         &mut self,
//!         seq: &mut u64,
//!         _ctx: TickContext,
//!     ) -> Result<TickOutcome, String> {
//!         *seq += 1;
//!         Ok(TickOutcome {
//!             tick_seq: *seq,
//!             command_count: 0,
//!             delta_count: 0,
//!         })
//!     }
//!
//!     async fn on_teardown(&mut self, _seq: u64) -> Result<(), String> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new(SystemClock);
//!     let runner = TickLoopRunner::new(store, SystemClock, TickLoopConfig::default());
//!     let report = runner.run(&mut Counter).await;
//!     println!("{:?} after {} ticks", report.exit, report.ticks_processed);
//! }
//! ```

pub mod clock;
pub mod election;
pub mod lock;
pub mod store;
pub mod tick_loop;
