//! Bounded, lock-guarded tick loop for one invocation
//!
//! The runner owns an invocation's whole life cycle:
//! - tries to take the lock immediately, otherwise optionally waits as a
//!   follower (behind the follower gate) for leadership
//! - once leading, runs the caller's [`TickHandler`] at a fixed interval for
//!   what is left of the invocation window
//! - re-verifies and refreshes the lock every few ticks and stops the moment
//!   ownership is lost
//! - always tears down and releases the lock on the way out
//!
//! Nothing here is fatal to the caller: every way a run can end is reported
//! in the returned [`RunReport`].

use crate::clock::Clock;
use crate::election::{self, AggressivePoll, HeartbeatConfig, PollOptions};
use crate::lock;
use crate::store::CoordinationStore;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;

/// Follower gate record and the TTL each registration carries.
///
/// The TTL should outlive the follower's `wait_ms`, otherwise the gate
/// lapses and the follower abandons its own poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub key: String,
    pub ttl_seconds: u64,
}

/// How a process that lost the initial acquire waits for leadership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerConfig {
    pub wait_ms: u64,
    pub poll_interval_ms: u64,
    pub aggressive_poll: Option<AggressivePoll>,
    pub gate: Option<GateConfig>,
}

/// Invocation-scoped loop parameters. Recomputed on every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickLoopConfig {
    pub lock_key: String,
    pub window_ms: u64,
    pub tick_interval_ms: u64,
    pub lock_ttl_seconds: u64,
    pub lock_refresh_interval_ticks: u64,
    pub heartbeat: Option<HeartbeatConfig>,
    pub follower: Option<FollowerConfig>,
}

impl Default for TickLoopConfig {
    fn default() -> Self {
        Self {
            lock_key: "sim:leader".to_string(),
            window_ms: 30_000,
            tick_interval_ms: 100,
            lock_ttl_seconds: 3,
            lock_refresh_interval_ticks: 10,
            heartbeat: None,
            follower: None,
        }
    }
}

/// Loop state handed to every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    pub now_ms: u64,
    pub ticks_processed: u64,
}

/// What a single simulation step produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TickOutcome {
    pub tick_seq: u64,
    pub command_count: usize,
    pub delta_count: usize,
}

/// The simulation step driven by the runner.
///
/// Callbacks report failure through `Err`. A panic is not caught: it unwinds
/// out of [`TickLoopRunner::run`] before `on_teardown` runs or the lock is
/// released, so the lock stays held until its TTL lapses.
pub trait TickHandler {
    type State;
    type Error: Display;

    fn on_init(&mut self) -> impl Future<Output = Result<Self::State, Self::Error>>;

    fn on_tick(
        &mut self,
        state: &mut Self::State,
        ctx: TickContext,
    ) -> impl Future<Output = Result<TickOutcome, Self::Error>>;

    fn on_teardown(&mut self, state: Self::State) -> impl Future<Output = Result<(), Self::Error>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Unstarted,
    AttemptingLeader,
    FollowerWaiting,
    Leading,
    GaveUp,
    TearingDown,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunExit {
    /// Leadership was never obtained; no handler method ran.
    NotLeader,
    WindowElapsed,
    LockLost,
    TickFailed,
    InitFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub owner_token: String,
    pub duration_ms: u64,
    pub ticks_processed: u64,
    /// Time spent as a follower before leading, debited from the window.
    pub waited_ms: u64,
    pub exit: RunExit,
    pub last_outcome: Option<TickOutcome>,
}

pub struct TickLoopRunner<S, C> {
    store: S,
    clock: C,
    config: TickLoopConfig,
}

impl<S: CoordinationStore, C: Clock> TickLoopRunner<S, C> {
    pub fn new(store: S, clock: C, config: TickLoopConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &TickLoopConfig {
        &self.config
    }

    /// Runs one invocation to completion.
    pub async fn run<H: TickHandler>(&self, handler: &mut H) -> RunReport {
        let started = self.clock.now_ms();
        let owner_token = election::generate_owner_token(started);
        let mut phase = RunPhase::Unstarted;
        self.transition(&owner_token, &mut phase, RunPhase::AttemptingLeader);

        let mut leading = match lock::acquire(
            &self.store,
            &self.config.lock_key,
            &owner_token,
            self.config.lock_ttl_seconds,
        )
        .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("Initial acquire of '{}' failed: {}", self.config.lock_key, e);
                false
            }
        };

        if !leading {
            if let Some(follower) = &self.config.follower {
                self.transition(&owner_token, &mut phase, RunPhase::FollowerWaiting);
                leading = self.wait_as_follower(follower, &owner_token).await;
            }
        }

        if !leading {
            self.transition(&owner_token, &mut phase, RunPhase::GaveUp);
            self.transition(&owner_token, &mut phase, RunPhase::Done);
            return RunReport {
                owner_token,
                duration_ms: self.clock.now_ms().saturating_sub(started),
                ticks_processed: 0,
                waited_ms: self.clock.now_ms().saturating_sub(started),
                exit: RunExit::NotLeader,
                last_outcome: None,
            };
        }

        self.transition(&owner_token, &mut phase, RunPhase::Leading);
        let tick_start = self.clock.now_ms();
        let waited_ms = tick_start.saturating_sub(started);
        let end_at = tick_start + self.config.window_ms.saturating_sub(waited_ms);

        if let Some(heartbeat) = &self.config.heartbeat {
            if let Err(e) = election::write_heartbeat(&self.store, &self.clock, heartbeat).await {
                warn!("Initial heartbeat write failed: {}", e);
            }
        }

        info!(
            "{} leading '{}' for {}ms (waited {}ms)",
            owner_token,
            self.config.lock_key,
            end_at - tick_start,
            waited_ms
        );

        let mut ticks_processed = 0;
        let mut last_outcome = None;

        let exit = match handler.on_init().await {
            Ok(mut state) => {
                let exit = self
                    .tick_until(
                        handler,
                        &mut state,
                        &owner_token,
                        tick_start,
                        end_at,
                        &mut ticks_processed,
                        &mut last_outcome,
                    )
                    .await;

                self.transition(&owner_token, &mut phase, RunPhase::TearingDown);
                if let Err(e) = handler.on_teardown(state).await {
                    warn!("Teardown failed for {}: {}", owner_token, e);
                }
                exit
            }
            Err(e) => {
                error!("Init failed for {}: {}", owner_token, e);
                self.transition(&owner_token, &mut phase, RunPhase::TearingDown);
                RunExit::InitFailed
            }
        };

        if let Err(e) = lock::release(&self.store, &self.config.lock_key, &owner_token).await {
            warn!("Releasing '{}' failed: {}", self.config.lock_key, e);
        }
        self.transition(&owner_token, &mut phase, RunPhase::Done);

        let report = RunReport {
            owner_token,
            duration_ms: self.clock.now_ms().saturating_sub(started),
            ticks_processed,
            waited_ms,
            exit,
            last_outcome,
        };
        info!(
            "{} finished: {:?} after {} ticks in {}ms",
            report.owner_token, report.exit, report.ticks_processed, report.duration_ms
        );
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn tick_until<H: TickHandler>(
        &self,
        handler: &mut H,
        state: &mut H::State,
        owner_token: &str,
        tick_start: u64,
        end_at: u64,
        ticks_processed: &mut u64,
        last_outcome: &mut Option<TickOutcome>,
    ) -> RunExit {
        let interval = self.config.tick_interval_ms.max(1);
        let mut next_tick = tick_start;

        loop {
            let now = self.clock.now_ms();
            if now >= end_at {
                return RunExit::WindowElapsed;
            }
            if next_tick > now {
                self.clock.sleep(next_tick.min(end_at) - now).await;
                if self.clock.now_ms() >= end_at {
                    return RunExit::WindowElapsed;
                }
            }

            let ctx = TickContext {
                now_ms: self.clock.now_ms(),
                ticks_processed: *ticks_processed,
            };
            match handler.on_tick(state, ctx).await {
                Ok(outcome) => *last_outcome = Some(outcome),
                Err(e) => {
                    error!("Tick {} failed for {}: {}", ctx.ticks_processed, owner_token, e);
                    return RunExit::TickFailed;
                }
            }
            *ticks_processed += 1;

            // Snap to the tick grid so one slow tick doesn't shift every later one.
            let elapsed = self.clock.now_ms().saturating_sub(tick_start);
            let slot = elapsed.div_ceil(interval).max(*ticks_processed);
            next_tick = tick_start + slot * interval;

            let refresh_every = self.config.lock_refresh_interval_ticks;
            if refresh_every > 0
                && *ticks_processed % refresh_every == 0
                && !self.hold_lock(owner_token).await
            {
                return RunExit::LockLost;
            }
        }
    }

    /// Verifies, refreshes and heartbeats. False means stop ticking.
    async fn hold_lock(&self, owner_token: &str) -> bool {
        let key = &self.config.lock_key;
        match lock::verify(&self.store, key, owner_token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("{} lost lock '{}'", owner_token, key);
                return false;
            }
            Err(e) => {
                warn!("Could not verify lock '{}': {}", key, e);
                return false;
            }
        }

        match lock::refresh(&self.store, key, owner_token, self.config.lock_ttl_seconds).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("{} could not refresh lock '{}'", owner_token, key);
                return false;
            }
            Err(e) => {
                warn!("Refreshing lock '{}' failed: {}", key, e);
                return false;
            }
        }

        if let Some(heartbeat) = &self.config.heartbeat {
            if let Err(e) = election::write_heartbeat(&self.store, &self.clock, heartbeat).await {
                warn!("Heartbeat write failed: {}", e);
            }
        }
        true
    }

    async fn wait_as_follower(&self, follower: &FollowerConfig, owner_token: &str) -> bool {
        let opts = PollOptions {
            lock_key: &self.config.lock_key,
            candidate_token: owner_token,
            lock_ttl_seconds: self.config.lock_ttl_seconds,
            wait_ms: follower.wait_ms,
            poll_interval_ms: follower.poll_interval_ms,
            aggressive_poll: follower.aggressive_poll,
            heartbeat: self.config.heartbeat.as_ref(),
        };

        let Some(gate) = &follower.gate else {
            return election::poll_for_leadership(&self.store, &self.clock, &opts, || async {
                true
            })
            .await;
        };

        if let Err(e) =
            election::register_follower_gate(&self.store, &gate.key, owner_token, gate.ttl_seconds)
                .await
        {
            warn!("Could not register at follower gate '{}': {}", gate.key, e);
        }

        let store = &self.store;
        let gate_key = gate.key.as_str();
        let acquired =
            election::poll_for_leadership(&self.store, &self.clock, &opts, move || async move {
                match election::is_follower_gate_active(store, gate_key, owner_token).await {
                    Ok(active) => active,
                    Err(e) => {
                        warn!("Follower gate check failed: {}", e);
                        false
                    }
                }
            })
            .await;

        if acquired {
            match election::is_follower_gate_active(&self.store, &gate.key, owner_token).await {
                Ok(true) => {
                    if let Err(e) = election::clear_gate(&self.store, &gate.key).await {
                        warn!("Could not clear follower gate '{}': {}", gate.key, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Follower gate check failed: {}", e),
            }
        }
        acquired
    }

    fn transition(&self, owner_token: &str, phase: &mut RunPhase, next: RunPhase) {
        debug!("{}: {:?} -> {:?}", owner_token, phase, next);
        *phase = next;
    }
}
