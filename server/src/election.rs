//! Leader election on top of the lock primitive
//!
//! Three records cooperate here:
//! - the lock key, whose value is an owner token `leader:<epochMs>:<rand>`
//! - a heartbeat key the leader rewrites at every lock refresh
//! - a follower gate key naming the single follower allowed to poll
//!
//! A waiting follower sleeps coarsely while the current leader is predicted
//! to still be inside its budget, then polls finely around the predicted
//! release. A heartbeat older than the configured threshold lets the
//! follower break the lock early.

use crate::clock::Clock;
use crate::lock;
use crate::store::{CoordinationStore, StoreError};
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;

pub const LEADER_TOKEN_PREFIX: &str = "leader";
const TOKEN_SUFFIX_LEN: usize = 8;

/// Heartbeat key, its TTL and the age after which a leader is presumed dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub key: String,
    pub ttl_seconds: u64,
    pub stale_ms: u64,
}

impl HeartbeatConfig {
    /// A missing heartbeat is never stale: the leader may not have written
    /// its first one yet.
    pub fn is_stale(&self, last_ms: Option<u64>, now_ms: u64) -> bool {
        match last_ms {
            None => false,
            Some(last) => now_ms.saturating_sub(last) > self.stale_ms,
        }
    }
}

/// Fine-grained polling phase near the predicted release of the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggressivePoll {
    pub window_ms: u64,
    pub interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PollOptions<'a> {
    pub lock_key: &'a str,
    pub candidate_token: &'a str,
    pub lock_ttl_seconds: u64,
    pub wait_ms: u64,
    pub poll_interval_ms: u64,
    pub aggressive_poll: Option<AggressivePoll>,
    pub heartbeat: Option<&'a HeartbeatConfig>,
}

/// Builds a fresh owner token embedding its creation time.
pub fn generate_owner_token(now_ms: u64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}:{}:{}", LEADER_TOKEN_PREFIX, now_ms, suffix)
}

/// Extracts the creation time from a `leader:<epochMs>:<rand>` lock value.
pub fn parse_leader_start_time(lock_value: &str) -> Option<u64> {
    let mut parts = lock_value.splitn(3, ':');
    if parts.next()? != LEADER_TOKEN_PREFIX {
        return None;
    }
    let start = parts.next()?.parse().ok()?;
    parts.next()?;
    Some(start)
}

pub async fn write_heartbeat<S: CoordinationStore, C: Clock>(
    store: &S,
    clock: &C,
    heartbeat: &HeartbeatConfig,
) -> Result<(), StoreError> {
    store
        .set(
            &heartbeat.key,
            &clock.now_ms().to_string(),
            heartbeat.ttl_seconds,
        )
        .await
}

/// Reads the last heartbeat. Absent or unparseable values read as `None`.
pub async fn read_heartbeat<S: CoordinationStore>(
    store: &S,
    key: &str,
) -> Result<Option<u64>, StoreError> {
    Ok(store.get(key).await?.and_then(|value| value.parse().ok()))
}

/// Registers `token` as the only follower allowed to poll, displacing any
/// earlier registration.
pub async fn register_follower_gate<S: CoordinationStore>(
    store: &S,
    key: &str,
    token: &str,
    ttl_seconds: u64,
) -> Result<(), StoreError> {
    store.set(key, token, ttl_seconds).await
}

pub async fn is_follower_gate_active<S: CoordinationStore>(
    store: &S,
    key: &str,
    token: &str,
) -> Result<bool, StoreError> {
    Ok(store.get(key).await?.as_deref() == Some(token))
}

pub async fn clear_gate<S: CoordinationStore>(store: &S, key: &str) -> Result<(), StoreError> {
    store.del(key).await.map(|_| ())
}

/// Polls until the lock is acquired, the wait budget runs out, or
/// `should_continue` reports that this candidate must give up.
///
/// Store failures are treated like contention: logged and polled through.
pub async fn poll_for_leadership<S, C, F, Fut>(
    store: &S,
    clock: &C,
    opts: &PollOptions<'_>,
    mut should_continue: F,
) -> bool
where
    S: CoordinationStore,
    C: Clock,
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = clock.now_ms().saturating_add(opts.wait_ms);
    let coarse_interval = opts.poll_interval_ms.max(1);

    if let Some(aggressive) = opts.aggressive_poll {
        if let Some(coarse_until) = coarse_phase_end(store, clock, opts, aggressive, deadline).await
        {
            debug!(
                "{} sleeping coarsely for {}ms before polling",
                opts.candidate_token,
                coarse_until.saturating_sub(clock.now_ms())
            );
            while clock.now_ms() < coarse_until {
                if !should_continue().await {
                    debug!("{} abandoned poll during coarse phase", opts.candidate_token);
                    return false;
                }
                if try_stale_takeover(store, clock, opts).await {
                    return true;
                }
                let remaining = coarse_until.saturating_sub(clock.now_ms());
                clock.sleep(coarse_interval.min(remaining)).await;
            }
        }
    }

    let fine_interval = opts
        .aggressive_poll
        .map(|aggressive| aggressive.interval_ms)
        .unwrap_or(opts.poll_interval_ms)
        .max(1);

    while clock.now_ms() < deadline {
        let attempt_started = clock.now_ms();

        match lock::acquire(store, opts.lock_key, opts.candidate_token, opts.lock_ttl_seconds).await
        {
            Ok(true) => {
                info!("{} acquired leadership by polling", opts.candidate_token);
                return true;
            }
            Ok(false) => {}
            Err(e) => warn!("Acquire attempt failed: {}", e),
        }

        if try_stale_takeover(store, clock, opts).await {
            return true;
        }

        if !should_continue().await {
            debug!("{} abandoned poll", opts.candidate_token);
            return false;
        }

        let now = clock.now_ms();
        let spent = now.saturating_sub(attempt_started);
        let pause = fine_interval
            .saturating_sub(spent)
            .min(deadline.saturating_sub(now));
        if pause > 0 {
            clock.sleep(pause).await;
        }
    }

    debug!(
        "{} gave up waiting for leadership after {}ms",
        opts.candidate_token, opts.wait_ms
    );
    false
}

/// Works out when the coarse phase should end, or `None` when the holder's
/// release cannot be predicted and polling should be uniform.
///
/// The current holder is assumed to have been given the same `wait_ms`
/// budget when it acquired.
async fn coarse_phase_end<S: CoordinationStore, C: Clock>(
    store: &S,
    clock: &C,
    opts: &PollOptions<'_>,
    aggressive: AggressivePoll,
    deadline: u64,
) -> Option<u64> {
    let holder = match store.get(opts.lock_key).await {
        Ok(holder) => holder?,
        Err(e) => {
            warn!("Could not read lock holder: {}", e);
            return None;
        }
    };
    let leader_start = parse_leader_start_time(&holder)?;
    let expected_release =
        leader_start.checked_add(opts.wait_ms.saturating_sub(aggressive.window_ms))?;
    let coarse_until = expected_release
        .saturating_sub(aggressive.window_ms)
        .min(deadline.saturating_sub(aggressive.window_ms));

    if coarse_until <= clock.now_ms() {
        None
    } else {
        Some(coarse_until)
    }
}

/// Breaks the lock if its holder's heartbeat has gone stale, then tries to
/// take it.
async fn try_stale_takeover<S: CoordinationStore, C: Clock>(
    store: &S,
    clock: &C,
    opts: &PollOptions<'_>,
) -> bool {
    let Some(heartbeat) = opts.heartbeat else {
        return false;
    };

    let last = match read_heartbeat(store, &heartbeat.key).await {
        Ok(last) => last,
        Err(e) => {
            warn!("Could not read heartbeat '{}': {}", heartbeat.key, e);
            return false;
        }
    };
    let now = clock.now_ms();
    if !heartbeat.is_stale(last, now) {
        return false;
    }

    warn!(
        "Heartbeat '{}' is {}ms old, forcing takeover of '{}'",
        heartbeat.key,
        now.saturating_sub(last.unwrap_or(now)),
        opts.lock_key
    );
    if let Err(e) = lock::force_delete(store, opts.lock_key).await {
        warn!("Forced delete of '{}' failed: {}", opts.lock_key, e);
        return false;
    }
    match lock::acquire(store, opts.lock_key, opts.candidate_token, opts.lock_ttl_seconds).await {
        Ok(acquired) => acquired,
        Err(e) => {
            warn!("Acquire after takeover failed: {}", e);
            false
        }
    }
}
