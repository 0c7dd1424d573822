//! Time source used by the lock, election and tick-loop layers
//!
//! Everything that reads "now" or sleeps goes through [`Clock`] so the same
//! code runs against the wall clock in production and against a virtual
//! clock in tests, where a 30 second leadership window completes instantly.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Epoch-millisecond clock with an async sleep.
pub trait Clock {
    fn now_ms(&self) -> u64;

    fn sleep(&self, ms: u64) -> impl Future<Output = ()>;
}

/// Wall clock backed by `SystemTime` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        shared::timestamp_ms()
    }

    async fn sleep(&self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Virtual clock whose `sleep` advances time instantly.
///
/// Clones share the same counter, so a store, a runner and a tick handler
/// holding clones all observe the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep(&self, ms: u64) {
        self.advance(ms);
        // Let concurrently joined futures observe the new time.
        tokio::task::yield_now().await;
    }
}
