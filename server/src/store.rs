//! Coordination store contract and an in-process implementation
//!
//! The lock and election layers only ever talk to a [`CoordinationStore`]:
//! - `set_if_absent` is the atomic acquire primitive
//! - `delete_if_equals` stands in for a watch/multi/exec compare-and-delete
//! - every value carries a TTL managed by the store itself
//!
//! [`MemoryStore`] implements the contract with lazily expiring entries and
//! is shared between concurrent invocations by cloning it.

use crate::clock::Clock;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors a coordination store round trip can produce
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the command
    #[error("Coordination store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A TTL of zero was supplied; keys must always expire
    #[error("Invalid TTL of {ttl_seconds}s for key '{key}'")]
    InvalidTtl { key: String, ttl_seconds: u64 },
}

/// Shared key-value service used for leader coordination.
///
/// Every method is a single best-effort round trip. Keys and values are
/// opaque strings.
pub trait CoordinationStore {
    /// Sets `key` to `value` only if it is absent. Returns whether this call
    /// created the key.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    /// Unconditionally sets `key` with a TTL.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> impl Future<Output = Result<(), StoreError>>;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>>;

    /// Deletes `key`. Returns whether it existed.
    fn del(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>>;

    /// Resets the TTL of an existing key. Returns false if the key is absent.
    fn expire(&self, key: &str, ttl_seconds: u64)
        -> impl Future<Output = Result<bool, StoreError>>;

    /// Atomically deletes `key` only if its current value equals `expected`.
    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool, StoreError>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: u64,
}

/// Per-operation call counters, used to observe polling pressure
#[derive(Debug, Default)]
pub struct OpCounts {
    pub set_if_absent: AtomicU64,
    pub set: AtomicU64,
    pub get: AtomicU64,
    pub del: AtomicU64,
    pub expire: AtomicU64,
    pub delete_if_equals: AtomicU64,
}

impl OpCounts {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// In-process [`CoordinationStore`] with TTLs measured on the supplied clock.
#[derive(Clone)]
pub struct MemoryStore<C: Clock> {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: C,
    unavailable: Arc<AtomicBool>,
    counts: Arc<OpCounts>,
}

impl<C: Clock> MemoryStore<C> {
    pub fn new(clock: C) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
            counts: Arc::new(OpCounts::default()),
        }
    }

    /// Makes every subsequent operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn op_counts(&self) -> &OpCounts {
        &self.counts
    }

    /// Remaining lifetime of `key` in milliseconds, if it is live.
    pub async fn ttl_ms(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_ms();
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at_ms > now)
            .map(|entry| entry.expires_at_ms - now)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable {
                reason: "fault injected".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn expiry(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        if ttl_seconds == 0 {
            return Err(StoreError::InvalidTtl {
                key: key.to_string(),
                ttl_seconds,
            });
        }
        Ok(self.clock.now_ms() + ttl_seconds * 1000)
    }

    /// Drops `key` if its TTL has passed, so callers only see live entries.
    fn purge_expired(&self, entries: &mut HashMap<String, Entry>, key: &str) {
        let now = self.clock.now_ms();
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at_ms <= now)
        {
            debug!("Key '{}' expired", key);
            entries.remove(key);
        }
    }
}

impl<C: Clock> CoordinationStore for MemoryStore<C> {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        OpCounts::bump(&self.counts.set_if_absent);
        self.check_available()?;
        let expires_at_ms = self.expiry(key, ttl_seconds)?;

        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        OpCounts::bump(&self.counts.set);
        self.check_available()?;
        let expires_at_ms = self.expiry(key, ttl_seconds)?;

        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        OpCounts::bump(&self.counts.get);
        self.check_available()?;

        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries, key);
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        OpCounts::bump(&self.counts.del);
        self.check_available()?;

        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries, key);
        Ok(entries.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, StoreError> {
        OpCounts::bump(&self.counts.expire);
        self.check_available()?;
        let expires_at_ms = self.expiry(key, ttl_seconds)?;

        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        OpCounts::bump(&self.counts.delete_if_equals);
        self.check_available()?;

        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries, key);
        if entries.get(key).is_some_and(|entry| entry.value == expected) {
            entries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore<ManualClock>, ManualClock) {
        let clock = ManualClock::new(10_000);
        (MemoryStore::new(clock.clone()), clock)
    }

    /// Tests set-if-absent exclusivity
    #[tokio::test]
    async fn test_set_if_absent_only_first_wins() {
        let (store, _) = store();
        assert!(store.set_if_absent("k", "a", 5).await.unwrap());
        assert!(!store.set_if_absent("k", "b", 5).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));
    }

    /// Tests lazy expiry against the injected clock
    #[tokio::test]
    async fn test_entries_expire_on_clock() {
        let (store, clock) = store();
        store.set("k", "v", 2).await.unwrap();
        clock.advance(1_999);
        assert_eq!(store.ttl_ms("k").await, Some(1));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(1);
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.set_if_absent("k", "w", 1).await.unwrap());
    }

    /// Tests expire on live and missing keys
    #[tokio::test]
    async fn test_expire_extends_live_key_only() {
        let (store, clock) = store();
        store.set("k", "v", 1).await.unwrap();
        clock.advance(900);
        assert!(store.expire("k", 3).await.unwrap());
        clock.advance(2_000);
        assert!(store.get("k").await.unwrap().is_some());

        assert!(!store.expire("missing", 3).await.unwrap());
    }

    /// Tests compare-and-delete
    #[tokio::test]
    async fn test_delete_if_equals() {
        let (store, _) = store();
        store.set("k", "owner", 5).await.unwrap();

        assert!(!store.delete_if_equals("k", "intruder").await.unwrap());
        assert!(store.get("k").await.unwrap().is_some());

        assert!(store.delete_if_equals("k", "owner").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.delete_if_equals("k", "owner").await.unwrap());
    }

    /// Tests that a zero TTL is refused
    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let (store, _) = store();
        let err = store.set("k", "v", 0).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTtl {
                key: "k".to_string(),
                ttl_seconds: 0
            }
        );
    }

    /// Tests the unavailable switch fails every operation
    #[tokio::test]
    async fn test_fault_injection() {
        let (store, _) = store();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable { .. })
        ));
        store.set_unavailable(false);
        assert!(store.get("k").await.is_ok());
    }

    /// Tests store clones share data and counters
    #[tokio::test]
    async fn test_clones_share_entries_and_counts() {
        let (store, _) = store();
        let other = store.clone();
        store.set("k", "v", 5).await.unwrap();
        assert_eq!(other.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(OpCounts::read(&other.op_counts().set), 1);
        assert_eq!(OpCounts::read(&store.op_counts().get), 1);
    }
}
