//! Mutual-exclusion lock over a coordination store
//!
//! A lock is a single key whose value is the holder's owner token. The TTL is
//! the only liveness mechanism: a holder that disappears simply lets the key
//! expire. Every mutating operation checks the token first so a process never
//! extends or deletes a lock it no longer owns.
//!
//! No operation here retries. Retry and takeover policy belongs to the
//! election and tick-loop layers.

use crate::store::{CoordinationStore, StoreError};
use log::{debug, warn};

/// Atomically creates the lock key if it is absent.
///
/// Returns true only when this call created the key.
pub async fn acquire<S: CoordinationStore>(
    store: &S,
    key: &str,
    owner_token: &str,
    ttl_seconds: u64,
) -> Result<bool, StoreError> {
    let acquired = store.set_if_absent(key, owner_token, ttl_seconds).await?;
    if !acquired {
        debug!("Lock '{}' is held by another owner", key);
    }
    Ok(acquired)
}

/// Checks that the stored value still equals `owner_token`.
///
/// There is a window between this check and whatever the caller does next;
/// every later write re-checks ownership.
pub async fn verify<S: CoordinationStore>(
    store: &S,
    key: &str,
    owner_token: &str,
) -> Result<bool, StoreError> {
    Ok(store.get(key).await?.as_deref() == Some(owner_token))
}

/// Extends the TTL if the lock is still ours.
///
/// Returns false when the key has expired or now holds another token.
pub async fn refresh<S: CoordinationStore>(
    store: &S,
    key: &str,
    owner_token: &str,
    ttl_seconds: u64,
) -> Result<bool, StoreError> {
    if !verify(store, key, owner_token).await? {
        debug!("Refusing to refresh lock '{}': no longer owner", key);
        return Ok(false);
    }
    store.expire(key, ttl_seconds).await
}

/// Deletes the lock only if `owner_token` still holds it.
///
/// A no-op when the key is absent or owned by someone else.
pub async fn release<S: CoordinationStore>(
    store: &S,
    key: &str,
    owner_token: &str,
) -> Result<(), StoreError> {
    if store.delete_if_equals(key, owner_token).await? {
        debug!("Released lock '{}'", key);
    } else {
        debug!("Lock '{}' not released: not held by {}", key, owner_token);
    }
    Ok(())
}

/// Unconditionally deletes the lock. Only used once a heartbeat has shown
/// the current holder to be dead.
pub async fn force_delete<S: CoordinationStore>(store: &S, key: &str) -> Result<(), StoreError> {
    if store.del(key).await? {
        warn!("Force-deleted lock '{}'", key);
    }
    Ok(())
}
