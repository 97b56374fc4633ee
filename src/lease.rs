//! Lease locks: named, token-guarded, TTL-bound mutual exclusion built
//! on the store's segment operations.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::store::{Segment, Store};
use crate::types::LeaseLock;

// Renewal falls back to this when the stored lease carries no expiry.
const DEFAULT_RENEW_TTL: i64 = 10;

/// Hands out and verifies lease locks.
///
/// Every lock name gets its own mutex, created lazily in a concurrent
/// map, so contention on one name never serializes operations on
/// another name or on unrelated keys sharing an index shard.
pub struct LeaseManager {
    store: Arc<Store>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LeaseManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            name_locks: DashMap::new(),
        }
    }

    /// Acquire the named lock for `ttl` seconds (forever when zero).
    /// Returns the token that alone can release or renew it.
    pub fn acquire(&self, name: &str, ttl: i64) -> Result<LeaseLock> {
        if ttl < 0 {
            return Err(Error::InvalidInput(
                "lock lifetime must not be negative".to_string(),
            ));
        }
        if self.store.has(name) {
            return Err(Error::Locked(name.to_string()));
        }

        let cell = self.name_lock(name);
        let _guard = cell.lock().unwrap();

        // A racing acquire may have slipped in before we took the mutex.
        if self.store.has(name) {
            return Err(Error::Locked(name.to_string()));
        }

        let lease = LeaseLock::acquire();
        let seg = Segment::acquire(name, &lease, ttl)?;
        let stored = self.store.put(name, &seg);
        seg.release();
        stored?;

        Ok(lease)
    }

    /// Release the named lock. Only the exact token that acquired (or
    /// last renewed) it is accepted.
    pub fn release(&self, name: &str, token: &str) -> Result<()> {
        if !self.store.has(name) {
            return Err(Error::NotFound(format!("no lock named {name:?}")));
        }

        let cell = self.name_lock(name);
        let _guard = cell.lock().unwrap();

        let (_, seg) = self.store.fetch(name)?;
        let held = seg.to_lease()?;
        if held.token() != token {
            return Err(Error::InvalidToken);
        }

        self.store.delete(name)
    }

    /// Renew the named lock, sliding its expiry window forward by the
    /// TTL it was acquired with. Returns a fresh token; the old one
    /// stops working.
    pub fn renew(&self, name: &str, token: &str) -> Result<LeaseLock> {
        if !self.store.has(name) {
            return Err(Error::NotFound(format!("no lock named {name:?}")));
        }

        let cell = self.name_lock(name);
        let _guard = cell.lock().unwrap();

        let (_, seg) = self.store.fetch(name)?;
        let held = seg.to_lease()?;
        if held.token() != token {
            return Err(Error::InvalidToken);
        }

        let ttl = if seg.expired_at > 0 {
            (seg.expired_at - seg.created_at) / 1_000_000
        } else {
            DEFAULT_RENEW_TTL
        };

        let lease = LeaseLock::acquire();
        let newseg = Segment::acquire(name, &lease, ttl)?;
        let stored = self.store.put(name, &newseg);
        newseg.release();
        stored?;

        Ok(lease)
    }

    // Entries are never removed: a name must always resolve to the one
    // mutex every racing caller serializes on. Dropping an entry after
    // release would let one acquirer keep the old mutex while another
    // creates a fresh one, and both could then hold the same name. The
    // cost of keeping them is one Arc'd Mutex per distinct name.
    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.name_locks
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}
