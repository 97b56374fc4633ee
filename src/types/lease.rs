use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::pool::{Pool, Reusable};
use super::{Kind, Payload};
use crate::error::Result;

static POOL: Pool<LeaseLock> = Pool::new();

/// A lease lock's stored value: one opaque token.
///
/// The token is a 26-character ULID (48-bit millisecond timestamp plus
/// 80 bits of randomness, Crockford base-32), so tokens sort by creation
/// time and collide only with negligible probability. Unlocking requires
/// presenting the exact token that acquired the lock.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseLock {
    token: String,
}

impl LeaseLock {
    /// A lease lock with a freshly generated token.
    pub fn new() -> Self {
        Self {
            token: Ulid::new().to_string(),
        }
    }

    /// Take a lease lock from the object pool. The memory is recycled but
    /// the token is always newly generated.
    pub fn acquire() -> Self {
        let mut lock = POOL.acquire();
        lock.token = Ulid::new().to_string();
        lock
    }

    /// Return this lease lock to the object pool.
    pub fn release(self) {
        POOL.release(self);
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Payload for LeaseLock {
    fn kind(&self) -> Kind {
        Kind::LeaseLock
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

impl Reusable for LeaseLock {
    fn clear(&mut self) {
        self.token.clear();
    }
}
