use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::{SEGMENT_HEADER_SIZE, SEGMENT_TRAILER_SIZE};
use crate::error::{Error, Result};
use crate::types::{Kind, LeaseLock, Payload, Pool, Record, Reusable, Table, Variant};

/// Sentinel `expired_at` for entries that never expire.
pub const IMMORTAL: i64 = -1;

static POOL: Pool<Segment> = Pool::new();

/// Microseconds since the unix epoch.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// One self-describing on-disk record.
///
/// ```text
/// | tombstone:1 | kind:1 | expired_at:8 | created_at:8 |
/// | key_size:4  | value_size:4 | key | value | crc32:4 |
/// ```
///
/// A segment created through [`Segment::new`] holds the plain serialized
/// payload; the store runs it through the value pipeline when framing it
/// for disk, and a fetched segment comes back pipeline-decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub tombstone: bool,
    pub kind: Kind,
    pub expired_at: i64,
    pub created_at: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            tombstone: false,
            kind: Kind::Unknown,
            expired_at: 0,
            created_at: 0,
            key: Vec::new(),
            value: Vec::new(),
        }
    }
}

impl Segment {
    /// A live segment holding `data`, expiring `ttl` seconds from now.
    /// A non-positive ttl means the segment never expires.
    pub fn new<T: Payload>(key: &str, data: &T, ttl: i64) -> Result<Self> {
        let created_at = now_micros();
        let expired_at = if ttl > 0 {
            created_at + ttl * 1_000_000
        } else {
            IMMORTAL
        };

        Ok(Self {
            tombstone: false,
            kind: data.kind(),
            expired_at,
            created_at,
            key: key.as_bytes().to_vec(),
            value: data.to_bytes()?,
        })
    }

    /// Like [`Segment::new`] but reusing a pooled segment's allocations.
    pub fn acquire<T: Payload>(key: &str, data: &T, ttl: i64) -> Result<Self> {
        let mut seg = POOL.acquire();
        let created_at = now_micros();

        seg.tombstone = false;
        seg.kind = data.kind();
        seg.created_at = created_at;
        seg.expired_at = if ttl > 0 {
            created_at + ttl * 1_000_000
        } else {
            IMMORTAL
        };
        seg.key.extend_from_slice(key.as_bytes());
        match data.to_bytes() {
            Ok(bytes) => seg.value = bytes,
            Err(e) => {
                seg.release();
                return Err(e);
            }
        }
        Ok(seg)
    }

    /// Return this segment to the object pool.
    pub fn release(self) {
        POOL.release(self);
    }

    /// A deletion marker for `key`: empty value, kind Unknown, no expiry.
    pub fn new_tombstone(key: &str) -> Self {
        Self {
            tombstone: true,
            kind: Kind::Unknown,
            expired_at: 0,
            created_at: now_micros(),
            key: key.as_bytes().to_vec(),
            value: Vec::new(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Whole-record byte length including header, key, value and CRC.
    pub fn size(&self) -> u32 {
        (SEGMENT_HEADER_SIZE + self.key.len() + self.value.len() + SEGMENT_TRAILER_SIZE) as u32
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expired_at > 0 && self.expired_at <= now
    }

    /// Remaining lifetime in whole seconds: `None` once expired,
    /// `Some(IMMORTAL)` for entries without expiry.
    pub fn remaining_ttl(&self, now: i64) -> Option<i64> {
        if self.expired_at <= 0 {
            return Some(IMMORTAL);
        }
        let left = (self.expired_at - now) / 1_000_000;
        if left > 0 {
            Some(left)
        } else {
            None
        }
    }

    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.as_str()
    }

    // The same header and key with a different value, used when swapping
    // the plain payload for its pipeline-encoded form.
    pub(crate) fn with_value(&self, value: Vec<u8>) -> Segment {
        Segment {
            value,
            key: self.key.clone(),
            ..*self
        }
    }

    pub fn to_table(&self) -> Result<Table> {
        self.check_kind(Kind::Table)?;
        Table::from_bytes(&self.value)
    }

    pub fn to_record(&self) -> Result<Record> {
        self.check_kind(Kind::Record)?;
        Record::from_bytes(&self.value)
    }

    pub fn to_variant(&self) -> Result<Variant> {
        self.check_kind(Kind::Variant)?;
        Variant::from_bytes(&self.value)
    }

    pub fn to_lease(&self) -> Result<LeaseLock> {
        self.check_kind(Kind::LeaseLock)?;
        LeaseLock::from_bytes(&self.value)
    }

    /// JSON rendering of the payload, dispatched on the kind byte.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        match self.kind {
            Kind::Table => self.to_table()?.to_json(),
            Kind::Record => self.to_record()?.to_json(),
            Kind::Variant => self.to_variant()?.to_json(),
            Kind::LeaseLock => self.to_lease()?.to_json(),
            Kind::Unknown => Err(Error::InvalidInput(
                "cannot render an unknown kind as JSON".to_string(),
            )),
        }
    }

    fn check_kind(&self, wanted: Kind) -> Result<()> {
        if self.kind != wanted {
            return Err(Error::InvalidInput(format!(
                "segment holds a {}, not a {}",
                self.kind.as_str(),
                wanted.as_str()
            )));
        }
        Ok(())
    }
}

impl Reusable for Segment {
    fn clear(&mut self) {
        self.tombstone = false;
        self.kind = Kind::Unknown;
        self.expired_at = 0;
        self.created_at = 0;
        self.key.clear();
        self.value.clear();
    }
}
