//! Typed values a segment can hold.
//!
//! Four live kinds (tabular rows, nested records, scalar variants and
//! lease-lock tokens), each serializing itself to compact MessagePack
//! for the data files and to JSON for callers. All four participate in
//! process-wide object pools so hot paths can recycle allocations.

pub mod lease;
pub mod pool;
pub mod record;
pub mod table;
pub mod value;
pub mod variant;

pub use lease::LeaseLock;
pub use pool::{Pool, Reusable};
pub use record::Record;
pub use table::Table;
pub use value::{deep_merge, Map, Value};
pub use variant::Variant;

use crate::error::{Error, Result};

/// Discriminant stored in a segment's `kind` byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Table = 0,
    Record = 1,
    Variant = 2,
    LeaseLock = 3,
    /// Reserved for tombstones.
    Unknown = 4,
}

impl Kind {
    pub fn from_u8(byte: u8) -> Result<Kind> {
        match byte {
            0 => Ok(Kind::Table),
            1 => Ok(Kind::Record),
            2 => Ok(Kind::Variant),
            3 => Ok(Kind::LeaseLock),
            4 => Ok(Kind::Unknown),
            other => Err(Error::Codec(format!("unknown value kind byte: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Table => "table",
            Kind::Record => "record",
            Kind::Variant => "variant",
            Kind::LeaseLock => "leaselock",
            Kind::Unknown => "unknown",
        }
    }
}

/// A value that can become a segment payload.
pub trait Payload {
    /// The kind byte recorded in the segment header.
    fn kind(&self) -> Kind;

    /// Compact binary encoding of the value.
    fn to_bytes(&self) -> Result<Vec<u8>>;
}
