use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::pool::{Pool, Reusable};
use super::value::{self, deep_merge, Map, Value};
use super::{Kind, Payload};
use crate::error::{Error, Result};

static POOL: Pool<Table> = Pool::new();

/// Tabular rows addressed by a monotonically assigned row id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    #[serde(rename = "table")]
    rows: BTreeMap<u32, Map>,
    #[serde(rename = "t_id", default)]
    next_id: u32,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared table from the object pool.
    pub fn acquire() -> Self {
        POOL.acquire()
    }

    /// Return this table to the object pool.
    pub fn release(self) {
        POOL.release(self);
    }

    /// Insert a row under a freshly assigned id and return that id.
    /// The first row of a new table gets id 1.
    pub fn add_rows(&mut self, row: Map) -> u32 {
        self.next_id += 1;
        self.rows.insert(self.next_id, row);
        self.next_id
    }

    pub fn remove_rows(&mut self, id: u32) -> Option<Map> {
        self.rows.remove(&id)
    }

    pub fn get_rows(&self, id: u32) -> Option<&Map> {
        self.rows.get(&id)
    }

    /// All rows in which every predicate key is present and deep-equal.
    pub fn select_rows(&self, wheres: &Map) -> Vec<&Map> {
        self.rows
            .values()
            .filter(|row| value::matches(row, wheres))
            .collect()
    }

    /// Overwrite patch keys into matching rows.
    ///
    /// A `t_id` predicate key addresses one row directly and fails when
    /// the id is missing or not an integer; otherwise every row matching
    /// the predicate is patched.
    pub fn update_rows(&mut self, wheres: &Map, patch: &Map) -> Result<()> {
        if let Some(id_value) = wheres.get("t_id") {
            let id = id_value
                .as_i64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    Error::InvalidInput("t_id must be an unsigned 32-bit integer".to_string())
                })?;
            let row = self
                .rows
                .get_mut(&id)
                .ok_or_else(|| Error::InvalidInput(format!("no row with t_id {id}")))?;
            for (key, val) in patch {
                row.insert(key.clone(), val.clone());
            }
            return Ok(());
        }

        for row in self.rows.values_mut() {
            if value::matches(row, wheres) {
                for (key, val) in patch {
                    row.insert(key.clone(), val.clone());
                }
            }
        }
        Ok(())
    }

    /// Delete every row matching the predicate, returning how many went.
    pub fn remove_rows_where(&mut self, wheres: &Map) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, row| !value::matches(row, wheres));
        before - self.rows.len()
    }

    /// Recursively merge a patch into the row with the given id.
    pub fn deep_merge(&mut self, id: u32, patch: Map) {
        if let Some(row) = self.rows.get_mut(&id) {
            deep_merge(row, patch);
        }
    }

    pub fn size(&self) -> usize {
        self.rows.len()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Payload for Table {
    fn kind(&self) -> Kind {
        Kind::Table
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

impl Reusable for Table {
    fn clear(&mut self) {
        self.next_id = 0;
        self.rows.clear();
    }
}
