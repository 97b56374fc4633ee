use std::collections::HashMap;
use std::sync::RwLock;

use xxhash_rust::xxh3::xxh3_64;

use crate::types::Kind;

/// Number of index shards. Small enough that each shard's map stays
/// cache-friendly, large enough to keep unrelated keys off one lock.
pub const SHARD_COUNT: usize = 10;

/// The stable 64-bit inode number of a key. The same function runs on
/// both the write and the recovery path; collisions are not resolved.
pub fn inode_num(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// In-memory pointer metadata for one live key.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Inode {
    pub region_id: i64,
    pub position: i64,
    pub length: u32,
    pub expired_at: i64,
    pub created_at: i64,
    pub kind: Kind,
    pub mvcc: u64,
}

struct Shard {
    map: RwLock<HashMap<u64, Inode>>,
}

/// The hashed-key → inode mapping, split across [`SHARD_COUNT`] shards,
/// each guarded by its own reader/writer lock.
pub struct ShardedIndex {
    shards: Vec<Shard>,
}

impl ShardedIndex {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                map: RwLock::new(HashMap::new()),
            })
            .collect();
        Self { shards }
    }

    fn shard(&self, inum: u64) -> &Shard {
        &self.shards[(inum % SHARD_COUNT as u64) as usize]
    }

    pub fn get(&self, inum: u64) -> Option<Inode> {
        self.shard(inum).map.read().unwrap().get(&inum).copied()
    }

    pub fn insert(&self, inum: u64, inode: Inode) {
        self.shard(inum).map.write().unwrap().insert(inum, inode);
    }

    pub fn remove(&self, inum: u64) -> Option<Inode> {
        self.shard(inum).map.write().unwrap().remove(&inum)
    }

    /// Run `f` over the slot for `inum` under the shard's write lock.
    ///
    /// Compare-and-swap updates go through here so the version check,
    /// the region append and the in-place inode mutation all happen
    /// while the shard stays locked.
    pub fn update<R>(&self, inum: u64, f: impl FnOnce(Option<&mut Inode>) -> R) -> R {
        let mut map = self.shard(inum).map.write().unwrap();
        f(map.get_mut(&inum))
    }

    /// Visit every inode, one shard at a time under its read lock.
    pub fn for_each(&self, mut f: impl FnMut(u64, &Inode)) {
        for shard in &self.shards {
            let map = shard.map.read().unwrap();
            for (inum, inode) in map.iter() {
                f(*inum, inode);
            }
        }
    }

    /// Drop every entry whose expiry has elapsed; returns how many went.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let mut swept = 0;
        for shard in &self.shards {
            let mut map = shard.map.write().unwrap();
            let before = map.len();
            map.retain(|_, inode| !(inode.expired_at > 0 && inode.expired_at <= now));
            swept += before - map.len();
        }
        swept
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.map.read().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the on-disk lengths of all live segments.
    pub fn total_length(&self) -> u64 {
        let mut total = 0u64;
        self.for_each(|_, inode| total += u64::from(inode.length));
        total
    }
}

impl Default for ShardedIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inode(created_at: i64, expired_at: i64) -> Inode {
        Inode {
            region_id: 1,
            position: 4,
            length: 64,
            expired_at,
            created_at,
            kind: Kind::Record,
            mvcc: 0,
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let index = ShardedIndex::new();
        let inum = inode_num(b"key-01");

        assert_eq!(index.get(inum), None);
        index.insert(inum, inode(100, -1));
        assert_eq!(index.get(inum).unwrap().created_at, 100);
        assert_eq!(index.len(), 1);

        assert!(index.remove(inum).is_some());
        assert!(index.get(inum).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(inode_num(b"key-01"), inode_num(b"key-01"));
        assert_ne!(inode_num(b"key-01"), inode_num(b"key-02"));
    }

    #[test]
    fn test_update_in_place() {
        let index = ShardedIndex::new();
        let inum = inode_num(b"cas");
        index.insert(inum, inode(100, -1));

        let bumped = index.update(inum, |slot| {
            let inode = slot.expect("present");
            inode.mvcc += 1;
            inode.mvcc
        });
        assert_eq!(bumped, 1);
        assert_eq!(index.get(inum).unwrap().mvcc, 1);

        // The closure observes absence too.
        let missing = index.update(inode_num(b"ghost"), |slot| slot.is_none());
        assert!(missing);
    }

    #[test]
    fn test_sweep_expired() {
        let index = ShardedIndex::new();
        for i in 0..20i64 {
            let expired_at = if i % 2 == 0 { 50 } else { -1 };
            index.insert(inode_num(&i.to_le_bytes()), inode(10, expired_at));
        }

        assert_eq!(index.sweep_expired(100), 10);
        assert_eq!(index.len(), 10);
        // Immortal entries survive any sweep.
        assert_eq!(index.sweep_expired(i64::MAX), 0);
    }

    #[test]
    fn test_total_length() {
        let index = ShardedIndex::new();
        index.insert(1, inode(1, -1));
        index.insert(2, inode(1, -1));
        assert_eq!(index.total_length(), 128);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;

        let index = Arc::new(ShardedIndex::new());
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    let inum = t * 1_000 + i;
                    index.insert(inum, inode(inum as i64, -1));
                    assert!(index.get(inum).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(index.len(), 800);
    }
}
