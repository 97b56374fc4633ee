use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::flock::DirLock;
use crate::pipeline::{AesCbcEncryptor, SnappyCompressor, Transformer};
use crate::scheduler::{Cadence, Scheduler};
use crate::store::checkpoint::{self, Checkpointer};
use crate::store::compaction::{self, Compactor, GcState};
use crate::store::expiry::ExpirySweeper;
use crate::store::index::{inode_num, Inode, ShardedIndex};
use crate::store::recovery::{self, INDEX_FILE_NAME};
use crate::store::region::RegionStore;
use crate::store::segment::{now_micros, Segment};

/// The persistent key-value store: an append-only region log, a sharded
/// in-memory index, the value pipeline, and the background workers that
/// sweep, checkpoint and compact it.
pub struct Store {
    config: StoreConfig,
    _lock: DirLock,
    transformer: Arc<Transformer>,
    regions: Arc<RegionStore>,
    index: Arc<ShardedIndex>,
    scheduler: Scheduler,
    gc_state: Arc<AtomicU8>,
}

impl Store {
    /// Open (and if necessary recover) the store described by `config`.
    ///
    /// Recovery is single-threaded: regions are adopted first, then the
    /// index is rebuilt from the best available source before any
    /// operation is admitted. When called inside a tokio runtime the
    /// expiry sweeper starts immediately.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        recovery::prepare_directory(&config.dir, config.dir_mode)?;
        let lock = DirLock::acquire(&config.dir)?;

        let mut transformer = Transformer::new();
        if config.compression {
            transformer = transformer.with_compressor(Box::new(SnappyCompressor));
        }
        if let Some(key) = &config.encryption_key {
            transformer = transformer.with_encryptor(Box::new(AesCbcEncryptor), key.clone())?;
        }

        let regions = Arc::new(RegionStore::open(
            &config.dir,
            config.dir_mode,
            config.threshold(),
        )?);

        let index = Arc::new(ShardedIndex::new());
        recovery::recover_index(&config.dir, &regions, &index)?;

        let store = Self {
            _lock: lock,
            transformer: Arc::new(transformer),
            regions,
            index,
            scheduler: Scheduler::new(),
            gc_state: Arc::new(AtomicU8::new(GcState::Init as u8)),
            config,
        };

        if tokio::runtime::Handle::try_current().is_ok() {
            store.scheduler.register(Arc::new(ExpirySweeper::new(
                Arc::clone(&store.index),
                store.config.expiry_interval,
            )));
        } else {
            tracing::warn!("No async runtime at open; expiry sweeper not started");
        }

        Ok(store)
    }

    /// Serialize a segment, append it to the active region, then point
    /// the key's inode at the new position. Overwriting a key resets its
    /// version counter.
    pub fn put(&self, key: &str, seg: &Segment) -> Result<()> {
        let inum = inode_num(key.as_bytes());

        let payload = self.transformer.encode(&seg.value)?;
        let disk = seg.with_value(payload);
        let framed = codec::encode_segment(&disk)?;

        let (region_id, position) = self.regions.append(&framed)?;
        self.index.insert(
            inum,
            Inode {
                region_id,
                position,
                length: framed.len() as u32,
                expired_at: disk.expired_at,
                created_at: disk.created_at,
                kind: disk.kind,
                mvcc: 0,
            },
        );

        Ok(())
    }

    /// Look up a key and read its segment back, CRC-verified and
    /// pipeline-decoded. Returns the inode's current mvcc alongside.
    /// An entry whose expiry has elapsed is evicted and reads as
    /// [`Error::Expired`].
    pub fn fetch(&self, key: &str) -> Result<(u64, Segment)> {
        let inum = inode_num(key.as_bytes());
        let inode = self
            .index
            .get(inum)
            .ok_or_else(|| Error::NotFound(format!("no entry for key {key:?}")))?;

        if inode.expired_at > 0 && inode.expired_at <= now_micros() {
            self.index.remove(inum);
            return Err(Error::Expired(format!("entry for key {key:?} expired")));
        }

        let file = self.regions.file(inode.region_id).ok_or_else(|| {
            Error::NotFound(format!("region {} for key {key:?}", inode.region_id))
        })?;

        let (_, disk) = codec::decode_segment(&file, inode.position)?;
        let value = self.transformer.decode(&disk.value)?;

        Ok((inode.mvcc, disk.with_value(value)))
    }

    /// Fetch several keys in order, stopping at the first failure. No
    /// atomicity across the batch.
    pub fn batch_fetch(&self, keys: &[&str]) -> Result<Vec<(u64, Segment)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.fetch(key)?);
        }
        Ok(out)
    }

    /// Append a tombstone and forget the key. Deleting an absent key is
    /// a no-op that still logs the tombstone.
    pub fn delete(&self, key: &str) -> Result<()> {
        let tomb = Segment::new_tombstone(key);
        let framed = codec::encode_segment(&tomb)?;
        self.regions.append(&framed)?;

        self.index.remove(inode_num(key.as_bytes()));
        Ok(())
    }

    /// Whether a live entry exists for the key. Entries without expiry
    /// are always present.
    pub fn has(&self, key: &str) -> bool {
        match self.index.get(inode_num(key.as_bytes())) {
            Some(inode) => inode.expired_at <= 0 || now_micros() < inode.expired_at,
            None => false,
        }
    }

    /// Replace a key's segment only if its version counter still equals
    /// `expected`. The check, the append and the in-place inode update
    /// all happen under the shard write lock, so exactly one of any set
    /// of racing writers with the same witness can win.
    pub fn update_cas(&self, key: &str, expected: u64, seg: &Segment) -> Result<()> {
        if seg.is_expired(now_micros()) {
            return Err(Error::Expired(
                "cannot insert an already expired segment".to_string(),
            ));
        }

        let payload = self.transformer.encode(&seg.value)?;
        let disk = seg.with_value(payload);
        let framed = codec::encode_segment(&disk)?;

        let inum = inode_num(key.as_bytes());
        self.index.update(inum, |slot| {
            let inode = match slot {
                Some(inode) => inode,
                None => return Err(Error::NotFound(format!("no entry for key {key:?}"))),
            };

            if inode.mvcc != expected {
                return Err(Error::VersionConflict);
            }
            if inode.mvcc == u64::MAX {
                return Err(Error::Overflow);
            }

            let (region_id, position) = self.regions.append(&framed)?;
            inode.region_id = region_id;
            inode.position = position;
            inode.length = framed.len() as u32;
            inode.expired_at = disk.expired_at;
            inode.created_at = disk.created_at;
            inode.kind = disk.kind;
            inode.mvcc += 1;

            Ok(())
        })
    }

    /// Export the whole index as `index.db`: magic, then one CRC-framed
    /// record per live inode, synced before returning. Runs under shard
    /// read locks only.
    pub fn export_snapshot_index(&self) -> Result<()> {
        let path = self.config.dir.join(INDEX_FILE_NAME);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        recovery::write_index_file(&mut file, &self.index)
    }

    /// Start the checkpoint worker with the given period. Does nothing
    /// if it is already running.
    pub fn run_checkpoint(&self, period: Duration) {
        self.scheduler.register(Arc::new(Checkpointer::new(
            self.config.dir.clone(),
            Arc::clone(&self.regions),
            Arc::clone(&self.index),
            period,
        )));
    }

    pub fn stop_checkpoint(&self) {
        self.scheduler.stop(checkpoint::TASK_NAME);
    }

    /// Start the compactor on a seconds-granularity cron schedule,
    /// e.g. `0 0 3 * * *` for daily at 03:00.
    pub fn run_compactor(&self, cron_expr: &str) -> Result<()> {
        let cadence = Cadence::cron(cron_expr)?;
        self.scheduler.register(Arc::new(Compactor::new(
            Arc::clone(&self.regions),
            Arc::clone(&self.index),
            Arc::clone(&self.gc_state),
            cadence,
        )));
        Ok(())
    }

    pub fn stop_compactor(&self) {
        self.scheduler.stop(compaction::TASK_NAME);
    }

    /// Run one compaction pass right now, regardless of schedule.
    pub fn compact_now(&self) -> Result<()> {
        Compactor::new(
            Arc::clone(&self.regions),
            Arc::clone(&self.index),
            Arc::clone(&self.gc_state),
            Cadence::Every(Duration::from_secs(3600)),
        )
        .run_once()
    }

    pub fn gc_state(&self) -> GcState {
        GcState::from_u8(self.gc_state.load(Ordering::SeqCst))
    }

    /// Number of live keys.
    pub fn inode_count(&self) -> usize {
        self.index.len()
    }

    /// Total on-disk bytes of all live segments.
    pub fn total_space_used(&self) -> u64 {
        self.index.total_length()
    }

    pub fn directory(&self) -> &std::path::Path {
        &self.config.dir
    }

    /// Stop every worker, sync all regions and export the index
    /// snapshot. A sync failure still attempts the export and surfaces
    /// both errors joined. The directory lock is released when the
    /// store drops on return.
    pub async fn close(self) -> Result<()> {
        self.scheduler.shutdown().await;

        let synced = self.regions.sync_all();
        let exported = self.export_snapshot_index();

        match (synced, exported) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(sync_err), Ok(())) => Err(sync_err),
            (Ok(()), Err(export_err)) => Err(export_err),
            (Err(sync_err), Err(export_err)) => Err(Error::Io(format!(
                "close failed: {sync_err}; snapshot export failed: {export_err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Map, Record, Table, Value, Variant};
    use tempfile::TempDir;

    fn open_store(dir: &std::path::Path) -> Store {
        Store::open(StoreConfig::new(dir)).expect("Failed to open store")
    }

    fn record(n: i64) -> Record {
        let mut rec = Record::new();
        rec.set("n", Value::Int(n));
        rec
    }

    fn row(entries: &[(&str, Value)]) -> Map {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_table_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());

        let mut table = Table::new();
        table.add_rows(row(&[
            ("active", Value::Bool(true)),
            ("age", Value::Int(25)),
            ("name", "Alice".into()),
        ]));
        table.add_rows(row(&[
            ("active", Value::Bool(false)),
            ("age", Value::Int(30)),
            ("name", "Bob".into()),
        ]));
        table.add_rows(Map::new());

        let seg = Segment::new("key-01", &table, 0).expect("segment");
        store.put("key-01", &seg).expect("put");

        let (mvcc, fetched) = store.fetch("key-01").expect("fetch");
        assert_eq!(mvcc, 0);

        let back = fetched.to_table().expect("table");
        assert_eq!(back, table);
        assert_eq!(back.size(), 3);
        assert_eq!(back.next_id(), 3);

        let json: serde_json::Value =
            serde_json::from_slice(&fetched.to_json().expect("json")).expect("parse");
        assert_eq!(json["table"]["1"]["name"], serde_json::json!("Alice"));
    }

    #[tokio::test]
    async fn test_fetch_missing_key() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());
        assert!(matches!(store.fetch("ghost"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_overwrite_resets_mvcc() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());

        store
            .put("k", &Segment::new("k", &record(1), 0).expect("segment"))
            .expect("put");
        store
            .update_cas("k", 0, &Segment::new("k", &record(2), 0).expect("segment"))
            .expect("cas");
        assert_eq!(store.fetch("k").expect("fetch").0, 1);

        store
            .put("k", &Segment::new("k", &record(3), 0).expect("segment"))
            .expect("put");
        assert_eq!(store.fetch("k").expect("fetch").0, 0);
    }

    #[tokio::test]
    async fn test_cas_semantics() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());

        store
            .put("k", &Segment::new("k", &record(1), 0).expect("segment"))
            .expect("put");

        // Wrong witness loses.
        let stale = store.update_cas("k", 7, &Segment::new("k", &record(2), 0).unwrap());
        assert_eq!(stale, Err(Error::VersionConflict));

        // Right witness wins and bumps the counter.
        store
            .update_cas("k", 0, &Segment::new("k", &record(2), 0).unwrap())
            .expect("cas");
        let (mvcc, seg) = store.fetch("k").expect("fetch");
        assert_eq!(mvcc, 1);
        assert_eq!(seg.to_record().unwrap(), record(2));

        // Absent keys cannot be CAS-updated.
        let missing = store.update_cas("ghost", 0, &Segment::new("ghost", &record(1), 0).unwrap());
        assert!(matches!(missing, Err(Error::NotFound(_))));

        // An already expired replacement is refused outright.
        let mut dead = Segment::new("k", &record(3), 10).unwrap();
        dead.expired_at = 1;
        assert!(matches!(
            store.update_cas("k", 1, &dead),
            Err(Error::Expired(_))
        ));
    }

    #[tokio::test]
    async fn test_cas_exactly_one_winner_under_contention() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(open_store(dir.path()));

        store
            .put("key", &Segment::new("key", &record(0), 0).expect("segment"))
            .expect("put");
        let (mvcc, _) = store.fetch("key").expect("fetch");
        assert_eq!(mvcc, 0);

        let mut handles = Vec::new();
        for i in 0..50i64 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let seg = Segment::new("key", &record(i), 0).expect("segment");
                store.update_cas("key", 0, &seg)
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.join().expect("thread") {
                Ok(()) => wins += 1,
                Err(Error::VersionConflict) => conflicts += 1,
                Err(other) => panic!("unexpected CAS error: {other:?}"),
            }
        }

        assert_eq!(wins, 1);
        assert_eq!(conflicts, 49);
        assert_eq!(store.fetch("key").expect("fetch").0, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());

        store
            .put("k", &Segment::new("k", &record(1), 0).expect("segment"))
            .expect("put");
        assert!(store.has("k"));

        store.delete("k").expect("delete");
        assert!(!store.has("k"));
        assert!(matches!(store.fetch("k"), Err(Error::NotFound(_))));

        // Deleting again, or deleting something never written, is fine.
        store.delete("k").expect("delete again");
        store.delete("never-existed").expect("delete absent");
    }

    #[tokio::test]
    async fn test_has_immortal_and_ttl() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());

        store
            .put("forever", &Segment::new("forever", &record(1), 0).unwrap())
            .expect("put");
        store
            .put("brief", &Segment::new("brief", &record(2), 1).unwrap())
            .expect("put");

        assert!(store.has("forever"));
        assert!(store.has("brief"));
        assert!(!store.has("ghost"));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.has("forever"));
        assert!(!store.has("brief"));
    }

    #[tokio::test]
    async fn test_expired_fetch_evicts() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());

        store
            .put("brief", &Segment::new("brief", &record(1), 1).unwrap())
            .expect("put");
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(matches!(store.fetch("brief"), Err(Error::Expired(_))));
        // The eviction happened; a second fetch sees plain absence.
        assert!(matches!(store.fetch("brief"), Err(Error::NotFound(_))));
        assert_eq!(store.inode_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_fetch_stops_at_first_error() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());

        store
            .put("a", &Segment::new("a", &record(1), 0).unwrap())
            .expect("put");
        store
            .put("b", &Segment::new("b", &record(2), 0).unwrap())
            .expect("put");

        let both = store.batch_fetch(&["a", "b"]).expect("batch");
        assert_eq!(both.len(), 2);
        assert_eq!(both[1].1.to_record().unwrap(), record(2));

        assert!(matches!(
            store.batch_fetch(&["a", "ghost", "b"]),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_durability_across_close_and_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let store = open_store(dir.path());
        store
            .put("k", &Segment::new("k", &record(42), 0).unwrap())
            .expect("put");
        store.close().await.expect("close");

        let store = open_store(dir.path());
        let (mvcc, seg) = store.fetch("k").expect("fetch after reopen");
        assert_eq!(mvcc, 0);
        assert_eq!(seg.to_record().unwrap(), record(42));
    }

    #[tokio::test]
    async fn test_crash_recovery_replays_the_log() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let store = open_store(dir.path());
            for i in 0..1000i64 {
                let key = format!("key-{i}");
                store
                    .put(&key, &Segment::new(&key, &record(i), 0).unwrap())
                    .expect("put");
            }
            for i in 0..200i64 {
                store.delete(&format!("key-{i}")).expect("delete");
            }
            // Dropped without close: no snapshot is exported.
        }

        let store = open_store(dir.path());
        assert_eq!(store.inode_count(), 800);
        for i in 0..1000i64 {
            let key = format!("key-{i}");
            if i < 200 {
                assert!(!store.has(&key));
            } else {
                assert_eq!(
                    store.fetch(&key).expect("fetch").1.to_record().unwrap(),
                    record(i)
                );
            }
        }
    }

    #[tokio::test]
    async fn test_encrypted_store_hides_and_restores_payload() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = StoreConfig::new(dir.path())
            .encryption_key(*b"0123456789abcdef")
            .compression(true);

        let phrase = "very secret phrase that must not hit the disk";
        {
            let store = Store::open(config.clone()).expect("open");
            let seg = Segment::new("s", &Variant::new(phrase), 0).unwrap();
            store.put("s", &seg).expect("put");

            // The raw region bytes never contain the plaintext.
            let raw = std::fs::read(dir.path().join("0000000001.db")).expect("read region");
            assert!(!raw
                .windows(phrase.len())
                .any(|window| window == phrase.as_bytes()));

            let (_, fetched) = store.fetch("s").expect("fetch");
            assert_eq!(fetched.to_variant().unwrap().as_str().unwrap(), phrase);
            store.close().await.expect("close");
        }

        // The same configuration reopens and reads it back.
        let store = Store::open(config).expect("reopen");
        let (_, fetched) = store.fetch("s").expect("fetch");
        assert_eq!(fetched.to_variant().unwrap().as_str().unwrap(), phrase);
    }

    #[tokio::test]
    async fn test_wrong_pipeline_is_an_error_not_garbage() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let store = Store::open(
                StoreConfig::new(dir.path()).encryption_key(*b"0123456789abcdef"),
            )
            .expect("open");
            store
                .put("k", &Segment::new("k", &record(1), 0).unwrap())
                .expect("put");
            store.close().await.expect("close");
        }

        // Reopening without the key leaves the payload as ciphertext,
        // which the typed decode rejects.
        let store = open_store(dir.path());
        let (_, seg) = store.fetch("k").expect("fetch");
        assert!(matches!(seg.to_record(), Err(Error::Codec(_))));
    }

    #[tokio::test]
    async fn test_compaction_end_to_end() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = StoreConfig::new(dir.path()).threshold_bytes(256);
        let store = Store::open(config).expect("open");

        for round in 0..2 {
            for i in 0..20i64 {
                if round == 0 || i % 2 == 0 {
                    let key = format!("key-{i}");
                    let seg = Segment::new(&key, &record(i + round * 100), 0).unwrap();
                    store.put(&key, &seg).expect("put");
                }
            }
        }
        let regions_before = {
            let mut ids: Vec<_> = std::fs::read_dir(dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| crate::store::region::parse_region_file_name(n).is_some())
                .collect();
            ids.sort();
            ids
        };
        assert!(regions_before.len() >= 5);

        store.compact_now().expect("compact");
        assert_eq!(store.gc_state(), GcState::Inactive);

        for i in 0..20i64 {
            let expected = if i % 2 == 0 { i + 100 } else { i };
            let (_, seg) = store.fetch(&format!("key-{i}")).expect("fetch");
            assert_eq!(seg.to_record().unwrap(), record(expected));
        }
        for name in regions_before.iter().take(4) {
            assert!(!dir.path().join(name).exists());
        }
    }

    #[tokio::test]
    async fn test_checkpoint_worker_lifecycle() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = StoreConfig::new(dir.path()).threshold_bytes(256);
        let store = Store::open(config).expect("open");

        for i in 0..20i64 {
            let key = format!("key-{i}");
            store
                .put(&key, &Segment::new(&key, &record(i), 0).unwrap())
                .expect("put");
        }

        store.run_checkpoint(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        store.stop_checkpoint();

        let checkpoints: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| recovery::parse_checkpoint_file_name(n).is_some())
            .collect();
        assert_eq!(checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_second_open_is_refused_while_locked() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());

        assert!(Store::open(StoreConfig::new(dir.path())).is_err());

        drop(store);
        let _reopened = open_store(dir.path());
    }

    #[tokio::test]
    async fn test_space_stats() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = open_store(dir.path());
        assert_eq!(store.total_space_used(), 0);

        store
            .put("k", &Segment::new("k", &record(1), 0).unwrap())
            .expect("put");
        assert_eq!(store.inode_count(), 1);
        assert!(store.total_space_used() > 0);
    }
}
