use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::codec::{self, DATA_FILE_MAGIC};
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Cadence, Context};
use crate::store::index::ShardedIndex;
use crate::store::region::RegionStore;
use crate::store::segment::{now_micros, Segment, IMMORTAL};

pub(crate) const TASK_NAME: &str = "compactor";

// How many of the oldest regions one compaction pass reclaims.
const DIRTY_REGIONS_PER_RUN: usize = 4;

// At least this many regions must exist before compaction is worth it.
const MIN_REGIONS_FOR_COMPACTION: usize = 5;

/// Observable state of the region compactor. Never a substitute for a
/// lock; purely for introspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcState {
    Init = 0,
    Active = 1,
    Inactive = 2,
}

impl GcState {
    pub(crate) fn from_u8(byte: u8) -> GcState {
        match byte {
            1 => GcState::Active,
            2 => GcState::Inactive,
            _ => GcState::Init,
        }
    }
}

/// Cron-scheduled space reclamation.
///
/// Picks the four oldest regions, forward-scans their segments, copies
/// every still-current one to the active region, relocates its inode,
/// and finally deletes the drained region file.
pub(crate) struct Compactor {
    regions: Arc<RegionStore>,
    index: Arc<ShardedIndex>,
    state: Arc<AtomicU8>,
    cadence: Cadence,
}

impl Compactor {
    pub(crate) fn new(
        regions: Arc<RegionStore>,
        index: Arc<ShardedIndex>,
        state: Arc<AtomicU8>,
        cadence: Cadence,
    ) -> Self {
        Self {
            regions,
            index,
            state,
            cadence,
        }
    }

    pub(crate) fn run_once(&self) -> Result<()> {
        self.state.store(GcState::Active as u8, Ordering::SeqCst);
        let result = self.compact();
        self.state.store(GcState::Inactive as u8, Ordering::SeqCst);
        result
    }

    fn compact(&self) -> Result<()> {
        if self.regions.region_count() < MIN_REGIONS_FOR_COMPACTION {
            tracing::warn!(
                regions = self.regions.region_count(),
                "Too few regions to compact"
            );
            return Ok(());
        }

        let active_id = self.regions.active_id();
        let dirty: Vec<i64> = self
            .regions
            .region_ids()
            .into_iter()
            .filter(|id| *id != active_id)
            .take(DIRTY_REGIONS_PER_RUN)
            .collect();

        let mut migrated = 0u64;
        let mut skipped = 0u64;

        for region_id in &dirty {
            self.drain_region(*region_id, &mut migrated, &mut skipped)?;
            self.regions.remove_region(*region_id)?;
        }

        tracing::info!(
            regions = dirty.len(),
            migrated,
            skipped,
            "Compaction pass completed"
        );
        Ok(())
    }

    // Copy every still-current segment out of one dirty region.
    fn drain_region(&self, region_id: i64, migrated: &mut u64, skipped: &mut u64) -> Result<()> {
        let file = match self.regions.file(region_id) {
            Some(file) => file,
            None => return Ok(()),
        };
        let file_len = file.metadata()?.len() as i64;
        let mut offset = DATA_FILE_MAGIC.len() as i64;

        while offset < file_len {
            let (inum, segment) = codec::decode_segment(&file, offset)?;
            let size = i64::from(segment.size());

            if !self.is_current(inum, &segment) {
                *skipped += 1;
                offset += size;
                continue;
            }

            // The bytes were just CRC-verified; carry them over verbatim
            // rather than re-framing the parsed segment.
            let mut raw = vec![0u8; size as usize];
            codec::read_exact_at(&file, &mut raw, offset as u64)?;
            let (new_region, new_position) = self.regions.append(&raw)?;

            // Relocate under the shard write lock, but only if the inode
            // still points at the segment we copied; a concurrent update
            // must not be rolled back.
            self.index.update(inum, |slot| {
                if let Some(inode) = slot {
                    if inode.created_at == segment.created_at && inode.region_id == region_id {
                        inode.region_id = new_region;
                        inode.position = new_position;
                    }
                }
            });

            *migrated += 1;
            offset += size;
        }

        Ok(())
    }

    // A segment survives compaction while the index still points at it.
    fn is_current(&self, inum: u64, segment: &Segment) -> bool {
        if segment.is_tombstone() {
            return false;
        }
        let now = now_micros();
        let alive = segment.expired_at == IMMORTAL || segment.expired_at == 0 || now < segment.expired_at;
        if !alive {
            return false;
        }
        match self.index.get(inum) {
            Some(inode) => inode.created_at == segment.created_at,
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for Compactor {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn cadence(&self) -> Cadence {
        self.cadence.clone()
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.run_once()
    }
}
