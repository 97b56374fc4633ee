use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::scheduler::{BackgroundTask, Cadence, Context};
use crate::store::index::ShardedIndex;
use crate::store::recovery::{
    self, parse_checkpoint_file_name, CHECKPOINT_EXTENSION, CHECKPOINT_TMP_EXTENSION,
};
use crate::store::region::RegionStore;

pub(crate) const TASK_NAME: &str = "checkpointer";

/// Periodically freezes the index into `ckpt.<secs>.<region>.ids`.
///
/// The records stream into a `.tmp` file under per-shard read locks and
/// an atomic rename publishes it; only the newest checkpoint survives.
/// Runs only while at least two regions exist, and an `in_progress`
/// flag keeps slow runs from overlapping.
pub(crate) struct Checkpointer {
    dir: PathBuf,
    regions: Arc<RegionStore>,
    index: Arc<ShardedIndex>,
    interval: Duration,
    in_progress: AtomicBool,
}

impl Checkpointer {
    pub(crate) fn new(
        dir: PathBuf,
        regions: Arc<RegionStore>,
        index: Arc<ShardedIndex>,
        interval: Duration,
    ) -> Self {
        Self {
            dir,
            regions,
            index,
            interval,
            in_progress: AtomicBool::new(false),
        }
    }

    pub(crate) fn run_once(&self) -> Result<()> {
        if self.regions.region_count() < 2 {
            tracing::debug!(
                regions = self.regions.region_count(),
                "Too few regions for a checkpoint"
            );
            return Ok(());
        }

        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.write_checkpoint();
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn write_checkpoint(&self) -> Result<()> {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let region_id = self.regions.active_id();

        let stem = format!("ckpt.{seconds}.{region_id}");
        let tmp_path = self.dir.join(format!("{stem}.{CHECKPOINT_TMP_EXTENSION}"));
        let final_path = self.dir.join(format!("{stem}.{CHECKPOINT_EXTENSION}"));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        recovery::write_index_file(&mut file, &self.index)?;
        drop(file);

        std::fs::rename(&tmp_path, &final_path)?;
        tracing::info!(checkpoint = %final_path.display(), "Generated checkpoint");

        cleanup_stale_checkpoints(&self.dir, &final_path)?;
        Ok(())
    }
}

/// Delete every `.ids` other than the one just published, plus any
/// leftover `.tmp` from interrupted runs.
fn cleanup_stale_checkpoints(dir: &Path, keep: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        let is_stale_ids = parse_checkpoint_file_name(&name).is_some() && path != keep;
        let is_tmp = name.starts_with("ckpt.")
            && path
                .extension()
                .is_some_and(|ext| ext == CHECKPOINT_TMP_EXTENSION);

        if is_stale_ids || is_tmp {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(file = %path.display(), error = %e, "Failed to delete stale checkpoint");
            }
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl BackgroundTask for Checkpointer {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn cadence(&self) -> Cadence {
        Cadence::Every(self.interval)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.run_once()
    }
}
