use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::scheduler::{BackgroundTask, Cadence, Context};
use crate::store::index::ShardedIndex;
use crate::store::segment::now_micros;

pub(crate) const TASK_NAME: &str = "expiry-sweeper";

/// Periodically walks every index shard under its write lock and forgets
/// entries whose expiry has elapsed. No tombstone is emitted; the dead
/// segment's bytes wait for compaction.
pub(crate) struct ExpirySweeper {
    index: Arc<ShardedIndex>,
    interval: Duration,
}

impl ExpirySweeper {
    pub(crate) fn new(index: Arc<ShardedIndex>, interval: Duration) -> Self {
        Self { index, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ExpirySweeper {
    fn name(&self) -> &'static str {
        TASK_NAME
    }

    fn cadence(&self) -> Cadence {
        Cadence::Every(self.interval)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let swept = self.index.sweep_expired(now_micros());
        if swept > 0 {
            tracing::debug!(swept, "Expiry sweep evicted entries");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::index::{inode_num, Inode};
    use crate::types::Kind;

    fn inode(expired_at: i64) -> Inode {
        Inode {
            region_id: 1,
            position: 4,
            length: 40,
            expired_at,
            created_at: 1,
            kind: Kind::Record,
            mvcc: 0,
        }
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_expired() {
        let index = Arc::new(ShardedIndex::new());
        index.insert(inode_num(b"dead"), inode(1));
        index.insert(inode_num(b"immortal"), inode(-1));
        index.insert(inode_num(b"alive"), inode(now_micros() + 60_000_000));

        let sweeper = ExpirySweeper::new(Arc::clone(&index), Duration::from_secs(120));
        sweeper
            .execute(Context {
                task_name: TASK_NAME,
                run_id: 1,
            })
            .await
            .expect("sweep");

        assert_eq!(index.len(), 2);
        assert!(index.get(inode_num(b"dead")).is_none());
        assert!(index.get(inode_num(b"immortal")).is_some());
        assert!(index.get(inode_num(b"alive")).is_some());
    }
}
