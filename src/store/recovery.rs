use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::codec::{self, DATA_FILE_MAGIC, INDEX_RECORD_SIZE};
use crate::error::{Error, Result};
use crate::store::index::ShardedIndex;
use crate::store::region::{parse_region_file_name, RegionStore};
use crate::store::segment::now_micros;

pub(crate) const INDEX_FILE_NAME: &str = "index.db";
pub(crate) const CHECKPOINT_EXTENSION: &str = "ids";
pub(crate) const CHECKPOINT_TMP_EXTENSION: &str = "tmp";

/// Ensure the store directory exists and every data, snapshot and
/// checkpoint file in it carries the expected magic.
pub(crate) fn prepare_directory(dir: &Path, mode: u32) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_data = parse_region_file_name(&name).is_some();
        let is_index = name == INDEX_FILE_NAME;
        let is_checkpoint = parse_checkpoint_file_name(&name).is_some();

        if is_data || is_index || is_checkpoint {
            validate_file_header(&entry.path())?;
        }
    }

    Ok(())
}

fn validate_file_header(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 4];
    file.read_exact(&mut header).map_err(|_| {
        Error::Truncated(format!("{} is too short to carry a header", path.display()))
    })?;

    if header != DATA_FILE_MAGIC {
        return Err(Error::Codec(format!(
            "unsupported file header in {}",
            path.display()
        )));
    }
    Ok(())
}

/// Rebuild the in-memory index using the first strategy that applies:
/// snapshot file, newest checkpoint plus a forward scan, or a full scan
/// of every region. Runs single-threaded before the store goes live.
pub(crate) fn recover_index(
    dir: &Path,
    regions: &RegionStore,
    index: &ShardedIndex,
) -> Result<()> {
    let snapshot = dir.join(INDEX_FILE_NAME);
    if snapshot.exists() {
        load_index_file(&snapshot, index)?;
        // A snapshot only describes the moment it was exported. Drop it
        // so a later crash cannot resurrect stale state.
        std::fs::remove_file(&snapshot)?;
        tracing::info!(entries = index.len(), "Recovered index from snapshot");
        return Ok(());
    }

    if regions.region_count() >= 2 {
        if let Some((path, checkpoint_region)) = newest_checkpoint(dir)? {
            load_index_file(&path, index)?;
            // The checkpoint is not a point-in-time snapshot of shutdown;
            // replay every region written at or after it.
            for region_id in regions.region_ids() {
                if region_id >= checkpoint_region {
                    let file = regions.file(region_id).ok_or_else(|| {
                        Error::NotFound(format!("region {region_id} missing during recovery"))
                    })?;
                    scan_region(&file, region_id, index)?;
                }
            }
            tracing::info!(
                entries = index.len(),
                checkpoint = %path.display(),
                "Recovered index from checkpoint and forward scan"
            );
            return Ok(());
        }
    }

    for region_id in regions.region_ids() {
        let file = regions.file(region_id).ok_or_else(|| {
            Error::NotFound(format!("region {region_id} missing during recovery"))
        })?;
        scan_region(&file, region_id, index)?;
    }
    tracing::info!(entries = index.len(), "Recovered index from full region scan");
    Ok(())
}

/// Replay one region's segments into the index: tombstones evict, dead
/// entries are skipped, everything else is inserted or overwritten.
pub(crate) fn scan_region(file: &File, region_id: i64, index: &ShardedIndex) -> Result<()> {
    let file_len = file.metadata()?.len() as i64;
    let now = now_micros();
    let mut offset = DATA_FILE_MAGIC.len() as i64;

    while offset < file_len {
        let (inum, segment) = codec::decode_segment(file, offset)?;
        let size = i64::from(segment.size());

        if segment.is_tombstone() {
            index.remove(inum);
        } else if !segment.is_expired(now) {
            index.insert(
                inum,
                crate::store::index::Inode {
                    region_id,
                    position: offset,
                    length: segment.size(),
                    expired_at: segment.expired_at,
                    created_at: segment.created_at,
                    kind: segment.kind,
                    mvcc: 0,
                },
            );
        }

        offset += size;
    }

    Ok(())
}

/// Stream a snapshot or checkpoint file's fixed-width records into the
/// index, skipping entries that have already expired.
pub(crate) fn load_index_file(path: &Path, index: &ShardedIndex) -> Result<()> {
    let mut file = File::open(path)?;

    let mut header = [0u8; 4];
    file.read_exact(&mut header)?;
    if header != DATA_FILE_MAGIC {
        return Err(Error::Codec(format!(
            "unsupported file header in {}",
            path.display()
        )));
    }

    let now = now_micros();
    let mut record = [0u8; INDEX_RECORD_SIZE];
    loop {
        match file.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let (inum, inode) = codec::decode_index_record(&record)?;
        if inode.expired_at > 0 && inode.expired_at <= now {
            continue;
        }
        index.insert(inum, inode);
    }

    Ok(())
}

/// Write the magic plus one record per live inode, shard by shard under
/// read locks, then sync. Shared by snapshot export and checkpointing.
pub(crate) fn write_index_file(file: &mut File, index: &ShardedIndex) -> Result<()> {
    let written = file.write(&DATA_FILE_MAGIC)?;
    if written != DATA_FILE_MAGIC.len() {
        return Err(Error::Io("partial write of index file magic".to_string()));
    }

    let mut result = Ok(());
    index.for_each(|inum, inode| {
        if result.is_err() {
            return;
        }
        result = codec::encode_index_record(inum, inode)
            .and_then(|record| file.write_all(&record).map_err(Into::into));
    });
    result?;

    file.sync_all()?;
    Ok(())
}

/// `ckpt.<unix_seconds>.<region_id>.ids` → `(unix_seconds, region_id)`
pub(crate) fn parse_checkpoint_file_name(name: &str) -> Option<(i64, i64)> {
    let mut parts = name.split('.');
    if parts.next() != Some("ckpt") {
        return None;
    }
    let seconds: i64 = parts.next()?.parse().ok()?;
    let region_id: i64 = parts.next()?.parse().ok()?;
    if parts.next() != Some(CHECKPOINT_EXTENSION) || parts.next().is_some() {
        return None;
    }
    Some((seconds, region_id))
}

// The newest checkpoint by its embedded unix timestamp, if any.
fn newest_checkpoint(dir: &Path) -> Result<Option<(PathBuf, i64)>> {
    let mut newest: Option<(i64, PathBuf, i64)> = None;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((seconds, region_id)) = parse_checkpoint_file_name(&name) {
            if newest.as_ref().map_or(true, |(s, _, _)| seconds > *s) {
                newest = Some((seconds, entry.path(), region_id));
            }
        }
    }

    Ok(newest.map(|(_, path, region_id)| (path, region_id)))
}
