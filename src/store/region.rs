use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::codec::DATA_FILE_MAGIC;
use crate::error::{Error, Result};

const FILE_EXTENSION: &str = "db";

/// The set of open region files plus the single append target.
///
/// Exactly one region is active at a time; appends go to it under the
/// store-wide region lock and the write offset only grows. Once the
/// offset crosses the threshold the active region is synced, sealed and
/// replaced with a freshly numbered file.
pub struct RegionStore {
    dir: PathBuf,
    mode: u32,
    threshold: i64,
    state: RwLock<RegionState>,
}

struct RegionState {
    active_id: i64,
    active: Arc<File>,
    offset: i64,
    regions: HashMap<i64, Arc<File>>,
}

impl RegionStore {
    /// Open every existing region file in `dir`, adopt the
    /// largest-numbered one as active (rolling over immediately if it
    /// already exceeds the threshold), or create region 1 in an empty
    /// directory.
    pub fn open(dir: &Path, mode: u32, threshold: i64) -> Result<Self> {
        let mut regions = HashMap::new();

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(region_id) = parse_region_file_name(&name) {
                let file = OpenOptions::new()
                    .read(true)
                    .append(true)
                    .open(entry.path())?;
                regions.insert(region_id, Arc::new(file));
            }
        }

        let mut state = match regions.keys().max().copied() {
            None => {
                let active = Arc::new(create_region(dir, mode, 1)?);
                regions.insert(1, Arc::clone(&active));
                RegionState {
                    active_id: 1,
                    active,
                    offset: DATA_FILE_MAGIC.len() as i64,
                    regions,
                }
            }
            Some(largest) => {
                let active = Arc::clone(&regions[&largest]);
                let offset = active.metadata()?.len() as i64;
                RegionState {
                    active_id: largest,
                    active,
                    offset,
                    regions,
                }
            }
        };

        // An adopted region already past the threshold is sealed before
        // the store accepts writes.
        if state.offset >= threshold {
            roll_state(dir, mode, &mut state)?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            mode,
            threshold,
            state: RwLock::new(state),
        })
    }

    /// Append a framed record to the active region and return the
    /// `(region_id, position)` it landed at. Rolls the active region
    /// over when the write pushes it past the threshold.
    pub fn append(&self, bytes: &[u8]) -> Result<(i64, i64)> {
        let mut state = self.state.write().unwrap();

        let position = state.offset;
        let region_id = state.active_id;

        let written = (&*state.active).write(bytes)?;
        if written != bytes.len() {
            return Err(Error::Io(format!(
                "partial write: expected {} bytes, wrote {written}",
                bytes.len()
            )));
        }

        state.offset += bytes.len() as i64;
        if state.offset >= self.threshold {
            roll_state(&self.dir, self.mode, &mut state)?;
        }

        Ok((region_id, position))
    }

    /// The open file holding `region_id`, if any.
    pub fn file(&self, region_id: i64) -> Option<Arc<File>> {
        self.state
            .read()
            .unwrap()
            .regions
            .get(&region_id)
            .map(Arc::clone)
    }

    pub fn active_id(&self) -> i64 {
        self.state.read().unwrap().active_id
    }

    pub fn region_count(&self) -> usize {
        self.state.read().unwrap().regions.len()
    }

    /// All region ids in ascending order.
    pub fn region_ids(&self) -> Vec<i64> {
        let state = self.state.read().unwrap();
        let mut ids: Vec<i64> = state.regions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Flush every open region to disk.
    pub fn sync_all(&self) -> Result<()> {
        let state = self.state.read().unwrap();
        for file in state.regions.values() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Close a sealed region and delete its file. Refuses the active
    /// region.
    pub fn remove_region(&self, region_id: i64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if region_id == state.active_id {
            return Err(Error::Io(format!(
                "refusing to remove active region {region_id}"
            )));
        }
        if state.regions.remove(&region_id).is_none() {
            return Err(Error::NotFound(format!("region {region_id} not open")));
        }
        drop(state);

        std::fs::remove_file(self.region_path(region_id))?;
        Ok(())
    }

    pub fn region_path(&self, region_id: i64) -> PathBuf {
        self.dir.join(format_region_file_name(region_id))
    }
}

// Seal the current active region and start the next one. The caller
// holds the state write lock (or exclusive ownership during open).
fn roll_state(dir: &Path, mode: u32, state: &mut RegionState) -> Result<()> {
    state.active.sync_all()?;

    let next_id = state.regions.keys().max().copied().unwrap_or(0) + 1;
    let active = Arc::new(create_region(dir, mode, next_id)?);

    state.regions.insert(next_id, Arc::clone(&active));
    state.active_id = next_id;
    state.active = active;
    state.offset = DATA_FILE_MAGIC.len() as i64;

    tracing::info!(region_id = next_id, "Opened new active region");
    Ok(())
}

// Create a numbered region file and stamp its magic.
fn create_region(dir: &Path, mode: u32, region_id: i64) -> Result<File> {
    let path = dir.join(format_region_file_name(region_id));

    let mut options = OpenOptions::new();
    options.create(true).read(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let file = options.open(path)?;

    let written = (&file).write(&DATA_FILE_MAGIC)?;
    if written != DATA_FILE_MAGIC.len() {
        return Err(Error::Io("partial write of region file magic".to_string()));
    }

    Ok(file)
}

/// `1` → `0000000001.db`
pub fn format_region_file_name(region_id: i64) -> String {
    format!("{region_id:010}.{FILE_EXTENSION}")
}

/// `0000000001.db` → `1`; `None` for anything else, `index.db` included.
pub fn parse_region_file_name(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".db")?;
    if stem.len() != 10 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
