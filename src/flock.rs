use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const LOCK_FILE_NAME: &str = "kilndb.lock";

/// Single-process guard over a store directory.
///
/// A `kilndb.lock` file inside the directory carries an exclusive
/// advisory lock plus the holder's process id. A second process opening
/// the same store fails with [`Error::Locked`] naming that pid. The
/// lock is released when the guard drops; the file itself is left
/// behind to avoid unlink races.
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Lock `dir` for this process, failing fast when another process
    /// already holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);

        // Open without truncating: until the lock is ours, the file
        // contents belong to whichever process holds it.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Io(format!("open lock file {}: {e}", path.display())))?;

        if !try_exclusive(&file) {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.trim();
            return Err(Error::Locked(format!(
                "store directory {} is held by process {}",
                dir.display(),
                if holder.is_empty() { "unknown" } else { holder },
            )));
        }

        // The lock is ours: stamp our pid over any stale one.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::debug!(
            lock = %path.display(),
            pid = std::process::id(),
            "Acquired store directory lock"
        );

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_exclusive(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    result == 0
}

#[cfg(not(unix))]
fn try_exclusive(_file: &File) -> bool {
    // No advisory locking on this platform; operators must ensure a
    // single process per store directory.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_stamps_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let lock = DirLock::acquire(dir.path()).expect("Failed to acquire lock");
        assert_eq!(lock.path(), dir.path().join(LOCK_FILE_NAME));

        let content = std::fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_stale_lock_file_is_reclaimed() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        // A leftover file from a dead process holds no advisory lock.
        std::fs::write(dir.path().join(LOCK_FILE_NAME), "424242\n").expect("write stale file");

        let lock = DirLock::acquire(dir.path()).expect("Failed to reclaim stale lock");
        let content = std::fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_second_acquire_names_the_holder() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let _held = DirLock::acquire(dir.path()).expect("Failed to acquire lock");

        match DirLock::acquire(dir.path()) {
            Err(Error::Locked(msg)) => {
                assert!(msg.contains(&std::process::id().to_string()), "got: {msg}");
            }
            Err(other) => panic!("expected Locked error, got {other:?}"),
            Ok(_) => panic!("second acquire must not succeed"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        {
            let _lock = DirLock::acquire(dir.path()).expect("Failed to acquire lock");
        }

        // The previous holder is gone, so acquiring again must succeed.
        let _again = DirLock::acquire(dir.path()).expect("Failed to reacquire lock after drop");
    }
}
