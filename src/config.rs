use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

const GIB: i64 = 1 << 30;

/// Configuration for a KilnDB store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding region files, snapshots and checkpoints
    pub dir: PathBuf,

    /// Permission mode applied to the directory and its files (default: 0o755)
    pub dir_mode: u32,

    /// Size threshold of a single region file in GiB, 1-255 (default: 1)
    pub threshold_gb: u8,

    /// Enable Snappy compression of value payloads (default: false)
    pub compression: bool,

    /// AES key enabling value encryption; must be 16, 24 or 32 bytes
    pub encryption_key: Option<Vec<u8>>,

    /// How often the expiry sweeper walks the index (default: 120s)
    pub expiry_interval: Duration,

    // Byte-denominated threshold override so tests can roll regions
    // without writing gigabytes.
    pub(crate) threshold_bytes: Option<i64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./kilndb"),
            dir_mode: 0o755,
            threshold_gb: 1,
            compression: false,
            encryption_key: None,
            expiry_interval: Duration::from_secs(120),
            threshold_bytes: None,
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the directory permission mode
    pub fn dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    /// Set the region rollover threshold in GiB (1-255)
    pub fn threshold_gb(mut self, gb: u8) -> Self {
        self.threshold_gb = gb;
        self
    }

    /// Enable or disable Snappy compression of value payloads
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Enable AES-CBC encryption of value payloads with the given key
    pub fn encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    /// Set the expiry sweep interval
    pub fn expiry_interval(mut self, interval: Duration) -> Self {
        self.expiry_interval = interval;
        self
    }

    #[cfg(test)]
    pub(crate) fn threshold_bytes(mut self, bytes: i64) -> Self {
        self.threshold_bytes = Some(bytes);
        self
    }

    /// The rollover threshold in bytes.
    pub(crate) fn threshold(&self) -> i64 {
        match self.threshold_bytes {
            Some(bytes) => bytes,
            None => i64::from(self.threshold_gb) * GIB,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.threshold_bytes.is_none() && self.threshold_gb == 0 {
            return Err(Error::Config(
                "region threshold must be between 1 and 255 GiB".to_string(),
            ));
        }
        if let Some(key) = &self.encryption_key {
            if !matches!(key.len(), 16 | 24 | 32) {
                return Err(Error::Config(format!(
                    "AES key must be 16, 24 or 32 bytes, got {}",
                    key.len()
                )));
            }
        }
        Ok(())
    }
}
