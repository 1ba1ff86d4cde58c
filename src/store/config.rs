use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default size at which the store file is rewritten from a fresh base
/// frame (16 MB).
const DEFAULT_ROLLOVER_SIZE: u64 = 16 * 1024 * 1024;

/// Where and how often a [`DurableOrderStore`](super::DurableOrderStore)
/// persists itself.
///
/// # Examples
///
/// ```
/// use order_runtime::store::StoreConfig;
/// use std::time::Duration;
///
/// let config = StoreConfig::new("/var/lib/engine", "orders")
///     .with_snapshot_rollover_size(1 << 20)
///     .with_snapshot_interval(Duration::from_millis(250))
///     .with_auto_snapshot(true);
/// assert!(config.file_path().ends_with("orders.store"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the store file. Created on open.
    pub directory: PathBuf,

    /// Store name; the file is `<directory>/<name>.store`.
    pub name: String,

    /// Once appending the next frame would grow the file past this many
    /// bytes, the file is replaced by a single fresh frame.
    pub snapshot_rollover_size: u64,

    /// Minimum time between two snapshots scheduled by `try_snapshot`.
    pub snapshot_interval: Duration,

    /// Schedule a `try_snapshot` after every mutation.
    pub auto_snapshot: bool,
}

impl StoreConfig {
    /// Config for `<directory>/<name>.store` with default tuning.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the rollover threshold in bytes.
    #[must_use]
    pub fn with_snapshot_rollover_size(mut self, bytes: u64) -> Self {
        self.snapshot_rollover_size = bytes;
        self
    }

    /// Sets the minimum interval between best-effort snapshots.
    #[must_use]
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Enables or disables snapshotting after every mutation.
    #[must_use]
    pub fn with_auto_snapshot(mut self, enabled: bool) -> Self {
        self.auto_snapshot = enabled;
        self
    }

    /// Path of the store file.
    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        self.directory.join(format!("{}.store", self.name))
    }

    /// Path used while a rollover rewrites the file.
    pub(crate) fn rollover_path(&self) -> PathBuf {
        self.directory.join(format!("{}.store.tmp", self.name))
    }

    /// The configured directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            name: "orders".to_string(),
            snapshot_rollover_size: DEFAULT_ROLLOVER_SIZE,
            snapshot_interval: Duration::from_secs(1),
            auto_snapshot: false,
        }
    }
}
