//! Error types for the durable order store.
//!
//! [`StoreError`] separates lookups that found nothing (`OrderNotFound`,
//! `SerialNotFound`) from I/O and integrity faults, and from the terminal
//! `Closed` state.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur within the order store.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// No order is indexed under the broker order id.
    OrderNotFound {
        /// The id that was looked up.
        broker_order_id: String,
    },

    /// No order is indexed under the logical serial.
    SerialNotFound {
        /// The serial that was looked up.
        logical_serial: i64,
    },

    /// An I/O error occurred while reading or writing the store file.
    Io {
        /// The underlying I/O error message.
        message: String,
        /// The file path involved, if known.
        path: Option<PathBuf>,
    },

    /// A frame failed structural or checksum validation.
    CorruptFrame {
        /// Byte offset of the frame within the store file.
        offset: usize,
        /// Description of the problem.
        message: String,
    },

    /// The store image could not be serialized.
    SerializationError {
        /// The underlying serialization error message.
        message: String,
    },

    /// A frame payload could not be deserialized.
    DeserializationError {
        /// Sequence number of the frame.
        frame_sequence: u64,
        /// The underlying deserialization error message.
        message: String,
    },

    /// The file holds a frame written by a newer format version.
    UnsupportedVersion {
        /// The version found on disk.
        version: u16,
    },

    /// Linking the replacement would create a cycle in a replace chain.
    ReplaceCycle {
        /// Broker id of the order whose replacement was rejected.
        broker_order_id: String,
    },

    /// A persistence operation was issued before `open_file`.
    NotOpen,

    /// The store has been closed.
    Closed,

    /// An internal mutex was poisoned (another thread panicked while
    /// holding the lock).
    MutexPoisoned,
}

impl StoreError {
    /// Returns `true` for the not-found variants.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::OrderNotFound { .. } | Self::SerialNotFound { .. }
        )
    }

    pub(crate) fn io(err: &std::io::Error, path: &std::path::Path) -> Self {
        Self::Io {
            message: err.to_string(),
            path: Some(path.to_path_buf()),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::OrderNotFound { broker_order_id } => {
                write!(f, "order {broker_order_id} not found")
            }
            StoreError::SerialNotFound { logical_serial } => {
                write!(f, "no order for logical serial {logical_serial}")
            }
            StoreError::Io { message, path } => {
                if let Some(p) = path {
                    write!(f, "store I/O error at {}: {message}", p.display())
                } else {
                    write!(f, "store I/O error: {message}")
                }
            }
            StoreError::CorruptFrame { offset, message } => {
                write!(f, "corrupt store frame at offset {offset}: {message}")
            }
            StoreError::SerializationError { message } => {
                write!(f, "store serialization error: {message}")
            }
            StoreError::DeserializationError {
                frame_sequence,
                message,
            } => {
                write!(
                    f,
                    "store deserialization error in frame {frame_sequence}: {message}"
                )
            }
            StoreError::UnsupportedVersion { version } => {
                write!(f, "unsupported store format version {version}")
            }
            StoreError::ReplaceCycle { broker_order_id } => {
                write!(f, "replacing order {broker_order_id} would create a cycle")
            }
            StoreError::NotOpen => write!(f, "store file is not open"),
            StoreError::Closed => write!(f, "store is closed"),
            StoreError::MutexPoisoned => write!(f, "store internal mutex poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    #[cold]
    fn from(err: serde_json::Error) -> Self {
        StoreError::SerializationError {
            message: err.to_string(),
        }
    }
}
