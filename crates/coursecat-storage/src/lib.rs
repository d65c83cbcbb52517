//! Durable per-partition CSV storage: codec, atomic writes and the directory lock.

use std::path::PathBuf;
use std::time::Duration;

use coursecat_core::EntityKind;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod atomic;
pub mod lock;
pub mod store;
pub mod table;

pub use atomic::write_atomic;
pub use lock::{DirLock, LOCK_FILE_NAME};
pub use store::{EntityFlush, FlushReport, PartitionStore, DEFAULT_LOCK_TIMEOUT};
pub use table::{encode_rows, parse_table, Table};

pub const CRATE_NAME: &str = "coursecat-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed dataset {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("timed out after {waited:?} waiting for lock on {}", dir.display())]
    LockTimeout { dir: PathBuf, waited: Duration },
    #[error("encoding {entity} rows: {source}")]
    Encode {
        entity: EntityKind,
        #[source]
        source: csv::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Transient failures are worth retrying on the next flush trigger.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Malformed { .. })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn malformed_is_not_transient() {
        assert!(!StoreError::malformed("x.csv", "ragged row").is_transient());
        let timeout = StoreError::LockTimeout {
            dir: PathBuf::from("Data"),
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());
        assert!(timeout.to_string().contains("Data"));
    }
}
