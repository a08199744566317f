//! Error type for dataset storage operations

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a storage operation.
///
/// Every variant except `Io`/`Json` is a contract violation and is never
/// retried by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Attempt to (re)create a dataset whose DefFile is already on disk.
    #[error("dataset {0} already exists (delete it first)")]
    AlreadyExists(String),

    /// Read or delete of a dataset that has not been created.
    #[error("dataset {0} does not exist")]
    DoesNotExist(String),

    /// In-memory descriptor disagrees with the DefFile on disk.
    #[error("dataset {dataset}: {field} is {found:?} on disk, expected {expected:?}")]
    DefMismatch {
        dataset: String,
        field: &'static str,
        expected: String,
        found: String,
    },

    /// A stored digest does not match the recomputed one.
    #[error("dataset {dataset}: checksum mismatch in {file} (expected {expected}, actual {actual})")]
    ChecksumMismatch {
        dataset: String,
        file: String,
        expected: String,
        actual: String,
    },

    /// Record of the wrong type handed to a chunk or dataset.
    #[error("type mismatch: expected {expected} records, got {found}")]
    TypeMismatch { expected: String, found: String },

    /// Record appended to a shard its identity does not hash to.
    #[error("record {identity} belongs in shard {expected}, not {shard}")]
    ShardRouting {
        identity: String,
        expected: String,
        shard: String,
    },

    #[error("invalid chunk count {0} (expected 16, 256 or 4096)")]
    InvalidChunkCount(u32),

    /// A stored line could not be turned back into a record.
    #[error("{path}: cannot decode record: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Glob(#[from] glob::PatternError),
}
