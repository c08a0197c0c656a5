//! Error taxonomy for the chunked engine.
//!
//! Every failure the engine can produce is a variant of [`Error`], so callers
//! can match on the kind instead of parsing messages. Failures from user map
//! functions arrive as `anyhow` errors and are carried in [`Error::Map`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all engine operations.
///
/// Lazy verbs only append to a handle's operation log, so most data errors
/// (a filter naming a column that does not exist, a malformed chunk file)
/// surface when the log is finally replayed at `collect`/`write` time, not at
/// the verb that logically caused them. The engine never retries on its own.
#[derive(Error, Debug)]
pub enum Error {
    /// A referenced chunk file is absent.
    ///
    /// Recoverable for single-chunk lookups ([`ChunkFrame::chunk`] maps it to
    /// `Ok(None)`); fatal for executor-wide operations.
    ///
    /// [`ChunkFrame::chunk`]: crate::ChunkFrame::chunk
    #[error("chunk not found: {path}")]
    ChunkNotFound { path: PathBuf },

    /// An operation referenced a column that does not exist in the chunk it
    /// was replayed against.
    #[error("column {column:?} not found (in {op})")]
    Schema { op: String, column: String },

    /// A write target directory is non-empty and overwrite was not requested.
    /// Raised before any file is touched.
    #[error("destination {dir} is not empty (pass overwrite to replace it)")]
    DestinationExists { dir: PathBuf },

    /// A disallowed join was requested.
    #[error("unsupported join: {0}")]
    UnsupportedJoin(String),

    /// A worker task failed; carries the failing chunk's identifier.
    #[error("chunk {chunk}: {source}")]
    Task {
        chunk: String,
        #[source]
        source: Box<Error>,
    },

    /// A hard repartition failed. The original chunk set is left intact.
    #[error("repartition failed (original chunk set left intact): {source}")]
    Repartition {
        #[source]
        source: Box<Error>,
    },

    /// A chunk file exists but does not parse as one.
    #[error("invalid chunk file {path}: {reason}")]
    InvalidChunk { path: PathBuf, reason: &'static str },

    /// A table construction or row-bind violated the schema invariants
    /// (duplicate column names, unequal column lengths, mismatched schemas).
    #[error("malformed table: {0}")]
    MalformedTable(String),

    /// Worker pool construction failed.
    #[error("worker pool: {0}")]
    Pool(String),

    /// A user-supplied per-chunk map function failed.
    #[error("map function failed: {0}")]
    Map(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Chunk codec (de)serialization failure.
    #[error("chunk codec: {0}")]
    Codec(#[from] postcard::Error),

    #[cfg(feature = "ingest-csv")]
    #[error("CSV ingest: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub(crate) fn schema(op: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Schema {
            op: op.into(),
            column: column.into(),
        }
    }
}
