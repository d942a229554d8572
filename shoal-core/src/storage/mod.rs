//! Storage layer for torrent data.
//!
//! Persists received blocks straight into the torrent's output files at
//! their absolute offsets. There is no intermediate piece cache.

pub mod file_set;

pub use file_set::{FileLayout, FileSet, FileSpan, Segment};

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Range does not fit inside the torrent
    #[error("Range {offset}+{length} exceeds torrent size {total}")]
    OutOfBounds {
        offset: u64,
        length: usize,
        total: u64,
    },

    /// Torrent metadata lists no files to write
    #[error("Torrent has no files")]
    NoFiles,

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
