use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::FormatError;

/// Result type of the dataset operations.
pub type Result<T> = std::result::Result<T, OrlFacesError>;

/// Error type for [OrlFacesDataset](crate::dataset::OrlFacesDataset) and its builder.
#[derive(Error, Debug)]
pub enum OrlFacesError {
    /// A raster file could not be decoded.
    #[error("invalid raster file `{path}`: {source}")]
    Format {
        /// Offending file.
        path: PathBuf,
        /// Decoding failure.
        #[source]
        source: FormatError,
    },

    /// The raw data folder does not have the expected layout.
    #[error("invalid dataset structure: {0}")]
    Structure(String),

    /// The partition cache is absent and building was not requested.
    #[error("dataset not found in `{0}`, you can use download=true to build it")]
    NotFound(PathBuf),

    /// Another build holds the lock of the processed folder.
    #[error("`{0}` is held by another build, remove it if no build is running")]
    BuildLocked(PathBuf),

    /// Out-of-range sample index.
    #[error("index {index} is out of range for a partition of {len} samples")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of samples in the partition.
        len: usize,
    },

    /// Unknown partition name.
    #[error("data partition `{0}` not recognised, accepted values are 'train' and 'test'")]
    InvalidPartition(String),

    /// Archive content does not match the expected digest.
    #[error("checksum mismatch for `{path}`: expected {expected}, found {actual}")]
    ChecksumMismatch {
        /// Archive path.
        path: PathBuf,
        /// Expected MD5 digest.
        expected: String,
        /// Computed MD5 digest.
        actual: String,
    },

    /// A model record could not be written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// I/O operation error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}
