//! Data plane: delta file format, readers and ingestion.
//!
//! Delta files are immutable, self-framed, seekable streams of records
//! produced elsewhere and picked up from blob storage. This crate parses
//! them (sequentially or with concurrent byte-range shards), abstracts the
//! blob source, and applies records to the serving cache.

pub mod blob;
pub mod framing;
pub mod loader;
pub mod reader;
pub mod records;

pub use blob::{BlobStorageClient, FileBlobClient};
pub use framing::{DeltaFileWriter, SkippedRegion};
pub use loader::{DeltaApplier, ShardMappingSink, UdfCodeSink, DELTA_FILE_PREFIX};
pub use reader::{
    ConcurrentDeltaReader, ConcurrentReadOptions, DeltaFileReader, DeltaStream, StreamFactory,
};
pub use records::{
    DeltaFileMetadata, DeltaRecord, KvMutation, MutationOp, MutationValue, ShardMappingRecord,
    UdfConfigRecord,
};

/// Errors from the data plane.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("delta I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("delta serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("invalid delta file: {0}")]
    InvalidFormat(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl From<DataError> for silo_common::Error {
    fn from(err: DataError) -> Self {
        match err {
            DataError::Io(e) => silo_common::Error::Unavailable(e.to_string()),
            DataError::Serde(e) => silo_common::Error::InvalidArgument(e.to_string()),
            DataError::InvalidFormat(m) => silo_common::Error::InvalidArgument(m),
            DataError::NotFound(m) => silo_common::Error::NotFound(m),
            DataError::Internal(m) => silo_common::Error::Internal(m),
        }
    }
}
