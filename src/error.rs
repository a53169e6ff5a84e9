use thiserror::Error;

use crate::record::Category;
use crate::store::StoreError;

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unknown projection system '{0}'")]
    UnknownProjection(String),

    #[error("projection via '{system}' failed: {message}")]
    Projection { system: String, message: String },

    #[error("invalid coordinate lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },

    #[error("invalid geohash '{0}'")]
    InvalidGeohash(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("conflicting {category} record '{id}' in cell {geohash}")]
    MergeConflict {
        category: Category,
        geohash: String,
        id: String,
    },

    #[error("malformed cluster document '{key}': {source}")]
    MalformedCluster {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode cluster '{key}': {source}")]
    EncodeCluster {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to load source collection: {0}")]
    Source(String),

    #[error("batch {failed_batch} failed after {committed_writes} committed writes: {source}")]
    Batch {
        failed_batch: usize,
        committed_batches: usize,
        committed_writes: usize,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl IndexError {
    /// True for errors caused by bad caller input rather than by configuration or storage.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IndexError::InvalidCoordinate { .. }
                | IndexError::InvalidGeohash(_)
                | IndexError::InvalidQuery(_)
        )
    }
}
