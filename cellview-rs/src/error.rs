//! Error types, one enum per subsystem.
//!
//! Per-image failures (`ImageError`) are collected into the run summary;
//! only `RunError` aborts a run.

use crate::model::ImageId;

/// Failures of the remote image source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// Network, auth or timeout failure. Retryable.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The plate, well, image or channel does not exist. Definitive.
    #[error("not found: {0}")]
    NotFound(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SegmentationError {
    #[error("segmentation failed for image {image_id}: {cause}")]
    Failed { image_id: ImageId, cause: String },

    /// The configured model could not be loaded.
    #[error("segmentation model unavailable: {0}")]
    ModelUnavailable(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeatureError {
    #[error("channel {channel} has shape {actual:?}, mask has shape {expected:?}")]
    ShapeMismatch {
        channel: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("intensity channel {0} was not provided")]
    MissingChannel(String),

    #[error("unknown feature: {0}")]
    UnknownFeature(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {message}")]
    Sqlite { message: String },

    #[error("migration v{version} failed: {message}")]
    MigrationFailed { version: u32, message: String },

    #[error("image {0} is not registered in the store")]
    UnknownImage(ImageId),

    #[error("invalid feature row: {0}")]
    InvalidRow(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite {
            message: e.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("quality rule references unknown feature column {0}")]
    UnknownFeature(String),

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("segmentation model: {0}")]
    Model(#[from] SegmentationError),
}

#[derive(Debug, thiserror::Error)]
pub enum MaskCacheError {
    #[error("zarr error: {0}")]
    Zarr(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single image did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Segmentation(#[from] SegmentationError),

    #[error("feature extraction failed: {0}")]
    Extraction(#[from] FeatureError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

/// Fatal errors: the run produces no summary.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("cannot enumerate plate: {0}")]
    Source(#[from] SourceError),
}
