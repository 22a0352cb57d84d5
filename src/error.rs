//! Error taxonomy for terrain generation.
//!
//! Only run-aborting conditions are errors. Per-material problems are caught at
//! the compositor boundary and recorded as warnings; parameter advisories are
//! `ValidationWarning`s and never surface here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerrainError {
    #[error("Heightmap source missing or unreadable: {0}")]
    MissingHeightmap(String),

    #[error("No valid materials to generate")]
    NoValidMaterials,

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Dimension mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    DimensionMismatch {
        expected_width: usize,
        expected_height: usize,
        width: usize,
        height: usize,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Generation cancelled during {0}")]
    Cancelled(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TerrainError {
    pub fn projection<T: ToString>(msg: T) -> Self {
        TerrainError::Projection(msg.to_string())
    }

    pub fn geometry<T: ToString>(msg: T) -> Self {
        TerrainError::InvalidGeometry(msg.to_string())
    }

    pub fn parameter<T: ToString>(msg: T) -> Self {
        TerrainError::InvalidParameter(msg.to_string())
    }
}

/// Result type alias for terrain operations
pub type Result<T> = std::result::Result<T, TerrainError>;
