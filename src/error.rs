//! Error types for the map data cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or mutating map data
#[derive(Error, Debug)]
pub enum Error {
    /// A storage port failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Bounding box with inverted or out-of-range corners
    #[error("Invalid bounding box: {reason}")]
    InvalidBoundingBox { reason: String },

    /// Coordinate outside the representable range
    #[error("Invalid coordinate lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No async runtime available for the persistence queue
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A sequenced task was dropped before it reported back
    #[error("Persistence task for {label} ended without a result")]
    PersistenceClosed { label: &'static str },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fixture or payload (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand used by storage adapters.
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }
}
