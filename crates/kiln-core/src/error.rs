//! Error types for Kiln

use thiserror::Error;

/// The main error type for Kiln operations
#[derive(Debug, Error)]
pub enum KilnError {
    /// Malformed request. Surfaced immediately, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A single backend attempt failed. Triggers fallback.
    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Normalization error: {0}")]
    Normalization(String),

    /// Index entry whose artifact is gone. Treated as a miss.
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Import error: {0}")]
    Import(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {secs:.1}s: {what}")]
    Timeout { what: String, secs: f64 },

    #[error("Value out of range: {field} must be between {min} and {max}, got {value}")]
    ValueOutOfRange {
        field: String,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),
}

impl KilnError {
    /// True for request-shape problems the caller must fix.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            KilnError::Validation(_) | KilnError::ValueOutOfRange { .. }
        )
    }
}

/// Result type alias for Kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        KilnError::TomlParse(err.to_string())
    }
}
