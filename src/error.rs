//! Error types for the container engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, UmdfError>;

#[derive(Error, Debug)]
pub enum UmdfError {
    #[error("Invalid file format: {0}")]
    Format(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Schema resolution error: {0}")]
    Resolution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Graph error: {0}")]
    Graph(String),
}

impl UmdfError {
    /// Stable error-kind code, independent of the message text.
    pub fn code(&self) -> &'static str {
        match self {
            UmdfError::Format(_) => "FORMAT",
            UmdfError::Schema(_) => "SCHEMA",
            UmdfError::Resolution(_) => "RESOLUTION",
            UmdfError::Io(_) => "IO",
            UmdfError::Json(_) => "JSON",
            UmdfError::Crypto(_) => "CRYPTO",
            UmdfError::State(_) => "STATE",
            UmdfError::Graph(_) => "GRAPH",
        }
    }
}
