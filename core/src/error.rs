use thiserror::Error;

/// Cask error types
#[derive(Error, Debug)]
pub enum CaskError {
    /// A digest, manifest, tag, or instance reference does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A referenced layer digest is absent from the store
    #[error("missing layer: {digest}")]
    MissingLayer { digest: String },

    /// The entity already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The container is already running
    #[error("already running: {0}")]
    AlreadyRunning(String),

    /// Operation not valid for the current container state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Recomputed digest does not match the expected one
    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Removal of an entity that is still referenced
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// A digest string or image name could not be parsed
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CaskError {
    fn from(err: serde_json::Error) -> Self {
        CaskError::Serialization(err.to_string())
    }
}

/// Result type alias for cask operations
pub type Result<T> = std::result::Result<T, CaskError>;
