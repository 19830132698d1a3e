//! Error types shared across the operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error (conflict, unavailable, permission denied, ...)
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Serialization error while building patches or admission responses
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or missing runtime configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A resource spec failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// An object was missing a field the controller cannot work without
    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Whether the error is transient and worth retrying soon.
    ///
    /// API conflicts and connectivity problems resolve themselves; validation
    /// and configuration errors do not until the user changes something.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) => true,
            Error::SerializationError(_) => false,
            Error::ConfigError(_) => false,
            Error::ValidationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
