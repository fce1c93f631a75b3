//! Error types shared by the pretraining and transfer-learning crates.

use thiserror::Error;

/// Main error type for model construction, freezing and weight loading.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unsupported or inconsistent configuration (backbone depth, optimizer kind, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor shape does not fit the layer it is fed to
    #[error("Shape error: {0}")]
    Shape(String),

    /// Pretrained weights could not be found or decoded
    #[error("Weights error: {0}")]
    Weights(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidConfig`].
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Shorthand for an [`Error::Shape`].
    pub fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

impl From<burn::record::RecorderError> for Error {
    fn from(err: burn::record::RecorderError) -> Self {
        Error::Serialization(format!("{err:?}"))
    }
}

/// Specialized Result type for pretraining operations.
pub type Result<T> = std::result::Result<T, Error>;
