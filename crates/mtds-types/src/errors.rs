//! Error types for MTDS

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for MTDS operations
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum MtdsError {
    /// Configuration errors (unsupported backend, missing path)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Allocator pool or backend budget exhausted
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// A put for the same key is already in flight
    #[error("Already exists: {message}")]
    AlreadyExists { message: String },

    /// Key or file not found
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    IO { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Invalid format errors (metadata header, file names)
    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    /// Invalid parameters
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Control-plane protocol errors (unknown tag, malformed payload)
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Transport errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Caller-imposed wait expired
    #[error("Operation timed out: {message}")]
    Timeout { message: String },

    /// Task dropped before it produced a result
    #[error("Operation cancelled: {message}")]
    Cancelled { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MtdsError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Create an already exists error
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an invalid format error
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Backpressure and transport hiccups may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. }
                | Self::AlreadyExists { .. }
                | Self::Network { .. }
                | Self::Timeout { .. }
        )
    }

    /// Errors that must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

/// Conversion from std::io::Error
impl From<std::io::Error> for MtdsError {
    fn from(err: std::io::Error) -> Self {
        Self::io(format!("{}", err))
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for MtdsError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("{}", err))
    }
}

impl From<serde_yaml::Error> for MtdsError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::config(format!("Failed to parse YAML config: {}", err))
    }
}

impl From<toml::de::Error> for MtdsError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("Failed to parse TOML config: {}", err))
    }
}
