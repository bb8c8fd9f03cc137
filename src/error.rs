/// Unified error handling for the puente proxy
///
/// Configuration and listener-setup errors are fatal at startup; metadata
/// errors are contained to the next cache refresh; anything caused by a
/// single client stays inside that client's worker.
use std::io;

use thiserror::Error;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum PuenteError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors (fatal at startup, exit code 1)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Metadata cache errors (the previous snapshot is retained)
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Keyring errors (fatal to the requesting operation only)
    #[error("Keyring error: {0}")]
    Keyring(#[from] KeyringError),

    /// Routing errors
    #[error("Routing error: {message}")]
    Routing { message: String },
}

impl PuenteError {
    pub fn routing<S: Into<String>>(message: S) -> Self {
        PuenteError::Routing {
            message: message.into(),
        }
    }

    /// Whether the process should exit with a configuration failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PuenteError::Config(_))
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("{0}")]
    ValidationError(String),
}

/// Errors reported by the metadata fetch path
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("{0}")]
    Fetch(String),

    #[error("Unexpected number of fields in the resultset. Expected = {expected}, got = {got}")]
    UnexpectedRowArity { expected: usize, got: usize },

    #[error("Failed connecting with any of the bootstrap servers")]
    NoBootstrapServer,
}

impl MetadataError {
    pub fn fetch<S: Into<String>>(message: S) -> Self {
        MetadataError::Fetch(message.into())
    }
}

/// Keyring and master-key file errors
#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("Invalid master key file {0}")]
    InvalidMasterKeyFile(String),

    #[error("Decryption failed")]
    DecryptionError,

    #[error("Keyring IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for proxy operations
pub type PuenteResult<T> = Result<T, PuenteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PuenteError::routing("no upstream");
        assert_eq!(err.to_string(), "Routing error: no upstream");

        let err = MetadataError::UnexpectedRowArity {
            expected: 8,
            got: 5,
        };
        assert_eq!(
            err.to_string(),
            "Unexpected number of fields in the resultset. Expected = 8, got = 5"
        );
    }

    #[test]
    fn test_config_error_is_fatal() {
        let err = PuenteError::Config(ConfigError::ValidationError("bad".to_string()));
        assert!(err.is_fatal());

        let err = PuenteError::routing("transient");
        assert!(!err.is_fatal());
    }
}
