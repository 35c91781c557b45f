use thiserror::Error;

use crate::config::ConfigError;

/// Common error types for VeilPort
#[derive(Debug, Error)]
pub enum VeilPortError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Service broken: {0}")]
    ServiceBroken(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for VeilPort operations
pub type Result<T> = std::result::Result<T, VeilPortError>;

impl VeilPortError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_keep_message() {
        let err = VeilPortError::validation("bad port range");
        assert_eq!(err.to_string(), "Validation error: bad port range");

        let err = VeilPortError::network("unreachable");
        assert!(matches!(err, VeilPortError::Network(msg) if msg == "unreachable"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: VeilPortError = io.into();
        assert!(matches!(err, VeilPortError::Io(_)));
    }
}
