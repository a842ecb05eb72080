//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] k2mm_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] k2mm_core::CoreError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            ServerError::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let err = ServerError::from(k2mm_core::CoreError::TesterBusy);
        assert!(err.is_retryable());

        let err = ServerError::from(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(err.is_retryable());

        let err = ServerError::DatagramTooLarge {
            size: 10_000,
            max: 9000,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("10000"));
    }
}
