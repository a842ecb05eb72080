//! Core error types.

use thiserror::Error;

/// Errors surfaced by the k2mm dataflow core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("test frame generator busy")]
    TesterBusy,

    #[error("bus bridge busy: {reason}")]
    BridgeBusy { reason: &'static str },

    #[error("record bridge unavailable with {beat_bits}-bit beats")]
    BridgeUnavailable { beat_bits: usize },

    #[error("operation not available in {mode} mode")]
    WrongMode { mode: &'static str },

    #[error("protocol error: {0}")]
    Protocol(#[from] k2mm_protocol::ProtocolError),
}

impl CoreError {
    /// Returns whether the call may succeed if repeated once the core has made
    /// progress.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::TesterBusy | CoreError::BridgeBusy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k2mm_protocol::ProtocolError;

    #[test]
    fn test_retryable() {
        assert!(CoreError::TesterBusy.is_retryable());
        assert!(CoreError::BridgeBusy {
            reason: "access pending"
        }
        .is_retryable());

        assert!(!CoreError::WrongMode { mode: "master" }.is_retryable());
        assert!(!CoreError::InvalidConfig {
            reason: "bad".to_string()
        }
        .is_retryable());
        assert!(!CoreError::from(ProtocolError::BurstTooLarge {
            count: 256,
            max: 255
        })
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidConfig {
            reason: "beat width 12".to_string(),
        };
        assert!(err.to_string().contains("beat width 12"));

        let err = CoreError::from(ProtocolError::MagicMismatch(0x1234));
        assert!(err.to_string().contains("0x1234"));
    }
}
