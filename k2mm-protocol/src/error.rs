//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding k2mm wire structures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid magic: expected 0x4f6f, got {0:#06x}")]
    MagicMismatch(u16),

    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("burst too large: {count} entries (max {max})")]
    BurstTooLarge { count: usize, max: usize },

    #[error("unsupported {what} width: {bits} bits")]
    UnsupportedWidth { what: &'static str, bits: usize },
}

impl ProtocolError {
    /// Returns whether the error was caused by malformed input from the wire,
    /// as opposed to a local usage mistake.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::MagicMismatch(_) | ProtocolError::Truncated { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_classification() {
        assert!(ProtocolError::MagicMismatch(0x1234).is_parse_error());
        assert!(ProtocolError::Truncated {
            needed: 8,
            available: 3
        }
        .is_parse_error());

        assert!(!ProtocolError::BurstTooLarge {
            count: 256,
            max: 255
        }
        .is_parse_error());
        assert!(!ProtocolError::UnsupportedWidth {
            what: "beat",
            bits: 12
        }
        .is_parse_error());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::MagicMismatch(0x1234);
        assert!(err.to_string().contains("0x1234"));

        let err = ProtocolError::Truncated {
            needed: 16,
            available: 9,
        };
        let msg = err.to_string();
        assert!(msg.contains("16"));
        assert!(msg.contains('9'));

        let err = ProtocolError::BurstTooLarge {
            count: 300,
            max: 255,
        };
        assert!(err.to_string().contains("300"));

        let err = ProtocolError::UnsupportedWidth {
            what: "address",
            bits: 48,
        };
        let msg = err.to_string();
        assert!(msg.contains("address"));
        assert!(msg.contains("48"));
    }
}
