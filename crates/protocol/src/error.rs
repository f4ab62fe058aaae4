//! Protocol error types

use thiserror::Error;

/// Errors decoding USB descriptors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// bDescriptorType does not match the descriptor being parsed
    #[error("Unexpected descriptor type {actual:#04x} (expected {expected:#04x})")]
    UnexpectedDescriptorType { expected: u8, actual: u8 },

    /// bLength is shorter than the descriptor's fixed layout
    #[error("Invalid descriptor length: {length}")]
    InvalidLength { length: u8 },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnexpectedDescriptorType {
            expected: 0x01,
            actual: 0x02,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Unexpected descriptor type"));
        assert!(msg.contains("0x02"));
        assert!(msg.contains("0x01"));
    }

    #[test]
    fn test_buffer_too_small_error() {
        let err = ProtocolError::BufferTooSmall {
            needed: 18,
            available: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("needed 18, got 4"));
    }
}
