//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(#[from] protocol::UsbError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] protocol::ProtocolError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_error_conversion() {
        let err: Error = protocol::UsbError::NotFound.into();
        assert!(matches!(err, Error::Usb(protocol::UsbError::NotFound)));
        assert_eq!(err.to_string(), "USB error: not found");
    }

    #[test]
    fn test_config_error_display() {
        let err = Error::Config("bad filter".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad filter");
    }
}
