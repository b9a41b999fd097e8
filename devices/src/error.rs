//! Device error types

use std::time::Duration;

/// Error returned by any device capability call
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The device did not complete the request in time
    #[error("Timeout: {operation} did not complete within {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Transport-level failure (serial link dropped, HTTP error, ...)
    #[error("Communication error: {device} - {message}")]
    Communication {
        device: String,
        message: String,
    },

    /// Error reported by the driver itself
    #[error("Driver error: {0}")]
    Driver(String),
}

impl DeviceError {
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported(what.into())
    }

    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver(message.into())
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Check if this error is a missing capability rather than a failure
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_operation() {
        let err = DeviceError::timeout("dome shutter open", Duration::from_secs(30));
        assert!(err.to_string().contains("dome shutter open"));
        assert!(!err.is_not_supported());
    }

    #[test]
    fn test_not_supported_is_classified() {
        assert!(DeviceError::not_supported("SlewToAltAz").is_not_supported());
    }
}
