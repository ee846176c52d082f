// src/error.rs
//! Error types for the GPS bridge

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GpsError>;

/// Crate-level error
#[derive(Debug, Error)]
pub enum GpsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Failure of the serial transport to attach or reconfigure a device.
///
/// Attach failures are never fatal: the session retries them with a fixed
/// backoff until it is cancelled.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("device {0} not found")]
    NotFound(String),
    #[error("unsupported line setting: {0}")]
    Unsupported(String),
    #[error("device is not attached")]
    NotAttached,
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_error_converts() {
        let err: GpsError = ControllerError::NotFound("/dev/ttyUSB0".to_string()).into();
        assert!(matches!(err, GpsError::Controller(ControllerError::NotFound(_))));
        assert_eq!(
            err.to_string(),
            "Controller error: device /dev/ttyUSB0 not found"
        );
    }
}
