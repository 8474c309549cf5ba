//! Error types for serial bridge operations
//!
//! Covers the physical transport (open/read/write failures), the frame
//! codec (oversized payloads, unknown tags, bad lengths) and the bridge
//! workers themselves (callback failures, closed bridge).

use thiserror::Error;

/// Main error type for serial bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Serial/Transport Errors =====
    /// Serial port not found
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// Serial port open failed
    #[error("Failed to open serial port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Serial read error
    #[error("Serial read error: {0}")]
    ReadError(String),

    /// Serial write error
    #[error("Serial write error: {0}")]
    WriteError(String),

    /// Serial port disconnected or not open
    #[error("Serial port disconnected")]
    Disconnected,

    /// Not enough bytes arrived before the read deadline
    #[error("Read timed out after {duration_ms}ms")]
    ReadTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Framing Errors =====
    /// Outbound payload does not fit in a single frame
    #[error("Payload too large: {size} bytes exceeds frame maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// A 4-byte header did not match any tag known for this direction
    #[error("Unknown frame tag: {tag:02X?}")]
    UnknownTag {
        /// The raw tag bytes
        tag: [u8; 4],
    },

    /// Frame length field is zero or above the frame maximum
    #[error("Invalid frame length: {length}")]
    InvalidLength {
        /// The declared length
        length: usize,
    },

    /// Buffer handed to the decoder is shorter than the frame it describes
    #[error("Truncated frame: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required
        need: usize,
        /// Bytes available
        have: usize,
    },

    // ===== Bridge Errors =====
    /// The inbound callback reported a failure or panicked
    #[error("Inbound callback failed: {0}")]
    CallbackFailure(String),

    /// Bridge has been closed
    #[error("Serial bridge is closed")]
    BridgeClosed,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error is a transport fault the workers recover from by reopening
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::Disconnected
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
                | BridgeError::PortNotFound(_)
                | BridgeError::PortOpenFailed { .. }
                | BridgeError::Io(_)
        )
    }

    /// Check if this error means the byte stream lost frame alignment
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            BridgeError::UnknownTag { .. } | BridgeError::InvalidLength { .. }
        )
    }

    /// Check if this is a read deadline expiring (not a fault)
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::ReadTimeout { .. })
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::PortNotFound(_) => "PORT_NOT_FOUND",
            BridgeError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            BridgeError::ReadError(_) => "SERIAL_IO_ERROR",
            BridgeError::WriteError(_) => "SERIAL_IO_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::ReadTimeout { .. } => "READ_TIMEOUT",
            BridgeError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            BridgeError::UnknownTag { .. } => "FRAME_DESYNC",
            BridgeError::InvalidLength { .. } => "FRAME_DESYNC",
            BridgeError::Truncated { .. } => "TRUNCATED_FRAME",
            BridgeError::CallbackFailure(_) => "CALLBACK_FAILURE",
            BridgeError::BridgeClosed => "BRIDGE_CLOSED",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => BridgeError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                BridgeError::Io(std::io::Error::new(kind, err.description))
            }
            _ => BridgeError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            BridgeError::WriteError("gone".into()).error_code(),
            "SERIAL_IO_ERROR"
        );
        assert_eq!(
            BridgeError::UnknownTag { tag: *b"ABCD" }.error_code(),
            "FRAME_DESYNC"
        );
    }

    #[test]
    fn test_classification() {
        assert!(BridgeError::Disconnected.is_retriable());
        assert!(!BridgeError::ReadTimeout { duration_ms: 200 }.is_retriable());
        assert!(BridgeError::ReadTimeout { duration_ms: 200 }.is_timeout());
        assert!(BridgeError::InvalidLength { length: 0 }.is_desync());
        assert!(!BridgeError::Disconnected.is_desync());
    }

    #[test]
    fn test_payload_too_large_message() {
        let err = BridgeError::PayloadTooLarge {
            size: 60001,
            max: 60000,
        };
        assert!(err.to_string().contains("60001"));
        assert!(err.to_string().contains("60000"));
    }
}
