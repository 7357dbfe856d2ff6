//! Error types for fclink.

use std::io;
use thiserror::Error;

/// Result type for fclink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for fclink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Link is not open, or closed mid-operation.
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    /// No (or incomplete) response within the time budget.
    #[error("Timeout: {0}")]
    ProtocolTimeout(String),

    /// Device answered INVALID/FAILED/NACK.
    #[error("Device rejected command: {0}")]
    ProtocolRejected(String),

    /// Pre-flight validation failed (board id mismatch, image too large,
    /// unsupported bootloader revision). Never retried.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Flash CRC mismatch after programming. Distinct from a hard failure:
    /// the image was written but could not be verified.
    #[error("Verification failed: expected CRC {expected:#010x}, device reported {actual:#010x}")]
    VerificationMismatch {
        /// CRC computed over the firmware plus erased-flash padding.
        expected: u32,
        /// CRC reported by the bootloader.
        actual: u32,
    },

    /// Invalid firmware artifact (bad APJ JSON, base64 or compression).
    #[error("Malformed firmware: {0}")]
    MalformedFirmware(String),

    /// Operation cancelled (user abort, or pending requests cancelled when
    /// entering CLI mode).
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Capability not present on this device/firmware.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Whether this error means the firmware was written but not verified.
    pub fn is_verification_mismatch(&self) -> bool {
        matches!(self, Self::VerificationMismatch { .. })
    }

    /// Whether this error was a cooperative cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}
