//! Error types for the serial transport stack.
//!
//! The error taxonomy distinguishes conditions the caller must react to
//! differently:
//!
//! - **Configuration**: bad factory input, surfaced immediately, never retried.
//! - **Io**: the underlying serial device failed; surfaced to callers as a
//!   device-level communication error.
//! - **InvalidFrame**: the caller handed a frame the operation cannot accept
//!   (oversized data, wrong encapsulation) — a programming error.
//! - **InvalidOperation**: the operation was attempted on a closing or closed
//!   transceiver; the caller must stop using it.
//! - **Cancelled**: the caller's cancellation token fired. Distinct from
//!   timeout and close so intent is distinguishable from environment.
//! - **Timeout**: a master query expired before an answer arrived.
//! - **Frame**: a malformed or checksum-bad raw frame. These are *not*
//!   surfaced from `query`/`poll` — corrupted traffic is expected on a shared
//!   bus, so the transceivers count such frames and drop them. The variant
//!   exists for the internal decode paths and for direct codec users.

use thiserror::Error;

/// Result type alias for all operations in this crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the serial transport stack.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O failure on the underlying serial device.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Invalid factory or transport configuration.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A frame that cannot be constructed or transmitted as requested.
    #[error("Invalid frame: {message}")]
    InvalidFrame { message: String },

    /// Operation attempted on a closing or closed transceiver.
    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    /// The supplied cancellation token fired before the operation finished.
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// A master query timed out waiting for the matching answer.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed raw frame (bad checksum, short frame, framing violation).
    ///
    /// Counted and dropped inside the transceivers; only direct users of the
    /// codec functions ever observe this variant.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Internal invariant violation. Should not occur in normal operation.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new configuration error.
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a new invalid-frame error.
    pub fn invalid_frame<S: Into<String>>(message: S) -> Self {
        Self::InvalidFrame { message: message.into() }
    }

    /// Create a new invalid-operation error.
    pub fn invalid_operation<S: Into<String>>(message: S) -> Self {
        Self::InvalidOperation { message: message.into() }
    }

    /// Create a new cancellation error.
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new frame error.
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check whether this error came from the caller's cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check whether this error is a line-level communication error.
    ///
    /// Communication errors are expected on a shared serial bus and are
    /// normally counted rather than propagated.
    pub fn is_communication_error(&self) -> bool {
        matches!(self, Self::Frame { .. })
    }

    /// Check whether the transceiver can still be used after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. } | Self::Timeout { .. } | Self::Frame { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::cancelled("query");
        assert!(err.is_cancelled());
        assert!(err.is_recoverable());

        let err = ModbusError::frame("CRC mismatch");
        assert!(err.is_communication_error());
        assert!(!err.is_cancelled());

        let err = ModbusError::invalid_operation("transceiver closed");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::timeout("query unit 1", 500);
        let msg = format!("{err}");
        assert!(msg.contains("500ms"));
        assert!(msg.contains("query unit 1"));
    }
}
