//! Custom error types for the application.
//!
//! This module defines the primary error type, `MasError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that come up when
//! talking to a MAS controller:
//!
//! - **`Config`**: malformed or missing configuration input (command table,
//!   symbols file, plot ranges). Fatal at startup.
//! - **`Protocol`**: a command that the command table rejects (unknown code or
//!   wrong argument count) or a reply whose shape does not match the command.
//!   Caught before anything reaches the wire, recoverable by the caller.
//! - **`Timeout`**: the controller did not finish a reply within the allowed
//!   window. Retried in place for a bounded period before escalating.
//! - **`Connection`**: socket-level failure (refused, reset, closed).
//!   Escalates straight to the reconnect handshake.
//! - **`Persistence`**: the history log directory was not writable when the
//!   buffer was created. Disables saving rather than crashing.
//! - **`Io`**: wrapped `std::io::Error` from file operations, via `#[from]`
//!   so the `?` operator works throughout.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type MasResult<T> = std::result::Result<T, MasError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum MasError {
    /// Malformed or missing configuration input.
    #[error("configuration error: {0}")]
    Config(String),

    /// Command rejected before send, or a reply with an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The controller did not complete a reply in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Socket-level connection failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// History persistence unavailable (log directory missing or read-only).
    #[error("persistence error: {0}")]
    Persistence(String),

    /// I/O error from file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: MasError = io.into();
        assert!(matches!(err, MasError::Io(_)));
    }

    #[test]
    fn display_includes_cause_text() {
        let err = MasError::Timeout("controller took too long to respond".into());
        assert_eq!(err.to_string(), "timeout: controller took too long to respond");
    }
}
